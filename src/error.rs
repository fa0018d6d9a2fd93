use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("port {name} not found")]
    PortNotFound { name: String },

    #[error("port {port} has no slave {slave}")]
    SlaveNotFound { port: String, slave: String },

    #[error("port {name} is not a bond")]
    NotABond { name: String },

    #[error("slave {slave} is disabled")]
    SlaveDisabled { slave: String },

    #[error("slave {slave} already belongs to a port")]
    DuplicateSlave { slave: String },

    #[error("maximum of {max} port mirrors reached")]
    MirrorLimit { max: usize },

    #[error("invalid mirror: {0}")]
    InvalidMirror(String),
}

pub type Result<T> = std::result::Result<T, Error>;
