//! Configuration management
//!
//! Handles the bridge description file (ports, slaves, bonds, mirrors).

mod types;
mod validation;

pub use types::*;
pub use validation::{validate, ValidationResult};

use crate::{Error, Result};
use std::path::Path;

/// Load configuration from a TOML file
pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(Error::Io)?;
    parse(&content)
}

/// Parse configuration from TOML text
pub fn parse(content: &str) -> Result<Config> {
    toml::from_str(content).map_err(|e| Error::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_malformed_toml() {
        let result = parse("[[ports]\nname = ");
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[test]
    fn test_parse_rejects_unknown_bond_mode() {
        let result = parse("[[ports]]\nname = \"bond0\"\nslaves = []\nbond_mode = \"round-robin\"\n");
        assert!(matches!(result, Err(Error::Parse(msg)) if msg.contains("round-robin")));
    }

    #[test]
    fn test_load_missing_file() {
        let result = load("/nonexistent/bridge.toml");
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
