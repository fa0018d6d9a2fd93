use bridgecore::config;
use bridgecore::dataplane::hooks::{LoggingSender, SysfsCarrier};
use bridgecore::dataplane::{bond_hash, Bridge, Hooks, VLAN_NONE};
use bridgecore::protocol::MacAddr;
use bridgecore::telemetry::{init_logging, MetricsRegistry};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// How often slave link state is polled
const LINK_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How often bonds are checked for a due rebalance
const BALANCE_INTERVAL: Duration = Duration::from_secs(1);
/// How often idle MACs are aged out
const AGING_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "bridgecore")]
#[command(about = "Forwarding core of a software Ethernet switch")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Bond inspection
    Bond {
        #[command(subcommand)]
        action: BondAction,
    },
    /// Run the bridge daemon
    Run {
        /// Path to bridge.toml
        #[arg(short, long, default_value = "bridge.toml")]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate bridge.toml
    Validate {
        /// Path to bridge.toml
        #[arg(short, long, default_value = "bridge.toml")]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum BondAction {
    /// Show the state of a bond as configured
    Show {
        /// Path to bridge.toml
        #[arg(short, long, default_value = "bridge.toml")]
        config: PathBuf,

        /// Bond port name
        bond: String,
    },
    /// Print the hash bucket a MAC maps to under source hashing
    Hash {
        mac: MacAddr,

        /// VLAN ID; untagged if omitted
        #[arg(long)]
        vlan: Option<u16>,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Config {
            action: ConfigAction::Validate { config: path },
        }) => {
            init_logging(None);
            cmd_config_validate(&path)
        }
        Some(Commands::Bond { action }) => {
            init_logging(None);
            match action {
                BondAction::Show { config: path, bond } => cmd_bond_show(&path, &bond),
                BondAction::Hash { mac, vlan } => {
                    println!("{}", bond_hash(mac, vlan.unwrap_or(VLAN_NONE)));
                    Ok(())
                }
            }
        }
        Some(Commands::Run { config: path }) => cmd_run(&path),
        None => cmd_run(Path::new("bridge.toml")),
    };

    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

fn load_validated(path: &Path) -> Result<config::Config, String> {
    let cfg = config::load(path).map_err(|e| format!("Failed to parse config: {}", e))?;

    let validation = config::validate(&cfg);
    validation.print_diagnostics();

    if validation.has_errors() {
        return Err("Validation failed".to_string());
    }
    Ok(cfg)
}

fn cmd_config_validate(path: &Path) -> Result<(), String> {
    println!("[INFO] Validating {}...", path.display());
    load_validated(path)?;
    println!("[INFO] Configuration is valid");
    Ok(())
}

fn cmd_bond_show(path: &Path, bond: &str) -> Result<(), String> {
    let cfg = load_validated(path)?;
    let hooks = Hooks {
        carrier: Box::new(SysfsCarrier::new()),
        ..Default::default()
    };
    let bridge = Bridge::from_config(&cfg, hooks, Arc::new(MetricsRegistry::new()))
        .map_err(|e| e.to_string())?;
    let text = bridge
        .bond_show(bond, Instant::now())
        .map_err(|e| e.to_string())?;
    print!("{}", text);
    Ok(())
}

fn cmd_run(path: &Path) -> Result<(), String> {
    use tokio::signal::unix::{signal, SignalKind};

    let cfg = config::load(path).map_err(|e| format!("Failed to parse config: {}", e))?;
    init_logging(Some(&cfg.logging));
    info!("Loading {}...", path.display());

    let metrics = Arc::new(MetricsRegistry::new());
    let hooks = Hooks {
        carrier: Box::new(SysfsCarrier::new()),
        sender: Box::new(LoggingSender),
        ..Default::default()
    };
    let mut bridge = Bridge::from_config(&cfg, hooks, metrics.clone()).map_err(|e| e.to_string())?;
    for bond in bridge.bond_list() {
        info!(bond = %bond.bond, slaves = ?bond.slaves, "Bond configured");
    }

    // Bridge state lives on this thread only
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("Failed to create runtime: {}", e))?;

    rt.block_on(async move {
        let mut hangup =
            signal(SignalKind::hangup()).map_err(|e| format!("Failed to watch SIGHUP: {}", e))?;
        let mut link_timer = tokio::time::interval(LINK_POLL_INTERVAL);
        let mut balance_timer = tokio::time::interval(BALANCE_INTERVAL);
        let mut aging_timer = tokio::time::interval(AGING_INTERVAL);

        info!(bridge = %bridge.name(), "Bridge started");

        loop {
            tokio::select! {
                _ = link_timer.tick() => bridge.tick_link_health(Instant::now()),
                _ = balance_timer.tick() => bridge.tick_load_balance(Instant::now()),
                _ = aging_timer.tick() => {
                    bridge.expire_macs();
                }
                _ = hangup.recv() => {
                    info!("Reloading {}...", path.display());
                    if let Err(e) = reload(&mut bridge, path) {
                        warn!("Reload failed: {}", e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down");
                    break;
                }
            }
        }

        for (name, value) in metrics.export() {
            info!("{} = {}", name, value);
        }
        Ok::<(), String>(())
    })
}

fn reload(bridge: &mut Bridge, path: &Path) -> Result<(), String> {
    let cfg = config::load(path).map_err(|e| e.to_string())?;
    let validation = config::validate(&cfg);
    for warning in &validation.warnings {
        warn!("{}", warning);
    }
    if validation.has_errors() {
        return Err(validation.errors.join("; "));
    }
    bridge.reconfigure(&cfg).map_err(|e| e.to_string())
}
