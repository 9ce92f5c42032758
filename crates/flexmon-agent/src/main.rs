mod config;
mod mqtt;

use anyhow::Result;
use flexmon_engine::{Command, Engine, EngineConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "/etc/flexmon/flexmon.toml";

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage: flexmon-agent [options] ...");
    eprintln!("  -v|--verbose              verbose output");
    eprintln!("  -h|--help                 this information");
    eprintln!("  -e|--endpoint <endpoint>  bus broker endpoint (host:port)");
    eprintln!("  -r|--rules <path>         rules directory");
    eprintln!("  -c|--config <path>        config file");
}

struct CliArgs {
    verbose: bool,
    endpoint: Option<String>,
    rules: Option<String>,
    config: Option<String>,
}

fn parse_args(args: &[String]) -> Result<Option<CliArgs>> {
    let mut parsed = CliArgs {
        verbose: false,
        endpoint: None,
        rules: None,
        config: None,
    };

    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        let mut take_param = |name: &str| -> Result<String> {
            i += 1;
            args.get(i).cloned().ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("Missing parameter (option: {name})")
            })
        };
        match arg {
            "-h" | "--help" => {
                print_usage();
                return Ok(None);
            }
            "-v" | "--verbose" => parsed.verbose = true,
            "-e" | "--endpoint" => parsed.endpoint = Some(take_param(arg)?),
            "-r" | "--rules" => parsed.rules = Some(take_param(arg)?),
            "-c" | "--config" => parsed.config = Some(take_param(arg)?),
            _ => {
                print_usage();
                anyhow::bail!("Unknown option: {arg}");
            }
        }
        i += 1;
    }
    Ok(Some(parsed))
}

#[cfg(test)]
mod tests {
    use super::parse_args;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn no_arguments() {
        let cli = parse_args(&[]).unwrap().unwrap();
        assert!(!cli.verbose);
        assert!(cli.endpoint.is_none());
        assert!(cli.rules.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn all_flags() {
        let cli = parse_args(&args(&[
            "-v", "-e", "broker:1883", "--rules", "/tmp/rules", "-c", "agent.toml",
        ]))
        .unwrap()
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.endpoint.as_deref(), Some("broker:1883"));
        assert_eq!(cli.rules.as_deref(), Some("/tmp/rules"));
        assert_eq!(cli.config.as_deref(), Some("agent.toml"));
    }

    #[test]
    fn help_short_circuits() {
        assert!(parse_args(&args(&["--help"])).unwrap().is_none());
        assert!(parse_args(&args(&["-h", "-e", "x"])).unwrap().is_none());
    }

    #[test]
    fn bad_usage_is_an_error() {
        assert!(parse_args(&args(&["--nope"])).is_err());
        assert!(parse_args(&args(&["-e"])).is_err());
        assert!(parse_args(&args(&["--rules"])).is_err());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(cli) = parse_args(&args)? else {
        return Ok(());
    };

    // CLI overrides config overrides defaults
    let config_path = cli.config.as_deref().unwrap_or(DEFAULT_CONFIG_FILE);
    let config = match config::AgentConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config file '{config_path}': {e}; using defaults");
            config::AgentConfig::default()
        }
    };

    let verbose = cli.verbose || config.server.verbose;
    let default_level = if verbose {
        "flexmon=debug"
    } else {
        "flexmon=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(default_level.parse()?)
                // per-evaluation audit records bypass the crate filter
                .add_directive("audit=info".parse()?),
        )
        .init();

    let endpoint = cli.endpoint.unwrap_or(config.bus.endpoint);
    let rules_dir = cli.rules.unwrap_or(config.server.rules);

    tracing::info!(
        endpoint = %endpoint,
        rules = %rules_dir,
        polling_secs = config.server.polling_interval_secs,
        "flexmon-agent starting"
    );

    let (events_tx, events_rx) = mpsc::channel(256);
    let (control_tx, control_rx) = mpsc::channel(4);

    let bus = mqtt::MqttBus::connect(&endpoint, &config.bus.client_id, events_tx).await?;

    let engine_cfg = EngineConfig {
        rules_dir: PathBuf::from(&rules_dir),
        shm_dir: config.server.shm_dir.map(PathBuf::from),
        assets_pattern: config.server.assets_pattern,
        metrics_pattern: config.server.metrics_pattern,
        polling_interval: Duration::from_secs(config.server.polling_interval_secs),
        asset_agent: config.bus.asset_agent,
    };
    let mut engine = Engine::new(engine_cfg, Arc::new(bus));
    let loaded = engine.load_rules().await;
    tracing::info!(loaded, "Rules loaded");

    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down gracefully");
            let _ = control_tx.send(Command::Term).await;
        }
    });

    engine.run(events_rx, control_rx).await;

    tracing::info!("flexmon-agent ended");
    Ok(())
}
