//! Command-line front end for the ESP300 driver.
//!
//! ```bash
//! esp300 identify
//! esp300 move 1 10
//! esp300 position 1
//! esp300 --kind bus --address GPIB0::5::INSTR velocity 2 5.0
//! esp300 watch --axes 1,2,3
//! ```
//!
//! Connection settings come from `config/esp300.toml` and `ESP300_*`
//! environment variables; flags given here override both.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use esp300_control::adapters::TransportKind;
use esp300_control::codec::AxisId;
use esp300_control::config::{Esp300Config, DEFAULT_CONFIG_PATH};
use esp300_control::instrument::{AxisController, MotionPoller};
use esp300_control::session::DeviceSession;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Control a Newport ESP300 motion controller
#[derive(Parser, Debug)]
#[command(name = "esp300")]
#[command(about = "Command-line control for the Newport ESP300 motion controller", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Link type (serial or bus), overrides the configuration
    #[arg(short, long)]
    kind: Option<TransportKind>,

    /// Serial port or bus resource, overrides the configuration
    #[arg(short, long)]
    address: Option<String>,

    /// Response timeout in seconds, overrides the configuration
    #[arg(short, long)]
    timeout: Option<f64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the controller identification string
    Identify,

    /// Print the position of an axis
    Position {
        #[arg(value_parser = parse_axis)]
        axis: AxisId,
    },

    /// Queue an absolute move on an axis (returns once the move is sent)
    Move {
        #[arg(value_parser = parse_axis)]
        axis: AxisId,
        #[arg(allow_hyphen_values = true)]
        position: String,
    },

    /// Queue a relative move on an axis (returns once the move is sent)
    MoveRel {
        #[arg(value_parser = parse_axis)]
        axis: AxisId,
        #[arg(allow_hyphen_values = true)]
        delta: String,
    },

    /// Stop an axis
    Stop {
        #[arg(value_parser = parse_axis)]
        axis: AxisId,
    },

    /// Print the velocity of an axis, or set it if a value is given
    Velocity {
        #[arg(value_parser = parse_axis)]
        axis: AxisId,
        value: Option<String>,
    },

    /// Print the acceleration of an axis, or set it if a value is given
    Acceleration {
        #[arg(value_parser = parse_axis)]
        axis: AxisId,
        value: Option<String>,
    },

    /// Print the deceleration of an axis, or set it if a value is given
    Deceleration {
        #[arg(value_parser = parse_axis)]
        axis: AxisId,
        value: Option<String>,
    },

    /// Power an axis motor
    Enable {
        #[arg(value_parser = parse_axis)]
        axis: AxisId,
    },

    /// Remove power from an axis motor
    Disable {
        #[arg(value_parser = parse_axis)]
        axis: AxisId,
    },

    /// Define the current position of an axis as zero
    Zero {
        #[arg(value_parser = parse_axis)]
        axis: AxisId,
    },

    /// Send a raw command and print the response
    Raw { command: String },

    /// Send a raw command without waiting for a response
    Send { command: String },

    /// Print positions as axes settle, until Ctrl-C
    Watch {
        /// Axes to watch (defaults to all configured axes)
        #[arg(long, value_delimiter = ',', value_parser = parse_axis)]
        axes: Vec<AxisId>,

        /// Poll interval in milliseconds (defaults to the configured interval)
        #[arg(long)]
        interval_ms: Option<u64>,
    },
}

fn parse_axis(s: &str) -> Result<AxisId, String> {
    let id: u8 = s
        .parse()
        .map_err(|_| format!("'{}' is not an axis number", s))?;
    AxisId::try_from(id).map_err(|e| e.to_string())
}

fn load_config(cli: &Cli) -> Result<Esp300Config> {
    let mut config = Esp300Config::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    if let Some(kind) = cli.kind {
        config.connection.kind = kind;
    }
    if let Some(address) = &cli.address {
        config.connection.address = address.clone();
    }
    if let Some(timeout) = cli.timeout {
        config.connection.timeout_secs = timeout;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.application.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let session = DeviceSession::connect_with(&config.connection)
        .await
        .with_context(|| format!("Failed to connect to {}", config.connection.address))?;
    let controller = AxisController::new(session.clone()).with_move_policy(config.motion.move_policy);

    let result = run(cli.command, &controller, &config).await;

    session.disconnect().await?;
    result
}

async fn run(command: Commands, controller: &AxisController, config: &Esp300Config) -> Result<()> {
    match command {
        Commands::Identify => println!("{}", controller.identify().await?),
        Commands::Position { axis } => println!("{}", controller.get_position(axis).await?),
        Commands::Move { axis, position } => controller.move_to(axis, position).await?,
        Commands::MoveRel { axis, delta } => controller.move_relative(axis, delta).await?,
        Commands::Stop { axis } => controller.stop_axis(axis).await?,
        Commands::Velocity { axis, value } => match value {
            Some(value) => controller.set_velocity(axis, value).await?,
            None => println!("{}", controller.get_velocity(axis).await?),
        },
        Commands::Acceleration { axis, value } => match value {
            Some(value) => controller.set_acceleration(axis, value).await?,
            None => println!("{}", controller.get_acceleration(axis).await?),
        },
        Commands::Deceleration { axis, value } => match value {
            Some(value) => controller.set_deceleration(axis, value).await?,
            None => println!("{}", controller.get_deceleration(axis).await?),
        },
        Commands::Enable { axis } => controller.enable_axis(axis).await?,
        Commands::Disable { axis } => controller.disable_axis(axis).await?,
        Commands::Zero { axis } => controller.zero_position(axis).await?,
        Commands::Raw { command } => println!("{}", controller.execute_raw(&command).await?),
        Commands::Send { command } => controller.write_raw(&command).await?,
        Commands::Watch { axes, interval_ms } => {
            let axes = if axes.is_empty() {
                (1..=config.motion.num_axes)
                    .filter_map(AxisId::new)
                    .collect()
            } else {
                axes
            };
            let interval = interval_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.motion.poll_interval());

            let poller = MotionPoller::spawn(
                controller.clone(),
                axes,
                interval,
                |axis: AxisId, position: &str| println!("axis {}: {}", axis, position),
            );

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            info!("Interrupted, stopping");
            poller.stop().await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_move_help_describes_queued_move() {
        let cli = Cli::command();
        for name in ["move", "move-rel"] {
            let about = cli
                .find_subcommand(name)
                .and_then(|sub| sub.get_about())
                .map(|about| about.to_string())
                .unwrap_or_default();
            assert!(about.contains("returns once the move is sent"), "{}", about);
            assert!(!about.contains("wait"), "{}", about);
        }
    }

    #[test]
    fn test_unusable_timeout_flag_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("esp300.toml");
        let config = config.to_str().unwrap();

        let cli = Cli::try_parse_from(["esp300", "--config", config, "--timeout", "1e30", "identify"])
            .unwrap();
        assert!(load_config(&cli).is_err());

        let cli = Cli::try_parse_from(["esp300", "--config", config, "--timeout", "2.5", "identify"])
            .unwrap();
        assert_eq!(
            load_config(&cli).unwrap().connection.timeout(),
            Duration::from_millis(2500)
        );
    }
}
