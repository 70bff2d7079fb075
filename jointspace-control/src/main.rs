use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::debug;

use jointspace_control_lib::control_interface::ReqwestConnector;
use jointspace_control_lib::dispatch::{clamp_count, Command, Dispatcher, Outcome};
use jointspace_control_lib::util::storage::{CredentialStore, DEFAULT_PORT};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let base_dir = match &cli.base_dir {
        Some(dir) => dir.clone(),
        None => CredentialStore::default_base_dir()?,
    };
    let store = CredentialStore::new(base_dir);
    init_logging(&store);

    handle_cli(cli, store).await
}

/// `info` when the stored verbose flag is on, so request traces are visible.
/// `RUST_LOG` still wins.
fn init_logging(store: &CredentialStore) {
    let verbose = store
        .read_settings()
        .ok()
        .flatten()
        .map(|s| s.verbose)
        .unwrap_or(false);
    let default_filter = if verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
}

/// This struct defines the command line interface of the application
#[derive(Parser)]
#[clap(
    name = "jointspace_control",
    about = "Controls Philips TVs over the JointSpace API",
    version = "0.1.0"
)]
pub struct Cli {
    /// Directory holding the settings and credential files
    #[clap(long, global = true, env = "PHILIPS_TV_BASE_DIR")]
    pub base_dir: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// Supported output formats for the `get-volume` command.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputFormat {
    /// Plain text format.
    Plaintext,
    /// JSON format.
    Json,
    /// YAML format.
    Yaml,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

/// Subcommands available for the CLI
#[derive(Subcommand)]
pub enum Commands {
    /// Pairs with the TV. The TV shows a PIN that has to be typed in.
    #[clap(name = "pair")]
    Pair {
        /// IP address or host name of the TV
        #[clap(value_parser = parse_host)]
        ip: String,
        #[clap(default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Sets the absolute volume.
    #[clap(name = "volume")]
    Volume { level: u32, port: Option<u16> },
    /// Prints the current volume.
    #[clap(name = "get-volume")]
    GetVolume {
        port: Option<u16>,

        /// Output format (plaintext, json, yaml)
        #[clap(short, long, value_enum, default_value_t = OutputFormat::Plaintext)]
        output: OutputFormat,
    },
    #[clap(name = "volume-up")]
    VolumeUp {
        /// Number of key presses
        #[clap(default_value_t = 1, allow_negative_numbers = true)]
        steps: i64,
        port: Option<u16>,
    },
    #[clap(name = "volume-down")]
    VolumeDown {
        /// Number of key presses
        #[clap(default_value_t = 1, allow_negative_numbers = true)]
        steps: i64,
        port: Option<u16>,
    },
    /// Switches to an HDMI input.
    #[clap(name = "hdmi")]
    Hdmi {
        #[clap(allow_negative_numbers = true)]
        input: i64,
        port: Option<u16>,
    },
    /// Sends a remote key such as `Mute`, `CursorUp` or `Standby`.
    #[clap(name = "key")]
    Key {
        name: String,
        #[clap(default_value_t = 1, allow_negative_numbers = true)]
        count: i64,
        port: Option<u16>,
    },
    /// Standby when HDMI 1 is showing, otherwise switches to HDMI 1.
    #[clap(name = "power-hdmi1")]
    PowerHdmi1 { port: Option<u16> },
    /// Raw keymap arguments: a command name, or a key name with `[count] [port]`.
    #[clap(name = "keymap")]
    Keymap {
        #[clap(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Turns the stored request trace on or off.
    #[clap(name = "verbose")]
    Verbose {
        #[clap(value_enum)]
        state: Toggle,
    },
}

fn parse_host(value: &str) -> Result<String, String> {
    let host = value.trim();
    if host.is_empty() {
        return Err("the TV address must not be empty".to_string());
    }
    Ok(host.to_string())
}

fn read_pin_from_stdin() -> io::Result<String> {
    eprint!("Enter the PIN shown on the TV: ");
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line)
}

async fn handle_cli(cli: Cli, store: CredentialStore) -> Result<()> {
    debug!("Using base directory {:?}", store.base_dir());
    let dispatcher = Dispatcher::new(
        store,
        ReqwestConnector::default(),
        Box::new(read_pin_from_stdin),
    );

    let mut output = OutputFormat::Plaintext;
    let command = match cli.command {
        Commands::Verbose { state } => {
            let settings = dispatcher
                .store()
                .set_verbose(state == Toggle::On)
                .context("Failed to update the verbose flag")?;
            println!(
                "Verbose logging {}",
                if settings.verbose { "enabled" } else { "disabled" }
            );
            return Ok(());
        }
        Commands::Keymap { args } => {
            let outcome = dispatcher.dispatch_keymap(&args).await?;
            println!("{}", outcome);
            return Ok(());
        }
        Commands::Pair { ip, port } => Command::Pair { host: ip, port },
        Commands::Volume { level, port } => Command::Volume { level, port },
        Commands::GetVolume {
            port,
            output: format,
        } => {
            output = format;
            Command::GetVolume { port }
        }
        Commands::VolumeUp { steps, port } => Command::VolumeUp {
            steps: clamp_count(steps),
            port,
        },
        Commands::VolumeDown { steps, port } => Command::VolumeDown {
            steps: clamp_count(steps),
            port,
        },
        Commands::Hdmi { input, port } => Command::Hdmi {
            input: clamp_count(input).max(1),
            port,
        },
        Commands::Key { name, count, port } => Command::Key {
            name,
            count: clamp_count(count),
            port,
        },
        Commands::PowerHdmi1 { port } => Command::PowerHdmi1 { port },
    };

    let name = command.name();
    let outcome = dispatcher
        .dispatch(command)
        .await
        .with_context(|| format!("{} failed", name))?;

    match (&outcome, output) {
        (Outcome::Volume(state), OutputFormat::Json) => {
            println!("{}", serde_json::to_string(state)?);
        }
        (Outcome::Volume(state), OutputFormat::Yaml) => {
            println!("{}", serde_yaml::to_string(state)?);
        }
        _ => println!("{}", outcome),
    }

    Ok(())
}
