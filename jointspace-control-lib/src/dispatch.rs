//! Turns a command name plus arguments into device calls.
//!
//! Every command except `pair` needs stored settings and credentials. Those
//! are loaded before anything touches the network, so an unpaired bridge
//! fails with [`crate::error::JointSpaceError::NotPaired`] and makes no requests.

use std::fmt;
use std::sync::Arc;

use log::{info, warn};

use crate::control_interface::{DeviceClient, DeviceEndpoint, VolumeState};
use crate::error::{DispatchError, ErrorKind, Result};
use crate::util::pairing::Pairing;
use crate::util::storage::{CredentialStore, DEFAULT_PORT};
use crate::util::traits::{Connector, LogSink, PinReader, TraceSink};

pub const KEY_VOLUME_UP: &str = "VolumeUp";
pub const KEY_VOLUME_DOWN: &str = "VolumeDown";
pub const KEY_STANDBY: &str = "Standby";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Pair { host: String, port: u16 },
    Volume { level: u32, port: Option<u16> },
    GetVolume { port: Option<u16> },
    VolumeUp { steps: u32, port: Option<u16> },
    VolumeDown { steps: u32, port: Option<u16> },
    Hdmi { input: u32, port: Option<u16> },
    /// Any remote key, sent verbatim.
    Key {
        name: String,
        count: u32,
        port: Option<u16>,
    },
    PowerHdmi1 { port: Option<u16> },
}

impl Command {
    /// Parses `<command> [args...]`. Names accept `_` or `-` as separator.
    pub fn parse(args: &[String]) -> Result<Command, DispatchError> {
        let (name, rest) = args.split_first().ok_or(DispatchError::MissingArgument {
            command: "jointspace-control",
            argument: "command",
        })?;
        let rest = Args {
            command: "",
            values: rest,
        };

        let command = match name.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "pair" => {
                let rest = rest.named("pair");
                rest.expect_at_most(2)?;
                Command::Pair {
                    host: rest.required(0, "ip")?.trim().to_string(),
                    port: rest.port(1)?.unwrap_or(DEFAULT_PORT),
                }
            }
            "volume" => {
                let rest = rest.named("volume");
                rest.expect_at_most(2)?;
                let raw = rest.required(0, "level")?;
                let level = raw
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| DispatchError::InvalidArgument {
                        argument: "level",
                        value: raw.to_string(),
                        reason: "expected a non-negative integer".to_string(),
                    })?;
                Command::Volume {
                    level,
                    port: rest.port(1)?,
                }
            }
            "get_volume" => {
                let rest = rest.named("get_volume");
                rest.expect_at_most(1)?;
                Command::GetVolume {
                    port: rest.port(0)?,
                }
            }
            "volume_up" => {
                let rest = rest.named("volume_up");
                rest.expect_at_most(2)?;
                Command::VolumeUp {
                    steps: rest.count(0, "steps")?,
                    port: rest.port(1)?,
                }
            }
            "volume_down" => {
                let rest = rest.named("volume_down");
                rest.expect_at_most(2)?;
                Command::VolumeDown {
                    steps: rest.count(0, "steps")?,
                    port: rest.port(1)?,
                }
            }
            "hdmi" => {
                let rest = rest.named("hdmi");
                rest.expect_at_most(2)?;
                let raw = rest.required(0, "input")?;
                let input = parse_int(raw, "input")?;
                Command::Hdmi {
                    input: clamp_count(input.max(1)),
                    port: rest.port(1)?,
                }
            }
            "key" => {
                let rest = rest.named("key");
                rest.expect_at_most(3)?;
                Command::Key {
                    name: key_name(rest.required(0, "name")?)?,
                    count: rest.count(1, "count")?,
                    port: rest.port(2)?,
                }
            }
            "power_hdmi1" => {
                let rest = rest.named("power_hdmi1");
                rest.expect_at_most(1)?;
                Command::PowerHdmi1 {
                    port: rest.port(0)?,
                }
            }
            _ => return Err(DispatchError::UnknownCommand(name.to_string())),
        };
        Ok(command)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Pair { .. } => "pair",
            Command::Volume { .. } => "volume",
            Command::GetVolume { .. } => "get_volume",
            Command::VolumeUp { .. } => "volume_up",
            Command::VolumeDown { .. } => "volume_down",
            Command::Hdmi { .. } => "hdmi",
            Command::Key { .. } => "key",
            Command::PowerHdmi1 { .. } => "power_hdmi1",
        }
    }

    /// The one-off port override, if any. `pair` always names its port.
    pub fn port(&self) -> Option<u16> {
        match self {
            Command::Pair { port, .. } => Some(*port),
            Command::Volume { port, .. }
            | Command::GetVolume { port }
            | Command::VolumeUp { port, .. }
            | Command::VolumeDown { port, .. }
            | Command::Hdmi { port, .. }
            | Command::Key { port, .. }
            | Command::PowerHdmi1 { port } => *port,
        }
    }
}

/// Parses arguments the way media-center keymaps pass them: a known command
/// name, or otherwise a key name followed by `[count] [port]`.
pub fn parse_keymap_args(args: &[String]) -> Result<Command, DispatchError> {
    match Command::parse(args) {
        Err(DispatchError::UnknownCommand(name)) => {
            let rest = Args {
                command: "key",
                values: &args[1..],
            };
            rest.expect_at_most(2)?;
            Ok(Command::Key {
                name: key_name(&name)?,
                count: rest.count(0, "count")?,
                port: rest.port(1)?,
            })
        }
        other => other,
    }
}

/// Positional arguments after the command name.
struct Args<'a> {
    command: &'static str,
    values: &'a [String],
}

impl<'a> Args<'a> {
    fn named(self, command: &'static str) -> Self {
        Args { command, ..self }
    }

    fn get(&self, index: usize) -> Option<&'a str> {
        self.values
            .get(index)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    fn required(&self, index: usize, argument: &'static str) -> Result<&'a str, DispatchError> {
        self.get(index).ok_or(DispatchError::MissingArgument {
            command: self.command,
            argument,
        })
    }

    fn expect_at_most(&self, count: usize) -> Result<(), DispatchError> {
        match self.values.get(count) {
            Some(extra) => Err(DispatchError::InvalidArgument {
                argument: "arguments",
                value: extra.clone(),
                reason: format!("{} takes at most {} argument(s)", self.command, count),
            }),
            None => Ok(()),
        }
    }

    /// Repeat counts default to 1; negative values mean "do nothing".
    fn count(&self, index: usize, argument: &'static str) -> Result<u32, DispatchError> {
        match self.get(index) {
            None => Ok(1),
            Some(raw) => Ok(clamp_count(parse_int(raw, argument)?)),
        }
    }

    fn port(&self, index: usize) -> Result<Option<u16>, DispatchError> {
        let raw = match self.get(index) {
            None => return Ok(None),
            Some(raw) => raw,
        };
        match raw.trim().parse::<u16>() {
            Ok(port) if port > 0 => Ok(Some(port)),
            _ => Err(DispatchError::InvalidArgument {
                argument: "port",
                value: raw.to_string(),
                reason: "expected a TCP port between 1 and 65535".to_string(),
            }),
        }
    }
}

fn parse_int(raw: &str, argument: &'static str) -> Result<i64, DispatchError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| DispatchError::InvalidArgument {
            argument,
            value: raw.to_string(),
            reason: "expected an integer".to_string(),
        })
}

/// Repeat counts below zero mean "send nothing".
pub fn clamp_count(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

fn key_name(raw: &str) -> Result<String, DispatchError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(DispatchError::MissingArgument {
            command: "key",
            argument: "name",
        });
    }
    Ok(name.to_string())
}

/// What a dispatched command did.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Paired { endpoint: DeviceEndpoint },
    KeysSent { key: String, count: u32 },
    VolumeSet(u32),
    Volume(VolumeState),
    SourceSwitched(String),
    Standby,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Paired { endpoint } => {
                write!(f, "Paired with {}. Credentials saved.", endpoint)
            }
            Outcome::KeysSent { key, count: 0 } => write!(f, "Nothing sent for {}", key),
            Outcome::KeysSent { key, count } => write!(f, "Sent {} x{}", key, count),
            Outcome::VolumeSet(level) => write!(f, "Volume set to {}", level),
            Outcome::Volume(state) => write!(f, "{}", state),
            Outcome::SourceSwitched(source) => write!(f, "Switched to {}", source),
            Outcome::Standby => write!(f, "Sent {}", KEY_STANDBY),
        }
    }
}

pub struct Dispatcher<C: Connector> {
    store: CredentialStore,
    connector: C,
    pin_reader: Arc<dyn PinReader>,
    sink: Arc<dyn TraceSink>,
}

impl<C: Connector> Dispatcher<C> {
    pub fn new(store: CredentialStore, connector: C, pin_reader: Box<dyn PinReader>) -> Self {
        Dispatcher {
            store,
            connector,
            pin_reader: Arc::from(pin_reader),
            sink: Arc::new(LogSink),
        }
    }

    /// Where verbose request traces go. Defaults to [`LogSink`].
    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub async fn dispatch_args(&self, args: &[String]) -> Result<Outcome> {
        let command = Command::parse(args)?;
        self.dispatch(command).await
    }

    /// Like [`Self::dispatch_args`], with unknown names sent as keys.
    pub async fn dispatch_keymap(&self, args: &[String]) -> Result<Outcome> {
        let command = parse_keymap_args(args)?;
        self.dispatch(command).await
    }

    pub async fn dispatch(&self, command: Command) -> Result<Outcome> {
        info!("Dispatching {}", command.name());
        let port = command.port();
        match command {
            Command::Pair { host, port } => self.pair(&host, port).await,
            Command::Volume { level, .. } => {
                self.client(port)?.set_volume(level).await?;
                Ok(Outcome::VolumeSet(level))
            }
            Command::GetVolume { .. } => {
                let client = self.client(port)?;
                let volume = client.get_volume().await?;
                if let Some((min, max)) = client.known_volume_range() {
                    if let Err(e) = self.store.remember_volume_range(min, max) {
                        warn!("Could not store the volume range: {}", e);
                    }
                }
                Ok(Outcome::Volume(volume))
            }
            Command::VolumeUp { steps, .. } => {
                let count = self.client(port)?.send_key_times(KEY_VOLUME_UP, steps).await?;
                Ok(Outcome::KeysSent {
                    key: KEY_VOLUME_UP.to_string(),
                    count,
                })
            }
            Command::VolumeDown { steps, .. } => {
                let count = self.client(port)?.send_key_times(KEY_VOLUME_DOWN, steps).await?;
                Ok(Outcome::KeysSent {
                    key: KEY_VOLUME_DOWN.to_string(),
                    count,
                })
            }
            Command::Hdmi { input, .. } => {
                let source = self.client(port)?.switch_to_hdmi(input).await?;
                Ok(Outcome::SourceSwitched(source))
            }
            Command::Key { name, count, .. } => {
                let count = self.client(port)?.send_key_times(&name, count).await?;
                Ok(Outcome::KeysSent { key: name, count })
            }
            Command::PowerHdmi1 { .. } => Self::power_hdmi1(&self.client(port)?).await,
        }
    }

    /// Builds a client from the store. Fails before connecting when unpaired.
    fn client(&self, port: Option<u16>) -> Result<DeviceClient<C::Transport>> {
        let (settings, credential) = self.store.load()?;
        let endpoint = settings.endpoint(port)?;
        let transport = self.connector.connect(&endpoint)?;
        Ok(DeviceClient::new(endpoint, credential, transport)
            .with_trace(settings.verbose, self.sink.clone())
            .with_volume_range(settings.volume_range))
    }

    async fn pair(&self, host: &str, port: u16) -> Result<Outcome> {
        if host.trim().is_empty() {
            return Err(DispatchError::MissingArgument {
                command: "pair",
                argument: "ip",
            }
            .into());
        }
        let verbose = self
            .store
            .read_settings()
            .ok()
            .flatten()
            .map(|s| s.verbose)
            .unwrap_or(false);
        let endpoint = DeviceEndpoint::new(host, port);
        let transport = self.connector.connect(&endpoint)?;

        let credential = Pairing::new(endpoint.clone(), transport)
            .with_trace(verbose, self.sink.clone())
            .run(self.pin_reader.clone())
            .await?;
        self.store
            .save_pairing(&endpoint.host, endpoint.port, &credential)?;
        Ok(Outcome::Paired { endpoint })
    }

    /// Standby when HDMI 1 is already showing, otherwise switch to it.
    async fn power_hdmi1(client: &DeviceClient<C::Transport>) -> Result<Outcome> {
        let current = match client.get_current_source().await {
            Ok(current) => current,
            Err(err) if matches!(err.kind(), ErrorKind::Api | ErrorKind::Network) => {
                warn!("Could not read the current source, assuming not HDMI 1: {}", err);
                None
            }
            Err(err) => return Err(err),
        };

        let on_hdmi1 = current
            .as_deref()
            .map(|id| id.eq_ignore_ascii_case("hdmi1"))
            .unwrap_or(false);
        if on_hdmi1 {
            client.send_key(KEY_STANDBY).await?;
            Ok(Outcome::Standby)
        } else {
            Ok(Outcome::SourceSwitched(client.switch_to_hdmi(1).await?))
        }
    }
}
