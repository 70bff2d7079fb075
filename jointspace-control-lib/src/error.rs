use thiserror::Error;

/// Errors raised while turning user input into a [`crate::dispatch::Command`].
///
/// These never reach the network.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("Missing argument <{argument}> for command {command}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
    #[error("Invalid value {value:?} for <{argument}>: {reason}")]
    InvalidArgument {
        argument: &'static str,
        value: String,
        reason: String,
    },
}

/// Failures of the underlying HTTP transport, before any status code is known.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Refusing to send a request to {url}: transport is bound to {host}")]
    ForeignHost { url: String, host: String },
    #[error("{0}")]
    Other(String),
}

/// The error taxonomy of the whole crate.
#[derive(Debug, Error)]
pub enum JointSpaceError {
    /// No settings or no credential on disk.
    #[error("Not paired: {0}. Run `pair <ip>` first.")]
    NotPaired(String),
    /// The pairing handshake failed. Retry pairing from scratch.
    #[error("Pairing failed: {0}")]
    Pairing(String),
    /// Digest challenge missing/unsupported, or the device rejected signed credentials.
    #[error("Authentication failed: {0}. Re-pair with the TV.")]
    Auth(String),
    #[error("Network error: {0}")]
    Network(#[from] TransportError),
    #[error("Device returned HTTP {status}: {body}")]
    Api { status: u16, body: String },
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Fieldless view of [`JointSpaceError`], so callers can decide between
/// re-pairing and reporting without matching on payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotPaired,
    Pairing,
    Auth,
    Network,
    Api,
    Dispatch,
    Storage,
}

impl JointSpaceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JointSpaceError::NotPaired(_) => ErrorKind::NotPaired,
            JointSpaceError::Pairing(_) => ErrorKind::Pairing,
            JointSpaceError::Auth(_) => ErrorKind::Auth,
            JointSpaceError::Network(_) => ErrorKind::Network,
            JointSpaceError::Api { .. } => ErrorKind::Api,
            JointSpaceError::Dispatch(_) => ErrorKind::Dispatch,
            JointSpaceError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Whether the caller should run pairing again before retrying.
    pub fn requires_pairing(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotPaired | ErrorKind::Auth)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, JointSpaceError::Api { status: 404, .. })
    }
}

impl From<std::io::Error> for JointSpaceError {
    fn from(err: std::io::Error) -> Self {
        JointSpaceError::Storage(err.to_string())
    }
}

pub type Result<T, E = JointSpaceError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_pairing() {
        assert!(JointSpaceError::NotPaired("no settings".into()).requires_pairing());
        assert!(JointSpaceError::Auth("401".into()).requires_pairing());
        assert!(!JointSpaceError::Network(TransportError::Timeout("5s".into())).requires_pairing());
        assert!(!JointSpaceError::Api {
            status: 500,
            body: String::new()
        }
        .requires_pairing());
    }

    #[test]
    fn test_dispatch_error_kind() {
        let err: JointSpaceError = DispatchError::UnknownCommand("frobnicate".into()).into();
        assert_eq!(err.kind(), ErrorKind::Dispatch);
        assert_eq!(err.to_string(), "Unknown command: frobnicate");
    }
}
