use async_trait::async_trait;
use log::info;
use serde::Serialize;
use serde_json::Value;

use crate::control_interface::DeviceEndpoint;
use crate::error::TransportError;

/// The status carried in the `error_id` field of JointSpace pairing responses.
///
/// The HTTP status only tells that the request was received, the `error_id`
/// tells whether the device accepted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ResponseCode {
    pub error_id: &'static str,
    pub message: &'static str,
}

impl ResponseCode {
    pub fn is_ok(&self) -> bool {
        self.error_id == SUCCESS.error_id
    }

    pub fn is_error(&self) -> bool {
        !self.is_ok()
    }
}

/// The device accepted the request.
pub const SUCCESS: ResponseCode = ResponseCode {
    error_id: "SUCCESS",
    message: "Ok",
};
/// The PIN did not match the one shown on screen.
pub const INVALID_PIN: ResponseCode = ResponseCode {
    error_id: "INVALID_PIN",
    message: "The PIN does not match the one shown on the TV",
};
/// The PIN overlay timed out before the grant arrived.
pub const TIMEOUT: ResponseCode = ResponseCode {
    error_id: "TIMEOUT",
    message: "The pairing window on the TV timed out",
};
/// Anything else.
pub const ERROR: ResponseCode = ResponseCode {
    error_id: "ERROR",
    message: "Error",
};

/// Trait for responses carrying an `error_id`.
pub trait ResponseCodeTrait {
    /// The raw `error_id`, if the response had one.
    fn error_id(&self) -> Option<&str>;

    /// A missing `error_id` counts as success, older firmware omits it on grant.
    fn response_code(&self) -> ResponseCode {
        match self.error_id() {
            None => SUCCESS,
            Some(id) => Self::map_response_code(id),
        }
    }

    fn map_response_code(error_id: &str) -> ResponseCode {
        match error_id {
            "SUCCESS" => SUCCESS,
            "INVALID_PIN" => INVALID_PIN,
            "TIMEOUT" => TIMEOUT,
            _ => ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

/// A single HTTP exchange as seen by a [`Transport`].
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
    /// Value of the `Authorization` header, if the request is signed.
    pub authorization: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub www_authenticate: Option<String>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends one HTTP request and returns whatever the device answered.
///
/// Implementations must not retry and must not interpret status codes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Builds a [`Transport`] bound to one device.
pub trait Connector: Send + Sync {
    type Transport: Transport;

    fn connect(&self, endpoint: &DeviceEndpoint) -> Result<Self::Transport, TransportError>;
}

/// Receives the verbose request trace.
pub trait TraceSink: Send + Sync {
    fn trace(&self, line: &str);
}

/// Forwards the trace to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl TraceSink for LogSink {
    fn trace(&self, line: &str) {
        info!("{}", line);
    }
}

/// Supplies the PIN the TV shows during pairing.
pub trait PinReader: Send + Sync {
    fn read_pin(&self) -> std::io::Result<String>;
}

impl<F> PinReader for F
where
    F: Fn() -> std::io::Result<String> + Send + Sync,
{
    fn read_pin(&self) -> std::io::Result<String> {
        self()
    }
}
