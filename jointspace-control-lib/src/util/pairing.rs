//! JointSpace v6 pairing handshake.
//!
//! 1. `POST pair/request` announces this client and makes the TV show a PIN.
//!    The TV answers with an `auth_key` and a `timestamp`.
//! 2. The user types the PIN.
//! 3. `POST pair/grant`, digest-signed with `device_id`/`auth_key`, proves
//!    knowledge of the PIN through [`Auth::make_grant_signature`].
//!
//! Nothing is written to disk here. The caller persists the returned
//! [`Credential`].

use std::sync::Arc;

use derivative::Derivative;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::control_interface::{DeviceClient, DeviceEndpoint, PATH_PAIR_GRANT, PATH_PAIR_REQUEST};
use crate::error::{JointSpaceError, Result};
use crate::util::auth::Auth;
use crate::util::storage::Credential;
use crate::util::traits::{LogSink, Method, PinReader, ResponseCodeTrait, TraceSink, Transport};

const PAIRING_SCOPE: [&str; 3] = ["read", "write", "control"];
/// Application id the grant signature is registered under.
const AUTH_APP_ID: u32 = 1;

/// How this client introduces itself to the TV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub device_name: String,
    pub device_os: String,
    pub app_id: String,
    pub app_name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

impl DeviceDescriptor {
    pub fn new(device_id: &str) -> Self {
        DeviceDescriptor {
            device_name: "jointspace-control".to_string(),
            device_os: format!("rust {}", std::env::consts::OS),
            app_id: "org.jointspace.control".to_string(),
            app_name: "JointSpace Control".to_string(),
            kind: "native".to_string(),
            id: device_id.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PairRequestResponse {
    error_id: Option<String>,
    auth_key: Option<String>,
    timestamp: Option<Value>,
    timeout: Option<u64>,
}

impl ResponseCodeTrait for PairRequestResponse {
    fn error_id(&self) -> Option<&str> {
        self.error_id.as_deref()
    }
}

#[derive(Debug, Deserialize)]
struct PairGrantResponse {
    error_id: Option<String>,
    error_text: Option<String>,
}

impl ResponseCodeTrait for PairGrantResponse {
    fn error_id(&self) -> Option<&str> {
        self.error_id.as_deref()
    }
}

/// State of one pairing attempt. Lives only in memory.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct PairingSession {
    pub device_id: String,
    #[derivative(Debug = "ignore")]
    pub auth_key: String,
    /// Sent back verbatim in the grant, and signed in its decimal form.
    pub timestamp: Value,
    /// Seconds the TV keeps the PIN on screen.
    pub timeout: Option<u64>,
}

impl PairingSession {
    fn timestamp_string(&self) -> String {
        match &self.timestamp {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

pub struct Pairing<T: Transport> {
    endpoint: DeviceEndpoint,
    transport: T,
    device_id: String,
    verbose: bool,
    sink: Arc<dyn TraceSink>,
}

impl<T: Transport> Pairing<T> {
    pub fn new(endpoint: DeviceEndpoint, transport: T) -> Self {
        Pairing {
            endpoint,
            transport,
            device_id: Auth::generate_device_id(),
            verbose: false,
            sink: Arc::new(LogSink),
        }
    }

    /// Fixes the client identity instead of drawing a random one.
    pub fn with_device_id(mut self, device_id: &str) -> Self {
        self.device_id = device_id.to_string();
        self
    }

    pub fn with_trace(mut self, verbose: bool, sink: Arc<dyn TraceSink>) -> Self {
        self.verbose = verbose;
        self.sink = sink;
        self
    }

    /// Runs the whole handshake and returns the credential the TV accepted.
    /// The PIN is read on the blocking pool so a waiting prompt never stalls
    /// the runtime.
    pub async fn run(self, pin_reader: Arc<dyn PinReader>) -> Result<Credential> {
        let descriptor = DeviceDescriptor::new(&self.device_id);
        let client = DeviceClient::unauthenticated(self.endpoint.clone(), self.transport)
            .with_trace(self.verbose, self.sink.clone());

        info!("Requesting pairing with {}", self.endpoint);
        let session = Self::request_pairing(&client, &descriptor).await?;
        info!("PIN should now be visible on the TV");

        let pin = tokio::task::spawn_blocking(move || pin_reader.read_pin())
            .await
            .map_err(|e| JointSpaceError::Pairing(format!("PIN prompt aborted: {}", e)))?
            .map_err(|e| JointSpaceError::Pairing(format!("failed to read PIN: {}", e)))?;
        let pin = pin.trim();
        if pin.is_empty() {
            return Err(JointSpaceError::Pairing("no PIN entered".to_string()));
        }

        let credential = Credential::new(session.device_id.clone(), session.auth_key.clone());
        let client = client.with_credential(credential.clone());
        Self::grant(&client, &descriptor, &session, pin).await?;

        info!("Paired with {}", self.endpoint);
        Ok(credential)
    }

    async fn request_pairing(
        client: &DeviceClient<T>,
        descriptor: &DeviceDescriptor,
    ) -> Result<PairingSession> {
        let body = json!({ "scope": PAIRING_SCOPE, "device": descriptor });
        let value = client
            .request(Method::Post, PATH_PAIR_REQUEST, Some(body))
            .await
            .map_err(|e| into_pairing_error("pair request", e))?;

        let response: PairRequestResponse = serde_json::from_value(value.clone()).map_err(|e| {
            JointSpaceError::Pairing(format!("malformed pair request response ({}): {}", e, value))
        })?;
        let code = response.response_code();
        if code.is_error() {
            return Err(JointSpaceError::Pairing(format!(
                "pair request refused: {} ({})",
                response.error_id.as_deref().unwrap_or(code.error_id),
                code.message
            )));
        }
        let auth_key = response
            .auth_key
            .filter(|key| !key.is_empty())
            .ok_or_else(|| JointSpaceError::Pairing("pair request response has no auth_key".into()))?;
        let timestamp = response
            .timestamp
            .filter(|ts| ts.is_number() || ts.is_string())
            .ok_or_else(|| JointSpaceError::Pairing("pair request response has no timestamp".into()))?;

        Ok(PairingSession {
            device_id: descriptor.id.clone(),
            auth_key,
            timestamp,
            timeout: response.timeout,
        })
    }

    async fn grant(
        client: &DeviceClient<T>,
        descriptor: &DeviceDescriptor,
        session: &PairingSession,
        pin: &str,
    ) -> Result<()> {
        let signature = Auth::make_grant_signature(&session.timestamp_string(), pin)?;
        let body = json!({
            "auth": {
                "pin": pin,
                "auth_timestamp": session.timestamp,
                "auth_signature": signature,
                "auth_AppId": AUTH_APP_ID,
            },
            "device": descriptor,
        });
        let value = client
            .request(Method::Post, PATH_PAIR_GRANT, Some(body))
            .await
            .map_err(|e| into_pairing_error("pair grant", e))?;

        let response: PairGrantResponse = serde_json::from_value(value.clone()).map_err(|e| {
            JointSpaceError::Pairing(format!("malformed pair grant response ({}): {}", e, value))
        })?;
        let code = response.response_code();
        if code.is_error() {
            return Err(JointSpaceError::Pairing(format!(
                "pair grant refused: {} ({})",
                response.error_id.as_deref().unwrap_or(code.error_id),
                response.error_text.as_deref().unwrap_or(code.message)
            )));
        }
        Ok(())
    }
}

/// Device rejections during the handshake are pairing failures; network
/// trouble keeps its own kind.
fn into_pairing_error(step: &str, err: JointSpaceError) -> JointSpaceError {
    match err {
        JointSpaceError::Api { status, body } => {
            JointSpaceError::Pairing(format!("{} failed with HTTP {}: {}", step, status, body))
        }
        JointSpaceError::Auth(reason) => {
            JointSpaceError::Pairing(format!("{} was not authorised: {}", step, reason))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::control_interface::mock::MockTransport;
    use crate::error::{ErrorKind, TransportError};

    const DEVICE_ID: &str = "AbCdEf0123456789";
    const AUTH_KEY: &str = "0f1e2d3c4b5a69788796a5b4c3d2e1f0";
    const REQUEST_OK: &str =
        r#"{"error_id": "SUCCESS", "error_text": "Authorization required", "auth_key": "0f1e2d3c4b5a69788796a5b4c3d2e1f0", "timestamp": 1700000000, "timeout": 60}"#;

    fn endpoint() -> DeviceEndpoint {
        DeviceEndpoint::new("192.168.1.50", 1926)
    }

    fn pin(value: &'static str) -> Arc<dyn PinReader> {
        Arc::new(move || -> std::io::Result<String> { Ok(value.to_string()) })
    }

    fn tv() -> MockTransport {
        let transport =
            MockTransport::with_digest(&Credential::new(DEVICE_ID.into(), AUTH_KEY.into()));
        transport.respond(Method::Post, PATH_PAIR_REQUEST, 200, REQUEST_OK);
        transport
    }

    #[tokio::test]
    async fn test_pairing_returns_device_credential() {
        let transport = tv();
        transport.respond(
            Method::Post,
            PATH_PAIR_GRANT,
            200,
            r#"{"error_id": "SUCCESS", "error_text": "Pairing completed"}"#,
        );

        let credential = Pairing::new(endpoint(), transport.clone())
            .with_device_id(DEVICE_ID)
            .run(pin(" 4321\n"))
            .await
            .unwrap();

        assert_eq!(credential, Credential::new(DEVICE_ID.into(), AUTH_KEY.into()));

        let requests = transport.requests();
        let request_body = requests[0].body.as_ref().unwrap();
        assert_eq!(request_body["scope"], json!(["read", "write", "control"]));
        assert_eq!(request_body["device"]["id"], DEVICE_ID);
        assert_eq!(request_body["device"]["type"], "native");
        assert!(requests[0].authorization.is_none());

        // Unsigned grant collects the challenge, the signed one is accepted.
        assert_eq!(transport.count(Method::Post, PATH_PAIR_GRANT), 2);
        let grant = requests.last().unwrap();
        assert!(grant.authorization.is_some());
        let auth = &grant.body.as_ref().unwrap()["auth"];
        assert_eq!(auth["pin"], "4321");
        assert_eq!(auth["auth_timestamp"], json!(1700000000));
        assert_eq!(auth["auth_AppId"], 1);
        assert_eq!(
            auth["auth_signature"],
            json!(Auth::make_grant_signature("1700000000", "4321").unwrap())
        );
    }

    #[tokio::test]
    async fn test_empty_grant_body_is_success() {
        let transport = tv();
        transport.respond(Method::Post, PATH_PAIR_GRANT, 200, "");

        let credential = Pairing::new(endpoint(), transport)
            .with_device_id(DEVICE_ID)
            .run(pin("1111"))
            .await
            .unwrap();
        assert_eq!(credential.secret, AUTH_KEY);
    }

    #[tokio::test]
    async fn test_rejected_grant_is_pairing_error() {
        let transport = tv();
        transport.respond(Method::Post, PATH_PAIR_GRANT, 403, "Forbidden");

        let err = Pairing::new(endpoint(), transport)
            .with_device_id(DEVICE_ID)
            .run(pin("0000"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Pairing);
        assert!(err.to_string().contains("403"));
    }

    #[tokio::test]
    async fn test_invalid_pin_error_id() {
        let transport = tv();
        transport.respond(
            Method::Post,
            PATH_PAIR_GRANT,
            200,
            r#"{"error_id": "INVALID_PIN", "error_text": "Invalid pin"}"#,
        );

        let err = Pairing::new(endpoint(), transport)
            .with_device_id(DEVICE_ID)
            .run(pin("9999"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Pairing);
        assert!(err.to_string().contains("INVALID_PIN"));
    }

    #[tokio::test]
    async fn test_wrong_digest_identity_is_pairing_error() {
        // The TV issued the auth_key to a different device id.
        let transport = tv();
        let err = Pairing::new(endpoint(), transport.clone())
            .with_device_id("someoneelse00000")
            .run(pin("1234"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Pairing);
        assert_eq!(transport.count(Method::Post, PATH_PAIR_GRANT), 2);
    }

    #[tokio::test]
    async fn test_malformed_request_response_stops_before_pin() {
        let transport = MockTransport::new();
        transport.respond(Method::Post, PATH_PAIR_REQUEST, 200, r#"{"error_id": "SUCCESS"}"#);
        let asked = Arc::new(AtomicBool::new(false));
        let flag = asked.clone();
        let reader = move || -> std::io::Result<String> {
            flag.store(true, Ordering::SeqCst);
            Ok("1234".to_string())
        };

        let err = Pairing::new(endpoint(), transport.clone())
            .run(Arc::new(reader))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Pairing);
        assert!(!asked.load(Ordering::SeqCst));
        assert_eq!(transport.count(Method::Post, PATH_PAIR_GRANT), 0);
    }

    #[tokio::test]
    async fn test_pin_is_read_off_the_runtime_thread() {
        let transport = tv();
        transport.respond(Method::Post, PATH_PAIR_GRANT, 200, r#"{"error_id": "SUCCESS"}"#);
        let runtime_thread = std::thread::current().id();
        let reader_thread = Arc::new(Mutex::new(None));
        let seen = reader_thread.clone();
        let reader = move || -> std::io::Result<String> {
            *seen.lock().unwrap() = Some(std::thread::current().id());
            Ok("1234".to_string())
        };

        Pairing::new(endpoint(), transport)
            .with_device_id(DEVICE_ID)
            .run(Arc::new(reader))
            .await
            .unwrap();

        let reader_thread = reader_thread.lock().unwrap().unwrap();
        assert_ne!(reader_thread, runtime_thread);
    }

    #[tokio::test]
    async fn test_failing_pin_reader_sends_no_grant() {
        let transport = tv();
        let reader = || -> std::io::Result<String> {
            Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "stdin closed"))
        };
        let err = Pairing::new(endpoint(), transport.clone())
            .with_device_id(DEVICE_ID)
            .run(Arc::new(reader))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Pairing);
        assert!(err.to_string().contains("stdin closed"));
        assert_eq!(transport.count(Method::Post, PATH_PAIR_GRANT), 0);
    }

    #[tokio::test]
    async fn test_refused_request() {
        let transport = MockTransport::new();
        transport.respond(
            Method::Post,
            PATH_PAIR_REQUEST,
            200,
            r#"{"error_id": "CONCURRENT_PAIRING"}"#,
        );
        let err = Pairing::new(endpoint(), transport)
            .run(pin("1234"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("CONCURRENT_PAIRING"));
    }

    #[tokio::test]
    async fn test_empty_pin_sends_no_grant() {
        let transport = tv();
        let err = Pairing::new(endpoint(), transport.clone())
            .with_device_id(DEVICE_ID)
            .run(pin("   "))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Pairing);
        assert_eq!(transport.count(Method::Post, PATH_PAIR_GRANT), 0);
    }

    #[tokio::test]
    async fn test_unreachable_tv_is_network_error() {
        let transport = MockTransport::new();
        transport.fail(
            Method::Post,
            PATH_PAIR_REQUEST,
            TransportError::Connect("connection refused".into()),
        );
        let err = Pairing::new(endpoint(), transport)
            .run(pin("1234"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
    }
}
