//! Scripted in-memory TV for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::control_interface::DeviceEndpoint;
use crate::error::TransportError;
use crate::util::digest::{compute_response, parse_params, Algorithm, Challenge};
use crate::util::storage::Credential;
use crate::util::traits::{Connector, HttpRequest, HttpResponse, Method, TraceSink, Transport};

type Reply = Result<HttpResponse, TransportError>;

/// Paths the TV serves without digest authentication.
const OPEN_PATHS: &[&str] = &["pair/request"];

pub(crate) const CHALLENGE: &str =
    r#"Digest realm="XTV", nonce="c2VydmVyLW5vbmNl", qop="auth", opaque="b3BhcXVl""#;

#[derive(Default)]
struct Inner {
    requests: Mutex<Vec<HttpRequest>>,
    routes: Mutex<HashMap<(Method, String), VecDeque<Reply>>>,
    digest: Mutex<Option<Credential>>,
}

/// Answers from per-route queues and records every request.
///
/// The last reply of a queue repeats. Unscripted routes answer `200` with an
/// empty body. With [`MockTransport::with_digest`] every request must carry a
/// valid digest for the given credential, otherwise it gets a 401 challenge;
/// `pair/request` stays open like on a real TV.
#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    inner: Arc<Inner>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_digest(credential: &Credential) -> Self {
        let transport = Self::default();
        *transport.inner.digest.lock().unwrap() = Some(credential.clone());
        transport
    }

    pub fn respond(&self, method: Method, path: &str, status: u16, body: &str) {
        self.push(
            method,
            path,
            Ok(HttpResponse {
                status,
                www_authenticate: None,
                body: body.to_string(),
            }),
        );
    }

    pub fn fail(&self, method: Method, path: &str, error: TransportError) {
        self.push(method, path, Err(error));
    }

    fn push(&self, method: Method, path: &str, reply: Reply) {
        self.inner
            .routes
            .lock()
            .unwrap()
            .entry((method, path.to_string()))
            .or_default()
            .push_back(reply);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.inner.requests.lock().unwrap().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.requests().iter().map(|r| path_of(&r.url)).collect()
    }

    pub fn count(&self, method: Method, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == method && path_of(&r.url) == path)
            .count()
    }

    fn next_reply(&self, method: Method, path: &str) -> Reply {
        let mut routes = self.inner.routes.lock().unwrap();
        match routes.get_mut(&(method, path.to_string())) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) if !queue.is_empty() => queue.front().cloned().unwrap(),
            _ => Ok(HttpResponse {
                status: 200,
                www_authenticate: None,
                body: String::new(),
            }),
        }
    }
}

fn path_of(url: &str) -> String {
    url.split_once("/6/")
        .map(|(_, path)| path.to_string())
        .unwrap_or_default()
}

fn digest_is_valid(request: &HttpRequest, credential: &Credential) -> bool {
    let header = match request
        .authorization
        .as_deref()
        .and_then(|h| h.strip_prefix("Digest "))
    {
        Some(header) => header,
        None => return false,
    };
    let params: HashMap<String, String> = parse_params(header).into_iter().collect();
    let field = |name: &str| params.get(name).cloned().unwrap_or_default();

    let uri = field("uri");
    if field("username") != credential.username || uri != format!("/6/{}", path_of(&request.url))
    {
        return false;
    }
    let challenge = Challenge {
        realm: field("realm"),
        nonce: field("nonce"),
        qop_auth: params.contains_key("qop"),
        opaque: params.get("opaque").cloned(),
        algorithm: Algorithm::Md5,
        stale: false,
    };
    let nonce_count = u32::from_str_radix(&field("nc"), 16).unwrap_or(0);
    let expected = compute_response(
        request.method,
        &uri,
        credential,
        &challenge,
        nonce_count,
        &field("cnonce"),
    );
    field("response") == expected
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.inner.requests.lock().unwrap().push(request.clone());

        let digest = self.inner.digest.lock().unwrap().clone();
        let path = path_of(&request.url);
        if let Some(credential) = digest {
            if !OPEN_PATHS.contains(&path.as_str()) && !digest_is_valid(request, &credential) {
                return Ok(HttpResponse {
                    status: 401,
                    www_authenticate: Some(CHALLENGE.to_string()),
                    body: "Unauthorized".to_string(),
                });
            }
        }
        self.next_reply(request.method, &path)
    }
}

/// Hands out clones of one [`MockTransport`] and remembers every endpoint.
#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    pub transport: MockTransport,
    endpoints: Arc<Mutex<Vec<DeviceEndpoint>>>,
}

impl MockConnector {
    pub fn new(transport: MockTransport) -> Self {
        MockConnector {
            transport,
            endpoints: Arc::default(),
        }
    }

    pub fn endpoints(&self) -> Vec<DeviceEndpoint> {
        self.endpoints.lock().unwrap().clone()
    }
}

impl Connector for MockConnector {
    type Transport = MockTransport;

    fn connect(&self, endpoint: &DeviceEndpoint) -> Result<MockTransport, TransportError> {
        self.endpoints.lock().unwrap().push(endpoint.clone());
        Ok(self.transport.clone())
    }
}

#[derive(Clone, Default)]
pub(crate) struct RecordingSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl RecordingSink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl TraceSink for RecordingSink {
    fn trace(&self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }
}
