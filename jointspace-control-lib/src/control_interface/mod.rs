use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{DispatchError, JointSpaceError, Result, TransportError};
use crate::util::digest::{Challenge, DigestSession};
use crate::util::storage::Credential;
use crate::util::traits::{
    Connector, HttpRequest, HttpResponse, LogSink, Method, TraceSink, Transport,
};

#[cfg(test)]
pub(crate) mod mock;

/// JointSpace API version spoken by current Philips firmware.
pub const API_VERSION: u8 = 6;
/// Upper bound for connecting to and hearing back from the TV.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub const PATH_INPUT_KEY: &str = "input/key";
pub const PATH_AUDIO_VOLUME: &str = "audio/volume";
pub const PATH_SOURCES_CURRENT: &str = "sources/current";
pub const PATH_ACTIVITIES_LAUNCH: &str = "activities/launch";
pub const PATH_PAIR_REQUEST: &str = "pair/request";
pub const PATH_PAIR_GRANT: &str = "pair/grant";

/// Where the TV listens. Always HTTPS.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceEndpoint {
    pub host: String,
    pub port: u16,
}

impl DeviceEndpoint {
    pub const SCHEME: &'static str = "https";

    pub fn new(host: &str, port: u16) -> Self {
        DeviceEndpoint {
            host: host.trim().to_string(),
            port,
        }
    }

    /// `https://<host>:<port>/6/`
    pub fn base_url(&self) -> String {
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        format!("{}://{}:{}/{}/", Self::SCHEME, host, self.port, API_VERSION)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path.trim_start_matches('/'))
    }

    /// The request-target used in the digest `uri` parameter.
    pub fn uri_path(path: &str) -> String {
        format!("/{}/{}", API_VERSION, path.trim_start_matches('/'))
    }
}

impl fmt::Display for DeviceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Builds [`ReqwestTransport`]s for a paired TV.
#[derive(Debug, Clone, Copy)]
pub struct ReqwestConnector {
    timeout: Duration,
}

impl Default for ReqwestConnector {
    fn default() -> Self {
        ReqwestConnector {
            timeout: REQUEST_TIMEOUT,
        }
    }
}

impl ReqwestConnector {
    pub fn with_timeout(timeout: Duration) -> Self {
        ReqwestConnector { timeout }
    }
}

impl Connector for ReqwestConnector {
    type Transport = ReqwestTransport;

    fn connect(&self, endpoint: &DeviceEndpoint) -> std::result::Result<ReqwestTransport, TransportError> {
        ReqwestTransport::new(&endpoint.host, self.timeout)
    }
}

/// HTTPS transport pinned to a single TV.
///
/// The TV serves a self-signed certificate, so certificate validation is
/// relaxed. The transport refuses to talk to any other host.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    host: String,
}

impl ReqwestTransport {
    pub fn new(host: &str, timeout: Duration) -> std::result::Result<Self, TransportError> {
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build HTTP client: {}", e)))?;
        Ok(ReqwestTransport {
            client,
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
        })
    }

    fn check_host(&self, url: &str) -> std::result::Result<Url, TransportError> {
        let parsed = Url::parse(url).map_err(|e| TransportError::Other(format!("invalid URL {}: {}", url, e)))?;
        let host = parsed
            .host_str()
            .unwrap_or("")
            .trim_start_matches('[')
            .trim_end_matches(']');
        if !host.eq_ignore_ascii_case(&self.host) {
            return Err(TransportError::ForeignHost {
                url: url.to_string(),
                host: self.host.clone(),
            });
        }
        Ok(parsed)
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        let url = self.check_host(&request.url)?;
        let mut builder = match request.method {
            Method::Get => self.client.get(url),
            Method::Post => self.client.post(url),
        };
        builder = builder.header(CONTENT_TYPE, "application/json");
        if let Some(authorization) = &request.authorization {
            builder = builder.header(AUTHORIZATION, authorization);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let challenges: Vec<String> = response
            .headers()
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::to_string)
            .collect();
        // Prefer the Digest challenge if the device offers several schemes.
        let www_authenticate = challenges
            .iter()
            .find(|c| c.trim_start().to_ascii_lowercase().starts_with("digest"))
            .or_else(|| challenges.first())
            .cloned();
        let body = response.text().await.map_err(map_reqwest_error)?;

        Ok(HttpResponse {
            status,
            www_authenticate,
            body,
        })
    }
}

/// Volume as reported by `GET audio/volume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeState {
    #[serde(default)]
    pub current: i64,
    #[serde(default)]
    pub min: i64,
    #[serde(default)]
    pub max: i64,
    #[serde(default)]
    pub muted: bool,
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Volume: {} / {} (muted={})",
            self.current, self.max, self.muted
        )
    }
}

#[derive(Serialize, Debug)]
struct KeyPayload<'a> {
    key: &'a str,
}

#[derive(Serialize, Debug)]
struct SourcePayload<'a> {
    id: &'a str,
}

#[derive(Deserialize, Debug)]
struct CurrentSourceResponse {
    id: Option<Value>,
}

/// Authenticated client for one TV.
///
/// Holds the digest session, so consecutive requests reuse the device's
/// nonce instead of collecting a fresh 401 each time.
pub struct DeviceClient<T: Transport> {
    endpoint: DeviceEndpoint,
    credential: Option<Credential>,
    transport: T,
    session: Mutex<DigestSession>,
    volume_range: Mutex<Option<(i64, i64)>>,
    verbose: bool,
    sink: Arc<dyn TraceSink>,
}

fn locked<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T: Transport> DeviceClient<T> {
    pub fn new(endpoint: DeviceEndpoint, credential: Credential, transport: T) -> Self {
        Self::build(endpoint, Some(credential), transport)
    }

    /// A client without credentials, used for `pair/request`.
    pub fn unauthenticated(endpoint: DeviceEndpoint, transport: T) -> Self {
        Self::build(endpoint, None, transport)
    }

    fn build(endpoint: DeviceEndpoint, credential: Option<Credential>, transport: T) -> Self {
        DeviceClient {
            endpoint,
            credential,
            transport,
            session: Mutex::new(DigestSession::new()),
            volume_range: Mutex::new(None),
            verbose: false,
            sink: Arc::new(LogSink),
        }
    }

    /**
    Routes the request trace to `sink` when `verbose` is set. Otherwise the
    trace only reaches `log::debug!`.
     */
    pub fn with_trace(mut self, verbose: bool, sink: Arc<dyn TraceSink>) -> Self {
        self.verbose = verbose;
        self.sink = sink;
        self
    }

    /// Seeds the range [`Self::set_volume`] validates against, e.g. one
    /// remembered from an earlier process.
    pub fn with_volume_range(self, range: Option<(i64, i64)>) -> Self {
        *locked(&self.volume_range) = range.filter(|(min, max)| max > min);
        self
    }

    /// Swaps the credential, dropping any digest state tied to the old one.
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        locked(&self.session).clear();
        self
    }

    pub fn endpoint(&self) -> &DeviceEndpoint {
        &self.endpoint
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    fn trace(&self, line: String) {
        if self.verbose {
            self.sink.trace(&line);
        } else {
            debug!("{}", line);
        }
    }

    /// Sends a request and decodes the JSON answer. Non-2xx is an
    /// [`JointSpaceError::Api`].
    pub async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let response = self.execute(method, path, body).await?;
        if !response.is_success() {
            return Err(JointSpaceError::Api {
                status: response.status,
                body: response.body,
            });
        }
        if response.body.trim().is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_str(&response.body).map_err(|e| JointSpaceError::Api {
            status: response.status,
            body: format!("invalid JSON ({}): {}", e, response.body),
        })
    }

    /// One logical request: an optional 401 challenge round, then at most
    /// one signed retry.
    async fn execute(&self, method: Method, path: &str, body: Option<Value>) -> Result<HttpResponse> {
        let url = self.endpoint.url(path);
        let uri = DeviceEndpoint::uri_path(path);
        let mut authorization = self
            .credential
            .as_ref()
            .and_then(|credential| locked(&self.session).authorize(method, &uri, credential));
        let mut attempt = 1;

        loop {
            self.trace(format!(
                "-> {} {} (attempt {}, signed={})",
                method,
                url,
                attempt,
                authorization.is_some()
            ));
            let request = HttpRequest {
                method,
                url: url.clone(),
                body: body.clone(),
                authorization: authorization.take(),
            };
            let signed = request.authorization.is_some();
            let response = match self.transport.send(&request).await {
                Ok(response) => response,
                Err(err) => {
                    self.trace(format!("<- {} {} failed: {}", method, url, err));
                    return Err(JointSpaceError::Network(err));
                }
            };
            self.trace(format!("<- {} {} {}", method, url, response.status));

            if response.status != 401 {
                return Ok(response);
            }

            let credential = match &self.credential {
                Some(credential) => credential,
                None => {
                    return Err(JointSpaceError::Auth(format!(
                        "{} requires authentication",
                        path
                    )))
                }
            };
            if attempt > 1 {
                locked(&self.session).clear();
                return Err(JointSpaceError::Auth(format!(
                    "device rejected signed request to {} (HTTP 401)",
                    path
                )));
            }
            let header = response.www_authenticate.as_deref().ok_or_else(|| {
                JointSpaceError::Auth("401 without WWW-Authenticate challenge".to_string())
            })?;
            let challenge = Challenge::parse(header)?;
            if signed && !challenge.stale {
                self.trace(format!("   {} rejected the signed request, re-signing once", url));
            } else {
                self.trace(format!("   {} sent a digest challenge, signing", url));
            }

            authorization = {
                let mut session = locked(&self.session);
                session.update(challenge);
                session.authorize(method, &uri, credential)
            };
            attempt += 1;
        }
    }

    /// Sends a single remote key press.
    pub async fn send_key(&self, key: &str) -> Result<()> {
        self.request(
            Method::Post,
            PATH_INPUT_KEY,
            Some(json!(KeyPayload { key })),
        )
        .await?;
        Ok(())
    }

    /// Sends `count` independent presses of `key`, one request each.
    pub async fn send_key_times(&self, key: &str, count: u32) -> Result<u32> {
        if count == 0 {
            self.trace(format!("Skipping key {}: 0 presses requested", key));
            return Ok(0);
        }
        for _ in 0..count {
            self.send_key(key).await?;
        }
        Ok(count)
    }

    pub async fn get_volume(&self) -> Result<VolumeState> {
        let value = self.request(Method::Get, PATH_AUDIO_VOLUME, None).await?;
        let volume: VolumeState =
            serde_json::from_value(value.clone()).map_err(|e| JointSpaceError::Api {
                status: 200,
                body: format!("unexpected volume payload ({}): {}", e, value),
            })?;
        if volume.max > volume.min {
            *locked(&self.volume_range) = Some((volume.min, volume.max));
        }
        Ok(volume)
    }

    /// The range learned from the last [`Self::get_volume`], or the one
    /// passed to [`Self::with_volume_range`].
    pub fn known_volume_range(&self) -> Option<(i64, i64)> {
        *locked(&self.volume_range)
    }

    /// Sets the absolute volume and unmutes. Levels outside the known range
    /// are rejected without a request; with no known range the TV decides.
    pub async fn set_volume(&self, level: u32) -> Result<()> {
        if let Some((min, max)) = self.known_volume_range() {
            if i64::from(level) < min || i64::from(level) > max {
                return Err(DispatchError::InvalidArgument {
                    argument: "volume",
                    value: level.to_string(),
                    reason: format!("outside the device range {}..={}", min, max),
                }
                .into());
            }
        }
        self.request(
            Method::Post,
            PATH_AUDIO_VOLUME,
            Some(json!({ "current": level, "muted": false })),
        )
        .await?;
        Ok(())
    }

    /// The id of the active source, e.g. `hdmi1`.
    pub async fn get_current_source(&self) -> Result<Option<String>> {
        let value = self.request(Method::Get, PATH_SOURCES_CURRENT, None).await?;
        let current: CurrentSourceResponse = match serde_json::from_value(value) {
            Ok(current) => current,
            Err(_) => return Ok(None),
        };
        Ok(current.id.map(|id| match id {
            Value::String(s) => s,
            other => other.to_string(),
        }))
    }

    /**
    Switches the active source.

    Some firmware answers `sources/current` with 404; those get exactly one
    retry against `activities/launch`. Whatever that returns is final.
     */
    pub async fn switch_source(&self, source_id: &str) -> Result<()> {
        let payload = json!(SourcePayload { id: source_id });
        match self
            .request(Method::Post, PATH_SOURCES_CURRENT, Some(payload.clone()))
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => {
                self.trace(format!(
                    "   {} returned 404, falling back to {}",
                    PATH_SOURCES_CURRENT, PATH_ACTIVITIES_LAUNCH
                ));
                self.request(Method::Post, PATH_ACTIVITIES_LAUNCH, Some(payload))
                    .await?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Inputs are numbered from 1, lower values select HDMI 1.
    pub async fn switch_to_hdmi(&self, input: u32) -> Result<String> {
        let source_id = format!("hdmi{}", input.max(1));
        self.switch_source(&source_id).await?;
        Ok(source_id)
    }
}
