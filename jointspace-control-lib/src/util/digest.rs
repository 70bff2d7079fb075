//! HTTP Digest authentication (RFC 2617 / RFC 7616) for JointSpace requests.
//!
//! The TV answers unauthenticated requests with `401` and a `WWW-Authenticate`
//! challenge. The client answers with:
//!   HA1 = H(username:realm:secret)
//!   HA2 = H(method:uri)
//!   response = H(HA1:nonce:nc:cnonce:qop:HA2)
//! or `H(HA1:nonce:HA2)` when the challenge carries no `qop`.

use md5::Md5;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{JointSpaceError, Result};
use crate::util::storage::Credential;
use crate::util::traits::Method;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Md5,
    Sha256,
}

impl Algorithm {
    /// A missing `algorithm` parameter means MD5.
    fn parse(value: Option<&str>) -> Result<Self> {
        match value.map(|v| v.to_ascii_uppercase()) {
            None => Ok(Algorithm::Md5),
            Some(v) if v == "MD5" => Ok(Algorithm::Md5),
            Some(v) if v == "SHA-256" => Ok(Algorithm::Sha256),
            Some(other) => Err(JointSpaceError::Auth(format!(
                "unsupported digest algorithm {}",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Md5 => "MD5",
            Algorithm::Sha256 => "SHA-256",
        }
    }

    fn hash_hex(&self, input: &str) -> String {
        match self {
            Algorithm::Md5 => hex::encode(Md5::digest(input.as_bytes())),
            Algorithm::Sha256 => hex::encode(Sha256::digest(input.as_bytes())),
        }
    }
}

/// A parsed `WWW-Authenticate: Digest ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub realm: String,
    pub nonce: String,
    /// Whether `qop=auth` is in use. `false` means the RFC 2069 form.
    pub qop_auth: bool,
    pub opaque: Option<String>,
    pub algorithm: Algorithm,
    pub stale: bool,
}

impl Challenge {
    pub fn parse(header: &str) -> Result<Self> {
        let header = header.trim();
        let params = match header.split_once(char::is_whitespace) {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("digest") => rest,
            _ => {
                return Err(JointSpaceError::Auth(format!(
                    "expected a Digest challenge, got {:?}",
                    header.split_whitespace().next().unwrap_or("")
                )))
            }
        };

        let mut realm = None;
        let mut nonce = None;
        let mut qop = None;
        let mut opaque = None;
        let mut algorithm = None;
        let mut stale = false;
        for (key, value) in parse_params(params) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "qop" => qop = Some(value),
                "opaque" => opaque = Some(value),
                "algorithm" => algorithm = Some(value),
                "stale" => stale = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }

        let realm =
            realm.ok_or_else(|| JointSpaceError::Auth("challenge without realm".to_string()))?;
        let nonce =
            nonce.ok_or_else(|| JointSpaceError::Auth("challenge without nonce".to_string()))?;
        let algorithm = Algorithm::parse(algorithm.as_deref())?;
        let qop_auth = match qop {
            None => false,
            Some(offered) => {
                if offered
                    .split(',')
                    .any(|q| q.trim().eq_ignore_ascii_case("auth"))
                {
                    true
                } else {
                    return Err(JointSpaceError::Auth(format!(
                        "unsupported qop {:?}",
                        offered
                    )));
                }
            }
        };

        Ok(Challenge {
            realm,
            nonce,
            qop_auth,
            opaque,
            algorithm,
            stale,
        })
    }
}

/// Splits `key=value, key="quoted, value"` pairs. Backslash escapes inside
/// quotes are honoured.
pub(crate) fn parse_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ',' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if key.is_empty() && chars.peek().is_none() {
            break;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'=') {
            chars.next();
            while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
                chars.next();
            }
            if chars.peek() == Some(&'"') {
                chars.next();
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        '"' => break,
                        _ => value.push(c),
                    }
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if c == ',' {
                        break;
                    }
                    value.push(c);
                    chars.next();
                }
                value = value.trim().to_string();
            }
        }
        let key = key.trim().to_string();
        if !key.is_empty() {
            params.push((key, value));
        }
        if chars.peek().is_none() {
            break;
        }
    }
    params
}

/// Computes the `response` field.
pub fn compute_response(
    method: Method,
    uri: &str,
    credential: &Credential,
    challenge: &Challenge,
    nonce_count: u32,
    cnonce: &str,
) -> String {
    let algorithm = challenge.algorithm;
    let ha1 = algorithm.hash_hex(&format!(
        "{}:{}:{}",
        credential.username, challenge.realm, credential.secret
    ));
    let ha2 = algorithm.hash_hex(&format!("{}:{}", method.as_str(), uri));
    if challenge.qop_auth {
        algorithm.hash_hex(&format!(
            "{}:{}:{:08x}:{}:auth:{}",
            ha1, challenge.nonce, nonce_count, cnonce, ha2
        ))
    } else {
        algorithm.hash_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2))
    }
}

/// Builds the complete `Authorization` header value.
pub fn sign(
    method: Method,
    uri: &str,
    credential: &Credential,
    challenge: &Challenge,
    nonce_count: u32,
    cnonce: &str,
) -> String {
    let response = compute_response(method, uri, credential, challenge, nonce_count, cnonce);
    let mut header = format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", algorithm={}, response=\"{}\"",
        credential.username,
        challenge.realm,
        challenge.nonce,
        uri,
        challenge.algorithm.as_str(),
        response
    );
    if challenge.qop_auth {
        header.push_str(&format!(
            ", qop=auth, nc={:08x}, cnonce=\"{}\"",
            nonce_count, cnonce
        ));
    }
    if let Some(opaque) = &challenge.opaque {
        header.push_str(&format!(", opaque=\"{}\"", opaque));
    }
    header
}

pub fn generate_cnonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// The last challenge seen from the device and how often its nonce was used.
#[derive(Debug, Default, Clone)]
pub struct DigestSession {
    challenge: Option<Challenge>,
    nonce_count: u32,
}

impl DigestSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_challenge(&self) -> bool {
        self.challenge.is_some()
    }

    /// Stores a fresh challenge. The nonce count restarts unless the device
    /// handed out the same nonce again.
    pub fn update(&mut self, challenge: Challenge) {
        let same_nonce = self
            .challenge
            .as_ref()
            .is_some_and(|current| current.nonce == challenge.nonce);
        if !same_nonce {
            self.nonce_count = 0;
        }
        self.challenge = Some(challenge);
    }

    pub fn clear(&mut self) {
        self.challenge = None;
        self.nonce_count = 0;
    }

    /// Signs the next request with the cached challenge, or `None` when no
    /// challenge has been seen yet.
    pub fn authorize(&mut self, method: Method, uri: &str, credential: &Credential) -> Option<String> {
        let challenge = self.challenge.as_ref()?;
        self.nonce_count += 1;
        Some(sign(
            method,
            uri,
            credential,
            challenge,
            self.nonce_count,
            &generate_cnonce(),
        ))
    }

    pub fn nonce_count(&self) -> u32 {
        self.nonce_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(username: &str, secret: &str) -> Credential {
        Credential::new(username.to_string(), secret.to_string())
    }

    #[test]
    fn test_rfc2617_md5_vector() {
        let challenge = Challenge::parse(
            r#"Digest realm="testrealm@host.com", qop="auth,auth-int", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", opaque="5ccc069c403ebaf9f0171e9517f40e41""#,
        )
        .unwrap();
        let header = sign(
            Method::Get,
            "/dir/index.html",
            &credential("Mufasa", "Circle Of Life"),
            &challenge,
            1,
            "0a4f113b",
        );
        assert_eq!(
            header,
            "Digest username=\"Mufasa\", realm=\"testrealm@host.com\", \
             nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\", uri=\"/dir/index.html\", \
             algorithm=MD5, response=\"6629fae49393a05397450978507c4ef1\", \
             qop=auth, nc=00000001, cnonce=\"0a4f113b\", \
             opaque=\"5ccc069c403ebaf9f0171e9517f40e41\""
        );
    }

    #[test]
    fn test_rfc7616_md5_and_sha256_vectors() {
        let cred = credential("Mufasa", "Circle of Life");
        let cnonce = "f2/wE4q74E6zIJEtWaHKaf5wv/H5QzzpXusqGemxURZJ";

        let sha256 = Challenge::parse(
            r#"Digest realm="http-auth@example.org", qop="auth, auth-int", algorithm=SHA-256, nonce="7ypf/xlj9XXwfDPEoM4URrv/xwf94BcCAzFZH4GiTo0v", opaque="FQhe/qaU925kfnzjCev0ciny7QMkPqMAFRtzCUYo5tdS""#,
        )
        .unwrap();
        assert_eq!(sha256.algorithm, Algorithm::Sha256);
        assert_eq!(
            compute_response(Method::Get, "/dir/index.html", &cred, &sha256, 1, cnonce),
            "753927fa0e85d155564e2e272a28d1802ca10daf4496794697cf8db5856cb6c1"
        );

        let md5 = Challenge::parse(
            r#"Digest realm="http-auth@example.org", qop="auth, auth-int", algorithm=MD5, nonce="7ypf/xlj9XXwfDPEoM4URrv/xwf94BcCAzFZH4GiTo0v", opaque="FQhe/qaU925kfnzjCev0ciny7QMkPqMAFRtzCUYo5tdS""#,
        )
        .unwrap();
        assert_eq!(
            compute_response(Method::Get, "/dir/index.html", &cred, &md5, 1, cnonce),
            "8ca523f5e9506fed4657c9700eebdbec"
        );
    }

    #[test]
    fn test_no_qop_uses_rfc2069_form() {
        let challenge =
            Challenge::parse(r#"Digest realm="XTV", nonce="abc123""#).unwrap();
        assert!(!challenge.qop_auth);
        let cred = credential("user", "pass");
        let header = sign(Method::Post, "/6/input/key", &cred, &challenge, 1, "ignored");

        let ha1 = Algorithm::Md5.hash_hex("user:XTV:pass");
        let ha2 = Algorithm::Md5.hash_hex("POST:/6/input/key");
        let expected = Algorithm::Md5.hash_hex(&format!("{}:abc123:{}", ha1, ha2));
        assert!(header.contains(&format!("response=\"{}\"", expected)));
        assert!(!header.contains("qop="));
        assert!(!header.contains("cnonce"));
    }

    #[test]
    fn test_rejects_unsupported_challenges() {
        assert!(Challenge::parse(r#"Basic realm="XTV""#).is_err());
        assert!(Challenge::parse(r#"Digest realm="XTV""#).is_err());
        assert!(Challenge::parse(r#"Digest nonce="n""#).is_err());
        assert!(Challenge::parse(r#"Digest realm="XTV", nonce="n", qop="auth-int""#).is_err());
        assert!(
            Challenge::parse(r#"Digest realm="XTV", nonce="n", algorithm=MD5-sess"#).is_err()
        );
    }

    #[test]
    fn test_parse_params_handles_quotes_and_escapes() {
        let params = parse_params(r#"realm="a, \"b\"", nonce=xyz , stale=TRUE"#);
        assert_eq!(
            params,
            vec![
                ("realm".to_string(), "a, \"b\"".to_string()),
                ("nonce".to_string(), "xyz".to_string()),
                ("stale".to_string(), "TRUE".to_string()),
            ]
        );
    }

    #[test]
    fn test_session_nonce_count() {
        let cred = credential("user", "pass");
        let challenge = Challenge::parse(r#"Digest realm="XTV", nonce="n1", qop="auth""#).unwrap();
        let mut session = DigestSession::new();
        assert!(session.authorize(Method::Get, "/6/audio/volume", &cred).is_none());

        session.update(challenge.clone());
        let first = session.authorize(Method::Get, "/6/audio/volume", &cred).unwrap();
        assert!(first.contains("nc=00000001"));
        let second = session.authorize(Method::Get, "/6/audio/volume", &cred).unwrap();
        assert!(second.contains("nc=00000002"));

        // Same nonce again keeps counting.
        session.update(challenge);
        assert_eq!(session.nonce_count(), 2);

        let fresh = Challenge::parse(r#"Digest realm="XTV", nonce="n2", qop="auth""#).unwrap();
        session.update(fresh);
        let third = session.authorize(Method::Get, "/6/audio/volume", &cred).unwrap();
        assert!(third.contains("nc=00000001"));
        assert!(third.contains("nonce=\"n2\""));
    }

    #[test]
    fn test_cnonce_is_fresh() {
        assert_ne!(generate_cnonce(), generate_cnonce());
        assert_eq!(generate_cnonce().len(), 32);
    }
}
