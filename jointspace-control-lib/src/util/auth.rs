use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha1::Sha1;

use crate::error::{JointSpaceError, Result};

/// Shared pairing secret of the JointSpace v6 firmware.
const SHARED_KEY_GRANT: &str =
    "ZmVay1EQVFOaZhwQ4Kv81ypLAZNczV9sG4KkseXWn1NEk6cXmPKO/MCa9sryslvLCFMnNe4Z4CPXzToowvhHvA==";

const DEVICE_ID_LENGTH: usize = 16;

pub struct Auth;

impl Auth {
    /// Signature for `pair/grant`:
    /// `base64(hex(HMAC-SHA1(shared_key, "<timestamp><pin>")))`.
    ///
    /// The device compares it byte for byte, so the hex digest is lowercase
    /// and there is no separator between timestamp and PIN.
    pub fn make_grant_signature(timestamp: &str, pin: &str) -> Result<String> {
        let key = Self::shared_key()?;
        let mut mac = Hmac::<Sha1>::new_from_slice(&key)
            .map_err(|e| JointSpaceError::Pairing(format!("invalid grant key: {}", e)))?;
        mac.update(timestamp.as_bytes());
        mac.update(pin.as_bytes());
        let digest_hex = hex::encode(mac.finalize().into_bytes());

        Ok(STANDARD.encode(digest_hex.as_bytes()))
    }

    pub fn shared_key() -> Result<Vec<u8>> {
        STANDARD
            .decode(SHARED_KEY_GRANT)
            .map_err(|e| JointSpaceError::Pairing(format!("invalid grant key: {}", e)))
    }

    /// Random alphanumeric identity the device learns during pairing and
    /// later expects as the digest username.
    pub fn generate_device_id() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(DEVICE_ID_LENGTH)
            .map(char::from)
            .collect()
    }
}
