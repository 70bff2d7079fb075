//! Persistent settings and pairing credentials.
//!
//! Two JSON files live in the base directory:
//! `philips_tv_settings.json` (`{host, port, verbose}`) and
//! `philips_tv_auth.json` (`{username, secret, paired_at}`).

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use derivative::Derivative;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::control_interface::DeviceEndpoint;
use crate::error::{JointSpaceError, Result};

pub const SETTINGS_FILE: &str = "philips_tv_settings.json";
pub const AUTH_FILE: &str = "philips_tv_auth.json";
/// Overrides the storage directory, e.g. to point at a media-center profile.
pub const BASE_DIR_ENV: &str = "PHILIPS_TV_BASE_DIR";
pub const DEFAULT_PORT: u16 = 1926;

fn default_port() -> u16 {
    DEFAULT_PORT
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(alias = "ip", default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub verbose: bool,
    /// `(min, max)` last reported by `GET audio/volume`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_range: Option<(i64, i64)>,
}

impl Settings {
    pub fn new(host: &str, port: u16) -> Self {
        Settings {
            host: host.to_string(),
            port,
            verbose: false,
            volume_range: None,
        }
    }

    /// The endpoint to talk to, with an optional one-off port override.
    pub fn endpoint(&self, port_override: Option<u16>) -> Result<DeviceEndpoint> {
        if self.host.trim().is_empty() {
            return Err(JointSpaceError::NotPaired(
                "settings have no host".to_string(),
            ));
        }
        Ok(DeviceEndpoint::new(
            &self.host,
            port_override.unwrap_or(self.port),
        ))
    }
}

/// Username and secret issued by the TV during pairing.
#[derive(Derivative, Clone, PartialEq, Eq)]
#[derivative(Debug)]
pub struct Credential {
    pub username: String,
    #[derivative(Debug = "ignore")]
    pub secret: String,
}

impl Credential {
    pub fn new(username: String, secret: String) -> Self {
        Credential { username, secret }
    }
}

/// On-disk form of [`Credential`].
#[derive(Derivative, Clone, Serialize, Deserialize)]
#[derivative(Debug)]
struct AuthFile {
    username: String,
    #[serde(alias = "password")]
    #[derivative(Debug = "ignore")]
    secret: String,
    #[serde(alias = "pairedAt", default)]
    paired_at: Option<DateTime<Utc>>,
}

pub struct CredentialStore {
    base_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        CredentialStore {
            base_dir: base_dir.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// `$PHILIPS_TV_BASE_DIR`, else `<config dir>/philips-tv`.
    pub fn default_base_dir() -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os(BASE_DIR_ENV) {
            return Ok(PathBuf::from(dir));
        }
        dirs::config_dir()
            .map(|dir| dir.join("philips-tv"))
            .ok_or_else(|| JointSpaceError::Storage("configuration directory not found".into()))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn settings_path(&self) -> PathBuf {
        self.base_dir.join(SETTINGS_FILE)
    }

    pub fn auth_path(&self) -> PathBuf {
        self.base_dir.join(AUTH_FILE)
    }

    /// Settings are optional for `pair`, so absence is `Ok(None)` here.
    pub fn read_settings(&self) -> Result<Option<Settings>> {
        let path = self.settings_path();
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        let settings = serde_json::from_str(&contents).map_err(|e| {
            JointSpaceError::Storage(format!("failed to parse {}: {}", path.display(), e))
        })?;
        Ok(Some(settings))
    }

    pub fn load_settings(&self) -> Result<Settings> {
        let settings = self
            .read_settings()?
            .ok_or_else(|| JointSpaceError::NotPaired("settings not found".to_string()))?;
        if settings.host.trim().is_empty() {
            return Err(JointSpaceError::NotPaired(
                "settings have no host".to_string(),
            ));
        }
        Ok(settings)
    }

    pub fn load_credential(&self) -> Result<Credential> {
        let path = self.auth_path();
        if !path.exists() {
            return Err(JointSpaceError::NotPaired(
                "credentials not found".to_string(),
            ));
        }
        let contents = fs::read_to_string(&path)?;
        let auth: AuthFile = serde_json::from_str(&contents).map_err(|e| {
            JointSpaceError::Storage(format!("failed to parse {}: {}", path.display(), e))
        })?;
        if auth.username.is_empty() || auth.secret.is_empty() {
            return Err(JointSpaceError::NotPaired(
                "stored credentials are empty".to_string(),
            ));
        }
        Ok(Credential::new(auth.username, auth.secret))
    }

    /// Everything an authenticated command needs.
    pub fn load(&self) -> Result<(Settings, Credential)> {
        let settings = self.load_settings()?;
        let credential = self.load_credential()?;
        Ok((settings, credential))
    }

    /// Persists the result of a successful pairing. The verbose flag of any
    /// existing settings file is kept.
    pub fn save_pairing(&self, host: &str, port: u16, credential: &Credential) -> Result<()> {
        let _guard = self.lock()?;
        let verbose = self
            .read_settings()
            .ok()
            .flatten()
            .map(|s| s.verbose)
            .unwrap_or(false);
        let settings = Settings {
            verbose,
            ..Settings::new(host, port)
        };
        let auth = AuthFile {
            username: credential.username.clone(),
            secret: credential.secret.clone(),
            paired_at: Some(Utc::now()),
        };

        self.write_atomically(vec![
            (self.auth_path(), to_json(&auth)?),
            (self.settings_path(), to_json(&settings)?),
        ])?;
        info!("Saved pairing for {}:{} to {:?}", host, port, self.base_dir);
        Ok(())
    }

    pub fn set_verbose(&self, verbose: bool) -> Result<Settings> {
        let _guard = self.lock()?;
        let mut settings = self.load_settings()?;
        settings.verbose = verbose;
        self.write_atomically(vec![(self.settings_path(), to_json(&settings)?)])?;
        Ok(settings)
    }

    /// Remembers the device volume range so later processes can validate
    /// `volume <n>` without asking the TV first.
    pub fn remember_volume_range(&self, min: i64, max: i64) -> Result<()> {
        let _guard = self.lock()?;
        let mut settings = self.load_settings()?;
        if settings.volume_range == Some((min, max)) {
            return Ok(());
        }
        settings.volume_range = Some((min, max));
        self.write_atomically(vec![(self.settings_path(), to_json(&settings)?)])
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| JointSpaceError::Storage("credential store lock poisoned".into()))
    }

    /// Stages every file next to its target, then renames them into place.
    /// If any rename fails, targets already replaced get their previous
    /// contents back (or are removed if they did not exist), so either all
    /// files change or none do.
    fn write_atomically(&self, files: Vec<(PathBuf, String)>) -> Result<()> {
        fs::create_dir_all(&self.base_dir)?;

        let mut staged = Vec::with_capacity(files.len());
        for (target, contents) in files {
            let previous = if target.is_file() {
                Some(fs::read(&target)?)
            } else {
                None
            };
            let temp = self.stage(contents.as_bytes())?;
            staged.push((temp, target, previous));
        }

        let mut replaced: Vec<(PathBuf, Option<Vec<u8>>)> = Vec::with_capacity(staged.len());
        for (temp, target, previous) in staged {
            if let Err(e) = temp.persist(&target) {
                let err = JointSpaceError::Storage(format!(
                    "failed to write {}: {}",
                    target.display(),
                    e
                ));
                self.roll_back(replaced);
                return Err(err);
            }
            debug!("Wrote {}", target.display());
            replaced.push((target, previous));
        }
        Ok(())
    }

    fn stage(&self, contents: &[u8]) -> Result<NamedTempFile> {
        let mut temp = NamedTempFile::new_in(&self.base_dir)?;
        temp.write_all(contents)?;
        temp.as_file().sync_all()?;
        Ok(temp)
    }

    fn roll_back(&self, replaced: Vec<(PathBuf, Option<Vec<u8>>)>) {
        for (target, previous) in replaced.into_iter().rev() {
            let restored = match previous {
                Some(bytes) => self.stage(&bytes).and_then(|temp| {
                    temp.persist(&target)
                        .map(|_| ())
                        .map_err(|e| JointSpaceError::Storage(e.to_string()))
                }),
                None => fs::remove_file(&target).map_err(JointSpaceError::from),
            };
            match restored {
                Ok(()) => debug!("Restored {}", target.display()),
                Err(e) => warn!("Failed to restore {}: {}", target.display(), e),
            }
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| JointSpaceError::Storage(e.to_string()))
}
