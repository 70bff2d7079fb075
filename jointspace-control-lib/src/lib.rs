//! # JointSpace Control Library for Philips TVs
//!
//! `jointspace-control-lib` drives the local "JointSpace" v6 HTTPS API of
//! Philips televisions. It pairs with a TV once, stores the credential the TV
//! issues, and then signs every remote-control command with HTTP digest
//! authentication.
//!
//! It is meant to sit behind media-center keymaps and shell wrappers that
//! forward a key name or a volume delta.
//!
//! ## Features
//!
//! - PIN based pairing handshake with the TV
//! - Digest-authenticated key presses, volume and input switching
//! - Firmware fallback from `sources/current` to `activities/launch`
//! - Settings and credentials persisted as JSON in a base directory
//!
//! ## Example
//!
//! ```no_run
//! use jointspace_control_lib::control_interface::ReqwestConnector;
//! use jointspace_control_lib::dispatch::{Command, Dispatcher};
//! use jointspace_control_lib::util::storage::CredentialStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = CredentialStore::new(CredentialStore::default_base_dir()?);
//!     let pin = Box::new(|| -> std::io::Result<String> { Ok("1234".to_string()) });
//!     let dispatcher = Dispatcher::new(store, ReqwestConnector::default(), pin);
//!
//!     let outcome = dispatcher
//!         .dispatch(Command::VolumeUp { steps: 2, port: None })
//!         .await?;
//!     println!("{}", outcome);
//!     Ok(())
//! }
//! ```
//!
//! ## Disclaimer
//!
//! This project is not affiliated with, authorized by, endorsed by, or in any way officially connected
//! with Philips, TP Vision or their affiliates.

// The `control_interface` module talks to one TV: it builds URLs, runs the
// digest challenge round, and exposes typed operations such as key presses,
// volume and source switching.
pub mod control_interface;

// The `dispatch` module maps command names and keymap arguments onto
// `control_interface` calls and runs the pairing flow.
pub mod dispatch;

pub mod error;

// Storage, pairing, digest signing and the trait seams used for testing.
pub mod util;
