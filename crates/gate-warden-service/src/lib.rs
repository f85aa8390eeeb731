//! # Gate Warden Service
//!
//! Production implementations of the collaborator traits declared in
//! `gate-warden-core`, plus the binary entry point (`src/main.rs`) that
//! wires them to the HTTP layer.
//!
//! - [`http_client`]: `reqwest`-backed quality-server REST client
//! - [`credentials`]: literal (configuration-embedded) credential resolver
//!   for development and CI

pub mod credentials;
pub mod http_client;
