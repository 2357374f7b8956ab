//! DNS protocol translation core
//!
//! The dual pipeline this gateway exists for: `server` terminates DoH
//! and forwards to a classical resolver via `upstream`; `client` listens
//! for classical DNS and forwards it upstream as DoH. `message`,
//! `doh_codec`, `framing`, `trust`, and `tls` are the shared primitives
//! both pipelines are built from.

pub mod client;
pub mod doh_codec;
pub mod framing;
pub mod message;
pub mod server;
pub mod tls;
pub mod trust;
pub mod upstream;
