//! DoH server pipeline (spec section 4.D)
//!
//! Terminates TLS, speaks HTTP/2 directly via `hyper` (no HTTP/1.1 on
//! this side, per spec's non-goals), validates each request, and
//! forwards to the upstream classical resolver.

mod doh;

pub use doh::{DohServer, DohServerConfig};
