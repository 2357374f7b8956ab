//! DoH client (stub) pipeline (spec section 4.E)
//!
//! Listens for classical DNS on UDP/TCP and forwards each query upstream
//! as DoH over a shared, persistent HTTP/2 session.

mod stub;

pub use stub::{StubConfig, StubPipeline};
