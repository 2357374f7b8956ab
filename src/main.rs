//! DoH Gateway
//!
//! A DNS-over-HTTPS gateway: terminates DoH for classical DNS resolvers
//! (server pipeline) and speaks DoH upstream on behalf of classical
//! stub clients (client pipeline).

mod bootstrap;
mod config;
mod dns;
mod error;
mod log;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    bootstrap::run().await
}
