//! An asynchronous, sharded memcache client.
//!
//! Speaks both the textual and binary protocol dialects, pipelines
//! requests per connection with bounded in-flight windows, shards keys
//! across servers with a weighted consistent-hash ring, authenticates
//! with SASL PLAIN on the binary dialect, and reconnects with exponential
//! backoff when servers drop.
//!
//! # Example
//!
//! ```no_run
//! use shoal::{Config, Dialect, MemcacheClient};
//!
//! async fn example() -> Result<(), shoal::Error> {
//!     let config = Config::builder()
//!         .server("127.0.0.1:11211".parse().unwrap())
//!         .server("127.0.0.1:11212".parse().unwrap())
//!         .dialect(Dialect::Binary)
//!         .credential("app", "secret")
//!         .build()?;
//!     let client = MemcacheClient::new(config);
//!     client.await_connected().await?;
//!
//!     client.set("greeting", "hello", 300).await?;
//!     if let Some(value) = client.get("greeting").await? {
//!         assert_eq!(value.data.as_ref(), b"hello");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Failure semantics
//!
//! Every submitted operation resolves exactly once, with a value or a
//! typed [`Error`]. Misses are values (`None`), not errors. Transport
//! failures fail the affected operations immediately and the connection
//! reconnects in the background; authentication failures are terminal for
//! the connection and are never retried with the same credentials.

mod auth;
mod client;
mod config;
mod connection;
mod error;
mod request;
mod router;

pub use auth::Credential;
pub use client::MemcacheClient;
pub use config::{Config, ConfigBuilder, Dialect, ReconnectPolicy};
pub use connection::ConnState;
pub use error::{Error, Result};
pub use request::{GetValue, Reply, Value};

pub use shoal_protocol::MemcacheStatus;
