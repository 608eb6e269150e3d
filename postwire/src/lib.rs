//! Postgres client session core.
//!
//! One [`Session`] owns one backend connection for its entire
//! lifetime. It drives the startup and authentication handshake
//! (cleartext, MD5, or SCRAM-SHA-256 with optional channel binding),
//! serializes queries onto the wire strictly one at a time, and routes
//! every backend message to the single in-flight query.
//!
//! # Examples
//!
//! ```no_run
//! use postwire::{Config, Session};
//!
//! # async fn app() -> postwire::Result<()> {
//! let session = Session::connect_with(
//!     Config::new()
//!         .host("localhost")
//!         .user("postgres")
//!         .password("postgres"),
//! )
//! .await?;
//!
//! let out = session.query("SELECT 420").await?;
//! assert_eq!(out.rows.len(), 1);
//!
//! session.end().await;
//! # Ok(())
//! # }
//! ```

// Protocol
pub mod postgres;
pub mod transport;

// Connect phase
mod auth;
mod pgpass;
mod scram;
mod startup;

// Session
mod cancel;
mod config;
mod query;
mod secret;
mod session;

pub mod error;

pub use config::{Config, ParseError, PasswordProducer, SslMode};
pub use error::{Error, ErrorKind, Result};
pub use query::{Column, Query, QueryJob, QueryOutput, TypeParser, Types};
pub use secret::Secret;
pub use session::{Event, Events, QueryHandle, Session};
pub use transport::PgStream;
