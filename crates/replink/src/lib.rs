//! replink: interactive sessions against remote interpreter drivers.
//!
//! A [`Session`] owns one remote driver: it launches it through the
//! embedding process's [`DriverLauncher`], connects an authenticated RPC
//! channel ([`replink_core`]), tracks a per-session state machine, and
//! multiplexes textual statements and opaque binary jobs onto the channel.
//!
//! ```no_run
//! use std::sync::Arc;
//! use replink::{ClientConfig, Session, SessionKind};
//! # use replink::{DriverEndpoint, DriverLauncher, DriverSpec};
//! # struct Launcher;
//! # impl DriverLauncher for Launcher {
//! #     fn launch(&self, _spec: &DriverSpec) -> std::io::Result<DriverEndpoint> {
//! #         unimplemented!()
//! #     }
//! # }
//!
//! # async fn example() {
//! let (client_id, secret) = ClientConfig::generate_credentials();
//! let config = ClientConfig::new(client_id, secret);
//! let session = Session::start(1, "alice", None, SessionKind::Spark, config, Arc::new(Launcher));
//!
//! let mut states = session.state_watch();
//! while !states.borrow_and_update().is_running() {
//!     states.changed().await.unwrap();
//! }
//! let statement = session.execute_statement("1 + 2").unwrap();
//! let outcome = statement.result().await;
//! # let _ = outcome;
//! # }
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod session;

pub use config::ClientConfig;
pub use driver::{DriverEndpoint, DriverLauncher, DriverSpec, SessionKind};
pub use error::SessionError;
pub use session::{JobStatus, Session, SessionState, Statement, RESULT_POLL_INTERVAL};

pub use replink_core::completion::Outcome;
pub use replink_core::message::{JobState, ReplOutcome, StatementResult};
