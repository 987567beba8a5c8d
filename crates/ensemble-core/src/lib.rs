//! # Ensemble Core
//!
//! Coordination primitives for agents sharing one workspace: resource locks,
//! durable state documents, an error registry, path partitions and a task
//! board. Every piece of shared state lives under the workspace's state
//! directory; there is no daemon.
//!
//! ## Laws (Compiler Enforced)
//!
//! - No `unwrap()` - returns `Result` instead
//! - No `expect()` - returns `Result` instead
//! - No `panic!()` - returns `Result` instead
//! - No `unsafe` - safe Rust only
//!
//! ## Error Handling
//!
//! All fallible operations return `Result<T, Error>`. Each [`Error`] maps to a
//! process exit code through [`Error::exit_code`].

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod config;
mod error;
pub mod events;
pub mod host;
pub mod ids;
pub mod lock;
pub mod partition;
pub mod registry;
pub mod store;
pub mod sync;
pub mod task;
pub mod workspace;

pub use config::{load_config, EnsembleConfig};
pub use error::{Error, Result};
pub use workspace::Workspace;
