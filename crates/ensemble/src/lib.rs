//! Ensemble CLI library interface
//!
//! Exposes the command tree and handlers so they can be tested without
//! spawning the binary.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]

pub mod cli;
