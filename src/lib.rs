//! Find-my-device backend core.
//!
//! - [`hawk`]: Hawk request signing and verification
//! - [`auth`]: single-use nonces and the inbound request guard
//! - [`storage`]: device registry, command queue and position tracker
//!   behind pluggable backends

pub mod auth;
pub mod config;
pub mod error;
pub mod hawk;
pub mod ident;
pub mod observability;
pub mod storage;

pub use error::{FmdError, FmdResult};
