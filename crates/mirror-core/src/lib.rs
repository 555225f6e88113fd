//! Shared primitives for the mirror data cache.
//!
//! This crate provides:
//! - URL canonicalization and matching (`url`)
//! - identity-based object comparison and list merging (`object`)
//! - `DataSourceConfig` - instance configuration
//! - `DataError` - the error surface of every public operation
//! - `EventHandler` and the event/decision types
//! - `Deferred`/`Completion` - one-shot completion primitive
//! - `ActivityGate` - active/inactive gate for outbound requests
//! - `Minimum` - minimum-result arithmetic for list and batch fetches

mod activity;
mod config;
mod deferred;
mod error;
mod event;
mod minimum;
pub mod object;
pub mod url;

pub use activity::ActivityGate;
pub use config::DataSourceConfig;
pub use deferred::{Completion, Deferred};
pub use error::DataError;
pub use event::{
    AuthenticationDecision, AuthenticationEvent, AuthorizationEvent, DeauthorizationEvent,
    EventDecision, EventHandler, HandlerCell,
};
pub use minimum::{resolve_minimum, Minimum};
