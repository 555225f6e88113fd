//! HTTP plumbing for the mirror data cache.
//!
//! This crate provides:
//! - `Transport` - the pluggable fetch function
//! - `HttpAdapter` - logical GET/POST/PUT/DELETE with auth header handling
//! - `AuthCoordinator` - 401 challenges and token scoping
//! - `MockTransport` - scripted transport for development/testing

mod adapter;
mod auth;
pub mod mock;
mod transport;

pub use adapter::HttpAdapter;
pub use auth::AuthCoordinator;
pub use transport::{status_text, FetchRequest, FetchResponse, Method, Transport, TransportError};
