//! OAuth2 Core Components
//!
//! Core infrastructure: HTTP transport and popup correlation.

pub mod pending;
pub mod transport;

pub use pending::*;
pub use transport::*;
