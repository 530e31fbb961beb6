//! OAuth2 Types
//!
//! Core type definitions for the request interceptor.

pub mod callback;
pub mod config;
pub mod token;

pub use callback::*;
pub use config::*;
pub use token::*;
