//! Token Management
//!
//! Credential persistence and token acquisition.
//!
//! This module provides:
//!
//! - **Token Storage**: key-value persistence backends
//! - **Credential Store**: the namespaced credential layout on top of a storage backend
//! - **Token Endpoint**: authorization-code and refresh-token exchanges

pub mod credentials;
pub mod endpoint;
pub mod storage;

// Token Storage
pub use storage::{
    create_in_memory_token_storage, create_mock_token_storage, FileTokenStorage,
    InMemoryTokenStorage, MockTokenStorage, TokenStorage,
};

// Credential Store
pub use credentials::CredentialStore;

// Token Endpoint
pub use endpoint::TokenEndpointClient;
