//! Authenticated Requests
//!
//! The request state machine and its parts:
//!
//! - **Attempt**: the recorded configuration of one logical request, replayed verbatim
//! - **Decision**: classification of a completion into a final result or a corrective action
//! - **Machine**: `AuthenticatedRequest`, which attaches credentials and drives the repairs

pub mod attempt;
pub mod decision;
pub mod machine;

pub use attempt::{append_bearer_token, RecordedCall, RequestAttempt};
pub use decision::{classify, Episode, ResponseFacts, Verdict};
pub use machine::{
    AbortHandle, AuthenticatedRequest, ReadyState, RequestContext, ResponseView,
    RENAME_WWW_AUTHENTICATE,
};
