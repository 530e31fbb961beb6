//! OAuth2 Flows
//!
//! Interactive authorization-code flow driven through a popup.

pub mod authorization;

pub use authorization::{
    AuthorizationGate, AuthorizationOutcome, AuthorizationPopupFlow, MockPopupLauncher,
    OpenPopup, PopupLauncher, ProceedImmediately, SystemBrowserLauncher,
};
