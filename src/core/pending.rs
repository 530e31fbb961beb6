//! Pending Authorizations
//!
//! Correlation table routing authorization redirects back to the request that opened the
//! popup. Each open popup owns one slot keyed by a random handle, which travels to the
//! provider as the `state` parameter and comes back on the redirect.

use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

use crate::types::CallbackParams;

/// Identity of one open authorization popup.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PopupHandle(String);

impl PopupHandle {
    /// Generate a fresh random handle.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let bytes: [u8; 32] = rng.gen();
        Self(base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            bytes,
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PopupHandle {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for PopupHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Slots for popups awaiting their redirect.
#[derive(Default)]
pub struct PendingAuthorizations {
    slots: Mutex<HashMap<PopupHandle, oneshot::Sender<CallbackParams>>>,
}

impl PendingAuthorizations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a slot and return its handle plus the receiver the redirect will arrive on.
    pub fn register(&self) -> (PopupHandle, oneshot::Receiver<CallbackParams>) {
        let handle = PopupHandle::generate();
        let (tx, rx) = oneshot::channel();
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.clone(), tx);
        (handle, rx)
    }

    /// Hand a redirect to the slot it belongs to.
    ///
    /// Returns `false` when no open slot matches; the slot of another popup is left untouched.
    pub fn deliver(&self, handle: &PopupHandle, params: CallbackParams) -> bool {
        let sender = self
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(handle);

        match sender {
            Some(sender) => sender.send(params).is_ok(),
            None => false,
        }
    }

    /// Route a redirect by its `state` parameter.
    pub fn deliver_callback(&self, params: CallbackParams) -> bool {
        match params.state.as_deref() {
            Some(state) => {
                let handle = PopupHandle::from(state);
                self.deliver(&handle, params)
            }
            None => false,
        }
    }

    /// Close a slot without delivering anything (timeout or abort).
    pub fn deregister(&self, handle: &PopupHandle) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(handle)
            .is_some()
    }

    /// Whether the slot is still waiting for its redirect.
    pub fn is_pending(&self, handle: &PopupHandle) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(handle)
    }

    /// Number of open slots.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
