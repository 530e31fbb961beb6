//! Request Attempt
//!
//! Everything the caller configured on one logical request, kept verbatim so the request
//! can be replayed after a corrective action.

use crate::core::HttpMethod;

/// A configuration call made by the caller, in call order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordedCall {
    SetRequestHeader { name: String, value: String },
    OverrideMimeType(String),
}

/// The live state of one logical call.
#[derive(Clone, Debug)]
pub struct RequestAttempt {
    pub method: HttpMethod,
    pub url: String,
    pub asynchronous: bool,
    pub calls: Vec<RecordedCall>,
    pub body: Option<String>,
    pub response_type: Option<String>,
}

impl RequestAttempt {
    pub fn new(method: HttpMethod, url: impl Into<String>, asynchronous: bool) -> Self {
        Self {
            method,
            url: url.into(),
            asynchronous,
            calls: Vec::new(),
            body: None,
            response_type: None,
        }
    }

    pub fn record(&mut self, call: RecordedCall) {
        self.calls.push(call);
    }

    /// Every recorded header in call order, duplicates included.
    pub fn headers(&self) -> Vec<(String, String)> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                RecordedCall::SetRequestHeader { name, value } => {
                    Some((name.clone(), value.clone()))
                }
                RecordedCall::OverrideMimeType(_) => None,
            })
            .collect()
    }

    /// The last MIME override, if any.
    pub fn mime_override(&self) -> Option<&str> {
        self.calls.iter().rev().find_map(|call| match call {
            RecordedCall::OverrideMimeType(mime) => Some(mime.as_str()),
            RecordedCall::SetRequestHeader { .. } => None,
        })
    }
}

/// Append `bearer_token=<token>` to a URL.
pub fn append_bearer_token(url: &str, token: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    let encoded: String = url::form_urlencoded::byte_serialize(token.as_bytes()).collect();
    format!("{}{}bearer_token={}", url, separator, encoded)
}
