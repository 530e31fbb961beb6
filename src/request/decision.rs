//! Completion Decisions
//!
//! Classification of a completed request into a final result or a corrective action. The
//! rules are evaluated in a fixed priority order over plain facts, so they can be tested
//! without a transport.

use std::collections::HashMap;

use crate::challenge::{parse_challenge, ChallengeParams};
use crate::types::AuthMechanism;

/// What to do with a completed request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Hand the response to the caller.
    Final,
    /// Status 0 while already sending the token as a query parameter.
    NetworkError,
    /// Status 0 while sending a header: record `param` and replay.
    SwitchToParam,
    /// Run the interactive authorization, then replay.
    Authorize,
    /// Drop the access token, refresh it, then replay.
    Refresh,
}

impl Verdict {
    pub fn is_corrective(&self) -> bool {
        matches!(self, Self::SwitchToParam | Self::Authorize | Self::Refresh)
    }
}

/// Inputs of the decision.
#[derive(Clone, Debug, Default)]
pub struct ResponseFacts {
    /// HTTP status, `0` when the transport produced none.
    pub status: u16,
    /// Mechanism in effect for the attempt.
    pub mechanism: Option<AuthMechanism>,
    /// Whether challenge headers could be read.
    pub headers_exposed: bool,
    /// The `Bearer` challenge, when one was present and well-formed.
    pub bearer: Option<ChallengeParams>,
    pub has_refresh_token: bool,
}

impl ResponseFacts {
    /// Gather facts from a response.
    ///
    /// With the `param` mechanism headers are treated as unreadable and never parsed.
    pub fn observe(
        status: u16,
        headers: &HashMap<String, String>,
        challenge_header: &str,
        mechanism: Option<AuthMechanism>,
        supports_request_headers: bool,
        has_refresh_token: bool,
    ) -> Self {
        let (headers_exposed, bearer) = if mechanism == Some(AuthMechanism::Param) {
            (false, None)
        } else {
            let exposed = supports_request_headers || !headers.is_empty();
            let value = headers
                .get(&challenge_header.to_ascii_lowercase())
                .map(String::as_str);
            (exposed, parse_challenge(value, "Bearer"))
        };

        Self {
            status,
            mechanism,
            headers_exposed,
            bearer,
            has_refresh_token,
        }
    }
}

/// Classify a completed request.
pub fn classify(facts: &ResponseFacts) -> Verdict {
    match facts.status {
        0 if facts.mechanism == Some(AuthMechanism::Param) => Verdict::NetworkError,
        0 => Verdict::SwitchToParam,
        401 => classify_unauthorized(facts),
        _ => Verdict::Final,
    }
}

fn classify_unauthorized(facts: &ResponseFacts) -> Verdict {
    let error = facts.bearer.as_ref().and_then(ChallengeParams::error);

    if facts.bearer.is_some() && error.is_none() {
        return Verdict::Authorize;
    }
    if (error == Some("invalid_token") || !facts.headers_exposed) && facts.has_refresh_token {
        return Verdict::Refresh;
    }
    if !facts.headers_exposed && !facts.has_refresh_token {
        return Verdict::Authorize;
    }
    Verdict::Final
}

/// Corrective actions already taken during one `send`.
///
/// Each action runs at most once; asking for it again yields [`Verdict::Final`].
#[derive(Clone, Debug, Default)]
pub struct Episode {
    switched: bool,
    refreshed: bool,
    authorized: bool,
}

impl Episode {
    pub fn permit(&mut self, verdict: Verdict) -> Verdict {
        let used = match verdict {
            Verdict::SwitchToParam => &mut self.switched,
            Verdict::Refresh => &mut self.refreshed,
            Verdict::Authorize => &mut self.authorized,
            Verdict::Final | Verdict::NetworkError => return verdict,
        };
        if *used {
            Verdict::Final
        } else {
            *used = true;
            verdict
        }
    }
}
