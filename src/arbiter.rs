// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 zenedge contributors
//
// Episode arbitration: one JSON POST per episode carrying the raw IFR and
// its parsed fields, answered with a decision code and optionally a
// recommended model. Without a configured URL the ZENEDGE_ARB_PROFILE
// fallback applies, and with neither the episode keeps the current model.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::ifr::IfrRecord;

pub const ARBITER_TIMEOUT: Duration = Duration::from_secs(2);

/// Arbiter decision codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Decision {
    Keep = 0,
    Promote = 1,
    Reject = 2,
    SafeMode = 3,
}

impl Decision {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Self::Keep),
            1 => Some(Self::Promote),
            2 => Some(Self::Reject),
            3 => Some(Self::SafeMode),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }
}

/// What the arbiter (or a fallback) answered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArbiterResponse {
    pub decision: Option<Decision>,
    pub recommended_model_id: Option<u32>,
    pub profile: Option<Vec<f32>>,
}

/// Ask the arbiter for the next profile decision.
///
/// `url` is `ZENEDGE_ARBITER_URL` (empty disables remote arbitration); the
/// POST carries the raw record base64-encoded next to the parsed fields and
/// times out after two seconds. Failures degrade to the env-var fallback.
pub fn query_next_profile(url: Option<&str>, raw: &[u8], record: &IfrRecord) -> ArbiterResponse {
    if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
        let payload = json!({
            "ifr_b64": BASE64.encode(raw),
            "ifr": record.to_json(),
        });
        match ureq::post(url).timeout(ARBITER_TIMEOUT).send_json(&payload) {
            Ok(resp) => match resp.into_json::<serde_json::Value>() {
                Ok(body) => {
                    let parsed = parse_response(&body);
                    info!(
                        decision = ?parsed.decision,
                        recommended = ?parsed.recommended_model_id,
                        "arbiter answered"
                    );
                    return parsed;
                }
                Err(e) => warn!(error = %e, "arbiter response unreadable"),
            },
            Err(e) => warn!(error = %e, "arbiter request failed"),
        }
    }

    if let Ok(profile_env) = std::env::var("ZENEDGE_ARB_PROFILE") {
        let vals: Vec<f32> = profile_env
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        if !vals.is_empty() {
            return ArbiterResponse {
                profile: Some(vals),
                ..Default::default()
            };
        }
    }

    ArbiterResponse::default()
}

/// On-the-wire reply shape; unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
struct WireReply {
    decision_code: Option<u64>,
    recommended_model_id: Option<u32>,
    profile: Option<Vec<f32>>,
}

fn parse_response(body: &serde_json::Value) -> ArbiterResponse {
    let wire: WireReply = serde_json::from_value(body.clone()).unwrap_or_default();
    ArbiterResponse {
        decision: wire.decision_code.and_then(Decision::from_code),
        recommended_model_id: wire.recommended_model_id,
        profile: wire.profile,
    }
}

// ---------------------------------------------------------------------------
// Model lifecycle state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Baseline,
    Candidate,
}

/// Per-session model lifecycle driven by arbiter decisions.
///
/// Promote makes the current model the new baseline; reject and safe-mode
/// reinstate the baseline; keep changes nothing. A recommended model that
/// differs from the current one becomes the new candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelLifecycle {
    pub state: LifecycleState,
    pub current_model_id: u32,
    pub baseline_model_id: u32,
}

impl ModelLifecycle {
    pub fn new(initial_model_id: u32) -> Self {
        Self {
            state: LifecycleState::Baseline,
            current_model_id: initial_model_id,
            baseline_model_id: initial_model_id,
        }
    }

    /// Apply one arbiter answer; returns the model id now current.
    pub fn apply(&mut self, decision: Decision, recommended: Option<u32>) -> u32 {
        match decision {
            Decision::Promote => {
                self.baseline_model_id = self.current_model_id;
                self.state = LifecycleState::Baseline;
            }
            Decision::Reject | Decision::SafeMode => {
                self.current_model_id = self.baseline_model_id;
                self.state = LifecycleState::Baseline;
            }
            Decision::Keep => {}
        }

        if let Some(rec) = recommended {
            if rec != self.current_model_id {
                self.current_model_id = rec;
                self.state = LifecycleState::Candidate;
            }
        }

        self.current_model_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promote_adopts_current_as_baseline() {
        let mut lc = ModelLifecycle::new(1);
        lc.apply(Decision::Keep, Some(5));
        assert_eq!(lc.state, LifecycleState::Candidate);
        assert_eq!(lc.current_model_id, 5);
        assert_eq!(lc.baseline_model_id, 1);

        lc.apply(Decision::Promote, None);
        assert_eq!(lc.state, LifecycleState::Baseline);
        assert_eq!(lc.baseline_model_id, 5);
        assert_eq!(lc.current_model_id, 5);
    }

    #[test]
    fn reject_reinstates_baseline() {
        let mut lc = ModelLifecycle::new(1);
        lc.apply(Decision::Keep, Some(7));
        assert_eq!(lc.current_model_id, 7);

        lc.apply(Decision::Reject, None);
        assert_eq!(lc.state, LifecycleState::Baseline);
        assert_eq!(lc.current_model_id, 1);
        assert_eq!(lc.baseline_model_id, 1);
    }

    #[test]
    fn safe_mode_rolls_back_like_reject() {
        let mut lc = ModelLifecycle::new(2);
        lc.apply(Decision::Keep, Some(9));
        lc.apply(Decision::SafeMode, None);
        assert_eq!(lc.current_model_id, 2);
        assert_eq!(lc.state, LifecycleState::Baseline);
    }

    #[test]
    fn promote_in_baseline_is_noop() {
        let mut lc = ModelLifecycle::new(3);
        lc.apply(Decision::Promote, None);
        assert_eq!(lc.current_model_id, 3);
        assert_eq!(lc.baseline_model_id, 3);
        assert_eq!(lc.state, LifecycleState::Baseline);
    }

    #[test]
    fn decision_codes_round_trip() {
        for code in 0..4u64 {
            let d = Decision::from_code(code).unwrap();
            assert_eq!(d.code() as u64, code);
        }
        assert!(Decision::from_code(4).is_none());
    }

    #[test]
    fn response_parsing_tolerates_missing_fields() {
        let parsed = parse_response(&serde_json::json!({}));
        assert_eq!(parsed, ArbiterResponse::default());

        let parsed = parse_response(&serde_json::json!({
            "decision_code": 1,
            "recommended_model_id": 12,
            "profile": [0.25, 0.75],
        }));
        assert_eq!(parsed.decision, Some(Decision::Promote));
        assert_eq!(parsed.recommended_model_id, Some(12));
        assert_eq!(parsed.profile, Some(vec![0.25, 0.75]));
    }
}
