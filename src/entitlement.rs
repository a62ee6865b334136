//! Interface boundary to the local entitlement subsystem.
//!
//! The license/session machinery itself lives in the host; this crate only
//! asks "may this feature run right now" before spending a network round
//! trip, and maps denials to a fixed set of caller-facing reasons.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Fetch,
    Fix,
    Bypass,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialCode {
    NotActivated,
    SessionExpired,
    FeatureDisabled,
    QuotaReached,
}

impl DenialCode {
    pub fn message(&self) -> &'static str {
        match self {
            DenialCode::NotActivated => "Activation Required",
            DenialCode::SessionExpired => "Session Timeout: Re-login",
            DenialCode::FeatureDisabled => "Feature Locked: Upgrade Now",
            DenialCode::QuotaReached => "Daily Limit Reached",
        }
    }
}

pub trait EntitlementGate: Send + Sync {
    fn authorize(&self, feature: Feature) -> Result<(), DenialCode>;
}

/// Gate used when the host runs without licensing, and by tests.
pub struct AllowAll;

impl EntitlementGate for AllowAll {
    fn authorize(&self, _feature: Feature) -> Result<(), DenialCode> {
        Ok(())
    }
}
