//! Device and router filtering
//!
//! The device filter is typed free-form by an operator and normalized to the
//! hyphen-grouped form the network server uses for `DevEui`. Router filters
//! come in two policies: exact equality (stream-level pre-filter) and
//! case-insensitive substring containment (presentation-level).

use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

use crate::stream::protocol::{GatewayReport, RouterId};

/// Normalize a device filter to `xx-xx-..` form.
///
/// Non-hex characters are removed and the remaining digits are grouped in
/// pairs. A trailing unpaired nibble is dropped. Case is preserved.
pub fn normalize_device_filter(input: &str) -> String {
    let digits: Vec<char> = input.chars().filter(char::is_ascii_hexdigit).collect();
    digits
        .chunks_exact(2)
        .map(|pair| pair.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}

/// How a router pattern is compared against a router id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouterMatch {
    #[default]
    Exact,
    Contains,
}

impl RouterMatch {
    pub fn matches(self, id: &RouterId, pattern: &str) -> bool {
        match self {
            RouterMatch::Exact => id.as_str() == pattern,
            RouterMatch::Contains => id
                .as_str()
                .to_lowercase()
                .contains(&pattern.to_lowercase()),
        }
    }
}

impl FromStr for RouterMatch {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Ok(RouterMatch::Exact),
            "contains" => Ok(RouterMatch::Contains),
            other => Err(anyhow::anyhow!(
                "unknown router match policy '{}' (expected exact or contains)",
                other
            )),
        }
    }
}

impl fmt::Display for RouterMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterMatch::Exact => write!(f, "exact"),
            RouterMatch::Contains => write!(f, "contains"),
        }
    }
}

/// Stream-level router filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterFilter {
    pub pattern: String,
    pub policy: RouterMatch,
}

/// Acceptance decisions for incoming envelopes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterEngine {
    device: Option<String>,
    router: Option<String>,
    policy: RouterMatch,
}

impl FilterEngine {
    pub fn new(device: Option<&str>, router: Option<&str>, policy: RouterMatch) -> Self {
        let mut engine = Self {
            policy,
            ..Self::default()
        };
        engine.set_device(device);
        engine.set_router(router);
        engine
    }

    /// Set (or clear) the device filter from raw operator input
    pub fn set_device(&mut self, input: Option<&str>) {
        self.device = input
            .map(normalize_device_filter)
            .filter(|normalized| !normalized.is_empty());
    }

    /// Set (or clear) the router pattern; blank input clears it
    pub fn set_router(&mut self, pattern: Option<&str>) {
        self.router = pattern
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);
    }

    pub fn set_policy(&mut self, policy: RouterMatch) {
        self.policy = policy;
    }

    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    pub fn router(&self) -> Option<RouterFilter> {
        self.router.as_ref().map(|pattern| RouterFilter {
            pattern: pattern.clone(),
            policy: self.policy,
        })
    }

    /// Envelope-level device check (case-insensitive)
    pub fn accepts_device(&self, dev_eui: Option<&str>) -> bool {
        match (&self.device, dev_eui) {
            (None, _) => true,
            (Some(filter), Some(dev_eui)) => dev_eui.to_uppercase() == filter.to_uppercase(),
            (Some(_), None) => false,
        }
    }

    /// Apply the router filter to a report batch.
    ///
    /// Returns `None` when a filter is set and nothing survives, meaning the
    /// whole envelope is dropped.
    pub fn retain_reports(&self, reports: &[GatewayReport]) -> Option<Vec<GatewayReport>> {
        let Some(pattern) = &self.router else {
            return Some(reports.to_vec());
        };
        let kept: Vec<GatewayReport> = reports
            .iter()
            .filter(|r| self.policy.matches(&r.router_id, pattern))
            .cloned()
            .collect();
        (!kept.is_empty()).then_some(kept)
    }
}

impl fmt::Display for FilterEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device={}", self.device().unwrap_or("*"))?;
        match self.router() {
            Some(RouterFilter { pattern, policy }) => write!(f, " router={} ({})", pattern, policy),
            None => write!(f, " router=*"),
        }
    }
}
