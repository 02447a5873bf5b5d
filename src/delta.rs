//! Per-router RSSI delta tracking
//!
//! The state remembers the last RSSI each router reported for the session.
//! Entries are created on first sighting and overwritten on every accepted
//! batch; nothing is ever removed.

use std::collections::HashMap;

use crate::stream::protocol::{GatewayReport, RouterId};

/// Last observed RSSI per router (`None` when the last value was not numeric)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaState {
    last_rssi: HashMap<RouterId, Option<f64>>,
}

impl DeltaState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Previous numeric RSSI for a router, if any
    pub fn previous(&self, router_id: &RouterId) -> Option<f64> {
        self.last_rssi.get(router_id).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.last_rssi.len()
    }
}

/// A report together with its change since the router's previous report
#[derive(Debug, Clone, PartialEq)]
pub struct ReportDelta {
    pub router_id: RouterId,
    pub rssi: Option<f64>,
    pub snr: Option<f64>,
    /// Signed RSSI change in dB; 0 on first sighting or non-numeric values
    pub delta: f64,
}

/// Compute deltas for a batch against `state` and return the next state.
///
/// Every lookup sees `state` as it was before the batch, so two reports from
/// the same router in one batch are both compared to the older value. The
/// caller commits the returned state before handling the next batch.
pub fn update(reports: &[GatewayReport], state: &DeltaState) -> (Vec<ReportDelta>, DeltaState) {
    let mut next = state.clone();

    let deltas = reports
        .iter()
        .map(|report| {
            let delta = match (report.rssi, state.previous(&report.router_id)) {
                (Some(current), Some(previous)) => current - previous,
                _ => 0.0,
            };
            next.last_rssi.insert(report.router_id.clone(), report.rssi);
            ReportDelta {
                router_id: report.router_id.clone(),
                rssi: report.rssi,
                snr: report.snr,
                delta,
            }
        })
        .collect();

    (deltas, next)
}
