//! Presentation helpers for the published snapshot
//!
//! Ranking table (RSSI descending), chart order (SNR descending), the
//! presentation-level router substring filter, and MAC-style router ids.

use std::cmp::Ordering;

use crate::delta::ReportDelta;
use crate::filter::RouterMatch;
use crate::stream::protocol::RouterId;

/// Router id as `XX:XX:XX:XX:XX:XX` (low 48 bits, upper-case hex)
pub fn router_mac(id: &RouterId) -> String {
    let hex = hex::encode_upper(id.to_be_bytes());
    let padded = format!("{:0>12}", hex);
    let low = &padded[padded.len() - 12..];
    low.as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

/// One row of the ranking table
#[derive(Debug, Clone, PartialEq)]
pub struct RankedRow<'a> {
    pub rank: usize,
    pub router_mac: String,
    pub report: &'a ReportDelta,
}

/// Rows filtered by a case-insensitive substring, strongest RSSI first
pub fn rank_by_rssi<'a>(reports: &'a [ReportDelta], contains: Option<&str>) -> Vec<RankedRow<'a>> {
    let pattern = contains.map(str::trim).filter(|p| !p.is_empty());
    let mut rows: Vec<&ReportDelta> = reports
        .iter()
        .filter(|r| pattern.map_or(true, |p| RouterMatch::Contains.matches(&r.router_id, p)))
        .collect();
    rows.sort_by(|a, b| descending(a.rssi, b.rssi));

    rows.into_iter()
        .enumerate()
        .map(|(i, report)| RankedRow {
            rank: i + 1,
            router_mac: router_mac(&report.router_id),
            report,
        })
        .collect()
}

/// Reports ordered by SNR, highest first
pub fn order_by_snr(reports: &[ReportDelta]) -> Vec<&ReportDelta> {
    let mut rows: Vec<&ReportDelta> = reports.iter().collect();
    rows.sort_by(|a, b| descending(a.snr, b.snr));
    rows
}

// Missing values sort last
fn descending(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.total_cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// `+5`, `-3.5`, `0`
pub fn format_delta(delta: f64) -> String {
    if delta > 0.0 {
        format!("+{}", delta)
    } else if delta == 0.0 {
        "0".to_string()
    } else {
        delta.to_string()
    }
}
