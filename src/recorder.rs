//! In-memory sample recording with CSV export

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::stream::protocol::{GatewayReport, RouterId};

pub const CSV_HEADER: &str = "timestamp,routerid,rssi,snr";

/// One recorded gateway report
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSample {
    /// ISO-8601 wall-clock time, millisecond precision, UTC
    pub timestamp: String,
    pub router_id: RouterId,
    pub rssi: Option<f64>,
    pub snr: Option<f64>,
}

/// Session sample buffer.
///
/// Unbounded; cleared only by [`Recorder::start`].
#[derive(Debug, Default)]
pub struct Recorder {
    active: bool,
    samples: Vec<RecordedSample>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh recording, discarding anything buffered
    pub fn start(&mut self) {
        self.samples.clear();
        self.active = true;
    }

    /// Stop appending; the buffer stays available for export
    pub fn stop(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn samples(&self) -> &[RecordedSample] {
        &self.samples
    }

    /// Append a batch in arrival order, all stamped with `at`
    pub fn append(&mut self, reports: &[GatewayReport], at: DateTime<Utc>) {
        if !self.active {
            return;
        }
        let timestamp = at.to_rfc3339_opts(SecondsFormat::Millis, true);
        self.samples
            .extend(reports.iter().map(|report| RecordedSample {
                timestamp: timestamp.clone(),
                router_id: report.router_id.clone(),
                rssi: report.rssi,
                snr: report.snr,
            }));
    }

    /// Serialize the buffer as CSV.
    ///
    /// Fields are written verbatim without quoting; a missing value is an
    /// empty field.
    pub fn export(&self) -> anyhow::Result<String> {
        let mut wtr = csv::WriterBuilder::new()
            .quote_style(csv::QuoteStyle::Never)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());

        wtr.write_record(CSV_HEADER.split(','))?;
        for sample in &self.samples {
            wtr.write_record([
                sample.timestamp.clone(),
                sample.router_id.to_string(),
                field(sample.rssi),
                field(sample.snr),
            ])?;
        }

        let bytes = wtr.into_inner().context("flush csv")?;
        String::from_utf8(bytes).context("csv output is not UTF-8")
    }
}

fn field(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}
