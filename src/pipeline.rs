//! Frame pipeline: decode → filter → delta → record → forward → publish
//!
//! Frames are handled one at a time. Everything except the decode service
//! round trip completes inside [`Pipeline::handle_frame`]; the forward step
//! only produces a [`PendingDecode`] for the caller to issue.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::decoder::types::{DecodeRequest, PendingDecode, SessionKeys};
use crate::delta::{self, DeltaState, ReportDelta};
use crate::filter::FilterEngine;
use crate::recorder::Recorder;
use crate::stream::protocol::{self, Envelope, PayloadOnly, Telemetry};

/// Latest accepted telemetry batch with deltas
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub dev_eui: Option<String>,
    pub reports: Vec<ReportDelta>,
    pub received_at: DateTime<Utc>,
}

/// What happened to one frame
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// Not decodable; logged and dropped
    Malformed,
    /// Well-formed but without reports or payload
    Ignored,
    /// Rejected by the device or router filter; published state untouched
    Filtered,
    /// Telemetry accepted and published, possibly with a decode request to issue
    Published { forward: Option<PendingDecode> },
    /// Payload-only envelope accepted
    Payload(PayloadOnly),
}

pub struct Pipeline {
    filter: FilterEngine,
    deltas: DeltaState,
    recorder: Recorder,
    keys: Option<SessionKeys>,
    published: Option<Snapshot>,
    next_seq: u64,
}

impl Pipeline {
    /// `keys` enables the forward step; without them nothing is forwarded
    pub fn new(filter: FilterEngine, keys: Option<SessionKeys>) -> Self {
        Self {
            filter,
            deltas: DeltaState::new(),
            recorder: Recorder::new(),
            keys,
            published: None,
            next_seq: 1,
        }
    }

    pub fn handle_frame(&mut self, raw: &str) -> FrameOutcome {
        self.handle_frame_at(raw, Utc::now())
    }

    /// Handle a frame received at `now`
    pub fn handle_frame_at(&mut self, raw: &str, now: DateTime<Utc>) -> FrameOutcome {
        let envelope = match protocol::decode_frame(raw) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                debug!("Frame carries no upinfo or payload, ignoring");
                return FrameOutcome::Ignored;
            }
            Err(e) => {
                warn!("Failed to decode stream frame: {:#}", e);
                debug!("  Raw frame: {}", raw);
                return FrameOutcome::Malformed;
            }
        };

        if !self.filter.accepts_device(envelope.dev_eui()) {
            debug!(
                "DevEui {} does not match filter, keeping previous state",
                envelope.dev_eui().unwrap_or("-")
            );
            return FrameOutcome::Filtered;
        }

        match envelope {
            Envelope::Telemetry(telemetry) => self.accept_telemetry(telemetry, now),
            Envelope::Payload(payload) => FrameOutcome::Payload(payload),
        }
    }

    fn accept_telemetry(&mut self, telemetry: Telemetry, now: DateTime<Utc>) -> FrameOutcome {
        let Some(reports) = self.filter.retain_reports(&telemetry.reports) else {
            debug!(
                "No upinfo entry matches the router filter ({} entries dropped)",
                telemetry.reports.len()
            );
            return FrameOutcome::Filtered;
        };

        let (deltas, next) = delta::update(&reports, &self.deltas);
        self.deltas = next;

        self.recorder.append(&reports, now);

        let forward = self
            .keys
            .as_ref()
            .and_then(|keys| DecodeRequest::from_telemetry(&telemetry, keys))
            .map(|request| {
                let seq = self.next_seq;
                self.next_seq += 1;
                PendingDecode { seq, request }
            });

        self.published = Some(Snapshot {
            dev_eui: telemetry.dev_eui,
            reports: deltas,
            received_at: now,
        });

        FrameOutcome::Published { forward }
    }

    pub fn published(&self) -> Option<&Snapshot> {
        self.published.as_ref()
    }

    pub fn filter(&self) -> &FilterEngine {
        &self.filter
    }

    pub fn filter_mut(&mut self) -> &mut FilterEngine {
        &mut self.filter
    }

    pub fn deltas(&self) -> &DeltaState {
        &self.deltas
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub fn recorder_mut(&mut self) -> &mut Recorder {
        &mut self.recorder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::RouterMatch;
    use crate::stream::protocol::RouterId;
    use chrono::{Duration, TimeZone};

    const DEV: &str = "eb-9b-d6-ac-12-b6-1e-ed";

    fn frame(dev_eui: &str, reports: &[(&str, f64)]) -> String {
        let upinfo: Vec<String> = reports
            .iter()
            .map(|(id, rssi)| format!(r#"{{"routerid":{},"rssi":{},"snr":5.5}}"#, id, rssi))
            .collect();
        format!(
            r#"Received: {{"DevEui":"{}","upinfo":[{}]}}"#,
            dev_eui,
            upinfo.join(",")
        )
    }

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn keys() -> SessionKeys {
        SessionKeys {
            apps_key: "aa".repeat(16),
            nwks_key: "bb".repeat(16),
            direct_class_b: false,
        }
    }

    #[test]
    fn test_end_to_end_delta_and_recording() {
        let filter = FilterEngine::new(Some("EB9BD6AC12B61EED"), None, RouterMatch::Exact);
        let mut pipeline = Pipeline::new(filter, None);
        pipeline.recorder_mut().start();

        let first = pipeline.handle_frame_at(&frame(DEV, &[("9007199254740993", -90.0)]), t0());
        assert_eq!(first, FrameOutcome::Published { forward: None });
        assert_eq!(pipeline.published().unwrap().reports[0].delta, 0.0);

        pipeline.handle_frame_at(
            &frame(DEV, &[("9007199254740993", -85.0)]),
            t0() + Duration::milliseconds(1500),
        );
        let snapshot = pipeline.published().unwrap();
        assert_eq!(snapshot.reports[0].delta, 5.0);
        assert_eq!(snapshot.reports[0].router_id.as_str(), "9007199254740993");

        let samples = pipeline.recorder().samples();
        assert_eq!(samples.len(), 2);
        assert!(samples[0].timestamp < samples[1].timestamp);
    }

    #[test]
    fn test_non_matching_device_keeps_published_state() {
        let filter = FilterEngine::new(Some(DEV), None, RouterMatch::Exact);
        let mut pipeline = Pipeline::new(filter, None);

        pipeline.handle_frame_at(&frame(DEV, &[("1", -70.0)]), t0());
        let before = pipeline.published().cloned();

        let outcome = pipeline.handle_frame_at(&frame("00-00-00-00-00-00-00-01", &[("1", -40.0)]), t0());
        assert_eq!(outcome, FrameOutcome::Filtered);
        assert_eq!(pipeline.published().cloned(), before);
        assert_eq!(pipeline.deltas().previous(&RouterId::parse("1").unwrap()), Some(-70.0));
    }

    #[test]
    fn test_router_filter_emptying_batch_keeps_state() {
        let filter = FilterEngine::new(None, Some("2"), RouterMatch::Exact);
        let mut pipeline = Pipeline::new(filter, None);

        pipeline.handle_frame_at(&frame(DEV, &[("1", -70.0), ("2", -60.0)]), t0());
        let before = pipeline.published().cloned().unwrap();
        assert_eq!(before.reports.len(), 1);

        let outcome = pipeline.handle_frame_at(&frame(DEV, &[("1", -50.0), ("3", -50.0)]), t0());
        assert_eq!(outcome, FrameOutcome::Filtered);
        assert_eq!(pipeline.published(), Some(&before));
        assert_eq!(pipeline.deltas().len(), 1);
    }

    #[test]
    fn test_filter_change_keeps_deltas() {
        let mut pipeline = Pipeline::new(FilterEngine::default(), None);
        pipeline.handle_frame_at(&frame(DEV, &[("1", -80.0)]), t0());

        pipeline.filter_mut().set_device(Some(DEV));
        pipeline.handle_frame_at(&frame(DEV, &[("1", -75.0)]), t0());
        assert_eq!(pipeline.published().unwrap().reports[0].delta, 5.0);
    }

    #[test]
    fn test_forward_requests_are_sequenced() {
        let mut pipeline = Pipeline::new(FilterEngine::default(), Some(keys()));
        let with_payload = r#"{"DevEui":"aa","upinfo":[{"routerid":1,"rssi":-80,"snr":1}],"FRMPayload":"0102","FCntUp":5,"confirm":false}"#;

        let FrameOutcome::Published { forward: Some(first) } = pipeline.handle_frame_at(with_payload, t0()) else {
            panic!("Expected a decode request");
        };
        let FrameOutcome::Published { forward: Some(second) } = pipeline.handle_frame_at(with_payload, t0()) else {
            panic!("Expected a decode request");
        };

        assert_eq!(first.request.frame_type, 2);
        assert_eq!(first.request.fcnt_up, Some(5));
        assert!(second.seq > first.seq);
    }

    #[test]
    fn test_no_forward_without_payload_or_keys() {
        let mut pipeline = Pipeline::new(FilterEngine::default(), Some(keys()));
        assert_eq!(
            pipeline.handle_frame_at(&frame(DEV, &[("1", -80.0)]), t0()),
            FrameOutcome::Published { forward: None }
        );

        let mut pipeline = Pipeline::new(FilterEngine::default(), None);
        let with_payload = r#"{"upinfo":[{"routerid":1,"rssi":-80,"snr":1}],"FRMPayload":"0102"}"#;
        assert_eq!(
            pipeline.handle_frame_at(with_payload, t0()),
            FrameOutcome::Published { forward: None }
        );
    }

    #[test]
    fn test_payload_only_and_rejections() {
        let mut pipeline = Pipeline::new(FilterEngine::new(Some(DEV), None, RouterMatch::Exact), Some(keys()));

        let outcome = pipeline.handle_frame_at(&format!(r#"{{"DevEui":"{}","FRMPayload":"ff"}}"#, DEV), t0());
        assert!(matches!(outcome, FrameOutcome::Payload(ref p) if p.frm_payload == "ff"));

        // no DevEui while a device filter is set
        assert_eq!(pipeline.handle_frame_at(r#"{"FRMPayload":"ff"}"#, t0()), FrameOutcome::Filtered);
        assert_eq!(pipeline.handle_frame_at("Received: {oops", t0()), FrameOutcome::Malformed);
        assert_eq!(pipeline.handle_frame_at(r#"{"stat":{}}"#, t0()), FrameOutcome::Ignored);
        assert!(pipeline.published().is_none());
    }

    #[test]
    fn test_records_only_router_filter_survivors() {
        let filter = FilterEngine::new(None, Some("2"), RouterMatch::Exact);
        let mut pipeline = Pipeline::new(filter, None);
        pipeline.recorder_mut().start();

        pipeline.handle_frame_at(&frame(DEV, &[("1", -70.0), ("2", -60.0), ("3", -65.0)]), t0());
        pipeline.handle_frame_at(&frame(DEV, &[("1", -50.0)]), t0());

        let ids: Vec<&str> = pipeline
            .recorder()
            .samples()
            .iter()
            .map(|s| s.router_id.as_str())
            .collect();
        assert_eq!(ids, vec!["2"]);
        assert_eq!(pipeline.recorder().samples()[0].rssi, Some(-60.0));
    }
}
