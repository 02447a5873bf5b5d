//! Request/response types for the payload decode service

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stream::protocol::Telemetry;

/// Unconfirmed data uplink
pub const FRAME_TYPE_UNCONFIRMED: u8 = 2;
/// Confirmed data uplink
pub const FRAME_TYPE_CONFIRMED: u8 = 4;

/// Pre-shared session keys and request options for the decode service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub apps_key: String,
    pub nwks_key: String,
    /// Compare `dClass` directly against `"B"` instead of its JSON text
    pub direct_class_b: bool,
}

/// Body POSTed to the decode service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodeRequest {
    pub frmpayload_hex: String,
    pub dev_addr: String,
    pub apps_key: String,
    pub nwks_key: String,
    /// `null` when the frame counter does not parse
    pub fcnt_up: Option<i64>,
    pub frame_type: u8,
    pub ack: u8,
    pub class_b: u8,
}

impl DecodeRequest {
    /// Build a request for a telemetry envelope; `None` without `FRMPayload`
    pub fn from_telemetry(telemetry: &Telemetry, keys: &SessionKeys) -> Option<Self> {
        let payload = telemetry.frm_payload.as_ref()?;
        Some(Self {
            frmpayload_hex: payload.clone(),
            dev_addr: dev_addr_text(telemetry.dev_addr.as_ref()),
            apps_key: keys.apps_key.clone(),
            nwks_key: keys.nwks_key.clone(),
            fcnt_up: telemetry.fcnt_up.as_ref().and_then(parse_frame_counter),
            frame_type: frame_type(telemetry.confirm),
            ack: 0,
            class_b: class_b(telemetry.device_class.as_ref(), keys.direct_class_b),
        })
    }
}

/// Response from the decode service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DecodeResponse {
    pub phy_payload: Option<String>,
    pub error: Option<String>,
}

impl DecodeResponse {
    pub fn into_result(self) -> anyhow::Result<String> {
        if let Some(error) = self.error {
            anyhow::bail!("decode service error: {}", error);
        }
        self.phy_payload
            .ok_or_else(|| anyhow::anyhow!("decode service response has no phy_payload"))
    }
}

/// A request waiting to be issued, tagged with its issue order
#[derive(Debug, Clone, PartialEq)]
pub struct PendingDecode {
    pub seq: u64,
    pub request: DecodeRequest,
}

/// What the decode service produced for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    Decoded(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeResult {
    pub seq: u64,
    pub outcome: DecodeOutcome,
}

/// The published decode result.
///
/// Results arrive in completion order; only one newer than what is shown
/// replaces it.
#[derive(Debug, Default)]
pub struct DecodeBoard {
    latest: Option<DecodeResult>,
}

impl DecodeBoard {
    /// Returns `true` if the result was published
    pub fn apply(&mut self, result: DecodeResult) -> bool {
        if self.latest.as_ref().is_some_and(|shown| shown.seq >= result.seq) {
            return false;
        }
        self.latest = Some(result);
        true
    }

    pub fn latest(&self) -> Option<&DecodeResult> {
        self.latest.as_ref()
    }
}

/// 2 only for the JSON boolean `false`; anything else (including absent) is 4
pub fn frame_type(confirm: Option<bool>) -> u8 {
    match confirm {
        Some(false) => FRAME_TYPE_UNCONFIRMED,
        _ => FRAME_TYPE_CONFIRMED,
    }
}

/// Class B flag.
///
/// By default the JSON serialization of `dClass` is compared with the bare
/// letter `B`. A JSON string always serializes with quotes, so this is 0 for
/// every string input. `direct` compares the unquoted string instead.
pub fn class_b(device_class: Option<&Value>, direct: bool) -> u8 {
    let is_b = match device_class {
        None => false,
        Some(value) if direct => value.as_str() == Some("B"),
        Some(value) => serde_json::to_string(value).is_ok_and(|text| text == "B"),
    };
    u8::from(is_b)
}

/// Integer prefix of a frame counter.
///
/// Numbers truncate toward zero. Strings accept leading whitespace, an
/// optional sign and the longest run of digits after it.
pub fn parse_frame_counter(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.abs() < i64::MAX as f64)
                .map(|f| f.trunc() as i64)
        }),
        Value::String(s) => {
            let s = s.trim_start();
            let (negative, rest) = match s.as_bytes().first() {
                Some(b'-') => (true, &s[1..]),
                Some(b'+') => (false, &s[1..]),
                _ => (false, s),
            };
            let end = rest
                .bytes()
                .position(|b| !b.is_ascii_digit())
                .unwrap_or(rest.len());
            let magnitude: i64 = rest[..end].parse().ok()?;
            Some(if negative { -magnitude } else { magnitude })
        }
        _ => None,
    }
}

/// `DevAddr` as text: strings verbatim, other values as JSON, absent as empty
pub fn dev_addr_text(dev_addr: Option<&Value>) -> String {
    match dev_addr {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}
