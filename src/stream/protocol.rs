//! Uplink stream frame format
//!
//! The network server pushes UTF-8 text frames over one WebSocket channel.
//! Each frame is optionally prefixed with the literal `Received:` and
//! carries a single JSON document in one of two shapes:
//!
//! - telemetry: `{"DevEui": .., "upinfo": [{"routerid": .., "rssi": .., "snr": ..}], ...}`
//! - payload-only: `{"DevEui"?: .., "FRMPayload": ..}`
//!
//! Router ids are 64-bit (or wider) gateway identifiers. serde_json is built
//! with `arbitrary_precision` so they are read from the original digits and
//! never pass through an `f64`. They are gateway EUIs and therefore
//! non-negative; a negative `routerid` makes the frame malformed.

use anyhow::{anyhow, bail, Context};
use serde_json::{Map, Value};
use std::fmt;

/// Literal prefix some servers put in front of every frame
pub const FRAME_PREFIX: &str = "Received:";

/// Exact gateway (router) identifier, stored as canonical decimal digits
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouterId(String);

impl RouterId {
    /// Parse a non-negative decimal integer of any width.
    ///
    /// Leading zeros are stripped so that numerically equal ids compare equal.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let digits = text.trim();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            bail!("router id is not a non-negative integer: {:?}", text);
        }
        let canonical = digits.trim_start_matches('0');
        Ok(Self(if canonical.is_empty() {
            "0".to_string()
        } else {
            canonical.to_string()
        }))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Big-endian bytes of the id (no leading zero bytes, `[0]` for zero)
    pub fn to_be_bytes(&self) -> Vec<u8> {
        // Little-endian accumulator, multiplied by ten per decimal digit
        let mut acc: Vec<u8> = vec![0];
        for digit in self.0.bytes().map(|b| u32::from(b - b'0')) {
            let mut carry = digit;
            for byte in acc.iter_mut() {
                let v = u32::from(*byte) * 10 + carry;
                *byte = (v & 0xFF) as u8;
                carry = v >> 8;
            }
            while carry > 0 {
                acc.push((carry & 0xFF) as u8);
                carry >>= 8;
            }
        }
        acc.reverse();
        acc
    }

    fn from_json(value: &Value) -> anyhow::Result<Self> {
        match value {
            // With arbitrary_precision this is the literal text from the frame
            Value::Number(n) => Self::parse(&n.to_string()),
            Value::String(s) => Self::parse(s),
            other => Err(anyhow!("routerid has unexpected type: {}", other)),
        }
    }
}

impl fmt::Display for RouterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One gateway's reception of an uplink (an `upinfo` entry)
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayReport {
    pub router_id: RouterId,
    /// RSSI in dBm; `None` when missing or not numeric
    pub rssi: Option<f64>,
    /// SNR in dB; `None` when missing or not numeric
    pub snr: Option<f64>,
}

/// Shape A: telemetry envelope with at least one gateway report
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    pub dev_eui: Option<String>,
    /// `DevAddr` exactly as received (string or number depending on server)
    pub dev_addr: Option<Value>,
    pub frm_payload: Option<String>,
    /// `FCntUp` exactly as received (string or number)
    pub fcnt_up: Option<Value>,
    /// `confirm` when it is a JSON boolean, otherwise `None`
    pub confirm: Option<bool>,
    /// `dClass` exactly as received
    pub device_class: Option<Value>,
    pub reports: Vec<GatewayReport>,
}

/// Shape B: payload-only envelope
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadOnly {
    pub dev_eui: Option<String>,
    pub frm_payload: String,
}

/// A decoded stream frame carrying actionable data
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Telemetry(Telemetry),
    Payload(PayloadOnly),
}

impl Envelope {
    pub fn dev_eui(&self) -> Option<&str> {
        match self {
            Envelope::Telemetry(t) => t.dev_eui.as_deref(),
            Envelope::Payload(p) => p.dev_eui.as_deref(),
        }
    }
}

/// Which shape a frame's fields describe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Telemetry,
    PayloadOnly,
    Empty,
}

/// Classify a document by field presence.
///
/// A non-empty `upinfo` array wins; otherwise a string `FRMPayload` makes it
/// payload-only; anything else carries nothing we act on.
pub fn classify(fields: &Map<String, Value>) -> Shape {
    let has_reports = fields
        .get("upinfo")
        .and_then(Value::as_array)
        .is_some_and(|reports| !reports.is_empty());
    if has_reports {
        Shape::Telemetry
    } else if fields.get("FRMPayload").and_then(Value::as_str).is_some() {
        Shape::PayloadOnly
    } else {
        Shape::Empty
    }
}

/// Strip the optional `Received:` prefix
pub fn strip_prefix(raw: &str) -> &str {
    match raw.strip_prefix(FRAME_PREFIX) {
        Some(rest) => rest.trim(),
        None => raw,
    }
}

/// Decode a raw text frame.
///
/// Returns `Ok(None)` for well-formed documents with nothing to act on
/// (gateway status and the like); malformed frames are errors.
pub fn decode_frame(raw: &str) -> anyhow::Result<Option<Envelope>> {
    let body = strip_prefix(raw);
    let document: Value = serde_json::from_str(body).context("invalid JSON in stream frame")?;
    let Value::Object(fields) = document else {
        bail!("stream frame is not a JSON object");
    };

    match classify(&fields) {
        Shape::Telemetry => Ok(Some(Envelope::Telemetry(decode_telemetry(&fields)?))),
        Shape::PayloadOnly => Ok(Some(Envelope::Payload(PayloadOnly {
            dev_eui: string_field(&fields, "DevEui"),
            frm_payload: string_field(&fields, "FRMPayload").unwrap_or_default(),
        }))),
        Shape::Empty => Ok(None),
    }
}

fn decode_telemetry(fields: &Map<String, Value>) -> anyhow::Result<Telemetry> {
    let entries = fields
        .get("upinfo")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("telemetry frame without upinfo"))?;

    let reports = entries
        .iter()
        .enumerate()
        .map(|(i, entry)| decode_report(entry).with_context(|| format!("upinfo[{}]", i)))
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(Telemetry {
        dev_eui: string_field(fields, "DevEui"),
        dev_addr: fields.get("DevAddr").cloned(),
        frm_payload: string_field(fields, "FRMPayload"),
        fcnt_up: fields.get("FCntUp").cloned(),
        confirm: fields.get("confirm").and_then(Value::as_bool),
        device_class: fields.get("dClass").cloned(),
        reports,
    })
}

fn decode_report(entry: &Value) -> anyhow::Result<GatewayReport> {
    let router_id = entry
        .get("routerid")
        .ok_or_else(|| anyhow!("missing routerid"))
        .and_then(RouterId::from_json)?;

    Ok(GatewayReport {
        router_id,
        rssi: entry.get("rssi").and_then(numeric),
        snr: entry.get("snr").and_then(numeric),
    })
}

/// Numeric coercion for signal fields: numbers and numeric strings, finite only
fn numeric(value: &Value) -> Option<f64> {
    let v = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    v.is_finite().then_some(v)
}

fn string_field(fields: &Map<String, Value>, key: &str) -> Option<String> {
    fields.get(key).and_then(Value::as_str).map(str::to_string)
}
