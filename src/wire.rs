//! Wire format
//!
//! One UDP datagram carries one self-describing JSON snapshot. Unknown fields
//! are ignored on decode so newer relays can add fields without breaking older
//! consumers. The plain-text formats of older forwarders (`"0.734"` for the
//! game, `"0.7340,1"` for the dashboard) are still accepted as unsequenced
//! messages.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FocusError, FocusResult};
use crate::types::{Phase, Role, StreamStatus};

/// Current wire format version
pub const WIRE_VERSION: u32 = 1;

/// Receive buffer size; a snapshot is far below one MTU
pub const MAX_DATAGRAM: usize = 2048;

/// Extra context carried only by dashboard messages
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DashboardSummary {
    /// Threshold the relay scores against, raw power units
    pub raw_threshold: f64,
    /// Downsampled band power the score was derived from
    pub raw_power: f64,
    #[serde(default)]
    pub calibrated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub movement_gate: Option<f64>,
    /// Seconds of calibration left, while the relay is calibrating
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration_remaining: Option<f64>,
}

/// One score snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Format version
    pub v: u32,
    /// Role this variant is meant for
    pub kind: Role,
    /// Relay process that produced the message; `None` for legacy text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<Uuid>,
    /// Per-relay monotonic sequence; `None` for legacy text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Sample timestamp in seconds
    pub ts: f64,
    pub score: f64,
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default)]
    pub status: StreamStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<DashboardSummary>,
}

impl WireMessage {
    /// Whether the relay reports a live upstream
    pub fn is_live(&self) -> bool {
        self.status == StreamStatus::Live
    }

    pub fn encode(&self) -> FocusResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Decode one datagram.
///
/// JSON snapshots are tried first; anything else is parsed as legacy text.
pub fn decode(bytes: &[u8]) -> FocusResult<WireMessage> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| FocusError::DecodeError(format!("not utf-8: {e}")))?
        .trim();

    if text.is_empty() {
        return Err(FocusError::DecodeError("empty datagram".into()));
    }

    let message = if text.starts_with('{') {
        serde_json::from_str::<WireMessage>(text)
            .map_err(|e| FocusError::DecodeError(format!("bad snapshot: {e}")))?
    } else {
        decode_legacy(text)?
    };

    if !message.score.is_finite() || !(0.0..=1.0).contains(&message.score) {
        return Err(FocusError::DecodeError(format!(
            "score out of range: {}",
            message.score
        )));
    }
    if !message.ts.is_finite() {
        return Err(FocusError::DecodeError("non-finite timestamp".into()));
    }
    Ok(message)
}

fn decode_legacy(text: &str) -> FocusResult<WireMessage> {
    let mut parts = text.split(',');
    let score_part = parts.next().unwrap_or_default();
    let score: f64 = score_part
        .trim()
        .parse()
        .map_err(|_| FocusError::DecodeError(format!("unrecognized datagram '{text}'")))?;

    let (kind, ready) = match (parts.next(), parts.next()) {
        (None, _) => (Role::Game, false),
        (Some(flag), None) => match flag.trim() {
            "1" => (Role::Dashboard, true),
            "0" => (Role::Dashboard, false),
            other => {
                return Err(FocusError::DecodeError(format!(
                    "bad ready flag '{other}'"
                )))
            }
        },
        (Some(_), Some(_)) => {
            return Err(FocusError::DecodeError(format!(
                "too many fields in '{text}'"
            )))
        }
    };

    Ok(WireMessage {
        v: 0,
        kind,
        instance: None,
        seq: None,
        ts: 0.0,
        score,
        ready,
        phase: None,
        status: StreamStatus::Live,
        summary: None,
    })
}

/// Consumer -> relay control datagrams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Control {
    /// Register (or refresh) the sender address for `role`
    Hello { role: Role },
}

impl Control {
    pub fn hello(role: Role) -> Self {
        Control::Hello { role }
    }

    pub fn encode(&self) -> FocusResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> FocusResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| FocusError::DecodeError(format!("bad control datagram: {e}")))
    }
}

/// JSON Schema of the snapshot message
pub fn json_schema() -> String {
    let schema = serde_json::json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": "focus-drive snapshot",
        "description": "One score snapshot per UDP datagram; unknown fields are ignored",
        "type": "object",
        "required": ["v", "kind", "ts", "score", "ready"],
        "properties": {
            "v": { "type": "integer", "const": WIRE_VERSION },
            "kind": { "type": "string", "enum": ["game", "dashboard"] },
            "instance": { "type": "string", "format": "uuid" },
            "seq": { "type": "integer", "minimum": 0 },
            "ts": { "type": "number" },
            "score": { "type": "number", "minimum": 0.0, "maximum": 1.0 },
            "ready": { "type": "boolean" },
            "phase": { "type": "string", "enum": ["idle", "calibrating", "racing", "finished"] },
            "status": { "type": "string", "enum": ["live", "disconnected"], "default": "live" },
            "summary": {
                "type": "object",
                "required": ["raw_threshold", "raw_power"],
                "properties": {
                    "raw_threshold": { "type": "number", "exclusiveMinimum": 0.0 },
                    "raw_power": { "type": "number", "minimum": 0.0 },
                    "calibrated": { "type": "boolean" },
                    "decision_threshold": { "type": "number" },
                    "movement_gate": { "type": "number" },
                    "calibration_remaining": { "type": "number" }
                }
            }
        }
    });
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| schema.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn snapshot() -> WireMessage {
        WireMessage {
            v: WIRE_VERSION,
            kind: Role::Dashboard,
            instance: Some(Uuid::new_v4()),
            seq: Some(42),
            ts: 12.5,
            score: 0.75,
            ready: true,
            phase: Some(Phase::Calibrating),
            status: StreamStatus::Live,
            summary: Some(DashboardSummary {
                raw_threshold: 70.0,
                raw_power: 120.0,
                calibrated: false,
                decision_threshold: None,
                movement_gate: None,
                calibration_remaining: Some(4.0),
            }),
        }
    }

    #[test]
    fn test_snapshot_decodes() {
        let message = snapshot();
        let bytes = message.encode().unwrap();
        assert!(bytes.len() < MAX_DATAGRAM);
        assert_eq!(decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let raw = br#"{"v":2,"kind":"game","seq":7,"ts":1.0,"score":0.5,"ready":false,"gear":"turbo"}"#;
        let message = decode(raw).unwrap();
        assert_eq!(message.seq, Some(7));
        assert_eq!(message.kind, Role::Game);
        assert_eq!(message.status, StreamStatus::Live);
        assert!(message.summary.is_none());
    }

    #[test]
    fn test_legacy_game_text() {
        let message = decode(b"0.734").unwrap();
        assert_eq!(message.kind, Role::Game);
        assert_eq!(message.seq, None);
        assert!((message.score - 0.734).abs() < 1e-12);
        assert!(!message.ready);
    }

    #[test]
    fn test_legacy_dashboard_text() {
        let message = decode(b"0.7340,1\n").unwrap();
        assert_eq!(message.kind, Role::Dashboard);
        assert!(message.ready);
        assert!(!decode(b"0.2,0").unwrap().ready);
    }

    #[test]
    fn test_rejects_garbage() {
        let cases: [&[u8]; 9] = [
            b"",
            b"   ",
            b"hello",
            b"0.5,yes",
            b"0.5,1,2",
            b"1.5",
            b"NaN",
            b"{\"v\":1}",
            &[0xff, 0xfe],
        ];
        for raw in cases {
            assert!(
                matches!(decode(raw), Err(FocusError::DecodeError(_))),
                "accepted {raw:?}"
            );
        }
    }

    #[test]
    fn test_hello_format() {
        let bytes = Control::hello(Role::Game).encode().unwrap();
        assert_eq!(
            String::from_utf8(bytes.clone()).unwrap(),
            r#"{"type":"hello","role":"game"}"#
        );
        assert_eq!(Control::decode(&bytes).unwrap(), Control::hello(Role::Game));
        assert!(Control::decode(b"0.5").is_err());
    }

    #[test]
    fn test_schema_is_json() {
        let schema: serde_json::Value = serde_json::from_str(&json_schema()).unwrap();
        assert_eq!(schema["properties"]["v"]["const"], WIRE_VERSION);
    }
}
