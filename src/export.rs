// src/export.rs
//
// Session log export and import.
//
// CSV: one row per frame with a millisecond timestamp and quoted hex dump.
// JSON: versioned document with nanosecond timestamps as decimal strings,
// pretty-printed with two-space indentation; the same document is parsed
// back for replay.

use crate::codec::{format_hex, DecodedFrame, FrameError};
use crate::io::Direction;
use crate::session::ProtocolFrame;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version written into (and required from) JSON log documents.
pub const LOG_VERSION: &str = "1.0";

/// Error from log import.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to parse log: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unsupported log version: {0} (expected {LOG_VERSION})")]
    BadVersion(String),
    #[error("frame {id} has an invalid timestamp: {value}")]
    BadTimestamp { id: u64, value: String },
}

// ============================================================================
// CSV
// ============================================================================

/// Render the session log as CSV.
/// Header `Timestamp,Direction,Length,Hex`; timestamps are milliseconds,
/// hex is lowercase space-separated in double quotes. LF line endings, no BOM.
pub fn export_csv(frames: &[ProtocolFrame]) -> String {
    let mut out = String::from("Timestamp,Direction,Length,Hex\n");
    for frame in frames {
        let millis = frame.timestamp_ns as f64 / 1_000_000.0;
        out.push_str(&format!(
            "{},{},{},\"{}\"\n",
            millis,
            frame.direction.as_str(),
            frame.raw.len(),
            format_hex(&frame.raw)
        ));
    }
    out
}

// ============================================================================
// JSON
// ============================================================================

#[derive(Serialize, Deserialize)]
struct LogDocument {
    version: String,
    frames: Vec<LogFrame>,
}

#[derive(Serialize, Deserialize)]
struct LogFrame {
    id: u64,
    /// Nanoseconds as a decimal string (u64 range survives every JSON parser)
    timestamp: String,
    direction: Direction,
    raw: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    decoded: Option<DecodedFrame>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    error: Option<FrameError>,
}

/// Render the session log as pretty-printed JSON.
pub fn export_json(frames: &[ProtocolFrame]) -> String {
    let document = LogDocument {
        version: LOG_VERSION.to_string(),
        frames: frames
            .iter()
            .map(|frame| LogFrame {
                id: frame.id,
                timestamp: frame.timestamp_ns.to_string(),
                direction: frame.direction,
                raw: frame.raw.clone(),
                decoded: frame.decoded.clone(),
                error: frame.error.clone(),
            })
            .collect(),
    };
    serde_json::to_string_pretty(&document).unwrap_or_else(|_| String::from("{}"))
}

/// Parse a JSON log document back into protocol frames.
pub fn import_json(text: &str) -> Result<Vec<ProtocolFrame>, ExportError> {
    let document: LogDocument = serde_json::from_str(text)?;
    if document.version != LOG_VERSION {
        return Err(ExportError::BadVersion(document.version));
    }

    document
        .frames
        .into_iter()
        .map(|frame| {
            let timestamp_ns =
                frame
                    .timestamp
                    .parse::<u64>()
                    .map_err(|_| ExportError::BadTimestamp {
                        id: frame.id,
                        value: frame.timestamp.clone(),
                    })?;
            Ok(ProtocolFrame {
                id: frame.id,
                timestamp_ns,
                direction: frame.direction,
                raw: frame.raw,
                decoded: frame.decoded,
                error: frame.error,
            })
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frames() -> Vec<ProtocolFrame> {
        vec![
            ProtocolFrame {
                id: 1,
                timestamp_ns: 1_500_000,
                direction: Direction::Rx,
                raw: vec![0xAA, 0x01, 0xBB],
                decoded: None,
                error: None,
            },
            ProtocolFrame {
                id: 2,
                timestamp_ns: 2_000_000,
                direction: Direction::Tx,
                raw: vec![0x00],
                decoded: None,
                error: None,
            },
        ]
    }

    #[test]
    fn test_csv_layout() {
        let csv = export_csv(&sample_frames());
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "Timestamp,Direction,Length,Hex");
        assert_eq!(lines[1], "1.5,rx,3,\"aa 01 bb\"");
        assert_eq!(lines[2], "2,tx,1,\"00\"");
        // LF endings only
        assert!(!csv.contains('\r'));
        assert!(csv.ends_with('\n'));
    }

    #[test]
    fn test_csv_empty_log() {
        assert_eq!(export_csv(&[]), "Timestamp,Direction,Length,Hex\n");
    }

    #[test]
    fn test_json_shape_and_indentation() {
        let json = export_json(&sample_frames());
        assert!(json.contains("\"version\": \"1.0\""));
        // Nanoseconds exported as decimal strings
        assert!(json.contains("\"timestamp\": \"1500000\""));
        // Two-space indentation
        assert!(json.contains("\n  \"frames\""));

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["frames"][0]["raw"], serde_json::json!([170, 1, 187]));
        assert_eq!(value["frames"][1]["direction"], "tx");
    }

    #[test]
    fn test_json_roundtrip() {
        let frames = sample_frames();
        let restored = import_json(&export_json(&frames)).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].id, frames[0].id);
        assert_eq!(restored[0].timestamp_ns, frames[0].timestamp_ns);
        assert_eq!(restored[0].raw, frames[0].raw);
        assert_eq!(restored[1].direction, Direction::Tx);
    }

    #[test]
    fn test_import_rejects_wrong_version() {
        let text = r#"{"version": "2.0", "frames": []}"#;
        assert!(matches!(
            import_json(text),
            Err(ExportError::BadVersion(v)) if v == "2.0"
        ));
    }

    #[test]
    fn test_import_rejects_bad_timestamp() {
        let text = r#"{
            "version": "1.0",
            "frames": [{"id": 7, "timestamp": "abc", "direction": "rx", "raw": []}]
        }"#;
        assert!(matches!(
            import_json(text),
            Err(ExportError::BadTimestamp { id: 7, .. })
        ));
    }

    #[test]
    fn test_import_full_u64_timestamp() {
        let text = format!(
            r#"{{"version": "1.0", "frames": [{{"id": 1, "timestamp": "{}", "direction": "rx", "raw": [1]}}]}}"#,
            u64::MAX
        );
        let frames = import_json(&text).unwrap();
        assert_eq!(frames[0].timestamp_ns, u64::MAX);
    }
}
