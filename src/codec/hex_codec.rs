// src/codec/hex_codec.rs
//
// Hex dump codec. Decode always succeeds; validate never reports.

use super::{
    CodecError, DecodedFrame, EncodeFields, FieldValue, FrameError, FrameField, ProtocolDecoder,
};

/// Format bytes as lowercase hex separated by single spaces.
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Hex codec.
pub struct HexCodec;

impl ProtocolDecoder for HexCodec {
    fn protocol(&self) -> &'static str {
        "hex"
    }

    fn decode(&self, raw: &[u8]) -> Option<DecodedFrame> {
        let mut frame = DecodedFrame::new("hex");
        frame.fields.push(FrameField::new(
            "hex",
            FieldValue::Str(format_hex(raw)),
            raw.to_vec(),
            0,
        ));
        frame.fields.push(FrameField::new(
            "data",
            FieldValue::Bytes(raw.to_vec()),
            raw.to_vec(),
            0,
        ));
        Some(frame)
    }

    fn encode(&self, fields: &EncodeFields) -> Result<Vec<u8>, CodecError> {
        if let Some(value) = fields.get("hex") {
            let text = value.as_str().ok_or_else(|| CodecError::InvalidField {
                field: "hex",
                reason: "expected a string".to_string(),
            })?;
            let stripped: String = text.chars().filter(|c| !c.is_whitespace()).collect();
            if stripped.len() % 2 != 0 {
                return Err(CodecError::InvalidField {
                    field: "hex",
                    reason: format!("odd number of hex digits ({})", stripped.len()),
                });
            }
            return hex::decode(&stripped).map_err(|e| CodecError::InvalidField {
                field: "hex",
                reason: e.to_string(),
            });
        }

        if let Some(value) = fields.get("raw") {
            let data = value.as_bytes().ok_or_else(|| CodecError::InvalidField {
                field: "raw",
                reason: "expected bytes".to_string(),
            })?;
            return Ok(data.to_vec());
        }

        Err(CodecError::MissingRequiredField("hex"))
    }

    fn validate(&self, _raw: &[u8]) -> Option<FrameError> {
        None
    }
}
