// src/codec/ascii.rs
//
// ASCII text codec. Bytes outside 7-bit ASCII pass through the lossy UTF-8
// conversion; control characters other than tab/LF/CR draw a warning from
// validate.

use super::{
    CodecError, DecodedFrame, EncodeFields, FieldValue, FrameError, FrameField, ProtocolDecoder,
};

/// True for control bytes that are fine in line-oriented text.
fn is_benign_control(byte: u8) -> bool {
    byte == b'\t' || byte == b'\n' || byte == b'\r'
}

/// ASCII codec.
pub struct AsciiCodec;

impl ProtocolDecoder for AsciiCodec {
    fn protocol(&self) -> &'static str {
        "ascii"
    }

    fn decode(&self, raw: &[u8]) -> Option<DecodedFrame> {
        let text = String::from_utf8_lossy(raw).into_owned();

        let mut frame = DecodedFrame::new("ascii");
        frame.fields.push(FrameField::new(
            "text",
            FieldValue::Str(text),
            raw.to_vec(),
            0,
        ));
        Some(frame)
    }

    fn encode(&self, fields: &EncodeFields) -> Result<Vec<u8>, CodecError> {
        let text = fields
            .get("text")
            .ok_or(CodecError::MissingRequiredField("text"))?
            .as_str()
            .ok_or_else(|| CodecError::InvalidField {
                field: "text",
                reason: "expected a string".to_string(),
            })?;
        Ok(text.as_bytes().to_vec())
    }

    fn validate(&self, raw: &[u8]) -> Option<FrameError> {
        if let Some(&byte) = raw
            .iter()
            .find(|&&b| b < 0x20 && !is_benign_control(b))
        {
            return Some(FrameError::warning(
                "NON_PRINTABLE",
                format!("frame contains control byte 0x{:02X}", byte),
            ));
        }
        None
    }
}
