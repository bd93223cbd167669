// src/codec/cobs.rs
//
// Consistent Overhead Byte Stuffing codec.
//
// The encoded representation carries no trailing delimiter byte: framing at
// the transport layer supplies the 0x00 boundary when one is needed.

use super::{
    CodecError, DecodedFrame, EncodeFields, FieldValue, FrameError, FrameField, ProtocolDecoder,
};

/// Longest run of non-zero bytes a single code block can carry.
const MAX_BLOCK: usize = 254;

/// Encode a byte sequence with COBS.
pub fn cobs_encode(data: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(data.len() + 1 + data.len() / MAX_BLOCK);
    let mut code_index = 0;
    encoded.push(0x01);
    let mut code: u8 = 0x01;

    for &byte in data {
        if byte == 0 {
            encoded[code_index] = code;
            code_index = encoded.len();
            encoded.push(0x01);
            code = 0x01;
        } else {
            encoded.push(byte);
            code += 1;
            if code == 0xFF {
                // Full block: emit the 0xFF code and start a new block
                // without consuming an input zero
                encoded[code_index] = code;
                code_index = encoded.len();
                encoded.push(0x01);
                code = 0x01;
            }
        }
    }

    encoded[code_index] = code;
    encoded
}

/// Decode a COBS byte sequence. Returns None for structurally invalid input
/// (zero code byte, or a code block running past the end of the input).
pub fn cobs_decode(data: &[u8]) -> Option<Vec<u8>> {
    let mut decoded = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        let code = data[i];
        if code == 0 {
            return None;
        }
        let block_end = i + code as usize;
        if block_end > data.len() {
            return None;
        }
        decoded.extend_from_slice(&data[i + 1..block_end]);
        i = block_end;
        // A code below 0xFF encodes a zero, except at end of input
        if code < 0xFF && i < data.len() {
            decoded.push(0);
        }
    }

    Some(decoded)
}

/// COBS codec.
pub struct CobsCodec;

impl ProtocolDecoder for CobsCodec {
    fn protocol(&self) -> &'static str {
        "cobs"
    }

    fn decode(&self, raw: &[u8]) -> Option<DecodedFrame> {
        if raw.is_empty() {
            return None;
        }
        let data = cobs_decode(raw)?;

        let mut frame = DecodedFrame::new("cobs");
        frame
            .fields
            .push(FrameField::new("data", FieldValue::Bytes(data.clone()), data, 0));
        Some(frame)
    }

    fn encode(&self, fields: &EncodeFields) -> Result<Vec<u8>, CodecError> {
        let data = fields
            .get("raw")
            .ok_or(CodecError::MissingRequiredField("raw"))?
            .as_bytes()
            .ok_or_else(|| CodecError::InvalidField {
                field: "raw",
                reason: "expected bytes".to_string(),
            })?;
        Ok(cobs_encode(data))
    }

    fn validate(&self, raw: &[u8]) -> Option<FrameError> {
        if raw.is_empty() {
            return Some(FrameError::error("EMPTY_FRAME", "frame has no bytes"));
        }
        if cobs_decode(raw).is_none() {
            return Some(FrameError::error(
                "INVALID_COBS",
                "code byte is zero or runs past end of frame",
            ));
        }
        None
    }
}
