// src/codec/slip.rs
//
// SLIP codec (RFC 1055).
//
// Encode escapes END/ESC in the payload and appends a single trailing END.
// Decode consumes bytes until END or end of input, unescaping as it goes.

use super::{
    CodecError, DecodedFrame, EncodeFields, FieldValue, FrameError, FrameField, ProtocolDecoder,
};

/// Frame delimiter
pub const END: u8 = 0xC0;
/// Escape introducer
pub const ESC: u8 = 0xDB;
/// Escaped END
pub const ESC_END: u8 = 0xDC;
/// Escaped ESC
pub const ESC_ESC: u8 = 0xDD;

/// SLIP-encode a payload, appending one trailing END.
pub fn slip_encode(data: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(data.len() + 1);
    for &byte in data {
        match byte {
            END => {
                encoded.push(ESC);
                encoded.push(ESC_END);
            }
            ESC => {
                encoded.push(ESC);
                encoded.push(ESC_ESC);
            }
            _ => encoded.push(byte),
        }
    }
    encoded.push(END);
    encoded
}

/// SLIP-decode up to the first END (or end of input).
/// Returns None when an ESC is followed by anything other than
/// ESC_END/ESC_ESC, or when the input ends mid-escape.
pub fn slip_decode(data: &[u8]) -> Option<Vec<u8>> {
    let mut decoded = Vec::with_capacity(data.len());
    let mut iter = data.iter();

    while let Some(&byte) = iter.next() {
        match byte {
            END => break,
            ESC => match iter.next() {
                Some(&ESC_END) => decoded.push(END),
                Some(&ESC_ESC) => decoded.push(ESC),
                _ => return None,
            },
            _ => decoded.push(byte),
        }
    }

    Some(decoded)
}

/// SLIP codec.
pub struct SlipCodec;

impl ProtocolDecoder for SlipCodec {
    fn protocol(&self) -> &'static str {
        "slip"
    }

    fn decode(&self, raw: &[u8]) -> Option<DecodedFrame> {
        if raw.is_empty() {
            return None;
        }
        let data = slip_decode(raw)?;

        let mut frame = DecodedFrame::new("slip");
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
        Ok(slip_encode(data))
    }

    fn validate(&self, raw: &[u8]) -> Option<FrameError> {
        if raw.is_empty() {
            return Some(FrameError::error("EMPTY_FRAME", "frame has no bytes"));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn roundtrip(data: &[u8]) {
        let encoded = slip_encode(data);
        // No embedded END before the trailing delimiter
        assert!(!encoded[..encoded.len() - 1].contains(&END));
        assert_eq!(*encoded.last().unwrap(), END);
        assert_eq!(slip_decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_roundtrip_plain() {
        roundtrip(b"hello");
        roundtrip(&[]);
    }

    #[test]
    fn test_roundtrip_specials() {
        roundtrip(&[END]);
        roundtrip(&[ESC]);
        roundtrip(&[0x01, END, 0x02, ESC, 0x03]);
        roundtrip(&[ESC, ESC_END, END, ESC_ESC]);
    }

    #[test]
    fn test_encode_escapes() {
        assert_eq!(slip_encode(&[END]), vec![ESC, ESC_END, END]);
        assert_eq!(slip_encode(&[ESC]), vec![ESC, ESC_ESC, END]);
    }

    #[test]
    fn test_decode_stops_at_end() {
        // Bytes after the first END are not part of this frame
        assert_eq!(
            slip_decode(&[0x01, 0x02, END, 0x03]).unwrap(),
            vec![0x01, 0x02]
        );
    }

    #[test]
    fn test_decode_without_trailing_end() {
        // Exhaustion terminates the frame too
        assert_eq!(slip_decode(&[0x01, 0x02]).unwrap(), vec![0x01, 0x02]);
    }

    #[test]
    fn test_decode_bad_escape() {
        assert!(slip_decode(&[ESC, 0x42]).is_none());
        assert!(slip_decode(&[0x01, ESC]).is_none());
    }

    #[test]
    fn test_validate_empty_only() {
        assert_eq!(SlipCodec.validate(&[]).unwrap().code, "EMPTY_FRAME");
        assert!(SlipCodec.validate(&[ESC, 0x42]).is_none());
        assert!(SlipCodec.validate(&[0x01]).is_none());
    }

    #[test]
    fn test_codec_decode_bad_escape_returns_none() {
        assert!(SlipCodec.decode(&[ESC, 0x42]).is_none());
    }

    #[test]
    fn test_codec_encode() {
        let mut fields = HashMap::new();
        fields.insert("raw".to_string(), FieldValue::Bytes(vec![0x01, END]));
        assert_eq!(
            SlipCodec.encode(&fields).unwrap(),
            vec![0x01, ESC, ESC_END, END]
        );
    }
}
