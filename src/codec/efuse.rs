// src/codec/efuse.rs
//
// EFuse framed protocol codec.
//
// Wire layout:
//   [0xAA][type:u8][length:u16-BE][payload...][crc:u16-BE][0xBB]
//
// The CRC is CRC-16/CCITT-FALSE over type, length and payload (frame bytes 1
// through 4+length, exclusive of the markers and of the CRC itself).
//
// Decode accepts a frame with a wrong CRC and reports it through
// ChecksumInfo.valid; validate independently rejects it with CRC_MISMATCH.
// The two paths are intentionally separate.

use super::{
    ChecksumInfo, CodecError, DecodedFrame, EncodeFields, FieldValue, FrameError, FrameField,
    ProtocolDecoder,
};
use crate::checksums::crc16_ccitt_false;

/// EFuse protocol constants
pub mod constants {
    /// Start-of-frame marker
    pub const START_MARKER: u8 = 0xAA;
    /// End-of-frame marker
    pub const END_MARKER: u8 = 0xBB;
    /// Markers + type + length + CRC
    pub const OVERHEAD: usize = 7;
    /// Shortest possible frame (empty payload)
    pub const MIN_FRAME_LEN: usize = OVERHEAD;
    /// ADC sample payload
    pub const TYPE_ADC: u8 = 0x01;
    /// Status bitfield payload
    pub const TYPE_STATUS: u8 = 0x02;
    /// Configuration word payload
    pub const TYPE_CONFIG: u8 = 0x03;
    /// ADC full-scale reference voltage
    pub const ADC_VREF: f64 = 3.3;
    /// 12-bit ADC full-scale count
    pub const ADC_FULL_SCALE: f64 = 4095.0;
}

/// EFuse framed protocol codec.
pub struct EfuseCodec;

impl EfuseCodec {
    /// Expected total frame length for a declared payload length.
    fn total_len(payload_len: usize) -> usize {
        constants::OVERHEAD + payload_len
    }

    /// Append the typed sub-fields for known payload types.
    fn decode_payload(frame: &mut DecodedFrame, frame_type: u8, payload: &[u8]) {
        use constants::*;

        match frame_type {
            TYPE_ADC if payload.len() >= 2 => {
                let adc_raw = ((payload[0] as u16) << 8) | payload[1] as u16;
                let voltage = adc_raw as f64 * ADC_VREF / ADC_FULL_SCALE;
                frame.fields.push(FrameField::new(
                    "adc_raw",
                    FieldValue::U16(adc_raw),
                    payload[..2].to_vec(),
                    4,
                ));
                frame.fields.push(
                    FrameField::new(
                        "voltage",
                        FieldValue::Str(format!("{:.3}", voltage)),
                        payload[..2].to_vec(),
                        4,
                    )
                    .with_unit(ADC_VREF / ADC_FULL_SCALE, "V"),
                );
            }
            TYPE_STATUS if !payload.is_empty() => {
                let status = payload[0];
                frame.fields.push(FrameField::new(
                    "status",
                    FieldValue::U8(status),
                    vec![status],
                    4,
                ));
                frame.fields.push(FrameField::new(
                    "ready",
                    FieldValue::U8(status & 0x01),
                    vec![status],
                    4,
                ));
                frame.fields.push(FrameField::new(
                    "error",
                    FieldValue::U8((status & 0x02) >> 1),
                    vec![status],
                    4,
                ));
            }
            TYPE_CONFIG if payload.len() >= 4 => {
                let value = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                frame.fields.push(FrameField::new(
                    "config_value",
                    FieldValue::U32(value),
                    payload[..4].to_vec(),
                    4,
                ));
            }
            _ => {}
        }
    }
}

impl ProtocolDecoder for EfuseCodec {
    fn protocol(&self) -> &'static str {
        "efuse"
    }

    fn decode(&self, raw: &[u8]) -> Option<DecodedFrame> {
        use constants::*;

        if raw.len() < MIN_FRAME_LEN {
            return None;
        }
        if raw[0] != START_MARKER || raw[raw.len() - 1] != END_MARKER {
            return None;
        }

        let frame_type = raw[1];
        let declared_len = u16::from_be_bytes([raw[2], raw[3]]) as usize;
        if raw.len() != Self::total_len(declared_len) {
            return None;
        }

        let payload = &raw[4..4 + declared_len];
        let crc_offset = 4 + declared_len;
        let expected = u16::from_be_bytes([raw[crc_offset], raw[crc_offset + 1]]);
        let calculated = crc16_ccitt_false(&raw[1..crc_offset]);

        let mut frame = DecodedFrame::new("efuse");
        frame.fields.push(FrameField::new(
            "type",
            FieldValue::U8(frame_type),
            vec![frame_type],
            1,
        ));
        frame.fields.push(FrameField::new(
            "length",
            FieldValue::U16(declared_len as u16),
            raw[2..4].to_vec(),
            2,
        ));
        frame.fields.push(FrameField::new(
            "payload",
            FieldValue::Bytes(payload.to_vec()),
            payload.to_vec(),
            4,
        ));

        Self::decode_payload(&mut frame, frame_type, payload);

        frame.checksum = Some(ChecksumInfo::new(
            "crc16-ccitt-false",
            expected as u32,
            calculated as u32,
        ));

        Some(frame)
    }

    fn encode(&self, fields: &EncodeFields) -> Result<Vec<u8>, CodecError> {
        use constants::*;

        let frame_type = fields
            .get("type")
            .ok_or(CodecError::MissingRequiredField("type"))?
            .as_u32()
            .ok_or_else(|| CodecError::InvalidField {
                field: "type",
                reason: "expected an integer 0..255".to_string(),
            })?;
        if frame_type > 0xFF {
            return Err(CodecError::InvalidField {
                field: "type",
                reason: format!("{} out of range", frame_type),
            });
        }

        let payload = fields
            .get("payload")
            .ok_or(CodecError::MissingRequiredField("payload"))?
            .as_bytes()
            .ok_or_else(|| CodecError::InvalidField {
                field: "payload",
                reason: "expected bytes".to_string(),
            })?;
        if payload.len() > u16::MAX as usize {
            return Err(CodecError::InvalidField {
                field: "payload",
                reason: format!("{} bytes exceeds u16 length field", payload.len()),
            });
        }

        let mut buf = Vec::with_capacity(Self::total_len(payload.len()));
        buf.push(START_MARKER);
        buf.push(frame_type as u8);
        buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(payload);
        let crc = crc16_ccitt_false(&buf[1..]);
        buf.extend_from_slice(&crc.to_be_bytes());
        buf.push(END_MARKER);

        Ok(buf)
    }

    fn validate(&self, raw: &[u8]) -> Option<FrameError> {
        use constants::*;

        if raw.len() < MIN_FRAME_LEN {
            return Some(FrameError::error(
                "FRAME_TOO_SHORT",
                format!("frame is {} bytes, minimum is {}", raw.len(), MIN_FRAME_LEN),
            ));
        }
        if raw[0] != START_MARKER {
            return Some(FrameError::error(
                "INVALID_START_MARKER",
                format!("expected 0x{:02X}, found 0x{:02X}", START_MARKER, raw[0]),
            ));
        }
        if raw[raw.len() - 1] != END_MARKER {
            return Some(FrameError::error(
                "INVALID_END_MARKER",
                format!(
                    "expected 0x{:02X}, found 0x{:02X}",
                    END_MARKER,
                    raw[raw.len() - 1]
                ),
            ));
        }

        let declared_len = u16::from_be_bytes([raw[2], raw[3]]) as usize;
        if raw.len() != Self::total_len(declared_len) {
            return Some(FrameError::error(
                "LENGTH_MISMATCH",
                format!(
                    "declared payload of {} bytes implies a {}-byte frame, found {}",
                    declared_len,
                    Self::total_len(declared_len),
                    raw.len()
                ),
            ));
        }

        let crc_offset = 4 + declared_len;
        let expected = u16::from_be_bytes([raw[crc_offset], raw[crc_offset + 1]]);
        let calculated = crc16_ccitt_false(&raw[1..crc_offset]);
        if expected != calculated {
            return Some(FrameError::error(
                "CRC_MISMATCH",
                format!("expected 0x{:04X}, calculated 0x{:04X}", expected, calculated),
            ));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn encode_frame(frame_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut fields = HashMap::new();
        fields.insert("type".to_string(), FieldValue::U8(frame_type));
        fields.insert("payload".to_string(), FieldValue::Bytes(payload.to_vec()));
        EfuseCodec.encode(&fields).unwrap()
    }

    #[test]
    fn test_decode_adc_frame() {
        // type 1, length 2, payload 0x0800 -> adc_raw 2048, voltage 1.650 V
        let raw = [0xAA, 0x01, 0x00, 0x02, 0x08, 0x00, 0x5D, 0xAE, 0xBB];
        let frame = EfuseCodec.decode(&raw).unwrap();

        assert_eq!(frame.field("type").unwrap().value, FieldValue::U8(1));
        assert_eq!(frame.field("length").unwrap().value, FieldValue::U16(2));
        assert_eq!(
            frame.field("payload").unwrap().value,
            FieldValue::Bytes(vec![0x08, 0x00])
        );
        assert_eq!(frame.field("adc_raw").unwrap().value, FieldValue::U16(2048));
        assert_eq!(
            frame.field("voltage").unwrap().value,
            FieldValue::Str("1.650".to_string())
        );
        assert!(frame.checksum.as_ref().unwrap().valid);
        assert!(EfuseCodec.validate(&raw).is_none());
    }

    #[test]
    fn test_decode_survives_bad_crc_validate_rejects() {
        // Same ADC frame with the CRC zeroed out
        let raw = [0xAA, 0x01, 0x00, 0x02, 0x08, 0x00, 0x00, 0x00, 0xBB];

        let frame = EfuseCodec.decode(&raw).unwrap();
        assert!(!frame.checksum.as_ref().unwrap().valid);

        let err = EfuseCodec.validate(&raw).unwrap();
        assert_eq!(err.code, "CRC_MISMATCH");
    }

    #[test]
    fn test_length_mismatch() {
        // Declared length 5, actual payload 2
        let raw = [0xAA, 0x01, 0x00, 0x05, 0x08, 0x00, 0x5D, 0xAE, 0xBB];

        assert!(EfuseCodec.decode(&raw).is_none());
        let err = EfuseCodec.validate(&raw).unwrap();
        assert_eq!(err.code, "LENGTH_MISMATCH");
    }

    #[test]
    fn test_validate_check_order() {
        assert_eq!(
            EfuseCodec.validate(&[0xAA, 0x01]).unwrap().code,
            "FRAME_TOO_SHORT"
        );
        assert_eq!(
            EfuseCodec
                .validate(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0xBB])
                .unwrap()
                .code,
            "INVALID_START_MARKER"
        );
        assert_eq!(
            EfuseCodec
                .validate(&[0xAA, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00])
                .unwrap()
                .code,
            "INVALID_END_MARKER"
        );
    }

    #[test]
    fn test_decode_rejects_bad_markers() {
        assert!(EfuseCodec
            .decode(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0xBB])
            .is_none());
        assert!(EfuseCodec
            .decode(&[0xAA, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00])
            .is_none());
        assert!(EfuseCodec.decode(&[0xAA]).is_none());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let raw = encode_frame(0x01, &[0x08, 0x00]);
        assert_eq!(raw, vec![0xAA, 0x01, 0x00, 0x02, 0x08, 0x00, 0x5D, 0xAE, 0xBB]);

        let frame = EfuseCodec.decode(&raw).unwrap();
        assert!(frame.checksum.as_ref().unwrap().valid);
        assert_eq!(
            frame.field("payload").unwrap().value,
            FieldValue::Bytes(vec![0x08, 0x00])
        );
    }

    #[test]
    fn test_encode_empty_payload() {
        let raw = encode_frame(0x7F, &[]);
        assert_eq!(raw.len(), constants::MIN_FRAME_LEN);

        let frame = EfuseCodec.decode(&raw).unwrap();
        assert_eq!(frame.field("type").unwrap().value, FieldValue::U8(0x7F));
        assert!(frame.checksum.as_ref().unwrap().valid);
        assert!(EfuseCodec.validate(&raw).is_none());
    }

    #[test]
    fn test_encode_missing_fields() {
        let mut fields = HashMap::new();
        assert!(matches!(
            EfuseCodec.encode(&fields),
            Err(CodecError::MissingRequiredField("type"))
        ));

        fields.insert("type".to_string(), FieldValue::U8(1));
        assert!(matches!(
            EfuseCodec.encode(&fields),
            Err(CodecError::MissingRequiredField("payload"))
        ));
    }

    #[test]
    fn test_status_payload_bits() {
        let raw = encode_frame(0x02, &[0x03]);
        let frame = EfuseCodec.decode(&raw).unwrap();
        assert_eq!(frame.field("status").unwrap().value, FieldValue::U8(0x03));
        assert_eq!(frame.field("ready").unwrap().value, FieldValue::U8(1));
        assert_eq!(frame.field("error").unwrap().value, FieldValue::U8(1));

        let raw = encode_frame(0x02, &[0x01]);
        let frame = EfuseCodec.decode(&raw).unwrap();
        assert_eq!(frame.field("ready").unwrap().value, FieldValue::U8(1));
        assert_eq!(frame.field("error").unwrap().value, FieldValue::U8(0));
    }

    #[test]
    fn test_config_payload_word() {
        let raw = encode_frame(0x03, &[0x12, 0x34, 0x56, 0x78]);
        let frame = EfuseCodec.decode(&raw).unwrap();
        assert_eq!(
            frame.field("config_value").unwrap().value,
            FieldValue::U32(0x1234_5678)
        );
    }

    #[test]
    fn test_unknown_type_no_extra_fields() {
        let raw = encode_frame(0x42, &[0x01, 0x02]);
        let frame = EfuseCodec.decode(&raw).unwrap();
        // type + length + payload only
        assert_eq!(frame.fields.len(), 3);
    }
}
