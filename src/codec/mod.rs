// src/codec/mod.rs
//
// Unified protocol codec trait and registry.
//
// Each wire format implements the (decode, encode, validate) triple:
// - decode never fails: it returns a structured frame or None
// - encode builds the canonical on-wire bytes from a field map
// - validate reports the first structural problem, independently of decode
//
// Codecs are stateless; a registry maps protocol id -> codec instance.

mod ascii;
mod cobs;
mod efuse;
mod hex_codec;
mod slip;

pub use ascii::AsciiCodec;
pub use cobs::{cobs_decode, cobs_encode, CobsCodec};
pub use efuse::EfuseCodec;
pub use hex_codec::{format_hex, HexCodec};
pub use slip::{slip_decode, slip_encode, SlipCodec};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Field Types
// ============================================================================

/// Semantic type tag for a decoded field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Uint8,
    Uint16,
    Uint32,
    Int8,
    Int16,
    Int32,
    Float,
    String,
    Bytes,
}

/// Typed field value. The variant always matches the field's `FieldType` tag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    U8(u8),
    U16(u16),
    U32(u32),
    I8(i8),
    I16(i16),
    I32(i32),
    F32(f32),
    Str(String),
    Bytes(Vec<u8>),
}

impl FieldValue {
    /// The type tag matching this variant.
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::U8(_) => FieldType::Uint8,
            FieldValue::U16(_) => FieldType::Uint16,
            FieldValue::U32(_) => FieldType::Uint32,
            FieldValue::I8(_) => FieldType::Int8,
            FieldValue::I16(_) => FieldType::Int16,
            FieldValue::I32(_) => FieldType::Int32,
            FieldValue::F32(_) => FieldType::Float,
            FieldValue::Str(_) => FieldType::String,
            FieldValue::Bytes(_) => FieldType::Bytes,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Widen any integer variant to u32 (None for non-integer variants).
    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            FieldValue::U8(v) => Some(v as u32),
            FieldValue::U16(v) => Some(v as u32),
            FieldValue::U32(v) => Some(v),
            FieldValue::I8(v) if v >= 0 => Some(v as u32),
            FieldValue::I16(v) if v >= 0 => Some(v as u32),
            FieldValue::I32(v) if v >= 0 => Some(v as u32),
            _ => None,
        }
    }
}

/// One decoded field: name, typed value, and the raw slice it covers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameField {
    pub name: String,
    pub value: FieldValue,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Raw bytes covering this field
    pub raw: Vec<u8>,
    /// Offset of `raw` into the parent frame
    pub offset: usize,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub scaling: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub unit: Option<String>,
}

impl FrameField {
    /// Plain field without scaling or unit.
    pub fn new(name: &str, value: FieldValue, raw: Vec<u8>, offset: usize) -> Self {
        let field_type = value.field_type();
        FrameField {
            name: name.to_string(),
            value,
            field_type,
            raw,
            offset,
            scaling: None,
            unit: None,
        }
    }

    pub fn with_unit(mut self, scaling: f64, unit: &str) -> Self {
        self.scaling = Some(scaling);
        self.unit = Some(unit.to_string());
        self
    }
}

/// Checksum verification result carried inside a decoded frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChecksumInfo {
    /// Algorithm identifier, e.g. "crc16-ccitt-false"
    pub algorithm: String,
    /// Value extracted from the wire
    pub expected: u32,
    /// Value calculated from the frame data
    pub calculated: u32,
    /// expected == calculated
    pub valid: bool,
}

impl ChecksumInfo {
    pub fn new(algorithm: &str, expected: u32, calculated: u32) -> Self {
        ChecksumInfo {
            algorithm: algorithm.to_string(),
            expected,
            calculated,
            valid: expected == calculated,
        }
    }
}

/// Codec output for one frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecodedFrame {
    pub protocol: String,
    pub fields: Vec<FrameField>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub checksum: Option<ChecksumInfo>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub metadata: HashMap<String, String>,
}

impl DecodedFrame {
    pub fn new(protocol: &str) -> Self {
        DecodedFrame {
            protocol: protocol.to_string(),
            fields: Vec::new(),
            checksum: None,
            metadata: HashMap::new(),
        }
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&FrameField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

// ============================================================================
// Frame Errors
// ============================================================================

/// Severity of a validation finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// A structural problem reported by a codec's validate pass.
/// Attached to a protocol frame without aborting ingestion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameError {
    /// Stable identifier, e.g. "CRC_MISMATCH"
    pub code: String,
    pub message: String,
    pub severity: Severity,
}

impl FrameError {
    pub fn error(code: &'static str, message: impl Into<String>) -> Self {
        FrameError {
            code: code.to_string(),
            message: message.into(),
            severity: Severity::Error,
        }
    }

    pub fn warning(code: &'static str, message: impl Into<String>) -> Self {
        FrameError {
            code: code.to_string(),
            message: message.into(),
            severity: Severity::Warning,
        }
    }
}

// ============================================================================
// Codec Trait
// ============================================================================

/// Named field values handed to `encode`.
pub type EncodeFields = HashMap<String, FieldValue>;

/// Error from a codec's encode path.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("missing-required-field: {0}")]
    MissingRequiredField(&'static str),
    #[error("invalid-field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// The (decode, encode, validate) triple for one wire format.
///
/// Implementations are stateless: every call is a pure function of its input.
pub trait ProtocolDecoder: Send + Sync {
    /// Protocol identifier used in registries and decoded frames.
    fn protocol(&self) -> &'static str;

    /// Structurally parse arbitrary bytes. Total: returns a well-formed frame
    /// or None, never partial garbage.
    fn decode(&self, raw: &[u8]) -> Option<DecodedFrame>;

    /// Build the canonical on-wire representation from a field map.
    fn encode(&self, fields: &EncodeFields) -> Result<Vec<u8>, CodecError>;

    /// Report the first structural problem, or None for well-formed input.
    /// Independent of decode: it may return a specific code even when decode
    /// refuses to produce fields, and vice versa.
    fn validate(&self, raw: &[u8]) -> Option<FrameError>;
}

impl fmt::Debug for dyn ProtocolDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtocolDecoder({})", self.protocol())
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Default decoder order for protocol listings.
pub const DEFAULT_DECODERS: [&str; 5] = ["efuse", "cobs", "slip", "hex", "ascii"];

/// Maps protocol id -> codec instance.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: Vec<(&'static str, Arc<dyn ProtocolDecoder>)>,
}

impl CodecRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        CodecRegistry { codecs: Vec::new() }
    }

    /// Registry with the built-in codecs in default order.
    pub fn with_defaults() -> Self {
        let mut registry = CodecRegistry::new();
        registry.register(Arc::new(EfuseCodec));
        registry.register(Arc::new(CobsCodec));
        registry.register(Arc::new(SlipCodec));
        registry.register(Arc::new(HexCodec));
        registry.register(Arc::new(AsciiCodec));
        registry
    }

    /// Register a codec under its protocol id. Replaces any existing entry.
    pub fn register(&mut self, codec: Arc<dyn ProtocolDecoder>) {
        let id = codec.protocol();
        if let Some(slot) = self.codecs.iter_mut().find(|(name, _)| *name == id) {
            slot.1 = codec;
        } else {
            self.codecs.push((id, codec));
        }
    }

    pub fn get(&self, protocol: &str) -> Option<Arc<dyn ProtocolDecoder>> {
        self.codecs
            .iter()
            .find(|(name, _)| *name == protocol)
            .map(|(_, codec)| codec.clone())
    }

    /// Protocol ids in registration order.
    pub fn protocols(&self) -> Vec<&'static str> {
        self.codecs.iter().map(|(name, _)| *name).collect()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        CodecRegistry::with_defaults()
    }
}

// ============================================================================
// Tests
// ============================================================================
