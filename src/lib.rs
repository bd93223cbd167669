// src/lib.rs
//
// CommWatch: observe, decode, synthesize and replay byte streams across
// UART, CAN, SPI, I2C and Ethernet transports.
//
// The crate is organised around three layers:
// - io: transport adapters normalizing heterogeneous wire sources into one
//   timestamped chunk stream with per-handle telemetry, plus a simulator
//   engine covering every transport
// - codec: stateless (decode, encode, validate) triples for the supported
//   wire formats, backed by the checksum primitives
// - session: the pipeline tying a live handle to the codecs, the frame log
//   and the event bus

#[macro_use]
pub mod logging;

pub mod bus;
pub mod checksums;
pub mod codec;
pub mod config;
pub mod export;
pub mod io;
pub mod session;

pub use bus::{Event, EventBus, EventKind};
pub use codec::{
    CodecRegistry, DecodedFrame, FrameError, FrameField, ProtocolDecoder, DEFAULT_DECODERS,
};
pub use config::{DeviceConfig, ProtocolConfig, SessionConfig};
pub use io::{
    adapter_for, AdapterHandle, AdapterOpenOptions, AdapterStats, DeviceInfo, DeviceType,
    Direction, IoError, RxMeta, SimulatorConfig, TransportAdapter,
};
pub use session::{ProtocolFrame, SessionPipeline};
