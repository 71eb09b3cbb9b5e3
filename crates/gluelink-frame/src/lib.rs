//! Wire framing for the dispenser controller protocol.
//!
//! This is the protocol layer of gluelink. Every message is framed as:
//! - A 2-byte magic header `0xAA 0x55` for stream synchronization
//! - A 1-byte command code and a 1-byte payload length
//! - The payload (at most 255 bytes)
//! - An additive (1 byte) or CRC16/Modbus (2 bytes, low first) checksum
//! - A 1-byte trailer `0x0D`
//!
//! The [`FrameDecoder`] resynchronizes on arbitrary garbage and never holds
//! more than [`MAX_BUFFER_SIZE`] bytes.

pub mod checksum;
pub mod codec;
pub mod command;
pub mod decoder;
pub mod error;
pub mod payload;
pub mod pool;

pub use checksum::{
    additive, crc16_modbus, frame_integrity, verify_frame, verify_frame_coded, ChecksumFault,
    ChecksumMode, Integrity,
};
pub use codec::{
    encode, encode_frame, Frame, HEADER, HEADER_SIZE, MAX_BUFFER_SIZE, MAX_PAYLOAD,
    MIN_FRAME_SIZE, TRAILER,
};
pub use command::{Command, ErrorCode};
pub use decoder::{DecodeEvent, DecoderConfig, FrameDecoder, FramingFault, ParseStats};
pub use error::{FrameError, PayloadError, PoolError, Result};
pub use payload::{
    epoch_millis, validate_payload, DispenseParams, ErrorReport, Heartbeat, Motion, ParamValue,
    Parameter, Response,
};
pub use pool::{
    BufferPool, PoolConfig, PoolEvent, PoolStats, PooledBuffer, SharedBufferPool, SizeClass,
};
