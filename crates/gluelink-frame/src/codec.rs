use bytes::{BufMut, Bytes, BytesMut};

use crate::checksum::ChecksumMode;
use crate::command::Command;
use crate::error::{FrameError, Result};

/// Magic header: 0xAA 0x55.
pub const HEADER: [u8; 2] = [0xAA, 0x55];
pub const HEADER_SIZE: usize = 2;

/// Frame trailer (carriage return).
pub const TRAILER: u8 = 0x0D;
pub const TRAILER_SIZE: usize = 1;

/// The length field is one byte.
pub const MAX_PAYLOAD: usize = 255;

/// Smallest possible frame (additive checksum, empty payload).
pub const MIN_FRAME_SIZE: usize = 6;

/// Receive buffer cap per connection.
pub const MAX_BUFFER_SIZE: usize = 2048;

/// A validated frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw command code; may be outside the known command set.
    pub code: u8,
    /// The message payload.
    pub payload: Bytes,
    /// The checksum variant this frame was carried with.
    pub checksum: ChecksumMode,
}

impl Frame {
    pub fn new(code: impl Into<u8>, payload: impl Into<Bytes>, checksum: ChecksumMode) -> Self {
        Self {
            code: code.into(),
            payload: payload.into(),
            checksum,
        }
    }

    /// The command, if the code is one of the known set.
    pub fn command(&self) -> Option<Command> {
        Command::from_code(self.code)
    }

    pub fn is_known(&self) -> bool {
        self.command().is_some()
    }

    /// The total wire size of this frame.
    pub fn wire_size(&self) -> usize {
        self.checksum.frame_size(self.payload.len())
    }

    /// Encode this frame into `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        encode_frame(self.code, &self.payload, self.checksum, dst)
    }
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────┬─────────┬─────────┬───────────┬────────────┬─────────┐
/// │ Header   │ Command │ Length  │ Payload   │ Checksum   │ Trailer │
/// │ AA 55    │ (1B)    │ (1B) L  │ (L bytes) │ (1B or 2B) │ 0D      │
/// └──────────┴─────────┴─────────┴───────────┴────────────┴─────────┘
/// ```
/// The checksum covers command, length and payload.
pub fn encode_frame(
    code: impl Into<u8>,
    payload: &[u8],
    mode: ChecksumMode,
    dst: &mut BytesMut,
) -> Result<()> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD,
        });
    }
    dst.reserve(mode.frame_size(payload.len()));
    let head = [code.into(), payload.len() as u8];
    dst.put_slice(&HEADER);
    dst.put_slice(&head);
    dst.put_slice(payload);
    mode.put_split(&head, payload, dst);
    dst.put_u8(TRAILER);
    Ok(())
}

/// Encode a frame into a fresh buffer.
pub fn encode(code: impl Into<u8>, payload: &[u8], mode: ChecksumMode) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(mode.frame_size(payload.len().min(MAX_PAYLOAD)));
    encode_frame(code, payload, mode, &mut buf)?;
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_additive_layout() {
        let bytes = encode(Command::DeviceStart, &[0x01, 0x02], ChecksumMode::Additive).unwrap();
        assert_eq!(
            bytes.as_ref(),
            &[0xAA, 0x55, 0x01, 0x02, 0x01, 0x02, 0x06, 0x0D]
        );
    }

    #[test]
    fn encode_crc_layout() {
        let bytes = encode(0x04u8, &[], ChecksumMode::Crc16Modbus).unwrap();
        assert_eq!(bytes.len(), 7);
        assert_eq!(&bytes[..4], &[0xAA, 0x55, 0x04, 0x00]);
        let crc = crate::checksum::crc16_modbus(&[0x04, 0x00]);
        assert_eq!(bytes[4], (crc & 0xFF) as u8);
        assert_eq!(bytes[5], (crc >> 8) as u8);
        assert_eq!(bytes[6], TRAILER);
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let payload = vec![0u8; 256];
        let err = encode(Command::UpgradeData, &payload, ChecksumMode::Additive).unwrap_err();
        assert_eq!(err, FrameError::PayloadTooLarge { size: 256, max: 255 });
    }

    #[test]
    fn max_payload_fits() {
        let payload = vec![0xEEu8; MAX_PAYLOAD];
        let bytes = encode(Command::UpgradeData, &payload, ChecksumMode::Crc16Modbus).unwrap();
        assert_eq!(bytes.len(), ChecksumMode::Crc16Modbus.frame_size(MAX_PAYLOAD));
        assert_eq!(bytes[3], 0xFF);
    }

    #[test]
    fn encode_appends_to_existing_buffer() {
        let mut buf = BytesMut::new();
        encode_frame(0x01u8, b"", ChecksumMode::Additive, &mut buf).unwrap();
        encode_frame(0x02u8, b"", ChecksumMode::Additive, &mut buf).unwrap();
        assert_eq!(buf.len(), 12);
        assert_eq!(buf[2], 0x01);
        assert_eq!(buf[8], 0x02);
    }

    #[test]
    fn frame_wire_size_and_command() {
        let frame = Frame::new(Command::Heartbeat, Bytes::from_static(&[0x02]), ChecksumMode::Additive);
        assert_eq!(frame.wire_size(), 7);
        assert_eq!(frame.command(), Some(Command::Heartbeat));
        let unknown = Frame::new(0x99u8, Bytes::new(), ChecksumMode::Additive);
        assert!(!unknown.is_known());
    }
}
