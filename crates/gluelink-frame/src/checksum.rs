//! Frame checksums and integrity classification.
//!
//! Both variants cover the bytes from the command code through the end of
//! the payload. Failures are returned as values; nothing here panics on
//! malformed input.

use std::fmt;
use std::str::FromStr;

use bytes::BufMut;
use serde::{Deserialize, Serialize};

use crate::codec::{HEADER_SIZE, TRAILER_SIZE};

const CRC16_MODBUS_POLY: u16 = 0xA001;
const CRC16_MODBUS_INIT: u16 = 0xFFFF;

/// Which checksum a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumMode {
    /// Unsigned 8-bit sum, one byte on the wire.
    Additive,
    /// CRC16/Modbus, two bytes on the wire, low byte first.
    #[default]
    Crc16Modbus,
}

impl ChecksumMode {
    /// Checksum width on the wire.
    pub const fn len(self) -> usize {
        match self {
            ChecksumMode::Additive => 1,
            ChecksumMode::Crc16Modbus => 2,
        }
    }

    /// The other variant.
    pub const fn alternate(self) -> Self {
        match self {
            ChecksumMode::Additive => ChecksumMode::Crc16Modbus,
            ChecksumMode::Crc16Modbus => ChecksumMode::Additive,
        }
    }

    /// Smallest complete frame (empty payload) under this mode.
    pub const fn min_frame_size(self) -> usize {
        HEADER_SIZE + 2 + self.len() + TRAILER_SIZE
    }

    /// Total frame size for a payload of `payload_len` bytes.
    pub const fn frame_size(self, payload_len: usize) -> usize {
        HEADER_SIZE + 2 + payload_len + self.len() + TRAILER_SIZE
    }

    pub fn name(self) -> &'static str {
        match self {
            ChecksumMode::Additive => "additive",
            ChecksumMode::Crc16Modbus => "crc16_modbus",
        }
    }

    /// Append the checksum of `covered` in wire order.
    pub fn put<B: BufMut>(self, covered: &[u8], dst: &mut B) {
        match self {
            ChecksumMode::Additive => dst.put_u8(additive(covered)),
            ChecksumMode::Crc16Modbus => dst.put_u16_le(crc16_modbus(covered)),
        }
    }

    /// Append the checksum of `head` followed by `tail`, in wire order.
    pub fn put_split<B: BufMut>(self, head: &[u8], tail: &[u8], dst: &mut B) {
        match self {
            ChecksumMode::Additive => dst.put_u8(additive(head).wrapping_add(additive(tail))),
            ChecksumMode::Crc16Modbus => {
                let crc = tail.iter().fold(crc16_modbus(head), |crc, &b| crc_step(crc, b));
                dst.put_u16_le(crc);
            }
        }
    }

    /// Whether `stored` (wire order) matches the checksum of `covered`.
    pub fn matches(self, covered: &[u8], stored: &[u8]) -> bool {
        match self {
            ChecksumMode::Additive => stored.len() == 1 && stored[0] == additive(covered),
            ChecksumMode::Crc16Modbus => {
                stored.len() == 2
                    && u16::from_le_bytes([stored[0], stored[1]]) == crc16_modbus(covered)
            }
        }
    }
}

impl TryFrom<u8> for ChecksumMode {
    type Error = ChecksumFault;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ChecksumMode::Additive),
            1 => Ok(ChecksumMode::Crc16Modbus),
            other => Err(ChecksumFault::UnrecognizedMode(other)),
        }
    }
}

impl FromStr for ChecksumMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "additive" | "sum" | "sum8" => Ok(ChecksumMode::Additive),
            "crc16" | "crc16_modbus" | "crc16-modbus" | "crc" => Ok(ChecksumMode::Crc16Modbus),
            other => Err(format!("unknown checksum mode: {other}")),
        }
    }
}

impl fmt::Display for ChecksumMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Probable cause of a checksum mismatch. Advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ChecksumFault {
    /// Exactly one bit differs between a plausible original and the frame.
    SingleBitFlip,
    /// More than one bit is wrong.
    MultiByteCorruption,
    /// The frame length disagrees with its length byte.
    LengthMismatch,
    /// The checksum mode code is not known.
    UnrecognizedMode(u8),
}

impl fmt::Display for ChecksumFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumFault::SingleBitFlip => f.write_str("single-bit flip suspected"),
            ChecksumFault::MultiByteCorruption => f.write_str("multi-byte corruption"),
            ChecksumFault::LengthMismatch => f.write_str("length/alignment error"),
            ChecksumFault::UnrecognizedMode(code) => {
                write!(f, "unrecognized checksum mode 0x{code:02X}")
            }
        }
    }
}

/// Result of the combined pre-decode check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integrity {
    Ok,
    BadHeader,
    BadTrailer,
    BadLength,
    BadChecksum,
}

impl Integrity {
    pub fn is_ok(self) -> bool {
        self == Integrity::Ok
    }
}

/// Unsigned sum of all bytes, modulo 256.
pub fn additive(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// CRC16/Modbus (reflected poly 0xA001, init 0xFFFF, no final xor).
pub fn crc16_modbus(bytes: &[u8]) -> u16 {
    bytes.iter().fold(CRC16_MODBUS_INIT, |crc, &b| crc_step(crc, b))
}

fn crc_step(mut crc: u16, byte: u8) -> u16 {
    crc ^= u16::from(byte);
    for _ in 0..8 {
        if crc & 0x0001 != 0 {
            crc = (crc >> 1) ^ CRC16_MODBUS_POLY;
        } else {
            crc >>= 1;
        }
    }
    crc
}

/// Verify the checksum of a complete frame (header through trailer).
///
/// Header and trailer bytes are not inspected; see [`frame_integrity`].
pub fn verify_frame(framed: &[u8], mode: ChecksumMode) -> Result<(), ChecksumFault> {
    if framed.len() < mode.min_frame_size() {
        return Err(ChecksumFault::LengthMismatch);
    }
    let payload_len = framed[HEADER_SIZE + 1] as usize;
    if framed.len() != mode.frame_size(payload_len) {
        return Err(ChecksumFault::LengthMismatch);
    }

    let covered_end = HEADER_SIZE + 2 + payload_len;
    let covered = &framed[HEADER_SIZE..covered_end];
    let stored = &framed[covered_end..covered_end + mode.len()];

    if mode.matches(covered, stored) {
        return Ok(());
    }

    Err(match mode {
        ChecksumMode::Additive => classify_additive(additive(covered), stored[0]),
        ChecksumMode::Crc16Modbus => classify_crc(
            covered,
            crc16_modbus(covered),
            u16::from_le_bytes([stored[0], stored[1]]),
        ),
    })
}

/// Like [`verify_frame`], with the mode given as its wire code
/// (0 = additive, 1 = CRC16/Modbus).
pub fn verify_frame_coded(framed: &[u8], mode_code: u8) -> Result<(), ChecksumFault> {
    let mode = ChecksumMode::try_from(mode_code)?;
    verify_frame(framed, mode)
}

/// Combined header, length, trailer and checksum check.
pub fn frame_integrity(
    framed: &[u8],
    header: [u8; HEADER_SIZE],
    trailer: u8,
    mode: ChecksumMode,
) -> Integrity {
    if framed.len() < mode.min_frame_size() {
        return Integrity::BadLength;
    }
    if framed[..HEADER_SIZE] != header {
        return Integrity::BadHeader;
    }
    let payload_len = framed[HEADER_SIZE + 1] as usize;
    if framed.len() != mode.frame_size(payload_len) {
        return Integrity::BadLength;
    }
    if framed[framed.len() - 1] != trailer {
        return Integrity::BadTrailer;
    }
    match verify_frame(framed, mode) {
        Ok(()) => Integrity::Ok,
        Err(_) => Integrity::BadChecksum,
    }
}

fn classify_additive(computed: u8, stored: u8) -> ChecksumFault {
    // One flipped bit moves the sum by exactly +/- 2^k.
    let delta = stored.wrapping_sub(computed);
    if delta.is_power_of_two() || delta.wrapping_neg().is_power_of_two() {
        ChecksumFault::SingleBitFlip
    } else {
        ChecksumFault::MultiByteCorruption
    }
}

fn classify_crc(covered: &[u8], computed: u16, stored: u16) -> ChecksumFault {
    let syndrome = computed ^ stored;
    if syndrome.count_ones() == 1 {
        return ChecksumFault::SingleBitFlip;
    }

    // The CRC is affine, so a single flipped data bit yields a syndrome equal
    // to the zero-init CRC of a one-hot pattern at that position.
    for bit in 0..8 {
        let mut reg = crc_step(0, 1u8 << bit);
        for _ in 0..covered.len() {
            if reg == syndrome {
                return ChecksumFault::SingleBitFlip;
            }
            reg = crc_step(reg, 0);
        }
    }
    ChecksumFault::MultiByteCorruption
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_frame, HEADER, TRAILER};
    use bytes::BytesMut;

    fn framed(code: u8, payload: &[u8], mode: ChecksumMode) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_frame(code, payload, mode, &mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn additive_wraps() {
        assert_eq!(additive(&[]), 0);
        assert_eq!(additive(&[0xFF, 0x02]), 0x01);
        assert_eq!(additive(&[0x10, 0x20, 0x30]), 0x60);
    }

    #[test]
    fn crc16_modbus_check_value() {
        assert_eq!(crc16_modbus(b"123456789"), 0x4B37);
        assert_eq!(crc16_modbus(&[]), 0xFFFF);
    }

    #[test]
    fn crc_emitted_low_byte_first() {
        let mut out = Vec::new();
        ChecksumMode::Crc16Modbus.put(b"123456789", &mut out);
        assert_eq!(out, vec![0x37, 0x4B]);
    }

    #[test]
    fn verify_accepts_valid_frames() {
        for mode in [ChecksumMode::Additive, ChecksumMode::Crc16Modbus] {
            let f = framed(0x01, b"abc", mode);
            assert_eq!(verify_frame(&f, mode), Ok(()));
            assert_eq!(frame_integrity(&f, HEADER, TRAILER, mode), Integrity::Ok);
        }
    }

    #[test]
    fn additive_single_bit_flip_classified() {
        let mut f = framed(0x15, &[1, 2, 3, 4], ChecksumMode::Additive);
        f[5] ^= 0x08;
        assert_eq!(
            verify_frame(&f, ChecksumMode::Additive),
            Err(ChecksumFault::SingleBitFlip)
        );
    }

    #[test]
    fn additive_multi_byte_classified() {
        let mut f = framed(0x15, &[1, 2, 3, 4], ChecksumMode::Additive);
        f[4] = f[4].wrapping_add(3);
        assert_eq!(
            verify_frame(&f, ChecksumMode::Additive),
            Err(ChecksumFault::MultiByteCorruption)
        );
    }

    #[test]
    fn crc_single_bit_flip_in_payload_classified() {
        let payload: Vec<u8> = (0u8..32).collect();
        for byte in [4usize, 10, 35] {
            for bit in [0u8, 3, 7] {
                let mut f = framed(0x10, &payload, ChecksumMode::Crc16Modbus);
                f[byte] ^= 1 << bit;
                assert_eq!(
                    verify_frame(&f, ChecksumMode::Crc16Modbus),
                    Err(ChecksumFault::SingleBitFlip),
                    "byte {byte} bit {bit}"
                );
            }
        }
    }

    #[test]
    fn crc_single_bit_flip_in_checksum_classified() {
        let mut f = framed(0x10, b"xyz", ChecksumMode::Crc16Modbus);
        let idx = f.len() - 2;
        f[idx] ^= 0x40;
        assert_eq!(
            verify_frame(&f, ChecksumMode::Crc16Modbus),
            Err(ChecksumFault::SingleBitFlip)
        );
    }

    #[test]
    fn crc_burst_classified_as_multi_byte() {
        let mut f = framed(0x10, &[0u8; 16], ChecksumMode::Crc16Modbus);
        f[6] ^= 0xFF;
        f[9] ^= 0x5A;
        assert_eq!(
            verify_frame(&f, ChecksumMode::Crc16Modbus),
            Err(ChecksumFault::MultiByteCorruption)
        );
    }

    #[test]
    fn length_mismatch_detected() {
        let mut f = framed(0x01, b"abcd", ChecksumMode::Additive);
        f.pop();
        assert_eq!(
            verify_frame(&f, ChecksumMode::Additive),
            Err(ChecksumFault::LengthMismatch)
        );
        assert_eq!(
            frame_integrity(&f, HEADER, TRAILER, ChecksumMode::Additive),
            Integrity::BadLength
        );
    }

    #[test]
    fn unrecognized_mode_code() {
        let f = framed(0x01, b"", ChecksumMode::Additive);
        assert_eq!(
            verify_frame_coded(&f, 7),
            Err(ChecksumFault::UnrecognizedMode(7))
        );
        assert_eq!(verify_frame_coded(&f, 0), Ok(()));
    }

    #[test]
    fn integrity_reports_header_then_trailer_then_checksum() {
        let good = framed(0x02, b"hi", ChecksumMode::Additive);

        let mut bad_header = good.clone();
        bad_header[1] = 0x00;
        assert_eq!(
            frame_integrity(&bad_header, HEADER, TRAILER, ChecksumMode::Additive),
            Integrity::BadHeader
        );

        let mut bad_trailer = good.clone();
        let last = bad_trailer.len() - 1;
        bad_trailer[last] = 0x0A;
        assert_eq!(
            frame_integrity(&bad_trailer, HEADER, TRAILER, ChecksumMode::Additive),
            Integrity::BadTrailer
        );

        let mut bad_sum = good;
        bad_sum[4] ^= 0x01;
        assert_eq!(
            frame_integrity(&bad_sum, HEADER, TRAILER, ChecksumMode::Additive),
            Integrity::BadChecksum
        );
    }

    #[test]
    fn mode_parsing_and_names() {
        assert_eq!("crc16".parse::<ChecksumMode>(), Ok(ChecksumMode::Crc16Modbus));
        assert_eq!("Additive".parse::<ChecksumMode>(), Ok(ChecksumMode::Additive));
        assert!("md5".parse::<ChecksumMode>().is_err());
        assert_eq!(ChecksumMode::Additive.min_frame_size(), 6);
        assert_eq!(ChecksumMode::Crc16Modbus.min_frame_size(), 7);
    }
}
