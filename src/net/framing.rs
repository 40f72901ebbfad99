//! Frame header codec for the binary/continuation/close subset of RFC 6455.
//!
//! Decoding works on a caller-owned header slice: the first two bytes, then
//! the 2 or 8 extended length bytes once [`extra_length_bytes`] says they are
//! needed. Payload masking is a plain XOR and is its own inverse.

use arrayvec::ArrayVec;
use thiserror::Error;

pub const OPCODE_CONTINUATION: u8 = 0x0;
pub const OPCODE_BINARY: u8 = 0x2;
pub const OPCODE_CLOSE: u8 = 0x8;

const FIN_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const MASK_BIT: u8 = 0x80;
const SHORT_LENGTH: u8 = 126;
const LONG_LENGTH: u8 = 127;

/// Longest possible header: 2 fixed bytes, 8 length bytes, 4 mask bytes.
pub const MAX_HEADER_LEN: usize = 14;

pub type FrameHeader = ArrayVec<u8, MAX_HEADER_LEN>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame mask bit is {found}, expected {expected}")]
    UnexpectedMask { expected: bool, found: bool },
    #[error("reserved header bits set without a negotiated extension")]
    ReservedBits,
    #[error("opcode {opcode:#x} not allowed (fin={fin}, continuation expected={continuation})")]
    BadOpcode {
        opcode: u8,
        fin: bool,
        continuation: bool,
    },
    #[error("frame carries an empty payload")]
    EmptyPayload,
    #[error("payload length {length} exceeds the {max} byte limit")]
    PayloadTooLarge { length: u64, max: usize },
    #[error("fragmented message of {total} bytes exceeds the {max} byte limit")]
    MessageTooLarge { total: usize, max: usize },
}

pub fn opcode(header: &[u8]) -> u8 {
    header[0] & 0x0F
}

pub fn fin(header: &[u8]) -> bool {
    header[0] & FIN_BIT != 0
}

pub fn mask_present(header: &[u8]) -> bool {
    header[1] & MASK_BIT != 0
}

pub fn needs_short_length(header: &[u8]) -> bool {
    header[1] & 0x7F == SHORT_LENGTH
}

pub fn needs_long_length(header: &[u8]) -> bool {
    header[1] & 0x7F == LONG_LENGTH
}

/// How many extended length bytes follow the two fixed header bytes.
pub fn extra_length_bytes(header: &[u8]) -> usize {
    if needs_short_length(header) {
        2
    } else if needs_long_length(header) {
        8
    } else {
        0
    }
}

/// Decodes the 7, 16 or 64-bit payload length.
///
/// `header` must already hold the extended length bytes when they are needed.
/// 64-bit lengths above `isize::MAX` cannot be addressed and are rejected.
pub fn payload_length(header: &[u8]) -> Result<usize, ProtocolError> {
    if needs_short_length(header) {
        Ok(u16::from_be_bytes([header[2], header[3]]) as usize)
    } else if needs_long_length(header) {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&header[2..10]);
        let length = u64::from_be_bytes(bytes);
        if length > isize::MAX as u64 {
            return Err(ProtocolError::PayloadTooLarge {
                length,
                max: isize::MAX as usize,
            });
        }
        Ok(length as usize)
    } else {
        Ok((header[1] & 0x7F) as usize)
    }
}

/// Checks a decoded header against the connection's expectations and returns
/// the payload length.
///
/// Servers expect masked frames, clients unmasked ones. While a fragmented
/// message is open only continuation frames are accepted; otherwise a
/// non-final frame must open a binary message and a final frame must be
/// binary or close. Empty close frames are allowed, empty data frames are not.
pub fn validate_header(
    header: &[u8],
    max_length: usize,
    expect_mask: bool,
    continuation_expected: bool,
) -> Result<usize, ProtocolError> {
    let masked = mask_present(header);
    if masked != expect_mask {
        return Err(ProtocolError::UnexpectedMask {
            expected: expect_mask,
            found: masked,
        });
    }
    if header[0] & RSV_BITS != 0 {
        return Err(ProtocolError::ReservedBits);
    }

    let op = opcode(header);
    let fin = fin(header);
    let allowed = match (continuation_expected, fin) {
        (true, _) => op == OPCODE_CONTINUATION,
        (false, false) => op == OPCODE_BINARY,
        (false, true) => op == OPCODE_BINARY || op == OPCODE_CLOSE,
    };
    if !allowed {
        return Err(ProtocolError::BadOpcode {
            opcode: op,
            fin,
            continuation: continuation_expected,
        });
    }

    let length = payload_length(header)?;
    if length == 0 && op != OPCODE_CLOSE {
        return Err(ProtocolError::EmptyPayload);
    }
    if length > max_length {
        return Err(ProtocolError::PayloadTooLarge {
            length: length as u64,
            max: max_length,
        });
    }
    Ok(length)
}

/// XORs `src` with the cycling mask key into `dst`.
///
/// `mask_offset` is the position of `src[0]` within the frame payload, so a
/// payload can be processed in chunks. Applying the same call twice restores
/// the input.
pub fn toggle_mask(src: &[u8], dst: &mut [u8], mask_key: [u8; 4], mask_offset: usize) {
    debug_assert!(dst.len() >= src.len());
    for (i, (out, byte)) in dst.iter_mut().zip(src).enumerate() {
        *out = byte ^ mask_key[(mask_offset + i) % 4];
    }
}

/// In-place variant of [`toggle_mask`].
pub fn toggle_mask_in_place(buf: &mut [u8], mask_key: [u8; 4], mask_offset: usize) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask_key[(mask_offset + i) % 4];
    }
}

/// Encodes a final binary frame header for a payload of `length` bytes.
///
/// Outbound messages are never fragmented. `mask_key` is set for
/// client-to-server frames only.
pub fn encode_header(length: usize, mask_key: Option<[u8; 4]>) -> FrameHeader {
    encode_header_with_opcode(OPCODE_BINARY, length, mask_key)
}

/// Header for an empty close frame.
pub fn encode_close(mask_key: Option<[u8; 4]>) -> FrameHeader {
    encode_header_with_opcode(OPCODE_CLOSE, 0, mask_key)
}

fn encode_header_with_opcode(op: u8, length: usize, mask_key: Option<[u8; 4]>) -> FrameHeader {
    let mut header = FrameHeader::new();
    let mask = if mask_key.is_some() { MASK_BIT } else { 0 };
    header.push(FIN_BIT | op);

    if length < SHORT_LENGTH as usize {
        header.push(mask | length as u8);
    } else if length <= u16::MAX as usize {
        header.push(mask | SHORT_LENGTH);
        header.extend((length as u16).to_be_bytes());
    } else {
        header.push(mask | LONG_LENGTH);
        header.extend((length as u64).to_be_bytes());
    }

    if let Some(key) = mask_key {
        header.extend(key);
    }
    header
}
