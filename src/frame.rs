//! Frame encoding and response decoding.
//!
//! Outgoing frames are `[len][command][payload][crc32 LE]` where `len` counts
//! the command, payload and CRC bytes modulo 256. Chunk frames used during an
//! application transfer carry no command byte.

use crate::crc::{append_crc, crc32};
use crate::protocol::{Command, CRC_LEN};

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("response of {0} bytes is too short to carry a CRC")]
    Truncated(usize),

    #[error("response CRC mismatch (expected 0x{expected:08x}, received 0x{received:08x})")]
    Crc { expected: u32, received: u32 },
}

/// Bytes covered by the frame CRC
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CrcScope {
    /// Command and payload only, the length byte is prepended afterwards
    Body,
    /// Length byte, command and payload (legacy host framing)
    LengthAndBody,
}

impl Default for CrcScope {
    fn default() -> Self {
        CrcScope::Body
    }
}

impl core::str::FromStr for CrcScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "body" => Ok(CrcScope::Body),
            "length-and-body" | "lengthandbody" => Ok(CrcScope::LengthAndBody),
            _ => Err(format!("unknown CRC scope: {}", s)),
        }
    }
}

/// An encoded frame, ready to be written to the port
#[derive(Clone, Debug, PartialEq)]
pub struct Frame(Vec<u8>);

impl Frame {
    /// Declared length (first byte on the wire)
    pub fn length(&self) -> u8 {
        self.0[0]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Encode a command frame
pub fn encode(command: Command, payload: &[u8]) -> Frame {
    encode_with(CrcScope::Body, Some(command), payload)
}

/// Encode a raw chunk frame (no command byte)
pub fn encode_chunk(chunk: &[u8]) -> Frame {
    encode_with(CrcScope::Body, None, chunk)
}

/// Encode a frame with an explicit CRC scope.
///
/// The length wraps at 256, callers must keep frames short (see `MAX_CHUNK`).
pub fn encode_with(scope: CrcScope, command: Option<Command>, payload: &[u8]) -> Frame {
    let mut body = Vec::with_capacity(payload.len() + CRC_LEN + 2);
    if let Some(c) = command {
        body.push(c as u8);
    }
    body.extend_from_slice(payload);

    let len = ((body.len() + CRC_LEN) % 256) as u8;

    match scope {
        CrcScope::Body => {
            append_crc(&mut body);
            body.insert(0, len);
        }
        CrcScope::LengthAndBody => {
            body.insert(0, len);
            append_crc(&mut body);
        }
    }

    Frame(body)
}

/// Decode a length-prefixed response body.
///
/// The bootloader transmits response buffers last byte first, so the order is
/// restored here. When `verify` is set the raw body must end with a CRC in
/// the `append_crc` convention, which is checked and removed.
pub fn decode_body(mut raw: Vec<u8>, verify: bool) -> Result<Vec<u8>, FrameError> {
    if verify {
        if raw.len() < CRC_LEN {
            return Err(FrameError::Truncated(raw.len()));
        }

        let data_len = raw.len() - CRC_LEN;

        let mut tail = [0u8; 4];
        tail.copy_from_slice(&raw[data_len..]);
        let received = u32::from_le_bytes(tail);

        raw.truncate(data_len);
        let mut padded = raw.clone();
        padded.resize((data_len + 3) & !3, 0);
        let expected = crc32(&padded);

        if expected != received {
            return Err(FrameError::Crc { expected, received });
        }
    }

    raw.reverse();

    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_id_frame() {
        let f = encode(Command::GetId, &[]);

        assert_eq!(f.length(), 5);
        assert_eq!(f.as_bytes().len(), 6);
        assert_eq!(f.as_bytes()[1], Command::GetId as u8);

        let crc = crc32(&[Command::GetId as u8, 0, 0, 0]);
        assert_eq!(&f.as_bytes()[2..], &crc.to_le_bytes());
    }

    #[test]
    fn erase_frame() {
        let f = encode(Command::EraseFlash, &[31, 1]);

        assert_eq!(f.length(), 7);
        assert_eq!(&f.as_bytes()[..4], &[7, 4, 31, 1]);

        let crc = crc32(&[4, 31, 1, 0]);
        assert_eq!(&f.as_bytes()[4..], &crc.to_le_bytes());
    }

    #[test]
    fn chunk_frame_has_no_command() {
        let chunk = [0xAAu8; 250];
        let f = encode_chunk(&chunk);

        assert_eq!(f.length(), 254);
        assert_eq!(f.as_bytes().len(), 1 + 250 + 4);
        assert_eq!(&f.as_bytes()[1..251], &chunk[..]);
    }

    #[test]
    fn length_wraps() {
        let payload = vec![0u8; 300];
        let f = encode_with(CrcScope::Body, Some(Command::WriteData), &payload);

        assert_eq!(f.length(), ((1 + 300 + 4) % 256) as u8);
    }

    #[test]
    fn legacy_scope_covers_length() {
        let f = encode_with(CrcScope::LengthAndBody, Some(Command::SayHi), &[]);

        assert_eq!(&f.as_bytes()[..2], &[5, 7]);
        let crc = crc32(&[5, 7, 0, 0]);
        assert_eq!(&f.as_bytes()[2..], &crc.to_le_bytes());
    }

    #[test]
    fn decode_reverses_body() {
        assert_eq!(decode_body(vec![3, 2, 1], false), Ok(vec![1, 2, 3]));
        assert_eq!(decode_body(vec![], false), Ok(vec![]));
    }

    #[test]
    fn decode_verifies_crc() {
        let mut raw = vec![5, 2, 7];
        append_crc(&mut raw);

        assert_eq!(decode_body(raw.clone(), true), Ok(vec![7, 2, 5]));

        raw[1] ^= 0x10;
        match decode_body(raw, true) {
            Err(FrameError::Crc { .. }) => (),
            r => panic!("unexpected result: {:?}", r),
        }

        assert_eq!(decode_body(vec![1, 2], true), Err(FrameError::Truncated(2)));
    }
}
