//! Wire frame format: `[type:u8][length:u32 big-endian][payload:length bytes]`

use crate::error::{Result, RuntimeError};

/// Frame types for the wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// A JSON-encoded envelope
    Data = 0x01,
    Heartbeat = 0x03,
    /// Orderly shutdown of the connection
    Close = 0x05,
}

impl TryFrom<u8> for FrameType {
    type Error = RuntimeError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Data),
            0x03 => Ok(Self::Heartbeat),
            0x05 => Ok(Self::Close),
            _ => Err(RuntimeError::Frame(format!(
                "Unknown frame type: 0x{:02x}",
                value
            ))),
        }
    }
}

/// Maximum payload size: 16 MiB
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;
pub(crate) const HEADER_SIZE: usize = 5;

/// A framed message on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn data(payload: Vec<u8>) -> Self {
        Self {
            frame_type: FrameType::Data,
            payload,
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            frame_type: FrameType::Heartbeat,
            payload: Vec::new(),
        }
    }

    pub fn close() -> Self {
        Self {
            frame_type: FrameType::Close,
            payload: Vec::new(),
        }
    }

    /// Encode this frame into bytes for the wire
    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = u32::try_from(self.payload.len())
            .ok()
            .filter(|len| *len <= MAX_PAYLOAD_SIZE)
            .ok_or_else(|| {
                RuntimeError::Frame(format!(
                    "Payload too large: {} bytes (max {})",
                    self.payload.len(),
                    MAX_PAYLOAD_SIZE
                ))
            })?;
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.push(self.frame_type as u8);
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decode a frame from bytes
    ///
    /// Returns the frame and the number of bytes consumed, or `None` if the
    /// buffer does not hold a complete frame yet.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let frame_type = FrameType::try_from(buf[0])?;
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if len > MAX_PAYLOAD_SIZE {
            return Err(RuntimeError::Frame(format!(
                "Payload too large: {} bytes (max {})",
                len, MAX_PAYLOAD_SIZE
            )));
        }
        let total = HEADER_SIZE + len as usize;
        if buf.len() < total {
            return Ok(None);
        }
        Ok(Some((
            Self {
                frame_type,
                payload: buf[HEADER_SIZE..total].to_vec(),
            },
            total,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let encoded = Frame::data(b"{\"type\":\"cancel\"}".to_vec()).encode().unwrap();
        assert_eq!(encoded[0], 0x01);
        assert_eq!(&encoded[1..5], &17u32.to_be_bytes());

        let (decoded, consumed) = Frame::decode(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.frame_type, FrameType::Data);
    }

    #[test]
    fn test_frame_incomplete() {
        let encoded = Frame::data(b"hello".to_vec()).encode().unwrap();
        assert!(Frame::decode(&encoded[..3]).unwrap().is_none());
        assert!(Frame::decode(&encoded[..7]).unwrap().is_none());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut buf = Frame::heartbeat().encode().unwrap();
        buf.extend(Frame::close().encode().unwrap());

        let (first, used) = Frame::decode(&buf).unwrap().unwrap();
        assert_eq!(first.frame_type, FrameType::Heartbeat);
        let (second, _) = Frame::decode(&buf[used..]).unwrap().unwrap();
        assert_eq!(second.frame_type, FrameType::Close);
    }

    #[test]
    fn test_unknown_frame_type() {
        let buf = [0xFF, 0, 0, 0, 0];
        assert!(matches!(Frame::decode(&buf), Err(RuntimeError::Frame(_))));
    }

    #[test]
    fn test_oversized_header_rejected() {
        let mut buf = vec![0x01];
        buf.extend_from_slice(&(MAX_PAYLOAD_SIZE + 1).to_be_bytes());
        assert!(Frame::decode(&buf).is_err());
    }
}
