//! Bitcoin message framing
//!
//! Every message travels as a 24-byte header followed by its payload:
//! network magic, NUL-padded command name, little-endian payload length and
//! the first four bytes of the payload's double SHA-256. Commands the kit
//! does not understand are consumed and skipped.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::crypto::double_sha256;
use crate::network::message::{Message, MessageError};

/// Header length: magic (4) + command (12) + length (4) + checksum (4)
pub const HEADER_SIZE: usize = 24;

const COMMAND_SIZE: usize = 12;

/// Largest payload we accept from a peer
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024 * 1024;

/// Message codec for Bitcoin framing
#[derive(Debug, Clone)]
pub struct MessageCodec {
    magic: [u8; 4],
}

impl MessageCodec {
    pub fn new(magic: [u8; 4]) -> Self {
        Self { magic }
    }
}

fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = double_sha256(payload);
    [hash[0], hash[1], hash[2], hash[3]]
}

fn command_name(raw: &[u8]) -> Result<String, MessageError> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    if raw[end..].iter().any(|&b| b != 0) || !raw[..end].is_ascii() {
        return Err(MessageError::InvalidCommand);
    }
    String::from_utf8(raw[..end].to_vec()).map_err(|_| MessageError::InvalidCommand)
}

impl Encoder<Message> for MessageCodec {
    type Error = MessageError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.payload();
        let mut command = [0u8; COMMAND_SIZE];
        let name = item.command().as_bytes();
        command[..name.len()].copy_from_slice(name);

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_slice(&self.magic);
        dst.put_slice(&command);
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&checksum(&payload));
        dst.put_slice(&payload);

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = MessageError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            // Need at least header
            if src.len() < HEADER_SIZE {
                return Ok(None);
            }

            if src[..4] != self.magic {
                return Err(MessageError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "Invalid magic bytes",
                )));
            }

            let command = command_name(&src[4..16])?;
            let len = u32::from_le_bytes([src[16], src[17], src[18], src[19]]) as usize;
            if len > MAX_PAYLOAD_SIZE {
                return Err(MessageError::PayloadTooLarge(len));
            }

            if src.len() < HEADER_SIZE + len {
                src.reserve(HEADER_SIZE + len - src.len());
                return Ok(None);
            }

            let expected = [src[20], src[21], src[22], src[23]];
            src.advance(HEADER_SIZE);
            let payload = src.split_to(len);

            if checksum(&payload) != expected {
                return Err(MessageError::BadChecksum(command));
            }

            match Message::parse(&command, &payload)? {
                Some(message) => return Ok(Some(message)),
                None => log::trace!("Skipping unknown command {}", command),
            }
        }
    }
}
