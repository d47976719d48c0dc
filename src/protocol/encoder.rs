//! Frame encoder/decoder
//!
//! The encoder appends frames to a reusable buffer; the decoder walks a byte
//! slice and only yields frames whose payload is fully present.

use super::message::{checksum, FrameError, FrameHeader, HEADER_SIZE};

/// Reusable frame encoder.
pub struct Encoder {
    buffer: Vec<u8>,
    max_payload: usize,
}

impl Encoder {
    pub fn new(capacity: usize, max_payload: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            max_payload,
        }
    }

    /// Reset encoder for reuse
    #[inline(always)]
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Encode one frame from a ready payload slice.
    pub fn encode(
        &mut self,
        msg_type: i32,
        sequence: u64,
        payload: &[u8],
    ) -> Result<&[u8], FrameError> {
        self.encode_with(msg_type, sequence, |out| out.extend_from_slice(payload))
    }

    /// Encode one frame, letting `write_payload` append the payload in place.
    ///
    /// The header is back-filled once the payload length is known. On error
    /// the buffer is left as it was before the call.
    pub fn encode_with<F>(
        &mut self,
        msg_type: i32,
        sequence: u64,
        write_payload: F,
    ) -> Result<&[u8], FrameError>
    where
        F: FnOnce(&mut Vec<u8>),
    {
        let start = self.buffer.len();
        self.buffer.resize(start + HEADER_SIZE, 0);
        write_payload(&mut self.buffer);

        let payload_len = self.buffer.len() - start - HEADER_SIZE;
        if payload_len > self.max_payload {
            self.buffer.truncate(start);
            return Err(FrameError::PayloadTooLarge {
                len: payload_len,
                max: self.max_payload,
            });
        }

        let payload = &self.buffer[start + HEADER_SIZE..];
        let mut header = FrameHeader::new(msg_type, sequence, payload_len as u32);
        header.checksum = checksum(payload);
        header.write_to(&mut self.buffer[start..start + HEADER_SIZE]);

        Ok(&self.buffer[start..])
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

/// Zero-copy frame decoder over a byte slice.
pub struct FrameDecoder<'a> {
    buffer: &'a [u8],
    read_pos: usize,
    max_payload: usize,
}

impl<'a> FrameDecoder<'a> {
    #[inline(always)]
    pub fn new(buffer: &'a [u8], max_payload: usize) -> Self {
        Self {
            buffer,
            read_pos: 0,
            max_payload,
        }
    }

    /// Decode the next complete frame.
    ///
    /// `Ok(None)` means the rest of the buffer is a partial frame that must
    /// stay buffered until more bytes arrive.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<(FrameHeader, &'a [u8])>, FrameError> {
        let rest = &self.buffer[self.read_pos..];
        let Some(header) = FrameHeader::parse(rest, self.max_payload)? else {
            return Ok(None);
        };

        let frame_end = header.total_size();
        if rest.len() < frame_end {
            return Ok(None);
        }

        let payload = &rest[HEADER_SIZE..frame_end];
        if header.checksum != 0 {
            let actual = checksum(payload);
            if actual != header.checksum {
                return Err(FrameError::ChecksumMismatch {
                    expected: header.checksum,
                    actual,
                });
            }
        }

        self.read_pos += frame_end;
        Ok(Some((header, payload)))
    }

    /// Bytes taken by the frames decoded so far
    #[inline(always)]
    pub fn consumed(&self) -> usize {
        self.read_pos
    }

    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.read_pos)
    }
}
