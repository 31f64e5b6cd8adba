//! Demultiplexer for the runtime's interleaved stdio framing:
//! `[streamType:1][padding:3][payloadLen:4 BE][payload:N]`.

use bytes::{Buf, Bytes, BytesMut};

use domain::runtime::StreamKind;

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: StreamKind,
    pub payload: Bytes,
}

/// Stateful decoder: feed raw chunks in arrival order, complete frames
/// come out; partial frames stay buffered until the rest arrives.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

const HEADER_LEN: usize = 8;

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);
        self.drain()
    }

    /// Bytes waiting for their frame to complete.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while self.buffer.len() >= HEADER_LEN {
            let payload_len = u32::from_be_bytes([
                self.buffer[4],
                self.buffer[5],
                self.buffer[6],
                self.buffer[7],
            ]) as usize;
            if self.buffer.len() < HEADER_LEN + payload_len {
                break;
            }

            let stream_type = self.buffer[0];
            self.buffer.advance(HEADER_LEN);
            let payload = self.buffer.split_to(payload_len).freeze();

            let kind = if stream_type == 2 {
                StreamKind::Stderr
            } else {
                StreamKind::Stdout
            };
            frames.push(Frame { kind, payload });
        }
        frames
    }
}

/// Whether a first chunk looks like the start of a multiplexed stream:
/// a known stream type followed by zeroed padding.
pub fn looks_multiplexed(chunk: &[u8]) -> bool {
    chunk.len() >= HEADER_LEN
        && chunk[0] <= 2
        && chunk[1] == 0
        && chunk[2] == 0
        && chunk[3] == 0
}
