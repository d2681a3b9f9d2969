// ABOUTME: Streaming payload feeders for sending messages without buffering them whole
// ABOUTME: The sequencer pulls window-sized chunks from a feeder as channel capacity allows

//! Payload feeders.
//!
//! A feeder produces the payload of one logical message incrementally.
//! The sequencer asks for at most `max` octets at a time, sized to what
//! the channel can put on the wire right now, so a large transfer never
//! has to exist in memory at once and never outruns the peer's receive
//! window.

use bytes::Bytes;

/// One pull from a feeder.
#[derive(Debug, Clone)]
pub struct FeederChunk {
    pub data: Bytes,
    /// True when this chunk ends the logical message. The frame carrying
    /// its final octets is written with `more=false`.
    pub last: bool,
}

impl FeederChunk {
    pub fn more(data: impl Into<Bytes>) -> FeederChunk {
        FeederChunk {
            data: data.into(),
            last: false,
        }
    }

    pub fn last(data: impl Into<Bytes>) -> FeederChunk {
        FeederChunk {
            data: data.into(),
            last: true,
        }
    }
}

/// Source of payload octets for a streamed send.
pub trait PayloadFeeder: Send + 'static {
    /// Returns up to `max` octets. Returning an empty non-last chunk is
    /// treated as `last`; a feeder with nothing to say ends the message.
    fn next_chunk(&mut self, max: usize) -> FeederChunk;

    /// Restarts the feeder from the beginning, if it supports that.
    fn rewind(&mut self) {}

    /// Called once the sequencer is finished with the feeder, whether the
    /// message completed or the session broke.
    fn release(&mut self) {}
}

/// Feeder over an in-memory buffer. Useful for tests and for callers
/// that want feeder semantics with data they already hold.
pub struct BytesFeeder {
    data: Bytes,
    pos: usize,
}

impl BytesFeeder {
    pub fn new(data: impl Into<Bytes>) -> BytesFeeder {
        BytesFeeder {
            data: data.into(),
            pos: 0,
        }
    }
}

impl PayloadFeeder for BytesFeeder {
    fn next_chunk(&mut self, max: usize) -> FeederChunk {
        let remaining = self.data.len() - self.pos;
        let take = remaining.min(max);
        let chunk = self.data.slice(self.pos..self.pos + take);
        self.pos += take;
        FeederChunk {
            data: chunk,
            last: self.pos == self.data.len(),
        }
    }

    fn rewind(&mut self) {
        self.pos = 0;
    }
}
