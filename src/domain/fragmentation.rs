//! Fragmentation Codec
//!
//! Splits payloads larger than one link packet into fragments and puts them
//! back together on the receiving side.
//!
//! ## Fragment Format
//!
//! ```text
//! ┌───────────────┬─────────────────────┬───────────────────────┐
//! │ continuation  │      sequence       │         data          │
//! │    bit 7      │     bits 6..0       │   0..=max_chunk bytes │
//! └───────────────┴─────────────────────┴───────────────────────┘
//! ```
//!
//! `continuation = 1` means more fragments of the same message follow. The
//! sequence number is a per-channel, per-direction counter that keeps running
//! across messages (mod 128), so a lost last fragment is noticed even when the
//! next message starts.

use tracing::{debug, trace};

/// Size of the fragment header.
pub const HEADER_LEN: usize = 1;

const CONTINUATION_BIT: u8 = 0x80;
const SEQUENCE_MASK: u8 = 0x7f;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub continuation: bool,
    pub sequence: u8,
}

impl FragmentHeader {
    pub const fn new(continuation: bool, sequence: u8) -> Self {
        Self {
            continuation,
            sequence: sequence & SEQUENCE_MASK,
        }
    }

    pub const fn to_byte(self) -> u8 {
        let flag = if self.continuation { CONTINUATION_BIT } else { 0 };
        flag | (self.sequence & SEQUENCE_MASK)
    }

    pub const fn from_byte(byte: u8) -> Self {
        Self {
            continuation: byte & CONTINUATION_BIT != 0,
            sequence: byte & SEQUENCE_MASK,
        }
    }
}

const fn next_sequence(sequence: u8) -> u8 {
    sequence.wrapping_add(1) & SEQUENCE_MASK
}

/// Largest data chunk that fits one link packet of `mtu` bytes.
pub fn max_chunk_for_mtu(mtu: u32) -> usize {
    (mtu as usize).saturating_sub(HEADER_LEN).max(1)
}

/// Outbound half of the codec for one channel.
#[derive(Debug, Clone)]
pub struct Fragmenter {
    max_chunk: usize,
    next_sequence: u8,
}

impl Fragmenter {
    pub fn new(max_chunk: usize) -> Self {
        Self::with_sequence(max_chunk, 0)
    }

    /// Chunk size derived from the link MTU.
    pub fn for_mtu(mtu: u32) -> Self {
        Self::new(max_chunk_for_mtu(mtu))
    }

    /// Framing context that continues an existing sequence counter.
    pub fn with_sequence(max_chunk: usize, next_sequence: u8) -> Self {
        Self {
            max_chunk: max_chunk.max(1),
            next_sequence: next_sequence & SEQUENCE_MASK,
        }
    }

    pub fn max_chunk(&self) -> usize {
        self.max_chunk
    }

    /// Sequence the next fragment will carry.
    pub fn next_sequence(&self) -> u8 {
        self.next_sequence
    }

    /// Split `payload` into wire fragments (header byte + data).
    ///
    /// An empty payload still produces one fragment so that zero-length
    /// messages reach the other side.
    pub fn encode(&mut self, payload: &[u8]) -> Vec<Vec<u8>> {
        if payload.is_empty() {
            return vec![vec![self.take_header(false).to_byte()]];
        }

        let count = payload.len().div_ceil(self.max_chunk);
        let mut fragments = Vec::with_capacity(count);
        for (index, chunk) in payload.chunks(self.max_chunk).enumerate() {
            let header = self.take_header(index + 1 < count);
            let mut fragment = Vec::with_capacity(HEADER_LEN + chunk.len());
            fragment.push(header.to_byte());
            fragment.extend_from_slice(chunk);
            fragments.push(fragment);
        }
        trace!(
            len = payload.len(),
            fragments = fragments.len(),
            "payload fragmented"
        );
        fragments
    }

    fn take_header(&mut self, continuation: bool) -> FragmentHeader {
        let header = FragmentHeader::new(continuation, self.next_sequence);
        self.next_sequence = next_sequence(self.next_sequence);
        header
    }
}

/// Inbound half of the codec for one channel.
///
/// Only appends a fragment when its sequence is the expected one. Anything
/// else drops the partial message and starts over from that fragment.
#[derive(Debug, Default)]
pub struct Reassembler {
    expected_next_sequence: Option<u8>,
    buffer: Vec<u8>,
    discontinuities: u64,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one wire fragment. Returns a complete message when the fragment
    /// closes one.
    pub fn push(&mut self, fragment: &[u8]) -> Option<Vec<u8>> {
        let Some((&first, data)) = fragment.split_first() else {
            debug!("ignoring empty notification");
            return None;
        };
        let header = FragmentHeader::from_byte(first);

        if let Some(expected) = self.expected_next_sequence {
            if header.sequence != expected {
                self.discontinuities += 1;
                debug!(
                    expected,
                    got = header.sequence,
                    discarded = self.buffer.len(),
                    "fragment sequence discontinuity, resyncing"
                );
                self.buffer.clear();
            }
        }

        self.buffer.extend_from_slice(data);
        self.expected_next_sequence = Some(next_sequence(header.sequence));

        if header.continuation {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    /// Forget any partial message and the expected sequence.
    pub fn reset(&mut self) {
        self.expected_next_sequence = None;
        self.buffer.clear();
    }

    /// Number of sequence mismatches seen so far.
    pub fn discontinuities(&self) -> u64 {
        self.discontinuities
    }

    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty()
    }
}
