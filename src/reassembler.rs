//! The chunk reassembler: buffers and verifies multi-part payloads sent via
//! `send_chunked`.
//!
//! Checksum is CRC32 (`crc32fast`) over the pre-split payload; both ends
//! just need to agree on the fingerprint, and [`crate::net::endpoint`]
//! computes the same algorithm on the send side.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Outcome of feeding one chunk into the reassembler.
#[derive(Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// More chunks are still outstanding.
    Incomplete,
    /// All chunks arrived and the checksum matched; payload is assembled.
    Complete(Vec<u8>),
    /// All chunks arrived but the checksum did not match the assembled
    /// bytes, or a later chunk disagreed with an earlier one's `total`/
    /// `checksum`. The assembler for this sequence is discarded either way.
    Mismatch,
}

struct Assembler {
    total_chunks: u32,
    expected_checksum: u32,
    received: HashMap<u32, Vec<u8>>,
    created_at: Instant,
}

impl Assembler {
    fn is_complete(&self) -> bool {
        self.received.len() as u32 == self.total_chunks
    }

    fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for idx in 0..self.total_chunks {
            if let Some(bytes) = self.received.get(&idx) {
                out.extend_from_slice(bytes);
            }
        }
        out
    }
}

/// Thread-safe chunk reassembler, keyed by sequence.
#[derive(Clone)]
pub struct Reassembler {
    inner: std::sync::Arc<Mutex<HashMap<u32, Assembler>>>,
    ttl: Duration,
}

impl Reassembler {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: std::sync::Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Feed one chunk for `sequence`. Creates the assembler on first call.
    /// A later chunk reporting a different `total`/`checksum` than the
    /// first is a fatal mismatch for this sequence: the assembler is
    /// discarded immediately. Re-delivering an index with identical bytes
    /// is idempotent; differing bytes at the same index is also a fatal
    /// mismatch.
    pub fn ingest(
        &self,
        sequence: u32,
        total: u32,
        index: u32,
        checksum: u32,
        data: Vec<u8>,
    ) -> IngestOutcome {
        let mut map = self.inner.lock().expect("reassembler lock poisoned");

        let discard_on_mismatch = {
            let assembler = map.entry(sequence).or_insert_with(|| Assembler {
                total_chunks: total,
                expected_checksum: checksum,
                received: HashMap::new(),
                created_at: Instant::now(),
            });

            if assembler.total_chunks != total || assembler.expected_checksum != checksum {
                true
            } else {
                match assembler.received.get(&index) {
                    Some(existing) if existing != &data => true,
                    _ => {
                        assembler.received.insert(index, data);
                        false
                    }
                }
            }
        };

        if discard_on_mismatch {
            map.remove(&sequence);
            return IngestOutcome::Mismatch;
        }

        let assembler = map.get(&sequence).expect("just inserted above");
        if !assembler.is_complete() {
            return IngestOutcome::Incomplete;
        }

        let payload = assembler.assemble();
        let checksum_matches = crc32fast::hash(&payload) == assembler.expected_checksum;
        map.remove(&sequence);
        if checksum_matches {
            IngestOutcome::Complete(payload)
        } else {
            IngestOutcome::Mismatch
        }
    }

    /// Discard assemblers older than the chunk TTL.
    pub fn sweep_stale(&self) -> usize {
        let now = Instant::now();
        let ttl = self.ttl;
        let mut map = self.inner.lock().expect("reassembler lock poisoned");
        let before = map.len();
        map.retain(|_, assembler| now.saturating_duration_since(assembler.created_at) <= ttl);
        before - map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checksum_of(payload: &[u8]) -> u32 {
        crc32fast::hash(payload)
    }

    #[test]
    fn complete_in_order_assembles_payload() {
        let reassembler = Reassembler::new(Duration::from_secs(60));
        let payload = b"hello world this is a chunked payload".to_vec();
        let chunks: Vec<&[u8]> = payload.chunks(8).collect();
        let total = chunks.len() as u32;
        let checksum = checksum_of(&payload);

        let mut result = IngestOutcome::Incomplete;
        for (i, chunk) in chunks.iter().enumerate() {
            result = reassembler.ingest(1, total, i as u32, checksum, chunk.to_vec());
        }
        assert_eq!(result, IngestOutcome::Complete(payload));
    }

    #[test]
    fn out_of_order_delivery_still_assembles() {
        let reassembler = Reassembler::new(Duration::from_secs(60));
        let payload = b"0123456789ABCDEF".to_vec();
        let chunks: Vec<Vec<u8>> = payload.chunks(4).map(|c| c.to_vec()).collect();
        let total = chunks.len() as u32;
        let checksum = checksum_of(&payload);

        // Deliver out of order: 2, 0, 3, 1.
        reassembler.ingest(20, total, 2, checksum, chunks[2].clone());
        reassembler.ingest(20, total, 0, checksum, chunks[0].clone());
        reassembler.ingest(20, total, 3, checksum, chunks[3].clone());
        let result = reassembler.ingest(20, total, 1, checksum, chunks[1].clone());
        assert_eq!(result, IngestOutcome::Complete(payload));
    }

    #[test]
    fn missing_chunk_never_completes() {
        let reassembler = Reassembler::new(Duration::from_secs(60));
        let payload = b"0123456789ABCDEF".to_vec();
        let chunks: Vec<Vec<u8>> = payload.chunks(4).map(|c| c.to_vec()).collect();
        let total = chunks.len() as u32;
        let checksum = checksum_of(&payload);

        // Chunk 1 (of 0..3) never arrives.
        reassembler.ingest(21, total, 0, checksum, chunks[0].clone());
        let result = reassembler.ingest(21, total, 2, checksum, chunks[2].clone());
        assert_eq!(result, IngestOutcome::Incomplete);
        reassembler.ingest(21, total, 3, checksum, chunks[3].clone());
        // Still incomplete: only 3 of 4 chunks present.
    }

    #[test]
    fn checksum_mismatch_discards_assembler() {
        let reassembler = Reassembler::new(Duration::from_secs(60));
        let total = 2u32;
        let bogus_checksum = 0xDEAD_BEEF;
        reassembler.ingest(30, total, 0, bogus_checksum, b"aaaa".to_vec());
        let result = reassembler.ingest(30, total, 1, bogus_checksum, b"bbbb".to_vec());
        assert_eq!(result, IngestOutcome::Mismatch);
        // Assembler was discarded; feeding the same index again starts fresh.
        let restart = reassembler.ingest(30, total, 0, bogus_checksum, b"aaaa".to_vec());
        assert_eq!(restart, IngestOutcome::Incomplete);
    }

    #[test]
    fn conflicting_total_discards_assembler() {
        let reassembler = Reassembler::new(Duration::from_secs(60));
        reassembler.ingest(40, 3, 0, 111, b"a".to_vec());
        let result = reassembler.ingest(40, 4, 1, 111, b"b".to_vec());
        assert_eq!(result, IngestOutcome::Mismatch);
    }

    #[test]
    fn duplicate_identical_chunk_is_idempotent() {
        let reassembler = Reassembler::new(Duration::from_secs(60));
        reassembler.ingest(50, 2, 0, 111, b"aaaa".to_vec());
        let result = reassembler.ingest(50, 2, 0, 111, b"aaaa".to_vec());
        assert_eq!(result, IngestOutcome::Incomplete);
    }

    #[test]
    fn duplicate_conflicting_chunk_discards_assembler() {
        let reassembler = Reassembler::new(Duration::from_secs(60));
        reassembler.ingest(51, 2, 0, 111, b"aaaa".to_vec());
        let result = reassembler.ingest(51, 2, 0, 111, b"zzzz".to_vec());
        assert_eq!(result, IngestOutcome::Mismatch);
    }

    #[test]
    fn sweep_stale_discards_old_assemblers() {
        let reassembler = Reassembler::new(Duration::from_millis(1));
        reassembler.ingest(60, 2, 0, 111, b"aaaa".to_vec());
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(reassembler.sweep_stale(), 1);
    }
}
