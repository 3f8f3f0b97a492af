//! IPv4 fragment reassembly.
//!
//! IPv6 is intentionally unsupported — the original gateway this is
//! modeled on never reassembles IPv6 fragments either, and nothing in this
//! crate's scope requires it.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::packet::ipv4::Ipv4Header;

const MAX_ENTRIES: usize = 1024;
const MAX_AGE: Duration = Duration::from_secs(30);

struct PendingDatagram {
    header: Ipv4Header,
    payload: Vec<u8>,
    inserted_at: Instant,
}

impl PendingDatagram {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() >= MAX_AGE
    }
}

/// Reassembles IPv4 fragments keyed by the datagram's identification field.
///
/// Bounded by both entry count (LRU-evicted past [`MAX_ENTRIES`]) and age
/// (swept past [`MAX_AGE`]), the same two-axis bound the rest of this
/// crate's caches use.
pub struct FragmentReassembler {
    pending: LruCache<u16, PendingDatagram>,
}

impl Default for FragmentReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FragmentReassembler {
    pub fn new() -> Self {
        FragmentReassembler {
            pending: LruCache::new(NonZeroUsize::new(MAX_ENTRIES).unwrap()),
        }
    }

    /// Feeds one fragment (or a complete, unfragmented datagram) in.
    ///
    /// Returns `Some((header, payload))` once a datagram is complete —
    /// either immediately, for an unfragmented datagram, or once the final
    /// (MF=0) fragment arrives and all prior fragments for that id have
    /// been seen.
    ///
    /// This only reassembles in strictly-increasing-offset order (the
    /// common case for a well-behaved peer); out-of-order fragments for an
    /// id already in flight replace the tail rather than being spliced in
    /// by offset, matching the original implementation's append-only
    /// reassembly.
    pub fn feed(&mut self, header: Ipv4Header, payload: &[u8]) -> Option<(Ipv4Header, Vec<u8>)> {
        if header.is_first_fragment() && !header.more_fragments() {
            return Some((header, payload.to_vec()));
        }

        let id = header.identification;
        if !self.pending.contains(&id) {
            if !header.more_fragments() {
                // a non-zero-offset fragment arriving with no prior state
                // and no MF is unreassemblable; drop it.
                return None;
            }
            self.pending.put(
                id,
                PendingDatagram {
                    header,
                    payload: payload.to_vec(),
                    inserted_at: Instant::now(),
                },
            );
            return None;
        }

        let more_fragments = header.more_fragments();
        {
            let entry = self.pending.get_mut(&id).expect("checked contains above");
            entry.payload.extend_from_slice(payload);
            entry.header = header;
        }

        if more_fragments {
            None
        } else {
            let entry = self.pending.pop(&id).expect("checked contains above");
            Some((entry.header, entry.payload))
        }
    }

    /// Evicts entries older than [`MAX_AGE`]. Called by the janitor on its
    /// sweep interval.
    pub fn sweep_expired(&mut self) {
        let expired: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, d)| d.is_expired())
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.pending.pop(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
