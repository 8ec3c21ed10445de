//! Deterministic weighted bucket ordering from a key hash.
//!
//! Given a fixed set of weighted buckets, every 32-bit key hash maps to a
//! permutation of bucket indices. The first index is the primary choice and
//! the remainder form a failover ladder. Adding or removing one bucket only
//! re-routes the keys whose primary was (or becomes) that bucket, so the
//! ordering behaves like a consistent hash.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One bucket of a [`HashSequencer`]: an identity (typically a server
/// address) and a relative weight. A weight of zero counts as one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub identity: Vec<u8>,
    pub weight: u32,
}

impl Bucket {
    pub fn new(identity: impl Into<Vec<u8>>) -> Self {
        Self {
            identity: identity.into(),
            weight: 1,
        }
    }

    pub fn weighted(identity: impl Into<Vec<u8>>, weight: u32) -> Self {
        Self {
            identity: identity.into(),
            weight,
        }
    }
}

pub struct HashSequencer {
    buckets: Vec<Bucket>,
    mask: u32,
    // Masked key hash -> full permutation, filled lazily when enabled.
    cache: Option<Mutex<HashMap<u32, Arc<[u32]>>>>,
}

impl HashSequencer {
    /// Build a sequencer over `buckets`. Key hashes are masked with `mask`
    /// before scoring, which bounds the distinct permutations (and the cache
    /// size) to `mask + 1`.
    pub fn new(buckets: Vec<Bucket>, mask: u32) -> Self {
        Self {
            buckets,
            mask: if mask == 0 { u32::MAX } else { mask },
            cache: None,
        }
    }

    /// Memoize permutations per masked key hash.
    pub fn enable_cache(mut self) -> Self {
        self.cache = Some(Mutex::new(HashMap::new()));
        self
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Hash arbitrary key bytes into the 32-bit key-hash space.
    pub fn key_hash(key: &[u8]) -> u32 {
        xxhash_rust::xxh32::xxh32(key, 0)
    }

    /// Index of the primary bucket for `key`, or None when empty.
    pub fn which(&self, key: &[u8]) -> Option<usize> {
        self.which_hash(Self::key_hash(key))
    }

    pub fn which_hash(&self, keyhash: u32) -> Option<usize> {
        let keyhash = keyhash & self.mask;
        if let Some(cache) = &self.cache {
            let seq = self.cached_sequence(cache, keyhash);
            return seq.first().map(|i| *i as usize);
        }

        self.buckets
            .iter()
            .enumerate()
            .max_by(|(ai, a), (bi, b)| {
                score(a, keyhash)
                    .total_cmp(&score(b, keyhash))
                    .then_with(|| a.identity.cmp(&b.identity))
                    // Equal identities fall back on position so the ordering
                    // is total even for duplicate bucket declarations.
                    .then(bi.cmp(ai))
            })
            .map(|(i, _)| i)
    }

    /// The top-`n` preferred bucket indices for `key`, primary first.
    pub fn sequence(&self, key: &[u8], n: usize) -> Vec<usize> {
        self.sequence_hash(Self::key_hash(key), n)
    }

    pub fn sequence_hash(&self, keyhash: u32, n: usize) -> Vec<usize> {
        let keyhash = keyhash & self.mask;
        let n = n.min(self.buckets.len());

        if let Some(cache) = &self.cache {
            let seq = self.cached_sequence(cache, keyhash);
            return seq[..n].iter().map(|i| *i as usize).collect();
        }

        let mut seq = self.full_sequence(keyhash);
        seq.truncate(n);
        seq.into_iter().map(|i| i as usize).collect()
    }

    fn cached_sequence(&self, cache: &Mutex<HashMap<u32, Arc<[u32]>>>, keyhash: u32) -> Arc<[u32]> {
        let mut cache = cache.lock().unwrap();
        if let Some(seq) = cache.get(&keyhash) {
            return seq.clone();
        }
        let seq: Arc<[u32]> = self.full_sequence(keyhash).into();
        cache.insert(keyhash, seq.clone());
        seq
    }

    fn full_sequence(&self, keyhash: u32) -> Vec<u32> {
        let mut order: Vec<u32> = (0..self.buckets.len() as u32).collect();
        order.sort_by(|&a, &b| {
            let (ba, bb) = (&self.buckets[a as usize], &self.buckets[b as usize]);
            score(bb, keyhash)
                .total_cmp(&score(ba, keyhash))
                .then_with(|| bb.identity.cmp(&ba.identity))
                .then(a.cmp(&b))
        });
        order
    }
}

// Weighted rendezvous score: map the bucket/key hash to a uniform value in
// (0, 1] and scale by -weight / ln(u). Doubling a weight doubles the
// bucket's expected share of first choices over uniformly random keys.
fn score(bucket: &Bucket, keyhash: u32) -> f64 {
    let mut buf = Vec::with_capacity(bucket.identity.len() + 4);
    buf.extend_from_slice(&bucket.identity);
    buf.extend_from_slice(&keyhash.to_le_bytes());
    let h = xxhash_rust::xxh32::xxh32(&buf, 0);

    let u = (h as f64 + 1.0) / (u32::MAX as f64 + 1.0);
    let weight = bucket.weight.max(1) as f64;
    -weight / u.ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers(n: usize) -> Vec<Bucket> {
        (0..n)
            .map(|i| Bucket::new(format!("host{i}+11211")))
            .collect()
    }

    #[test]
    fn sequence_is_a_prefix_permutation() {
        let hs = HashSequencer::new(servers(7), 0xffff);
        for keyhash in (0..5000u32).map(|i| i * 131) {
            let seq = hs.sequence_hash(keyhash, 7);
            assert_eq!(seq.len(), 7);

            let mut sorted = seq.clone();
            sorted.sort();
            sorted.dedup();
            assert_eq!(sorted.len(), 7, "indices must be distinct");

            assert_eq!(seq[0], hs.which_hash(keyhash).unwrap());

            // A shorter request is a prefix of the longer one.
            assert_eq!(&seq[..3], &hs.sequence_hash(keyhash, 3)[..]);
        }
    }

    #[test]
    fn deterministic_and_cache_transparent() {
        let plain = HashSequencer::new(servers(5), 0xffff);
        let cached = HashSequencer::new(servers(5), 0xffff).enable_cache();
        for keyhash in 0..2000u32 {
            assert_eq!(
                plain.sequence_hash(keyhash, 5),
                cached.sequence_hash(keyhash, 5)
            );
        }
    }

    #[test]
    fn weight_share_tracks_weight() {
        let buckets = vec![
            Bucket::weighted("a+6379", 1),
            Bucket::weighted("b+6379", 2),
            Bucket::weighted("c+6379", 1),
        ];
        let hs = HashSequencer::new(buckets, 0);

        let mut hits = [0usize; 3];
        for keyhash in 0..20_000u32 {
            hits[hs.which_hash(keyhash.wrapping_mul(2654435761)).unwrap()] += 1;
        }
        let share = hits[1] as f64 / 20_000.0;
        // Expected share is 2/4 = 0.5.
        assert!((0.44..0.56).contains(&share), "share={share}");
    }

    #[test]
    fn adding_a_bucket_moves_few_keys() {
        let before = HashSequencer::new(servers(8), 0);
        let mut grown = servers(8);
        grown.push(Bucket::new("host8+11211"));
        let after = HashSequencer::new(grown, 0);

        let mut moved = 0usize;
        let total = 10_000u32;
        for keyhash in 0..total {
            let keyhash = keyhash.wrapping_mul(2654435761);
            let (b, a) = (
                before.which_hash(keyhash).unwrap(),
                after.which_hash(keyhash).unwrap(),
            );
            if b != a {
                // Keys only move onto the new bucket, never between old ones.
                assert_eq!(a, 8);
                moved += 1;
            }
        }
        // Expected 1/9 of keys; leave generous slack.
        assert!(moved < total as usize / 5, "moved={moved}");
    }

    #[test]
    fn empty_and_single() {
        let empty = HashSequencer::new(vec![], 0xffff);
        assert_eq!(empty.which(b"k"), None);
        assert!(empty.sequence(b"k", 4).is_empty());

        let one = HashSequencer::new(servers(1), 0xffff);
        assert_eq!(one.which(b"k"), Some(0));
        assert_eq!(one.sequence(b"k", 4), vec![0]);
    }
}
