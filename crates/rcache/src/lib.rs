//! The proxy's process-wide answer/value cache: 160-bit fingerprint keys
//! mapping to immutable refcounted records, bounded LRU, and an O(1)
//! whole-cache invalidation by revision epoch.

use bytes::Bytes;
use lru::LruCache;
use sha1::{Digest, Sha1};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use xic::Value;

/// What a cached record holds. Fingerprints of different kinds never
/// collide because the kind participates in the digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RKind {
    Answer,
    MCache,
    LCache,
}

impl RKind {
    fn tag(self) -> u8 {
        match self {
            RKind::Answer => 1,
            RKind::MCache => 2,
            RKind::LCache => 3,
        }
    }
}

/// SHA-1 fingerprint over (kind, payload). Equality and hash cover the
/// full 160 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RKey([u8; 20]);

impl RKey {
    pub fn answer(service: &[u8], method: &[u8], args: &[u8]) -> Self {
        Self::digest(RKind::Answer, &[service, method, args])
    }

    pub fn mcache(service: &[u8], key: &[u8]) -> Self {
        Self::digest(RKind::MCache, &[service, key])
    }

    pub fn lcache(key: &[u8]) -> Self {
        Self::digest(RKind::LCache, &[key])
    }

    // Parts are length-framed so ("s", "k") and ("sk", "") never collide.
    fn digest(kind: RKind, parts: &[&[u8]]) -> Self {
        let mut h = Sha1::new();
        h.update([kind.tag()]);
        for part in parts {
            h.update((part.len() as u32).to_le_bytes());
            h.update(part);
        }
        Self(h.finalize().into())
    }
}

#[derive(Debug)]
struct RDataInner {
    ctime: u64,
    kind: RKind,
    status: i32,
    payload: Bytes,
}

/// An immutable cache record. Cloning is a refcount bump, and the payload
/// `Bytes` can be lent onward (e.g. into an answer) without copying.
#[derive(Debug, Clone)]
pub struct RData {
    inner: Arc<RDataInner>,
}

impl RData {
    pub fn new(ctime: u64, kind: RKind, payload: impl Into<Bytes>) -> Self {
        Self {
            inner: Arc::new(RDataInner {
                ctime,
                kind,
                status: 0,
                payload: payload.into(),
            }),
        }
    }

    pub fn with_status(ctime: u64, kind: RKind, status: i32, payload: impl Into<Bytes>) -> Self {
        Self {
            inner: Arc::new(RDataInner {
                ctime,
                kind,
                status,
                payload: payload.into(),
            }),
        }
    }

    pub fn ctime(&self) -> u64 {
        self.inner.ctime
    }

    pub fn kind(&self) -> RKind {
        self.inner.kind
    }

    pub fn status(&self) -> i32 {
        self.inner.status
    }

    pub fn payload(&self) -> Bytes {
        self.inner.payload.clone()
    }
}

struct Entry {
    revision: u64,
    data: RData,
}

struct Inner {
    map: LruCache<RKey, Entry>,
    revision: u64,
}

pub struct RCache {
    inner: Mutex<Inner>,
}

impl RCache {
    pub fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).unwrap();
        Self {
            inner: Mutex::new(Inner {
                map: LruCache::new(cap),
                revision: 1,
            }),
        }
    }

    /// Look up without promoting. Entries from an older revision epoch are
    /// invisible (but still occupy a slot until evicted).
    pub fn find(&self, key: &RKey) -> Option<RData> {
        let inner = self.inner.lock().unwrap();
        let entry = inner.map.peek(key)?;
        (entry.revision == inner.revision).then(|| entry.data.clone())
    }

    /// Look up and promote to most-recently-used.
    pub fn fetch(&self, key: &RKey) -> Option<RData> {
        let mut inner = self.inner.lock().unwrap();
        let revision = inner.revision;
        let entry = inner.map.get(key)?;
        (entry.revision == revision).then(|| entry.data.clone())
    }

    /// Insert or overwrite, stamping the current epoch. The LRU entry is
    /// evicted when the map is at capacity.
    pub fn replace(&self, key: RKey, data: RData) {
        let mut inner = self.inner.lock().unwrap();
        let revision = inner.revision;
        inner.map.put(key, Entry { revision, data });
    }

    pub fn remove(&self, key: &RKey) -> bool {
        self.inner.lock().unwrap().map.pop(key).is_some()
    }

    /// Atomic read-add-write of an integer local-cache value. A present,
    /// current-epoch LCache entry created after `after` contributes its
    /// value; anything else restarts the counter at `delta`.
    pub fn plus(&self, key: RKey, delta: i64, now: u64, after: u64) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        let revision = inner.revision;

        if let Some(entry) = inner.map.get_mut(&key) {
            if entry.revision == revision
                && entry.data.ctime() > after
                && entry.data.kind() == RKind::LCache
            {
                if let Ok(Value::Int(old)) = xic::decode_value(&entry.data.payload()) {
                    let value = old + delta;
                    if value != old {
                        entry.data =
                            RData::new(now, RKind::LCache, xic::encode_value(&Value::Int(value)));
                    }
                    return value;
                }
            }
        }

        let data = RData::new(now, RKind::LCache, xic::encode_value(&Value::Int(delta)));
        inner.map.put(key, Entry { revision, data });
        delta
    }

    /// Evict up to `max_n` least-recently-used entries whose ctime is
    /// before `older_than`. Stops at the first survivor.
    pub fn reap(&self, max_n: usize, older_than: u64) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut evicted = 0;
        while evicted < max_n {
            let stale = matches!(
                inner.map.peek_lru(),
                Some((_, entry)) if entry.data.ctime() < older_than
            );
            if !stale {
                break;
            }
            inner.map.pop_lru();
            evicted += 1;
        }
        evicted
    }

    /// Logically invalidate every entry by bumping the revision epoch.
    pub fn clear(&self) {
        self.inner.lock().unwrap().revision += 1;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn clear_bumps_epoch_without_removing() {
        let cache = RCache::new(16);
        let key = RKey::lcache(b"x");
        cache.replace(key, RData::new(10, RKind::LCache, bytes("v")));
        assert!(cache.fetch(&key).is_some());

        cache.clear();
        assert!(cache.find(&key).is_none());
        assert_eq!(cache.len(), 1, "stale entry still counted");

        let fresh = RKey::lcache(b"y");
        cache.replace(fresh, RData::new(11, RKind::LCache, bytes("w")));
        assert!(cache.find(&key).is_none());
        assert!(cache.find(&fresh).is_some());
    }

    #[test]
    fn plus_accumulates_per_key() {
        let cache = RCache::new(16);
        let key = RKey::lcache(b"counter");
        let mut sum = 0;
        for (i, delta) in [5i64, -2, 0, 9].into_iter().enumerate() {
            sum += delta;
            assert_eq!(cache.plus(key, delta, i as u64 + 1, 0), sum);
        }
    }

    #[test]
    fn plus_restarts_on_stale_ctime() {
        let cache = RCache::new(16);
        let key = RKey::lcache(b"counter");
        assert_eq!(cache.plus(key, 3, 100, 0), 3);
        // Entry ctime 100 is not after 200: start over.
        assert_eq!(cache.plus(key, 4, 300, 200), 4);
    }

    #[test]
    fn lru_eviction_and_promotion() {
        let cache = RCache::new(2);
        let (a, b, c) = (RKey::lcache(b"a"), RKey::lcache(b"b"), RKey::lcache(b"c"));
        cache.replace(a, RData::new(1, RKind::LCache, bytes("a")));
        cache.replace(b, RData::new(2, RKind::LCache, bytes("b")));

        // Promote `a`, then insert `c`: `b` is the LRU and gets evicted.
        assert!(cache.fetch(&a).is_some());
        cache.replace(c, RData::new(3, RKind::LCache, bytes("c")));
        assert!(cache.find(&a).is_some());
        assert!(cache.find(&b).is_none());
        assert!(cache.find(&c).is_some());
    }

    #[test]
    fn find_does_not_promote() {
        let cache = RCache::new(2);
        let (a, b, c) = (RKey::lcache(b"a"), RKey::lcache(b"b"), RKey::lcache(b"c"));
        cache.replace(a, RData::new(1, RKind::LCache, bytes("a")));
        cache.replace(b, RData::new(2, RKind::LCache, bytes("b")));

        // `find` leaves `a` as the LRU entry.
        assert!(cache.find(&a).is_some());
        cache.replace(c, RData::new(3, RKind::LCache, bytes("c")));
        assert!(cache.find(&a).is_none());
        assert!(cache.find(&b).is_some());
    }

    #[test]
    fn reap_walks_the_tail() {
        let cache = RCache::new(8);
        for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
            cache.replace(
                RKey::lcache(name.as_bytes()),
                RData::new(i as u64, RKind::LCache, bytes(name)),
            );
        }
        // a(0) and b(1) are older than 2; c(2) stops the walk.
        assert_eq!(cache.reap(10, 2), 2);
        assert_eq!(cache.len(), 2);
        assert!(cache.find(&RKey::lcache(b"c")).is_some());
    }

    #[test]
    fn fingerprints_distinguish_kinds() {
        assert_ne!(RKey::lcache(b"k"), RKey::mcache(b"", b"k"));
        assert_ne!(RKey::mcache(b"s", b"k"), RKey::mcache(b"sk", b""));
    }
}
