//! Read-after-write stickiness: a bounded LRU of (connection, caller,
//! kind) digests with the time of the last write. Reads by the same
//! triple within the sticky window route to the primary.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

pub const STICKY_INTERVAL_SECS: u64 = 5;
const MAP_CAPACITY: usize = 65536;

/// MD5 digest of `connection-info ‖ caller ‖ kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallerKindMd5([u8; 16]);

impl CallerKindMd5 {
    pub fn new(con: &str, caller: &str, kind: &str) -> Self {
        let mut ctx = md5::Context::new();
        ctx.consume(con.as_bytes());
        ctx.consume(caller.as_bytes());
        ctx.consume(kind.as_bytes());
        Self(ctx.compute().0)
    }
}

pub struct CallerKindMap {
    map: Mutex<LruCache<CallerKindMd5, u64>>,
}

impl Default for CallerKindMap {
    fn default() -> Self {
        Self::new(MAP_CAPACITY)
    }
}

impl CallerKindMap {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
        }
    }

    /// Record a write at `now` (unix seconds).
    pub fn replace(&self, now: u64, ck: CallerKindMd5) {
        self.map.lock().unwrap().put(ck, now);
    }

    /// True iff the triple wrote within the sticky window. An expired
    /// entry is deleted on the way out.
    pub fn find(&self, now: u64, ck: &CallerKindMd5) -> bool {
        let mut map = self.map.lock().unwrap();
        let at = map.get(ck).copied();
        match at {
            Some(at) if at > now.saturating_sub(STICKY_INTERVAL_SECS) => true,
            Some(_) => {
                map.pop(ck);
                false
            }
            None => false,
        }
    }

    /// Evict every entry at or beyond the sticky window, walking the LRU
    /// tail.
    pub fn reap(&self, now: u64) {
        let expire = now.saturating_sub(STICKY_INTERVAL_SECS);
        let mut map = self.map.lock().unwrap();
        loop {
            let stale = matches!(map.peek_lru(), Some((_, &at)) if at <= expire);
            if !stale {
                break;
            }
            map.pop_lru();
        }
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ck(name: &str) -> CallerKindMd5 {
        CallerKindMd5::new("tcp/10.0.0.1:9000/10.0.0.2:55000", name, "user")
    }

    #[test]
    fn sticky_within_the_window() {
        let map = CallerKindMap::default();
        map.replace(100, ck("svcA"));

        assert!(map.find(100, &ck("svcA")));
        assert!(map.find(104, &ck("svcA")));
        // Other callers are unaffected.
        assert!(!map.find(100, &ck("svcB")));
    }

    #[test]
    fn expired_entries_vanish_on_lookup() {
        let map = CallerKindMap::default();
        map.replace(100, ck("svcA"));

        assert!(!map.find(105, &ck("svcA")));
        assert!(map.is_empty(), "expired hit must delete the entry");
    }

    #[test]
    fn a_fresh_write_renews_the_window() {
        let map = CallerKindMap::default();
        map.replace(100, ck("svcA"));
        map.replace(103, ck("svcA"));
        assert!(map.find(107, &ck("svcA")));
    }

    #[test]
    fn reap_walks_the_stale_tail() {
        let map = CallerKindMap::default();
        map.replace(100, ck("old1"));
        map.replace(101, ck("old2"));
        map.replace(110, ck("fresh"));

        map.reap(110);
        assert_eq!(map.len(), 1);
        assert!(map.find(110, &ck("fresh")));
    }

    #[test]
    fn capacity_is_bounded() {
        let map = CallerKindMap::new(4);
        for i in 0..10 {
            map.replace(100, ck(&format!("caller{i}")));
        }
        assert_eq!(map.len(), 4);
    }

    #[test]
    fn digests_cover_all_three_parts() {
        let a = CallerKindMd5::new("con", "caller", "kind");
        assert_ne!(a, CallerKindMd5::new("con", "caller", "kine"));
        assert_ne!(a, CallerKindMd5::new("con", "callex", "kind"));
        assert_ne!(a, CallerKindMd5::new("cox", "caller", "kind"));
    }
}
