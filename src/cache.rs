use std::collections::{BTreeMap, VecDeque};
use std::ops::Range;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::codec;

/// 缓存键：原始请求字节，事务 ID 置零，问题名折叠为小写
/// Cache key: the raw request bytes with the id zeroed and the question name
/// case-folded. Two requests differing only in id or letter casing map to
/// the same key; equality and ordering are plain byte-sequence comparison.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CacheKey(Vec<u8>);

impl CacheKey {
    pub fn new(raw: &[u8], qname: Range<usize>) -> Self {
        let mut key = raw.to_vec();
        key[0] = 0;
        key[1] = 0;
        codec::fold_lowercase(&mut key[qname]);
        CacheKey(key)
    }
}

#[derive(Debug)]
struct Entry {
    answer: Bytes,
    expires_at: Instant,
}

/// Answer cache bounded by both TTL and entry count.
///
/// Two structures over the same entries: an ordered index keyed by the raw
/// key bytes, and an insertion-ordered list used for eviction. Every live
/// entry appears in exactly both. Insertion order approximates expiry order
/// because the TTL ceiling bounds how far the two can drift.
#[derive(Debug)]
pub struct AnswerCache {
    index: BTreeMap<CacheKey, Entry>,
    eviction: VecDeque<CacheKey>,
    max_entries: usize,
    ttl_ceiling: Duration,
    /// Lifetime cache-hit count, read by the stats dump.
    pub hits: u64,
}

impl AnswerCache {
    pub fn new(max_entries: usize, ttl_ceiling: Duration) -> Self {
        Self {
            index: BTreeMap::new(),
            eviction: VecDeque::new(),
            max_entries,
            ttl_ceiling,
            hits: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Ordered lookup; a hit bumps the lifetime hit counter. Entries past
    /// their expiry never hit, even before the eviction sweep removes them.
    pub fn lookup(&mut self, key: &CacheKey, now: Instant) -> Option<Bytes> {
        let entry = self.index.get(key)?;
        if entry.expires_at <= now {
            return None;
        }
        self.hits += 1;
        Some(entry.answer.clone())
    }

    /// Commit a validated answer. First committer wins: a racing identical
    /// in-flight query that commits second is discarded silently.
    pub fn insert(&mut self, key: CacheKey, answer: Bytes, ttl_secs: u32, now: Instant) {
        if self.index.contains_key(&key) {
            return;
        }
        let ttl = Duration::from_secs(u64::from(ttl_secs)).min(self.ttl_ceiling);
        self.index.insert(
            key.clone(),
            Entry {
                answer,
                expires_at: now + ttl,
            },
        );
        self.eviction.push_back(key);
    }

    /// Pop expired entries off the head of the eviction list, removing them
    /// from both structures.
    pub fn evict_expired(&mut self, now: Instant) {
        while let Some(head) = self.eviction.front() {
            match self.index.get(head) {
                Some(entry) if entry.expires_at <= now => {
                    self.index.remove(head);
                    self.eviction.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Unconditionally shed the oldest entries, expired or not, until the
    /// configured maximum holds. This bounds memory under TTL abuse.
    pub fn evict_over_capacity(&mut self) {
        while self.index.len() > self.max_entries {
            let Some(head) = self.eviction.pop_front() else {
                break;
            };
            self.index.remove(&head);
        }
    }

    /// Expiry of the oldest entry, the cache's contribution to the next
    /// soft-timer wake.
    pub fn next_expiry(&self) -> Option<Instant> {
        let head = self.eviction.front()?;
        Some(self.index.get(head)?.expires_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::parse_minimal;

    fn key_for(id: u16, name: &str) -> CacheKey {
        let raw = crate::codec::tests::build_query(id, name, 1);
        let info = parse_minimal(&raw).expect("parse");
        CacheKey::new(&raw, info.qname)
    }

    fn cache(max: usize, ceiling: u64) -> AnswerCache {
        AnswerCache::new(max, Duration::from_secs(ceiling))
    }

    #[test]
    fn key_ignores_id_and_casing() {
        assert_eq!(key_for(0x1234, "Example.COM"), key_for(0x5678, "example.com"));
        assert_ne!(key_for(1, "example.com"), key_for(1, "example.org"));
    }

    #[test]
    fn lookup_hit_within_ttl_and_miss_after() {
        let mut c = cache(16, 3600);
        let now = Instant::now();
        let key = key_for(1, "example.com");
        c.insert(key.clone(), Bytes::from_static(b"answer"), 300, now);

        assert_eq!(
            c.lookup(&key, now + Duration::from_secs(299)),
            Some(Bytes::from_static(b"answer"))
        );
        assert_eq!(c.hits, 1);
        assert_eq!(c.lookup(&key, now + Duration::from_secs(300)), None);
        assert_eq!(c.hits, 1);
    }

    #[test]
    fn ttl_is_capped_at_ceiling() {
        let mut c = cache(16, 60);
        let now = Instant::now();
        let key = key_for(1, "example.com");
        c.insert(key.clone(), Bytes::from_static(b"a"), 86_400, now);
        assert!(c.lookup(&key, now + Duration::from_secs(59)).is_some());
        assert!(c.lookup(&key, now + Duration::from_secs(60)).is_none());
    }

    #[test]
    fn zero_ttl_never_hits() {
        let mut c = cache(16, 300);
        let now = Instant::now();
        let key = key_for(1, "example.com");
        c.insert(key.clone(), Bytes::from_static(b"a"), 0, now);
        assert!(c.lookup(&key, now).is_none());
    }

    #[test]
    fn first_committer_wins() {
        let mut c = cache(16, 300);
        let now = Instant::now();
        let key = key_for(1, "example.com");
        c.insert(key.clone(), Bytes::from_static(b"first"), 300, now);
        c.insert(key.clone(), Bytes::from_static(b"second"), 300, now);
        assert_eq!(c.len(), 1);
        assert_eq!(
            c.lookup(&key, now + Duration::from_secs(1)),
            Some(Bytes::from_static(b"first"))
        );
    }

    #[test]
    fn evict_expired_pops_from_head_only() {
        let mut c = cache(16, 300);
        let now = Instant::now();
        c.insert(key_for(1, "a.example"), Bytes::from_static(b"a"), 10, now);
        c.insert(key_for(1, "b.example"), Bytes::from_static(b"b"), 300, now);
        c.insert(key_for(1, "c.example"), Bytes::from_static(b"c"), 10, now);

        c.evict_expired(now + Duration::from_secs(11));
        // head expired and left; the unexpired second entry stops the sweep
        assert_eq!(c.len(), 2);
        assert!(
            c.lookup(&key_for(9, "b.example"), now + Duration::from_secs(11))
                .is_some()
        );
        // the stranded third entry still never hits
        assert!(
            c.lookup(&key_for(9, "c.example"), now + Duration::from_secs(11))
                .is_none()
        );
    }

    #[test]
    fn capacity_eviction_drops_oldest_first() {
        let mut c = cache(2, 300);
        let now = Instant::now();
        c.insert(key_for(1, "a.example"), Bytes::from_static(b"a"), 300, now);
        c.insert(key_for(1, "b.example"), Bytes::from_static(b"b"), 300, now);
        c.insert(key_for(1, "c.example"), Bytes::from_static(b"c"), 300, now);

        c.evict_over_capacity();
        assert_eq!(c.len(), 2);
        let later = now + Duration::from_secs(1);
        assert!(c.lookup(&key_for(1, "a.example"), later).is_none());
        assert!(c.lookup(&key_for(1, "b.example"), later).is_some());
        assert!(c.lookup(&key_for(1, "c.example"), later).is_some());
    }

    #[test]
    fn index_and_eviction_list_stay_in_step() {
        let mut c = cache(4, 300);
        let now = Instant::now();
        for (i, name) in ["a", "b", "c", "d", "e", "f"].iter().enumerate() {
            c.insert(
                key_for(1, &format!("{name}.example")),
                Bytes::from_static(b"x"),
                (i as u32 % 3) * 20,
                now,
            );
        }
        c.evict_over_capacity();
        c.evict_expired(now + Duration::from_secs(21));
        assert_eq!(c.index.len(), c.eviction.len());
    }

    #[test]
    fn next_expiry_tracks_head() {
        let mut c = cache(16, 300);
        let now = Instant::now();
        assert!(c.next_expiry().is_none());
        c.insert(key_for(1, "a.example"), Bytes::from_static(b"a"), 30, now);
        c.insert(key_for(1, "b.example"), Bytes::from_static(b"b"), 300, now);
        assert_eq!(c.next_expiry(), Some(now + Duration::from_secs(30)));
    }
}
