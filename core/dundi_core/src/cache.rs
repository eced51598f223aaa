//! Answer and hint cache over the key-value store
//!
//! Entries live under `dundi/cache`. An answer set from one peer is stored
//! under two keys:
//!
//! ```text
//! <peer>/<number>/<context>/e<avoid crc, or 0 when unaffected>
//! <peer>/<number>/<context>/r<root eid>
//! ```
//!
//! The value is `<expiry epoch>|` followed by one
//! `<flags>/<weight>/<tech>/<dest>/<eid>|` per answer. Hints use the same
//! keys with a `hint/` prefix and the hinted prefix in place of the number.

use std::io;
use std::sync::Arc;

use crate::eid::Eid;
use crate::mapping::Tech;
use crate::request::{AnswerSet, DundiResult};
use crate::store::KvStore;
use crate::wire::{self, hint};

pub const CACHE_FAMILY: &str = "dundi/cache";

/// What a cache entry is keyed on, besides the answering peer
#[derive(Debug, Clone, Copy)]
pub struct CacheKey<'a> {
    pub number: &'a str,
    pub context: &'a str,
    pub crc32: u32,
    pub root: Eid,
}

/// Expiration-aware answer cache
#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn KvStore>,
    /// Default lifetime when a response carries none, in seconds
    pub cachetime: u32,
    /// Extra lifetime granted to pushed (precached) answers
    pub push_grace: i64,
    /// Lifetime removed from pulled answers so they revalidate early
    pub pull_grace: i64,
}

impl Cache {
    pub fn new(store: Arc<dyn KvStore>, cachetime: u32) -> Self {
        Self {
            store,
            cachetime,
            push_grace: 10,
            pull_grace: 10,
        }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    fn adjusted_expiration(&self, expiration: i64, push: bool) -> i64 {
        let mut expiration = if expiration < 1 {
            self.cachetime as i64
        } else {
            expiration
        };
        if push {
            expiration += self.push_grace;
        } else {
            expiration -= self.pull_grace;
        }
        expiration.max(1)
    }

    /// Store `results` answered by `peer`.
    ///
    /// Destinations containing `|` cannot be represented and are skipped.
    pub fn save(
        &self,
        peer: &Eid,
        key: &CacheKey<'_>,
        results: &[DundiResult],
        unaffected: bool,
        expiration: i64,
        push: bool,
        now: u64,
    ) -> io::Result<()> {
        let expiration = self.adjusted_expiration(expiration, push);
        let crc = if unaffected { 0 } else { key.crc32 };
        let key1 = format!("{}/{}/{}/e{:08x}", peer.short(), key.number, key.context, crc);
        let key2 = format!("{}/{}/{}/r{}", peer.short(), key.number, key.context, key.root.short());

        let timeout = now as i64 + expiration;
        let mut data = format!("{}|", timeout);
        for r in results {
            if r.dest.contains('|') {
                continue;
            }
            data.push_str(&format!(
                "{}/{}/{}/{}/{}|",
                r.flags,
                r.weight,
                r.tech.code(),
                r.dest,
                r.eid.short()
            ));
        }
        log::trace!("Caching {} answers from {} under '{}'", results.len(), peer, key1);
        self.store.put(CACHE_FAMILY, &key1, &data)?;
        self.store.put(CACHE_FAMILY, &key2, &data)
    }

    /// Remember that `peer` has nothing under the hinted prefix.
    /// Only stored when the peer signalled DONT_ASK.
    pub fn save_hint(
        &self,
        peer: &Eid,
        key: &CacheKey<'_>,
        peer_hint: &wire::Hint,
        expiration: i64,
        now: u64,
    ) -> io::Result<()> {
        if peer_hint.flags & hint::DONT_ASK == 0 {
            return Ok(());
        }
        let expiration = if expiration < 0 {
            self.cachetime as i64
        } else {
            expiration
        };
        let crc = if peer_hint.flags & hint::UNAFFECTED != 0 { 0 } else { key.crc32 };
        let key1 = format!("hint/{}/{}/{}/e{:08x}", peer.short(), peer_hint.data, key.context, crc);
        let key2 = format!("hint/{}/{}/{}/r{}", peer.short(), peer_hint.data, key.context, key.root.short());
        let data = format!("{}|", now as i64 + expiration);
        self.store.put(CACHE_FAMILY, &key1, &data)?;
        self.store.put(CACHE_FAMILY, &key2, &data)
    }

    /// Read one entry, merging its answers into `answers`.
    /// Expired entries are deleted. Returns whether a live entry was found.
    fn lookup_one(&self, key: &str, answers: &mut AnswerSet, low_expiration: &mut i64, now: u64) -> bool {
        let Some(value) = self.store.get(CACHE_FAMILY, key) else {
            return false;
        };
        let mut parts = value.split('|');
        let timeout: i64 = match parts.next().and_then(|t| t.parse().ok()) {
            Some(t) => t,
            None => {
                let _ = self.store.delete(CACHE_FAMILY, key);
                return false;
            }
        };
        if now as i64 >= timeout {
            log::trace!("Expiring cache entry '{}'", key);
            if let Err(e) = self.store.delete(CACHE_FAMILY, key) {
                log::warn!("Failed to remove expired cache entry '{}': {}", key, e);
            }
            return false;
        }
        let expiration = timeout - now as i64;
        if expiration < *low_expiration {
            *low_expiration = expiration;
        }
        log::debug!("Found cache entry '{}', expiring in {} seconds", key, expiration);
        for entry in parts.filter(|p| !p.is_empty()) {
            if let Some(result) = parse_entry(entry, expiration as u32) {
                answers.merge(result);
            }
        }
        true
    }

    /// Look up answers `peer` gave for this key.
    ///
    /// Checks the exact avoid-set entry, the unaffected entry and the root
    /// entry. When none yields an answer, hint entries for successively
    /// shorter prefixes of the number are consulted; a live hint marks the
    /// request DONT_ASK.
    pub fn lookup(&self, peer: &Eid, key: &CacheKey<'_>, answers: &mut AnswerSet, now: u64) -> bool {
        let peer_short = peer.short();
        let root_short = key.root.short();
        let mut low = answers.expiration;

        let key1 = format!("{}/{}/{}/e{:08x}", peer_short, key.number, key.context, key.crc32);
        let key2 = format!("{}/{}/{}/e{:08x}", peer_short, key.number, key.context, 0);
        let key3 = format!("{}/{}/{}/r{}", peer_short, key.number, key.context, root_short);
        let mut found = self.lookup_one(&key1, answers, &mut low, now);
        found |= self.lookup_one(&key2, answers, &mut low, now);
        found |= self.lookup_one(&key3, answers, &mut low, now);

        if answers.results.is_empty() {
            let mut hinted = false;
            let mut prefix = key.number;
            while !prefix.is_empty() {
                let key1 = format!("hint/{}/{}/{}/e{:08x}", peer_short, prefix, key.context, key.crc32);
                let key2 = format!("hint/{}/{}/{}/e{:08x}", peer_short, prefix, key.context, 0);
                let key3 = format!("hint/{}/{}/{}/r{}", peer_short, prefix, key.context, root_short);
                let mut found_hint = self.lookup_one(&key1, answers, &mut low, now);
                found_hint |= self.lookup_one(&key2, answers, &mut low, now);
                found_hint |= self.lookup_one(&key3, answers, &mut low, now);
                if found_hint {
                    if prefix.len() > answers.hint.exten.len() {
                        answers.hint.exten = prefix.to_string();
                    }
                    hinted = true;
                    break;
                }
                let cut = prefix.char_indices().last().map(|(i, _)| i).unwrap_or(0);
                prefix = &prefix[..cut];
            }
            if hinted {
                answers.hint.set(hint::DONT_ASK);
                found = true;
            }
        }
        answers.expiration = low;
        found
    }

    /// Drop every cache entry. Returns the number removed.
    pub fn flush(&self) -> io::Result<usize> {
        self.store.delete_tree(CACHE_FAMILY, None)
    }
}

fn parse_entry(entry: &str, expiration: u32) -> Option<DundiResult> {
    let mut fields = entry.splitn(4, '/');
    let flags: u16 = fields.next()?.parse().ok()?;
    let weight: u16 = fields.next()?.parse().ok()?;
    let tech: u16 = fields.next()?.parse().ok()?;
    let rest = fields.next()?;
    let (dest, eid) = match rest.rfind('/') {
        Some(idx) => (&rest[..idx], Eid::from_short(&rest[idx + 1..]).unwrap_or(Eid::ZERO)),
        None => (rest, Eid::ZERO),
    };
    Some(DundiResult {
        flags,
        weight,
        expiration,
        tech: Tech::from_code(tech),
        eid,
        dest: dest.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{HintMetadata, MAX_RESULTS};
    use crate::store::MemoryStore;
    use crate::wire::flags;

    const NOW: u64 = 1_700_000_000;

    fn peer() -> Eid {
        Eid([0, 1, 2, 3, 4, 5])
    }

    fn key(crc32: u32) -> CacheKey<'static> {
        CacheKey {
            number: "5551234",
            context: "e164",
            crc32,
            root: Eid([9; 6]),
        }
    }

    fn answer(dest: &str, weight: u16) -> DundiResult {
        DundiResult {
            flags: flags::EXISTS,
            weight,
            expiration: 3600,
            tech: Tech::Iax,
            eid: peer(),
            dest: dest.into(),
        }
    }

    fn fresh() -> AnswerSet {
        AnswerSet::new(MAX_RESULTS, HintMetadata::pessimistic(), 3600)
    }

    fn cache() -> (Cache, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Cache::new(store.clone(), 3600), store)
    }

    #[test]
    fn test_save_then_lookup() {
        let (cache, _) = cache();
        let results = vec![answer("guest@pbx/5551234", 0), answer("a|b", 5)];
        cache.save(&peer(), &key(0xabcd), &results, false, 600, false, NOW).unwrap();

        let mut answers = fresh();
        assert!(cache.lookup(&peer(), &key(0xabcd), &mut answers, NOW + 1));
        assert_eq!(answers.results.len(), 1);
        let r = &answers.results[0];
        assert_eq!(r.dest, "guest@pbx/5551234");
        assert_eq!(r.eid, peer());
        assert_eq!(r.tech, Tech::Iax);
        // pull grace takes 10 seconds off, one second elapsed
        assert_eq!(answers.expiration, 589);
        assert_eq!(r.expiration, 589);
    }

    #[test]
    fn test_root_key_matches_other_avoid_set() {
        let (cache, _) = cache();
        cache.save(&peer(), &key(1), &[answer("x", 0)], false, 600, false, NOW).unwrap();
        let mut answers = fresh();
        assert!(cache.lookup(&peer(), &key(2), &mut answers, NOW));
        assert_eq!(answers.results.len(), 1);
    }

    #[test]
    fn test_expired_entries_removed() {
        let (cache, store) = cache();
        cache.save(&peer(), &key(1), &[answer("x", 0)], true, 20, false, NOW).unwrap();
        assert_eq!(store.len(), 2);
        let mut answers = fresh();
        assert!(!cache.lookup(&peer(), &key(1), &mut answers, NOW + 10));
        assert!(answers.results.is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_push_grace_and_minimum() {
        let (cache, _) = cache();
        cache.save(&peer(), &key(1), &[answer("x", 0)], false, 5, false, NOW).unwrap();
        let mut answers = fresh();
        assert!(cache.lookup(&peer(), &key(1), &mut answers, NOW));
        assert_eq!(answers.expiration, 1);

        cache.save(&peer(), &key(1), &[answer("x", 0)], false, 5, true, NOW).unwrap();
        let mut answers = fresh();
        assert!(cache.lookup(&peer(), &key(1), &mut answers, NOW));
        assert_eq!(answers.expiration, 15);
    }

    #[test]
    fn test_hint_prefix() {
        let (cache, _) = cache();
        let h = wire::Hint {
            flags: hint::DONT_ASK | hint::UNAFFECTED,
            data: "555".into(),
        };
        cache.save_hint(&peer(), &key(1), &h, 600, NOW).unwrap();

        let mut answers = AnswerSet::new(MAX_RESULTS, HintMetadata::default(), 3600);
        assert!(cache.lookup(&peer(), &key(7), &mut answers, NOW));
        assert!(answers.results.is_empty());
        assert!(answers.hint.has(hint::DONT_ASK));
        assert_eq!(answers.hint.exten, "555");
    }

    #[test]
    fn test_hint_without_dont_ask_not_stored() {
        let (cache, store) = cache();
        let h = wire::Hint { flags: hint::UNAFFECTED, data: "5".into() };
        cache.save_hint(&peer(), &key(1), &h, 600, NOW).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_miss_and_flush() {
        let (cache, store) = cache();
        let mut answers = fresh();
        assert!(!cache.lookup(&peer(), &key(1), &mut answers, NOW));
        cache.save(&peer(), &key(1), &[answer("x", 0)], false, 600, false, NOW).unwrap();
        assert_eq!(cache.flush().unwrap(), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_parse_entry_with_slashes() {
        let r = parse_entry("1/10/3/sip:100@host/path/000102030405", 30).unwrap();
        assert_eq!(r.dest, "sip:100@host/path");
        assert_eq!(r.eid, Eid([0, 1, 2, 3, 4, 5]));
        assert_eq!(r.tech, Tech::Sip);
        assert!(parse_entry("garbage", 30).is_none());
    }
}
