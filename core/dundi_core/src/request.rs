//! Lookup results and the requests that collect them

use std::time::Instant;

use crate::eid::{avoid_crc32, Eid};
use crate::mapping::Tech;
use crate::transaction::TransId;
use crate::wire::{self, hint, Answer, IeSet};

/// Most answers a single request keeps
pub const MAX_RESULTS: usize = 64;

pub type RequestId = u64;

/// One answer: how to reach a number and how good the route is
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DundiResult {
    pub flags: u16,
    pub weight: u16,
    /// Seconds this answer stays valid
    pub expiration: u32,
    pub tech: Tech,
    /// Node that produced the answer
    pub eid: Eid,
    pub dest: String,
}

impl DundiResult {
    pub fn from_answer(answer: &Answer, expiration: u32) -> Self {
        Self {
            flags: answer.flags,
            weight: answer.weight,
            expiration,
            tech: Tech::from_code(answer.protocol),
            eid: answer.eid,
            dest: answer.destination.clone(),
        }
    }

    pub fn to_answer(&self) -> Answer {
        Answer {
            eid: self.eid,
            protocol: self.tech.code(),
            flags: self.flags,
            weight: self.weight,
            destination: self.dest.clone(),
        }
    }
}

/// Sort by weight, best first. Ties keep arrival order.
pub fn sort_results(results: &mut [DundiResult]) {
    results.sort_by_key(|r| r.weight);
}

/// Hint flags plus the longest prefix they apply to
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HintMetadata {
    pub flags: u16,
    pub exten: String,
}

impl HintMetadata {
    /// Initial state of a query: assume nothing to find and no avoid-set effect
    pub fn pessimistic() -> Self {
        Self {
            flags: hint::DONT_ASK | hint::UNAFFECTED,
            exten: String::new(),
        }
    }

    pub fn has(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    pub fn set(&mut self, flag: u16) {
        self.flags |= flag;
    }

    pub fn clear(&mut self, flag: u16) {
        self.flags &= !flag;
    }

    /// Hint as sent on the wire. The prefix only matters with DONT_ASK.
    pub fn to_wire(&self) -> wire::Hint {
        wire::Hint {
            flags: self.flags,
            data: if self.has(hint::DONT_ASK) {
                self.exten.clone()
            } else {
                String::new()
            },
        }
    }
}

/// Entity information returned by an EID query
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EntityInfo {
    pub department: String,
    pub organization: String,
    pub locality: String,
    pub stateprov: String,
    pub country: String,
    pub email: String,
    pub phone: String,
    pub ipaddr: String,
}

/// Answers accumulated for one request
#[derive(Debug, Clone)]
pub struct AnswerSet {
    pub results: Vec<DundiResult>,
    pub max: usize,
    pub hint: HintMetadata,
    /// Lowest expiration seen, in seconds
    pub expiration: i64,
}

impl AnswerSet {
    pub fn new(max: usize, hint: HintMetadata, expiration: i64) -> Self {
        Self {
            results: Vec::new(),
            max,
            hint,
            expiration,
        }
    }

    /// Add one answer. Duplicates of tech + destination only lower the
    /// stored weight; nothing else is overwritten.
    pub fn merge(&mut self, result: DundiResult) -> bool {
        if let Some(existing) = self
            .results
            .iter_mut()
            .find(|r| r.tech == result.tech && r.dest == result.dest)
        {
            if existing.weight > result.weight {
                existing.weight = result.weight;
            }
            return false;
        }
        if self.results.len() >= self.max {
            return false;
        }
        self.results.push(result);
        self.hint.clear(hint::DONT_ASK);
        true
    }

    /// Fold the answers, hint and expiration of a response into this set.
    ///
    /// Returns the index of the first newly added result, which is where
    /// the cache entry for the responding peer starts.
    pub fn absorb(&mut self, ies: &IeSet, cachetime: u32) -> usize {
        let start = self.results.len();
        let expiration = match ies.expiration {
            Some(e) if e > 0 => e as u32,
            _ => cachetime,
        };
        for answer in &ies.answers {
            self.merge(DundiResult::from_answer(answer, expiration));
        }
        if let Some(h) = &ies.hint {
            if h.flags & hint::TTL_EXPIRED != 0 {
                self.hint.set(hint::TTL_EXPIRED);
            }
            if h.flags & hint::DONT_ASK != 0 {
                if h.data.len() > self.hint.exten.len() {
                    self.hint.exten = h.data.clone();
                }
            } else {
                self.hint.clear(hint::DONT_ASK);
            }
        }
        if let Some(e) = ies.expiration {
            if e > 0 && self.expiration > e as i64 {
                self.expiration = e as i64;
            }
        }
        start
    }
}

/// One logical lookup, precache or entity query
#[derive(Debug)]
pub struct Request {
    pub id: RequestId,
    pub number: String,
    pub context: String,
    /// Set for entity queries
    pub query_eid: Option<Eid>,
    /// Originator of the query, `Eid::ZERO` when it started here
    pub root: Eid,
    /// Checksum of the avoid set
    pub crc32: u32,
    pub answers: AnswerSet,
    pub entity: Option<EntityInfo>,
    pub cache_bypass: bool,
    /// Live transactions fanned out for this request
    pub transactions: Vec<TransId>,
    /// Visible to duplicate detection
    pub registered: bool,
    pub started: Instant,
}

impl Request {
    pub fn new(
        id: RequestId,
        number: &str,
        context: &str,
        avoid: &[Eid],
        answers: AnswerSet,
    ) -> Self {
        Self {
            id,
            number: number.to_string(),
            context: context.to_string(),
            query_eid: None,
            root: avoid.last().copied().unwrap_or(Eid::ZERO),
            crc32: avoid_crc32(avoid),
            answers,
            entity: None,
            cache_bypass: false,
            transactions: Vec::new(),
            registered: false,
            started: Instant::now(),
        }
    }

    /// True when `other` asks the same question on behalf of the same
    /// originator or with the same avoid set
    pub fn same_query(&self, number: &str, context: &str, root: &Eid, crc32: u32) -> bool {
        self.context.eq_ignore_ascii_case(context)
            && self.number.eq_ignore_ascii_case(number)
            && (self.root == *root || self.crc32 == crc32)
    }

    pub fn is_complete(&self) -> bool {
        self.transactions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{flags, Hint};

    fn result(tech: Tech, dest: &str, weight: u16) -> DundiResult {
        DundiResult {
            flags: flags::EXISTS,
            weight,
            expiration: 60,
            tech,
            eid: Eid([1; 6]),
            dest: dest.into(),
        }
    }

    #[test]
    fn test_merge_dedupes_and_lowers_weight() {
        let mut set = AnswerSet::new(MAX_RESULTS, HintMetadata::pessimistic(), 3600);
        assert!(set.merge(result(Tech::Iax, "pbx/100", 100)));
        assert!(!set.hint.has(hint::DONT_ASK));
        assert!(!set.merge(result(Tech::Iax, "pbx/100", 50)));
        assert!(!set.merge(result(Tech::Iax, "pbx/100", 200)));
        assert!(set.merge(result(Tech::Sip, "pbx/100", 10)));
        assert_eq!(set.results.len(), 2);
        assert_eq!(set.results[0].weight, 50);
    }

    #[test]
    fn test_merge_respects_max() {
        let mut set = AnswerSet::new(1, HintMetadata::default(), 3600);
        assert!(set.merge(result(Tech::Iax, "a", 1)));
        assert!(!set.merge(result(Tech::Iax, "b", 1)));
        assert_eq!(set.results.len(), 1);
    }

    #[test]
    fn test_absorb_hint_and_expiration() {
        let mut set = AnswerSet::new(MAX_RESULTS, HintMetadata::pessimistic(), 3600);
        let ies = IeSet {
            hint: Some(Hint {
                flags: hint::DONT_ASK | hint::TTL_EXPIRED,
                data: "555".into(),
            }),
            expiration: Some(120),
            ..Default::default()
        };
        assert_eq!(set.absorb(&ies, 3600), 0);
        assert!(set.hint.has(hint::TTL_EXPIRED));
        assert!(set.hint.has(hint::DONT_ASK));
        assert_eq!(set.hint.exten, "555");
        assert_eq!(set.expiration, 120);

        let ies = IeSet {
            answers: vec![result(Tech::Iax, "x", 0).to_answer()],
            hint: Some(Hint { flags: 0, data: String::new() }),
            ..Default::default()
        };
        assert_eq!(set.absorb(&ies, 3600), 0);
        assert_eq!(set.results[0].expiration, 3600);
        assert!(!set.hint.has(hint::DONT_ASK));
        assert_eq!(set.expiration, 120);
    }

    #[test]
    fn test_same_query() {
        let root = Eid([2; 6]);
        let mut req = Request::new(1, "5551234", "E164", &[root], AnswerSet::new(1, HintMetadata::default(), 0));
        assert!(req.same_query("5551234", "e164", &root, 0));
        assert!(req.same_query("5551234", "e164", &Eid([3; 6]), req.crc32));
        assert!(!req.same_query("5551234", "e164", &Eid([3; 6]), 1));
        assert!(!req.same_query("5551235", "e164", &root, req.crc32));
        req.transactions.push(7);
        assert!(!req.is_complete());
    }

    #[test]
    fn test_sort_results() {
        let mut results = vec![result(Tech::Iax, "a", 30), result(Tech::Iax, "b", 10), result(Tech::Iax, "c", 20)];
        sort_results(&mut results);
        let dests: Vec<&str> = results.iter().map(|r| r.dest.as_str()).collect();
        assert_eq!(dests, vec!["b", "c", "a"]);
    }
}
