//! Peer table
//!
//! Every remote node we talk to is configured as a peer: its address (or
//! `dynamic` when it registers with us), the contexts it may query us for,
//! the contexts we forward to it, its RSA key names and its qualify state.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use crate::crypto::CryptoSession;
use crate::eid::Eid;
use crate::transaction::TransId;

/// Number of lookups remembered per peer
pub const TIMING_HISTORY: usize = 10;

/// Peer answers queries from us
pub const MODEL_INBOUND: u8 = 1 << 0;
/// We send queries to the peer
pub const MODEL_OUTBOUND: u8 = 1 << 1;
pub const MODEL_SYMMETRIC: u8 = MODEL_INBOUND | MODEL_OUTBOUND;

pub fn model_to_string(model: u8) -> &'static str {
    match model {
        MODEL_INBOUND => "Inbound",
        MODEL_OUTBOUND => "Outbound",
        MODEL_SYMMETRIC => "Symmetric",
        _ => "None",
    }
}

/// Parse a configured model name
pub fn parse_model(name: &str) -> Option<u8> {
    match name.to_ascii_lowercase().as_str() {
        "inbound" | "in" => Some(MODEL_INBOUND),
        "outbound" | "out" => Some(MODEL_OUTBOUND),
        "symmetric" | "both" => Some(MODEL_SYMMETRIC),
        "none" => Some(0),
        _ => None,
    }
}

/// Search tier; lower tiers are asked first
pub fn parse_order(name: &str) -> Option<u32> {
    match name.to_ascii_lowercase().as_str() {
        "primary" => Some(0),
        "secondary" => Some(1),
        "tertiary" => Some(2),
        "quartiary" | "quaternary" => Some(3),
        other => other.parse().ok(),
    }
}

pub fn order_to_string(order: u32) -> String {
    match order {
        0 => "Primary".to_string(),
        1 => "Secondary".to_string(),
        2 => "Tertiary".to_string(),
        3 => "Quartiary".to_string(),
        other => other.to_string(),
    }
}

// ============================================================================
// Permissions
// ============================================================================

/// One allow/deny rule for a context name (`all` matches any context)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permission {
    pub name: String,
    pub allow: bool,
}

impl Permission {
    pub fn allow(name: &str) -> Self {
        Self { name: name.to_string(), allow: true }
    }

    pub fn deny(name: &str) -> Self {
        Self { name: name.to_string(), allow: false }
    }
}

/// Evaluate a rule list: the last matching rule wins, no match denies
pub fn has_permission(list: &[Permission], context: &str) -> bool {
    let mut allowed = false;
    for perm in list {
        if perm.name.eq_ignore_ascii_case("all") || perm.name.eq_ignore_ascii_case(context) {
            allowed = perm.allow;
        }
    }
    allowed
}

// ============================================================================
// Lookup history
// ============================================================================

/// Recent lookups sent to a peer and how long each took
#[derive(Debug, Clone, Default)]
pub struct LookupHistory {
    entries: VecDeque<(String, u64)>,
    pub avgms: u64,
}

impl LookupHistory {
    pub fn record(&mut self, lookup: String, ms: u64) {
        self.entries.push_front((lookup, ms));
        self.entries.truncate(TIMING_HISTORY);
        let total: u64 = self.entries.iter().map(|(_, ms)| ms).sum();
        self.avgms = total / self.entries.len() as u64;
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.avgms = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, u64)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Peer
// ============================================================================

/// Where a peer lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerHost {
    /// Learned from its registrations
    Dynamic,
    /// Configured host name or address
    Static(String),
}

/// A remote DUNDi node
#[derive(Debug, Clone)]
pub struct Peer {
    pub eid: Eid,
    /// Identity we present to this peer
    pub us_eid: Eid,
    pub host: PeerHost,
    pub addr: Option<SocketAddr>,
    /// Contexts we forward to this peer
    pub include: Vec<Permission>,
    /// Contexts this peer may query us for
    pub permit: Vec<Permission>,
    /// Name of the peer's public key
    pub inkey: Option<String>,
    /// Name of our private key used with this peer
    pub outkey: Option<String>,
    pub model: u8,
    pub pcmodel: u8,
    pub order: u32,
    /// Qualify threshold; 0 disables qualification
    pub maxms: u32,
    /// Last measured round trip; -1 unreachable, 0 unknown
    pub lastms: i64,
    /// We register ourselves with this peer
    pub register: bool,

    pub crypto: CryptoSession,
    /// Our current session key has been announced in full
    pub sent_full_key: bool,

    pub qualify_at: Option<Instant>,
    pub qual_trans: Option<TransId>,
    pub qual_tx: Option<Instant>,
    pub register_at: Option<Instant>,
    pub reg_trans: Option<TransId>,
    pub register_expire_at: Option<Instant>,

    pub history: LookupHistory,
    /// Configuration generation that last confirmed this peer
    pub generation: u64,
}

impl Peer {
    pub fn new(eid: Eid, us_eid: Eid) -> Self {
        Self {
            eid,
            us_eid,
            host: PeerHost::Dynamic,
            addr: None,
            include: Vec::new(),
            permit: Vec::new(),
            inkey: None,
            outkey: None,
            model: 0,
            pcmodel: 0,
            order: 0,
            maxms: 0,
            lastms: 0,
            register: false,
            crypto: CryptoSession::default(),
            sent_full_key: false,
            qualify_at: None,
            qual_trans: None,
            qual_tx: None,
            register_at: None,
            reg_trans: None,
            register_expire_at: None,
            history: LookupHistory::default(),
            generation: 0,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.host == PeerHost::Dynamic
    }

    /// Traffic with this peer is encrypted
    pub fn wants_encryption(&self) -> bool {
        self.inkey.is_some()
    }

    /// Peer may be contacted: address known and, when qualified, fast enough
    pub fn is_usable(&self) -> bool {
        if self.addr.is_none() {
            return false;
        }
        if self.maxms > 0 && (self.lastms < 0 || self.lastms >= self.maxms as i64) {
            return false;
        }
        true
    }

    pub fn status(&self) -> PeerStatus {
        if self.maxms == 0 {
            PeerStatus::Unmonitored
        } else if self.lastms < 0 {
            PeerStatus::Unreachable
        } else if self.lastms == 0 {
            PeerStatus::Unknown
        } else if self.lastms >= self.maxms as i64 {
            PeerStatus::Lagged(self.lastms)
        } else {
            PeerStatus::Ok(self.lastms)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Unmonitored,
    Unknown,
    Unreachable,
    Lagged(i64),
    Ok(i64),
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerStatus::Unmonitored => write!(f, "Unmonitored"),
            PeerStatus::Unknown => write!(f, "UNKNOWN"),
            PeerStatus::Unreachable => write!(f, "UNREACHABLE"),
            PeerStatus::Lagged(ms) => write!(f, "LAGGED ({} ms)", ms),
            PeerStatus::Ok(ms) => write!(f, "OK ({} ms)", ms),
        }
    }
}

// ============================================================================
// Peer table
// ============================================================================

/// All configured peers, in configuration order
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: Vec<Peer>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, eid: &Eid) -> Option<&Peer> {
        self.peers.iter().find(|p| p.eid == *eid)
    }

    pub fn find_mut(&mut self, eid: &Eid) -> Option<&mut Peer> {
        self.peers.iter_mut().find(|p| p.eid == *eid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Add a peer or return the existing one with the same EID
    pub fn upsert(&mut self, eid: Eid, us_eid: Eid) -> &mut Peer {
        let idx = match self.peers.iter().position(|p| p.eid == eid) {
            Some(idx) => idx,
            None => {
                self.peers.push(Peer::new(eid, us_eid));
                self.peers.len() - 1
            }
        };
        &mut self.peers[idx]
    }

    /// Remove peers not confirmed by generation `generation`, returning them
    pub fn sweep(&mut self, generation: u64) -> Vec<Peer> {
        let (keep, dead): (Vec<Peer>, Vec<Peer>) =
            self.peers.drain(..).partition(|p| p.generation >= generation);
        self.peers = keep;
        dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_last_match_wins() {
        let list = vec![Permission::allow("all"), Permission::deny("private")];
        assert!(has_permission(&list, "e164"));
        assert!(!has_permission(&list, "PRIVATE"));

        let list = vec![Permission::deny("e164"), Permission::allow("all")];
        assert!(has_permission(&list, "e164"));

        assert!(!has_permission(&[], "e164"));
        assert!(!has_permission(&[Permission::allow("other")], "e164"));
    }

    #[test]
    fn test_history_ring() {
        let mut h = LookupHistory::default();
        for i in 0..15u64 {
            h.record(format!("{}@e164", i), 10);
        }
        assert_eq!(h.len(), TIMING_HISTORY);
        assert_eq!(h.iter().next().map(|(l, _)| l.as_str()), Some("14@e164"));
        assert_eq!(h.avgms, 10);
        h.record("x@e164".into(), 120);
        assert_eq!(h.avgms, 21);
        h.clear();
        assert!(h.is_empty());
        assert_eq!(h.avgms, 0);
    }

    #[test]
    fn test_usable_and_status() {
        let mut p = Peer::new(Eid([1; 6]), Eid([2; 6]));
        assert!(!p.is_usable());
        p.addr = Some("127.0.0.1:4520".parse().unwrap());
        assert!(p.is_usable());
        assert_eq!(p.status(), PeerStatus::Unmonitored);

        p.maxms = 100;
        assert_eq!(p.status(), PeerStatus::Unknown);
        assert!(p.is_usable());
        p.lastms = 150;
        assert!(!p.is_usable());
        assert_eq!(p.status().to_string(), "LAGGED (150 ms)");
        p.lastms = -1;
        assert!(!p.is_usable());
        p.lastms = 20;
        assert!(p.is_usable());
        assert_eq!(p.status().to_string(), "OK (20 ms)");
    }

    #[test]
    fn test_table_upsert_and_sweep() {
        let mut table = PeerTable::new();
        let us = Eid([9; 6]);
        table.upsert(Eid([1; 6]), us).generation = 1;
        table.upsert(Eid([2; 6]), us).generation = 1;
        table.upsert(Eid([1; 6]), us).generation = 2;
        assert_eq!(table.len(), 2);

        let dead = table.sweep(2);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].eid, Eid([2; 6]));
        assert!(table.find(&Eid([1; 6])).is_some());
        assert!(table.find(&Eid([2; 6])).is_none());
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_model("Symmetric"), Some(MODEL_SYMMETRIC));
        assert_eq!(parse_model("sideways"), None);
        assert_eq!(parse_order("secondary"), Some(1));
        assert_eq!(parse_order("7"), Some(7));
        assert_eq!(order_to_string(2), "Tertiary");
        assert_eq!(model_to_string(MODEL_OUTBOUND), "Outbound");
    }
}
