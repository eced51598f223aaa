//! Per-dialog transaction state
//!
//! A transaction is one packet exchange with one peer. It owns the
//! sequence counters, the unacknowledged packets awaiting retransmission
//! and the encryption state of the dialog.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::crypto::SessionKey;
use crate::eid::Eid;
use crate::request::RequestId;
use crate::wire::Command;

/// Stable handle of a transaction inside the node
pub type TransId = u64;

/// Most EIDs carried in one avoid list
pub const MAX_STACK: usize = 512;

/// Why the transaction exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Opened by a remote peer
    Inbound,
    /// Lookup, entity query or precache on behalf of a request
    Outbound,
    /// Our registration with a peer
    Register,
    /// Latency check
    Qualify,
}

/// Where the dialog stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    Discovering,
    Querying,
    Precaching,
    Registering,
    Qualifying,
    /// A worker is computing our answer
    Answering,
    /// We sent our final message and wait for its acknowledgement
    AwaitingFinal,
    /// Destroyed while a worker still held it; the worker frees it
    Dead,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Created => "Created",
            Phase::Discovering => "Discovering",
            Phase::Querying => "Querying",
            Phase::Precaching => "Precaching",
            Phase::Registering => "Registering",
            Phase::Qualifying => "Qualifying",
            Phase::Answering => "Answering",
            Phase::AwaitingFinal => "AwaitingFinal",
            Phase::Dead => "Dead",
        }
    }
}

/// Session cipher of an encrypted dialog
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CipherState {
    /// Next key announcement carries the full wrapped key instead of its CRC
    pub send_full_key: bool,
    /// Dialog key, known once the first packet went out or was accepted
    pub key: Option<SessionKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encryption {
    Off,
    On(CipherState),
}

impl Encryption {
    pub fn is_on(&self) -> bool {
        matches!(self, Encryption::On(_))
    }
}

/// A sent packet kept until the peer acknowledges it
#[derive(Debug, Clone)]
pub struct Packet {
    pub cmd: Command,
    pub final_: bool,
    /// Plaintext IE body, kept to re-send with a full key after ENCREJ
    pub body: Vec<u8>,
    /// Datagram as transmitted
    pub data: Vec<u8>,
    pub oseqno: u8,
    pub retrans_left: u32,
    pub next_retrans: Instant,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TransId,
    /// Our dialog id
    pub strans: u16,
    /// The peer's dialog id, 0 until learned
    pub dtrans: u16,
    /// Next expected inbound sequence number
    pub iseqno: u8,
    /// Sequence number of the last processed inbound command
    pub oiseqno: u8,
    /// Next outbound sequence number
    pub oseqno: u8,
    /// Last inbound sequence number we acknowledged
    pub aseqno: u8,
    pub addr: SocketAddr,
    pub us_eid: Eid,
    pub them_eid: Eid,
    pub kind: Kind,
    pub phase: Phase,
    pub final_sent: bool,
    pub encryption: Encryption,
    pub packets: Vec<Packet>,
    pub last_sent: Option<Packet>,
    pub retrans_interval: Duration,
    pub autokill: Option<Duration>,
    pub autokill_at: Option<Instant>,
    pub parent: Option<RequestId>,
    pub ttl: u16,
    /// Avoid list sent with our query, root last
    pub eids: Vec<Eid>,
    /// A worker or coordinator still references this transaction
    pub busy: bool,
    pub started: Instant,
    pub store_history: bool,
}

impl Transaction {
    pub fn new(id: TransId, strans: u16, addr: SocketAddr, kind: Kind, retrans_interval: Duration) -> Self {
        Self {
            id,
            strans,
            dtrans: 0,
            iseqno: 0,
            oiseqno: 0,
            oseqno: 0,
            aseqno: 0,
            addr,
            us_eid: Eid::ZERO,
            them_eid: Eid::ZERO,
            kind,
            phase: Phase::Created,
            final_sent: false,
            encryption: Encryption::Off,
            packets: Vec::new(),
            last_sent: None,
            retrans_interval,
            autokill: None,
            autokill_at: None,
            parent: None,
            ttl: 0,
            eids: Vec::new(),
            busy: false,
            started: Instant::now(),
            store_history: false,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.phase == Phase::Dead
    }

    /// Match an inbound acknowledgement against the retained packets.
    ///
    /// The peer's `iseqno` acknowledges every packet up to `iseqno - 1`,
    /// within half the sequence space. The newest acknowledged packet
    /// becomes `last_sent`, older ones are dropped and the autokill timer
    /// stops.
    pub fn ack(&mut self, iseqno: u8) -> bool {
        let acked = |p: &Packet| (1..=128).contains(&iseqno.wrapping_sub(p.oseqno));
        let Some(idx) = self
            .packets
            .iter()
            .enumerate()
            .filter(|(_, p)| acked(*p))
            .min_by_key(|(_, p)| iseqno.wrapping_sub(p.oseqno))
            .map(|(i, _)| i)
        else {
            return false;
        };
        let pack = self.packets.remove(idx);
        self.packets.retain(|p| !acked(p));
        if self.last_sent.is_some() {
            log::debug!("Replacing stale last packet on transaction {}", self.strans);
        }
        self.last_sent = Some(pack);
        self.autokill_at = None;
        true
    }

    /// Restart the dialog under a new id with all counters cleared
    pub fn reset(&mut self, strans: u16) {
        self.strans = strans;
        self.dtrans = 0;
        self.iseqno = 0;
        self.oiseqno = 0;
        self.oseqno = 0;
        self.aseqno = 0;
        self.final_sent = false;
        self.packets.clear();
    }

    /// Earliest instant this transaction needs attention
    pub fn next_deadline(&self) -> Option<Instant> {
        let retrans = self.packets.iter().map(|p| p.next_retrans).min();
        match (retrans, self.autokill_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Stop every timer and drop retained packets
    pub fn clear_packets(&mut self) {
        self.packets.clear();
        self.last_sent = None;
        self.autokill_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(oseqno: u8, at: Instant) -> Packet {
        Packet {
            cmd: Command::DpDiscover,
            final_: false,
            body: Vec::new(),
            data: vec![oseqno],
            oseqno,
            retrans_left: 4,
            next_retrans: at,
        }
    }

    fn trans() -> Transaction {
        Transaction::new(1, 100, "127.0.0.1:4520".parse().unwrap(), Kind::Outbound, Duration::from_millis(1000))
    }

    #[test]
    fn test_ack_moves_packet_to_last_sent() {
        let now = Instant::now();
        let mut t = trans();
        t.packets.push(packet(0, now));
        t.autokill_at = Some(now);

        assert!(!t.ack(0));
        assert!(t.ack(1));
        assert!(t.packets.is_empty());
        assert_eq!(t.last_sent.as_ref().map(|p| p.oseqno), Some(0));
        assert!(t.autokill_at.is_none());
    }

    #[test]
    fn test_cumulative_ack_clears_older_packets() {
        let now = Instant::now();
        let mut t = trans();
        for oseqno in 0..3 {
            t.packets.push(packet(oseqno, now));
        }
        assert!(t.ack(2));
        assert_eq!(t.packets.len(), 1);
        assert_eq!(t.packets[0].oseqno, 2);
        assert_eq!(t.last_sent.as_ref().map(|p| p.oseqno), Some(1));
        assert!(!t.ack(2));
    }

    #[test]
    fn test_ack_wraps_at_256() {
        let mut t = trans();
        t.packets.push(packet(255, Instant::now()));
        assert!(t.ack(0));
    }

    #[test]
    fn test_reset_clears_counters() {
        let mut t = trans();
        t.dtrans = 9;
        t.iseqno = 3;
        t.oseqno = 2;
        t.final_sent = true;
        t.packets.push(packet(1, Instant::now()));
        t.reset(200);
        assert_eq!(t.strans, 200);
        assert_eq!((t.dtrans, t.iseqno, t.oseqno, t.aseqno), (0, 0, 0, 0));
        assert!(!t.final_sent);
        assert!(t.packets.is_empty());
    }

    #[test]
    fn test_next_deadline() {
        let now = Instant::now();
        let mut t = trans();
        assert!(t.next_deadline().is_none());
        t.packets.push(packet(0, now + Duration::from_millis(500)));
        t.autokill_at = Some(now + Duration::from_millis(200));
        assert_eq!(t.next_deadline(), Some(now + Duration::from_millis(200)));
        t.autokill_at = None;
        assert_eq!(t.next_deadline(), Some(now + Duration::from_millis(500)));
    }
}
