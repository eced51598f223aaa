//! Node state and the transaction engine
//!
//! Everything mutable about a node lives in [`State`], guarded by a single
//! mutex inside [`Node`]. The reactor thread feeds datagrams and timer ticks
//! into it; lookup threads and workers take the same lock to open
//! transactions and then sleep on the node's condition variable until those
//! transactions finish. Datagrams and worker jobs produced under the lock are
//! queued on the state and drained by the reactor.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use mio::Waker;
use rand::Rng;

use crate::cache::Cache;
use crate::config::{build_mappings, build_peers, Config, Settings};
use crate::coordinator::{Job, LocalContext};
use crate::crypto::{self, CryptoError, KeyRing};
use crate::eid::Eid;
use crate::error::{DundiError, Result};
use crate::handlers;
use crate::mapping::{Dialplan, Mapping};
use crate::metrics::Metrics;
use crate::peer::{PeerHost, PeerTable};
use crate::precache::PrecacheQueue;
use crate::request::{Request, RequestId};
use crate::secret::Secret;
use crate::store::KvStore;
use crate::transaction::{CipherState, Encryption, Kind, Packet, Phase, TransId, Transaction};
use crate::wire::{self, Command, Header, Ie, FLAG_FINAL, TRANS_ID_MASK};

// ============================================================================
// Constants
// ============================================================================

/// Context used when a query names none
pub const DEFAULT_CONTEXT: &str = "e164";

/// Registration lifetime granted to and requested from peers, seconds
pub const REGISTER_EXPIRATION: u16 = 60;

/// Store family holding dynamic peer registrations
pub const DPEERS_FAMILY: &str = "dundi/dpeers";

const QUALIFY_INTERVAL: Duration = Duration::from_secs(60);
const QUALIFY_RETRY: Duration = Duration::from_secs(10);
const QUALIFY_SOON: Duration = Duration::from_secs(5);
const FIRST_REGISTER: Duration = Duration::from_secs(2);
/// Extra time a registration stays valid past its announced expiry
const REGISTER_GRACE: u64 = 10;
const MIN_RETRANS: Duration = Duration::from_millis(150);

/// Wall-clock seconds since the epoch, used for cache and store timestamps
pub fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ============================================================================
// Node state
// ============================================================================

pub struct State {
    pub settings: Settings,
    pub peers: PeerTable,
    pub mappings: Vec<Mapping>,
    pub trans: HashMap<TransId, Transaction>,
    /// Our dialog id to transaction
    strans_index: HashMap<u16, TransId>,
    next_trans: TransId,
    pub requests: HashMap<RequestId, Request>,
    next_request: RequestId,
    pub cache: Cache,
    pub store: Arc<dyn KvStore>,
    pub keys: KeyRing,
    pub secret: Secret,
    /// Datagrams waiting for the reactor
    pub outbox: Vec<(SocketAddr, Vec<u8>)>,
    /// Queries waiting for a worker
    pub jobs: Vec<Job>,
    /// A request lost a transaction; waiters should re-check
    pub notify: bool,
    pub debug: bool,
    pub metrics: Arc<Metrics>,
    pub shutting_down: bool,
    pub generation: u64,
}

impl State {
    pub fn new(settings: Settings, store: Arc<dyn KvStore>, metrics: Arc<Metrics>) -> Result<Self> {
        let secret = Secret::load(store.as_ref(), &settings.secretpath, now_epoch())?;
        let mut cache = Cache::new(Arc::clone(&store), settings.cachetime);
        cache.push_grace = settings.push_grace;
        cache.pull_grace = settings.pull_grace;
        let keys = KeyRing::new(settings.keydir.clone());
        Ok(Self {
            settings,
            peers: PeerTable::new(),
            mappings: Vec::new(),
            trans: HashMap::new(),
            strans_index: HashMap::new(),
            next_trans: 0,
            requests: HashMap::new(),
            next_request: 0,
            cache,
            store,
            keys,
            secret,
            outbox: Vec::new(),
            jobs: Vec::new(),
            notify: false,
            debug: false,
            metrics,
            shutting_down: false,
            generation: 0,
        })
    }

    pub fn us(&self) -> Eid {
        self.settings.us
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    /// Apply a (re)loaded configuration.
    ///
    /// Peers still present keep their runtime state (address of a dynamic
    /// peer, latency, session keys, history). Peers that disappeared are
    /// removed together with their transactions.
    pub fn apply_config(&mut self, config: &Config) {
        let now = Instant::now();
        match Settings::from_config(&config.general) {
            Ok(fresh) => self.update_settings(fresh),
            Err(e) => log::warn!("Keeping previous general settings: {}", e),
        }

        self.generation += 1;
        let generation = self.generation;
        let mut populate = Vec::new();
        for spec in build_peers(config, self.settings.us) {
            let peer = self.peers.upsert(spec.eid, spec.us_eid);
            let fresh = peer.generation == 0;
            if peer.inkey != spec.inkey || peer.outkey != spec.outkey {
                peer.crypto.reset();
                peer.sent_full_key = false;
            }
            let was_dynamic = peer.is_dynamic();
            peer.us_eid = spec.us_eid;
            peer.include = spec.include;
            peer.permit = spec.permit;
            peer.inkey = spec.inkey;
            peer.outkey = spec.outkey;
            peer.model = spec.model;
            peer.pcmodel = spec.pcmodel;
            peer.order = spec.order;
            peer.maxms = spec.maxms;
            peer.register = spec.register;
            match &spec.host {
                PeerHost::Dynamic => {
                    if fresh || !was_dynamic {
                        peer.addr = None;
                        populate.push(peer.eid);
                    }
                }
                PeerHost::Static(_) => {
                    peer.addr = spec.addr;
                    peer.register_expire_at = None;
                }
            }
            peer.host = spec.host;
            peer.generation = generation;
        }
        for eid in populate {
            self.populate_addr(&eid);
        }

        for dead in self.peers.sweep(generation) {
            log::info!("Removing DUNDi peer '{}'", dead.eid);
            let ids: Vec<TransId> = self
                .trans
                .values()
                .filter(|t| t.them_eid == dead.eid && !t.is_dead())
                .map(|t| t.id)
                .collect();
            for id in ids {
                self.destroy_trans(id, false);
            }
        }

        self.mappings = build_mappings(config);
        self.keys.clear();

        let peers: Vec<(Eid, bool)> = self.peers.iter().map(|p| (p.eid, p.register)).collect();
        for (eid, register) in peers {
            if let Some(peer) = self.peers.find_mut(&eid) {
                peer.register_at = if register { Some(now + FIRST_REGISTER) } else { None };
            }
            self.qualify_peer(&eid, true);
        }
        log::info!(
            "Loaded {} peers and {} mappings (generation {})",
            self.peers.len(),
            self.mappings.len(),
            generation
        );
    }

    fn update_settings(&mut self, mut fresh: Settings) {
        if fresh.bind != self.settings.bind {
            log::warn!(
                "Bind address change to {} takes effect after a restart",
                fresh.bind
            );
            fresh.bind = self.settings.bind;
        }
        if self.generation > 0 && fresh.us != self.settings.us {
            log::warn!("Entity id change to {} takes effect after a restart", fresh.us);
            fresh.us = self.settings.us;
        }
        if fresh.keydir != self.settings.keydir {
            self.keys = KeyRing::new(fresh.keydir.clone());
        }
        self.cache.cachetime = fresh.cachetime;
        self.cache.push_grace = fresh.push_grace;
        self.cache.pull_grace = fresh.pull_grace;
        self.settings = fresh;
    }

    /// Restore a dynamic peer's address from its stored registration
    fn populate_addr(&mut self, eid: &Eid) {
        let Some(value) = self.store.get(DPEERS_FAMILY, &eid.short()) else {
            return;
        };
        let now = now_epoch();
        let mut parts = value.rsplitn(3, ':');
        let expiry = parts.next().and_then(|s| s.parse::<u64>().ok());
        let port = parts.next().and_then(|s| s.parse::<u16>().ok());
        let ip = parts.next().and_then(|s| s.parse::<IpAddr>().ok());
        match (ip, port, expiry) {
            (Some(ip), Some(port), Some(expiry)) if expiry > now => {
                if let Some(peer) = self.peers.find_mut(eid) {
                    let addr = SocketAddr::new(ip, port);
                    log::debug!("Restored registration of '{}' at {}", eid, addr);
                    peer.addr = Some(addr);
                    peer.register_expire_at =
                        Some(Instant::now() + Duration::from_secs(expiry - now + REGISTER_GRACE));
                }
            }
            _ => {
                if let Err(e) = self.store.delete(DPEERS_FAMILY, &eid.short()) {
                    log::warn!("Unable to drop stale registration of '{}': {}", eid, e);
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------------

    fn alloc_strans(&self) -> Option<u16> {
        let start: u16 = rand::thread_rng().gen_range(1..=32766);
        let mut tid = start;
        loop {
            if !self.strans_index.contains_key(&tid) {
                return Some(tid);
            }
            tid = tid % 32766 + 1;
            if tid == start {
                return None;
            }
        }
    }

    fn insert_transaction(&mut self, addr: SocketAddr, kind: Kind) -> Option<TransId> {
        let Some(strans) = self.alloc_strans() else {
            log::warn!("Out of transaction ids");
            return None;
        };
        self.next_trans += 1;
        let id = self.next_trans;
        let mut trans = Transaction::new(id, strans, addr, kind, self.settings.retrans_timer);
        trans.store_history = self.settings.storehistory;
        self.trans.insert(id, trans);
        self.strans_index.insert(strans, id);
        Metrics::incr(&self.metrics.transactions_created_total);
        Metrics::incr(&self.metrics.active_transactions);
        Some(id)
    }

    /// Open a transaction toward a configured peer. Fails when the peer has
    /// no known address.
    pub fn create_transaction(&mut self, peer: &Eid, kind: Kind) -> Option<TransId> {
        let addr = self.peers.find(peer)?.addr?;
        let id = self.insert_transaction(addr, kind)?;
        self.apply_peer(id, peer);
        let sent_full_key = self.peers.find(peer).map(|p| p.sent_full_key).unwrap_or(false);
        if let Some(Encryption::On(cipher)) = self.trans.get_mut(&id).map(|t| &mut t.encryption) {
            cipher.send_full_key = !sent_full_key;
        }
        Some(id)
    }

    /// Bind a transaction to a peer: identities, encryption and timers
    pub(crate) fn apply_peer(&mut self, id: TransId, eid: &Eid) {
        let Some(peer) = self.peers.find(eid) else {
            return;
        };
        let Some(trans) = self.trans.get_mut(&id) else {
            return;
        };
        trans.us_eid = peer.us_eid;
        trans.them_eid = peer.eid;
        if peer.inkey.is_some() && !trans.encryption.is_on() {
            trans.encryption = Encryption::On(CipherState::default());
        }
        if peer.maxms > 0 {
            trans.autokill = Some(Duration::from_millis(peer.maxms as u64));
            trans.retrans_interval = if peer.lastms > 1 {
                Duration::from_millis(peer.lastms as u64 * 2).max(MIN_RETRANS)
            } else {
                self.settings.retrans_timer
            };
            trans.retrans_interval = trans.retrans_interval.min(self.settings.retrans_timer);
        } else {
            trans.autokill = self.settings.autokill;
        }
    }

    /// Match an inbound header to a live transaction, learning the peer's
    /// dialog id on first contact
    fn find_transaction(&mut self, hdr: &Header, addr: SocketAddr) -> Option<TransId> {
        let hdr_strans = hdr.strans & TRANS_ID_MASK;
        let hdr_dtrans = hdr.dtrans & TRANS_ID_MASK;
        let found = self
            .trans
            .values()
            .find(|t| {
                !t.is_dead()
                    && t.addr == addr
                    && ((t.strans == hdr_dtrans && (t.dtrans == 0 || t.dtrans == hdr_strans))
                        || (t.dtrans == hdr_strans && hdr.dtrans == 0))
            })
            .map(|t| t.id)?;
        if let Some(trans) = self.trans.get_mut(&found) {
            if trans.dtrans == 0 {
                trans.dtrans = hdr_strans;
            }
        }
        Some(found)
    }

    /// Answer a frame that matches no dialog with INVALID
    fn reject(&mut self, hdr: &Header, addr: SocketAddr) {
        if hdr.command_code() == Command::Invalid.code() {
            return;
        }
        let reply = Header {
            strans: hdr.dtrans,
            dtrans: hdr.strans,
            iseqno: hdr.oseqno,
            oseqno: hdr.iseqno,
            cmdresp: Command::Invalid.code(),
            cmdflags: 0,
        };
        log::debug!("Rejecting {} from {}", wire::command_name(hdr.cmdresp), addr);
        Metrics::incr(&self.metrics.rejects_total);
        self.transmit(addr, wire::encode_frame(&reply, &[]));
    }

    /// Retire a transaction.
    ///
    /// Updates the owning peer's qualify and registration state, records
    /// lookup history, unlinks it from its request and wakes waiters. A
    /// transaction still held by a worker is only marked dead; the worker
    /// releases it.
    pub fn destroy_trans(&mut self, id: TransId, from_timeout: bool) {
        let Some(trans) = self.trans.get(&id) else {
            return;
        };
        if trans.is_dead() {
            return;
        }
        let them = trans.them_eid;
        let parent = trans.parent;
        let strans = trans.strans;
        let elapsed = trans.started.elapsed();
        let store_history = trans.store_history;
        let now = Instant::now();

        for peer in self.peers.iter_mut() {
            if peer.reg_trans == Some(id) {
                peer.reg_trans = None;
            }
            if peer.qual_trans == Some(id) {
                if from_timeout {
                    if peer.lastms > -1 {
                        log::info!("Peer '{}' has become UNREACHABLE!", peer.eid);
                        Metrics::incr(&self.metrics.peers_unreachable_total);
                    }
                    peer.lastms = -1;
                } else {
                    let ms = peer
                        .qual_tx
                        .map(|tx| now.duration_since(tx).as_millis() as i64)
                        .unwrap_or(0)
                        .max(1);
                    let maxms = peer.maxms as i64;
                    if ms < maxms {
                        if peer.lastms >= maxms || peer.lastms < 0 {
                            log::info!("Peer '{}' has become REACHABLE!", peer.eid);
                        }
                    } else if peer.lastms < maxms {
                        log::info!("Peer '{}' has become TOO LAGGED ({} ms)", peer.eid, ms);
                    }
                    peer.lastms = ms;
                }
                peer.qual_trans = None;
            }
            if store_history && peer.eid == them {
                if let Some(req) = parent.and_then(|p| self.requests.get(&p)) {
                    let lookup = match req.query_eid {
                        Some(eid) => format!("{}@{}", eid, req.context),
                        None => format!("{}@{}", req.number, req.context),
                    };
                    peer.history.record(lookup, elapsed.as_millis() as u64);
                }
            }
        }

        if let Some(pid) = parent {
            if let Some(req) = self.requests.get_mut(&pid) {
                req.transactions.retain(|t| *t != id);
                self.notify = true;
            }
        }
        if self.strans_index.get(&strans) == Some(&id) {
            self.strans_index.remove(&strans);
        }
        self.metrics.active_transactions.fetch_sub(1, Ordering::Relaxed);

        let Some(trans) = self.trans.get_mut(&id) else {
            return;
        };
        trans.parent = None;
        if trans.busy {
            trans.phase = Phase::Dead;
            trans.clear_packets();
        } else {
            self.trans.remove(&id);
        }
    }

    /// A worker or coordinator is done with the transaction; free it if it
    /// died meanwhile
    pub fn release(&mut self, id: TransId) {
        if let Some(trans) = self.trans.get_mut(&id) {
            trans.busy = false;
            if trans.is_dead() {
                self.trans.remove(&id);
            }
        }
    }

    pub fn is_dead(&self, id: TransId) -> bool {
        self.trans.get(&id).map(|t| t.is_dead()).unwrap_or(true)
    }

    /// Restart a dialog under a fresh id, used after ENCREJ
    pub(crate) fn reset_transaction(&mut self, id: TransId) -> bool {
        let Some(strans) = self.alloc_strans() else {
            return false;
        };
        let Some(trans) = self.trans.get_mut(&id) else {
            return false;
        };
        if self.strans_index.get(&trans.strans) == Some(&id) {
            self.strans_index.remove(&trans.strans);
        }
        trans.reset(strans);
        self.strans_index.insert(strans, id);
        true
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    pub(crate) fn transmit(&mut self, addr: SocketAddr, data: Vec<u8>) {
        Metrics::incr(&self.metrics.frames_out_total);
        self.outbox.push((addr, data));
    }

    /// Send a command on a transaction
    pub fn send(&mut self, id: TransId, cmd: Command, final_: bool, ies: &[Ie]) -> Result<()> {
        let body = wire::encode_ies(ies)?;
        self.send_body(id, cmd, final_, body)
    }

    /// Send an already encoded IE body.
    ///
    /// Everything but ACK is retained for retransmission and consumes an
    /// outbound sequence number. Encryptable commands on an encrypted
    /// dialog travel inside ENCRYPT.
    pub(crate) fn send_body(&mut self, id: TransId, cmd: Command, final_: bool, body: Vec<u8>) -> Result<()> {
        let now = Instant::now();
        let trans = self
            .trans
            .get_mut(&id)
            .ok_or_else(|| DundiError::InvalidArgument(format!("no transaction {}", id)))?;
        let header = Header {
            strans: trans.strans,
            dtrans: trans.dtrans,
            iseqno: trans.iseqno,
            oseqno: trans.oseqno,
            cmdresp: cmd.code() | if final_ { FLAG_FINAL } else { 0 },
            cmdflags: 0,
        };
        trans.aseqno = trans.iseqno;
        if final_ {
            trans.final_sent = true;
            if !trans.is_dead() {
                trans.phase = Phase::AwaitingFinal;
            }
        }
        let encrypt = trans.encryption.is_on() && cmd.is_encryptable();
        let first = trans.iseqno == 0 && trans.oseqno == 0;
        let addr = trans.addr;

        let plain = wire::encode_frame(&header, &body);
        if self.debug {
            log::info!("Tx {} {}", addr, wire::describe_frame(&header, &body));
        }
        let data = if encrypt {
            self.encrypt_frame(id, &header, &plain, first, now)?
        } else {
            plain
        };

        let retrans_left = self.settings.retrans_count.saturating_sub(1);
        if let Some(trans) = self.trans.get_mut(&id) {
            if cmd != Command::Ack {
                trans.packets.push(Packet {
                    cmd,
                    final_,
                    body,
                    data: data.clone(),
                    oseqno: header.oseqno,
                    retrans_left,
                    next_retrans: now + trans.retrans_interval,
                });
                trans.oseqno = trans.oseqno.wrapping_add(1);
            }
        }
        if cmd == Command::DpDiscover {
            Metrics::incr(&self.metrics.discovers_sent_total);
        }
        self.transmit(addr, data);
        Ok(())
    }

    /// Wrap a plaintext frame in ENCRYPT.
    ///
    /// The first packet of a dialog announces the session key: the full
    /// wrapped key when the peer may not know it, otherwise its CRC.
    fn encrypt_frame(
        &mut self,
        id: TransId,
        header: &Header,
        plain: &[u8],
        first: bool,
        now: Instant,
    ) -> Result<Vec<u8>> {
        let (us_eid, them_eid) = match self.trans.get(&id) {
            Some(t) => (t.us_eid, t.them_eid),
            None => return Err(DundiError::InvalidArgument(format!("no transaction {}", id))),
        };
        let mut ies = Vec::new();
        let key = if first {
            let (inkey, outkey) = match self.peers.find(&them_eid) {
                Some(peer) => (peer.inkey.clone(), peer.outkey.clone()),
                None => (None, None),
            };
            let inkey = inkey.ok_or_else(|| CryptoError::MissingKey(format!("inkey of {}", them_eid)))?;
            let outkey = outkey.ok_or_else(|| CryptoError::MissingKey(format!("outkey of {}", them_eid)))?;
            let peer_public = self.keys.public_key(&inkey)?;
            let our_private = self.keys.private_key(&outkey)?;
            let keyttl = self.settings.keyttl;
            let peer = self
                .peers
                .find_mut(&them_eid)
                .ok_or_else(|| CryptoError::MissingKey(format!("peer {}", them_eid)))?;
            let (local, fresh) = peer.crypto.update_key(&peer_public, &our_private, keyttl, now)?;

            let Some(Encryption::On(cipher)) = self.trans.get_mut(&id).map(|t| &mut t.encryption) else {
                return Err(CryptoError::MissingKey("session".to_string()).into());
            };
            if fresh {
                cipher.send_full_key = true;
            }
            let full = cipher.send_full_key;
            cipher.key = Some(local.key);
            ies.push(Ie::Eid(us_eid));
            if full {
                ies.push(Ie::SharedKey(local.wrapped.ciphertext.clone()));
                ies.push(Ie::Signature(local.wrapped.signature.clone()));
                if let Some(peer) = self.peers.find_mut(&them_eid) {
                    peer.sent_full_key = true;
                }
            } else {
                ies.push(Ie::KeyCrc32(local.crc32));
            }
            local.key
        } else {
            match self.trans.get(&id).map(|t| &t.encryption) {
                Some(Encryption::On(CipherState { key: Some(key), .. })) => *key,
                _ => return Err(CryptoError::MissingKey("session".to_string()).into()),
            }
        };

        let (iv, data) = crypto::seal(&plain[6..], &key)?;
        ies.push(Ie::EncData { iv, data });
        let body = wire::encode_ies(&ies)?;
        let outer = Header {
            cmdresp: Command::Encrypt.code(),
            cmdflags: 0,
            ..*header
        };
        Ok(wire::encode_frame(&outer, &body))
    }

    pub(crate) fn send_ack(&mut self, id: TransId, final_: bool) {
        if let Err(e) = self.send(id, Command::Ack, final_, &[]) {
            log::debug!("Unable to acknowledge on transaction {}: {}", id, e);
        }
    }

    /// Send and log instead of propagating; used where a failed send has
    /// no caller to report to
    pub(crate) fn send_or_log(&mut self, id: TransId, cmd: Command, final_: bool, ies: &[Ie]) {
        if let Err(e) = self.send(id, cmd, final_, ies) {
            log::warn!("Unable to send {} on transaction {}: {}", cmd.name(), id, e);
        }
    }

    // ------------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------------

    /// Process one inbound datagram
    pub fn handle_frame(&mut self, addr: SocketAddr, buf: &[u8]) {
        Metrics::incr(&self.metrics.frames_in_total);
        let (hdr, body) = match wire::decode_frame(buf) {
            Ok(v) => v,
            Err(e) => {
                log::debug!("Dropping frame from {}: {}", addr, e);
                return;
            }
        };
        if self.debug {
            log::info!("Rx {} {}", addr, wire::describe_frame(&hdr, body));
        }

        let mut opened = false;
        let id = match self.find_transaction(&hdr, addr) {
            Some(id) => id,
            None => {
                let opens = hdr.command().map(|c| c.opens_dialog()).unwrap_or(false);
                if !opens || hdr.strans == 0 {
                    self.reject(&hdr, addr);
                    return;
                }
                let Some(id) = self.insert_transaction(addr, Kind::Inbound) else {
                    return;
                };
                if let Some(trans) = self.trans.get_mut(&id) {
                    trans.dtrans = hdr.strans & TRANS_ID_MASK;
                }
                opened = true;
                id
            }
        };

        let Some(trans) = self.trans.get_mut(&id) else {
            return;
        };
        if hdr.oseqno == trans.iseqno {
            if trans.ack(hdr.iseqno) && trans.final_sent {
                self.destroy_trans(id, false);
                return;
            }
            let mut final_ = hdr.is_final();
            if hdr.command_code() != Command::Ack.code() {
                let (saved_iseqno, saved_oiseqno) = (trans.iseqno, trans.oiseqno);
                trans.oiseqno = trans.iseqno;
                trans.iseqno = trans.iseqno.wrapping_add(1);
                match handlers::handle_command(self, id, &hdr, body, false) {
                    Some(f) => final_ = f,
                    None if opened => {
                        // nothing of the dialog survives an unreadable first frame
                        self.reject(&hdr, addr);
                        self.destroy_trans(id, false);
                        return;
                    }
                    None => {
                        if let Some(trans) = self.trans.get_mut(&id) {
                            trans.iseqno = saved_iseqno;
                            trans.oiseqno = saved_oiseqno;
                        }
                        return;
                    }
                }
            }
            let needs_ack = match self.trans.get(&id) {
                Some(t) if !t.is_dead() => t.aseqno != t.iseqno,
                _ => false,
            };
            if needs_ack {
                self.send_ack(id, final_);
                if let Some(trans) = self.trans.get_mut(&id) {
                    trans.aseqno = trans.iseqno;
                }
            }
            if let Some(trans) = self.trans.get_mut(&id) {
                trans.last_sent = None;
            }
            if final_ {
                self.destroy_trans(id, false);
            }
        } else if hdr.oseqno == trans.oiseqno {
            self.send_ack(id, false);
        } else {
            log::debug!(
                "Dropping packet out of window (got {}, expected {})",
                hdr.oseqno,
                trans.iseqno
            );
        }
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    /// Earliest instant any transaction or peer timer fires
    pub fn next_deadline(&self) -> Option<Instant> {
        let trans = self
            .trans
            .values()
            .filter(|t| !t.is_dead())
            .filter_map(|t| t.next_deadline());
        let peers = self
            .peers
            .iter()
            .flat_map(|p| [p.qualify_at, p.register_at, p.register_expire_at])
            .flatten();
        trans.chain(peers).min()
    }

    /// Fire every timer due at `now`
    pub fn run_timers(&mut self, now: Instant) {
        let due: Vec<TransId> = self
            .trans
            .values()
            .filter(|t| !t.is_dead() && t.next_deadline().map(|d| d <= now).unwrap_or(false))
            .map(|t| t.id)
            .collect();
        for id in due {
            self.service_transaction(id, now);
        }

        let fired = |at: Option<Instant>| at.map(|t| t <= now).unwrap_or(false);
        let mut expire = Vec::new();
        let mut register = Vec::new();
        let mut qualify = Vec::new();
        for peer in self.peers.iter() {
            if fired(peer.register_expire_at) {
                expire.push(peer.eid);
            }
            if fired(peer.register_at) {
                register.push(peer.eid);
            }
            if fired(peer.qualify_at) {
                qualify.push(peer.eid);
            }
        }
        for eid in expire {
            self.register_expire(&eid);
        }
        for eid in register {
            self.do_register(&eid);
        }
        for eid in qualify {
            self.qualify_peer(&eid, false);
        }

        if let Err(e) = self.secret.check(self.store.as_ref(), &self.settings.secretpath, now_epoch()) {
            log::warn!("Unable to rotate secret: {}", e);
        }
    }

    /// Autokill and retransmission of one transaction
    fn service_transaction(&mut self, id: TransId, now: Instant) {
        let Some(trans) = self.trans.get_mut(&id) else {
            return;
        };
        if trans.autokill_at.map(|at| at <= now).unwrap_or(false) {
            log::info!(
                "Transaction to '{}' took too long to ACK, destroying",
                trans.them_eid
            );
            self.destroy_trans(id, false);
            return;
        }

        let interval = trans.retrans_interval;
        let mut expired = None;
        let mut resend = Vec::new();
        for pack in trans.packets.iter_mut().filter(|p| p.next_retrans <= now) {
            if pack.retrans_left == 0 {
                expired = Some(pack.oseqno);
                break;
            }
            pack.retrans_left -= 1;
            pack.next_retrans = now + interval;
            resend.push(pack.data.clone());
        }
        let addr = trans.addr;
        if let Some(oseqno) = expired {
            if trans.kind != Kind::Qualify {
                log::info!(
                    "Max retries exceeded to host '{}' msg {} on call {}",
                    addr,
                    oseqno,
                    trans.strans
                );
            }
            self.destroy_trans(id, true);
            return;
        }
        for data in resend {
            Metrics::incr(&self.metrics.retransmissions_total);
            self.transmit(addr, data);
        }
    }

    /// Measure a peer's latency, or with `schedonly` only schedule the next check
    pub fn qualify_peer(&mut self, eid: &Eid, schedonly: bool) {
        let now = Instant::now();
        let Some(peer) = self.peers.find_mut(eid) else {
            return;
        };
        peer.qualify_at = None;
        let old = peer.qual_trans.take();
        let maxms = peer.maxms;
        let when = if schedonly {
            QUALIFY_SOON
        } else if peer.lastms < 0 {
            QUALIFY_RETRY
        } else {
            QUALIFY_INTERVAL
        };
        if maxms > 0 {
            peer.qualify_at = Some(now + when);
        }
        if let Some(old) = old {
            self.destroy_trans(old, false);
        }
        if maxms == 0 || schedonly {
            return;
        }
        let Some(id) = self.create_transaction(eid, Kind::Qualify) else {
            return;
        };
        if let Some(trans) = self.trans.get_mut(&id) {
            trans.phase = Phase::Qualifying;
            trans.autokill = None;
        }
        if let Some(peer) = self.peers.find_mut(eid) {
            peer.qual_trans = Some(id);
            peer.qual_tx = Some(now);
        }
        self.send_or_log(id, Command::Null, true, &[]);
    }

    /// Register ourselves with a peer and schedule the renewal
    pub fn do_register(&mut self, eid: &Eid) {
        let now = Instant::now();
        let Some(peer) = self.peers.find_mut(eid) else {
            return;
        };
        peer.register_at = Some(now + Duration::from_secs(REGISTER_EXPIRATION as u64));
        let old = peer.reg_trans.take();
        if let Some(old) = old {
            self.destroy_trans(old, false);
        }
        let Some(id) = self.create_transaction(eid, Kind::Register) else {
            log::info!("Unable to create new transaction for registering to '{}'!", eid);
            return;
        };
        let us_eid = match self.trans.get_mut(&id) {
            Some(trans) => {
                trans.phase = Phase::Registering;
                trans.us_eid
            }
            None => return,
        };
        if let Some(peer) = self.peers.find_mut(eid) {
            peer.reg_trans = Some(id);
        }
        let ies = [
            Ie::Version(wire::DEFAULT_VERSION),
            Ie::Eid(us_eid),
            Ie::Expiration(REGISTER_EXPIRATION),
        ];
        self.send_or_log(id, Command::RegReq, false, &ies);
    }

    /// A dynamic peer failed to renew its registration
    fn register_expire(&mut self, eid: &Eid) {
        if let Err(e) = self.store.delete(DPEERS_FAMILY, &eid.short()) {
            log::warn!("Unable to drop registration of '{}': {}", eid, e);
        }
        if let Some(peer) = self.peers.find_mut(eid) {
            log::debug!("Registration for '{}' expired", eid);
            peer.register_expire_at = None;
            peer.lastms = 0;
            peer.addr = None;
        }
    }

    // ------------------------------------------------------------------------
    // Requests and misc
    // ------------------------------------------------------------------------

    pub fn alloc_request_id(&mut self) -> RequestId {
        self.next_request += 1;
        self.next_request
    }

    /// Mappings and identity needed to answer `context` locally as `us`
    pub fn local_context(&self, context: &str, us: Eid) -> LocalContext {
        LocalContext {
            maps: self
                .mappings
                .iter()
                .filter(|m| m.dcontext.eq_ignore_ascii_case(context))
                .cloned()
                .collect(),
            us,
            secret: self.secret.current.clone(),
            ipaddr: self.settings.identity.ipaddr.clone(),
            cachetime: self.settings.cachetime,
        }
    }

    /// Drop lookup statistics, or with `stats == false` the answer cache
    pub fn flush(&mut self, stats: bool) -> Result<usize> {
        if stats {
            for peer in self.peers.iter_mut() {
                peer.history.clear();
            }
            return Ok(0);
        }
        Ok(self.cache.flush()?)
    }
}

// ============================================================================
// Node
// ============================================================================

/// Shared handle: the locked state plus the primitives used to wait on it
pub struct Node {
    state: Mutex<State>,
    cond: Condvar,
    waker: Waker,
    pub dialplan: Arc<dyn Dialplan>,
    pub metrics: Arc<Metrics>,
    precache: Mutex<PrecacheQueue>,
    precache_cond: Condvar,
    shutdown: AtomicBool,
}

impl Node {
    pub fn new(state: State, waker: Waker, dialplan: Arc<dyn Dialplan>) -> Self {
        let metrics = Arc::clone(&state.metrics);
        Self {
            state: Mutex::new(state),
            cond: Condvar::new(),
            waker,
            dialplan,
            metrics,
            precache: Mutex::new(PrecacheQueue::new()),
            precache_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hand queued work to the reactor and wake waiters if a request changed
    pub fn kick(&self, state: &mut State) {
        if !state.outbox.is_empty() || !state.jobs.is_empty() {
            if let Err(e) = self.waker.wake() {
                log::warn!("Unable to wake reactor: {}", e);
            }
        }
        if std::mem::take(&mut state.notify) {
            self.cond.notify_all();
        }
    }

    /// [`kick`](Self::kick) and unlock
    pub fn settle(&self, mut state: MutexGuard<'_, State>) {
        self.kick(&mut state);
        drop(state);
    }

    /// Sleep until notified or `deadline`, flushing queued work first
    pub fn wait_until<'a>(&self, mut state: MutexGuard<'a, State>, deadline: Instant) -> MutexGuard<'a, State> {
        self.kick(&mut state);
        let timeout = deadline.saturating_duration_since(Instant::now());
        if timeout.is_zero() {
            return state;
        }
        match self.cond.wait_timeout(state, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    pub fn notify_all(&self) {
        self.cond.notify_all();
    }

    pub fn precache_queue(&self) -> MutexGuard<'_, PrecacheQueue> {
        self.precache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue `number@context` for re-announcement in `expiration` seconds
    pub fn reschedule_precache(&self, number: &str, context: &str, expiration: u64) {
        self.precache_queue()
            .reschedule(number, context, expiration, now_epoch());
        self.precache_cond.notify_all();
    }

    /// Sleep on the precache queue for at most `timeout`
    pub fn wait_precache(&self, timeout: Duration) {
        let queue = self.precache_queue();
        if self.is_shutting_down() || queue.has_work(now_epoch()) {
            return;
        }
        let _ = self.precache_cond.wait_timeout(queue, timeout);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Stop the reactor and release every waiter
    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        {
            let mut state = self.lock();
            state.shutting_down = true;
        }
        if let Err(e) = self.waker.wake() {
            log::warn!("Unable to wake reactor: {}", e);
        }
        self.cond.notify_all();
        self.precache_cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GeneralConfig;
    use crate::peer::PeerStatus;
    use crate::store::MemoryStore;

    fn state() -> State {
        let mut general = GeneralConfig::default();
        general.bindaddr = "127.0.0.1".into();
        general.port = 0;
        general.entityid = Some("00:00:00:00:00:01".into());
        let settings = Settings::from_config(&general).unwrap();
        State::new(settings, Arc::new(MemoryStore::new()), Arc::new(Metrics::new())).unwrap()
    }

    fn config(peers: &str) -> Config {
        Config::from_json(&format!(
            r#"{{"general": {{"entityid": "00:00:00:00:00:01", "bindaddr": "127.0.0.1", "port": 0}},
                "peers": [{}],
                "mappings": [{{"dcontext": "e164", "lcontext": "local", "weight": 0, "tech": "SIP", "dest": "${{NUMBER}}@host"}}]}}"#,
            peers
        ))
        .unwrap()
    }

    const PEER: &str = r#"{"eid": "00:00:00:00:00:02", "host": "127.0.0.1", "port": 4599,
                           "model": "symmetric", "include": ["e164"], "permit": ["e164"]}"#;

    fn peer_eid() -> Eid {
        "00:00:00:00:00:02".parse().unwrap()
    }

    fn inbound_header(cmd: Command, strans: u16) -> Header {
        Header {
            strans,
            dtrans: 0,
            iseqno: 0,
            oseqno: 0,
            cmdresp: cmd.code(),
            cmdflags: 0,
        }
    }

    #[test]
    fn test_apply_config_loads_peers_and_mappings() {
        let mut s = state();
        s.apply_config(&config(PEER));
        assert_eq!(s.peers.len(), 1);
        assert_eq!(s.mappings.len(), 1);
        let peer = s.peers.find(&peer_eid()).unwrap();
        assert_eq!(peer.addr, Some("127.0.0.1:4599".parse().unwrap()));
        assert_eq!(peer.generation, 1);
    }

    #[test]
    fn test_reload_removes_missing_peer_and_transactions() {
        let mut s = state();
        s.apply_config(&config(PEER));
        let id = s.create_transaction(&peer_eid(), Kind::Outbound).unwrap();
        s.apply_config(&config(""));
        assert!(s.peers.is_empty());
        assert!(!s.trans.contains_key(&id));
    }

    #[test]
    fn test_unmatched_frame_rejected() {
        let mut s = state();
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let hdr = Header {
            strans: 7,
            dtrans: 99,
            iseqno: 1,
            oseqno: 2,
            cmdresp: Command::DpResponse.code(),
            cmdflags: 0,
        };
        s.handle_frame(addr, &wire::encode_frame(&hdr, &[]));
        assert_eq!(s.outbox.len(), 1);
        let (reply, _) = wire::decode_frame(&s.outbox[0].1).unwrap();
        assert_eq!(reply.command(), Some(Command::Invalid));
        assert_eq!((reply.strans, reply.dtrans), (99, 7));
        assert_eq!((reply.iseqno, reply.oseqno), (2, 1));
    }

    #[test]
    fn test_invalid_never_answered() {
        let mut s = state();
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let hdr = inbound_header(Command::Invalid, 7);
        s.handle_frame(addr, &wire::encode_frame(&hdr, &[]));
        assert!(s.outbox.is_empty());
    }

    #[test]
    fn test_null_opens_dialog_and_is_acked() {
        let mut s = state();
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let mut hdr = inbound_header(Command::Null, 7);
        hdr.cmdresp |= FLAG_FINAL;
        s.handle_frame(addr, &wire::encode_frame(&hdr, &[]));
        assert_eq!(s.outbox.len(), 1);
        let (ack, _) = wire::decode_frame(&s.outbox[0].1).unwrap();
        assert_eq!(ack.command(), Some(Command::Ack));
        assert!(ack.is_final());
        assert_eq!(ack.dtrans, 7);
        assert_eq!(ack.iseqno, 1);
        // final exchange: dialog gone
        assert!(s.trans.is_empty());
    }

    #[test]
    fn test_retransmit_duplicate_reacked() {
        let mut s = state();
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let frame = wire::encode_frame(&inbound_header(Command::Null, 7), &[]);
        s.handle_frame(addr, &frame);
        assert_eq!(s.outbox.len(), 1);
        s.handle_frame(addr, &frame);
        assert_eq!(s.outbox.len(), 2);
        let (ack, _) = wire::decode_frame(&s.outbox[1].1).unwrap();
        assert_eq!(ack.command(), Some(Command::Ack));
        assert!(!ack.is_final());
    }

    #[test]
    fn test_out_of_window_dropped() {
        let mut s = state();
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        s.handle_frame(addr, &wire::encode_frame(&inbound_header(Command::Null, 7), &[]));
        let strans = s.trans.values().next().unwrap().strans;
        let stray = Header {
            strans: 7,
            dtrans: strans,
            iseqno: 0,
            oseqno: 5,
            cmdresp: Command::Null.code(),
            cmdflags: 0,
        };
        s.handle_frame(addr, &wire::encode_frame(&stray, &[]));
        assert_eq!(s.outbox.len(), 1);
    }

    #[test]
    fn test_retransmit_then_give_up() {
        let mut s = state();
        s.apply_config(&config(PEER));
        let id = s.create_transaction(&peer_eid(), Kind::Outbound).unwrap();
        s.send(id, Command::DpDiscover, false, &[Ie::Ttl(1)]).unwrap();
        s.outbox.clear();
        let mut now = Instant::now();
        for _ in 0..4 {
            now += Duration::from_secs(2);
            if let Some(t) = s.trans.get_mut(&id) {
                t.autokill_at = None;
            }
            s.run_timers(now);
        }
        assert_eq!(s.outbox.len(), 4);
        now += Duration::from_secs(2);
        s.run_timers(now);
        assert!(!s.trans.contains_key(&id));
        assert_eq!(s.metrics.retransmissions_total.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_autokill_destroys() {
        let mut s = state();
        s.apply_config(&config(PEER));
        let id = s.create_transaction(&peer_eid(), Kind::Outbound).unwrap();
        s.send(id, Command::DpDiscover, false, &[]).unwrap();
        s.trans.get_mut(&id).unwrap().autokill_at = Some(Instant::now());
        s.run_timers(Instant::now() + Duration::from_millis(1));
        assert!(!s.trans.contains_key(&id));
    }

    #[test]
    fn test_busy_transaction_marked_dead() {
        let mut s = state();
        s.apply_config(&config(PEER));
        let id = s.create_transaction(&peer_eid(), Kind::Outbound).unwrap();
        s.trans.get_mut(&id).unwrap().busy = true;
        s.destroy_trans(id, false);
        assert!(s.is_dead(id));
        assert!(s.trans.contains_key(&id));
        s.release(id);
        assert!(!s.trans.contains_key(&id));
    }

    #[test]
    fn test_qualify_timeout_marks_unreachable() {
        let mut s = state();
        s.apply_config(&config(&PEER.replace("\"model\"", "\"qualify\": true, \"model\"")));
        s.qualify_peer(&peer_eid(), false);
        let id = s.peers.find(&peer_eid()).unwrap().qual_trans.unwrap();
        s.destroy_trans(id, true);
        let peer = s.peers.find(&peer_eid()).unwrap();
        assert_eq!(peer.lastms, -1);
        assert!(peer.qual_trans.is_none());
        assert!(!peer.is_usable());
    }

    #[test]
    fn test_dynamic_registration_restored() {
        let mut s = state();
        let expiry = now_epoch() + 30;
        s.store
            .put(DPEERS_FAMILY, &peer_eid().short(), &format!("127.0.0.1:4777:{}", expiry))
            .unwrap();
        s.apply_config(&config(&PEER.replace("\"127.0.0.1\"", "\"dynamic\"")));
        let peer = s.peers.find(&peer_eid()).unwrap();
        assert_eq!(peer.addr, Some("127.0.0.1:4777".parse().unwrap()));
        assert!(peer.register_expire_at.is_some());
    }

    #[test]
    fn test_stale_registration_dropped() {
        let mut s = state();
        s.store
            .put(DPEERS_FAMILY, &peer_eid().short(), "127.0.0.1:4777:10")
            .unwrap();
        s.apply_config(&config(&PEER.replace("\"127.0.0.1\"", "\"dynamic\"")));
        assert!(s.peers.find(&peer_eid()).unwrap().addr.is_none());
        assert!(s.store.get(DPEERS_FAMILY, &peer_eid().short()).is_none());
    }

    fn write_keypair(dir: &std::path::Path, name: &str) {
        use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
        let private = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let public = rsa::RsaPublicKey::from(&private);
        let pem = private.to_pkcs8_pem(LineEnding::LF).unwrap();
        std::fs::write(dir.join(format!("{}.key", name)), pem.as_bytes()).unwrap();
        std::fs::write(
            dir.join(format!("{}.pub", name)),
            public.to_public_key_pem(LineEnding::LF).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_full_key_flag_follows_announcement() {
        let dir = tempfile::tempdir().unwrap();
        write_keypair(dir.path(), "us");
        write_keypair(dir.path(), "them");
        let mut general = GeneralConfig::default();
        general.bindaddr = "127.0.0.1".into();
        general.port = 0;
        general.entityid = Some("00:00:00:00:00:01".into());
        general.keydir = dir.path().display().to_string();
        let settings = Settings::from_config(&general).unwrap();
        let mut s = State::new(settings, Arc::new(MemoryStore::new()), Arc::new(Metrics::new())).unwrap();
        s.apply_config(&config(&PEER.replace("\"model\"", "\"inkey\": \"them\", \"outkey\": \"us\", \"model\"")));

        // First dialog: fresh session key, sent in full
        let first = s.create_transaction(&peer_eid(), Kind::Outbound).unwrap();
        s.send(first, Command::DpDiscover, false, &[Ie::Ttl(1)]).unwrap();
        let (_, body) = wire::decode_frame(&s.outbox[0].1).unwrap();
        assert!(wire::IeSet::parse(body).unwrap().shared_key.is_some());
        assert!(s.peers.find(&peer_eid()).unwrap().sent_full_key);

        // A CRC-only announcement must not claim the full key went out
        s.peers.find_mut(&peer_eid()).unwrap().sent_full_key = false;
        let second = s.create_transaction(&peer_eid(), Kind::Outbound).unwrap();
        if let Some(Encryption::On(cipher)) = s.trans.get_mut(&second).map(|t| &mut t.encryption) {
            cipher.send_full_key = false;
        }
        s.send(second, Command::DpDiscover, false, &[Ie::Ttl(1)]).unwrap();
        let (hdr, body) = wire::decode_frame(&s.outbox[1].1).unwrap();
        assert_eq!(hdr.command(), Some(Command::Encrypt));
        let ies = wire::IeSet::parse(body).unwrap();
        assert!(ies.shared_key.is_none());
        assert!(ies.key_crc32.is_some());
        assert!(!s.peers.find(&peer_eid()).unwrap().sent_full_key);
    }

    #[test]
    fn test_qualify_unreachable_reported_once() {
        let mut s = state();
        s.apply_config(&config(&PEER.replace("\"model\"", "\"qualify\": true, \"model\"")));
        for _ in 0..2 {
            s.qualify_peer(&peer_eid(), false);
            assert!(s.peers.find(&peer_eid()).unwrap().qual_trans.is_some());
            // nobody answers, so the retransmissions run out
            let mut now = Instant::now();
            for _ in 0..8 {
                if s.peers.find(&peer_eid()).unwrap().qual_trans.is_none() {
                    break;
                }
                now += Duration::from_secs(1);
                s.run_timers(now);
            }
            let peer = s.peers.find(&peer_eid()).unwrap();
            assert!(peer.qual_trans.is_none());
            assert_eq!(peer.lastms, -1);
            assert_eq!(peer.status(), PeerStatus::Unreachable);
        }
        assert_eq!(s.metrics.peers_unreachable_total.load(Ordering::Relaxed), 1);
    }
}
