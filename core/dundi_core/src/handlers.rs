//! Inbound command dispatch
//!
//! Called by the engine, under the node lock, for every in-window command.
//! Queries are handed to the worker pool; responses are folded into the
//! request that owns the transaction.

use std::time::{Duration, Instant};

use crate::cache::CacheKey;
use crate::coordinator::{Job, QueryState};
use crate::crypto::{self, WrappedKey};
use crate::eid::Eid;
use crate::engine::{now_epoch, State, DEFAULT_CONTEXT, DPEERS_FAMILY, REGISTER_EXPIRATION};
use crate::peer::{has_permission, MODEL_INBOUND};
use crate::request::{AnswerSet, EntityInfo, HintMetadata, MAX_RESULTS};
use crate::transaction::{CipherState, Encryption, Phase, TransId, MAX_STACK};
use crate::wire::{cause, hint, Cause, Command, Header, Ie, IeSet};

const REGISTER_GRACE: u64 = 10;

/// Handle one command. Returns whether the dialog ends with this frame,
/// or `None` when the frame must be dropped unacknowledged.
pub(crate) fn handle_command(
    state: &mut State,
    id: TransId,
    hdr: &Header,
    body: &[u8],
    encrypted: bool,
) -> Option<bool> {
    let ies = match IeSet::parse(body) {
        Ok(ies) => ies,
        Err(e) => {
            log::warn!("Failed to parse DUNDi information elements: {}", e);
            return None;
        }
    };
    let final_ = hdr.is_final();
    let Some(cmd) = hdr.command() else {
        state.send_or_log(id, Command::Unknown, hdr.oseqno == 0, &[Ie::Unknown(hdr.command_code())]);
        return Some(final_);
    };

    match cmd {
        Command::DpDiscover | Command::EidQuery | Command::PrecacheRq => {
            handle_query(state, id, cmd, &ies, encrypted);
        }
        Command::RegReq => handle_regreq(state, id, &ies, encrypted),
        Command::DpResponse => handle_dpresponse(state, id, &ies, encrypted, final_),
        Command::EidResponse => handle_eidresponse(state, id, &ies, encrypted, final_),
        Command::RegResponse => handle_regresponse(state, id, encrypted, final_),
        Command::Encrypt => return handle_encrypt(state, id, hdr, &ies, encrypted),
        Command::EncRej => return Some(handle_encrej(state, id, final_)),
        Command::PrecacheRp => {
            log::debug!("Precache reply on transaction {}", id);
            cancel_unless_final(state, id, final_);
        }
        Command::Invalid | Command::Null => cancel_unless_final(state, id, final_),
        Command::Cancel | Command::Ack | Command::Unknown => {}
    }
    Some(final_)
}

fn cancel_unless_final(state: &mut State, id: TransId, final_: bool) {
    if !final_ {
        state.send_or_log(id, Command::Cancel, true, &[]);
    }
}

fn reply_cause(state: &mut State, id: TransId, resp: Command, code: u8, description: &str) {
    let ies = [Ie::Cause(Cause {
        code,
        description: description.to_string(),
    })];
    state.send_or_log(id, resp, true, &ies);
}

/// A response may only be trusted when the dialog it arrived on is as
/// secure as the peer requires
fn response_trusted(state: &State, id: TransId, encrypted: bool) -> bool {
    state
        .trans
        .get(&id)
        .map(|t| !t.encryption.is_on() || encrypted)
        .unwrap_or(false)
}

// ============================================================================
// Queries
// ============================================================================

fn handle_query(state: &mut State, id: TransId, cmd: Command, ies: &IeSet, encrypted: bool) {
    let resp = match cmd {
        Command::EidQuery => Command::EidResponse,
        Command::PrecacheRq => Command::PrecacheRp,
        _ => Command::DpResponse,
    };
    let context = ies
        .called_context
        .clone()
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| DEFAULT_CONTEXT.to_string());

    let peer = ies.sender().and_then(|eid| state.peers.find(&eid)).map(|p| {
        (
            p.eid,
            p.us_eid,
            p.wants_encryption(),
            p.model & MODEL_INBOUND != 0 && has_permission(&p.permit, &context),
            p.pcmodel & MODEL_INBOUND != 0 && has_permission(&p.include, &context),
        )
    });
    let Some((peer_eid, us_eid, wants_encryption, may_query, may_push)) = peer else {
        reply_cause(state, id, resp, cause::NOAUTH, "");
        return;
    };
    if let Some(trans) = state.trans.get_mut(&id) {
        trans.us_eid = us_eid;
        trans.them_eid = peer_eid;
    }
    if wants_encryption && !encrypted {
        reply_cause(state, id, resp, cause::NOAUTH, "Unencrypted responses not permitted");
        return;
    }

    let query = query_state(state, id, ies, &context, us_eid);
    if cmd == Command::EidQuery {
        let Some(reqeid) = ies.reqeid else {
            reply_cause(state, id, resp, cause::GENERAL, "Invalid or missing number/entity");
            return;
        };
        log::debug!("Answering EID query for '{}@{}'", reqeid, context);
        let identity = state.settings.identity.clone();
        enqueue(state, Job::Entity { query, reqeid, identity });
        return;
    }

    if query.number.is_empty() {
        reply_cause(state, id, resp, cause::GENERAL, "Invalid or missing number/entity");
    } else if cmd == Command::DpDiscover && may_query {
        if query.local.maps.is_empty() {
            reply_cause(state, id, resp, cause::NOAUTH, "Unsupported DUNDI Context");
        } else {
            log::debug!("Answering query for '{}@{}'", query.number, context);
            enqueue(state, Job::Answer(query));
        }
    } else if cmd == Command::PrecacheRq && may_push {
        if query.local.maps.is_empty() {
            reply_cause(state, id, resp, cause::NOAUTH, "Unsupported DUNDI Context");
        } else {
            absorb_precache(state, id, ies, &query);
            enqueue(state, Job::Precache(query));
        }
    } else {
        reply_cause(state, id, resp, cause::NOAUTH, "Permission to context denied");
    }
}

/// Snapshot of an inbound query for a worker.
///
/// The first EID authenticates the sender and the last is the root. When
/// they are the same node only the root part is kept.
fn query_state(state: &State, id: TransId, ies: &IeSet, context: &str, us_eid: Eid) -> QueryState {
    let mut eids = ies.eids.clone();
    if eids.len() > 1 && eids.first().map(|e| e.0) == eids.last().map(|e| e.0) {
        eids.remove(0);
    }
    eids.truncate(MAX_STACK);
    QueryState {
        trans: id,
        number: ies.called_number.clone().unwrap_or_default(),
        context: context.to_string(),
        ttl: ies.ttl.unwrap_or(0).saturating_sub(1),
        nocache: ies.cache_bypass,
        eids: eids.iter().map(|(eid, _)| *eid).collect(),
        directs: eids.iter().map(|(_, direct)| *direct).collect(),
        local: state.local_context(context, us_eid),
    }
}

fn enqueue(state: &mut State, job: Job) {
    if let Some(trans) = state.trans.get_mut(&job.trans()) {
        trans.busy = true;
        trans.phase = Phase::Answering;
    }
    state.jobs.push(job);
}

/// Cache the answers a peer pushed to us
fn absorb_precache(state: &mut State, id: TransId, ies: &IeSet, query: &QueryState) {
    let Some(them) = state.trans.get(&id).map(|t| t.them_eid) else {
        return;
    };
    let cachetime = state.settings.cachetime;
    let mut answers = AnswerSet::new(MAX_RESULTS, HintMetadata::default(), cachetime as i64);
    answers.absorb(ies, cachetime);
    let key = CacheKey {
        number: &query.number,
        context: &query.context,
        crc32: 0,
        root: Eid::ZERO,
    };
    let expiration = ies.expiration.map(i64::from).unwrap_or(-1);
    let now = now_epoch();
    if let Err(e) = state.cache.save(&them, &key, &answers.results, false, expiration, true, now) {
        log::warn!("Unable to cache precache from '{}': {}", them, e);
    }
    if let Some(peer_hint) = &ies.hint {
        if let Err(e) = state.cache.save_hint(&them, &key, peer_hint, expiration, now) {
            log::warn!("Unable to cache hint from '{}': {}", them, e);
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

fn handle_dpresponse(state: &mut State, id: TransId, ies: &IeSet, encrypted: bool, final_: bool) {
    if ies.cause_code() != cause::SUCCESS {
        cancel_unless_final(state, id, final_);
        return;
    }
    if !response_trusted(state, id, encrypted) {
        return;
    }
    let Some((them, parent)) = state.trans.get(&id).map(|t| (t.them_eid, t.parent)) else {
        return;
    };
    let cachetime = state.settings.cachetime;
    if let Some(req) = parent.and_then(|p| state.requests.get_mut(&p)) {
        if req.query_eid.is_none() {
            let start = req.answers.absorb(ies, cachetime);
            let key = CacheKey {
                number: &req.number,
                context: &req.context,
                crc32: req.crc32,
                root: req.root,
            };
            let unaffected = ies
                .hint
                .as_ref()
                .map(|h| h.flags & hint::UNAFFECTED != 0)
                .unwrap_or(false);
            let expiration = ies.expiration.map(i64::from).unwrap_or(-1);
            let now = now_epoch();
            let fresh = &req.answers.results[start..];
            if let Err(e) = state.cache.save(&them, &key, fresh, unaffected, expiration, false, now) {
                log::warn!("Unable to cache answers from '{}': {}", them, e);
            }
            if let Some(peer_hint) = &ies.hint {
                if let Err(e) = state.cache.save_hint(&them, &key, peer_hint, expiration, now) {
                    log::warn!("Unable to cache hint from '{}': {}", them, e);
                }
            }
        }
    }
    cancel_unless_final(state, id, final_);
}

fn handle_eidresponse(state: &mut State, id: TransId, ies: &IeSet, encrypted: bool, final_: bool) {
    if ies.cause_code() != cause::SUCCESS {
        cancel_unless_final(state, id, final_);
        return;
    }
    if !response_trusted(state, id, encrypted) {
        return;
    }
    let Some((them, parent, addr)) = state.trans.get(&id).map(|t| (t.them_eid, t.parent, t.addr)) else {
        return;
    };
    if let Some(req) = parent.and_then(|p| state.requests.get_mut(&p)) {
        if let Some(query_eid) = req.query_eid {
            if ies.organization.is_some() && req.entity.is_none() {
                let field = |v: &Option<String>| v.clone().unwrap_or_default();
                let mut info = EntityInfo {
                    department: field(&ies.department),
                    organization: field(&ies.organization),
                    locality: field(&ies.locality),
                    stateprov: field(&ies.stateprov),
                    country: field(&ies.country),
                    email: field(&ies.email),
                    phone: field(&ies.phone),
                    ipaddr: field(&ies.ipaddr),
                };
                if them == query_eid {
                    info.ipaddr = addr.ip().to_string();
                }
                req.entity = Some(info);
            }
            if ies.hint.as_ref().map(|h| h.flags & hint::TTL_EXPIRED != 0).unwrap_or(false) {
                req.answers.hint.set(hint::TTL_EXPIRED);
            }
        }
    }
    cancel_unless_final(state, id, final_);
}

fn handle_regresponse(state: &mut State, id: TransId, encrypted: bool, final_: bool) {
    if !response_trusted(state, id, encrypted) {
        log::info!("Response to register not authorized!");
        if !final_ {
            reply_cause(state, id, Command::Cancel, cause::NOAUTH, "Improper signature in answer");
        }
        return;
    }
    if let Some(trans) = state.trans.get(&id) {
        log::debug!("Registration with '{}' acknowledged", trans.them_eid);
    }
    cancel_unless_final(state, id, final_);
}

// ============================================================================
// Registration
// ============================================================================

fn handle_regreq(state: &mut State, id: TransId, ies: &IeSet, encrypted: bool) {
    let now = Instant::now();
    let peer = ies
        .sender()
        .and_then(|eid| state.peers.find(&eid))
        .filter(|p| p.is_dynamic())
        .map(|p| (p.eid, p.us_eid, p.wants_encryption()));
    let Some((peer_eid, us_eid, wants_encryption)) = peer else {
        reply_cause(state, id, Command::RegResponse, cause::NOAUTH, "");
        return;
    };
    let Some(addr) = state.trans.get_mut(&id).map(|t| {
        t.us_eid = us_eid;
        t.them_eid = peer_eid;
        t.addr
    }) else {
        return;
    };
    if wants_encryption && !encrypted {
        reply_cause(state, id, Command::RegResponse, cause::NOAUTH, "");
        return;
    }

    let expiry = now_epoch() + REGISTER_EXPIRATION as u64;
    let value = format!("{}:{}:{}", addr.ip(), addr.port(), expiry);
    if let Err(e) = state.store.put(DPEERS_FAMILY, &peer_eid.short(), &value) {
        log::warn!("Unable to store registration of '{}': {}", peer_eid, e);
    }
    let mut moved = false;
    if let Some(peer) = state.peers.find_mut(&peer_eid) {
        peer.register_expire_at =
            Some(now + Duration::from_secs(REGISTER_EXPIRATION as u64 + REGISTER_GRACE));
        moved = peer.addr != Some(addr);
        peer.addr = Some(addr);
    }
    state.send_or_log(id, Command::RegResponse, true, &[Ie::Expiration(REGISTER_EXPIRATION)]);
    if moved {
        log::info!("Registered DUNDi peer '{}' at '{}'", peer_eid, addr);
        state.qualify_peer(&peer_eid, true);
    }
}

// ============================================================================
// Encryption
// ============================================================================

fn handle_encrypt(state: &mut State, id: TransId, hdr: &Header, ies: &IeSet, encrypted: bool) -> Option<bool> {
    let final_ = hdr.is_final();
    if encrypted {
        // ENCRYPT inside ENCRYPT
        reject_encryption(state, id, final_);
        return Some(final_);
    }
    let (iseqno, oseqno) = state.trans.get(&id).map(|t| (t.iseqno, t.oseqno))?;

    if iseqno == 1 && oseqno == 0 {
        match accept_key(state, ies) {
            Ok((peer_eid, key)) => {
                state.apply_peer(id, &peer_eid);
                if let Some(trans) = state.trans.get_mut(&id) {
                    trans.encryption = Encryption::On(CipherState {
                        send_full_key: false,
                        key: Some(key),
                    });
                }
            }
            Err(reason) => {
                log::info!("Rejecting encrypted dialog {}: {}", id, reason);
                if !final_ {
                    state.send_or_log(id, Command::EncRej, true, &[]);
                }
                return Some(final_);
            }
        }
    }

    let key = match state.trans.get(&id).map(|t| &t.encryption) {
        Some(Encryption::On(CipherState { key: Some(key), .. })) => Some(*key),
        _ => None,
    };
    if let (Some(key), Some((iv, data))) = (key, &ies.encdata) {
        let plain = match crypto::open(iv, data, &key) {
            Ok(plain) if plain.len() >= 2 => plain,
            Ok(_) | Err(_) => {
                log::debug!("Ouch, decrypt failed on transaction {}", id);
                return None;
            }
        };
        let inner = Header {
            cmdresp: plain[0],
            cmdflags: plain[1],
            ..*hdr
        };
        if state.debug {
            log::info!("Rx (decrypted) {}", crate::wire::describe_frame(&inner, &plain[2..]));
        }
        let inner_final = handle_command(state, id, &inner, &plain[2..], true)?;
        return Some(final_ || inner_final);
    }

    reject_encryption(state, id, final_);
    Some(final_)
}

fn reject_encryption(state: &mut State, id: TransId, final_: bool) {
    if final_ {
        return;
    }
    if let Some(trans) = state.trans.get_mut(&id) {
        trans.encryption = Encryption::Off;
    }
    state.send_or_log(id, Command::EncRej, true, &[]);
}

/// Verify the sender's key announcement on the first packet of a dialog
fn accept_key(state: &mut State, ies: &IeSet) -> Result<(Eid, crypto::SessionKey), String> {
    let sender = ies.sender().ok_or_else(|| "no sender EID".to_string())?;
    let (inkey, outkey) = match state.peers.find(&sender) {
        Some(peer) => (peer.inkey.clone(), peer.outkey.clone()),
        None => return Err(format!("unknown peer '{}'", sender)),
    };
    let wrapped = match (&ies.shared_key, &ies.signature) {
        (Some(ciphertext), Some(signature)) => Some(WrappedKey {
            ciphertext: ciphertext.clone(),
            signature: signature.clone(),
        }),
        _ => None,
    };
    if wrapped.is_none() && ies.key_crc32.is_none() {
        return Err("no key announced".to_string());
    }
    let inkey = inkey.ok_or_else(|| format!("no inkey for '{}'", sender))?;
    let outkey = outkey.ok_or_else(|| format!("no outkey for '{}'", sender))?;
    let peer_public = state.keys.public_key(&inkey).map_err(|e| e.to_string())?;
    let our_private = state.keys.private_key(&outkey).map_err(|e| e.to_string())?;
    let peer = state
        .peers
        .find_mut(&sender)
        .ok_or_else(|| format!("unknown peer '{}'", sender))?;
    let key = peer
        .crypto
        .check_key(wrapped, ies.key_crc32, &peer_public, &our_private)
        .map_err(|e| e.to_string())?;
    Ok((sender, key))
}

/// The peer could not decrypt our dialog. Retry once with the full key.
fn handle_encrej(state: &mut State, id: TransId, final_: bool) -> bool {
    let Some(trans) = state.trans.get(&id) else {
        return final_;
    };
    let already_full = matches!(&trans.encryption, Encryption::On(c) if c.send_full_key);
    let known_peer = state.peers.find(&trans.them_eid).is_some();
    if already_full || trans.last_sent.is_none() || !known_peer {
        cancel_unless_final(state, id, final_);
        return final_;
    }
    if let Some(Encryption::On(cipher)) = state.trans.get_mut(&id).map(|t| &mut t.encryption) {
        cipher.send_full_key = true;
    }
    if !final_ {
        return final_;
    }

    state.send_ack(id, true);
    let last = match state.trans.get_mut(&id) {
        Some(trans) => {
            trans.aseqno = trans.iseqno;
            trans.last_sent.take()
        }
        None => None,
    };
    let Some(last) = last else {
        return final_;
    };
    if !state.reset_transaction(id) {
        return final_;
    }
    log::debug!("Retrying {} on transaction {} with the full key", last.cmd.name(), id);
    if let Err(e) = state.send_body(id, last.cmd, last.final_, last.body) {
        log::warn!("Unable to resend after ENCREJ: {}", e);
        return true;
    }
    false
}
