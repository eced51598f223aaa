//! Request coordination: lookups, entity queries and precache pushes
//!
//! These run on caller threads and on worker threads. Each one opens its
//! transactions under the node lock, lets go of the lock while the reactor
//! carries the dialogs, and sleeps on the node's condition variable until
//! every transaction of the request is gone or the TTL budget runs out.

use std::sync::MutexGuard;
use std::time::{Duration, Instant};

use crate::cache::CacheKey;
use crate::eid::{avoid_crc32, Eid};
use crate::engine::{now_epoch, Node, State, DEFAULT_CONTEXT};
use crate::error::{DundiError, Result};
use crate::mapping::{lookup_local, Dialplan, LocalIdentity, Mapping};
use crate::metrics::Metrics;
use crate::peer::{has_permission, MODEL_OUTBOUND};
use crate::request::{sort_results, AnswerSet, DundiResult, EntityInfo, HintMetadata, Request, RequestId, MAX_RESULTS};
use crate::transaction::{Phase, TransId, MAX_STACK};
use crate::wire::{cause, hint, Cause, Command, Ie, DEFAULT_VERSION};

// ============================================================================
// Constants
// ============================================================================

/// Fixed part of a request's time budget, milliseconds
pub const FLUFF_TIME_MS: u64 = 2000;
/// Budget added per remaining hop, milliseconds
pub const TTL_TIME_MS: u64 = 200;
/// Order that lets every peer tier take part at once
const ALL_TIERS: u32 = 9999;

fn request_window(ttl: u16) -> Duration {
    Duration::from_millis(FLUFF_TIME_MS + ttl as u64 * TTL_TIME_MS)
}

// ============================================================================
// Types shared with the engine
// ============================================================================

/// Everything needed to answer a context from our own dialplan
#[derive(Debug, Clone)]
pub struct LocalContext {
    pub maps: Vec<Mapping>,
    pub us: Eid,
    pub secret: String,
    pub ipaddr: String,
    pub cachetime: u32,
}

impl LocalContext {
    pub fn identity(&self) -> LocalIdentity<'_> {
        LocalIdentity {
            us: self.us,
            secret: &self.secret,
            ipaddr: &self.ipaddr,
            cachetime: self.cachetime,
        }
    }

    /// Run every mapping against the dialplan. Returns the best weight
    /// found, `u16::MAX` when nothing matched.
    pub fn answer(&self, dialplan: &dyn Dialplan, number: &str, set: &mut AnswerSet) -> u16 {
        let ident = self.identity();
        let mut found = Vec::new();
        for map in &self.maps {
            lookup_local(map, dialplan, number, &ident, &mut found, &mut set.hint);
        }
        let mut best = u16::MAX;
        for result in found {
            best = best.min(result.weight);
            set.merge(result);
        }
        best
    }
}

/// Inbound query handed to a worker
#[derive(Debug, Clone)]
pub struct QueryState {
    pub trans: TransId,
    pub number: String,
    pub context: String,
    /// Hops left for forwarding, already decremented
    pub ttl: u16,
    pub nocache: bool,
    /// Path of the query so far, root last
    pub eids: Vec<Eid>,
    /// Whether each entry of `eids` talked to its neighbour directly
    pub directs: Vec<bool>,
    pub local: LocalContext,
}

#[derive(Debug)]
pub enum Job {
    Answer(QueryState),
    Entity {
        query: QueryState,
        reqeid: Eid,
        identity: EntityInfo,
    },
    Precache(QueryState),
}

impl Job {
    pub fn trans(&self) -> TransId {
        match self {
            Job::Answer(q) | Job::Precache(q) => q.trans,
            Job::Entity { query, .. } => query.trans,
        }
    }

    /// Command that finishes the dialog the job answers
    pub fn response(&self) -> Command {
        match self {
            Job::Answer(_) => Command::DpResponse,
            Job::Entity { .. } => Command::EidResponse,
            Job::Precache(_) => Command::PrecacheRp,
        }
    }
}

/// Answers gathered by a lookup, best first
#[derive(Debug, Clone)]
pub struct LookupOutcome {
    pub results: Vec<DundiResult>,
    pub hint: HintMetadata,
    /// Seconds the answers stay valid
    pub expiration: i64,
}

struct LookupParams<'a> {
    number: &'a str,
    context: &'a str,
    ttl: u16,
    cache_bypass: bool,
    avoid: &'a [Eid],
    directs: Option<&'a [bool]>,
    skip: Option<Eid>,
    /// Select push-upstream peers instead of query peers
    precache: bool,
}

// ============================================================================
// Public entry points
// ============================================================================

fn context_or_default(context: &str) -> &str {
    if context.is_empty() {
        DEFAULT_CONTEXT
    } else {
        context
    }
}

/// Resolve `number@context`: our own mappings first, then the network
pub fn lookup(node: &Node, number: &str, context: &str, cache_bypass: bool) -> Result<LookupOutcome> {
    let context = context_or_default(context);
    if number.is_empty() {
        return Err(DundiError::InvalidArgument("empty number".into()));
    }
    let (local, ttl) = {
        let state = node.lock();
        if state.shutting_down {
            return Err(DundiError::ShutDown);
        }
        (state.local_context(context, state.us()), state.settings.ttl)
    };
    let mut set = AnswerSet::new(MAX_RESULTS, HintMetadata::pessimistic(), local.cachetime as i64);
    let best = local.answer(node.dialplan.as_ref(), number, &mut set);
    if best != 0 {
        let params = LookupParams {
            number,
            context,
            ttl,
            cache_bypass,
            avoid: &[],
            directs: None,
            skip: None,
            precache: false,
        };
        lookup_internal(node, &mut set, &params)?;
    }
    sort_results(&mut set.results);
    Ok(LookupOutcome {
        results: set.results,
        hint: set.hint,
        expiration: set.expiration,
    })
}

/// Ask the network who `eid` is. Our own identity is answered directly.
pub fn query_eid(node: &Node, eid: &Eid, context: &str) -> Result<Option<EntityInfo>> {
    let context = context_or_default(context);
    let (us, mut identity, ttl) = {
        let state = node.lock();
        if state.shutting_down {
            return Err(DundiError::ShutDown);
        }
        (state.us(), state.settings.identity.clone(), state.settings.ttl)
    };
    if *eid == us {
        if identity.ipaddr.is_empty() {
            identity.ipaddr = node.lock().settings.bind.ip().to_string();
        }
        return Ok(Some(identity));
    }
    let (entity, _) = query_eid_internal(node, context, eid, ttl, &[])?;
    Ok(entity)
}

/// Push our answers for `number@context` to the peers that accept them
pub fn precache(node: &Node, number: &str, context: &str) -> Result<()> {
    let context = context_or_default(context);
    let ttl = {
        let state = node.lock();
        if state.shutting_down {
            return Err(DundiError::ShutDown);
        }
        state.settings.ttl
    };
    precache_internal(node, context, number, ttl, &[])
}

// ============================================================================
// Lookup
// ============================================================================

fn lookup_internal(node: &Node, set: &mut AnswerSet, p: &LookupParams<'_>) -> Result<()> {
    let window = request_window(p.ttl);
    let root = p.avoid.last().copied().unwrap_or(Eid::ZERO);
    let crc32 = avoid_crc32(p.avoid);

    let mut state = node.lock();
    if state.shutting_down {
        return Err(DundiError::ShutDown);
    }
    Metrics::incr(&state.metrics.lookups_total);

    let pending = state
        .requests
        .values()
        .find(|r| r.registered && r.query_eid.is_none() && r.same_query(p.number, p.context, &root, crc32))
        .map(|r| (r.id, r.root));
    if let Some((pending, pending_root)) = pending {
        if !p.avoid.is_empty() && pending_root == root {
            log::debug!("Duplicate request for '{}@{}' on behalf of '{}'", p.number, p.context, root);
            return Err(DundiError::DuplicatePending);
        }
        log::debug!("Waiting for similar request for '{}@{}'", p.number, p.context);
        let deadline = Instant::now() + window;
        while !state.shutting_down && Instant::now() < deadline && state.requests.contains_key(&pending) {
            state = node.wait_until(state, deadline);
        }
    }

    let id = state.alloc_request_id();
    let answers = std::mem::replace(set, AnswerSet::new(0, HintMetadata::default(), 0));
    let mut req = Request::new(id, p.number, p.context, p.avoid, answers);
    req.cache_bypass = p.cache_bypass;
    req.registered = pending.is_none();
    state.requests.insert(id, req);

    let mut order = 0;
    loop {
        let (foundcache, skipped) = build_transactions(&mut state, id, p, order);
        let empty = state.requests.get(&id).map(|r| r.transactions.is_empty()).unwrap_or(true);
        match skipped {
            Some(next) if !foundcache && empty => order = next,
            _ => break,
        }
    }

    if p.ttl == 0 {
        if let Some(req) = state.requests.get_mut(&id) {
            req.answers.hint.set(hint::TTL_EXPIRED);
        }
        abort_request(&mut state, id);
        if let Some(req) = finish_request(&mut state, id) {
            *set = req.answers;
        }
        node.settle(state);
        return Ok(());
    }

    optimize_transactions(&mut state, id, order);
    for tid in request_transactions(&state, id) {
        discover(&mut state, tid);
    }
    let mut state = wait_for_request(node, state, id, window);
    cancel_request(&mut state, id);
    if let Some(req) = finish_request(&mut state, id) {
        *set = req.answers;
    }
    node.settle(state);
    Ok(())
}

/// Open transactions toward every peer of tier `order` or better.
///
/// Returns whether some peer answered from cache, and the best tier that
/// was left out.
fn build_transactions(state: &mut State, id: RequestId, p: &LookupParams<'_>, order: u32) -> (bool, Option<u32>) {
    let Some((crc32, root)) = state.requests.get(&id).map(|r| (r.crc32, r.root)) else {
        return (false, None);
    };
    let now = now_epoch();
    let candidates: Vec<(Eid, Eid, u32, bool)> = state
        .peers
        .iter()
        .filter_map(|peer| {
            let (pass, allowconnect) = if p.precache {
                (
                    has_permission(&peer.permit, p.context) && peer.pcmodel & MODEL_OUTBOUND != 0,
                    true,
                )
            } else {
                (has_permission(&peer.include, p.context), peer.model & MODEL_OUTBOUND != 0)
            };
            if !pass || p.skip == Some(peer.eid) {
                return None;
            }
            Some((peer.eid, peer.us_eid, peer.order, allowconnect))
        })
        .collect();

    let mut foundcache = false;
    let mut skipped: Option<u32> = None;
    for (eid, us_eid, peer_order, allowconnect) in candidates {
        if peer_order > order {
            skipped = Some(skipped.map_or(peer_order, |s| s.min(peer_order)));
            continue;
        }
        let mut hit = false;
        if !p.cache_bypass {
            let key = CacheKey {
                number: p.number,
                context: p.context,
                crc32,
                root,
            };
            if let Some(req) = state.requests.get_mut(&id) {
                hit = state.cache.lookup(&eid, &key, &mut req.answers, now);
            }
            if hit {
                Metrics::incr(&state.metrics.cache_hits_total);
                log::debug!("Cached answers from '{}' for '{}@{}'", eid, p.number, p.context);
            }
        }
        if !hit {
            let avoided = p.avoid.iter().position(|a| *a == eid || *a == us_eid);
            if let (Some(idx), Some(directs)) = (avoided, p.directs) {
                if !directs.get(idx).copied().unwrap_or(false) {
                    if let Some(req) = state.requests.get_mut(&id) {
                        req.answers.hint.clear(hint::UNAFFECTED);
                    }
                }
            }
            if allowconnect {
                if avoided.is_some() {
                    log::debug!("Avoiding '{}' in transaction", eid);
                } else if p.ttl > 0 {
                    append_transaction(state, id, &eid, p.ttl, p.avoid);
                }
            }
        }
        foundcache |= hit;
    }
    (foundcache, skipped)
}

fn append_transaction(state: &mut State, id: RequestId, peer: &Eid, ttl: u16, avoid: &[Eid]) {
    if !state.peers.find(peer).map(|p| p.is_usable()).unwrap_or(false) {
        return;
    }
    if let Some(req) = state.requests.get(&id) {
        match req.query_eid {
            Some(eid) => log::debug!("Will query peer '{}' for '{}' (context '{}')", peer, eid, req.context),
            None => log::debug!("Will query peer '{}' for '{}@{}'", peer, req.number, req.context),
        }
    }
    let Some(tid) = state.create_transaction(peer, crate::transaction::Kind::Outbound) else {
        return;
    };
    if let Some(trans) = state.trans.get_mut(&tid) {
        trans.parent = Some(id);
        trans.ttl = ttl;
        trans.eids = avoid.iter().take(MAX_STACK).copied().collect();
    }
    if let Some(req) = state.requests.get_mut(&id) {
        req.transactions.push(tid);
    }
}

fn request_transactions(state: &State, id: RequestId) -> Vec<TransId> {
    state
        .requests
        .get(&id)
        .map(|r| r.transactions.clone())
        .unwrap_or_default()
}

/// Tell each transaction's peer about the other peers we are already
/// asking, so the query does not come back to us through them. The true
/// root stays at the end of the list.
fn optimize_transactions(state: &mut State, id: RequestId, order: u32) {
    let Some(context) = state.requests.get(&id).map(|r| r.context.clone()) else {
        return;
    };
    let reachable: Vec<(Eid, u32)> = state
        .peers
        .iter()
        .filter(|p| !p.eid.is_zero() && p.lastms > -1 && has_permission(&p.include, &context))
        .map(|p| (p.eid, p.order))
        .collect();
    for tid in request_transactions(state, id) {
        let Some(trans) = state.trans.get_mut(&tid) else {
            continue;
        };
        let (root, mut needpush) = match trans.eids.pop() {
            Some(root) => (root, true),
            None => (trans.us_eid, false),
        };
        for (eid, peer_order) in &reachable {
            if *eid == trans.them_eid || *peer_order > order || *eid == root || trans.eids.contains(eid) {
                continue;
            }
            let room = MAX_STACK - usize::from(needpush);
            if trans.eids.len() < room {
                trans.eids.push(*eid);
                needpush = true;
            }
        }
        if needpush {
            trans.eids.push(root);
        }
    }
}

/// EID path entry, marked direct when we talk to that node ourselves
fn path_ie(state: &State, context: &str, eid: &Eid, us: &Eid) -> Ie {
    let direct = eid == us
        || state
            .peers
            .find(eid)
            .map(|p| has_permission(&p.include, context))
            .unwrap_or(false);
    if direct {
        Ie::EidDirect(*eid)
    } else {
        Ie::Eid(*eid)
    }
}

fn arm_autokill(state: &mut State, tid: TransId) {
    if let Some(trans) = state.trans.get_mut(&tid) {
        trans.autokill_at = trans.autokill.map(|d| Instant::now() + d);
    }
}

fn discover(state: &mut State, tid: TransId) {
    let Some(trans) = state.trans.get(&tid) else {
        return;
    };
    let Some(req) = trans.parent.and_then(|p| state.requests.get(&p)) else {
        return;
    };
    let us = trans.us_eid;
    let mut ies = vec![Ie::Version(DEFAULT_VERSION)];
    if !us.is_zero() {
        ies.push(Ie::EidDirect(us));
    }
    for eid in &trans.eids {
        ies.push(path_ie(state, &req.context, eid, &us));
    }
    ies.push(Ie::CalledNumber(req.number.clone()));
    ies.push(Ie::CalledContext(req.context.clone()));
    ies.push(Ie::Ttl(trans.ttl));
    if req.cache_bypass {
        ies.push(Ie::CacheBypass);
    }
    arm_autokill(state, tid);
    if let Some(trans) = state.trans.get_mut(&tid) {
        trans.phase = Phase::Discovering;
    }
    state.send_or_log(tid, Command::DpDiscover, false, &ies);
}

fn query(state: &mut State, tid: TransId) {
    let Some(trans) = state.trans.get(&tid) else {
        return;
    };
    let Some(req) = trans.parent.and_then(|p| state.requests.get(&p)) else {
        return;
    };
    let Some(query_eid) = req.query_eid else {
        return;
    };
    let mut ies = vec![Ie::Version(DEFAULT_VERSION)];
    if !trans.us_eid.is_zero() {
        ies.push(Ie::Eid(trans.us_eid));
    }
    ies.extend(trans.eids.iter().map(|e| Ie::Eid(*e)));
    ies.push(Ie::ReqEid(query_eid));
    ies.push(Ie::CalledContext(req.context.clone()));
    ies.push(Ie::Ttl(trans.ttl));
    arm_autokill(state, tid);
    if let Some(trans) = state.trans.get_mut(&tid) {
        trans.phase = Phase::Querying;
    }
    state.send_or_log(tid, Command::EidQuery, false, &ies);
}

fn wait_for_request<'a>(
    node: &'a Node,
    mut state: MutexGuard<'a, State>,
    id: RequestId,
    window: Duration,
) -> MutexGuard<'a, State> {
    let deadline = Instant::now() + window;
    loop {
        let pending = state.requests.get(&id).map(|r| !r.is_complete()).unwrap_or(false);
        if !pending || state.shutting_down || Instant::now() >= deadline {
            return state;
        }
        state = node.wait_until(state, deadline);
    }
}

/// Orphan every remaining transaction and end it with a final CANCEL
fn cancel_request(state: &mut State, id: RequestId) {
    let remaining = match state.requests.get_mut(&id) {
        Some(req) => std::mem::take(&mut req.transactions),
        None => return,
    };
    for tid in remaining {
        if let Some(trans) = state.trans.get_mut(&tid) {
            trans.parent = None;
        }
        state.send_or_log(tid, Command::Cancel, true, &[]);
    }
}

/// Destroy every remaining transaction without telling the peers
fn abort_request(state: &mut State, id: RequestId) {
    for tid in request_transactions(state, id) {
        state.destroy_trans(tid, false);
    }
}

/// Unregister the request and wake anyone waiting on it as a duplicate
fn finish_request(state: &mut State, id: RequestId) -> Option<Request> {
    let req = state.requests.remove(&id)?;
    state.notify = true;
    Some(req)
}

// ============================================================================
// Entity queries
// ============================================================================

fn query_eid_internal(
    node: &Node,
    context: &str,
    eid: &Eid,
    ttl: u16,
    avoid: &[Eid],
) -> Result<(Option<EntityInfo>, HintMetadata)> {
    let window = request_window(ttl);
    let mut state = node.lock();
    if state.shutting_down {
        return Err(DundiError::ShutDown);
    }
    let id = state.alloc_request_id();
    let mut req = Request::new(id, "", context, avoid, AnswerSet::new(0, HintMetadata::default(), 0));
    req.query_eid = Some(*eid);
    state.requests.insert(id, req);

    let params = LookupParams {
        number: "",
        context,
        ttl,
        cache_bypass: true,
        avoid,
        directs: None,
        skip: None,
        precache: false,
    };
    build_transactions(&mut state, id, &params, ALL_TIERS);

    if ttl == 0 {
        abort_request(&mut state, id);
        let mut hint = finish_request(&mut state, id).map(|r| r.answers.hint).unwrap_or_default();
        hint.set(hint::TTL_EXPIRED);
        node.settle(state);
        return Ok((None, hint));
    }

    optimize_transactions(&mut state, id, ALL_TIERS);
    for tid in request_transactions(&state, id) {
        query(&mut state, tid);
    }
    let mut state = wait_for_request(node, state, id, window);
    cancel_request(&mut state, id);
    let outcome = finish_request(&mut state, id)
        .map(|r| (r.entity, r.answers.hint))
        .unwrap_or((None, HintMetadata::default()));
    node.settle(state);
    Ok(outcome)
}

// ============================================================================
// Precache
// ============================================================================

fn precache_internal(node: &Node, context: &str, number: &str, ttl: u16, avoid: &[Eid]) -> Result<()> {
    let window = request_window(ttl);
    let mut state = node.lock();
    if state.shutting_down {
        return Err(DundiError::ShutDown);
    }
    let cachetime = state.settings.cachetime;
    let us = state.us();
    if state.local_context(context, us).maps.is_empty() {
        return Err(DundiError::NoMapping(context.to_string()));
    }

    let id = state.alloc_request_id();
    let req = Request::new(
        id,
        number,
        context,
        avoid,
        AnswerSet::new(MAX_RESULTS, HintMetadata::default(), cachetime as i64),
    );
    state.requests.insert(id, req);
    let params = LookupParams {
        number,
        context,
        ttl,
        cache_bypass: true,
        avoid,
        directs: None,
        skip: None,
        precache: true,
    };
    build_transactions(&mut state, id, &params, 0);
    optimize_transactions(&mut state, id, 0);

    // Held busy so a reply or timeout cannot free them while we compute
    let targets = request_transactions(&state, id);
    for tid in &targets {
        if let Some(trans) = state.trans.get_mut(tid) {
            trans.busy = true;
        }
    }
    node.settle(state);

    let mut min_expiration = cachetime as i64;
    let mut found = 0;
    for tid in &targets {
        found += precache_trans(node, *tid, number, context, &mut min_expiration);
    }

    let mut state = node.lock();
    for tid in &targets {
        state.release(*tid);
    }
    drop(state);

    if found > 0 {
        if min_expiration > 0 {
            node.reschedule_precache(number, context, min_expiration as u64);
        } else {
            log::info!(
                "Expiration {} while precaching '{}@{}', not rescheduling",
                min_expiration,
                number,
                context
            );
        }
    }

    let mut state = wait_for_request(node, node.lock(), id, window);
    cancel_request(&mut state, id);
    finish_request(&mut state, id);
    node.settle(state);
    Ok(())
}

/// Gather answers on behalf of one upstream peer and push them. Returns
/// the number of answers sent.
fn precache_trans(node: &Node, tid: TransId, number: &str, context: &str, min_expiration: &mut i64) -> usize {
    let (them, us_eid, ttl, local) = {
        let state = node.lock();
        let Some(trans) = state.trans.get(&tid).filter(|t| !t.is_dead()) else {
            return 0;
        };
        let (them, us_eid, ttl) = (trans.them_eid, trans.us_eid, trans.ttl);
        (them, us_eid, ttl, state.local_context(context, us_eid))
    };

    let mut set = AnswerSet::new(MAX_RESULTS, HintMetadata::default(), local.cachetime as i64);
    let best = local.answer(node.dialplan.as_ref(), number, &mut set);
    if best != 0 {
        let params = LookupParams {
            number,
            context,
            ttl,
            cache_bypass: true,
            avoid: &[],
            directs: None,
            skip: Some(them),
            precache: true,
        };
        if let Err(e) = lookup_internal(node, &mut set, &params) {
            log::debug!("Lookup for precache of '{}@{}' failed: {}", number, context, e);
        }
    }

    let mut state = node.lock();
    let Some(path) = state.trans.get(&tid).filter(|t| !t.is_dead()).map(|t| t.eids.clone()) else {
        return 0;
    };
    if set.results.is_empty() {
        state.destroy_trans(tid, false);
        node.settle(state);
        return 0;
    }

    let mut ies = vec![Ie::Version(DEFAULT_VERSION)];
    if !us_eid.is_zero() {
        ies.push(Ie::Eid(us_eid));
    }
    ies.extend(path.into_iter().map(Ie::Eid));
    ies.push(Ie::CalledNumber(number.to_string()));
    ies.push(Ie::CalledContext(context.to_string()));
    ies.push(Ie::Ttl(ttl));
    let mut expiration = set.expiration;
    for result in &set.results {
        if result.expiration != 0 && expiration > result.expiration as i64 {
            expiration = result.expiration as i64;
        }
        ies.push(Ie::Answer(result.to_answer()));
    }
    ies.push(Ie::Hint(set.hint.to_wire()));
    ies.push(Ie::Expiration(clamp_expiration(expiration)));

    arm_autokill(&mut state, tid);
    if let Some(trans) = state.trans.get_mut(&tid) {
        trans.phase = Phase::Precaching;
    }
    log::debug!("Precaching {} answers for '{}@{}' to '{}'", set.results.len(), number, context, them);
    state.send_or_log(tid, Command::PrecacheRq, false, &ies);
    node.settle(state);
    *min_expiration = (*min_expiration).min(expiration);
    set.results.len()
}

fn clamp_expiration(expiration: i64) -> u16 {
    expiration.clamp(0, u16::MAX as i64) as u16
}

/// Queue every extension of every mapped local context for precaching
pub(crate) fn precache_full(node: &Node) {
    let maps = node.lock().mappings.clone();
    for map in &maps {
        let extensions = node.dialplan.extensions(&map.lcontext);
        log::debug!(
            "Queueing {} extensions of '{}' for precache in '{}'",
            extensions.len(),
            map.lcontext,
            map.dcontext
        );
        for exten in extensions {
            node.reschedule_precache(&exten, &map.dcontext, 0);
        }
    }
}

/// Precache thread body: work the queue until shutdown
pub(crate) fn run_precache_queue(node: &Node) {
    while !node.is_shutting_down() {
        let due = node.precache_queue().next_due(now_epoch());
        match due {
            Some((number, context)) => {
                if let Err(e) = precache(node, &number, &context) {
                    log::debug!("Precache of '{}@{}' failed: {}", number, context, e);
                }
            }
            None => node.wait_precache(Duration::from_secs(1)),
        }
    }
    log::debug!("Precache thread exiting");
}

// ============================================================================
// Workers
// ============================================================================

/// Worker entry point
pub(crate) fn run_job(node: &Node, job: Job) {
    match job {
        Job::Answer(query) => answer_query(node, query),
        Job::Entity {
            query,
            reqeid,
            identity,
        } => answer_entity(node, query, reqeid, identity),
        Job::Precache(query) => answer_precache(node, query),
    }
}

/// Refuse a job the pool had no room for
pub(crate) fn refuse_job(state: &mut State, job: Job) {
    let id = job.trans();
    log::warn!("Out of threads answering transaction {}", id);
    if !state.is_dead(id) {
        let ies = [Ie::Cause(Cause {
            code: cause::GENERAL,
            description: "Out of threads".into(),
        })];
        state.send_or_log(id, job.response(), true, &ies);
    }
    state.release(id);
}

/// Lock the node and check the transaction survived while we worked
fn reclaim(node: &Node, id: TransId) -> Option<MutexGuard<'_, State>> {
    let mut state = node.lock();
    if state.is_dead(id) {
        log::debug!("Transaction {} went away while we answered it", id);
        state.release(id);
        node.settle(state);
        return None;
    }
    Some(state)
}

fn answer_query(node: &Node, query: QueryState) {
    log::debug!(
        "Looking up '{}@{}' for transaction {}",
        query.number,
        query.context,
        query.trans
    );
    let mut set = AnswerSet::new(MAX_RESULTS, HintMetadata::pessimistic(), query.local.cachetime as i64);
    let best = query.local.answer(node.dialplan.as_ref(), &query.number, &mut set);
    let mut duplicate = false;
    if best != 0 {
        let params = LookupParams {
            number: &query.number,
            context: &query.context,
            ttl: query.ttl,
            cache_bypass: query.nocache,
            avoid: &query.eids,
            directs: Some(&query.directs),
            skip: None,
            precache: false,
        };
        match lookup_internal(node, &mut set, &params) {
            Ok(()) => {}
            Err(DundiError::DuplicatePending) => duplicate = true,
            Err(e) => log::debug!("Forwarded lookup for '{}@{}' failed: {}", query.number, query.context, e),
        }
    }

    let Some(mut state) = reclaim(node, query.trans) else {
        return;
    };
    let mut ies = Vec::with_capacity(set.results.len() + 3);
    if duplicate && set.results.is_empty() {
        ies.push(Ie::Cause(Cause {
            code: cause::DUPLICATE,
            description: "Duplicate Request Pending".into(),
        }));
    }
    let mut expiration = set.expiration;
    for result in &set.results {
        if result.expiration != 0 && expiration > result.expiration as i64 {
            expiration = result.expiration as i64;
        }
        ies.push(Ie::Answer(result.to_answer()));
    }
    ies.push(Ie::Hint(set.hint.to_wire()));
    ies.push(Ie::Expiration(clamp_expiration(expiration)));
    state.send_or_log(query.trans, Command::DpResponse, true, &ies);
    state.release(query.trans);
    node.settle(state);
}

fn answer_entity(node: &Node, query: QueryState, reqeid: Eid, identity: EntityInfo) {
    let (entity, hint) = if reqeid == query.local.us {
        log::debug!("Answering entity query for ourselves");
        (Some(identity), HintMetadata::default())
    } else {
        match query_eid_internal(node, &query.context, &reqeid, query.ttl, &query.eids) {
            Ok(found) => found,
            Err(e) => {
                log::debug!("Entity query for '{}' failed: {}", reqeid, e);
                (None, HintMetadata::default())
            }
        }
    };

    let Some(mut state) = reclaim(node, query.trans) else {
        return;
    };
    let mut ies = Vec::new();
    if let Some(info) = entity {
        let fields: [(String, fn(String) -> Ie); 8] = [
            (info.department, Ie::Department),
            (info.organization, Ie::Organization),
            (info.locality, Ie::Locality),
            (info.stateprov, Ie::StateProv),
            (info.country, Ie::Country),
            (info.email, Ie::Email),
            (info.phone, Ie::Phone),
            (info.ipaddr, Ie::IpAddr),
        ];
        for (value, ie) in fields {
            if !value.is_empty() {
                ies.push(ie(value));
            }
        }
    }
    ies.push(Ie::Hint(hint.to_wire()));
    state.send_or_log(query.trans, Command::EidResponse, true, &ies);
    state.release(query.trans);
    node.settle(state);
}

fn answer_precache(node: &Node, query: QueryState) {
    if let Err(e) = precache_internal(node, &query.context, &query.number, query.ttl, &query.eids) {
        log::debug!("Onward precache of '{}@{}' failed: {}", query.number, query.context, e);
    }
    let Some(mut state) = reclaim(node, query.trans) else {
        return;
    };
    state.send_or_log(query.trans, Command::PrecacheRp, true, &[]);
    state.release(query.trans);
    node.settle(state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::mapping::StaticDialplan;
    use crate::store::MemoryStore;
    use crate::transaction::Kind;
    use crate::wire::decode_frame;
    use mio::{Poll, Token};
    use std::sync::Arc;

    const CONFIG: &str = r#"{
        "general": { "entityid": "00:00:00:00:00:01", "bindaddr": "127.0.0.1", "port": 0, "ttl": 4 },
        "peers": [
            { "eid": "00:00:00:00:00:02", "host": "127.0.0.1", "port": 4521, "model": "symmetric",
              "include": ["all"], "permit": ["all"] },
            { "eid": "00:00:00:00:00:03", "host": "127.0.0.1", "port": 4522, "model": "outbound",
              "include": ["all"], "order": "secondary" }
        ],
        "mappings": [
            { "dcontext": "e164", "lcontext": "local", "weight": 10, "tech": "IAX2", "dest": "${NUMBER}@here" }
        ]
    }"#;

    fn node(dialplan: StaticDialplan) -> (Poll, Node) {
        let config = Config::from_json(CONFIG).unwrap();
        let settings = crate::config::Settings::from_config(&config.general).unwrap();
        let mut state = State::new(settings, Arc::new(MemoryStore::new()), Arc::new(Metrics::new())).unwrap();
        state.apply_config(&config);
        let poll = Poll::new().unwrap();
        let waker = mio::Waker::new(poll.registry(), Token(1)).unwrap();
        (poll, Node::new(state, waker, Arc::new(dialplan)))
    }

    fn params<'a>(number: &'a str, ttl: u16, avoid: &'a [Eid]) -> LookupParams<'a> {
        LookupParams {
            number,
            context: "e164",
            ttl,
            cache_bypass: true,
            avoid,
            directs: None,
            skip: None,
            precache: false,
        }
    }

    fn add_request(state: &mut State, p: &LookupParams<'_>) -> RequestId {
        let id = state.alloc_request_id();
        let req = Request::new(id, p.number, p.context, p.avoid, AnswerSet::new(MAX_RESULTS, HintMetadata::default(), 60));
        state.requests.insert(id, req);
        id
    }

    #[test]
    fn test_local_answer_best_weight() {
        let dialplan = StaticDialplan::new().with_extensions("local", &["100"]);
        let (_poll, node) = node(dialplan);
        let local = {
            let state = node.lock();
            state.local_context("e164", state.us())
        };
        let mut set = AnswerSet::new(MAX_RESULTS, HintMetadata::pessimistic(), 60);
        assert_eq!(local.answer(node.dialplan.as_ref(), "100", &mut set), 10);
        assert_eq!(set.results.len(), 1);
        assert_eq!(set.results[0].dest, "100@here");
        assert!(!set.hint.has(hint::DONT_ASK));

        let mut miss = AnswerSet::new(MAX_RESULTS, HintMetadata::pessimistic(), 60);
        assert_eq!(local.answer(node.dialplan.as_ref(), "200", &mut miss), u16::MAX);
        assert!(miss.results.is_empty());
    }

    #[test]
    fn test_tiers_skip_secondary_peer() {
        let (_poll, node) = node(StaticDialplan::new());
        let mut state = node.lock();
        let p = params("100", 3, &[]);
        let id = add_request(&mut state, &p);
        let (foundcache, skipped) = build_transactions(&mut state, id, &p, 0);
        assert!(!foundcache);
        assert!(skipped.is_some());
        let trans = request_transactions(&state, id);
        assert_eq!(trans.len(), 1);
        assert_eq!(state.trans[&trans[0]].them_eid, "00:00:00:00:00:02".parse().unwrap());
        assert_eq!(state.trans[&trans[0]].ttl, 3);
    }

    #[test]
    fn test_avoided_peer_not_asked() {
        let (_poll, node) = node(StaticDialplan::new());
        let mut state = node.lock();
        let avoid: Vec<Eid> = vec!["00:00:00:00:00:02".parse().unwrap()];
        let p = params("100", 3, &avoid);
        let id = add_request(&mut state, &p);
        build_transactions(&mut state, id, &p, ALL_TIERS);
        let trans = request_transactions(&state, id);
        assert_eq!(trans.len(), 1);
        assert_eq!(state.trans[&trans[0]].them_eid, "00:00:00:00:00:03".parse().unwrap());
    }

    #[test]
    fn test_zero_ttl_opens_nothing() {
        let (_poll, node) = node(StaticDialplan::new());
        let mut state = node.lock();
        let p = params("100", 0, &[]);
        let id = add_request(&mut state, &p);
        build_transactions(&mut state, id, &p, ALL_TIERS);
        assert!(request_transactions(&state, id).is_empty());
        assert!(state.trans.is_empty());
    }

    #[test]
    fn test_ttl_expired_hint_returned() {
        let (_poll, node) = node(StaticDialplan::new());
        let mut set = AnswerSet::new(MAX_RESULTS, HintMetadata::pessimistic(), 60);
        lookup_internal(&node, &mut set, &params("100", 0, &[])).unwrap();
        assert!(set.hint.has(hint::TTL_EXPIRED));
        let state = node.lock();
        assert!(state.requests.is_empty());
        assert!(state.outbox.is_empty());
    }

    #[test]
    fn test_optimize_keeps_root_last() {
        let (_poll, node) = node(StaticDialplan::new());
        let mut state = node.lock();
        let root: Eid = "00:00:00:00:00:09".parse().unwrap();
        let avoid = [root];
        let p = params("100", 3, &avoid);
        let id = add_request(&mut state, &p);
        build_transactions(&mut state, id, &p, ALL_TIERS);
        optimize_transactions(&mut state, id, ALL_TIERS);
        let two: Eid = "00:00:00:00:00:02".parse().unwrap();
        let three: Eid = "00:00:00:00:00:03".parse().unwrap();
        for tid in request_transactions(&state, id) {
            let trans = &state.trans[&tid];
            assert_eq!(trans.eids.last(), Some(&root));
            let other = if trans.them_eid == two { three } else { two };
            assert!(trans.eids.contains(&other));
            assert!(!trans.eids.contains(&trans.them_eid));
        }
    }

    #[test]
    fn test_discover_frame_contents() {
        let (_poll, node) = node(StaticDialplan::new());
        let mut state = node.lock();
        let p = params("100", 3, &[]);
        let id = add_request(&mut state, &p);
        state.requests.get_mut(&id).unwrap().cache_bypass = true;
        build_transactions(&mut state, id, &p, 0);
        let tid = request_transactions(&state, id)[0];
        discover(&mut state, tid);
        let (_, data) = state.outbox.last().unwrap();
        let (hdr, body) = decode_frame(data).unwrap();
        assert_eq!(hdr.command(), Some(Command::DpDiscover));
        assert!(!hdr.is_final());
        let ies = crate::wire::IeSet::parse(body).unwrap();
        assert_eq!(ies.called_number.as_deref(), Some("100"));
        assert_eq!(ies.ttl, Some(3));
        assert!(ies.cache_bypass);
        assert_eq!(ies.eids.first(), Some(&(state.us(), true)));
        assert_eq!(state.trans[&tid].phase, Phase::Discovering);
    }

    #[test]
    fn test_cancel_request_orphans_transactions() {
        let (_poll, node) = node(StaticDialplan::new());
        let mut state = node.lock();
        let p = params("100", 3, &[]);
        let id = add_request(&mut state, &p);
        build_transactions(&mut state, id, &p, ALL_TIERS);
        let tids = request_transactions(&state, id);
        cancel_request(&mut state, id);
        assert!(state.requests[&id].is_complete());
        for tid in tids {
            assert_eq!(state.trans[&tid].parent, None);
            assert!(state.trans[&tid].final_sent);
        }
        assert!(finish_request(&mut state, id).is_some());
        assert!(state.notify);
    }

    #[test]
    fn test_duplicate_on_behalf_of_same_root() {
        let (_poll, node) = node(StaticDialplan::new());
        let root: Eid = "00:00:00:00:00:09".parse().unwrap();
        let avoid = [root];
        {
            let mut state = node.lock();
            let p = params("100", 3, &avoid);
            let id = add_request(&mut state, &p);
            state.requests.get_mut(&id).unwrap().registered = true;
        }
        let mut set = AnswerSet::new(MAX_RESULTS, HintMetadata::pessimistic(), 60);
        let err = lookup_internal(&node, &mut set, &params("100", 3, &avoid)).unwrap_err();
        assert!(matches!(err, DundiError::DuplicatePending));
    }

    #[test]
    fn test_refused_job_answers_out_of_threads() {
        let (_poll, node) = node(StaticDialplan::new());
        let mut state = node.lock();
        let two: Eid = "00:00:00:00:00:02".parse().unwrap();
        let tid = state.create_transaction(&two, Kind::Inbound).unwrap();
        state.trans.get_mut(&tid).unwrap().busy = true;
        let local = state.local_context("e164", state.us());
        let job = Job::Answer(QueryState {
            trans: tid,
            number: "100".into(),
            context: "e164".into(),
            ttl: 2,
            nocache: false,
            eids: vec![two],
            directs: vec![true],
            local,
        });
        refuse_job(&mut state, job);
        let (_, data) = state.outbox.last().unwrap();
        let (hdr, body) = decode_frame(data).unwrap();
        assert_eq!(hdr.command(), Some(Command::DpResponse));
        assert!(hdr.is_final());
        assert_eq!(crate::wire::IeSet::parse(body).unwrap().cause_code(), cause::GENERAL);
        assert!(!state.trans[&tid].busy);
    }

    #[test]
    fn test_precache_without_mapping_fails() {
        let (_poll, node) = node(StaticDialplan::new());
        let err = precache(&node, "100", "nowhere").unwrap_err();
        assert!(matches!(err, DundiError::NoMapping(_)));
    }

    #[test]
    fn test_precache_full_queues_extensions() {
        let dialplan = StaticDialplan::new().with_extensions("local", &["100", "101"]);
        let (_poll, node) = node(dialplan);
        precache_full(&node);
        let queue = node.precache_queue();
        assert_eq!(queue.len(), 2);
        assert!(queue.iter().all(|e| e.context == "e164"));
    }

    #[test]
    fn test_own_entity_answered_locally() {
        let (_poll, node) = node(StaticDialplan::new());
        let us = node.lock().us();
        let info = query_eid(&node, &us, "").unwrap().unwrap();
        assert_eq!(info.ipaddr, "127.0.0.1");
        assert!(node.lock().outbox.is_empty());
    }
}
