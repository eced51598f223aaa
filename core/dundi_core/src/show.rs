//! Operator views of the node state
//!
//! Plain text tables for the console. Every function takes the locked
//! state (or the precache queue) and returns the rendered text; nothing
//! here changes state.

use std::fmt::Write;

use crate::coordinator::LookupOutcome;
use crate::eid::Eid;
use crate::engine::State;
use crate::peer::{model_to_string, order_to_string, Permission, PeerHost, PeerStatus};
use crate::precache::PrecacheQueue;
use crate::request::EntityInfo;
use crate::wire::{flags_to_string, hint_flags_to_string};

fn host_string(host: &PeerHost, addr: Option<std::net::SocketAddr>) -> (String, String, bool) {
    let dynamic = matches!(host, PeerHost::Dynamic);
    match addr {
        Some(addr) => (addr.ip().to_string(), addr.port().to_string(), dynamic),
        None => ("(Unspecified)".to_string(), "0".to_string(), dynamic),
    }
}

pub fn peers(state: &State) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<20} {:<15} {:<5} {:<8} {:<10} {}",
        "EID", "Host", "Port", "Model", "AvgTime", "Status"
    );
    let (mut online, mut offline, mut unmonitored) = (0, 0, 0);
    for peer in state.peers.iter() {
        let status = peer.status();
        match status {
            PeerStatus::Ok(_) => online += 1,
            PeerStatus::Unmonitored => unmonitored += 1,
            _ => offline += 1,
        }
        let (host, port, dynamic) = host_string(&peer.host, peer.addr);
        let avg = if peer.history.is_empty() {
            "Unavail".to_string()
        } else {
            format!("{} ms", peer.history.avgms)
        };
        let _ = writeln!(
            out,
            "{:<20} {:<15} {:<5} {:<8} {:<10} {}",
            peer.eid,
            host,
            format!("{}{}", port, if dynamic { "(D)" } else { "(S)" }),
            model_to_string(peer.model),
            avg,
            status
        );
    }
    let _ = writeln!(
        out,
        "{} dundi peers [{} online, {} offline, {} unmonitored]",
        state.peers.len(),
        online,
        offline,
        unmonitored
    );
    out
}

fn permissions(list: &[Permission]) -> String {
    if list.is_empty() {
        return "(none)".to_string();
    }
    list.iter()
        .map(|p| format!("{}{}", if p.allow { "" } else { "!" }, p.name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Details of one peer, `None` when it is not configured
pub fn peer(state: &State, eid: &Eid) -> Option<String> {
    let peer = state.peers.find(eid)?;
    let (host, port, dynamic) = host_string(&peer.host, peer.addr);
    let mut out = String::new();
    let _ = writeln!(out, "Peer:    {}", peer.eid);
    let _ = writeln!(out, "Model:   {}", model_to_string(peer.model));
    let _ = writeln!(out, "Precache: {}", model_to_string(peer.pcmodel));
    let _ = writeln!(out, "Order:   {}", order_to_string(peer.order));
    let _ = writeln!(out, "Host:    {}", host);
    let _ = writeln!(out, "Port:    {}", port);
    let _ = writeln!(out, "Dynamic: {}", if dynamic { "yes" } else { "no" });
    let _ = writeln!(out, "Reg:     {}", if peer.register_expire_at.is_some() { "Yes" } else { "No" });
    let _ = writeln!(out, "In Key:  {}", peer.inkey.as_deref().unwrap_or("<None>"));
    let _ = writeln!(out, "Out Key: {}", peer.outkey.as_deref().unwrap_or("<None>"));
    let _ = writeln!(out, "Status:  {}", peer.status());
    if let Some(key) = &peer.crypto.us {
        let _ = writeln!(out, "Key CRC: {:08x}", key.crc32);
    }
    let _ = writeln!(out, "Include: {}", permissions(&peer.include));
    let _ = writeln!(out, "Permit:  {}", permissions(&peer.permit));
    if peer.history.is_empty() {
        let _ = writeln!(out, "Last few query times: (none)");
    } else {
        let _ = writeln!(out, "Last few query times:");
        for (lookup, ms) in peer.history.iter() {
            let _ = writeln!(out, "  {:>6} ms  {}", ms, lookup);
        }
        let _ = writeln!(out, "Average query time: {} ms", peer.history.avgms);
    }
    Some(out)
}

pub fn trans(state: &State) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<22} {:<5} {:<5} {:<4} {:<4} {:<4} {}",
        "Remote", "Src", "Dst", "Tx", "Rx", "Ack", "Phase"
    );
    let mut all: Vec<_> = state.trans.values().collect();
    all.sort_by_key(|t| t.id);
    for t in all {
        let _ = writeln!(
            out,
            "{:<22} {:05} {:05} {:04} {:04} {:04} {}",
            t.addr.to_string(),
            t.strans,
            t.dtrans,
            t.oseqno,
            t.iseqno,
            t.aseqno,
            t.phase.as_str()
        );
    }
    out
}

pub fn requests(state: &State) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<15} {:<15} {:<20} {:<7} {}", "Number", "Context", "Root", "Max", "Rsp");
    let mut all: Vec<_> = state.requests.values().collect();
    all.sort_by_key(|r| r.id);
    for req in all {
        let number = match req.query_eid {
            Some(eid) => eid.to_string(),
            None => req.number.clone(),
        };
        let root = if req.root.is_zero() {
            "<unspecified>".to_string()
        } else {
            req.root.to_string()
        };
        let _ = writeln!(
            out,
            "{:<15} {:<15} {:<20} {:<7} {}",
            number,
            req.context,
            root,
            req.answers.max,
            req.answers.results.len()
        );
    }
    out
}

pub fn mappings(state: &State) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<12} {:<6} {:<12} {:<6} {:<40} {}",
        "DUNDi Cntxt", "Weight", "Local Cntxt", "Tech", "Dest", "Options"
    );
    for map in &state.mappings {
        let _ = writeln!(
            out,
            "{:<12} {:<6} {:<12} {:<6} {:<40} {}",
            map.dcontext,
            map.weight,
            if map.lcontext.is_empty() { "<none>" } else { &map.lcontext },
            map.tech.to_string(),
            map.dest,
            map.options_string()
        );
    }
    out
}

pub fn precache(queue: &PrecacheQueue, now: u64) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<12} {:<12} {}", "Number", "Context", "Expiration");
    for entry in queue.iter() {
        let when = if entry.expiration == 0 {
            "(processing)".to_string()
        } else {
            let left = entry.expiration.saturating_sub(now);
            format!("{:02}:{:02}:{:02}", left / 3600, (left % 3600) / 60, left % 60)
        };
        let _ = writeln!(out, "{:<12} {:<12} {}", entry.number, entry.context, when);
    }
    out
}

pub fn entityid(state: &State) -> String {
    format!("Global EID for this system is '{}'\n", state.us())
}

/// Render the answers of a lookup the way the console prints them
pub fn lookup_outcome(number: &str, context: &str, outcome: &LookupOutcome, elapsed_ms: u128) -> String {
    let mut out = String::new();
    for (n, r) in outcome.results.iter().enumerate() {
        let _ = writeln!(
            out,
            "{:3}. {:5} {}/{} ({})",
            n + 1,
            r.weight,
            r.tech,
            r.dest,
            flags_to_string(r.flags)
        );
        let _ = writeln!(out, "     from {}, expires in {} s", r.eid, r.expiration);
    }
    if !outcome.hint.exten.is_empty() || outcome.hint.flags != 0 {
        let _ = writeln!(
            out,
            "Hint: {} '{}'",
            hint_flags_to_string(outcome.hint.flags),
            outcome.hint.exten
        );
    }
    let _ = writeln!(
        out,
        "DUNDi lookup of '{}@{}' completed in {} ms ({} results)",
        number,
        context,
        elapsed_ms,
        outcome.results.len()
    );
    out
}

pub fn entity(eid: &Eid, info: Option<&EntityInfo>) -> String {
    let Some(info) = info else {
        return format!("Entity '{}' not found\n", eid);
    };
    let mut out = String::new();
    let _ = writeln!(out, "DUNDi Query EID succeeded:");
    let _ = writeln!(out, "Department:      {}", info.department);
    let _ = writeln!(out, "Organization:    {}", info.organization);
    let _ = writeln!(out, "City/Locality:   {}", info.locality);
    let _ = writeln!(out, "State/Province:  {}", info.stateprov);
    let _ = writeln!(out, "Country:         {}", info.country);
    let _ = writeln!(out, "E-mail:          {}", info.email);
    let _ = writeln!(out, "Phone:           {}", info.phone);
    let _ = writeln!(out, "IP Address:      {}", info.ipaddr);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Settings};
    use crate::metrics::Metrics;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn state() -> State {
        let config = Config::from_json(
            r#"{"general": {"entityid": "00:00:00:00:00:01", "bindaddr": "127.0.0.1", "port": 0},
                "peers": [
                    {"eid": "00:00:00:00:00:02", "host": "127.0.0.1", "port": 4521, "model": "symmetric",
                     "include": ["all"], "permit": ["e164"], "qualify": false},
                    {"eid": "00:00:00:00:00:03", "host": "dynamic", "model": "inbound", "permit": ["e164"]}
                ],
                "mappings": [{"dcontext": "e164", "lcontext": "local", "weight": 5, "tech": "SIP",
                              "dest": "${NUMBER}@host", "options": ["nopartial"]}]}"#,
        )
        .unwrap();
        let settings = Settings::from_config(&config.general).unwrap();
        let mut state = State::new(settings, Arc::new(MemoryStore::new()), Arc::new(Metrics::new())).unwrap();
        state.apply_config(&config);
        state
    }

    #[test]
    fn test_peers_table() {
        let s = state();
        let text = peers(&s);
        assert!(text.contains("00:00:00:00:00:02"));
        assert!(text.contains("4521(S)"));
        assert!(text.contains("(Unspecified)"));
        assert!(text.contains("2 dundi peers"));
    }

    #[test]
    fn test_peer_detail() {
        let s = state();
        let eid: Eid = "00:00:00:00:00:03".parse().unwrap();
        let text = peer(&s, &eid).unwrap();
        assert!(text.contains("Dynamic: yes"));
        assert!(text.contains("Permit:  e164"));
        assert!(peer(&s, &"00:00:00:00:00:09".parse().unwrap()).is_none());
    }

    #[test]
    fn test_mappings_table() {
        let text = mappings(&state());
        assert!(text.contains("${NUMBER}@host"));
        assert!(text.contains("NOPARTIAL"));
    }

    #[test]
    fn test_precache_table() {
        let mut q = PrecacheQueue::new();
        q.reschedule("100", "e164", 3661, 1000);
        let text = precache(&q, 1000);
        assert!(text.contains("01:01:01"));
    }

    #[test]
    fn test_entityid() {
        assert_eq!(entityid(&state()), "Global EID for this system is '00:00:00:00:00:01'\n");
    }
}
