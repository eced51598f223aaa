//! Nodes talking to each other over loopback

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dundi_core::wire::hint;
use dundi_core::{Config, Dundi, Eid, MemoryStore, StaticDialplan, Tech};

const ALPHA: &str = "00:00:00:00:00:0a";
const BRAVO: &str = "00:00:00:00:00:0b";

fn start(json: &str, dialplan: StaticDialplan) -> Dundi {
    let config = Config::from_json(json).unwrap();
    Dundi::start(&config, Arc::new(MemoryStore::new()), Arc::new(dialplan)).unwrap()
}

/// Answers 100 from its `local` context
fn bravo(extra_general: &str, peer_a: &str) -> Dundi {
    let json = format!(
        r#"{{"general": {{"entityid": "{}", "bindaddr": "127.0.0.1", "port": 0, "ttl": 4,
                        "organization": "Bravo Inc"{}}},
             "peers": [{}],
             "mappings": [{{"dcontext": "e164", "lcontext": "local", "weight": 10, "tech": "SIP",
                           "dest": "${{NUMBER}}@bravo"}}]}}"#,
        BRAVO, extra_general, peer_a
    );
    start(&json, StaticDialplan::new().with_extensions("local", &["100"]))
}

fn alpha(ttl: u16, extra_general: &str, peers: &str) -> Dundi {
    let json = format!(
        r#"{{"general": {{"entityid": "{}", "bindaddr": "127.0.0.1", "port": 0, "ttl": {}{}}},
             "peers": [{}]}}"#,
        ALPHA, ttl, extra_general, peers
    );
    start(&json, StaticDialplan::new())
}

fn inbound_alpha() -> String {
    format!(r#"{{"eid": "{}", "host": "dynamic", "model": "inbound", "permit": ["all"]}}"#, ALPHA)
}

fn outbound_bravo(port: u16) -> String {
    format!(
        r#"{{"eid": "{}", "host": "127.0.0.1", "port": {}, "model": "outbound", "include": ["all"]}}"#,
        BRAVO, port
    )
}

fn discovers(node: &Dundi) -> u64 {
    node.node().metrics.discovers_sent_total.load(Ordering::Relaxed)
}

#[test]
fn test_lookup_through_peer() {
    let b = bravo("", &inbound_alpha());
    let a = alpha(4, "", &outbound_bravo(b.local_addr().port()));

    let outcome = a.lookup("100", "e164", false).unwrap();
    assert_eq!(outcome.results.len(), 1);
    let answer = &outcome.results[0];
    assert_eq!(answer.dest, "100@bravo");
    assert_eq!(answer.tech, Tech::Sip);
    assert_eq!(answer.weight, 10);
    assert_eq!(answer.eid, BRAVO.parse::<Eid>().unwrap());
    assert_eq!(discovers(&a), 1);
}

#[test]
fn test_second_lookup_served_from_cache() {
    let b = bravo("", &inbound_alpha());
    let a = alpha(4, "", &outbound_bravo(b.local_addr().port()));

    assert_eq!(a.lookup("100", "e164", false).unwrap().results.len(), 1);
    let again = a.lookup("100", "e164", false).unwrap();
    assert_eq!(again.results.len(), 1);
    assert_eq!(again.results[0].dest, "100@bravo");
    assert_eq!(discovers(&a), 1);
    assert!(a.node().metrics.cache_hits_total.load(Ordering::Relaxed) >= 1);

    // Bypass goes back to the network
    assert_eq!(a.lookup("100", "e164", true).unwrap().results.len(), 1);
    assert_eq!(discovers(&a), 2);
}

#[test]
fn test_zero_ttl_sends_nothing() {
    let b = bravo("", &inbound_alpha());
    let a = alpha(0, "", &outbound_bravo(b.local_addr().port()));

    let outcome = a.lookup("100", "e164", false).unwrap();
    assert!(outcome.results.is_empty());
    assert!(outcome.hint.has(hint::TTL_EXPIRED));
    assert_eq!(discovers(&a), 0);
}

#[test]
fn test_concurrent_duplicates_share_one_discover() {
    let b = bravo("", &inbound_alpha());
    let a = alpha(4, "", &outbound_bravo(b.local_addr().port()));

    let counts: Vec<usize> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| s.spawn(|| a.lookup("100", "e164", false).unwrap().results.len()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(counts, vec![1, 1]);
    assert_eq!(discovers(&a), 1);
}

#[test]
fn test_unreachable_peer_times_out() {
    let closed = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = closed.local_addr().unwrap().port();
    drop(closed);

    let a = alpha(1, "", &outbound_bravo(port));
    let started = Instant::now();
    let outcome = a.lookup("100", "e164", false).unwrap();
    assert!(outcome.results.is_empty());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_entity_query() {
    let b = bravo("", &inbound_alpha());
    let a = alpha(4, "", &outbound_bravo(b.local_addr().port()));

    let info = a.query_eid(&BRAVO.parse().unwrap(), "e164").unwrap().unwrap();
    assert_eq!(info.organization, "Bravo Inc");
    assert_eq!(info.ipaddr, "127.0.0.1");

    let nobody: Eid = "00:00:00:00:00:99".parse().unwrap();
    assert!(a.query_eid(&nobody, "e164").unwrap().is_none());
}

#[test]
fn test_reload_adds_peer() {
    let b = bravo("", &inbound_alpha());
    let a = alpha(4, "", "");
    assert!(a.lookup("100", "e164", false).unwrap().results.is_empty());

    let json = format!(
        r#"{{"general": {{"entityid": "{}", "bindaddr": "127.0.0.1", "port": 0, "ttl": 4}},
             "peers": [{}]}}"#,
        ALPHA,
        outbound_bravo(b.local_addr().port())
    );
    a.reload(&Config::from_json(&json).unwrap()).unwrap();
    assert!(a.show_peers().contains(BRAVO));
    assert_eq!(a.lookup("100", "e164", false).unwrap().results.len(), 1);
}

#[test]
fn test_precache_pushes_upstream() {
    let a_json = format!(
        r#"{{"general": {{"entityid": "{}", "bindaddr": "127.0.0.1", "port": 0, "ttl": 4}},
             "peers": [{{"eid": "{}", "host": "dynamic", "model": "outbound", "precache": "inbound",
                         "include": ["all"]}}],
             "mappings": [{{"dcontext": "e164", "lcontext": "empty", "weight": 0, "tech": "SIP", "dest": "x"}}]}}"#,
        ALPHA, BRAVO
    );
    let a = start(&a_json, StaticDialplan::new());
    let peer_a = format!(
        r#"{{"eid": "{}", "host": "127.0.0.1", "port": {}, "precache": "outbound", "permit": ["all"]}}"#,
        ALPHA,
        a.local_addr().port()
    );
    let b = bravo("", &peer_a);

    b.precache("100", "e164").unwrap();
    let outcome = a.lookup("100", "e164", false).unwrap();
    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.results[0].dest, "100@bravo");
    assert_eq!(discovers(&a), 0);
}

fn write_keys(dir: &Path, name: &str) {
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
    let mut rng = rand::thread_rng();
    let private = rsa::RsaPrivateKey::new(&mut rng, 1024).unwrap();
    let public = rsa::RsaPublicKey::from(&private);
    std::fs::write(
        dir.join(format!("{}.key", name)),
        private.to_pkcs8_pem(LineEnding::LF).unwrap().as_bytes(),
    )
    .unwrap();
    std::fs::write(
        dir.join(format!("{}.pub", name)),
        public.to_public_key_pem(LineEnding::LF).unwrap(),
    )
    .unwrap();
}

#[test]
fn test_encrypted_lookup() {
    let dir = tempfile::tempdir().unwrap();
    write_keys(dir.path(), "alpha");
    write_keys(dir.path(), "bravo");
    let keydir = format!(r#", "keydir": "{}""#, dir.path().display());

    let peer_a = format!(
        r#"{{"eid": "{}", "host": "dynamic", "model": "inbound", "permit": ["all"],
             "inkey": "alpha", "outkey": "bravo"}}"#,
        ALPHA
    );
    let b = bravo(&keydir, &peer_a);
    let peer_b = format!(
        r#"{{"eid": "{}", "host": "127.0.0.1", "port": {}, "model": "outbound", "include": ["all"],
             "inkey": "bravo", "outkey": "alpha"}}"#,
        BRAVO,
        b.local_addr().port()
    );
    let a = alpha(4, &keydir, &peer_b);

    let outcome = a.lookup("100", "e164", false).unwrap();
    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.results[0].dest, "100@bravo");

    // Second dialog reuses the session key announced by CRC only
    let again = a.lookup("100", "e164", true).unwrap();
    assert_eq!(again.results.len(), 1);
}

#[test]
fn test_encrypted_lookup_recovers_from_key_reject() {
    let dir = tempfile::tempdir().unwrap();
    write_keys(dir.path(), "alpha");
    write_keys(dir.path(), "bravo");
    let keydir = format!(r#", "keydir": "{}""#, dir.path().display());

    let peer_a = format!(
        r#"{{"eid": "{}", "host": "dynamic", "model": "inbound", "permit": ["all"],
             "inkey": "alpha", "outkey": "bravo"}}"#,
        ALPHA
    );
    let b = bravo(&keydir, &peer_a);
    let peer_b = format!(
        r#"{{"eid": "{}", "host": "127.0.0.1", "port": {}, "model": "outbound", "include": ["all"],
             "inkey": "bravo", "outkey": "alpha"}}"#,
        BRAVO,
        b.local_addr().port()
    );
    let a = alpha(4, &keydir, &peer_b);

    assert_eq!(a.lookup("100", "e164", false).unwrap().results.len(), 1);
    assert_eq!(discovers(&a), 1);

    // Bravo forgets alpha's session key, so the next CRC-only announcement
    // is refused and alpha has to resend the full key
    let alpha_eid: Eid = ALPHA.parse().unwrap();
    b.node().lock().peers.find_mut(&alpha_eid).unwrap().crypto.them = None;

    let again = a.lookup("100", "e164", true).unwrap();
    assert_eq!(again.results.len(), 1);
    assert_eq!(again.results[0].dest, "100@bravo");
    assert_eq!(discovers(&a), 3);
    assert!(b.node().lock().peers.find(&alpha_eid).unwrap().crypto.them.is_some());
}

#[test]
fn test_own_entity_and_shutdown() {
    let mut a = alpha(4, r#", "organization": "Alpha Org""#, "");
    let us = a.entity_id();
    assert_eq!(us, ALPHA.parse::<Eid>().unwrap());
    let info = a.query_eid(&us, "").unwrap().unwrap();
    assert_eq!(info.organization, "Alpha Org");
    assert!(a.show_entityid().contains(ALPHA));

    a.shutdown();
    assert!(a.lookup("100", "e164", false).is_err());
}
