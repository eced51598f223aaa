//! DUNDi protocol engine
//!
//! A DUNDi node answers "who can route this number?" for its peers and asks
//! them the same. This crate carries the whole node: the wire codec and
//! payload crypto, peers and mappings, the transaction engine driven by a
//! mio reactor, the answer cache, and the lookup, entity query and precache
//! flows built on top.
//!
//! [`Dundi`] is the handle applications hold. It owns the reactor thread,
//! the worker pool and the precache thread:
//!
//! ```no_run
//! use std::sync::Arc;
//! use dundi_core::{Config, Dundi, MemoryStore, StaticDialplan};
//!
//! let config = Config::from_file("dundi.json")?;
//! let dialplan = StaticDialplan::new().with_extensions("local", &["100"]);
//! let node = Dundi::start(&config, Arc::new(MemoryStore::new()), Arc::new(dialplan))?;
//! let outcome = node.lookup("100", "e164", false)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod eid;
pub mod engine;
pub mod error;
mod handlers;
pub mod mapping;
pub mod metrics;
pub mod peer;
pub mod precache;
pub mod reactor;
pub mod request;
pub mod secret;
pub mod show;
pub mod store;
pub mod transaction;
pub mod wire;
pub mod worker;

pub use config::{Config, Settings};
pub use coordinator::LookupOutcome;
pub use eid::Eid;
pub use engine::{now_epoch, Node, State, DEFAULT_CONTEXT};
pub use error::{DundiError, Result};
pub use mapping::{Dialplan, StaticDialplan, Tech};
pub use metrics::Metrics;
pub use request::{DundiResult, EntityInfo, HintMetadata};
pub use store::{JsonFileStore, KvStore, MemoryStore};

use reactor::Reactor;
use worker::WorkerPool;

// ============================================================================
// Node handle
// ============================================================================

/// A running DUNDi node
pub struct Dundi {
    node: Arc<Node>,
    local_addr: SocketAddr,
    reactor: Option<JoinHandle<()>>,
    precache: Option<JoinHandle<()>>,
}

impl Dundi {
    /// Bind the socket, apply `config` and start the node's threads
    pub fn start(config: &Config, store: Arc<dyn KvStore>, dialplan: Arc<dyn Dialplan>) -> Result<Self> {
        let settings = Settings::from_config(&config.general)?;
        let (poll, socket, waker) = reactor::bind(settings.bind)?;
        let local_addr = socket.local_addr()?;
        let (workers, queue) = (settings.workers.max(1), settings.worker_queue.max(1));

        let mut state = State::new(settings, store, Arc::new(Metrics::new()))?;
        state.apply_config(config);
        let us = state.us();
        let node = Arc::new(Node::new(state, waker, dialplan));

        let worker_node = Arc::clone(&node);
        let pool = WorkerPool::new(workers, queue, move |job| coordinator::run_job(&worker_node, job))?;
        let mut reactor = Reactor::new(poll, socket, Arc::clone(&node), pool);
        let reactor_node = Arc::clone(&node);
        let reactor = thread::Builder::new()
            .name("dundi-reactor".into())
            .spawn(move || {
                if let Err(e) = reactor.run() {
                    log::error!("Reactor failed: {}", e);
                    reactor_node.begin_shutdown();
                }
            })?;

        coordinator::precache_full(&node);
        let precache_node = Arc::clone(&node);
        let precache = thread::Builder::new()
            .name("dundi-precache".into())
            .spawn(move || coordinator::run_precache_queue(&precache_node))?;

        log::info!("DUNDi node '{}' running on {}", us, local_addr);
        Ok(Self {
            node,
            local_addr,
            reactor: Some(reactor),
            precache: Some(precache),
        })
    }

    /// Address the socket is bound to, with the real port when 0 was configured
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn entity_id(&self) -> Eid {
        self.node.lock().us()
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Look up `number@context`, best answers first
    pub fn lookup(&self, number: &str, context: &str, cache_bypass: bool) -> Result<LookupOutcome> {
        coordinator::lookup(&self.node, number, context, cache_bypass)
    }

    /// Push our answers for `number@context` to upstream peers
    pub fn precache(&self, number: &str, context: &str) -> Result<()> {
        coordinator::precache(&self.node, number, context)
    }

    /// Entity information about `eid`, `None` when no peer knew it
    pub fn query_eid(&self, eid: &Eid, context: &str) -> Result<Option<EntityInfo>> {
        coordinator::query_eid(&self.node, eid, context)
    }

    /// Apply a new configuration and queue a full precache
    pub fn reload(&self, config: &Config) -> Result<()> {
        Settings::from_config(&config.general)?;
        {
            let mut state = self.node.lock();
            state.apply_config(config);
            self.node.settle(state);
        }
        coordinator::precache_full(&self.node);
        log::info!("DUNDi configuration reloaded");
        Ok(())
    }

    /// Clear the answer cache, or with `stats` the per-peer lookup history
    pub fn flush(&self, stats: bool) -> Result<usize> {
        self.node.lock().flush(stats)
    }

    /// Toggle per-frame packet dumps
    pub fn set_debug(&self, on: bool) {
        self.node.lock().debug = on;
    }

    pub fn show_peers(&self) -> String {
        show::peers(&self.node.lock())
    }

    pub fn show_peer(&self, eid: &Eid) -> Option<String> {
        show::peer(&self.node.lock(), eid)
    }

    pub fn show_trans(&self) -> String {
        show::trans(&self.node.lock())
    }

    pub fn show_requests(&self) -> String {
        show::requests(&self.node.lock())
    }

    pub fn show_mappings(&self) -> String {
        show::mappings(&self.node.lock())
    }

    pub fn show_precache(&self) -> String {
        show::precache(&self.node.precache_queue(), now_epoch())
    }

    pub fn show_entityid(&self) -> String {
        show::entityid(&self.node.lock())
    }

    /// Counters in Prometheus text format
    pub fn metrics(&self) -> String {
        self.node.metrics.render()
    }

    /// Stop every thread. Lookups in flight return what they have.
    pub fn shutdown(&mut self) {
        if self.reactor.is_none() && self.precache.is_none() {
            return;
        }
        log::info!("DUNDi node shutting down");
        self.node.begin_shutdown();
        for handle in [self.reactor.take(), self.precache.take()].into_iter().flatten() {
            if handle.join().is_err() {
                log::warn!("DUNDi thread panicked");
            }
        }
    }
}

impl Drop for Dundi {
    fn drop(&mut self) {
        self.shutdown();
    }
}
