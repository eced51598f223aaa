//! UDP reactor
//!
//! One thread owns the socket. Each turn it reads every pending datagram
//! into the engine, fires due timers, hands queued queries to the worker
//! pool and flushes the datagrams the engine produced. Other threads wake
//! it through the mio waker whenever they queue work.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::coordinator::{refuse_job, Job};
use crate::engine::Node;
use crate::worker::WorkerPool;

// ============================================================================
// Constants
// ============================================================================

/// mio token for the UDP socket
pub const SOCKET_TOKEN: Token = Token(0);

/// mio token for cross-thread wakeups
pub const WAKER_TOKEN: Token = Token(1);

/// Longest the reactor sleeps without checking for shutdown
const MAX_POLL_WAIT: Duration = Duration::from_secs(1);

const RECV_BUF_SIZE: usize = 65535;

/// Bind the node's socket and create the poll instance and its waker
pub fn bind(addr: SocketAddr) -> io::Result<(Poll, UdpSocket, Waker)> {
    let poll = Poll::new()?;
    let mut socket = UdpSocket::bind(addr)?;
    poll.registry()
        .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;
    let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
    log::info!("DUNDi listening on {}", socket.local_addr()?);
    Ok((poll, socket, waker))
}

// ============================================================================
// Reactor
// ============================================================================

pub struct Reactor {
    poll: Poll,
    socket: UdpSocket,
    node: Arc<Node>,
    workers: WorkerPool<Job>,
    recv_buf: Vec<u8>,
}

impl Reactor {
    pub fn new(poll: Poll, socket: UdpSocket, node: Arc<Node>, workers: WorkerPool<Job>) -> Self {
        Self {
            poll,
            socket,
            node,
            workers,
            recv_buf: vec![0u8; RECV_BUF_SIZE],
        }
    }

    /// Run until the node shuts down
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);

        loop {
            let timeout = self
                .node
                .lock()
                .next_deadline()
                .map(|at| at.saturating_duration_since(Instant::now()).min(MAX_POLL_WAIT))
                .unwrap_or(MAX_POLL_WAIT);

            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            // The waker token needs no handling of its own: the queues are
            // drained below on every turn
            for event in events.iter() {
                if event.token() == SOCKET_TOKEN {
                    self.process_socket();
                }
            }

            self.process_timeouts();
            self.dispatch_jobs();
            self.send_pending();

            if self.node.is_shutting_down() {
                break;
            }
        }

        log::debug!("Reactor stopping, waiting for workers");
        self.workers.shutdown();
        Ok(())
    }

    fn process_socket(&mut self) {
        loop {
            let (len, from) = match self.socket.recv_from(&mut self.recv_buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    // ICMP errors from an earlier send surface here
                    log::debug!("Receive error: {}", e);
                    continue;
                }
            };
            self.node.lock().handle_frame(from, &self.recv_buf[..len]);
        }
    }

    fn process_timeouts(&mut self) {
        self.node.lock().run_timers(Instant::now());
    }

    fn dispatch_jobs(&mut self) {
        let jobs = std::mem::take(&mut self.node.lock().jobs);
        if jobs.is_empty() {
            return;
        }
        let refused: Vec<Job> = jobs
            .into_iter()
            .filter_map(|job| self.workers.submit(job).err())
            .collect();
        if refused.is_empty() {
            return;
        }
        let mut state = self.node.lock();
        for job in refused {
            refuse_job(&mut state, job);
        }
    }

    fn send_pending(&mut self) {
        let (outbox, notify) = {
            let mut state = self.node.lock();
            (std::mem::take(&mut state.outbox), std::mem::take(&mut state.notify))
        };
        if notify {
            self.node.notify_all();
        }
        for (addr, data) in outbox {
            log::trace!("Sending {} bytes to {}", data.len(), addr);
            if let Err(e) = self.socket.send_to(&data, addr) {
                log::debug!("Send to {} failed: {}", addr, e);
            }
        }
    }
}
