//! Bounded worker pool for inbound queries
//!
//! Answering a query may consult the dialplan and forward the query to
//! other peers, which can take seconds. That work runs here so the reactor
//! never blocks. The queue is bounded; a full queue is reported back to the
//! submitter instead of spawning more threads.

use std::io;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

pub struct WorkerPool<J: Send + 'static> {
    tx: Option<SyncSender<J>>,
    handles: Vec<JoinHandle<()>>,
}

impl<J: Send + 'static> WorkerPool<J> {
    /// Start `size` workers sharing a queue of `queue` pending jobs
    pub fn new<F>(size: usize, queue: usize, handler: F) -> io::Result<Self>
    where
        F: Fn(J) + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::sync_channel::<J>(queue);
        let rx: Arc<Mutex<Receiver<J>>> = Arc::new(Mutex::new(rx));
        let handler = Arc::new(handler);
        let mut handles = Vec::with_capacity(size);
        for n in 0..size {
            let rx = Arc::clone(&rx);
            let handler = Arc::clone(&handler);
            let handle = std::thread::Builder::new()
                .name(format!("dundi-worker-{}", n))
                .spawn(move || loop {
                    let job = {
                        let guard = rx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                        guard.recv()
                    };
                    match job {
                        Ok(job) => handler(job),
                        Err(_) => break,
                    }
                })?;
            handles.push(handle);
        }
        log::debug!("Started {} workers (queue {})", size, queue);
        Ok(Self { tx: Some(tx), handles })
    }

    /// Queue a job. A full or closed queue hands the job back.
    pub fn submit(&self, job: J) -> Result<(), J> {
        let Some(tx) = &self.tx else {
            return Err(job);
        };
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => Err(job),
        }
    }

    /// Stop accepting jobs and wait for the workers to drain the queue
    pub fn shutdown(&mut self) {
        self.tx = None;
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::warn!("Worker thread panicked");
            }
        }
    }
}

impl<J: Send + 'static> Drop for WorkerPool<J> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn test_jobs_run() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let mut pool = WorkerPool::new(2, 16, move |n: usize| {
            seen.fetch_add(n, Ordering::SeqCst);
        })
        .unwrap();
        for n in 1..=4 {
            pool.submit(n).unwrap();
        }
        pool.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_full_queue_returns_job() {
        let (release_tx, release_rx) = channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let (started_tx, started_rx) = channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let mut pool = WorkerPool::new(1, 1, move |_: u32| {
            let _ = started_tx.lock().unwrap().send(());
            let _ = release_rx.lock().unwrap().recv();
        })
        .unwrap();

        pool.submit(1).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // Worker busy, one slot in the queue
        pool.submit(2).unwrap();
        assert_eq!(pool.submit(3), Err(3));

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        pool.shutdown();
        assert_eq!(pool.submit(4), Err(4));
    }
}
