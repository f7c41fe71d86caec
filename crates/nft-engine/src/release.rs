//! Deferred release.
//!
//! Commit and abort hand their transaction records, the rule arrays they
//! replaced and the elements GC removed to the [`Reclaimer`]. A worker
//! thread waits for a grace period, so no fast-path reader can still hold
//! a reference it picked up before the change, then releases them.

use crate::chain::RuleArray;
use crate::commit::{release_aborted, release_committed};
use crate::rcu::Rcu;
use crate::set::SetElem;
use crate::trans::Trans;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Work queued for release after a grace period.
pub(crate) enum Deferred {
    Committed(Vec<Trans>),
    Aborted(Vec<Trans>),
    Rules(Vec<RuleArray>),
    Elems(Vec<Arc<SetElem>>),
}

impl Deferred {
    fn release(self) {
        match self {
            Deferred::Committed(list) => release_committed(list),
            Deferred::Aborted(list) => release_aborted(list),
            Deferred::Rules(arrays) => drop(arrays),
            Deferred::Elems(elems) => {
                for elem in elems {
                    elem.destroy();
                }
            }
        }
    }
}

enum Message {
    Work,
    Barrier(Sender<()>),
    Shutdown,
}

pub(crate) struct Reclaimer {
    pending: Arc<Mutex<Vec<Deferred>>>,
    tx: Sender<Message>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Reclaimer {
    pub(crate) fn spawn(rcu: Arc<Rcu>) -> io::Result<Self> {
        let pending = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = channel::unbounded();
        let worker_pending = Arc::clone(&pending);
        let handle = thread::Builder::new()
            .name("nft-reclaim".to_string())
            .spawn(move || run(rx, worker_pending, rcu))?;
        Ok(Self {
            pending,
            tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub(crate) fn defer(&self, work: Deferred) {
        self.pending.lock().push(work);
        if self.tx.send(Message::Work).is_err() {
            tracing::warn!("reclaimer gone, releasing inline");
            let work: Vec<_> = std::mem::take(&mut *self.pending.lock());
            work.into_iter().for_each(Deferred::release);
        }
    }

    /// Blocks until everything deferred so far is released.
    pub(crate) fn barrier(&self) {
        let (done_tx, done_rx) = channel::bounded(1);
        if self.tx.send(Message::Barrier(done_tx)).is_ok() && done_rx.recv().is_err() {
            tracing::warn!("reclaimer exited during barrier");
        }
    }
}

fn drain(pending: &Mutex<Vec<Deferred>>, rcu: &Rcu) -> usize {
    let work: Vec<_> = std::mem::take(&mut *pending.lock());
    if work.is_empty() {
        return 0;
    }
    rcu.synchronize();
    let n = work.len();
    work.into_iter().for_each(Deferred::release);
    n
}

fn run(rx: Receiver<Message>, pending: Arc<Mutex<Vec<Deferred>>>, rcu: Arc<Rcu>) {
    tracing::debug!("reclaimer started");
    for msg in rx.iter() {
        match msg {
            Message::Work => {
                let n = drain(&pending, &rcu);
                if n > 0 {
                    tracing::trace!(released = n, "grace period elapsed");
                }
            }
            Message::Barrier(done) => {
                drain(&pending, &rcu);
                let _ = done.send(());
            }
            Message::Shutdown => break,
        }
    }
    drain(&pending, &rcu);
    tracing::debug!("reclaimer stopped");
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        let _ = self.tx.send(Message::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::error!("reclaimer thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_barrier_waits_for_readers() {
        let rcu = Arc::new(Rcu::new());
        let reclaimer = Reclaimer::spawn(Arc::clone(&rcu)).unwrap();
        let array: RuleArray = Arc::new(Vec::new());
        let weak = Arc::downgrade(&array);

        let released = Arc::new(AtomicBool::new(false));
        let (entered_tx, entered_rx) = channel::bounded(1);
        let reader = {
            let rcu = Arc::clone(&rcu);
            let released = Arc::clone(&released);
            thread::spawn(move || {
                let _guard = rcu.read();
                entered_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
                released.load(Ordering::SeqCst)
            })
        };
        entered_rx.recv().unwrap();

        reclaimer.defer(Deferred::Rules(vec![array]));
        reclaimer.barrier();
        released.store(true, Ordering::SeqCst);
        assert!(!reader.join().unwrap());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_drop_flushes() {
        let rcu = Arc::new(Rcu::new());
        let array: RuleArray = Arc::new(Vec::new());
        let weak = Arc::downgrade(&array);
        {
            let reclaimer = Reclaimer::spawn(rcu).unwrap();
            reclaimer.defer(Deferred::Rules(vec![array]));
        }
        assert!(weak.upgrade().is_none());
    }
}
