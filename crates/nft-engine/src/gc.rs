//! Asynchronous garbage collection of expired set elements.
//!
//! Collection runs in two halves. [`Net::gc_collect`] scans a set without
//! the commit mutex and claims what expired, stamping each batch with the
//! GC sequence. [`Net::gc_apply`] takes the commit mutex and removes the
//! batch, unless a commit ran in between (the sequence moved or is odd,
//! which means a commit is publishing right now) or the set died. A
//! discarded batch gives its claims back; a later scan picks the elements
//! up again.
//!
//! The optional [`GcWorker`] thread does both on a timer for every set
//! with timeouts, and applies batches queued through [`Net::gc_queue`].

use crate::config::EngineConfig;
use crate::net::Net;
use crate::notify::{Event, EventKind};
use crate::release::Deferred;
use crate::set::{Set, SetElem, SetFlags};
use crate::table::Table;
use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use nft_common::{Family, Result};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Expired elements of one set, claimed by a scan.
pub struct GcBatch {
    table: Arc<Table>,
    set: Arc<Set>,
    seq: u32,
    elems: Vec<Arc<SetElem>>,
}

impl GcBatch {
    pub fn family(&self) -> Family {
        self.table.family()
    }

    pub fn table(&self) -> &str {
        self.table.name()
    }

    pub fn set(&self) -> &str {
        self.set.name()
    }

    /// GC sequence the scan ran under.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    fn release(self) {
        for elem in &self.elems {
            elem.release_gc();
        }
    }
}

impl std::fmt::Debug for GcBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcBatch")
            .field("table", &self.table.name())
            .field("set", &self.set.name())
            .field("seq", &self.seq)
            .field("elems", &self.elems.len())
            .finish()
    }
}

/// What became of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcOutcome {
    /// This many elements were removed
    Applied(usize),
    /// A commit raced the scan or the set is gone; nothing was removed
    Discarded,
}

impl Net {
    /// Claims the expired elements of a set in batches of at most
    /// `gc_batch_size`.
    pub fn gc_collect(&self, family: Family, table: &str, set: &str) -> Result<Vec<GcBatch>> {
        let cur = self.genmask_cur();
        let table = self.find_table(family, table, cur)?;
        let set = table.set_lookup(set, cur)?;
        Ok(self.collect_set(&table, &set))
    }

    fn collect_set(&self, table: &Arc<Table>, set: &Arc<Set>) -> Vec<GcBatch> {
        let seq = self.gc_seq.load(Ordering::Acquire);
        let expired = set.backend().gc_scan(self.genmask_cur(), Instant::now());
        if expired.is_empty() {
            return Vec::new();
        }
        tracing::debug!(table = table.name(), set = set.name(), expired = expired.len(), seq, "gc scan");
        expired
            .chunks(self.config.gc_batch_size.max(1))
            .map(|chunk| GcBatch {
                table: Arc::clone(table),
                set: Arc::clone(set),
                seq,
                elems: chunk.to_vec(),
            })
            .collect()
    }

    /// Removes a collected batch under the commit mutex.
    ///
    /// Blocks while a batch is open; must not be called from the thread
    /// holding one.
    pub fn gc_apply(&self, batch: GcBatch) -> GcOutcome {
        let _state = self.state.lock();
        let seq = self.gc_seq.load(Ordering::Acquire);
        if seq != batch.seq || seq & 1 == 1 || batch.set.is_dead() {
            tracing::debug!(set = batch.set(), batch_seq = batch.seq, seq, "gc batch raced a commit, discarded");
            batch.release();
            return GcOutcome::Discarded;
        }

        let cur = self.genmask_cur();
        let GcBatch { table, set, elems, .. } = batch;
        let mut removed = Vec::with_capacity(elems.len());
        for elem in elems {
            // removed by an earlier batch or staged away
            if !elem.is_active(cur) || !elem.genmask.deactivate_all() {
                continue;
            }
            set.backend().remove(&elem);
            if !elem.is_interval_end() {
                set.uncount_elem();
            }
            self.emit(
                Event::new(EventKind::DelSetElem, table.family(), table.name())
                    .name(set.name())
                    .snapshot(serde_json::to_value(elem.info()).unwrap_or_default()),
            );
            removed.push(elem);
        }

        let n = removed.len();
        if n > 0 {
            self.reclaimer.defer(Deferred::Elems(removed));
            tracing::debug!(table = table.name(), set = set.name(), removed = n, "expired elements removed");
        }
        GcOutcome::Applied(n)
    }

    /// Hands a batch to the GC worker; the outcome arrives on the returned
    /// channel. Without a worker the batch is applied on the caller's
    /// thread.
    pub fn gc_queue(&self, batch: GcBatch) -> Receiver<GcOutcome> {
        let (reply_tx, reply_rx) = channel::bounded(1);
        match &self.gc {
            Some(worker) => {
                if let Err(channel::SendError(GcMessage::Apply(batch, reply))) =
                    worker.tx.send(GcMessage::Apply(batch, reply_tx))
                {
                    let _ = reply.send(self.gc_apply(batch));
                }
            }
            None => {
                let _ = reply_tx.send(self.gc_apply(batch));
            }
        }
        reply_rx
    }

    /// Scans every live timeout set whose period elapsed and applies what
    /// expired.
    pub(crate) fn gc_scan_all(&self) -> usize {
        let now = Instant::now();
        let cur = self.genmask_cur();
        let interval = self.config.gc_interval();
        let mut removed = 0;
        for table in self.tables() {
            let sets = table.sets();
            let due = sets.iter().filter(|s| {
                s.is_active(cur) && !s.is_dead() && s.flags().contains(SetFlags::TIMEOUT) && s.gc_due(now, interval)
            });
            for set in due {
                for batch in self.collect_set(&table, set) {
                    if let GcOutcome::Applied(n) = self.gc_apply(batch) {
                        removed += n;
                    }
                }
            }
        }
        removed
    }
}

pub(crate) enum GcMessage {
    Apply(GcBatch, Sender<GcOutcome>),
    Shutdown,
}

pub(crate) struct GcWorker {
    tx: Sender<GcMessage>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl GcWorker {
    /// Starts the worker. The periodic scan runs only with `gc_worker`
    /// set; queued batches are served either way.
    pub(crate) fn spawn(net: Weak<Net>, config: &EngineConfig) -> io::Result<Self> {
        let (tx, rx) = channel::unbounded();
        let ticker = if config.gc_worker {
            channel::tick(config.gc_interval())
        } else {
            channel::never()
        };
        let handle = thread::Builder::new()
            .name("nft-gc".to_string())
            .spawn(move || run(net, rx, ticker))?;
        Ok(Self {
            tx,
            handle: Mutex::new(Some(handle)),
        })
    }
}

fn run(net: Weak<Net>, rx: Receiver<GcMessage>, ticker: Receiver<Instant>) {
    tracing::debug!("gc worker started");
    loop {
        select! {
            recv(rx) -> msg => match msg {
                Ok(GcMessage::Apply(batch, reply)) => {
                    let outcome = match net.upgrade() {
                        Some(net) => net.gc_apply(batch),
                        None => {
                            batch.release();
                            GcOutcome::Discarded
                        }
                    };
                    let _ = reply.send(outcome);
                }
                Ok(GcMessage::Shutdown) | Err(_) => break,
            },
            recv(ticker) -> _ => {
                if let Some(net) = net.upgrade() {
                    let removed = net.gc_scan_all();
                    if removed > 0 {
                        tracing::info!(removed, "periodic gc");
                    }
                }
            }
        }
    }
    tracing::debug!("gc worker stopped");
}

impl Drop for GcWorker {
    fn drop(&mut self) {
        let _ = self.tx.send(GcMessage::Shutdown);
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        // the last reference may be dropped by the worker itself
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            tracing::error!("gc worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::set::{ElemSpec, SetSpec};
    use crate::table::TableFlags;
    use crate::NetBuilder;
    use std::time::Duration;

    #[test]
    fn test_element_removed_once_across_batches() {
        let net = NetBuilder::new(Arc::new(Registry::with_builtins())).build().unwrap();
        let mut batch = net.begin_transaction(0).unwrap();
        batch.new_table(Family::Inet, "t", TableFlags::empty(), false).unwrap();
        let spec = SetSpec::new("s", 1).flags(SetFlags::TIMEOUT).timeout(Duration::from_millis(10));
        batch.new_set(Family::Inet, "t", &spec, false).unwrap();
        batch.new_setelems(Family::Inet, "t", "s", &[ElemSpec::key([7])], false).unwrap();
        batch.commit().unwrap();
        thread::sleep(Duration::from_millis(50));

        let mut batches = net.gc_collect(Family::Inet, "t", "s").unwrap();
        let first = batches.remove(0);
        let copy = GcBatch {
            table: Arc::clone(&first.table),
            set: Arc::clone(&first.set),
            seq: first.seq,
            elems: first.elems.clone(),
        };
        let set = Arc::clone(&first.set);

        assert_eq!(net.gc_apply(first), GcOutcome::Applied(1));
        assert_eq!(net.gc_apply(copy), GcOutcome::Applied(0));
        assert_eq!(set.nelems(), 0);
        assert_eq!(set.backend().len(), 0);
    }
}
