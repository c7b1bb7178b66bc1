use crate::deferral::DeferralTable;
use crate::record::{HitRecord, ProbeRecord, module_fingerprint};
use crate::registrar::{FireSink, ProbeHandle, Registrar};
use crossbeam_channel::{Receiver, Sender, select, unbounded};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Notification from the module event source.
///
/// `Arriving` means the named module is now loaded at `base_address` and
/// deferred probes for it can be armed; `Departing` means its addresses are
/// about to become invalid.
#[derive(Debug, Clone)]
pub enum ModuleEvent {
    Arriving { name: String, base_address: u64 },
    Departing { name: String },
}

/// Counts of live records per collection, mainly for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackerStats {
    pub deferred: usize,
    pub pending: usize,
    pub hit: usize,
}

impl TrackerStats {
    pub fn total(&self) -> usize {
        self.deferred + self.pending + self.hit
    }
}

/// State guarded by the deferred-domain mutex: the deferral table plus the
/// set of currently present modules. Keeping the presence map under the same
/// lock serializes `add_probe` against arrive/depart, so a probe can neither
/// miss a module that is arriving nor arm against one that is departing.
struct DeferredDomain {
    table: DeferralTable,
    present: HashMap<u32, u64>,
}

/// State guarded by the pending/hit mutex. Records move directly between
/// the two collections, which is why one lock covers both. Critical sections
/// stay short: container surgery only, never a registrar call.
struct LiveState {
    pending: HashMap<ProbeHandle, ProbeRecord>,
    hit: VecDeque<ProbeRecord>,
    /// Bumped by `clear`; completions from an older generation are dropped
    /// instead of re-inserting a record that `clear` already swept.
    generation: u64,
}

struct TrackerShared {
    registrar: Arc<dyn Registrar>,
    deferred: Mutex<DeferredDomain>,
    live: Mutex<LiveState>,
    hit_ready: Condvar,
    shutdown: AtomicBool,
}

impl TrackerShared {
    /// Completion half of a fire, run on the worker thread: disarm the
    /// probe, move its record from pending to the hit queue, wake a
    /// consumer. Split from the fire callback itself because disarming may
    /// sleep and the callback context may not.
    fn complete_fire(&self, handle: ProbeHandle) {
        let removed = self.live.lock().unwrap().pending.remove(&handle);
        let Some(record) = removed else {
            // Stale delivery: the record was cleared, purged by a module
            // departure, or this is a duplicate fire. Nothing to do.
            debug!(handle = handle.raw(), "ignoring fire for unknown probe");
            return;
        };

        // Disarm before queueing, so the probe cannot deliver again.
        self.registrar.unregister(handle);

        let delivered = {
            let mut live = self.live.lock().unwrap();
            if record.generation == live.generation {
                live.hit.push_back(record);
                true
            } else {
                false
            }
        };
        if delivered {
            self.hit_ready.notify_one();
        } else {
            debug!(
                handle = handle.raw(),
                "dropping completion from a cleared generation"
            );
        }
    }
}

fn completion_loop(
    shared: Arc<TrackerShared>,
    fire_rx: Receiver<ProbeHandle>,
    shutdown_rx: Receiver<()>,
) {
    loop {
        select! {
            recv(fire_rx) -> msg => match msg {
                Ok(handle) => shared.complete_fire(handle),
                Err(_) => break,
            },
            recv(shutdown_rx) -> _ => break,
        }
    }
}

/// Tracks which instrumentation points have been reached at least once.
///
/// Every probe record is owned by exactly one of three collections:
///
/// - the deferral table, while its target module is absent;
/// - the pending set, once armed and awaiting its first (and only) fire;
/// - the hit queue, after firing, until a consumer drains it.
///
/// Producers (control writers, module events, the registrar's fire
/// callbacks) and blocking consumers may run on arbitrary threads. Two locks
/// partition the state: a mutex over the deferred domain, and a mutex with
/// short critical sections over pending/hit jointly. Neither is ever held
/// across a registrar call; fire callbacks never take either one — they only
/// enqueue work for the completion worker.
pub struct CoverageTracker {
    shared: Arc<TrackerShared>,
    fire_tx: Sender<ProbeHandle>,
    shutdown_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl CoverageTracker {
    pub fn new(registrar: Arc<dyn Registrar>) -> Self {
        let (fire_tx, fire_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = unbounded();
        let shared = Arc::new(TrackerShared {
            registrar,
            deferred: Mutex::new(DeferredDomain {
                table: DeferralTable::new(),
                present: HashMap::new(),
            }),
            live: Mutex::new(LiveState {
                pending: HashMap::new(),
                hit: VecDeque::new(),
                generation: 0,
            }),
            hit_ready: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::spawn(move || completion_loop(worker_shared, fire_rx, shutdown_rx));
        Self {
            shared,
            fire_tx,
            shutdown_tx: Some(shutdown_tx),
            worker: Some(worker),
        }
    }

    /// The fire-delivery edge to hand to the registrar implementation.
    pub fn fire_sink(&self) -> FireSink {
        FireSink {
            tx: self.fire_tx.clone(),
        }
    }

    /// Requests coverage for one address: `module` is `None` for the base
    /// program, `Some(name)` for a (possibly not yet loaded) module, and
    /// `offset` is relative to the target's load base.
    ///
    /// The record is armed immediately when the target is resolvable,
    /// deferred otherwise. Arming failures drop the request without
    /// affecting anything else; they are logged, not returned.
    pub fn add_probe(&self, module: Option<&str>, offset: u64) {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            warn!("probe add ignored, tracker is shutting down");
            return;
        }
        let fingerprint = module_fingerprint(module);
        match module {
            None => self.arm(ProbeRecord::resolved(fingerprint, 0, offset)),
            Some(name) => {
                let mut deferred = self.shared.deferred.lock().unwrap();
                match deferred.present.get(&fingerprint).copied() {
                    Some(base_address) => {
                        self.arm(ProbeRecord::resolved(fingerprint, base_address, offset));
                    }
                    None => {
                        debug!(module = name, offset, "target module absent, deferring probe");
                        deferred.table.insert(ProbeRecord::deferred(fingerprint, offset));
                    }
                }
            }
        }
    }

    /// Arms a resolved record: register, insert into pending, enable.
    ///
    /// The record is inserted before the enable call so that a fire landing
    /// immediately after enable always finds it; if enable fails the record
    /// is pulled back out and dropped, so a failed arm is never observable
    /// as pending.
    fn arm(&self, mut record: ProbeRecord) {
        let target = record.target_address();
        let handle = match self.shared.registrar.register(target) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(address = target, error = %err, "probe registration failed, dropping record");
                return;
            }
        };
        record.handle = Some(handle);
        {
            let mut live = self.shared.live.lock().unwrap();
            if self.shared.shutdown.load(Ordering::SeqCst) {
                drop(live);
                self.shared.registrar.unregister(handle);
                return;
            }
            record.generation = live.generation;
            live.pending.insert(handle, record);
        }
        if let Err(err) = self.shared.registrar.enable(handle) {
            self.shared.live.lock().unwrap().pending.remove(&handle);
            self.shared.registrar.unregister(handle);
            warn!(address = target, error = %err, "probe enable failed, dropping record");
            return;
        }
        debug!(address = target, handle = handle.raw(), "probe armed");
    }

    /// Applies a module-presence notification.
    pub fn handle_module_event(&self, event: ModuleEvent) {
        match event {
            ModuleEvent::Arriving { name, base_address } => {
                self.on_module_arriving(&name, base_address);
            }
            ModuleEvent::Departing { name } => self.on_module_departing(&name),
        }
    }

    /// The named module is now loaded at `base_address`: record its
    /// presence and arm every probe deferred against its fingerprint.
    /// Records that fail to arm are dropped individually.
    pub fn on_module_arriving(&self, name: &str, base_address: u64) {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let fingerprint = module_fingerprint(Some(name));
        let mut deferred = self.shared.deferred.lock().unwrap();
        deferred.present.insert(fingerprint, base_address);
        let records = deferred.table.take_matching(fingerprint);
        if !records.is_empty() {
            debug!(
                module = name,
                base_address,
                count = records.len(),
                "module arrived, arming deferred probes"
            );
        }
        for mut record in records {
            record.resolve(base_address);
            self.arm(record);
        }
    }

    /// The named module is about to go away: disarm and discard its pending
    /// probes (they can never fire again). Deferred records stay parked —
    /// the module may be reloaded under the same name. Hit records already
    /// queued are left for the consumer; they only report a relative
    /// offset, so a stale base address cannot leak out.
    pub fn on_module_departing(&self, name: &str) {
        let fingerprint = module_fingerprint(Some(name));
        let mut deferred = self.shared.deferred.lock().unwrap();
        deferred.present.remove(&fingerprint);

        let purged: Vec<ProbeRecord> = {
            let mut live = self.shared.live.lock().unwrap();
            let handles: Vec<ProbeHandle> = live
                .pending
                .iter()
                .filter(|(_, record)| record.fingerprint == fingerprint)
                .map(|(&handle, _)| handle)
                .collect();
            handles
                .into_iter()
                .filter_map(|handle| live.pending.remove(&handle))
                .collect()
        };
        for record in &purged {
            if let Some(handle) = record.handle {
                self.shared.registrar.unregister(handle);
            }
        }
        if !purged.is_empty() {
            debug!(
                module = name,
                count = purged.len(),
                "module departed, purged pending probes"
            );
        }
    }

    /// Forcibly discards every record in all three collections.
    ///
    /// Deferred records were never armed and are simply dropped; pending and
    /// hit records are unregistered first (a no-op for hit records, whose
    /// probes were disarmed on completion). A fire completing concurrently
    /// lands in the pre-clear generation and is dropped by the worker, so a
    /// cleared record can never be resurrected.
    pub fn clear(&self) {
        let dropped_deferred = self.shared.deferred.lock().unwrap().table.drain_all();
        let (pending, hits) = {
            let mut live = self.shared.live.lock().unwrap();
            live.generation += 1;
            let pending: Vec<ProbeRecord> =
                live.pending.drain().map(|(_, record)| record).collect();
            let hits: Vec<ProbeRecord> = live.hit.drain(..).collect();
            (pending, hits)
        };
        for record in pending.iter().chain(hits.iter()) {
            if let Some(handle) = record.handle {
                self.shared.registrar.unregister(handle);
            }
        }
        debug!(
            deferred = dropped_deferred.len(),
            pending = pending.len(),
            hit = hits.len(),
            "cleared all probe records"
        );
    }

    /// Creates a cancellation token for [`take_next`](Self::take_next)
    /// waits. Cancelling wakes every blocked consumer; those that find the
    /// queue empty return `None`.
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Blocks until a hit record is available, then pops and returns the
    /// head of the queue. The queue pop is the single point of
    /// serialization: racing consumers each get a distinct record.
    ///
    /// Returns `None` when the wait was cancelled or the tracker is
    /// shutting down — "no data, try again", not an error. A hit already in
    /// the queue wins over a pending cancellation.
    pub fn take_next(&self, cancel: &CancelToken) -> Option<HitRecord> {
        let mut live = self.shared.live.lock().unwrap();
        loop {
            if let Some(record) = live.hit.pop_front() {
                return Some(record.into_hit());
            }
            if self.shared.shutdown.load(Ordering::SeqCst) || cancel.is_cancelled() {
                return None;
            }
            live = self.shared.hit_ready.wait(live).unwrap();
        }
    }

    /// Current per-collection record counts.
    pub fn stats(&self) -> TrackerStats {
        let deferred = self.shared.deferred.lock().unwrap().table.len();
        let live = self.shared.live.lock().unwrap();
        TrackerStats {
            deferred,
            pending: live.pending.len(),
            hit: live.hit.len(),
        }
    }

    /// Begins teardown: sweeps all collections and wakes every blocked
    /// consumer, which will observe `None`. Further adds and module
    /// arrivals are ignored. Idempotent; also run by `Drop`.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.clear();
        // Lock and release before notifying so a consumer between its
        // shutdown check and its wait cannot miss the wakeup.
        drop(self.shared.live.lock().unwrap());
        self.shared.hit_ready.notify_all();
    }
}

impl Drop for CoverageTracker {
    fn drop(&mut self) {
        self.shutdown();
        drop(self.shutdown_tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Cancellation handle for blocked [`CoverageTracker::take_next`] calls.
/// Cloning shares the cancellation state.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    shared: Arc<TrackerShared>,
}

impl CancelToken {
    /// Cancels every wait using this token (current and future). Safe to
    /// call from any thread, including signal-style contexts that must not
    /// wait on consumers.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        drop(self.shared.live.lock().unwrap());
        self.shared.hit_ready.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
