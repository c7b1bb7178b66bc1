use crossbeam_channel::Sender;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Errors the probe registrar can report when arming a point.
///
/// All of these are fatal for the record being armed and harmless for the
/// rest of the system: the affected add is dropped, nothing is retried.
#[derive(Error, Debug)]
pub enum RegistrarError {
    /// The address cannot be instrumented (unmapped, misaligned, ...).
    #[error("address 0x{0:x} cannot be instrumented")]
    AddressInvalid(u64),
    /// A probe is already installed at this address.
    #[error("address 0x{0:x} is already instrumented")]
    AlreadyInstrumented(u64),
    /// The registrar ran out of probe slots or bookkeeping memory.
    #[error("probe registrar resources exhausted")]
    ResourceExhausted,
}

/// Opaque identity of a registered probe.
///
/// Handles are minted by the registrar and are the only currency exchanged
/// across the fire boundary: a fire notification carries the handle, and the
/// lifecycle engine maps it back to its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeHandle(u64);

impl ProbeHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// The external capability that installs and removes instrumentation points.
///
/// The tracker calls `register` then `enable` to arm a probe, and
/// `unregister` to disarm it. Fire notifications flow the other way, through
/// a [`FireSink`] the registrar implementation is handed at wiring time: on
/// execution reaching an armed address, the registrar calls
/// [`FireSink::fire`] with the probe's handle, from whatever thread it likes.
/// The registrar guarantees at most one fire delivery per armed instance;
/// the tracker additionally tolerates spurious duplicates by construction.
pub trait Registrar: Send + Sync {
    /// Installs a probe at an absolute address. The probe does not deliver
    /// fires until it is also enabled.
    fn register(&self, address: u64) -> Result<ProbeHandle, RegistrarError>;

    /// Enables fire delivery for a registered probe.
    fn enable(&self, handle: ProbeHandle) -> Result<(), RegistrarError>;

    /// Removes a probe. Idempotent: unregistering a handle that is already
    /// gone (or whose probe has already fired) is a no-op and never fails
    /// observably.
    fn unregister(&self, handle: ProbeHandle);
}

/// The fire-delivery edge handed to a registrar.
///
/// `fire` never blocks and never sleeps: it only enqueues the handle for the
/// tracker's completion worker, so it is safe to call from constrained
/// contexts (the registrar's own callback thread, signal-handler-like
/// environments). All blocking work — disarming the probe, moving the record
/// to the hit queue, waking consumers — happens later on the worker.
#[derive(Debug, Clone)]
pub struct FireSink {
    pub(crate) tx: Sender<ProbeHandle>,
}

impl FireSink {
    /// Reports that the probe identified by `handle` was reached. Delivery
    /// after the tracker has been torn down is silently dropped.
    pub fn fire(&self, handle: ProbeHandle) {
        let _ = self.tx.send(handle);
    }
}

#[derive(Debug)]
struct MockProbe {
    address: u64,
    enabled: bool,
    fired: bool,
}

#[derive(Debug, Default)]
struct MockState {
    probes: HashMap<ProbeHandle, MockProbe>,
    by_address: HashMap<u64, ProbeHandle>,
    sink: Option<FireSink>,
    fail_register: Vec<u64>,
    fail_enable: Vec<u64>,
    capacity: Option<usize>,
    registered_total: u64,
    released_total: u64,
}

/// An in-process stand-in for a real trap-inserting registrar.
///
/// It arms addresses in a table instead of patching code, and "executes" an
/// address by delivering a fire through the attached [`FireSink`]. Failure
/// injection and register/release accounting make it the measuring
/// instrument for the lifecycle tests: every armed probe must eventually be
/// released exactly once, no matter how adds, fires, departs and clears
/// interleave.
#[derive(Debug, Default)]
pub struct MockRegistrar {
    state: Mutex<MockState>,
    next_handle: AtomicU64,
}

impl MockRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches the fire-delivery edge. Wiring happens after tracker
    /// construction, which is why this is not a constructor argument.
    pub fn attach_sink(&self, sink: FireSink) {
        self.state.lock().unwrap().sink = Some(sink);
    }

    /// Makes `register` fail with `AddressInvalid` for this address.
    pub fn fail_register_at(&self, address: u64) {
        self.state.lock().unwrap().fail_register.push(address);
    }

    /// Makes `enable` fail with `AddressInvalid` for probes at this address.
    pub fn fail_enable_at(&self, address: u64) {
        self.state.lock().unwrap().fail_enable.push(address);
    }

    /// Caps the number of concurrently registered probes; further
    /// registrations fail with `ResourceExhausted`.
    pub fn set_capacity(&self, capacity: usize) {
        self.state.lock().unwrap().capacity = Some(capacity);
    }

    /// Simulates execution reaching `address`: if an enabled, not yet fired
    /// probe is armed there, delivers its fire and returns `true`.
    ///
    /// Each armed instance delivers at most one fire, matching the
    /// registrar contract; the probe stays installed until the tracker
    /// unregisters it.
    pub fn execute(&self, address: u64) -> bool {
        let (handle, sink) = {
            let mut state = self.state.lock().unwrap();
            let Some(&handle) = state.by_address.get(&address) else {
                return false;
            };
            let Some(sink) = state.sink.clone() else {
                return false;
            };
            let probe = state.probes.get_mut(&handle).unwrap();
            if !probe.enabled || probe.fired {
                return false;
            }
            probe.fired = true;
            (handle, sink)
        };
        sink.fire(handle);
        true
    }

    /// Addresses currently armed (registered and enabled), in no particular
    /// order.
    pub fn armed_addresses(&self) -> Vec<u64> {
        let state = self.state.lock().unwrap();
        state
            .probes
            .values()
            .filter(|probe| probe.enabled)
            .map(|probe| probe.address)
            .collect()
    }

    pub fn is_armed_at(&self, address: u64) -> bool {
        self.state.lock().unwrap().by_address.contains_key(&address)
    }

    /// Handle of the probe installed at `address`, if any.
    pub fn handle_at(&self, address: u64) -> Option<ProbeHandle> {
        self.state.lock().unwrap().by_address.get(&address).copied()
    }

    /// Number of probes currently installed.
    pub fn outstanding(&self) -> usize {
        self.state.lock().unwrap().probes.len()
    }

    /// Total successful registrations over the registrar's lifetime.
    pub fn registered_total(&self) -> u64 {
        self.state.lock().unwrap().registered_total
    }

    /// Total probes actually removed. Repeated `unregister` calls on the
    /// same handle count once here.
    pub fn released_total(&self) -> u64 {
        self.state.lock().unwrap().released_total
    }
}

impl Registrar for MockRegistrar {
    fn register(&self, address: u64) -> Result<ProbeHandle, RegistrarError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_register.contains(&address) {
            return Err(RegistrarError::AddressInvalid(address));
        }
        if state.by_address.contains_key(&address) {
            return Err(RegistrarError::AlreadyInstrumented(address));
        }
        if let Some(capacity) = state.capacity {
            if state.probes.len() >= capacity {
                return Err(RegistrarError::ResourceExhausted);
            }
        }
        let handle = ProbeHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        state.probes.insert(
            handle,
            MockProbe {
                address,
                enabled: false,
                fired: false,
            },
        );
        state.by_address.insert(address, handle);
        state.registered_total += 1;
        Ok(handle)
    }

    fn enable(&self, handle: ProbeHandle) -> Result<(), RegistrarError> {
        let mut state = self.state.lock().unwrap();
        let Some(probe) = state.probes.get_mut(&handle) else {
            return Err(RegistrarError::AddressInvalid(handle.raw()));
        };
        let address = probe.address;
        if state.fail_enable.contains(&address) {
            return Err(RegistrarError::AddressInvalid(address));
        }
        state.probes.get_mut(&handle).unwrap().enabled = true;
        Ok(())
    }

    fn unregister(&self, handle: ProbeHandle) {
        let mut state = self.state.lock().unwrap();
        if let Some(probe) = state.probes.remove(&handle) {
            state.by_address.remove(&probe.address);
            state.released_total += 1;
        }
        // Unknown handle: idempotent no-op by contract.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn sink_pair() -> (FireSink, crossbeam_channel::Receiver<ProbeHandle>) {
        let (tx, rx) = unbounded();
        (FireSink { tx }, rx)
    }

    #[test]
    fn register_enable_execute_delivers_one_fire() {
        let registrar = MockRegistrar::new();
        let (sink, rx) = sink_pair();
        registrar.attach_sink(sink);

        let handle = registrar.register(0x1000).unwrap();
        assert!(
            !registrar.execute(0x1000),
            "A registered but not enabled probe must not fire"
        );

        registrar.enable(handle).unwrap();
        assert!(registrar.execute(0x1000), "Enabled probe should fire");
        assert_eq!(rx.try_recv().unwrap(), handle);

        assert!(
            !registrar.execute(0x1000),
            "A single armed instance delivers at most one fire"
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn duplicate_address_is_rejected() {
        let registrar = MockRegistrar::new();
        registrar.register(0x42).unwrap();
        match registrar.register(0x42) {
            Err(RegistrarError::AlreadyInstrumented(addr)) => assert_eq!(addr, 0x42),
            other => panic!("Expected AlreadyInstrumented, got {other:?}"),
        }
    }

    #[test]
    fn capacity_exhaustion_is_reported() {
        let registrar = MockRegistrar::new();
        registrar.set_capacity(1);
        registrar.register(0x1).unwrap();
        match registrar.register(0x2) {
            Err(RegistrarError::ResourceExhausted) => {}
            other => panic!("Expected ResourceExhausted, got {other:?}"),
        }
    }

    #[test]
    fn unregister_is_idempotent_and_counts_once() {
        let registrar = MockRegistrar::new();
        let handle = registrar.register(0x10).unwrap();
        registrar.unregister(handle);
        registrar.unregister(handle);
        assert_eq!(registrar.outstanding(), 0);
        assert_eq!(registrar.registered_total(), 1);
        assert_eq!(
            registrar.released_total(),
            1,
            "Repeated unregister calls must not inflate the release count"
        );
    }

    #[test]
    fn injected_register_failure_leaves_no_probe_behind() {
        let registrar = MockRegistrar::new();
        registrar.fail_register_at(0x99);
        assert!(registrar.register(0x99).is_err());
        assert_eq!(registrar.outstanding(), 0);
        assert!(!registrar.is_armed_at(0x99));
    }
}
