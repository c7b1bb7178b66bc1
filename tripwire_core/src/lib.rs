pub mod config;
pub mod control;
pub mod deferral;
pub mod record;
pub mod registrar;
pub mod tracker;

pub use config::{ArrivalPhase, ModuleSpec, RunSettings, SimulationConfig, TripwireConfig};
pub use control::{ControlCommand, apply_control, parse_control};
pub use deferral::DeferralTable;
pub use record::{BASE_PROGRAM_FINGERPRINT, HitRecord, ProbeRecord, module_fingerprint};
pub use registrar::{FireSink, MockRegistrar, ProbeHandle, Registrar, RegistrarError};
pub use tracker::{CancelToken, CoverageTracker, ModuleEvent, TrackerStats};

mod tests {
    #[test]
    fn fingerprint_sentinel_is_reserved() {
        assert_eq!(crate::module_fingerprint(None), 0);
    }
}
