pub mod admission_gate;
pub mod graceful_shutdown;

pub use admission_gate::{
    AcceptSource, AdmissionGate, AdmissionGateConfig, AdmittedConnection, ErrorCallback, GateError,
};
pub use graceful_shutdown::{
    ShutdownCause, ShutdownCoordinator, ShutdownError, ShutdownReport, ShutdownState,
    os_stop_signal,
};
