pub mod check;
pub mod prober;
pub mod state;

pub use check::{run_check, CheckOutcome};
pub use prober::{HealthProber, ProbeEvent, ProbeSet, ServiceRef};
pub use state::{ContainerHealth, ProbeKind, ProbeState, ProbeStatus};
