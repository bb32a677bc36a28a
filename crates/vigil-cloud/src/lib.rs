pub mod client;
pub mod error;
pub mod jobs;
pub mod logs;
pub mod poll;
pub mod provision;
pub mod report;

pub use client::{CloudApi, KeyStatus, RotationGrant};
pub use error::CloudError;
pub use jobs::{run_job_poller, Job, JobHandler, JobOutcome, JobStatus, RejectAllHandler};
pub use logs::{start_log_shipper, LogRecord, LogShipper};
pub use poll::{run_report_loop, run_target_poll, ReportSource, TargetHandler};
pub use provision::{apply_rotation, ensure_identity, provision, recover_unauthorized};
pub use report::{
    build_report, AdapterHealthView, AdapterReport, AppReport, CurrentStateReport, ErrorReport,
    ServiceReport,
};
