pub mod plan;
pub mod restore_job;
pub mod snapshot;
