pub mod cleanup;
pub mod progress;
pub mod restore_runner;
pub mod retention;
pub mod scheduler;
pub mod scrub_runner;
pub mod snapshot_runner;
pub mod status;
