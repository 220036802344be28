//! Process wiring for the `sluice` binary: settings and the run scheduler.

pub mod scheduler;
pub mod settings;

pub use scheduler::Scheduler;
pub use settings::Settings;
