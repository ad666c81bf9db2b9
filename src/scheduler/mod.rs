//! Scheduled recomputes: cron timing, the run loop, and the run ledger.

pub mod cron;
pub mod engine;
pub mod history;

// Re-export common types
pub use self::cron::Scheduler;
pub use self::engine::run_scheduler_loop;
