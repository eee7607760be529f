//! GPU slot admission control.

pub mod scheduler;

pub use scheduler::{AcquireError, ClassSnapshot, GpuLease, GpuScheduler, SchedulerSnapshot};
