//! Periodic background sweeps over the feed registry

pub mod renewal;
pub mod status;

pub use renewal::RenewalSweep;
pub use status::{StatusBroadcast, StatusSweep};
