mod manager;
mod record;

pub use manager::{Claim, LeaseCounts, LeaseManager, SweepReport};
pub use record::{Lease, Release};
