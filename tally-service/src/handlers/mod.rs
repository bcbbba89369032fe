pub mod events;
pub mod jobs;
pub mod snapshots;

pub use events::ingest_events;
pub use jobs::{purge_expired, tally_all_hourly, tally_all_orgs, tally_hourly, tally_org};
pub use snapshots::list_snapshots;
