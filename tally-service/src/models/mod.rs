//! Domain models for tally-service.

pub mod dimensions;
pub mod event;
pub mod facts;
pub mod host;
pub mod measurement;
pub mod snapshot;

pub use dimensions::{BillingProvider, Dimension, DimensionValue, ServiceLevel, Usage, UsageKey, ANY};
pub use event::{Event, EventHardwareType, Measurement};
pub use facts::{HostFacts, NormalizedFacts};
pub use host::{
    month_id, BucketKey, Host, HostBucket, HostHardwareType, MonthlyTotal, MonthlyTotalKey, HBI_HOST,
};
pub use measurement::{HardwareMeasurementType, MeasurementKey, MetricId};
pub use snapshot::{Granularity, Snapshot, SnapshotKey, SnapshotMeasurement, SnapshotRecord};
