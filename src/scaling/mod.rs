pub mod capacity;
pub mod controller;
pub mod fleet;
pub mod monitor;

pub use capacity::{CapacitySample, CapacityTracker, ClusterCapacity, PerformanceTier, WorkerCapacity};
pub use controller::{ScalingController, ScalingEvent};
pub use fleet::{FleetDriver, LocalFleetDriver};
pub use monitor::{MetricsSample, QueueMonitor, Recommendation, ScalingAction};
