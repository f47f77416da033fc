pub mod allocator;
pub mod hooks;
pub mod locks;
pub mod monitor;
pub mod service;
pub mod utilization;

pub use allocator::{AddressAllocator, AllocationRequest};
pub use hooks::{BusHook, ChangeHook};
pub use monitor::{ExhaustionMonitor, ExhaustionOutcome};
pub use service::{
    IpRangeUpdate, IpamService, NewIpRange, NewSubnet, StaticIpUpdate, SubnetUpdate,
};
pub use utilization::{InUseOptions, SubnetStatistics, SubnetUtilization};
