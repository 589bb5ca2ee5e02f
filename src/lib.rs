//! Translation layer between an OS network stack's buffer lists and the
//! packet/fragment rings a NIC driver consumes.

pub mod adapter;
pub mod arena;
pub mod config;
pub mod device;
pub mod dma;
pub mod errors;
pub mod exec;
pub mod loopback;
pub mod nbl;
pub mod offload;
pub mod os;
pub mod pool;
pub mod queue_control;
pub mod ring;
pub mod rx;
pub mod stats;
pub mod tx;
pub mod util;

pub use adapter::Adapter;
pub use config::{BounceConfig, DatapathConfig, RingConfig, RxConfig, TxScalingConfig};
pub use device::{
    DeviceCapabilities, MappingRequirement, NetDevice, PacketQueue, QueueSetup, RxCapabilities,
    TxCapabilities,
};
pub use errors::{Error, Result};
pub use loopback::LoopbackDevice;
pub use nbl::{CompletionStatus, ExecutionLevel, Mdl, NblChain, NblInfo, NetBuffer, NetBufferList};
pub use os::{OsNetStack, RecordingStack};
pub use stats::{QueueStat, Stat};
