// ── Domain model ──
//
// Types handed to consumers. None of them depend on the wire layout;
// `convert` maps protocol messages into them.

pub mod device;
pub mod event;
pub mod link;
pub mod stats;
pub mod sfd;
pub mod status;
pub mod value;
pub mod watchable;

// ── Re-exports ──────────────────────────────────────────────────────

pub use device::{DeviceInfo, MemoryRegion};
pub use event::ClientEvent;
pub use link::{
    CanInterface, CanLinkConfig, DeviceLinkConfig, EtasCanConfig, IpLinkConfig, JLinkInterface,
    KVaserCanConfig, Parity, PcanConfig, RttLinkConfig, SerialLinkConfig, SocketCanConfig,
    StopBits, VectorCanConfig, VectorChannel,
};
pub use sfd::{SfdGenerationInfo, SfdInfo, SfdMetadata};
pub use stats::{LocalStatistics, ServerStatistics, WatchableCount};
pub use status::{
    ConnectionState, DataloggingState, DataloggingStatus, DeviceCommStatus, DeviceLinkInfo,
    DeviceLinkState, ServerStatus, SupportedFeatureMap,
};
pub use value::{ValueStatus, WatchableValue, WriteValue};
pub use watchable::{
    Datatype, DatatypeKind, EnumDefinition, WatchableConfiguration, WatchableInfo, WatchableList,
    WatchableListFilter, WatchablePath, WatchableType,
};
