// scrutiny-core: client session, watchable handles and batch writes on top of scrutiny-api.

pub mod batch;
pub mod client;
pub mod config;
pub mod error;
pub mod handle;
pub mod model;

mod convert;
mod listener;
mod registry;
mod stats;

// ── Primary re-exports ──────────────────────────────────────────────
pub use batch::{BatchWrite, MAX_BATCH_SIZE};
pub use client::Client;
pub use config::{ClientConfig, DEFAULT_PORT};
pub use error::CoreError;
pub use handle::{HandleSnapshot, ValueStream, WatchableHandle};

// Transport options live in the wire crate; re-exported so consumers can
// build a `ClientConfig` without depending on it.
pub use scrutiny_api::{FramingConfig, LinkKind, TransportConfig};
pub use scrutiny_api::expr::ExprError;

pub use model::{
    // Session
    ClientEvent, ConnectionState, DeviceLinkState,
    // Server status
    DataloggingState, DataloggingStatus, DeviceCommStatus, DeviceLinkInfo, ServerStatus,
    SupportedFeatureMap,
    // Device link configuration
    CanInterface, CanLinkConfig, DeviceLinkConfig, IpLinkConfig, JLinkInterface, Parity,
    RttLinkConfig, SerialLinkConfig, StopBits,
    // Device and firmware
    DeviceInfo, MemoryRegion, SfdGenerationInfo, SfdInfo, SfdMetadata,
    // Watchables
    Datatype, EnumDefinition, ValueStatus, WatchableConfiguration, WatchableInfo, WatchableList,
    WatchableListFilter, WatchablePath, WatchableType, WatchableValue, WriteValue,
    // Statistics
    LocalStatistics, ServerStatistics, WatchableCount,
};
