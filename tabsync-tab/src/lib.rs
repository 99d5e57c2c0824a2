pub mod clock;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod election;
pub mod error;
pub mod liveness;
pub mod replication;
pub mod state;
pub mod store;
pub mod transport;
pub mod ws_transport;

pub use clock::Clock;
pub use config::{ConfigError, CoordinatorConfig, load_config_from_path, parse_config_json};
pub use coordinator::{
    CommitOutcome, CoordinatorEvent, CoordinatorHandle, ElectionPhase, TabCoordinator, TabStatus,
};
pub use dispatcher::{Role, SessionOwner, TabNotice};
pub use error::{StoreError, SyncError, TransportError};
pub use state::{JsonStateStore, StateStore};
pub use store::{FileFlagStore, FlagStore, MemoryFlagStore};
pub use transport::{BroadcastTransport, MemoryBus, MemoryTransport, NoopTransport};
pub use ws_transport::WsTransport;
