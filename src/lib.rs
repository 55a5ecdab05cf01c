pub mod clock;
pub mod compactor;
pub mod config;
pub mod device;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod events;
pub mod network;
pub mod oplog;
pub mod push_pull;
pub mod query;
pub mod realtime;
pub mod remote;
pub mod resolver;
pub mod status;
pub mod store;

pub use clock::{Clock, FakeClock, SystemClock};
pub use config::EngineConfig;
pub use device::{DeviceId, DeviceIdentityStore, FileDeviceIdentityStore, MemoryDeviceIdentityStore};
pub use engine::Engine;
pub use envelope::{EntityRow, EntityTable};
pub use error::{EngineError, Result, RetryClass};
pub use events::{EngineEvent, EventBus};
pub use network::NetworkMonitor;
pub use oplog::{OpKind, Operation, OperationLog};
pub use query::QueryLayer;
pub use realtime::{ChannelProvider, ChannelState, RealtimeIngress, RemoteEvent, RemoteEventKind};
pub use remote::{RemoteError, RemotePage, RemoteStore};
pub use resolver::{FieldConflict, ResolveOutcome, Resolver, Strategy, Winner};
pub use status::{RealtimeState, StatusSnapshot, SyncStatus, SyncStatusObserver};
pub use store::LocalStore;
