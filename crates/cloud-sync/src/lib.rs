//! Live multi-device workspace sync.
//!
//! Local mutations are applied optimistically, debounced per key and upserted
//! to the backend tagged with this device's id. The backend's change feed
//! pushes every row change to all subscribed devices; each device drops the
//! echo of its own writes and folds the rest into its local state.

pub mod client;
pub mod config;
pub mod debounce;
pub mod error;
pub mod gateway;
pub mod manager;
pub mod memory;
pub mod migration;
pub mod realtime;
pub mod router;
pub mod store;
pub mod types;

pub use client::RestRecordStore;
pub use config::SyncConfig;
pub use debounce::DebouncedWriter;
pub use error::{CloudSyncError, Result};
pub use gateway::CloudPersistenceGateway;
pub use manager::{SyncBackend, SyncManager, PREFERENCES_CHANNEL, WORKSPACE_CHANNEL};
pub use memory::MemoryBackend;
pub use migration::{LocalToCloudMigrator, MigrationOutcome, MigrationReport};
pub use realtime::{
    ChangeCallback, ChangeFeed, ChangeKind, ChannelSignal, ChannelSpec, ErrorCallback,
    FeedChannel, RealtimeSocketFeed, ReconnectPolicy, RowChange, SubscriptionHandle,
    SubscriptionManager, SubscriptionStatus,
};
pub use router::{ChangeNotificationRouter, RouteOutcome};
pub use store::RecordStore;
pub use types::{PreferencesRow, SyncRecordRow};
