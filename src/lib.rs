//! Event-sourced shopping carts.
//!
//! Each cart is an entity with its own actor: commands for one cart run one
//! at a time, events are appended to a shared [`EventLog`], and state is
//! recovered from the latest snapshot plus the event tail. A
//! [`ShardDirectory`] keeps at most one live instance per cart across
//! nodes, and a [`ProjectionEngine`] folds tagged cart events into the
//! [`ItemPopularityStore`] read model.
//!
//! ```no_run
//! use std::sync::Arc;
//! use shopping_cart_es::{
//!     CartConfig, ItemPopularityProjection, MemoryItemPopularityStore, ProjectionEngine,
//!     ShoppingCart, ShoppingCartService,
//! };
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CartConfig::default();
//! let persistence = config.open_persistence()?;
//! let carts = config
//!     .directory_builder(persistence.clone())
//!     .build::<ShoppingCart>();
//!
//! let popularity = Arc::new(MemoryItemPopularityStore::new());
//! let live = ProjectionEngine::for_aggregate::<ShoppingCart>(
//!     Arc::new(ItemPopularityProjection::new(popularity.clone())),
//!     persistence.journal.clone(),
//!     config.tag_slices,
//! )
//! .with_live_config(config.live_config())
//! .start();
//!
//! let service = ShoppingCartService::new(carts, popularity, config.ask_timeout());
//! service.add_item("cart-1", "socks", 2).await?;
//! service.checkout("cart-1").await?;
//! live.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod actor;
mod aggregate;
mod cart;
mod command;
mod config;
mod directory;
mod error;
mod event;
mod journal;
mod live;
mod popularity;
mod projection;
mod recovery;
mod routing;
mod service;
mod snapshot;
mod storage;
mod supervision;

pub use actor::{AggregateHandle, Executed, spawn_actor};
pub use aggregate::Aggregate;
pub use cart::{CartCommand, CartError, CartEvent, ShoppingCart, Summary};
pub use command::CommandContext;
pub use config::{CartConfig, ConfigError, ProjectionSection, RestartSection, SnapshotSection};
pub use directory::{ShardDirectory, ShardDirectoryBuilder, ShardPeer};
pub use error::{
    ExecuteError, JournalError, ProjectionError, RecoveryError, StateError, StoreError,
};
pub use event::{
    NewEvent, PersistedEvent, decode_domain_event, encode_domain_event, entity_uuid, tag_for,
    tags_for,
};
pub use journal::{EventLog, FileEventLog, MemoryEventLog};
pub use live::{LiveConfig, LiveHandle};
pub use popularity::{
    FileItemPopularityStore, ItemPopularity, ItemPopularityProjection, ItemPopularityStore,
    MemoryItemPopularityStore,
};
pub use projection::{Projection, ProjectionEngine, ProjectionOffset};
pub use recovery::{Recovered, recover};
pub use routing::{
    DEFAULT_NUMBER_OF_SHARDS, HashRing, NodeId, RingError, ShardAllocation, ShardId, SingleNode,
    shard_for,
};
pub use service::{Cart, Item, ItemPopularityCount, ServiceError, ShoppingCartService};
pub use snapshot::{
    FileSnapshotStore, MemorySnapshotStore, Snapshot, SnapshotPolicy, SnapshotStore,
};
pub use storage::{Persistence, StorageLayout};
pub use supervision::RestartPolicy;
