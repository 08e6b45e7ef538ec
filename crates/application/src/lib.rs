//! 应用层实现。
//!
//! 这里提供消息/回应管线、分布式在线状态、缓存与分布式锁等核心用例，
//! 以及它们依赖的外部适配器抽象（存储、消息代理、实时传输）。

pub mod broker;
pub mod cache;
pub mod clock;
pub mod distribution;
pub mod error;
pub mod lock;
pub mod permission;
pub mod presence;
pub mod record;
pub mod services;
pub mod transport;
pub mod writeback;

pub use broker::{BrokerChannel, ConsumerRole, Delivery, DeliveryHandle};
pub use cache::{Cache, CacheEntry, CacheOptions, CacheStore, Fetcher};
pub use clock::{Clock, SystemClock};
pub use distribution::DistributionWorker;
pub use error::{ApplicationError, ApplicationResult};
pub use lock::{LockBackend, LockConfig, LockLease, LockManager};
pub use permission::PermissionOracle;
pub use presence::{
    PresenceConfig, PresenceEvent, PresenceEventKind, PresenceEventPublisher, PresenceStore,
    PresenceTracker, ReconcileOutcome,
};
pub use record::Record;
pub use services::{
    MessageService, MessageServiceDependencies, ReactionService, ReactionServiceDependencies,
};
pub use transport::LiveTransport;
pub use writeback::{
    ActionStore, StoreError, WritebackConfig, WritebackWorker, DEFER_NOT_SET,
};
