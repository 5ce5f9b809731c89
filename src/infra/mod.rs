pub mod database;
pub mod hub;
pub mod metrics;
pub mod presence_store;
pub mod redis;
pub mod redis_presence;
pub mod snowflake;

pub use database::Database;
pub use hub::{Channel, EventEmitter, EventReceiver, EventSender, HubStats, RealtimeHub};
pub use presence_store::{MemoryPresenceStore, PresenceStore};
pub use redis::RedisClient;
pub use redis_presence::RedisPresenceStore;
