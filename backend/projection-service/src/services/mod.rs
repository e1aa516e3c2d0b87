pub mod elasticsearch;
pub mod index_store;
pub mod notification;

pub use elasticsearch::{ElasticsearchError, ElasticsearchIndexStore};
pub use index_store::{IndexStore, IndexStoreError, ItemOutcome};
pub use notification::{
    NotificationAction, NotificationMessage, NotificationSink, RedisNotificationSink, SinkError,
};
