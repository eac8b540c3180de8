pub mod config;
pub mod logging;
pub mod persistence;

pub use config::{BrokerConfig, FieldConfig, LinkMode, LocalLinkConfig, MAX_SYNC_WINDOW_SECS};
pub use persistence::{
    DeliveryStore, IncomingReportRow, MemoryDeliveryStore, RecipientStatusRow,
    SqliteDeliveryStore,
};
