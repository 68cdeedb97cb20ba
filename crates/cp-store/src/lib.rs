//! Persistence for the four append-only observation series (prices,
//! sentiment, risk events, TVL).
//!
//! A bounded pool of DuckDB connections backs every read and write; rows are
//! written once, queried by entity and age, and deleted only by the
//! retention sweep.

pub mod pool;
pub mod store;

pub use pool::{ConnectionPool, PoolConfig, PooledConnection};
pub use store::{
    CleanupReport, DailySentiment, MonitorStore, ProtocolEventCount, ProtocolStats,
    RetentionPolicy, SentimentTrendPoint,
};
