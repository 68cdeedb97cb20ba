use std::path::Path;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use duckdb::params;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use cp_types::errors::{StoreError, StoreResult};
use cp_types::series::{PricePoint, RiskEvent, SentimentSample, TvlPoint};

use crate::pool::{ConnectionPool, PoolConfig};

/// Age windows after which the retention sweep deletes rows, per series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub price_days: i64,
    pub sentiment_days: i64,
    pub tvl_days: i64,
    /// Risk events are kept much longer than the market series.
    pub risk_event_days: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            price_days: 90,
            sentiment_days: 90,
            tvl_days: 90,
            risk_event_days: 365,
        }
    }
}

/// Rows removed by one retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub price_rows: usize,
    pub sentiment_rows: usize,
    pub tvl_rows: usize,
    pub risk_event_rows: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.price_rows + self.sentiment_rows + self.tvl_rows + self.risk_event_rows
    }
}

/// Hourly sentiment bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentTrendPoint {
    pub hour: String,
    pub avg_score: f64,
    pub samples: i64,
}

/// Daily sentiment bucket used in the aggregated stats payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySentiment {
    pub day: String,
    pub avg_score: f64,
}

/// Per-protocol risk event rollup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolEventCount {
    pub protocol: String,
    pub event_count: i64,
    pub avg_risk: f64,
}

/// Aggregated view broadcast with the periodic status payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolStats {
    pub protocol_events: Vec<ProtocolEventCount>,
    pub sentiment_trend: Vec<DailySentiment>,
    pub last_updated: DateTime<Utc>,
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::QueryFailed {
            message: format!("unparseable timestamp {raw}: {e}"),
        })
}

fn query_err(e: duckdb::Error) -> StoreError {
    StoreError::QueryFailed {
        message: e.to_string(),
    }
}

/// Pooled store for the four observation series.
#[derive(Debug)]
pub struct MonitorStore {
    pool: ConnectionPool,
}

impl MonitorStore {
    /// Open (or create) the store at `path` and run migrations.
    pub async fn open<P: AsRef<Path>>(path: P, config: PoolConfig) -> StoreResult<Self> {
        let store = Self {
            pool: ConnectionPool::open(path, config)?,
        };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for tests and ephemeral runs.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let store = Self {
            pool: ConnectionPool::open_in_memory(PoolConfig::default())?,
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        let conn = self.pool.acquire().await?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS price_points (
                token TEXT NOT NULL,
                price DOUBLE NOT NULL,
                volume_24h DOUBLE DEFAULT 0,
                market_cap DOUBLE DEFAULT 0,
                ts TEXT NOT NULL,
                received_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_price_points_token_ts ON price_points(token, ts);

            CREATE TABLE IF NOT EXISTS sentiment_samples (
                source TEXT NOT NULL,
                content TEXT NOT NULL,
                score DOUBLE NOT NULL,
                metadata TEXT DEFAULT '{}',
                ts TEXT NOT NULL,
                received_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sentiment_samples_source_ts ON sentiment_samples(source, ts);

            CREATE TABLE IF NOT EXISTS risk_events (
                event_type TEXT NOT NULL,
                protocol TEXT NOT NULL,
                risk_score DOUBLE NOT NULL,
                description TEXT NOT NULL,
                metadata TEXT DEFAULT '{}',
                ts TEXT NOT NULL,
                received_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_risk_events_protocol_ts ON risk_events(protocol, ts);

            CREATE TABLE IF NOT EXISTS tvl_points (
                protocol TEXT NOT NULL,
                chain TEXT NOT NULL,
                tvl DOUBLE NOT NULL,
                ts TEXT NOT NULL,
                received_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tvl_points_protocol_ts ON tvl_points(protocol, ts);",
        )
        .map_err(|e| StoreError::Connection {
            message: e.to_string(),
        })?;

        info!("storage schema ready");
        Ok(())
    }

    /// Lightweight liveness query used by the health monitor.
    pub async fn ping(&self) -> StoreResult<()> {
        let conn = self.pool.acquire().await?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(query_err)?;
        Ok(())
    }

    pub fn pool_size(&self) -> usize {
        self.pool.size()
    }

    pub fn pool_available(&self) -> usize {
        self.pool.available()
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Release the connection pool. In-flight operations finish; new ones
    /// fail with `PoolClosed`.
    pub fn close(&self) {
        self.pool.close();
    }

    // ---- writes ----

    pub async fn insert_price(&self, point: &PricePoint) -> StoreResult<()> {
        let conn = self.pool.acquire().await?;
        conn.execute(
            "INSERT INTO price_points (token, price, volume_24h, market_cap, ts, received_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                point.token,
                point.price,
                point.volume_24h,
                point.market_cap,
                fmt_ts(point.ts),
                fmt_ts(point.received_at),
            ],
        )
        .map_err(|e| StoreError::InsertFailed {
            table: "price_points".to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    pub async fn insert_sentiment(&self, sample: &SentimentSample) -> StoreResult<()> {
        let conn = self.pool.acquire().await?;
        conn.execute(
            "INSERT INTO sentiment_samples (source, content, score, metadata, ts, received_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                sample.source,
                sample.content,
                sample.score,
                sample.metadata.to_string(),
                fmt_ts(sample.ts),
                fmt_ts(sample.received_at),
            ],
        )
        .map_err(|e| StoreError::InsertFailed {
            table: "sentiment_samples".to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    pub async fn insert_risk_event(&self, event: &RiskEvent) -> StoreResult<()> {
        let conn = self.pool.acquire().await?;
        conn.execute(
            "INSERT INTO risk_events (event_type, protocol, risk_score, description, metadata, ts, received_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                event.event_type,
                event.protocol,
                event.risk_score,
                event.description,
                event.metadata.to_string(),
                fmt_ts(event.ts),
                fmt_ts(event.received_at),
            ],
        )
        .map_err(|e| StoreError::InsertFailed {
            table: "risk_events".to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    pub async fn insert_tvl(&self, point: &TvlPoint) -> StoreResult<()> {
        let conn = self.pool.acquire().await?;
        conn.execute(
            "INSERT INTO tvl_points (protocol, chain, tvl, ts, received_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                point.protocol,
                point.chain,
                point.tvl,
                fmt_ts(point.ts),
                fmt_ts(point.received_at),
            ],
        )
        .map_err(|e| StoreError::InsertFailed {
            table: "tvl_points".to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    // ---- reads ----

    /// Price observations for one token over the trailing `days`, oldest
    /// first.
    pub async fn price_history(&self, token: &str, days: i64) -> StoreResult<Vec<PricePoint>> {
        let cutoff = fmt_ts(Utc::now() - Duration::days(days));
        let conn = self.pool.acquire().await?;

        let mut stmt = conn
            .prepare(
                "SELECT token, price, volume_24h, market_cap, ts, received_at
                 FROM price_points
                 WHERE token = ? AND ts >= ?
                 ORDER BY ts ASC",
            )
            .map_err(query_err)?;

        let raw = stmt
            .query_map(params![token, cutoff], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(query_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_err)?;

        let mut points = Vec::with_capacity(raw.len());
        for (token, price, volume_24h, market_cap, ts, received_at) in raw {
            points.push(PricePoint {
                token,
                price,
                volume_24h,
                market_cap,
                ts: parse_ts(&ts)?,
                received_at: parse_ts(&received_at)?,
            });
        }
        Ok(points)
    }

    /// Hourly average sentiment over the trailing `hours`.
    pub async fn sentiment_trend(&self, hours: i64) -> StoreResult<Vec<SentimentTrendPoint>> {
        let cutoff = fmt_ts(Utc::now() - Duration::hours(hours));
        let conn = self.pool.acquire().await?;

        let mut stmt = conn
            .prepare(
                "SELECT CAST(date_trunc('hour', CAST(ts AS TIMESTAMP)) AS VARCHAR) AS hour,
                        AVG(score) AS avg_score,
                        COUNT(*) AS samples
                 FROM sentiment_samples
                 WHERE ts >= ?
                 GROUP BY 1
                 ORDER BY 1 ASC",
            )
            .map_err(query_err)?;

        stmt.query_map(params![cutoff], |row| {
            Ok(SentimentTrendPoint {
                hour: row.get(0)?,
                avg_score: row.get(1)?,
                samples: row.get(2)?,
            })
        })
        .map_err(query_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(query_err)
    }

    /// Recent risk events, newest first, optionally limited to one protocol.
    pub async fn recent_risk_events(
        &self,
        protocol: Option<&str>,
        days: i64,
    ) -> StoreResult<Vec<RiskEvent>> {
        let cutoff = fmt_ts(Utc::now() - Duration::days(days));
        let conn = self.pool.acquire().await?;

        let sql_all = "SELECT event_type, protocol, risk_score, description, metadata, ts, received_at
             FROM risk_events
             WHERE ts >= ?
             ORDER BY ts DESC";
        let sql_one = "SELECT event_type, protocol, risk_score, description, metadata, ts, received_at
             FROM risk_events
             WHERE protocol = ? AND ts >= ?
             ORDER BY ts DESC";

        let mut stmt = conn
            .prepare(if protocol.is_some() { sql_one } else { sql_all })
            .map_err(query_err)?;

        let map_row = |row: &duckdb::Row<'_>| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        };

        let raw = match protocol {
            Some(p) => stmt.query_map(params![p, cutoff], map_row),
            None => stmt.query_map(params![cutoff], map_row),
        }
        .map_err(query_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(query_err)?;

        let mut events = Vec::with_capacity(raw.len());
        for (event_type, protocol, risk_score, description, metadata, ts, received_at) in raw {
            events.push(RiskEvent {
                event_type,
                protocol,
                risk_score,
                description,
                metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
                ts: parse_ts(&ts)?,
                received_at: parse_ts(&received_at)?,
            });
        }
        Ok(events)
    }

    /// Aggregates for the periodic status broadcast: 30-day risk event
    /// rollup per protocol and 7-day daily sentiment averages.
    pub async fn protocol_stats(&self) -> StoreResult<ProtocolStats> {
        let event_cutoff = fmt_ts(Utc::now() - Duration::days(30));
        let sentiment_cutoff = fmt_ts(Utc::now() - Duration::days(7));
        let conn = self.pool.acquire().await?;

        let mut stmt = conn
            .prepare(
                "SELECT protocol, COUNT(*) AS event_count, AVG(risk_score) AS avg_risk
                 FROM risk_events
                 WHERE ts >= ?
                 GROUP BY protocol
                 ORDER BY event_count DESC",
            )
            .map_err(query_err)?;
        let protocol_events = stmt
            .query_map(params![event_cutoff], |row| {
                Ok(ProtocolEventCount {
                    protocol: row.get(0)?,
                    event_count: row.get(1)?,
                    avg_risk: row.get(2)?,
                })
            })
            .map_err(query_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_err)?;

        let mut stmt = conn
            .prepare(
                "SELECT CAST(date_trunc('day', CAST(ts AS TIMESTAMP)) AS VARCHAR) AS day,
                        AVG(score) AS avg_score
                 FROM sentiment_samples
                 WHERE ts >= ?
                 GROUP BY 1
                 ORDER BY 1 ASC",
            )
            .map_err(query_err)?;
        let sentiment_trend = stmt
            .query_map(params![sentiment_cutoff], |row| {
                Ok(DailySentiment {
                    day: row.get(0)?,
                    avg_score: row.get(1)?,
                })
            })
            .map_err(query_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_err)?;

        Ok(ProtocolStats {
            protocol_events,
            sentiment_trend,
            last_updated: Utc::now(),
        })
    }

    // ---- retention ----

    /// Delete rows older than the per-series retention windows.
    ///
    /// Purely age-predicated, so it is idempotent and safe to run while
    /// inserts are in flight.
    pub async fn cleanup(&self, policy: &RetentionPolicy) -> StoreResult<CleanupReport> {
        let now = Utc::now();
        let conn = self.pool.acquire().await?;

        let sweep = |table: &str, cutoff_days: i64| -> StoreResult<usize> {
            let cutoff = fmt_ts(now - Duration::days(cutoff_days));
            conn.execute(
                &format!("DELETE FROM {table} WHERE ts < ?"),
                params![cutoff],
            )
            .map_err(query_err)
        };

        let report = CleanupReport {
            price_rows: sweep("price_points", policy.price_days)?,
            sentiment_rows: sweep("sentiment_samples", policy.sentiment_days)?,
            tvl_rows: sweep("tvl_points", policy.tvl_days)?,
            risk_event_rows: sweep("risk_events", policy.risk_event_days)?,
        };

        debug!(
            price = report.price_rows,
            sentiment = report.sentiment_rows,
            tvl = report.tvl_rows,
            risk = report.risk_event_rows,
            "retention sweep complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn old_price(token: &str, days_ago: i64) -> PricePoint {
        let mut point = PricePoint::new(token, 100.0, 0.0, 0.0);
        point.ts = Utc::now() - Duration::days(days_ago);
        point
    }

    #[tokio::test]
    async fn price_roundtrip() {
        let store = MonitorStore::open_in_memory().await.unwrap();
        let point = PricePoint::new("ethereum", 2511.42, 1.5e9, 3.0e11);
        store.insert_price(&point).await.unwrap();

        let history = store.price_history("ethereum", 1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].token, "ethereum");
        assert_eq!(history[0].price, 2511.42);

        // Other tokens are not returned.
        assert!(store.price_history("bitcoin", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn risk_event_roundtrip_with_metadata() {
        let store = MonitorStore::open_in_memory().await.unwrap();
        let event = RiskEvent::new(
            "high_risk_alert",
            "aave",
            88.5,
            "High risk detected for aave",
            json!({"factors": [{"factor": "volatility", "impact": 0.7}]}),
        );
        store.insert_risk_event(&event).await.unwrap();

        let events = store.recent_risk_events(Some("aave"), 7).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].risk_score, 88.5);
        assert_eq!(events[0].metadata["factors"][0]["factor"], "volatility");

        assert!(store
            .recent_risk_events(Some("uniswap"), 7)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn sentiment_trend_buckets_by_hour() {
        let store = MonitorStore::open_in_memory().await.unwrap();
        for score in [0.2, 0.4] {
            let sample = SentimentSample::new("aggregated", "test", score, json!({}));
            store.insert_sentiment(&sample).await.unwrap();
        }

        let trend = store.sentiment_trend(24).await.unwrap();
        assert_eq!(trend.len(), 1);
        assert_eq!(trend[0].samples, 2);
        assert!((trend[0].avg_score - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn protocol_stats_aggregates() {
        let store = MonitorStore::open_in_memory().await.unwrap();
        for score in [80.0, 90.0] {
            let event = RiskEvent::new("high_risk_alert", "aave", score, "t", json!({}));
            store.insert_risk_event(&event).await.unwrap();
        }
        let event = RiskEvent::new("high_risk_alert", "uniswap", 75.0, "t", json!({}));
        store.insert_risk_event(&event).await.unwrap();

        let stats = store.protocol_stats().await.unwrap();
        assert_eq!(stats.protocol_events.len(), 2);
        assert_eq!(stats.protocol_events[0].protocol, "aave");
        assert_eq!(stats.protocol_events[0].event_count, 2);
        assert!((stats.protocol_events[0].avg_risk - 85.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired_rows() {
        let store = MonitorStore::open_in_memory().await.unwrap();
        store.insert_price(&old_price("ethereum", 100)).await.unwrap();
        store.insert_price(&old_price("ethereum", 1)).await.unwrap();

        let report = store.cleanup(&RetentionPolicy::default()).await.unwrap();
        assert_eq!(report.price_rows, 1);

        let remaining = store.price_history("ethereum", 365).await.unwrap();
        assert_eq!(remaining.len(), 1);

        // Idempotent: a second sweep removes nothing.
        let report = store.cleanup(&RetentionPolicy::default()).await.unwrap();
        assert_eq!(report.total(), 0);
    }

    #[tokio::test]
    async fn on_disk_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chainpulse.db");

        {
            let store = MonitorStore::open(&path, PoolConfig { size: 2 })
                .await
                .unwrap();
            store
                .insert_price(&PricePoint::new("ethereum", 1800.0, 0.0, 0.0))
                .await
                .unwrap();
            store.close();
        }

        let store = MonitorStore::open(&path, PoolConfig { size: 2 })
            .await
            .unwrap();
        let history = store.price_history("ethereum", 1).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn ping_succeeds_on_open_store() {
        let store = MonitorStore::open_in_memory().await.unwrap();
        store.ping().await.unwrap();

        store.close();
        assert!(store.ping().await.is_err());
    }
}
