use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::str::FromStr;

use crate::mqtt::Metric;

/// Nullable metric columns added after the ledger's first release. Missing
/// ones are added in place by `migrate`; rows are never dropped or rewritten.
const ADDITIVE_COLUMNS: &[(&str, &str)] = &[("temperature", "REAL"), ("humidity", "REAL")];

/// Append-only readings ledger.
#[derive(Clone)]
pub struct Ledger {
    pool: Pool<Sqlite>,
}

/// Latest non-null value per (zone, metric), as seen by the control rules.
pub type ZoneLatest = HashMap<(String, Metric), f64>;

impl Ledger {
    /// db_url examples:
    /// - "sqlite:temperatures.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // One connection: every insert and query is serialized through it.
        // It is never recycled, so an in-memory database lives as long as the pool.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Create the readings table, then add any metric column an older
    /// database is missing.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS readings (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              zone TEXT NOT NULL,
              temperature REAL,
              humidity REAL,
              timestamp TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create readings table")?;

        let columns: Vec<String> = sqlx::query("PRAGMA table_info(readings)")
            .fetch_all(&self.pool)
            .await
            .context("failed to inspect readings table")?
            .iter()
            .map(|row| row.get::<String, _>("name"))
            .collect();

        for (name, ty) in ADDITIVE_COLUMNS {
            if columns.iter().any(|c| c == name) {
                continue;
            }
            sqlx::query(&format!("ALTER TABLE readings ADD COLUMN {name} {ty}"))
                .execute(&self.pool)
                .await
                .with_context(|| format!("failed to add column readings.{name}"))?;
            tracing::info!(column = name, "ledger migrated: added column");
        }

        Ok(())
    }

    // ----------------------------
    // Readings
    // ----------------------------

    /// Append one row and return its id.
    pub async fn insert(
        &self,
        zone: &str,
        temperature: Option<f64>,
        humidity: Option<f64>,
        timestamp: &str,
    ) -> Result<i64> {
        let id = sqlx::query(
            r#"
            INSERT INTO readings (zone, temperature, humidity, timestamp)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(zone)
        .bind(temperature)
        .bind(humidity)
        .bind(timestamp)
        .execute(&self.pool)
        .await
        .with_context(|| format!("insert reading failed zone={zone}"))?
        .last_insert_rowid();
        Ok(id)
    }

    /// Most recent non-null value of `metric` for `zone`, by insertion order.
    pub async fn last_value(&self, zone: &str, metric: Metric) -> Result<Option<f64>> {
        let sql = match metric {
            Metric::Temperature => {
                "SELECT temperature AS v FROM readings \
                 WHERE zone = ? AND temperature IS NOT NULL ORDER BY id DESC LIMIT 1"
            }
            Metric::Humidity => {
                "SELECT humidity AS v FROM readings \
                 WHERE zone = ? AND humidity IS NOT NULL ORDER BY id DESC LIMIT 1"
            }
        };
        let row = sqlx::query(sql)
            .bind(zone)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("last_value failed zone={zone} metric={metric}"))?;
        Ok(row.map(|r| r.get::<f64, _>("v")))
    }

    /// Snapshot of the latest values for every (zone, metric) pair that has one.
    pub async fn latest(&self, zones: &[String]) -> Result<ZoneLatest> {
        let mut out = ZoneLatest::new();
        for zone in zones {
            for metric in [Metric::Temperature, Metric::Humidity] {
                if let Some(v) = self.last_value(zone, metric).await? {
                    out.insert((zone.clone(), metric), v);
                }
            }
        }
        Ok(out)
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM readings")
            .fetch_one(&self.pool)
            .await
            .context("count readings failed")?;
        Ok(row.get::<i64, _>("n"))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
