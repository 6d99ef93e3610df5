use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use scrip_core::{ExtractionRecord, CANONICAL_DATE_FORMAT};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use tracing::{debug, info};

use super::{Sink, SinkError, WriteReceipt};
use crate::config::{validate_table_name, MySqlCredentials};

pub fn upsert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table} (subject, category, as_of_date, month_label, payload, image, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON DUPLICATE KEY UPDATE \
         as_of_date = VALUES(as_of_date), \
         month_label = VALUES(month_label), \
         payload = VALUES(payload), \
         image = VALUES(image), \
         updated_at = VALUES(updated_at)"
    )
}

pub fn create_table_sql(table: &str) -> String {
    format!(
        r#"CREATE TABLE IF NOT EXISTS {table} (
    id BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY,
    subject VARCHAR(64) NOT NULL,
    category VARCHAR(32) NOT NULL,
    as_of_date VARCHAR(10) NOT NULL,
    month_label VARCHAR(16) NOT NULL,
    payload JSON NOT NULL,
    image LONGBLOB NULL,
    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at DATETIME NOT NULL,
    UNIQUE KEY uq_{table}_subject_category (subject, category)
)"#
    )
}

/// English month name of a canonical date, `Unknown` otherwise.
pub fn month_label(as_of_date: &str) -> String {
    NaiveDate::parse_from_str(as_of_date, CANONICAL_DATE_FORMAT)
        .map(|d| d.format("%B").to_string())
        .unwrap_or_else(|_| "Unknown".to_string())
}

pub struct MySqlSink {
    pool: MySqlPool,
    table: String,
    upsert: String,
}

impl MySqlSink {
    /// Builds a lazy pool; nothing connects until [`Sink::probe`] or the first write.
    pub fn connect(credentials: &MySqlCredentials, table: &str, max_connections: u32) -> Result<Self, SinkError> {
        validate_table_name(table).map_err(|e| SinkError::Unavailable(e.to_string()))?;
        let options = match credentials {
            MySqlCredentials::Url(url) => url.parse::<MySqlConnectOptions>()?,
            MySqlCredentials::Parts {
                host,
                port,
                user,
                password,
                database,
            } => MySqlConnectOptions::new()
                .host(host)
                .port(*port)
                .username(user)
                .password(password)
                .database(database),
        };
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect_lazy_with(options);
        Ok(Self::with_pool(pool, table))
    }

    pub fn with_pool(pool: MySqlPool, table: &str) -> Self {
        Self {
            pool,
            table: table.to_string(),
            upsert: upsert_sql(table),
        }
    }

    pub async fn ensure_table(&self) -> Result<(), SinkError> {
        sqlx::query(&create_table_sql(&self.table))
            .execute(&self.pool)
            .await?;
        info!(table = %self.table, "table ready");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Sink for MySqlSink {
    fn describe(&self) -> String {
        format!("mysql:{}", self.table)
    }

    async fn probe(&self) -> Result<(), SinkError> {
        let database: Option<String> = sqlx::query_scalar("SELECT DATABASE()")
            .fetch_one(&self.pool)
            .await?;
        debug!(database = database.as_deref().unwrap_or("<none>"), "mysql probe ok");
        Ok(())
    }

    async fn upsert_batch(&self, records: &[ExtractionRecord]) -> Result<WriteReceipt, SinkError> {
        let updated_at = Utc::now().naive_utc();
        let mut tx = self.pool.begin().await?;
        for record in records {
            let payload = serde_json::to_string(&record.values)
                .map_err(|e| SinkError::Unavailable(format!("encoding payload: {e}")))?;
            sqlx::query(&self.upsert)
                .bind(&record.subject_key)
                .bind(&record.category)
                .bind(&record.as_of_date)
                .bind(month_label(&record.as_of_date))
                .bind(payload)
                .bind(record.image.as_deref())
                .bind(updated_at)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", self.table))
            .fetch_one(&self.pool)
            .await?;
        info!(table = %self.table, batch = records.len(), total_rows = total, "mysql write confirmed");
        Ok(WriteReceipt {
            rows_written: records.len(),
        })
    }
}
