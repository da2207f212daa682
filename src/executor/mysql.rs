//! MySQL/MariaDB Executor
//!
//! The real driver implementation behind the `Executor`/`Connector` traits,
//! built on sqlx connection pools.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySqlPool, Row};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::EndpointConfig;
use crate::error::{classify_connect_error, Error, Result};
use crate::executor::{statement_preview, Connector, Executor, SqlRow, SqlValue};
use crate::schema;

/// Executor bound to one MariaDB endpoint
pub struct MySqlExecutor {
    pool: MySqlPool,
}

impl MySqlExecutor {
    fn decode_row(row: &sqlx::mysql::MySqlRow) -> SqlRow {
        let mut values = Vec::with_capacity(row.len());
        for index in 0..row.len() {
            let value = if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
                v.map(SqlValue::Int).unwrap_or(SqlValue::Null)
            } else if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
                v.map(SqlValue::Real).unwrap_or(SqlValue::Null)
            } else if let Ok(v) = row.try_get::<Option<String>, _>(index) {
                v.map(SqlValue::Text).unwrap_or(SqlValue::Null)
            } else if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
                v.map(SqlValue::Bytes).unwrap_or(SqlValue::Null)
            } else {
                SqlValue::Null
            };
            values.push(value);
        }
        values
    }
}

#[async_trait]
impl Executor for MySqlExecutor {
    async fn ping(&self) -> Result<()> {
        let result: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        if result.0 == 1 {
            Ok(())
        } else {
            Err(Error::Internal("SELECT 1 returned an unexpected value".into()))
        }
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        let result = sqlx::query(sql).execute(&self.pool).await.map_err(|e| {
            Error::QueryExecution(format!(
                "Failed to execute '{}...': {}",
                statement_preview(sql),
                e
            ))
        })?;
        Ok(result.rows_affected())
    }

    async fn execute_transaction(&self, statements: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for sql in statements {
            if sql.is_empty() {
                continue;
            }
            sqlx::query(sql).execute(&mut *tx).await.map_err(|e| {
                Error::QueryExecution(format!(
                    "Transaction failed on '{}...': {}",
                    statement_preview(sql),
                    e
                ))
            })?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn fetch_rows(&self, sql: &str) -> Result<Vec<SqlRow>> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await.map_err(|e| {
            Error::QueryExecution(format!(
                "Failed to fetch '{}...': {}",
                statement_preview(sql),
                e
            ))
        })?;
        Ok(rows.iter().map(Self::decode_row).collect())
    }

    async fn now_epoch(&self) -> Result<i64> {
        let now: i64 = sqlx::query_scalar("SELECT UNIX_TIMESTAMP()")
            .fetch_one(&self.pool)
            .await?;
        Ok(now)
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar(&format!(
            "SELECT meta_value FROM {} WHERE meta_key = ?",
            schema::BASE_TABLE
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn put_meta(&self, key: &str, value: &str, modified_date: i64) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (meta_key, meta_value, modified_date) VALUES (?, ?, ?) \
             ON DUPLICATE KEY UPDATE meta_value = VALUES(meta_value), \
             modified_date = VALUES(modified_date)",
            schema::BASE_TABLE
        ))
        .bind(key)
        .bind(value)
        .bind(modified_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn source_timestamp(&self, source: &str) -> Result<Option<i64>> {
        let ts: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT MAX(modified_date) FROM {} WHERE source = ?",
            schema::UPDATED_TABLE
        ))
        .bind(source)
        .fetch_one(&self.pool)
        .await?;
        Ok(ts)
    }

    async fn stamp_source(&self, host_id: &str, source: &str, modified_date: i64) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (host_id, source, modified_date) VALUES (?, ?, ?) \
             ON DUPLICATE KEY UPDATE modified_date = VALUES(modified_date)",
            schema::UPDATED_TABLE
        ))
        .bind(host_id)
        .bind(source)
        .bind(modified_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn table_timestamp(
        &self,
        table: &str,
        host_column: Option<(&str, &str)>,
    ) -> Result<Option<i64>> {
        let ts: Option<i64> = match host_column {
            Some((column, host)) => {
                sqlx::query_scalar(&format!(
                    "SELECT MAX(modified_date) FROM `{}` WHERE `{}` = ?",
                    table, column
                ))
                .bind(host)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar(&format!("SELECT MAX(modified_date) FROM `{}`", table))
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(ts)
    }

    async fn has_table(&self, table: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_name = ?",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Opens real MariaDB connections
pub struct MySqlConnector {
    connect_timeout: Duration,
    pool_size: u32,
}

impl MySqlConnector {
    pub fn new(connect_timeout: Duration, pool_size: u32) -> Self {
        Self {
            connect_timeout,
            pool_size,
        }
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn reachable(&self, host: &str, port: u16, deadline: Duration) -> bool {
        matches!(
            timeout(deadline, TcpStream::connect((host, port))).await,
            Ok(Ok(_))
        )
    }

    async fn open(&self, endpoint: &EndpointConfig) -> Result<Arc<dyn Executor>> {
        let pool = MySqlPoolOptions::new()
            .max_connections(self.pool_size)
            .acquire_timeout(self.connect_timeout)
            .connect(&endpoint.database_url())
            .await
            .map_err(|e| {
                let detail = e.to_string();
                Error::Connect {
                    endpoint: endpoint.id.clone(),
                    failure: classify_connect_error(&detail),
                    detail,
                }
            })?;

        Ok(Arc::new(MySqlExecutor { pool }))
    }
}
