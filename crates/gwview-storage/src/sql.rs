//! Relational view store
//!
//! One table per network, `<network>_gateway_views`. Every operation runs in
//! a transaction that first makes sure the table exists. Updates load the
//! rows of the batch, merge config changes in memory and issue one upsert
//! per gateway; the upsert only overwrites a row whose stored offset is
//! lower, so a concurrent writer cannot roll a row back.

use async_trait::async_trait;
use gwview_core::config::{SqlConfig, SqlDialectKind};
use gwview_core::metrics::StorageMetrics;
use gwview_core::prelude::*;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyPool, Row, Transaction};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace};

use crate::codec::{
    decode_config_column, decode_configs, decode_record, decode_status, encode_config_column,
    merge_raw_configs, RawConfigs,
};

/// Placeholder and type conventions of the target database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Postgres,
    Sqlite,
}

impl From<SqlDialectKind> for SqlDialect {
    fn from(kind: SqlDialectKind) -> Self {
        match kind {
            SqlDialectKind::Postgres => SqlDialect::Postgres,
            SqlDialectKind::Sqlite => SqlDialect::Sqlite,
        }
    }
}

impl SqlDialect {
    /// Bind placeholder for the 1-based parameter `index`
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            SqlDialect::Postgres => format!("${}", index),
            SqlDialect::Sqlite => "?".to_string(),
        }
    }

    /// Comma-separated placeholders `start..start + count`
    pub fn placeholders(&self, start: usize, count: usize) -> String {
        (start..start + count)
            .map(|i| self.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn blob_type(&self) -> &'static str {
        match self {
            SqlDialect::Postgres => "BYTEA",
            SqlDialect::Sqlite => "BLOB",
        }
    }
}

/// Quoted per-network table name
pub fn table_name(network_id: &str) -> String {
    format!("\"{}_gateway_views\"", network_id.replace('"', "\"\""))
}

/// Builds the statements for one network's table
#[derive(Debug, Clone)]
pub struct ViewTable {
    dialect: SqlDialect,
    table: String,
}

impl ViewTable {
    pub fn new(dialect: SqlDialect, network_id: &str) -> Self {
        Self {
            dialect,
            table: table_name(network_id),
        }
    }

    pub fn create(&self) -> String {
        let blob = self.dialect.blob_type();
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             gateway_id TEXT PRIMARY KEY, \
             status {blob}, \
             record {blob}, \
             configs {blob}, \
             \"offset\" BIGINT NOT NULL DEFAULT 0)",
            self.table
        )
    }

    pub fn select_all(&self) -> String {
        format!(
            "SELECT gateway_id, status, record, configs, \"offset\" FROM {}",
            self.table
        )
    }

    pub fn select_ids(&self, count: usize) -> String {
        format!(
            "{} WHERE gateway_id IN ({})",
            self.select_all(),
            self.dialect.placeholders(1, count)
        )
    }

    pub fn delete_ids(&self, count: usize) -> String {
        format!(
            "DELETE FROM {} WHERE gateway_id IN ({})",
            self.table,
            self.dialect.placeholders(1, count)
        )
    }

    /// Insert `gateway_id`, `offset` and `columns`; on conflict overwrite
    /// them only if the stored offset is lower.
    pub fn upsert(&self, columns: &[&str]) -> String {
        let mut names = vec!["gateway_id", "\"offset\""];
        names.extend_from_slice(columns);

        let updates: Vec<String> = names[1..]
            .iter()
            .map(|c| format!("{c} = excluded.{c}"))
            .collect();

        format!(
            "INSERT INTO {table} ({names}) VALUES ({values}) \
             ON CONFLICT (gateway_id) DO UPDATE SET {updates} \
             WHERE {table}.\"offset\" < excluded.\"offset\"",
            table = self.table,
            names = names.join(", "),
            values = self.dialect.placeholders(1, names.len()),
            updates = updates.join(", "),
        )
    }
}

/// Row as stored
struct StoredRow {
    gateway_id: String,
    status: Option<Vec<u8>>,
    record: Option<Vec<u8>>,
    configs: Option<Vec<u8>>,
    offset: i64,
}

impl StoredRow {
    fn from_row(row: &AnyRow) -> Result<Self> {
        let column = |e: sqlx::Error| GatewayError::storage_with_source("Unexpected view row shape", e);
        Ok(Self {
            gateway_id: row.try_get("gateway_id").map_err(column)?,
            status: row.try_get("status").map_err(column)?,
            record: row.try_get("record").map_err(column)?,
            configs: row.try_get("configs").map_err(column)?,
            offset: row.try_get("offset").map_err(column)?,
        })
    }

    fn raw_configs(&self) -> Result<RawConfigs> {
        decode_config_column(self.configs.as_deref().unwrap_or_default())
    }

    fn into_state(self, registry: &ConfigRegistry) -> Result<GatewayState> {
        let raw = self.raw_configs()?;
        Ok(GatewayState {
            config: decode_configs(registry, &self.gateway_id, raw)?,
            status: decode_status(self.status.as_deref())?,
            record: decode_record(self.record.as_deref())?,
            offset: self.offset,
            gateway_id: self.gateway_id,
        })
    }
}

fn db_error(message: &str) -> impl Fn(sqlx::Error) -> GatewayError + '_ {
    move |e| GatewayError::storage_with_source(message, e)
}

/// View store over a SQL database
pub struct SqlStore {
    pool: AnyPool,
    dialect: SqlDialect,
    registry: Arc<ConfigRegistry>,
    metrics: StorageMetrics,
}

impl SqlStore {
    pub fn new(pool: AnyPool, dialect: SqlDialect, registry: Arc<ConfigRegistry>) -> Self {
        Self {
            pool,
            dialect,
            registry,
            metrics: StorageMetrics::new("sql"),
        }
    }

    /// Open a pool for `config`
    pub async fn connect(config: &SqlConfig, registry: Arc<ConfigRegistry>) -> Result<Self> {
        sqlx::any::install_default_drivers();

        let dialect = SqlDialect::from(config.dialect);
        let mut options = AnyPoolOptions::new().max_connections(config.max_connections);
        if dialect == SqlDialect::Sqlite {
            // One writer; an in-memory database also lives only as long as its connection
            options = options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = options
            .connect(&config.url)
            .await
            .map_err(db_error("Failed to connect to database"))?;

        info!(dialect = ?dialect, "Connected to view database");
        Ok(Self::new(pool, dialect, registry))
    }

    async fn begin(&self, table: &ViewTable) -> Result<Transaction<'static, Any>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))?;
        sqlx::query(&table.create())
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to create view table"))?;
        Ok(tx)
    }

    async fn load_rows(
        tx: &mut Transaction<'static, Any>,
        table: &ViewTable,
        gateway_ids: &[String],
    ) -> Result<Vec<StoredRow>> {
        if gateway_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = table.select_ids(gateway_ids.len());
        let mut query = sqlx::query(&sql);
        for id in gateway_ids {
            query = query.bind(id.as_str());
        }
        let rows = query
            .fetch_all(&mut **tx)
            .await
            .map_err(db_error("Failed to load views"))?;
        rows.iter().map(StoredRow::from_row).collect()
    }

    fn views_from_rows(&self, rows: Vec<StoredRow>) -> Result<ViewMap> {
        rows.into_iter()
            .map(|row| {
                let state = row.into_state(&self.registry)?;
                Ok((state.gateway_id.clone(), state))
            })
            .collect()
    }
}

#[async_trait]
impl HealthCheck for SqlStore {
    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_error("Database unreachable"))?;
        Ok(())
    }

    fn component_name(&self) -> &'static str {
        "sql_store"
    }
}

#[async_trait]
impl ViewStore for SqlStore {
    async fn get_views_for_network(&self, network_id: &str) -> Result<ViewMap> {
        let start = Instant::now();
        let table = ViewTable::new(self.dialect, network_id);
        let mut tx = self.begin(&table).await?;

        let rows = sqlx::query(&table.select_all())
            .fetch_all(&mut *tx)
            .await
            .map_err(db_error("Failed to load views"))?;
        let rows = rows
            .iter()
            .map(StoredRow::from_row)
            .collect::<Result<Vec<_>>>()?;
        tx.commit().await.map_err(db_error("Failed to commit"))?;

        self.metrics.record_latency("get_views_for_network", start.elapsed());
        self.views_from_rows(rows)
    }

    async fn get_views(&self, network_id: &str, gateway_ids: &[String]) -> Result<ViewMap> {
        let start = Instant::now();
        let table = ViewTable::new(self.dialect, network_id);
        let mut tx = self.begin(&table).await?;

        let rows = Self::load_rows(&mut tx, &table, gateway_ids).await?;
        tx.commit().await.map_err(db_error("Failed to commit"))?;

        self.metrics.record_latency("get_views", start.elapsed());
        self.views_from_rows(rows)
    }

    async fn update_or_create(
        &self,
        network_id: &str,
        updates: BTreeMap<String, GatewayUpdateParams>,
    ) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let table = ViewTable::new(self.dialect, network_id);
        let mut tx = self.begin(&table).await?;

        let ids: Vec<String> = updates.keys().cloned().collect();
        let existing: HashMap<String, StoredRow> = Self::load_rows(&mut tx, &table, &ids)
            .await?
            .into_iter()
            .map(|row| (row.gateway_id.clone(), row))
            .collect();

        let mut stale = 0u64;
        for (gateway_id, params) in &updates {
            let stored = existing.get(gateway_id);
            if stored.is_some_and(|row| params.offset <= row.offset) {
                stale += 1;
                continue;
            }

            let mut columns: Vec<&str> = Vec::new();
            let mut values: Vec<Vec<u8>> = Vec::new();

            if let Some(ref status) = params.new_status {
                columns.push("status");
                values.push(status.to_bytes()?);
            }
            if let Some(ref record) = params.new_record {
                columns.push("record");
                values.push(record.to_bytes()?);
            }
            if params.touches_configs() {
                let mut configs = match stored {
                    Some(row) => row.raw_configs()?,
                    None => RawConfigs::new(),
                };
                merge_raw_configs(&self.registry, &mut configs, params)?;
                columns.push("configs");
                values.push(encode_config_column(&configs)?);
            }

            let sql = table.upsert(&columns);
            let mut query = sqlx::query(&sql)
                .bind(gateway_id.as_str())
                .bind(params.offset);
            for value in values {
                query = query.bind(value);
            }
            let result = query
                .execute(&mut *tx)
                .await
                .map_err(db_error("Failed to upsert view"))?;

            if result.rows_affected() == 0 {
                stale += 1;
            }
            trace!(network_id, gateway_id = %gateway_id, offset = params.offset, "Upserted view");
        }

        tx.commit().await.map_err(db_error("Failed to commit"))?;

        if stale > 0 {
            debug!(network_id, stale, "Rejected stale updates");
            self.metrics.record_stale(stale);
        }
        self.metrics.record_latency("update_or_create", start.elapsed());
        Ok(())
    }

    async fn delete(&self, network_id: &str, gateway_ids: &[String]) -> Result<()> {
        if gateway_ids.is_empty() {
            return Ok(());
        }
        let table = ViewTable::new(self.dialect, network_id);
        let mut tx = self.begin(&table).await?;

        let sql = table.delete_ids(gateway_ids.len());
        let mut query = sqlx::query(&sql);
        for id in gateway_ids {
            query = query.bind(id.as_str());
        }
        query
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to delete views"))?;

        tx.commit().await.map_err(db_error("Failed to commit"))?;
        Ok(())
    }

    /// Tables are created per network on first use
    async fn init_tables(&self) -> Result<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sql"
    }
}
