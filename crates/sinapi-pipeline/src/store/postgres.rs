use async_trait::async_trait;
use sinapi_core::ItemType;
use sqlx::postgres::{PgPoolOptions, Postgres};
use sqlx::{PgConnection, PgPool, QueryBuilder};
use tracing::{debug, info};

use super::schema::{create_statements, drop_statements};
use super::{check_save, RelationalStore, Rows, StoreError, Table, WritePolicy};
use crate::config::{DbConfig, SchemaMode};

/// Rows per multi-VALUES insert into a staging table; keeps the bind count
/// well under the protocol's 65535 limit.
const STAGING_CHUNK: usize = 1000;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(db: &DbConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_with(db.connect_options())
            .await
            .map_err(|e| StoreError::sqlx("connection", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Live primary key of `table`, in index order.
async fn primary_key(conn: &mut PgConnection, table: &'static str) -> Result<Vec<String>, StoreError> {
    let columns: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT a.attname::text
          FROM pg_index i
          JOIN pg_attribute a
            ON a.attrelid = i.indrelid
           AND a.attnum = ANY(i.indkey)
         WHERE i.indrelid = $1::regclass
           AND i.indisprimary
         ORDER BY array_position(i.indkey::int2[], a.attnum)
        "#,
    )
    .bind(table)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| StoreError::sqlx(table, e))?;

    if columns.is_empty() {
        return Err(StoreError::MissingPrimaryKey(table));
    }
    Ok(columns)
}

fn staging_insert(staging: &str, table: Table) -> QueryBuilder<'static, Postgres> {
    QueryBuilder::new(format!(
        "INSERT INTO {staging} ({}) ",
        table.staged_columns().join(", ")
    ))
}

async fn stage_rows(
    conn: &mut PgConnection,
    staging: &str,
    table: Table,
    rows: Rows<'_>,
) -> Result<(), StoreError> {
    let err = |e| StoreError::sqlx(table.name(), e);
    match rows {
        Rows::Catalog(items) => {
            for chunk in items.chunks(STAGING_CHUNK) {
                let mut qb = staging_insert(staging, table);
                qb.push_values(chunk, |mut b, item| {
                    b.push_bind(item.code)
                        .push_bind(item.description.clone())
                        .push_bind(item.unit.clone());
                });
                qb.build().execute(&mut *conn).await.map_err(err)?;
            }
        }
        Rows::Edges(edges) => {
            for chunk in edges.chunks(STAGING_CHUNK) {
                let mut qb = staging_insert(staging, table);
                qb.push_values(chunk, |mut b, edge| {
                    b.push_bind(edge.parent_code)
                        .push_bind(edge.child_code)
                        .push_bind(edge.coefficient);
                });
                qb.build().execute(&mut *conn).await.map_err(err)?;
            }
        }
        Rows::Facts(facts) => {
            for chunk in facts.chunks(STAGING_CHUNK) {
                let mut qb = staging_insert(staging, table);
                qb.push_values(chunk, |mut b, fact| {
                    b.push_bind(fact.item_code)
                        .push_bind(fact.region.clone())
                        .push_bind(fact.reference_date)
                        .push_bind(fact.regime.as_str())
                        .push_bind(fact.value);
                });
                qb.build().execute(&mut *conn).await.map_err(err)?;
            }
        }
        Rows::Maintenance(events) => {
            for chunk in events.chunks(STAGING_CHUNK) {
                let mut qb = staging_insert(staging, table);
                qb.push_values(chunk, |mut b, event| {
                    b.push_bind(event.item_code)
                        .push_bind(event.item_type.as_str())
                        .push_bind(event.reference_date)
                        .push_bind(event.event_type.clone())
                        .push_bind(event.item_description.clone());
                });
                qb.build().execute(&mut *conn).await.map_err(err)?;
            }
        }
    }
    Ok(())
}

/// `ON CONFLICT` clause for `policy` given the table's live key.
fn conflict_clause(table: Table, key: &[String], policy: WritePolicy) -> String {
    let target = key.join(", ");
    if policy == WritePolicy::Upsert {
        let updates: Vec<String> = table
            .staged_columns()
            .iter()
            .filter(|c| !key.iter().any(|k| k.as_str() == **c))
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect();
        // A table made only of key columns has nothing to update.
        if !updates.is_empty() {
            return format!("ON CONFLICT ({target}) DO UPDATE SET {}", updates.join(", "));
        }
    }
    format!("ON CONFLICT ({target}) DO NOTHING")
}

#[async_trait]
impl RelationalStore for PgStore {
    async fn prepare_schema(&self, mode: SchemaMode) -> Result<(), StoreError> {
        let err = |e| StoreError::sqlx("schema", e);
        let mut tx = self.pool.begin().await.map_err(err)?;
        for statement in drop_statements(mode).iter().chain(create_statements(mode).iter()) {
            sqlx::query(statement).execute(&mut *tx).await.map_err(err)?;
        }
        tx.commit().await.map_err(err)?;
        info!(mode = mode.as_str(), "database schema ready");
        Ok(())
    }

    async fn save(&self, table: Table, rows: Rows<'_>, policy: WritePolicy) -> Result<u64, StoreError> {
        check_save(table, &rows, policy)?;
        let name = table.name();
        if rows.is_empty() {
            info!(table = name, policy = policy.as_str(), "no rows to save");
            return Ok(0);
        }
        let err = |e| StoreError::sqlx(name, e);

        let mut tx = self.pool.begin().await.map_err(err)?;
        let key = primary_key(&mut tx, name).await?;

        let staging = format!("staging_{name}");
        sqlx::query(&format!(
            "CREATE TEMP TABLE {staging} (LIKE {name} INCLUDING DEFAULTS) ON COMMIT DROP"
        ))
        .execute(&mut *tx)
        .await
        .map_err(err)?;
        stage_rows(&mut tx, &staging, table, rows).await?;
        debug!(table = name, staged = rows.len(), "rows staged");

        if let WritePolicy::ReplaceByPeriod(period) = policy {
            let deleted = sqlx::query(&format!(
                "DELETE FROM {name} WHERE to_char(reference_date, 'YYYY-MM') = $1"
            ))
            .bind(period.bucket_key())
            .execute(&mut *tx)
            .await
            .map_err(err)?
            .rows_affected();
            info!(table = name, %period, deleted, "period cleared before insert");
        }

        let columns = table.staged_columns().join(", ");
        let target = key.join(", ");
        // DISTINCT ON keeps a single row per key so DO UPDATE never touches a
        // row twice in one statement.
        let written = sqlx::query(&format!(
            "INSERT INTO {name} ({columns}) \
             SELECT DISTINCT ON ({target}) {columns} FROM {staging} ORDER BY {target} \
             {}",
            conflict_clause(table, &key, policy)
        ))
        .execute(&mut *tx)
        .await
        .map_err(err)?
        .rows_affected();

        tx.commit().await.map_err(err)?;
        info!(
            table = name,
            policy = policy.as_str(),
            rows = rows.len(),
            written,
            "rows saved"
        );
        Ok(written)
    }

    async fn truncate(&self, tables: &[Table]) -> Result<(), StoreError> {
        if tables.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = tables.iter().map(Table::name).collect();
        let err = |e| StoreError::sqlx("truncate", e);
        let mut tx = self.pool.begin().await.map_err(err)?;
        sqlx::query(&format!("TRUNCATE TABLE {}", names.join(", ")))
            .execute(&mut *tx)
            .await
            .map_err(err)?;
        tx.commit().await.map_err(err)?;
        info!(tables = ?names, "tables truncated");
        Ok(())
    }

    async fn deactivate_from_events(&self, item_type: ItemType, keywords: &[String]) -> Result<u64, StoreError> {
        let table = Table::catalog_for(item_type).name();
        if keywords.is_empty() {
            return Ok(0);
        }
        let patterns: Vec<String> = keywords.iter().map(|k| contains_pattern(k)).collect();
        let err = |e| StoreError::sqlx(table, e);

        let mut tx = self.pool.begin().await.map_err(err)?;
        let changed = sqlx::query(&format!(
            r#"
            WITH latest AS (
                SELECT DISTINCT ON (item_code) item_code, event_type
                  FROM maintenance_events
                 WHERE item_type = $1
                 ORDER BY item_code, reference_date DESC,
                          (event_type ILIKE ANY($2)) DESC, event_type
            )
            UPDATE {table} t
               SET status = 'DEACTIVATED'
              FROM latest
             WHERE t.code = latest.item_code
               AND latest.event_type ILIKE ANY($2)
               AND t.status <> 'DEACTIVATED'
            "#
        ))
        .bind(item_type.as_str())
        .bind(&patterns)
        .execute(&mut *tx)
        .await
        .map_err(err)?
        .rows_affected();
        tx.commit().await.map_err(err)?;

        info!(table, item_type = item_type.as_str(), changed, "catalog status synchronized");
        Ok(changed)
    }
}

/// `ILIKE` pattern matching `keyword` as a literal substring; backslash is the
/// default escape character.
fn contains_pattern(keyword: &str) -> String {
    let mut pattern = String::with_capacity(keyword.len() + 2);
    pattern.push('%');
    for c in keyword.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}
