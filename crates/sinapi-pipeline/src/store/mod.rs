//! Load Manager: relational persistence under explicit write policies.

use async_trait::async_trait;
use sinapi_core::{CatalogItem, ItemType, MaintenanceEvent, MonthlyFact, ReferencePeriod, StructureEdge};
use thiserror::Error;

use crate::config::SchemaMode;

#[cfg(test)]
pub(crate) mod memory;
mod postgres;
mod schema;

pub use postgres::PgStore;
pub use schema::{create_statements, drop_statements, UNIFIED_STRUCTURE_VIEW};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    InputItems,
    AssemblyItems,
    AssemblyInputEdges,
    AssemblySubassemblyEdges,
    InputPricesMonthly,
    AssemblyCostsMonthly,
    MaintenanceEvents,
}

impl Table {
    pub const ALL: [Table; 7] = [
        Table::InputItems,
        Table::AssemblyItems,
        Table::AssemblyInputEdges,
        Table::AssemblySubassemblyEdges,
        Table::InputPricesMonthly,
        Table::AssemblyCostsMonthly,
        Table::MaintenanceEvents,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::InputItems => "input_items",
            Self::AssemblyItems => "assembly_items",
            Self::AssemblyInputEdges => "assembly_input_edges",
            Self::AssemblySubassemblyEdges => "assembly_subassembly_edges",
            Self::InputPricesMonthly => "input_prices_monthly",
            Self::AssemblyCostsMonthly => "assembly_costs_monthly",
            Self::MaintenanceEvents => "maintenance_events",
        }
    }

    pub fn catalog_for(item_type: ItemType) -> Self {
        match item_type {
            ItemType::Input => Self::InputItems,
            ItemType::Assembly => Self::AssemblyItems,
        }
    }

    /// Columns carried by a save. Catalog `status` is deliberately absent: it
    /// belongs to the status synchronizer.
    pub fn staged_columns(&self) -> &'static [&'static str] {
        match self {
            Self::InputItems | Self::AssemblyItems => &["code", "description", "unit"],
            Self::AssemblyInputEdges | Self::AssemblySubassemblyEdges => {
                &["parent_code", "child_code", "coefficient"]
            }
            Self::InputPricesMonthly | Self::AssemblyCostsMonthly => {
                &["item_code", "region", "reference_date", "regime", "value"]
            }
            Self::MaintenanceEvents => &[
                "item_code",
                "item_type",
                "reference_date",
                "event_type",
                "item_description",
            ],
        }
    }

    /// Declared primary key; the Postgres store reads the live one from the
    /// catalog instead.
    pub fn primary_key(&self) -> &'static [&'static str] {
        match self {
            Self::InputItems | Self::AssemblyItems => &["code"],
            Self::AssemblyInputEdges | Self::AssemblySubassemblyEdges => &["parent_code", "child_code"],
            Self::InputPricesMonthly | Self::AssemblyCostsMonthly => {
                &["item_code", "region", "reference_date", "regime"]
            }
            Self::MaintenanceEvents => &["item_code", "item_type", "reference_date", "event_type"],
        }
    }

    pub fn has_reference_date(&self) -> bool {
        matches!(
            self,
            Self::InputPricesMonthly | Self::AssemblyCostsMonthly | Self::MaintenanceEvents
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// Insert, silently skipping rows whose key already exists.
    AppendIgnore,
    /// Insert, overwriting every staged non-key column on key conflict.
    Upsert,
    /// Delete the period's rows, then insert.
    ReplaceByPeriod(ReferencePeriod),
}

impl WritePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AppendIgnore => "append-ignore",
            Self::Upsert => "upsert",
            Self::ReplaceByPeriod(_) => "replace-by-period",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Rows<'a> {
    Catalog(&'a [CatalogItem]),
    Edges(&'a [StructureEdge]),
    Facts(&'a [MonthlyFact]),
    Maintenance(&'a [MaintenanceEvent]),
}

impl Rows<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::Catalog(rows) => rows.len(),
            Self::Edges(rows) => rows.len(),
            Self::Facts(rows) => rows.len(),
            Self::Maintenance(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fits(&self, table: Table) -> bool {
        matches!(
            (self, table),
            (Self::Catalog(_), Table::InputItems | Table::AssemblyItems)
                | (
                    Self::Edges(_),
                    Table::AssemblyInputEdges | Table::AssemblySubassemblyEdges
                )
                | (
                    Self::Facts(_),
                    Table::InputPricesMonthly | Table::AssemblyCostsMonthly
                )
                | (Self::Maintenance(_), Table::MaintenanceEvents)
        )
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error on {table}: {source}")]
    Sqlx {
        table: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("table {0} has no primary key")]
    MissingPrimaryKey(&'static str),
    #[error("foreign key violation on {table}: {detail}")]
    ForeignKey { table: &'static str, detail: String },
    #[error("row for {date} does not belong to period {period} of {table}")]
    RowOutsidePeriod {
        table: &'static str,
        period: ReferencePeriod,
        date: chrono::NaiveDate,
    },
    #[error("{policy} is not supported for {table}")]
    UnsupportedPolicy {
        table: &'static str,
        policy: &'static str,
    },
    #[error("rows of the wrong shape for {0}")]
    RowShape(&'static str),
}

impl StoreError {
    pub(crate) fn sqlx(table: &'static str, source: sqlx::Error) -> Self {
        if let Some(db) = source.as_database_error() {
            if db.code().as_deref() == Some("23503") {
                return Self::ForeignKey {
                    table,
                    detail: db.message().to_string(),
                };
            }
        }
        Self::Sqlx { table, source }
    }
}

/// Checks shared by every store before a save touches anything.
pub(crate) fn check_save(table: Table, rows: &Rows<'_>, policy: WritePolicy) -> Result<(), StoreError> {
    if !rows.fits(table) {
        return Err(StoreError::RowShape(table.name()));
    }
    if let WritePolicy::ReplaceByPeriod(period) = policy {
        let Rows::Facts(facts) = rows else {
            return Err(StoreError::UnsupportedPolicy {
                table: table.name(),
                policy: policy.as_str(),
            });
        };
        if let Some(stray) = facts.iter().find(|f| !period.contains(f.reference_date)) {
            return Err(StoreError::RowOutsidePeriod {
                table: table.name(),
                period,
                date: stray.reference_date,
            });
        }
    }
    Ok(())
}

#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Creates the schema; `Reset` drops every table and view first.
    async fn prepare_schema(&self, mode: SchemaMode) -> Result<(), StoreError>;

    /// Persists `rows` into `table` in one transaction; returns rows written.
    /// Empty input is a no-op.
    async fn save(&self, table: Table, rows: Rows<'_>, policy: WritePolicy) -> Result<u64, StoreError>;

    /// Empties the given tables in one transaction.
    async fn truncate(&self, tables: &[Table]) -> Result<(), StoreError>;

    /// Marks catalog rows DEACTIVATED when their latest maintenance event of
    /// `item_type` matches one of `keywords`; returns rows changed.
    async fn deactivate_from_events(&self, item_type: ItemType, keywords: &[String]) -> Result<u64, StoreError>;
}
