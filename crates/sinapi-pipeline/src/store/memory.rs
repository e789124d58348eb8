//! In-process store with the same policy and key semantics as `PgStore`.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use sinapi_core::{CatalogItem, ItemStatus, ItemType, MaintenanceEvent, MonthlyFact, StructureEdge};

use super::{check_save, RelationalStore, Rows, StoreError, Table, WritePolicy};
use crate::config::SchemaMode;
use crate::status::derive_deactivated;

type FactKey = (i32, String, NaiveDate, &'static str);
type EventKey = (i32, &'static str, NaiveDate, String);

#[derive(Debug, Clone, Default)]
struct State {
    inputs: BTreeMap<i32, CatalogItem>,
    assemblies: BTreeMap<i32, CatalogItem>,
    input_edges: BTreeMap<(i32, i32), StructureEdge>,
    subassembly_edges: BTreeMap<(i32, i32), StructureEdge>,
    input_prices: BTreeMap<FactKey, MonthlyFact>,
    assembly_costs: BTreeMap<FactKey, MonthlyFact>,
    maintenance: BTreeMap<EventKey, MaintenanceEvent>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    operations: Mutex<Vec<String>>,
    fail_on: Option<Table>,
}

fn fact_key(fact: &MonthlyFact) -> FactKey {
    (
        fact.item_code,
        fact.region.clone(),
        fact.reference_date,
        fact.regime.as_str(),
    )
}

/// Applies `policy` to one keyed relation; returns rows written.
fn write<K: Ord, V: Clone>(
    target: &mut BTreeMap<K, V>,
    rows: impl IntoIterator<Item = (K, V)>,
    policy: WritePolicy,
    merge: impl Fn(&mut V, &V),
) -> u64 {
    let mut written = 0;
    for (key, row) in rows {
        match target.get_mut(&key) {
            Some(existing) if policy == WritePolicy::Upsert => {
                merge(existing, &row);
                written += 1;
            }
            Some(_) => {}
            None => {
                target.insert(key, row);
                written += 1;
            }
        }
    }
    written
}

fn overwrite<V: Clone>(existing: &mut V, incoming: &V) {
    *existing = incoming.clone();
}

impl MemoryStore {
    /// A store whose every save into `table` fails like a dropped connection.
    pub fn failing_on(table: Table) -> Self {
        Self {
            fail_on: Some(table),
            ..Self::default()
        }
    }

    fn record(&self, operation: String) {
        if let Ok(mut ops) = self.operations.lock() {
            ops.push(operation);
        }
    }

    fn state(&self) -> State {
        self.state.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn operations(&self) -> Vec<String> {
        self.operations.lock().map(|o| o.clone()).unwrap_or_default()
    }

    pub fn catalog(&self, item_type: ItemType) -> Vec<CatalogItem> {
        let state = self.state();
        let catalog = match item_type {
            ItemType::Input => state.inputs,
            ItemType::Assembly => state.assemblies,
        };
        catalog.into_values().collect()
    }

    pub fn edges(&self, table: Table) -> Vec<StructureEdge> {
        let state = self.state();
        match table {
            Table::AssemblySubassemblyEdges => state.subassembly_edges.into_values().collect(),
            _ => state.input_edges.into_values().collect(),
        }
    }

    pub fn facts(&self, table: Table) -> Vec<MonthlyFact> {
        let state = self.state();
        match table {
            Table::AssemblyCostsMonthly => state.assembly_costs.into_values().collect(),
            _ => state.input_prices.into_values().collect(),
        }
    }

    pub fn maintenance(&self) -> Vec<MaintenanceEvent> {
        self.state().maintenance.into_values().collect()
    }

    fn apply(state: &mut State, table: Table, rows: Rows<'_>, policy: WritePolicy) -> Result<u64, StoreError> {
        let name = table.name();
        let foreign_key = |detail: String| StoreError::ForeignKey { table: name, detail };

        match (table, rows) {
            (Table::InputItems | Table::AssemblyItems, Rows::Catalog(items)) => {
                let target = if table == Table::InputItems {
                    &mut state.inputs
                } else {
                    &mut state.assemblies
                };
                let rows = items.iter().map(|item| {
                    (
                        item.code,
                        CatalogItem {
                            status: ItemStatus::Active,
                            ..item.clone()
                        },
                    )
                });
                Ok(write(target, rows, policy, |existing, incoming| {
                    existing.description = incoming.description.clone();
                    existing.unit = incoming.unit.clone();
                }))
            }
            (Table::AssemblyInputEdges | Table::AssemblySubassemblyEdges, Rows::Edges(edges)) => {
                let subassembly = table == Table::AssemblySubassemblyEdges;
                for edge in edges {
                    if !state.assemblies.contains_key(&edge.parent_code) {
                        return Err(foreign_key(format!("parent_code {} not in assembly_items", edge.parent_code)));
                    }
                    let child_known = if subassembly {
                        state.assemblies.contains_key(&edge.child_code)
                    } else {
                        state.inputs.contains_key(&edge.child_code)
                    };
                    if !child_known {
                        return Err(foreign_key(format!("child_code {} not in catalog", edge.child_code)));
                    }
                }
                let target = if subassembly {
                    &mut state.subassembly_edges
                } else {
                    &mut state.input_edges
                };
                let rows = edges.iter().map(|e| ((e.parent_code, e.child_code), e.clone()));
                Ok(write(target, rows, policy, overwrite))
            }
            (Table::InputPricesMonthly | Table::AssemblyCostsMonthly, Rows::Facts(facts)) => {
                let prices = table == Table::InputPricesMonthly;
                let catalog = if prices { &state.inputs } else { &state.assemblies };
                if let Some(orphan) = facts.iter().find(|f| !catalog.contains_key(&f.item_code)) {
                    return Err(foreign_key(format!("item_code {} not in catalog", orphan.item_code)));
                }
                let target = if prices {
                    &mut state.input_prices
                } else {
                    &mut state.assembly_costs
                };
                if let WritePolicy::ReplaceByPeriod(period) = policy {
                    target.retain(|key, _| !period.contains(key.2));
                }
                let rows = facts.iter().map(|f| (fact_key(f), f.clone()));
                Ok(write(target, rows, policy, overwrite))
            }
            (Table::MaintenanceEvents, Rows::Maintenance(events)) => {
                let rows = events.iter().map(|e| {
                    (
                        (
                            e.item_code,
                            e.item_type.as_str(),
                            e.reference_date,
                            e.event_type.clone(),
                        ),
                        e.clone(),
                    )
                });
                Ok(write(&mut state.maintenance, rows, policy, overwrite))
            }
            _ => Err(StoreError::RowShape(name)),
        }
    }
}

#[async_trait]
impl RelationalStore for MemoryStore {
    async fn prepare_schema(&self, mode: SchemaMode) -> Result<(), StoreError> {
        if mode == SchemaMode::Reset {
            if let Ok(mut state) = self.state.lock() {
                *state = State::default();
            }
        }
        self.record(format!("prepare_schema {}", mode.as_str()));
        Ok(())
    }

    async fn save(&self, table: Table, rows: Rows<'_>, policy: WritePolicy) -> Result<u64, StoreError> {
        check_save(table, &rows, policy)?;
        if rows.is_empty() {
            return Ok(0);
        }
        if self.fail_on == Some(table) {
            return Err(StoreError::Sqlx {
                table: table.name(),
                source: sqlx::Error::PoolClosed,
            });
        }
        let mut guard = self.state.lock().map_err(|_| StoreError::Sqlx {
            table: table.name(),
            source: sqlx::Error::PoolClosed,
        })?;
        // Work on a copy so a failed save leaves nothing behind.
        let mut staged = guard.clone();
        let written = Self::apply(&mut staged, table, rows, policy)?;
        *guard = staged;
        drop(guard);

        self.record(format!("save {} {}", table.name(), policy.as_str()));
        Ok(written)
    }

    async fn truncate(&self, tables: &[Table]) -> Result<(), StoreError> {
        if let Ok(mut state) = self.state.lock() {
            for table in tables {
                match table {
                    Table::InputItems => state.inputs.clear(),
                    Table::AssemblyItems => state.assemblies.clear(),
                    Table::AssemblyInputEdges => state.input_edges.clear(),
                    Table::AssemblySubassemblyEdges => state.subassembly_edges.clear(),
                    Table::InputPricesMonthly => state.input_prices.clear(),
                    Table::AssemblyCostsMonthly => state.assembly_costs.clear(),
                    Table::MaintenanceEvents => state.maintenance.clear(),
                }
            }
        }
        let names: Vec<&str> = tables.iter().map(Table::name).collect();
        self.record(format!("truncate {}", names.join(",")));
        Ok(())
    }

    async fn deactivate_from_events(&self, item_type: ItemType, keywords: &[String]) -> Result<u64, StoreError> {
        let mut changed = 0;
        if let Ok(mut state) = self.state.lock() {
            let codes = derive_deactivated(state.maintenance.values(), item_type, keywords);
            let catalog = match item_type {
                ItemType::Input => &mut state.inputs,
                ItemType::Assembly => &mut state.assemblies,
            };
            for code in codes {
                if let Some(item) = catalog.get_mut(&code) {
                    if item.status != ItemStatus::Deactivated {
                        item.status = ItemStatus::Deactivated;
                        changed += 1;
                    }
                }
            }
        }
        self.record(format!("deactivate {}", item_type.as_str()));
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use sinapi_core::{ReferencePeriod, Regime};

    fn fact(code: i32, month: u32, value: i64) -> MonthlyFact {
        MonthlyFact {
            item_code: code,
            region: "SP".into(),
            reference_date: NaiveDate::from_ymd_opt(2025, month, 1).unwrap(),
            regime: Regime::NotExempt,
            value: Some(Decimal::new(value, 2)),
        }
    }

    #[tokio::test]
    async fn upsert_never_resets_status() {
        let store = MemoryStore::default();
        let items = vec![CatalogItem::new(1, "A", None)];
        store.save(Table::InputItems, Rows::Catalog(&items), WritePolicy::Upsert).await.unwrap();
        store.state.lock().unwrap().inputs.get_mut(&1).unwrap().status = ItemStatus::Deactivated;

        let renamed = vec![CatalogItem::new(1, "A2", Some("KG".into()))];
        store.save(Table::InputItems, Rows::Catalog(&renamed), WritePolicy::Upsert).await.unwrap();

        let row = &store.catalog(ItemType::Input)[0];
        assert_eq!(row.description, "A2");
        assert_eq!(row.status, ItemStatus::Deactivated);
    }

    #[tokio::test]
    async fn orphan_edge_is_rejected_and_nothing_is_written() {
        let store = MemoryStore::default();
        let parents = vec![CatalogItem::new(200, "P", None)];
        store.save(Table::AssemblyItems, Rows::Catalog(&parents), WritePolicy::Upsert).await.unwrap();
        let edges = vec![StructureEdge {
            parent_code: 200,
            child_code: 999,
            coefficient: None,
        }];
        let err = store
            .save(Table::AssemblyInputEdges, Rows::Edges(&edges), WritePolicy::AppendIgnore)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ForeignKey { .. }));
        assert!(store.edges(Table::AssemblyInputEdges).is_empty());
    }

    #[tokio::test]
    async fn replace_touches_only_its_period() {
        let store = MemoryStore::default();
        let items = vec![CatalogItem::new(1, "A", None), CatalogItem::new(2, "B", None)];
        store.save(Table::InputItems, Rows::Catalog(&items), WritePolicy::Upsert).await.unwrap();
        let july = vec![fact(1, 7, 100)];
        store.save(Table::InputPricesMonthly, Rows::Facts(&july), WritePolicy::AppendIgnore).await.unwrap();
        let first = vec![fact(1, 8, 100), fact(2, 8, 200)];
        store.save(Table::InputPricesMonthly, Rows::Facts(&first), WritePolicy::AppendIgnore).await.unwrap();

        let august = ReferencePeriod::new(2025, 8).unwrap();
        let second = vec![fact(2, 8, 250)];
        let written = store
            .save(Table::InputPricesMonthly, Rows::Facts(&second), WritePolicy::ReplaceByPeriod(august))
            .await
            .unwrap();

        assert_eq!(written, 1);
        let facts = store.facts(Table::InputPricesMonthly);
        assert_eq!(facts.len(), 2);
        assert!(facts.iter().any(|f| f.reference_date.format("%m").to_string() == "07"));
        assert_eq!(facts.iter().find(|f| f.item_code == 2).unwrap().value, Some(Decimal::new(250, 2)));
    }

    #[tokio::test]
    async fn second_replace_of_a_bucket_leaves_only_its_rows() {
        let store = MemoryStore::default();
        let items: Vec<CatalogItem> = (1..30).map(|c| CatalogItem::new(c, format!("ITEM {c}"), None)).collect();
        store.save(Table::InputItems, Rows::Catalog(&items), WritePolicy::Upsert).await.unwrap();
        let august = WritePolicy::ReplaceByPeriod(ReferencePeriod::new(2025, 8).unwrap());

        let first: Vec<MonthlyFact> = (1..11).map(|c| fact(c, 8, 100)).collect();
        assert_eq!(store.save(Table::InputPricesMonthly, Rows::Facts(&first), august).await.unwrap(), 10);

        let second: Vec<MonthlyFact> = (20..27).map(|c| fact(c, 8, 200)).collect();
        for _ in 0..2 {
            store.save(Table::InputPricesMonthly, Rows::Facts(&second), august).await.unwrap();
        }

        let facts = store.facts(Table::InputPricesMonthly);
        assert_eq!(facts.len(), 7);
        assert!(facts.iter().all(|f| f.item_code >= 20 && f.region == "SP"));
    }
}
