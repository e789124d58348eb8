use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::Serialize;
use sinapi_core::{ItemType, MaintenanceEvent, RunContext};
use tracing::{info, Instrument};

use crate::store::{RelationalStore, StoreError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusSyncReport {
    pub inputs_deactivated: u64,
    pub assemblies_deactivated: u64,
}

/// Case-insensitive substring match of `event_type` against any keyword.
pub fn matches_deactivation(event_type: &str, keywords: &[String]) -> bool {
    let event = event_type.to_uppercase();
    keywords
        .iter()
        .any(|keyword| event.contains(&keyword.to_uppercase()))
}

/// Codes of `item_type` whose most recent maintenance date carries a
/// deactivation event. Other events on earlier dates are ignored.
pub fn derive_deactivated<'a, I>(events: I, item_type: ItemType, keywords: &[String]) -> BTreeSet<i32>
where
    I: IntoIterator<Item = &'a MaintenanceEvent>,
{
    let mut latest: BTreeMap<i32, (NaiveDate, bool)> = BTreeMap::new();
    for event in events.into_iter().filter(|e| e.item_type == item_type) {
        let deactivates = matches_deactivation(&event.event_type, keywords);
        latest
            .entry(event.item_code)
            .and_modify(|(date, flag)| {
                if event.reference_date > *date {
                    *date = event.reference_date;
                    *flag = deactivates;
                } else if event.reference_date == *date {
                    *flag |= deactivates;
                }
            })
            .or_insert((event.reference_date, deactivates));
    }
    latest
        .into_iter()
        .filter_map(|(code, (_, deactivated))| deactivated.then_some(code))
        .collect()
}

/// Drives catalog status from the maintenance log already in the store.
#[derive(Debug, Clone)]
pub struct StatusSynchronizer {
    keywords: Vec<String>,
}

impl StatusSynchronizer {
    pub fn new(keywords: Vec<String>) -> Self {
        Self { keywords }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub async fn sync(
        &self,
        ctx: &RunContext,
        store: &dyn RelationalStore,
    ) -> Result<StatusSyncReport, StoreError> {
        async {
            let report = StatusSyncReport {
                inputs_deactivated: store
                    .deactivate_from_events(ItemType::Input, &self.keywords)
                    .await?,
                assemblies_deactivated: store
                    .deactivate_from_events(ItemType::Assembly, &self.keywords)
                    .await?,
            };
            info!(
                inputs = report.inputs_deactivated,
                assemblies = report.assemblies_deactivated,
                "status synchronization finished"
            );
            Ok(report)
        }
        .instrument(ctx.span().clone())
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::{Rows, Table, WritePolicy};
    use sinapi_core::{CatalogItem, ItemStatus, ReferencePeriod, SourceType};

    fn keywords() -> Vec<String> {
        vec!["DESATIVACAO".into(), "DESATIVAÇÃO".into(), "DEACTIVATION".into()]
    }

    fn event(code: i32, item_type: ItemType, date: (i32, u32), event_type: &str) -> MaintenanceEvent {
        MaintenanceEvent {
            item_code: code,
            item_type,
            reference_date: NaiveDate::from_ymd_opt(date.0, date.1, 1).unwrap(),
            event_type: event_type.into(),
            item_description: None,
        }
    }

    #[test]
    fn keyword_match_ignores_case() {
        assert!(matches_deactivation("Desativação de insumo", &keywords()));
        assert!(matches_deactivation("deactivation", &keywords()));
        assert!(!matches_deactivation("INCLUSAO", &keywords()));
    }

    #[test]
    fn latest_event_decides() {
        let events = vec![
            event(100, ItemType::Input, (2025, 5), "DESATIVAÇÃO"),
            event(100, ItemType::Input, (2025, 7), "ALTERAÇÃO DE DESCRIÇÃO"),
            event(101, ItemType::Input, (2025, 6), "INCLUSÃO"),
            event(102, ItemType::Input, (2025, 4), "INCLUSÃO"),
            event(102, ItemType::Input, (2025, 8), "DESATIVAÇÃO"),
            event(210, ItemType::Assembly, (2025, 7), "DESATIVAÇÃO"),
        ];
        let inputs = derive_deactivated(&events, ItemType::Input, &keywords());
        assert_eq!(inputs, BTreeSet::from([102]));
        let assemblies = derive_deactivated(&events, ItemType::Assembly, &keywords());
        assert_eq!(assemblies, BTreeSet::from([210]));
    }

    #[test]
    fn deactivation_on_the_latest_date_wins_a_tie() {
        let events = vec![
            event(300, ItemType::Assembly, (2025, 7), "ALTERAÇÃO"),
            event(300, ItemType::Assembly, (2025, 7), "DESATIVAÇÃO"),
        ];
        assert_eq!(
            derive_deactivated(&events, ItemType::Assembly, &keywords()),
            BTreeSet::from([300])
        );
    }

    #[tokio::test]
    async fn sync_is_idempotent_against_the_store() {
        let store = MemoryStore::default();
        let catalog = vec![
            CatalogItem::new(300, "ESTACA", None),
            CatalogItem::new(301, "FORMA", None),
        ];
        store
            .save(Table::AssemblyItems, Rows::Catalog(&catalog), WritePolicy::Upsert)
            .await
            .unwrap();
        let events = vec![event(300, ItemType::Assembly, (2025, 6), "DESATIVACAO")];
        store
            .save(
                Table::MaintenanceEvents,
                Rows::Maintenance(&events),
                WritePolicy::AppendIgnore,
            )
            .await
            .unwrap();

        let ctx = RunContext::new(ReferencePeriod::new(2025, 8).unwrap(), SourceType::Referencia);
        let sync = StatusSynchronizer::new(keywords());
        let first = sync.sync(&ctx, &store).await.unwrap();
        assert_eq!(first.assemblies_deactivated, 1);
        let second = sync.sync(&ctx, &store).await.unwrap();
        assert_eq!(second, StatusSyncReport::default());

        let assemblies = store.catalog(ItemType::Assembly);
        assert_eq!(assemblies[0].status, ItemStatus::Deactivated);
        assert_eq!(assemblies[1].status, ItemStatus::Active);
    }
}
