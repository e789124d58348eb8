//! Relation extraction boundary: sheet routing, workbook discovery and the
//! extractors that turn a workbook into typed relations.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use sinapi_core::{
    CatalogItem, ItemDetail, MaintenanceEvent, MonthlyFact, RunContext, StructureEdge,
};
use thiserror::Error;

mod discovery;
mod json_workbook;
mod routing;
mod spreadsheet;

pub use discovery::{
    classify_workbook, discover_workbooks, WorkbookRole, WorkbookSet, WORKBOOK_EXTENSIONS,
};
pub use json_workbook::JsonWorkbookExtractor;
pub use routing::{closest_known_sheet, fold_name, route_sheet, RelationKind, SheetRoute, SHEET_ROUTES};
pub use spreadsheet::SpreadsheetExtractor;

pub const CRATE_NAME: &str = "sinapi-relations";

#[derive(Debug, Error)]
pub enum RelationError {
    #[error("unrecognized sheet `{sheet}` in {} (closest known sheet: `{closest}`)", .workbook.display())]
    UnknownSheet {
        workbook: PathBuf,
        sheet: String,
        closest: &'static str,
    },
    #[error("malformed {kind} sheet `{sheet}` in {}: {reason}", .workbook.display())]
    Malformed {
        workbook: PathBuf,
        sheet: String,
        kind: RelationKind,
        reason: String,
    },
    #[error("no workbook found in {}", .0.display())]
    NoWorkbook(PathBuf),
    #[error("no extractor supports workbook {}", .0.display())]
    Unsupported(PathBuf),
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Everything one or more workbooks of a release produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedRelations {
    pub input_catalog: Vec<CatalogItem>,
    pub assembly_catalog: Vec<CatalogItem>,
    /// Assembly -> input edges.
    pub input_edges: Vec<StructureEdge>,
    /// Assembly -> sub-assembly edges.
    pub subassembly_edges: Vec<StructureEdge>,
    /// Description rows of the assemblies that head a structure block.
    pub parent_details: Vec<ItemDetail>,
    /// Description rows of the items listed under a structure block.
    pub child_details: Vec<ItemDetail>,
    pub input_prices: Vec<MonthlyFact>,
    pub assembly_costs: Vec<MonthlyFact>,
    pub maintenance: Vec<MaintenanceEvent>,
}

impl ExtractedRelations {
    pub fn has_catalogs(&self) -> bool {
        !self.input_catalog.is_empty() || !self.assembly_catalog.is_empty()
    }

    pub fn has_structure(&self) -> bool {
        !self.input_edges.is_empty() || !self.subassembly_edges.is_empty()
    }

    pub fn has_facts(&self) -> bool {
        !self.input_prices.is_empty() || !self.assembly_costs.is_empty()
    }

    pub fn has_maintenance(&self) -> bool {
        !self.maintenance.is_empty()
    }

    /// True when nothing loadable was found.
    pub fn is_empty(&self) -> bool {
        !self.has_catalogs() && !self.has_structure() && !self.has_facts() && !self.has_maintenance()
    }

    pub fn merge(&mut self, other: ExtractedRelations) {
        self.input_catalog.extend(other.input_catalog);
        self.assembly_catalog.extend(other.assembly_catalog);
        self.input_edges.extend(other.input_edges);
        self.subassembly_edges.extend(other.subassembly_edges);
        self.parent_details.extend(other.parent_details);
        self.child_details.extend(other.child_details);
        self.input_prices.extend(other.input_prices);
        self.assembly_costs.extend(other.assembly_costs);
        self.maintenance.extend(other.maintenance);
    }

    /// Drops repeated keys, keeping the first occurrence. Catalog codes repeat
    /// across regime sheets and edges repeat across structure sheets.
    pub fn dedupe(&mut self) {
        dedupe_by_key(&mut self.input_catalog, |i| i.code);
        dedupe_by_key(&mut self.assembly_catalog, |i| i.code);
        dedupe_by_key(&mut self.input_edges, |e| (e.parent_code, e.child_code));
        dedupe_by_key(&mut self.subassembly_edges, |e| (e.parent_code, e.child_code));
        dedupe_by_key(&mut self.parent_details, |d| (d.code, d.item_type));
        dedupe_by_key(&mut self.child_details, |d| (d.code, d.item_type));
        dedupe_by_key(&mut self.input_prices, fact_key);
        dedupe_by_key(&mut self.assembly_costs, fact_key);
        dedupe_by_key(&mut self.maintenance, |m| {
            (m.item_code, m.item_type, m.reference_date, m.event_type.clone())
        });
    }
}

fn fact_key(fact: &MonthlyFact) -> (i32, String, chrono::NaiveDate, sinapi_core::Regime) {
    (fact.item_code, fact.region.clone(), fact.reference_date, fact.regime)
}

fn dedupe_by_key<T, K, F>(rows: &mut Vec<T>, key: F)
where
    K: Eq + std::hash::Hash,
    F: Fn(&T) -> K,
{
    let mut seen = HashSet::new();
    rows.retain(|row| seen.insert(key(row)));
}

/// Turns one workbook into typed relations. Implementations are synchronous;
/// callers run them on a blocking thread.
pub trait RelationExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, workbook: &Path) -> bool;

    fn extract(&self, ctx: &RunContext, workbook: &Path) -> Result<ExtractedRelations, RelationError>;
}

/// Extractor registered for the workbook's extension, if any.
pub fn extractor_for(workbook: &Path) -> Option<Box<dyn RelationExtractor>> {
    let json = JsonWorkbookExtractor;
    if json.supports(workbook) {
        return Some(Box::new(json));
    }
    let spreadsheet = SpreadsheetExtractor;
    if spreadsheet.supports(workbook) {
        return Some(Box::new(spreadsheet));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use sinapi_core::{ItemStatus, ItemType};

    #[test]
    fn dedupe_keeps_first_catalog_row_per_code() {
        let mut relations = ExtractedRelations {
            input_catalog: vec![
                CatalogItem::new(100, "CIMENTO", Some("KG".into())),
                CatalogItem::new(100, "CIMENTO (ICD)", Some("KG".into())),
                CatalogItem::new(101, "AREIA", Some("M3".into())),
            ],
            ..Default::default()
        };
        relations.dedupe();
        assert_eq!(relations.input_catalog.len(), 2);
        assert_eq!(relations.input_catalog[0].description, "CIMENTO");
        assert_eq!(relations.input_catalog[0].status, ItemStatus::Active);
    }

    #[test]
    fn maintenance_only_release_is_not_empty() {
        let relations = ExtractedRelations {
            maintenance: vec![MaintenanceEvent {
                item_code: 300,
                item_type: ItemType::Assembly,
                reference_date: chrono::NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(),
                event_type: "DEACTIVATION".into(),
                item_description: None,
            }],
            ..Default::default()
        };
        assert!(!relations.is_empty());
        assert!(!relations.has_catalogs());
        assert!(relations.has_maintenance());
    }

    #[test]
    fn registry_picks_extractor_by_extension() {
        let name = |file: &str| extractor_for(Path::new(file)).map(|e| e.name());
        assert_eq!(name("SINAPI_Referencia_2025_08.json"), Some("json-workbook"));
        assert_eq!(name("SINAPI_Referencia_2025_08.xlsx"), Some("spreadsheet"));
        assert_eq!(name("SINAPI_Manutencoes_2025_08.XLS"), Some("spreadsheet"));
        assert_eq!(name("SINAPI_Referencia_2025_08.csv"), None);
    }
}
