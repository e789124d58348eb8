use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sinapi_core::{
    is_region_code, CatalogItem, ItemDetail, ItemType, MaintenanceEvent, MonthlyFact,
    ReferencePeriod, Regime, RunContext, StructureEdge,
};
use tracing::{debug, info};

use crate::routing::{closest_known_sheet, route_sheet, RelationKind, SheetRoute};
use crate::{ExtractedRelations, RelationError, RelationExtractor};

/// Reads a workbook exported to JSON: `{"sheets": [{"name": .., "rows": [..]}]}`
/// with one object per data row, already past header detection.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonWorkbookExtractor;

#[derive(Debug, Deserialize)]
struct WorkbookExport {
    sheets: Vec<SheetExport>,
}

#[derive(Debug, Deserialize)]
struct SheetExport {
    name: String,
    #[serde(default)]
    rows: Vec<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct CatalogRow {
    code: i32,
    description: String,
    #[serde(default)]
    unit: Option<String>,
}

/// Wide price/cost row: one value per region column.
#[derive(Debug, Deserialize)]
struct RegionalValueRow {
    code: i32,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    values: BTreeMap<String, Option<Decimal>>,
}

/// Rows without `item_type` head a block and describe the parent assembly.
#[derive(Debug, Deserialize)]
struct StructureRow {
    parent_code: i32,
    #[serde(default)]
    item_type: Option<String>,
    #[serde(default)]
    code: Option<i32>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    coefficient: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct MaintenanceRow {
    reference: String,
    item_type: String,
    code: i32,
    #[serde(default)]
    description: Option<String>,
    event: String,
}

pub(crate) struct SheetCursor<'a> {
    pub(crate) workbook: &'a Path,
    pub(crate) sheet: &'a str,
    pub(crate) kind: RelationKind,
}

impl SheetCursor<'_> {
    pub(crate) fn malformed(&self, reason: impl Into<String>) -> RelationError {
        RelationError::Malformed {
            workbook: self.workbook.to_path_buf(),
            sheet: self.sheet.to_string(),
            kind: self.kind,
            reason: reason.into(),
        }
    }

    fn rows<T: DeserializeOwned>(&self, rows: Vec<JsonValue>) -> Result<Vec<T>, RelationError> {
        rows.into_iter()
            .enumerate()
            .map(|(index, row)| {
                serde_json::from_value(row).map_err(|e| self.malformed(format!("row {index}: {e}")))
            })
            .collect()
    }
}

impl RelationExtractor for JsonWorkbookExtractor {
    fn name(&self) -> &'static str {
        "json-workbook"
    }

    fn supports(&self, workbook: &Path) -> bool {
        workbook
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"))
    }

    fn extract(&self, ctx: &RunContext, workbook: &Path) -> Result<ExtractedRelations, RelationError> {
        let _entered = ctx.span().enter();
        let text = fs::read_to_string(workbook).map_err(|source| RelationError::Io {
            path: workbook.to_path_buf(),
            source,
        })?;
        let export: WorkbookExport = serde_json::from_str(&text).map_err(|e| {
            RelationError::Io {
                path: workbook.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            }
        })?;

        let mut out = ExtractedRelations::default();
        for sheet in export.sheets {
            let Some(kind) = relation_kind(workbook, &sheet.name)? else {
                continue;
            };
            let cursor = SheetCursor {
                workbook,
                sheet: &sheet.name,
                kind,
            };
            let row_count = sheet.rows.len();
            read_sheet(&cursor, ctx.period, sheet.rows, &mut out)?;
            info!(sheet = %sheet.name, %kind, rows = row_count, "sheet extracted");
        }

        out.dedupe();
        Ok(out)
    }
}

/// Relation a sheet feeds; `None` for informational sheets, an error for
/// sheets the routing table does not know.
pub(crate) fn relation_kind(workbook: &Path, sheet: &str) -> Result<Option<RelationKind>, RelationError> {
    match route_sheet(sheet) {
        Some(SheetRoute::Relation(kind)) => Ok(Some(kind)),
        Some(SheetRoute::Informational) => {
            debug!(sheet, "skipping informational sheet");
            Ok(None)
        }
        None => Err(RelationError::UnknownSheet {
            workbook: workbook.to_path_buf(),
            sheet: sheet.to_string(),
            closest: closest_known_sheet(sheet),
        }),
    }
}

/// Parses rows shaped like the JSON export into `out`.
pub(crate) fn read_sheet(
    cursor: &SheetCursor<'_>,
    period: ReferencePeriod,
    rows: Vec<JsonValue>,
    out: &mut ExtractedRelations,
) -> Result<(), RelationError> {
    match cursor.kind {
        RelationKind::InputCatalog => {
            out.input_catalog
                .extend(cursor.rows::<CatalogRow>(rows)?.into_iter().map(catalog_item));
        }
        RelationKind::AssemblyCatalog => {
            out.assembly_catalog
                .extend(cursor.rows::<CatalogRow>(rows)?.into_iter().map(catalog_item));
        }
        RelationKind::InputPrices(regime) => {
            let rows = cursor.rows::<RegionalValueRow>(rows)?;
            let (catalog, facts) = reshape_regional(rows, period, regime);
            out.input_catalog.extend(catalog);
            out.input_prices.extend(facts);
        }
        RelationKind::AssemblyCosts(regime) => {
            let rows = cursor.rows::<RegionalValueRow>(rows)?;
            let (catalog, facts) = reshape_regional(rows, period, regime);
            out.assembly_catalog.extend(catalog);
            out.assembly_costs.extend(facts);
        }
        RelationKind::Structure => {
            for row in cursor.rows::<StructureRow>(rows)? {
                read_structure_row(cursor, row, out)?;
            }
        }
        RelationKind::Maintenance => {
            for row in cursor.rows::<MaintenanceRow>(rows)? {
                out.maintenance.push(maintenance_event(cursor, row)?);
            }
        }
    }
    Ok(())
}

fn catalog_item(row: CatalogRow) -> CatalogItem {
    CatalogItem::new(row.code, row.description.trim(), non_blank(row.unit))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Wide-to-long: one fact per region column; non-region columns are dropped.
fn reshape_regional(
    rows: Vec<RegionalValueRow>,
    period: ReferencePeriod,
    regime: Regime,
) -> (Vec<CatalogItem>, Vec<MonthlyFact>) {
    let reference_date = period.first_day();
    let mut catalog = Vec::new();
    let mut facts = Vec::new();
    for row in rows {
        if let Some(description) = non_blank(row.description) {
            catalog.push(CatalogItem::new(row.code, description, non_blank(row.unit)));
        }
        for (region, value) in row.values {
            let region = region.trim().to_ascii_uppercase();
            if !is_region_code(&region) {
                continue;
            }
            facts.push(MonthlyFact {
                item_code: row.code,
                region,
                reference_date,
                regime,
                value,
            });
        }
    }
    (catalog, facts)
}

fn read_structure_row(
    cursor: &SheetCursor<'_>,
    row: StructureRow,
    out: &mut ExtractedRelations,
) -> Result<(), RelationError> {
    let Some(item_type) = row.item_type.as_deref().map(str::trim).filter(|t| !t.is_empty()) else {
        out.parent_details.push(ItemDetail {
            code: row.parent_code,
            item_type: ItemType::Assembly,
            description: non_blank(row.description),
            unit: non_blank(row.unit),
        });
        return Ok(());
    };

    let item_type: ItemType = item_type
        .parse()
        .map_err(|e| cursor.malformed(format!("parent {}: {e}", row.parent_code)))?;
    let child_code = row.code.ok_or_else(|| {
        cursor.malformed(format!("parent {}: item row without code", row.parent_code))
    })?;

    let edge = StructureEdge {
        parent_code: row.parent_code,
        child_code,
        coefficient: row.coefficient,
    };
    match item_type {
        ItemType::Input => out.input_edges.push(edge),
        ItemType::Assembly => out.subassembly_edges.push(edge),
    }
    out.child_details.push(ItemDetail {
        code: child_code,
        item_type,
        description: non_blank(row.description),
        unit: non_blank(row.unit),
    });
    Ok(())
}

fn maintenance_event(
    cursor: &SheetCursor<'_>,
    row: MaintenanceRow,
) -> Result<MaintenanceEvent, RelationError> {
    let reference_date = parse_reference(&row.reference).ok_or_else(|| {
        cursor.malformed(format!("code {}: unreadable reference `{}`", row.code, row.reference))
    })?;
    let item_type: ItemType = row
        .item_type
        .parse()
        .map_err(|e| cursor.malformed(format!("code {}: {e}", row.code)))?;
    Ok(MaintenanceEvent {
        item_code: row.code,
        item_type,
        reference_date,
        event_type: row.event.trim().to_uppercase(),
        item_description: non_blank(row.description),
    })
}

/// Accepts `MM/YYYY` (as printed in the maintenance workbook) or an ISO date.
fn parse_reference(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(&format!("01/{raw}"), "%d/%m/%Y")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .ok()
}
