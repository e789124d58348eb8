use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};
use rust_decimal::Decimal;
use serde_json::{json, Map, Value as JsonValue};
use sinapi_core::{is_region_code, RunContext};
use tracing::{debug, info};

use crate::json_workbook::{read_sheet, relation_kind, SheetCursor};
use crate::routing::{fold_name, RelationKind};
use crate::{ExtractedRelations, RelationError, RelationExtractor};

const SPREADSHEET_EXTENSIONS: &[&str] = &["xlsx", "xls"];

/// Rows scanned for the header before a sheet counts as malformed. The
/// release prints a title block of about ten rows above it.
const HEADER_SEARCH_ROWS: usize = 20;

/// Reads the workbooks as published. Each sheet's header row is located by
/// its column titles, and the rows below it are handed to the same parser the
/// JSON export goes through.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpreadsheetExtractor;

impl RelationExtractor for SpreadsheetExtractor {
    fn name(&self) -> &'static str {
        "spreadsheet"
    }

    fn supports(&self, workbook: &Path) -> bool {
        workbook
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| SPREADSHEET_EXTENSIONS.iter().any(|known| e.eq_ignore_ascii_case(known)))
    }

    fn extract(&self, ctx: &RunContext, workbook: &Path) -> Result<ExtractedRelations, RelationError> {
        let _entered = ctx.span().enter();
        let unreadable = |err: calamine::Error| RelationError::Io {
            path: workbook.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()),
        };
        let mut book = open_workbook_auto(workbook).map_err(unreadable)?;

        let mut out = ExtractedRelations::default();
        for name in book.sheet_names() {
            let Some(kind) = relation_kind(workbook, &name)? else {
                continue;
            };
            let range = book.worksheet_range(&name).map_err(unreadable)?;
            let grid: Vec<&[Data]> = range.rows().collect();
            let cursor = SheetCursor {
                workbook,
                sheet: &name,
                kind,
            };
            let rows = tabulate(&cursor, &grid)?;
            let row_count = rows.len();
            read_sheet(&cursor, ctx.period, rows, &mut out)?;
            info!(sheet = %name, %kind, rows = row_count, "sheet extracted");
        }

        out.dedupe();
        Ok(out)
    }
}

/// Column titles that identify the header row of each relation.
fn required_headers(kind: RelationKind) -> &'static [&'static str] {
    match kind {
        RelationKind::Structure => &["CODIGO_DA_COMPOSICAO", "TIPO_ITEM", "CODIGO_DO_ITEM"],
        RelationKind::Maintenance => &["REFERENCIA", "TIPO", "CODIGO", "MANUTENCAO"],
        _ => &["CODIGO", "DESCRICAO"],
    }
}

/// `Código da\nComposição` -> `CODIGO_DA_COMPOSICAO`.
fn header_key(cell: &Data) -> String {
    let Some(text) = cell_text(cell) else {
        return String::new();
    };
    fold_name(&text)
        .split_whitespace()
        .map(|word| {
            word.chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect::<String>()
        })
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

struct Header {
    keys: Vec<String>,
    /// (region, column) pairs holding a regional price or cost.
    regions: Vec<(String, usize)>,
}

impl Header {
    fn locate(grid: &[&[Data]], required: &[&str]) -> Option<(usize, Self)> {
        grid.iter().take(HEADER_SEARCH_ROWS).enumerate().find_map(|(index, row)| {
            let keys: Vec<String> = row.iter().map(header_key).collect();
            required
                .iter()
                .all(|token| keys.iter().any(|key| key.starts_with(token)))
                .then(|| {
                    let above = index.checked_sub(1).map(|i| grid[i]).unwrap_or_default();
                    let regions = region_columns(row, &keys, above);
                    (index, Self { keys, regions })
                })
        })
    }

    /// Exact title first, then the first title starting with `name`.
    fn column(&self, name: &str) -> Option<usize> {
        self.keys
            .iter()
            .position(|key| key == name)
            .or_else(|| self.keys.iter().position(|key| key.starts_with(name)))
    }
}

/// Price sheets title each region column with the state code. Cost sheets
/// put the state code in a merged cell above a group of columns, of which the
/// `CUSTO` column carries the value.
fn region_columns(titles: &[Data], keys: &[String], above: &[Data]) -> Vec<(String, usize)> {
    let mut columns = Vec::new();
    let mut group: Option<String> = None;
    for (index, key) in keys.iter().enumerate() {
        match above.get(index).and_then(region_label) {
            Some(region) => group = Some(region),
            None if above.get(index).and_then(cell_text).is_some() => group = None,
            None => {}
        }

        if let Some(region) = titles.get(index).and_then(region_label) {
            columns.push((region, index));
        } else if let Some(region) = group.as_ref().filter(|_| key.contains("CUSTO")) {
            columns.push((region.clone(), index));
        }
    }
    columns
}

/// A cell holding nothing but a state code.
fn region_label(cell: &Data) -> Option<String> {
    cell_text(cell).filter(|text| is_region_code(text))
}

/// Turns the data rows of a sheet into the row objects `read_sheet` parses.
/// Rows without an item code (blank lines, footers, group captions) are
/// dropped.
fn tabulate(cursor: &SheetCursor<'_>, grid: &[&[Data]]) -> Result<Vec<JsonValue>, RelationError> {
    let required = required_headers(cursor.kind);
    let Some((header_row, header)) = Header::locate(grid, required) else {
        return Err(cursor.malformed(format!(
            "no header row with {} in the first {HEADER_SEARCH_ROWS} rows",
            required.join(", ")
        )));
    };
    let body = &grid[header_row + 1..];

    let rows: Vec<JsonValue> = match cursor.kind {
        RelationKind::InputCatalog | RelationKind::AssemblyCatalog => catalog_rows(&header, body),
        RelationKind::InputPrices(_) | RelationKind::AssemblyCosts(_) => {
            if header.regions.is_empty() {
                return Err(cursor.malformed("no region columns next to the item columns"));
            }
            regional_rows(&header, body)
        }
        RelationKind::Structure => structure_rows(&header, body),
        RelationKind::Maintenance => maintenance_rows(&header, body),
    };
    debug!(sheet = cursor.sheet, header_row, rows = rows.len(), "sheet tabulated");
    Ok(rows)
}

fn catalog_rows(header: &Header, body: &[&[Data]]) -> Vec<JsonValue> {
    let (code, description, unit) = (
        header.column("CODIGO"),
        header.column("DESCRICAO"),
        header.column("UNIDADE"),
    );
    body.iter()
        .filter_map(|row| {
            Some(json!({
                "code": code_at(row, code)?,
                "description": text_at(row, description)?,
                "unit": text_at(row, unit),
            }))
        })
        .collect()
}

fn regional_rows(header: &Header, body: &[&[Data]]) -> Vec<JsonValue> {
    let (code, description, unit) = (
        header.column("CODIGO"),
        header.column("DESCRICAO"),
        header.column("UNIDADE"),
    );
    body.iter()
        .filter_map(|row| {
            let code = code_at(row, code)?;
            let values: Map<String, JsonValue> = header
                .regions
                .iter()
                .map(|(region, column)| {
                    let value = row.get(*column).and_then(cell_decimal);
                    (region.clone(), value.map_or(JsonValue::Null, JsonValue::String))
                })
                .collect();
            Some(json!({
                "code": code,
                "description": text_at(row, description),
                "unit": text_at(row, unit),
                "values": values,
            }))
        })
        .collect()
}

fn structure_rows(header: &Header, body: &[&[Data]]) -> Vec<JsonValue> {
    let parent = header.column("CODIGO_DA_COMPOSICAO");
    let item_type = header.column("TIPO_ITEM");
    let item = header.column("CODIGO_DO_ITEM");
    let description = header.column("DESCRICAO");
    let unit = header.column("UNIDADE");
    let coefficient = header.column("COEFICIENTE");

    body.iter()
        .filter_map(|row| {
            let parent_code = code_at(row, parent)?;
            let child_type = text_at(row, item_type)
                .map(|t| fold_name(&t))
                .filter(|t| t == "INSUMO" || t == "COMPOSICAO");
            let Some(child_type) = child_type else {
                return Some(json!({
                    "parent_code": parent_code,
                    "description": text_at(row, description),
                    "unit": text_at(row, unit),
                }));
            };
            Some(json!({
                "parent_code": parent_code,
                "item_type": child_type,
                "code": code_at(row, item)?,
                "description": text_at(row, description),
                "unit": text_at(row, unit),
                "coefficient": coefficient.and_then(|c| row.get(c)).and_then(cell_decimal),
            }))
        })
        .collect()
}

fn maintenance_rows(header: &Header, body: &[&[Data]]) -> Vec<JsonValue> {
    let reference = header.column("REFERENCIA");
    let item_type = header.column("TIPO");
    let code = header.column("CODIGO");
    let description = header.column("DESCRICAO");
    let event = header.column("MANUTENCAO");

    body.iter()
        .filter_map(|row| {
            Some(json!({
                "reference": reference.and_then(|c| row.get(c)).and_then(cell_reference)?,
                "item_type": text_at(row, item_type)?,
                "code": code_at(row, code)?,
                "description": text_at(row, description),
                "event": text_at(row, event)?,
            }))
        })
        .collect()
}

fn text_at(row: &[Data], column: Option<usize>) -> Option<String> {
    cell_text(row.get(column?)?)
}

fn code_at(row: &[Data], column: Option<usize>) -> Option<i32> {
    cell_code(row.get(column?)?)
}

fn cell_text(cell: &Data) -> Option<String> {
    match cell {
        Data::Empty | Data::Error(_) => None,
        Data::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        other => Some(other.to_string()),
    }
}

fn cell_code(cell: &Data) -> Option<i32> {
    let code = match cell {
        Data::Int(i) => *i,
        Data::Float(f) if f.fract() == 0.0 => *f as i64,
        Data::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    i32::try_from(code).ok()
}

fn cell_decimal(cell: &Data) -> Option<String> {
    match cell {
        Data::Int(i) => Some(i.to_string()),
        Data::Float(f) if f.is_finite() => Some(f.to_string()),
        Data::String(s) => decimal_text(s),
        _ => None,
    }
}

/// `1.234,56` as printed in pt-BR and `1234.56` both read as `1234.56`.
fn decimal_text(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let text = if raw.contains(',') {
        raw.replace('.', "").replace(',', ".")
    } else {
        raw.to_string()
    };
    text.parse::<Decimal>().ok().map(|_| text)
}

/// Date cells become ISO dates; text such as `07/2025` passes through.
fn cell_reference(cell: &Data) -> Option<String> {
    match cell {
        Data::DateTime(dt) => dt.as_datetime().map(|d| d.date().format("%Y-%m-%d").to_string()),
        Data::DateTimeIso(iso) => iso.get(..10).map(str::to_string),
        other => cell_text(other),
    }
}
