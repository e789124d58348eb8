use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Deserialize;
use sinapi_core::{CatalogItem, ItemDetail, ItemType, RunContext};
use sinapi_relations::ExtractedRelations;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PlaceholderTemplates {
    /// `{code}` is replaced by the item code.
    pub input_description: String,
    pub assembly_description: String,
    pub default_unit: String,
}

impl Default for PlaceholderTemplates {
    fn default() -> Self {
        Self {
            input_description: "INPUT_ITEM_UNKNOWN_{code}".to_string(),
            assembly_description: "ASSEMBLY_ITEM_UNKNOWN_{code}".to_string(),
            default_unit: "UN".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub inputs_added: usize,
    pub assemblies_added: usize,
    pub placeholders: usize,
}

/// Makes every code referenced by structure edges (and monthly facts) resolve
/// to a catalog row before anything is written. Synthesized rows are appended
/// after the parsed rows; [`split_synthesized`] separates them again.
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    templates: PlaceholderTemplates,
}

impl Reconciler {
    pub fn new(templates: PlaceholderTemplates) -> Self {
        Self { templates }
    }

    pub fn reconcile(&self, ctx: &RunContext, relations: &mut ExtractedRelations) -> ReconcileSummary {
        let _entered = ctx.span().enter();

        let input_refs: BTreeSet<i32> = relations
            .input_edges
            .iter()
            .map(|e| e.child_code)
            .chain(relations.input_prices.iter().map(|f| f.item_code))
            .collect();
        let assembly_refs: BTreeSet<i32> = relations
            .input_edges
            .iter()
            .chain(relations.subassembly_edges.iter())
            .map(|e| e.parent_code)
            .chain(relations.subassembly_edges.iter().map(|e| e.child_code))
            .chain(relations.assembly_costs.iter().map(|f| f.item_code))
            .collect();

        let input_details = detail_index(&relations.child_details, ItemType::Input, &[]);
        let assembly_details = detail_index(
            &relations.parent_details,
            ItemType::Assembly,
            &relations.child_details,
        );

        let mut summary = ReconcileSummary::default();
        let (added, placeholders) = self.fill_missing(
            &mut relations.input_catalog,
            &input_refs,
            &input_details,
            &self.templates.input_description,
        );
        summary.inputs_added = added;
        summary.placeholders += placeholders;

        let (added, placeholders) = self.fill_missing(
            &mut relations.assembly_catalog,
            &assembly_refs,
            &assembly_details,
            &self.templates.assembly_description,
        );
        summary.assemblies_added = added;
        summary.placeholders += placeholders;

        if summary.placeholders > 0 {
            warn!(
                placeholders = summary.placeholders,
                "referenced codes without any description; placeholder rows synthesized"
            );
        }
        info!(
            inputs_added = summary.inputs_added,
            assemblies_added = summary.assemblies_added,
            "catalogs reconciled against structure"
        );
        summary
    }

    fn fill_missing(
        &self,
        catalog: &mut Vec<CatalogItem>,
        referenced: &BTreeSet<i32>,
        details: &HashMap<i32, &ItemDetail>,
        description_template: &str,
    ) -> (usize, usize) {
        let existing: HashSet<i32> = catalog.iter().map(|item| item.code).collect();
        let mut added = 0;
        let mut placeholders = 0;

        for code in referenced.iter().filter(|code| !existing.contains(*code)) {
            let detail = details.get(code);
            let description = match detail.and_then(|d| d.description.clone()) {
                Some(description) => description,
                None => {
                    placeholders += 1;
                    description_template.replace("{code}", &code.to_string())
                }
            };
            let unit = detail
                .and_then(|d| d.unit.clone())
                .unwrap_or_else(|| self.templates.default_unit.clone());
            catalog.push(CatalogItem::new(*code, description, Some(unit)));
            added += 1;
        }
        (added, placeholders)
    }
}

/// Splits a reconciled catalog into the parsed rows and the `added` rows the
/// reconciler synthesized. Synthesized rows describe codes this release left
/// out, so they must not replace a description already stored.
pub fn split_synthesized(catalog: &[CatalogItem], added: usize) -> (&[CatalogItem], &[CatalogItem]) {
    catalog.split_at(catalog.len().saturating_sub(added))
}

/// First detail row per code of `item_type`, `primary` rows taking precedence
/// over `fallback` rows.
fn detail_index<'a>(
    primary: &'a [ItemDetail],
    item_type: ItemType,
    fallback: &'a [ItemDetail],
) -> HashMap<i32, &'a ItemDetail> {
    let mut index = HashMap::new();
    for detail in primary.iter().chain(fallback.iter()) {
        if detail.item_type == item_type {
            index.entry(detail.code).or_insert(detail);
        }
    }
    index
}
