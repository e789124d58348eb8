use std::fmt;

use sinapi_core::Regime;
use strsim::jaro_winkler;

/// Typed relation a workbook sheet produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    InputPrices(Regime),
    AssemblyCosts(Regime),
    InputCatalog,
    AssemblyCatalog,
    Structure,
    Maintenance,
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InputPrices(regime) => write!(f, "input prices ({})", regime.as_str()),
            Self::AssemblyCosts(regime) => write!(f, "assembly costs ({})", regime.as_str()),
            Self::InputCatalog => f.write_str("input catalog"),
            Self::AssemblyCatalog => f.write_str("assembly catalog"),
            Self::Structure => f.write_str("analytic structure"),
            Self::Maintenance => f.write_str("maintenance"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetRoute {
    Relation(RelationKind),
    /// Cover pages and indexes that carry no data.
    Informational,
}

/// Folded sheet-name token -> route. Matched as a whole-word sequence, first
/// entry wins.
pub const SHEET_ROUTES: &[(&str, SheetRoute)] = &[
    ("ISD", SheetRoute::Relation(RelationKind::InputPrices(Regime::NotExempt))),
    ("ICD", SheetRoute::Relation(RelationKind::InputPrices(Regime::Exempt))),
    ("ISE", SheetRoute::Relation(RelationKind::InputPrices(Regime::WithoutCharges))),
    ("CSD", SheetRoute::Relation(RelationKind::AssemblyCosts(Regime::NotExempt))),
    ("CCD", SheetRoute::Relation(RelationKind::AssemblyCosts(Regime::Exempt))),
    ("CSE", SheetRoute::Relation(RelationKind::AssemblyCosts(Regime::WithoutCharges))),
    ("CATALOGO DE INSUMOS", SheetRoute::Relation(RelationKind::InputCatalog)),
    ("CATALOGO DE COMPOSICOES", SheetRoute::Relation(RelationKind::AssemblyCatalog)),
    ("ANALITICO", SheetRoute::Relation(RelationKind::Structure)),
    ("MANUTENCOES", SheetRoute::Relation(RelationKind::Maintenance)),
    ("MANUTENCAO", SheetRoute::Relation(RelationKind::Maintenance)),
    ("MENU", SheetRoute::Informational),
    ("BUSCA", SheetRoute::Informational),
    ("LEIA ME", SheetRoute::Informational),
    ("APRESENTACAO", SheetRoute::Informational),
];

/// Uppercases and strips Portuguese diacritics so `Catálogo de Composições`
/// and `CATALOGO DE COMPOSICOES` compare equal.
pub fn fold_name(name: &str) -> String {
    name.to_uppercase()
        .chars()
        .map(|c| match c {
            'Á' | 'À' | 'Â' | 'Ã' | 'Ä' => 'A',
            'É' | 'È' | 'Ê' | 'Ë' => 'E',
            'Í' | 'Ì' | 'Î' | 'Ï' => 'I',
            'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => 'O',
            'Ú' | 'Ù' | 'Û' | 'Ü' => 'U',
            'Ç' => 'C',
            other => other,
        })
        .collect()
}

fn words(folded: &str) -> Vec<&str> {
    folded
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect()
}

pub fn route_sheet(sheet_name: &str) -> Option<SheetRoute> {
    let folded = fold_name(sheet_name);
    let sheet_words = words(&folded);
    SHEET_ROUTES.iter().find_map(|(token, route)| {
        let token_words = words(token);
        sheet_words
            .windows(token_words.len())
            .any(|window| window == token_words.as_slice())
            .then_some(*route)
    })
}

/// Known token most similar to `sheet_name`, used to hint at schema drift.
pub fn closest_known_sheet(sheet_name: &str) -> &'static str {
    let folded = fold_name(sheet_name);
    SHEET_ROUTES
        .iter()
        .map(|(token, _)| (*token, jaro_winkler(&folded, token)))
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(token, _)| token)
        .unwrap_or("ANALITICO")
}
