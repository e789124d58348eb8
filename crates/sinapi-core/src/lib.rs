//! Core domain model for the SINAPI reference-cost loader.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info_span, Span};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sinapi-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("invalid reference period {year}-{month:02}")]
    InvalidPeriod { year: i32, month: u32 },
    #[error("unknown source type `{0}` (expected REFERENCIA or DESONERADO)")]
    UnknownSourceType(String),
    #[error("unknown archive format `{0}` (expected xlsx or pdf)")]
    UnknownFormat(String),
    #[error("unknown regime `{0}`")]
    UnknownRegime(String),
    #[error("unknown item type `{0}` (expected INSUMO/INPUT or COMPOSICAO/ASSEMBLY)")]
    UnknownItemType(String),
}

/// The (year, month) identifying a monthly release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReferencePeriod {
    pub year: i32,
    pub month: u32,
}

impl ReferencePeriod {
    pub fn new(year: i32, month: u32) -> Result<Self, DomainError> {
        if !(1..=12).contains(&month) || !(1000..=9999).contains(&year) {
            return Err(DomainError::InvalidPeriod { year, month });
        }
        Ok(Self { year, month })
    }

    /// First-of-month date used as `reference_date` for every fact of the period.
    /// A hand-built period with an out-of-range month falls back to the epoch.
    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or_default()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }

    /// `YYYY-MM`, the bucket key used by period replacement.
    pub fn bucket_key(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }
}

impl fmt::Display for ReferencePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}/{:04}", self.month, self.year)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceType {
    #[default]
    Referencia,
    Desonerado,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Referencia => "REFERENCIA",
            Self::Desonerado => "DESONERADO",
        }
    }
}

impl FromStr for SourceType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "REFERENCIA" => Ok(Self::Referencia),
            "DESONERADO" => Ok(Self::Desonerado),
            _ => Err(DomainError::UnknownSourceType(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    #[default]
    Xlsx,
    Pdf,
}

impl ArchiveFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Xlsx => "xlsx",
            Self::Pdf => "pdf",
        }
    }
}

impl FromStr for ArchiveFormat {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "xlsx" => Ok(Self::Xlsx),
            "pdf" => Ok(Self::Pdf),
            _ => Err(DomainError::UnknownFormat(s.to_string())),
        }
    }
}

/// Canonical archive name: `SINAPI-<year>-<month>-formato-<format>.zip`.
pub fn archive_file_name(period: ReferencePeriod, format: ArchiveFormat) -> String {
    format!(
        "SINAPI-{:04}-{:02}-formato-{}.zip",
        period.year,
        period.month,
        format.as_str()
    )
}

/// Source URL: `<base>/SINAPI_<TYPE>_<month>_<year>.zip`.
pub fn source_url(base_url: &str, period: ReferencePeriod, source_type: SourceType) -> String {
    format!(
        "{}/SINAPI_{}_{:02}_{:04}.zip",
        base_url.trim_end_matches('/'),
        source_type.as_str(),
        period.month,
        period.year
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ItemType {
    #[serde(rename = "INPUT", alias = "INSUMO")]
    Input,
    #[serde(rename = "ASSEMBLY", alias = "COMPOSICAO")]
    Assembly,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "INPUT",
            Self::Assembly => "ASSEMBLY",
        }
    }
}

impl FromStr for ItemType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "INPUT" | "INSUMO" => Ok(Self::Input),
            "ASSEMBLY" | "COMPOSICAO" | "COMPOSIÇÃO" => Ok(Self::Assembly),
            _ => Err(DomainError::UnknownItemType(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ItemStatus {
    #[default]
    Active,
    Deactivated,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Deactivated => "DEACTIVATED",
        }
    }
}

/// Tax/charge regime under which a monthly price or cost is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Regime {
    #[serde(rename = "NAO_DESONERADO")]
    NotExempt,
    #[serde(rename = "DESONERADO")]
    Exempt,
    #[serde(rename = "SEM_ENCARGOS")]
    WithoutCharges,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotExempt => "NAO_DESONERADO",
            Self::Exempt => "DESONERADO",
            Self::WithoutCharges => "SEM_ENCARGOS",
        }
    }
}

impl FromStr for Regime {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NAO_DESONERADO" => Ok(Self::NotExempt),
            "DESONERADO" => Ok(Self::Exempt),
            "SEM_ENCARGOS" => Ok(Self::WithoutCharges),
            _ => Err(DomainError::UnknownRegime(s.to_string())),
        }
    }
}

/// Row of either catalog (inputs or assemblies).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub code: i32,
    pub description: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub status: ItemStatus,
}

impl CatalogItem {
    pub fn new(code: i32, description: impl Into<String>, unit: Option<String>) -> Self {
        Self {
            code,
            description: description.into(),
            unit,
            status: ItemStatus::Active,
        }
    }
}

/// Parent -> child composition edge; the child is an input or a sub-assembly
/// depending on which structure relation holds the edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureEdge {
    pub parent_code: i32,
    pub child_code: i32,
    #[serde(default)]
    pub coefficient: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyFact {
    pub item_code: i32,
    pub region: String,
    pub reference_date: NaiveDate,
    pub regime: Regime,
    #[serde(default)]
    pub value: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceEvent {
    pub item_code: i32,
    pub item_type: ItemType,
    pub reference_date: NaiveDate,
    pub event_type: String,
    #[serde(default)]
    pub item_description: Option<String>,
}

/// Description/unit harvested while parsing the structure sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDetail {
    pub code: i32,
    pub item_type: ItemType,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
}

/// Per-run identity threaded through every component by parameter.
///
/// The span carries the run id, so anything logged while it is entered (or
/// inside a future instrumented with it) is attributed to this run only.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub period: ReferencePeriod,
    pub source_type: SourceType,
    span: Span,
}

impl RunContext {
    pub fn new(period: ReferencePeriod, source_type: SourceType) -> Self {
        Self::with_run_id(Uuid::new_v4(), period, source_type)
    }

    pub fn with_run_id(run_id: Uuid, period: ReferencePeriod, source_type: SourceType) -> Self {
        let span = info_span!(
            "pipeline_run",
            %run_id,
            period = %period,
            source_type = source_type.as_str()
        );
        Self {
            run_id,
            period,
            source_type,
            span,
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

/// Two uppercase ASCII letters, e.g. `SP`.
pub fn is_region_code(region: &str) -> bool {
    region.len() == 2 && region.bytes().all(|b| b.is_ascii_uppercase())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    SuccessNoData,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::SuccessNoData => "SUCCESS_NO_DATA",
            Self::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
