use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::routing::fold_name;
use crate::RelationError;

pub const WORKBOOK_EXTENSIONS: &[&str] = &["xlsx", "xls", "json"];

const REFERENCE_KEYWORD: &str = "REFERENCIA";
const MAINTENANCE_KEYWORD: &str = "MANUTENC";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkbookRole {
    Reference,
    Maintenance,
    Unclassified,
}

pub fn classify_workbook(file_name: &str) -> WorkbookRole {
    let folded = fold_name(file_name);
    if folded.contains(MAINTENANCE_KEYWORD) {
        WorkbookRole::Maintenance
    } else if folded.contains(REFERENCE_KEYWORD) {
        WorkbookRole::Reference
    } else {
        WorkbookRole::Unclassified
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkbookSet {
    pub reference: Option<PathBuf>,
    pub maintenance: Option<PathBuf>,
    pub unclassified: Vec<PathBuf>,
}

impl WorkbookSet {
    pub fn is_empty(&self) -> bool {
        self.reference.is_none() && self.maintenance.is_none() && self.unclassified.is_empty()
    }
}

/// Walks `dir` (recursively, in sorted order) and classifies every workbook by
/// file name. Finding no workbook at all is an error.
pub fn discover_workbooks(dir: &Path) -> Result<WorkbookSet, RelationError> {
    let mut files = Vec::new();
    collect_workbooks(dir, &mut files)?;
    files.sort();

    let mut set = WorkbookSet::default();
    for path in files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let role = classify_workbook(&name);
        debug!(workbook = %name, ?role, "workbook classified");
        let slot = match role {
            WorkbookRole::Reference => &mut set.reference,
            WorkbookRole::Maintenance => &mut set.maintenance,
            WorkbookRole::Unclassified => {
                set.unclassified.push(path);
                continue;
            }
        };
        match slot.as_ref() {
            Some(existing) => warn!(
                kept = %existing.display(),
                ignored = %path.display(),
                "more than one workbook with the same role"
            ),
            None => *slot = Some(path),
        }
    }

    if set.is_empty() {
        return Err(RelationError::NoWorkbook(dir.to_path_buf()));
    }
    Ok(set)
}

fn collect_workbooks(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), RelationError> {
    let io_err = |source| RelationError::Io {
        path: dir.to_path_buf(),
        source,
    };
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'));
        if hidden {
            continue;
        }
        if path.is_dir() {
            collect_workbooks(&path, out)?;
        } else if has_workbook_extension(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn has_workbook_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            WORKBOOK_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}
