use crate::config::SchemaMode;

pub const UNIFIED_STRUCTURE_VIEW: &str = "structure_items_unified";

const CATALOG_TABLES: [&str; 2] = ["input_items", "assembly_items"];

fn catalog_table(name: &str, if_not_exists: &str) -> String {
    format!(
        r#"CREATE TABLE {if_not_exists}{name} (
    code INTEGER PRIMARY KEY,
    description TEXT NOT NULL,
    unit TEXT,
    status TEXT NOT NULL DEFAULT 'ACTIVE' CHECK (status IN ('ACTIVE', 'DEACTIVATED'))
)"#
    )
}

fn edge_table(name: &str, child_table: &str, if_not_exists: &str) -> String {
    format!(
        r#"CREATE TABLE {if_not_exists}{name} (
    parent_code INTEGER NOT NULL REFERENCES assembly_items (code),
    child_code INTEGER NOT NULL REFERENCES {child_table} (code),
    coefficient NUMERIC,
    PRIMARY KEY (parent_code, child_code)
)"#
    )
}

fn fact_table(name: &str, catalog: &str, if_not_exists: &str) -> String {
    format!(
        r#"CREATE TABLE {if_not_exists}{name} (
    item_code INTEGER NOT NULL REFERENCES {catalog} (code),
    region VARCHAR(2) NOT NULL,
    reference_date DATE NOT NULL,
    regime TEXT NOT NULL CHECK (regime IN ('NAO_DESONERADO', 'DESONERADO', 'SEM_ENCARGOS')),
    value NUMERIC,
    PRIMARY KEY (item_code, region, reference_date, regime)
)"#
    )
}

/// DDL in dependency order: catalogs, then edges and facts, then the
/// maintenance log and the unified view.
pub fn create_statements(mode: SchemaMode) -> Vec<String> {
    let if_not_exists = match mode {
        SchemaMode::Reset => "",
        SchemaMode::Preserve => "IF NOT EXISTS ",
    };
    let mut statements: Vec<String> = CATALOG_TABLES
        .iter()
        .map(|name| catalog_table(name, if_not_exists))
        .collect();
    statements.push(edge_table("assembly_input_edges", "input_items", if_not_exists));
    statements.push(edge_table(
        "assembly_subassembly_edges",
        "assembly_items",
        if_not_exists,
    ));
    statements.push(fact_table("input_prices_monthly", "input_items", if_not_exists));
    statements.push(fact_table(
        "assembly_costs_monthly",
        "assembly_items",
        if_not_exists,
    ));
    statements.push(format!(
        r#"CREATE TABLE {if_not_exists}maintenance_events (
    item_code INTEGER NOT NULL,
    item_type TEXT NOT NULL CHECK (item_type IN ('INPUT', 'ASSEMBLY')),
    reference_date DATE NOT NULL,
    event_type TEXT NOT NULL,
    item_description TEXT,
    PRIMARY KEY (item_code, item_type, reference_date, event_type)
)"#
    ));
    statements.push(format!(
        r#"CREATE OR REPLACE VIEW {UNIFIED_STRUCTURE_VIEW} AS
SELECT parent_code, child_code, 'INPUT' AS child_type, coefficient
  FROM assembly_input_edges
UNION ALL
SELECT parent_code, child_code, 'ASSEMBLY' AS child_type, coefficient
  FROM assembly_subassembly_edges"#
    ));
    statements
}

/// Drops in reverse dependency order. Empty for `Preserve`.
pub fn drop_statements(mode: SchemaMode) -> Vec<String> {
    if mode == SchemaMode::Preserve {
        return Vec::new();
    }
    let mut statements = vec![format!("DROP VIEW IF EXISTS {UNIFIED_STRUCTURE_VIEW}")];
    statements.extend(
        [
            "maintenance_events",
            "assembly_costs_monthly",
            "input_prices_monthly",
            "assembly_subassembly_edges",
            "assembly_input_edges",
            "assembly_items",
            "input_items",
        ]
        .iter()
        .map(|table| format!("DROP TABLE IF EXISTS {table} CASCADE")),
    );
    statements
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Table;

    #[test]
    fn reset_drops_every_table_before_recreating() {
        let drops = drop_statements(SchemaMode::Reset);
        for table in Table::ALL {
            assert!(drops.iter().any(|s| s.ends_with(&format!("{} CASCADE", table.name()))));
        }
        assert!(drops[0].contains(UNIFIED_STRUCTURE_VIEW));
    }

    #[test]
    fn preserve_keeps_existing_tables() {
        assert!(drop_statements(SchemaMode::Preserve).is_empty());
        let creates = create_statements(SchemaMode::Preserve);
        assert!(creates
            .iter()
            .filter(|s| s.starts_with("CREATE TABLE"))
            .all(|s| s.contains("IF NOT EXISTS")));
    }

    #[test]
    fn every_table_is_created_with_its_declared_key() {
        let creates = create_statements(SchemaMode::Reset);
        for table in Table::ALL {
            let ddl = creates
                .iter()
                .find(|s| s.starts_with(&format!("CREATE TABLE {} (", table.name())))
                .unwrap();
            let key = table.primary_key();
            if key.len() == 1 {
                assert!(ddl.contains(&format!("{} INTEGER PRIMARY KEY", key[0])));
            } else {
                assert!(ddl.contains(&format!("PRIMARY KEY ({})", key.join(", "))));
            }
        }
    }
}
