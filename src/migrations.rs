use sqlx::migrate::Migrator;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::policy::PolicySet;

/// The schema and row-level policies, embedded from `./migrations` at compile time.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const PURPOSE_HEADER: &str = "-- Purpose:";
const RESOURCES_HEADER: &str = "-- Resources:";

/// MigrationUnit
///
/// One versioned migration as far as the layout check cares.
#[derive(Debug, Clone)]
pub struct MigrationUnit {
    pub version: i64,
    pub description: String,
    pub sql: String,
}

/// The units embedded in `MIGRATOR`, in version order.
pub fn shipped_units() -> Vec<MigrationUnit> {
    MIGRATOR
        .iter()
        .filter(|m| !m.migration_type.is_down_migration())
        .map(|m| MigrationUnit {
            version: m.version,
            description: m.description.to_string(),
            sql: m.sql.to_string(),
        })
        .collect()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("migration {version} does not have a 14-digit timestamp version")]
    BadVersion { version: i64 },
    #[error("migration {version} is not after {previous}")]
    OutOfOrder { version: i64, previous: i64 },
    #[error("migration {version} is missing the `{header}` header")]
    MissingHeader { version: i64, header: &'static str },
    #[error("migration {version} creates policy {name} which has no rule")]
    UnknownPolicy { version: i64, name: String },
    #[error("migration {version} creates policy {name} unlike its rule: expected `{expected}`, found `{found}`")]
    Diverged {
        version: i64,
        name: String,
        expected: String,
        found: String,
    },
    #[error("migration {version} creates policy {name} FOR ALL operations")]
    ForAll { version: i64, name: String },
    #[error("migration {version} grants policy {name} to several roles")]
    SeveralRoles { version: i64, name: String },
    #[error("migration {version} creates policy {name} which already exists")]
    Duplicate { version: i64, name: String },
    #[error("no migration creates policy {name}")]
    MissingPolicy { name: String },
    #[error("no migration enables row level security on {table}")]
    RlsDisabled { table: String },
}

/// verify_layout
///
/// Checks migration units against the `PolicySet` before anything is applied:
///
/// * versions are 14-digit timestamps in strictly increasing order;
/// * each unit opens with `-- Purpose:` and `-- Resources:` headers;
/// * each `CREATE POLICY` is the exact statement rendered for one rule, grants one
///   role and names one operation;
/// * after replaying `DROP POLICY` statements, every rule has its policy and every
///   governed table has row level security enabled.
pub fn verify_layout(policies: &PolicySet, units: &[MigrationUnit]) -> Result<(), LayoutError> {
    let mut previous: Option<i64> = None;
    let mut active: HashMap<String, i64> = HashMap::new();
    let mut secured: HashSet<String> = HashSet::new();

    for unit in units {
        let version = unit.version;
        if !(10_000_000_000_000..100_000_000_000_000).contains(&version) {
            return Err(LayoutError::BadVersion { version });
        }
        if let Some(previous) = previous.filter(|p| *p >= version) {
            return Err(LayoutError::OutOfOrder { version, previous });
        }
        previous = Some(version);

        for header in [PURPOSE_HEADER, RESOURCES_HEADER] {
            if !header_lines(&unit.sql).any(|line| line.starts_with(header)) {
                return Err(LayoutError::MissingHeader { version, header });
            }
        }

        for statement in statements(&unit.sql) {
            let upper = statement.to_ascii_uppercase();
            if upper.starts_with("CREATE POLICY") {
                let name = quoted_name(&statement).unwrap_or_default();
                check_create(policies, version, &name, &statement, &upper)?;
                if active.insert(name.clone(), version).is_some() {
                    return Err(LayoutError::Duplicate { version, name });
                }
            } else if upper.starts_with("DROP POLICY") {
                if let Some(name) = quoted_name(&statement) {
                    active.remove(&name);
                }
            } else if upper.starts_with("ALTER TABLE") && upper.ends_with("ENABLE ROW LEVEL SECURITY") {
                if let Some(table) = statement.split_whitespace().nth(2) {
                    secured.insert(table.to_string());
                }
            }
        }
    }

    let mut rules: Vec<_> = policies.rules().collect();
    rules.sort_by_key(|rule| rule.name());
    for rule in rules {
        if !active.contains_key(&rule.name()) {
            return Err(LayoutError::MissingPolicy { name: rule.name() });
        }
    }

    for resource in policies.resources() {
        let table = resource.qualified();
        if !secured.contains(&table) {
            return Err(LayoutError::RlsDisabled { table });
        }
    }

    Ok(())
}

fn check_create(
    policies: &PolicySet,
    version: i64,
    name: &str,
    statement: &str,
    upper: &str,
) -> Result<(), LayoutError> {
    if upper.contains(" FOR ALL ") {
        return Err(LayoutError::ForAll {
            version,
            name: name.to_string(),
        });
    }

    let roles = upper
        .split_once(" TO ")
        .map(|(_, rest)| rest.split(" USING ").next().unwrap_or(rest))
        .map(|rest| rest.split(" WITH CHECK ").next().unwrap_or(rest))
        .unwrap_or_default();
    if roles.contains(',') {
        return Err(LayoutError::SeveralRoles {
            version,
            name: name.to_string(),
        });
    }

    let Some(rule) = policies.rule_named(name) else {
        return Err(LayoutError::UnknownPolicy {
            version,
            name: name.to_string(),
        });
    };

    let expected = normalize(&rule.statement());
    if expected != statement {
        return Err(LayoutError::Diverged {
            version,
            name: name.to_string(),
            expected,
            found: statement.to_string(),
        });
    }
    Ok(())
}

// Leading comment block of a unit.
fn header_lines(sql: &str) -> impl Iterator<Item = &str> {
    sql.lines()
        .map(str::trim)
        .take_while(|line| line.is_empty() || line.starts_with("--"))
}

// Statements with comments stripped and whitespace collapsed. Splitting on `;`
// also cuts through dollar-quoted bodies; none of those fragments starts with a
// keyword checked here.
fn statements(sql: &str) -> Vec<String> {
    let stripped: String = sql
        .lines()
        .map(|line| line.split("--").next().unwrap_or_default())
        .collect::<Vec<_>>()
        .join("\n");

    stripped
        .split(';')
        .map(normalize)
        .filter(|statement| !statement.is_empty())
        .collect()
}

fn normalize(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn quoted_name(statement: &str) -> Option<String> {
    let (_, rest) = statement.split_once('"')?;
    let (name, _) = rest.split_once('"')?;
    Some(name.to_string())
}
