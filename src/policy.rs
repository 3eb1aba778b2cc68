use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::capability::{Identity, Role};
use crate::repository::Row;

/// Resource
///
/// A named collection of rows. Each variant maps to one table in the `public`
/// schema and carries the whitelist of columns the storage layer may address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Projects,
    Comments,
}

impl Resource {
    pub const ALL: [Resource; 2] = [Resource::Projects, Resource::Comments];

    /// Unqualified table name, as used in policy names and column references.
    pub fn table(self) -> &'static str {
        match self {
            Resource::Projects => "projects",
            Resource::Comments => "comments",
        }
    }

    /// Schema-qualified table name used in SQL.
    pub fn qualified(self) -> String {
        format!("public.{}", self.table())
    }

    pub fn columns(self) -> &'static [&'static str] {
        match self {
            Resource::Projects => &[
                "id",
                "owner_id",
                "title",
                "summary",
                "is_public",
                "created_at",
                "updated_at",
            ],
            Resource::Comments => &["id", "project_id", "author_id", "body", "created_at"],
        }
    }

    pub fn has_column(self, column: &str) -> bool {
        self.columns().contains(&column)
    }

    /// Newest rows come first in every listing.
    pub fn order_column(self) -> &'static str {
        "created_at"
    }

    /// Resources whose rows reference this one and go away with it (`ON DELETE CASCADE`).
    pub fn dependents(self) -> &'static [(Resource, &'static str)] {
        match self {
            Resource::Projects => &[(Resource::Comments, "project_id")],
            Resource::Comments => &[],
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// Operation
///
/// The fixed set of row operations every resource exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Select,
        Operation::Insert,
        Operation::Update,
        Operation::Delete,
    ];

    pub fn keyword(self) -> &'static str {
        match self {
            Operation::Select => "SELECT",
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }

    fn slug(self) -> &'static str {
        match self {
            Operation::Select => "select",
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Predicate
///
/// Declarative boolean expression over a candidate row and the caller's identity.
/// The same expression is evaluated in memory by the in-process store and rendered
/// to SQL for the row-level policies of the database, so both storage backends
/// enforce one definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Every row qualifies.
    Always,
    /// The boolean column is `true`.
    Flag(&'static str),
    /// The uuid column equals the caller's subject id. Never true for anonymous callers.
    OwnedBy(&'static str),
    /// The row referenced by `column` is visible to the caller under the parent's
    /// select rule.
    ParentVisible {
        column: &'static str,
        parent: Resource,
    },
    Either(Box<Predicate>, Box<Predicate>),
    Both(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    pub fn either(a: Predicate, b: Predicate) -> Self {
        Predicate::Either(Box::new(a), Box::new(b))
    }

    pub fn both(a: Predicate, b: Predicate) -> Self {
        Predicate::Both(Box::new(a), Box::new(b))
    }

    /// Renders the predicate as a SQL boolean expression for a policy on `resource`.
    pub fn sql(&self, resource: Resource) -> String {
        match self {
            Predicate::Always => "true".to_string(),
            Predicate::Flag(column) => (*column).to_string(),
            Predicate::OwnedBy(column) => format!("{column} = auth.uid()"),
            Predicate::ParentVisible { column, parent } => format!(
                "EXISTS (SELECT 1 FROM {} AS parent WHERE parent.id = {}.{column})",
                parent.qualified(),
                resource.table()
            ),
            // AND binds tighter than OR, so OR children need no parentheses.
            Predicate::Either(a, b) => format!("{} OR {}", a.sql(resource), b.sql(resource)),
            Predicate::Both(a, b) => format!(
                "{} AND {}",
                a.sql_operand(resource),
                b.sql_operand(resource)
            ),
        }
    }

    fn sql_operand(&self, resource: Resource) -> String {
        match self {
            Predicate::Either(..) => format!("({})", self.sql(resource)),
            _ => self.sql(resource),
        }
    }

    fn holds(
        &self,
        policies: &PolicySet,
        identity: &Identity,
        row: &Row,
        lookup: &dyn RowLookup,
    ) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::Flag(column) => matches!(row.get(*column), Some(Value::Bool(true))),
            Predicate::OwnedBy(column) => match (identity.subject_id(), row.get(*column)) {
                (Some(subject), Some(Value::String(owner))) => {
                    owner.parse::<uuid::Uuid>().ok() == Some(subject)
                }
                _ => false,
            },
            Predicate::ParentVisible { column, parent } => {
                let Some(parent_id) = row.get(*column) else {
                    return false;
                };
                match lookup.find(*parent, parent_id) {
                    Some(parent_row) => policies
                        .evaluate(*parent, Operation::Select, identity, &parent_row, lookup)
                        .is_allowed(),
                    None => false,
                }
            }
            Predicate::Either(a, b) => {
                a.holds(policies, identity, row, lookup) || b.holds(policies, identity, row, lookup)
            }
            Predicate::Both(a, b) => {
                a.holds(policies, identity, row, lookup) && b.holds(policies, identity, row, lookup)
            }
        }
    }
}

/// RowLookup
///
/// Gives predicates that reference other resources read access to committed rows
/// by primary key.
pub trait RowLookup {
    fn find(&self, resource: Resource, id: &Value) -> Option<Row>;
}

/// Decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allow
    }
}

/// PolicyRule
///
/// One authorization rule for exactly one (resource, operation, role) triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    pub resource: Resource,
    pub operation: Operation,
    pub role: Role,
    pub predicate: Predicate,
}

impl PolicyRule {
    pub fn new(resource: Resource, operation: Operation, role: Role, predicate: Predicate) -> Self {
        Self {
            resource,
            operation,
            role,
            predicate,
        }
    }

    /// Policy name as stored in the database: `<table>_<operation>_<role>`.
    pub fn name(&self) -> String {
        format!("{}_{}_{}", self.resource.table(), self.operation, self.role)
    }

    /// statement
    ///
    /// Renders the `CREATE POLICY` statement (without the trailing semicolon) that
    /// enforces this rule inside the database. Reads and deletes filter through
    /// `USING`, inserts check the new row with `WITH CHECK`, and updates do both.
    pub fn statement(&self) -> String {
        let expr = self.predicate.sql(self.resource);
        let clause = match self.operation {
            Operation::Select | Operation::Delete => format!("USING ({expr})"),
            Operation::Insert => format!("WITH CHECK ({expr})"),
            Operation::Update => format!("USING ({expr}) WITH CHECK ({expr})"),
        };
        format!(
            "CREATE POLICY \"{}\" ON {} FOR {} TO {} {}",
            self.name(),
            self.resource.qualified(),
            self.operation.keyword(),
            self.role.db_role(),
            clause
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("duplicate rule for {operation} on {resource} by role {role}")]
    DuplicateRule {
        resource: Resource,
        operation: Operation,
        role: Role,
    },
}

type RuleKey = (Resource, Operation, Role);

/// PolicySet
///
/// The complete authorization table, keyed by (resource, operation, role). A key
/// without an entry denies the operation: empty reads, rejected writes.
/// Loaded once at startup and shared read-only.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    rules: HashMap<RuleKey, PolicyRule>,
}

impl PolicySet {
    pub fn builder() -> PolicySetBuilder {
        PolicySetBuilder::default()
    }

    /// portal
    ///
    /// The rule set shipped with the service. The `migrations/` directory must
    /// carry exactly these policies (checked by `migrations::verify_layout`).
    pub fn portal() -> Result<Self, PolicyError> {
        use Operation::*;
        use Resource::*;
        use Role::*;

        let project_visible = Predicate::either(
            Predicate::Flag("is_public"),
            Predicate::OwnedBy("owner_id"),
        );
        let parent_visible = Predicate::ParentVisible {
            column: "project_id",
            parent: Projects,
        };

        PolicySet::builder()
            .rule(Projects, Select, Anon, Predicate::Flag("is_public"))
            .rule(Projects, Select, Authenticated, project_visible)
            .rule(Projects, Insert, Authenticated, Predicate::OwnedBy("owner_id"))
            .rule(Projects, Update, Authenticated, Predicate::OwnedBy("owner_id"))
            .rule(Projects, Delete, Authenticated, Predicate::OwnedBy("owner_id"))
            .rule(Comments, Select, Anon, parent_visible.clone())
            .rule(Comments, Select, Authenticated, parent_visible.clone())
            .rule(
                Comments,
                Insert,
                Authenticated,
                Predicate::both(Predicate::OwnedBy("author_id"), parent_visible),
            )
            .rule(Comments, Delete, Authenticated, Predicate::OwnedBy("author_id"))
            .build()
    }

    pub fn rule(&self, resource: Resource, operation: Operation, role: Role) -> Option<&PolicyRule> {
        self.rules.get(&(resource, operation, role))
    }

    pub fn rule_named(&self, name: &str) -> Option<&PolicyRule> {
        self.rules.values().find(|rule| rule.name() == name)
    }

    pub fn rules(&self) -> impl Iterator<Item = &PolicyRule> {
        self.rules.values()
    }

    /// Everything `role` may do, ordered by resource then operation.
    pub fn rules_for(&self, role: Role) -> Vec<&PolicyRule> {
        let mut rules: Vec<_> = self.rules.values().filter(|r| r.role == role).collect();
        rules.sort_by_key(|r| (r.resource.table(), r.operation.slug()));
        rules
    }

    pub fn resources(&self) -> Vec<Resource> {
        Resource::ALL
            .into_iter()
            .filter(|res| self.rules.keys().any(|(r, _, _)| r == res))
            .collect()
    }

    /// evaluate
    ///
    /// Decides whether `identity` may perform `operation` on `row`. The role is
    /// derived from the identity itself; there is no way to ask on behalf of a
    /// different role.
    pub fn evaluate(
        &self,
        resource: Resource,
        operation: Operation,
        identity: &Identity,
        row: &Row,
        lookup: &dyn RowLookup,
    ) -> Decision {
        match self.rule(resource, operation, identity.role()) {
            Some(rule) if rule.predicate.holds(self, identity, row, lookup) => Decision::Allow,
            _ => Decision::Deny,
        }
    }
}

#[derive(Debug, Default)]
pub struct PolicySetBuilder {
    rules: Vec<PolicyRule>,
}

impl PolicySetBuilder {
    pub fn rule(
        mut self,
        resource: Resource,
        operation: Operation,
        role: Role,
        predicate: Predicate,
    ) -> Self {
        self.rules
            .push(PolicyRule::new(resource, operation, role, predicate));
        self
    }

    pub fn build(self) -> Result<PolicySet, PolicyError> {
        let mut rules = HashMap::new();
        for rule in self.rules {
            let key = (rule.resource, rule.operation, rule.role);
            if rules.contains_key(&key) {
                return Err(PolicyError::DuplicateRule {
                    resource: rule.resource,
                    operation: rule.operation,
                    role: rule.role,
                });
            }
            rules.insert(key, rule);
        }
        Ok(PolicySet { rules })
    }
}
