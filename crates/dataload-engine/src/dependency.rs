//! Foreign key dependency ordering of a table set
//!
//! Every table gets a level: 0 for tables that reference nothing, otherwise
//! one more than the highest level of the tables it references. Sorting by
//! level ascending gives an order in which each table comes after everything
//! it depends on (insert order); the exact reverse is a safe delete order.

use async_trait::async_trait;
use dataload_core::SchemaIntrospection;
use std::collections::{HashMap, VecDeque};

use crate::ImportError;
use crate::protocol::TableIdentifier;

/// Source of foreign key references between tables
#[async_trait]
pub trait ReferenceLookup: Send + Sync {
    /// Tables referenced by foreign keys of `table`
    async fn referenced_tables(
        &self,
        table: &TableIdentifier,
    ) -> Result<Vec<TableIdentifier>, ImportError>;
}

/// Reads references from the database catalog
pub struct SchemaReferences<'a> {
    schema: &'a dyn SchemaIntrospection,
}

impl<'a> SchemaReferences<'a> {
    pub fn new(schema: &'a dyn SchemaIntrospection) -> Self {
        Self { schema }
    }
}

#[async_trait]
impl ReferenceLookup for SchemaReferences<'_> {
    async fn referenced_tables(
        &self,
        table: &TableIdentifier,
    ) -> Result<Vec<TableIdentifier>, ImportError> {
        let keys = self
            .schema
            .get_foreign_keys(table.schema.as_deref(), &table.name)
            .await?;
        Ok(keys
            .into_iter()
            .map(|fk| TableIdentifier {
                catalog: None,
                schema: fk.referenced_schema.or_else(|| table.schema.clone()),
                name: fk.referenced_table,
            })
            .collect())
    }
}

/// Fixed reference map, keyed by (optionally schema-qualified) table name
#[derive(Debug, Clone, Default)]
pub struct StaticReferences {
    references: HashMap<String, Vec<TableIdentifier>>,
}

impl StaticReferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// `child` has a foreign key to `parent`; both accept `schema.name`.
    /// An unqualified parent lives in the child's schema.
    pub fn reference(mut self, child: &str, parent: &str) -> Self {
        let child = TableIdentifier::parse(child);
        let mut parent = TableIdentifier::parse(parent);
        if parent.schema.is_none() {
            parent.schema = child.schema.clone();
        }
        self.references
            .entry(table_key(&child))
            .or_default()
            .push(parent);
        self
    }
}

#[async_trait]
impl ReferenceLookup for StaticReferences {
    async fn referenced_tables(
        &self,
        table: &TableIdentifier,
    ) -> Result<Vec<TableIdentifier>, ImportError> {
        Ok(self
            .references
            .get(&table_key(table))
            .cloned()
            .unwrap_or_default())
    }
}

/// A table together with its dependency level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyNode {
    pub table: TableIdentifier,
    pub level: usize,
}

struct GraphNode {
    table: TableIdentifier,
    parents: Vec<String>,
}

#[derive(Clone, Copy)]
enum Visit {
    InProgress,
    Done(usize),
}

/// Case-insensitive graph key; tables of different schemas never merge
fn table_key(table: &TableIdentifier) -> String {
    match table.schema.as_deref().filter(|s| !s.is_empty()) {
        Some(schema) => format!("{}.{}", schema.to_lowercase(), table.name.to_lowercase()),
        None => table.name.to_lowercase(),
    }
}

/// Orders tables so that foreign keys can be satisfied
pub struct TableDependencySorter<'a> {
    lookup: &'a dyn ReferenceLookup,
    add_missing: bool,
}

impl<'a> TableDependencySorter<'a> {
    pub fn new(lookup: &'a dyn ReferenceLookup) -> Self {
        Self {
            lookup,
            add_missing: false,
        }
    }

    /// Keep tables that are only reachable through foreign keys
    pub fn with_add_missing(mut self, add_missing: bool) -> Self {
        self.add_missing = add_missing;
        self
    }

    /// Parents before children
    pub async fn sort_for_insert(
        &self,
        tables: &[TableIdentifier],
    ) -> Result<Vec<TableIdentifier>, ImportError> {
        Ok(self
            .dependency_levels(tables)
            .await?
            .into_iter()
            .map(|node| node.table)
            .collect())
    }

    /// Children before parents, the exact reverse of the insert order
    pub async fn sort_for_delete(
        &self,
        tables: &[TableIdentifier],
    ) -> Result<Vec<TableIdentifier>, ImportError> {
        let mut ordered = self.sort_for_insert(tables).await?;
        ordered.reverse();
        Ok(ordered)
    }

    /// The requested tables with their levels, in insert order
    pub async fn dependency_levels(
        &self,
        tables: &[TableIdentifier],
    ) -> Result<Vec<DependencyNode>, ImportError> {
        let (graph, discovered) = self.load_graph(tables).await?;

        let mut visits: HashMap<String, Visit> = HashMap::new();
        for key in &discovered {
            level_of(key, &graph, &mut visits)?;
        }

        // Requested tables keep their position within a level; tables found
        // through references follow in discovery order.
        let mut seen = std::collections::HashSet::new();
        let mut nodes: Vec<(usize, usize, TableIdentifier)> = Vec::new();
        for table in tables {
            let key = table_key(table);
            if !seen.insert(key.clone()) {
                continue;
            }
            if let Some(Visit::Done(level)) = visits.get(&key) {
                nodes.push((*level, nodes.len(), table.clone()));
            }
        }
        if self.add_missing {
            for key in &discovered {
                if !seen.insert(key.clone()) {
                    continue;
                }
                if let (Some(node), Some(Visit::Done(level))) = (graph.get(key), visits.get(key)) {
                    nodes.push((*level, nodes.len(), node.table.clone()));
                }
            }
        }

        nodes.sort_by_key(|(level, position, _)| (*level, *position));
        tracing::debug!(tables = nodes.len(), "computed table dependency levels");

        Ok(nodes
            .into_iter()
            .map(|(level, _, table)| DependencyNode { table, level })
            .collect())
    }

    async fn load_graph(
        &self,
        tables: &[TableIdentifier],
    ) -> Result<(HashMap<String, GraphNode>, Vec<String>), ImportError> {
        let mut graph: HashMap<String, GraphNode> = HashMap::new();
        let mut discovered = Vec::new();
        let mut pending: VecDeque<TableIdentifier> = tables.iter().cloned().collect();

        while let Some(table) = pending.pop_front() {
            let key = table_key(&table);
            if graph.contains_key(&key) {
                continue;
            }

            let mut parents = Vec::new();
            for parent in self.lookup.referenced_tables(&table).await? {
                let parent_key = table_key(&parent);
                // self references do not constrain the order
                if parent_key == key || parents.contains(&parent_key) {
                    continue;
                }
                parents.push(parent_key.clone());
                if !graph.contains_key(&parent_key) {
                    pending.push_back(parent);
                }
            }

            discovered.push(key.clone());
            graph.insert(key, GraphNode { table, parents });
        }

        Ok((graph, discovered))
    }
}

fn level_of(
    key: &str,
    graph: &HashMap<String, GraphNode>,
    visits: &mut HashMap<String, Visit>,
) -> Result<usize, ImportError> {
    match visits.get(key) {
        Some(Visit::Done(level)) => return Ok(*level),
        Some(Visit::InProgress) => {
            let table = graph
                .get(key)
                .map(|node| node.table.name.clone())
                .unwrap_or_else(|| key.to_string());
            return Err(ImportError::DependencyCycle { table });
        }
        None => {}
    }

    let Some(node) = graph.get(key) else {
        return Ok(0);
    };

    visits.insert(key.to_string(), Visit::InProgress);
    let mut level = 0;
    for parent in &node.parents {
        level = level.max(level_of(parent, graph, visits)? + 1);
    }
    visits.insert(key.to_string(), Visit::Done(level));
    Ok(level)
}
