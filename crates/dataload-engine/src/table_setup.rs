//! Per-table preparation shared by both engines
//!
//! Resolves the target table once per table-switch event: column mapping,
//! key columns, the effective import mode and the prepared statements.

use dataload_core::{ColumnInfo, Connection, DialectProfile, Value};
use std::path::{Path, PathBuf};

use crate::ImportError;
use crate::constants::{ConstantColumnValues, ConstantValue};
use crate::dml::{
    KeyRequirement, StatementBuilder, StatementTemplate, has_native_insert_ignore, strategy_for,
};
use crate::options::{ImportMode, ImportOptions};
use crate::protocol::{ColumnIdentifier, TableIdentifier};

const TABLE_STATEMENT_SAVEPOINT: &str = "dataload_table_statement";

/// A source column and where its values go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportColumn {
    pub source: ColumnIdentifier,
    /// Index into the mapped row, `None` when the column is skipped
    pub target: Option<usize>,
}

impl ImportColumn {
    pub fn is_skipped(&self) -> bool {
        self.target.is_none()
    }
}

/// How the value of a constant column is obtained for each row
#[derive(Debug, Clone, PartialEq)]
pub enum ConstantSlot {
    Fixed(Value),
    /// `source_indices` point into the raw source row
    Select { sql: String, source_indices: Vec<usize> },
    /// Inlined into the statement text
    Inline,
}

/// How the content of a large object file is bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobKind {
    Text,
    Binary,
    /// Text when the file is valid UTF-8, bytes otherwise
    Detect,
}

/// Statements prepared for the effective mode
#[derive(Debug, Clone, Default)]
pub struct PreparedStatements {
    /// INSERT, native upsert or native insert-ignore
    pub insert: Option<StatementTemplate>,
    pub update: Option<StatementTemplate>,
}

/// Everything needed to write rows into one target table
#[derive(Debug, Clone)]
pub struct TablePlan {
    pub table: TableIdentifier,
    pub expression: String,
    pub columns: Vec<ImportColumn>,
    /// Mapped target column names in mapped-row order
    pub target_columns: Vec<String>,
    /// Catalog view of the target table (empty when unknown)
    pub target_info: Vec<ColumnInfo>,
    pub lob_columns: Vec<(usize, LobKind)>,
    pub key_columns: Vec<String>,
    pub constants: Vec<ConstantSlot>,
    /// Requested mode after downgrades
    pub mode: ImportMode,
    /// Plain INSERT standing in for insert-ignore; key violations are skipped
    pub ignore_key_violations: bool,
    pub statements: PreparedStatements,
    pub batch: bool,
    pub source_dir: Option<PathBuf>,
    /// Non-fatal findings to be added to the message log
    pub warnings: Vec<String>,
}

impl TablePlan {
    /// Project a raw source row onto the mapped target columns
    pub fn map_row(&self, values: &[Value]) -> Vec<Value> {
        let mut mapped = vec![Value::Null; self.target_columns.len()];
        for (column, value) in self.columns.iter().zip(values) {
            if let Some(index) = column.target {
                mapped[index] = value.clone();
            }
        }
        mapped
    }
}

/// Resolves target tables on one connection
pub struct TableSetup<'a> {
    pub connection: &'a dyn Connection,
    pub profile: &'static DialectProfile,
    pub options: &'a ImportOptions,
    /// Constant columns with file variables already substituted
    pub constants: &'a ConstantColumnValues,
}

impl<'a> TableSetup<'a> {
    pub fn new(
        connection: &'a dyn Connection,
        profile: &'static DialectProfile,
        options: &'a ImportOptions,
        constants: &'a ConstantColumnValues,
    ) -> Self {
        Self {
            connection,
            profile,
            options,
            constants,
        }
    }

    #[tracing::instrument(skip(self, table, columns, source_file), fields(table = %table))]
    pub async fn prepare(
        &self,
        table: TableIdentifier,
        columns: Vec<ColumnIdentifier>,
        source_file: Option<&Path>,
    ) -> Result<TablePlan, ImportError> {
        let catalog = self.connection.as_schema_introspection();
        let schema = table.schema.clone();
        let expression = table.expression(self.profile);
        let mut warnings = Vec::new();

        let mut exists = match catalog {
            Some(catalog) => Some(catalog.table_exists(schema.as_deref(), &table.name).await?),
            None => None,
        };

        if self.options.create_target && exists == Some(false) {
            self.create_table(&expression, &columns).await?;
            exists = Some(true);
        }

        if !self.options.skip_target_check && exists == Some(false) {
            return Err(ImportError::TableNotFound(table.to_string()));
        }

        let target_info = match (catalog, exists) {
            (Some(catalog), Some(true)) => catalog.get_columns(schema.as_deref(), &table.name).await?,
            _ => Vec::new(),
        };

        let (columns, target_columns) =
            self.map_columns(&table, columns, &target_info, &mut warnings)?;

        let primary_key = match (catalog, exists) {
            (Some(catalog), Some(true)) => catalog
                .get_primary_key(schema.as_deref(), &table.name)
                .await?
                .map(|pk| pk.columns)
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        let key_columns = self.key_columns(&table, &target_info, &primary_key)?;

        let mut mode = self.options.mode;
        let unique_keys = match (catalog, exists, mode) {
            (Some(catalog), Some(true), ImportMode::Upsert | ImportMode::InsertIgnore) => {
                catalog.get_unique_keys(schema.as_deref(), &table.name).await?
            }
            _ => Vec::new(),
        };
        let native_ignore = mode == ImportMode::InsertIgnore
            && resolve_insert_ignore(self.profile, &key_columns, &primary_key, &unique_keys);
        if mode == ImportMode::InsertIgnore && !native_ignore && has_native_insert_ignore(self.profile)
        {
            tracing::info!(
                table = %table,
                dialect = self.profile.id,
                "key columns do not match a unique key, ignoring key violations of plain inserts"
            );
        }
        if mode == ImportMode::Upsert {
            mode = resolve_upsert(self.profile, &key_columns, &primary_key, &unique_keys);
            if mode != ImportMode::Upsert {
                tracing::info!(
                    table = %table,
                    dialect = self.profile.id,
                    "native upsert not available, using insert/update"
                );
            }
        }

        let source_columns: Vec<&str> = columns.iter().map(|c| c.source.name.as_str()).collect();
        let constants = constant_slots(&table, self.constants, &source_columns)?;

        let builder = StatementBuilder::new(
            self.profile,
            &table,
            &target_columns,
            &key_columns,
            self.constants,
        )
        .with_where_clause(self.options.where_clause.as_deref());

        let mut statements = PreparedStatements::default();
        let mut ignore_key_violations = false;
        if mode.needs_insert() {
            statements.insert = match mode {
                ImportMode::Upsert => builder.build_upsert()?,
                ImportMode::InsertIgnore if native_ignore => match builder.build_insert_ignore() {
                    Ok(Some(template)) => Some(template),
                    Ok(None) | Err(ImportError::NoKeyColumns(_)) => {
                        ignore_key_violations = true;
                        Some(builder.build_insert())
                    }
                    Err(e) => return Err(e),
                },
                ImportMode::InsertIgnore => {
                    ignore_key_violations = true;
                    Some(builder.build_insert())
                }
                _ => Some(builder.build_insert()),
            };
        }
        if mode.needs_update() {
            match builder.build_update() {
                Ok(template) => statements.update = Some(template),
                Err(ImportError::NoUpdateColumns(_)) if mode.is_dual() => {
                    warnings.push(format!(
                        "Table {} has only key columns, rows will only be inserted",
                        table
                    ));
                }
                Err(e) => return Err(e),
            }
        }

        for statement in statements.insert.iter().chain(statements.update.iter()) {
            tracing::debug!(table = %table, sql = %statement.sql, "prepared statement");
        }

        let batch = self.options.batch_enabled() && mode.allows_batch();
        if self.options.use_batch && !batch {
            tracing::debug!(table = %table, mode = %mode, "batching disabled for this mode");
        }

        let lob_columns = self.lob_columns(&columns, &target_columns, &target_info);

        Ok(TablePlan {
            table,
            expression,
            columns,
            target_columns,
            target_info,
            lob_columns,
            key_columns,
            constants,
            mode,
            ignore_key_violations,
            statements,
            batch,
            source_dir: source_file.and_then(|f| f.parent()).map(Path::to_path_buf),
            warnings,
        })
    }

    fn map_columns(
        &self,
        table: &TableIdentifier,
        columns: Vec<ColumnIdentifier>,
        target_info: &[ColumnInfo],
        warnings: &mut Vec<String>,
    ) -> Result<(Vec<ImportColumn>, Vec<String>), ImportError> {
        let mut mapped = Vec::with_capacity(columns.len());
        let mut target_columns: Vec<String> = Vec::with_capacity(columns.len());

        for source in columns {
            // a constant of the same name wins over the source column
            if self.constants.contains(&source.name) {
                mapped.push(ImportColumn {
                    source,
                    target: None,
                });
                continue;
            }

            let target_name = if target_info.is_empty() {
                Some(source.name.clone())
            } else {
                target_info
                    .iter()
                    .find(|c| c.name.eq_ignore_ascii_case(&source.name))
                    .map(|c| c.name.clone())
            };

            match target_name {
                Some(name) if !target_columns.iter().any(|t| t.eq_ignore_ascii_case(&name)) => {
                    target_columns.push(name);
                    mapped.push(ImportColumn {
                        source,
                        target: Some(target_columns.len() - 1),
                    });
                }
                Some(_) => {
                    warnings.push(format!(
                        "Column {} appears more than once in the source, later values are ignored",
                        source.name
                    ));
                    mapped.push(ImportColumn {
                        source,
                        target: None,
                    });
                }
                None if self.options.ignore_missing_columns => {
                    warnings.push(format!(
                        "Column {} not found in table {}, skipped",
                        source.name, table
                    ));
                    mapped.push(ImportColumn {
                        source,
                        target: None,
                    });
                }
                None => {
                    return Err(ImportError::ColumnNotFound {
                        table: table.to_string(),
                        column: source.name,
                    });
                }
            }
        }

        Ok((mapped, target_columns))
    }

    fn key_columns(
        &self,
        table: &TableIdentifier,
        target_info: &[ColumnInfo],
        primary_key: &[String],
    ) -> Result<Vec<String>, ImportError> {
        if self.options.key_columns.is_empty() {
            return Ok(primary_key.to_vec());
        }
        if target_info.is_empty() {
            return Ok(self.options.key_columns.clone());
        }
        self.options
            .key_columns
            .iter()
            .map(|key| {
                target_info
                    .iter()
                    .find(|c| c.name.eq_ignore_ascii_case(key))
                    .map(|c| c.name.clone())
                    .ok_or_else(|| ImportError::ColumnNotFound {
                        table: table.to_string(),
                        column: key.clone(),
                    })
            })
            .collect()
    }

    fn lob_columns(
        &self,
        columns: &[ImportColumn],
        target_columns: &[String],
        target_info: &[ColumnInfo],
    ) -> Vec<(usize, LobKind)> {
        columns
            .iter()
            .filter(|c| {
                self.options
                    .lob_columns
                    .iter()
                    .any(|l| l.eq_ignore_ascii_case(&c.source.name))
            })
            .filter_map(|c| c.target)
            .map(|index| {
                let info = target_columns.get(index).and_then(|name| {
                    target_info
                        .iter()
                        .find(|i| i.name.eq_ignore_ascii_case(name))
                });
                let kind = match info {
                    Some(info) if info.is_blob() => LobKind::Binary,
                    Some(info) if info.is_clob() => LobKind::Text,
                    _ => LobKind::Detect,
                };
                (index, kind)
            })
            .collect()
    }

    async fn create_table(
        &self,
        expression: &str,
        columns: &[ColumnIdentifier],
    ) -> Result<(), ImportError> {
        let mut names: Vec<&str> = columns
            .iter()
            .map(|c| c.name.as_str())
            .filter(|name| !self.constants.contains(name))
            .collect();
        names.extend(self.constants.columns().iter().map(|c| c.column.as_str()));

        let mut definitions: Vec<String> = names
            .iter()
            .map(|name| format!("{} TEXT", self.profile.quote_if_needed(name)))
            .collect();
        let keys: Vec<String> = self
            .options
            .key_columns
            .iter()
            .filter(|k| names.iter().any(|n| n.eq_ignore_ascii_case(k)))
            .map(|k| self.profile.quote_if_needed(k))
            .collect();
        if !keys.is_empty() {
            definitions.push(format!("PRIMARY KEY ({})", keys.join(", ")));
        }

        let sql = format!("CREATE TABLE {} ({})", expression, definitions.join(", "));
        tracing::info!(sql = %sql, "creating target table");
        self.connection.execute(&sql, &[]).await?;
        Ok(())
    }
}

/// Upsert stays native only when the dialect has it and the key columns
/// satisfy the dialect's conflict detection; otherwise insert/update is used.
pub fn resolve_upsert(
    profile: &DialectProfile,
    key_columns: &[String],
    primary_key: &[String],
    unique_keys: &[Vec<String>],
) -> ImportMode {
    let strategy = strategy_for(profile);
    let Some(shape) = strategy.upsert else {
        return ImportMode::InsertUpdate;
    };
    if shape.needs_key_columns() && key_columns.is_empty() {
        return ImportMode::InsertUpdate;
    }
    let usable = keys_satisfy(
        strategy.upsert_key,
        shape.needs_key_columns(),
        key_columns,
        primary_key,
        unique_keys,
    );
    if usable {
        ImportMode::Upsert
    } else {
        ImportMode::InsertUpdate
    }
}

/// Whether the dialect's native insert-ignore can be used with these key
/// columns. When it cannot, a plain INSERT whose key violations are skipped
/// stands in for it.
pub fn resolve_insert_ignore(
    profile: &DialectProfile,
    key_columns: &[String],
    primary_key: &[String],
    unique_keys: &[Vec<String>],
) -> bool {
    let strategy = strategy_for(profile);
    let Some(shape) = strategy.insert_ignore else {
        return false;
    };
    if shape.needs_key_columns() && key_columns.is_empty() {
        return false;
    }
    keys_satisfy(
        strategy.insert_ignore_key,
        shape.needs_key_columns(),
        key_columns,
        primary_key,
        unique_keys,
    )
}

fn keys_satisfy(
    requirement: KeyRequirement,
    needs_key_columns: bool,
    key_columns: &[String],
    primary_key: &[String],
    unique_keys: &[Vec<String>],
) -> bool {
    match requirement {
        KeyRequirement::AnyColumns => true,
        KeyRequirement::PrimaryKey => same_columns(key_columns, primary_key),
        KeyRequirement::UniqueKey => {
            // without explicit keys the statement relies on the table's keys
            (key_columns.is_empty() && !needs_key_columns)
                || same_columns(key_columns, primary_key)
                || unique_keys.iter().any(|u| same_columns(key_columns, u))
        }
    }
}

fn same_columns(a: &[String], b: &[String]) -> bool {
    !a.is_empty()
        && a.len() == b.len()
        && a.iter().all(|x| b.iter().any(|y| y.eq_ignore_ascii_case(x)))
}

fn constant_slots(
    table: &TableIdentifier,
    constants: &ConstantColumnValues,
    source_columns: &[&str],
) -> Result<Vec<ConstantSlot>, ImportError> {
    constants
        .columns()
        .iter()
        .map(|constant| match &constant.value {
            ConstantValue::Literal(text) => Ok(ConstantSlot::Fixed(Value::String(text.clone()))),
            ConstantValue::Expression(_) => Ok(ConstantSlot::Inline),
            ConstantValue::Select { sql, parameters } => {
                let source_indices = parameters
                    .iter()
                    .map(|name| {
                        source_columns
                            .iter()
                            .position(|c| c.eq_ignore_ascii_case(name))
                            .ok_or_else(|| ImportError::ColumnNotFound {
                                table: table.to_string(),
                                column: name.clone(),
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ConstantSlot::Select {
                    sql: sql.clone(),
                    source_indices,
                })
            }
        })
        .collect()
}

/// `DELETE FROM` the target table
pub async fn delete_table_contents(
    connection: &dyn Connection,
    profile: &DialectProfile,
    table: &TableIdentifier,
) -> Result<u64, ImportError> {
    let sql = format!("DELETE FROM {}", table.expression(profile));
    let deleted = connection.execute(&sql, &[]).await?.affected_rows;
    tracing::info!(table = %table, rows = deleted, "deleted target table contents");
    Ok(deleted)
}

/// Substitute `${table.name}` and `${table.expression}`
pub fn table_statement_sql(template: &str, table: &TableIdentifier, profile: &DialectProfile) -> String {
    template
        .replace("${table.name}", &table.name)
        .replace("${table.expression}", &table.expression(profile))
}

/// Run a pre/post table statement inside a savepoint.
///
/// Returns a warning when the statement failed and errors are ignored.
pub async fn run_table_statement(
    connection: &dyn Connection,
    sql: &str,
    ignore_errors: bool,
) -> Result<Option<String>, ImportError> {
    let savepoint = match connection.as_savepoint_support() {
        Some(support) if connection.in_transaction() => {
            Some((support, support.savepoint(TABLE_STATEMENT_SAVEPOINT).await?))
        }
        _ => None,
    };

    match connection.execute(sql, &[]).await {
        Ok(_) => {
            if let Some((support, savepoint)) = &savepoint {
                support.release_savepoint(savepoint).await?;
            }
            tracing::debug!(sql = %sql, "table statement executed");
            Ok(None)
        }
        Err(e) => {
            if let Some((support, savepoint)) = &savepoint {
                support.rollback_to_savepoint(savepoint).await?;
            }
            let message = format!("Error running statement {}: {}", sql, e);
            if ignore_errors {
                Ok(Some(message))
            } else {
                Err(ImportError::Statement(message))
            }
        }
    }
}

/// Bring identity/sequence counters in line with the imported data.
///
/// Returns the number of adjusted columns.
pub async fn adjust_sequences(
    connection: &dyn Connection,
    profile: &DialectProfile,
    plan: &TablePlan,
) -> Result<usize, ImportError> {
    let identity: Vec<&ColumnInfo> = plan
        .target_info
        .iter()
        .filter(|c| {
            c.is_auto_increment
                || c.default_value
                    .as_deref()
                    .is_some_and(|d| d.to_ascii_lowercase().starts_with("nextval("))
        })
        .collect();

    let mut adjusted = 0;
    for column in identity {
        let quoted = profile.quote_if_needed(&column.name);
        match profile.id {
            "postgres" | "cockroach" => {
                let sql = format!(
                    "SELECT setval(pg_get_serial_sequence('{}', '{}'), COALESCE(MAX({}), 1)) FROM {}",
                    plan.expression.replace('\'', "''"),
                    column.name.replace('\'', "''"),
                    quoted,
                    plan.expression
                );
                connection.query(&sql, &[]).await?;
            }
            "mysql" => {
                let max = connection
                    .query(&format!("SELECT MAX({}) FROM {}", quoted, plan.expression), &[])
                    .await?
                    .scalar()
                    .and_then(Value::as_i64);
                let Some(max) = max else {
                    continue;
                };
                connection
                    .execute(
                        &format!("ALTER TABLE {} AUTO_INCREMENT = {}", plan.expression, max + 1),
                        &[],
                    )
                    .await?;
            }
            // sqlite_sequence follows inserted values by itself
            _ => continue,
        }
        adjusted += 1;
        tracing::debug!(table = %plan.table, column = %column.name, "sequence adjusted");
    }
    Ok(adjusted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TrackingConnection;
    use dataload_core::get_dialect_profile;
    use pretty_assertions::assert_eq;

    fn columns(names: &[&str]) -> Vec<ColumnIdentifier> {
        names.iter().map(|n| ColumnIdentifier::new(*n)).collect()
    }

    fn profile(id: &str) -> &'static DialectProfile {
        get_dialect_profile(id).expect("known dialect")
    }

    #[tokio::test]
    async fn maps_columns_case_insensitively_and_skips_constants() {
        let conn = TrackingConnection::new("sqlite").with_table(&["id", "Name", "source"], &["id"]);
        let options = ImportOptions::default();
        let constants = ConstantColumnValues::parse(&["source=batch"]).expect("constants");
        let setup = TableSetup::new(&conn, profile("sqlite"), &options, &constants);

        let plan = setup
            .prepare(
                TableIdentifier::new("person"),
                columns(&["ID", "name", "source"]),
                None,
            )
            .await
            .expect("plan");

        assert_eq!(plan.target_columns, vec!["id".to_string(), "Name".to_string()]);
        assert!(plan.columns[2].is_skipped());
        assert_eq!(plan.constants, vec![ConstantSlot::Fixed(Value::from("batch"))]);
        assert_eq!(
            plan.statements.insert.as_ref().map(|s| s.sql.clone()),
            Some("INSERT INTO person (id, Name, source) VALUES (?, ?, ?)".to_string())
        );
        assert_eq!(
            plan.map_row(&[Value::Int64(1), Value::from("a"), Value::from("ignored")]),
            vec![Value::Int64(1), Value::from("a")]
        );
    }

    #[tokio::test]
    async fn missing_table_and_column_are_table_level_errors() {
        let options = ImportOptions::default();
        let constants = ConstantColumnValues::new();

        let conn = TrackingConnection::new("sqlite").without_table();
        let setup = TableSetup::new(&conn, profile("sqlite"), &options, &constants);
        let err = setup
            .prepare(TableIdentifier::new("nope"), columns(&["a"]), None)
            .await
            .expect_err("missing table");
        assert!(matches!(err, ImportError::TableNotFound(_)));
        assert!(err.is_table_level());

        let conn = TrackingConnection::new("sqlite").with_table(&["id"], &["id"]);
        let setup = TableSetup::new(&conn, profile("sqlite"), &options, &constants);
        let err = setup
            .prepare(TableIdentifier::new("t"), columns(&["id", "extra"]), None)
            .await
            .expect_err("missing column");
        assert!(matches!(err, ImportError::ColumnNotFound { .. }));

        let options = ImportOptions {
            ignore_missing_columns: true,
            ..Default::default()
        };
        let setup = TableSetup::new(&conn, profile("sqlite"), &options, &constants);
        let plan = setup
            .prepare(TableIdentifier::new("t"), columns(&["id", "extra"]), None)
            .await
            .expect("plan");
        assert_eq!(plan.warnings.len(), 1);
        assert!(plan.columns[1].is_skipped());
    }

    #[tokio::test]
    async fn update_modes_fail_fast_without_keys() {
        let conn = TrackingConnection::new("sqlite").with_table(&["a", "b"], &[]);
        let options = ImportOptions::default().with_mode(ImportMode::InsertUpdate);
        let constants = ConstantColumnValues::new();
        let setup = TableSetup::new(&conn, profile("sqlite"), &options, &constants);
        let err = setup
            .prepare(TableIdentifier::new("t"), columns(&["a", "b"]), None)
            .await
            .expect_err("no keys");
        assert!(matches!(err, ImportError::NoKeyColumns(_)));
    }

    #[tokio::test]
    async fn only_key_columns_is_warning_in_dual_mode_and_error_in_update() {
        let conn = TrackingConnection::new("sqlite").with_table(&["id"], &["id"]);
        let constants = ConstantColumnValues::new();

        let options = ImportOptions::default().with_mode(ImportMode::InsertUpdate);
        let setup = TableSetup::new(&conn, profile("sqlite"), &options, &constants);
        let plan = setup
            .prepare(TableIdentifier::new("t"), columns(&["id"]), None)
            .await
            .expect("plan");
        assert!(plan.statements.update.is_none());
        assert_eq!(plan.warnings.len(), 1);

        let options = ImportOptions::default().with_mode(ImportMode::Update);
        let setup = TableSetup::new(&conn, profile("sqlite"), &options, &constants);
        let err = setup
            .prepare(TableIdentifier::new("t"), columns(&["id"]), None)
            .await
            .expect_err("nothing to update");
        assert!(matches!(err, ImportError::NoUpdateColumns(_)));
    }

    #[tokio::test]
    async fn upsert_downgrades_without_native_support() {
        let conn = TrackingConnection::new("firebird").with_table(&["id", "name"], &["id"]);
        let options = ImportOptions::default()
            .with_mode(ImportMode::Upsert)
            .with_batch_size(10);
        let constants = ConstantColumnValues::new();

        let setup = TableSetup::new(&conn, &dataload_core::GENERIC_PROFILE, &options, &constants);
        let plan = setup
            .prepare(TableIdentifier::new("t"), columns(&["id", "name"]), None)
            .await
            .expect("plan");
        assert_eq!(plan.mode, ImportMode::InsertUpdate);
        assert!(plan.statements.update.is_some());
        assert!(!plan.batch);

        let setup = TableSetup::new(&conn, profile("sqlite"), &options, &constants);
        let plan = setup
            .prepare(TableIdentifier::new("t"), columns(&["id", "name"]), None)
            .await
            .expect("plan");
        assert_eq!(plan.mode, ImportMode::Upsert);
        assert!(plan.batch);
    }

    #[test]
    fn upsert_key_requirements() {
        let keys = vec!["id".to_string()];
        let other = vec!["code".to_string()];
        assert_eq!(
            resolve_upsert(profile("postgres"), &keys, &keys, &[]),
            ImportMode::Upsert
        );
        assert_eq!(
            resolve_upsert(profile("postgres"), &other, &keys, &[]),
            ImportMode::InsertUpdate
        );
        assert_eq!(
            resolve_upsert(profile("postgres"), &other, &keys, &[other.clone()]),
            ImportMode::Upsert
        );
        assert_eq!(
            resolve_upsert(profile("cockroach"), &other, &keys, &[other.clone()]),
            ImportMode::InsertUpdate
        );
        assert_eq!(
            resolve_upsert(profile("h2"), &other, &keys, &[]),
            ImportMode::Upsert
        );
    }

    #[tokio::test]
    async fn insert_ignore_without_native_form_swallows_key_violations() {
        let conn = TrackingConnection::new("h2").with_table(&["id", "name"], &["id"]);
        let options = ImportOptions::default().with_mode(ImportMode::InsertIgnore);
        let constants = ConstantColumnValues::new();
        let setup = TableSetup::new(&conn, profile("h2"), &options, &constants);
        let plan = setup
            .prepare(TableIdentifier::new("t"), columns(&["id", "name"]), None)
            .await
            .expect("plan");
        assert!(plan.ignore_key_violations);
        assert!(
            plan.statements
                .insert
                .is_some_and(|s| s.sql.starts_with("INSERT INTO"))
        );
    }

    #[test]
    fn insert_ignore_key_requirements() {
        let keys = vec!["id".to_string()];
        let other = vec!["code".to_string()];
        assert!(resolve_insert_ignore(profile("oracle"), &keys, &keys, &[]));
        assert!(!resolve_insert_ignore(profile("oracle"), &other, &keys, &[]));
        assert!(resolve_insert_ignore(profile("oracle"), &other, &keys, &[other.clone()]));
        assert!(!resolve_insert_ignore(profile("oracle"), &[], &keys, &[]));
        assert!(resolve_insert_ignore(profile("postgres"), &other, &keys, &[]));
        assert!(!resolve_insert_ignore(profile("h2"), &keys, &keys, &[]));
    }

    #[tokio::test]
    async fn insert_ignore_hint_needs_a_unique_key() {
        let conn = TrackingConnection::new("oracle").with_table(&["id", "code", "name"], &["id"]);
        let constants = ConstantColumnValues::new();

        let options = ImportOptions::default().with_mode(ImportMode::InsertIgnore);
        let setup = TableSetup::new(&conn, profile("oracle"), &options, &constants);
        let plan = setup
            .prepare(TableIdentifier::new("t"), columns(&["id", "code", "name"]), None)
            .await
            .expect("plan");
        assert!(!plan.ignore_key_violations);
        assert!(
            plan.statements
                .insert
                .is_some_and(|s| s.sql.contains("IGNORE_ROW_ON_DUPKEY_INDEX"))
        );

        let options = ImportOptions::default()
            .with_mode(ImportMode::InsertIgnore)
            .with_key_columns(["code"]);
        let setup = TableSetup::new(&conn, profile("oracle"), &options, &constants);
        let plan = setup
            .prepare(TableIdentifier::new("t"), columns(&["id", "code", "name"]), None)
            .await
            .expect("plan");
        assert!(plan.ignore_key_violations);
        assert!(
            plan.statements
                .insert
                .is_some_and(|s| s.sql.starts_with("INSERT INTO"))
        );
    }

    #[tokio::test]
    async fn creates_missing_table_with_key() {
        let conn = TrackingConnection::new("sqlite").without_table();
        let options = ImportOptions::default()
            .with_create_target(true)
            .with_key_columns(["id"]);
        let constants = ConstantColumnValues::parse(&["origin=x"]).expect("constants");
        let setup = TableSetup::new(&conn, profile("sqlite"), &options, &constants);
        let plan = setup
            .prepare(TableIdentifier::new("fresh"), columns(&["id", "name"]), None)
            .await
            .expect("plan");

        assert_eq!(
            conn.executed_sql(),
            vec!["CREATE TABLE fresh (id TEXT, name TEXT, origin TEXT, PRIMARY KEY (id))".to_string()]
        );
        assert_eq!(plan.target_columns, vec!["id".to_string(), "name".to_string()]);
    }

    #[tokio::test]
    async fn select_constant_binds_source_columns() {
        let conn = TrackingConnection::new("sqlite").with_table(&["id", "dept_id"], &["id"]);
        let options = ImportOptions {
            ignore_missing_columns: true,
            ..Default::default()
        };
        let constants =
            ConstantColumnValues::parse(&["dept_id=$@{select id from dept where code = $dept}"])
                .expect("constants");
        let setup = TableSetup::new(&conn, profile("sqlite"), &options, &constants);
        let plan = setup
            .prepare(TableIdentifier::new("emp"), columns(&["id", "dept"]), None)
            .await
            .expect("plan");

        assert_eq!(
            plan.constants,
            vec![ConstantSlot::Select {
                sql: "select id from dept where code = ?".into(),
                source_indices: vec![1],
            }]
        );
        assert!(plan.columns[1].is_skipped());
    }

    #[tokio::test]
    async fn table_statement_failure_is_contained_in_savepoint() {
        let conn = TrackingConnection::new("postgres").fail_on("ANALYZE", None);
        conn.begin().await.expect("begin");
        let table = TableIdentifier::new("person");
        let sql = table_statement_sql("ANALYZE ${table.expression}", &table, profile("postgres"));
        assert_eq!(sql, "ANALYZE person");

        let warning = run_table_statement(&conn, &sql, true).await.expect("ignored");
        assert!(warning.is_some());
        assert_eq!(
            conn.executed_sql(),
            vec![
                "BEGIN".to_string(),
                format!("SAVEPOINT {}", TABLE_STATEMENT_SAVEPOINT),
                "ANALYZE person".to_string(),
                format!("ROLLBACK TO SAVEPOINT {}", TABLE_STATEMENT_SAVEPOINT),
            ]
        );

        let err = run_table_statement(&conn, &sql, false)
            .await
            .expect_err("fatal");
        assert!(matches!(err, ImportError::Statement(_)));
    }

    #[tokio::test]
    async fn sequence_adjustment_per_dialect() {
        let options = ImportOptions::default();
        let constants = ConstantColumnValues::new();

        let conn = TrackingConnection::new("postgres").with_table(&["id", "name"], &["id"]);
        let setup = TableSetup::new(&conn, profile("postgres"), &options, &constants);
        let plan = setup
            .prepare(TableIdentifier::new("person"), columns(&["id", "name"]), None)
            .await
            .expect("plan");
        assert_eq!(adjust_sequences(&conn, profile("postgres"), &plan).await.ok(), Some(1));
        assert!(conn.executed_sql().iter().any(|s| s.starts_with(
            "SELECT setval(pg_get_serial_sequence('person', 'id'), COALESCE(MAX(id), 1)) FROM person"
        )));

        let conn = TrackingConnection::new("mysql")
            .with_table(&["id", "name"], &["id"])
            .with_scalar(Value::Int64(41));
        let plan = TableSetup::new(&conn, profile("mysql"), &options, &constants)
            .prepare(TableIdentifier::new("person"), columns(&["id", "name"]), None)
            .await
            .expect("plan");
        adjust_sequences(&conn, profile("mysql"), &plan).await.expect("adjusted");
        assert!(
            conn.executed_sql()
                .contains(&"ALTER TABLE person AUTO_INCREMENT = 42".to_string())
        );

        let conn = TrackingConnection::new("sqlite").with_table(&["id"], &["id"]);
        let plan = TableSetup::new(&conn, profile("sqlite"), &options, &constants)
            .prepare(TableIdentifier::new("person"), columns(&["id"]), None)
            .await
            .expect("plan");
        assert_eq!(adjust_sequences(&conn, profile("sqlite"), &plan).await.ok(), Some(0));
    }
}
