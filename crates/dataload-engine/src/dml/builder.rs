use dataload_core::{DialectProfile, Value};

use super::strategy::{IgnoreShape, MergeSource, UpsertShape, strategy_for};
use crate::ImportError;
use crate::constants::{ConstantColumnValues, ConstantValue};
use crate::protocol::TableIdentifier;

/// Where the value for one placeholder comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// Index into the mapped row
    Row(usize),
    /// Index into the per-row constant values
    Constant(usize),
}

/// SQL text with positional placeholders and the source of each placeholder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementTemplate {
    pub sql: String,
    pub bindings: Vec<Binding>,
}

impl StatementTemplate {
    pub fn placeholder_count(&self) -> usize {
        self.bindings.len()
    }

    /// Parameters for one execution
    pub fn parameters(&self, row: &[Value], constants: &[Value]) -> Vec<Value> {
        self.bindings
            .iter()
            .map(|binding| {
                let value = match binding {
                    Binding::Row(i) => row.get(*i),
                    Binding::Constant(i) => constants.get(*i),
                };
                value.cloned().unwrap_or(Value::Null)
            })
            .collect()
    }
}

/// One target column with the expression that supplies its value
#[derive(Debug, Clone)]
struct ValueSlot {
    column: String,
    expression: String,
    binding: Option<Binding>,
}

#[derive(Default)]
struct SqlWriter {
    sql: String,
    bindings: Vec<Binding>,
}

impl SqlWriter {
    fn push(&mut self, text: &str) {
        self.sql.push_str(text);
    }

    fn push_slot(&mut self, slot: &ValueSlot) {
        self.sql.push_str(&slot.expression);
        if let Some(binding) = slot.binding {
            self.bindings.push(binding);
        }
    }

    fn push_slots(&mut self, slots: &[&ValueSlot]) {
        for (i, slot) in slots.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.push_slot(slot);
        }
    }

    fn finish(self) -> StatementTemplate {
        StatementTemplate {
            sql: self.sql,
            bindings: self.bindings,
        }
    }
}

/// Builds the DML statements for one target table.
///
/// `columns` are the mapped target columns in row order; row value `i` is
/// bound to `columns[i]`. Constant columns follow the row columns.
pub struct StatementBuilder<'a> {
    profile: &'a DialectProfile,
    table: &'a TableIdentifier,
    columns: &'a [String],
    key_columns: &'a [String],
    constants: &'a ConstantColumnValues,
    where_clause: Option<&'a str>,
}

impl<'a> StatementBuilder<'a> {
    pub fn new(
        profile: &'a DialectProfile,
        table: &'a TableIdentifier,
        columns: &'a [String],
        key_columns: &'a [String],
        constants: &'a ConstantColumnValues,
    ) -> Self {
        Self {
            profile,
            table,
            columns,
            key_columns,
            constants,
            where_clause: None,
        }
    }

    pub fn with_where_clause(mut self, clause: Option<&'a str>) -> Self {
        self.where_clause = clause.filter(|c| !c.trim().is_empty());
        self
    }

    fn quote(&self, name: &str) -> String {
        self.profile.quote_if_needed(name)
    }

    fn table_expression(&self) -> String {
        self.table.expression(self.profile)
    }

    fn is_key(&self, column: &str) -> bool {
        self.key_columns.iter().any(|k| k.eq_ignore_ascii_case(column))
    }

    fn slots(&self) -> Vec<ValueSlot> {
        let mut slots: Vec<ValueSlot> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, column)| ValueSlot {
                column: column.clone(),
                expression: "?".to_string(),
                binding: Some(Binding::Row(i)),
            })
            .collect();

        for (i, constant) in self.constants.columns().iter().enumerate() {
            let slot = match &constant.value {
                ConstantValue::Expression(expression) => ValueSlot {
                    column: constant.column.clone(),
                    expression: expression.clone(),
                    binding: None,
                },
                ConstantValue::Literal(_) | ConstantValue::Select { .. } => ValueSlot {
                    column: constant.column.clone(),
                    expression: "?".to_string(),
                    binding: Some(Binding::Constant(i)),
                },
            };
            slots.push(slot);
        }
        slots
    }

    fn key_slots<'s>(&self, slots: &'s [ValueSlot]) -> Result<Vec<&'s ValueSlot>, ImportError> {
        if self.key_columns.is_empty() {
            return Err(ImportError::NoKeyColumns(self.table.to_string()));
        }
        self.key_columns
            .iter()
            .map(|key| {
                slots
                    .iter()
                    .find(|s| s.column.eq_ignore_ascii_case(key))
                    .ok_or_else(|| ImportError::ColumnNotFound {
                        table: self.table.to_string(),
                        column: key.clone(),
                    })
            })
            .collect()
    }

    fn column_list(&self, slots: &[&ValueSlot]) -> String {
        slots
            .iter()
            .map(|s| self.quote(&s.column))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn write_insert(&self, writer: &mut SqlWriter, verb: &str, slots: &[&ValueSlot]) {
        writer.push(&format!(
            "{} {} ({}) VALUES (",
            verb,
            self.table_expression(),
            self.column_list(slots)
        ));
        writer.push_slots(slots);
        writer.push(")");
    }

    /// `INSERT INTO t (cols) VALUES (...)`
    pub fn build_insert(&self) -> StatementTemplate {
        let slots = self.slots();
        let all: Vec<&ValueSlot> = slots.iter().collect();
        let mut writer = SqlWriter::default();
        self.write_insert(&mut writer, "INSERT INTO", &all);
        writer.finish()
    }

    /// `UPDATE t SET col = ? ... WHERE key = ? ...`
    ///
    /// Keys supplied by constant literals are inlined as SQL literals.
    pub fn build_update(&self) -> Result<StatementTemplate, ImportError> {
        let slots = self.slots();
        let keys = self.key_slots(&slots)?;
        let settable: Vec<&ValueSlot> = slots.iter().filter(|s| !self.is_key(&s.column)).collect();
        if settable.is_empty() {
            return Err(ImportError::NoUpdateColumns(self.table.to_string()));
        }

        let mut writer = SqlWriter::default();
        writer.push(&format!("UPDATE {} SET ", self.table_expression()));
        for (i, slot) in settable.iter().enumerate() {
            if i > 0 {
                writer.push(", ");
            }
            writer.push(&format!("{} = ", self.quote(&slot.column)));
            writer.push_slot(slot);
        }

        writer.push(" WHERE ");
        for (i, slot) in keys.iter().enumerate() {
            if i > 0 {
                writer.push(" AND ");
            }
            writer.push(&format!("{} = ", self.quote(&slot.column)));
            match slot.binding {
                Some(Binding::Constant(index)) => match self.constants.columns().get(index) {
                    Some(constant) => match &constant.value {
                        ConstantValue::Literal(text) => writer.push(&sql_literal(text)),
                        _ => writer.push_slot(slot),
                    },
                    None => writer.push_slot(slot),
                },
                _ => writer.push_slot(slot),
            }
        }

        if let Some(clause) = self.where_clause {
            let clause = clause.trim();
            let upper = clause.to_ascii_uppercase();
            if upper.starts_with("AND ") || upper.starts_with("OR ") {
                writer.push(" ");
                writer.push(clause);
            } else {
                writer.push(&format!(" AND ({})", clause));
            }
        }

        Ok(writer.finish())
    }

    /// Native upsert, or `None` when the dialect has none
    pub fn build_upsert(&self) -> Result<Option<StatementTemplate>, ImportError> {
        let Some(shape) = strategy_for(self.profile).upsert else {
            return Ok(None);
        };
        let slots = self.slots();
        let all: Vec<&ValueSlot> = slots.iter().collect();
        let keys = if shape.needs_key_columns() {
            self.key_slots(&slots)?
        } else {
            Vec::new()
        };
        let updates: Vec<&ValueSlot> = slots.iter().filter(|s| !self.is_key(&s.column)).collect();

        let mut writer = SqlWriter::default();
        match shape {
            UpsertShape::OnConflict => {
                self.write_insert(&mut writer, "INSERT INTO", &all);
                writer.push(&format!(" ON CONFLICT ({}) DO ", self.column_list(&keys)));
                if updates.is_empty() {
                    writer.push("NOTHING");
                } else {
                    let set = updates
                        .iter()
                        .map(|s| {
                            let column = self.quote(&s.column);
                            format!("{} = EXCLUDED.{}", column, column)
                        })
                        .collect::<Vec<_>>()
                        .join(", ");
                    writer.push(&format!("UPDATE SET {}", set));
                }
            }
            UpsertShape::OnDuplicateKey => {
                self.write_insert(&mut writer, "INSERT INTO", &all);
                let set = if updates.is_empty() {
                    all.iter()
                        .take(1)
                        .map(|s| {
                            let column = self.quote(&s.column);
                            format!("{} = {}", column, column)
                        })
                        .collect::<Vec<_>>()
                } else {
                    updates
                        .iter()
                        .map(|s| {
                            let column = self.quote(&s.column);
                            format!("{} = VALUES({})", column, column)
                        })
                        .collect::<Vec<_>>()
                };
                writer.push(&format!(" ON DUPLICATE KEY UPDATE {}", set.join(", ")));
            }
            UpsertShape::MergeKey => {
                writer.push(&format!(
                    "MERGE INTO {} ({}) KEY ({}) VALUES (",
                    self.table_expression(),
                    self.column_list(&all),
                    self.column_list(&keys)
                ));
                writer.push_slots(&all);
                writer.push(")");
            }
            UpsertShape::Merge(source) => {
                self.write_merge(&mut writer, source, &all, &keys, Some(&updates));
            }
            UpsertShape::UpdateOrInsert => {
                self.write_insert(&mut writer, "UPDATE OR INSERT INTO", &all);
                writer.push(&format!(" MATCHING ({})", self.column_list(&keys)));
            }
            UpsertShape::UpsertInto => {
                self.write_insert(&mut writer, "UPSERT INTO", &all);
            }
        }
        Ok(Some(writer.finish()))
    }

    /// Native insert-ignore, or `None` when the dialect has none
    pub fn build_insert_ignore(&self) -> Result<Option<StatementTemplate>, ImportError> {
        let Some(shape) = strategy_for(self.profile).insert_ignore else {
            return Ok(None);
        };
        let slots = self.slots();
        let all: Vec<&ValueSlot> = slots.iter().collect();
        let keys = if shape.needs_key_columns() {
            self.key_slots(&slots)?
        } else {
            Vec::new()
        };

        let mut writer = SqlWriter::default();
        match shape {
            IgnoreShape::OnConflictDoNothing => {
                self.write_insert(&mut writer, "INSERT INTO", &all);
                writer.push(" ON CONFLICT DO NOTHING");
            }
            IgnoreShape::InsertOrIgnore => {
                self.write_insert(&mut writer, "INSERT OR IGNORE INTO", &all);
            }
            IgnoreShape::InsertIgnore => {
                self.write_insert(&mut writer, "INSERT IGNORE INTO", &all);
            }
            IgnoreShape::DupKeyIndexHint => {
                let verb = format!(
                    "INSERT /*+ IGNORE_ROW_ON_DUPKEY_INDEX({} ({})) */ INTO",
                    self.table_expression(),
                    self.column_list(&keys)
                );
                self.write_insert(&mut writer, &verb, &all);
            }
            IgnoreShape::Merge(source) => {
                self.write_merge(&mut writer, source, &all, &keys, None);
            }
        }
        Ok(Some(writer.finish()))
    }

    fn write_merge(
        &self,
        writer: &mut SqlWriter,
        source: MergeSource,
        all: &[&ValueSlot],
        keys: &[&ValueSlot],
        updates: Option<&[&ValueSlot]>,
    ) {
        let table = self.table_expression();
        let columns = self.column_list(all);
        let updates = updates.filter(|u| !u.is_empty());

        match source {
            MergeSource::DummyTable(dummy) => {
                writer.push(&format!("MERGE INTO {} tgt USING {} ON (", table, dummy));
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        writer.push(" AND ");
                    }
                    writer.push(&format!("tgt.{} = ", self.quote(&key.column)));
                    writer.push_slot(key);
                }
                writer.push(")");
                if let Some(updates) = updates {
                    writer.push(" WHEN MATCHED THEN UPDATE SET ");
                    for (i, slot) in updates.iter().enumerate() {
                        if i > 0 {
                            writer.push(", ");
                        }
                        writer.push(&format!("{} = ", self.quote(&slot.column)));
                        writer.push_slot(slot);
                    }
                }
                writer.push(&format!(" WHEN NOT MATCHED THEN INSERT ({}) VALUES (", columns));
                writer.push_slots(all);
                writer.push(")");
                return;
            }
            MergeSource::Values => {
                writer.push(&format!("MERGE INTO {} tgt USING (VALUES (", table));
                writer.push_slots(all);
                writer.push(&format!(")) AS src ({})", columns));
            }
            MergeSource::ValuesWithLock => {
                writer.push(&format!(
                    "MERGE INTO {} WITH (HOLDLOCK) AS tgt USING (VALUES (",
                    table
                ));
                writer.push_slots(all);
                writer.push(&format!(")) AS src ({})", columns));
            }
            MergeSource::Dual => {
                writer.push(&format!("MERGE INTO {} tgt USING (SELECT ", table));
                for (i, slot) in all.iter().enumerate() {
                    if i > 0 {
                        writer.push(", ");
                    }
                    writer.push_slot(slot);
                    writer.push(&format!(" AS {}", self.quote(&slot.column)));
                }
                writer.push(" FROM dual) src");
            }
        }

        let on = keys
            .iter()
            .map(|k| {
                let column = self.quote(&k.column);
                format!("tgt.{} = src.{}", column, column)
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        writer.push(&format!(" ON ({})", on));

        if let Some(updates) = updates {
            let set = updates
                .iter()
                .map(|s| {
                    let column = self.quote(&s.column);
                    format!("{} = src.{}", column, column)
                })
                .collect::<Vec<_>>()
                .join(", ");
            writer.push(&format!(" WHEN MATCHED THEN UPDATE SET {}", set));
        }

        let source_columns = all
            .iter()
            .map(|s| format!("src.{}", self.quote(&s.column)))
            .collect::<Vec<_>>()
            .join(", ");
        writer.push(&format!(
            " WHEN NOT MATCHED THEN INSERT ({}) VALUES ({})",
            columns, source_columns
        ));

        if source == MergeSource::ValuesWithLock {
            writer.push(";");
        }
    }
}

/// Quote text as a SQL string literal
pub fn sql_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}
