//! Constant column values and the file-variable context
//!
//! A constant column is defined as `column=value` where value is one of
//!
//! - a literal, bound as a statement parameter; `$[name]` variables are
//!   substituted once per source file
//! - `${expression}`, inlined verbatim into the generated SQL
//!   (e.g. `${current_timestamp}`)
//! - `$@{select ...}`, a select evaluated before every row; `$column` refers to
//!   a source column of the current row and is bound as a parameter

use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use crate::ImportError;

static FILE_VARIABLE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\[([A-Za-z_][A-Za-z0-9_.]*)\]").expect("valid regex"));

static COLUMN_REFERENCE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$([a-zA-Z_][a-zA-Z0-9_]*)").expect("valid regex"));

static STRING_LITERAL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"'(?:[^'\\]|\\.)*'|--[^\n]*|/\*[\s\S]*?\*/").expect("valid regex")
});

pub const VAR_FILE_NAME: &str = "file_name";
pub const VAR_FILE_PATH: &str = "file_path";
pub const VAR_FILE_DIR: &str = "file_dir";
pub const VAR_FILE_BASE: &str = "file_base";

/// Variables available to literal constant values, scoped to one run.
///
/// The file variables are replaced each time a new source file starts.
#[derive(Debug, Clone, Default)]
pub struct FileVariableContext {
    variables: HashMap<String, String>,
}

impl FileVariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variables(variables: HashMap<String, String>) -> Self {
        Self { variables }
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    /// Set `file_name`, `file_path`, `file_dir` and `file_base` for `path`
    pub fn set_source_file(&mut self, path: &Path) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let base = path
            .file_stem()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let dir = path
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();

        self.set(VAR_FILE_NAME, name);
        self.set(VAR_FILE_PATH, path.to_string_lossy().to_string());
        self.set(VAR_FILE_DIR, dir);
        self.set(VAR_FILE_BASE, base);
    }

    /// Replace every known `$[name]`; unknown variables are left as they are
    pub fn substitute(&self, text: &str) -> String {
        FILE_VARIABLE_REGEX
            .replace_all(text, |caps: &regex::Captures<'_>| {
                match self.variables.get(&caps[1]) {
                    Some(value) => value.clone(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }
}

/// The value part of a constant column definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstantValue {
    /// Bound as a parameter
    Literal(String),
    /// Inlined verbatim
    Expression(String),
    /// Evaluated per row; `parameters` are source column names bound in order
    Select { sql: String, parameters: Vec<String> },
}

impl ConstantValue {
    /// Whether the value occupies a placeholder in the generated statement
    pub fn is_bound(&self) -> bool {
        !matches!(self, ConstantValue::Expression(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantColumn {
    pub column: String,
    pub value: ConstantValue,
}

/// The constant columns of an import run
#[derive(Debug, Clone, Default)]
pub struct ConstantColumnValues {
    columns: Vec<ConstantColumn>,
}

impl ConstantColumnValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `column=value` definitions
    pub fn parse<S: AsRef<str>>(definitions: &[S]) -> Result<Self, ImportError> {
        let mut columns: Vec<ConstantColumn> = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let definition = definition.as_ref();
            let Some((column, value)) = definition.split_once('=') else {
                return Err(ImportError::Configuration(format!(
                    "Invalid constant column definition '{}', expected column=value",
                    definition
                )));
            };
            let column = column.trim();
            if column.is_empty() {
                return Err(ImportError::Configuration(format!(
                    "Missing column name in constant definition '{}'",
                    definition
                )));
            }
            if columns.iter().any(|c| c.column.eq_ignore_ascii_case(column)) {
                return Err(ImportError::Configuration(format!(
                    "Constant column '{}' defined more than once",
                    column
                )));
            }
            columns.push(ConstantColumn {
                column: column.to_string(),
                value: parse_value(value.trim()),
            });
        }
        Ok(Self { columns })
    }

    pub fn columns(&self) -> &[ConstantColumn] {
        &self.columns
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn get(&self, column: &str) -> Option<&ConstantColumn> {
        self.columns
            .iter()
            .find(|c| c.column.eq_ignore_ascii_case(column))
    }

    pub fn contains(&self, column: &str) -> bool {
        self.get(column).is_some()
    }

    /// A copy with file variables substituted into literal values
    pub fn resolve(&self, context: &FileVariableContext) -> Self {
        let columns = self
            .columns
            .iter()
            .map(|c| ConstantColumn {
                column: c.column.clone(),
                value: match &c.value {
                    ConstantValue::Literal(text) => {
                        ConstantValue::Literal(context.substitute(text))
                    }
                    other => other.clone(),
                },
            })
            .collect();
        Self { columns }
    }
}

fn parse_value(value: &str) -> ConstantValue {
    if let Some(inner) = value.strip_prefix("$@{").and_then(|v| v.strip_suffix('}')) {
        let (sql, parameters) = bind_column_references(inner.trim());
        return ConstantValue::Select { sql, parameters };
    }
    if let Some(inner) = value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) {
        return ConstantValue::Expression(inner.trim().to_string());
    }
    ConstantValue::Literal(value.to_string())
}

/// Replace `$column` outside string literals and comments with `?`
fn bind_column_references(sql: &str) -> (String, Vec<String>) {
    let skip_ranges: Vec<(usize, usize)> = STRING_LITERAL_REGEX
        .find_iter(sql)
        .map(|m| (m.start(), m.end()))
        .collect();

    let mut result = String::with_capacity(sql.len());
    let mut parameters = Vec::new();
    let mut last_end = 0;

    for caps in COLUMN_REFERENCE_REGEX.captures_iter(sql) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        if skip_ranges
            .iter()
            .any(|(start, end)| whole.start() >= *start && whole.start() < *end)
        {
            continue;
        }
        result.push_str(&sql[last_end..whole.start()]);
        result.push('?');
        parameters.push(caps[1].to_string());
        last_end = whole.end();
    }
    result.push_str(&sql[last_end..]);

    (result, parameters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    #[test]
    fn parses_all_value_kinds() {
        let constants = ConstantColumnValues::parse(&[
            "source=import",
            "created=${current_timestamp}",
            "dept_id=$@{select id from dept where name = $dept_name}",
        ])
        .expect("valid definitions");

        assert_eq!(constants.len(), 3);
        assert_eq!(
            constants.get("SOURCE").map(|c| &c.value),
            Some(&ConstantValue::Literal("import".into()))
        );
        assert_eq!(
            constants.get("created").map(|c| &c.value),
            Some(&ConstantValue::Expression("current_timestamp".into()))
        );
        assert_eq!(
            constants.get("dept_id").map(|c| &c.value),
            Some(&ConstantValue::Select {
                sql: "select id from dept where name = ?".into(),
                parameters: vec!["dept_name".into()],
            })
        );
    }

    #[test]
    fn column_references_inside_literals_are_kept() {
        let (sql, params) = bind_column_references("select id from t where a = '$x' and b = $y");
        assert_eq!(sql, "select id from t where a = '$x' and b = ?");
        assert_eq!(params, vec!["y".to_string()]);
    }

    #[test]
    fn rejects_malformed_definitions() {
        assert!(ConstantColumnValues::parse(&["no_equals_sign"]).is_err());
        assert!(ConstantColumnValues::parse(&["=value"]).is_err());
        assert!(ConstantColumnValues::parse(&["a=1", "A=2"]).is_err());
    }

    #[test]
    fn file_variables_are_substituted_per_file() {
        let constants =
            ConstantColumnValues::parse(&["origin=$[file_name] ($[batch])", "x=$[unknown]"])
                .expect("valid definitions");

        let mut context = FileVariableContext::new();
        context.set("batch", "7");
        context.set_source_file(&PathBuf::from("/data/in/person.txt"));

        let resolved = constants.resolve(&context);
        assert_eq!(
            resolved.get("origin").map(|c| &c.value),
            Some(&ConstantValue::Literal("person.txt (7)".into()))
        );
        assert_eq!(
            resolved.get("x").map(|c| &c.value),
            Some(&ConstantValue::Literal("$[unknown]".into()))
        );
        assert_eq!(context.get(VAR_FILE_BASE), Some("person"));
        assert_eq!(context.get(VAR_FILE_DIR), Some("/data/in"));
    }
}
