//! Dialect profile registry
//!
//! Maps a short dialect id (e.g. "postgres", "sqlite") to the metadata the
//! import engine needs: identifier quoting, the error codes that mean
//! "unique key violated", and how a failed statement affects the enclosing
//! transaction.

use crate::DataloadError;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

/// Complete dialect profile for a database product
#[derive(Debug, Clone)]
pub struct DialectProfile {
    /// Unique identifier (matches the driver's dialect id)
    pub id: &'static str,

    /// Human-readable product name
    pub display_name: &'static str,

    /// Opening identifier quote character
    pub quote_open: char,

    /// Closing identifier quote character
    pub quote_close: char,

    /// Whether unquoted identifiers are folded to upper case
    pub folds_to_upper: bool,

    /// SQLSTATE values reported for unique/primary key violations
    pub key_violation_states: &'static [&'static str],

    /// Vendor error codes reported for unique/primary key violations
    pub key_violation_codes: &'static [i32],

    /// A failed statement aborts the whole transaction unless it ran inside a
    /// savepoint (PostgreSQL behaviour)
    pub error_aborts_transaction: bool,
}

impl DialectProfile {
    /// Create a profile with ANSI double-quote quoting and no error codes
    pub const fn new(id: &'static str, display_name: &'static str) -> Self {
        Self {
            id,
            display_name,
            quote_open: '"',
            quote_close: '"',
            folds_to_upper: false,
            key_violation_states: &[],
            key_violation_codes: &[],
            error_aborts_transaction: false,
        }
    }

    pub const fn with_quotes(mut self, open: char, close: char) -> Self {
        self.quote_open = open;
        self.quote_close = close;
        self
    }

    pub const fn with_upper_case_folding(mut self) -> Self {
        self.folds_to_upper = true;
        self
    }

    pub const fn with_key_violation_states(mut self, states: &'static [&'static str]) -> Self {
        self.key_violation_states = states;
        self
    }

    pub const fn with_key_violation_codes(mut self, codes: &'static [i32]) -> Self {
        self.key_violation_codes = codes;
        self
    }

    pub const fn with_aborting_errors(mut self) -> Self {
        self.error_aborts_transaction = true;
        self
    }

    /// Whether any key-violation classification data is configured
    pub fn has_key_violation_config(&self) -> bool {
        !self.key_violation_states.is_empty() || !self.key_violation_codes.is_empty()
    }

    /// Check whether an error reports a unique key violation.
    ///
    /// Returns `None` when the profile carries no classification data, in which
    /// case the caller decides how to treat the failure.
    pub fn is_key_violation(&self, error: &DataloadError) -> Option<bool> {
        if !self.has_key_violation_config() {
            return None;
        }
        let by_state = error
            .sql_state()
            .is_some_and(|s| self.key_violation_states.contains(&s));
        let by_code = error
            .vendor_code()
            .is_some_and(|c| self.key_violation_codes.contains(&c));
        Some(by_state || by_code)
    }

    /// Quote an identifier, doubling any embedded closing quote
    pub fn quote_identifier(&self, name: &str) -> String {
        let close = self.quote_close.to_string();
        let escaped = name.replace(&close, &format!("{}{}", close, close));
        format!("{}{}{}", self.quote_open, escaped, self.quote_close)
    }

    /// Quote an identifier only when it is not a plain identifier
    ///
    /// Plain identifiers start with a letter or underscore, contain only
    /// ASCII alphanumerics and underscores and are not reserved words.
    pub fn quote_if_needed(&self, name: &str) -> String {
        if is_plain_identifier(name) && !is_reserved_word(name) {
            name.to_string()
        } else {
            self.quote_identifier(name)
        }
    }

    /// Quote a possibly qualified name (`schema.table`) part by part
    pub fn quote_qualified(&self, schema: Option<&str>, name: &str) -> String {
        match schema {
            Some(s) if !s.is_empty() => {
                format!("{}.{}", self.quote_if_needed(s), self.quote_if_needed(name))
            }
            _ => self.quote_if_needed(name),
        }
    }
}

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

const RESERVED_WORDS: &[&str] = &[
    "ALL", "AND", "AS", "BY", "CHECK", "COLUMN", "CONSTRAINT", "CREATE", "DEFAULT", "DELETE",
    "DISTINCT", "DROP", "FROM", "GROUP", "HAVING", "IN", "INDEX", "INSERT", "INTO", "IS", "JOIN",
    "KEY", "NOT", "NULL", "ON", "OR", "ORDER", "PRIMARY", "REFERENCES", "SELECT", "SET", "TABLE",
    "TO", "UNION", "UNIQUE", "UPDATE", "USER", "VALUES", "WHERE", "WITH",
];

fn is_reserved_word(name: &str) -> bool {
    RESERVED_WORDS.iter().any(|w| w.eq_ignore_ascii_case(name))
}

/// Global dialect registry
pub struct DialectRegistry {
    profiles: HashMap<&'static str, DialectProfile>,
    aliases: HashMap<&'static str, &'static str>,
}

impl DialectRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            profiles: HashMap::new(),
            aliases: HashMap::new(),
        }
    }

    /// Register a dialect profile
    pub fn register(&mut self, profile: DialectProfile) {
        self.profiles.insert(profile.id, profile);
    }

    /// Register an alternative id for an existing profile
    pub fn alias(&mut self, alias: &'static str, id: &'static str) {
        self.aliases.insert(alias, id);
    }

    /// Get a dialect profile by id or alias
    pub fn get(&self, id: &str) -> Option<&DialectProfile> {
        let id = id.to_ascii_lowercase();
        let key = self.aliases.get(id.as_str()).copied().unwrap_or(id.as_str());
        self.profiles.get(key)
    }

    /// Get all registered dialect ids
    pub fn dialect_ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.profiles.keys().copied()
    }
}

impl Default for DialectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Fallback profile for unknown dialects: ANSI quoting, no error codes
pub static GENERIC_PROFILE: DialectProfile = DialectProfile::new("generic", "Generic SQL");

/// Global dialect registry instance
pub static DIALECT_REGISTRY: LazyLock<Arc<DialectRegistry>> = LazyLock::new(|| {
    let mut registry = DialectRegistry::new();

    registry.register(
        DialectProfile::new("postgres", "PostgreSQL")
            .with_key_violation_states(&["23505"])
            .with_aborting_errors(),
    );
    registry.register(
        DialectProfile::new("mysql", "MySQL")
            .with_quotes('`', '`')
            .with_key_violation_codes(&[1062]),
    );
    registry.register(
        DialectProfile::new("sqlite", "SQLite")
            // SQLITE_CONSTRAINT_UNIQUE, SQLITE_CONSTRAINT_PRIMARYKEY
            .with_key_violation_codes(&[2067, 1555]),
    );
    registry.register(
        DialectProfile::new("oracle", "Oracle")
            .with_upper_case_folding()
            .with_key_violation_codes(&[1]),
    );
    registry.register(
        DialectProfile::new("mssql", "Microsoft SQL Server")
            .with_quotes('[', ']')
            .with_key_violation_codes(&[2627, 2601]),
    );
    registry.register(
        DialectProfile::new("db2", "IBM DB2")
            .with_upper_case_folding()
            .with_key_violation_codes(&[-803]),
    );
    registry.register(
        DialectProfile::new("h2", "H2")
            .with_upper_case_folding()
            .with_key_violation_states(&["23505"]),
    );
    registry.register(
        DialectProfile::new("hsqldb", "HSQLDB")
            .with_upper_case_folding()
            .with_key_violation_codes(&[-104]),
    );
    registry.register(DialectProfile::new("firebird", "Firebird").with_upper_case_folding());
    registry.register(
        DialectProfile::new("derby", "Apache Derby")
            .with_upper_case_folding()
            .with_key_violation_states(&["23505"]),
    );
    registry.register(
        DialectProfile::new("cockroach", "CockroachDB")
            .with_key_violation_states(&["23505"])
            .with_aborting_errors(),
    );
    registry.register(DialectProfile::new("ansi", "ANSI SQL"));

    registry.alias("postgresql", "postgres");
    registry.alias("pg", "postgres");
    registry.alias("mariadb", "mysql");
    registry.alias("sqlserver", "mssql");
    registry.alias("cockroachdb", "cockroach");

    Arc::new(registry)
});

/// Get a dialect profile by id
pub fn get_dialect_profile(id: &str) -> Option<&'static DialectProfile> {
    DIALECT_REGISTRY.get(id)
}

/// Get a dialect profile, falling back to the generic profile
pub fn dialect_profile_or_generic(id: Option<&str>) -> &'static DialectProfile {
    id.and_then(get_dialect_profile).unwrap_or(&GENERIC_PROFILE)
}
