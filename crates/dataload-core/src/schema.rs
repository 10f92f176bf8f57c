//! Schema introspection traits and types

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Schema introspection interface
///
/// The import engine only needs catalog lookups for the tables it writes to:
/// column metadata, key columns and foreign keys.
#[async_trait]
pub trait SchemaIntrospection: Send + Sync {
    /// List all tables in a schema
    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<TableInfo>>;

    /// Check whether a table exists (name comparison ignores case)
    async fn table_exists(&self, schema: Option<&str>, table: &str) -> Result<bool> {
        let tables = self.list_tables(schema).await?;
        Ok(tables.iter().any(|t| t.name.eq_ignore_ascii_case(table)))
    }

    /// Get columns for a table, ordered by ordinal position
    async fn get_columns(&self, schema: Option<&str>, table: &str) -> Result<Vec<ColumnInfo>>;

    /// Get foreign keys for a table
    async fn get_foreign_keys(
        &self,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Vec<ForeignKeyInfo>>;

    /// Get primary key for a table
    async fn get_primary_key(
        &self,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Option<PrimaryKeyInfo>>;

    /// Get the column sets of all unique indexes (excluding the primary key)
    async fn get_unique_keys(&self, _schema: Option<&str>, _table: &str) -> Result<Vec<Vec<String>>> {
        Ok(Vec::new())
    }
}

/// Table information (basic)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    pub schema: Option<String>,
    pub name: String,
    pub table_type: TableType,
}

/// Table type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableType {
    Table,
    View,
    Temporary,
    System,
}

/// Column information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub ordinal: usize,
    pub data_type: String,
    pub nullable: bool,
    pub default_value: Option<String>,
    pub is_primary_key: bool,
    pub is_auto_increment: bool,
}

impl ColumnInfo {
    /// Whether the declared type is a character large object type
    pub fn is_clob(&self) -> bool {
        let t = self.data_type.to_ascii_uppercase();
        t.contains("CLOB") || t == "TEXT" || t.contains("LONGTEXT") || t.contains("NTEXT")
    }

    /// Whether the declared type is a binary large object type
    pub fn is_blob(&self) -> bool {
        let t = self.data_type.to_ascii_uppercase();
        t.contains("BLOB") || t.contains("BYTEA") || t.contains("BINARY") || t == "IMAGE"
    }
}

/// Foreign key information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeyInfo {
    pub name: String,
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_schema: Option<String>,
    pub referenced_columns: Vec<String>,
}

/// Primary key information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryKeyInfo {
    pub name: Option<String>,
    pub columns: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(data_type: &str) -> ColumnInfo {
        ColumnInfo {
            name: "c".into(),
            ordinal: 0,
            data_type: data_type.into(),
            nullable: true,
            default_value: None,
            is_primary_key: false,
            is_auto_increment: false,
        }
    }

    #[test]
    fn lob_type_detection() {
        assert!(column("clob").is_clob());
        assert!(column("TEXT").is_clob());
        assert!(!column("VARCHAR(20)").is_clob());
        assert!(column("BLOB").is_blob());
        assert!(column("bytea").is_blob());
        assert!(!column("INTEGER").is_blob());
    }
}
