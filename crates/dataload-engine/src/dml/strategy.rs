//! Per-dialect capability table for upsert and insert-ignore

use dataload_core::DialectProfile;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Row source of a MERGE statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeSource {
    /// `USING (VALUES (...)) AS src (cols)`
    Values,
    /// Same as `Values` with a `HOLDLOCK` table hint and a terminating `;`
    ValuesWithLock,
    /// `USING (SELECT ? AS col, ... FROM dual) src`
    Dual,
    /// `USING <dummy table> ON (key = ?)`, parameters repeated per clause
    DummyTable(&'static str),
}

/// Statement shape used for a native upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertShape {
    /// `INSERT ... ON CONFLICT (keys) DO UPDATE SET col = EXCLUDED.col`
    OnConflict,
    /// `INSERT ... ON DUPLICATE KEY UPDATE col = VALUES(col)`
    OnDuplicateKey,
    /// `MERGE INTO t (cols) KEY (keys) VALUES (...)`
    MergeKey,
    /// `MERGE ... WHEN MATCHED THEN UPDATE ... WHEN NOT MATCHED THEN INSERT ...`
    Merge(MergeSource),
    /// `UPDATE OR INSERT INTO t (cols) VALUES (...) MATCHING (keys)`
    UpdateOrInsert,
    /// `UPSERT INTO t (cols) VALUES (...)`
    UpsertInto,
}

impl UpsertShape {
    pub fn needs_key_columns(&self) -> bool {
        !matches!(self, UpsertShape::OnDuplicateKey | UpsertShape::UpsertInto)
    }
}

/// Statement shape used for a native insert-ignore
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreShape {
    /// `INSERT ... ON CONFLICT DO NOTHING`
    OnConflictDoNothing,
    /// `INSERT OR IGNORE INTO ...`
    InsertOrIgnore,
    /// `INSERT IGNORE INTO ...`
    InsertIgnore,
    /// `INSERT /*+ IGNORE_ROW_ON_DUPKEY_INDEX(t (keys)) */ INTO ...`
    DupKeyIndexHint,
    /// `MERGE ... WHEN NOT MATCHED THEN INSERT ...`
    Merge(MergeSource),
}

impl IgnoreShape {
    pub fn needs_key_columns(&self) -> bool {
        matches!(self, IgnoreShape::DupKeyIndexHint | IgnoreShape::Merge(_))
    }
}

/// Which key the conflict detection of a shape relies on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRequirement {
    /// The key columns are matched explicitly, any columns work
    AnyColumns,
    /// The key columns must form a unique key (or the primary key)
    UniqueKey,
    /// The key columns must be the primary key
    PrimaryKey,
}

/// DML capabilities of one dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmlStrategy {
    pub dialect: &'static str,
    pub upsert: Option<UpsertShape>,
    pub upsert_key: KeyRequirement,
    pub insert_ignore: Option<IgnoreShape>,
    pub insert_ignore_key: KeyRequirement,
}

impl DmlStrategy {
    pub const fn none(dialect: &'static str) -> Self {
        Self {
            dialect,
            upsert: None,
            upsert_key: KeyRequirement::AnyColumns,
            insert_ignore: None,
            insert_ignore_key: KeyRequirement::AnyColumns,
        }
    }

    const fn with_upsert(mut self, shape: UpsertShape, key: KeyRequirement) -> Self {
        self.upsert = Some(shape);
        self.upsert_key = key;
        self
    }

    const fn with_insert_ignore(mut self, shape: IgnoreShape, key: KeyRequirement) -> Self {
        self.insert_ignore = Some(shape);
        self.insert_ignore_key = key;
        self
    }

    pub fn supports_upsert(&self) -> bool {
        self.upsert.is_some()
    }

    /// Insert-ignore always works: without a native form, key violations of
    /// a plain INSERT are swallowed.
    pub fn supports_insert_ignore(&self) -> bool {
        true
    }

    pub fn has_native_insert_ignore(&self) -> bool {
        self.insert_ignore.is_some()
    }
}

static GENERIC_STRATEGY: DmlStrategy = DmlStrategy::none("generic");

static DML_STRATEGIES: LazyLock<HashMap<&'static str, DmlStrategy>> = LazyLock::new(|| {
    use IgnoreShape as I;
    use KeyRequirement as K;
    use UpsertShape as U;

    let strategies = [
        DmlStrategy::none("postgres")
            .with_upsert(U::OnConflict, K::UniqueKey)
            .with_insert_ignore(I::OnConflictDoNothing, K::AnyColumns),
        DmlStrategy::none("cockroach")
            .with_upsert(U::UpsertInto, K::PrimaryKey)
            .with_insert_ignore(I::OnConflictDoNothing, K::AnyColumns),
        DmlStrategy::none("sqlite")
            .with_upsert(U::OnConflict, K::UniqueKey)
            .with_insert_ignore(I::InsertOrIgnore, K::AnyColumns),
        DmlStrategy::none("mysql")
            .with_upsert(U::OnDuplicateKey, K::UniqueKey)
            .with_insert_ignore(I::InsertIgnore, K::AnyColumns),
        DmlStrategy::none("h2").with_upsert(U::MergeKey, K::AnyColumns),
        DmlStrategy::none("hsqldb")
            .with_upsert(U::Merge(MergeSource::Values), K::AnyColumns)
            .with_insert_ignore(I::Merge(MergeSource::Values), K::AnyColumns),
        DmlStrategy::none("db2")
            .with_upsert(U::Merge(MergeSource::Values), K::AnyColumns)
            .with_insert_ignore(I::Merge(MergeSource::Values), K::AnyColumns),
        DmlStrategy::none("ansi")
            .with_upsert(U::Merge(MergeSource::Values), K::AnyColumns)
            .with_insert_ignore(I::Merge(MergeSource::Values), K::AnyColumns),
        DmlStrategy::none("mssql")
            .with_upsert(U::Merge(MergeSource::ValuesWithLock), K::AnyColumns)
            .with_insert_ignore(I::Merge(MergeSource::ValuesWithLock), K::AnyColumns),
        DmlStrategy::none("oracle")
            .with_upsert(U::Merge(MergeSource::Dual), K::AnyColumns)
            .with_insert_ignore(I::DupKeyIndexHint, K::UniqueKey),
        DmlStrategy::none("firebird").with_upsert(U::UpdateOrInsert, K::AnyColumns),
        DmlStrategy::none("derby")
            .with_upsert(
                U::Merge(MergeSource::DummyTable("SYSIBM.SYSDUMMY1")),
                K::AnyColumns,
            )
            .with_insert_ignore(
                I::Merge(MergeSource::DummyTable("SYSIBM.SYSDUMMY1")),
                K::AnyColumns,
            ),
    ];

    strategies.into_iter().map(|s| (s.dialect, s)).collect()
});

/// Strategy for a dialect; unknown dialects get no native capabilities
pub fn strategy_for(profile: &DialectProfile) -> &'static DmlStrategy {
    DML_STRATEGIES.get(profile.id).unwrap_or(&GENERIC_STRATEGY)
}

pub fn supports_upsert(profile: &DialectProfile) -> bool {
    strategy_for(profile).supports_upsert()
}

pub fn supports_insert_ignore(profile: &DialectProfile) -> bool {
    strategy_for(profile).supports_insert_ignore()
}

pub fn has_native_insert_ignore(profile: &DialectProfile) -> bool {
    strategy_for(profile).has_native_insert_ignore()
}
