//! SQL DDL for the embedded vault store.
//! Every column is TEXT; ids are UUID strings and timestamps RFC3339 with
//! microseconds, so lexical order is creation order.

use crate::store::Table;

/// SQLite schema with:
/// - one row per (vault_id, user_id) membership
/// - children removed with their parent (`ON DELETE CASCADE`)
/// - profile emails unique ignoring case, which is how invitations match them
pub const SQLITE_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS profiles (
    id TEXT PRIMARY KEY,
    display_name TEXT NULL,
    email TEXT NULL UNIQUE COLLATE NOCASE,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS vaults (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NULL,
    owner_id TEXT NOT NULL REFERENCES profiles(id),
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS vault_memberships (
    id TEXT PRIMARY KEY,
    vault_id TEXT NOT NULL REFERENCES vaults(id) ON DELETE CASCADE,
    user_id TEXT NOT NULL REFERENCES profiles(id),
    role TEXT NOT NULL CHECK (role IN ('owner', 'contributor', 'viewer')),
    invited_by TEXT NOT NULL REFERENCES profiles(id),
    created_at TEXT NOT NULL,
    UNIQUE (vault_id, user_id)
);

CREATE TABLE IF NOT EXISTS sources (
    id TEXT PRIMARY KEY,
    vault_id TEXT NOT NULL REFERENCES vaults(id) ON DELETE CASCADE,
    title TEXT NOT NULL,
    type TEXT NOT NULL CHECK (type IN ('url', 'note', 'pdf')),
    url TEXT NULL,
    content TEXT NULL,
    created_by TEXT NOT NULL REFERENCES profiles(id),
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS annotations (
    id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
    user_id TEXT NOT NULL REFERENCES profiles(id),
    content TEXT NOT NULL,
    quote TEXT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memberships_user_id ON vault_memberships(user_id);
CREATE INDEX IF NOT EXISTS idx_sources_vault_id ON sources(vault_id);
CREATE INDEX IF NOT EXISTS idx_annotations_source_id ON annotations(source_id);
"#;

/// Column list per table, in DDL order.
pub fn columns(table: Table) -> &'static [&'static str] {
    match table {
        Table::Profiles => &["id", "display_name", "email", "created_at"],
        Table::Vaults => &["id", "name", "description", "owner_id", "created_at"],
        Table::VaultMemberships => &["id", "vault_id", "user_id", "role", "invited_by", "created_at"],
        Table::Sources => &[
            "id",
            "vault_id",
            "title",
            "type",
            "url",
            "content",
            "created_by",
            "created_at",
        ],
        Table::Annotations => &["id", "source_id", "user_id", "content", "quote", "created_at"],
    }
}

/// Tables whose rows are removed by cascade when a row of `table` goes, with the
/// referencing column.
pub fn cascades(table: Table) -> &'static [(Table, &'static str)] {
    match table {
        Table::Vaults => &[(Table::VaultMemberships, "vault_id"), (Table::Sources, "vault_id")],
        Table::Sources => &[(Table::Annotations, "source_id")],
        _ => &[],
    }
}
