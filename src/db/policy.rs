//! Write policy enforced by the embedded store.
//!
//! The client-side role gate only hides affordances; this is the check that
//! actually refuses a write. Reads are not filtered here.

use serde_json::Value;

use crate::db::sqlite::SqlitePool;
use crate::error::VaultError;
use crate::permissions::{Capabilities, Role, capabilities};
use crate::store::Table;

pub(crate) struct AccessPolicy<'a> {
    pool: &'a SqlitePool,
    actor: Option<&'a str>,
}

fn field<'v>(row: &'v Value, column: &str) -> Option<&'v str> {
    row.get(column).and_then(Value::as_str)
}

fn require(allowed: bool, reason: &str) -> Result<(), VaultError> {
    if allowed {
        Ok(())
    } else {
        Err(VaultError::PolicyDenied(reason.to_string()))
    }
}

impl<'a> AccessPolicy<'a> {
    pub(crate) fn new(pool: &'a SqlitePool, actor: Option<&'a str>) -> Self {
        Self { pool, actor }
    }

    fn actor(&self) -> Result<&'a str, VaultError> {
        self.actor
            .ok_or_else(|| VaultError::PolicyDenied("anonymous clients cannot write".to_string()))
    }

    pub(crate) async fn authorize_insert(
        &self,
        table: Table,
        record: &Value,
    ) -> Result<(), VaultError> {
        let actor = self.actor()?;
        match table {
            Table::Profiles => require(
                field(record, "id") == Some(actor),
                "profiles can only be created for yourself",
            ),
            Table::Vaults => require(
                field(record, "owner_id") == Some(actor),
                "vaults must be owned by their creator",
            ),
            Table::VaultMemberships => {
                let vault_id = field(record, "vault_id").unwrap_or_default();
                require(
                    field(record, "invited_by") == Some(actor),
                    "memberships must be granted by the caller",
                )?;
                if Role::from(field(record, "role").unwrap_or_default()) == Role::Owner {
                    let owner = self.vault_owner(vault_id).await?;
                    return require(
                        field(record, "user_id") == Some(actor) && owner.as_deref() == Some(actor),
                        "only the vault owner holds the owner role",
                    );
                }
                let gate = self.capabilities_in(vault_id, actor).await?;
                require(gate.can_invite, "inviting members requires contributor or owner")
            }
            Table::Sources => {
                require(
                    field(record, "created_by") == Some(actor),
                    "sources must be created by the caller",
                )?;
                let vault_id = field(record, "vault_id").unwrap_or_default();
                let gate = self.capabilities_in(vault_id, actor).await?;
                require(gate.can_add_source, "adding sources requires contributor or owner")
            }
            Table::Annotations => {
                require(
                    field(record, "user_id") == Some(actor),
                    "annotations must be authored by the caller",
                )?;
                let source_id = field(record, "source_id").unwrap_or_default();
                let Some(vault_id) = self.vault_of_source(source_id).await? else {
                    return Err(VaultError::PolicyDenied("source not found".to_string()));
                };
                let gate = self.capabilities_in(&vault_id, actor).await?;
                require(
                    gate.can_add_annotation,
                    "annotating requires contributor or owner",
                )
            }
        }
    }

    pub(crate) async fn authorize_delete(&self, table: Table, row: &Value) -> Result<(), VaultError> {
        let actor = self.actor()?;
        match table {
            Table::Profiles => require(
                field(row, "id") == Some(actor),
                "profiles can only be removed by themselves",
            ),
            Table::Vaults => require(
                field(row, "owner_id") == Some(actor),
                "only the owner can delete a vault",
            ),
            Table::VaultMemberships => {
                if field(row, "user_id") == Some(actor) {
                    return Ok(());
                }
                let owner = self
                    .vault_owner(field(row, "vault_id").unwrap_or_default())
                    .await?;
                require(
                    owner.as_deref() == Some(actor),
                    "only the owner can remove other members",
                )
            }
            Table::Sources => {
                let vault_id = field(row, "vault_id").unwrap_or_default();
                let gate = self.capabilities_in(vault_id, actor).await?;
                require(gate.can_delete_source, "deleting sources requires contributor or owner")
            }
            Table::Annotations => {
                if field(row, "user_id") == Some(actor) {
                    return Ok(());
                }
                let source_id = field(row, "source_id").unwrap_or_default();
                let gate = match self.vault_of_source(source_id).await? {
                    Some(vault_id) => self.capabilities_in(&vault_id, actor).await?,
                    None => Capabilities::default(),
                };
                require(
                    gate.can_delete_source,
                    "only the author or an editor can remove an annotation",
                )
            }
        }
    }

    async fn role_in(&self, vault_id: &str, user_id: &str) -> Result<Option<Role>, VaultError> {
        let role = sqlx::query_scalar::<_, String>(
            "SELECT role FROM vault_memberships WHERE vault_id = ? AND user_id = ?",
        )
        .bind(vault_id)
        .bind(user_id)
        .fetch_optional(self.pool)
        .await?;
        Ok(role.map(Role::from))
    }

    /// Non-members get the viewer gate, i.e. nothing.
    async fn capabilities_in(&self, vault_id: &str, user_id: &str) -> Result<Capabilities, VaultError> {
        let role = self.role_in(vault_id, user_id).await?.unwrap_or_default();
        Ok(capabilities(role))
    }

    async fn vault_owner(&self, vault_id: &str) -> Result<Option<String>, VaultError> {
        let owner = sqlx::query_scalar::<_, String>("SELECT owner_id FROM vaults WHERE id = ?")
            .bind(vault_id)
            .fetch_optional(self.pool)
            .await?;
        Ok(owner)
    }

    async fn vault_of_source(&self, source_id: &str) -> Result<Option<String>, VaultError> {
        let vault_id = sqlx::query_scalar::<_, String>("SELECT vault_id FROM sources WHERE id = ?")
            .bind(source_id)
            .fetch_optional(self.pool)
            .await?;
        Ok(vault_id)
    }
}
