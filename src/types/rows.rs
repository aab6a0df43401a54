use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::permissions::Role;

pub type ProfileId = String;
pub type VaultId = String;
pub type SourceId = String;
pub type AnnotationId = String;
pub type MembershipId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: ProfileId,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vault {
    pub id: VaultId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub owner_id: ProfileId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub id: MembershipId,
    pub vault_id: VaultId,
    pub user_id: ProfileId,
    pub role: Role,
    pub invited_by: ProfileId,
    /// When the member joined.
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Url,
    Note,
    Pdf,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Url => "url",
            SourceKind::Note => "note",
            SourceKind::Pdf => "pdf",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub vault_id: VaultId,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: SourceKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    pub created_by: ProfileId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: AnnotationId,
    pub source_id: SourceId,
    pub user_id: ProfileId,
    pub content: String,
    #[serde(default)]
    pub quote: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn source_reads_store_row() {
        let row = json!({
            "id": "s-1",
            "vault_id": "v-1",
            "title": "IPCC AR6",
            "type": "url",
            "url": "https://www.ipcc.ch/report/ar6/",
            "content": null,
            "created_by": "p-1",
            "created_at": "2026-10-19T08:30:00.000001Z"
        });
        let source: Source = serde_json::from_value(row).unwrap();
        assert_eq!(source.kind, SourceKind::Url);
        assert_eq!(source.url.as_deref(), Some("https://www.ipcc.ch/report/ar6/"));
        assert!(source.content.is_none());
    }

    #[test]
    fn offsets_from_postgres_are_accepted() {
        let row = json!({
            "id": "v-1",
            "name": "Climate",
            "owner_id": "p-1",
            "created_at": "2026-10-19T08:30:00.123456+00:00"
        });
        let vault: Vault = serde_json::from_value(row).unwrap();
        assert!(vault.description.is_none());
    }

    #[test]
    fn membership_carries_join_time() {
        let row = json!({
            "id": "m-1",
            "vault_id": "v-1",
            "user_id": "p-2",
            "role": "contributor",
            "invited_by": "p-1",
            "created_at": "2026-10-19T08:30:00.000001Z"
        });
        let membership: Membership = serde_json::from_value(row).unwrap();
        assert_eq!(membership.role, Role::Contributor);
        assert_eq!(
            membership.created_at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            "2026-10-19T08:30:00.000001Z"
        );
    }
}
