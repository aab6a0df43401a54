use serde::Serialize;

use super::rows::{Annotation, Membership, Source, Vault};
use crate::permissions::{Capabilities, Role, capabilities};

/// Shown when an author or member has no profile name.
pub const UNKNOWN_NAME: &str = "Unknown";

/// One vault card on the vault list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VaultSummary {
    #[serde(flatten)]
    pub vault: Vault,
    pub role: Role,
    pub source_count: u64,
    pub annotation_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VaultListSnapshot {
    pub loading: bool,
    pub vaults: Vec<VaultSummary>,
    /// Message of the most recent failed refetch, cleared by the next success.
    pub last_error: Option<String>,
}

impl Default for VaultListSnapshot {
    fn default() -> Self {
        Self {
            loading: true,
            vaults: Vec::new(),
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnnotationView {
    #[serde(flatten)]
    pub annotation: Annotation,
    pub profile_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceView {
    #[serde(flatten)]
    pub source: Source,
    pub annotations: Vec<AnnotationView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberView {
    #[serde(flatten)]
    pub membership: Membership,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VaultDetailSnapshot {
    pub loading: bool,
    /// `None` once loaded means the vault does not exist or is not visible.
    pub vault: Option<Vault>,
    pub sources: Vec<SourceView>,
    pub members: Vec<MemberView>,
    pub role: Role,
    pub capabilities: Capabilities,
    pub last_error: Option<String>,
}

impl Default for VaultDetailSnapshot {
    fn default() -> Self {
        Self {
            loading: true,
            vault: None,
            sources: Vec::new(),
            members: Vec::new(),
            role: Role::Viewer,
            capabilities: capabilities(Role::Viewer),
            last_error: None,
        }
    }
}

impl VaultDetailSnapshot {
    pub fn source(&self, id: &str) -> Option<&SourceView> {
        self.sources.iter().find(|s| s.source.id == id)
    }

    pub fn annotation_count(&self) -> usize {
        self.sources.iter().map(|s| s.annotations.len()).sum()
    }
}
