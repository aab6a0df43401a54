//! Role gate: which mutation affordances a membership role unlocks.
//!
//! The gate is a presentation hint for the client. The store re-checks every
//! mutation on its side (see `db::policy`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Capability tier of one identity inside one vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Role {
    Owner,
    Contributor,
    #[default]
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Contributor => "contributor",
            Role::Viewer => "viewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown role strings collapse to the read-only tier.
impl From<String> for Role {
    fn from(value: String) -> Self {
        Role::from(value.as_str())
    }
}

impl From<&str> for Role {
    fn from(value: &str) -> Self {
        match value {
            "owner" => Role::Owner,
            "contributor" => Role::Contributor,
            _ => Role::Viewer,
        }
    }
}

impl FromStr for Role {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Role::from(s))
    }
}

/// Mutation affordances available to a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub can_add_source: bool,
    pub can_delete_source: bool,
    pub can_add_annotation: bool,
    pub can_invite: bool,
}

impl Capabilities {
    const ALL: Capabilities = Capabilities {
        can_add_source: true,
        can_delete_source: true,
        can_add_annotation: true,
        can_invite: true,
    };

    const NONE: Capabilities = Capabilities {
        can_add_source: false,
        can_delete_source: false,
        can_add_annotation: false,
        can_invite: false,
    };

    /// True when at least one mutation is allowed.
    pub fn can_edit(&self) -> bool {
        self.can_add_source || self.can_delete_source || self.can_add_annotation || self.can_invite
    }
}

/// Pure, total mapping from role to capabilities.
pub const fn capabilities(role: Role) -> Capabilities {
    match role {
        Role::Owner | Role::Contributor => Capabilities::ALL,
        Role::Viewer => Capabilities::NONE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_and_contributor_share_a_gate() {
        assert_eq!(capabilities(Role::Owner), capabilities(Role::Contributor));
        assert_ne!(capabilities(Role::Owner), capabilities(Role::Viewer));
        assert!(capabilities(Role::Contributor).can_edit());
    }

    #[test]
    fn viewer_gets_nothing() {
        let gate = capabilities(Role::Viewer);
        assert!(!gate.can_add_source);
        assert!(!gate.can_delete_source);
        assert!(!gate.can_add_annotation);
        assert!(!gate.can_invite);
        assert!(!gate.can_edit());
    }

    #[test]
    fn roles_parse_leniently() {
        let parsed: Role = serde_json::from_str("\"contributor\"").unwrap();
        assert_eq!(parsed, Role::Contributor);
        let unknown: Role = serde_json::from_str("\"admin\"").unwrap();
        assert_eq!(unknown, Role::Viewer);
        assert_eq!(serde_json::to_string(&Role::Owner).unwrap(), "\"owner\"");
        assert_eq!(Role::default(), Role::Viewer);
    }
}
