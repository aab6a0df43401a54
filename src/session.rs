use serde::{Deserialize, Serialize};

use crate::error::VaultError;
use crate::types::ProfileId;

/// The signed-in identity, as handed over by the auth provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub profile_id: ProfileId,
    pub display_name: Option<String>,
    pub email: Option<String>,
}

impl Session {
    pub fn new(profile_id: impl Into<ProfileId>) -> Self {
        Self {
            profile_id: profile_id.into(),
            display_name: None,
            email: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// A missing session is what sends the UI back to its login surface.
pub fn require(session: Option<Session>) -> Result<Session, VaultError> {
    session.ok_or(VaultError::Unauthenticated)
}
