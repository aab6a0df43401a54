//! User input for mutations, validated and shaped into store records.
//!
//! Validation happens here, before any request is issued.

use serde_json::{Value, json};

use super::rows::{ProfileId, SourceId, SourceKind, VaultId};
use crate::error::VaultError;
use crate::permissions::Role;

fn blank(s: &str) -> bool {
    s.trim().is_empty()
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Default)]
pub struct NewVault {
    pub name: String,
    pub description: Option<String>,
}

impl NewVault {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn validate(&self) -> Result<(), VaultError> {
        if blank(&self.name) {
            return Err(VaultError::EmptyField("vault name"));
        }
        Ok(())
    }

    pub(crate) fn into_record(self, owner_id: &str) -> Result<Value, VaultError> {
        self.validate()?;
        Ok(json!({
            "name": self.name,
            "description": non_empty(self.description),
            "owner_id": owner_id,
        }))
    }
}

/// Form state for a new source. Only the field matching `kind` is kept.
#[derive(Debug, Clone)]
pub struct NewSource {
    pub title: String,
    pub kind: SourceKind,
    pub url: String,
    pub content: String,
}

impl NewSource {
    pub fn url(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            kind: SourceKind::Url,
            url: url.into(),
            content: String::new(),
        }
    }

    pub fn note(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            kind: SourceKind::Note,
            url: String::new(),
            content: content.into(),
        }
    }

    pub fn pdf(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            kind: SourceKind::Pdf,
            url: String::new(),
            content: String::new(),
        }
    }

    pub fn validate(&self) -> Result<(), VaultError> {
        if blank(&self.title) {
            return Err(VaultError::EmptyField("title"));
        }
        Ok(())
    }

    pub(crate) fn into_record(
        self,
        vault_id: &VaultId,
        created_by: &ProfileId,
    ) -> Result<Value, VaultError> {
        self.validate()?;
        let url = (self.kind == SourceKind::Url).then_some(self.url);
        let content = (self.kind == SourceKind::Note).then_some(self.content);
        Ok(json!({
            "vault_id": vault_id,
            "title": self.title,
            "type": self.kind.as_str(),
            "url": url,
            "content": content,
            "created_by": created_by,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct NewAnnotation {
    pub source_id: SourceId,
    pub content: String,
    pub quote: Option<String>,
}

impl NewAnnotation {
    pub fn new(source_id: impl Into<SourceId>, content: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            content: content.into(),
            quote: None,
        }
    }

    pub fn with_quote(mut self, quote: impl Into<String>) -> Self {
        self.quote = Some(quote.into());
        self
    }

    pub fn validate(&self) -> Result<(), VaultError> {
        if blank(&self.content) {
            return Err(VaultError::EmptyField("annotation"));
        }
        if self.source_id.is_empty() {
            return Err(VaultError::EmptyField("source"));
        }
        Ok(())
    }

    pub(crate) fn into_record(self, user_id: &ProfileId) -> Result<Value, VaultError> {
        self.validate()?;
        Ok(json!({
            "source_id": self.source_id,
            "user_id": user_id,
            "content": self.content,
            "quote": non_empty(self.quote),
        }))
    }
}

#[derive(Debug, Clone)]
pub struct Invitation {
    pub email: String,
    pub role: Role,
}

impl Invitation {
    pub fn new(email: impl Into<String>, role: Role) -> Self {
        Self {
            email: email.into(),
            role,
        }
    }

    /// Lookup key for the invitee's profile, matched against stored emails ignoring case.
    pub fn normalized_email(&self) -> String {
        self.email.trim().to_lowercase()
    }

    pub fn validate(&self) -> Result<(), VaultError> {
        if blank(&self.email) {
            return Err(VaultError::EmptyField("email"));
        }
        if self.role == Role::Owner {
            return Err(VaultError::InvalidInviteRole(self.role));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_source_drops_content() {
        let mut draft = NewSource::url("Paper", "https://arxiv.org/abs/2401.00001");
        draft.content = "left over from the note tab".into();
        let record = draft
            .into_record(&"v-1".to_string(), &"p-1".to_string())
            .unwrap();
        assert_eq!(record["type"], "url");
        assert_eq!(record["url"], "https://arxiv.org/abs/2401.00001");
        assert!(record["content"].is_null());
    }

    #[test]
    fn note_source_drops_url() {
        let mut draft = NewSource::note("Notes", "carbon budget falls fast");
        draft.url = "https://stale.example".into();
        let record = draft
            .into_record(&"v-1".to_string(), &"p-1".to_string())
            .unwrap();
        assert!(record["url"].is_null());
        assert_eq!(record["content"], "carbon budget falls fast");
    }

    #[test]
    fn pdf_source_has_neither_body() {
        let record = NewSource::pdf("Scan")
            .into_record(&"v-1".to_string(), &"p-1".to_string())
            .unwrap();
        assert!(record["url"].is_null());
        assert!(record["content"].is_null());
    }

    #[test]
    fn whitespace_title_is_rejected() {
        let err = NewSource::url("   ", "https://x.example").validate().unwrap_err();
        assert!(matches!(err, VaultError::EmptyField("title")));
    }

    #[test]
    fn empty_quote_becomes_null() {
        let record = NewAnnotation::new("s-1", "key claim")
            .with_quote("")
            .into_record(&"p-1".to_string())
            .unwrap();
        assert!(record["quote"].is_null());
    }

    #[test]
    fn vault_description_blank_is_null() {
        let record = NewVault::new("Climate")
            .with_description("")
            .into_record("p-1")
            .unwrap();
        assert!(record["description"].is_null());
        assert!(NewVault::new(" ").validate().is_err());
    }

    #[test]
    fn invitations_reject_owner_and_empty_email() {
        assert!(matches!(
            Invitation::new("", Role::Viewer).validate(),
            Err(VaultError::EmptyField("email"))
        ));
        assert!(matches!(
            Invitation::new("a@b.c", Role::Owner).validate(),
            Err(VaultError::InvalidInviteRole(Role::Owner))
        ));
        assert_eq!(
            Invitation::new("  Ada@Example.COM ", Role::Contributor).normalized_email(),
            "ada@example.com"
        );
    }
}
