pub mod drafts;
pub mod rows;
pub mod snapshot;

pub use drafts::{Invitation, NewAnnotation, NewSource, NewVault};
pub use rows::{
    Annotation, AnnotationId, Membership, MembershipId, Profile, ProfileId, Source, SourceId,
    SourceKind, Vault, VaultId,
};
pub use snapshot::{
    AnnotationView, MemberView, SourceView, UNKNOWN_NAME, VaultDetailSnapshot, VaultListSnapshot,
    VaultSummary,
};
