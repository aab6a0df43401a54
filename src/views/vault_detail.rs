use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap};
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{Debouncer, forward_changes, publish};
use crate::config::SyncConfig;
use crate::error::VaultError;
use crate::permissions::{Capabilities, Role, capabilities};
use crate::session::{self, Session};
use crate::store::{
    ChangeEvent, ChangeKind, Direction, Filter, Query, RemoteStore, Subscription, Table,
    decode_rows,
};
use crate::types::{
    Annotation, AnnotationView, Invitation, MemberView, Membership, NewAnnotation, NewSource,
    Profile, ProfileId, Source, SourceId, SourceView, UNKNOWN_NAME, Vault, VaultDetailSnapshot,
    VaultId,
};

/// Which part of the detail snapshot a notification makes stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refetch {
    /// Sources with their annotations.
    Sources,
    /// Members, and with them the caller's role.
    Roster,
}

/// Messages handled by the vault detail actor.
#[derive(Debug)]
pub enum VaultDetailMessage {
    /// Refetch everything and reply with the resulting snapshot.
    Refresh(RpcReplyPort<Result<Arc<VaultDetailSnapshot>, VaultError>>),
    AddSource(NewSource, RpcReplyPort<Result<Source, VaultError>>),
    DeleteSource(SourceId, RpcReplyPort<Result<(), VaultError>>),
    AddAnnotation(NewAnnotation, RpcReplyPort<Result<Annotation, VaultError>>),
    InviteMember(Invitation, RpcReplyPort<Result<Membership, VaultError>>),

    // Internal messages (sent by the actor itself)
    Changed(Refetch, ChangeEvent),
    Debounced { target: Refetch, generation: u64 },
}

/// Handle to a running vault detail view.
#[derive(Clone)]
pub struct VaultDetailHandle {
    actor: ActorRef<VaultDetailMessage>,
    snapshots: watch::Receiver<Arc<VaultDetailSnapshot>>,
}

impl VaultDetailHandle {
    /// Subscribe to the vault's sources, annotations and memberships and start
    /// the first load.
    pub async fn open<S: RemoteStore>(
        store: S,
        session: Option<Session>,
        sync: SyncConfig,
        vault_id: impl Into<VaultId>,
    ) -> Result<Self, VaultError> {
        let session = session::require(session)?;
        let vault_id = vault_id.into();
        if vault_id.trim().is_empty() {
            return Err(VaultError::MissingVaultId);
        }
        let (publisher, snapshots) = watch::channel(Arc::new(VaultDetailSnapshot::default()));
        let args = VaultDetailArgs {
            store,
            session,
            sync,
            vault_id,
            publisher,
        };
        let (actor, _jh) = Actor::spawn(None, VaultDetailActor::<S>::default(), args)
            .await
            .map_err(|e| VaultError::RactorError(format!("spawn VaultDetailActor failed: {e}")))?;
        Ok(Self { actor, snapshots })
    }

    pub fn snapshot(&self) -> Arc<VaultDetailSnapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Arc<VaultDetailSnapshot>> {
        self.snapshots.clone()
    }

    pub async fn refresh(&self) -> Result<Arc<VaultDetailSnapshot>, VaultError> {
        ractor::call!(self.actor, VaultDetailMessage::Refresh)
            .map_err(|e| VaultError::RactorError(format!("Refresh RPC failed: {e}")))?
    }

    pub async fn add_source(&self, draft: NewSource) -> Result<Source, VaultError> {
        ractor::call!(self.actor, VaultDetailMessage::AddSource, draft)
            .map_err(|e| VaultError::RactorError(format!("AddSource RPC failed: {e}")))?
    }

    /// Delete a source and, through the store, its annotations. Deleting a
    /// source that is already gone succeeds.
    pub async fn delete_source(&self, source_id: impl Into<SourceId>) -> Result<(), VaultError> {
        ractor::call!(self.actor, VaultDetailMessage::DeleteSource, source_id.into())
            .map_err(|e| VaultError::RactorError(format!("DeleteSource RPC failed: {e}")))?
    }

    pub async fn add_annotation(&self, draft: NewAnnotation) -> Result<Annotation, VaultError> {
        ractor::call!(self.actor, VaultDetailMessage::AddAnnotation, draft)
            .map_err(|e| VaultError::RactorError(format!("AddAnnotation RPC failed: {e}")))?
    }

    /// Grant an existing profile, found by email, a role in this vault.
    pub async fn invite_member(&self, invitation: Invitation) -> Result<Membership, VaultError> {
        ractor::call!(self.actor, VaultDetailMessage::InviteMember, invitation)
            .map_err(|e| VaultError::RactorError(format!("InviteMember RPC failed: {e}")))?
    }

    /// Stop the view and release its subscriptions.
    pub async fn close(self) -> Result<(), VaultError> {
        self.actor
            .stop_and_wait(None, None)
            .await
            .map_err(|e| VaultError::RactorError(format!("stop VaultDetailActor failed: {e}")))
    }
}

pub async fn load_vault<S: RemoteStore>(
    store: &S,
    vault_id: &str,
) -> Result<Option<Vault>, VaultError> {
    let rows = store
        .select(Query::new(Table::Vaults).filter(Filter::new().eq("id", vault_id)))
        .await?;
    Ok(decode_rows::<Vault>(rows)?.into_iter().next())
}

/// Sources newest first, each with its annotations oldest first and the
/// author's display name resolved.
pub async fn load_sources<S: RemoteStore>(
    store: &S,
    vault_id: &str,
) -> Result<Vec<SourceView>, VaultError> {
    let sources: Vec<Source> = decode_rows(
        store
            .select(
                Query::new(Table::Sources)
                    .filter(Filter::new().eq("vault_id", vault_id))
                    .order_by("created_at", Direction::Descending),
            )
            .await?,
    )?;
    if sources.is_empty() {
        return Ok(Vec::new());
    }

    let annotations: Vec<Annotation> = decode_rows(
        store
            .select(
                Query::new(Table::Annotations)
                    .filter(Filter::new().is_in("source_id", sources.iter().map(|s| s.id.clone())))
                    .order_by("created_at", Direction::Ascending),
            )
            .await?,
    )?;
    let names = display_names(store, annotations.iter().map(|a| a.user_id.clone())).await?;

    let mut by_source: HashMap<SourceId, Vec<AnnotationView>> = HashMap::new();
    for annotation in annotations {
        let profile_name = name_or_unknown(&names, &annotation.user_id);
        by_source
            .entry(annotation.source_id.clone())
            .or_default()
            .push(AnnotationView {
                annotation,
                profile_name,
            });
    }
    Ok(sources
        .into_iter()
        .map(|source| {
            let annotations = by_source.remove(&source.id).unwrap_or_default();
            SourceView {
                source,
                annotations,
            }
        })
        .collect())
}

/// Members in the order they joined, with display names resolved.
pub async fn load_members<S: RemoteStore>(
    store: &S,
    vault_id: &str,
) -> Result<Vec<MemberView>, VaultError> {
    let memberships: Vec<Membership> = decode_rows(
        store
            .select(
                Query::new(Table::VaultMemberships)
                    .filter(Filter::new().eq("vault_id", vault_id))
                    .order_by("created_at", Direction::Ascending),
            )
            .await?,
    )?;
    let names = display_names(store, memberships.iter().map(|m| m.user_id.clone())).await?;
    Ok(memberships
        .into_iter()
        .map(|membership| {
            let display_name = name_or_unknown(&names, &membership.user_id);
            MemberView {
                membership,
                display_name,
            }
        })
        .collect())
}

/// The profile's role according to the roster. Not on the roster means viewer.
pub fn resolve_role(members: &[MemberView], profile_id: &str) -> Role {
    members
        .iter()
        .find(|m| m.membership.user_id == profile_id)
        .map(|m| m.membership.role)
        .unwrap_or_default()
}

/// One profiles lookup for a batch of ids.
async fn display_names<S, I>(
    store: &S,
    ids: I,
) -> Result<HashMap<ProfileId, Option<String>>, VaultError>
where
    S: RemoteStore,
    I: IntoIterator<Item = ProfileId>,
{
    let ids: BTreeSet<ProfileId> = ids.into_iter().collect();
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let profiles: Vec<Profile> = decode_rows(
        store
            .select(Query::new(Table::Profiles).filter(Filter::new().is_in("id", ids)))
            .await?,
    )?;
    Ok(profiles
        .into_iter()
        .map(|p| (p.id, p.display_name))
        .collect())
}

fn name_or_unknown(names: &HashMap<ProfileId, Option<String>>, id: &str) -> String {
    names
        .get(id)
        .and_then(|n| n.as_deref())
        .filter(|n| !n.trim().is_empty())
        .unwrap_or(UNKNOWN_NAME)
        .to_string()
}

struct VaultDetailArgs<S> {
    store: S,
    session: Session,
    sync: SyncConfig,
    vault_id: VaultId,
    publisher: watch::Sender<Arc<VaultDetailSnapshot>>,
}

struct VaultDetailState<S> {
    store: S,
    session: Session,
    vault_id: VaultId,
    sources_debounce: Debouncer,
    roster_debounce: Debouncer,
    snapshot: VaultDetailSnapshot,
    publisher: watch::Sender<Arc<VaultDetailSnapshot>>,
    subscriptions: Vec<Subscription>,
}

impl<S> VaultDetailState<S> {
    fn debouncer(&mut self, target: Refetch) -> &mut Debouncer {
        match target {
            Refetch::Sources => &mut self.sources_debounce,
            Refetch::Roster => &mut self.roster_debounce,
        }
    }

    fn gate(
        &self,
        allowed: impl Fn(&Capabilities) -> bool,
        action: &'static str,
    ) -> Result<(), VaultError> {
        if allowed(&self.snapshot.capabilities) {
            Ok(())
        } else {
            Err(VaultError::Forbidden {
                role: self.snapshot.role,
                action,
            })
        }
    }

    /// Annotation events only matter for sources this view shows.
    fn concerns_us(&self, target: Refetch, event: &ChangeEvent) -> bool {
        if target != Refetch::Sources
            || event.table != Table::Annotations
            || event.kind == ChangeKind::Resync
        {
            return true;
        }
        event
            .row()
            .and_then(|row| row.get("source_id"))
            .and_then(Value::as_str)
            .is_some_and(|id| self.snapshot.source(id).is_some())
    }

    fn record_failure(&mut self, what: &str, e: &VaultError) {
        warn!(vault_id = %self.vault_id, error = %e, "{what} refetch failed");
        self.snapshot.last_error = Some(e.to_string());
    }
}

struct VaultDetailActor<S>(PhantomData<fn() -> S>);

impl<S> Default for VaultDetailActor<S> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<S: RemoteStore> VaultDetailActor<S> {
    async fn refetch_all(&self, state: &mut VaultDetailState<S>) -> Result<(), VaultError> {
        let loaded = futures::try_join!(
            load_vault(&state.store, &state.vault_id),
            load_sources(&state.store, &state.vault_id),
            load_members(&state.store, &state.vault_id),
        );
        let outcome = match loaded {
            Ok((vault, sources, members)) => {
                if vault.is_none() {
                    debug!(vault_id = %state.vault_id, "vault not found or not visible");
                }
                let role = resolve_role(&members, &state.session.profile_id);
                state.snapshot = VaultDetailSnapshot {
                    loading: false,
                    vault,
                    sources,
                    members,
                    role,
                    capabilities: capabilities(role),
                    last_error: None,
                };
                Ok(())
            }
            Err(e) => {
                state.record_failure("vault detail", &e);
                state.snapshot.loading = false;
                Err(e)
            }
        };
        publish(&state.publisher, &state.snapshot);
        outcome
    }

    async fn refetch_sources(&self, state: &mut VaultDetailState<S>) {
        match load_sources(&state.store, &state.vault_id).await {
            Ok(sources) => {
                state.snapshot.sources = sources;
                state.snapshot.last_error = None;
            }
            Err(e) => state.record_failure("sources", &e),
        }
        publish(&state.publisher, &state.snapshot);
    }

    async fn refetch_roster(&self, state: &mut VaultDetailState<S>) {
        match load_members(&state.store, &state.vault_id).await {
            Ok(members) => {
                let role = resolve_role(&members, &state.session.profile_id);
                if role != state.snapshot.role {
                    info!(vault_id = %state.vault_id, %role, "role changed");
                }
                state.snapshot.members = members;
                state.snapshot.role = role;
                state.snapshot.capabilities = capabilities(role);
                state.snapshot.last_error = None;
            }
            Err(e) => state.record_failure("members", &e),
        }
        publish(&state.publisher, &state.snapshot);
    }

    async fn refetch(&self, state: &mut VaultDetailState<S>, target: Refetch) {
        match target {
            Refetch::Sources => self.refetch_sources(state).await,
            Refetch::Roster => self.refetch_roster(state).await,
        }
    }

    async fn add_source(
        &self,
        state: &mut VaultDetailState<S>,
        draft: NewSource,
    ) -> Result<Source, VaultError> {
        draft.validate()?;
        state.gate(|c| c.can_add_source, "add sources")?;
        let record = draft.into_record(&state.vault_id, &state.session.profile_id)?;
        let source: Source =
            serde_json::from_value(state.store.insert(Table::Sources, record).await?)?;
        info!(vault_id = %state.vault_id, source_id = %source.id, kind = source.kind.as_str(), "source added");
        self.refetch_sources(state).await;
        Ok(source)
    }

    async fn delete_source(
        &self,
        state: &mut VaultDetailState<S>,
        source_id: SourceId,
    ) -> Result<(), VaultError> {
        state.gate(|c| c.can_delete_source, "delete sources")?;
        let removed = state
            .store
            .delete(
                Table::Sources,
                Filter::new()
                    .eq("id", source_id.clone())
                    .eq("vault_id", state.vault_id.clone()),
            )
            .await?;
        if removed == 0 {
            debug!(%source_id, "source already gone");
        } else {
            info!(vault_id = %state.vault_id, %source_id, "source deleted");
        }
        self.refetch_sources(state).await;
        Ok(())
    }

    async fn add_annotation(
        &self,
        state: &mut VaultDetailState<S>,
        draft: NewAnnotation,
    ) -> Result<Annotation, VaultError> {
        draft.validate()?;
        state.gate(|c| c.can_add_annotation, "annotate sources")?;
        let record = draft.into_record(&state.session.profile_id)?;
        let annotation: Annotation =
            serde_json::from_value(state.store.insert(Table::Annotations, record).await?)?;
        debug!(source_id = %annotation.source_id, annotation_id = %annotation.id, "annotation added");
        self.refetch_sources(state).await;
        Ok(annotation)
    }

    async fn invite_member(
        &self,
        state: &mut VaultDetailState<S>,
        invitation: Invitation,
    ) -> Result<Membership, VaultError> {
        invitation.validate()?;
        state.gate(|c| c.can_invite, "invite members")?;
        let email = invitation.normalized_email();
        let profiles: Vec<Profile> = decode_rows(
            state
                .store
                .select(
                    Query::new(Table::Profiles)
                        .filter(Filter::new().eq_ignore_case("email", email.clone())),
                )
                .await?,
        )?;
        let Some(invitee) = profiles.into_iter().next() else {
            return Err(VaultError::InviteeNotFound(email));
        };
        if invitee.id == state.session.profile_id {
            return Err(VaultError::InviteSelf);
        }
        let record = json!({
            "vault_id": state.vault_id,
            "user_id": invitee.id,
            "role": invitation.role.as_str(),
            "invited_by": state.session.profile_id,
        });
        let membership: Membership =
            serde_json::from_value(state.store.insert(Table::VaultMemberships, record).await?)?;
        info!(vault_id = %state.vault_id, user_id = %membership.user_id, role = %membership.role, "member invited");
        self.refetch_roster(state).await;
        Ok(membership)
    }
}

#[ractor::async_trait]
impl<S: RemoteStore> Actor for VaultDetailActor<S> {
    type Msg = VaultDetailMessage;
    type State = VaultDetailState<S>;
    type Arguments = VaultDetailArgs<S>;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let in_vault = Filter::new().eq("vault_id", args.vault_id.clone());
        let subscriptions = vec![
            args.store.subscribe(
                Table::Sources,
                Some(in_vault.clone()),
                forward_changes(&myself, |e| VaultDetailMessage::Changed(Refetch::Sources, e)),
            ),
            // Annotations carry no vault id; they are narrowed on arrival.
            args.store.subscribe(
                Table::Annotations,
                None,
                forward_changes(&myself, |e| VaultDetailMessage::Changed(Refetch::Sources, e)),
            ),
            args.store.subscribe(
                Table::VaultMemberships,
                Some(in_vault),
                forward_changes(&myself, |e| VaultDetailMessage::Changed(Refetch::Roster, e)),
            ),
        ];
        info!(vault_id = %args.vault_id, profile_id = %args.session.profile_id, "vault detail opened");
        let window = args.sync.refetch_debounce();
        Ok(VaultDetailState {
            store: args.store,
            session: args.session,
            vault_id: args.vault_id,
            sources_debounce: Debouncer::new(window),
            roster_debounce: Debouncer::new(window),
            snapshot: VaultDetailSnapshot::default(),
            publisher: args.publisher,
            subscriptions,
        })
    }

    async fn post_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let _ = self.refetch_all(state).await;
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            VaultDetailMessage::Refresh(rp) => {
                let result = self
                    .refetch_all(state)
                    .await
                    .map(|()| Arc::new(state.snapshot.clone()));
                let _ = rp.send(result);
            }
            VaultDetailMessage::AddSource(draft, rp) => {
                let _ = rp.send(self.add_source(state, draft).await);
            }
            VaultDetailMessage::DeleteSource(source_id, rp) => {
                let _ = rp.send(self.delete_source(state, source_id).await);
            }
            VaultDetailMessage::AddAnnotation(draft, rp) => {
                let _ = rp.send(self.add_annotation(state, draft).await);
            }
            VaultDetailMessage::InviteMember(invitation, rp) => {
                let _ = rp.send(self.invite_member(state, invitation).await);
            }
            VaultDetailMessage::Changed(target, event) => {
                if !state.concerns_us(target, &event) {
                    debug!(table = %event.table, "ignoring change outside this vault");
                    return Ok(());
                }
                state.debouncer(target).arm(&myself, move |generation| {
                    VaultDetailMessage::Debounced { target, generation }
                });
            }
            VaultDetailMessage::Debounced { target, generation } => {
                if state.debouncer(target).is_current(generation) {
                    self.refetch(state, target).await;
                }
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let released = state.subscriptions.len();
        for sub in state.subscriptions.drain(..) {
            sub.unsubscribe();
        }
        debug!(vault_id = %state.vault_id, released, "vault detail closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::types::SourceKind;
    use pretty_assertions::assert_eq;

    async fn seeded() -> SqliteStore {
        let store = SqliteStore::in_memory().await.unwrap();
        let ada = store.acting_as("ada");
        let bob = store.acting_as("bob");
        ada.insert(Table::Profiles, json!({"id": "ada", "display_name": "Ada", "email": "ada@example.com"}))
            .await
            .unwrap();
        bob.insert(Table::Profiles, json!({"id": "bob", "email": "bob@example.com"}))
            .await
            .unwrap();
        ada.insert(Table::Vaults, json!({"id": "v-1", "name": "Climate", "owner_id": "ada"}))
            .await
            .unwrap();
        ada.insert(
            Table::VaultMemberships,
            json!({"vault_id": "v-1", "user_id": "ada", "role": "owner", "invited_by": "ada"}),
        )
        .await
        .unwrap();
        ada
    }

    #[tokio::test]
    async fn sources_come_newest_first_with_threads_oldest_first() {
        let ada = seeded().await;
        let mut ids = Vec::new();
        for title in ["older", "newer"] {
            let row = ada
                .insert(
                    Table::Sources,
                    json!({"vault_id": "v-1", "title": title, "type": "pdf", "created_by": "ada"}),
                )
                .await
                .unwrap();
            ids.push(row["id"].as_str().unwrap().to_string());
        }
        for note in ["first", "second"] {
            ada.insert(
                Table::Annotations,
                json!({"source_id": ids[0], "user_id": "ada", "content": note}),
            )
            .await
            .unwrap();
        }

        let sources = load_sources(&ada, "v-1").await.unwrap();
        let titles: Vec<_> = sources.iter().map(|s| s.source.title.as_str()).collect();
        assert_eq!(titles, vec!["newer", "older"]);
        assert_eq!(sources[1].source.kind, SourceKind::Pdf);
        let thread: Vec<_> = sources[1]
            .annotations
            .iter()
            .map(|a| (a.annotation.content.as_str(), a.profile_name.as_str()))
            .collect();
        assert_eq!(thread, vec![("first", "Ada"), ("second", "Ada")]);
        assert!(sources[0].annotations.is_empty());
    }

    #[tokio::test]
    async fn members_without_names_show_as_unknown() {
        let ada = seeded().await;
        ada.insert(
            Table::VaultMemberships,
            json!({"vault_id": "v-1", "user_id": "bob", "role": "viewer", "invited_by": "ada"}),
        )
        .await
        .unwrap();
        let members = load_members(&ada, "v-1").await.unwrap();
        let names: Vec<_> = members.iter().map(|m| m.display_name.as_str()).collect();
        assert_eq!(names, vec!["Ada", UNKNOWN_NAME]);
        assert!(members[0].membership.created_at < members[1].membership.created_at);
        assert_eq!(resolve_role(&members, "bob"), Role::Viewer);
        assert_eq!(resolve_role(&members, "ada"), Role::Owner);
        assert_eq!(resolve_role(&members, "eve"), Role::Viewer);
    }

    #[tokio::test]
    async fn open_needs_a_vault_id() {
        let ada = seeded().await;
        let err = VaultDetailHandle::open(ada, Some(Session::new("ada")), SyncConfig::default(), " ")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, VaultError::MissingVaultId));
    }

    #[tokio::test]
    async fn missing_vault_loads_as_none() {
        let ada = seeded().await;
        let view = VaultDetailHandle::open(ada, Some(Session::new("ada")), SyncConfig::default(), "v-404")
            .await
            .unwrap();
        let snapshot = view.refresh().await.unwrap();
        assert!(!snapshot.loading);
        assert!(snapshot.vault.is_none());
        assert_eq!(snapshot.role, Role::Viewer);
        view.close().await.unwrap();
    }
}
