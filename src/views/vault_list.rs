use backon::Retryable;
use futures::future::try_join_all;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde_json::json;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{Debouncer, forward_changes, publish, write_retry_policy};
use crate::config::SyncConfig;
use crate::error::{IsRetryable, VaultError};
use crate::permissions::Role;
use crate::session::{self, Session};
use crate::store::{
    ChangeEvent, Filter, Query, RemoteStore, Subscription, Table, column_values, decode_rows,
};
use crate::types::{Membership, NewVault, Vault, VaultId, VaultListSnapshot, VaultSummary};

/// Messages handled by the vault list actor.
#[derive(Debug)]
pub enum VaultListMessage {
    /// Refetch now and reply with the resulting snapshot.
    Refresh(RpcReplyPort<Result<Arc<VaultListSnapshot>, VaultError>>),
    /// Create a vault owned by the session user.
    CreateVault(NewVault, RpcReplyPort<Result<Vault, VaultError>>),

    // Internal messages (sent by the actor itself)
    /// A subscribed table changed.
    Changed(ChangeEvent),
    /// A debounce window elapsed.
    Debounced { generation: u64 },
}

/// Handle to a running vault list.
///
/// The snapshot is republished after every refetch; `watch()` hands out a
/// receiver that wakes on each publish.
#[derive(Clone)]
pub struct VaultListHandle {
    actor: ActorRef<VaultListMessage>,
    snapshots: watch::Receiver<Arc<VaultListSnapshot>>,
}

impl VaultListHandle {
    /// Subscribe to vault and membership changes and start the first load.
    pub async fn open<S: RemoteStore>(
        store: S,
        session: Option<Session>,
        sync: SyncConfig,
    ) -> Result<Self, VaultError> {
        let session = session::require(session)?;
        let (publisher, snapshots) = watch::channel(Arc::new(VaultListSnapshot::default()));
        let args = VaultListArgs {
            store,
            session,
            sync,
            publisher,
        };
        let (actor, _jh) = Actor::spawn(None, VaultListActor::<S>::default(), args)
            .await
            .map_err(|e| VaultError::RactorError(format!("spawn VaultListActor failed: {e}")))?;
        Ok(Self { actor, snapshots })
    }

    pub fn snapshot(&self) -> Arc<VaultListSnapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Arc<VaultListSnapshot>> {
        self.snapshots.clone()
    }

    pub async fn refresh(&self) -> Result<Arc<VaultListSnapshot>, VaultError> {
        ractor::call!(self.actor, VaultListMessage::Refresh)
            .map_err(|e| VaultError::RactorError(format!("Refresh RPC failed: {e}")))?
    }

    /// Create a vault and its owner membership. If the membership cannot be
    /// written the vault is deleted again and the error is returned.
    pub async fn create_vault(&self, draft: NewVault) -> Result<Vault, VaultError> {
        draft.validate()?;
        ractor::call!(self.actor, VaultListMessage::CreateVault, draft)
            .map_err(|e| VaultError::RactorError(format!("CreateVault RPC failed: {e}")))?
    }

    /// Stop the view and release its subscriptions.
    pub async fn close(self) -> Result<(), VaultError> {
        self.actor
            .stop_and_wait(None, None)
            .await
            .map_err(|e| VaultError::RactorError(format!("stop VaultListActor failed: {e}")))
    }
}

/// Vaults the profile belongs to, with its role and content counts for each.
///
/// Issues no further queries when the profile has no memberships.
pub async fn load_vaults<S: RemoteStore>(
    store: &S,
    profile_id: &str,
) -> Result<Vec<VaultSummary>, VaultError> {
    let memberships: Vec<Membership> = decode_rows(
        store
            .select(
                Query::new(Table::VaultMemberships)
                    .filter(Filter::new().eq("user_id", profile_id)),
            )
            .await?,
    )?;
    if memberships.is_empty() {
        return Ok(Vec::new());
    }
    let roles: HashMap<VaultId, Role> = memberships
        .into_iter()
        .map(|m| (m.vault_id, m.role))
        .collect();

    let vaults: Vec<Vault> = decode_rows(
        store
            .select(
                Query::new(Table::Vaults)
                    .filter(Filter::new().is_in("id", roles.keys().cloned())),
            )
            .await?,
    )?;

    try_join_all(vaults.into_iter().map(|vault| {
        let role = roles.get(&vault.id).copied().unwrap_or_default();
        async move {
            let (source_count, annotation_count) = content_counts(store, &vault.id).await?;
            Ok::<_, VaultError>(VaultSummary {
                vault,
                role,
                source_count,
                annotation_count,
            })
        }
    }))
    .await
}

/// Source and annotation counts for one vault. Annotations are only counted
/// when the vault has sources.
pub async fn content_counts<S: RemoteStore>(
    store: &S,
    vault_id: &str,
) -> Result<(u64, u64), VaultError> {
    let in_vault = Filter::new().eq("vault_id", vault_id);
    let source_count = store.count(Table::Sources, in_vault.clone()).await?;
    if source_count == 0 {
        return Ok((0, 0));
    }
    let sources = store
        .select(Query::new(Table::Sources).filter(in_vault))
        .await?;
    let source_ids = column_values(&sources, "id");
    if source_ids.is_empty() {
        return Ok((source_count, 0));
    }
    let annotation_count = store
        .count(
            Table::Annotations,
            Filter::new().is_in("source_id", source_ids),
        )
        .await?;
    Ok((source_count, annotation_count))
}

struct VaultListArgs<S> {
    store: S,
    session: Session,
    sync: SyncConfig,
    publisher: watch::Sender<Arc<VaultListSnapshot>>,
}

struct VaultListState<S> {
    store: S,
    session: Session,
    debounce: Debouncer,
    snapshot: VaultListSnapshot,
    publisher: watch::Sender<Arc<VaultListSnapshot>>,
    subscriptions: Vec<Subscription>,
}

struct VaultListActor<S>(PhantomData<fn() -> S>);

impl<S> Default for VaultListActor<S> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<S: RemoteStore> VaultListActor<S> {
    async fn refetch(&self, state: &mut VaultListState<S>) -> Result<(), VaultError> {
        let result = load_vaults(&state.store, &state.session.profile_id).await;
        let outcome = match result {
            Ok(vaults) => {
                debug!(count = vaults.len(), "vault list refetched");
                state.snapshot = VaultListSnapshot {
                    loading: false,
                    vaults,
                    last_error: None,
                };
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "vault list refetch failed");
                state.snapshot.loading = false;
                state.snapshot.last_error = Some(e.to_string());
                Err(e)
            }
        };
        publish(&state.publisher, &state.snapshot);
        outcome
    }

    async fn create_vault(
        &self,
        state: &mut VaultListState<S>,
        draft: NewVault,
    ) -> Result<Vault, VaultError> {
        let owner_id = state.session.profile_id.clone();
        let record = draft.into_record(&owner_id)?;
        let vault: Vault =
            serde_json::from_value(state.store.insert(Table::Vaults, record).await?)?;

        let store = state.store.clone();
        let membership = json!({
            "vault_id": vault.id,
            "user_id": owner_id,
            "role": Role::Owner.as_str(),
            "invited_by": owner_id,
        });
        let granted = (|| async {
            store
                .insert(Table::VaultMemberships, membership.clone())
                .await
        })
        .retry(write_retry_policy())
        .when(|e: &VaultError| e.is_retryable())
        .notify(|err, dur| {
            warn!(vault_id = %vault.id, error = %err, "owner membership failed; retrying in {:?}", dur);
        })
        .await;

        if let Err(e) = granted {
            error!(vault_id = %vault.id, error = %e, "owner membership failed; rolling back vault");
            if let Err(rollback) = store
                .delete(Table::Vaults, Filter::new().eq("id", vault.id.clone()))
                .await
            {
                error!(vault_id = %vault.id, error = %rollback, "rollback failed; vault has no owner membership");
            }
            return Err(e);
        }

        info!(vault_id = %vault.id, name = %vault.name, "vault created");
        let _ = self.refetch(state).await;
        Ok(vault)
    }
}

#[ractor::async_trait]
impl<S: RemoteStore> Actor for VaultListActor<S> {
    type Msg = VaultListMessage;
    type State = VaultListState<S>;
    type Arguments = VaultListArgs<S>;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let mine = Filter::new().eq("user_id", args.session.profile_id.clone());
        let subscriptions = vec![
            args.store.subscribe(
                Table::Vaults,
                None,
                forward_changes(&myself, VaultListMessage::Changed),
            ),
            args.store.subscribe(
                Table::VaultMemberships,
                Some(mine),
                forward_changes(&myself, VaultListMessage::Changed),
            ),
        ];
        info!(profile_id = %args.session.profile_id, "vault list opened");
        Ok(VaultListState {
            store: args.store,
            session: args.session,
            debounce: Debouncer::new(args.sync.refetch_debounce()),
            snapshot: VaultListSnapshot::default(),
            publisher: args.publisher,
            subscriptions,
        })
    }

    async fn post_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        // Failures are already on the snapshot.
        let _ = self.refetch(state).await;
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            VaultListMessage::Refresh(rp) => {
                let result = self
                    .refetch(state)
                    .await
                    .map(|()| Arc::new(state.snapshot.clone()));
                let _ = rp.send(result);
            }
            VaultListMessage::CreateVault(draft, rp) => {
                let result = self.create_vault(state, draft).await;
                let _ = rp.send(result);
            }
            VaultListMessage::Changed(event) => {
                debug!(table = %event.table, kind = ?event.kind, "vault list notified");
                state.debounce.arm(&myself, |generation| {
                    VaultListMessage::Debounced { generation }
                });
            }
            VaultListMessage::Debounced { generation } => {
                if state.debounce.is_current(generation) {
                    let _ = self.refetch(state).await;
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
        debug!(released, "vault list closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;

    async fn seeded() -> SqliteStore {
        let store = SqliteStore::in_memory().await.unwrap();
        let ada = store.acting_as("ada");
        ada.insert(Table::Profiles, json!({"id": "ada", "display_name": "Ada"}))
            .await
            .unwrap();
        for (id, name) in [("v-1", "Climate"), ("v-2", "Empty")] {
            ada.insert(Table::Vaults, json!({"id": id, "name": name, "owner_id": "ada"}))
                .await
                .unwrap();
            ada.insert(
                Table::VaultMemberships,
                json!({"vault_id": id, "user_id": "ada", "role": "owner", "invited_by": "ada"}),
            )
            .await
            .unwrap();
        }
        let source = ada
            .insert(
                Table::Sources,
                json!({"vault_id": "v-1", "title": "IPCC", "type": "pdf", "created_by": "ada"}),
            )
            .await
            .unwrap();
        for note in ["one", "two"] {
            ada.insert(
                Table::Annotations,
                json!({"source_id": source["id"], "user_id": "ada", "content": note}),
            )
            .await
            .unwrap();
        }
        ada
    }

    #[tokio::test]
    async fn summaries_carry_role_and_counts() {
        let ada = seeded().await;
        let mut vaults = load_vaults(&ada, "ada").await.unwrap();
        vaults.sort_by(|a, b| a.vault.id.cmp(&b.vault.id));
        assert_eq!(vaults.len(), 2);
        assert_eq!(vaults[0].role, Role::Owner);
        assert_eq!((vaults[0].source_count, vaults[0].annotation_count), (1, 2));
        assert_eq!((vaults[1].source_count, vaults[1].annotation_count), (0, 0));
    }

    #[tokio::test]
    async fn strangers_see_nothing() {
        let ada = seeded().await;
        assert!(load_vaults(&ada, "bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_requires_a_session() {
        let store = SqliteStore::in_memory().await.unwrap();
        let err = VaultListHandle::open(store, None, SyncConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, VaultError::Unauthenticated));
    }

    #[tokio::test]
    async fn blank_names_never_reach_the_store() {
        let ada = seeded().await;
        let view = VaultListHandle::open(ada.clone(), Some(Session::new("ada")), SyncConfig::default())
            .await
            .unwrap();
        let err = view.create_vault(NewVault::new("   ")).await.unwrap_err();
        assert!(matches!(err, VaultError::EmptyField(_)));
        assert_eq!(ada.count(Table::Vaults, Filter::new()).await.unwrap(), 2);
        view.close().await.unwrap();
    }
}
