#![allow(dead_code)]

use knowledge_vaults::error::VaultError;
use knowledge_vaults::store::{
    ChangeEvent, Filter, Query, RemoteStore, Subscription, Table,
};
use knowledge_vaults::SqliteStore;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};

/// One call made against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Select(Table),
    Count(Table),
    Insert(Table),
    Delete(Table),
    Subscribe(Table),
}

type FailWith = fn() -> VaultError;

/// Store wrapper that records every call and can be told to fail inserts
/// into one table.
#[derive(Clone)]
pub struct CountingStore<S> {
    inner: S,
    ops: Arc<Mutex<Vec<Op>>>,
    failing: Arc<Mutex<Option<(Table, FailWith)>>>,
}

impl<S: RemoteStore> CountingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            ops: Arc::default(),
            failing: Arc::default(),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn fail_inserts_into(&self, table: Table, fail: FailWith) {
        *self.failing.lock().unwrap() = Some((table, fail));
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    /// Calls other than subscriptions.
    pub fn queries(&self) -> Vec<Op> {
        self.ops()
            .into_iter()
            .filter(|op| !matches!(op, Op::Subscribe(_)))
            .collect()
    }

    pub fn count_of(&self, op: Op) -> usize {
        self.ops().into_iter().filter(|o| *o == op).count()
    }

    pub fn clear(&self) {
        self.ops.lock().unwrap().clear();
    }

    fn record(&self, op: Op) {
        self.ops.lock().unwrap().push(op);
    }
}

impl<S: RemoteStore> RemoteStore for CountingStore<S> {
    async fn select(&self, query: Query) -> Result<Vec<Value>, VaultError> {
        self.record(Op::Select(query.table));
        self.inner.select(query).await
    }

    async fn count(&self, table: Table, filter: Filter) -> Result<u64, VaultError> {
        self.record(Op::Count(table));
        self.inner.count(table, filter).await
    }

    async fn insert(&self, table: Table, record: Value) -> Result<Value, VaultError> {
        self.record(Op::Insert(table));
        let failing = *self.failing.lock().unwrap();
        if let Some((target, fail)) = failing
            && target == table
        {
            return Err(fail());
        }
        self.inner.insert(table, record).await
    }

    async fn delete(&self, table: Table, filter: Filter) -> Result<u64, VaultError> {
        self.record(Op::Delete(table));
        self.inner.delete(table, filter).await
    }

    fn subscribe<F>(&self, table: Table, filter: Option<Filter>, on_change: F) -> Subscription
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        self.record(Op::Subscribe(table));
        self.inner.subscribe(table, filter, on_change)
    }
}

/// Ada owns "v-1" (Climate) where Bob is a viewer. Cat has a profile but no
/// membership. Returns the anonymous root store.
pub async fn seeded() -> SqliteStore {
    let store = SqliteStore::in_memory().await.unwrap();
    for (id, name, email) in [
        ("ada", "Ada", "ada@example.com"),
        ("bob", "Bob", "bob@example.com"),
        ("cat", "Cat", "cat@example.com"),
    ] {
        store
            .acting_as(id)
            .insert(
                Table::Profiles,
                json!({"id": id, "display_name": name, "email": email}),
            )
            .await
            .unwrap();
    }
    let ada = store.acting_as("ada");
    ada.insert(
        Table::Vaults,
        json!({"id": "v-1", "name": "Climate", "owner_id": "ada"}),
    )
    .await
    .unwrap();
    for (user, role) in [("ada", "owner"), ("bob", "viewer")] {
        ada.insert(
            Table::VaultMemberships,
            json!({"vault_id": "v-1", "user_id": user, "role": role, "invited_by": "ada"}),
        )
        .await
        .unwrap();
    }
    store
}

pub async fn add_pdf(store: &SqliteStore, title: &str) -> String {
    let row = store
        .acting_as("ada")
        .insert(
            Table::Sources,
            json!({"vault_id": "v-1", "title": title, "type": "pdf", "created_by": "ada"}),
        )
        .await
        .unwrap();
    row["id"].as_str().unwrap().to_string()
}
