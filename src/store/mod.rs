//! Remote store boundary.
//!
//! Rows travel as JSON objects. `select`/`count`/`insert`/`delete` map onto
//! the store's relational operations; `subscribe` opens a push channel that
//! calls back on every insert, update or delete touching a table.

pub mod rest;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::task::JoinHandle;

use crate::error::VaultError;

pub use rest::RestStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Vaults,
    VaultMemberships,
    Sources,
    Annotations,
    Profiles,
}

impl Table {
    pub const ALL: [Table; 5] = [
        Table::Profiles,
        Table::Vaults,
        Table::VaultMemberships,
        Table::Sources,
        Table::Annotations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Vaults => "vaults",
            Table::VaultMemberships => "vault_memberships",
            Table::Sources => "sources",
            Table::Annotations => "annotations",
            Table::Profiles => "profiles",
        }
    }

    pub fn parse(name: &str) -> Option<Table> {
        Table::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Eq(&'static str, Value),
    /// Text equality ignoring ASCII case.
    EqIgnoreCase(&'static str, String),
    In(&'static str, Vec<Value>),
}

impl Clause {
    pub fn column(&self) -> &'static str {
        match self {
            Clause::Eq(c, _) | Clause::EqIgnoreCase(c, _) | Clause::In(c, _) => c,
        }
    }

    fn matches(&self, row: &Value) -> bool {
        let field = row.get(self.column()).unwrap_or(&Value::Null);
        match self {
            Clause::Eq(_, v) => field == v,
            Clause::EqIgnoreCase(_, v) => field.as_str().is_some_and(|f| f.eq_ignore_ascii_case(v)),
            Clause::In(_, vs) => vs.contains(field),
        }
    }
}

/// Conjunction of column predicates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<Clause>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Eq(column, value.into()));
        self
    }

    pub fn eq_ignore_case(mut self, column: &'static str, value: impl Into<String>) -> Self {
        self.clauses.push(Clause::EqIgnoreCase(column, value.into()));
        self
    }

    pub fn is_in<I, V>(mut self, column: &'static str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.clauses
            .push(Clause::In(column, values.into_iter().map(Into::into).collect()));
        self
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Client-side evaluation, used to route change events.
    pub fn matches(&self, row: &Value) -> bool {
        self.clauses.iter().all(|c| c.matches(row))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: Table,
    pub filter: Filter,
    pub order: Option<(&'static str, Direction)>,
}

impl Query {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            filter: Filter::new(),
            order: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn order_by(mut self, column: &'static str, direction: Direction) -> Self {
        self.order = Some((column, direction));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    /// Events may have been missed; treat the whole table as stale.
    Resync,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    #[serde(default)]
    pub record: Option<Value>,
    #[serde(default)]
    pub old_record: Option<Value>,
}

impl ChangeEvent {
    pub fn resync(table: Table) -> Self {
        Self {
            table,
            kind: ChangeKind::Resync,
            record: None,
            old_record: None,
        }
    }

    /// The row this event is about: new image for inserts/updates, old image for deletes.
    pub fn row(&self) -> Option<&Value> {
        self.record.as_ref().or(self.old_record.as_ref())
    }

    /// Whether a subscriber with `filter` should see this event.
    pub fn is_visible_to(&self, filter: Option<&Filter>) -> bool {
        let Some(filter) = filter else {
            return true;
        };
        if self.kind == ChangeKind::Resync {
            return true;
        }
        [self.record.as_ref(), self.old_record.as_ref()]
            .into_iter()
            .flatten()
            .any(|row| filter.matches(row))
    }
}

/// Live push channel. Unsubscribes on `unsubscribe()` or drop.
pub struct Subscription {
    table: Table,
    feed: Option<JoinHandle<()>>,
    live: Option<Arc<AtomicUsize>>,
}

impl Subscription {
    pub fn new(table: Table, feed: JoinHandle<()>) -> Self {
        Self {
            table,
            feed: Some(feed),
            live: None,
        }
    }

    /// Count this channel in `live` until it is closed.
    pub fn tracked(mut self, live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        self.live = Some(live);
        self
    }

    pub fn table(&self) -> Table {
        self.table
    }

    pub fn is_active(&self) -> bool {
        self.feed.as_ref().is_some_and(|f| !f.is_finished())
    }

    pub fn unsubscribe(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if let Some(feed) = self.feed.take() {
            feed.abort();
        }
        if let Some(live) = self.live.take() {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("table", &self.table)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Client for the remote relational store.
pub trait RemoteStore: Clone + Send + Sync + 'static {
    fn select(&self, query: Query) -> impl Future<Output = Result<Vec<Value>, VaultError>> + Send;

    fn count(
        &self,
        table: Table,
        filter: Filter,
    ) -> impl Future<Output = Result<u64, VaultError>> + Send;

    /// Insert one row and return it as stored, with generated columns filled in.
    fn insert(
        &self,
        table: Table,
        record: Value,
    ) -> impl Future<Output = Result<Value, VaultError>> + Send;

    /// Delete matching rows and return how many were removed.
    fn delete(
        &self,
        table: Table,
        filter: Filter,
    ) -> impl Future<Output = Result<u64, VaultError>> + Send;

    fn subscribe<F>(&self, table: Table, filter: Option<Filter>, on_change: F) -> Subscription
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static;
}

/// Decode store rows into typed models.
pub fn decode_rows<T: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>, VaultError> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(VaultError::from))
        .collect()
}

/// Pull one string column out of each row.
pub fn column_values(rows: &[Value], column: &str) -> Vec<String> {
    rows.iter()
        .filter_map(|r| r.get(column).and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}
