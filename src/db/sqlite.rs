use crate::db::policy::AccessPolicy;
use crate::db::schema::{SQLITE_INIT, cascades, columns};
use crate::error::VaultError;
use crate::store::{
    ChangeEvent, ChangeKind, Clause, Direction, Filter, Query, RemoteStore, Subscription, Table,
    column_values,
};
use crate::types::ProfileId;
use chrono::{DateTime, DurationRound, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, QueryBuilder, Row, Sqlite, SqliteConnection};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, broadcast};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};
use uuid::Uuid;

pub type SqlitePool = Pool<Sqlite>;

/// Change events buffered per subscriber before it is considered lagging.
const CHANGE_BUFFER: usize = 1024;

/// Embedded store: SQLite tables, a broadcast change feed and a write policy.
///
/// Clones share the pool and the feed. `acting_as` scopes a clone to the
/// identity whose writes the policy checks.
#[derive(Clone)]
pub struct SqliteStore {
    shared: Arc<Shared>,
    actor: Option<ProfileId>,
}

struct Shared {
    pool: SqlitePool,
    changes: broadcast::Sender<ChangeEvent>,
    live: Arc<AtomicUsize>,
    clock: Mutex<DateTime<Utc>>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            shared: Arc::new(Shared {
                pool,
                changes,
                live: Arc::new(AtomicUsize::new(0)),
                clock: Mutex::new(DateTime::<Utc>::MIN_UTC),
            }),
            actor: None,
        }
    }

    /// Open (creating if missing) the database at `database_url` and apply the schema.
    pub async fn connect(database_url: &str) -> Result<Self, VaultError> {
        let connect_opts = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new().connect_with(connect_opts).await?;
        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    /// A private in-memory database held on a single connection.
    pub async fn in_memory() -> Result<Self, VaultError> {
        let connect_opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_opts)
            .await?;
        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.shared.pool
    }

    /// Clone of this store whose writes are authorized as `profile_id`.
    pub fn acting_as(&self, profile_id: impl Into<ProfileId>) -> Self {
        Self {
            shared: self.shared.clone(),
            actor: Some(profile_id.into()),
        }
    }

    pub fn actor(&self) -> Option<&str> {
        self.actor.as_deref()
    }

    /// Subscriptions opened on this store (any clone) and not yet closed.
    pub fn live_subscriptions(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Initialize the schema by executing the bundled DDL.
    pub async fn init_schema(&self) -> Result<(), VaultError> {
        for stmt in SQLITE_INIT.split(';') {
            let s = stmt.trim();
            if s.is_empty() {
                continue;
            }
            sqlx::query(s).execute(&self.shared.pool).await?;
        }
        Ok(())
    }

    fn policy(&self) -> AccessPolicy<'_> {
        AccessPolicy::new(&self.shared.pool, self.actor.as_deref())
    }

    fn publish(&self, event: ChangeEvent) {
        // No receivers is fine: nobody is watching.
        let _ = self.shared.changes.send(event);
    }

    /// Strictly increasing creation stamp, microsecond precision.
    async fn next_timestamp(&self) -> String {
        let mut last = self.shared.clock.lock().await;
        let now = Utc::now();
        let now = now
            .duration_trunc(chrono::Duration::microseconds(1))
            .unwrap_or(now);
        let next = now.max(*last + chrono::Duration::microseconds(1));
        *last = next;
        next.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    async fn select_rows(
        &self,
        table: Table,
        filter: &Filter,
        order: Option<(&'static str, Direction)>,
    ) -> Result<Vec<Value>, VaultError> {
        let mut conn = self.shared.pool.acquire().await?;
        select_on(&mut conn, table, filter, order).await
    }
}

impl RemoteStore for SqliteStore {
    async fn select(&self, query: Query) -> Result<Vec<Value>, VaultError> {
        self.select_rows(query.table, &query.filter, query.order)
            .await
    }

    async fn count(&self, table: Table, filter: Filter) -> Result<u64, VaultError> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT COUNT(*) FROM {table}"));
        push_where(&mut qb, table, &filter)?;
        let n: i64 = qb
            .build_query_scalar::<i64>()
            .fetch_one(&self.shared.pool)
            .await?;
        Ok(n.max(0) as u64)
    }

    async fn insert(&self, table: Table, record: Value) -> Result<Value, VaultError> {
        let Value::Object(mut fields) = record else {
            return Err(VaultError::Constraint(format!(
                "{table} rows must be JSON objects"
            )));
        };
        for key in fields.keys() {
            check_column(table, key)?;
        }
        if fields.get("id").is_none_or(Value::is_null) {
            fields.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
        }
        fields.insert("created_at".into(), Value::String(self.next_timestamp().await));
        let cols = columns(table);
        // Same shape a later select returns: every column, text or null.
        let record: Value = cols
            .iter()
            .map(|c| {
                let v = fields.get(*c).and_then(sql_text);
                ((*c).to_string(), v.map(Value::String).unwrap_or(Value::Null))
            })
            .collect::<Map<String, Value>>()
            .into();

        self.policy().authorize_insert(table, &record).await?;

        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "INSERT INTO {table} ({}) VALUES (",
            quoted(cols)
        ));
        for (i, col) in cols.iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            qb.push_bind(record.get(*col).and_then(sql_text));
        }
        qb.push(")");
        qb.build()
            .execute(&self.shared.pool)
            .await
            .map_err(constraint_error)?;

        debug!(%table, id = record["id"].as_str().unwrap_or("-"), "row inserted");
        self.publish(ChangeEvent {
            table,
            kind: ChangeKind::Insert,
            record: Some(record.clone()),
            old_record: None,
        });
        Ok(record)
    }

    async fn delete(&self, table: Table, filter: Filter) -> Result<u64, VaultError> {
        let doomed = self.select_rows(table, &filter, None).await?;
        if doomed.is_empty() {
            return Ok(0);
        }
        let policy = self.policy();
        for row in &doomed {
            policy.authorize_delete(table, row).await?;
        }
        let ids = column_values(&doomed, "id");

        let mut tx = self.shared.pool.begin().await?;

        // Rows the foreign keys will take with them, so subscribers hear about those too.
        let mut cascaded = Vec::new();
        let mut pending = vec![(table, ids.clone())];
        while let Some((parent, parent_ids)) = pending.pop() {
            for (child, column) in cascades(parent) {
                let rows = select_on(
                    &mut tx,
                    *child,
                    &Filter::new().is_in(column, parent_ids.clone()),
                    None,
                )
                .await?;
                if rows.is_empty() {
                    continue;
                }
                pending.push((*child, column_values(&rows, "id")));
                cascaded.extend(rows.into_iter().map(|row| deleted(*child, row)));
            }
        }

        let mut qb = QueryBuilder::<Sqlite>::new(format!("DELETE FROM {table}"));
        push_where(&mut qb, table, &Filter::new().is_in("id", ids))?;
        let affected = qb
            .build()
            .execute(&mut *tx)
            .await
            .map_err(constraint_error)?
            .rows_affected();
        tx.commit().await?;

        debug!(%table, affected, cascaded = cascaded.len(), "rows deleted");
        for row in doomed {
            self.publish(deleted(table, row));
        }
        for event in cascaded {
            self.publish(event);
        }
        Ok(affected)
    }

    fn subscribe<F>(&self, table: Table, filter: Option<Filter>, on_change: F) -> Subscription
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        let mut rx = self.shared.changes.subscribe();
        let feed = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.table == table && event.is_visible_to(filter.as_ref()) {
                            on_change(event);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(%table, skipped, "change feed lagged; requesting resync");
                        on_change(ChangeEvent::resync(table));
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        debug!(%table, "subscribed to change feed");
        Subscription::new(table, feed).tracked(self.shared.live.clone())
    }
}

fn deleted(table: Table, row: Value) -> ChangeEvent {
    ChangeEvent {
        table,
        kind: ChangeKind::Delete,
        record: None,
        old_record: Some(row),
    }
}

async fn select_on(
    conn: &mut SqliteConnection,
    table: Table,
    filter: &Filter,
    order: Option<(&'static str, Direction)>,
) -> Result<Vec<Value>, VaultError> {
    let mut qb = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {} FROM {table}",
        quoted(columns(table))
    ));
    push_where(&mut qb, table, filter)?;
    if let Some((column, direction)) = order {
        check_column(table, column)?;
        let dir = match direction {
            Direction::Ascending => "ASC",
            Direction::Descending => "DESC",
        };
        qb.push(format!(" ORDER BY \"{column}\" {dir}"));
    }
    let rows = qb.build().fetch_all(&mut *conn).await?;
    rows.iter().map(|row| row_to_json(table, row)).collect()
}

fn push_where(
    qb: &mut QueryBuilder<'_, Sqlite>,
    table: Table,
    filter: &Filter,
) -> Result<(), VaultError> {
    for (i, clause) in filter.clauses().iter().enumerate() {
        check_column(table, clause.column())?;
        qb.push(if i == 0 { " WHERE " } else { " AND " });
        match clause {
            Clause::Eq(column, Value::Null) => {
                qb.push(format!("\"{column}\" IS NULL"));
            }
            Clause::Eq(column, value) => {
                qb.push(format!("\"{column}\" = "));
                qb.push_bind(sql_text(value));
            }
            Clause::EqIgnoreCase(column, value) => {
                qb.push(format!("\"{column}\" = "));
                qb.push_bind(value.clone());
                qb.push(" COLLATE NOCASE");
            }
            Clause::In(_, values) if values.is_empty() => {
                qb.push("0");
            }
            Clause::In(column, values) => {
                qb.push(format!("\"{column}\" IN ("));
                for (j, value) in values.iter().enumerate() {
                    if j > 0 {
                        qb.push(", ");
                    }
                    qb.push_bind(sql_text(value));
                }
                qb.push(")");
            }
        }
    }
    Ok(())
}

fn check_column(table: Table, column: &str) -> Result<(), VaultError> {
    if columns(table).contains(&column) {
        Ok(())
    } else {
        Err(VaultError::UnknownColumn {
            table: table.as_str(),
            column: column.to_string(),
        })
    }
}

fn quoted(cols: &[&str]) -> String {
    cols.iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Every column is TEXT; non-string JSON scalars are stored by their JSON text.
fn sql_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn row_to_json(table: Table, row: &SqliteRow) -> Result<Value, VaultError> {
    let mut obj = Map::new();
    for col in columns(table) {
        let value: Option<String> = row.try_get(*col)?;
        obj.insert(
            (*col).to_string(),
            value.map(Value::String).unwrap_or(Value::Null),
        );
    }
    Ok(Value::Object(obj))
}

/// Constraint violations are user-facing; everything else stays a database error.
fn constraint_error(e: sqlx::Error) -> VaultError {
    if let Some(db) = e.as_database_error()
        && (db.is_unique_violation() || db.is_foreign_key_violation() || db.is_check_violation())
    {
        return VaultError::Constraint(db.message().to_string());
    }
    e.into()
}
