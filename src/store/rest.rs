use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder, Retryable};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use reqwest::{Method, RequestBuilder, Response};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::{ChangeEvent, Clause, Direction, Filter, Query, RemoteStore, Subscription, Table};
use crate::config::StoreConfig;
use crate::error::{IsRetryable, VaultError};

fn default_retry_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(200))
        .with_max_delay(Duration::from_secs(3))
        .with_max_times(3)
        .with_jitter()
}

fn reconnect_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_max_delay(Duration::from_secs(30))
        .without_max_times()
        .with_jitter()
}

/// Delays between change feed connection attempts. A connection that opened
/// starts the backoff over, so a long-lived feed that drops reconnects quickly.
struct ReconnectSchedule {
    backoff: ExponentialBackoff,
}

impl ReconnectSchedule {
    fn new() -> Self {
        Self {
            backoff: reconnect_policy().build(),
        }
    }

    fn after_attempt(&mut self, opened: bool) -> Duration {
        if opened {
            self.backoff = reconnect_policy().build();
        }
        self.backoff.next().unwrap_or(Duration::from_secs(30))
    }
}

/// Client for a PostgREST-style collection API plus an SSE change feed.
#[derive(Clone)]
pub struct RestStore {
    client: reqwest::Client,
    inner: Arc<Endpoints>,
}

struct Endpoints {
    rest: Url,
    realtime: Option<Url>,
    api_key: String,
    bearer: String,
    request_timeout: Duration,
}

impl RestStore {
    pub fn new(cfg: &StoreConfig) -> Result<Self, VaultError> {
        let rest_url = cfg
            .rest_url
            .as_deref()
            .ok_or_else(|| VaultError::Config("store.rest_url is not configured".to_string()))?;
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("knowledge-vaults/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(cfg.connect_timeout());
        if let Some(proxy_url) = cfg.proxy.as_deref() {
            builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
        }
        // The change feed is a long-lived response; CRUD requests set their own timeout.
        let client = builder.build()?;
        Self::with_client(client, cfg, rest_url)
    }

    fn with_client(
        client: reqwest::Client,
        cfg: &StoreConfig,
        rest_url: &str,
    ) -> Result<Self, VaultError> {
        let rest = with_trailing_slash(Url::parse(rest_url)?);
        let realtime = cfg.realtime_url.as_deref().map(Url::parse).transpose()?;
        let bearer = cfg
            .access_token
            .clone()
            .unwrap_or_else(|| cfg.api_key.clone());
        Ok(Self {
            client,
            inner: Arc::new(Endpoints {
                rest,
                realtime,
                api_key: cfg.api_key.clone(),
                bearer,
                request_timeout: cfg.request_timeout(),
            }),
        })
    }

    fn table_url(&self, table: Table) -> Result<Url, VaultError> {
        Ok(self.inner.rest.join(table.as_str())?)
    }

    fn authorized(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", &self.inner.api_key)
            .bearer_auth(&self.inner.bearer)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.authorized(method, url)
            .timeout(self.inner.request_timeout)
    }

    async fn send(request: RequestBuilder) -> Result<Response, VaultError> {
        let resp = request.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(VaultError::upstream(status, &body))
    }
}

impl RemoteStore for RestStore {
    async fn select(&self, query: Query) -> Result<Vec<Value>, VaultError> {
        let mut url = self.table_url(query.table)?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("select", "*");
            for (column, predicate) in encode_filter(&query.filter) {
                pairs.append_pair(column, &predicate);
            }
            if let Some((column, direction)) = query.order {
                pairs.append_pair("order", &encode_order(column, direction));
            }
        }
        (|| async {
            let resp = Self::send(self.request(Method::GET, url.clone())).await?;
            Ok::<_, VaultError>(resp.json::<Vec<Value>>().await?)
        })
        .retry(default_retry_policy())
        .when(|e: &VaultError| e.is_retryable())
        .notify(|err, dur: Duration| {
            warn!(table = %query.table, "select retrying after error {}, sleeping {:?}", err, dur);
        })
        .await
    }

    async fn count(&self, table: Table, filter: Filter) -> Result<u64, VaultError> {
        let mut url = self.table_url(table)?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("select", "id");
            for (column, predicate) in encode_filter(&filter) {
                pairs.append_pair(column, &predicate);
            }
        }
        let resp = (|| async {
            Self::send(
                self.request(Method::HEAD, url.clone())
                    .header("Prefer", "count=exact"),
            )
            .await
        })
        .retry(default_retry_policy())
        .when(|e: &VaultError| e.is_retryable())
        .await?;
        resp.headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range)
            .ok_or_else(|| VaultError::Upstream {
                status: resp.status(),
                message: format!("{table} count missing from response"),
            })
    }

    async fn insert(&self, table: Table, record: Value) -> Result<Value, VaultError> {
        let url = self.table_url(table)?;
        let resp = Self::send(
            self.request(Method::POST, url)
                .header("Prefer", "return=representation")
                .json(&record),
        )
        .await?;
        let mut rows: Vec<Value> = resp.json().await?;
        if rows.is_empty() {
            return Err(VaultError::Constraint(format!(
                "{table} insert returned no row"
            )));
        }
        debug!(%table, "row inserted");
        Ok(rows.swap_remove(0))
    }

    async fn delete(&self, table: Table, filter: Filter) -> Result<u64, VaultError> {
        let mut url = self.table_url(table)?;
        {
            let mut pairs = url.query_pairs_mut();
            for (column, predicate) in encode_filter(&filter) {
                pairs.append_pair(column, &predicate);
            }
        }
        let resp = Self::send(
            self.request(Method::DELETE, url)
                .header("Prefer", "return=representation"),
        )
        .await?;
        let rows: Vec<Value> = resp.json().await?;
        debug!(%table, affected = rows.len(), "rows deleted");
        Ok(rows.len() as u64)
    }

    fn subscribe<F>(&self, table: Table, filter: Option<Filter>, on_change: F) -> Subscription
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        let Some(realtime) = self.inner.realtime.clone() else {
            warn!(%table, "store.realtime_url not configured; changes from other clients will not be pushed");
            return Subscription::new(table, tokio::spawn(async {}));
        };
        let store = self.clone();
        let feed = tokio::spawn(async move {
            let mut url = realtime;
            {
                let mut pairs = url.query_pairs_mut();
                pairs.append_pair("table", table.as_str());
                if let Some(f) = filter.as_ref() {
                    for (column, predicate) in encode_filter(f) {
                        pairs.append_pair("filter", &format!("{column}={predicate}"));
                    }
                }
            }
            let mut schedule = ReconnectSchedule::new();
            let mut attempted = false;
            loop {
                let mut opened = false;
                match store
                    .follow_feed(&url, table, filter.as_ref(), &on_change, attempted, &mut opened)
                    .await
                {
                    Ok(()) => info!(%table, "change feed closed by server; reconnecting"),
                    Err(e) => warn!(%table, error = %e, "change feed failed; reconnecting"),
                }
                attempted = true;
                tokio::time::sleep(schedule.after_attempt(opened)).await;
            }
        });
        Subscription::new(table, feed)
    }
}

impl RestStore {
    /// Stream one SSE connection. After a reconnect, subscribers get a resync
    /// since events may have been missed in between.
    async fn follow_feed<F>(
        &self,
        url: &Url,
        table: Table,
        filter: Option<&Filter>,
        on_change: &F,
        resync: bool,
        opened: &mut bool,
    ) -> Result<(), VaultError>
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        let resp = Self::send(self.authorized(Method::GET, url.clone()).headers(headers)).await?;
        *opened = true;
        debug!(%table, "change feed connected");
        if resync {
            on_change(ChangeEvent::resync(table));
        }
        let mut events = resp.bytes_stream().eventsource();
        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    return Err(VaultError::Upstream {
                        status: reqwest::StatusCode::BAD_GATEWAY,
                        message: format!("change feed stream error: {e}"),
                    });
                }
            };
            if event.data.trim().is_empty() {
                continue;
            }
            match decode_change(&event.data) {
                Ok(change) if change.table == table && change.is_visible_to(filter) => {
                    on_change(change)
                }
                Ok(_) => {}
                Err(e) => warn!(%table, error = %e, "skipping undecodable change event"),
            }
        }
        Ok(())
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn encode_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `col=eq.v`, `col=is.null`, `col=in.("a","b")`.
fn encode_filter(filter: &Filter) -> Vec<(&'static str, String)> {
    filter
        .clauses()
        .iter()
        .map(|clause| match clause {
            Clause::Eq(column, Value::Null) => (*column, "is.null".to_string()),
            Clause::Eq(column, value) => (*column, format!("eq.{}", encode_value(value))),
            Clause::EqIgnoreCase(column, value) => (*column, format!("ilike.{}", escape_like(value))),
            Clause::In(column, values) => {
                let list = values
                    .iter()
                    .map(|v| format!("\"{}\"", encode_value(v).replace('"', "\\\"")))
                    .collect::<Vec<_>>()
                    .join(",");
                (*column, format!("in.({list})"))
            }
        })
        .collect()
}

/// `ilike` without wildcards: LIKE metacharacters are escaped.
fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn encode_order(column: &str, direction: Direction) -> String {
    match direction {
        Direction::Ascending => format!("{column}.asc"),
        Direction::Descending => format!("{column}.desc"),
    }
}

/// Total from a `Content-Range` header such as `0-24/3573` or `*/0`.
fn parse_content_range(header: &str) -> Option<u64> {
    header.rsplit_once('/')?.1.trim().parse().ok()
}

fn decode_change(data: &str) -> Result<ChangeEvent, serde_json::Error> {
    serde_json::from_str(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChangeKind;

    #[test]
    fn reconnect_delay_starts_over_after_an_opened_feed() {
        let mut schedule = ReconnectSchedule::new();
        let mut delay = Duration::ZERO;
        for _ in 0..6 {
            delay = schedule.after_attempt(false);
        }
        assert!(delay >= Duration::from_secs(16), "{delay:?}");
        let after_open = schedule.after_attempt(true);
        assert!(after_open <= Duration::from_secs(1), "{after_open:?}");
        assert!(schedule.after_attempt(false) <= Duration::from_secs(2));
    }

    #[test]
    fn filters_encode_as_postgrest_predicates() {
        let filter = Filter::new()
            .eq("vault_id", "v-1")
            .is_in("source_id", ["s-1", "s-2"])
            .eq("quote", Value::Null);
        assert_eq!(
            encode_filter(&filter),
            vec![
                ("vault_id", "eq.v-1".to_string()),
                ("source_id", "in.(\"s-1\",\"s-2\")".to_string()),
                ("quote", "is.null".to_string()),
            ]
        );
        assert_eq!(encode_order("created_at", Direction::Descending), "created_at.desc");
        let by_email = Filter::new().eq_ignore_case("email", "Ann_Lee@Example.com");
        assert_eq!(
            encode_filter(&by_email),
            vec![("email", "ilike.Ann\\_Lee@Example.com".to_string())]
        );
    }

    #[test]
    fn content_range_totals() {
        assert_eq!(parse_content_range("0-24/3573"), Some(3573));
        assert_eq!(parse_content_range("*/0"), Some(0));
        assert_eq!(parse_content_range("0-9/*"), None);
        assert_eq!(parse_content_range("garbage"), None);
    }

    #[test]
    fn change_payloads_decode() {
        let change = decode_change(
            r#"{"table":"sources","type":"DELETE","record":null,"old_record":{"id":"s-1","vault_id":"v-1"}}"#,
        )
        .unwrap();
        assert_eq!(change.kind, ChangeKind::Delete);
        assert_eq!(change.row().unwrap()["id"], "s-1");
        assert!(decode_change(r#"{"table":"nope","type":"INSERT"}"#).is_err());
    }

    #[test]
    fn rest_base_keeps_its_path_when_joined() {
        let cfg = StoreConfig {
            rest_url: Some("https://db.example.com/rest/v1".to_string()),
            api_key: "anon".to_string(),
            ..StoreConfig::default()
        };
        let store = RestStore::new(&cfg).unwrap();
        assert_eq!(
            store.table_url(Table::VaultMemberships).unwrap().as_str(),
            "https://db.example.com/rest/v1/vault_memberships"
        );
    }

    #[test]
    fn missing_rest_url_is_reported() {
        let err = RestStore::new(&StoreConfig::default()).err().unwrap();
        assert!(err.to_string().contains("rest_url"));
    }
}
