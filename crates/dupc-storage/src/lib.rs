//! GraphQL transport with retry/backoff, plus the settings and alias store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dupc_core::{Alias, AliasKind, ConfigLayer};
use serde_json::{json, Value};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

const MAX_ERROR_BODY_CHARS: usize = 500;

/// Closed set of remote failure categories, decided once at the transport boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    ConcurrencyLimit,
    ItemLocked,
    RateLimited,
    Other,
}

impl RemoteErrorKind {
    pub fn is_transient(self) -> bool {
        !matches!(self, Self::Other)
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("http request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("HTTP {status} from remote ({kind:?}). Body: {body}")]
    HttpStatus {
        status: u16,
        kind: RemoteErrorKind,
        body: String,
    },
    #[error("malformed remote response: {0}")]
    MalformedResponse(String),
    #[error("remote errors ({kind:?}): {message}")]
    Remote { kind: RemoteErrorKind, message: String },
}

impl RemoteError {
    pub fn kind(&self) -> RemoteErrorKind {
        match self {
            Self::HttpStatus { kind, .. } | Self::Remote { kind, .. } => *kind,
            Self::Request(_) | Self::MalformedResponse(_) => RemoteErrorKind::Other,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

/// Map an HTTP status and/or error payload onto a [`RemoteErrorKind`].
pub fn classify_failure(status: Option<u16>, payload: Option<&Value>) -> RemoteErrorKind {
    if status == Some(429) {
        return RemoteErrorKind::RateLimited;
    }
    let Some(payload) = payload else {
        return RemoteErrorKind::Other;
    };

    let mut texts: Vec<&str> = Vec::new();
    let mut codes: Vec<i64> = Vec::new();
    for key in ["error_code", "error_message"] {
        if let Some(text) = payload.get(key).and_then(Value::as_str) {
            texts.push(text);
        }
    }
    codes.extend(payload.get("status_code").and_then(Value::as_i64));
    for err in payload
        .get("errors")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
    {
        texts.extend(err.get("message").and_then(Value::as_str));
        if let Some(ext) = err.get("extensions") {
            texts.extend(ext.get("code").and_then(Value::as_str));
            codes.extend(ext.get("status_code").and_then(Value::as_i64));
        }
    }

    if texts.iter().any(|t| t.contains("TooManyConcurrentRequests")) {
        RemoteErrorKind::ConcurrencyLimit
    } else if texts.iter().any(|t| t.contains("Failed to lock item")) {
        RemoteErrorKind::ItemLocked
    } else if codes.contains(&429)
        || texts.iter().any(|t| {
            let lower = t.to_ascii_lowercase();
            lower.contains("ratelimit") || lower.contains("rate limit")
        })
    {
        RemoteErrorKind::RateLimited
    } else {
        RemoteErrorKind::Other
    }
}

/// Unwrap a GraphQL response body into its `data` member.
pub fn interpret_payload(payload: Value) -> Result<Value, RemoteError> {
    let has_errors = payload
        .get("errors")
        .and_then(Value::as_array)
        .is_some_and(|errs| !errs.is_empty())
        || payload.get("error_message").is_some();
    if has_errors {
        let kind = classify_failure(None, Some(&payload));
        let detail = payload
            .get("errors")
            .cloned()
            .or_else(|| payload.get("error_message").cloned())
            .unwrap_or(Value::Null);
        return Err(RemoteError::Remote {
            kind,
            message: truncate_chars(&detail.to_string(), MAX_ERROR_BODY_CHARS),
        });
    }
    match payload.get("data") {
        Some(data) if !data.is_null() => Ok(data.clone()),
        _ => Err(RemoteError::MalformedResponse("response has no data member".to_string())),
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[async_trait]
pub trait GraphQlTransport: Send + Sync {
    async fn execute(&self, query: &str, variables: &Value) -> Result<Value, RemoteError>;
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_step: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            jitter_step: Duration::from_millis(100),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retrying after the failed attempt `attempt_index` (0-based):
    /// capped exponential plus a linear jitter term.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        delay.saturating_add(self.jitter_step.saturating_mul(attempt_index as u32))
    }
}

/// Run a GraphQL call, retrying transient failures according to `policy`.
pub async fn execute_with_retry<T>(
    transport: &T,
    policy: &BackoffPolicy,
    query: &str,
    variables: &Value,
) -> Result<Value, RemoteError>
where
    T: GraphQlTransport + ?Sized,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0usize;
    loop {
        match transport.execute(query, variables).await {
            Ok(data) => return Ok(data),
            Err(err) if err.is_transient() && attempt + 1 < attempts => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    kind = ?err.kind(),
                    "transient remote failure; backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub endpoint: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl HttpClientConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// reqwest-backed [`GraphQlTransport`].
#[derive(Debug, Clone)]
pub struct HttpGraphQlClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpGraphQlClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint,
            api_key: config.api_key,
        })
    }
}

#[async_trait]
impl GraphQlTransport for HttpGraphQlClient {
    async fn execute(&self, query: &str, variables: &Value) -> Result<Value, RemoteError> {
        let span = info_span!("graphql", endpoint = %self.endpoint);
        async {
            let resp = self
                .client
                .post(&self.endpoint)
                .header(reqwest::header::AUTHORIZATION, &self.api_key)
                .json(&json!({ "query": query, "variables": variables }))
                .send()
                .await?;
            let status = resp.status();
            let body = resp.text().await?;
            let parsed = serde_json::from_str::<Value>(&body).ok();

            if !status.is_success() {
                return Err(RemoteError::HttpStatus {
                    status: status.as_u16(),
                    kind: classify_failure(Some(status.as_u16()), parsed.as_ref()),
                    body: truncate_chars(&body, MAX_ERROR_BODY_CHARS),
                });
            }
            let payload = parsed
                .ok_or_else(|| RemoteError::MalformedResponse("response body is not JSON".to_string()))?;
            interpret_payload(payload)
        }
        .instrument(span)
        .await
    }
}

/// Key/value settings plus display-name aliases.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load_settings(&self) -> anyhow::Result<ConfigLayer>;
    /// Last write wins per key.
    async fn upsert_settings(&self, values: &ConfigLayer) -> anyhow::Result<()>;
    async fn get_alias(&self, kind: AliasKind, raw_id: &str) -> anyhow::Result<Option<Alias>>;
    async fn list_aliases(&self, kind: AliasKind) -> anyhow::Result<Vec<Alias>>;
    async fn upsert_alias(&self, alias: &Alias) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct PgSettingsStore {
    pool: PgPool,
}

impl PgSettingsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to settings database")?;
        Ok(Self::new(pool))
    }

    pub async fn init_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
              key         text PRIMARY KEY,
              value       text NOT NULL,
              updated_at  timestamptz NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating settings table")?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS aliases (
              kind        text NOT NULL CHECK (kind IN ('board','group')),
              raw_id      text NOT NULL,
              display     text NOT NULL,
              extra_json  jsonb DEFAULT '{}'::jsonb,
              updated_at  timestamptz NOT NULL DEFAULT now(),
              PRIMARY KEY (kind, raw_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating aliases table")?;
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for PgSettingsStore {
    async fn load_settings(&self) -> anyhow::Result<ConfigLayer> {
        let rows = sqlx::query("SELECT key, value FROM settings")
            .fetch_all(&self.pool)
            .await
            .context("loading settings")?;
        let mut out = ConfigLayer::new();
        for row in rows {
            out.insert(row.try_get("key")?, row.try_get("value")?);
        }
        Ok(out)
    }

    async fn upsert_settings(&self, values: &ConfigLayer) -> anyhow::Result<()> {
        for (key, value) in values {
            sqlx::query(
                r#"
                INSERT INTO settings(key, value) VALUES ($1, $2)
                ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()
                "#,
            )
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .with_context(|| format!("upserting setting {key}"))?;
        }
        Ok(())
    }

    async fn get_alias(&self, kind: AliasKind, raw_id: &str) -> anyhow::Result<Option<Alias>> {
        let row = sqlx::query(
            "SELECT display, extra_json FROM aliases WHERE kind = $1 AND raw_id = $2",
        )
        .bind(kind.as_str())
        .bind(raw_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading {} alias {raw_id}", kind.as_str()))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let extra: Option<Value> = row.try_get("extra_json")?;
        Ok(Some(Alias {
            kind,
            raw_id: raw_id.to_string(),
            display: row.try_get("display")?,
            extra: extra.unwrap_or_else(|| json!({})),
        }))
    }

    async fn list_aliases(&self, kind: AliasKind) -> anyhow::Result<Vec<Alias>> {
        let rows = sqlx::query(
            "SELECT raw_id, display, extra_json FROM aliases WHERE kind = $1 ORDER BY display",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("listing {} aliases", kind.as_str()))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let extra: Option<Value> = row.try_get("extra_json")?;
            out.push(Alias {
                kind,
                raw_id: row.try_get("raw_id")?,
                display: row.try_get("display")?,
                extra: extra.unwrap_or_else(|| json!({})),
            });
        }
        Ok(out)
    }

    async fn upsert_alias(&self, alias: &Alias) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO aliases(kind, raw_id, display, extra_json)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (kind, raw_id) DO UPDATE
              SET display = EXCLUDED.display,
                  extra_json = EXCLUDED.extra_json,
                  updated_at = now()
            "#,
        )
        .bind(alias.kind.as_str())
        .bind(&alias.raw_id)
        .bind(&alias.display)
        .bind(sqlx::types::Json(&alias.extra))
        .execute(&self.pool)
        .await
        .with_context(|| format!("upserting {} alias {}", alias.kind.as_str(), alias.raw_id))?;
        Ok(())
    }
}

/// Process-local store used when no database is configured, and in tests.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    settings: Mutex<ConfigLayer>,
    aliases: Mutex<HashMap<(AliasKind, String), Alias>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(settings: ConfigLayer) -> Self {
        Self {
            settings: Mutex::new(settings),
            aliases: Mutex::default(),
        }
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn load_settings(&self) -> anyhow::Result<ConfigLayer> {
        Ok(self.settings.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    async fn upsert_settings(&self, values: &ConfigLayer) -> anyhow::Result<()> {
        let mut settings = self.settings.lock().unwrap_or_else(PoisonError::into_inner);
        settings.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn get_alias(&self, kind: AliasKind, raw_id: &str) -> anyhow::Result<Option<Alias>> {
        let aliases = self.aliases.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(aliases.get(&(kind, raw_id.to_string())).cloned())
    }

    async fn list_aliases(&self, kind: AliasKind) -> anyhow::Result<Vec<Alias>> {
        let aliases = self.aliases.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = aliases
            .values()
            .filter(|a| a.kind == kind)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.display.cmp(&b.display));
        Ok(out)
    }

    async fn upsert_alias(&self, alias: &Alias) -> anyhow::Result<()> {
        let mut aliases = self.aliases.lock().unwrap_or_else(PoisonError::into_inner);
        aliases.insert((alias.kind, alias.raw_id.clone()), alias.clone());
        Ok(())
    }
}

/// Settings that exist in `layer` but differ from `current`; used to avoid no-op writes.
pub fn changed_settings(current: &ConfigLayer, layer: &ConfigLayer) -> ConfigLayer {
    layer
        .iter()
        .filter(|(k, v)| current.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect::<BTreeMap<_, _>>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FnTransport<F> {
        calls: AtomicUsize,
        respond: F,
    }

    impl<F> FnTransport<F>
    where
        F: Fn(usize) -> Result<Value, RemoteError> + Send + Sync,
    {
        fn new(respond: F) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                respond,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl<F> GraphQlTransport for FnTransport<F>
    where
        F: Fn(usize) -> Result<Value, RemoteError> + Send + Sync,
    {
        async fn execute(&self, _query: &str, _variables: &Value) -> Result<Value, RemoteError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.respond)(n)
        }
    }

    fn http_429() -> RemoteError {
        RemoteError::HttpStatus {
            status: 429,
            kind: classify_failure(Some(429), None),
            body: "HTTP 429 Too Many Requests".into(),
        }
    }

    #[test]
    fn backoff_is_exponential_capped_with_linear_jitter() {
        let policy = BackoffPolicy::default();
        let delays = (0..5).map(|n| policy.delay_for_attempt(n)).collect::<Vec<_>>();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1100),
                Duration::from_millis(2200),
                Duration::from_millis(4300),
                Duration::from_millis(5400),
            ]
        );
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(9000));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_call_retries_five_times_then_fails() {
        let transport = FnTransport::new(|_| Err(http_429()));
        let started = tokio::time::Instant::now();

        let err = execute_with_retry(&transport, &BackoffPolicy::default(), "query", &json!({}))
            .await
            .expect_err("always rate limited");

        assert_eq!(transport.calls(), 5);
        assert!(err.to_string().contains("HTTP 429"));
        assert_eq!(err.kind(), RemoteErrorKind::RateLimited);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(8100), "waited {waited:?}");
        assert!(waited < Duration::from_millis(8200), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_recovers() {
        let transport = FnTransport::new(|n| {
            if n < 2 {
                Err(RemoteError::Remote {
                    kind: RemoteErrorKind::ItemLocked,
                    message: "Failed to lock item id for graphql mutation".into(),
                })
            } else {
                Ok(json!({"ok": true}))
            }
        });
        let data = execute_with_retry(&transport, &BackoffPolicy::default(), "mutation", &json!({}))
            .await
            .expect("third attempt succeeds");
        assert_eq!(data, json!({"ok": true}));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn non_transient_failure_is_not_retried() {
        let transport = FnTransport::new(|_| {
            Err(RemoteError::Remote {
                kind: RemoteErrorKind::Other,
                message: "invalid argument".into(),
            })
        });
        let err = execute_with_retry(&transport, &BackoffPolicy::default(), "mutation", &json!({}))
            .await
            .expect_err("fails");
        assert!(!err.is_transient());
        assert_eq!(transport.calls(), 1);
    }

    #[test]
    fn classification_recognises_known_signatures() {
        let concurrent = json!({"errors": [{"message": "TooManyConcurrentRequestsException"}]});
        assert_eq!(classify_failure(None, Some(&concurrent)), RemoteErrorKind::ConcurrencyLimit);

        let locked = json!({"errors": [{"message": "Failed to lock item id for graphql mutation"}]});
        assert_eq!(classify_failure(None, Some(&locked)), RemoteErrorKind::ItemLocked);

        let status = json!({"errors": [{"message": "slow down", "extensions": {"status_code": 429}}]});
        assert_eq!(classify_failure(Some(200), Some(&status)), RemoteErrorKind::RateLimited);

        let legacy = json!({"error_code": "RateLimitExceeded", "error_message": "try later"});
        assert_eq!(classify_failure(None, Some(&legacy)), RemoteErrorKind::RateLimited);

        let other = json!({"errors": [{"message": "Parse error on \"}\""}]});
        assert_eq!(classify_failure(Some(400), Some(&other)), RemoteErrorKind::Other);
        assert_eq!(classify_failure(Some(429), None), RemoteErrorKind::RateLimited);
        assert_eq!(classify_failure(Some(500), None), RemoteErrorKind::Other);
    }

    #[test]
    fn payload_interpretation() {
        let data = interpret_payload(json!({"data": {"boards": []}})).expect("data");
        assert_eq!(data, json!({"boards": []}));

        let err = interpret_payload(json!({"data": null, "errors": [{"message": "boom"}]}))
            .expect_err("errors win");
        assert!(matches!(err, RemoteError::Remote { kind: RemoteErrorKind::Other, .. }));
        assert!(err.to_string().contains("boom"));

        let err = interpret_payload(json!({"account_id": 1})).expect_err("no data");
        assert!(matches!(err, RemoteError::MalformedResponse(_)));

        // an empty errors array is not a failure
        assert!(interpret_payload(json!({"data": {}, "errors": []})).is_ok());
    }

    #[tokio::test]
    async fn memory_store_is_last_write_wins() {
        let store = MemorySettingsStore::new();
        store
            .upsert_settings(&BTreeMap::from([("MIN_COUNT".into(), "2".into())]))
            .await
            .unwrap();
        store
            .upsert_settings(&BTreeMap::from([
                ("MIN_COUNT".into(), "4".into()),
                ("BOARD_ID".into(), "7".into()),
            ]))
            .await
            .unwrap();
        let settings = store.load_settings().await.unwrap();
        assert_eq!(settings.get("MIN_COUNT").map(String::as_str), Some("4"));
        assert_eq!(settings.get("BOARD_ID").map(String::as_str), Some("7"));

        let unchanged = changed_settings(&settings, &BTreeMap::from([("MIN_COUNT".into(), "4".into())]));
        assert!(unchanged.is_empty());
    }

    #[tokio::test]
    async fn memory_store_aliases_by_kind() {
        let store = MemorySettingsStore::new();
        for (kind, raw, display) in [
            (AliasKind::Group, "group_b", "Zeta"),
            (AliasKind::Group, "group_a", "Alpha"),
            (AliasKind::Board, "123", "Main board"),
        ] {
            store
                .upsert_alias(&Alias {
                    kind,
                    raw_id: raw.into(),
                    display: display.into(),
                    extra: json!({}),
                })
                .await
                .unwrap();
        }

        let board = store.get_alias(AliasKind::Board, "123").await.unwrap().unwrap();
        assert_eq!(board.display, "Main board");
        assert!(store.get_alias(AliasKind::Group, "123").await.unwrap().is_none());

        let groups = store.list_aliases(AliasKind::Group).await.unwrap();
        assert_eq!(
            groups.iter().map(|a| a.display.as_str()).collect::<Vec<_>>(),
            vec!["Alpha", "Zeta"]
        );
    }
}
