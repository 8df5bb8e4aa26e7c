//! Remote board (GraphQL) and embeddings provider adapters.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dupc_core::Item;
use dupc_storage::{execute_with_retry, BackoffPolicy, GraphQlTransport, RemoteError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_BOARD_API_URL: &str = "https://api.monday.com/v2";
pub const DEFAULT_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Upper bound on texts per embeddings call.
pub const MAX_EMBED_BATCH: usize = 100;

const ITEMS_PAGE_QUERY: &str = r#"
query($ids:[ID!], $limit:Int, $cursor:String){
  boards(ids:$ids){
    items_page(limit:$limit, cursor:$cursor){
      cursor
      items{ id name created_at group{id title} board{id} }
    }
  }
}"#;

const SUBITEMS_QUERY: &str = "query($ids:[ID!]){ items(ids:$ids){ id name subitems{ id name } } }";

const CREATE_SUBITEM_MUTATION: &str = "mutation($parent: ID!, $name: String!) { create_subitem(parent_item_id:$parent, item_name:$name){ id name } }";

/// Operations the consolidation engine needs from the remote board.
#[async_trait]
pub trait BoardApi: Send + Sync {
    /// Every item on the board, optionally limited to `group_filter` (empty = all groups).
    async fn fetch_items(&self, board_id: &str, group_filter: &BTreeSet<String>) -> Result<Vec<Item>, RemoteError>;
    /// Trimmed, non-empty names of the child records under `parent_id`.
    async fn existing_child_names(&self, parent_id: &str) -> Result<HashSet<String>, RemoteError>;
    /// One batched mutation creating a child record per name.
    async fn create_children(&self, parent_id: &str, names: &[String]) -> Result<(), RemoteError>;
    async fn create_child(&self, parent_id: &str, name: &str) -> Result<(), RemoteError>;
    /// One batched mutation relocating `item_ids` into `group_id`.
    async fn move_items(&self, item_ids: &[String], group_id: &str) -> Result<(), RemoteError>;
    /// One batched mutation archiving `item_ids`.
    async fn archive_items(&self, item_ids: &[String]) -> Result<(), RemoteError>;
}

#[derive(Debug, Deserialize)]
struct BoardsData {
    #[serde(default)]
    boards: Option<Vec<BoardNode>>,
}

#[derive(Debug, Deserialize)]
struct BoardNode {
    #[serde(default)]
    items_page: Option<ItemsPage>,
}

#[derive(Debug, Default, Deserialize)]
struct ItemsPage {
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    items: Option<Vec<ApiItem>>,
}

#[derive(Debug, Deserialize)]
struct ApiItem {
    #[serde(deserialize_with = "id_string")]
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    group: Option<ApiGroup>,
}

#[derive(Debug, Deserialize)]
struct ApiGroup {
    id: String,
}

impl ApiItem {
    fn into_item(self) -> Item {
        Item {
            id: self.id,
            name: self.name.unwrap_or_default(),
            created_at: self.created_at,
            group_id: self.group.map(|g| g.id),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ItemsData {
    #[serde(default)]
    items: Option<Vec<ParentNode>>,
}

#[derive(Debug, Deserialize)]
struct ParentNode {
    #[serde(default)]
    subitems: Option<Vec<SubitemNode>>,
}

#[derive(Debug, Deserialize)]
struct SubitemNode {
    #[serde(default)]
    name: Option<String>,
}

fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("unexpected id value {other}"))),
    }
}

fn decode<T: DeserializeOwned>(data: Value) -> Result<T, RemoteError> {
    serde_json::from_value(data).map_err(|err| RemoteError::MalformedResponse(err.to_string()))
}

/// Batched `create_subitem` mutation with one aliased field per name.
pub fn build_create_children_mutation(parent_id: &str, names: &[String]) -> (String, Value) {
    let mut var_defs = vec!["$parent: ID!".to_string()];
    let mut fields = Vec::with_capacity(names.len());
    let mut vars = Map::new();
    vars.insert("parent".into(), Value::String(parent_id.to_string()));
    for (i, name) in names.iter().enumerate() {
        var_defs.push(format!("$n{i}: String!"));
        fields.push(format!(
            "m{i}: create_subitem(parent_item_id:$parent, item_name:$n{i}){{ id name }}"
        ));
        vars.insert(format!("n{i}"), Value::String(name.clone()));
    }
    let query = format!("mutation ({}){{\n  {}\n}}", var_defs.join(", "), fields.join("\n  "));
    (query, Value::Object(vars))
}

pub fn build_move_mutation(item_ids: &[String], group_id: &str) -> (String, Value) {
    let mut var_defs = Vec::with_capacity(item_ids.len() * 2);
    let mut fields = Vec::with_capacity(item_ids.len());
    let mut vars = Map::new();
    for (i, id) in item_ids.iter().enumerate() {
        var_defs.push(format!("$id{i}: ID!"));
        var_defs.push(format!("$g{i}: String!"));
        fields.push(format!("m{i}: move_item_to_group(item_id:$id{i}, group_id:$g{i}) {{ id }}"));
        vars.insert(format!("id{i}"), Value::String(id.clone()));
        vars.insert(format!("g{i}"), Value::String(group_id.to_string()));
    }
    let query = format!("mutation({}) {{\n  {}\n}}", var_defs.join(", "), fields.join("\n  "));
    (query, Value::Object(vars))
}

pub fn build_archive_mutation(item_ids: &[String]) -> (String, Value) {
    let mut var_defs = Vec::with_capacity(item_ids.len());
    let mut fields = Vec::with_capacity(item_ids.len());
    let mut vars = Map::new();
    for (i, id) in item_ids.iter().enumerate() {
        var_defs.push(format!("$id{i}: ID!"));
        fields.push(format!("a{i}: archive_item(item_id:$id{i}) {{ id }}"));
        vars.insert(format!("id{i}"), Value::String(id.clone()));
    }
    let query = format!("mutation({}) {{\n  {}\n}}", var_defs.join(", "), fields.join("\n  "));
    (query, Value::Object(vars))
}

/// [`BoardApi`] over a monday.com-style GraphQL endpoint.
pub struct GraphQlBoard<T> {
    transport: T,
    backoff: BackoffPolicy,
    page_size: usize,
    page_pause: Duration,
}

impl<T: GraphQlTransport> GraphQlBoard<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            backoff: BackoffPolicy::default(),
            page_size: 100,
            page_pause: Duration::from_millis(100),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_page_pause(mut self, page_pause: Duration) -> Self {
        self.page_pause = page_pause;
        self
    }

    async fn call(&self, query: &str, variables: &Value) -> Result<Value, RemoteError> {
        execute_with_retry(&self.transport, &self.backoff, query, variables).await
    }
}

#[async_trait]
impl<T: GraphQlTransport> BoardApi for GraphQlBoard<T> {
    async fn fetch_items(&self, board_id: &str, group_filter: &BTreeSet<String>) -> Result<Vec<Item>, RemoteError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let vars = json!({ "ids": [board_id], "limit": self.page_size, "cursor": cursor });
            let data: BoardsData = decode(self.call(ITEMS_PAGE_QUERY, &vars).await?)?;
            let page = data
                .boards
                .unwrap_or_default()
                .into_iter()
                .next()
                .and_then(|b| b.items_page)
                .unwrap_or_default();
            let batch = page.items.unwrap_or_default();
            if batch.is_empty() {
                break;
            }
            let fetched = batch.len();
            items.extend(
                batch
                    .into_iter()
                    .filter(|it| {
                        group_filter.is_empty()
                            || it.group.as_ref().is_some_and(|g| group_filter.contains(&g.id))
                    })
                    .map(ApiItem::into_item),
            );
            debug!(board_id, fetched, kept = items.len(), "fetched items page");

            match page.cursor.filter(|c| !c.is_empty()) {
                Some(next) => cursor = Some(next),
                None => break,
            }
            tokio::time::sleep(self.page_pause).await;
        }
        Ok(items)
    }

    async fn existing_child_names(&self, parent_id: &str) -> Result<HashSet<String>, RemoteError> {
        let data: ItemsData = decode(self.call(SUBITEMS_QUERY, &json!({ "ids": [parent_id] })).await?)?;
        let parent = data.items.unwrap_or_default().into_iter().next();
        Ok(parent
            .and_then(|p| p.subitems)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|s| s.name.map(|n| n.trim().to_string()))
            .filter(|n| !n.is_empty())
            .collect())
    }

    async fn create_children(&self, parent_id: &str, names: &[String]) -> Result<(), RemoteError> {
        if names.is_empty() {
            return Ok(());
        }
        let (query, vars) = build_create_children_mutation(parent_id, names);
        self.call(&query, &vars).await.map(|_| ())
    }

    async fn create_child(&self, parent_id: &str, name: &str) -> Result<(), RemoteError> {
        let vars = json!({ "parent": parent_id, "name": name });
        self.call(CREATE_SUBITEM_MUTATION, &vars).await.map(|_| ())
    }

    async fn move_items(&self, item_ids: &[String], group_id: &str) -> Result<(), RemoteError> {
        if item_ids.is_empty() {
            return Ok(());
        }
        let (query, vars) = build_move_mutation(item_ids, group_id);
        self.call(&query, &vars).await.map(|_| ())
    }

    async fn archive_items(&self, item_ids: &[String]) -> Result<(), RemoteError> {
        if item_ids.is_empty() {
            return Ok(());
        }
        let (query, vars) = build_archive_mutation(item_ids);
        self.call(&query, &vars).await.map(|_| ())
    }
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("embedding provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed embedding response: {0}")]
    Malformed(String),
    #[error("embedding count mismatch: sent {sent}, received {received}")]
    CountMismatch { sent: usize, received: usize },
}

/// Text-to-vector provider; vectors come back in input order.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// A single provider call. Callers keep `texts` at or below [`MAX_EMBED_BATCH`].
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

fn parse_embedding_response(body: &str, sent: usize) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let parsed: EmbeddingResponse =
        serde_json::from_str(body).map_err(|err| EmbeddingError::Malformed(err.to_string()))?;
    let mut rows = parsed.data;
    if rows.iter().all(|r| r.index.is_some()) {
        rows.sort_by_key(|r| r.index);
    }
    if rows.len() != sent {
        return Err(EmbeddingError::CountMismatch {
            sent,
            received: rows.len(),
        });
    }
    Ok(rows.into_iter().map(|r| r.embedding).collect())
}

/// OpenAI-compatible `/v1/embeddings` client.
#[derive(Debug, Clone)]
pub struct OpenAiEmbeddings {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiEmbeddings {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building embeddings http client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": texts }))
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(EmbeddingError::Status {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }
        parse_embedding_response(&body, texts.len())
    }
}
