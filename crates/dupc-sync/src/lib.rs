//! Duplicate detection, consolidation and run orchestration.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dupc_adapters::{
    BoardApi, EmbeddingError, EmbeddingProvider, GraphQlBoard, OpenAiEmbeddings, DEFAULT_BOARD_API_URL,
    DEFAULT_EMBEDDINGS_URL, DEFAULT_EMBEDDING_MODEL, MAX_EMBED_BATCH,
};
use dupc_core::{
    env_layer, AfterAction, AliasKind, CandidateGroup, CombinedItem, ConfigLayer, FailedSubitem, GroupError, GroupOrigin,
    GroupingMode, Item, RunConfig, RunSummary, ShapedItem,
};
use dupc_storage::{
    HttpClientConfig, HttpGraphQlClient, MemorySettingsStore, PgSettingsStore, RemoteError, SettingsStore,
};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Children per batched create mutation.
pub const CREATE_CHUNK: usize = 20;
/// Items per batched relocate mutation.
pub const MOVE_CHUNK: usize = 5;
/// Items per batched archive mutation.
pub const ARCHIVE_CHUNK: usize = 10;
pub const MAX_CHILD_NAME_CHARS: usize = 255;
pub const MAX_LABEL_CHARS: usize = 80;
pub const ACTIVITY_LOG_CAP: usize = 200_000;

/// Fixed cool-down pauses between remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub page: Duration,
    pub batch: Duration,
    pub single: Duration,
    pub group: Duration,
    pub embed_batch: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            page: Duration::from_millis(100),
            batch: Duration::from_millis(100),
            single: Duration::from_millis(50),
            group: Duration::from_millis(50),
            embed_batch: Duration::from_millis(200),
        }
    }
}

impl Pacing {
    pub fn immediate() -> Self {
        Self {
            page: Duration::ZERO,
            batch: Duration::ZERO,
            single: Duration::ZERO,
            group: Duration::ZERO,
            embed_batch: Duration::ZERO,
        }
    }
}

async fn pause(duration: Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub board_api_url: String,
    pub board_api_key: Option<String>,
    pub embeddings_url: String,
    pub embeddings_api_key: Option<String>,
    pub embedding_model: String,
    pub database_url: Option<String>,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub cron: String,
    pub admin_token: Option<String>,
    pub web_port: u16,
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self {
            board_api_url: env_nonempty("MONDAY_API_URL").unwrap_or_else(|| DEFAULT_BOARD_API_URL.to_string()),
            board_api_key: env_nonempty("MONDAY_API_KEY"),
            embeddings_url: env_nonempty("OPENAI_EMBEDDINGS_URL")
                .unwrap_or_else(|| DEFAULT_EMBEDDINGS_URL.to_string()),
            embeddings_api_key: env_nonempty("OPENAI_API_KEY"),
            embedding_model: env_nonempty("EMBEDDING_MODEL").unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
            database_url: env_nonempty("DATABASE_URL"),
            http_timeout_secs: env_nonempty("DUPC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            scheduler_enabled: env_nonempty("DUPC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            cron: env_nonempty("DUPC_CRON").unwrap_or_else(|| "0 * * * *".to_string()),
            admin_token: env_nonempty("ADMIN_TOKEN"),
            web_port: env_nonempty("DUPC_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }
}

/// Shape fetched items and index their raw names by id.
pub fn shape_items(items: &[Item]) -> (Vec<ShapedItem>, HashMap<String, String>) {
    let shaped = items.iter().map(ShapedItem::from_item).collect();
    let names = items.iter().map(|it| (it.id.clone(), it.name.clone())).collect();
    (shaped, names)
}

/// Partition items by normalized subject; largest groups first, then by subject.
pub fn group_exact(items: &[ShapedItem]) -> Vec<CandidateGroup> {
    let mut buckets: BTreeMap<&str, Vec<&ShapedItem>> = BTreeMap::new();
    for item in items {
        buckets.entry(item.subject_norm.as_str()).or_default().push(item);
    }

    let mut groups = buckets
        .into_iter()
        .map(|(subject, mut members)| {
            members.sort_by(|a, b| a.age_key().cmp(&b.age_key()));
            let ids = members.into_iter().map(|m| m.id.clone()).collect();
            CandidateGroup::new(subject, ids, GroupOrigin::Exact)
        })
        .collect::<Vec<_>>();
    groups.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)));
    groups
}

/// Cosine similarity with each norm floored at 1e-9.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let (mut dot, mut norm_a, mut norm_b) = (0.0_f64, 0.0_f64, 0.0_f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    dot / (norm_a.sqrt().max(1e-9) * norm_b.sqrt().max(1e-9))
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Embedding-based grouping of items whose subjects differ textually.
#[derive(Clone)]
pub struct SemanticClusterer {
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    batch_pause: Duration,
}

impl SemanticClusterer {
    pub fn new(embedder: Option<Arc<dyn EmbeddingProvider>>, batch_pause: Duration) -> Self {
        Self { embedder, batch_pause }
    }

    pub fn disabled() -> Self {
        Self::new(None, Duration::ZERO)
    }

    pub fn is_enabled(&self) -> bool {
        self.embedder.is_some()
    }

    /// Greedy clustering of the newest `limit` items.
    ///
    /// Each item joins the first cluster whose first member scores at least `threshold`
    /// against it, otherwise it opens a new cluster. Singletons are dropped.
    pub async fn cluster(
        &self,
        items: &[ShapedItem],
        limit: usize,
        threshold: f64,
    ) -> Result<Vec<CandidateGroup>, EmbeddingError> {
        let Some(embedder) = &self.embedder else {
            return Ok(Vec::new());
        };

        let mut selected = items
            .iter()
            .map(|it| ShapedItem {
                name: it.name.trim().to_string(),
                ..it.clone()
            })
            .collect::<Vec<_>>();
        selected.sort_by(|a, b| a.age_key().cmp(&b.age_key()));
        let selected = selected.split_off(selected.len().saturating_sub(limit));
        if selected.len() < 2 {
            return Ok(Vec::new());
        }

        let texts = selected.iter().map(|it| it.name.clone()).collect::<Vec<_>>();
        let mut vectors = Vec::with_capacity(texts.len());
        for (index, batch) in texts.chunks(MAX_EMBED_BATCH).enumerate() {
            if index > 0 {
                pause(self.batch_pause).await;
            }
            vectors.extend(embedder.embed_batch(batch).await?);
        }
        if vectors.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                sent: texts.len(),
                received: vectors.len(),
            });
        }

        let mut clusters: Vec<Vec<usize>> = Vec::new();
        for (idx, vector) in vectors.iter().enumerate() {
            let home = clusters
                .iter_mut()
                .find(|members| cosine_similarity(&vectors[members[0]], vector) >= threshold);
            match home {
                Some(members) => members.push(idx),
                None => clusters.push(vec![idx]),
            }
        }

        let mut groups = clusters
            .into_iter()
            .filter(|members| members.len() >= 2)
            .map(|members| {
                let label = truncate_chars(&selected[members[0]].name, MAX_LABEL_CHARS);
                let ids = members.iter().map(|&i| selected[i].id.clone()).collect();
                CandidateGroup::new(label, ids, GroupOrigin::Semantic)
            })
            .collect::<Vec<_>>();
        groups.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)));
        Ok(groups)
    }
}

/// Build the bounded candidate list for the configured grouping mode.
pub async fn plan_groups(
    items: &[ShapedItem],
    config: &RunConfig,
    clusterer: &SemanticClusterer,
) -> Result<Vec<CandidateGroup>, EmbeddingError> {
    let exact_qualifying = || {
        group_exact(items)
            .into_iter()
            .filter(|g| g.count >= config.min_count)
            .collect::<Vec<_>>()
    };

    let mut groups = match config.grouping {
        GroupingMode::Exact => exact_qualifying(),
        GroupingMode::Ai => {
            clusterer
                .cluster(items, config.max_items_embed, config.similarity_threshold)
                .await?
        }
        GroupingMode::Hybrid => {
            let mut groups = exact_qualifying();
            let claimed = groups
                .iter()
                .flat_map(|g| g.item_ids_oldest_first.iter().map(String::as_str))
                .collect::<HashSet<_>>();
            let leftovers = items
                .iter()
                .filter(|it| !claimed.contains(it.id.as_str()))
                .cloned()
                .collect::<Vec<_>>();
            groups.extend(
                clusterer
                    .cluster(&leftovers, config.max_items_embed, config.similarity_threshold)
                    .await?,
            );
            groups
        }
    };
    groups.truncate(config.max_groups);
    Ok(groups)
}

/// Trimmed child name, positional fallback when empty, capped length.
pub fn sanitize_child_name(name: &str, position: usize) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        format!("Item {position}")
    } else {
        truncate_chars(trimmed, MAX_CHILD_NAME_CHARS)
    }
}

/// Applies candidate groups to the board: child creation, then the post-action.
pub struct Consolidator<'a> {
    board: &'a dyn BoardApi,
    config: &'a RunConfig,
    pacing: Pacing,
}

impl<'a> Consolidator<'a> {
    pub fn new(board: &'a dyn BoardApi, config: &'a RunConfig, pacing: Pacing) -> Self {
        Self { board, config, pacing }
    }

    /// Process every group in order. A remote failure ends only the affected group.
    pub async fn execute(
        &self,
        groups: &[CandidateGroup],
        names: &HashMap<String, String>,
        summary: &mut RunSummary,
    ) {
        for group in groups {
            summary.processed_groups += 1;
            let Some(parent_id) = group.parent().filter(|_| group.is_actionable()) else {
                continue;
            };
            if let Err(err) = self.consolidate(group, parent_id, names, summary).await {
                warn!(parent_id, label = %group.label, error = %err, "group consolidation aborted");
                summary.group_errors.push(GroupError {
                    parent_id: parent_id.to_string(),
                    label: group.label.clone(),
                    error: err.to_string(),
                });
            }
            pause(self.pacing.group).await;
        }
    }

    async fn consolidate(
        &self,
        group: &CandidateGroup,
        parent_id: &str,
        names: &HashMap<String, String>,
        summary: &mut RunSummary,
    ) -> Result<(), RemoteError> {
        let display = |id: &str| {
            names
                .get(id)
                .map(|n| n.trim().to_string())
                .unwrap_or_else(|| format!("Item {id}"))
        };
        let children = group.children(self.config.max_children);

        let mut existing = self.board.existing_child_names(parent_id).await?;
        let mut queued = HashSet::new();
        let pending = children
            .iter()
            .map(|id| display(id))
            .filter(|name| {
                !name.is_empty()
                    && !existing.contains(name)
                    && !existing.contains(&sanitize_child_name(name, 0))
            })
            .filter(|name| queued.insert(name.clone()))
            .collect::<Vec<_>>();

        if !pending.is_empty() {
            let created = self.create_missing(parent_id, &pending, summary).await;
            summary.created_subitems += created.len();
            existing.extend(created);
        }

        let mut represented: Vec<String> = Vec::new();
        for id in children {
            let name = display(id);
            let present = !name.is_empty()
                && (existing.contains(&name) || existing.contains(&sanitize_child_name(&name, 0)));
            if present && !represented.contains(id) {
                represented.push(id.clone());
            }
        }
        if represented.is_empty() {
            return Ok(());
        }

        let label_of = |id: &String| names.get(id).cloned().unwrap_or_else(|| format!("Item {id}"));
        summary.combined_items.push(CombinedItem {
            parent: names.get(parent_id).cloned().unwrap_or_else(|| parent_id.to_string()),
            children: represented.iter().map(label_of).collect(),
        });

        if let Some(target) = self.config.relocation_target() {
            for (index, chunk) in represented.chunks(MOVE_CHUNK).enumerate() {
                if index > 0 {
                    pause(self.pacing.batch).await;
                }
                self.board.move_items(chunk, target).await?;
                summary.moved_originals += chunk.len();
                summary.moved_items.extend(chunk.iter().map(label_of));
            }
        } else if self.config.after_action == AfterAction::Archive {
            for (index, chunk) in represented.chunks(ARCHIVE_CHUNK).enumerate() {
                if index > 0 {
                    pause(self.pacing.batch).await;
                }
                self.board.archive_items(chunk).await?;
                summary.archived_originals += chunk.len();
                summary.archived_items.extend(chunk.iter().map(label_of));
            }
        }
        Ok(())
    }

    /// Batched creation with a one-by-one fallback; returns the names that now exist.
    async fn create_missing(
        &self,
        parent_id: &str,
        pending: &[String],
        summary: &mut RunSummary,
    ) -> Vec<String> {
        let clean = pending
            .iter()
            .enumerate()
            .map(|(i, name)| sanitize_child_name(name, i + 1))
            .collect::<Vec<_>>();

        let mut created = Vec::with_capacity(clean.len());
        for (index, chunk) in clean.chunks(CREATE_CHUNK).enumerate() {
            if index > 0 {
                pause(self.pacing.batch).await;
            }
            match self.board.create_children(parent_id, chunk).await {
                Ok(()) => created.extend(chunk.iter().cloned()),
                Err(err) => {
                    warn!(parent_id, size = chunk.len(), error = %err, "batch create failed; retrying names one at a time");
                    for name in chunk {
                        match self.board.create_child(parent_id, name).await {
                            Ok(()) => created.push(name.clone()),
                            Err(err) => {
                                warn!(parent_id, name = %name, error = %err, "failed to create child record");
                                summary.failed_subitems.push(FailedSubitem {
                                    parent_id: parent_id.to_string(),
                                    name: name.clone(),
                                    error: err.to_string(),
                                });
                            }
                        }
                        pause(self.pacing.single).await;
                    }
                }
            }
        }
        created
    }
}

/// Seam between the run controller and whatever performs a run.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self) -> Result<RunSummary>;
}

/// Fetch, plan, consolidate, summarize.
pub struct DedupService {
    board: Arc<dyn BoardApi>,
    clusterer: SemanticClusterer,
    store: Arc<dyn SettingsStore>,
    base_layer: ConfigLayer,
    pacing: Pacing,
}

impl DedupService {
    pub fn new(
        board: Arc<dyn BoardApi>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        store: Arc<dyn SettingsStore>,
        base_layer: ConfigLayer,
        pacing: Pacing,
    ) -> Self {
        Self {
            board,
            clusterer: SemanticClusterer::new(embedder, pacing.embed_batch),
            store,
            base_layer,
            pacing,
        }
    }

    /// Base layer, then stored overrides, then `overrides`.
    pub async fn resolve_config(&self, overrides: &ConfigLayer) -> Result<RunConfig> {
        let stored = self.store.load_settings().await.context("loading stored settings")?;
        RunConfig::resolve(&[&self.base_layer, &stored, overrides]).context("resolving run configuration")
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        self.run_with_overrides(&ConfigLayer::new()).await
    }

    pub async fn run_with_overrides(&self, overrides: &ConfigLayer) -> Result<RunSummary> {
        let config = self.resolve_config(overrides).await?;
        let mut summary = RunSummary::begin(&config);
        if matches!(config.grouping, GroupingMode::Ai | GroupingMode::Hybrid) && !self.clusterer.is_enabled() {
            warn!(mode = %config.grouping, "no embeddings provider configured; semantic clustering skipped");
        }

        let filter = config.group_ids.iter().cloned().collect::<BTreeSet<_>>();
        let items = self
            .board
            .fetch_items(&config.board_id, &filter)
            .await
            .with_context(|| format!("fetching items for board {}", config.board_id))?;
        let (shaped, names) = shape_items(&items);

        let groups = plan_groups(&shaped, &config, &self.clusterer)
            .await
            .context("semantic clustering failed")?;
        info!(items = items.len(), groups = groups.len(), mode = %config.grouping, "planned candidate groups");

        Consolidator::new(self.board.as_ref(), &config, self.pacing)
            .execute(&groups, &names, &mut summary)
            .await;

        summary.board_display = self.display_name(AliasKind::Board, &config.board_id).await;
        if let Some(group_id) = &config.move_group_id {
            summary.move_group_display = self.display_name(AliasKind::Group, group_id).await;
        }
        let summary = summary.finish();
        info!(
            run_id = %summary.run_id,
            board_id = %summary.board_id,
            processed_groups = summary.processed_groups,
            created_subitems = summary.created_subitems,
            moved_originals = summary.moved_originals,
            archived_originals = summary.archived_originals,
            failed_subitems = summary.failed_subitems.len(),
            group_errors = summary.group_errors.len(),
            "run complete"
        );
        Ok(summary)
    }

    async fn display_name(&self, kind: AliasKind, raw_id: &str) -> Option<String> {
        match self.store.get_alias(kind, raw_id).await {
            Ok(alias) => alias.map(|a| a.display),
            Err(err) => {
                warn!(kind = kind.as_str(), raw_id, error = %err, "alias lookup failed");
                None
            }
        }
    }
}

#[async_trait]
impl Runner for DedupService {
    async fn run(&self) -> Result<RunSummary> {
        self.run_once().await
    }
}

/// Append-only text log that drops its oldest entries past [`ACTIVITY_LOG_CAP`] characters.
#[derive(Debug, Default)]
pub struct ActivityLog {
    entries: VecDeque<String>,
    chars: usize,
}

impl ActivityLog {
    pub fn append(&mut self, entry: impl Into<String>) {
        let entry = entry.into();
        self.chars += entry.chars().count();
        self.entries.push_back(entry);
        while self.chars > ACTIVITY_LOG_CAP && self.entries.len() > 1 {
            if let Some(dropped) = self.entries.pop_front() {
                self.chars -= dropped.chars().count();
            }
        }
        if self.chars > ACTIVITY_LOG_CAP {
            if let Some(only) = self.entries.back_mut() {
                let skip = self.chars - ACTIVITY_LOG_CAP;
                *only = only.chars().skip(skip).collect();
                self.chars = ACTIVITY_LOG_CAP;
            }
        }
    }

    pub fn text(&self) -> String {
        self.entries.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.chars = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running {
        started_at: DateTime<Utc>,
    },
    Done(Box<RunSummary>),
    Failed {
        error: String,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug)]
struct ControllerState {
    status: RunStatus,
    log: ActivityLog,
}

/// Single-slot run handle: at most one run is active, extra triggers are rejected.
#[derive(Debug)]
pub struct RunController {
    state: Mutex<ControllerState>,
}

impl Default for RunController {
    fn default() -> Self {
        Self {
            state: Mutex::new(ControllerState {
                status: RunStatus::Idle,
                log: ActivityLog::default(),
            }),
        }
    }
}

fn log_stamp(at: DateTime<Utc>) -> String {
    format!("==== Run @ {}Z ====", at.format("%Y-%m-%dT%H:%M:%S"))
}

impl RunController {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> RunStatus {
        self.lock().status.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.lock().status, RunStatus::Running { .. })
    }

    pub fn log_text(&self) -> String {
        self.lock().log.text()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    /// Start `runner` on the tokio runtime unless a run is already active.
    pub fn launch(self: &Arc<Self>, runner: Arc<dyn Runner>) -> LaunchOutcome {
        let started_at = Utc::now();
        {
            let mut state = self.lock();
            if matches!(state.status, RunStatus::Running { .. }) {
                state.log.append(format!(
                    "{}\n[INFO] Run requested while another run is in progress; ignoring duplicate trigger.\n==== End Run ====",
                    log_stamp(started_at)
                ));
                return LaunchOutcome::AlreadyRunning;
            }
            state.status = RunStatus::Running { started_at };
        }

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let result = tokio::spawn(async move { runner.run().await })
                .await
                .unwrap_or_else(|join_err| Err(anyhow!("run task aborted: {join_err}")));
            controller.complete(started_at, result);
        });
        LaunchOutcome::Started
    }

    fn complete(&self, started_at: DateTime<Utc>, result: Result<RunSummary>) {
        let mut block = vec![log_stamp(started_at)];
        let status = match result {
            Ok(summary) => {
                block.extend(summary.detail_lines());
                RunStatus::Done(Box::new(summary))
            }
            Err(err) => {
                let message = format!("{err:#}");
                error!(error = %message, "run failed");
                block.push(format!("[ERROR] {message}"));
                RunStatus::Failed {
                    error: message,
                    started_at,
                    finished_at: Utc::now(),
                }
            }
        };
        block.push("==== End Run ====".to_string());

        let mut state = self.lock();
        state.log.append(block.join("\n"));
        state.status = status;
    }
}

/// Cron-driven launcher; overlapping triggers are rejected by the controller.
pub async fn maybe_build_scheduler(
    config: &ServiceConfig,
    controller: Arc<RunController>,
    runner: Arc<dyn Runner>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(&config.cron, move |_uuid, _l| {
        let controller = Arc::clone(&controller);
        let runner = Arc::clone(&runner);
        Box::pin(async move {
            let outcome = controller.launch(runner);
            info!(?outcome, "scheduled run triggered");
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// Postgres when `DATABASE_URL` is set, otherwise a process-local store.
pub async fn open_settings_store(config: &ServiceConfig) -> Result<Arc<dyn SettingsStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgSettingsStore::connect(url).await?;
            store.init_schema().await?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; settings and aliases are kept in memory");
            Ok(Arc::new(MemorySettingsStore::new()))
        }
    }
}

pub fn build_service(config: &ServiceConfig, store: Arc<dyn SettingsStore>) -> Result<DedupService> {
    let api_key = config
        .board_api_key
        .clone()
        .context("MONDAY_API_KEY must be set to reach the board")?;
    let timeout = Duration::from_secs(config.http_timeout_secs);
    let mut http = HttpClientConfig::new(config.board_api_url.clone(), api_key);
    http.timeout = timeout;
    let transport = HttpGraphQlClient::new(http)?;

    let pacing = Pacing::default();
    let board = GraphQlBoard::new(transport).with_page_pause(pacing.page);

    let embedder = match &config.embeddings_api_key {
        Some(key) => {
            let client = OpenAiEmbeddings::new(
                config.embeddings_url.clone(),
                key.clone(),
                config.embedding_model.clone(),
                timeout,
            )?;
            Some(Arc::new(client) as Arc<dyn EmbeddingProvider>)
        }
        None => None,
    };

    Ok(DedupService::new(Arc::new(board), embedder, store, env_layer(), pacing))
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    let config = ServiceConfig::from_env();
    let store = open_settings_store(&config).await?;
    build_service(&config, store)?.run_once().await
}
