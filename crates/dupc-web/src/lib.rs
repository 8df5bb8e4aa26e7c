//! Axum + Askama admin console for the consolidation service.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use askama::Template;
use axum::{
    extract::{Form, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use dupc_core::{
    default_layer, env_layer, merge_layers, validate_layer, ConfigError, ConfigLayer, GroupingMode, SETTING_KEYS,
};
use dupc_storage::{changed_settings, SettingsStore};
use dupc_sync::{
    build_service, maybe_build_scheduler, open_settings_store, RunController, Runner, ServiceConfig,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<RunController>,
    pub runner: Arc<dyn Runner>,
    pub store: Arc<dyn SettingsStore>,
    pub base_layer: ConfigLayer,
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn new(
        controller: Arc<RunController>,
        runner: Arc<dyn Runner>,
        store: Arc<dyn SettingsStore>,
        base_layer: ConfigLayer,
        admin_token: Option<String>,
    ) -> Self {
        Self {
            controller,
            runner,
            store,
            base_layer,
            admin_token,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

struct SettingRow {
    key: String,
    value: String,
}

#[derive(Template)]
#[template(path = "settings.html")]
struct SettingsTemplate {
    token_query: String,
    settings: Vec<SettingRow>,
    running: bool,
    status_json: String,
    log: String,
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/settings", get(settings_page_handler).post(save_settings_handler))
        .route("/run-now", post(run_now_handler))
        .route("/clear-log", post(clear_log_handler))
        .route("/status", get(status_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "admin console listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Console plus the optional cron scheduler, wired from the process environment.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env();
    let base_layer = env_layer();
    validate_layer(&base_layer).context("invalid run settings in environment")?;

    let store = open_settings_store(&config).await?;
    let runner: Arc<dyn Runner> = Arc::new(build_service(&config, Arc::clone(&store))?);
    let controller = Arc::new(RunController::new());

    let scheduler = maybe_build_scheduler(&config, Arc::clone(&controller), Arc::clone(&runner)).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.cron, "scheduler started");
    }

    let state = AppState::new(controller, runner, store, base_layer, config.admin_token.clone());
    serve(state, config.web_port).await
}

fn authorize(state: &AppState, query: &TokenQuery) -> Result<(), Response> {
    match (&state.admin_token, &query.token) {
        (Some(expected), Some(given)) if expected == given => Ok(()),
        _ => Err((StatusCode::UNAUTHORIZED, Html("Unauthorized".to_string())).into_response()),
    }
}

fn token_query(token: &str) -> String {
    format!("token={}", urlencoding::encode(token))
}

fn settings_location(state: &AppState) -> String {
    format!("/settings?{}", token_query(state.admin_token.as_deref().unwrap_or_default()))
}

async fn index_handler(State(state): State<Arc<AppState>>, Query(query): Query<TokenQuery>) -> Response {
    if state.admin_token.is_none() {
        return server_error(anyhow::anyhow!("ADMIN_TOKEN is not configured"));
    }
    if let Err(resp) = authorize(&state, &query) {
        return resp;
    }
    Redirect::to(&settings_location(&state)).into_response()
}

async fn settings_page_handler(State(state): State<Arc<AppState>>, Query(query): Query<TokenQuery>) -> Response {
    if let Err(resp) = authorize(&state, &query) {
        return resp;
    }
    render_settings(&state, String::new()).await
}

async fn save_settings_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = authorize(&state, &query) {
        return resp;
    }

    let current = match state.store.load_settings().await {
        Ok(current) => current,
        Err(err) => return server_error(err),
    };
    let current_mode = effective_settings(&state, &current)
        .get("GROUPING")
        .cloned()
        .unwrap_or_default();

    let updates = match settings_from_form(&form, &current_mode) {
        Ok(updates) => updates,
        Err(err) => {
            let mut resp = render_settings(&state, err.to_string()).await;
            *resp.status_mut() = StatusCode::UNPROCESSABLE_ENTITY;
            return resp;
        }
    };

    let changed = changed_settings(&current, &updates);
    if !changed.is_empty() {
        if let Err(err) = state.store.upsert_settings(&changed).await {
            return server_error(err);
        }
        info!(keys = ?changed.keys().collect::<Vec<_>>(), "settings updated");
    }
    Redirect::to(&settings_location(&state)).into_response()
}

async fn run_now_handler(State(state): State<Arc<AppState>>, Query(query): Query<TokenQuery>) -> Response {
    if let Err(resp) = authorize(&state, &query) {
        return resp;
    }
    let outcome = state.controller.launch(Arc::clone(&state.runner));
    info!(?outcome, "run requested from console");
    Redirect::to(&settings_location(&state)).into_response()
}

async fn clear_log_handler(State(state): State<Arc<AppState>>, Query(query): Query<TokenQuery>) -> Response {
    if let Err(resp) = authorize(&state, &query) {
        return resp;
    }
    state.controller.clear_log();
    Redirect::to(&settings_location(&state)).into_response()
}

async fn status_handler(State(state): State<Arc<AppState>>, Query(query): Query<TokenQuery>) -> Response {
    if let Err(resp) = authorize(&state, &query) {
        return resp;
    }
    Json(state.controller.status()).into_response()
}

/// Known, non-empty form values with one grouping mode written to both `MODE`
/// and `GROUPING`. When the form carries both and they disagree, the one that
/// differs from `current_mode` is the edit.
fn settings_from_form(form: &HashMap<String, String>, current_mode: &str) -> Result<ConfigLayer, ConfigError> {
    let mut updates = SETTING_KEYS
        .iter()
        .filter_map(|key| {
            form.get(*key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(|v| (key.to_string(), v.to_string()))
        })
        .collect::<ConfigLayer>();

    let mut submitted = Vec::new();
    for key in ["MODE", "GROUPING"] {
        if let Some(value) = updates.get(key) {
            submitted.push(value.parse::<GroupingMode>()?);
        }
    }
    let current = current_mode.parse::<GroupingMode>().ok();
    let chosen = submitted
        .iter()
        .find(|mode| Some(**mode) != current)
        .or(submitted.first())
        .copied();
    if let Some(grouping) = chosen {
        updates.insert("MODE".to_string(), grouping.as_str().to_string());
        updates.insert("GROUPING".to_string(), grouping.as_str().to_string());
    }
    validate_layer(&updates)?;
    Ok(updates)
}

async fn render_settings(state: &AppState, error: String) -> Response {
    let stored = match state.store.load_settings().await {
        Ok(stored) => stored,
        Err(err) => return server_error(err),
    };
    let effective = effective_settings(state, &stored);
    // One mode control, showing the grouping a run would use.
    let settings = SETTING_KEYS
        .iter()
        .filter(|key| **key != "GROUPING")
        .map(|key| {
            let source = if *key == "MODE" { "GROUPING" } else { *key };
            SettingRow {
                key: key.to_string(),
                value: effective.get(source).cloned().unwrap_or_default(),
            }
        })
        .collect();
    let status_json = match serde_json::to_string_pretty(&state.controller.status()) {
        Ok(json) => json,
        Err(err) => return server_error(err.into()),
    };

    render_html(SettingsTemplate {
        token_query: token_query(state.admin_token.as_deref().unwrap_or_default()),
        settings,
        running: state.controller.is_running(),
        status_json,
        log: state.controller.log_text(),
        error,
    })
}

fn effective_settings(state: &AppState, stored: &ConfigLayer) -> ConfigLayer {
    merge_layers(&[&default_layer(), &state.base_layer, stored])
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {err:#}")),
    )
        .into_response()
}
