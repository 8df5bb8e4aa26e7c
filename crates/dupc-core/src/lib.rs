//! Core domain model, subject normalization and layered run configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Work item snapshot as fetched from the remote board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub name: String,
    pub created_at: Option<String>,
    pub group_id: Option<String>,
}

/// Derived per-run view of an [`Item`] used by the groupers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShapedItem {
    pub id: String,
    pub name: String,
    pub created_at_ts: i64,
    pub subject_norm: String,
}

impl ShapedItem {
    pub fn from_item(item: &Item) -> Self {
        Self {
            id: item.id.clone(),
            name: item.name.clone(),
            created_at_ts: parse_created_at(item.created_at.as_deref()),
            subject_norm: normalize_subject(&item.name),
        }
    }

    /// Total ordering key: oldest first, ids break ties.
    pub fn age_key(&self) -> (i64, &str) {
        (self.created_at_ts, self.id.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupOrigin {
    Exact,
    Semantic,
}

/// Provisional parent/children set proposed for consolidation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateGroup {
    pub label: String,
    pub item_ids_oldest_first: Vec<String>,
    pub count: usize,
    pub origin: GroupOrigin,
}

impl CandidateGroup {
    pub fn new(label: impl Into<String>, item_ids_oldest_first: Vec<String>, origin: GroupOrigin) -> Self {
        let count = item_ids_oldest_first.len();
        Self {
            label: label.into(),
            item_ids_oldest_first,
            count,
            origin,
        }
    }

    pub fn parent(&self) -> Option<&str> {
        self.item_ids_oldest_first.first().map(String::as_str)
    }

    pub fn children(&self, max_children: usize) -> &[String] {
        let rest = self.item_ids_oldest_first.get(1..).unwrap_or_default();
        &rest[..rest.len().min(max_children)]
    }

    pub fn is_actionable(&self) -> bool {
        self.item_ids_oldest_first.len() >= 2
    }
}

static BRACKET_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\[[^\]]+\]\s*").expect("bracket tag pattern is valid"));
static REPLY_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*((re|fw|fwd|aw|sv|rv|ref|res)\s*[:\]]\s*)+").expect("reply prefix pattern is valid")
});
static TRAILING_QUALIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s*[\(\[\{][^\)\]\}]*[\)\]\}]\s*$").expect("trailing qualifier pattern is valid")
});
static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));
static TRAILING_PUNCT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-:|]+$").expect("trailing punctuation pattern is valid"));

/// Reduce a raw item title to the canonical key used for exact-match grouping.
///
/// Leading `[TAG]`s and reply/forward prefixes (`RE:`, `Fwd:`, `AW:` ...) are stripped,
/// then trailing `(...)`, `[...]` and `{...}` qualifiers, then whitespace is collapsed,
/// trailing `-:|` runs are dropped and the result is lower-cased. The pass repeats until
/// the string stops changing, so the function is idempotent.
pub fn normalize_subject(raw: &str) -> String {
    let mut current = raw.trim().to_string();
    loop {
        let next = normalize_pass(&current);
        if next == current {
            return next;
        }
        current = next;
    }
}

fn normalize_pass(input: &str) -> String {
    let stripped = strip_leading_markers(input.trim());
    let stripped = strip_trailing_qualifiers(&stripped);
    let collapsed = WHITESPACE_RUN.replace_all(&stripped, " ");
    let trimmed = TRAILING_PUNCT.replace(collapsed.trim(), "");
    trimmed.trim().to_lowercase()
}

fn strip_leading_markers(input: &str) -> String {
    let mut s = input.to_string();
    loop {
        let without_tag = BRACKET_TAG.replace(&s, "");
        let without_prefix = REPLY_PREFIX.replace(without_tag.trim(), "");
        let next = without_prefix.trim().to_string();
        if next == s {
            return s;
        }
        s = next;
    }
}

fn strip_trailing_qualifiers(input: &str) -> String {
    let mut s = input.to_string();
    loop {
        let next = TRAILING_QUALIFIER.replace(&s, "").trim().to_string();
        if next == s {
            return s;
        }
        s = next;
    }
}

/// Epoch seconds for a remote `created_at` value; anything unparseable maps to 0.
pub fn parse_created_at(raw: Option<&str>) -> i64 {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return 0;
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return ts.timestamp();
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return naive.and_utc().timestamp();
        }
    }
    0
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("unknown setting {0}")]
    UnknownKey(String),
}

impl ConfigError {
    fn invalid(key: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupingMode {
    Exact,
    Ai,
    Hybrid,
}

impl GroupingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Ai => "ai",
            Self::Hybrid => "hybrid",
        }
    }
}

impl FromStr for GroupingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Ok(Self::Exact),
            // legacy console value
            "ai" | "semantic" => Ok(Self::Ai),
            "hybrid" => Ok(Self::Hybrid),
            _ => Err(ConfigError::invalid("GROUPING", s, "expected exact, ai or hybrid")),
        }
    }
}

impl fmt::Display for GroupingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AfterAction {
    None,
    Move,
    Archive,
}

impl AfterAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Move => "move",
            Self::Archive => "archive",
        }
    }
}

impl FromStr for AfterAction {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "move" => Ok(Self::Move),
            "archive" => Ok(Self::Archive),
            _ => Err(ConfigError::invalid("AFTER_ACTION", s, "expected none, move or archive")),
        }
    }
}

impl fmt::Display for AfterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keys the run configuration understands, in the order the console shows them.
pub const SETTING_KEYS: &[&str] = &[
    "MODE",
    "GROUPING",
    "SIMILARITY_THRESHOLD",
    "MAX_ITEMS_EMBED",
    "MIN_COUNT",
    "MAX_GROUPS",
    "MAX_CHILDREN",
    "AFTER_ACTION",
    "MOVE_GROUP_ID",
    "BOARD_ID",
    "GROUP_IDS",
];

/// One layer of string settings; empty values mean "not set".
pub type ConfigLayer = BTreeMap<String, String>;

pub fn default_layer() -> ConfigLayer {
    [
        ("GROUPING", "hybrid"),
        ("SIMILARITY_THRESHOLD", "0.86"),
        ("MAX_ITEMS_EMBED", "300"),
        ("MIN_COUNT", "2"),
        ("MAX_GROUPS", "8"),
        ("MAX_CHILDREN", "25"),
        ("AFTER_ACTION", "none"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Snapshot of the recognised settings present in the process environment.
pub fn env_layer() -> ConfigLayer {
    SETTING_KEYS
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
        .collect()
}

/// Overlay layers left to right; later non-empty values win.
///
/// A layer that sets `MODE` without `GROUPING` contributes it as `GROUPING`.
pub fn merge_layers(layers: &[&ConfigLayer]) -> ConfigLayer {
    let mut merged = ConfigLayer::new();
    for layer in layers {
        for (key, value) in layer.iter() {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            merged.insert(key.clone(), value.to_string());
        }
        let has_grouping = layer.get("GROUPING").is_some_and(|v| !v.trim().is_empty());
        if !has_grouping {
            if let Some(mode) = layer.get("MODE").map(|v| v.trim()).filter(|v| !v.is_empty()) {
                merged.insert("GROUPING".to_string(), mode.to_string());
            }
        }
    }
    merged
}

/// Check a single setting the way [`RunConfig::resolve`] would.
pub fn validate_setting(key: &str, value: &str) -> Result<(), ConfigError> {
    match key {
        "MODE" | "GROUPING" => value.parse::<GroupingMode>().map(|_| ()),
        "SIMILARITY_THRESHOLD" => parse_threshold(value).map(|_| ()),
        "MAX_ITEMS_EMBED" | "MIN_COUNT" | "MAX_GROUPS" | "MAX_CHILDREN" => {
            parse_positive(key, value).map(|_| ())
        }
        "AFTER_ACTION" => value.parse::<AfterAction>().map(|_| ()),
        "MOVE_GROUP_ID" | "BOARD_ID" | "GROUP_IDS" => Ok(()),
        other => Err(ConfigError::UnknownKey(other.to_string())),
    }
}

/// Validate every non-empty recognised value of a layer; unrelated keys are ignored.
pub fn validate_layer(layer: &ConfigLayer) -> Result<(), ConfigError> {
    layer
        .iter()
        .filter(|(key, value)| SETTING_KEYS.contains(&key.as_str()) && !value.trim().is_empty())
        .try_for_each(|(key, value)| validate_setting(key, value))
}

fn parse_threshold(value: &str) -> Result<f64, ConfigError> {
    let parsed: f64 = value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid("SIMILARITY_THRESHOLD", value, "not a number"))?;
    if !(0.0..=1.0).contains(&parsed) {
        return Err(ConfigError::invalid("SIMILARITY_THRESHOLD", value, "must be within [0, 1]"));
    }
    Ok(parsed)
}

fn parse_positive(key: &str, value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::invalid(key, value, "must be a positive integer")),
    }
}

/// Immutable per-run configuration, resolved once and passed to every component.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunConfig {
    pub board_id: String,
    pub group_ids: Vec<String>,
    pub grouping: GroupingMode,
    pub similarity_threshold: f64,
    pub max_items_embed: usize,
    pub min_count: usize,
    pub max_groups: usize,
    pub max_children: usize,
    pub after_action: AfterAction,
    pub move_group_id: Option<String>,
}

impl RunConfig {
    /// Resolve defaults overlaid by `layers` (lowest precedence first).
    pub fn resolve(layers: &[&ConfigLayer]) -> Result<Self, ConfigError> {
        let defaults = default_layer();
        let mut all = Vec::with_capacity(layers.len() + 1);
        all.push(&defaults);
        all.extend_from_slice(layers);
        Self::from_layer(&merge_layers(&all))
    }

    pub fn from_layer(layer: &ConfigLayer) -> Result<Self, ConfigError> {
        let get = |key: &'static str| layer.get(key).map(String::as_str).ok_or(ConfigError::Missing(key));

        let board_id = get("BOARD_ID")?.to_string();
        let group_ids = layer
            .get("GROUP_IDS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|g| !g.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            board_id,
            group_ids,
            grouping: get("GROUPING")?.parse()?,
            similarity_threshold: parse_threshold(get("SIMILARITY_THRESHOLD")?)?,
            max_items_embed: parse_positive("MAX_ITEMS_EMBED", get("MAX_ITEMS_EMBED")?)?,
            min_count: parse_positive("MIN_COUNT", get("MIN_COUNT")?)?,
            max_groups: parse_positive("MAX_GROUPS", get("MAX_GROUPS")?)?,
            max_children: parse_positive("MAX_CHILDREN", get("MAX_CHILDREN")?)?,
            after_action: get("AFTER_ACTION")?.parse()?,
            move_group_id: layer
                .get("MOVE_GROUP_ID")
                .map(|g| g.trim().to_string())
                .filter(|g| !g.is_empty()),
        })
    }

    /// Target group for relocation, only when relocation is both requested and possible.
    pub fn relocation_target(&self) -> Option<&str> {
        match self.after_action {
            AfterAction::Move => self.move_group_id.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AliasKind {
    Board,
    Group,
}

impl AliasKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Board => "board",
            Self::Group => "group",
        }
    }
}

impl FromStr for AliasKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "board" => Ok(Self::Board),
            "group" => Ok(Self::Group),
            _ => Err(ConfigError::invalid("kind", s, "expected board or group")),
        }
    }
}

/// Human-friendly display name for a board or group id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alias {
    pub kind: AliasKind,
    pub raw_id: String,
    pub display: String,
    #[serde(default)]
    pub extra: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinedItem {
    pub parent: String,
    pub children: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedSubitem {
    pub parent_id: String,
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupError {
    pub parent_id: String,
    pub label: String,
    pub error: String,
}

/// Aggregate outcome of one consolidation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub board_id: String,
    pub board_display: Option<String>,
    pub group_ids: String,
    pub mode: GroupingMode,
    pub threshold: f64,
    pub after_action: AfterAction,
    pub move_group_id: Option<String>,
    pub move_group_display: Option<String>,
    pub processed_groups: usize,
    pub created_subitems: usize,
    pub moved_originals: usize,
    pub archived_originals: usize,
    pub combined_items: Vec<CombinedItem>,
    pub moved_items: Vec<String>,
    pub archived_items: Vec<String>,
    pub failed_subitems: Vec<FailedSubitem>,
    pub group_errors: Vec<GroupError>,
}

impl RunSummary {
    pub fn begin(config: &RunConfig) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            board_id: config.board_id.clone(),
            board_display: None,
            group_ids: config.group_ids.join(","),
            mode: config.grouping,
            threshold: config.similarity_threshold,
            after_action: config.after_action,
            move_group_id: config.move_group_id.clone(),
            move_group_display: None,
            processed_groups: 0,
            created_subitems: 0,
            moved_originals: 0,
            archived_originals: 0,
            combined_items: Vec::new(),
            moved_items: Vec::new(),
            archived_items: Vec::new(),
            failed_subitems: Vec::new(),
            group_errors: Vec::new(),
        }
    }

    pub fn finish(mut self) -> Self {
        self.finished_at = Some(Utc::now());
        self
    }

    /// Plain-text detail block for the activity log.
    pub fn detail_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "Board {} ({}) mode={} groups={} created={} moved={} archived={}",
            self.board_id,
            self.board_display.as_deref().unwrap_or("-"),
            self.mode,
            self.processed_groups,
            self.created_subitems,
            self.moved_originals,
            self.archived_originals,
        )];
        lines.push("Combined Items:".to_string());
        for combo in &self.combined_items {
            lines.push(format!("  Parent: {}", combo.parent));
            lines.push(format!("    Children: {}", combo.children.join(", ")));
        }
        lines.push("Moved Originals:".to_string());
        lines.extend(self.moved_items.iter().map(|name| format!("  {name}")));
        lines.push("Archived Originals:".to_string());
        lines.extend(self.archived_items.iter().map(|name| format!("  {name}")));
        if !self.failed_subitems.is_empty() {
            lines.push("Failed Subitems:".to_string());
            lines.extend(
                self.failed_subitems
                    .iter()
                    .map(|f| format!("  {} <- {}: {}", f.parent_id, f.name, f.error)),
            );
        }
        if !self.group_errors.is_empty() {
            lines.push("Group Errors:".to_string());
            lines.extend(
                self.group_errors
                    .iter()
                    .map(|g| format!("  {} ({}): {}", g.label, g.parent_id, g.error)),
            );
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(pairs: &[(&str, &str)]) -> ConfigLayer {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn reply_prefixes_and_qualifiers_collapse() {
        assert_eq!(normalize_subject("RE: Hello   World (Draft)"), normalize_subject("hello world"));
        assert_eq!(normalize_subject("RE: Site Visit Request"), "site visit request");
        assert_eq!(normalize_subject("Site Visit Request (Urgent)"), "site visit request");
        assert_eq!(normalize_subject("Fwd: RE: fw: Quote needed"), "quote needed");
        assert_eq!(normalize_subject("AW:Sv: Angebot"), "angebot");
    }

    #[test]
    fn stacked_tags_and_prefixes_interleave() {
        assert_eq!(normalize_subject("[EXT] RE: [RFP] Fwd: Roof repair"), "roof repair");
        assert_eq!(normalize_subject("RE: [EXT] Roof repair"), "roof repair");
        assert_eq!(
            normalize_subject("Roof repair (Invitation to Bid) [Vendor] {2}"),
            "roof repair"
        );
    }

    #[test]
    fn trailing_punctuation_and_whitespace_are_trimmed() {
        assert_eq!(normalize_subject("  Pump\tstation   upgrade -:| "), "pump station upgrade");
        assert_eq!(normalize_subject("Pump station (phase 2) -"), "pump station");
    }

    #[test]
    fn empty_and_degenerate_inputs() {
        assert_eq!(normalize_subject(""), "");
        assert_eq!(normalize_subject("   "), "");
        assert_eq!(normalize_subject("[EXT]"), "");
        assert_eq!(normalize_subject("RE: (draft)"), "");
    }

    #[test]
    fn normalization_is_idempotent() {
        let samples = [
            "RE: Hello   World (Draft)",
            "Pump station (phase 2) -",
            "[a] re: [b] fw: Thing {x} (y) |",
            "Résumé Follow-Up: ",
            "İstanbul office",
            "re re: not a prefix",
            "[unterminated tag",
            "(leading qualifier) stays",
        ];
        for raw in samples {
            let once = normalize_subject(raw);
            assert_eq!(normalize_subject(&once), once, "input {raw:?}");
        }
    }

    #[test]
    fn created_at_parsing_falls_back_to_zero() {
        assert_eq!(parse_created_at(Some("1970-01-01T00:01:00Z")), 60);
        assert_eq!(parse_created_at(Some("1970-01-01T01:00:00+01:00")), 0);
        assert_eq!(parse_created_at(Some("1970-01-01T00:00:10")), 10);
        assert_eq!(parse_created_at(Some("1970-01-01 00:00:05")), 5);
        assert_eq!(parse_created_at(Some("yesterday")), 0);
        assert_eq!(parse_created_at(None), 0);
    }

    #[test]
    fn candidate_group_parent_and_capped_children() {
        let group = CandidateGroup::new(
            "x",
            vec!["1".into(), "2".into(), "3".into(), "4".into()],
            GroupOrigin::Exact,
        );
        assert_eq!(group.parent(), Some("1"));
        assert_eq!(group.children(2), ["2".to_string(), "3".to_string()]);
        assert_eq!(group.children(10).len(), 3);
        assert!(group.is_actionable());

        let single = CandidateGroup::new("y", vec!["9".into()], GroupOrigin::Exact);
        assert!(single.children(5).is_empty());
        assert!(!single.is_actionable());
    }

    #[test]
    fn resolve_applies_defaults_then_layers_in_order() {
        let env = layer(&[("BOARD_ID", "111"), ("MIN_COUNT", "3"), ("GROUPING", "exact")]);
        let store = layer(&[("BOARD_ID", "222"), ("MIN_COUNT", ""), ("GROUP_IDS", "new_group, topics,")]);
        let request = layer(&[("MODE", "semantic")]);

        let config = RunConfig::resolve(&[&env, &store, &request]).expect("resolves");
        assert_eq!(config.board_id, "222");
        assert_eq!(config.min_count, 3);
        assert_eq!(config.grouping, GroupingMode::Ai);
        assert_eq!(config.group_ids, vec!["new_group".to_string(), "topics".to_string()]);
        assert_eq!(config.similarity_threshold, 0.86);
        assert_eq!(config.max_items_embed, 300);
        assert_eq!(config.max_groups, 8);
        assert_eq!(config.max_children, 25);
        assert_eq!(config.after_action, AfterAction::None);
        assert_eq!(config.move_group_id, None);
    }

    #[test]
    fn resolve_rejects_missing_board_and_bad_values() {
        assert_eq!(RunConfig::resolve(&[]), Err(ConfigError::Missing("BOARD_ID")));

        let bad = layer(&[("BOARD_ID", "1"), ("SIMILARITY_THRESHOLD", "1.5")]);
        assert!(matches!(
            RunConfig::resolve(&[&bad]),
            Err(ConfigError::InvalidValue { key, .. }) if key == "SIMILARITY_THRESHOLD"
        ));

        let zero = layer(&[("BOARD_ID", "1"), ("MAX_GROUPS", "0")]);
        assert!(RunConfig::resolve(&[&zero]).is_err());

        let action = layer(&[("BOARD_ID", "1"), ("AFTER_ACTION", "delete")]);
        assert!(RunConfig::resolve(&[&action]).is_err());
    }

    #[test]
    fn relocation_requires_move_and_target() {
        let no_target = layer(&[("BOARD_ID", "1"), ("AFTER_ACTION", "move")]);
        let config = RunConfig::resolve(&[&no_target]).expect("resolves");
        assert_eq!(config.relocation_target(), None);

        let with_target = layer(&[("BOARD_ID", "1"), ("AFTER_ACTION", "move"), ("MOVE_GROUP_ID", "done")]);
        let config = RunConfig::resolve(&[&with_target]).expect("resolves");
        assert_eq!(config.relocation_target(), Some("done"));
    }

    #[test]
    fn validate_setting_matches_resolution_rules() {
        assert!(validate_setting("MODE", "hybrid").is_ok());
        assert!(validate_setting("GROUPING", "fuzzy").is_err());
        assert!(validate_setting("MIN_COUNT", "-1").is_err());
        assert!(validate_setting("GROUP_IDS", "a,b").is_ok());
        assert_eq!(
            validate_setting("NOPE", "1"),
            Err(ConfigError::UnknownKey("NOPE".into()))
        );

        assert!(validate_layer(&layer(&[("PATH", "/bin"), ("MIN_COUNT", ""), ("MAX_GROUPS", "4")])).is_ok());
        assert!(validate_layer(&layer(&[("AFTER_ACTION", "explode")])).is_err());
    }

    #[test]
    fn summary_detail_lines_list_names() {
        let config = RunConfig::resolve(&[&layer(&[("BOARD_ID", "42")])]).expect("resolves");
        let mut summary = RunSummary::begin(&config);
        summary.combined_items.push(CombinedItem {
            parent: "Site Visit".into(),
            children: vec!["RE: Site Visit".into(), "Site Visit (2)".into()],
        });
        summary.archived_items.push("RE: Site Visit".into());
        let text = summary.detail_lines().join("\n");
        assert!(text.contains("  Parent: Site Visit"));
        assert!(text.contains("    Children: RE: Site Visit, Site Visit (2)"));
        assert!(text.contains("Archived Originals:\n  RE: Site Visit"));
        assert!(!text.contains("Failed Subitems"));
    }
}
