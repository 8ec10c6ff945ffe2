//! Config Model: loads, validates, and resolves the YAML configuration that
//! describes which models exist, how to launch them, and how they are
//! grouped for admission control.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::SchedulerError;

/// Reserved placeholder substituted with the allocated port at spawn time.
pub const PORT_PLACEHOLDER: &str = "${PORT}";

const DEFAULT_CHECK_ENDPOINT: &str = "/health";
const DEFAULT_HEALTH_CHECK_TIMEOUT: u64 = 60;
const DEFAULT_MIN_FREE_MEMORY_PERCENT: f32 = 10.0;
const DEFAULT_CONCURRENCY_LIMIT: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawConfig {
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout: u64,
    #[serde(default = "default_start_port")]
    pub start_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_min_free_memory_percent")]
    pub min_free_memory_percent: f32,
    #[serde(default)]
    pub macros: HashMap<String, String>,
    #[serde(default)]
    pub models: HashMap<String, RawModel>,
    #[serde(default)]
    pub groups: HashMap<String, RawGroup>,
}

fn default_health_check_timeout() -> u64 {
    DEFAULT_HEALTH_CHECK_TIMEOUT
}
fn default_start_port() -> u16 {
    8100
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_min_free_memory_percent() -> f32 {
    DEFAULT_MIN_FREE_MEMORY_PERCENT
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawModel {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub unlisted: bool,
    pub cmd: String,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub ttl: u64,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: u32,
    #[serde(default = "default_check_endpoint")]
    pub check_endpoint: String,
    #[serde(default)]
    pub use_model_name: Option<String>,
    /// Declarative size hint for `/v1/models` (the GGUF file's byte size, if
    /// the Config Producer that generated this document chose to include
    /// it). This crate never probes the filesystem for it itself — actual
    /// model-file discovery is the out-of-scope Config Producer's job.
    #[serde(default)]
    pub size_hint_bytes: Option<u64>,
}

fn default_concurrency_limit() -> u32 {
    DEFAULT_CONCURRENCY_LIMIT
}
fn default_check_endpoint() -> String {
    DEFAULT_CHECK_ENDPOINT.to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawGroup {
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub swap: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub start_port: Option<u16>,
}

/// A fully validated, immutable model definition. Command/env have already
/// had macros expanded; only `${PORT}` remains as a placeholder.
#[derive(Debug, Clone)]
pub struct ModelDef {
    pub id: String,
    pub display_name: String,
    pub description: String,
    pub unlisted: bool,
    pub command_template: String,
    pub proxy_template: String,
    pub env: HashMap<String, String>,
    pub aliases: Vec<String>,
    pub ttl: Duration,
    pub concurrency_limit: u32,
    pub check_endpoint: String,
    pub use_model_name: Option<String>,
    pub size_hint_bytes: Option<u64>,
    pub group: String,
}

#[derive(Debug, Clone)]
pub struct GroupDef {
    pub id: String,
    pub members: Vec<String>,
    pub swap: bool,
    pub exclusive: bool,
    pub persistent: bool,
    pub start_port: Option<u16>,
}

/// Validated, immutable configuration snapshot. Cheap to clone (wrapped in
/// `Arc` by callers); never mutated in place.
#[derive(Debug, Clone)]
pub struct Config {
    pub health_check_timeout: Duration,
    pub start_port: u16,
    pub log_level: String,
    pub min_free_memory_percent: f32,
    pub models: HashMap<String, ModelDef>,
    pub groups: HashMap<String, GroupDef>,
    aliases: HashMap<String, String>,
}

const DEFAULT_GROUP_ID: &str = "__default__";

impl Config {
    /// Four-stage pipeline: read -> env-interpolate -> deserialize -> validate.
    /// Used for both the initial load and every hot reload.
    pub fn load(path: &Path) -> Result<Self, SchedulerError> {
        let raw_text = std::fs::read_to_string(path)
            .map_err(|e| SchedulerError::ConfigInvalid(format!("reading {}: {e}", path.display())))?;
        Self::parse(&raw_text)
    }

    /// Startup self-heal (§4.4): if the initial load fails and a persisted
    /// list of model folders exists at `folder_list_path`, ask the Config
    /// Producer to regenerate the config document from those folders and
    /// retry the load exactly once. With no folder-list file, or with the
    /// default `UnsupportedConfigProducer`, this degrades to surfacing the
    /// original load error unchanged.
    pub async fn load_with_self_heal(
        path: &Path,
        folder_list_path: &Path,
        producer: &dyn crate::interfaces::ConfigProducer,
    ) -> Result<Self, SchedulerError> {
        let first_err = match Self::load(path) {
            Ok(config) => return Ok(config),
            Err(e) => e,
        };

        let Ok(text) = std::fs::read_to_string(folder_list_path) else {
            return Err(first_err);
        };
        let Ok(folders) = serde_json::from_str::<Vec<PathBuf>>(&text) else {
            return Err(first_err);
        };

        match producer.regenerate(&folders).await {
            Ok(regenerated_path) => {
                info!(path = %regenerated_path.display(), "config producer regenerated config, retrying load");
                Self::load(&regenerated_path)
            }
            Err(e) => {
                warn!(error = %e, "config producer could not regenerate config, aborting with original error");
                Err(first_err)
            }
        }
    }

    pub fn parse(raw_text: &str) -> Result<Self, SchedulerError> {
        let expanded = shellexpand::env(raw_text)
            .map_err(|e| SchedulerError::ConfigInvalid(format!("env interpolation: {e}")))?;

        let raw: RawConfig = serde_yaml_ng::from_str(&expanded)
            .map_err(|e| SchedulerError::ConfigInvalid(format!("yaml parse: {e}")))?;

        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, SchedulerError> {
        let mut problems: Vec<String> = Vec::new();

        if raw.health_check_timeout < 15 {
            problems.push(format!(
                "healthCheckTimeout must be >= 15 (got {})",
                raw.health_check_timeout
            ));
        }
        if !(0.0..=100.0).contains(&raw.min_free_memory_percent) {
            problems.push(format!(
                "minFreeMemoryPercent must be within 0..=100 (got {})",
                raw.min_free_memory_percent
            ));
        }

        // Assign every model to exactly one group; unlisted models fall into
        // a synthetic default group (swap=true, exclusive=false, persistent=false).
        let mut model_to_group: HashMap<String, String> = HashMap::new();
        for (group_id, group) in &raw.groups {
            for member in &group.members {
                if let Some(existing) = model_to_group.insert(member.clone(), group_id.clone()) {
                    problems.push(format!(
                        "model '{member}' is a member of both group '{existing}' and '{group_id}'"
                    ));
                }
            }
        }
        for model_id in raw.models.keys() {
            model_to_group
                .entry(model_id.clone())
                .or_insert_with(|| DEFAULT_GROUP_ID.to_string());
        }

        // Alias uniqueness, including no collision with any model id.
        let mut aliases: HashMap<String, String> = HashMap::new();
        for (model_id, model) in &raw.models {
            for alias in &model.aliases {
                if raw.models.contains_key(alias) {
                    problems.push(format!("alias '{alias}' collides with a model id"));
                    continue;
                }
                if let Some(existing) = aliases.insert(alias.clone(), model_id.clone())
                    && &existing != model_id
                {
                    problems.push(format!(
                        "alias '{alias}' is claimed by both '{existing}' and '{model_id}'"
                    ));
                }
            }
        }

        // Expand macros + validate per-model fields.
        let mut models = HashMap::new();
        for (model_id, raw_model) in &raw.models {
            if raw_model.concurrency_limit < 1 {
                problems.push(format!("model '{model_id}': concurrencyLimit must be >= 1"));
            }
            if raw_model.ttl != 0 && raw_model.ttl < 1 {
                problems.push(format!("model '{model_id}': ttl must be 0 or >= 1 second"));
            }
            if !raw_model.check_endpoint.starts_with('/') {
                problems.push(format!(
                    "model '{model_id}': checkEndpoint must start with '/' (got '{}')",
                    raw_model.check_endpoint
                ));
            }

            let command_template = match expand_macros(&raw_model.cmd, &raw.macros) {
                Ok(s) => s,
                Err(e) => {
                    problems.push(format!("model '{model_id}': {e}"));
                    String::new()
                }
            };
            let proxy_template = raw_model
                .proxy
                .clone()
                .unwrap_or_else(|| format!("http://127.0.0.1:{PORT_PLACEHOLDER}"));

            models.insert(
                model_id.clone(),
                ModelDef {
                    id: model_id.clone(),
                    display_name: raw_model
                        .display_name
                        .clone()
                        .unwrap_or_else(|| model_id.clone()),
                    description: raw_model.description.clone().unwrap_or_default(),
                    unlisted: raw_model.unlisted,
                    command_template,
                    proxy_template,
                    env: raw_model.env.clone(),
                    aliases: raw_model.aliases.clone(),
                    ttl: Duration::from_secs(raw_model.ttl),
                    concurrency_limit: raw_model.concurrency_limit,
                    check_endpoint: raw_model.check_endpoint.clone(),
                    use_model_name: raw_model.use_model_name.clone(),
                    size_hint_bytes: raw_model.size_hint_bytes,
                    group: model_to_group
                        .get(model_id)
                        .cloned()
                        .unwrap_or_else(|| DEFAULT_GROUP_ID.to_string()),
                },
            );
        }

        // Build the group table, including the synthetic default group.
        let mut groups = HashMap::new();
        for (group_id, raw_group) in &raw.groups {
            groups.insert(
                group_id.clone(),
                GroupDef {
                    id: group_id.clone(),
                    members: raw_group.members.clone(),
                    swap: raw_group.swap,
                    exclusive: raw_group.exclusive,
                    persistent: raw_group.persistent,
                    start_port: raw_group.start_port,
                },
            );
        }
        let default_members: Vec<String> = models
            .values()
            .filter(|m| m.group == DEFAULT_GROUP_ID)
            .map(|m| m.id.clone())
            .collect();
        if !default_members.is_empty() || groups.is_empty() {
            groups.insert(
                DEFAULT_GROUP_ID.to_string(),
                GroupDef {
                    id: DEFAULT_GROUP_ID.to_string(),
                    members: default_members,
                    swap: true,
                    exclusive: false,
                    persistent: false,
                    start_port: None,
                },
            );
        }

        // start_port collisions between groups' explicit overrides.
        let mut seen_ports: HashSet<u16> = HashSet::new();
        for group in groups.values() {
            if let Some(port) = group.start_port
                && !seen_ports.insert(port)
            {
                problems.push(format!("group '{}': startPort {port} collides with another group", group.id));
            }
        }

        // startPort + largest concurrent set <= 65535.
        let largest_group = groups.values().map(|g| g.members.len()).max().unwrap_or(0) as u32;
        let port_range_exhausted = raw.start_port as u32 + largest_group > 65535;
        if port_range_exhausted {
            problems.push(format!(
                "startPort ({}) plus the largest group's member count ({}) exceeds 65535",
                raw.start_port, largest_group
            ));
        }

        if !problems.is_empty() {
            let message = problems.join("; ");
            return Err(if port_range_exhausted {
                SchedulerError::PortRangeExhausted(message)
            } else {
                SchedulerError::ConfigInvalid(message)
            });
        }

        Ok(Config {
            health_check_timeout: Duration::from_secs(raw.health_check_timeout),
            start_port: raw.start_port,
            log_level: raw.log_level,
            min_free_memory_percent: raw.min_free_memory_percent,
            models,
            groups,
            aliases,
        })
    }

    pub fn group_of(&self, model_id: &str) -> Option<&GroupDef> {
        self.models.get(model_id).and_then(|m| self.groups.get(&m.group))
    }

    /// Resolve a requested name to a canonical model id: exact, alias,
    /// case-insensitive, then structured fuzzy match.
    pub fn resolve(&self, requested: &str) -> Result<String, SchedulerError> {
        if self.models.contains_key(requested) {
            return Ok(requested.to_string());
        }
        if let Some(id) = self.aliases.get(requested) {
            return Ok(id.clone());
        }
        let lower = requested.to_lowercase();
        if let Some(id) = self.models.keys().find(|id| id.to_lowercase() == lower) {
            return Ok(id.clone());
        }
        if let Some(alias_id) = self
            .aliases
            .iter()
            .find(|(alias, _)| alias.to_lowercase() == lower)
            .map(|(_, id)| id.clone())
        {
            return Ok(alias_id);
        }

        let candidates = fuzzy_candidates(requested, &self.models, &self.aliases);
        match candidates.len() {
            0 => Err(SchedulerError::ModelUnknown {
                requested: requested.to_string(),
            }),
            1 => Ok(candidates.into_iter().next().unwrap()),
            _ => Err(SchedulerError::ModelAmbiguous {
                requested: requested.to_string(),
                candidates,
            }),
        }
    }

    /// Substitute `${PORT}` into the model's command template and split argv
    /// without invoking a shell.
    pub fn command_for(&self, model_id: &str, port: u16) -> Result<(Vec<String>, HashMap<String, String>), SchedulerError> {
        let model = self
            .models
            .get(model_id)
            .ok_or_else(|| SchedulerError::ModelUnknown { requested: model_id.to_string() })?;
        let substituted = model.command_template.replace(PORT_PLACEHOLDER, &port.to_string());
        let argv = split_argv(&substituted)
            .map_err(|e| SchedulerError::ConfigInvalid(format!("model '{model_id}' command: {e}")))?;
        Ok((argv, model.env.clone()))
    }

    pub fn proxy_url_for(&self, model_id: &str, port: u16) -> String {
        self.models
            .get(model_id)
            .map(|m| m.proxy_template.replace(PORT_PLACEHOLDER, &port.to_string()))
            .unwrap_or_else(|| format!("http://127.0.0.1:{port}"))
    }
}

/// Difference between two config snapshots, used to decide which Processes
/// survive a hot reload unchanged.
pub struct ConfigDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Model ids present in both but whose expanded command argv changed.
    pub changed: Vec<String>,
    /// Model ids present in both with byte-identical command argv: their
    /// running Process, if any, is kept across the reload.
    pub unchanged: Vec<String>,
}

pub fn diff_models(old: &Config, new: &Config) -> ConfigDiff {
    let old_ids: HashSet<&String> = old.models.keys().collect();
    let new_ids: HashSet<&String> = new.models.keys().collect();

    let added = new_ids.difference(&old_ids).map(|s| s.to_string()).collect();
    let removed = old_ids.difference(&new_ids).map(|s| s.to_string()).collect();

    let mut changed = Vec::new();
    let mut unchanged = Vec::new();
    for id in old_ids.intersection(&new_ids) {
        let old_cmd = &old.models[*id].command_template;
        let new_cmd = &new.models[*id].command_template;
        if old_cmd == new_cmd {
            unchanged.push((*id).clone());
        } else {
            changed.push((*id).clone());
        }
    }

    ConfigDiff { added, removed, changed, unchanged }
}

/// Pure textual macro substitution: `$macroName` / `${macroName}` references
/// are replaced with the macro's raw text. Not an expression engine. The
/// single exception is `${PORT}`, which is left untouched for the caller to
/// substitute once the port is known.
fn expand_macros(input: &str, macros: &HashMap<String, String>) -> Result<String, String> {
    let mut output = input.to_string();
    // Bounded number of passes so a macro referencing another macro resolves,
    // without allowing infinite recursion from a cyclic definition.
    for _ in 0..8 {
        let mut changed = false;
        for (name, value) in macros {
            for pattern in [format!("${{{name}}}"), format!("${name}")] {
                if output.contains(&pattern) {
                    output = output.replace(&pattern, value);
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    if let Some(leftover) = find_unresolved_placeholder(&output) {
        return Err(format!("unresolved placeholder '{leftover}'"));
    }
    Ok(output)
}

fn find_unresolved_placeholder(s: &str) -> Option<String> {
    let re = Regex::new(r"\$\{[^}]+\}").expect("static regex");
    re.find_iter(s)
        .map(|m| m.as_str().to_string())
        .find(|m| m != PORT_PLACEHOLDER)
}

/// Split a command string into argv the way a shell would, honoring single
/// and double quotes and backslash escapes, without invoking a shell.
fn split_argv(input: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut has_token = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if !in_single => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    has_token = true;
                }
            }
            '\'' if !in_double => {
                in_single = !in_single;
                has_token = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                has_token = true;
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if in_single || in_double {
        return Err("unterminated quote in command".to_string());
    }
    if has_token {
        args.push(current);
    }
    if args.is_empty() {
        return Err("empty command".to_string());
    }
    Ok(args)
}

/// Structured fuzzy resolution for `repo/name:filename.gguf` and
/// `repo/name:quant` shapes. Quant tokens (`q4_k_m`, `f16`, ...) are matched
/// case-insensitively, tolerant of a missing `_m`/`_s`/`_l` suffix.
fn fuzzy_candidates(
    requested: &str,
    models: &HashMap<String, ModelDef>,
    aliases: &HashMap<String, String>,
) -> Vec<String> {
    let Some((repo_part, suffix)) = requested.rsplit_once(':') else {
        return Vec::new();
    };
    let repo_lower = repo_part.to_lowercase();
    let suffix_lower = suffix.to_lowercase();
    let suffix_norm = normalize_quant(&suffix_lower);

    let mut matches: HashSet<String> = HashSet::new();
    let candidate_keys = models.keys().cloned().chain(aliases.keys().cloned());

    for key in candidate_keys {
        let Some((key_repo, key_suffix)) = key.rsplit_once(':') else {
            continue;
        };
        if key_repo.to_lowercase() != repo_lower {
            continue;
        }
        let key_suffix_lower = key_suffix.to_lowercase();
        let is_match = key_suffix_lower == suffix_lower
            || key_suffix_lower.ends_with(&suffix_lower)
            || normalize_quant(&key_suffix_lower) == suffix_norm;
        if is_match {
            let canonical = aliases.get(key).cloned().unwrap_or_else(|| key.to_string());
            matches.insert(canonical);
        }
    }

    matches.into_iter().collect()
}

fn normalize_quant(s: &str) -> String {
    let stripped = s.trim_end_matches(".gguf");
    for suffix in ["_m", "_s", "_l"] {
        if let Some(base) = stripped.strip_suffix(suffix) {
            return base.to_string();
        }
    }
    stripped.to_string()
}

/// Reads the config file, starts a debounced file watcher, and publishes a
/// freshly validated `Arc<Config>` to `on_reload` on every stabilized change.
/// Mirrors the teacher's `watch_config` debounce-then-reload loop.
pub async fn watch_config(path: PathBuf, shared: Arc<ArcSwap<Config>>, on_reload: mpsc::Sender<Arc<Config>>) {
    use notify::{RecursiveMode, Watcher};

    let (tx, mut rx) = mpsc::channel(8);
    let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if res.is_ok() {
            let _ = tx.try_send(());
        }
    }) {
        Ok(w) => w,
        Err(e) => {
            warn!(error = %e, "config watcher failed to start; hot reload disabled");
            return;
        }
    };

    if let Some(parent) = path.parent()
        && let Err(e) = watcher.watch(parent, RecursiveMode::NonRecursive)
    {
        warn!(error = %e, path = %parent.display(), "failed to watch config directory");
        return;
    }

    while rx.recv().await.is_some() {
        // Debounce: coalesce a burst of filesystem events into one reload.
        tokio::time::sleep(Duration::from_millis(250)).await;
        while rx.try_recv().is_ok() {}

        match Config::load(&path) {
            Ok(new_config) => {
                info!(path = %path.display(), "config reloaded");
                let new_config = Arc::new(new_config);
                shared.store(Arc::clone(&new_config));
                if on_reload.send(new_config).await.is_err() {
                    debug!("config reload receiver dropped; stopping watcher");
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "config reload rejected, keeping previous snapshot");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
healthCheckTimeout: 30
startPort: 9000
models:
  repo-a/modelA:
    cmd: "echo hi --port ${PORT}"
    aliases: ["modelA-alias"]
  repo-a/modelB:
    cmd: "echo hi2 --port ${PORT}"
groups:
  g1:
    members: ["repo-a/modelA", "repo-a/modelB"]
    swap: true
"#
    }

    #[test]
    fn parses_minimal_config() {
        let cfg = Config::parse(sample_yaml()).expect("should parse");
        assert_eq!(cfg.models.len(), 2);
        assert_eq!(cfg.groups["g1"].members.len(), 2);
    }

    #[test]
    fn rejects_low_health_check_timeout() {
        let yaml = r#"
healthCheckTimeout: 1
models:
  m:
    cmd: "echo ${PORT}"
"#;
        let err = Config::parse(yaml).unwrap_err();
        assert!(matches!(err, SchedulerError::ConfigInvalid(_)));
    }

    #[test]
    fn unlisted_models_join_default_group() {
        let yaml = r#"
models:
  solo:
    cmd: "echo ${PORT}"
"#;
        let cfg = Config::parse(yaml).unwrap();
        assert_eq!(cfg.models["solo"].group, DEFAULT_GROUP_ID);
        assert!(cfg.groups[DEFAULT_GROUP_ID].swap);
        assert!(!cfg.groups[DEFAULT_GROUP_ID].exclusive);
        assert!(!cfg.groups[DEFAULT_GROUP_ID].persistent);
    }

    #[test]
    fn duplicate_alias_across_models_is_rejected() {
        let yaml = r#"
models:
  a:
    cmd: "echo ${PORT}"
    aliases: ["shared"]
  b:
    cmd: "echo ${PORT}"
    aliases: ["shared"]
"#;
        let err = Config::parse(yaml).unwrap_err();
        assert!(matches!(err, SchedulerError::ConfigInvalid(_)));
    }

    #[test]
    fn alias_colliding_with_model_id_is_rejected() {
        let yaml = r#"
models:
  a:
    cmd: "echo ${PORT}"
    aliases: ["b"]
  b:
    cmd: "echo ${PORT}"
"#;
        let err = Config::parse(yaml).unwrap_err();
        assert!(matches!(err, SchedulerError::ConfigInvalid(_)));
    }

    #[test]
    fn resolve_exact_alias_case_insensitive() {
        let cfg = Config::parse(sample_yaml()).unwrap();
        assert_eq!(cfg.resolve("repo-a/modelA").unwrap(), "repo-a/modelA");
        assert_eq!(cfg.resolve("modelA-alias").unwrap(), "repo-a/modelA");
        assert_eq!(cfg.resolve("REPO-A/MODELA").unwrap(), "repo-a/modelA");
    }

    #[test]
    fn resolve_unknown_model_errors() {
        let cfg = Config::parse(sample_yaml()).unwrap();
        let err = cfg.resolve("nonexistent").unwrap_err();
        assert!(matches!(err, SchedulerError::ModelUnknown { .. }));
    }

    #[test]
    fn fuzzy_quant_resolution_tolerates_suffix_and_case() {
        let yaml = r#"
models:
  bartowski-mistral-22b-q5_k:
    cmd: "echo ${PORT}"
    aliases: ["bartowski/Mistral-22B-v0.1-GGUF:q5_k"]
"#;
        let cfg = Config::parse(yaml).unwrap();
        let resolved = cfg
            .resolve("bartowski/Mistral-22B-v0.1-GGUF:Q5_K_M")
            .expect("fuzzy match should succeed");
        assert_eq!(resolved, "bartowski-mistral-22b-q5_k");
    }

    #[test]
    fn macro_expansion_substitutes_and_leaves_port() {
        let yaml = r#"
macros:
  bin: "/usr/local/bin/llama-server"
models:
  m:
    cmd: "${bin} --port ${PORT}"
"#;
        let cfg = Config::parse(yaml).unwrap();
        assert_eq!(cfg.models["m"].command_template, "/usr/local/bin/llama-server --port ${PORT}");
    }

    #[test]
    fn unresolved_macro_placeholder_is_rejected() {
        let yaml = r#"
models:
  m:
    cmd: "${missing} --port ${PORT}"
"#;
        let err = Config::parse(yaml).unwrap_err();
        assert!(matches!(err, SchedulerError::ConfigInvalid(_)));
    }

    #[test]
    fn command_for_splits_quoted_argv() {
        let yaml = r#"
models:
  m:
    cmd: "llama-server --model 'path with spaces.gguf' --port ${PORT}"
"#;
        let cfg = Config::parse(yaml).unwrap();
        let (argv, _) = cfg.command_for("m", 9100).unwrap();
        assert_eq!(argv, vec!["llama-server", "--model", "path with spaces.gguf", "--port", "9100"]);
    }

    #[test]
    fn diff_identifies_added_removed_changed_unchanged() {
        let old = Config::parse(sample_yaml()).unwrap();
        let new_yaml = r#"
models:
  repo-a/modelA:
    cmd: "echo hi --port ${PORT} --extra-flag"
  repo-a/modelC:
    cmd: "echo hi3 --port ${PORT}"
"#;
        let new = Config::parse(new_yaml).unwrap();
        let diff = diff_models(&old, &new);
        assert_eq!(diff.added, vec!["repo-a/modelC".to_string()]);
        assert_eq!(diff.removed, vec!["repo-a/modelB".to_string()]);
        assert_eq!(diff.changed, vec!["repo-a/modelA".to_string()]);
        assert!(diff.unchanged.is_empty());
    }

    #[test]
    fn size_hint_bytes_defaults_to_none_and_parses_when_present() {
        let yaml = r#"
models:
  no-hint:
    cmd: "echo ${PORT}"
  with-hint:
    cmd: "echo ${PORT}"
    sizeHintBytes: 4294967296
"#;
        let cfg = Config::parse(yaml).unwrap();
        assert_eq!(cfg.models["no-hint"].size_hint_bytes, None);
        assert_eq!(cfg.models["with-hint"].size_hint_bytes, Some(4294967296));
    }

    #[test]
    fn start_port_exhaustion_is_rejected() {
        let mut models_yaml = String::new();
        let mut members = Vec::new();
        for i in 0..10 {
            let id = format!("m{i}");
            models_yaml.push_str(&format!("  {id}:\n    cmd: \"echo ${{PORT}}\"\n"));
            members.push(id);
        }
        let yaml = format!(
            "startPort: 65530\nmodels:\n{models_yaml}groups:\n  g:\n    members: [{}]\n",
            members.iter().map(|m| format!("\"{m}\"")).collect::<Vec<_>>().join(", ")
        );
        let err = Config::parse(&yaml).unwrap_err();
        assert!(matches!(err, SchedulerError::PortRangeExhausted(_)));
    }

    #[tokio::test]
    async fn self_heal_skips_regeneration_when_load_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(&config_path, sample_yaml()).unwrap();
        let folder_list_path = dir.path().join("folders.json");

        let producer = crate::interfaces::UnsupportedConfigProducer;
        let cfg = Config::load_with_self_heal(&config_path, &folder_list_path, &producer)
            .await
            .expect("direct load should succeed without touching the producer");
        assert_eq!(cfg.models.len(), 2);
    }

    #[tokio::test]
    async fn self_heal_surfaces_original_error_without_folder_list() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("missing.yaml");
        let folder_list_path = dir.path().join("folders.json");

        let producer = crate::interfaces::UnsupportedConfigProducer;
        let err = Config::load_with_self_heal(&config_path, &folder_list_path, &producer)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::ConfigInvalid(_)));
    }

    struct RegeneratingProducer {
        regenerated_path: PathBuf,
    }

    #[async_trait::async_trait]
    impl crate::interfaces::ConfigProducer for RegeneratingProducer {
        async fn regenerate(&self, _folders: &[PathBuf]) -> anyhow::Result<PathBuf> {
            Ok(self.regenerated_path.clone())
        }
    }

    #[tokio::test]
    async fn self_heal_retries_load_after_producer_regenerates() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("missing.yaml");
        let folder_list_path = dir.path().join("folders.json");
        std::fs::write(&folder_list_path, r#"["/models/repo-a"]"#).unwrap();

        let regenerated_path = dir.path().join("regenerated.yaml");
        std::fs::write(&regenerated_path, sample_yaml()).unwrap();
        let producer = RegeneratingProducer { regenerated_path };

        let cfg = Config::load_with_self_heal(&config_path, &folder_list_path, &producer)
            .await
            .expect("regenerated config should load");
        assert_eq!(cfg.models.len(), 2);
    }
}
