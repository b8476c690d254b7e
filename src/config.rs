use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const DEFAULT_ENV_PREFIX: &str = "SHADOWCHECK";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub settings: Settings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    #[serde(default = "default_comment_list_url")]
    pub comment_list_url: String,
    #[serde(default = "default_add_comment_url")]
    pub add_comment_url: String,
    #[serde(default = "default_origin")]
    pub origin: String,
    #[serde(default = "default_referer")]
    pub referer: String,
    #[serde(default = "default_post_url_base")]
    pub post_url_base: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            comment_list_url: default_comment_list_url(),
            add_comment_url: default_add_comment_url(),
            origin: default_origin(),
            referer: default_referer(),
            post_url_base: default_post_url_base(),
            page_size: default_page_size(),
        }
    }
}

fn default_comment_list_url() -> String {
    "https://comment-cdn.9gag.com/v2/cacheable/comment-list.json".into()
}

fn default_add_comment_url() -> String {
    "https://comment.9gag.com/v2/add-comment.json".into()
}

fn default_origin() -> String {
    "https://9gag.com".into()
}

fn default_referer() -> String {
    "https://9gag.com/".into()
}

fn default_post_url_base() -> String {
    "http://9gag.com/gag/".into()
}

fn default_page_size() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchConfig {
    /// Page cap for exhaustive top-level and reply-thread loads.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    /// Page cap for the targeted search of the user's own top-level comments.
    #[serde(default = "default_max_pages_for_user_search")]
    pub max_pages_for_user_search: usize,
    #[serde(default = "default_early_termination_threshold")]
    pub early_termination_threshold: usize,
    /// Page until the API runs dry, ignoring both caps and early termination.
    #[serde(default)]
    pub unlimited: bool,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_pages: default_max_pages(),
            max_pages_for_user_search: default_max_pages_for_user_search(),
            early_termination_threshold: default_early_termination_threshold(),
            unlimited: false,
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

fn default_max_pages() -> usize {
    100
}

fn default_max_pages_for_user_search() -> usize {
    50
}

fn default_early_termination_threshold() -> usize {
    5
}

fn default_max_concurrent_requests() -> usize {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingConfig {
    #[serde(default = "default_api_delay", with = "humantime_serde")]
    pub api_delay: Duration,
    #[serde(default = "default_user_comment_api_delay", with = "humantime_serde")]
    pub user_comment_api_delay: Duration,
    #[serde(default = "default_dom_update_delay", with = "humantime_serde")]
    pub dom_update_delay: Duration,
    #[serde(default = "default_new_comment_delay", with = "humantime_serde")]
    pub new_comment_delay: Duration,
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
    #[serde(default = "default_mutation_debounce", with = "humantime_serde")]
    pub mutation_debounce: Duration,
    #[serde(default = "default_target_mutation_debounce", with = "humantime_serde")]
    pub target_mutation_debounce: Duration,
    #[serde(default = "default_reenable_delay", with = "humantime_serde")]
    pub reenable_delay: Duration,
    #[serde(default = "default_login_settle_delay", with = "humantime_serde")]
    pub login_settle_delay: Duration,
    #[serde(default = "default_page_change_delay", with = "humantime_serde")]
    pub page_change_delay: Duration,
    #[serde(default = "default_gate_poll", with = "humantime_serde")]
    pub gate_poll: Duration,
    #[serde(default = "default_identity_debounce", with = "humantime_serde")]
    pub identity_debounce: Duration,
    #[serde(default = "default_identity_dom_cache", with = "humantime_serde")]
    pub identity_dom_cache: Duration,
    #[serde(default = "default_cookie_check", with = "humantime_serde")]
    pub cookie_check: Duration,
    #[serde(default = "default_identity_fallback_check", with = "humantime_serde")]
    pub identity_fallback_check: Duration,
    #[serde(default = "default_navigation_poll", with = "humantime_serde")]
    pub navigation_poll: Duration,
    #[serde(default = "default_deep_link_settle", with = "humantime_serde")]
    pub deep_link_settle: Duration,
    #[serde(default = "default_config_scan_interval", with = "humantime_serde")]
    pub config_scan_interval: Duration,
    #[serde(default = "default_config_scan_limit", with = "humantime_serde")]
    pub config_scan_limit: Duration,
    #[serde(default = "default_config_provoke_after", with = "humantime_serde")]
    pub config_provoke_after: Duration,
    #[serde(default = "default_config_timeout", with = "humantime_serde")]
    pub config_timeout: Duration,
    /// Retry schedule (milliseconds) for a deep-linked comment on first load.
    #[serde(default = "default_initial_target_retries")]
    pub initial_target_retries: Vec<u64>,
    /// Retry schedule (milliseconds) for a comment reached via hash change.
    #[serde(default = "default_hash_target_retries")]
    pub hash_target_retries: Vec<u64>,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            api_delay: default_api_delay(),
            user_comment_api_delay: default_user_comment_api_delay(),
            dom_update_delay: default_dom_update_delay(),
            new_comment_delay: default_new_comment_delay(),
            retry_delay: default_retry_delay(),
            mutation_debounce: default_mutation_debounce(),
            target_mutation_debounce: default_target_mutation_debounce(),
            reenable_delay: default_reenable_delay(),
            login_settle_delay: default_login_settle_delay(),
            page_change_delay: default_page_change_delay(),
            gate_poll: default_gate_poll(),
            identity_debounce: default_identity_debounce(),
            identity_dom_cache: default_identity_dom_cache(),
            cookie_check: default_cookie_check(),
            identity_fallback_check: default_identity_fallback_check(),
            navigation_poll: default_navigation_poll(),
            deep_link_settle: default_deep_link_settle(),
            config_scan_interval: default_config_scan_interval(),
            config_scan_limit: default_config_scan_limit(),
            config_provoke_after: default_config_provoke_after(),
            config_timeout: default_config_timeout(),
            initial_target_retries: default_initial_target_retries(),
            hash_target_retries: default_hash_target_retries(),
        }
    }
}

impl TimingConfig {
    /// Zero delays everywhere except the configuration timeout; handy when
    /// driving the engine synchronously.
    pub fn immediate() -> Self {
        Self {
            api_delay: Duration::ZERO,
            user_comment_api_delay: Duration::ZERO,
            dom_update_delay: Duration::ZERO,
            new_comment_delay: Duration::ZERO,
            retry_delay: Duration::ZERO,
            mutation_debounce: Duration::ZERO,
            target_mutation_debounce: Duration::ZERO,
            reenable_delay: Duration::ZERO,
            login_settle_delay: Duration::ZERO,
            page_change_delay: Duration::ZERO,
            gate_poll: Duration::from_millis(1),
            identity_debounce: Duration::ZERO,
            identity_dom_cache: Duration::ZERO,
            deep_link_settle: Duration::ZERO,
            initial_target_retries: vec![0],
            hash_target_retries: vec![0],
            ..Self::default()
        }
    }
}

fn default_api_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_user_comment_api_delay() -> Duration {
    Duration::from_millis(50)
}

fn default_dom_update_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_new_comment_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(3)
}

fn default_mutation_debounce() -> Duration {
    Duration::from_millis(500)
}

fn default_target_mutation_debounce() -> Duration {
    Duration::from_millis(100)
}

fn default_reenable_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_login_settle_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_page_change_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_gate_poll() -> Duration {
    Duration::from_millis(50)
}

fn default_identity_debounce() -> Duration {
    Duration::from_secs(1)
}

fn default_identity_dom_cache() -> Duration {
    Duration::from_secs(2)
}

fn default_cookie_check() -> Duration {
    Duration::from_secs(1)
}

fn default_identity_fallback_check() -> Duration {
    Duration::from_secs(5)
}

fn default_navigation_poll() -> Duration {
    Duration::from_secs(1)
}

fn default_deep_link_settle() -> Duration {
    Duration::from_millis(100)
}

fn default_config_scan_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_config_scan_limit() -> Duration {
    Duration::from_secs(10)
}

fn default_config_provoke_after() -> Duration {
    Duration::from_secs(3)
}

fn default_config_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_initial_target_retries() -> Vec<u64> {
    vec![200, 500, 1000, 2000, 3000, 5000, 8000]
}

fn default_hash_target_retries() -> Vec<u64> {
    vec![500, 1000, 2000, 3000, 5000]
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum MarkingKind {
    None,
    Border,
    Highlight,
    #[default]
    Badge,
    Custom,
}

/// The flat settings object shared with the settings store and popup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub enabled: bool,
    pub visible_marking: MarkingKind,
    pub shadowbanned_marking: MarkingKind,
    pub visible_custom_code: String,
    pub shadowbanned_custom_code: String,

    pub visible_highlight_border_color: String,
    pub visible_highlight_bg_color: String,
    pub visible_highlight_border_width: String,
    pub visible_border_color: String,
    pub visible_border_width: String,
    pub visible_badge_text: String,
    pub visible_badge_color: String,
    pub visible_badge_text_color: String,

    pub shadowbanned_highlight_border_color: String,
    pub shadowbanned_highlight_bg_color: String,
    pub shadowbanned_highlight_border_width: String,
    pub shadowbanned_border_color: String,
    pub shadowbanned_border_width: String,
    pub shadowbanned_badge_text: String,
    pub shadowbanned_badge_color: String,
    pub shadowbanned_badge_text_color: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            visible_marking: MarkingKind::Badge,
            shadowbanned_marking: MarkingKind::Badge,
            visible_custom_code: String::new(),
            shadowbanned_custom_code: String::new(),
            visible_highlight_border_color: "#4caf50".into(),
            visible_highlight_bg_color: "#1a2a1a".into(),
            visible_highlight_border_width: "3".into(),
            visible_border_color: "#4caf50".into(),
            visible_border_width: "3".into(),
            visible_badge_text: "VISIBLE".into(),
            visible_badge_color: "#4caf50".into(),
            visible_badge_text_color: "#ffffff".into(),
            shadowbanned_highlight_border_color: "#f44336".into(),
            shadowbanned_highlight_bg_color: "#2a1a1a".into(),
            shadowbanned_highlight_border_width: "3".into(),
            shadowbanned_border_color: "#f44336".into(),
            shadowbanned_border_width: "3".into(),
            shadowbanned_badge_text: "SHADOWBANNED".into(),
            shadowbanned_badge_color: "#f44336".into(),
            shadowbanned_badge_text_color: "#ffffff".into(),
        }
    }
}

impl Settings {
    /// Overlays a partial settings object. Returns whether a marking kind or
    /// custom hook changed, which requires re-annotating every comment.
    pub fn apply_patch(&mut self, patch: &Value) -> Result<bool> {
        let Value::Object(fields) = patch else {
            anyhow::bail!("settings patch must be an object");
        };
        let mut merged = serde_json::to_value(&*self).context("settings: failed to serialize")?;
        if let Value::Object(current) = &mut merged {
            for (key, value) in fields {
                current.insert(key.clone(), value.clone());
            }
        }
        let next: Settings =
            serde_json::from_value(merged).context("settings: invalid settings patch")?;
        let marking_changed = self.visible_marking != next.visible_marking
            || self.shadowbanned_marking != next.shadowbanned_marking
            || self.visible_custom_code != next.visible_custom_code
            || self.shadowbanned_custom_code != next.shadowbanned_custom_code;
        *self = next;
        Ok(marking_changed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            cfg = read_config_file(path)?;
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            cfg = read_config_file(&default_path)?;
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn apply_env(cfg: &mut Config, prefix: &str) {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    for (key, value) in map {
        apply_env_value(cfg, &key, value);
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True")
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    let duration = || humantime::parse_duration(&value).ok();
    match key {
        "api.comment_list_url" => cfg.api.comment_list_url = value,
        "api.add_comment_url" => cfg.api.add_comment_url = value,
        "api.origin" => cfg.api.origin = value,
        "api.referer" => cfg.api.referer = value,
        "api.post_url_base" => cfg.api.post_url_base = value,
        "api.page_size" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.api.page_size = parsed;
            }
        }
        "search.max_pages" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.search.max_pages = parsed;
            }
        }
        "search.max_pages_for_user_search" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.search.max_pages_for_user_search = parsed;
            }
        }
        "search.early_termination_threshold" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.search.early_termination_threshold = parsed;
            }
        }
        "search.max_concurrent_requests" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.search.max_concurrent_requests = parsed.max(1);
            }
        }
        "search.unlimited" => cfg.search.unlimited = parse_bool(&value),
        "timing.api_delay" => {
            if let Some(d) = duration() {
                cfg.timing.api_delay = d;
            }
        }
        "timing.dom_update_delay" => {
            if let Some(d) = duration() {
                cfg.timing.dom_update_delay = d;
            }
        }
        "timing.retry_delay" => {
            if let Some(d) = duration() {
                cfg.timing.retry_delay = d;
            }
        }
        "timing.mutation_debounce" => {
            if let Some(d) = duration() {
                cfg.timing.mutation_debounce = d;
            }
        }
        "timing.navigation_poll" => {
            if let Some(d) = duration() {
                cfg.timing.navigation_poll = d;
            }
        }
        "timing.config_timeout" => {
            if let Some(d) = duration() {
                cfg.timing.config_timeout = d;
            }
        }
        "settings.enabled" => cfg.settings.enabled = parse_bool(&value),
        "settings.visible_marking" => {
            if let Ok(kind) = serde_json::from_value(Value::String(value)) {
                cfg.settings.visible_marking = kind;
            }
        }
        "settings.shadowbanned_marking" => {
            if let Ok(kind) = serde_json::from_value(Value::String(value)) {
                cfg.settings.shadowbanned_marking = kind;
            }
        }
        _ => {}
    }
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("shadowcheck").join("config.yaml"))
}

/// Writes `settings` into the config file, keeping every other section.
pub fn save_settings(path: Option<PathBuf>, settings: &Settings) -> Result<PathBuf> {
    let path = if let Some(path) = path {
        path
    } else {
        default_config_path().context("config: unable to determine default config path")?
    };

    let mut cfg = if path.exists() {
        read_config_file(&path)?
    } else {
        Config::default()
    };
    cfg.settings = settings.clone();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("config: failed to create directory {}", parent.display()))?;
    }

    let contents = serde_yaml::to_string(&cfg).context("config: failed to serialize config")?;
    fs::write(&path, contents)
        .with_context(|| format!("config: failed to write file {}", path.display()))?;

    Ok(path)
}
