//! Recovers the comment API credentials (app id and client version) from the
//! page: observed requests, global config objects, inline scripts, meta tags
//! and data attributes. The first value found for each field wins.

use std::cell::Cell;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Datelike;
use crossbeam_channel::{select, tick, unbounded, Receiver, Sender};
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::NetworkConfig;
use crate::config::TimingConfig;
use crate::dom::{Document, Interaction, Selector};
use crate::net::{is_platform_url, Exchange, ExchangeObserver};
use crate::page::Page;

const OBJECT_SEARCH_DEPTH: usize = 5;
const GLOBAL_SOURCES: [&str; 7] = [
    "_config",
    "config",
    "GAG_CONFIG",
    "APP_CONFIG",
    "INITIAL_STATE",
    "__INITIAL_STATE__",
    "__CONFIG__",
];
const CONFIG_WATCH_INTERVAL: Duration = Duration::from_millis(500);
const SCROLL_RESTORE_DELAY: Duration = Duration::from_millis(500);

fn patterns(sources: &[&str]) -> Vec<Regex> {
    sources
        .iter()
        .map(|src| Regex::new(src).expect("static config pattern"))
        .collect()
}

static URL_APP_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"appId=([^&]+)").expect("static app id pattern"));
static APP_ID_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    patterns(&[
        r#""appId"\s*:\s*"([^"]+)""#,
        r#""app_id"\s*:\s*"([^"]+)""#,
        r#""applicationId"\s*:\s*"([^"]+)""#,
        r#"appId\s*:\s*"([^"]+)""#,
        r#"app_id\s*:\s*"([^"]+)""#,
        r#""appId"\s*:\s*'([^']+)'"#,
        r#"appId\s*:\s*'([^']+)'"#,
    ])
});
static AGGRESSIVE_APP_ID_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    patterns(&[
        r#"commentOptions\s*:\s*\{[^}]*appId\s*:\s*"([^"]+)""#,
        r#"(?i)["']appId["']\s*:\s*["']([a-f0-9_]{20,})["']"#,
        r#"(?i)appId["']\s*:\s*["']([a-f0-9_]{20,})["']"#,
        r#"(?i)["']app_id["']\s*:\s*["']([a-f0-9_]{20,})["']"#,
        r#"["']?(a_[a-f0-9]{40})["']?"#,
        r#"(?i)appId["\s:=]+([a-f0-9_]{20,})"#,
        r#"(?i)window\._config\s*=\s*\{[^}]*appId["\s:]+([a-f0-9_]{20,})"#,
        r#"(?i)window\.config\s*=\s*\{[^}]*appId["\s:]+([a-f0-9_]{20,})"#,
    ])
});
static COMMENT_OPTIONS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    patterns(&[
        r#""commentOptions"\s*:\s*\{[^}]*"appId"\s*:\s*"([^"]+)""#,
        r#"commentOptions\s*:\s*\{[^}]*appId\s*:\s*"([^"]+)""#,
    ])
});
static VERSION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    patterns(&[
        r#""appVersion"\s*:\s*"([^"]+)""#,
        r#""version"\s*:\s*"([^"]+)""#,
        r#""clientVersion"\s*:\s*"([^"]+)""#,
        r#"appVersion\s*:\s*"([^"]+)""#,
        r#"version\s*:\s*"([^"]+)""#,
        r#""client-version"\s*:\s*"([^"]+)""#,
    ])
});
static HEX_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)[a-f0-9_]{30,}").expect("static hex pattern"));
static DOTTED_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+\.\d+").expect("static version pattern"));
static JSON_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{[^{}]*(?:\{[^{}]*\}[^{}]*)*\}").expect("static json block pattern")
});
static APP_ID_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^a_[a-f0-9]{40}$").expect("static app id shape"));
static SIMPLE_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\.\d+/web$").expect("static version shape"));

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("configuration: app id and client version not captured within {0:?}")]
    Timeout(Duration),
    #[error("configuration: acquisition stopped")]
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedConfig {
    pub app_id: Option<String>,
    pub client_version: Option<String>,
    pub is_complete: bool,
}

impl CapturedConfig {
    pub fn network(&self) -> Option<NetworkConfig> {
        Some(NetworkConfig {
            app_id: self.app_id.clone()?,
            client_version: self.client_version.clone()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    AppId,
    ClientVersion,
}

fn with_web_suffix(version: &str) -> String {
    if version.contains("/web") {
        version.to_string()
    } else {
        format!("{version}/web")
    }
}

/// Walks a config object up to five levels deep looking for app id and
/// version keys.
fn search_object(value: &Value, depth: usize, found: &mut dyn FnMut(Field, String)) {
    if depth > OBJECT_SEARCH_DEPTH {
        return;
    }
    let Value::Object(map) = value else {
        return;
    };
    for (key, value) in map {
        match (key.as_str(), value) {
            ("appId" | "app_id" | "applicationId", Value::String(id)) if id.len() > 10 => {
                found(Field::AppId, id.clone())
            }
            ("appVersion" | "version" | "clientVersion" | "app_version", Value::String(v)) => {
                found(Field::ClientVersion, with_web_suffix(v))
            }
            ("commentOptions", Value::Object(options)) => {
                if let Some(Value::String(id)) = options.get("appId") {
                    found(Field::AppId, id.clone());
                }
            }
            _ => {}
        }
        if value.is_object() {
            search_object(value, depth + 1, found);
        }
    }
}

fn first_capture(patterns: &[Regex], content: &str, accept: impl Fn(&str) -> bool) -> Option<String> {
    patterns.iter().find_map(|pattern| {
        pattern
            .captures_iter(content)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str())
            .find(|value| accept(value))
            .map(str::to_string)
    })
}

fn looks_like_version(value: &str) -> bool {
    value.len() > 2
        && (DOTTED_NUMBER.is_match(value) || value.contains("web") || value.len() > 5)
}

/// Layered script scan: precise key patterns, then permissive ones, then any
/// long `a_`-prefixed hex run.
fn search_script(content: &str, need_app_id: bool, need_version: bool, found: &mut dyn FnMut(Field, String)) {
    let mut have_app_id = !need_app_id;
    let mut have_version = !need_version;

    if !have_app_id {
        let app_id = first_capture(&APP_ID_PATTERNS, content, |v| v.len() > 10)
            .or_else(|| first_capture(&AGGRESSIVE_APP_ID_PATTERNS, content, |v| v.len() > 15))
            .or_else(|| {
                HEX_RUN
                    .find_iter(content)
                    .map(|m| m.as_str())
                    .find(|run| run.starts_with("a_") && run.len() > 35)
                    .map(str::to_string)
            });
        if let Some(app_id) = app_id {
            found(Field::AppId, app_id);
            have_app_id = true;
        }
    }

    if !have_version {
        if let Some(version) = first_capture(&VERSION_PATTERNS, content, looks_like_version) {
            found(Field::ClientVersion, with_web_suffix(&version));
            have_version = true;
        }
    }

    if !have_app_id {
        if let Some(app_id) = first_capture(&COMMENT_OPTIONS_PATTERNS, content, |v| v.len() > 10) {
            found(Field::AppId, app_id);
            have_app_id = true;
        }
    }

    if (!have_app_id || !have_version) && content.len() > 5000 {
        for block in JSON_BLOCK.find_iter(content).take(5) {
            if block.as_str().len() <= 100 {
                continue;
            }
            if let Ok(parsed) = serde_json::from_str::<Value>(block.as_str()) {
                search_object(&parsed, 0, found);
            }
        }
    }
}

/// Collects every candidate the page currently exposes, in priority order.
pub fn scan_page(page: &Page) -> CapturedConfig {
    let mut config = CapturedConfig::default();
    let mut offer = |field: Field, value: String| match field {
        Field::AppId if config.app_id.is_none() => config.app_id = Some(value),
        Field::ClientVersion if config.client_version.is_none() => {
            config.client_version = Some(value)
        }
        _ => {}
    };
    scan_into(page, &mut offer);
    config.is_complete = config.app_id.is_some() && config.client_version.is_some();
    config
}

fn scan_into(page: &Page, found: &mut dyn FnMut(Field, String)) {
    if let Some(Value::String(id)) = page.global("_config.config.commentOptions.appId") {
        found(Field::AppId, id);
    }
    if let Some(version) = page.global("_config.config.appVersion") {
        let version = match version {
            Value::String(v) => v,
            other => other.to_string(),
        };
        found(Field::ClientVersion, format!("{version}/web"));
    }
    for source in GLOBAL_SOURCES {
        if let Some(value) = page.global(source) {
            search_object(&value, 0, found);
        }
    }

    let doc = page.document();
    let need_app_id = Cell::new(true);
    let need_version = Cell::new(true);
    for script in doc.query_all(doc.document_element(), &Selector::tag("script")) {
        let (app, version) = (need_app_id.get(), need_version.get());
        if !app && !version {
            break;
        }
        let content = doc.text_content(script);
        if content.is_empty() {
            continue;
        }
        search_script(&content, app, version, &mut |field, value| {
            match field {
                Field::AppId => need_app_id.set(false),
                Field::ClientVersion => need_version.set(false),
            }
            found(field, value);
        });
    }

    scan_markup(&doc, found);
}

fn scan_markup(doc: &Document, found: &mut dyn FnMut(Field, String)) {
    let meta = Selector::All(vec![
        Selector::tag("meta"),
        Selector::Any(vec![
            Selector::attr_contains("name", "config"),
            Selector::attr_contains("property", "config"),
        ]),
    ]);
    for node in doc.query_all(doc.document_element(), &meta) {
        if let Some(parsed) = doc
            .attr(node, "content")
            .and_then(|content| serde_json::from_str::<Value>(content).ok())
        {
            search_object(&parsed, 0, found);
        }
    }
    for element in [doc.document_element(), doc.body()] {
        for (name, value) in doc.attrs(element) {
            if !name.starts_with("data-") || value.is_empty() {
                continue;
            }
            if let Ok(parsed) = serde_json::from_str::<Value>(value) {
                search_object(&parsed, 0, found);
            }
        }
    }
}

/// Pokes the page into issuing comment requests: hovers the first comment
/// element, nudges the scroll position and clicks one "load more" control.
/// Returns the scroll position to restore afterwards.
pub fn provoke(page: &Page) -> i64 {
    let original_scroll = page.scroll_y();
    {
        let mut doc = page.document();
        let root = doc.document_element();
        let triggers = [
            Selector::class("comment-list-item"),
            Selector::class("comment-item"),
            Selector::class("ui-comment-header"),
            Selector::class("comment-expand"),
            Selector::class("load-more-comments"),
            Selector::class("show-replies"),
            Selector::class_contains("comment"),
            Selector::AttrContains("data-comment-id".into(), String::new()),
        ];
        if let Some(first) = triggers.iter().find_map(|sel| doc.query(root, sel)) {
            for interaction in [Interaction::MouseEnter, Interaction::MouseOver, Interaction::Focus] {
                doc.dispatch(first, interaction);
            }
        }

        let buttons = Selector::Any(vec![
            Selector::class("load-more"),
            Selector::class("show-more"),
            Selector::class("load-replies"),
            Selector::class("show-replies"),
            Selector::class_contains("load"),
            Selector::class_contains("more"),
        ]);
        let button = doc.query_all(root, &buttons).into_iter().find(|node| {
            let text = doc.text_content(*node).to_lowercase();
            text.contains("load") || text.contains("more") || text.contains("repl")
        });
        if let Some(button) = button {
            debug!("clicking load-more control");
            doc.dispatch(button, Interaction::Click);
        }
    }
    page.scroll_by(100);
    original_scroll
}

/// Sanity checks on captured credentials; each issue is also logged.
pub fn validate_configuration(config: &CapturedConfig, timing: &TimingConfig) -> Vec<String> {
    let year = chrono::Local::now().year();
    let issues = configuration_issues(config, timing, year);
    if issues.is_empty() {
        debug!("configuration validation passed");
    }
    for issue in &issues {
        warn!(issue = %issue, "configuration validation");
    }
    issues
}

fn configuration_issues(config: &CapturedConfig, timing: &TimingConfig, year: i32) -> Vec<String> {
    let mut issues = Vec::new();
    if let Some(app_id) = &config.app_id {
        if !APP_ID_SHAPE.is_match(app_id) {
            issues.push(format!("app id format may be invalid: {app_id}"));
        }
    }
    if let Some(version) = &config.client_version {
        let short_year = format!("{:02}", year.rem_euclid(100));
        if !version.contains(&short_year) && !SIMPLE_VERSION.is_match(version) {
            issues.push(format!("client version may be outdated: {version}"));
        }
    }
    if timing.api_delay < Duration::from_millis(50) {
        issues.push(format!("api delay may be too aggressive: {:?}", timing.api_delay));
    }
    if !config.is_complete {
        issues.push("configuration not yet captured from network requests or page data".into());
    }
    issues
}

pub type ReadyListener = Box<dyn FnOnce(&NetworkConfig) + Send>;

#[derive(Default)]
struct State {
    app_id: Option<String>,
    client_version: Option<String>,
    listeners: Vec<ReadyListener>,
    stopped: bool,
}

impl State {
    fn network(&self) -> Option<NetworkConfig> {
        Some(NetworkConfig {
            app_id: self.app_id.clone()?,
            client_version: self.client_version.clone()?,
        })
    }
}

struct Inner {
    page: Arc<Page>,
    timing: TimingConfig,
    state: Mutex<State>,
    ready: Condvar,
}

struct Worker {
    stop: Sender<()>,
    handle: thread::JoinHandle<()>,
}

pub struct ConfigAcquirer {
    inner: Arc<Inner>,
    worker: Mutex<Option<Worker>>,
}

impl ConfigAcquirer {
    pub fn new(page: Arc<Page>, timing: &TimingConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                page,
                timing: timing.clone(),
                state: Mutex::new(State::default()),
                ready: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> CapturedConfig {
        let state = self.inner.state.lock();
        CapturedConfig {
            app_id: state.app_id.clone(),
            client_version: state.client_version.clone(),
            is_complete: state.app_id.is_some() && state.client_version.is_some(),
        }
    }

    /// Runs `listener` once both values are known; immediately when they
    /// already are.
    pub fn on_ready<F>(&self, listener: F)
    where
        F: FnOnce(&NetworkConfig) + Send + 'static,
    {
        let network = {
            let mut state = self.inner.state.lock();
            match state.network() {
                Some(network) => network,
                None => {
                    state.listeners.push(Box::new(listener));
                    return;
                }
            }
        };
        listener(&network);
    }

    pub fn observer(&self) -> Arc<dyn ExchangeObserver> {
        self.inner.clone()
    }

    pub fn scan_now(&self) {
        self.inner.scan();
    }

    /// Scans immediately, then keeps scanning on an interval for a bounded
    /// window, provoking network traffic if nothing turned up.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        self.inner.state.lock().stopped = false;
        self.inner.scan();
        let (stop_tx, stop_rx) = unbounded();
        let inner = self.inner.clone();
        let handle = thread::spawn(move || inner.run(stop_rx));
        *worker = Some(Worker {
            stop: stop_tx,
            handle,
        });
    }

    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            state.stopped = true;
            self.inner.ready.notify_all();
        }
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.stop.send(());
            let _ = worker.handle.join();
        }
    }

    /// Blocks until both values are known or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Result<NetworkConfig, ConfigError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(network) = state.network() {
                return Ok(network);
            }
            if state.stopped {
                return Err(ConfigError::Stopped);
            }
            if self.inner.ready.wait_until(&mut state, deadline).timed_out() {
                return state.network().ok_or(ConfigError::Timeout(timeout));
            }
        }
    }
}

impl Drop for ConfigAcquirer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ExchangeObserver for Inner {
    fn observe(&self, exchange: &Exchange) {
        if is_platform_url(&exchange.url) {
            if let Some(version) = exchange.request_header("client-version") {
                self.offer(Field::ClientVersion, version.to_string(), "request header");
            }
        }
        if let Some(app_id) = URL_APP_ID
            .captures(&exchange.url)
            .and_then(|caps| caps.get(1))
        {
            self.offer(Field::AppId, app_id.as_str().to_string(), "request url");
        }
    }
}

impl Inner {
    fn run(&self, stop: Receiver<()>) {
        let started = Instant::now();
        let scan = tick(self.timing.config_scan_interval);
        let watch = tick(CONFIG_WATCH_INTERVAL);
        let provoke_at = started + self.timing.config_provoke_after;
        let mut provoked = false;
        let mut restore: Option<(Instant, i64)> = None;
        let mut fingerprint = self.page.global("_config").map(|v| v.to_string());

        loop {
            if self.is_complete() && restore.is_none() {
                break;
            }
            let next = match (provoked, restore) {
                (_, Some((at, _))) => at,
                (false, None) => provoke_at,
                (true, None) => Instant::now() + Duration::from_secs(3600),
            };
            let wait = next.saturating_duration_since(Instant::now());
            select! {
                recv(stop) -> _ => break,
                recv(scan) -> _ => {
                    if started.elapsed() < self.timing.config_scan_limit {
                        self.scan();
                    }
                }
                recv(watch) -> _ => {
                    let current = self.page.global("_config").map(|v| v.to_string());
                    if current.is_some() && current != fingerprint {
                        fingerprint = current;
                        self.scan();
                    }
                }
                default(wait) => {
                    let now = Instant::now();
                    if !provoked && now >= provoke_at {
                        provoked = true;
                        if !self.is_complete() {
                            info!("configuration not found in page, provoking network activity");
                            restore = Some((now + SCROLL_RESTORE_DELAY, provoke(&self.page)));
                        }
                    }
                    if let Some((at, y)) = restore {
                        if now >= at {
                            self.page.scroll_to(y);
                            restore = None;
                        }
                    }
                }
            }
        }
    }

    fn is_complete(&self) -> bool {
        let state = self.state.lock();
        state.app_id.is_some() && state.client_version.is_some()
    }

    fn scan(&self) {
        if self.is_complete() {
            return;
        }
        let found = scan_page(&self.page);
        if let Some(app_id) = found.app_id {
            self.offer(Field::AppId, app_id, "page");
        }
        if let Some(version) = found.client_version {
            self.offer(Field::ClientVersion, version, "page");
        }
    }

    fn offer(&self, field: Field, value: String, source: &str) {
        let (network, listeners) = {
            let mut state = self.state.lock();
            let slot = match field {
                Field::AppId => &mut state.app_id,
                Field::ClientVersion => &mut state.client_version,
            };
            if slot.is_some() {
                return;
            }
            info!(field = ?field, value = %value, source, "captured configuration value");
            *slot = Some(value);
            match state.network() {
                Some(network) => (network, std::mem::take(&mut state.listeners)),
                None => return,
            }
        };
        self.ready.notify_all();
        info!(app_id = %network.app_id, client_version = %network.client_version, "configuration complete");
        for listener in listeners {
            listener(&network);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::el;
    use crate::net::Via;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const APP_ID: &str = "a_dd8f2b7d304a10edaf6f29517ea0ca4100a43d1b";

    fn page_with(document: Document, globals: &[(&str, Value)]) -> Arc<Page> {
        let mut builder = Page::builder("https://9gag.com/gag/aXYZ").document(document);
        for (name, value) in globals {
            builder = builder.global(name, value.clone());
        }
        Arc::new(builder.build().unwrap())
    }

    #[test]
    fn reads_window_config() {
        let page = page_with(
            Document::new(),
            &[(
                "_config",
                json!({"config": {"appVersion": "31.3", "commentOptions": {"appId": APP_ID}}}),
            )],
        );
        let found = scan_page(&page);
        assert_eq!(found.app_id.as_deref(), Some(APP_ID));
        assert_eq!(found.client_version.as_deref(), Some("31.3/web"));
        assert!(found.is_complete);
    }

    #[test]
    fn searches_other_globals_with_depth_limit() {
        let deep = json!({"a": {"b": {"c": {"d": {"e": {"f": {"g": {"appId": APP_ID}}}}}}}});
        let page = page_with(
            Document::new(),
            &[
                ("__INITIAL_STATE__", json!({"app": {"clientVersion": "1.2/web", "appId": "short"}})),
                ("APP_CONFIG", deep),
            ],
        );
        let found = scan_page(&page);
        assert_eq!(found.client_version.as_deref(), Some("1.2/web"));
        assert_eq!(found.app_id, None);
    }

    #[test]
    fn script_patterns_from_precise_to_permissive() {
        let mut found = Vec::new();
        search_script(
            r#"window.x = {"appId": "a_0123456789", "version": "v1"};"#,
            true,
            true,
            &mut |f, v| found.push((f, v)),
        );
        assert_eq!(found, vec![(Field::AppId, "a_0123456789".to_string())]);

        let mut found = Vec::new();
        let hex = format!("var k = {APP_ID};");
        search_script(&hex, true, false, &mut |f, v| found.push((f, v)));
        assert_eq!(found, vec![(Field::AppId, APP_ID.to_string())]);

        let mut found = Vec::new();
        search_script(r#"{appVersion: "31.3.1"}"#, false, true, &mut |f, v| found.push((f, v)));
        assert_eq!(found, vec![(Field::ClientVersion, "31.3.1/web".to_string())]);
    }

    #[test]
    fn reads_meta_and_data_attributes() {
        let mut doc = Document::new();
        let head = doc.head();
        doc.build(
            head,
            el("meta")
                .attr("name", "app-config")
                .attr("content", &json!({"appId": APP_ID}).to_string()),
        );
        let body = doc.body();
        doc.set_attr(body, "data-settings", r#"{"clientVersion":"2.0"}"#);
        let found = scan_page(&page_with(doc, &[]));
        assert_eq!(found.app_id.as_deref(), Some(APP_ID));
        assert_eq!(found.client_version.as_deref(), Some("2.0/web"));
    }

    #[test]
    fn observed_requests_fill_fields_once() {
        let page = page_with(Document::new(), &[]);
        let acquirer = ConfigAcquirer::new(page, &TimingConfig::default());
        let ready = Arc::new(Mutex::new(None));
        let sink = ready.clone();
        acquirer.on_ready(move |network| *sink.lock() = Some(network.clone()));

        let observer = acquirer.observer();
        let exchange = |url: &str, version: &str| Exchange {
            via: Via::Fetch,
            method: "GET".into(),
            url: url.into(),
            request_headers: vec![("client-version".into(), version.into())],
            status: 200,
            body: None,
        };
        observer.observe(&exchange("https://example.com/x", "9.9/web"));
        assert_eq!(acquirer.config().client_version, None);
        observer.observe(&exchange(
            &format!("https://comment-cdn.9gag.com/v2/cacheable/comment-list.json?appId={APP_ID}&count=10"),
            "31.3/web",
        ));
        observer.observe(&exchange("https://9gag.com/v1/x?appId=a_other", "1.0/web"));

        let config = acquirer.config();
        assert!(config.is_complete);
        assert_eq!(config.app_id.as_deref(), Some(APP_ID));
        assert_eq!(config.client_version.as_deref(), Some("31.3/web"));
        assert_eq!(*ready.lock(), config.network());
    }

    #[test]
    fn wait_times_out_without_config() {
        let page = page_with(Document::new(), &[]);
        let acquirer = ConfigAcquirer::new(page, &TimingConfig::default());
        let err = acquirer.wait(Duration::from_millis(30)).unwrap_err();
        assert_eq!(err, ConfigError::Timeout(Duration::from_millis(30)));
    }

    #[test]
    fn provoke_hovers_scrolls_and_clicks() {
        let mut doc = Document::new();
        let body = doc.body();
        let comment = doc.build(body, el("div").class("comment-list-item"));
        let button = doc.build(body, el("button").class("load-more").text("Load more comments"));
        let page = page_with(doc, &[]);
        let original = provoke(&page);
        assert_eq!(original, 0);
        assert_eq!(page.scroll_y(), 100);
        let doc = page.document();
        assert_eq!(
            doc.interactions(),
            &[
                (comment, Interaction::MouseEnter),
                (comment, Interaction::MouseOver),
                (comment, Interaction::Focus),
                (button, Interaction::Click),
            ]
        );
    }

    #[test]
    fn validation_flags_suspicious_values() {
        let good = CapturedConfig {
            app_id: Some(APP_ID.into()),
            client_version: Some("31.3/web".into()),
            is_complete: true,
        };
        assert!(configuration_issues(&good, &TimingConfig::default(), 2026).is_empty());

        let odd = CapturedConfig {
            app_id: Some("a_xyz".into()),
            client_version: Some("release-x/web".into()),
            is_complete: true,
        };
        let mut timing = TimingConfig::default();
        timing.api_delay = Duration::from_millis(10);
        assert_eq!(configuration_issues(&odd, &timing, 2026).len(), 3);
        assert_eq!(
            configuration_issues(&CapturedConfig::default(), &TimingConfig::default(), 2026).len(),
            1
        );
    }
}
