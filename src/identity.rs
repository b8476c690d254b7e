//! Tracks which user is signed in on the host page.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{never, select, tick, unbounded, Receiver, Sender};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::comments::extract_username_from_href;
use crate::config::TimingConfig;
use crate::dom::{Document, MutationRecord, NodeId, Selector};
use crate::net::{Exchange, ExchangeObserver};
use crate::page::Page;

const AUTH_COOKIES: [&str; 2] = ["PHPSESSID", "session"];
const NESTED_SEARCH_DEPTH: usize = 3;

static AVATAR_LINK: Lazy<Selector> = Lazy::new(|| {
    Selector::All(vec![
        Selector::tag("a"),
        Selector::class("avatar-container"),
        Selector::attr_contains("href", "/u/"),
    ])
});
static PROFILE_LINK: Lazy<Selector> =
    Lazy::new(|| Selector::All(vec![Selector::tag("a"), Selector::attr_contains("href", "/u/")]));
static CHROME_REGION: Lazy<Selector> = Lazy::new(|| {
    Selector::Any(vec![
        Selector::tag("nav"),
        Selector::tag("header"),
        Selector::class("nav"),
        Selector::class("header"),
        Selector::class_contains("nav"),
        Selector::class_contains("header"),
        Selector::class_contains("user"),
    ])
});
static USER_MENU: Lazy<Selector> = Lazy::new(|| {
    Selector::Any(vec![
        Selector::attr_contains("data-testid", "login"),
        Selector::attr_contains("data-testid", "logout"),
        Selector::attr_contains("data-testid", "user"),
        Selector::class("header-user"),
        Selector::class("user-menu"),
    ])
});
static USER_MENU_ATTRS: Lazy<Selector> = Lazy::new(|| {
    Selector::Any(vec![
        Selector::attr_contains("data-testid", "user"),
        Selector::class("header-user"),
        Selector::class("user-menu"),
    ])
});

pub type UserListener = Arc<dyn Fn(Option<&str>) + Send + Sync>;

/// Signed-in user as shown in the page chrome: the avatar link first, then
/// any profile link inside a navigation or header region.
pub fn user_from_document(doc: &Document) -> Option<String> {
    let root = doc.document_element();
    let from_href = |node: NodeId| doc.attr(node, "href").and_then(extract_username_from_href);

    if let Some(user) = doc.query_all(root, &AVATAR_LINK).into_iter().find_map(from_href) {
        return Some(user);
    }
    doc.query_all(root, &PROFILE_LINK)
        .into_iter()
        .filter(|link| doc.closest(*link, &CHROME_REGION).is_some())
        .find_map(from_href)
}

/// Username embedded in an API response, tried in order: `user`,
/// `data.user`, `payload.user`, `meta.user`, then (when `nested` is set) any
/// object carrying a string `username` within three levels.
pub fn user_from_api_data(data: &Value, nested: bool) -> Option<String> {
    const WRAPPERS: [&[&str]; 4] = [
        &["user"],
        &["data", "user"],
        &["payload", "user"],
        &["meta", "user"],
    ];
    for path in WRAPPERS {
        let mut current = data;
        let mut found = true;
        for key in path {
            match current.get(key) {
                Some(next) => current = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if found {
            if let Some(name) = current.get("username").and_then(Value::as_str) {
                if !name.is_empty() {
                    return Some(name.to_string());
                }
            }
        }
    }
    if nested {
        return search_nested(data, 0);
    }
    None
}

fn search_nested(value: &Value, depth: usize) -> Option<String> {
    if depth > NESTED_SEARCH_DEPTH {
        return None;
    }
    let children: Box<dyn Iterator<Item = &Value>> = match value {
        Value::Object(map) => Box::new(map.values()),
        Value::Array(items) => Box::new(items.iter()),
        _ => return None,
    };
    for child in children {
        if !(child.is_object() || child.is_array()) {
            continue;
        }
        if let Some(name) = child.get("username").and_then(Value::as_str) {
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
        if let Some(name) = search_nested(child, depth + 1) {
            return Some(name);
        }
    }
    None
}

fn auth_cookies(cookie: &str) -> BTreeMap<String, String> {
    cookie
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            AUTH_COOKIES
                .contains(&name)
                .then(|| (name.to_string(), value.to_string()))
        })
        .collect()
}

fn is_comment_api(url: &str) -> bool {
    url.contains("comment-cdn.9gag.com") || url.contains("comment.9gag.com")
}

fn is_user_api(url: &str) -> bool {
    ["/user/", "/profile/", "/auth/", "/login/"]
        .iter()
        .any(|needle| url.contains(needle))
}

#[derive(Debug, Default)]
struct State {
    current: Option<String>,
    last_change: Option<Instant>,
    logout_detected: bool,
    dom_cache: Option<(String, Instant)>,
    auth_cookies: BTreeMap<String, String>,
}

struct Inner {
    page: Arc<Page>,
    timing: TimingConfig,
    state: Mutex<State>,
    listeners: RwLock<Vec<UserListener>>,
}

struct Worker {
    stop: Sender<()>,
    handle: thread::JoinHandle<()>,
}

pub struct IdentityMonitor {
    inner: Arc<Inner>,
    worker: Mutex<Option<Worker>>,
}

impl IdentityMonitor {
    pub fn new(page: Arc<Page>, timing: &TimingConfig) -> Self {
        let cookies = auth_cookies(&page.cookie());
        Self {
            inner: Arc::new(Inner {
                page,
                timing: timing.clone(),
                state: Mutex::new(State {
                    auth_cookies: cookies,
                    ..State::default()
                }),
                listeners: RwLock::new(Vec::new()),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn current_user(&self) -> Option<String> {
        self.inner.state.lock().current.clone()
    }

    pub fn on_change<F>(&self, listener: F)
    where
        F: Fn(Option<&str>) + Send + Sync + 'static,
    {
        self.inner.listeners.write().push(Arc::new(listener));
    }

    /// The hook the interception layer feeds response bodies into.
    pub fn observer(&self) -> Arc<dyn ExchangeObserver> {
        self.inner.clone()
    }

    /// Resolves the user once, then watches cookies, the user menu and a
    /// slow fallback timer until [`IdentityMonitor::stop`].
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        self.inner.check_for_user_change();
        let mutations = self.inner.page.document().observe();
        let (stop_tx, stop_rx) = unbounded();
        let inner = self.inner.clone();
        let handle = thread::spawn(move || inner.run(stop_rx, mutations));
        *worker = Some(Worker {
            stop: stop_tx,
            handle,
        });
        debug!("identity monitoring started");
    }

    pub fn stop(&self) {
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.stop.send(());
            let _ = worker.handle.join();
            debug!("identity monitoring stopped");
        }
    }

    pub fn check_for_user_change(&self) {
        self.inner.check_for_user_change();
    }

    pub fn check_cookies(&self) -> bool {
        self.inner.check_cookies()
    }

    pub fn process_response(&self, url: &str, body: &str) {
        self.inner.process_response(url, body);
    }
}

impl Drop for IdentityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ExchangeObserver for Inner {
    fn observe(&self, exchange: &Exchange) {
        if let Some(body) = exchange.body.as_deref() {
            self.process_response(&exchange.url, body);
        } else if exchange.url.contains("/logout") {
            self.process_response(&exchange.url, "");
        }
    }
}

impl Inner {
    fn run(&self, stop: Receiver<()>, mutations: Receiver<MutationRecord>) {
        let cookies = tick(self.timing.cookie_check);
        let fallback = tick(self.timing.identity_fallback_check);
        let mut mutations = mutations;
        let mut pending: Option<Instant> = None;
        let settle = self.timing.target_mutation_debounce;

        loop {
            let wait = pending
                .map(|at| at.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_secs(3600));
            select! {
                recv(stop) -> _ => break,
                recv(cookies) -> _ => {
                    if self.check_cookies() {
                        pending.get_or_insert_with(|| Instant::now() + settle);
                    }
                }
                recv(fallback) -> _ => self.check_for_user_change(),
                recv(mutations) -> msg => match msg {
                    Ok(record) => {
                        if self.touches_user_menu(&record) {
                            pending.get_or_insert_with(|| Instant::now() + settle);
                        }
                    }
                    Err(_) => mutations = never(),
                },
                default(wait) => {
                    if pending.take().is_some() {
                        self.check_for_user_change();
                    }
                }
            }
        }
    }

    fn touches_user_menu(&self, record: &MutationRecord) -> bool {
        let doc = self.page.document();
        match record {
            MutationRecord::ChildList { added, .. } => added.iter().any(|node| {
                USER_MENU.matches(&doc, *node) || doc.query(*node, &USER_MENU).is_some()
            }),
            MutationRecord::Attributes { target, name } => {
                matches!(name.as_str(), "class" | "data-testid" | "style")
                    && USER_MENU_ATTRS.matches(&doc, *target)
            }
            MutationRecord::CharacterData { .. } => false,
        }
    }

    fn dom_user(&self) -> Option<String> {
        let ttl = self.timing.identity_dom_cache;
        if let Some((user, at)) = &self.state.lock().dom_cache {
            if at.elapsed() < ttl {
                return Some(user.clone());
            }
        }
        let found = user_from_document(&self.page.document());
        if let Some(user) = &found {
            self.state.lock().dom_cache = Some((user.clone(), Instant::now()));
        }
        found
    }

    fn check_for_user_change(&self) {
        let found = self.dom_user();
        let changed = {
            let mut state = self.state.lock();
            if state.current == found {
                return;
            }
            if let Some(at) = state.last_change {
                if at.elapsed() < self.timing.identity_debounce {
                    debug!(from = ?state.current, to = ?found, "user change too rapid, ignoring");
                    return;
                }
            }
            match (&state.current, &found) {
                (Some(old), None) => {
                    info!(user = %old, "logout detected");
                    state.logout_detected = true;
                }
                (None, Some(new)) => {
                    info!(user = %new, "login detected");
                    state.logout_detected = false;
                }
                _ => {}
            }
            state.current = found.clone();
            state.last_change = Some(Instant::now());
            found
        };
        self.notify(changed.as_deref());
    }

    /// Compares the auth cookies with the last seen set. Returns whether they
    /// changed, in which case a user check should follow once the DOM settles.
    fn check_cookies(&self) -> bool {
        let cookie = self.page.cookie();
        if cookie.contains("session=deleted") || cookie.contains("PHPSESSID=deleted") {
            self.clear_user("cookie deletion");
        }
        let current = auth_cookies(&cookie);
        let mut state = self.state.lock();
        if current != state.auth_cookies {
            debug!("auth cookies changed");
            state.auth_cookies = current;
            return true;
        }
        false
    }

    fn process_response(&self, url: &str, body: &str) {
        if url.contains("/logout") {
            self.clear_user("logout endpoint");
            return;
        }
        let data: Value = match serde_json::from_str(body) {
            Ok(data) => data,
            Err(_) => return,
        };

        // Comment listings embed other users' objects; only the fixed
        // wrappers count as a positive identification there.
        if is_comment_api(url) {
            if let Some(user) = user_from_api_data(&data, false) {
                self.identify(user);
            }
            return;
        }

        if is_user_api(url) {
            let op_user_id = data.get("payload").and_then(|p| p.get("opUserId"));
            if op_user_id.and_then(Value::as_str) == Some("") {
                let signed_in = {
                    let state = self.state.lock();
                    state.current.is_some() && !state.logout_detected
                };
                if signed_in {
                    self.clear_user("empty opUserId");
                    return;
                }
            }
        }

        if let Some(user) = user_from_api_data(&data, true) {
            self.identify(user);
        }
    }

    fn identify(&self, user: String) {
        {
            let mut state = self.state.lock();
            if state.current.as_deref() == Some(user.as_str()) {
                return;
            }
            if let Some(at) = state.last_change {
                if at.elapsed() < self.timing.identity_debounce {
                    debug!(user = %user, "api identification too rapid, ignoring");
                    return;
                }
            }
            info!(user = %user, "user identified from api response");
            state.current = Some(user.clone());
            state.logout_detected = false;
            state.last_change = Some(Instant::now());
        }
        self.notify(Some(&user));
    }

    /// Logout bypasses the debounce.
    fn clear_user(&self, reason: &str) {
        {
            let mut state = self.state.lock();
            state.logout_detected = true;
            state.dom_cache = None;
            match state.current.take() {
                Some(old) => info!(user = %old, reason, "clearing user on logout"),
                None => return,
            }
            state.last_change = Some(Instant::now());
        }
        self.notify(None);
    }

    fn notify(&self, user: Option<&str>) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(user))).is_err() {
                warn!("user change listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::el;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn page_with_user(user: Option<&str>) -> Arc<Page> {
        let mut doc = Document::new();
        let body = doc.body();
        let mut header = el("header").class("top-nav");
        if let Some(user) = user {
            header = header.child(
                el("a")
                    .class("avatar-container")
                    .attr("href", &format!("/u/{user}")),
            );
        }
        doc.build(body, header);
        Arc::new(
            Page::builder("https://9gag.com/gag/aXYZ")
                .cookies("PHPSESSID=abc")
                .document(doc)
                .build()
                .unwrap(),
        )
    }

    fn monitor(page: Arc<Page>) -> (IdentityMonitor, Arc<Mutex<Vec<Option<String>>>>) {
        let monitor = IdentityMonitor::new(page, &TimingConfig::immediate());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        monitor.on_change(move |user| sink.lock().push(user.map(str::to_string)));
        (monitor, seen)
    }

    #[test]
    fn finds_user_in_page_chrome() {
        let page = page_with_user(Some("alice"));
        assert_eq!(user_from_document(&page.document()).as_deref(), Some("alice"));

        let mut doc = Document::new();
        let body = doc.body();
        doc.build(body, el("main").child(el("a").attr("href", "/u/stranger")));
        assert_eq!(user_from_document(&doc), None);
        doc.build(
            body,
            el("div")
                .class("user-menu")
                .child(el("a").attr("href", "/u/bob?ref=menu")),
        );
        assert_eq!(user_from_document(&doc).as_deref(), Some("bob"));
    }

    #[test]
    fn api_strategies_in_priority_order() {
        assert_eq!(
            user_from_api_data(&json!({"data": {"user": {"username": "a"}}}), true).as_deref(),
            Some("a")
        );
        assert_eq!(
            user_from_api_data(&json!({"meta": {"user": {"username": "m"}}}), false).as_deref(),
            Some("m")
        );
        let nested = json!({"x": {"y": {"profile": {"username": "deep"}}}});
        assert_eq!(user_from_api_data(&nested, true).as_deref(), Some("deep"));
        assert_eq!(user_from_api_data(&nested, false), None);
        let too_deep = json!({"a": {"b": {"c": {"d": {"e": {"username": "x"}}}}}});
        assert_eq!(user_from_api_data(&too_deep, true), None);
    }

    #[test]
    fn initial_check_emits_login() {
        let (monitor, seen) = monitor(page_with_user(Some("alice")));
        monitor.check_for_user_change();
        assert_eq!(monitor.current_user().as_deref(), Some("alice"));
        assert_eq!(*seen.lock(), vec![Some("alice".to_string())]);
        monitor.check_for_user_change();
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn rapid_changes_are_debounced() {
        let page = page_with_user(None);
        let mut timing = TimingConfig::immediate();
        timing.identity_debounce = Duration::from_secs(60);
        let monitor = IdentityMonitor::new(page, &timing);
        monitor.process_response("https://9gag.com/v1/user-info", r#"{"user":{"username":"alice"}}"#);
        assert_eq!(monitor.current_user().as_deref(), Some("alice"));
        monitor.process_response("https://9gag.com/v1/user-info", r#"{"user":{"username":"bob"}}"#);
        assert_eq!(monitor.current_user().as_deref(), Some("alice"));
    }

    #[test]
    fn logout_signals_clear_immediately() {
        let page = page_with_user(Some("alice"));
        let mut timing = TimingConfig::immediate();
        timing.identity_debounce = Duration::from_secs(60);
        let watcher = IdentityMonitor::new(page.clone(), &timing);
        watcher.check_for_user_change();
        page.set_cookie("PHPSESSID", "deleted");
        assert!(watcher.check_cookies());
        assert_eq!(watcher.current_user(), None);

        let (monitor, seen) = monitor(page_with_user(Some("alice")));
        monitor.check_for_user_change();
        monitor.process_response("https://9gag.com/logout", "");
        assert_eq!(*seen.lock(), vec![Some("alice".to_string()), None]);
    }

    #[test]
    fn empty_op_user_id_logs_out_only_on_user_apis() {
        let (monitor, _) = monitor(page_with_user(Some("alice")));
        monitor.check_for_user_change();
        let body = r#"{"payload":{"opUserId":""}}"#;
        monitor.process_response("https://comment-cdn.9gag.com/v2/comment-list.json", body);
        assert_eq!(monitor.current_user().as_deref(), Some("alice"));
        monitor.process_response("https://9gag.com/v1/user/me", body);
        assert_eq!(monitor.current_user(), None);
    }

    #[test]
    fn comment_listings_do_not_identify_commenters() {
        let (monitor, seen) = monitor(page_with_user(None));
        let listing = json!({"payload": {"comments": [{"user": {"username": "someone"}}]}});
        monitor.process_response(
            "https://comment-cdn.9gag.com/v2/cacheable/comment-list.json",
            &listing.to_string(),
        );
        assert_eq!(monitor.current_user(), None);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn background_loop_picks_up_menu_changes() {
        let page = page_with_user(None);
        let (monitor, seen) = monitor(page.clone());
        monitor.start();
        {
            let mut doc = page.document();
            let body = doc.body();
            doc.build(
                body,
                el("div")
                    .class("header-user")
                    .child(el("a").class("avatar-container").attr("href", "/u/carol")),
            );
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while monitor.current_user().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        monitor.stop();
        assert_eq!(monitor.current_user().as_deref(), Some("carol"));
        assert_eq!(*seen.lock(), vec![Some("carol".to_string())]);
    }
}
