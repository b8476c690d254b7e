use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use shadowcheck::acquire::ConfigError;
use shadowcheck::annotate::{HookRegistry, MARKED_CLASS, NEW_COMMENT_CLASS, SHADOWBANNED_CLASS, VISIBLE_CLASS};
use shadowcheck::api::NetworkConfig;
use shadowcheck::comments::find_comment_by_id;
use shadowcheck::config::{Config, MarkingKind, TimingConfig};
use shadowcheck::dispatch::Scheduler;
use shadowcheck::dom::{el, Document, ElementSpec, NodeId, Selector};
use shadowcheck::navigation::{ChangeDetails, ChangeKind, NavigationEvent, NavigationMonitor};
use shadowcheck::net::{HttpRequest, HttpResponse, MockFetch};
use shadowcheck::page::Page;
use shadowcheck::{Command, Engine, Extension};
use url::Url;

const POST_URL: &str = "https://9gag.com/gag/aXYZ";
const APP_ID: &str = "a_0123456789abcdef0123456789abcdef01234567";
const LIST_URL: &str = "https://comment-cdn.9gag.com/v2/cacheable/comment-list.json";
const ADD_URL: &str = "https://comment.9gag.com/v2/add-comment.json";

fn comment(id: &str, author: &str, reply: bool) -> ElementSpec {
    let class = if reply {
        "comment-item comment-item--child"
    } else {
        "comment-item"
    };
    el("div").class(class).child(
        el("div").class("ui-comment-header").child(
            el("div")
                .class("ui-comment-header__container")
                .child(
                    el("a")
                        .class("ui-comment-header__username")
                        .attr("href", &format!("/u/{author}"))
                        .text(author),
                )
                .child(
                    el("a")
                        .class("ui-comment-header__time")
                        .attr("href", &format!("/gag/aXYZ#cs_comment_id={id}"))
                        .text("1h"),
                ),
        ),
    )
}

fn thread_spec(top: (&str, &str), replies: &[(&str, &str)]) -> ElementSpec {
    let mut item = el("div")
        .class("comment-list-item")
        .child(comment(top.0, top.1, false));
    if !replies.is_empty() {
        let mut children = el("div").class("comment-list-item__replies");
        for (id, author) in replies {
            children = children.child(comment(id, author, true));
        }
        item = item.child(children);
    }
    item
}

/// A post page signed in as `alice` with the given threads rendered.
fn document(threads: &[((&str, &str), &[(&str, &str)])]) -> Document {
    let mut doc = Document::new();
    let body = doc.body();
    doc.build(
        body,
        el("header").child(el("a").attr("href", "/u/alice").text("alice")),
    );
    let list = doc.build(body, el("section").class("comment-list"));
    for (top, replies) in threads {
        doc.build(list, thread_spec(*top, replies));
    }
    doc
}

/// Serves the public comment listing from fixed id lists, paginated by the
/// `after` cursor and the requested `count`.
#[derive(Default, Clone)]
struct FakeApi {
    top_level: Vec<String>,
    replies: HashMap<String, Vec<String>>,
}

impl FakeApi {
    fn top_level(mut self, ids: &[&str]) -> Self {
        self.top_level = ids.iter().map(|id| id.to_string()).collect();
        self
    }

    fn thread(mut self, parent: &str, ids: &[&str]) -> Self {
        self.replies
            .insert(parent.to_string(), ids.iter().map(|id| id.to_string()).collect());
        self
    }

    fn respond(&self, request: &HttpRequest) -> anyhow::Result<HttpResponse> {
        let url = Url::parse(&request.url)?;
        if url.path().ends_with("add-comment.json") {
            return Ok(HttpResponse::json_ok(&json!({
                "status": "OK",
                "payload": {"comment": {"commentId": "c_900", "timestamp": 1_700_000_000}}
            })));
        }
        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let count: usize = query.get("count").and_then(|c| c.parse().ok()).unwrap_or(50);
        let (ids, level, parent) = match query.get("commentId") {
            Some(parent) => (
                self.replies.get(parent).cloned().unwrap_or_default(),
                2,
                Some(parent.clone()),
            ),
            None => (self.top_level.clone(), 1, None),
        };
        let start = match query.get("after") {
            Some(after) => ids.iter().position(|id| id == after).map(|i| i + 1).unwrap_or(ids.len()),
            None => 0,
        };
        let comments: Vec<Value> = ids
            .iter()
            .skip(start)
            .take(count)
            .map(|id| json!({"commentId": id, "level": level, "parentCommentId": parent}))
            .collect();
        Ok(HttpResponse::json_ok(
            &json!({"status": "OK", "payload": {"comments": comments}}),
        ))
    }

    fn into_fetch(self) -> Arc<MockFetch> {
        Arc::new(MockFetch::new(move |request| self.respond(request)))
    }
}

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.timing = TimingConfig::immediate();
    cfg.timing.config_timeout = Duration::from_secs(2);
    cfg
}

fn network() -> NetworkConfig {
    NetworkConfig {
        app_id: APP_ID.into(),
        client_version: "26.1/web".into(),
    }
}

struct Harness {
    page: Arc<Page>,
    fetch: Arc<MockFetch>,
    engine: Arc<Engine>,
    scheduler: Scheduler,
}

fn harness(doc: Document, api: FakeApi, cfg: Config) -> Harness {
    harness_with(doc, api.into_fetch(), cfg)
}

fn harness_with(doc: Document, fetch: Arc<MockFetch>, cfg: Config) -> Harness {
    let page = Arc::new(
        Page::builder(POST_URL)
            .document(doc)
            .fetch(fetch.clone())
            .build()
            .unwrap(),
    );
    let scheduler = Scheduler::new();
    let engine = Engine::new(
        page.clone(),
        &cfg,
        network(),
        fetch.clone(),
        HookRegistry::new(),
        scheduler.handle(),
    );
    engine.set_current_user(Some("alice".into()));
    Harness {
        page,
        fetch,
        engine,
        scheduler,
    }
}

impl Harness {
    fn node(&self, id: &str) -> NodeId {
        find_comment_by_id(&self.page.document(), id).expect("comment rendered")
    }

    fn has_class(&self, id: &str, class: &str) -> bool {
        let node = self.node(id);
        self.page.document().has_class(node, class)
    }

    fn badges(&self, id: &str) -> usize {
        let node = self.node(id);
        let doc = self.page.document();
        doc.query_all(node, &Selector::class_contains("-badge")).len()
    }

    fn settle(&self) {
        assert!(self.scheduler.handle().wait_idle(Duration::from_secs(5)));
    }
}

fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn comment_on_first_page_is_visible_after_one_call() {
    let h = harness(
        document(&[(("c_100", "alice"), &[]), (("c_101", "bob"), &[])]),
        FakeApi::default().top_level(&["c_099", "c_100", "c_101"]),
        test_config(),
    );
    h.engine.start();

    assert!(h.has_class("c_100", VISIBLE_CLASS));
    assert_eq!(h.badges("c_100"), 1);
    assert!(!h.has_class("c_101", MARKED_CLASS));
    assert_eq!(h.fetch.call_count(), 1);
    assert_eq!(h.engine.visibility("c_100"), Some(true));
}

#[test]
fn missing_comment_is_suppressed_after_early_termination() {
    let mut cfg = test_config();
    cfg.api.page_size = 2;
    cfg.search.early_termination_threshold = 5;
    cfg.search.max_pages_for_user_search = 50;
    let listing: Vec<String> = (0..40).map(|i| format!("c_{}", 1000 + i)).collect();
    let listing: Vec<&str> = listing.iter().map(String::as_str).collect();
    let h = harness(
        document(&[(("c_200", "alice"), &[])]),
        FakeApi::default().top_level(&listing),
        cfg,
    );
    h.engine.start();

    assert!(h.has_class("c_200", SHADOWBANNED_CLASS));
    assert_eq!(h.engine.visibility("c_200"), Some(false));
    assert_eq!(h.fetch.call_count(), 5);
}

/// Forty top-level ids, `c_1000` to `c_1039`.
fn long_listing() -> FakeApi {
    let ids: Vec<String> = (0..40).map(|i| format!("c_{}", 1000 + i)).collect();
    let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
    FakeApi::default().top_level(&ids)
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<parking_lot::Mutex<Vec<u8>>>);

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Runs `work` on this thread and returns the warnings it logged.
fn warnings_from<F: FnOnce()>(work: F) -> String {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .with_writer(move || writer.clone())
        .finish();
    tracing::subscriber::with_default(subscriber, work);
    let bytes = buffer.0.lock().clone();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[test]
fn unlimited_search_reads_past_every_cap() {
    let mut cfg = test_config();
    cfg.api.page_size = 2;
    cfg.search.max_pages_for_user_search = 3;
    cfg.search.early_termination_threshold = 2;
    cfg.search.unlimited = true;
    let h = harness(document(&[(("c_1030", "alice"), &[])]), long_listing(), cfg);
    h.engine.start();

    assert!(h.has_class("c_1030", VISIBLE_CLASS));
    assert_eq!(h.engine.visibility("c_1030"), Some(true));
    assert_eq!(h.fetch.calls_matching("level=1"), 16);
}

#[test]
fn bounded_search_stops_at_the_page_cap() {
    let mut cfg = test_config();
    cfg.api.page_size = 2;
    cfg.search.max_pages_for_user_search = 3;
    cfg.search.early_termination_threshold = 5;
    let h = harness(document(&[(("c_1030", "alice"), &[])]), long_listing(), cfg);
    let warnings = warnings_from(|| h.engine.start());

    assert!(h.has_class("c_1030", SHADOWBANNED_CLASS));
    assert_eq!(h.engine.visibility("c_1030"), Some(false));
    assert_eq!(h.fetch.calls_matching("level=1"), 3);
    assert!(warnings.contains("search was limited"), "{warnings}");
}

#[test]
fn transport_failure_falls_back_to_full_listing() {
    let api = FakeApi::default().top_level(&["c_099", "c_100"]);
    let failures = AtomicUsize::new(0);
    let fetch = Arc::new(MockFetch::new(move |request| {
        if request.url.contains("level=1") && failures.fetch_add(1, Ordering::SeqCst) == 0 {
            anyhow::bail!("connection reset by peer");
        }
        api.respond(request)
    }));
    let h = harness_with(
        document(&[(("c_100", "alice"), &[]), (("c_101", "alice"), &[])]),
        fetch,
        test_config(),
    );
    h.engine.start();

    assert_eq!(h.fetch.calls_matching("level=1"), 2);
    assert!(h.has_class("c_100", VISIBLE_CLASS));
    assert!(h.has_class("c_101", SHADOWBANNED_CLASS));
    assert!(h.engine.is_processed("c_100"));
    assert!(h.engine.is_processed("c_101"));
}

#[test]
fn aborted_search_runs_once_per_pass() {
    let mut cfg = test_config();
    cfg.api.page_size = 2;
    let api = FakeApi::default().top_level(&["c_1", "c_2", "c_3", "c_4", "c_5", "c_6", "c_7", "c_8"]);
    let fetch = Arc::new(MockFetch::new(move |request| {
        if request.url.contains("after=c_4") {
            return Ok(HttpResponse::new(503, ""));
        }
        api.respond(request)
    }));
    let h = harness_with(
        document(&[
            (("c_5", "alice"), &[]),
            (("c_6", "alice"), &[]),
            (("c_7", "alice"), &[]),
            (("c_8", "alice"), &[]),
        ]),
        fetch,
        cfg,
    );
    h.engine.start();

    assert_eq!(h.fetch.calls_matching("level=1"), 3);
    for id in ["c_5", "c_6", "c_7", "c_8"] {
        assert!(!h.has_class(id, MARKED_CLASS));
        assert!(!h.engine.is_processed(id));
    }

    // the next pass retries, again with a single search
    h.engine.reconcile_all();
    assert_eq!(h.fetch.calls_matching("level=1"), 6);
    assert_eq!(h.engine.visibility("c_5"), None);
}

#[test]
fn sibling_replies_share_one_thread_load() {
    let h = harness(
        document(&[(("c_300", "bob"), &[("c_301", "alice"), ("c_302", "alice")])]),
        FakeApi::default().thread("c_300", &["c_301", "c_303"]),
        test_config(),
    );
    h.engine.start();

    assert!(h.has_class("c_301", VISIBLE_CLASS));
    assert!(h.has_class("c_302", SHADOWBANNED_CLASS));
    assert_eq!(h.fetch.calls_matching("commentId=c_300"), 1);
    assert_eq!(h.fetch.calls_matching("level=1"), 0);
}

#[test]
fn reconciling_twice_changes_nothing() {
    let h = harness(
        document(&[(("c_100", "alice"), &[]), (("c_300", "bob"), &[("c_301", "alice")])]),
        FakeApi::default()
            .top_level(&["c_100", "c_300"])
            .thread("c_300", &["c_301"]),
        test_config(),
    );
    h.engine.start();
    let calls = h.fetch.call_count();
    let html = {
        let doc = h.page.document();
        doc.outer_html(doc.body())
    };

    h.engine.reconcile_all();
    h.engine.reprocess_all();
    h.settle();

    let again = {
        let doc = h.page.document();
        doc.outer_html(doc.body())
    };
    assert_eq!(again, html);
    assert_eq!(h.fetch.call_count(), calls);
    assert_eq!(h.badges("c_100"), 1);
    assert_eq!(h.badges("c_301"), 1);
}

#[test]
fn concurrent_loads_of_one_thread_share_a_request() {
    let api = FakeApi::default().thread("c_300", &["c_301"]);
    let fetch = Arc::new(
        MockFetch::new(move |request| api.respond(request)).with_latency(Duration::from_millis(150)),
    );
    let page = Arc::new(
        Page::builder(POST_URL)
            .document(document(&[]))
            .fetch(fetch.clone())
            .build()
            .unwrap(),
    );
    let scheduler = Scheduler::new();
    let engine = Engine::new(
        page,
        &test_config(),
        network(),
        fetch.clone(),
        HookRegistry::new(),
        scheduler.handle(),
    );

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let engine = engine.clone();
            thread::spawn(move || engine.load_reply_thread("c_300"))
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(fetch.calls_matching("commentId=c_300"), 1);
    assert_eq!(engine.metrics().snapshot().duplicate_requests_prevented, 1);
    assert_eq!(engine.check_visibility("c_301", Some("c_300")), Some(true));
}

#[test]
fn failed_search_leaves_comment_unresolved() {
    let fetch = Arc::new(MockFetch::new(|_| Ok(HttpResponse::new(503, ""))));
    let page = Arc::new(
        Page::builder(POST_URL)
            .document(document(&[(("c_100", "alice"), &[])]))
            .fetch(fetch.clone())
            .build()
            .unwrap(),
    );
    let scheduler = Scheduler::new();
    let engine = Engine::new(
        page.clone(),
        &test_config(),
        network(),
        fetch,
        HookRegistry::new(),
        scheduler.handle(),
    );
    engine.set_current_user(Some("alice".into()));
    engine.start();

    let node = find_comment_by_id(&page.document(), "c_100").unwrap();
    assert!(!page.document().has_class(node, MARKED_CLASS));
    assert_eq!(engine.visibility("c_100"), None);
    assert!(!engine.is_processed("c_100"));
}

#[test]
fn disabling_restores_original_markup() {
    let mut doc = document(&[(("c_100", "alice"), &[])]);
    let node = find_comment_by_id(&doc, "c_100").unwrap();
    doc.set_style(node, "border-left", "1px dotted blue");
    let original = doc.outer_html(node);

    let mut cfg = test_config();
    cfg.settings.visible_marking = MarkingKind::Border;
    let h = harness(doc, FakeApi::default().top_level(&["c_100"]), cfg);
    h.engine.start();
    assert_eq!(
        h.page.document().style(node, "border-left").as_deref(),
        Some("3px solid #4caf50")
    );

    h.engine.set_enabled(false);
    assert_eq!(h.page.document().outer_html(node), original);

    h.engine.set_enabled(true);
    h.settle();
    assert!(h.has_class("c_100", VISIBLE_CLASS));
}

#[test]
fn moving_to_another_post_drops_every_cache() {
    let mut cfg = test_config();
    // keep the follow-up pass for the new post out of the way
    cfg.timing.page_change_delay = Duration::from_secs(60);
    let h = harness(
        document(&[(("c_100", "alice"), &[])]),
        FakeApi::default().top_level(&["c_100"]),
        cfg,
    );
    h.engine.start();
    assert!(!h.engine.caches().is_empty());
    assert_eq!(h.engine.post_key().as_deref(), Some("aXYZ"));

    h.page.push_state("https://9gag.com/gag/bQRS").unwrap();
    h.engine.handle_navigation(&NavigationEvent {
        kind: ChangeKind::PageChange,
        details: ChangeDetails {
            old_url: Some(POST_URL.into()),
            new_url: Some("https://9gag.com/gag/bQRS".into()),
            ..ChangeDetails::default()
        },
    });

    assert_eq!(h.engine.post_key().as_deref(), Some("bQRS"));
    assert!(h.engine.caches().is_empty());
    assert!(!h.has_class("c_100", MARKED_CLASS));
    assert_eq!(h.badges("c_100"), 0);
}

#[test]
fn deep_link_event_reaches_a_late_listener_once() {
    let page = Arc::new(
        Page::builder("https://9gag.com/gag/aXYZ#cs_comment_id=c_5")
            .build()
            .unwrap(),
    );
    let monitor = NavigationMonitor::new(page, &TimingConfig::immediate());
    monitor.start();
    thread::sleep(Duration::from_millis(100));

    let fired = Arc::new(AtomicUsize::new(0));
    let target = Arc::new(parking_lot::Mutex::new(None));
    {
        let fired = fired.clone();
        let target = target.clone();
        monitor.on_change(move |event| {
            if event.kind == ChangeKind::CommentNavigation {
                fired.fetch_add(1, Ordering::SeqCst);
                *target.lock() = event.details.target_comment_id.clone();
            }
        });
    }
    thread::sleep(Duration::from_millis(100));
    monitor.stop();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(target.lock().as_deref(), Some("c_5"));
}

fn configured_page(doc: Document, fetch: Arc<MockFetch>, url: &str) -> Arc<Page> {
    Arc::new(
        Page::builder(url)
            .global(
                "_config",
                json!({"config": {"commentOptions": {"appId": APP_ID}, "appVersion": "26.1"}}),
            )
            .document(doc)
            .fetch(fetch)
            .build()
            .unwrap(),
    )
}

#[test]
fn missing_configuration_blocks_every_api_call() {
    let fetch = FakeApi::default().top_level(&["c_100"]).into_fetch();
    let page = Arc::new(
        Page::builder(POST_URL)
            .document(document(&[(("c_100", "alice"), &[])]))
            .fetch(fetch.clone())
            .build()
            .unwrap(),
    );
    let mut cfg = test_config();
    cfg.timing.config_timeout = Duration::from_millis(200);
    let extension = Extension::new(page, cfg, HookRegistry::new(), None);

    let err = extension.start().unwrap_err();
    assert!(matches!(err, ConfigError::Timeout(_)));
    assert!(extension.configuration_error().is_some());
    assert!(extension.engine().is_none());
    assert_eq!(fetch.calls_matching("comment-list"), 0);

    let reply = extension.handle(Command::Ping);
    assert_eq!(reply.initialized, Some(false));
    let reply = extension.handle(Command::SetEnabled {
        enabled: false,
        settings: None,
    });
    assert!(!reply.success);
    assert_eq!(reply.error.as_deref(), Some("Extension not initialized"));
}

#[test]
fn extension_marks_comments_and_follows_the_page() {
    let fetch = FakeApi::default()
        .top_level(&["c_100", "c_150", "c_300"])
        .thread("c_300", &["c_301"])
        .into_fetch();
    let page = configured_page(
        document(&[(("c_100", "alice"), &[]), (("c_300", "bob"), &[])]),
        fetch.clone(),
        POST_URL,
    );
    let extension = Extension::new(page.clone(), test_config(), HookRegistry::new(), None);
    extension.start().unwrap();
    let engine = extension.engine().unwrap();
    assert_eq!(engine.network(), &network());
    assert_eq!(engine.current_user().as_deref(), Some("alice"));

    let marked = |id: &str, class: &str| {
        let doc = page.document();
        find_comment_by_id(&doc, id)
            .map(|node| doc.has_class(node, class))
            .unwrap_or(false)
    };
    eventually("initial pass", || marked("c_100", VISIBLE_CLASS));

    // a thread rendered later is picked up by the mutation watcher
    {
        let mut doc = page.document();
        let list = doc.query(doc.body(), &Selector::class("comment-list")).unwrap();
        doc.build(list, thread_spec(("c_150", "alice"), &[]));
    }
    eventually("new thread", || marked("c_150", VISIBLE_CLASS));

    // the page loads a reply thread on its own
    let url = format!(
        "{LIST_URL}?appId={APP_ID}&count=10&level=2&commentId=c_300&url=x&origin=y"
    );
    page.fetch().get().fetch(&HttpRequest::get(url)).unwrap();
    eventually("captured replies", || {
        engine.caches().loaded_threads.contains("c_300")
    });

    assert!(extension.scheduler().wait_idle(Duration::from_secs(5)));
    let reply: Value = serde_json::from_str(
        &extension
            .handle_json(r#"{"action":"setEnabled","enabled":false}"#)
            .unwrap(),
    )
    .unwrap();
    assert_eq!(reply, json!({"success": true, "enabled": false}));
    assert!(!marked("c_100", MARKED_CLASS));

    extension.handle(Command::SetEnabled {
        enabled: true,
        settings: None,
    });
    eventually("re-enabled", || marked("c_100", VISIBLE_CLASS));

    let reply = extension.handle(Command::SettingsChanged {
        settings: json!({"visibleMarking": "highlight"}),
    });
    assert!(reply.success);
    eventually("highlight", || {
        let doc = page.document();
        let node = find_comment_by_id(&doc, "c_100").unwrap();
        doc.style(node, "background-color").as_deref() == Some("#1a2a1a")
    });

    let reply = extension.handle(Command::Ping);
    assert_eq!(reply.initialized, Some(true));
    extension.stop();
}

#[test]
fn signing_in_after_start_checks_comments() {
    let fetch = FakeApi::default().top_level(&["c_100"]).into_fetch();
    let mut doc = Document::new();
    let body = doc.body();
    let list = doc.build(body, el("section").class("comment-list"));
    doc.build(list, thread_spec(("c_100", "alice"), &[]));
    let page = configured_page(doc, fetch, POST_URL);
    let extension = Extension::new(page.clone(), test_config(), HookRegistry::new(), None);
    extension.start().unwrap();
    let engine = extension.engine().unwrap();
    assert!(extension.scheduler().wait_idle(Duration::from_secs(5)));
    assert_eq!(engine.current_user(), None);

    {
        let mut doc = page.document();
        let body = doc.body();
        doc.build(
            body,
            el("header").child(el("a").attr("href", "/u/alice").text("alice")),
        );
    }
    eventually("sign-in", || engine.current_user().as_deref() == Some("alice"));
    eventually("comments checked after sign-in", || {
        let doc = page.document();
        find_comment_by_id(&doc, "c_100")
            .map(|node| doc.has_class(node, VISIBLE_CLASS))
            .unwrap_or(false)
    });
    extension.stop();
}

#[test]
fn posted_comment_is_flagged_new() {
    let fetch = FakeApi::default().top_level(&["c_900"]).into_fetch();
    let page = configured_page(document(&[]), fetch, POST_URL);
    let extension = Extension::new(page.clone(), test_config(), HookRegistry::new(), None);
    extension.start().unwrap();

    {
        let mut doc = page.document();
        let list = doc.query(doc.body(), &Selector::class("comment-list")).unwrap();
        doc.build(list, thread_spec(("c_900", "alice"), &[]));
    }
    page.fetch()
        .get()
        .fetch(&HttpRequest::post(ADD_URL, "text=hello"))
        .unwrap();

    eventually("new comment flag", || {
        let doc = page.document();
        find_comment_by_id(&doc, "c_900")
            .map(|node| doc.has_class(node, NEW_COMMENT_CLASS))
            .unwrap_or(false)
    });
}

#[test]
fn settings_commands_are_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("config.yaml");
    let fetch = FakeApi::default().into_fetch();
    let page = configured_page(document(&[]), fetch, POST_URL);
    let extension = Extension::new(
        page,
        test_config(),
        HookRegistry::new(),
        Some(store.clone()),
    );
    extension.start().unwrap();

    let reply = extension.handle(Command::SettingsChanged {
        settings: json!({"shadowbannedBadgeText": "HIDDEN"}),
    });
    assert!(reply.success);
    let saved = shadowcheck::config::load(shadowcheck::config::LoadOptions {
        config_file: Some(store),
        env_prefix: Some("SHADOWCHECK_TEST_PERSIST".into()),
    })
    .unwrap();
    assert_eq!(saved.settings.shadowbanned_badge_text, "HIDDEN");

    let reply = extension.handle(Command::SettingsChanged {
        settings: json!({"visibleMarking": "sparkles"}),
    });
    assert!(!reply.success);
}
