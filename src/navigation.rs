//! Detects in-page navigation: hash changes, history moves and deep links to
//! a single comment.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{never, select, tick, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use crate::comments::{extract_comment_id_from, COMMENT_ID_PARAM};
use crate::config::TimingConfig;
use crate::page::{Page, PageEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    CommentNavigation,
    PageChange,
    HashChange,
    UrlChange,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeDetails {
    pub old_url: Option<String>,
    pub new_url: Option<String>,
    pub old_hash: String,
    pub new_hash: String,
    pub old_comment_id: Option<String>,
    pub target_comment_id: Option<String>,
    pub is_initial_load: bool,
    pub is_hash_change: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NavigationEvent {
    pub kind: ChangeKind,
    pub details: ChangeDetails,
}

pub type NavigationListener = Arc<dyn Fn(&NavigationEvent) + Send + Sync>;

/// Classifies a transition: a comment marker in the new hash wins, then a
/// path change, then a hash change.
pub fn classify(old_url: &str, new_url: &str, old_hash: &str, new_hash: &str) -> ChangeKind {
    if new_hash.contains(COMMENT_ID_PARAM) {
        return ChangeKind::CommentNavigation;
    }
    let path = |url: &str| Url::parse(url).map(|u| u.path().to_string()).ok();
    if path(old_url) != path(new_url) {
        return ChangeKind::PageChange;
    }
    if old_hash != new_hash {
        return ChangeKind::HashChange;
    }
    ChangeKind::UrlChange
}

fn hash_of(url: &str) -> String {
    match Url::parse(url).ok().and_then(|u| u.fragment().map(str::to_string)) {
        Some(fragment) if !fragment.is_empty() => format!("#{fragment}"),
        _ => String::new(),
    }
}

#[derive(Default)]
struct State {
    current_url: String,
    current_hash: String,
    listeners: Vec<NavigationListener>,
    pending: Vec<NavigationEvent>,
}

struct Inner {
    page: Arc<Page>,
    timing: TimingConfig,
    state: Mutex<State>,
}

struct Worker {
    stop: Sender<()>,
    handle: thread::JoinHandle<()>,
}

pub struct NavigationMonitor {
    inner: Arc<Inner>,
    worker: Mutex<Option<Worker>>,
}

impl NavigationMonitor {
    pub fn new(page: Arc<Page>, timing: &TimingConfig) -> Self {
        let state = State {
            current_url: page.href(),
            current_hash: page.hash(),
            ..State::default()
        };
        Self {
            inner: Arc::new(Inner {
                page,
                timing: timing.clone(),
                state: Mutex::new(state),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Registers a listener. The first listener also receives every event
    /// raised before anyone was listening.
    pub fn on_change<F>(&self, listener: F)
    where
        F: Fn(&NavigationEvent) + Send + Sync + 'static,
    {
        let listener: NavigationListener = Arc::new(listener);
        let queued = {
            let mut state = self.inner.state.lock();
            state.listeners.push(listener.clone());
            std::mem::take(&mut state.pending)
        };
        if !queued.is_empty() {
            debug!(count = queued.len(), "flushing queued navigation events");
        }
        for event in &queued {
            listener(event);
        }
    }

    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let hash = self.inner.page.hash();
        let deep_link = if hash.contains(COMMENT_ID_PARAM) {
            debug!(hash = %hash, "page loaded on a comment link");
            Some(Instant::now() + self.inner.timing.deep_link_settle)
        } else {
            None
        };
        let events = self.inner.page.events();
        let (stop_tx, stop_rx) = unbounded();
        let inner = self.inner.clone();
        let handle = thread::spawn(move || inner.run(stop_rx, events, deep_link, hash));
        *worker = Some(Worker {
            stop: stop_tx,
            handle,
        });
    }

    pub fn stop(&self) {
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.stop.send(());
            let _ = worker.handle.join();
        }
    }

    /// Compares the page location with the last one seen and emits the
    /// classified change, if any.
    pub fn check_now(&self) {
        self.inner.check_for_change();
    }
}

impl Drop for NavigationMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn run(
        &self,
        stop: Receiver<()>,
        events: Receiver<PageEvent>,
        deep_link: Option<Instant>,
        initial_hash: String,
    ) {
        let poll = tick(self.timing.navigation_poll);
        let mut events = events;
        let mut deep_link = deep_link;
        loop {
            let wait = deep_link
                .map(|at| at.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_secs(3600));
            select! {
                recv(stop) -> _ => break,
                recv(events) -> msg => match msg {
                    Ok(PageEvent::HashChange { old_url, new_url }) => {
                        self.handle_hash_change(&old_url, &new_url)
                    }
                    Ok(PageEvent::PopState) => self.check_for_change(),
                    Err(_) => events = never(),
                },
                recv(poll) -> _ => self.check_for_change(),
                default(wait) => {
                    if deep_link.take().is_some() {
                        self.emit(NavigationEvent {
                            kind: ChangeKind::CommentNavigation,
                            details: ChangeDetails {
                                new_hash: initial_hash.clone(),
                                target_comment_id: extract_comment_id_from(&initial_hash),
                                is_initial_load: true,
                                ..ChangeDetails::default()
                            },
                        });
                    }
                }
            }
        }
    }

    fn handle_hash_change(&self, old_url: &str, new_url: &str) {
        let old_hash = hash_of(old_url);
        let new_hash = hash_of(new_url);
        let old_comment_id = extract_comment_id_from(&old_hash);
        let target = extract_comment_id_from(&new_hash);

        let event = match (old_comment_id.is_some(), target.is_some()) {
            (_, true) => NavigationEvent {
                kind: ChangeKind::CommentNavigation,
                details: ChangeDetails {
                    old_hash,
                    new_hash: new_hash.clone(),
                    old_comment_id,
                    target_comment_id: target,
                    is_hash_change: true,
                    ..ChangeDetails::default()
                },
            },
            (true, false) => NavigationEvent {
                kind: ChangeKind::HashChange,
                details: ChangeDetails {
                    old_hash,
                    new_hash: new_hash.clone(),
                    old_comment_id,
                    ..ChangeDetails::default()
                },
            },
            // left for the poll to classify
            (false, false) => return,
        };
        {
            let mut state = self.state.lock();
            state.current_url = new_url.to_string();
            state.current_hash = new_hash;
        }
        self.emit(event);
    }

    fn check_for_change(&self) {
        let new_url = self.page.href();
        let new_hash = self.page.hash();
        let event = {
            let mut state = self.state.lock();
            if new_url == state.current_url && new_hash == state.current_hash {
                return;
            }
            let kind = classify(&state.current_url, &new_url, &state.current_hash, &new_hash);
            NavigationEvent {
                kind,
                details: ChangeDetails {
                    old_url: Some(std::mem::replace(&mut state.current_url, new_url.clone())),
                    new_url: Some(new_url),
                    old_hash: std::mem::replace(&mut state.current_hash, new_hash.clone()),
                    target_comment_id: extract_comment_id_from(&new_hash),
                    new_hash,
                    ..ChangeDetails::default()
                },
            }
        };
        debug!(kind = ?event.kind, "url change detected");
        self.emit(event);
    }

    fn emit(&self, event: NavigationEvent) {
        let listeners = {
            let mut state = self.state.lock();
            if state.listeners.is_empty() {
                debug!(kind = ?event.kind, "no navigation listeners yet, queuing");
                state.pending.push(event);
                return;
            }
            state.listeners.clone()
        };
        for listener in listeners {
            let call = std::panic::AssertUnwindSafe(|| listener(&event));
            if std::panic::catch_unwind(call).is_err() {
                warn!("navigation listener panicked");
            }
        }
    }
}
