//! Comment visibility reconciliation.
//!
//! A comment of the signed-in user is visible when the public listing API
//! returns it, and suppressed when a completed search of the listing does
//! not. Listings are cached per post: the set of known top-level ids, the
//! reply ids per parent thread, and the verdict per comment id.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::annotate::{Annotator, HookRegistry};
use crate::api::{ApiComment, ApiError, CommentApi, CommentListResponse, ListQuery, NetworkConfig, NewComment};
use crate::comments::{self, CommentElement, PageType};
use crate::config::{Config, SearchConfig, Settings, TimingConfig};
use crate::dispatch::SchedulerHandle;
use crate::dom::NodeId;
use crate::metrics::Metrics;
use crate::navigation::{ChangeKind, NavigationEvent};
use crate::net::Fetch;
use crate::page::Page;

const REPLY_FOLLOWUP_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Visible,
    Suppressed,
    /// The search that would decide it was cut short by an API error.
    Unresolved,
}

impl From<Option<bool>> for Verdict {
    fn from(visible: Option<bool>) -> Self {
        match visible {
            Some(true) => Verdict::Visible,
            Some(false) => Verdict::Suppressed,
            None => Verdict::Unresolved,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::Visible => "visible",
            Verdict::Suppressed => "suppressed",
            Verdict::Unresolved => "unresolved",
        })
    }
}

/// A comment to look up without a document: `c_123` or `c_124@c_123` for a
/// reply under `c_123`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentTarget {
    pub comment_id: String,
    pub parent_id: Option<String>,
}

impl FromStr for CommentTarget {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let (id, parent) = match raw.split_once('@') {
            Some((id, parent)) => (id.trim(), Some(parent.trim())),
            None => (raw.trim(), None),
        };
        if id.is_empty() || parent == Some("") {
            bail!("invalid comment target {raw:?}, expected <id> or <id>@<parent-id>");
        }
        Ok(Self {
            comment_id: id.to_string(),
            parent_id: parent.map(str::to_string),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub comment_id: String,
    pub parent_id: Option<String>,
    pub verdict: Verdict,
}

/// How a paginated search ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    /// Ran to the end of the listing or to a configured page limit.
    Completed,
    /// Stopped by an API error; only what was seen so far was kept.
    Aborted,
}

/// Owned copy of the caches, ordered for comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSnapshot {
    pub top_level: BTreeSet<String>,
    pub reply_threads: BTreeMap<String, BTreeSet<String>>,
    pub loaded_threads: BTreeSet<String>,
    pub visibility: BTreeMap<String, bool>,
    pub processed: BTreeSet<String>,
}

impl CacheSnapshot {
    pub fn is_empty(&self) -> bool {
        self.top_level.is_empty()
            && self.reply_threads.is_empty()
            && self.loaded_threads.is_empty()
            && self.visibility.is_empty()
            && self.processed.is_empty()
    }
}

enum Flow {
    Continue,
    Stop,
}

struct Pages {
    fetched: usize,
    hit_limit: bool,
}

#[derive(Default)]
struct State {
    enabled: bool,
    current_user: Option<String>,
    post_key: Option<String>,
    page_type: Option<PageType>,
    target_comment_id: Option<String>,
    top_level: HashSet<String>,
    /// Ids a completed top-level search looked for.
    searched: HashSet<String>,
    replies: HashMap<String, HashSet<String>>,
    loaded_threads: HashSet<String>,
    visibility: HashMap<String, bool>,
    processed: HashSet<String>,
    /// Bumped whenever the caches are invalidated; results of searches that
    /// started under an older generation are discarded.
    generation: u64,
    /// Nesting depth of running passes, see [`Engine::pass`].
    pass_depth: usize,
    /// A top-level search aborted during the running pass. Unresolved
    /// top-level comments wait for the next pass instead of searching again.
    top_level_aborted: bool,
}

impl State {
    fn invalidate(&mut self) {
        self.top_level.clear();
        self.searched.clear();
        self.replies.clear();
        self.loaded_threads.clear();
        self.visibility.clear();
        self.processed.clear();
        self.generation += 1;
    }

    fn top_level_membership(&self, comment_id: &str) -> Option<bool> {
        if self.top_level.contains(comment_id) {
            Some(true)
        } else if self.searched.contains(comment_id) {
            Some(false)
        } else {
            None
        }
    }

    fn end_pass(&mut self) {
        self.pass_depth = self.pass_depth.saturating_sub(1);
        if self.pass_depth == 0 {
            self.top_level_aborted = false;
        }
    }

    fn reply_membership(&self, comment_id: &str, parent_id: &str) -> Option<bool> {
        if self
            .replies
            .get(parent_id)
            .map(|ids| ids.contains(comment_id))
            .unwrap_or(false)
        {
            Some(true)
        } else if self.loaded_threads.contains(parent_id) {
            Some(false)
        } else {
            None
        }
    }
}

/// Scope of one reconciliation pass. Passes nest; the abort flag is
/// cleared when the outermost one ends.
struct Pass<'a> {
    state: &'a Mutex<State>,
}

impl Drop for Pass<'_> {
    fn drop(&mut self) {
        self.state.lock().end_pass();
    }
}

/// One instance per page view. Operations are safe to call from any thread
/// but are normally driven from the scheduler's single worker; no lock is
/// held across an API call.
pub struct Engine {
    me: Weak<Engine>,
    page: Arc<Page>,
    api: CommentApi,
    search: SearchConfig,
    timing: TimingConfig,
    annotator: Mutex<Annotator>,
    state: Mutex<State>,
    metrics: Arc<Metrics>,
    scheduler: SchedulerHandle,
}

impl Engine {
    pub fn new(
        page: Arc<Page>,
        config: &Config,
        network: NetworkConfig,
        fetch: Arc<dyn Fetch>,
        hooks: HookRegistry,
        scheduler: SchedulerHandle,
    ) -> Arc<Self> {
        let metrics = Arc::new(Metrics::default());
        let api = CommentApi::new(
            fetch,
            config.api.clone(),
            &config.search,
            config.timing.gate_poll,
            network,
            metrics.clone(),
        );
        let state = State {
            enabled: config.settings.enabled,
            post_key: comments::post_key(&page.pathname()),
            ..State::default()
        };
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            page,
            api,
            search: config.search.clone(),
            timing: config.timing.clone(),
            annotator: Mutex::new(Annotator::new(config.settings.clone(), hooks)),
            state: Mutex::new(state),
            metrics,
            scheduler,
        })
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn network(&self) -> &NetworkConfig {
        self.api.network()
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub fn current_user(&self) -> Option<String> {
        self.state.lock().current_user.clone()
    }

    /// Sets the user without the login/logout side effects of
    /// [`Engine::handle_user_change`].
    pub fn set_current_user(&self, user: Option<String>) {
        self.state.lock().current_user = user;
    }

    pub fn post_key(&self) -> Option<String> {
        self.state.lock().post_key.clone()
    }

    pub fn page_type(&self) -> Option<PageType> {
        self.state.lock().page_type
    }

    pub fn target_comment_id(&self) -> Option<String> {
        self.state.lock().target_comment_id.clone()
    }

    pub fn settings(&self) -> Settings {
        self.annotator.lock().settings().clone()
    }

    pub fn visibility(&self, comment_id: &str) -> Option<bool> {
        self.state.lock().visibility.get(comment_id).copied()
    }

    pub fn is_processed(&self, comment_id: &str) -> bool {
        self.state.lock().processed.contains(comment_id)
    }

    pub fn caches(&self) -> CacheSnapshot {
        let state = self.state.lock();
        CacheSnapshot {
            top_level: state.top_level.iter().cloned().collect(),
            reply_threads: state
                .replies
                .iter()
                .map(|(parent, ids)| (parent.clone(), ids.iter().cloned().collect()))
                .collect(),
            loaded_threads: state.loaded_threads.iter().cloned().collect(),
            visibility: state
                .visibility
                .iter()
                .map(|(id, visible)| (id.clone(), *visible))
                .collect(),
            processed: state.processed.iter().cloned().collect(),
        }
    }

    fn pass(&self) -> Pass<'_> {
        self.state.lock().pass_depth += 1;
        Pass { state: &self.state }
    }

    fn schedule<F>(&self, delay: Duration, job: F)
    where
        F: FnOnce(&Engine) + Send + 'static,
    {
        let me = self.me.clone();
        self.scheduler.post_after(delay, move || {
            if let Some(engine) = me.upgrade() {
                job(&engine);
            }
        });
    }

    /// Initial pass for the current page.
    pub fn start(&self) {
        let pathname = self.page.pathname();
        if !comments::is_post_page(&pathname) {
            info!(url = %self.page.href(), "not a post page, skipping");
            return;
        }
        let Some(post_key) = comments::post_key(&pathname) else {
            error!(pathname = %pathname, "could not extract post key");
            return;
        };
        {
            let mut state = self.state.lock();
            if state.post_key.as_deref() != Some(post_key.as_str()) {
                state.invalidate();
                state.post_key = Some(post_key.clone());
            }
        }
        self.identify_page_type();

        if self.current_user().is_none() {
            info!("no signed-in user, waiting for login before checking comments");
            return;
        }
        info!(post_key = %post_key, page_type = ?self.page_type(), "checking comments");
        self.optimized_pass();

        if let Some(target) = self.target_comment_id() {
            self.schedule_target_retries(target, false);
        }
    }

    fn identify_page_type(&self) {
        let hash = self.page.hash();
        let page_type = comments::page_type(&hash);
        let mut state = self.state.lock();
        state.page_type = Some(page_type);
        if page_type == PageType::Comment {
            state.target_comment_id = comments::extract_comment_id_from(&hash);
        }
    }

    fn post_context(&self) -> Option<(String, u64)> {
        let state = self.state.lock();
        match &state.post_key {
            Some(key) => Some((key.clone(), state.generation)),
            None => {
                warn!("no post key, cannot query comments");
                None
            }
        }
    }

    /// Applies `update` unless the caches were invalidated since `generation`.
    fn commit<F>(&self, generation: u64, update: F) -> bool
    where
        F: FnOnce(&mut State),
    {
        let mut state = self.state.lock();
        if state.generation != generation {
            debug!("post changed during search, discarding results");
            return false;
        }
        update(&mut state);
        true
    }

    fn page_limit(&self, bounded: usize) -> Option<usize> {
        if self.search.unlimited {
            None
        } else {
            Some(bounded)
        }
    }

    /// Walks the listing with the last id of each page as the next cursor
    /// until the listing runs out, `on_page` stops it, or `limit` pages were
    /// fetched.
    fn paginate<F>(
        &self,
        post_key: &str,
        parent: Option<&str>,
        limit: Option<usize>,
        delay: Duration,
        mut on_page: F,
    ) -> Result<Pages, ApiError>
    where
        F: FnMut(&[ApiComment]) -> Flow,
    {
        let mut after: Option<String> = None;
        let mut fetched = 0;
        loop {
            if limit.map(|limit| fetched >= limit).unwrap_or(false) {
                return Ok(Pages {
                    fetched,
                    hit_limit: true,
                });
            }
            let query = match parent {
                Some(parent) => ListQuery::replies(parent, after.as_deref()),
                None => ListQuery::top_level(after.as_deref()),
            };
            let url = self.api.list_url(post_key, &query);
            trace!(page = fetched + 1, url = %url, "loading comment page");
            let response = self.api.list(&url)?;
            fetched += 1;

            let Some(comments) = response.comments() else {
                return Ok(Pages {
                    fetched,
                    hit_limit: false,
                });
            };
            let flow = on_page(comments);
            let full_page = comments.len() >= self.api.page_size();
            after = comments.last().and_then(|last| last.comment_id.clone());
            if matches!(flow, Flow::Stop) || !full_page || after.is_none() {
                return Ok(Pages {
                    fetched,
                    hit_limit: false,
                });
            }
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }
    }

    /// Pages through the top-level listing looking only for `comment_ids`.
    /// Ids still missing when a search completes count as suppressed.
    pub fn load_specific_top_level(&self, comment_ids: &[String]) -> SearchOutcome {
        let targets: HashSet<&str> = comment_ids.iter().map(String::as_str).collect();
        if targets.is_empty() {
            return SearchOutcome::Completed;
        }
        let Some((post_key, generation)) = self.post_context() else {
            return SearchOutcome::Aborted;
        };
        debug!(targets = targets.len(), "searching top-level comments");

        let threshold = if self.search.unlimited {
            None
        } else {
            Some(self.search.early_termination_threshold.max(1))
        };
        let mut seen: Vec<String> = Vec::new();
        let mut found: HashSet<String> = HashSet::new();
        let mut empty_streak = 0;
        let result = self.paginate(
            &post_key,
            None,
            self.page_limit(self.search.max_pages_for_user_search),
            self.timing.user_comment_api_delay,
            |comments| {
                let mut hits = 0;
                for id in comments.iter().filter_map(|c| c.comment_id.as_deref()) {
                    if targets.contains(id) && found.insert(id.to_string()) {
                        debug!(comment_id = %id, "found target comment");
                        hits += 1;
                    }
                    seen.push(id.to_string());
                }
                if found.len() == targets.len() {
                    return Flow::Stop;
                }
                if let Some(threshold) = threshold {
                    if hits == 0 {
                        empty_streak += 1;
                        if empty_streak >= threshold {
                            debug!(pages = empty_streak, "early termination, no targets in recent pages");
                            return Flow::Stop;
                        }
                    } else {
                        empty_streak = 0;
                    }
                }
                Flow::Continue
            },
        );

        let missing: Vec<&str> = targets
            .iter()
            .copied()
            .filter(|id| !found.contains(*id))
            .collect();
        match result {
            Ok(pages) => {
                self.commit(generation, |state| {
                    state.top_level.extend(seen);
                    state.searched.extend(targets.iter().map(|id| id.to_string()));
                });
                if !missing.is_empty() {
                    info!(missing = ?missing, "comments not in public listing");
                    if pages.hit_limit {
                        warn!(
                            pages = pages.fetched,
                            "search was limited, comments on later pages read as suppressed"
                        );
                    }
                }
                debug!(found = found.len(), targets = targets.len(), pages = pages.fetched, "top-level search done");
                SearchOutcome::Completed
            }
            Err(ApiError::Transport(err)) => {
                warn!(error = %err, "targeted search failed, falling back to full listing");
                self.commit(generation, |state| state.top_level.extend(seen));
                let outcome = self.load_all_top_level();
                if outcome == SearchOutcome::Completed {
                    self.commit(generation, |state| {
                        state.searched.extend(targets.iter().map(|id| id.to_string()))
                    });
                } else {
                    self.state.lock().top_level_aborted = true;
                }
                outcome
            }
            Err(err) => {
                warn!(error = %err, "top-level search aborted");
                self.commit(generation, |state| {
                    state.top_level.extend(seen);
                    state.top_level_aborted = true;
                });
                SearchOutcome::Aborted
            }
        }
    }

    /// Exhaustive variant: records every top-level id up to the page cap.
    pub fn load_all_top_level(&self) -> SearchOutcome {
        let Some((post_key, generation)) = self.post_context() else {
            return SearchOutcome::Aborted;
        };
        let mut seen: Vec<String> = Vec::new();
        let result = self.paginate(
            &post_key,
            None,
            self.page_limit(self.search.max_pages),
            self.timing.api_delay,
            |comments| {
                seen.extend(comments.iter().filter_map(|c| c.comment_id.clone()));
                Flow::Continue
            },
        );
        let total = seen.len();
        self.commit(generation, |state| state.top_level.extend(seen));
        match result {
            Ok(pages) => {
                if pages.hit_limit {
                    warn!(pages = pages.fetched, "full listing was limited, later pages not loaded");
                }
                info!(comments = total, pages = pages.fetched, "loaded top-level comments");
                SearchOutcome::Completed
            }
            Err(err) => {
                warn!(error = %err, comments = total, "loading top-level comments aborted");
                SearchOutcome::Aborted
            }
        }
    }

    /// Loads every reply under `parent_id`, at most once per post view.
    pub fn load_reply_thread(&self, parent_id: &str) -> SearchOutcome {
        if self.state.lock().loaded_threads.contains(parent_id) {
            trace!(parent = %parent_id, "reply thread already loaded");
            return SearchOutcome::Completed;
        }
        let Some((post_key, generation)) = self.post_context() else {
            return SearchOutcome::Aborted;
        };
        let mut ids: Vec<String> = Vec::new();
        let result = self.paginate(
            &post_key,
            Some(parent_id),
            self.page_limit(self.search.max_pages),
            self.timing.api_delay,
            |comments| {
                ids.extend(comments.iter().filter_map(|c| c.comment_id.clone()));
                Flow::Continue
            },
        );
        let total = ids.len();
        let completed = result.is_ok();
        self.commit(generation, |state| {
            state
                .replies
                .entry(parent_id.to_string())
                .or_default()
                .extend(ids);
            if completed {
                state.loaded_threads.insert(parent_id.to_string());
            }
        });
        match result {
            Ok(pages) => {
                if pages.hit_limit {
                    warn!(parent = %parent_id, pages = pages.fetched, "reply search was limited");
                }
                debug!(parent = %parent_id, replies = total, pages = pages.fetched, "loaded reply thread");
                SearchOutcome::Completed
            }
            Err(err) => {
                warn!(parent = %parent_id, error = %err, "loading reply thread aborted");
                SearchOutcome::Aborted
            }
        }
    }

    fn remember(&self, comment_id: &str, visible: bool) -> bool {
        self.state
            .lock()
            .visibility
            .insert(comment_id.to_string(), visible);
        visible
    }

    /// Visibility of one comment; replies pass their parent's id. `None`
    /// when the deciding search was aborted.
    pub fn check_visibility(&self, comment_id: &str, parent_id: Option<&str>) -> Option<bool> {
        let _pass = self.pass();
        if let Some(visible) = self.visibility(comment_id) {
            return Some(visible);
        }
        let visible = match parent_id {
            Some(parent) => {
                let known = self.state.lock().reply_membership(comment_id, parent);
                match known {
                    Some(visible) => Some(visible),
                    None => {
                        self.load_reply_thread(parent);
                        self.state.lock().reply_membership(comment_id, parent)
                    }
                }
            }
            None => {
                let (known, aborted) = {
                    let state = self.state.lock();
                    (state.top_level_membership(comment_id), state.top_level_aborted)
                };
                match known {
                    Some(visible) => Some(visible),
                    None if aborted => {
                        trace!(comment_id = %comment_id, "top-level search already failed in this pass");
                        None
                    }
                    None => {
                        self.load_specific_top_level(&[comment_id.to_string()]);
                        self.state.lock().top_level_membership(comment_id)
                    }
                }
            }
        };
        match visible {
            Some(visible) => {
                debug!(comment_id = %comment_id, visible, "visibility resolved");
                Some(self.remember(comment_id, visible))
            }
            None => {
                debug!(comment_id = %comment_id, "visibility unresolved");
                None
            }
        }
    }

    /// Reconciles one rendered comment. Returns the verdict when the comment
    /// was newly processed.
    pub fn process_comment(&self, node: NodeId) -> Option<bool> {
        let _pass = self.pass();
        let comment = {
            let doc = self.page.document();
            CommentElement::read(&doc, node)
        };
        self.metrics.comment_processed();

        let user = self.current_user()?;
        if comment.author.as_deref() != Some(user.as_str()) {
            return None;
        }
        self.metrics.user_comment_found();

        let Some(comment_id) = comment.comment_id else {
            warn!("could not extract comment id from element");
            return None;
        };
        if self.is_processed(&comment_id) {
            trace!(comment_id = %comment_id, "already processed");
            return None;
        }
        info!(comment_id = %comment_id, reply = comment.is_reply, "processing user comment");

        let parent = if comment.is_reply {
            let parent = {
                let doc = self.page.document();
                comments::find_parent_comment_id(&doc, node)
            };
            match parent {
                Some(parent) => {
                    self.load_reply_thread(&parent);
                    Some(parent)
                }
                None => {
                    warn!(comment_id = %comment_id, "could not find parent of reply");
                    return None;
                }
            }
        } else {
            None
        };

        let visible = self.check_visibility(&comment_id, parent.as_deref())?;
        if !visible {
            self.metrics.suppressed_comment_found();
        }
        if self.is_enabled() {
            self.annotate(node, &comment_id, visible);
        }
        self.state.lock().processed.insert(comment_id);
        Some(visible)
    }

    fn annotate(&self, node: NodeId, comment_id: &str, visible: bool) {
        let mut doc = self.page.document();
        let node = if doc.is_connected(node) {
            node
        } else {
            match comments::find_comment_by_id(&doc, comment_id) {
                Some(node) => node,
                None => {
                    debug!(comment_id = %comment_id, "comment left the document before marking");
                    return;
                }
            }
        };
        if let Err(err) = self.annotator.lock().apply(&mut doc, node, visible) {
            debug!(comment_id = %comment_id, error = %err, "marked with fallback");
        }
    }

    fn reconcile_nodes(&self, only_unprocessed: bool) {
        let _pass = self.pass();
        let nodes: Vec<(NodeId, Option<String>)> = {
            let doc = self.page.document();
            comments::find_all_comments(&doc)
                .into_iter()
                .map(|node| (node, comments::extract_comment_id(&doc, node)))
                .collect()
        };
        if nodes.is_empty() {
            debug!("no comments in the document yet");
            return;
        }
        for (node, comment_id) in nodes {
            if only_unprocessed {
                match comment_id {
                    Some(id) if !self.is_processed(&id) => {}
                    _ => continue,
                }
            }
            self.process_comment(node);
        }
    }

    /// Reconciles every comment in the document.
    pub fn reconcile_all(&self) {
        self.reconcile_nodes(false);
    }

    /// Finds the user's comments first, loads what they need in as few
    /// searches as possible, then reconciles them.
    pub fn optimized_pass(&self) {
        let _pass = self.pass();
        let Some(user) = self.current_user() else {
            debug!("no signed-in user, skipping pass");
            return;
        };
        let (top_level, replies) = {
            let doc = self.page.document();
            let mut top_level: Vec<(NodeId, String)> = Vec::new();
            let mut replies: Vec<(NodeId, String)> = Vec::new();
            for comment in comments::find_user_comments(&doc, &user) {
                let Some(id) = comment.comment_id else { continue };
                if comment.is_reply {
                    if let Some(parent) = comments::find_parent_comment_id(&doc, comment.node) {
                        replies.push((comment.node, parent));
                    }
                } else {
                    top_level.push((comment.node, id));
                }
            }
            (top_level, replies)
        };
        if top_level.is_empty() && replies.is_empty() {
            info!("no comments by the signed-in user in the document");
            self.metrics.log_summary();
            return;
        }

        let pending: Vec<String> = {
            let state = self.state.lock();
            top_level
                .iter()
                .map(|(_, id)| id)
                .filter(|id| {
                    !state.visibility.contains_key(*id)
                        && state.top_level_membership(id).is_none()
                })
                .cloned()
                .collect()
        };
        if !pending.is_empty() {
            self.load_specific_top_level(&pending);
        }
        let parents: BTreeSet<&str> = replies.iter().map(|(_, parent)| parent.as_str()).collect();
        for parent in &parents {
            self.load_reply_thread(parent);
        }
        info!(
            top_level = top_level.len(),
            replies = replies.len(),
            threads = parents.len(),
            "prefetched listings for user comments"
        );

        for node in top_level
            .iter()
            .map(|(node, _)| *node)
            .chain(replies.iter().map(|(node, _)| *node))
        {
            self.process_comment(node);
        }
        self.metrics.log_summary();
    }

    /// Document-free lookup, used by the command line.
    pub fn resolve(&self, targets: &[CommentTarget]) -> Vec<Resolution> {
        let _pass = self.pass();
        let top_level: Vec<String> = targets
            .iter()
            .filter(|target| target.parent_id.is_none())
            .map(|target| target.comment_id.clone())
            .collect();
        if !top_level.is_empty() {
            self.load_specific_top_level(&top_level);
        }
        let parents: BTreeSet<&str> = targets
            .iter()
            .filter_map(|target| target.parent_id.as_deref())
            .collect();
        for parent in parents {
            self.load_reply_thread(parent);
        }
        targets
            .iter()
            .map(|target| Resolution {
                comment_id: target.comment_id.clone(),
                parent_id: target.parent_id.clone(),
                verdict: self
                    .check_visibility(&target.comment_id, target.parent_id.as_deref())
                    .into(),
            })
            .collect()
    }

    /// Folds a comment listing the page fetched on its own into the caches,
    /// then reconciles whatever it rendered.
    pub fn handle_list_capture(&self, url: &str, response: &CommentListResponse) {
        if let Some(comments) = response.comments() {
            let mut state = self.state.lock();
            for comment in comments {
                let Some(id) = comment.comment_id.clone() else { continue };
                match (comment.level, comment.parent_comment_id.as_ref()) {
                    (Some(1), _) => {
                        state.top_level.insert(id);
                    }
                    (Some(2), Some(parent)) => {
                        state.replies.entry(parent.clone()).or_default().insert(id);
                    }
                    _ => {}
                }
            }
            debug!(comments = comments.len(), "captured comment listing");
        }

        if let Some(parent) = reply_thread_parent(url) {
            if !self.state.lock().loaded_threads.contains(&parent) {
                debug!(parent = %parent, "page is loading a reply thread");
                self.schedule(REPLY_FOLLOWUP_DELAY, move |engine| {
                    engine.load_reply_thread(&parent);
                });
            }
        }

        self.schedule(self.timing.dom_update_delay, |engine| {
            if engine.is_enabled() {
                engine.reconcile_nodes(true);
            }
        });
    }

    /// Flags a comment the user just posted, retrying once if it is not
    /// rendered yet.
    pub fn handle_new_comment(&self, comment: &NewComment) {
        if !self.is_enabled() {
            debug!("disabled, skipping new comment");
            return;
        }
        let Some(comment_id) = comment.comment_id.clone() else {
            warn!("new comment response without comment id");
            return;
        };
        let timestamp = comment.timestamp;
        if self.flag_new_comment(&comment_id, timestamp) {
            return;
        }
        warn!(comment_id = %comment_id, "new comment not rendered yet, retrying");
        self.schedule(self.timing.retry_delay, move |engine| {
            if !engine.flag_new_comment(&comment_id, timestamp) {
                warn!(comment_id = %comment_id, "new comment still not rendered, giving up");
            }
        });
    }

    fn flag_new_comment(&self, comment_id: &str, timestamp: Option<i64>) -> bool {
        let mut doc = self.page.document();
        let Some(node) = comments::find_comment_by_id(&doc, comment_id) else {
            return false;
        };
        let (timestamp, created_at) = creation_time(timestamp);
        self.annotator
            .lock()
            .flag_new_comment(&mut doc, node, comment_id, timestamp, &created_at);
        info!(comment_id = %comment_id, "flagged new comment");
        true
    }

    pub fn remove_all_indicators(&self) {
        let mut doc = self.page.document();
        self.annotator.lock().remove_all_indicators(&mut doc);
    }

    /// Turning off removes every marking; turning on refreshes the listings
    /// and runs a new pass shortly after.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.state.lock().enabled = enabled;
        if enabled {
            info!("enabled, refreshing");
            self.schedule(self.timing.reenable_delay, |engine| engine.refresh());
        } else {
            self.remove_all_indicators();
            info!("disabled, removed all indicators");
        }
        enabled
    }

    fn refresh(&self) {
        let _pass = self.pass();
        let (ready, page_type, target) = {
            let state = self.state.lock();
            (
                state.current_user.is_some() && state.post_key.is_some(),
                state.page_type,
                state.target_comment_id.clone(),
            )
        };
        if !ready {
            debug!("missing user or post, starting over");
            self.start();
            return;
        }
        self.state.lock().processed.clear();
        match (page_type, target) {
            (Some(PageType::Comment), Some(target)) => {
                let parent = self.parent_of_target(&target);
                {
                    let mut state = self.state.lock();
                    state.replies.remove(&parent);
                    state.loaded_threads.remove(&parent);
                }
                self.load_reply_thread(&parent);
            }
            (Some(PageType::Comment), None) => {}
            _ => {
                {
                    let mut state = self.state.lock();
                    state.top_level.clear();
                    state.searched.clear();
                }
                self.optimized_pass();
            }
        }
        self.reconcile_nodes(false);
    }

    /// The thread a deep-linked comment belongs to: its parent for a reply,
    /// itself otherwise (or when it is not rendered).
    fn parent_of_target(&self, target: &str) -> String {
        let doc = self.page.document();
        for node in comments::find_all_comments(&doc) {
            if comments::extract_comment_id(&doc, node).as_deref() != Some(target) {
                continue;
            }
            if comments::is_reply(&doc, node) {
                if let Some(parent) = comments::find_parent_comment_id(&doc, node) {
                    return parent;
                }
            }
            break;
        }
        target.to_string()
    }

    /// Merges a settings patch. A change of marking kind or hook re-marks
    /// every comment.
    pub fn update_settings(&self, patch: &Value) -> Result<bool> {
        let marking_changed = {
            let mut annotator = self.annotator.lock();
            let mut settings = annotator.settings().clone();
            let changed = settings.apply_patch(patch)?;
            annotator.set_settings(settings);
            changed
        };
        if marking_changed && self.is_enabled() {
            info!("marking settings changed, re-marking comments");
            self.schedule(Duration::ZERO, |engine| engine.reprocess_all());
        }
        Ok(marking_changed)
    }

    pub fn reprocess_all(&self) {
        self.remove_all_indicators();
        self.state.lock().processed.clear();
        self.reconcile_nodes(false);
    }

    pub fn handle_user_change(&self, user: Option<String>) {
        let previous = std::mem::replace(&mut self.state.lock().current_user, user.clone());
        if previous == user {
            trace!("user unchanged");
            return;
        }
        match user {
            Some(user) => {
                info!(user = %user, "user signed in, rechecking comments");
                {
                    let mut state = self.state.lock();
                    state.processed.clear();
                    state.visibility.clear();
                }
                self.remove_all_indicators();
                self.schedule(self.timing.login_settle_delay, move |engine| {
                    if engine.current_user().as_deref() == Some(user.as_str()) {
                        engine.optimized_pass();
                    }
                });
            }
            None => {
                info!("user signed out, removing indicators");
                self.remove_all_indicators();
            }
        }
    }

    pub fn handle_navigation(&self, event: &NavigationEvent) {
        match event.kind {
            ChangeKind::CommentNavigation => {
                let Some(target) = event.details.target_comment_id.clone() else {
                    return;
                };
                info!(target = %target, initial = event.details.is_initial_load, "navigated to comment");
                let new_key = comments::post_key(&self.page.pathname());
                let post_changed = {
                    let mut state = self.state.lock();
                    state.target_comment_id = Some(target.clone());
                    match new_key {
                        Some(key) if state.post_key.as_deref() != Some(key.as_str()) => {
                            info!(from = ?state.post_key, to = %key, "post changed");
                            state.invalidate();
                            state.post_key = Some(key);
                            true
                        }
                        _ => false,
                    }
                };
                if post_changed {
                    self.remove_all_indicators();
                }
                self.identify_page_type();
                if self.current_user().is_none() {
                    warn!(target = %target, "cannot check target comment without a signed-in user");
                    return;
                }
                self.schedule_target_retries(target, event.details.is_initial_load);
            }
            ChangeKind::PageChange => {
                info!(url = ?event.details.new_url, "page changed");
                {
                    let mut state = self.state.lock();
                    state.processed.clear();
                    state.visibility.clear();
                }
                self.remove_all_indicators();
                let new_key = comments::post_key(&self.page.pathname());
                let post_changed = {
                    let mut state = self.state.lock();
                    match new_key {
                        Some(key) if state.post_key.as_deref() != Some(key.as_str()) => {
                            state.invalidate();
                            state.post_key = Some(key);
                            true
                        }
                        _ => false,
                    }
                };
                if post_changed {
                    self.identify_page_type();
                    self.schedule(self.timing.page_change_delay, |engine| engine.optimized_pass());
                }
            }
            ChangeKind::HashChange | ChangeKind::UrlChange => {
                debug!(kind = ?event.kind, "navigation needs no work");
            }
        }
    }

    /// Retries processing a navigated-to comment on the configured schedule
    /// until it is processed.
    pub fn schedule_target_retries(&self, target: String, initial_load: bool) {
        let delays = if initial_load {
            self.timing.initial_target_retries.clone()
        } else {
            self.timing.hash_target_retries.clone()
        };
        let attempts = delays.len();
        let done = Arc::new(AtomicBool::new(false));
        for (index, delay) in delays.into_iter().enumerate() {
            let done = done.clone();
            let target = target.clone();
            self.schedule(Duration::from_millis(delay), move |engine| {
                if done.load(Ordering::SeqCst) {
                    return;
                }
                trace!(target = %target, attempt = index + 1, attempts, "target comment attempt");
                if engine.try_process_target(&target) {
                    info!(target = %target, "target comment processed");
                    done.store(true, Ordering::SeqCst);
                } else if index + 1 == attempts {
                    info!(target = %target, "gave up waiting for target comment");
                }
            });
        }
    }

    fn try_process_target(&self, target: &str) -> bool {
        let _pass = self.pass();
        if self.is_processed(target) {
            return true;
        }
        let node = {
            let doc = self.page.document();
            comments::find_comment_by_id(&doc, target)
        };
        match node {
            Some(node) => {
                self.process_comment(node);
            }
            None => {
                debug!(target = %target, "target not rendered yet, checking all comments");
                self.reconcile_nodes(false);
            }
        }
        self.is_processed(target)
    }

    /// Processes the awaited target comment right away, then everything else.
    pub fn reconcile_target(&self) {
        let _pass = self.pass();
        if let Some(target) = self.target_comment_id() {
            let node = {
                let doc = self.page.document();
                comments::find_comment_by_id(&doc, &target)
            };
            if let Some(node) = node {
                self.process_comment(node);
            }
        }
        self.reconcile_nodes(false);
    }
}

/// `commentId` of a level-2 listing URL.
pub fn reply_thread_parent(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let mut level = None;
    let mut parent = None;
    for (key, value) in parsed.query_pairs() {
        match key.as_ref() {
            "level" => level = Some(value.into_owned()),
            "commentId" => parent = Some(value.into_owned()),
            _ => {}
        }
    }
    match level.as_deref() {
        Some("2") => parent.filter(|parent| !parent.is_empty()),
        _ => None,
    }
}

fn creation_time(timestamp: Option<i64>) -> (i64, String) {
    let now = chrono::Local::now();
    let at = timestamp
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map(|at| at.with_timezone(&chrono::Local))
        .unwrap_or(now);
    (at.timestamp(), at.format("%H:%M:%S").to_string())
}
