//! Watches the document for comments being rendered or filled in and
//! schedules reconciliation passes once the markup settles.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{never, select, unbounded, Receiver, Sender};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::debug;

use crate::annotate::PREFIX;
use crate::config::TimingConfig;
use crate::dispatch::SchedulerHandle;
use crate::dom::{Document, MutationRecord, NodeId, Selector};
use crate::engine::Engine;
use crate::page::Page;

static LIST_ITEM: Lazy<Selector> = Lazy::new(|| Selector::class("comment-list-item"));
static CONTENT: Lazy<Selector> = Lazy::new(|| {
    Selector::Any(vec![
        Selector::class("ui-comment-content"),
        Selector::class("ui-comment-header"),
        Selector::class("ui-comment-text"),
    ])
});
static TEXT_CONTAINER: Lazy<Selector> = Lazy::new(|| {
    Selector::Any(vec![
        Selector::class("ui-comment-text"),
        Selector::class("ui-comment-content"),
    ])
});
const WATCHED_ATTRIBUTES: [&str; 3] = ["data-comment-id", "id", "class"];

/// What a batch of mutations means for reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationSignal {
    pub new_comments: bool,
    pub content_changes: bool,
    pub target_updated: bool,
}

impl MutationSignal {
    pub fn is_relevant(&self) -> bool {
        self.new_comments || self.content_changes || self.target_updated
    }
}

fn is_own_marker(doc: &Document, node: NodeId) -> bool {
    doc.classes(node).iter().any(|class| class.starts_with(PREFIX))
}

fn is_target(doc: &Document, node: NodeId, target: &str) -> bool {
    doc.attr(node, "data-comment-id") == Some(target)
        || doc
            .attr(node, "id")
            .map(|id| id.contains(target))
            .unwrap_or(false)
}

pub fn classify(doc: &Document, records: &[MutationRecord], target: Option<&str>) -> MutationSignal {
    let mut signal = MutationSignal::default();
    for record in records {
        match record {
            MutationRecord::ChildList { target: parent, added, .. } => {
                for node in added.iter().copied() {
                    if !doc.is_element(node) || is_own_marker(doc, node) {
                        continue;
                    }
                    if LIST_ITEM.matches(doc, node) || doc.query(node, &LIST_ITEM).is_some() {
                        signal.new_comments = true;
                    }
                    if CONTENT.matches(doc, node) {
                        signal.content_changes = true;
                    }
                    if let Some(target) = target {
                        if is_target(doc, node, target)
                            || doc
                                .descendants(node)
                                .into_iter()
                                .any(|child| doc.is_element(child) && is_target(doc, child, target))
                        {
                            signal.target_updated = true;
                        }
                    }
                }
                if doc.is_element(*parent) && TEXT_CONTAINER.matches(doc, *parent) {
                    signal.content_changes = true;
                }
            }
            MutationRecord::Attributes { target: node, name } => {
                if !WATCHED_ATTRIBUTES.contains(&name.as_str()) {
                    continue;
                }
                if LIST_ITEM.matches(doc, *node) {
                    signal.content_changes = true;
                }
                if let Some(target) = target {
                    if is_target(doc, *node, target) {
                        signal.target_updated = true;
                    }
                }
            }
            MutationRecord::CharacterData { .. } => {}
        }
    }
    signal
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Target,
    Full,
}

struct Inner {
    page: Arc<Page>,
    engine: Arc<Engine>,
    scheduler: SchedulerHandle,
    timing: TimingConfig,
}

struct Worker {
    stop: Sender<()>,
    handle: thread::JoinHandle<()>,
}

pub struct MutationWatcher {
    inner: Arc<Inner>,
    worker: Mutex<Option<Worker>>,
}

impl MutationWatcher {
    pub fn new(
        page: Arc<Page>,
        engine: Arc<Engine>,
        scheduler: SchedulerHandle,
        timing: &TimingConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                page,
                engine,
                scheduler,
                timing: timing.clone(),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            debug!("mutation watcher already running");
            return;
        }
        let mutations = self.inner.page.document().observe();
        let (stop_tx, stop_rx) = unbounded();
        let inner = self.inner.clone();
        let handle = thread::spawn(move || inner.run(stop_rx, mutations));
        *worker = Some(Worker {
            stop: stop_tx,
            handle,
        });
        debug!("mutation watcher started");
    }

    pub fn stop(&self) {
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.stop.send(());
            let _ = worker.handle.join();
        }
    }
}

impl Drop for MutationWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn run(&self, stop: Receiver<()>, mutations: Receiver<MutationRecord>) {
        let mut mutations = mutations;
        let mut pending: Option<(Instant, Pass)> = None;
        loop {
            let wait = pending
                .map(|(at, _)| at.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_secs(3600));
            select! {
                recv(stop) -> _ => break,
                recv(mutations) -> msg => match msg {
                    Ok(first) => {
                        let mut batch = vec![first];
                        batch.extend(mutations.try_iter());
                        pending = self.absorb(&batch, pending);
                    }
                    Err(_) => mutations = never(),
                },
                default(wait) => {}
            }
            if let Some((at, pass)) = pending {
                if Instant::now() >= at {
                    pending = None;
                    self.dispatch(pass);
                }
            }
        }
    }

    fn absorb(
        &self,
        batch: &[MutationRecord],
        pending: Option<(Instant, Pass)>,
    ) -> Option<(Instant, Pass)> {
        if !self.engine.is_enabled() {
            return pending;
        }
        let target = self.engine.target_comment_id();
        let signal = {
            let doc = self.page.document();
            classify(&doc, batch, target.as_deref())
        };
        if signal.target_updated {
            debug!(target = ?target, "target comment rendered");
            let due = Instant::now() + self.timing.target_mutation_debounce;
            return Some(match pending {
                Some((at, _)) if at < due => (at, Pass::Target),
                _ => (due, Pass::Target),
            });
        }
        if signal.new_comments || signal.content_changes {
            return pending.or_else(|| Some((Instant::now() + self.timing.mutation_debounce, Pass::Full)));
        }
        pending
    }

    fn dispatch(&self, pass: Pass) {
        debug!(pass = ?pass, "comment markup changed");
        let engine = self.engine.clone();
        self.scheduler.post(move || match pass {
            Pass::Target => engine.reconcile_target(),
            Pass::Full => engine.reconcile_all(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comments::fixtures::{comment, comment_list, thread};
    use crate::dom::el;
    use pretty_assertions::assert_eq;

    fn recorded<F>(doc: &mut Document, change: F) -> Vec<MutationRecord>
    where
        F: FnOnce(&mut Document),
    {
        let rx = doc.observe();
        change(doc);
        rx.try_iter().collect()
    }

    #[test]
    fn new_threads_are_new_comments() {
        let mut doc = Document::new();
        let list = comment_list(&mut doc);
        let records = recorded(&mut doc, |doc| {
            thread(doc, list, ("c_1", "alice"), &[]);
        });
        let signal = classify(&doc, &records, None);
        assert!(signal.new_comments);
        assert!(!signal.target_updated);
    }

    #[test]
    fn own_markers_are_ignored() {
        let mut doc = Document::new();
        let list = comment_list(&mut doc);
        let item = thread(&mut doc, list, ("c_1", "alice"), &[]);
        let records = recorded(&mut doc, |doc| {
            doc.build(item, el("span").class("shadowcheck-visible-badge").text("VISIBLE"));
        });
        assert_eq!(classify(&doc, &records, None), MutationSignal::default());
    }

    #[test]
    fn awaited_target_is_recognised() {
        let mut doc = Document::new();
        let list = comment_list(&mut doc);
        let records = recorded(&mut doc, |doc| {
            doc.build(
                list,
                el("div").child(el("div").attr("data-comment-id", "c_9")),
            );
        });
        assert!(classify(&doc, &records, Some("c_9")).target_updated);
        assert!(!classify(&doc, &records, Some("c_8")).target_updated);

        let holder = doc.build(list, el("div"));
        let records = recorded(&mut doc, |doc| doc.set_attr(holder, "id", "comment-c_9"));
        assert!(classify(&doc, &records, Some("c_9")).target_updated);
    }

    #[test]
    fn content_fill_and_list_item_attributes_count() {
        let mut doc = Document::new();
        let list = comment_list(&mut doc);
        let item = thread(&mut doc, list, ("c_1", "alice"), &[]);
        let records = recorded(&mut doc, |doc| {
            doc.build(item, el("div").class("ui-comment-text").text("hello"));
        });
        assert!(classify(&doc, &records, None).content_changes);

        let records = recorded(&mut doc, |doc| doc.add_class(item, "is-loaded"));
        assert!(classify(&doc, &records, None).content_changes);

        let records = recorded(&mut doc, |doc| doc.set_attr(item, "aria-label", "x"));
        assert!(!classify(&doc, &records, None).is_relevant());
    }

    #[test]
    fn stray_comment_markup_outside_lists_is_not_new() {
        let mut doc = Document::new();
        let body = doc.body();
        let records = recorded(&mut doc, |doc| {
            doc.build(body, comment("c_1", "alice", false));
        });
        let signal = classify(&doc, &records, None);
        assert!(!signal.new_comments);
        // the header inside is content, but only added roots are inspected
        assert!(!signal.content_changes);
    }
}
