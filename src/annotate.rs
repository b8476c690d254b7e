//! Visual markers on comment elements, and their removal.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{MarkingKind, Settings};
use crate::dom::{el, Document, NodeId, Selector};

pub const PREFIX: &str = "shadowcheck-";
pub const MARKED_CLASS: &str = "shadowcheck-marked";
pub const VISIBLE_CLASS: &str = "shadowcheck-visible";
pub const SHADOWBANNED_CLASS: &str = "shadowcheck-shadowbanned";
pub const NEW_COMMENT_CLASS: &str = "shadowcheck-new-comment";
pub const NEW_COMMENT_INDICATOR_CLASS: &str = "shadowcheck-new-comment-indicator";
pub const NEW_COMMENT_ATTR: &str = "data-shadowcheck-new-comment";

const TOUCHED_STYLES: [&str; 4] = ["background-color", "border-left", "padding-left", "opacity"];
const FALLBACK_BORDER: &str = "3px solid #ff6b6b";

#[derive(Debug, Error)]
pub enum MarkingError {
    #[error("marking: no hook registered as `{0}`")]
    UnknownHook(String),
    #[error("marking: hook `{name}` failed: {source:#}")]
    HookFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type MarkingHook = Arc<dyn Fn(&mut Document, NodeId) -> Result<()> + Send + Sync>;

/// Named annotation callbacks the `custom` marking kind dispatches to.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: HashMap<String, MarkingHook>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, hook: F)
    where
        F: Fn(&mut Document, NodeId) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.insert(name.to_string(), Arc::new(hook));
    }

    pub fn get(&self, name: &str) -> Option<MarkingHook> {
        self.hooks.get(name).cloned()
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.hooks.keys().collect();
        names.sort();
        f.debug_struct("HookRegistry").field("hooks", &names).finish()
    }
}

/// Inline style values present before the first marking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Snapshot {
    styles: Vec<(&'static str, Option<String>)>,
}

impl Snapshot {
    fn take(doc: &Document, node: NodeId) -> Self {
        Self {
            styles: TOUCHED_STYLES
                .iter()
                .map(|prop| (*prop, doc.style(node, prop)))
                .collect(),
        }
    }
}

#[derive(Debug)]
pub struct Annotator {
    settings: Settings,
    hooks: HookRegistry,
    snapshots: HashMap<NodeId, Snapshot>,
}

struct Look<'a> {
    kind: MarkingKind,
    custom: &'a str,
    highlight_border_color: &'a str,
    highlight_bg_color: &'a str,
    highlight_border_width: &'a str,
    border_color: &'a str,
    border_width: &'a str,
    badge_text: &'a str,
    badge_color: &'a str,
    badge_text_color: &'a str,
    opacity: &'static str,
    badge_class: &'static str,
}

impl Annotator {
    pub fn new(settings: Settings, hooks: HookRegistry) -> Self {
        Self {
            settings,
            hooks,
            snapshots: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: Settings) {
        self.settings = settings;
    }

    pub fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }

    pub fn is_marked(&self, doc: &Document, node: NodeId) -> bool {
        doc.has_class(node, MARKED_CLASS)
    }

    /// Marks `node` according to its verdict. Any previous marking is undone
    /// first so markers never stack. A failing shadowbanned marking falls back
    /// to a plain red border; the error is still returned for logging.
    pub fn apply(
        &mut self,
        doc: &mut Document,
        node: NodeId,
        visible: bool,
    ) -> Result<(), MarkingError> {
        match self.snapshots.get(&node) {
            Some(_) => self.reset(doc, node),
            None => {
                self.snapshots.insert(node, Snapshot::take(doc, node));
            }
        }

        doc.add_class(node, MARKED_CLASS);
        doc.add_class(
            node,
            if visible {
                VISIBLE_CLASS
            } else {
                SHADOWBANNED_CLASS
            },
        );

        let result = self.mark(doc, node, visible);
        if let Err(err) = &result {
            warn!(error = %err, visible, "marking failed");
            if !visible {
                doc.set_style(node, "border-left", FALLBACK_BORDER);
                doc.set_style(node, "padding-left", "8px");
            }
        }
        result
    }

    /// Undoes every marking on `node` and forgets its snapshot.
    pub fn restore(&mut self, doc: &mut Document, node: NodeId) {
        self.reset(doc, node);
        self.snapshots.remove(&node);
    }

    pub fn remove_all_indicators(&mut self, doc: &mut Document) {
        let body = doc.body();
        let indicators = Selector::Any(vec![
            Selector::class("shadowcheck-visible-badge"),
            Selector::class("shadowcheck-shadowbanned-badge"),
            Selector::class(NEW_COMMENT_INDICATOR_CLASS),
            Selector::class("shadowcheck-indicator"),
        ]);
        for node in doc.query_all(body, &indicators) {
            doc.remove(node);
        }
        for node in doc.query_all(body, &Selector::class(NEW_COMMENT_CLASS)) {
            doc.remove_class(node, NEW_COMMENT_CLASS);
            doc.remove_attr(node, NEW_COMMENT_ATTR);
        }

        let mut marked = doc.query_all(body, &Selector::class(MARKED_CLASS));
        marked.extend(self.snapshots.keys().copied());
        marked.sort();
        marked.dedup();
        for node in marked {
            self.restore(doc, node);
        }
        debug!("removed all indicators");
    }

    /// Flags a comment the user just created with a `NEW` indicator.
    pub fn flag_new_comment(
        &self,
        doc: &mut Document,
        node: NodeId,
        comment_id: &str,
        timestamp: i64,
        created_at: &str,
    ) {
        doc.add_class(node, NEW_COMMENT_CLASS);
        let indicator = doc.build_detached(
            el("div")
                .class(NEW_COMMENT_INDICATOR_CLASS)
                .attr(
                    "style",
                    "display: inline-flex; align-items: center; background: #4caf50; \
                     color: white; padding: 4px 8px; border-radius: 12px; font-size: 11px; \
                     font-weight: bold; margin: 2px 4px",
                )
                .attr("title", &format!("New comment created at {created_at}"))
                .child(el("span").text("NEW")),
        );
        match indicator_insertion_point(doc, node) {
            Some(point) => doc.append_child(point, indicator),
            None => doc.prepend_child(node, indicator),
        }
        let data = json!({"commentId": comment_id, "timestamp": timestamp, "flagged": true});
        doc.set_attr(node, NEW_COMMENT_ATTR, &data.to_string());
    }

    fn reset(&self, doc: &mut Document, node: NodeId) {
        let added: Vec<NodeId> = doc
            .query_all(node, &Selector::class_contains(PREFIX))
            .into_iter()
            .filter(|child| !doc.has_class(*child, NEW_COMMENT_INDICATOR_CLASS))
            .filter(|child| owned_by(doc, *child, node))
            .collect();
        for child in added {
            doc.remove(child);
        }
        for class in [MARKED_CLASS, VISIBLE_CLASS, SHADOWBANNED_CLASS] {
            doc.remove_class(node, class);
        }
        match self.snapshots.get(&node) {
            Some(snapshot) => {
                for (prop, value) in &snapshot.styles {
                    doc.set_style(node, prop, value.as_deref().unwrap_or_default());
                }
            }
            None => {
                for prop in TOUCHED_STYLES {
                    doc.set_style(node, prop, "");
                }
            }
        }
    }

    fn look(&self, visible: bool) -> Look<'_> {
        let s = &self.settings;
        if visible {
            Look {
                kind: s.visible_marking,
                custom: &s.visible_custom_code,
                highlight_border_color: &s.visible_highlight_border_color,
                highlight_bg_color: &s.visible_highlight_bg_color,
                highlight_border_width: &s.visible_highlight_border_width,
                border_color: &s.visible_border_color,
                border_width: &s.visible_border_width,
                badge_text: &s.visible_badge_text,
                badge_color: &s.visible_badge_color,
                badge_text_color: &s.visible_badge_text_color,
                opacity: "0.9",
                badge_class: "shadowcheck-visible-badge",
            }
        } else {
            Look {
                kind: s.shadowbanned_marking,
                custom: &s.shadowbanned_custom_code,
                highlight_border_color: &s.shadowbanned_highlight_border_color,
                highlight_bg_color: &s.shadowbanned_highlight_bg_color,
                highlight_border_width: &s.shadowbanned_highlight_border_width,
                border_color: &s.shadowbanned_border_color,
                border_width: &s.shadowbanned_border_width,
                badge_text: &s.shadowbanned_badge_text,
                badge_color: &s.shadowbanned_badge_color,
                badge_text_color: &s.shadowbanned_badge_text_color,
                opacity: "0.8",
                badge_class: "shadowcheck-shadowbanned-badge",
            }
        }
    }

    fn mark(&self, doc: &mut Document, node: NodeId, visible: bool) -> Result<(), MarkingError> {
        let look = self.look(visible);
        match look.kind {
            MarkingKind::None => {}
            MarkingKind::Highlight => {
                doc.set_style(node, "background-color", look.highlight_bg_color);
                doc.set_style(
                    node,
                    "border-left",
                    &format!(
                        "{}px solid {}",
                        look.highlight_border_width, look.highlight_border_color
                    ),
                );
                doc.set_style(node, "padding-left", "8px");
                doc.set_style(node, "opacity", look.opacity);
            }
            MarkingKind::Border => {
                doc.set_style(
                    node,
                    "border-left",
                    &format!("{}px solid {}", look.border_width, look.border_color),
                );
                doc.set_style(node, "padding-left", "8px");
            }
            MarkingKind::Badge => insert_badge(doc, node, &look),
            MarkingKind::Custom => {
                let name = look.custom.trim();
                if name.is_empty() {
                    return Ok(());
                }
                let hook = self
                    .hooks
                    .get(name)
                    .ok_or_else(|| MarkingError::UnknownHook(name.to_string()))?;
                hook(doc, node).map_err(|source| MarkingError::HookFailed {
                    name: name.to_string(),
                    source,
                })?;
            }
        }
        Ok(())
    }
}

fn insert_badge(doc: &mut Document, node: NodeId, look: &Look<'_>) {
    let style = format!(
        "display: inline-block; background-color: {}; color: {}; padding: 2px 6px; \
         border-radius: 3px; font-size: 10px; font-weight: bold; margin-right: 8px; \
         text-transform: uppercase; line-height: 1.2",
        look.badge_color, look.badge_text_color
    );
    let badge = doc.build_detached(
        el("span")
            .class(look.badge_class)
            .attr("style", &style)
            .text(look.badge_text),
    );

    let header = doc.query(node, &Selector::class("ui-comment-header"));
    let container = doc.query(node, &Selector::class("ui-comment-header__container"));
    match (container, header) {
        (Some(container), _) => {
            let time = doc.query(container, &Selector::class("ui-comment-header__time"));
            match time.and_then(|t| doc.parent(t).map(|p| (t, p))) {
                Some((time, parent)) => doc.insert_before(parent, badge, Some(time)),
                None => doc.prepend_child(container, badge),
            }
        }
        (None, Some(header)) => doc.prepend_child(header, badge),
        (None, None) => doc.prepend_child(node, badge),
    }
}

/// True when `child` belongs to `node` itself rather than to a comment nested
/// below it.
fn owned_by(doc: &Document, child: NodeId, node: NodeId) -> bool {
    let is_comment = |n: NodeId| doc.has_class(n, "comment-item") || doc.has_class(n, MARKED_CLASS);
    if is_comment(child) {
        return false;
    }
    let mut current = doc.parent(child);
    while let Some(ancestor) = current {
        if ancestor == node {
            return true;
        }
        if is_comment(ancestor) {
            return false;
        }
        current = doc.parent(ancestor);
    }
    false
}

fn indicator_insertion_point(doc: &Document, node: NodeId) -> Option<NodeId> {
    if let Some(header) = doc.query(node, &Selector::class("ui-comment-header")) {
        return doc
            .query(header, &Selector::class("ui-comment-header__container"))
            .or(Some(header));
    }
    doc.query(
        node,
        &Selector::Any(vec![
            Selector::class_contains("header"),
            Selector::class_contains("meta"),
        ]),
    )
}
