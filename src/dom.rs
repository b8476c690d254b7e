//! In-memory model of the host page's document tree.
//!
//! Nodes live in an arena and are addressed by [`NodeId`]. Detached nodes stay
//! in the arena so ids held by callers never dangle. Every mutation is
//! broadcast as a [`MutationRecord`] to the receivers handed out by
//! [`Document::observe`].

use crossbeam_channel::{unbounded, Receiver, Sender};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
enum NodeData {
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
    },
    Text(String),
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    data: NodeData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationRecord {
    ChildList {
        target: NodeId,
        added: Vec<NodeId>,
        removed: Vec<NodeId>,
    },
    Attributes {
        target: NodeId,
        name: String,
    },
    CharacterData {
        target: NodeId,
    },
}

impl MutationRecord {
    pub fn target(&self) -> NodeId {
        match self {
            MutationRecord::ChildList { target, .. }
            | MutationRecord::Attributes { target, .. }
            | MutationRecord::CharacterData { target } => *target,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interaction {
    MouseEnter,
    MouseOver,
    Focus,
    Click,
}

/// A small structural matcher covering the selector shapes the comment
/// markup contract needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Tag(String),
    Class(String),
    /// `[class*=needle]`
    ClassContains(String),
    AttrEq(String, String),
    AttrContains(String, String),
    Not(Box<Selector>),
    All(Vec<Selector>),
    Any(Vec<Selector>),
}

impl Selector {
    pub fn tag(tag: &str) -> Self {
        Selector::Tag(tag.to_ascii_lowercase())
    }

    pub fn class(class: &str) -> Self {
        Selector::Class(class.to_string())
    }

    pub fn class_contains(needle: &str) -> Self {
        Selector::ClassContains(needle.to_string())
    }

    pub fn attr_eq(name: &str, value: &str) -> Self {
        Selector::AttrEq(name.to_string(), value.to_string())
    }

    pub fn attr_contains(name: &str, needle: &str) -> Self {
        Selector::AttrContains(name.to_string(), needle.to_string())
    }

    pub fn not(inner: Selector) -> Self {
        Selector::Not(Box::new(inner))
    }

    pub fn matches(&self, doc: &Document, node: NodeId) -> bool {
        if !doc.is_element(node) {
            return false;
        }
        match self {
            Selector::Tag(tag) => doc.tag(node) == Some(tag.as_str()),
            Selector::Class(class) => doc.has_class(node, class),
            Selector::ClassContains(needle) => doc
                .attr(node, "class")
                .map(|value| value.contains(needle.as_str()))
                .unwrap_or(false),
            Selector::AttrEq(name, value) => doc.attr(node, name) == Some(value.as_str()),
            Selector::AttrContains(name, needle) => doc
                .attr(node, name)
                .map(|value| value.contains(needle.as_str()))
                .unwrap_or(false),
            Selector::Not(inner) => !inner.matches(doc, node),
            Selector::All(parts) => parts.iter().all(|part| part.matches(doc, node)),
            Selector::Any(parts) => parts.iter().any(|part| part.matches(doc, node)),
        }
    }
}

/// Declarative element description used to build subtrees in one mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Spec {
    Element(ElementSpec),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementSpec {
    tag: String,
    attrs: Vec<(String, String)>,
    children: Vec<Spec>,
}

pub fn el(tag: &str) -> ElementSpec {
    ElementSpec {
        tag: tag.to_ascii_lowercase(),
        attrs: Vec::new(),
        children: Vec::new(),
    }
}

impl ElementSpec {
    pub fn attr(mut self, name: &str, value: &str) -> Self {
        if let Some(slot) = self.attrs.iter_mut().find(|(key, _)| key == name) {
            slot.1 = value.to_string();
        } else {
            self.attrs.push((name.to_string(), value.to_string()));
        }
        self
    }

    pub fn class(self, class: &str) -> Self {
        let joined = match self.attrs.iter().find(|(key, _)| key == "class") {
            Some((_, existing)) if !existing.is_empty() => format!("{existing} {class}"),
            _ => class.to_string(),
        };
        self.attr("class", &joined)
    }

    pub fn text(mut self, text: &str) -> Self {
        self.children.push(Spec::Text(text.to_string()));
        self
    }

    pub fn child(mut self, child: ElementSpec) -> Self {
        self.children.push(Spec::Element(child));
        self
    }
}

impl From<ElementSpec> for Spec {
    fn from(spec: ElementSpec) -> Self {
        Spec::Element(spec)
    }
}

#[derive(Debug)]
pub struct Document {
    nodes: Vec<Node>,
    root: NodeId,
    head: NodeId,
    body: NodeId,
    observers: Vec<Sender<MutationRecord>>,
    interaction_observers: Vec<Sender<(NodeId, Interaction)>>,
    interactions: Vec<(NodeId, Interaction)>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        let mut doc = Document {
            nodes: Vec::new(),
            root: NodeId(0),
            head: NodeId(0),
            body: NodeId(0),
            observers: Vec::new(),
            interaction_observers: Vec::new(),
            interactions: Vec::new(),
        };
        let root = doc.alloc_element("html");
        let head = doc.alloc_element("head");
        let body = doc.alloc_element("body");
        doc.link(root, head, None);
        doc.link(root, body, None);
        doc.root = root;
        doc.head = head;
        doc.body = body;
        doc
    }

    pub fn document_element(&self) -> NodeId {
        self.root
    }

    pub fn head(&self) -> NodeId {
        self.head
    }

    pub fn body(&self) -> NodeId {
        self.body
    }

    pub fn observe(&mut self) -> Receiver<MutationRecord> {
        let (tx, rx) = unbounded();
        self.observers.push(tx);
        rx
    }

    pub fn on_interaction(&mut self) -> Receiver<(NodeId, Interaction)> {
        let (tx, rx) = unbounded();
        self.interaction_observers.push(tx);
        rx
    }

    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.alloc_element(tag)
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.alloc(NodeData::Text(text.to_string()))
    }

    /// Materialises `spec` and appends it to `parent`.
    pub fn build(&mut self, parent: NodeId, spec: impl Into<Spec>) -> NodeId {
        let node = self.materialize(spec.into());
        self.append_child(parent, node);
        node
    }

    /// Materialises `spec` without attaching it anywhere.
    pub fn build_detached(&mut self, spec: impl Into<Spec>) -> NodeId {
        self.materialize(spec.into())
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.insert_before(parent, child, None);
    }

    pub fn prepend_child(&mut self, parent: NodeId, child: NodeId) {
        let first = self.children(parent).first().copied();
        self.insert_before(parent, child, first);
    }

    /// Inserts `child` into `parent` before `reference`, or at the end when
    /// `reference` is `None` or not a child of `parent`.
    pub fn insert_before(&mut self, parent: NodeId, child: NodeId, reference: Option<NodeId>) {
        if !self.exists(parent) || !self.exists(child) || parent == child {
            return;
        }
        if self.contains(child, parent) {
            return;
        }
        self.detach(child);
        self.link(parent, child, reference);
        self.notify(MutationRecord::ChildList {
            target: parent,
            added: vec![child],
            removed: Vec::new(),
        });
    }

    pub fn remove(&mut self, node: NodeId) {
        if let Some(parent) = self.parent(node) {
            self.detach(node);
            self.notify(MutationRecord::ChildList {
                target: parent,
                added: Vec::new(),
                removed: vec![node],
            });
        }
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(node.0).and_then(|n| n.parent)
    }

    pub fn children(&self, node: NodeId) -> &[NodeId] {
        self.nodes
            .get(node.0)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_element(&self, node: NodeId) -> bool {
        matches!(
            self.nodes.get(node.0).map(|n| &n.data),
            Some(NodeData::Element { .. })
        )
    }

    pub fn tag(&self, node: NodeId) -> Option<&str> {
        match self.nodes.get(node.0).map(|n| &n.data) {
            Some(NodeData::Element { tag, .. }) => Some(tag.as_str()),
            _ => None,
        }
    }

    pub fn attr(&self, node: NodeId, name: &str) -> Option<&str> {
        match self.nodes.get(node.0).map(|n| &n.data) {
            Some(NodeData::Element { attrs, .. }) => attrs
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str()),
            _ => None,
        }
    }

    pub fn attrs(&self, node: NodeId) -> &[(String, String)] {
        match self.nodes.get(node.0).map(|n| &n.data) {
            Some(NodeData::Element { attrs, .. }) => attrs.as_slice(),
            _ => &[],
        }
    }

    pub fn set_attr(&mut self, node: NodeId, name: &str, value: &str) {
        let changed = match self.nodes.get_mut(node.0).map(|n| &mut n.data) {
            Some(NodeData::Element { attrs, .. }) => {
                match attrs.iter_mut().find(|(key, _)| key == name) {
                    Some(slot) if slot.1 == value => false,
                    Some(slot) => {
                        slot.1 = value.to_string();
                        true
                    }
                    None => {
                        attrs.push((name.to_string(), value.to_string()));
                        true
                    }
                }
            }
            _ => false,
        };
        if changed {
            self.notify(MutationRecord::Attributes {
                target: node,
                name: name.to_string(),
            });
        }
    }

    pub fn remove_attr(&mut self, node: NodeId, name: &str) {
        let changed = match self.nodes.get_mut(node.0).map(|n| &mut n.data) {
            Some(NodeData::Element { attrs, .. }) => {
                let before = attrs.len();
                attrs.retain(|(key, _)| key != name);
                before != attrs.len()
            }
            _ => false,
        };
        if changed {
            self.notify(MutationRecord::Attributes {
                target: node,
                name: name.to_string(),
            });
        }
    }

    pub fn classes(&self, node: NodeId) -> Vec<&str> {
        self.attr(node, "class")
            .map(|value| value.split_whitespace().collect())
            .unwrap_or_default()
    }

    pub fn has_class(&self, node: NodeId, class: &str) -> bool {
        self.classes(node).iter().any(|c| *c == class)
    }

    pub fn add_class(&mut self, node: NodeId, class: &str) {
        if !self.is_element(node) || self.has_class(node, class) {
            return;
        }
        let mut classes: Vec<String> = self.classes(node).iter().map(|c| c.to_string()).collect();
        classes.push(class.to_string());
        self.set_attr(node, "class", &classes.join(" "));
    }

    pub fn remove_class(&mut self, node: NodeId, class: &str) {
        if !self.has_class(node, class) {
            return;
        }
        let classes: Vec<String> = self
            .classes(node)
            .iter()
            .filter(|c| **c != class)
            .map(|c| c.to_string())
            .collect();
        if classes.is_empty() {
            self.remove_attr(node, "class");
        } else {
            self.set_attr(node, "class", &classes.join(" "));
        }
    }

    pub fn style(&self, node: NodeId, property: &str) -> Option<String> {
        parse_style(self.attr(node, "style").unwrap_or_default())
            .into_iter()
            .find(|(key, _)| key == property)
            .map(|(_, value)| value)
    }

    /// Sets an inline style property; an empty value removes it, as assigning
    /// `''` to `element.style.x` does.
    pub fn set_style(&mut self, node: NodeId, property: &str, value: &str) {
        if !self.is_element(node) {
            return;
        }
        let mut declarations = parse_style(self.attr(node, "style").unwrap_or_default());
        let existing = declarations.iter().position(|(key, _)| key == property);
        match (existing, value.is_empty()) {
            (Some(idx), true) => {
                declarations.remove(idx);
            }
            (Some(idx), false) => declarations[idx].1 = value.to_string(),
            (None, false) => declarations.push((property.to_string(), value.to_string())),
            (None, true) => return,
        }
        if declarations.is_empty() {
            self.remove_attr(node, "style");
        } else {
            let joined = declarations
                .iter()
                .map(|(key, value)| format!("{key}: {value}"))
                .collect::<Vec<_>>()
                .join("; ");
            self.set_attr(node, "style", &joined);
        }
    }

    pub fn text_content(&self, node: NodeId) -> String {
        match self.nodes.get(node.0).map(|n| &n.data) {
            Some(NodeData::Text(text)) => text.clone(),
            Some(NodeData::Element { .. }) => self
                .children(node)
                .iter()
                .map(|child| self.text_content(*child))
                .collect(),
            None => String::new(),
        }
    }

    /// Replaces the text of a text node, or all children of an element with a
    /// single text node.
    pub fn set_text(&mut self, node: NodeId, text: &str) {
        let is_text = matches!(
            self.nodes.get(node.0).map(|n| &n.data),
            Some(NodeData::Text(_))
        );
        if is_text {
            if let Some(n) = self.nodes.get_mut(node.0) {
                n.data = NodeData::Text(text.to_string());
            }
            self.notify(MutationRecord::CharacterData { target: node });
            return;
        }
        if !self.is_element(node) {
            return;
        }
        let removed: Vec<NodeId> = self.children(node).to_vec();
        for child in &removed {
            self.detach(*child);
        }
        let text_node = self.create_text(text);
        self.link(node, text_node, None);
        self.notify(MutationRecord::ChildList {
            target: node,
            added: vec![text_node],
            removed,
        });
    }

    /// Descendants of `node` in document order, excluding `node` itself.
    pub fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(node).iter().rev().copied().collect();
        while let Some(current) = stack.pop() {
            out.push(current);
            stack.extend(self.children(current).iter().rev().copied());
        }
        out
    }

    pub fn query(&self, scope: NodeId, selector: &Selector) -> Option<NodeId> {
        self.descendants(scope)
            .into_iter()
            .find(|node| selector.matches(self, *node))
    }

    pub fn query_all(&self, scope: NodeId, selector: &Selector) -> Vec<NodeId> {
        self.descendants(scope)
            .into_iter()
            .filter(|node| selector.matches(self, *node))
            .collect()
    }

    /// Nearest inclusive ancestor matching `selector`.
    pub fn closest(&self, node: NodeId, selector: &Selector) -> Option<NodeId> {
        let mut current = Some(node);
        while let Some(candidate) = current {
            if selector.matches(self, candidate) {
                return Some(candidate);
            }
            current = self.parent(candidate);
        }
        None
    }

    pub fn contains(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(candidate) = current {
            if candidate == ancestor {
                return true;
            }
            current = self.parent(candidate);
        }
        false
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        self.contains(self.root, node)
    }

    pub fn inner_html(&self, node: NodeId) -> String {
        let mut out = String::new();
        for child in self.children(node) {
            self.serialize(*child, &mut out);
        }
        out
    }

    pub fn outer_html(&self, node: NodeId) -> String {
        let mut out = String::new();
        self.serialize(node, &mut out);
        out
    }

    /// Fires a synthetic UI interaction at `node`.
    pub fn dispatch(&mut self, node: NodeId, interaction: Interaction) {
        if !self.exists(node) {
            return;
        }
        self.interactions.push((node, interaction));
        self.interaction_observers
            .retain(|tx| tx.send((node, interaction)).is_ok());
    }

    pub fn interactions(&self) -> &[(NodeId, Interaction)] {
        &self.interactions
    }

    fn exists(&self, node: NodeId) -> bool {
        node.0 < self.nodes.len()
    }

    fn alloc_element(&mut self, tag: &str) -> NodeId {
        self.alloc(NodeData::Element {
            tag: tag.to_ascii_lowercase(),
            attrs: Vec::new(),
        })
    }

    fn alloc(&mut self, data: NodeData) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            parent: None,
            children: Vec::new(),
            data,
        });
        id
    }

    fn materialize(&mut self, spec: Spec) -> NodeId {
        match spec {
            Spec::Text(text) => self.create_text(&text),
            Spec::Element(ElementSpec {
                tag,
                attrs,
                children,
            }) => {
                let node = self.alloc(NodeData::Element { tag, attrs });
                for child in children {
                    let child_id = self.materialize(child);
                    self.link(node, child_id, None);
                }
                node
            }
        }
    }

    fn link(&mut self, parent: NodeId, child: NodeId, reference: Option<NodeId>) {
        let position = reference.and_then(|r| self.nodes[parent.0].children.iter().position(|c| *c == r));
        match position {
            Some(idx) => self.nodes[parent.0].children.insert(idx, child),
            None => self.nodes[parent.0].children.push(child),
        }
        self.nodes[child.0].parent = Some(parent);
    }

    fn detach(&mut self, node: NodeId) {
        if let Some(parent) = self.nodes.get(node.0).and_then(|n| n.parent) {
            self.nodes[parent.0].children.retain(|c| *c != node);
            self.nodes[node.0].parent = None;
        }
    }

    fn notify(&mut self, record: MutationRecord) {
        self.observers.retain(|tx| tx.send(record.clone()).is_ok());
    }

    fn serialize(&self, node: NodeId, out: &mut String) {
        match self.nodes.get(node.0).map(|n| &n.data) {
            Some(NodeData::Text(text)) => {
                out.push_str(&html_escape::encode_text(text));
            }
            Some(NodeData::Element { tag, attrs }) => {
                out.push('<');
                out.push_str(tag);
                for (key, value) in attrs {
                    out.push(' ');
                    out.push_str(key);
                    out.push_str("=\"");
                    out.push_str(&html_escape::encode_double_quoted_attribute(value));
                    out.push('"');
                }
                out.push('>');
                for child in self.children(node) {
                    self.serialize(*child, out);
                }
                out.push_str("</");
                out.push_str(tag);
                out.push('>');
            }
            None => {}
        }
    }
}

fn parse_style(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .filter_map(|decl| {
            let (key, value) = decl.split_once(':')?;
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() {
                None
            } else {
                Some((key.to_string(), value.to_string()))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_serialize() {
        let mut doc = Document::new();
        let body = doc.body();
        let node = doc.build(
            body,
            el("div")
                .class("a")
                .class("b")
                .child(el("a").attr("href", "/u/x?y=\"1\"").text("x & y")),
        );
        assert_eq!(
            doc.outer_html(node),
            "<div class=\"a b\"><a href=\"/u/x?y=&quot;1&quot;\">x &amp; y</a></div>"
        );
        assert!(doc.is_connected(node));
    }

    #[test]
    fn class_and_style_helpers() {
        let mut doc = Document::new();
        let node = doc.build(doc.body(), el("div").attr("style", "color: red"));
        doc.add_class(node, "x");
        doc.add_class(node, "x");
        assert_eq!(doc.classes(node), vec!["x"]);
        doc.set_style(node, "border-left", "3px solid #fff");
        assert_eq!(doc.style(node, "color").as_deref(), Some("red"));
        assert_eq!(
            doc.style(node, "border-left").as_deref(),
            Some("3px solid #fff")
        );
        doc.set_style(node, "border-left", "");
        assert_eq!(doc.attr(node, "style"), Some("color: red"));
        doc.remove_class(node, "x");
        assert_eq!(doc.attr(node, "class"), None);
    }

    #[test]
    fn mutations_are_broadcast() {
        let mut doc = Document::new();
        let rx = doc.observe();
        let node = doc.build(doc.body(), el("span"));
        doc.set_attr(node, "id", "x");
        doc.remove(node);
        let records: Vec<_> = rx.try_iter().collect();
        assert_eq!(records.len(), 3);
        assert!(matches!(&records[0], MutationRecord::ChildList { added, .. } if added == &vec![node]));
        assert!(matches!(&records[1], MutationRecord::Attributes { name, .. } if name == "id"));
        assert!(matches!(&records[2], MutationRecord::ChildList { removed, .. } if removed == &vec![node]));
        assert!(!doc.is_connected(node));
    }

    #[test]
    fn selectors_and_traversal() {
        let mut doc = Document::new();
        let list = doc.build(
            doc.body(),
            el("ul").class("list").child(
                el("li")
                    .class("item")
                    .child(el("span").class("item--child").attr("data-id", "c_1")),
            ),
        );
        let span = doc
            .query(list, &Selector::attr_eq("data-id", "c_1"))
            .unwrap();
        assert_eq!(doc.closest(span, &Selector::class("list")), Some(list));
        assert_eq!(
            doc.query_all(list, &Selector::class_contains("item")).len(),
            2
        );
        let not_child = Selector::All(vec![
            Selector::class_contains("item"),
            Selector::not(Selector::class("item--child")),
        ]);
        assert_eq!(doc.query_all(list, &not_child).len(), 1);
    }

    #[test]
    fn insert_before_reference() {
        let mut doc = Document::new();
        let parent = doc.build(doc.body(), el("div").child(el("b")).child(el("i")));
        let italic = doc.children(parent)[1];
        let badge = doc.build_detached(el("span").text("x"));
        doc.insert_before(parent, badge, Some(italic));
        assert_eq!(doc.inner_html(parent), "<b></b><span>x</span><i></i>");
    }
}
