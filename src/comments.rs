//! Host page markup contract for comments and post pages.
//!
//! Selectors here mirror the platform's markup. A markup change on the
//! platform's side breaks these lookups without being a bug in the engine.

use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::Regex;

use crate::dom::{Document, NodeId, Selector};

pub const COMMENT_ID_PARAM: &str = "cs_comment_id=";

static COMMENT_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"cs_comment_id=(c_\d+)").expect("static comment id pattern"));
static USERNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/u/([^/?#]+)").expect("static username pattern"));
static POST_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/gag/([^/?]+)").expect("static post key pattern"));

static COMMENT_ITEM: Lazy<Selector> = Lazy::new(|| Selector::class("comment-item"));
static TOP_LEVEL_ITEM: Lazy<Selector> = Lazy::new(|| {
    Selector::All(vec![
        Selector::class("comment-item"),
        Selector::not(Selector::class(REPLY_CLASS)),
    ])
});
static LIST_ITEM: Lazy<Selector> = Lazy::new(|| Selector::class("comment-list-item"));
static USERNAME_LINK: Lazy<Selector> =
    Lazy::new(|| Selector::class("ui-comment-header__username"));
static TIME_LINK: Lazy<Selector> = Lazy::new(|| Selector::class("ui-comment-header__time"));

pub const REPLY_CLASS: &str = "comment-item--child";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Post,
    Comment,
}

/// A rendered comment as read from the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentElement {
    pub node: NodeId,
    pub comment_id: Option<String>,
    pub author: Option<String>,
    pub is_reply: bool,
}

impl CommentElement {
    pub fn read(doc: &Document, node: NodeId) -> Self {
        Self {
            node,
            comment_id: extract_comment_id(doc, node),
            author: extract_author(doc, node),
            is_reply: is_reply(doc, node),
        }
    }
}

/// `.comment-list-item .comment-item`, in document order.
pub fn find_all_comments(doc: &Document) -> Vec<NodeId> {
    doc.query_all(doc.body(), &COMMENT_ITEM)
        .into_iter()
        .filter(|node| {
            doc.parent(*node)
                .and_then(|parent| doc.closest(parent, &LIST_ITEM))
                .is_some()
        })
        .collect()
}

pub fn extract_comment_id_from(text: &str) -> Option<String> {
    COMMENT_ID_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn extract_username_from_href(href: &str) -> Option<String> {
    let raw = USERNAME_RE.captures(href)?.get(1)?.as_str();
    Some(percent_decode_str(raw).decode_utf8_lossy().into_owned())
}

/// The id embedded in the comment's timestamp link.
pub fn extract_comment_id(doc: &Document, comment: NodeId) -> Option<String> {
    let link = doc.query(comment, &TIME_LINK)?;
    extract_comment_id_from(doc.attr(link, "href")?)
}

pub fn extract_author(doc: &Document, comment: NodeId) -> Option<String> {
    let link = doc.query(comment, &USERNAME_LINK)?;
    extract_username_from_href(doc.attr(link, "href")?)
}

pub fn is_reply(doc: &Document, comment: NodeId) -> bool {
    doc.has_class(comment, REPLY_CLASS)
}

/// Walks up from a reply; at each ancestor the first non-reply comment
/// below it is the parent.
pub fn find_parent_comment_id(doc: &Document, reply: NodeId) -> Option<String> {
    let mut current = doc.parent(reply);
    while let Some(ancestor) = current {
        if let Some(parent) = doc.query(ancestor, &TOP_LEVEL_ITEM) {
            return extract_comment_id(doc, parent);
        }
        current = doc.parent(ancestor);
    }
    None
}

/// Locates a comment by id, falling back to attribute lookups when the
/// timestamp link is not rendered yet.
pub fn find_comment_by_id(doc: &Document, comment_id: &str) -> Option<NodeId> {
    if let Some(node) = find_all_comments(doc)
        .into_iter()
        .find(|node| extract_comment_id(doc, *node).as_deref() == Some(comment_id))
    {
        return Some(node);
    }

    let body = doc.body();
    let fallbacks = [
        Selector::attr_eq("data-comment-id", comment_id),
        Selector::attr_contains("id", comment_id),
        Selector::attr_contains("class", comment_id),
        Selector::All(vec![
            Selector::class("comment"),
            Selector::attr_eq("data-id", comment_id),
        ]),
    ];
    for selector in &fallbacks {
        if let Some(node) = doc.query(body, selector) {
            return Some(node);
        }
    }

    let candidates = Selector::Any(vec![
        Selector::class("comment"),
        Selector::class_contains("comment"),
        Selector::AttrContains("data-comment-id".into(), String::new()),
    ]);
    doc.query_all(body, &candidates).into_iter().find(|node| {
        ["data-comment-id", "id", "data-id", "class"]
            .iter()
            .any(|attr| {
                doc.attr(*node, attr)
                    .map(|value| value.contains(comment_id))
                    .unwrap_or(false)
            })
    })
}

/// Comments by `username`, in document order.
pub fn find_user_comments(doc: &Document, username: &str) -> Vec<CommentElement> {
    find_all_comments(doc)
        .into_iter()
        .map(|node| CommentElement::read(doc, node))
        .filter(|comment| comment.author.as_deref() == Some(username))
        .collect()
}

pub fn is_post_page(pathname: &str) -> bool {
    pathname.contains("/gag/")
}

pub fn post_key(pathname: &str) -> Option<String> {
    POST_KEY_RE
        .captures(pathname)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn page_type(hash: &str) -> PageType {
    if hash.contains(COMMENT_ID_PARAM) {
        PageType::Comment
    } else {
        PageType::Post
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::dom::{el, Document, ElementSpec, NodeId};

    pub fn comment(id: &str, author: &str, reply: bool) -> ElementSpec {
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

    /// Appends a thread (a top-level comment plus its replies) to `list`.
    pub fn thread(
        doc: &mut Document,
        list: NodeId,
        top: (&str, &str),
        replies: &[(&str, &str)],
    ) -> NodeId {
        let mut item = el("div").class("comment-list-item").child(comment(top.0, top.1, false));
        if !replies.is_empty() {
            let mut children = el("div").class("comment-list-item__replies");
            for (id, author) in replies {
                children = children.child(comment(id, author, true));
            }
            item = item.child(children);
        }
        doc.build(list, item)
    }

    pub fn comment_list(doc: &mut Document) -> NodeId {
        let body = doc.body();
        doc.build(body, el("section").class("comment-list"))
    }
}
