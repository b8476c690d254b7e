//! The host page: location, cookies, global state, the document and the two
//! request primitives.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::dom::Document;
use crate::net::{Fetch, FetchXhrFactory, HttpRequest, HttpResponse, XhrFactory};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PrimitiveError {
    #[error("page primitive `{0}` is read-only")]
    ReadOnly(&'static str),
}

/// A replaceable page global such as `window.fetch`.
pub struct Primitive<T: ?Sized> {
    name: &'static str,
    slot: RwLock<Arc<T>>,
    writable: bool,
}

impl<T: ?Sized> Primitive<T> {
    fn new(name: &'static str, value: Arc<T>, writable: bool) -> Self {
        Self {
            name,
            slot: RwLock::new(value),
            writable,
        }
    }

    pub fn get(&self) -> Arc<T> {
        self.slot.read().clone()
    }

    /// Installs `value`, returning the previous occupant.
    pub fn replace(&self, value: Arc<T>) -> Result<Arc<T>, PrimitiveError> {
        if !self.writable {
            return Err(PrimitiveError::ReadOnly(self.name));
        }
        Ok(std::mem::replace(&mut *self.slot.write(), value))
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageEvent {
    HashChange { old_url: String, new_url: String },
    PopState,
}

struct Offline;

impl Fetch for Offline {
    fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse> {
        Err(anyhow!("net: no fetch primitive for {}", request.url))
    }
}

pub struct PageBuilder {
    url: String,
    cookies: String,
    globals: Value,
    document: Option<Document>,
    fetch: Option<Arc<dyn Fetch>>,
    xhr: Option<Arc<dyn XhrFactory>>,
    fetch_writable: bool,
    xhr_writable: bool,
}

impl PageBuilder {
    pub fn cookies(mut self, cookies: &str) -> Self {
        self.cookies = cookies.to_string();
        self
    }

    pub fn global(mut self, name: &str, value: Value) -> Self {
        if let Value::Object(map) = &mut self.globals {
            map.insert(name.to_string(), value);
        }
        self
    }

    pub fn document(mut self, document: Document) -> Self {
        self.document = Some(document);
        self
    }

    pub fn fetch(mut self, fetch: Arc<dyn Fetch>) -> Self {
        self.fetch = Some(fetch);
        self
    }

    pub fn xhr(mut self, xhr: Arc<dyn XhrFactory>) -> Self {
        self.xhr = Some(xhr);
        self
    }

    pub fn read_only_fetch(mut self) -> Self {
        self.fetch_writable = false;
        self
    }

    pub fn read_only_xhr(mut self) -> Self {
        self.xhr_writable = false;
        self
    }

    pub fn build(self) -> Result<Page> {
        let location =
            Url::parse(&self.url).with_context(|| format!("page: invalid url {}", self.url))?;
        let fetch = self.fetch.unwrap_or_else(|| Arc::new(Offline));
        let xhr = self
            .xhr
            .unwrap_or_else(|| Arc::new(FetchXhrFactory::new(fetch.clone())));
        Ok(Page {
            location: RwLock::new(location),
            cookies: RwLock::new(self.cookies),
            globals: RwLock::new(self.globals),
            document: Mutex::new(self.document.unwrap_or_default()),
            scroll_y: Mutex::new(0),
            scroll_log: Mutex::new(Vec::new()),
            fetch: Primitive::new("fetch", fetch, self.fetch_writable),
            xhr: Primitive::new("XMLHttpRequest", xhr, self.xhr_writable),
            listeners: Mutex::new(Vec::new()),
        })
    }
}

pub struct Page {
    location: RwLock<Url>,
    cookies: RwLock<String>,
    globals: RwLock<Value>,
    document: Mutex<Document>,
    scroll_y: Mutex<i64>,
    scroll_log: Mutex<Vec<i64>>,
    fetch: Primitive<dyn Fetch>,
    xhr: Primitive<dyn XhrFactory>,
    listeners: Mutex<Vec<Sender<PageEvent>>>,
}

impl Page {
    pub fn builder(url: &str) -> PageBuilder {
        PageBuilder {
            url: url.to_string(),
            cookies: String::new(),
            globals: Value::Object(Default::default()),
            document: None,
            fetch: None,
            xhr: None,
            fetch_writable: true,
            xhr_writable: true,
        }
    }

    pub fn url(&self) -> Url {
        self.location.read().clone()
    }

    pub fn href(&self) -> String {
        self.location.read().as_str().to_string()
    }

    pub fn pathname(&self) -> String {
        self.location.read().path().to_string()
    }

    /// `location.hash`: empty, or the fragment including its leading `#`.
    pub fn hash(&self) -> String {
        match self.location.read().fragment() {
            Some(fragment) if !fragment.is_empty() => format!("#{fragment}"),
            _ => String::new(),
        }
    }

    pub fn cookie(&self) -> String {
        self.cookies.read().clone()
    }

    pub fn set_cookie(&self, name: &str, value: &str) {
        let mut cookies = self.cookies.write();
        let mut pairs: Vec<String> = cookies
            .split(';')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .filter(|pair| pair.split('=').next() != Some(name))
            .map(str::to_string)
            .collect();
        pairs.push(format!("{name}={value}"));
        *cookies = pairs.join("; ");
    }

    pub fn remove_cookie(&self, name: &str) {
        let mut cookies = self.cookies.write();
        *cookies = cookies
            .split(';')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .filter(|pair| pair.split('=').next() != Some(name))
            .collect::<Vec<_>>()
            .join("; ");
    }

    pub fn document(&self) -> MutexGuard<'_, Document> {
        self.document.lock()
    }

    /// Looks up a dotted path below `window`, e.g. `_config.config.appVersion`.
    pub fn global(&self, path: &str) -> Option<Value> {
        let globals = self.globals.read();
        let mut current = &*globals;
        for key in path.split('.') {
            current = current.get(key)?;
        }
        if current.is_null() {
            None
        } else {
            Some(current.clone())
        }
    }

    pub fn set_global(&self, name: &str, value: Value) {
        if let Value::Object(map) = &mut *self.globals.write() {
            map.insert(name.to_string(), value);
        }
    }

    pub fn scroll_y(&self) -> i64 {
        *self.scroll_y.lock()
    }

    pub fn scroll_by(&self, dy: i64) {
        let mut y = self.scroll_y.lock();
        *y = (*y + dy).max(0);
        self.scroll_log.lock().push(*y);
    }

    pub fn scroll_to(&self, y: i64) {
        *self.scroll_y.lock() = y.max(0);
        self.scroll_log.lock().push(y.max(0));
    }

    /// Every scroll position the page has been moved to, in order.
    pub fn scroll_history(&self) -> Vec<i64> {
        self.scroll_log.lock().clone()
    }

    pub fn fetch(&self) -> &Primitive<dyn Fetch> {
        &self.fetch
    }

    pub fn xhr(&self) -> &Primitive<dyn XhrFactory> {
        &self.xhr
    }

    pub fn events(&self) -> Receiver<PageEvent> {
        let (tx, rx) = unbounded();
        self.listeners.lock().push(tx);
        rx
    }

    /// `history.pushState`: moves without firing any event.
    pub fn push_state(&self, url: &str) -> Result<()> {
        let next = self.resolve(url)?;
        *self.location.write() = next;
        Ok(())
    }

    /// Back/forward navigation: moves and fires `popstate`.
    pub fn pop_state(&self, url: &str) -> Result<()> {
        self.push_state(url)?;
        self.emit(PageEvent::PopState);
        Ok(())
    }

    /// Assigns `location.hash`, firing `hashchange` when it differs.
    pub fn set_hash(&self, hash: &str) {
        let fragment = hash.trim_start_matches('#');
        let (old_url, new_url) = {
            let mut location = self.location.write();
            let old_url = location.as_str().to_string();
            location.set_fragment(if fragment.is_empty() {
                None
            } else {
                Some(fragment)
            });
            (old_url, location.as_str().to_string())
        };
        if old_url != new_url {
            self.emit(PageEvent::HashChange { old_url, new_url });
        }
    }

    /// In-app link navigation: a fragment-only change behaves like
    /// [`Page::set_hash`], anything else like [`Page::push_state`].
    pub fn navigate(&self, url: &str) -> Result<()> {
        let next = self.resolve(url)?;
        let current = self.url();
        let mut current_base = current.clone();
        current_base.set_fragment(None);
        let mut next_base = next.clone();
        next_base.set_fragment(None);
        if current_base == next_base {
            self.set_hash(next.fragment().unwrap_or_default());
            Ok(())
        } else {
            *self.location.write() = next;
            Ok(())
        }
    }

    fn resolve(&self, url: &str) -> Result<Url> {
        self.location
            .read()
            .join(url)
            .with_context(|| format!("page: invalid url {url}"))
    }

    fn emit(&self, event: PageEvent) {
        self.listeners
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn read_only_primitive_refuses_replacement() {
        let page = Page::builder("https://9gag.com/").read_only_fetch().build().unwrap();
        let err = page.fetch().replace(Arc::new(Offline)).err();
        assert_eq!(err, Some(PrimitiveError::ReadOnly("fetch")));
        assert!(page.xhr().is_writable());
    }

    #[test]
    fn hash_changes_fire_events() {
        let page = Page::builder("https://9gag.com/gag/abc").build().unwrap();
        let events = page.events();
        assert_eq!(page.hash(), "");
        page.set_hash("#cs_comment_id=c_1");
        assert_eq!(page.hash(), "#cs_comment_id=c_1");
        page.set_hash("cs_comment_id=c_1");
        assert_eq!(
            events.try_iter().collect::<Vec<_>>(),
            vec![PageEvent::HashChange {
                old_url: "https://9gag.com/gag/abc".into(),
                new_url: "https://9gag.com/gag/abc#cs_comment_id=c_1".into(),
            }]
        );
    }

    #[test]
    fn navigate_distinguishes_fragment_moves() {
        let page = Page::builder("https://9gag.com/gag/abc").build().unwrap();
        let events = page.events();
        page.navigate("/gag/xyz").unwrap();
        assert_eq!(page.pathname(), "/gag/xyz");
        assert!(events.try_recv().is_err());
        page.navigate("#comments").unwrap();
        assert!(matches!(events.try_recv(), Ok(PageEvent::HashChange { .. })));
        page.pop_state("/gag/abc").unwrap();
        assert_eq!(events.try_recv(), Ok(PageEvent::PopState));
    }

    #[test]
    fn cookies_and_globals() {
        let page = Page::builder("https://9gag.com/")
            .cookies("PHPSESSID=abc; theme=dark")
            .global("_config", json!({"config": {"appVersion": "1.2"}}))
            .build()
            .unwrap();
        page.set_cookie("PHPSESSID", "deleted");
        assert_eq!(page.cookie(), "theme=dark; PHPSESSID=deleted");
        page.remove_cookie("theme");
        assert_eq!(page.cookie(), "PHPSESSID=deleted");
        assert_eq!(page.global("_config.config.appVersion"), Some(json!("1.2")));
        assert_eq!(page.global("_config.missing"), None);
    }

    #[test]
    fn scroll_is_clamped_and_recorded() {
        let page = Page::builder("https://9gag.com/").build().unwrap();
        page.scroll_by(100);
        page.scroll_to(-5);
        assert_eq!(page.scroll_y(), 0);
        assert_eq!(page.scroll_history(), vec![100, 0]);
    }
}
