//! Request primitives of the host page and the layer that observes them.
//!
//! The page exposes a fetch-like function and an XHR-like object factory.
//! [`Interceptor::install`] swaps both for observing wrappers that hand every
//! completed exchange to the registered [`ExchangeObserver`]s without changing
//! what the original caller sees.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use parking_lot::{Mutex, RwLock};
use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use crate::page::Page;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".into(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: "POST".into(),
            url: url.into(),
            headers: Vec::new(),
            body: Some(body.into()),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        header_lookup(&self.headers, name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn json_ok(value: &serde_json::Value) -> Self {
        Self::new(200, value.to_string())
    }

    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).context("net: decode json body")
    }
}

fn header_lookup<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// The page's fetch-like primitive.
pub trait Fetch: Send + Sync {
    fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

/// The page's XHR-like object.
pub trait XmlHttpRequest: Send {
    fn open(&mut self, method: &str, url: &str);
    fn set_request_header(&mut self, name: &str, value: &str);
    /// Performs the request; completion is synchronous.
    fn send(&mut self, body: Option<&str>) -> Result<()>;
    fn status(&self) -> u16;
    fn response_text(&self) -> &str;
}

pub trait XhrFactory: Send + Sync {
    fn create(&self) -> Box<dyn XmlHttpRequest>;
}

pub struct ReqwestFetch {
    client: Client,
}

impl ReqwestFetch {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .context("net: build http client")?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Fetch for ReqwestFetch {
    fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .with_context(|| format!("net: invalid method {}", request.method))?;
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        let response = builder
            .send()
            .with_context(|| format!("net: request {}", request.url))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.text().context("net: read body")?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// XHR object that performs its request through a [`Fetch`] primitive.
pub struct FetchXhr {
    fetch: Arc<dyn Fetch>,
    request: Option<HttpRequest>,
    response: Option<HttpResponse>,
}

impl XmlHttpRequest for FetchXhr {
    fn open(&mut self, method: &str, url: &str) {
        self.request = Some(HttpRequest {
            method: method.to_ascii_uppercase(),
            url: url.to_string(),
            headers: Vec::new(),
            body: None,
        });
        self.response = None;
    }

    fn set_request_header(&mut self, name: &str, value: &str) {
        if let Some(request) = self.request.as_mut() {
            request.headers.push((name.to_string(), value.to_string()));
        }
    }

    fn send(&mut self, body: Option<&str>) -> Result<()> {
        let mut request = self
            .request
            .clone()
            .ok_or_else(|| anyhow!("xhr: send called before open"))?;
        request.body = body.map(str::to_string);
        self.response = Some(self.fetch.fetch(&request)?);
        Ok(())
    }

    fn status(&self) -> u16 {
        self.response.as_ref().map(|r| r.status).unwrap_or(0)
    }

    fn response_text(&self) -> &str {
        self.response.as_ref().map(|r| r.body.as_str()).unwrap_or("")
    }
}

pub struct FetchXhrFactory {
    fetch: Arc<dyn Fetch>,
}

impl FetchXhrFactory {
    pub fn new(fetch: Arc<dyn Fetch>) -> Self {
        Self { fetch }
    }
}

impl XhrFactory for FetchXhrFactory {
    fn create(&self) -> Box<dyn XmlHttpRequest> {
        Box::new(FetchXhr {
            fetch: self.fetch.clone(),
            request: None,
            response: None,
        })
    }
}

type Handler = dyn Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync;

/// Scriptable fetch primitive that records every request it serves.
pub struct MockFetch {
    handler: Box<Handler>,
    calls: Mutex<Vec<HttpRequest>>,
    latency: Duration,
}

impl MockFetch {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
        }
    }

    /// Always answers `404` with an empty body.
    pub fn not_found() -> Self {
        Self::new(|_| Ok(HttpResponse::new(404, "")))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> Vec<HttpRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_matching(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|request| request.url.contains(needle))
            .count()
    }
}

impl Fetch for MockFetch {
    fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse> {
        self.calls.lock().push(request.clone());
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        (self.handler)(request)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Via {
    Fetch,
    Xhr,
}

/// One completed request as seen by the interception layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub via: Via,
    pub method: String,
    pub url: String,
    pub request_headers: Vec<(String, String)>,
    pub status: u16,
    /// Only captured for platform URLs.
    pub body: Option<String>,
}

impl Exchange {
    pub fn request_header(&self, name: &str) -> Option<&str> {
        header_lookup(&self.request_headers, name)
    }

    pub fn is_platform(&self) -> bool {
        is_platform_url(&self.url)
    }

    pub fn json(&self) -> Option<serde_json::Value> {
        let body = self.body.as_deref()?.trim_start();
        if !(body.starts_with('{') || body.starts_with('[')) {
            return None;
        }
        serde_json::from_str(body).ok()
    }
}

pub fn is_platform_url(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => parsed
            .host_str()
            .map(|host| host == "9gag.com" || host.ends_with(".9gag.com"))
            .unwrap_or(false),
        Err(_) => url.contains("9gag.com"),
    }
}

pub trait ExchangeObserver: Send + Sync {
    fn observe(&self, exchange: &Exchange);
}

impl<F> ExchangeObserver for F
where
    F: Fn(&Exchange) + Send + Sync,
{
    fn observe(&self, exchange: &Exchange) {
        self(exchange)
    }
}

/// Fan-out point between the wrapped primitives and their observers.
#[derive(Default)]
pub struct ExchangeHub {
    observers: RwLock<Vec<Arc<dyn ExchangeObserver>>>,
}

impl ExchangeHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(&self, observer: Arc<dyn ExchangeObserver>) {
        self.observers.write().push(observer);
    }

    pub fn dispatch(&self, exchange: &Exchange) {
        let observers = self.observers.read().clone();
        for observer in observers {
            observer.observe(exchange);
        }
    }
}

impl fmt::Debug for ExchangeHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeHub")
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

struct ObservedFetch {
    inner: Arc<dyn Fetch>,
    hub: Arc<ExchangeHub>,
}

impl Fetch for ObservedFetch {
    fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let response = self.inner.fetch(request)?;
        let body = is_platform_url(&request.url).then(|| response.body.clone());
        self.hub.dispatch(&Exchange {
            via: Via::Fetch,
            method: request.method.clone(),
            url: request.url.clone(),
            request_headers: request.headers.clone(),
            status: response.status,
            body,
        });
        Ok(response)
    }
}

struct ObservedXhrFactory {
    inner: Arc<dyn XhrFactory>,
    hub: Arc<ExchangeHub>,
}

impl XhrFactory for ObservedXhrFactory {
    fn create(&self) -> Box<dyn XmlHttpRequest> {
        Box::new(ObservedXhr {
            inner: self.inner.create(),
            hub: self.hub.clone(),
            method: String::new(),
            url: None,
            headers: Vec::new(),
        })
    }
}

struct ObservedXhr {
    inner: Box<dyn XmlHttpRequest>,
    hub: Arc<ExchangeHub>,
    method: String,
    url: Option<String>,
    headers: Vec<(String, String)>,
}

impl XmlHttpRequest for ObservedXhr {
    fn open(&mut self, method: &str, url: &str) {
        self.method = method.to_ascii_uppercase();
        self.url = Some(url.to_string());
        self.headers.clear();
        self.inner.open(method, url);
    }

    fn set_request_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
        self.inner.set_request_header(name, value);
    }

    fn send(&mut self, body: Option<&str>) -> Result<()> {
        self.inner.send(body)?;
        if let Some(url) = self.url.take() {
            let body = is_platform_url(&url).then(|| self.inner.response_text().to_string());
            self.hub.dispatch(&Exchange {
                via: Via::Xhr,
                method: self.method.clone(),
                url,
                request_headers: std::mem::take(&mut self.headers),
                status: self.inner.status(),
                body,
            });
        }
        Ok(())
    }

    fn status(&self) -> u16 {
        self.inner.status()
    }

    fn response_text(&self) -> &str {
        self.inner.response_text()
    }
}

/// Result of installing the interception layer on a page.
pub struct Interception {
    native_fetch: Arc<dyn Fetch>,
    observed_fetch: Arc<dyn Fetch>,
    fetch_installed: bool,
    xhr_installed: bool,
}

impl Interception {
    /// The page's fetch as it was before interception; the engine's own
    /// calls go through it so they are not mistaken for page traffic.
    pub fn native_fetch(&self) -> Arc<dyn Fetch> {
        self.native_fetch.clone()
    }

    /// Observing wrapper, usable even when the page slot is read-only.
    pub fn observed_fetch(&self) -> Arc<dyn Fetch> {
        self.observed_fetch.clone()
    }

    pub fn fetch_installed(&self) -> bool {
        self.fetch_installed
    }

    pub fn xhr_installed(&self) -> bool {
        self.xhr_installed
    }
}

pub struct Interceptor;

impl Interceptor {
    pub fn install(page: &Page, hub: Arc<ExchangeHub>) -> Interception {
        let native_fetch = page.fetch().get();
        let observed_fetch: Arc<dyn Fetch> = Arc::new(ObservedFetch {
            inner: native_fetch.clone(),
            hub: hub.clone(),
        });
        let fetch_installed = match page.fetch().replace(observed_fetch.clone()) {
            Ok(_) => true,
            Err(err) => {
                debug!(error = %err, "fetch is read-only, exposing wrapper instead");
                false
            }
        };

        let native_xhr = page.xhr().get();
        let observed_xhr: Arc<dyn XhrFactory> = Arc::new(ObservedXhrFactory {
            inner: native_xhr,
            hub,
        });
        let xhr_installed = match page.xhr().replace(observed_xhr) {
            Ok(_) => true,
            Err(err) => {
                warn!(error = %err, "could not instrument XMLHttpRequest");
                false
            }
        };

        Interception {
            native_fetch,
            observed_fetch,
            fetch_installed,
            xhr_installed,
        }
    }
}
