//! One page view: installs interception, starts the monitors, waits for the
//! platform configuration, then hands control to the engine. Also answers the
//! popup's commands.

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::acquire::{validate_configuration, ConfigAcquirer, ConfigError};
use crate::annotate::HookRegistry;
use crate::api::{AddCommentResponse, CommentListResponse, NewComment};
use crate::config::{self, Config};
use crate::dispatch::{Scheduler, SchedulerHandle};
use crate::engine::Engine;
use crate::identity::IdentityMonitor;
use crate::navigation::NavigationMonitor;
use crate::net::{Exchange, ExchangeHub, Interception, Interceptor};
use crate::page::Page;
use crate::watcher::MutationWatcher;

const BUFFERED_LISTING_DELAY: Duration = Duration::from_millis(500);
const BUFFERED_NEW_COMMENT_DELAY: Duration = Duration::from_millis(1000);
const NOT_INITIALIZED: &str = "Extension not initialized";

/// Inbound message from the popup or background context.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Command {
    SetEnabled {
        enabled: bool,
        #[serde(default)]
        settings: Option<Value>,
    },
    SettingsChanged {
        settings: Value,
    },
    Ping,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Reply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initialized: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Page traffic seen before the engine exists.
#[derive(Default)]
struct Buffered {
    listings: Vec<(String, CommentListResponse)>,
    created: Vec<NewComment>,
}

pub struct Extension {
    page: Arc<Page>,
    config: Config,
    hooks: HookRegistry,
    settings_store: Option<PathBuf>,
    scheduler: Scheduler,
    _hub: Arc<ExchangeHub>,
    interception: Interception,
    identity: IdentityMonitor,
    navigation: NavigationMonitor,
    acquirer: ConfigAcquirer,
    engine: RwLock<Option<Arc<Engine>>>,
    watcher: Mutex<Option<MutationWatcher>>,
    buffered: Mutex<Buffered>,
    configuration_error: Mutex<Option<String>>,
}

impl Extension {
    /// Instruments the page's request primitives right away so nothing the
    /// page sends from here on is missed. Monitors stay idle until
    /// [`Extension::start`].
    pub fn new(
        page: Arc<Page>,
        config: Config,
        hooks: HookRegistry,
        settings_store: Option<PathBuf>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Extension>| {
            let hub = ExchangeHub::new();
            let interception = Interceptor::install(&page, hub.clone());
            let identity = IdentityMonitor::new(page.clone(), &config.timing);
            let navigation = NavigationMonitor::new(page.clone(), &config.timing);
            let acquirer = ConfigAcquirer::new(page.clone(), &config.timing);

            hub.subscribe(identity.observer());
            hub.subscribe(acquirer.observer());
            let capture = me.clone();
            hub.subscribe(Arc::new(move |exchange: &Exchange| {
                if let Some(extension) = capture.upgrade() {
                    extension.capture(exchange);
                }
            }));

            Self {
                page,
                config,
                hooks,
                settings_store,
                scheduler: Scheduler::new(),
                _hub: hub,
                interception,
                identity,
                navigation,
                acquirer,
                engine: RwLock::new(None),
                watcher: Mutex::new(None),
                buffered: Mutex::new(Buffered::default()),
                configuration_error: Mutex::new(None),
            }
        })
    }

    pub fn engine(&self) -> Option<Arc<Engine>> {
        self.engine.read().clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.engine.read().is_some()
    }

    /// Why initialisation failed, if it did.
    pub fn configuration_error(&self) -> Option<String> {
        self.configuration_error.lock().clone()
    }

    pub fn scheduler(&self) -> SchedulerHandle {
        self.scheduler.handle()
    }

    pub fn interception(&self) -> &Interception {
        &self.interception
    }

    pub fn identity(&self) -> &IdentityMonitor {
        &self.identity
    }

    pub fn acquirer(&self) -> &ConfigAcquirer {
        &self.acquirer
    }

    /// Blocks until the app id and client version are known, then starts
    /// reconciliation. Without them nothing is checked and the reason is
    /// kept for [`Extension::configuration_error`].
    pub fn start(&self) -> Result<(), ConfigError> {
        if self.is_initialized() {
            debug!("already initialized");
            return Ok(());
        }
        self.navigation.start();
        self.acquirer.start();
        self.identity.start();

        let network = match self.acquirer.wait(self.config.timing.config_timeout) {
            Ok(network) => network,
            Err(err) => {
                error!(error = %err, "platform configuration unavailable, not checking comments");
                *self.configuration_error.lock() = Some(err.to_string());
                return Err(err);
            }
        };
        validate_configuration(&self.acquirer.config(), &self.config.timing);
        *self.configuration_error.lock() = None;

        let engine = Engine::new(
            self.page.clone(),
            &self.config,
            network,
            self.interception.native_fetch(),
            self.hooks.clone(),
            self.scheduler.handle(),
        );

        let handle = self.scheduler.handle();
        {
            let engine = engine.clone();
            let handle = handle.clone();
            self.identity.on_change(move |user| {
                let engine = engine.clone();
                let user = user.map(str::to_string);
                handle.post(move || engine.handle_user_change(user));
            });
        }
        // seed after registering so no change falls between the two
        engine.set_current_user(self.identity.current_user());
        {
            let engine = engine.clone();
            handle.post(move || engine.start());
        }
        {
            let engine = engine.clone();
            let handle = handle.clone();
            self.navigation.on_change(move |event| {
                let engine = engine.clone();
                let event = event.clone();
                handle.post(move || engine.handle_navigation(&event));
            });
        }

        let watcher = MutationWatcher::new(
            self.page.clone(),
            engine.clone(),
            handle.clone(),
            &self.config.timing,
        );
        watcher.start();
        *self.watcher.lock() = Some(watcher);

        // publish under the buffer lock so no capture falls between the two
        let buffered = {
            let mut buffered = self.buffered.lock();
            *self.engine.write() = Some(engine.clone());
            std::mem::take(&mut *buffered)
        };
        self.replay(&engine, buffered);

        info!(
            app_id = %engine.network().app_id,
            user = ?engine.current_user(),
            "initialized"
        );
        Ok(())
    }

    fn replay(&self, engine: &Arc<Engine>, buffered: Buffered) {
        let handle = self.scheduler.handle();
        if !buffered.listings.is_empty() {
            debug!(count = buffered.listings.len(), "replaying buffered comment listings");
            let engine = engine.clone();
            handle.post_after(BUFFERED_LISTING_DELAY, move || {
                for (url, listing) in &buffered.listings {
                    engine.handle_list_capture(url, listing);
                }
            });
        }
        if !buffered.created.is_empty() {
            debug!(count = buffered.created.len(), "replaying buffered new comments");
            let engine = engine.clone();
            handle.post_after(BUFFERED_NEW_COMMENT_DELAY, move || {
                for comment in &buffered.created {
                    engine.handle_new_comment(comment);
                }
            });
        }
    }

    /// Picks comment listings and comment creations out of the page's own
    /// traffic.
    fn capture(&self, exchange: &Exchange) {
        if !exchange.is_platform() {
            return;
        }
        let Some(body) = exchange.body.as_deref() else {
            return;
        };
        if same_endpoint(&exchange.url, &self.config.api.comment_list_url) {
            let listing = match serde_json::from_str::<CommentListResponse>(body) {
                Ok(listing) => listing,
                Err(err) => {
                    debug!(url = %exchange.url, error = %err, "unreadable comment listing");
                    return;
                }
            };
            let mut buffered = self.buffered.lock();
            match self.engine() {
                Some(engine) => {
                    let url = exchange.url.clone();
                    self.scheduler
                        .handle()
                        .post(move || engine.handle_list_capture(&url, &listing));
                }
                None => buffered.listings.push((exchange.url.clone(), listing)),
            }
        } else if same_endpoint(&exchange.url, &self.config.api.add_comment_url) {
            let Some(created) = serde_json::from_str::<AddCommentResponse>(body)
                .ok()
                .and_then(AddCommentResponse::created)
            else {
                debug!("comment creation did not succeed");
                return;
            };
            info!(comment_id = ?created.comment_id, "comment posted");
            let mut buffered = self.buffered.lock();
            match self.engine() {
                Some(engine) => self
                    .scheduler
                    .handle()
                    .post_after(self.config.timing.new_comment_delay, move || {
                        engine.handle_new_comment(&created)
                    }),
                None => buffered.created.push(created),
            }
        }
    }

    pub fn handle(&self, command: Command) -> Reply {
        let Some(engine) = self.engine() else {
            return match command {
                Command::Ping => Reply {
                    success: true,
                    initialized: Some(false),
                    ..Reply::default()
                },
                _ => Reply::failed(NOT_INITIALIZED),
            };
        };
        match command {
            Command::SetEnabled { enabled, settings } => {
                if let Some(patch) = settings {
                    if let Err(err) = self.apply_settings(&engine, &patch) {
                        warn!(error = %err, "rejected settings");
                        return Reply::failed(err.to_string());
                    }
                }
                Reply {
                    success: true,
                    enabled: Some(engine.set_enabled(enabled)),
                    ..Reply::default()
                }
            }
            Command::SettingsChanged { settings } => match self.apply_settings(&engine, &settings) {
                Ok(true) => Reply::ok(),
                Ok(false) => {
                    if engine.is_enabled() {
                        let engine = engine.clone();
                        self.scheduler.handle().post(move || engine.reprocess_all());
                    }
                    Reply::ok()
                }
                Err(err) => {
                    warn!(error = %err, "rejected settings");
                    Reply::failed(err.to_string())
                }
            },
            Command::Ping => Reply {
                success: true,
                initialized: Some(true),
                ..Reply::default()
            },
        }
    }

    /// Decodes a JSON command and encodes the reply. Malformed commands get
    /// a failure reply rather than an error.
    pub fn handle_json(&self, raw: &str) -> Result<String> {
        let reply = match serde_json::from_str::<Command>(raw) {
            Ok(command) => self.handle(command),
            Err(err) => Reply::failed(format!("invalid command: {err}")),
        };
        serde_json::to_string(&reply).context("extension: failed to encode reply")
    }

    /// Returns whether the marking changed; in that case the engine has
    /// already queued a full re-mark.
    fn apply_settings(&self, engine: &Engine, patch: &Value) -> Result<bool> {
        let marking_changed = engine.update_settings(patch)?;
        if let Some(path) = &self.settings_store {
            match config::save_settings(Some(path.clone()), &engine.settings()) {
                Ok(path) => debug!(path = %path.display(), "settings saved"),
                Err(err) => warn!(error = %err, "could not save settings"),
            }
        }
        Ok(marking_changed)
    }

    pub fn stop(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.stop();
        }
        self.identity.stop();
        self.navigation.stop();
        self.acquirer.stop();
        self.scheduler.shutdown();
    }
}

impl Drop for Extension {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Same host and path, ignoring the query.
fn same_endpoint(url: &str, endpoint: &str) -> bool {
    match (Url::parse(url), Url::parse(endpoint)) {
        (Ok(url), Ok(endpoint)) => {
            url.host_str() == endpoint.host_str() && url.path() == endpoint.path()
        }
        _ => false,
    }
}
