#![allow(clippy::uninlined_format_args)]

pub mod acquire;
pub mod annotate;
pub mod api;
pub mod comments;
pub mod config;
pub mod dispatch;
pub mod dom;
pub mod engine;
pub mod extension;
pub mod flight;
pub mod identity;
pub mod metrics;
pub mod navigation;
pub mod net;
pub mod page;
pub mod watcher;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use engine::{CommentTarget, Engine, Resolution, Verdict};
pub use extension::{Command, Extension, Reply};
