use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use shadowcheck::annotate::HookRegistry;
use shadowcheck::api::NetworkConfig;
use shadowcheck::config::{self, LoadOptions};
use shadowcheck::dispatch::Scheduler;
use shadowcheck::net::ReqwestFetch;
use shadowcheck::page::Page;
use shadowcheck::{CommentTarget, Engine};
use tracing_subscriber::EnvFilter;

const HELP: &str = "shadowcheck - Find out whether your 9GAG comments are publicly visible.

Usage:
  shadowcheck check --post <key> --app-id <id> --client-version <version>
                    [--unlimited] [--config <path>] <comment-id>[@<parent-id>]...

  --version, -V        Show version and exit
  --help,    -h        Show this help message

Prints `visible`, `suppressed` or `unresolved` for every comment. Replies are
given as <reply-id>@<parent-id>. Set RUST_LOG=debug for progress output.";

fn main() {
    init_tracing();
    if handle_cli_flags() {
        return;
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = match args.first().map(String::as_str) {
        Some("check") => CheckArgs::parse(&args[1..]).and_then(run_check),
        Some(other) => Err(anyhow::anyhow!("unknown command {other:?}, see --help")),
        None => {
            eprintln!("{HELP}");
            std::process::exit(2);
        }
    };
    if let Err(err) = result {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn handle_cli_flags() -> bool {
    let mut saw_flag = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("shadowcheck {}", shadowcheck::VERSION);
                saw_flag = true;
            }
            "--help" | "-h" => {
                println!("{HELP}");
                saw_flag = true;
            }
            _ => {}
        }
    }
    saw_flag
}

#[derive(Debug, Default)]
struct CheckArgs {
    post: Option<String>,
    app_id: Option<String>,
    client_version: Option<String>,
    config_file: Option<PathBuf>,
    unlimited: bool,
    targets: Vec<CommentTarget>,
}

impl CheckArgs {
    fn parse(args: &[String]) -> Result<Self> {
        let mut parsed = CheckArgs::default();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            let mut value = |flag: &str| {
                iter.next()
                    .cloned()
                    .with_context(|| format!("{flag} needs a value"))
            };
            match arg.as_str() {
                "--post" => parsed.post = Some(value("--post")?),
                "--app-id" => parsed.app_id = Some(value("--app-id")?),
                "--client-version" => parsed.client_version = Some(value("--client-version")?),
                "--config" => parsed.config_file = Some(PathBuf::from(value("--config")?)),
                "--unlimited" => parsed.unlimited = true,
                flag if flag.starts_with("--") => bail!("unknown option {flag}"),
                target => parsed.targets.push(target.parse()?),
            }
        }
        if parsed.targets.is_empty() {
            bail!("no comment ids given");
        }
        Ok(parsed)
    }
}

fn run_check(args: CheckArgs) -> Result<()> {
    let post = args.post.context("--post is required")?;
    let network = NetworkConfig {
        app_id: args.app_id.context("--app-id is required")?,
        client_version: args
            .client_version
            .context("--client-version is required")?,
    };

    let mut cfg = config::load(LoadOptions {
        config_file: args.config_file,
        env_prefix: None,
    })?;
    if args.unlimited {
        cfg.search.unlimited = true;
    }

    let fetch = Arc::new(ReqwestFetch::new()?);
    let page = Page::builder(&format!("https://9gag.com/gag/{post}"))
        .fetch(fetch.clone())
        .build()?;
    let scheduler = Scheduler::new();
    let engine = Engine::new(
        Arc::new(page),
        &cfg,
        network,
        fetch,
        HookRegistry::new(),
        scheduler.handle(),
    );

    for resolution in engine.resolve(&args.targets) {
        match resolution.parent_id {
            Some(parent) => println!("{}@{} {}", resolution.comment_id, parent, resolution.verdict),
            None => println!("{} {}", resolution.comment_id, resolution.verdict),
        }
    }
    engine.metrics().log_summary();
    Ok(())
}
