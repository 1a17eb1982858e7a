// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Url;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

use fileproxy::{
    format_bytes, DownloadProxy, ProxyConfig, ProxyError, ProxyObserver, TransferProgress,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    pub const SUCCESS: i32 = 0;
    /// General error - download failed
    pub const ERROR: i32 = 1;
    /// Data error - URL cannot be proxied
    pub const DATA_ERR: i32 = 65;
    /// Temporary failure - storage budget exhausted
    pub const TEMP_FAIL: i32 = 75;
}

/// fileproxy - resolve URLs to local files, downloading in the background.
#[derive(Parser)]
#[command(name = "fileproxy")]
#[command(version = VERSION)]
#[command(about = "Resolve URLs to local files, downloading them in the background.")]
#[command(long_about = "fileproxy - local-or-remote file proxy\n\n\
    Fetch a file:        fileproxy fetch https://example.com/a.png --wait\n\
    Check if local:      fileproxy fetch https://example.com/a.png --no-start\n\
    Delete one file:     fileproxy remove https://example.com/a.png\n\
    Delete the rest:     fileproxy clear --keep https://example.com/a.png\n\
    Disk usage:          fileproxy usage")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON configuration file
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Verbose mode: log proxy internals to stderr
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a URL, downloading it if it is not local yet
    Fetch {
        url: Url,

        /// Only report whether the file is local; never download
        #[arg(long, conflicts_with = "wait")]
        no_start: bool,

        /// Wait for the download to finish and print the local path
        #[arg(long)]
        wait: bool,
    },

    /// Delete the local copy of a URL
    Remove { url: Url },

    /// Delete every local file, optionally keeping some
    Clear {
        /// URLs whose local copies survive
        #[arg(long, value_name = "URL")]
        keep: Vec<Url>,
    },

    /// Show disk usage against the budget
    Usage,
}

/// How a waited-for download ended.
#[derive(Debug, Clone)]
enum Outcome {
    Stored(PathBuf),
    Failed(String),
}

/// Observer driving the terminal: a progress bar while fetching, and
/// unconditional approval of deletions the user asked for.
struct CliObserver {
    bar: ProgressBar,
    progress: Mutex<TransferProgress>,
    outcome: Mutex<Option<Outcome>>,
    done: Notify,
    approve_removal: bool,
}

impl CliObserver {
    fn new(approve_removal: bool) -> Self {
        let bar = ProgressBar::hidden();
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.cyan} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        Self {
            bar,
            progress: Mutex::new(TransferProgress::new()),
            outcome: Mutex::new(None),
            done: Notify::new(),
            approve_removal,
        }
    }

    fn show(&self, url: &Url) {
        self.bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        self.bar.set_message(url.to_string());
        self.bar.enable_steady_tick(Duration::from_millis(120));
    }

    fn settle(&self, outcome: Outcome) {
        let mut slot = self.outcome.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(outcome);
            self.bar.finish_and_clear();
            self.done.notify_one();
        }
    }

    async fn wait(&self) -> Outcome {
        loop {
            let notified = self.done.notified();
            if let Some(outcome) = self
                .outcome
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
            {
                return outcome;
            }
            notified.await;
        }
    }
}

impl ProxyObserver for CliObserver {
    fn on_progress(&self, _url: &Url, _bytes: u64, total_written: u64, total_expected: Option<u64>) {
        let mut progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
        progress.update(total_written, total_expected);
        if let Some(total) = progress.total_expected {
            self.bar.set_length(total);
        }
        self.bar.set_position(total_written);
        if let Some(speed) = progress.speed_string() {
            match progress.eta_string() {
                Some(eta) => self.bar.set_message(format!("{} (ETA {})", speed, eta)),
                None => self.bar.set_message(speed),
            }
        }
    }

    fn on_success(&self, _url: &Url, local_path: &Path) {
        self.settle(Outcome::Stored(local_path.to_path_buf()));
    }

    fn on_error(&self, _url: Option<&Url>, error: Option<&ProxyError>) {
        let message = error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "download rejected".to_string());
        self.settle(Outcome::Failed(message));
    }

    fn on_failure(&self, _url: &Url, error: &ProxyError) {
        self.settle(Outcome::Failed(error.to_string()));
    }

    fn validate_removal(&self, _url: &Url, _modified_at: DateTime<Utc>) -> bool {
        self.approve_removal
    }

    fn allows_cellular_access(&self) -> bool {
        true
    }

    fn is_discretionary(&self) -> bool {
        false
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "fileproxy=debug" } else { "fileproxy=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<ProxyConfig> {
    let config = match path {
        Some(path) => ProxyConfig::load(path)?,
        None => ProxyConfig::default(),
    };
    Ok(config.with_env_overrides())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = load_config(cli.config.as_deref())?;

    let approve_removal = matches!(cli.command, Commands::Remove { .. } | Commands::Clear { .. });
    let observer = Arc::new(CliObserver::new(approve_removal));
    let proxy = DownloadProxy::with_http_transport(config, &observer)
        .context("Failed to open proxy directory")?;

    let code = match cli.command {
        Commands::Fetch {
            url,
            no_start,
            wait,
        } => fetch(&proxy, &observer, &url, !no_start, wait).await?,
        Commands::Remove { url } => remove(&proxy, &url),
        Commands::Clear { keep } => clear(&proxy, &keep)?,
        Commands::Usage => usage(&proxy)?,
    };

    proxy.invalidate();
    std::process::exit(code);
}

async fn fetch(
    proxy: &DownloadProxy,
    observer: &CliObserver,
    url: &Url,
    start: bool,
    wait: bool,
) -> Result<i32> {
    let resolved = match proxy.resolve_with(url, start, None).await {
        Ok(resolved) => resolved,
        Err(e) if e.is_budget_exceeded() => {
            eprintln!("{} {}", "[!]".yellow(), e);
            eprintln!("    Free space with `fileproxy clear` and retry.");
            return Ok(exit_codes::TEMP_FAIL);
        }
        Err(e @ ProxyError::InvalidUrl(_)) => {
            eprintln!("{} {}", "[X]".red(), e);
            return Ok(exit_codes::DATA_ERR);
        }
        Err(e) => return Err(e).context("Failed to resolve URL"),
    };

    if resolved.scheme() == "file" {
        println!("{} {}", "[OK]".green(), resolved);
        return Ok(exit_codes::SUCCESS);
    }
    if !start {
        println!("{} not local: {}", "[-]".dimmed(), url);
        return Ok(exit_codes::SUCCESS);
    }
    if !wait {
        println!("{} downloading {}", "[..]".cyan(), url);
        return Ok(exit_codes::SUCCESS);
    }

    observer.show(url);
    match observer.wait().await {
        Outcome::Stored(path) => {
            println!("{} {}", "[OK]".green(), path.display());
            Ok(exit_codes::SUCCESS)
        }
        Outcome::Failed(message) => {
            eprintln!("{} {}: {}", "[X]".red(), url, message);
            Ok(exit_codes::ERROR)
        }
    }
}

fn remove(proxy: &DownloadProxy, url: &Url) -> i32 {
    match proxy.remove_file(url) {
        Some(path) => {
            println!("{} removed {}", "[OK]".green(), path.display());
            exit_codes::SUCCESS
        }
        None => {
            println!("{} no local copy of {}", "[-]".dimmed(), url);
            exit_codes::SUCCESS
        }
    }
}

fn clear(proxy: &DownloadProxy, keep: &[Url]) -> Result<i32> {
    let removed = proxy
        .remove_all_except(keep)
        .context("Failed to clear proxy directory")?;
    println!("{} removed {} file(s)", "[OK]".green(), removed);
    Ok(exit_codes::SUCCESS)
}

fn usage(proxy: &DownloadProxy) -> Result<i32> {
    let used = proxy.total_bytes().context("Failed to measure proxy directory")?;
    let max = proxy.config().max_bytes;
    let percent = if max == 0 {
        100.0
    } else {
        used as f64 / max as f64 * 100.0
    };
    println!("{}", proxy.config().directory.display().to_string().bold());
    let line = format!(
        "  {} of {} used ({:.1}%)",
        format_bytes(used),
        format_bytes(max),
        percent
    );
    if used >= max {
        println!("{}", line.red());
    } else {
        println!("{}", line);
    }
    Ok(exit_codes::SUCCESS)
}
