//! Logging setup for the IPC gateway, modeled after `devolutions-log`:
//! a rolling file appender paired with a stdout layer, both non-blocking,
//! plus a background deleter task that prunes old log files.

#[macro_use]
extern crate tracing;

use std::io;
use std::time::SystemTime;

use anyhow::Context as _;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use ipc_task::{ShutdownSignal, Task};
use tokio::fs;
use tokio::time::{sleep, Duration};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub trait StaticLogConfig {
    const MAX_BYTES_PER_LOG_FILE: u64;
    const MAX_LOG_FILES: usize;
    const LOG_FILE_PREFIX: &'static str;
}

pub struct LoggerGuard {
    _file_guard: WorkerGuard,
    _stdio_guard: WorkerGuard,
}

struct LogPathCfg<'a, C: StaticLogConfig> {
    folder: &'a Utf8Path,
    prefix: &'a str,
    _phantom: std::marker::PhantomData<C>,
}

impl<'a, C: StaticLogConfig> LogPathCfg<'a, C> {
    fn from_path(path: &'a Utf8Path) -> anyhow::Result<Self> {
        if path.is_dir() {
            Ok(Self {
                folder: path,
                prefix: C::LOG_FILE_PREFIX,
                _phantom: std::marker::PhantomData,
            })
        } else {
            Ok(Self {
                folder: path.parent().context("invalid log path (parent)")?,
                prefix: path.file_name().context("invalid log path (file_name)")?,
                _phantom: std::marker::PhantomData,
            })
        }
    }
}

/// Initializes the global `tracing` subscriber with a rolling file layer and a stdout layer.
pub fn init<C: StaticLogConfig>(
    path: &Utf8Path,
    log_filter: &str,
    debug_filtering_directives: Option<&str>,
) -> anyhow::Result<LoggerGuard> {
    let log_cfg = LogPathCfg::<C>::from_path(path)?;

    let file_appender = rolling::Builder::new()
        .rotation(rolling::Rotation::max_bytes(C::MAX_BYTES_PER_LOG_FILE))
        .filename_prefix(log_cfg.prefix)
        .filename_suffix("log")
        .max_log_files(C::MAX_LOG_FILES)
        .build(log_cfg.folder)
        .context("couldn't create file appender")?;
    let (file_non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer().with_writer(file_non_blocking).with_ansi(false);

    let (non_blocking_stdio, stdio_guard) = tracing_appender::non_blocking(io::stdout());
    let stdio_layer = fmt::layer().with_writer(non_blocking_stdio);

    let env_filter = EnvFilter::try_new(log_filter).context("invalid built-in filtering directives")?;

    let env_filter = debug_filtering_directives
        .into_iter()
        .flat_map(|directives| directives.split(','))
        .fold(env_filter, |env_filter, directive| {
            match directive.parse() {
                Ok(directive) => env_filter.add_directive(directive),
                Err(_) => env_filter,
            }
        });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdio_layer)
        .with(env_filter)
        .init();

    Ok(LoggerGuard {
        _file_guard: file_guard,
        _stdio_guard: stdio_guard,
    })
}

/// Deletes log files older than `max_age` once per sweep interval.
pub struct LogDeleterTask<C: StaticLogConfig> {
    path: Utf8PathBuf,
    max_age: Duration,
    sweep_interval: Duration,
    _phantom: std::marker::PhantomData<C>,
}

impl<C: StaticLogConfig> LogDeleterTask<C> {
    pub fn new(path: Utf8PathBuf, max_age: Duration, sweep_interval: Duration) -> Self {
        Self {
            path,
            max_age,
            sweep_interval,
            _phantom: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<C: StaticLogConfig + Send> Task for LogDeleterTask<C> {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "log deleter";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let cfg = LogPathCfg::<C>::from_path(&self.path)?;

        loop {
            tokio::select! {
                _ = sleep(self.sweep_interval) => {
                    if let Err(error) = sweep_old_logs(cfg.folder, cfg.prefix, self.max_age).await {
                        warn!(%error, "Log sweep failed");
                    }
                }
                _ = shutdown_signal.wait() => {
                    debug!("Closing log deleter task...");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn sweep_old_logs(folder: &Utf8Path, prefix: &str, max_age: Duration) -> anyhow::Result<()> {
    let mut read_dir = fs::read_dir(folder).await.context("couldn't read log directory")?;
    let now = SystemTime::now();

    while let Ok(Some(entry)) = read_dir.next_entry().await {
        let Some(file_name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };

        if !file_name.starts_with(prefix) {
            continue;
        }

        let Ok(metadata) = entry.metadata().await else { continue };
        let Ok(modified) = metadata.modified() else { continue };

        if now.duration_since(modified).unwrap_or_default() > max_age {
            if let Err(error) = fs::remove_file(entry.path()).await {
                warn!(%error, file_name, "Couldn't delete stale log file");
            } else {
                debug!(file_name, "Deleted stale log file");
            }
        }
    }

    Ok(())
}
