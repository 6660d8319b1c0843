//! The background dispatcher
//!
//! A mutating foreground operation never waits on the network: it commits to
//! the cache, asks the dispatcher to run, and returns. The dispatcher re-execs
//! the current binary as a detached child (fresh process group, no inherited
//! stdio) which drains the journal of every configured remote under a
//! per-remote deadline and logs to a per-invocation file.
//!
//! Inside a test harness there is no binary with a drain subcommand to
//! re-exec, so the same drain future runs on an in-process task instead.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use chrono::Utc;

use crate::cache::Cache;
use crate::config::Config;
use crate::error::{CbError, CbResult};
use crate::registry;
use crate::sync::{SyncEngine, SyncReport};

/// The argument the re-execed child is started with; the CLI shell routes it
/// to [`Dispatcher::run_detached_entry`]
pub const SYNC_DAEMON_ARG: &str = "sync-daemon";

/// Outer deadline for one remote; HTTP requests carry their own shorter one
const REMOTE_DEADLINE: Duration = Duration::from_secs(10);

/// Override that forces the in-process path regardless of detection
const INPROCESS_ENV: &str = "CORKBOARD_INPROCESS_SYNC";

/// Rust test binaries always live under `target/**/deps/`; re-execing one
/// would invoke a non-existent subcommand, so the drain runs in-process there
pub fn in_test_harness() -> bool {
    if std::env::var(INPROCESS_ENV).map(|v| v == "1").unwrap_or(false) {
        return true;
    }
    std::env::current_exe()
        .map(|exe| exe.components().any(|c| c.as_os_str() == "deps"))
        .unwrap_or(false)
}

/// Start a detached child in a fresh process group with no inherited stdio
#[cfg(unix)]
pub fn spawn_detached(binary: &Path, args: &[String]) -> std::io::Result<()> {
    use std::os::unix::process::CommandExt;
    Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .map(|_| ())
}

/// Start a detached child in a new process group with no inherited stdio
#[cfg(windows)]
pub fn spawn_detached(binary: &Path, args: &[String]) -> std::io::Result<()> {
    use std::os::windows::process::CommandExt;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .creation_flags(CREATE_NEW_PROCESS_GROUP | DETACHED_PROCESS)
        .spawn()
        .map(|_| ())
}

/// Drives journal drains for every configured remote
#[derive(Clone, Debug)]
pub struct Dispatcher {
    config: Config,
    config_path: Option<PathBuf>,
}

impl Dispatcher {
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Self {
        Self {
            config,
            config_path,
        }
    }

    /// Fire-and-forget: ask for a background drain and return immediately.
    ///
    /// Must be called from within a tokio runtime (the facade always is); the
    /// in-harness path spawns the drain on it.
    pub fn request_run(&self) -> CbResult<()> {
        if in_test_harness() {
            let config = self.config.clone();
            tokio::spawn(async move {
                drain_all(&config).await;
            });
            return Ok(());
        }

        let binary = std::env::current_exe().map_err(|source| CbError::Storage {
            path: PathBuf::from("current executable"),
            source,
        })?;
        let mut args = Vec::new();
        if let Some(path) = &self.config_path {
            args.push("--config".to_string());
            args.push(path.display().to_string());
        }
        args.push(SYNC_DAEMON_ARG.to_string());

        spawn_detached(&binary, &args).map_err(|source| CbError::Storage {
            path: binary,
            source,
        })
    }

    /// The body of the detached child: set up the per-invocation log file,
    /// then drain every remote once and exit.
    pub async fn run_detached_entry(&self) -> CbResult<()> {
        let log_dir = self.config.log_dir();
        std::fs::create_dir_all(&log_dir).map_err(|source| CbError::Storage {
            path: log_dir.clone(),
            source,
        })?;
        let log_path = log_dir.join(format!(
            "corkboard-sync-{}-{}.log",
            std::process::id(),
            Utc::now().format("%Y%m%dT%H%M%S")
        ));
        let log_file = std::fs::File::create(&log_path).map_err(|source| CbError::Storage {
            path: log_path,
            source,
        })?;
        let _ = env_logger::Builder::from_default_env()
            .target(env_logger::Target::Pipe(Box::new(log_file)))
            .try_init();

        self.run_once().await;
        Ok(())
    }

    /// Drain every enabled remote once; errors are logged, never raised
    pub async fn run_once(&self) -> Vec<(String, Option<SyncReport>)> {
        drain_all(&self.config).await
    }
}

/// One pass over every enabled backend. Per backend: skip when its journal is
/// empty, otherwise push under the outer deadline; on expiry abandon that
/// remote and move on (the entries stay queued).
async fn drain_all(config: &Config) -> Vec<(String, Option<SyncReport>)> {
    let mut outcomes = Vec::new();

    for backend in config.enabled_backends() {
        let name = backend.name.clone();
        log::info!("Considering backend {}", name);

        let folder = config.cache_folder_for(&name);
        let mut cache = match Cache::open(&folder) {
            Ok(cache) => cache,
            Err(err) => {
                log::error!("Cannot open the cache of {}: {}", name, err);
                outcomes.push((name, None));
                continue;
            }
        };
        if !cache.has_replayable_entries() {
            log::debug!("Nothing queued for {}", name);
            outcomes.push((name, Some(SyncReport::default())));
            continue;
        }

        let mut remote = match registry::global().construct(backend) {
            Ok(remote) => remote,
            Err(err) => {
                log::error!("Cannot construct the provider for {}: {}", name, err);
                outcomes.push((name, None));
                continue;
            }
        };

        let drain = async {
            SyncEngine::new(&mut cache, remote.as_mut()).push().await
        };
        match tokio::time::timeout(REMOTE_DEADLINE, drain).await {
            Ok(Ok(report)) => {
                log::info!(
                    "Drained {}: {} pushed, {} failed",
                    name,
                    report.pushed,
                    report.push_failures
                );
                outcomes.push((name, Some(report)));
            }
            Ok(Err(err)) => {
                log::error!("Drain of {} failed: {}", name, err);
                outcomes.push((name, None));
            }
            Err(_) => {
                log::warn!(
                    "Drain of {} hit the {}s deadline, abandoning it until the next run",
                    name,
                    REMOTE_DEADLINE.as_secs()
                );
                outcomes.push((name, None));
            }
        }
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Task;
    use crate::providers::memory::MemorySource;
    use crate::traits::TaskSource;

    #[test]
    fn test_binaries_are_recognized_as_the_harness() {
        // This test itself runs from target/**/deps/
        assert!(in_test_harness());
    }

    #[tokio::test]
    async fn run_once_drains_every_backend_with_queued_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.cache_root = Some(dir.path().to_path_buf());
        config
            .backends
            .push(crate::config::BackendConfig::new("drain-unit", "memory"));

        let remote = MemorySource::shared("drain-unit");
        let remote_list = crate::model::TaskList::new("rl-1", "errands");
        remote.seed_list(remote_list);

        // A queued create in this backend's cache, for a list the remote knows
        let folder = config.cache_folder_for("drain-unit");
        {
            let mut cache = Cache::open(&folder).unwrap();
            cache.absorb_remote_list(crate::model::TaskList::new("rl-1", "errands")).unwrap();
            let draft = Task::new("", "rl-1", "buy stamps").unwrap();
            cache.add_task("rl-1", &draft).await.unwrap();
        }

        let dispatcher = Dispatcher::new(config, None);
        let outcomes = dispatcher.run_once().await;
        assert_eq!(outcomes.len(), 1);
        let report = outcomes[0].1.as_ref().expect("drain should succeed");
        assert_eq!(report.pushed, 1);
        assert_eq!(remote.task_count("rl-1"), 1);

        // The journal is empty now, so another run has nothing to do
        let cache = Cache::open(&folder).unwrap();
        assert!(cache.journal_entries().is_empty());
        MemorySource::reset("drain-unit");
    }
}
