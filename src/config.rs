use crate::storage::DurabilityMode;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Store configuration
///
/// Defaults to a purely in-memory store; call [`StoreConfig::data_dir`] to
/// keep a write-ahead log and snapshots on disk.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the WAL and snapshot files
    pub data_dir: Option<PathBuf>,

    /// How hard each commit is pushed to disk
    pub durability: DurabilityMode,

    /// Commits logged before the WAL is folded into a snapshot
    pub checkpoint_threshold: usize,

    /// Longest wait for a user lock
    pub lock_timeout: Duration,

    /// Upper bound on a destruction decision, if any
    pub statement_timeout: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            durability: DurabilityMode::None,
            checkpoint_threshold: 1000,
            lock_timeout: Duration::from_secs(5),
            statement_timeout: None,
        }
    }
}

impl StoreConfig {
    /// In-memory configuration with default timeouts
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist under `dir`. Switches durability to `Async` unless a mode
    /// other than `None` was already chosen.
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        if self.durability == DurabilityMode::None {
            self.durability = DurabilityMode::Async;
        }
        self
    }

    /// Set the durability mode
    pub fn durability(mut self, mode: DurabilityMode) -> Self {
        self.durability = mode;
        self
    }

    /// Set the checkpoint threshold
    pub fn checkpoint_threshold(mut self, commits: usize) -> Self {
        self.checkpoint_threshold = commits.max(1);
        self
    }

    /// Set the user lock timeout
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the statement timeout
    pub fn statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    /// Whether commits reach disk at all
    pub fn is_persistent(&self) -> bool {
        self.data_dir.is_some() && self.durability != DurabilityMode::None
    }
}

/// Command line / environment configuration of `retentiondb-server`
#[derive(Debug, Clone, Parser)]
#[command(name = "retentiondb-server")]
#[command(about = "Records-retention compliance store with guarded key destruction")]
pub struct ServerConfig {
    /// Address to bind
    #[arg(long, env = "RETENTIONDB_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "RETENTIONDB_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Directory for the WAL and snapshots; in-memory when omitted
    #[arg(long, env = "RETENTIONDB_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// sync, async or none
    #[arg(long, env = "RETENTIONDB_DURABILITY", default_value = "async")]
    pub durability: DurabilityMode,

    /// Longest wait for a user lock, in milliseconds
    #[arg(long, env = "RETENTIONDB_LOCK_TIMEOUT_MS", default_value_t = 5000)]
    pub lock_timeout_ms: u64,

    /// Upper bound on a destruction decision, in milliseconds
    #[arg(long, env = "RETENTIONDB_STATEMENT_TIMEOUT_MS")]
    pub statement_timeout_ms: Option<u64>,

    /// Commits between automatic checkpoints
    #[arg(long, env = "RETENTIONDB_CHECKPOINT_THRESHOLD", default_value_t = 1000)]
    pub checkpoint_threshold: usize,
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn store_config(&self) -> StoreConfig {
        let mut config = StoreConfig::new()
            .lock_timeout(Duration::from_millis(self.lock_timeout_ms))
            .checkpoint_threshold(self.checkpoint_threshold);
        if let Some(dir) = &self.data_dir {
            config = config.data_dir(dir.clone()).durability(self.durability);
        }
        if let Some(ms) = self.statement_timeout_ms {
            config = config.statement_timeout(Duration::from_millis(ms));
        }
        config
    }
}
