use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub download_dir: PathBuf,
    pub task_dir: PathBuf,
    pub block_size: u64,
    pub default_worker_count: u32,
    pub user_agent: String,
    pub redirect_probe_timeout_secs: u64,
    pub range_probe_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_redirects: u32,
    pub block_retry_count: u32,
    pub retry_backoff_ms: u64,
    pub buffer_size: usize,
    pub placeholder_name: String,
    pub default_extension: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            task_dir: default_task_dir(),
            block_size: 512 * 1024,
            default_worker_count: 3,
            user_agent: "blockdl/0.1".to_string(),
            redirect_probe_timeout_secs: 20,
            range_probe_timeout_secs: 10,
            connect_timeout_secs: 15,
            max_redirects: 5,
            block_retry_count: 3,
            retry_backoff_ms: 1000,
            buffer_size: 64 * 1024,
            placeholder_name: "unknown-file".to_string(),
            default_extension: "ext".to_string(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `BLOCKDL_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = env::var("BLOCKDL_TASK_DIR") {
            config.task_dir = PathBuf::from(dir);
        }
        if let Some(size) = env_u64("BLOCKDL_BLOCK_SIZE") {
            if size > 0 {
                config.block_size = size;
            }
        }
        if let Some(workers) = env_u64("BLOCKDL_WORKERS") {
            config.default_worker_count = workers.clamp(1, u32::MAX as u64) as u32;
        }
        if let Ok(agent) = env::var("BLOCKDL_USER_AGENT") {
            if !agent.trim().is_empty() {
                config.user_agent = agent;
            }
        }
        if let Some(retries) = env_u64("BLOCKDL_RETRIES") {
            config.block_retry_count = retries.min(u32::MAX as u64) as u32;
        }
        config
    }

    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    pub fn with_task_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.task_dir = dir.into();
        self
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.trim().parse::<u64>().ok())
}

fn default_download_dir() -> PathBuf {
    if let Ok(dir) = env::var("BLOCKDL_DOWNLOAD_DIR") {
        return PathBuf::from(dir);
    }
    let shared = Path::new("/storage/emulated/0/Download");
    if shared.exists() {
        return shared.to_path_buf();
    }
    let home = env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    let downloads = PathBuf::from(&home).join("Downloads");
    if downloads.exists() {
        return downloads;
    }
    PathBuf::from("/tmp")
}

fn default_task_dir() -> PathBuf {
    match env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".blockdl").join("tasks"),
        Err(_) => env::temp_dir().join("blockdl").join("tasks"),
    }
}
