use clap::Parser;
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "judged", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: String,

    /// Whether to flush the existing database
    #[arg(long = "flush-data", short = 'f', default_value_t = false)]
    pub flush_data: bool,

    /// Number of judge workers pulling from the queue
    #[arg(long = "workers", short = 'w', default_value_t = 3)]
    pub workers: u8,
}

impl CliArgs {
    /// Load the configuration from the specified file
    pub fn to_config(&self) -> std::io::Result<Config> {
        let file = std::fs::File::open(&self.config_path)?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| e.into())
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub judge: JudgeConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

/// Resource limits and capacities for the judging pipeline.
///
/// Field defaults match the production deployment: a 10-box isolate pool,
/// 5s CPU / 256MB per test case, a single process per run and a 10s
/// compilation bound.
#[derive(Deserialize, Debug, Clone)]
pub struct JudgeConfig {
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: u8,
    #[serde(default = "default_time_limit_ms")]
    pub time_limit_ms: u64,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    #[serde(default = "default_process_limit")]
    pub process_limit: u32,
    #[serde(default = "default_compile_timeout_ms")]
    pub compile_timeout_ms: u64,
}

/// Retry and retention policy for the judge queue.
///
/// Infrastructure faults are retried `max_attempts` times with exponential
/// backoff starting at `backoff_base_ms`; judged outcomes are never retried.
#[derive(Deserialize, Debug, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_keep_completed")]
    pub keep_completed: u32,
    #[serde(default = "default_keep_failed")]
    pub keep_failed: u32,
}

fn default_pool_capacity() -> u8 {
    10
}

fn default_time_limit_ms() -> u64 {
    5_000
}

fn default_memory_limit_mb() -> u64 {
    256
}

fn default_process_limit() -> u32 {
    1
}

fn default_compile_timeout_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    2
}

fn default_backoff_base_ms() -> u64 {
    2_000
}

fn default_keep_completed() -> u32 {
    100
}

fn default_keep_failed() -> u32 {
    200
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            pool_capacity: default_pool_capacity(),
            time_limit_ms: default_time_limit_ms(),
            memory_limit_mb: default_memory_limit_mb(),
            process_limit: default_process_limit(),
            compile_timeout_ms: default_compile_timeout_ms(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            keep_completed: default_keep_completed(),
            keep_failed: default_keep_failed(),
        }
    }
}

/// Per-job execution limits, carried from enqueue to the engine.
#[derive(serde::Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub time_limit_ms: u64,
    pub memory_limit_mb: u64,
}

impl Limits {
    /// CPU time limit in seconds, the unit the sandbox tool expects.
    pub fn time_limit_secs(&self) -> f64 {
        self.time_limit_ms as f64 / 1000.0
    }

    /// Memory ceiling in kilobytes, the unit the sandbox tool expects.
    pub fn memory_limit_kb(&self) -> u64 {
        self.memory_limit_mb * 1024
    }
}

impl From<&JudgeConfig> for Limits {
    fn from(judge: &JudgeConfig) -> Self {
        Self {
            time_limit_ms: judge.time_limit_ms,
            memory_limit_mb: judge.memory_limit_mb,
        }
    }
}
