use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use tokio::fs;
use tokio::process::Command;

use crate::config::Limits;

/// Where isolate keeps the working directories of its boxes.
const BOX_ROOT: &str = "/var/local/lib/isolate";

/// Extra wall-clock allowance on top of the CPU limit before isolate kills
/// the run.
const WALL_CLOCK_SLACK_SECS: f64 = 2.0;

/// Extra allowance for the outer guard around the isolate process itself.
const OUTER_GUARD_SLACK_SECS: f64 = 3.0;

const BINARY_NAME: &str = "main";
const STDIN_NAME: &str = "input.txt";
const STDOUT_NAME: &str = "output.txt";
const STDERR_NAME: &str = "error.txt";

/// Working directory of one box, as laid out by `isolate --init`.
pub fn box_dir(box_id: u8) -> PathBuf {
    Path::new(BOX_ROOT).join(box_id.to_string()).join("box")
}

/// Runs `isolate --init` for one box, wiping any residue from a prior user.
pub(super) async fn init_box(box_id: u8) -> Result<()> {
    let output = Command::new("isolate")
        .arg(format!("--box-id={box_id}"))
        .arg("--init")
        .output()
        .await
        .map_err(|e| anyhow!("Failed to spawn isolate --init: {e}"))?;

    if !output.status.success() {
        bail!(
            "isolate --init exited with non-zero status: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    log::debug!("Box {box_id} initialized");
    Ok(())
}

/// Runs `isolate --cleanup` for one box.
///
/// Called from `BoxLease::drop`, which cannot await; the cleanup process is
/// short-lived so a blocking wait is acceptable here.
pub(super) fn cleanup_box(box_id: u8) -> Result<()> {
    let output = std::process::Command::new("isolate")
        .arg(format!("--box-id={box_id}"))
        .arg("--cleanup")
        .output()
        .map_err(|e| anyhow!("Failed to spawn isolate --cleanup: {e}"))?;

    if !output.status.success() {
        bail!(
            "isolate --cleanup exited with non-zero status: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    log::debug!("Box {box_id} cleaned up");
    Ok(())
}

/// Run status parsed from the flat `key:value` meta file isolate writes.
///
/// `status` is one of `TO` (timeout), `RE` (non-zero exit), `SG` (killed by
/// signal) or `XX` (internal error of the sandbox itself); absent on a
/// normal run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Meta {
    pub status: Option<String>,
    pub exit_code: Option<i32>,
    pub memory_kb: Option<u64>,
    pub cpu_time_ms: Option<u64>,
    pub wall_time_ms: Option<u64>,
    pub message: Option<String>,
}

impl Meta {
    pub fn parse(content: &str) -> Self {
        let mut meta = Self::default();

        for line in content.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();

            match key.trim() {
                "status" => meta.status = Some(value.to_string()),
                "exitcode" => meta.exit_code = value.parse().ok(),
                "cg-mem" | "max-rss" => {
                    // cg-mem is only reported in control-group mode; fall
                    // back to max-rss without overriding cg-mem
                    if meta.memory_kb.is_none() || key.trim() == "cg-mem" {
                        meta.memory_kb = value.parse().ok();
                    }
                }
                "time" => {
                    meta.cpu_time_ms = value.parse::<f64>().ok().map(|s| (s * 1000.0) as u64);
                }
                "time-wall" => {
                    meta.wall_time_ms = value.parse::<f64>().ok().map(|s| (s * 1000.0) as u64);
                }
                "message" => meta.message = Some(value.to_string()),
                _ => {}
            }
        }

        meta
    }
}

/// Everything captured from one sandboxed execution.
#[derive(Debug)]
pub struct RunReport {
    /// `None` when the meta file could not be read back, which counts as an
    /// internal fault of the tooling.
    pub meta: Option<Meta>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Stages a binary and its input into a box and executes it under the
/// configured limits.
///
/// The caller must hold the lease for `box_id`. Exit status of the isolate
/// process itself is deliberately ignored; the meta file is the authoritative
/// account of what happened to the run.
pub async fn run_in_box(
    box_id: u8,
    binary: &Path,
    input: &str,
    limits: Limits,
    process_limit: u32,
) -> Result<RunReport> {
    let dir = box_dir(box_id);

    let staged_binary = dir.join(BINARY_NAME);
    fs::copy(binary, &staged_binary).await?;
    fs::set_permissions(&staged_binary, std::fs::Permissions::from_mode(0o755)).await?;
    fs::write(dir.join(STDIN_NAME), input).await?;

    let time_secs = limits.time_limit_secs();
    let meta_path = std::env::temp_dir().join(format!(
        "isolate_meta_{box_id}_{}.txt",
        chrono::Utc::now().timestamp_micros()
    ));

    let mut command = Command::new("isolate");
    command
        .arg(format!("--box-id={box_id}"))
        .arg(format!("--time={time_secs}"))
        .arg(format!("--wall-time={}", time_secs + WALL_CLOCK_SLACK_SECS))
        .arg(format!("--mem={}", limits.memory_limit_kb()))
        .arg(format!("--processes={process_limit}"))
        .arg(format!("--stdin={STDIN_NAME}"))
        .arg(format!("--stdout={STDOUT_NAME}"))
        .arg(format!("--stderr={STDERR_NAME}"))
        .arg(format!("--meta={}", meta_path.display()))
        .arg("--run")
        .arg("--")
        .arg(format!("./{BINARY_NAME}"))
        .kill_on_drop(true);

    let started = Instant::now();
    let guard = Duration::from_secs_f64(time_secs + OUTER_GUARD_SLACK_SECS);
    match tokio::time::timeout(guard, command.output()).await {
        Ok(output) => {
            // Non-zero exit here usually just mirrors the run status that
            // the meta file reports in detail
            let _ = output?;
        }
        Err(_) => {
            log::warn!("isolate run in box {box_id} outlived its outer guard, killed");
        }
    }
    let duration_ms = started.elapsed().as_millis() as u64;

    let meta = match fs::read_to_string(&meta_path).await {
        Ok(content) => Some(Meta::parse(&content)),
        Err(e) => {
            log::warn!("Failed to read meta file for box {box_id}: {e}");
            None
        }
    };
    let _ = fs::remove_file(&meta_path).await;

    let stdout = fs::read_to_string(dir.join(STDOUT_NAME))
        .await
        .unwrap_or_default();
    let stderr = fs::read_to_string(dir.join(STDERR_NAME))
        .await
        .unwrap_or_default();

    Ok(RunReport {
        meta,
        stdout,
        stderr,
        duration_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_normal_run() {
        let meta = Meta::parse("time:0.012\ntime-wall:0.015\nmax-rss:1824\nexitcode:0\n");
        assert_eq!(meta.status, None);
        assert_eq!(meta.exit_code, Some(0));
        assert_eq!(meta.cpu_time_ms, Some(12));
        assert_eq!(meta.wall_time_ms, Some(15));
        assert_eq!(meta.memory_kb, Some(1824));
    }

    #[test]
    fn parse_timeout_run() {
        let meta = Meta::parse(
            "status:TO\nmessage:Time limit exceeded\ntime:5.002\ntime-wall:5.1\ncg-mem:2048\n",
        );
        assert_eq!(meta.status.as_deref(), Some("TO"));
        assert_eq!(meta.message.as_deref(), Some("Time limit exceeded"));
        assert_eq!(meta.memory_kb, Some(2048));
    }

    #[test]
    fn parse_prefers_cg_mem_over_max_rss() {
        let meta = Meta::parse("max-rss:100\ncg-mem:500\n");
        assert_eq!(meta.memory_kb, Some(500));

        let meta = Meta::parse("cg-mem:500\nmax-rss:100\n");
        assert_eq!(meta.memory_kb, Some(500));
    }

    #[test]
    fn parse_ignores_malformed_lines() {
        let meta = Meta::parse("garbage\nexitcode:not-a-number\nstatus:RE\n");
        assert_eq!(meta.status.as_deref(), Some("RE"));
        assert_eq!(meta.exit_code, None);
    }

    #[test]
    fn box_dir_layout() {
        assert_eq!(box_dir(3), PathBuf::from("/var/local/lib/isolate/3/box"));
    }
}
