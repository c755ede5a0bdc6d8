use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::fs;
use tokio::process::Command;
use tokio::sync::OnceCell;

const SOURCE_NAME: &str = "main.cpp";
const BINARY_NAME: &str = "main";

/// Where the precompiled umbrella header lives, shared by all submissions.
const PCH_DIR: &str = "/tmp/cpp_pch_cache";
const PCH_HEADER: &str = "stdc++.h";
const PCH_BUILD_TIMEOUT: Duration = Duration::from_secs(30);

/// One attempt per process lifetime; on failure every submission falls back
/// to unmodified compilation.
static PCH_READY: OnceCell<bool> = OnceCell::const_new();

static WORKSPACE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Outcome of the compile stage.
///
/// `Rejected` is a judged result (the submission does not build), not an
/// error: infrastructure faults use `Err` instead.
#[derive(Debug)]
pub enum CompileOutcome {
    Compiled(PathBuf),
    Rejected(String),
}

/// Ephemeral per-submission directory holding the source and the binary.
///
/// Removed on drop, whatever the judging outcome was.
pub struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    pub async fn create() -> Result<Self> {
        let dir = std::env::temp_dir().join(format!(
            "judge_{}_{}",
            std::process::id(),
            WORKSPACE_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create workspace {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            log::warn!("Failed to remove workspace {}: {e}", self.dir.display());
        }
    }
}

/// Compiles submitted source text into an executable inside `workspace`.
///
/// Compilation runs on the host with a hard timeout; exceeding it is
/// reported as a rejection, never a hang. When the source leads with the
/// umbrella `bits/stdc++.h` include, the precompiled variant is substituted
/// transparently — a pure latency optimization that must not change
/// diagnostics or semantics.
pub async fn compile(
    code: &str,
    workspace: &Workspace,
    timeout: Duration,
) -> Result<CompileOutcome> {
    let mut source = code.to_string();
    let mut use_pch = false;

    if let Some(rewritten) = rewrite_umbrella_include(code) {
        if ensure_pch().await {
            source = rewritten;
            use_pch = true;
            log::debug!("Compiling with precompiled umbrella header");
        }
    }

    let source_path = workspace.dir().join(SOURCE_NAME);
    let binary_path = workspace.dir().join(BINARY_NAME);
    fs::write(&source_path, &source).await?;

    let mut command = Command::new("g++");
    command
        .arg("-std=c++17")
        .arg("-O2")
        .arg("-o")
        .arg(&binary_path)
        .arg(&source_path);
    if use_pch {
        command.arg("-I").arg(PCH_DIR);
    }
    command.kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(output) => output.context("Failed to spawn g++")?,
        Err(_) => {
            log::warn!("Compilation exceeded {}s, killed", timeout.as_secs());
            return Ok(CompileOutcome::Rejected(format!(
                "compilation timed out after {}s",
                timeout.as_secs()
            )));
        }
    };

    if !output.status.success() {
        let diagnostics = String::from_utf8_lossy(&output.stderr).into_owned();
        return Ok(CompileOutcome::Rejected(diagnostics));
    }

    let warnings = String::from_utf8_lossy(&output.stderr);
    if !warnings.trim().is_empty() {
        log::debug!("Compiler warnings: {}", warnings.trim());
    }

    Ok(CompileOutcome::Compiled(binary_path))
}

/// Builds the precompiled header once, returning whether it is usable.
async fn ensure_pch() -> bool {
    *PCH_READY
        .get_or_init(|| async {
            match build_pch().await {
                Ok(()) => {
                    log::info!("Precompiled umbrella header ready at {PCH_DIR}");
                    true
                }
                Err(e) => {
                    log::warn!("Precompiled header unavailable, falling back: {e}");
                    false
                }
            }
        })
        .await
}

async fn build_pch() -> Result<()> {
    let header = Path::new(PCH_DIR).join(PCH_HEADER);
    let compiled = Path::new(PCH_DIR).join(format!("{PCH_HEADER}.gch"));

    // A previous process may have left a usable artifact behind
    if fs::try_exists(&compiled).await.unwrap_or(false) {
        return Ok(());
    }

    fs::create_dir_all(PCH_DIR).await?;
    fs::write(&header, "#include <bits/stdc++.h>\n").await?;

    let mut command = Command::new("g++");
    command
        .arg("-std=c++17")
        .arg("-O2")
        .arg("-x")
        .arg("c++-header")
        .arg(&header)
        .arg("-o")
        .arg(&compiled)
        .kill_on_drop(true);

    let output = tokio::time::timeout(PCH_BUILD_TIMEOUT, command.output())
        .await
        .context("precompiled header build timed out")?
        .context("Failed to spawn g++ for the precompiled header")?;

    if !output.status.success() {
        anyhow::bail!(
            "g++ rejected the umbrella header: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(())
}

/// Rewrites a leading `#include <bits/stdc++.h>` to the precompiled header's
/// name, returning `None` when the source does not lead with it.
///
/// g++ only honors a precompiled header when its include is the first
/// significant line, so only blank lines, comments and other preprocessor
/// directives may precede it.
fn rewrite_umbrella_include(code: &str) -> Option<String> {
    let mut lines: Vec<&str> = code.lines().collect();
    let mut rewritten = None;

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("//") || trimmed.starts_with("/*") {
            continue;
        }
        if is_umbrella_include(trimmed) {
            rewritten = Some((i, format!("#include \"{PCH_HEADER}\"")));
            break;
        }
        // Other preprocessor lines may still precede the umbrella include
        if !trimmed.starts_with('#') {
            break;
        }
    }

    let (index, replacement) = rewritten?;
    lines[index] = &replacement;
    let mut result = lines.join("\n");
    if code.ends_with('\n') {
        result.push('\n');
    }
    Some(result)
}

fn is_umbrella_include(line: &str) -> bool {
    let Some(rest) = line.strip_prefix('#') else {
        return false;
    };
    let Some(target) = rest.trim_start().strip_prefix("include") else {
        return false;
    };
    let target = target.trim().to_ascii_lowercase();
    target.starts_with("<bits/stdc++.h>") || target.starts_with("\"bits/stdc++.h\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rewrites_leading_umbrella_include() {
        let code = "#include <bits/stdc++.h>\nint main() { return 0; }\n";
        let rewritten = rewrite_umbrella_include(code).unwrap();
        assert_eq!(
            rewritten,
            "#include \"stdc++.h\"\nint main() { return 0; }\n"
        );
    }

    #[test]
    fn rewrites_past_comments_and_blank_lines() {
        let code = "// solution\n\n/* header */\n#include <bits/stdc++.h>\nint main() {}\n";
        let rewritten = rewrite_umbrella_include(code).unwrap();
        assert!(rewritten.contains("#include \"stdc++.h\""));
        assert!(!rewritten.contains("bits/stdc++.h"));
    }

    #[test]
    fn leaves_non_leading_include_alone() {
        let code = "int x = 0;\n#include <bits/stdc++.h>\n";
        assert_eq!(rewrite_umbrella_include(code), None);
    }

    #[test]
    fn accepts_quoted_and_spaced_forms() {
        assert!(is_umbrella_include("#include <bits/stdc++.h>"));
        assert!(is_umbrella_include("#include<bits/stdc++.h>"));
        assert!(is_umbrella_include("# include \"bits/stdc++.h\""));
        assert!(is_umbrella_include("#include <BITS/STDC++.H>"));
        assert!(!is_umbrella_include("#include <iostream>"));
        assert!(!is_umbrella_include("include <bits/stdc++.h>"));
    }

    #[test]
    fn other_directives_may_precede_the_umbrella() {
        let code = "#pragma GCC optimize(\"O3\")\n#include <bits/stdc++.h>\nint main() {}\n";
        let rewritten = rewrite_umbrella_include(code).unwrap();
        assert!(rewritten.starts_with("#pragma GCC optimize"));
        assert!(rewritten.contains("#include \"stdc++.h\""));
    }

    #[test]
    fn only_the_first_umbrella_include_is_rewritten() {
        let code = "#include <bits/stdc++.h>\n#include <bits/stdc++.h>\n";
        let rewritten = rewrite_umbrella_include(code).unwrap();
        assert_eq!(rewritten.matches("bits/stdc++.h").count(), 1);
    }

    #[tokio::test]
    async fn workspace_is_removed_on_drop() {
        let workspace = Workspace::create().await.unwrap();
        let dir = workspace.dir().to_path_buf();
        assert!(dir.exists());
        drop(workspace);
        assert!(!dir.exists());
    }
}
