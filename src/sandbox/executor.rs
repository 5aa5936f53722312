//! Sandbox executor: clone, patch, detect, install, build.
//!
//! Every job gets its own temporary directory under the configured work
//! root. The clone lives in `<tmp>/repo`; the diff is written next to it,
//! never inside the working tree. The directory is removed when the run
//! finishes, whatever the outcome.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::detect::{self, Toolchain};
use super::queue::SandboxJob;
use crate::errors::SandboxError;
use crate::patch;
use crate::repo::RepoRef;

/// Result of one sandbox run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxOutcome {
    pub success: bool,
    pub logs: Vec<String>,
}

/// Receiver for step messages while a run is in progress.
pub type Progress<'p> = dyn for<'s> Fn(&'s str) + Send + Sync + 'p;

/// Abstraction over sandbox execution for testability.
/// Real implementation: `SandboxExecutor`.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Verify `job`'s diff. `progress` receives each step message as it
    /// happens; the returned logs hold the full command output.
    async fn run(&self, job: &SandboxJob, progress: &Progress<'_>) -> SandboxOutcome;
}

pub struct SandboxExecutor {
    clone_base: String,
    work_root: PathBuf,
    timeout: Duration,
}

/// Collects logs and forwards step messages to the progress callback.
struct RunLog<'a> {
    job_id: &'a str,
    lines: Vec<String>,
    progress: &'a Progress<'a>,
}

impl RunLog<'_> {
    fn step(&mut self, message: &str) {
        tracing::info!(job_id = self.job_id, "{}", message);
        (self.progress)(message);
        self.lines.push(message.to_string());
    }

    fn output(&mut self, line: String) {
        self.lines.push(line);
    }
}

impl SandboxExecutor {
    pub fn new(clone_base: impl Into<String>, work_root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            clone_base: clone_base.into(),
            work_root: work_root.into(),
            timeout,
        }
    }

    async fn steps(&self, job: &SandboxJob, dir: &Path, log: &mut RunLog<'_>) -> Result<(), SandboxError> {
        let repo = RepoRef::parse(&job.repository)
            .ok_or_else(|| SandboxError::Repository(job.repository.clone()))?;
        let checkout = dir.join("repo");

        log.step(&format!("Cloning repo: {}", repo));
        let url = repo.clone_url(&self.clone_base);
        self.run_cmd(log, dir, "git", &["clone", "--depth", "1", &url, "repo"])
            .await?;

        log.step(&format!("Applying patch to {}", job.target_file));
        let target = checkout.join(job.target_file.trim_start_matches('/'));
        let original = read_optional(&target)?;
        let patch_path = dir.join("edit.patch");
        std::fs::write(&patch_path, &job.diff).map_err(SandboxError::Workspace)?;
        let patch_arg = patch_path.to_string_lossy().to_string();
        // No fuzz and no reverse guessing: the hunks must apply exactly as written.
        self.run_cmd(
            log,
            &checkout,
            "patch",
            &["-p1", "--forward", "--fuzz=0", "--batch", "-i", &patch_arg],
        )
        .await?;

        // The build below must see the bytes delivery will commit.
        let delivered = patch::apply(&original, &job.diff).map_err(|source| SandboxError::Patch {
            file: job.target_file.clone(),
            source,
        })?;
        if read_optional(&target)? != delivered {
            return Err(SandboxError::ContentMismatch {
                file: job.target_file.clone(),
            });
        }
        log.step("Patch applied successfully");

        let toolchain = detect::detect(&checkout);
        log.step(&format!("Detected project type: {}", toolchain));

        match toolchain {
            Toolchain::Node => {
                log.step("Installing node deps...");
                self.run_cmd(log, &checkout, "npm", &["install", "--ignore-scripts", "--no-audit"])
                    .await?;
                if detect::node_has_build_script(&checkout)? {
                    log.step("Running build...");
                    self.run_cmd(log, &checkout, "npm", &["run", "build"]).await?;
                } else {
                    log.step("No build script, skipping");
                }
            }
            Toolchain::Python => {
                if checkout.join("requirements.txt").is_file() {
                    log.step("Installing python deps...");
                    self.run_cmd(log, &checkout, "pip", &["install", "-r", "requirements.txt"])
                        .await?;
                }
                if checkout.join("setup.py").is_file() {
                    log.step("Running setup build...");
                    self.run_cmd(log, &checkout, "python3", &["setup.py", "build"])
                        .await?;
                } else {
                    log.step("No build step declared, skipping");
                }
            }
            Toolchain::Go => {
                log.step("Downloading go modules...");
                self.run_cmd(log, &checkout, "go", &["mod", "download"]).await?;
                log.step("Running build...");
                self.run_cmd(log, &checkout, "go", &["build", "./..."]).await?;
            }
            Toolchain::Rust => {
                log.step("Fetching crates...");
                self.run_cmd(log, &checkout, "cargo", &["fetch"]).await?;
                log.step("Running build...");
                self.run_cmd(log, &checkout, "cargo", &["build"]).await?;
            }
            Toolchain::Unknown => log.step("Unknown project type, skipping build"),
        }

        Ok(())
    }

    /// Run one command under the wall-clock limit. The child is killed if the
    /// limit is hit.
    async fn run_cmd(
        &self,
        log: &mut RunLog<'_>,
        cwd: &Path,
        program: &str,
        args: &[&str],
    ) -> Result<(), SandboxError> {
        let command = format!("{} {}", program, args.join(" "));
        log.output(format!("> {}", command));

        let child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(result) => result.map_err(|source| SandboxError::Spawn {
                command: command.clone(),
                source,
            })?,
            Err(_) => {
                return Err(SandboxError::Timeout {
                    command,
                    timeout_secs: self.timeout.as_secs(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.trim().is_empty() {
            log.output(stdout.trim().to_string());
        }
        if !stderr.trim().is_empty() {
            log.output(format!("[stderr] {}", stderr.trim()));
        }

        if !output.status.success() {
            return Err(SandboxError::CommandFailed {
                command,
                code: output.status.code(),
            });
        }
        Ok(())
    }
}

/// File contents, or empty when the file does not exist yet.
fn read_optional(path: &Path) -> Result<String, SandboxError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(SandboxError::Workspace(e)),
    }
}

#[async_trait]
impl Sandbox for SandboxExecutor {
    async fn run(&self, job: &SandboxJob, progress: &Progress<'_>) -> SandboxOutcome {
        let mut log = RunLog {
            job_id: &job.id,
            lines: Vec::new(),
            progress,
        };
        log.step("Initializing sandbox...");

        let workspace = std::fs::create_dir_all(&self.work_root).and_then(|_| {
            tempfile::Builder::new()
                .prefix(&format!("patchgate-{}-", job.id))
                .tempdir_in(&self.work_root)
        });
        let dir = match workspace {
            Ok(dir) => dir,
            Err(e) => {
                log.output(format!("[EXECUTOR ERROR] {}", SandboxError::Workspace(e)));
                log.step("SANDBOX VERIFICATION FAILED");
                return SandboxOutcome {
                    success: false,
                    logs: log.lines,
                };
            }
        };

        let result = self.steps(job, dir.path(), &mut log).await;
        let success = match result {
            Ok(()) => {
                log.step("SANDBOX VERIFICATION PASSED");
                true
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "sandbox step failed");
                log.output(format!("[EXECUTOR ERROR] {}", e));
                log.step("SANDBOX VERIFICATION FAILED");
                false
            }
        };

        log.step("Cleaning temp directory...");
        if let Err(e) = dir.close() {
            tracing::warn!(job_id = %job.id, error = %e, "failed to remove sandbox directory");
        }

        SandboxOutcome {
            success,
            logs: log.lines,
        }
    }
}
