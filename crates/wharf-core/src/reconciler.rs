//! Archive reconciler (spec.md §4.3): the server-side component that
//! applies a diff or a full archive replacement to the installed archive
//! and triggers a redeploy. A single mutex protects both write access to
//! the installed-archive path and the deployment-status record — the only
//! global mutable state on the agent side.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use chrono::Utc;

use crate::archive;
use crate::status::StatusTracker;
use wharf_types::DeployResult;

/// One changed file to be written by `apply`: a path plus raw bytes.
pub struct ChangedFile {
    pub path: String,
    pub content: Vec<u8>,
}

/// The server-side archive reconciler. Owns the installed-archive path and
/// serializes writes to it behind a single-flight mutex (§4.3, §5).
pub struct Reconciler {
    installed_archive_path: PathBuf,
    scratch_root: PathBuf,
    /// Held only while a reconciliation is in progress; guards nothing by
    /// value, just existence (mirrors the teacher's lock-file pattern but
    /// in-process rather than on disk, since this is per-agent-process state).
    lock: Mutex<()>,
    status: StatusTracker,
    redeploy_command: Option<(String, Vec<String>)>,
}

impl Reconciler {
    pub fn new(installed_archive_path: PathBuf, scratch_root: PathBuf, status: StatusTracker) -> Self {
        Self {
            installed_archive_path,
            scratch_root,
            lock: Mutex::new(()),
            status,
            redeploy_command: None,
        }
    }

    /// Configure the command used to trigger the application server's own
    /// redeploy hook (out of scope per spec.md §1; reached through
    /// `wharf-process`). Without one configured, `request_redeploy` is a
    /// no-op — useful for tests and for agents fronting a server that
    /// reloads on file-change without an explicit trigger.
    pub fn with_redeploy_command(mut self, program: String, args: Vec<String>) -> Self {
        self.redeploy_command = Some((program, args));
        self
    }

    pub fn status(&self) -> &StatusTracker {
        &self.status
    }

    /// apply(changed_files, deleted_paths): materialize the installed
    /// archive to a scratch directory, delete, write, repackage, redeploy.
    /// Fails fast with "already in progress" if the lock is held.
    pub fn apply(&self, changed_files: Vec<ChangedFile>, deleted_paths: Vec<String>) -> Result<DeployResult> {
        let _guard = self
            .lock
            .try_lock()
            .map_err(|_| anyhow::anyhow!("deployment already in progress"))?;

        let started = Instant::now();
        self.status.start("starting");

        let result = self.apply_locked(changed_files, deleted_paths, started);

        match &result {
            Ok(r) => self.status.finish(r.clone()),
            Err(e) => self.status.finish(DeployResult {
                success: false,
                files_changed: 0,
                files_deleted: 0,
                deployment_time_ms: started.elapsed().as_millis() as u64,
                deployed_applications: vec![],
                message: Some(e.to_string()),
            }),
        }

        result
    }

    fn apply_locked(
        &self,
        changed_files: Vec<ChangedFile>,
        deleted_paths: Vec<String>,
        started: Instant,
    ) -> Result<DeployResult> {
        let scratch = self.scratch_root.join(format!("reconcile-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default()));
        let cleanup = ScratchGuard(scratch.clone());

        fs::create_dir_all(&scratch)
            .with_context(|| format!("failed to create scratch dir {}", scratch.display()))?;

        self.status.set_step("extracting");
        if self.installed_archive_path.exists() {
            archive::extract_archive(&self.installed_archive_path, &scratch)
                .context("failed to extract installed archive to scratch dir")?;
        }

        self.status.set_step("writing");
        for deleted in &deleted_paths {
            let target = scratch.join(deleted);
            if target.exists() {
                fs::remove_file(&target)
                    .with_context(|| format!("failed to delete {}", target.display()))?;
            }
        }

        let files_changed = changed_files.len();
        let files_deleted = deleted_paths.len();

        for file in changed_files {
            let target = scratch.join(&file.path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create dir {}", parent.display()))?;
            }
            fs::write(&target, &file.content)
                .with_context(|| format!("failed to write {}", target.display()))?;
        }

        self.status.set_step("repackaging");
        archive::repackage_dir(&scratch, &self.installed_archive_path)
            .context("failed to repackage installed archive")?;

        self.status.set_step("redeploying");
        self.request_redeploy()?;

        drop(cleanup);

        Ok(DeployResult {
            success: true,
            files_changed,
            files_deleted,
            deployment_time_ms: started.elapsed().as_millis() as u64,
            deployed_applications: self.deployed_applications(),
            message: None,
        })
    }

    /// full_replace(payload): accept an entire archive body, write it to
    /// the installed-archive path, request redeploy.
    pub fn full_replace(&self, payload: &[u8]) -> Result<DeployResult> {
        let _guard = self
            .lock
            .try_lock()
            .map_err(|_| anyhow::anyhow!("deployment already in progress"))?;

        let started = Instant::now();
        self.status.start("starting");

        let result = (|| -> Result<DeployResult> {
            self.status.set_step("writing");
            let tmp = self.installed_archive_path.with_extension("tmp");
            fs::write(&tmp, payload)
                .with_context(|| format!("failed to write {}", tmp.display()))?;
            fs::rename(&tmp, &self.installed_archive_path).with_context(|| {
                format!(
                    "failed to rename {} to {}",
                    tmp.display(),
                    self.installed_archive_path.display()
                )
            })?;

            self.status.set_step("redeploying");
            self.request_redeploy()?;

            Ok(DeployResult {
                success: true,
                files_changed: 0,
                files_deleted: 0,
                deployment_time_ms: started.elapsed().as_millis() as u64,
                deployed_applications: self.deployed_applications(),
                message: None,
            })
        })();

        match &result {
            Ok(r) => self.status.finish(r.clone()),
            Err(e) => self.status.finish(DeployResult {
                success: false,
                files_changed: 0,
                files_deleted: 0,
                deployment_time_ms: started.elapsed().as_millis() as u64,
                deployed_applications: vec![],
                message: Some(e.to_string()),
            }),
        }

        result
    }

    fn request_redeploy(&self) -> Result<()> {
        let Some((program, args)) = &self.redeploy_command else {
            return Ok(());
        };
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let result = wharf_process::run_command(program, &arg_refs)
            .context("failed to invoke redeploy command")?;
        if !result.success {
            bail!("redeploy command failed: {}", result.stderr);
        }
        Ok(())
    }

    fn deployed_applications(&self) -> Vec<String> {
        self.installed_archive_path
            .file_stem()
            .map(|s| vec![s.to_string_lossy().to_string()])
            .unwrap_or_default()
    }

    pub fn installed_archive_path(&self) -> &Path {
        &self.installed_archive_path
    }
}

/// Best-effort scratch-directory cleanup on every exit path (including the
/// early returns from `?` inside `apply_locked`).
struct ScratchGuard(PathBuf);

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}
