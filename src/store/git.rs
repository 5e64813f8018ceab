//! Git-backed store
//!
//! A local working copy of a shared remote. Reads fetch and hard-reset to
//! the remote branch; publishes verify expected versions against that fresh
//! copy, commit and push. The remote's refusal of a non-fast-forward push is
//! what turns concurrent publishes into a single winner.

use crate::common::{Error, Result};
use crate::store::{
    decode, encode, CoordinationStore, DocumentKey, Published, Version, Versioned, WriteBatch,
};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct GitStoreConfig {
    pub workdir: PathBuf,
    pub remote: String,
    pub branch: String,
    /// Upper bound for any single git invocation
    pub timeout: Duration,
    /// Committer name
    pub author: String,
}

impl GitStoreConfig {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            remote: "origin".to_string(),
            branch: "main".to_string(),
            timeout: Duration::from_secs(30),
            author: "swarmlease".to_string(),
        }
    }
}

pub struct GitStore {
    config: GitStoreConfig,
    /// Serializes use of the working copy within this process.
    worktree: Mutex<()>,
}

impl GitStore {
    /// Open an existing working copy.
    pub fn open(config: GitStoreConfig) -> Result<Self> {
        if !config.workdir.join(".git").exists() {
            return Err(Error::InvalidConfig(format!(
                "{} is not a git working copy",
                config.workdir.display()
            )));
        }
        Ok(Self {
            config,
            worktree: Mutex::new(()),
        })
    }

    /// Clone `url` into `config.workdir` and open it.
    pub async fn clone_from(url: &str, config: GitStoreConfig) -> Result<Self> {
        let parent = config
            .workdir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        tokio::fs::create_dir_all(&parent).await?;
        let target = config.workdir.display().to_string();
        let output = run_git(&parent, config.timeout, &["clone", url, &target]).await?;
        if !output.status.success() {
            return Err(Error::StoreUnavailable(format!(
                "git clone {} failed: {}",
                url,
                stderr_of(&output)
            )));
        }
        tracing::info!("Cloned coordination repository {} into {}", url, target);
        Self::open(config)
    }

    pub fn config(&self) -> &GitStoreConfig {
        &self.config
    }

    /// Create the branch on the remote with an empty commit if it does not exist yet.
    pub async fn ensure_branch(&self) -> Result<()> {
        let _guard = self.worktree.lock().await;
        let heads = self
            .git_ok(&["ls-remote", "--heads", &self.config.remote, &self.config.branch])
            .await
            .map_err(as_unavailable)?;
        if !heads.trim().is_empty() {
            return Ok(());
        }

        tracing::info!(
            "Initializing branch {} on {}",
            self.config.branch,
            self.config.remote
        );
        let has_commits = self
            .git(&["rev-parse", "--verify", "HEAD"])
            .await?
            .status
            .success();
        if has_commits {
            self.git_ok(&["checkout", "-B", &self.config.branch]).await?;
        } else {
            let head = format!("refs/heads/{}", self.config.branch);
            self.git_ok(&["symbolic-ref", "HEAD", &head]).await?;
        }
        self.commit(&["--allow-empty", "-m", "chore: initialize coordination repository"])
            .await?;
        let refspec = format!("HEAD:refs/heads/{}", self.config.branch);
        let output = self.git(&["push", &self.config.remote, &refspec]).await?;
        if !output.status.success() {
            return Err(classify_push_failure(&stderr_of(&output), "branch"));
        }
        Ok(())
    }

    async fn git(&self, args: &[&str]) -> Result<Output> {
        run_git(&self.config.workdir, self.config.timeout, args).await
    }

    /// Run git and return stdout, failing on a non-zero exit.
    async fn git_ok(&self, args: &[&str]) -> Result<String> {
        let output = self.git(args).await?;
        if !output.status.success() {
            return Err(Error::Internal(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr_of(&output)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn commit(&self, args: &[&str]) -> Result<()> {
        let name = format!("user.name={}", self.config.author);
        let email = format!("user.email={}@swarmlease.invalid", self.config.author);
        let mut full = vec!["-c", name.as_str(), "-c", email.as_str(), "commit"];
        full.extend_from_slice(args);
        self.git_ok(&full).await.map(|_| ())
    }

    fn remote_ref(&self) -> String {
        format!("{}/{}", self.config.remote, self.config.branch)
    }

    /// Fetch and hard-reset the working copy to the remote branch.
    async fn sync(&self) -> Result<()> {
        let output = self
            .git(&["fetch", &self.config.remote, &self.config.branch])
            .await?;
        if !output.status.success() {
            return Err(Error::StoreUnavailable(format!(
                "git fetch failed: {}",
                stderr_of(&output)
            )));
        }
        self.git_ok(&["reset", "--hard", &self.remote_ref()]).await?;
        Ok(())
    }

    fn path_of(&self, key: DocumentKey) -> PathBuf {
        self.config.workdir.join(key.file_name())
    }

    async fn read_local(&self, key: DocumentKey) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_of(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CoordinationStore for GitStore {
    async fn read(&self, key: DocumentKey) -> Result<Versioned<Value>> {
        let _guard = self.worktree.lock().await;
        self.sync().await?;
        let bytes = self.read_local(key).await?;
        decode(key, bytes.as_deref())
    }

    async fn publish(&self, batch: WriteBatch) -> Result<Published> {
        let _guard = self.worktree.lock().await;
        self.sync().await?;

        let mut current = Vec::with_capacity(batch.len());
        for write in batch.writes() {
            let bytes = self.read_local(write.key).await?;
            let version = bytes
                .as_deref()
                .map(Version::of)
                .unwrap_or_else(Version::absent);
            if version != write.expected {
                return Err(Error::conflict(write.key.as_str()));
            }
            current.push(bytes);
        }

        let mut published = Published::new();
        let mut changed_files = Vec::new();
        for (write, existing) in batch.writes().iter().zip(current) {
            let bytes = encode(&write.value)?;
            published.insert(write.key, Version::of(&bytes));
            if existing.as_deref() != Some(bytes.as_slice()) {
                tokio::fs::write(self.path_of(write.key), &bytes).await?;
                changed_files.push(write.key.file_name());
            }
        }
        if changed_files.is_empty() {
            tracing::debug!("Nothing to commit for {}", batch.description());
            return Ok(published);
        }

        let mut add = vec!["add", "--"];
        add.extend(changed_files.iter().map(String::as_str));
        self.git_ok(&add).await?;
        let description = batch.description();
        self.commit(&["-m", &description]).await?;

        let refspec = format!("HEAD:refs/heads/{}", self.config.branch);
        let output = self.git(&["push", &self.config.remote, &refspec]).await?;
        if !output.status.success() {
            let keys: Vec<&str> = batch.keys().map(|k| k.as_str()).collect();
            let err = classify_push_failure(&stderr_of(&output), &keys.join(","));
            // drop the local commit so the next read starts from the remote
            if let Err(e) = self.sync().await {
                tracing::warn!("Failed to reset working copy after rejected push: {}", e);
            }
            return Err(err);
        }

        tracing::debug!("Pushed: {}", description.lines().next().unwrap_or_default());
        Ok(published)
    }

    fn name(&self) -> &'static str {
        "git"
    }
}

async fn run_git(dir: &Path, timeout: Duration, args: &[&str]) -> Result<Output> {
    let mut cmd = Command::new("git");
    cmd.args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .kill_on_drop(true);
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(Error::Timeout(format!(
            "git {} did not finish within {:?}",
            args.first().copied().unwrap_or_default(),
            timeout
        ))),
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn as_unavailable(e: Error) -> Error {
    match e {
        Error::Internal(msg) => Error::StoreUnavailable(msg),
        other => other,
    }
}

/// A push refused because the remote moved on is a conflict; anything else
/// (network, auth, hooks) means the store is unavailable.
fn classify_push_failure(stderr: &str, key: &str) -> Error {
    const CONFLICT_MARKERS: [&str; 5] = [
        "non-fast-forward",
        "fetch first",
        "[rejected]",
        "cannot lock ref",
        "failed to update ref",
    ];
    if CONFLICT_MARKERS.iter().any(|m| stderr.contains(m)) {
        Error::conflict(key)
    } else {
        Error::StoreUnavailable(format!("git push failed: {}", stderr))
    }
}
