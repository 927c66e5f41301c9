//! Git repository access for git-ops backends
//!
//! Each provider keeps a bare mirror of the remote under its working
//! directory. Commits are built directly against the remote-tracking tree,
//! so no checkout is ever needed. All libgit2 work runs on the blocking pool
//! and is serialized per repository.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::build::TreeUpdateBuilder;
use git2::{Cred, FetchOptions, FileMode, Oid, PushOptions, RemoteCallbacks, Repository, Signature};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use rsync_common::{Error, Result};

const REMOTE: &str = "origin";
const FETCH_REFSPEC: &str = "+refs/heads/*:refs/remotes/origin/*";
const PUSH_ATTEMPTS: usize = 3;

/// Where and as whom to commit
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GitRemote {
    /// Remote URL (https or local path)
    pub url: String,
    /// Branch holding desired and observed state
    pub branch: String,
    /// User name for token authentication
    pub user: String,
    /// Access token; empty for unauthenticated remotes
    pub token: String,
    /// Commit author name
    pub author: String,
    /// Commit author email
    pub email: String,
}

/// A bare mirror of one remote branch
#[derive(Clone)]
pub struct GitRepo {
    remote: Arc<GitRemote>,
    path: PathBuf,
    cluster: String,
    backend: String,
    lock: Arc<Mutex<()>>,
}

impl GitRepo {
    /// Mirror `remote` into `path`; errors are attributed to `cluster` and `backend`
    pub fn new(remote: GitRemote, path: PathBuf, cluster: &str, backend: &str) -> Self {
        Self {
            remote: Arc::new(remote),
            path,
            cluster: cluster.to_string(),
            backend: backend.to_string(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Branch this repository commits to
    pub fn branch(&self) -> &str {
        &self.remote.branch
    }

    /// Remote URL
    pub fn url(&self) -> &str {
        &self.remote.url
    }

    /// Commit and push `changes` (path → content, `None` removes) as one commit.
    ///
    /// Returns `None` when the changes leave the tree as it was. A rejected
    /// push is retried on top of a fresh fetch.
    pub async fn commit(
        &self,
        changes: BTreeMap<String, Option<String>>,
        message: &str,
    ) -> Result<Option<String>> {
        let message = message.to_string();
        self.blocking(move |job| {
            let mut last = None;
            for attempt in 1..=PUSH_ATTEMPTS {
                match job.commit_once(&changes, &message) {
                    Ok(oid) => return Ok(oid.map(|o| o.to_string())),
                    Err(e) => {
                        warn!(cluster = %job.cluster, attempt, error = %e, "git commit failed");
                        last = Some(e);
                    }
                }
            }
            Err(job.error(last.map(|e| e.message().to_string()).unwrap_or_default()))
        })
        .await
    }

    /// Content of `path` on the remote branch, `None` if absent
    pub async fn read_file(&self, path: &str) -> Result<Option<String>> {
        let path = path.to_string();
        self.blocking(move |job| {
            job.read_file(&path)
                .map_err(|e| job.error(format!("read {path}: {}", e.message())))
        })
        .await
    }

    /// Check the remote answers a fetch
    pub async fn probe(&self) -> Result<()> {
        self.blocking(move |job| {
            job.open()
                .and_then(|repo| job.fetch(&repo))
                .map_err(|e| Error::unreachable(job.cluster.clone(), e.message().to_string()))
        })
        .await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Job) -> Result<T> + Send + 'static,
    {
        let _guard = self.lock.lock().await;
        let job = Job {
            remote: self.remote.clone(),
            path: self.path.clone(),
            cluster: self.cluster.clone(),
            backend: self.backend.clone(),
        };
        tokio::task::spawn_blocking(move || f(&job))
            .await
            .map_err(|e| Error::internal_with_context("git", e.to_string()))?
    }
}

/// Owned copy of the repository settings for one blocking call
struct Job {
    remote: Arc<GitRemote>,
    path: PathBuf,
    cluster: String,
    backend: String,
}

impl Job {
    fn error(&self, msg: impl Into<String>) -> Error {
        Error::backend(self.cluster.clone(), self.backend.clone(), msg)
    }

    fn tracking_ref(&self) -> String {
        format!("refs/remotes/{REMOTE}/{}", self.remote.branch)
    }

    fn open(&self) -> std::result::Result<Repository, git2::Error> {
        let repo = if self.path.join("HEAD").exists() {
            Repository::open_bare(&self.path)?
        } else {
            std::fs::create_dir_all(&self.path)
                .map_err(|e| git2::Error::from_str(&format!("{}: {e}", self.path.display())))?;
            Repository::init_bare(&self.path)?
        };
        match repo.find_remote(REMOTE) {
            Ok(remote) if remote.url() == Some(self.remote.url.as_str()) => {}
            Ok(_) => repo.remote_set_url(REMOTE, &self.remote.url)?,
            Err(_) => {
                repo.remote(REMOTE, &self.remote.url)?;
            }
        }
        Ok(repo)
    }

    fn callbacks(&self) -> RemoteCallbacks<'static> {
        let remote = self.remote.clone();
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(move |_url, username_from_url, allowed_types| {
            if allowed_types.contains(git2::CredentialType::USER_PASS_PLAINTEXT)
                && !remote.token.is_empty()
            {
                let user = if remote.user.is_empty() {
                    username_from_url.unwrap_or("git")
                } else {
                    remote.user.as_str()
                };
                return Cred::userpass_plaintext(user, &remote.token);
            }
            Cred::default()
        });
        callbacks
    }

    fn fetch(&self, repo: &Repository) -> std::result::Result<(), git2::Error> {
        let mut options = FetchOptions::new();
        options.remote_callbacks(self.callbacks());
        repo.find_remote(REMOTE)?
            .fetch(&[FETCH_REFSPEC], Some(&mut options), None)
    }

    fn commit_once(
        &self,
        changes: &BTreeMap<String, Option<String>>,
        message: &str,
    ) -> std::result::Result<Option<Oid>, git2::Error> {
        let repo = self.open()?;
        self.fetch(&repo)?;

        let parent = repo
            .find_reference(&self.tracking_ref())
            .ok()
            .map(|r| r.peel_to_commit())
            .transpose()?;
        let base = match &parent {
            Some(commit) => commit.tree()?,
            None => {
                let empty = repo.treebuilder(None)?.write()?;
                repo.find_tree(empty)?
            }
        };

        let mut update = TreeUpdateBuilder::new();
        for (path, content) in changes {
            match content {
                Some(content) => {
                    let blob = repo.blob(content.as_bytes())?;
                    update.upsert(path.as_str(), blob, FileMode::Blob);
                }
                None if base.get_path(Path::new(path)).is_ok() => {
                    update.remove(path.as_str());
                }
                None => {}
            }
        }
        let tree_id = update.create_updated(&repo, &base)?;
        if tree_id == base.id() {
            debug!(cluster = %self.cluster, "nothing to commit");
            return Ok(None);
        }

        let tree = repo.find_tree(tree_id)?;
        let signature = Signature::now(&self.remote.author, &self.remote.email)?;
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let oid = repo.commit(None, &signature, &signature, message, &tree, &parents)?;

        let local = format!("refs/heads/{}", self.remote.branch);
        repo.reference(&local, oid, true, message)?;
        self.push(&repo, &local)?;
        repo.reference(&self.tracking_ref(), oid, true, "push")?;
        debug!(cluster = %self.cluster, commit = %oid, "pushed");
        Ok(Some(oid))
    }

    fn push(&self, repo: &Repository, local: &str) -> std::result::Result<(), git2::Error> {
        let rejected = Arc::new(std::sync::Mutex::new(None::<String>));
        let mut callbacks = self.callbacks();
        let sink = rejected.clone();
        callbacks.push_update_reference(move |refname, status| {
            if let Some(status) = status {
                if let Ok(mut slot) = sink.lock() {
                    *slot = Some(format!("{refname}: {status}"));
                }
            }
            Ok(())
        });
        let mut options = PushOptions::new();
        options.remote_callbacks(callbacks);
        repo.find_remote(REMOTE)?
            .push(&[format!("{local}:{local}")], Some(&mut options))?;

        let rejection = rejected.lock().ok().and_then(|mut slot| slot.take());
        match rejection {
            Some(reason) => Err(git2::Error::from_str(&format!("push rejected: {reason}"))),
            None => Ok(()),
        }
    }

    fn read_file(&self, path: &str) -> std::result::Result<Option<String>, git2::Error> {
        let repo = self.open()?;
        self.fetch(&repo)?;
        let Ok(reference) = repo.find_reference(&self.tracking_ref()) else {
            return Ok(None);
        };
        let tree = reference.peel_to_commit()?.tree()?;
        let Ok(entry) = tree.get_path(Path::new(path)) else {
            return Ok(None);
        };
        let blob = entry.to_object(&repo)?.peel_to_blob()?;
        Ok(Some(String::from_utf8_lossy(blob.content()).into_owned()))
    }
}
