pub mod credentials;
pub mod progress;

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{Cred, FetchOptions, RemoteCallbacks, Repository};
use time::OffsetDateTime;

use crate::engine::{EventSink, SyncJob, SyncMode, Syncer};
use credentials::{CredentialScope, Credentials};
use progress::{parse_sideband, ClonePhase, ProgressTranslator};

/// "https://github.com/org/repo.git" -> "repo"
pub fn extract_repository_name(git_url: &str) -> &str {
  let fragment = git_url.rsplit('/').next().unwrap_or(git_url);
  fragment.strip_suffix(".git").unwrap_or(fragment)
}

/// "https://github.com/org/repo/" -> "org"
pub fn extract_repository_owner(git_url: &str) -> &str {
  let fragments: Vec<&str> = git_url.trim_matches('/').split('/').collect();
  if fragments.len() >= 2 {
    fragments[fragments.len() - 2]
  } else {
    ""
  }
}

/// Timestamp of the last fetch, or of HEAD for a repo that was cloned but
/// never fetched since.
pub fn last_updated(repo_path: &Path) -> Option<OffsetDateTime> {
  let git_dir = repo_path.join(".git");
  for name in ["FETCH_HEAD", "HEAD"] {
    let Ok(meta) = std::fs::metadata(git_dir.join(name)) else {
      continue;
    };
    if let Ok(mtime) = meta.modified() {
      return Some(OffsetDateTime::from(mtime));
    }
  }
  None
}

/// Whether `origin` has commits the local branch does not. Any failure (no
/// repository, detached HEAD, unreachable remote) reads as "no updates";
/// this feeds a hint in the catalog view, not an error path.
pub fn has_updates(
  repo_path: &Path,
  account: Option<&str>,
  token: Option<&str>,
  scope_timeout: Duration,
) -> bool {
  check_behind(repo_path, account, token, scope_timeout).unwrap_or(false)
}

fn check_behind(
  repo_path: &Path,
  account: Option<&str>,
  token: Option<&str>,
  scope_timeout: Duration,
) -> anyhow::Result<bool> {
  let repo = Repository::open(repo_path)?;
  let branch = {
    let head = repo.head()?;
    head.shorthand().context("detached HEAD")?.to_string()
  };

  {
    let scope = CredentialScope::enter(account, token, scope_timeout)?;
    let mut remote = repo.find_remote("origin")?;
    let mut opts = FetchOptions::new();
    opts.remote_callbacks(auth_callbacks(scope.credentials()));
    remote.fetch(&[branch.as_str()], Some(&mut opts), None)?;
  }

  let local = repo.head()?.peel_to_commit()?.id();
  let fetched = repo.find_reference("FETCH_HEAD")?.peel_to_commit()?.id();
  let (_ahead, behind) = repo.graph_ahead_behind(local, fetched)?;
  Ok(behind > 0)
}

fn auth_callbacks<'cb>(creds: Option<&Credentials>) -> RemoteCallbacks<'cb> {
  let mut callbacks = RemoteCallbacks::new();
  if let Some(creds) = creds {
    let account = creds.account.clone();
    let token = creds.token.clone();
    callbacks.credentials(move |_url, _username, _allowed| {
      Cred::userpass_plaintext(&account, &token)
    });
  }
  callbacks
}

/// The real clone-or-update implementation behind the [`Syncer`] seam.
pub struct GitSyncer {
  scope_timeout: Duration,
}

impl GitSyncer {
  pub fn new(scope_timeout: Duration) -> Self {
    Self { scope_timeout }
  }

  fn clone_repo(&self, job: &SyncJob, sink: &EventSink) -> anyhow::Result<()> {
    tracing::info!(
      job_id = %job.id,
      target = %job.target.display(),
      "repo does not exist yet, cloning"
    );

    let scope = CredentialScope::enter(
      job.account.as_deref(),
      job.token.as_deref(),
      self.scope_timeout,
    )?;

    let translator = parking_lot::Mutex::new(ProgressTranslator::new());

    let mut callbacks = auth_callbacks(scope.credentials());
    callbacks.transfer_progress(|stats| {
      let mut translator = translator.lock();
      if stats.received_objects() < stats.total_objects() {
        let message = format!(
          "Receiving objects ({}/{})",
          stats.received_objects(),
          stats.total_objects()
        );
        if let Some(update) = translator.observe(
          ClonePhase::Receiving,
          stats.received_objects() as u64,
          Some(stats.total_objects() as u64),
          &message,
        ) {
          sink.progress(update);
        }
      } else if stats.total_deltas() > 0 {
        let message = format!(
          "Resolving deltas ({}/{})",
          stats.indexed_deltas(),
          stats.total_deltas()
        );
        if let Some(update) = translator.observe(
          ClonePhase::Resolving,
          stats.indexed_deltas() as u64,
          Some(stats.total_deltas() as u64),
          &message,
        ) {
          sink.progress(update);
        }
      }
      true
    });
    callbacks.sideband_progress(|data| {
      let Ok(text) = std::str::from_utf8(data) else {
        return true;
      };
      for line in text.split(['\r', '\n']).filter(|l| !l.trim().is_empty()) {
        let mut translator = translator.lock();
        if let Some((phase, current, max)) = parse_sideband(line) {
          match translator.observe(phase, current, max, line.trim()) {
            Some(update) => sink.progress(update),
            // Phase noted, but no usable counters: forward the line as-is.
            None => sink.output(line.trim()),
          }
        }
      }
      true
    });

    let mut fetch_opts = FetchOptions::new();
    fetch_opts.remote_callbacks(callbacks);
    if let Some(depth) = job.depth {
      fetch_opts.depth(depth as i32);
    }

    let mut builder = RepoBuilder::new();
    builder.fetch_options(fetch_opts);
    if let Some(branch) = &job.branch {
      builder.branch(branch);
    }

    if let Some(parent) = job.target.parent() {
      std::fs::create_dir_all(parent).context("failed to create clone destination")?;
    }
    builder
      .clone(&job.source, &job.target)
      .with_context(|| format!("failed to clone into {}", job.target.display()))?;

    tracing::info!(job_id = %job.id, target = %job.target.display(), "repo initialized");
    Ok(())
  }

  fn update_repo(&self, job: &SyncJob, sink: &EventSink) -> anyhow::Result<()> {
    tracing::info!(
      job_id = %job.id,
      target = %job.target.display(),
      "repo exists, updating"
    );

    let repo = Repository::open(&job.target)
      .with_context(|| format!("failed to open {}", job.target.display()))?;
    let branch = match &job.branch {
      Some(branch) => branch.clone(),
      None => {
        let head = repo.head().context("failed to resolve HEAD")?;
        head.shorthand().context("detached HEAD")?.to_string()
      }
    };

    sink.output(format!("Fetching origin ({branch})"));
    {
      let scope = CredentialScope::enter(
        job.account.as_deref(),
        job.token.as_deref(),
        self.scope_timeout,
      )?;
      let mut remote = repo.find_remote("origin").context("no origin remote")?;
      let mut opts = FetchOptions::new();
      opts.remote_callbacks(auth_callbacks(scope.credentials()));
      if let Some(depth) = job.depth {
        opts.depth(depth as i32);
      }
      remote
        .fetch(&[branch.as_str()], Some(&mut opts), None)
        .with_context(|| format!("failed to fetch origin/{branch}"))?;
    }

    let fetch_head = repo.find_reference("FETCH_HEAD")?;
    let fetched = repo.reference_to_annotated_commit(&fetch_head)?;
    let (analysis, _) = repo.merge_analysis(&[&fetched])?;

    if analysis.is_up_to_date() {
      sink.output(format!("Already up to date at {}", fetched.id()));
    } else if analysis.is_fast_forward() {
      let refname = format!("refs/heads/{branch}");
      let mut reference = repo
        .find_reference(&refname)
        .with_context(|| format!("local branch {branch} not found"))?;
      reference.set_target(fetched.id(), "fast-forward")?;
      repo.set_head(&refname)?;
      repo.checkout_head(Some(CheckoutBuilder::default().force()))?;
      sink.output(format!("Fast-forwarded {branch} to {}", fetched.id()));
    } else {
      anyhow::bail!("cannot fast-forward {branch}: local history has diverged");
    }

    Ok(())
  }
}

impl Syncer for GitSyncer {
  fn sync(&self, job: &SyncJob, sink: &EventSink) -> anyhow::Result<()> {
    match job.mode {
      SyncMode::Clone => self.clone_repo(job, sink),
      SyncMode::Update => self.update_repo(job, sink),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn extracts_repository_name() {
    assert_eq!(extract_repository_name("https://github.com/org/repo.git"), "repo");
    assert_eq!(extract_repository_name("https://github.com/org/repo"), "repo");
    assert_eq!(extract_repository_name("git@github.com:org/repo.git"), "repo");
  }

  #[test]
  fn extracts_repository_owner() {
    assert_eq!(extract_repository_owner("https://github.com/org/repo/"), "org");
    assert_eq!(extract_repository_owner("https://github.com/org/repo"), "org");
    assert_eq!(extract_repository_owner("repo"), "");
  }

  #[test]
  fn last_updated_prefers_fetch_head() {
    let dir = tempfile::tempdir().unwrap();
    assert!(last_updated(dir.path()).is_none());

    let git_dir = dir.path().join(".git");
    std::fs::create_dir_all(&git_dir).unwrap();
    std::fs::write(git_dir.join("HEAD"), "ref: refs/heads/main\n").unwrap();
    assert!(last_updated(dir.path()).is_some());

    std::fs::write(git_dir.join("FETCH_HEAD"), "abc\n").unwrap();
    let stamped = last_updated(dir.path()).unwrap();
    let head_mtime: OffsetDateTime =
      std::fs::metadata(git_dir.join("FETCH_HEAD")).unwrap().modified().unwrap().into();
    assert_eq!(stamped, head_mtime);
  }

  #[test]
  fn has_updates_is_false_for_a_missing_repo() {
    let dir = tempfile::tempdir().unwrap();
    assert!(!has_updates(&dir.path().join("nope"), None, None, Duration::from_millis(10)));
  }
}
