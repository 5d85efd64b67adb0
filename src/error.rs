use std::path::Path;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;

use crate::model::ExhibitId;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Error taxonomy of the sync core. `UnknownExhibit` is the only variant a
/// client ever sees synchronously; the rest travel as terminal stream
/// events because the triggering request has already returned.
#[derive(Debug, thiserror::Error)]
pub enum GalleryError {
  #[error("exhibit_id {0} not found")]
  UnknownExhibit(ExhibitId),

  #[error("another sync is in progress, try again in a few minutes")]
  LockTimeout,

  /// Internal serialization of credential-bearing git operations; resolved
  /// by waiting and not expected to surface.
  #[error("timed out waiting for the credential scope")]
  CredentialScopeBusy,

  #[error("{message}")]
  SyncFailure { message: String, detail: String },
}

impl GalleryError {
  /// Wrap an underlying clone/fetch fault with its formatted source chain.
  pub fn sync_failure(err: &anyhow::Error) -> Self {
    Self::SyncFailure {
      message: err.to_string(),
      detail: error_chain(err),
    }
  }

  /// Terminal stream payload for this error: short message, plus the chain
  /// as `output` when there is one.
  pub fn into_event(self) -> crate::model::ProgressEvent {
    match self {
      Self::SyncFailure { message, detail } => {
        crate::model::ProgressEvent::Error { message, detail }
      }
      other => crate::model::ProgressEvent::Error {
        message: other.to_string(),
        detail: String::new(),
      },
    }
  }
}

/// Multi-line rendering of an error and its source chain, used as the
/// `output` payload of terminal error events.
pub fn error_chain(err: &anyhow::Error) -> String {
  let mut out = String::new();
  for (i, cause) in err.chain().enumerate() {
    if i == 0 {
      out.push_str(&cause.to_string());
    } else {
      out.push_str("\ncaused by: ");
      out.push_str(&cause.to_string());
    }
  }
  out
}

pub fn init_tracing(log_dir: Option<&Path>) -> anyhow::Result<()> {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,hyper=warn,tower=warn"));

  match log_dir {
    Some(dir) => {
      // Rotate daily; JSON lines so the logs stay machine-readable.
      std::fs::create_dir_all(dir)?;
      let file_appender = tracing_appender::rolling::daily(dir, "gallery-server.jsonl");
      let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
      let _ = LOG_GUARD.set(guard);

      tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(non_blocking)
        .json()
        .with_current_span(true)
        .init();
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
    }
  }

  Ok(())
}
