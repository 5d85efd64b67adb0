use parking_lot::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::GalleryError;

static SCOPE: Mutex<()> = Mutex::new(());

/// Credential pair for one sync operation.
#[derive(Debug, Clone)]
pub struct Credentials {
  pub account: String,
  pub token: String,
}

/// Exclusive scope for credential-bearing git operations.
///
/// git does not like concurrent use; an operation that authenticates holds
/// this process-wide scope for its full duration, so two jobs with
/// different credentials can never overlap. The credentials themselves are
/// handed to libgit2 explicitly through [`CredentialScope::credentials`]
/// rather than through ambient process state, so a scope cannot leak into
/// another job even in principle.
pub struct CredentialScope {
  creds: Option<Credentials>,
  _guard: Option<MutexGuard<'static, ()>>,
}

impl CredentialScope {
  /// Enter a scope, blocking up to `timeout` while another credential-bearing
  /// operation is active. With no credential pair configured the scope is
  /// inert: nothing is locked and the operation runs unauthenticated.
  pub fn enter(
    account: Option<&str>,
    token: Option<&str>,
    timeout: Duration,
  ) -> Result<Self, GalleryError> {
    match (account, token) {
      (Some(account), Some(token)) => {
        let guard = SCOPE
          .try_lock_for(timeout)
          .ok_or(GalleryError::CredentialScopeBusy)?;
        Ok(Self {
          creds: Some(Credentials {
            account: account.to_string(),
            token: token.to_string(),
          }),
          _guard: Some(guard),
        })
      }
      _ => Ok(Self { creds: None, _guard: None }),
    }
  }

  pub fn credentials(&self) -> Option<&Credentials> {
    self.creds.as_ref()
  }
}
