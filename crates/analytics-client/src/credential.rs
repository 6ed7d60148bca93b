//! Credential sources for authenticating with the service.

use std::fmt;
use std::sync::Arc;

/// A username and password pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPassPair {
    /// Username.
    pub username: String,
    /// Password.
    pub password: String,
}

/// A way to authenticate with the server.
///
/// The credential source is consulted on every request attempt, so a
/// [`Credential::Dynamic`] provider can rotate passwords without
/// rebuilding the cluster handle.
#[derive(Clone)]
pub enum Credential {
    /// A fixed username and password.
    Basic(UserPassPair),
    /// A callback invoked at each request attempt.
    Dynamic(Arc<dyn Fn() -> UserPassPair + Send + Sync>),
}

impl Credential {
    /// Creates a basic-auth credential from a fixed pair.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Credential {
        Credential::Basic(UserPassPair {
            username: username.into(),
            password: password.into(),
        })
    }

    /// Creates a credential that asks `provider` for the current pair on
    /// every request attempt.
    pub fn dynamic(provider: impl Fn() -> UserPassPair + Send + Sync + 'static) -> Credential {
        Credential::Dynamic(Arc::new(provider))
    }

    pub(crate) fn credentials(&self) -> UserPassPair {
        match self {
            Credential::Basic(pair) => pair.clone(),
            Credential::Dynamic(provider) => provider(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Basic(pair) => f
                .debug_struct("Basic")
                .field("username", &pair.username)
                .field("password", &"***REDACTED***")
                .finish(),
            Credential::Dynamic(_) => f.debug_struct("Dynamic").finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_credentials() {
        let cred = Credential::basic("user", "pass");
        let pair = cred.credentials();

        assert_eq!(pair.username, "user");
        assert_eq!(pair.password, "pass");
    }

    #[test]
    fn test_dynamic_credentials_consulted_each_time() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let cred = Credential::dynamic(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);

            UserPassPair {
                username: format!("user-{n}"),
                password: "pass".to_string(),
            }
        });

        assert_eq!(cred.credentials().username, "user-0");
        assert_eq!(cred.credentials().username, "user-1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_debug_masks_password() {
        let cred = Credential::basic("user", "hunter2");
        let debug = format!("{cred:?}");

        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("REDACTED"));
    }
}
