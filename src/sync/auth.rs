use parking_lot::RwLock;
use tracing::{debug, warn};

use super::protocol::HttpRequestInfo;
use crate::types::Result;

/// Upper bound on re-authentication attempts per request.
pub const MAX_REAUTH_TRIES: usize = 8;

/// Supplies a fresh auth token after the server rejected the current one.
pub trait AuthProvider: Send + Sync {
    /// A new token, or `None` to give up.
    fn get_auth(&self) -> Result<Option<String>>;
}

/// Current auth token plus the provider that renews it.
pub struct Auth {
    token: RwLock<String>,
    provider: Option<Box<dyn AuthProvider>>,
}

impl Auth {
    /// Starts with `token`; without a provider a rejection is final.
    pub fn new(token: impl Into<String>, provider: Option<Box<dyn AuthProvider>>) -> Self {
        Self {
            token: RwLock::new(token.into()),
            provider,
        }
    }

    /// The token sent with the next request.
    pub fn token(&self) -> String {
        self.token.read().clone()
    }

    /// Replaces the token.
    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write() = token.into();
    }

    /// Runs `attempt` with the current token, renewing it and retrying while
    /// the server answers 401, at most [`MAX_REAUTH_TRIES`] times.
    pub fn with_reauth<T, F>(&self, what: &'static str, mut attempt: F) -> Result<(T, HttpRequestInfo)>
    where
        F: FnMut(&str) -> Result<(T, HttpRequestInfo)>,
    {
        let mut tries = 0;
        loop {
            let (value, info) = attempt(&self.token())?;
            if !info.is_unauthorized() {
                return Ok((value, info));
            }
            let Some(provider) = self.provider.as_ref() else {
                return Ok((value, info));
            };
            tries += 1;
            if tries > MAX_REAUTH_TRIES {
                warn!(request = what, tries = MAX_REAUTH_TRIES, "sync.reauth.exhausted");
                return Ok((value, info));
            }
            match provider.get_auth()? {
                Some(token) => {
                    debug!(request = what, attempt = tries, "sync.reauth");
                    self.set_token(token);
                }
                None => return Ok((value, info)),
            }
        }
    }
}

impl Default for Auth {
    fn default() -> Self {
        Self::new(String::new(), None)
    }
}
