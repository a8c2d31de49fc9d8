use super::error::AuthError;
use super::implicit::in_app_target;
use super::traits::Browser;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};
use url::Url;

/// Browser stand-in that lives in process memory. Navigations are recorded
/// rather than followed; the location only moves when told to.
#[derive(Debug)]
pub struct MemoryBrowser {
    location: RwLock<Url>,
    navigations: Mutex<Vec<Url>>,
    session: Mutex<HashMap<String, String>>,
}

impl MemoryBrowser {
    pub fn new(location: &str) -> Result<Self, AuthError> {
        Ok(Self {
            location: RwLock::new(Url::parse(location)?),
            navigations: Mutex::new(Vec::new()),
            session: Mutex::new(HashMap::new()),
        })
    }

    #[cfg(test)]
    pub(crate) fn at(location: &str) -> Self {
        Self::new(location).unwrap()
    }

    /// Simulates landing on a url, e.g. the provider redirecting back to us
    pub fn set_location(&self, location: &str) -> Result<(), AuthError> {
        let url = Url::parse(location)?;
        *self.location.write().unwrap_or_else(PoisonError::into_inner) = url;
        Ok(())
    }

    /// Every `assign` so far, oldest first
    pub fn navigations(&self) -> Vec<Url> {
        self.navigations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_navigation(&self) -> Option<Url> {
        self.navigations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

impl Browser for MemoryBrowser {
    fn location(&self) -> Url {
        self.location
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn assign(&self, url: &Url) {
        tracing::debug!("navigation recorded: {}", url);
        self.navigations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(url.clone());
    }

    /// Same-origin only, like `history.replaceState`
    fn replace_state(&self, path: &str) {
        let mut location = self.location.write().unwrap_or_else(PoisonError::into_inner);
        match in_app_target(&location, path) {
            Some(next) => *location = next,
            None => tracing::warn!("replace_state ignored off-origin path {}", path),
        }
    }

    fn session_get(&self, key: &str) -> Option<String> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn session_set(&self, key: &str, value: &str) {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }

    fn session_remove(&self, key: &str) {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}
