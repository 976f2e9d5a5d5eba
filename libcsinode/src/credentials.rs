//! Secret-backed driver credentials.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::error::CsiError;
use crate::store::SecretStore;

/// Decoded secret values handed to a single driver call.
///
/// Never persisted. `Debug` prints only how many keys are present.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials(HashMap<String, String>);

impl Credentials {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> HashMap<String, String> {
        self.0
    }
}

impl From<HashMap<String, String>> for Credentials {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials({} keys)", self.0.len())
    }
}

/// Fetches credentials for driver calls from the secret store.
#[derive(Clone)]
pub struct CredentialResolver {
    secrets: Arc<dyn SecretStore>,
}

impl CredentialResolver {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self { secrets }
    }

    /// Look up `namespace/name` and decode every value as UTF-8 (lossily).
    ///
    /// Store errors are returned untouched.
    #[instrument(skip(self))]
    pub async fn resolve(&self, namespace: &str, name: &str) -> Result<Credentials, CsiError> {
        let secret = self
            .secrets
            .get_secret(namespace, name)
            .await
            .inspect_err(|e| warn!(error = %e, "failed to fetch secret"))?;

        let credentials = secret
            .data
            .into_iter()
            .map(|(key, value)| (key, String::from_utf8_lossy(&value).into_owned()))
            .collect::<HashMap<_, _>>();

        debug!(keys = credentials.len(), "credentials resolved");
        Ok(Credentials(credentials))
    }
}
