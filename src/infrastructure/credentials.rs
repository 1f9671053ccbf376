//! Credential resolution
//!
//! Stages name credentials; only adapters turn a name into a secret, at
//! invocation time. Secret values never appear in `Debug` or `Display`
//! output, and [`Redactor`] scrubs them from captured tool output.

use super::adapter::AdapterError;
use ahash::AHashMap;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Replacement written in place of secret values
pub const MASK: &str = "****";

/// Prefix of environment variables holding credentials
pub const ENV_PREFIX: &str = "STAGEGATE_CRED_";

/// Name of a credential
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialRef(String);

impl CredentialRef {
    /// Creates a reference
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Credential name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CredentialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CredentialRef {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A secret value
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wraps a secret value
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the secret value
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({MASK})")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(MASK)
    }
}

/// A resolved credential
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Credential {
    /// User name, for credentials that have one
    #[serde(default)]
    pub username: Option<String>,
    /// Secret value (password, token or private key)
    pub secret: Secret,
}

impl Credential {
    /// Creates a credential without user name
    pub fn secret(secret: impl Into<String>) -> Self {
        Self {
            username: None,
            secret: Secret::new(secret),
        }
    }

    /// Creates a user name and password credential
    pub fn user(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            secret: Secret::new(secret),
        }
    }
}

/// Turns credential names into secrets
///
/// Shared by every adapter and every engine; implementations must allow
/// concurrent reads.
pub trait CredentialResolver: Send + Sync {
    /// Resolves a credential
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::InvalidCredential`] when the name is unknown.
    fn resolve(&self, reference: &CredentialRef) -> Result<Credential, AdapterError>;
}

/// Shared resolver handle
pub type SharedResolver = Arc<dyn CredentialResolver>;

/// Environment variable name for a credential: `STAGEGATE_CRED_<NAME>`
#[must_use]
pub fn env_var_name(reference: &CredentialRef) -> String {
    let normalized: String = reference
        .name()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{ENV_PREFIX}{normalized}")
}

type Lookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Credentials read from the environment
///
/// `STAGEGATE_CRED_<NAME>` holds the secret and the optional
/// `STAGEGATE_CRED_<NAME>_USER` holds the user name.
#[derive(Clone)]
pub struct EnvCredentials {
    lookup: Lookup,
}

impl EnvCredentials {
    /// Reads the process environment
    pub fn new() -> Self {
        Self::with_lookup(|key| std::env::var(key).ok())
    }

    /// Reads variables through a custom lookup
    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Arc::new(lookup),
        }
    }
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialResolver for EnvCredentials {
    fn resolve(&self, reference: &CredentialRef) -> Result<Credential, AdapterError> {
        let var = env_var_name(reference);
        let secret = (self.lookup)(&var)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AdapterError::InvalidCredential(reference.to_string()))?;
        Ok(Credential {
            username: (self.lookup)(&format!("{var}_USER")),
            secret: Secret::new(secret),
        })
    }
}

/// Credentials provisioned in memory (from the config file)
#[derive(Default)]
pub struct StaticCredentials {
    entries: RwLock<AHashMap<String, Credential>>,
}

impl StaticCredentials {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a credential
    pub fn insert(&self, name: impl Into<String>, credential: Credential) {
        self.entries.write().insert(name.into(), credential);
    }

    /// Number of credentials
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the store holds no credentials
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl FromIterator<(String, Credential)> for StaticCredentials {
    fn from_iter<T: IntoIterator<Item = (String, Credential)>>(iter: T) -> Self {
        Self {
            entries: RwLock::new(iter.into_iter().collect()),
        }
    }
}

impl CredentialResolver for StaticCredentials {
    fn resolve(&self, reference: &CredentialRef) -> Result<Credential, AdapterError> {
        self.entries
            .read()
            .get(reference.name())
            .cloned()
            .ok_or_else(|| AdapterError::InvalidCredential(reference.to_string()))
    }
}

/// Tries resolvers in order; the first that knows the name wins
#[derive(Default, Clone)]
pub struct CredentialChain {
    resolvers: Vec<SharedResolver>,
}

impl CredentialChain {
    /// Creates an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a resolver
    #[must_use]
    pub fn with(mut self, resolver: SharedResolver) -> Self {
        self.resolvers.push(resolver);
        self
    }
}

impl CredentialResolver for CredentialChain {
    fn resolve(&self, reference: &CredentialRef) -> Result<Credential, AdapterError> {
        self.resolvers
            .iter()
            .find_map(|r| r.resolve(reference).ok())
            .ok_or_else(|| AdapterError::InvalidCredential(reference.to_string()))
    }
}

/// Scrubs secret values from text
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    pattern: Option<Regex>,
}

impl Redactor {
    /// Builds a redactor for the given secrets
    pub fn new<'a>(secrets: impl IntoIterator<Item = &'a Secret>) -> Self {
        let mut values: Vec<&str> = secrets
            .into_iter()
            .map(Secret::expose)
            .filter(|s| !s.is_empty())
            .collect();
        // Longest first so a secret containing another is masked whole.
        values.sort_by_key(|s| std::cmp::Reverse(s.len()));
        values.dedup();

        let pattern = if values.is_empty() {
            None
        } else {
            let alternation = values
                .iter()
                .map(|v| regex::escape(v))
                .collect::<Vec<_>>()
                .join("|");
            Regex::new(&alternation).ok()
        };
        Self { pattern }
    }

    /// Replaces every secret value with [`MASK`]
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        match &self.pattern {
            Some(pattern) => pattern.replace_all(text, MASK).into_owned(),
            None => text.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_secret_is_masked() {
        let credential = Credential::user("deploy", "hunter2");
        assert!(!format!("{credential:?}").contains("hunter2"));
        assert_eq!(credential.secret.to_string(), MASK);
        assert_eq!(credential.secret.expose(), "hunter2");
    }

    #[test]
    fn test_env_var_name() {
        assert_eq!(
            env_var_name(&CredentialRef::new("deploy-ssh")),
            "STAGEGATE_CRED_DEPLOY_SSH"
        );
    }

    #[test]
    fn test_env_credentials() {
        let vars = HashMap::from([
            ("STAGEGATE_CRED_REGISTRY".to_string(), "s3cret".to_string()),
            ("STAGEGATE_CRED_REGISTRY_USER".to_string(), "ci".to_string()),
        ]);
        let resolver = EnvCredentials::with_lookup(move |key| vars.get(key).cloned());

        let credential = resolver.resolve(&"registry".into()).unwrap();
        assert_eq!(credential, Credential::user("ci", "s3cret"));

        assert_eq!(
            resolver.resolve(&"missing".into()),
            Err(AdapterError::InvalidCredential("missing".to_string()))
        );
    }

    #[test]
    fn test_chain_falls_through() {
        let store = StaticCredentials::new();
        store.insert("deploy-ssh", Credential::secret("KEY"));
        let chain = CredentialChain::new()
            .with(Arc::new(EnvCredentials::with_lookup(|_| None)))
            .with(Arc::new(store));

        assert!(chain.resolve(&"deploy-ssh".into()).is_ok());
        assert!(chain.resolve(&"registry".into()).is_err());
    }

    #[test]
    fn test_concurrent_reads() {
        let store: Arc<StaticCredentials> = Arc::new(
            [("registry".to_string(), Credential::secret("pw"))]
                .into_iter()
                .collect(),
        );
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.resolve(&"registry".into()).is_ok())
            })
            .collect();
        assert!(handles.into_iter().all(|h| h.join().unwrap()));
    }

    #[test]
    fn test_redactor() {
        let secrets = [Secret::new("hunter2"), Secret::new("hunter2-long"), Secret::new("")];
        let redactor = Redactor::new(&secrets);
        assert_eq!(
            redactor.redact("login hunter2-long then hunter2 (a.b)"),
            "login **** then **** (a.b)"
        );
        assert_eq!(Redactor::default().redact("plain"), "plain");
    }
}
