//! Negotiation settings and declarative handler attributes.
//!
//! Driver settings are resolved with a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `STYX_AUTH_TIMEOUT` | 30s | Overall negotiation timeout in seconds |
//! | `STYX_AUTH_BLOB_CAPACITY` | 4096 | Bytes per blob and maximum frame size |
//! | `STYX_AUTH_MAX_DELEGATIONS` | 4 | Delegation hops allowed per negotiation |
//! | `STYX_AUTH_MAX_RETRIES` | 3 | Retry attempts on transient faults |
//! | `STYX_AUTH_RETRY_DELAY_MS` | 1000ms | Initial retry delay in milliseconds |
//!
//! Handler attributes ([`Attributes`]) are a separate concern: they come
//! from an external configuration record and feed `init_from_config`.

use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use super::error::AuthError;

/// Default overall negotiation timeout in seconds
pub(crate) const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default blob capacity in bytes
pub(crate) const DEFAULT_BLOB_CAPACITY: usize = 4096;

/// Smallest blob the driver accepts; every handshake message header must fit
pub(crate) const MIN_BLOB_CAPACITY: usize = 16;

/// Default number of delegation hops per negotiation
pub(crate) const DEFAULT_MAX_DELEGATIONS: usize = 4;

/// Default maximum retry attempts on transient faults
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry delay in milliseconds
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Maximum retry delay cap
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Environment variable name for the negotiation timeout
pub(crate) const TIMEOUT_ENV_VAR: &str = "STYX_AUTH_TIMEOUT";

/// Environment variable name for the blob capacity
pub(crate) const BLOB_CAPACITY_ENV_VAR: &str = "STYX_AUTH_BLOB_CAPACITY";

/// Environment variable name for the delegation limit
pub(crate) const MAX_DELEGATIONS_ENV_VAR: &str = "STYX_AUTH_MAX_DELEGATIONS";

/// Environment variable name for max retries
pub(crate) const MAX_RETRIES_ENV_VAR: &str = "STYX_AUTH_MAX_RETRIES";

/// Environment variable name for the retry delay in milliseconds
pub(crate) const RETRY_DELAY_MS_ENV_VAR: &str = "STYX_AUTH_RETRY_DELAY_MS";

/// Resolve a value with priority: parameter -> env var -> default
fn resolve<T: FromStr>(param: Option<T>, env_var: &str, default: T) -> T {
    if let Some(value) = param {
        return value;
    }

    if let Ok(raw) = env::var(env_var)
        && let Ok(value) = raw.trim().parse::<T>()
    {
        return value;
    }

    default
}

/// Resolve the negotiation timeout in seconds.
pub(crate) fn resolve_timeout(timeout_param: Option<u64>) -> u64 {
    resolve(timeout_param, TIMEOUT_ENV_VAR, DEFAULT_TIMEOUT_SECS)
}

/// Resolve the blob capacity, never going below [`MIN_BLOB_CAPACITY`].
pub(crate) fn resolve_blob_capacity(capacity_param: Option<usize>) -> usize {
    resolve(capacity_param, BLOB_CAPACITY_ENV_VAR, DEFAULT_BLOB_CAPACITY).max(MIN_BLOB_CAPACITY)
}

/// Resolve the delegation hop limit.
pub(crate) fn resolve_max_delegations(max_param: Option<usize>) -> usize {
    resolve(max_param, MAX_DELEGATIONS_ENV_VAR, DEFAULT_MAX_DELEGATIONS)
}

/// Resolve the max retries value.
pub(crate) fn resolve_max_retries(max_retries_param: Option<u32>) -> u32 {
    resolve(max_retries_param, MAX_RETRIES_ENV_VAR, DEFAULT_MAX_RETRIES)
}

/// Resolve the retry delay in milliseconds.
pub(crate) fn resolve_retry_delay_ms(retry_delay_param: Option<u64>) -> u64 {
    resolve(retry_delay_param, RETRY_DELAY_MS_ENV_VAR, DEFAULT_RETRY_DELAY_MS)
}

/// Resolved settings for a [`Negotiator`](super::negotiate::Negotiator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatorConfig {
    pub timeout: Duration,
    pub blob_capacity: usize,
    pub max_delegations: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl NegotiatorConfig {
    /// Resolve every setting, preferring the given overrides.
    pub fn resolve(
        timeout_secs: Option<u64>,
        blob_capacity: Option<usize>,
        max_delegations: Option<usize>,
        max_retries: Option<u32>,
        retry_delay_ms: Option<u64>,
    ) -> Self {
        Self {
            timeout: Duration::from_secs(resolve_timeout(timeout_secs)),
            blob_capacity: resolve_blob_capacity(blob_capacity),
            max_delegations: resolve_max_delegations(max_delegations),
            max_retries: resolve_max_retries(max_retries),
            retry_delay: Duration::from_millis(resolve_retry_delay_ms(retry_delay_ms)),
        }
    }

    /// Settings taken from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self::resolve(None, None, None, None, None)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_blob_capacity(mut self, capacity: usize) -> Self {
        self.blob_capacity = capacity.max(MIN_BLOB_CAPACITY);
        self
    }

    pub fn with_max_delegations(mut self, max: usize) -> Self {
        self.max_delegations = max;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = delay;
        self
    }
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            blob_capacity: DEFAULT_BLOB_CAPACITY,
            max_delegations: DEFAULT_MAX_DELEGATIONS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

/// Named configuration attributes for declarative handler initialization.
///
/// Keys are protocol-specific. Text form follows factotum key tuples:
/// `proto=p9sk1 user=alice key=0a1b...`; values may be single-quoted and a
/// doubled quote inside a quoted value stands for one quote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    values: BTreeMap<String, String>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Fetch a required attribute; empty values count as missing.
    pub fn required(&self, name: &str) -> Result<&str, AuthError> {
        match self.get(name) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(AuthError::MissingAttribute(name.to_string())),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parse a factotum-style tuple list.
    pub fn parse(text: &str) -> Result<Self, AuthError> {
        let mut attrs = Attributes::new();
        let mut chars = text.chars().peekable();

        loop {
            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }
            if chars.peek().is_none() {
                break;
            }

            let mut name = String::new();
            while let Some(&c) = chars.peek() {
                if c == '=' || c.is_whitespace() {
                    break;
                }
                name.push(c);
                chars.next();
            }

            if chars.peek() != Some(&'=') {
                // bare word, e.g. a flag with no value
                attrs.insert(name, "");
                continue;
            }
            chars.next();

            let mut value = String::new();
            if chars.peek() == Some(&'\'') {
                chars.next();
                loop {
                    match chars.next() {
                        Some('\'') if chars.peek() == Some(&'\'') => {
                            chars.next();
                            value.push('\'');
                        }
                        Some('\'') => break,
                        Some(c) => value.push(c),
                        None => {
                            return Err(AuthError::invalid_attribute(name, "unterminated quote"));
                        }
                    }
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() {
                        break;
                    }
                    value.push(c);
                    chars.next();
                }
            }

            if name.is_empty() {
                return Err(AuthError::invalid_attribute("", "attribute with empty name"));
            }
            attrs.insert(name, value);
        }

        Ok(attrs)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut attrs = Attributes::new();
        for (k, v) in iter {
            attrs.insert(k, v);
        }
        attrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    // Use a mutex to serialize env var tests to avoid race conditions
    static ENV_TEST_MUTEX: once_cell::sync::Lazy<StdMutex<()>> =
        once_cell::sync::Lazy::new(|| StdMutex::new(()));

    /// Helper to set an environment variable safely within tests.
    /// SAFETY: Must be called while holding ENV_TEST_MUTEX to prevent data races.
    unsafe fn set_env(key: &str, value: &str) {
        // SAFETY: Caller ensures ENV_TEST_MUTEX is held
        unsafe { env::set_var(key, value) };
    }

    /// Helper to remove an environment variable safely within tests.
    /// SAFETY: Must be called while holding ENV_TEST_MUTEX to prevent data races.
    unsafe fn remove_env(key: &str) {
        // SAFETY: Caller ensures ENV_TEST_MUTEX is held
        unsafe { env::remove_var(key) };
    }

    mod config_resolution {
        use super::*;

        #[test]
        fn test_uses_param_when_provided() {
            assert_eq!(resolve_timeout(Some(60)), 60);
            assert_eq!(resolve_max_retries(Some(9)), 9);
        }

        #[test]
        fn test_param_takes_priority_over_env() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(TIMEOUT_ENV_VAR, "120");
            }
            let result = resolve_timeout(Some(45));
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(TIMEOUT_ENV_VAR);
            }
            assert_eq!(result, 45);
        }

        #[test]
        fn test_uses_env_var_when_no_param() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(MAX_DELEGATIONS_ENV_VAR, "7");
            }
            let result = resolve_max_delegations(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(MAX_DELEGATIONS_ENV_VAR);
            }
            assert_eq!(result, 7);
        }

        #[test]
        fn test_invalid_env_falls_back_to_default() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(RETRY_DELAY_MS_ENV_VAR, "soon");
            }
            let result = resolve_retry_delay_ms(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(RETRY_DELAY_MS_ENV_VAR);
            }
            assert_eq!(result, DEFAULT_RETRY_DELAY_MS);
        }

        #[test]
        fn test_blob_capacity_has_floor() {
            assert_eq!(resolve_blob_capacity(Some(1)), MIN_BLOB_CAPACITY);
            assert_eq!(resolve_blob_capacity(Some(512)), 512);
        }

        #[test]
        fn test_defaults() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            let config = NegotiatorConfig::from_env();
            assert_eq!(config, NegotiatorConfig::default());
        }

        #[test]
        fn test_builder_overrides() {
            let config = NegotiatorConfig::default()
                .with_timeout(Duration::from_secs(5))
                .with_blob_capacity(0)
                .with_max_delegations(1)
                .with_retries(0, Duration::from_millis(10));
            assert_eq!(config.timeout, Duration::from_secs(5));
            assert_eq!(config.blob_capacity, MIN_BLOB_CAPACITY);
            assert_eq!(config.max_delegations, 1);
            assert_eq!(config.max_retries, 0);
        }
    }

    mod attributes {
        use super::*;

        #[test]
        fn test_parse_simple_tuples() {
            let attrs = Attributes::parse("proto=p9sk1 user=alice  role=server").unwrap();
            assert_eq!(attrs.len(), 3);
            assert_eq!(attrs.get("proto"), Some("p9sk1"));
            assert_eq!(attrs.get("user"), Some("alice"));
            assert_eq!(attrs.get("role"), Some("server"));
        }

        #[test]
        fn test_parse_quoted_value() {
            let attrs = Attributes::parse("user='bob smith' note='it''s'").unwrap();
            assert_eq!(attrs.get("user"), Some("bob smith"));
            assert_eq!(attrs.get("note"), Some("it's"));
        }

        #[test]
        fn test_parse_bare_word() {
            let attrs = Attributes::parse("user=alice verbose").unwrap();
            assert_eq!(attrs.get("verbose"), Some(""));
        }

        #[test]
        fn test_parse_unterminated_quote() {
            let err = Attributes::parse("user='alice").unwrap_err();
            assert!(matches!(err, AuthError::InvalidAttribute { .. }));
        }

        #[test]
        fn test_parse_empty_name() {
            assert!(Attributes::parse("=alice").is_err());
        }

        #[test]
        fn test_parse_empty_input() {
            assert!(Attributes::parse("   ").unwrap().is_empty());
        }

        #[test]
        fn test_required_treats_empty_as_missing() {
            let attrs = Attributes::new().with("user", "");
            let err = attrs.required("user").unwrap_err();
            assert!(matches!(err, AuthError::MissingAttribute(name) if name == "user"));
            assert!(attrs.required("key").is_err());
        }

        #[test]
        fn test_from_iterator() {
            let attrs: Attributes = [("user", "alice"), ("proto", "p9sk2")].into_iter().collect();
            assert_eq!(attrs.required("proto").unwrap(), "p9sk2");
            let names: Vec<_> = attrs.iter().map(|(k, _)| k).collect();
            assert_eq!(names, vec!["proto", "user"]);
        }
    }
}
