//! Secret registry
//!
//! Maps reference prefixes to backend plugins and caches resolved values.
//! The cache check and the fill are separate lock phases, so two tasks
//! resolving the same cold reference concurrently may both call the plugin.
//! The cache only reduces backend load; it does not guarantee exactly-once
//! resolution.

use super::reference::SecretReference;
use super::{BoxError, SecretError};
use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A secret backend serving one reference prefix
#[async_trait]
pub trait Plugin: Send + Sync {
    /// The prefix this plugin resolves, without the `:` separator
    fn prefix(&self) -> &str;

    /// Resolve an identifier to its secret value
    ///
    /// Implementations should abandon the lookup once `cancel` fires. Any
    /// error is handed back to the caller unchanged; retry policy belongs to
    /// the plugin.
    async fn load(&self, cancel: &CancellationToken, id: &str) -> Result<String, BoxError>;
}

#[derive(Debug, Clone)]
struct CachedSecret {
    value: String,
    /// `None` when the entry was stored with the TTL disabled
    expires_at: Option<Instant>,
}

impl CachedSecret {
    fn is_live(&self, ttl: Duration, now: Instant) -> bool {
        if ttl.is_zero() {
            return true;
        }
        self.expires_at.map_or(true, |expires_at| now < expires_at)
    }
}

/// Registry of secret plugins with a read-through value cache
pub struct SecretRegistry {
    plugins: RwLock<HashMap<String, Arc<dyn Plugin>>>,
    cache: RwLock<HashMap<String, CachedSecret>>,
    cache_ttl: RwLock<Duration>,
}

impl SecretRegistry {
    /// Create an empty registry. A zero `cache_ttl` disables expiry.
    pub fn new(cache_ttl: Duration) -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            cache_ttl: RwLock::new(cache_ttl),
        }
    }

    /// Register a plugin under its prefix, replacing any previous binding
    pub fn register(&self, plugin: Arc<dyn Plugin>) {
        let prefix = plugin.prefix().to_string();
        if write(&self.plugins).insert(prefix.clone(), plugin).is_some() {
            warn!(prefix = %prefix, "Secret plugin replaced an existing registration");
        } else {
            debug!(prefix = %prefix, "Secret plugin registered");
        }
    }

    /// Registered prefixes, sorted
    pub fn prefixes(&self) -> Vec<String> {
        let mut prefixes: Vec<String> = read(&self.plugins).keys().cloned().collect();
        prefixes.sort();
        prefixes
    }

    pub fn cache_ttl(&self) -> Duration {
        *read(&self.cache_ttl)
    }

    pub fn set_cache_ttl(&self, ttl: Duration) {
        *write(&self.cache_ttl) = ttl;
    }

    /// Check that a reference is well formed and names a registered plugin.
    /// Never contacts the plugin.
    pub fn validate_secret(&self, reference: &str) -> Result<(), SecretError> {
        let parsed = SecretReference::parse(reference)?;
        self.plugin_for(&parsed).map(|_| ())
    }

    /// Resolve a reference, serving from the cache when a live entry exists
    pub async fn load_secret(
        &self,
        cancel: &CancellationToken,
        reference: &str,
    ) -> Result<String, SecretError> {
        let ttl = self.cache_ttl();
        if let Some(cached) = read(&self.cache).get(reference) {
            if cached.is_live(ttl, Instant::now()) {
                return Ok(cached.value.clone());
            }
        }

        let parsed = SecretReference::parse(reference)?;
        let plugin = self.plugin_for(&parsed)?;

        debug!(prefix = parsed.prefix(), "Resolving secret through plugin");
        let value = plugin
            .load(cancel, parsed.identifier())
            .await
            .map_err(|source| SecretError::Plugin { source })?;

        // Re-read the TTL: it may have changed while the plugin was working
        let ttl = self.cache_ttl();
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        write(&self.cache).insert(
            reference.to_string(),
            CachedSecret {
                value: value.clone(),
                expires_at,
            },
        );

        Ok(value)
    }

    /// Resolve one reference chosen uniformly at random from `references`
    ///
    /// A single reference is resolved directly without drawing randomness.
    pub async fn load_random_secret<S: AsRef<str>>(
        &self,
        cancel: &CancellationToken,
        references: &[S],
    ) -> Result<String, SecretError> {
        if references.is_empty() {
            return Err(SecretError::NoSecretsProvided);
        }
        let index = select_index(&mut OsRng, references.len());
        self.load_secret(cancel, references[index].as_ref()).await
    }

    /// Drop every cached value. Registered plugins are kept.
    pub fn clear_cache(&self) {
        *write(&self.cache) = HashMap::new();
    }

    /// Number of entries currently held in the cache, live or not
    pub fn cached_entries(&self) -> usize {
        read(&self.cache).len()
    }

    fn plugin_for(&self, reference: &SecretReference<'_>) -> Result<Arc<dyn Plugin>, SecretError> {
        read(&self.plugins)
            .get(reference.prefix())
            .cloned()
            .ok_or_else(|| SecretError::UnknownSource {
                prefix: reference.prefix().to_string(),
            })
    }
}

impl Default for SecretRegistry {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl std::fmt::Debug for SecretRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretRegistry")
            .field("prefixes", &self.prefixes())
            .field("cache_ttl", &self.cache_ttl())
            .field("cached_entries", &self.cached_entries())
            .finish()
    }
}

/// Pick an index in `0..len`; `len` must be non-zero
fn select_index<R: Rng + ?Sized>(rng: &mut R, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    rng.gen_range(0..len)
}

// Critical sections never panic, so a poisoned lock still holds consistent data
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns `"<prefix>-<id>"` and counts calls
    struct CountingPlugin {
        prefix: String,
        calls: AtomicUsize,
    }

    impl CountingPlugin {
        fn new(prefix: &str) -> Arc<Self> {
            Arc::new(Self {
                prefix: prefix.to_string(),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Plugin for CountingPlugin {
        fn prefix(&self) -> &str {
            &self.prefix
        }

        async fn load(&self, cancel: &CancellationToken, id: &str) -> Result<String, BoxError> {
            if cancel.is_cancelled() {
                return Err("lookup cancelled".into());
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{}-{}", self.prefix, id))
        }
    }

    struct FailingPlugin;

    #[async_trait]
    impl Plugin for FailingPlugin {
        fn prefix(&self) -> &str {
            "broken"
        }

        async fn load(&self, _cancel: &CancellationToken, id: &str) -> Result<String, BoxError> {
            Err(format!("backend unavailable for {id}").into())
        }
    }

    /// An RNG that must never be consulted
    struct UntouchableRng;

    impl RngCore for UntouchableRng {
        fn next_u32(&mut self) -> u32 {
            panic!("randomness consumed")
        }

        fn next_u64(&mut self) -> u64 {
            panic!("randomness consumed")
        }

        fn fill_bytes(&mut self, _dest: &mut [u8]) {
            panic!("randomness consumed")
        }

        fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> Result<(), rand::Error> {
            panic!("randomness consumed")
        }
    }

    fn registry_with(plugin: Arc<dyn Plugin>, ttl: Duration) -> SecretRegistry {
        let registry = SecretRegistry::new(ttl);
        registry.register(plugin);
        registry
    }

    #[test]
    fn test_validate_secret() {
        let registry = registry_with(CountingPlugin::new("env"), Duration::ZERO);

        assert!(registry.validate_secret("env:API_KEY").is_ok());
        assert!(matches!(
            registry.validate_secret("vault:token"),
            Err(SecretError::UnknownSource { prefix }) if prefix == "vault"
        ));
        assert!(matches!(
            registry.validate_secret("API_KEY"),
            Err(SecretError::InvalidReference { .. })
        ));
    }

    #[test]
    fn test_validate_secret_never_calls_plugin() {
        let plugin = CountingPlugin::new("env");
        let registry = registry_with(plugin.clone(), Duration::ZERO);

        registry.validate_secret("env:API_KEY").unwrap();
        assert_eq!(plugin.calls(), 0);
    }

    #[tokio::test]
    async fn test_register_overwrites_existing_prefix() {
        let original = CountingPlugin::new("env");
        let registry = registry_with(original.clone(), Duration::ZERO);
        let replacement = CountingPlugin::new("env");
        registry.register(replacement.clone());

        assert_eq!(registry.prefixes(), vec!["env".to_string()]);
        registry
            .load_secret(&CancellationToken::new(), "env:KEY")
            .await
            .unwrap();
        assert_eq!(original.calls(), 0);
        assert_eq!(replacement.calls(), 1);
    }

    #[tokio::test]
    async fn test_load_secret_is_cached() {
        let plugin = CountingPlugin::new("env");
        let registry = registry_with(plugin.clone(), Duration::from_secs(60));
        let cancel = CancellationToken::new();

        let first = registry.load_secret(&cancel, "env:KEY").await.unwrap();
        let second = registry.load_secret(&cancel, "env:KEY").await.unwrap();

        assert_eq!(first, "env-KEY");
        assert_eq!(first, second);
        assert_eq!(plugin.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_secret_reloads_after_ttl() {
        let plugin = CountingPlugin::new("env");
        let registry = registry_with(plugin.clone(), Duration::from_millis(50));
        let cancel = CancellationToken::new();

        registry.load_secret(&cancel, "env:KEY").await.unwrap();
        tokio::time::advance(Duration::from_millis(20)).await;
        registry.load_secret(&cancel, "env:KEY").await.unwrap();
        assert_eq!(plugin.calls(), 1);

        tokio::time::advance(Duration::from_millis(40)).await;
        registry.load_secret(&cancel, "env:KEY").await.unwrap();
        assert_eq!(plugin.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_never_expires() {
        let plugin = CountingPlugin::new("env");
        let registry = registry_with(plugin.clone(), Duration::ZERO);
        let cancel = CancellationToken::new();

        registry.load_secret(&cancel, "env:KEY").await.unwrap();
        tokio::time::advance(Duration::from_secs(86_400)).await;
        registry.load_secret(&cancel, "env:KEY").await.unwrap();

        assert_eq!(plugin.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_stored_without_ttl_survives_enabling_ttl() {
        let plugin = CountingPlugin::new("env");
        let registry = registry_with(plugin.clone(), Duration::ZERO);
        let cancel = CancellationToken::new();

        registry.load_secret(&cancel, "env:KEY").await.unwrap();
        registry.set_cache_ttl(Duration::from_millis(10));
        tokio::time::advance(Duration::from_secs(1)).await;
        registry.load_secret(&cancel, "env:KEY").await.unwrap();

        assert_eq!(plugin.calls(), 1);
    }

    #[tokio::test]
    async fn test_clear_cache_forces_reload() {
        let plugin = CountingPlugin::new("env");
        let registry = registry_with(plugin.clone(), Duration::ZERO);
        let cancel = CancellationToken::new();

        registry.load_secret(&cancel, "env:KEY").await.unwrap();
        assert_eq!(registry.cached_entries(), 1);

        registry.clear_cache();
        assert_eq!(registry.cached_entries(), 0);
        assert_eq!(registry.prefixes(), vec!["env".to_string()]);

        registry.load_secret(&cancel, "env:KEY").await.unwrap();
        assert_eq!(plugin.calls(), 2);
    }

    #[tokio::test]
    async fn test_load_secret_errors() {
        let registry = registry_with(Arc::new(FailingPlugin), Duration::ZERO);
        let cancel = CancellationToken::new();

        assert!(matches!(
            registry.load_secret(&cancel, "malformed").await,
            Err(SecretError::InvalidReference { .. })
        ));
        assert!(matches!(
            registry.load_secret(&cancel, "env:KEY").await,
            Err(SecretError::UnknownSource { .. })
        ));

        // Plugin failures come back unchanged and are not cached
        let err = registry.load_secret(&cancel, "broken:db").await.unwrap_err();
        assert_eq!(err.to_string(), "backend unavailable for db");
        assert_eq!(registry.cached_entries(), 0);
    }

    #[tokio::test]
    async fn test_load_secret_passes_cancellation_to_plugin() {
        let plugin = CountingPlugin::new("env");
        let registry = registry_with(plugin.clone(), Duration::ZERO);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = registry.load_secret(&cancel, "env:KEY").await.unwrap_err();
        assert!(matches!(err, SecretError::Plugin { .. }));
        assert_eq!(plugin.calls(), 0);
    }

    #[tokio::test]
    async fn test_load_random_secret_rejects_empty_list() {
        // No plugins registered: the registry must not be consulted
        let registry = SecretRegistry::default();
        let references: [&str; 0] = [];

        let err = registry
            .load_random_secret(&CancellationToken::new(), &references)
            .await
            .unwrap_err();
        assert!(matches!(err, SecretError::NoSecretsProvided));
    }

    #[tokio::test]
    async fn test_load_random_secret_single_reference() {
        let registry = registry_with(CountingPlugin::new("env"), Duration::ZERO);

        let value = registry
            .load_random_secret(&CancellationToken::new(), &["env:ONLY"])
            .await
            .unwrap();
        assert_eq!(value, "env-ONLY");
    }

    #[test]
    fn test_select_index_single_element_uses_no_randomness() {
        assert_eq!(select_index(&mut UntouchableRng, 1), 0);
    }

    #[tokio::test]
    async fn test_load_random_secret_selects_uniformly() {
        let registry = registry_with(CountingPlugin::new("key"), Duration::ZERO);
        let references = ["key:a", "key:b", "key:c"];
        let cancel = CancellationToken::new();
        let mut counts: HashMap<String, usize> = HashMap::new();

        for _ in 0..3000 {
            let value = registry.load_random_secret(&cancel, &references).await.unwrap();
            *counts.entry(value).or_default() += 1;
        }

        assert_eq!(counts.len(), 3);
        for (value, count) in counts {
            assert!(
                (800..=1200).contains(&count),
                "{value} selected {count} times out of 3000"
            );
        }
    }
}
