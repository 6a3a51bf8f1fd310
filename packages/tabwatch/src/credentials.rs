//! Bearer tokens for subject endpoints.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::TtlCache;
use crate::clock::Clock;

#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    /// A usable token, or `None` if none can be produced right now.
    async fn ensure_token(&self) -> Option<String>;
}

/// Always the same answer. An empty token means "send no Authorization
/// header".
#[derive(Debug, Clone)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn anonymous() -> Self {
        Self(Some(String::new()))
    }

    pub fn unavailable() -> Self {
        Self(None)
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn ensure_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Reads a token from an environment variable on every call.
#[derive(Debug, Clone)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl TokenProvider for EnvToken {
    async fn ensure_token(&self) -> Option<String> {
        std::env::var(&self.var).ok().filter(|t| !t.is_empty())
    }
}

/// Remembers the inner provider's last token for a while.
pub struct CachedTokenProvider<T> {
    inner: T,
    cache: TtlCache<(), String>,
}

impl<T: TokenProvider> CachedTokenProvider<T> {
    pub fn new(inner: T, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            cache: TtlCache::new(ttl, clock),
        }
    }

    /// Drop the cached token, e.g. after the server rejected it.
    pub fn invalidate(&self) {
        self.cache.invalidate(&());
    }
}

#[async_trait]
impl<T: TokenProvider> TokenProvider for CachedTokenProvider<T> {
    async fn ensure_token(&self) -> Option<String> {
        if let Some(token) = self.cache.get(&()) {
            return Some(token);
        }
        let token = self.inner.ensure_token().await?;
        debug!(ttl_secs = self.cache.ttl().as_secs(), "caching fresh bearer token");
        self.cache.insert((), token.clone());
        Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TokenProvider for Counting {
        async fn ensure_token(&self) -> Option<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Some(format!("token-{n}"))
        }
    }

    #[tokio::test]
    async fn cached_provider_reuses_token_until_ttl() {
        let calls = Arc::new(AtomicUsize::new(0));
        let clock = ManualClock::new(0);
        let provider = CachedTokenProvider::new(
            Counting {
                calls: calls.clone(),
            },
            Duration::from_secs(60),
            Arc::new(clock.clone()),
        );

        assert_eq!(provider.ensure_token().await.as_deref(), Some("token-0"));
        assert_eq!(provider.ensure_token().await.as_deref(), Some("token-0"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(60));
        assert_eq!(provider.ensure_token().await.as_deref(), Some("token-1"));

        provider.invalidate();
        assert_eq!(provider.ensure_token().await.as_deref(), Some("token-2"));
    }

    #[tokio::test]
    async fn missing_tokens_are_not_cached() {
        let provider = CachedTokenProvider::new(
            StaticToken::unavailable(),
            Duration::from_secs(60),
            Arc::new(ManualClock::new(0)),
        );
        assert_eq!(provider.ensure_token().await, None);
    }

    #[tokio::test]
    async fn env_token_ignores_empty_values() {
        let provider = EnvToken::new("TABWATCH_TEST_TOKEN_THAT_IS_NEVER_SET");
        assert_eq!(provider.ensure_token().await, None);
    }
}
