//! Engine context.
//!
//! Everything a task may reach outside itself (the output cache, queues,
//! providers and the event sink) travels in an explicit [`EngineContext`].
//! [`EngineContext::global`] exists for callers that do not want to thread
//! one through.

use crate::provider::ProviderRegistry;
use crate::task::TaskOutput;
use std::fmt;
use std::sync::{Arc, OnceLock};
use taskweave_core::events::{EventSink, LifecycleEvent, NullSink};
use taskweave_core::{EngineConfig, OutputCache};
use taskweave_queue::QueueRegistry;

pub struct EngineContext {
    cache: Option<OutputCache<TaskOutput>>,
    queues: Arc<QueueRegistry>,
    providers: Arc<ProviderRegistry>,
    events: Arc<dyn EventSink>,
    config: EngineConfig,
}

impl EngineContext {
    /// Creates a context from configuration with fresh registries.
    pub fn new(config: EngineConfig) -> Self {
        let cache = config
            .cache_enabled
            .then(|| OutputCache::from_config(&config.cache));
        Self {
            cache,
            queues: Arc::new(QueueRegistry::new()),
            providers: Arc::new(ProviderRegistry::new()),
            events: Arc::new(NullSink),
            config,
        }
    }

    /// Process-wide default context.
    pub fn global() -> Arc<EngineContext> {
        static GLOBAL: OnceLock<Arc<EngineContext>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(EngineContext::default()))
            .clone()
    }

    /// Shares an existing cache, e.g. between several contexts.
    pub fn with_cache(mut self, cache: OutputCache<TaskOutput>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.cache = None;
        self
    }

    pub fn with_queues(mut self, queues: Arc<QueueRegistry>) -> Self {
        self.queues = queues;
        self
    }

    pub fn with_providers(mut self, providers: Arc<ProviderRegistry>) -> Self {
        self.providers = providers;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn cache(&self) -> Option<&OutputCache<TaskOutput>> {
        self.cache.as_ref()
    }

    pub fn queues(&self) -> &Arc<QueueRegistry> {
        &self.queues
    }

    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn emit(&self, event: LifecycleEvent) {
        self.events.emit(event);
    }
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("cache_enabled", &self.cache.is_some())
            .field("queues", &self.queues.names())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_follows_config() {
        let ctx = EngineContext::default();
        assert!(ctx.cache().is_some());

        let config = EngineConfig {
            cache_enabled: false,
            ..EngineConfig::default()
        };
        assert!(EngineContext::new(config).cache().is_none());
    }

    #[test]
    fn test_global_is_shared() {
        let a = EngineContext::global();
        let b = EngineContext::global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
