//! Topic/handler registry.
//!
//! Built once from the handler bindings before the adapter starts and never
//! mutated afterwards, so the dispatch loop reads it without locking.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::config::AdapterConfig;
use crate::error::{AdapterError, Result};
use crate::handler::Handler;
use crate::retry::RetryPolicy;

/// Binds one topic to a handler, with optional per-topic overrides.
#[derive(Clone)]
pub struct HandlerBinding {
    topic: String,
    handler: Arc<dyn Handler>,
    max_retries: Option<u32>,
    dlq_topic: Option<String>,
    dlq_enabled: Option<bool>,
}

impl HandlerBinding {
    pub fn new(topic: impl Into<String>, handler: impl Handler + 'static) -> Self {
        Self::from_arc(topic, Arc::new(handler))
    }

    pub fn from_arc(topic: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self {
            topic: topic.into(),
            handler,
            max_retries: None,
            dlq_topic: None,
            dlq_enabled: None,
        }
    }

    /// Override the adapter-wide retry ceiling for this topic.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Use an explicit dead-letter topic instead of `topic + dlq_suffix`.
    pub fn dlq_topic(mut self, dlq_topic: impl Into<String>) -> Self {
        self.dlq_topic = Some(dlq_topic.into());
        self
    }

    /// Enable or disable dead-lettering for this topic only.
    pub fn dlq_enabled(mut self, enabled: bool) -> Self {
        self.dlq_enabled = Some(enabled);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl fmt::Debug for HandlerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerBinding")
            .field("topic", &self.topic)
            .field("max_retries", &self.max_retries)
            .field("dlq_topic", &self.dlq_topic)
            .field("dlq_enabled", &self.dlq_enabled)
            .finish_non_exhaustive()
    }
}

/// Resolved dispatch target for one topic.
#[derive(Clone)]
pub struct Route {
    handler: Arc<dyn Handler>,
    policy: RetryPolicy,
    /// `None` when dead-lettering is disabled for the topic
    dead_letter_topic: Option<String>,
}

impl Route {
    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn dead_letter_topic(&self) -> Option<&str> {
        self.dead_letter_topic.as_deref()
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("policy", &self.policy)
            .field("dead_letter_topic", &self.dead_letter_topic)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    /// Sorted and deduplicated
    topics: Vec<String>,
    routes: HashMap<String, Route>,
}

impl Registry {
    /// Resolve bindings against the adapter defaults.
    ///
    /// Binding the same topic twice is rejected so that the result does not
    /// depend on registration order.
    pub fn build<I>(bindings: I, config: &AdapterConfig) -> Result<Self>
    where
        I: IntoIterator<Item = HandlerBinding>,
    {
        let mut topics = BTreeSet::new();
        let mut routes = HashMap::new();

        for binding in bindings {
            if binding.topic.trim().is_empty() {
                return Err(AdapterError::InvalidConfig(
                    "handler binding has an empty topic".to_string(),
                ));
            }
            if !topics.insert(binding.topic.clone()) {
                return Err(AdapterError::DuplicateBinding(binding.topic));
            }

            let policy = RetryPolicy::new(
                binding.max_retries.unwrap_or(config.max_retries),
                config.retry_backoff_unit,
            );
            let dead_letter_topic = if binding.dlq_enabled.unwrap_or(config.dlq_enabled) {
                Some(
                    binding
                        .dlq_topic
                        .clone()
                        .unwrap_or_else(|| config.dlq_topic_for(&binding.topic)),
                )
            } else {
                None
            };
            if dead_letter_topic.as_deref() == Some(binding.topic.as_str()) {
                return Err(AdapterError::InvalidConfig(format!(
                    "dead-letter topic for '{}' must differ from the topic itself",
                    binding.topic
                )));
            }

            routes.insert(
                binding.topic,
                Route {
                    handler: binding.handler,
                    policy,
                    dead_letter_topic,
                },
            );
        }

        Ok(Self {
            topics: topics.into_iter().collect(),
            routes,
        })
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn route(&self, topic: &str) -> Option<&Route> {
        self.routes.get(topic)
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use broker_driver::Message;
    use std::time::Duration;

    fn noop(topic: &str) -> HandlerBinding {
        HandlerBinding::new(topic, handler_fn(|_: Message| async { Ok(()) }))
    }

    #[test]
    fn test_topics_are_order_independent() {
        let config = AdapterConfig::new("group");
        let a = Registry::build(vec![noop("b"), noop("a"), noop("c")], &config).unwrap();
        let b = Registry::build(vec![noop("c"), noop("b"), noop("a")], &config).unwrap();

        assert_eq!(a.topics(), b.topics());
        assert_eq!(a.topics(), &["a", "b", "c"]);
    }

    #[test]
    fn test_duplicate_topic_is_rejected() {
        let config = AdapterConfig::new("group");
        let err = Registry::build(vec![noop("orders"), noop("orders")], &config).unwrap_err();
        assert!(matches!(err, AdapterError::DuplicateBinding(topic) if topic == "orders"));
    }

    #[test]
    fn test_empty_topic_is_rejected() {
        let config = AdapterConfig::new("group");
        assert!(Registry::build(vec![noop(" ")], &config).is_err());
    }

    #[test]
    fn test_dead_letter_topic_must_differ() {
        let config = AdapterConfig::new("group");
        let result = Registry::build(vec![noop("orders").dlq_topic("orders")], &config);
        assert!(matches!(result, Err(AdapterError::InvalidConfig(_))));
    }

    #[test]
    fn test_empty_registry_is_not_an_error() {
        let registry = Registry::build(Vec::new(), &AdapterConfig::new("group")).unwrap();
        assert!(registry.is_empty());
        assert!(registry.route("orders").is_none());
    }

    #[test]
    fn test_routes_use_adapter_defaults() {
        let mut config = AdapterConfig::new("group");
        config.max_retries = 4;
        config.retry_backoff_unit = Duration::from_millis(50);

        let registry = Registry::build(vec![noop("orders")], &config).unwrap();
        let route = registry.route("orders").unwrap();

        assert_eq!(route.policy().max_retries(), 4);
        assert_eq!(route.policy().backoff_unit(), Duration::from_millis(50));
        assert_eq!(route.dead_letter_topic(), Some("orders.dlq"));
    }

    #[test]
    fn test_binding_overrides() {
        let config = AdapterConfig::new("group");
        let registry = Registry::build(
            vec![
                noop("orders").max_retries(0).dlq_topic("orders-failed"),
                noop("audit").dlq_enabled(false),
            ],
            &config,
        )
        .unwrap();

        let orders = registry.route("orders").unwrap();
        assert_eq!(orders.policy().max_retries(), 0);
        assert_eq!(orders.dead_letter_topic(), Some("orders-failed"));

        let audit = registry.route("audit").unwrap();
        assert_eq!(audit.policy().max_retries(), 3);
        assert_eq!(audit.dead_letter_topic(), None);
    }

    #[test]
    fn test_binding_can_enable_dlq_when_disabled_globally() {
        let mut config = AdapterConfig::new("group");
        config.dlq_enabled = false;

        let registry =
            Registry::build(vec![noop("orders").dlq_enabled(true), noop("audit")], &config)
                .unwrap();

        assert_eq!(
            registry.route("orders").unwrap().dead_letter_topic(),
            Some("orders.dlq")
        );
        assert_eq!(registry.route("audit").unwrap().dead_letter_topic(), None);
    }
}
