//! Endpoints and processors
//!
//! Protocol adapters implement [`Endpoint`] to create exchanges and
//! [`Processor`] to handle them. URI resolution happens elsewhere; an
//! endpoint here is just a named exchange factory.

use crate::cache::{LruCacheFactory, SynchronizedLruCache};
use crate::context::Context;
use crate::error::ExchangeResult;
use crate::event::CourierEvent;
use crate::exchange::{Exchange, ExchangePattern};
use crate::service::{MaybeStoppable, ServiceResult, ServiceState, ServiceStatus, Stoppable};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Source or target of exchanges
pub trait Endpoint: MaybeStoppable + Send + Sync {
    fn endpoint_uri(&self) -> &str;

    fn context(&self) -> &Arc<Context>;

    /// Pattern of exchanges created by this endpoint
    fn exchange_pattern(&self) -> ExchangePattern {
        ExchangePattern::InOnly
    }

    /// Create an exchange originating from this endpoint
    fn create_exchange(&self) -> Exchange {
        let mut exchange = Exchange::new(self.context(), self.exchange_pattern());
        exchange.set_from_endpoint(self.endpoint_uri());
        self.context().events().notify(&CourierEvent::ExchangeCreated {
            exchange_id: exchange.id().to_string(),
        });
        exchange
    }
}

/// Handles an exchange
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, exchange: &mut Exchange) -> ExchangeResult<()>;
}

#[async_trait]
impl<F> Processor for F
where
    F: Fn(&mut Exchange) -> ExchangeResult<()> + Send + Sync,
{
    async fn process(&self, exchange: &mut Exchange) -> ExchangeResult<()> {
        self(exchange)
    }
}

/// Plain endpoint with a fixed uri and pattern
pub struct DefaultEndpoint {
    uri: String,
    context: Arc<Context>,
    pattern: ExchangePattern,
    state: ServiceState,
}

impl DefaultEndpoint {
    pub fn new(context: &Arc<Context>, uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            context: Arc::clone(context),
            pattern: ExchangePattern::InOnly,
            state: ServiceState::new(),
        }
    }

    pub fn with_pattern(mut self, pattern: ExchangePattern) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn status(&self) -> ServiceStatus {
        self.state.status()
    }
}

impl Endpoint for DefaultEndpoint {
    fn endpoint_uri(&self) -> &str {
        &self.uri
    }

    fn context(&self) -> &Arc<Context> {
        &self.context
    }

    fn exchange_pattern(&self) -> ExchangePattern {
        self.pattern
    }
}

impl Stoppable for DefaultEndpoint {
    fn stop(&self) -> ServiceResult<()> {
        if !self.state.is_stopped() {
            self.state.set(ServiceStatus::Stopped);
            debug!(endpoint_uri = %self.uri, "Endpoint stopped");
        }
        Ok(())
    }
}

impl MaybeStoppable for DefaultEndpoint {
    fn as_stoppable(&self) -> Option<&dyn Stoppable> {
        Some(self)
    }
}

impl fmt::Debug for DefaultEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultEndpoint")
            .field("uri", &self.uri)
            .field("pattern", &self.pattern)
            .field("status", &self.state.status())
            .finish()
    }
}

/// Endpoints by uri; endpoints evicted to stay within bounds are stopped
pub type EndpointCache = SynchronizedLruCache<String, Arc<dyn Endpoint>>;

/// Create an endpoint cache holding at most `max_size` endpoints
pub fn endpoint_cache(max_size: usize) -> EndpointCache {
    LruCacheFactory::new_synchronized_stopping(max_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExchangeError;
    use crate::event::CollectingNotifier;
    use courier_schema::Value;

    #[test]
    fn test_create_exchange_sets_from_endpoint() {
        let context = Context::new("test");
        let notifier = Arc::new(CollectingNotifier::new());
        context.events().add_notifier(notifier.clone());
        let endpoint = DefaultEndpoint::new(&context, "timer:tick").with_pattern(ExchangePattern::InOut);

        let exchange = endpoint.create_exchange();
        assert_eq!(exchange.from_endpoint(), Some("timer:tick"));
        assert_eq!(exchange.pattern(), ExchangePattern::InOut);
        assert_eq!(
            notifier.events(),
            vec![CourierEvent::ExchangeCreated {
                exchange_id: exchange.id().to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_closure_processor() {
        let context = Context::new("test");
        let processor = |exchange: &mut Exchange| -> ExchangeResult<()> {
            exchange.in_message_mut().set_body("processed");
            Ok(())
        };

        let mut exchange = context.create_exchange(ExchangePattern::InOnly);
        processor.process(&mut exchange).await.unwrap();
        assert_eq!(exchange.in_message().body(), &Value::from("processed"));

        let failing = |_: &mut Exchange| -> ExchangeResult<()> { Err(ExchangeError::processing("nope")) };
        assert!(failing.process(&mut exchange).await.is_err());
    }

    #[test]
    fn test_endpoint_cache_stops_evicted() {
        let context = Context::new("test");
        let cache = endpoint_cache(1);
        let first = Arc::new(DefaultEndpoint::new(&context, "a"));
        let second = Arc::new(DefaultEndpoint::new(&context, "b"));

        cache.put("a".to_string(), first.clone());
        cache.put("b".to_string(), second.clone());

        assert_eq!(first.status(), ServiceStatus::Stopped);
        assert_ne!(second.status(), ServiceStatus::Stopped);
        assert!(cache.get("b").is_some());
        assert!(cache.get("a").is_none());
    }
}
