//! Courier Core
//!
//! Exchange model, caches, timeout maps, scheduling and event notification
//! that protocol adapters build on.

pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod exchange;
pub mod exchange_helper;
pub mod executor;
pub mod service;
pub mod timeout_map;

/// Re-export common types
pub use cache::{
    CacheStats, EvictionError, EvictionListener, LruCache, LruCacheFactory, NoopEviction,
    StopOnEviction, SynchronizedLruCache,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CacheConfig, ConfigError, ConfigResult, ContextConfig, CourierConfig, RunLoggingLevel,
    ScheduledPollConfig, TimeoutMapConfig,
};
pub use context::{Context, ContextBuilder};
pub use endpoint::{endpoint_cache, DefaultEndpoint, Endpoint, EndpointCache, Processor};
pub use error::{
    ExchangeError, ExchangeResult, ExecutionError, LookupError, LookupResult,
};
pub use event::{
    CollectingNotifier, CourierEvent, EventBus, EventBusMetricsSnapshot, EventNotifier,
    NotifierError,
};
pub use exchange::{
    DefaultUnitOfWork, Exchange, ExchangePattern, ExchangePropertyKey, InMemoryVariableRepository,
    Properties, Synchronization, UnitOfWork, VariableRepository, GLOBAL_REPOSITORY,
    ROUTE_REPOSITORY,
};
pub use executor::{
    ExecutorError, ExecutorResult, Schedule, ScheduledExecutor, ScheduledTask, TaskHandle,
};
pub use service::{
    MaybeStoppable, ServiceError, ServiceResult, ServiceState, ServiceStatus, Stoppable,
};
pub use timeout_map::{
    TimeoutMap, TimeoutMapError, TimeoutMapEvent, TimeoutMapListener, TimeoutMapResult,
    DEFAULT_PURGE_POLL_TIME,
};

pub use courier_message::{self, Headers, Message};
pub use courier_schema::{self, Value, ValueKind};
