//! Runtime context shared by every exchange
//!
//! Holds the type converter, event bus, clock and variable repositories that
//! exchanges and messages reach through their context reference.

use crate::clock::{Clock, SystemClock};
use crate::config::ContextConfig;
use crate::event::EventBus;
use crate::exchange::{
    Exchange, ExchangePattern, InMemoryVariableRepository, VariableRepository, GLOBAL_REPOSITORY,
    ROUTE_REPOSITORY,
};
use courier_message::Message;
use courier_schema::{ConverterRegistry, TypeConverter};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;

/// Shared runtime context
pub struct Context {
    name: String,
    converter: Arc<ConverterRegistry>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    repositories: DashMap<String, Arc<dyn VariableRepository>>,
    data_type_tracking: bool,
}

impl Context {
    /// Create a context with defaults
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::builder().name(name).build()
    }

    /// Create a context from configuration
    pub fn from_config(config: &ContextConfig) -> Arc<Self> {
        Self::builder()
            .name(config.name.clone())
            .data_type_tracking(config.data_type_tracking)
            .build()
    }

    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Converter registry, for registering custom converters
    pub fn converter_registry(&self) -> &Arc<ConverterRegistry> {
        &self.converter
    }

    /// Converter used for typed access
    pub fn type_converter(&self) -> Arc<dyn TypeConverter> {
        self.converter.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    pub fn is_data_type_tracking(&self) -> bool {
        self.data_type_tracking
    }

    /// Look up a variable repository by id
    pub fn variable_repository(&self, id: &str) -> Option<Arc<dyn VariableRepository>> {
        self.repositories.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Register a variable repository, replacing one with the same id
    pub fn add_variable_repository(&self, repository: Arc<dyn VariableRepository>) {
        self.repositories
            .insert(repository.id().to_string(), repository);
    }

    /// Create a message wired to this context's converter
    pub fn create_message(&self) -> Message {
        let mut message = Message::new();
        message.set_converter(self.type_converter());
        message.set_data_type_tracking(self.data_type_tracking);
        message
    }

    /// Create an exchange bound to this context
    pub fn create_exchange(self: &Arc<Self>, pattern: ExchangePattern) -> Exchange {
        Exchange::new(self, pattern)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.name)
            .field("converters", &self.converter.len())
            .field("data_type_tracking", &self.data_type_tracking)
            .finish()
    }
}

/// Builder for [`Context`]
#[derive(Default)]
pub struct ContextBuilder {
    name: Option<String>,
    clock: Option<Arc<dyn Clock>>,
    converter: Option<Arc<ConverterRegistry>>,
    data_type_tracking: bool,
}

impl ContextBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn converter(mut self, converter: Arc<ConverterRegistry>) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn data_type_tracking(mut self, enabled: bool) -> Self {
        self.data_type_tracking = enabled;
        self
    }

    pub fn build(self) -> Arc<Context> {
        let repositories: DashMap<String, Arc<dyn VariableRepository>> = DashMap::new();
        for id in [GLOBAL_REPOSITORY, ROUTE_REPOSITORY] {
            repositories.insert(id.to_string(), Arc::new(InMemoryVariableRepository::new(id)));
        }

        Arc::new(Context {
            name: self.name.unwrap_or_else(|| "courier".to_string()),
            converter: self.converter.unwrap_or_default(),
            events: EventBus::new(),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            repositories,
            data_type_tracking: self.data_type_tracking,
        })
    }
}
