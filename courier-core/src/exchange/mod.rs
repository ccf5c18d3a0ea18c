//! Exchange model
//!
//! An exchange is the unit of work flowing through a route: an in message, an
//! optional out message, properties, variables and a failure slot. Copies get
//! their own messages, properties and variables, while the context, the unit of
//! work and any recorded failure stay shared.

mod properties;
mod unit_of_work;
mod variables;

pub use properties::{ExchangePropertyKey, Properties};
pub use unit_of_work::{DefaultUnitOfWork, Synchronization, UnitOfWork};
pub use variables::{
    parse_variable_name, InMemoryVariableRepository, VariableAddress, VariableRepository,
    GLOBAL_REPOSITORY, ROUTE_REPOSITORY,
};

use crate::context::Context;
use crate::error::{ExchangeError, LookupError, LookupResult};
use crate::event::CourierEvent;
use ahash::AHashMap;
use courier_message::{generate_id, Message};
use courier_schema::{FromValue, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Message exchange pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExchangePattern {
    #[default]
    InOnly,
    InOut,
    InOptionalOut,
}

impl ExchangePattern {
    /// Whether the pattern allows an out message
    pub fn is_out_capable(&self) -> bool {
        matches!(self, ExchangePattern::InOut | ExchangePattern::InOptionalOut)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangePattern::InOnly => "InOnly",
            ExchangePattern::InOut => "InOut",
            ExchangePattern::InOptionalOut => "InOptionalOut",
        }
    }
}

impl fmt::Display for ExchangePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangePattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "InOnly" => Ok(ExchangePattern::InOnly),
            "InOut" => Ok(ExchangePattern::InOut),
            "InOptionalOut" => Ok(ExchangePattern::InOptionalOut),
            other => Err(format!("Unknown exchange pattern: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ExchangeFlags {
    route_stop: bool,
    rollback_only: bool,
    rollback_only_last: bool,
    redelivery_exhausted: bool,
    error_handler_handled: Option<bool>,
    failure_handled: bool,
    interrupted: bool,
}

/// Resolved storage location of a variable
pub(crate) enum VariableTarget {
    Local(String),
    Repository(Arc<dyn VariableRepository>, String),
}

/// A message exchange
pub struct Exchange {
    context: Arc<Context>,
    id: OnceLock<String>,
    pattern: ExchangePattern,
    created: u64,
    from_endpoint: Option<String>,
    from_route_id: Option<String>,
    in_message: Message,
    out_message: Option<Message>,
    properties: Properties,
    variables: Option<AHashMap<String, Value>>,
    exception: Option<Arc<ExchangeError>>,
    flags: ExchangeFlags,
    unit_of_work: Option<Arc<dyn UnitOfWork>>,
    on_completions: Vec<Arc<dyn Synchronization>>,
    done: bool,
}

impl Exchange {
    /// Create an exchange bound to the context
    pub fn new(context: &Arc<Context>, pattern: ExchangePattern) -> Self {
        Self {
            context: Arc::clone(context),
            id: OnceLock::new(),
            pattern,
            created: context.now_millis(),
            from_endpoint: None,
            from_route_id: None,
            in_message: context.create_message(),
            out_message: None,
            properties: Properties::new(),
            variables: None,
            exception: None,
            flags: ExchangeFlags::default(),
            unit_of_work: None,
            on_completions: Vec::new(),
            done: false,
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Exchange id, generated on first access
    pub fn id(&self) -> &str {
        self.id.get_or_init(generate_id)
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = OnceLock::from(id.into());
    }

    pub fn pattern(&self) -> ExchangePattern {
        self.pattern
    }

    pub fn set_pattern(&mut self, pattern: ExchangePattern) {
        self.pattern = pattern;
    }

    /// Creation time in epoch milliseconds
    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn from_endpoint(&self) -> Option<&str> {
        self.from_endpoint.as_deref()
    }

    pub fn set_from_endpoint(&mut self, uri: impl Into<String>) {
        self.from_endpoint = Some(uri.into());
    }

    pub fn from_route_id(&self) -> Option<&str> {
        self.from_route_id.as_deref()
    }

    pub fn set_from_route_id(&mut self, route_id: impl Into<String>) {
        self.from_route_id = Some(route_id.into());
    }

    // -- messages --

    pub fn in_message(&self) -> &Message {
        &self.in_message
    }

    pub fn in_message_mut(&mut self) -> &mut Message {
        &mut self.in_message
    }

    pub fn set_in(&mut self, message: Message) {
        self.in_message = message;
    }

    pub fn has_out(&self) -> bool {
        self.out_message.is_some()
    }

    pub fn out(&self) -> Option<&Message> {
        self.out_message.as_ref()
    }

    /// Out message, created on first access
    pub fn out_mut(&mut self) -> &mut Message {
        let context = &self.context;
        self.out_message.get_or_insert_with(|| context.create_message())
    }

    pub fn set_out(&mut self, message: Message) {
        self.out_message = Some(message);
    }

    /// Remove the out message
    pub fn take_out(&mut self) -> Option<Message> {
        self.out_message.take()
    }

    /// The out message if present, else the in message
    pub fn message(&self) -> &Message {
        self.out_message.as_ref().unwrap_or(&self.in_message)
    }

    pub fn message_mut(&mut self) -> &mut Message {
        match &mut self.out_message {
            Some(out) => out,
            None => &mut self.in_message,
        }
    }

    // -- properties --

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    pub fn has_properties(&self) -> bool {
        !self.properties.is_empty()
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn property_key(&self, key: ExchangePropertyKey) -> Option<&Value> {
        self.properties.get_key(key)
    }

    /// Property, or the default when absent
    pub fn property_or(&self, name: &str, default: impl Into<Value>) -> Value {
        self.properties
            .get(name)
            .cloned()
            .unwrap_or_else(|| default.into())
    }

    /// Property converted to `T` through the context converter
    pub fn property_as<T: FromValue>(&self, name: &str) -> Option<T> {
        self.properties.get(name).and_then(|v| self.convert(v))
    }

    pub fn property_key_as<T: FromValue>(&self, key: ExchangePropertyKey) -> Option<T> {
        self.properties.get_key(key).and_then(|v| self.convert(v))
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.properties.set(name, value);
    }

    pub fn set_property_key(&mut self, key: ExchangePropertyKey, value: impl Into<Value>) {
        self.properties.set_key(key, value);
    }

    pub fn remove_property(&mut self, name: &str) -> Option<Value> {
        self.properties.remove(name)
    }

    pub fn remove_property_key(&mut self, key: ExchangePropertyKey) -> Option<Value> {
        self.properties.remove_key(key)
    }

    fn convert<T: FromValue>(&self, value: &Value) -> Option<T> {
        if value.is_null() {
            return None;
        }
        courier_schema::convert::<T>(self.context.converter_registry().as_ref(), value)
    }

    // -- variables --

    /// Resolve where a variable name points
    ///
    /// Route variables without an explicit route are scoped to the exchange's
    /// route when it has one.
    pub(crate) fn resolve_variable(&self, name: &str) -> LookupResult<VariableTarget> {
        match parse_variable_name(name) {
            VariableAddress::Local(local) => Ok(VariableTarget::Local(local.to_string())),
            VariableAddress::Repository { id, name } => {
                let repository = self
                    .context
                    .variable_repository(id)
                    .ok_or_else(|| LookupError::UnknownVariableRepository(id.to_string()))?;
                let key = match self.from_route_id.as_deref() {
                    Some(route_id) if id == ROUTE_REPOSITORY && !name.contains(':') => {
                        format!("{}:{}", route_id, name)
                    }
                    _ => name.to_string(),
                };
                Ok(VariableTarget::Repository(repository, key))
            }
        }
    }

    /// Get a variable, resolving `repo-id:name` addresses
    pub fn variable(&self, name: &str) -> LookupResult<Option<Value>> {
        Ok(match self.resolve_variable(name)? {
            VariableTarget::Local(key) => self.local_variable(&key).cloned(),
            VariableTarget::Repository(repository, key) => repository.get_variable(&key),
        })
    }

    /// Variable converted to `T`
    pub fn variable_as<T: FromValue>(&self, name: &str) -> LookupResult<Option<T>> {
        Ok(self.variable(name)?.and_then(|v| self.convert(&v)))
    }

    /// Set a variable, resolving `repo-id:name` addresses
    pub fn set_variable(&mut self, name: &str, value: impl Into<Value>) -> LookupResult<()> {
        match self.resolve_variable(name)? {
            VariableTarget::Local(key) => self.set_local_variable(key, value),
            VariableTarget::Repository(repository, key) => {
                repository.set_variable(&key, value.into())
            }
        }
        Ok(())
    }

    /// Remove a variable, resolving `repo-id:name` addresses
    pub fn remove_variable(&mut self, name: &str) -> LookupResult<Option<Value>> {
        Ok(match self.resolve_variable(name)? {
            VariableTarget::Local(key) => self.variables.as_mut().and_then(|vars| vars.remove(&key)),
            VariableTarget::Repository(repository, key) => repository.remove_variable(&key),
        })
    }

    /// Get a variable stored on this exchange, without address parsing
    pub fn local_variable(&self, name: &str) -> Option<&Value> {
        self.variables.as_ref().and_then(|vars| vars.get(name))
    }

    /// Set a variable on this exchange, without address parsing
    pub fn set_local_variable(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.variables
            .get_or_insert_with(AHashMap::new)
            .insert(name.into(), value.into());
    }

    /// Whether the exchange holds local variables
    pub fn has_variables(&self) -> bool {
        self.variables.as_ref().is_some_and(|vars| !vars.is_empty())
    }

    /// Local variables of this exchange
    pub fn variables(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.variables
            .iter()
            .flat_map(|vars| vars.iter().map(|(k, v)| (k.as_str(), v)))
    }

    // -- failure --

    pub fn exception(&self) -> Option<&ExchangeError> {
        self.exception.as_deref()
    }

    /// Shared handle to the recorded failure
    pub fn exception_arc(&self) -> Option<&Arc<ExchangeError>> {
        self.exception.as_ref()
    }

    /// Record a failure
    ///
    /// An interruption also sets the interrupted flag.
    pub fn set_exception(&mut self, error: impl Into<ExchangeError>) {
        let error = error.into();
        if error.is_interrupted() {
            self.flags.interrupted = true;
        }
        self.exception = Some(Arc::new(error));
    }

    /// Record any error type, wrapping it
    pub fn set_failure<E>(&mut self, error: E)
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.set_exception(ExchangeError::wrap(error));
    }

    /// Share a failure recorded on another exchange
    pub fn set_exception_arc(&mut self, error: Option<Arc<ExchangeError>>) {
        if error.as_deref().is_some_and(ExchangeError::is_interrupted) {
            self.flags.interrupted = true;
        }
        self.exception = error;
    }

    pub fn clear_exception(&mut self) -> Option<Arc<ExchangeError>> {
        self.exception.take()
    }

    pub fn is_failed(&self) -> bool {
        self.exception.is_some()
    }

    // -- flags --

    pub fn is_route_stop(&self) -> bool {
        self.flags.route_stop
    }

    pub fn set_route_stop(&mut self, stop: bool) {
        self.flags.route_stop = stop;
    }

    pub fn is_rollback_only(&self) -> bool {
        self.flags.rollback_only
    }

    pub fn set_rollback_only(&mut self, rollback: bool) {
        self.flags.rollback_only = rollback;
    }

    pub fn is_rollback_only_last(&self) -> bool {
        self.flags.rollback_only_last
    }

    pub fn set_rollback_only_last(&mut self, rollback: bool) {
        self.flags.rollback_only_last = rollback;
    }

    pub fn is_redelivery_exhausted(&self) -> bool {
        self.flags.redelivery_exhausted
    }

    pub fn set_redelivery_exhausted(&mut self, exhausted: bool) {
        self.flags.redelivery_exhausted = exhausted;
    }

    /// Whether an error handler handled the failure, `None` if none saw it
    pub fn error_handler_handled(&self) -> Option<bool> {
        self.flags.error_handler_handled
    }

    pub fn set_error_handler_handled(&mut self, handled: Option<bool>) {
        self.flags.error_handler_handled = handled;
    }

    pub fn is_failure_handled(&self) -> bool {
        self.flags.failure_handled
    }

    pub fn set_failure_handled(&mut self, handled: bool) {
        self.flags.failure_handled = handled;
    }

    pub fn is_interrupted(&self) -> bool {
        self.flags.interrupted
    }

    pub fn set_interrupted(&mut self, interrupted: bool) {
        self.flags.interrupted = interrupted;
    }

    /// Copy routing flags from another exchange
    pub(crate) fn copy_flags_from(&mut self, other: &Exchange) {
        self.flags.route_stop = other.flags.route_stop;
        self.flags.rollback_only = other.flags.rollback_only;
        self.flags.rollback_only_last = other.flags.rollback_only_last;
        self.flags.redelivery_exhausted = other.flags.redelivery_exhausted;
        self.flags.error_handler_handled = other.flags.error_handler_handled;
        self.flags.failure_handled = other.flags.failure_handled;
    }

    // -- unit of work --

    pub fn unit_of_work(&self) -> Option<&Arc<dyn UnitOfWork>> {
        self.unit_of_work.as_ref()
    }

    pub fn set_unit_of_work(&mut self, unit_of_work: Option<Arc<dyn UnitOfWork>>) {
        self.unit_of_work = unit_of_work;
    }

    /// Register a callback run once when the exchange is done
    pub fn add_on_completion(&mut self, synchronization: Arc<dyn Synchronization>) {
        self.on_completions.push(synchronization);
    }

    pub fn on_completion_count(&self) -> usize {
        self.on_completions.len()
    }

    /// Move callbacks that allow hand-over to `target`
    pub fn handover_completions(&mut self, target: &mut Exchange) {
        let (moved, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.on_completions)
            .into_iter()
            .partition(|sync| sync.allow_handover());
        self.on_completions = kept;
        target.on_completions.extend(moved);
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Finish the exchange
    ///
    /// Runs the on-completion callbacks, notifies the unit of work and emits a
    /// completed or failed event. Only the first call has any effect.
    pub fn done(&mut self) -> bool {
        if self.done {
            return false;
        }
        self.done = true;

        let failed = self.is_failed();
        let callbacks = std::mem::take(&mut self.on_completions);
        for sync in &callbacks {
            if failed {
                sync.on_failure(self);
            } else {
                sync.on_complete(self);
            }
        }
        if let Some(uow) = &self.unit_of_work {
            uow.done(self);
        }

        let exchange_id = self.id().to_string();
        let event = match &self.exception {
            Some(error) => CourierEvent::ExchangeFailed {
                exchange_id,
                error: error.to_string(),
            },
            None => CourierEvent::ExchangeCompleted {
                exchange_id,
                elapsed_ms: self.context.now_millis().saturating_sub(self.created),
            },
        };
        debug!(exchange_id = %self.id(), failed, callbacks = callbacks.len(), "Exchange done");
        self.context.events().notify(&event);
        true
    }

    /// Copy this exchange
    ///
    /// The copy has a new id, copied messages, a safe copy of the properties and
    /// its own variables. It shares the context, the unit of work and any
    /// recorded failure. On-completion callbacks stay with this exchange.
    pub fn copy(&self) -> Exchange {
        Exchange {
            context: Arc::clone(&self.context),
            id: OnceLock::new(),
            pattern: self.pattern,
            created: self.created,
            from_endpoint: self.from_endpoint.clone(),
            from_route_id: self.from_route_id.clone(),
            in_message: self.in_message.copy(),
            out_message: self.out_message.as_ref().map(Message::copy),
            properties: self.properties.safe_copy(),
            variables: self.variables.clone(),
            exception: self.exception.clone(),
            flags: self.flags.clone(),
            unit_of_work: self.unit_of_work.clone(),
            on_completions: Vec::new(),
            done: false,
        }
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.id.get())
            .field("pattern", &self.pattern)
            .field("from_endpoint", &self.from_endpoint)
            .field("has_out", &self.has_out())
            .field("failed", &self.is_failed())
            .finish()
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.from_route_id {
            Some(route) => write!(f, "Exchange[{}][{}]", route, self.id()),
            None => write!(f, "Exchange[{}]", self.id()),
        }
    }
}
