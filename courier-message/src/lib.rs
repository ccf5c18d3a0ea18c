//! Courier Message Model
//!
//! A message is a body value plus a case-insensitive header map. Bodies may be
//! created lazily from a [`BodySource`]; typed access goes through the injected
//! [`TypeConverter`] first and the standard coercion rules second.

mod headers;
pub mod helper;

pub use headers::Headers;

use courier_schema::{
    ConversionError, DataType, FromValue, StandardTypeConverter, TypeConverter, Value, ValueKind,
};
use std::fmt;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

static STANDARD_CONVERTER: StandardTypeConverter = StandardTypeConverter;

/// Message access errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MessageError {
    #[error("No '{name}' header available")]
    NoSuchHeader { name: String },

    #[error("No body available of kind: {expected}")]
    InvalidPayload { expected: ValueKind },

    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

/// Result type for message operations
pub type MessageResult<T> = Result<T, MessageError>;

/// Populate hook used to create a body on first access
///
/// Transports that receive payloads lazily (e.g. streamed reads) implement this
/// so the body is only materialized if something asks for it.
pub trait BodySource: Send + Sync {
    fn create_body(&self) -> Value;
}

impl<F> BodySource for F
where
    F: Fn() -> Value + Send + Sync,
{
    fn create_body(&self) -> Value {
        self()
    }
}

/// Generate a fresh unique message id
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A message carried by an exchange
///
/// Cloning is the message copy: headers become an independent map while the
/// header and body values follow the owned/shared split of [`Value`].
#[derive(Clone, Default)]
pub struct Message {
    id: OnceLock<String>,
    timestamp: Option<i64>,
    headers: Headers,
    body: OnceLock<Value>,
    body_source: Option<Arc<dyn BodySource>>,
    data_type: Option<DataType>,
    track_data_type: bool,
    converter: Option<Arc<dyn TypeConverter>>,
}

impl Message {
    /// Create an empty message
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a message builder
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Create a message with the given body
    pub fn with_body(body: impl Into<Value>) -> Self {
        let mut message = Self::new();
        message.set_body(body);
        message
    }

    /// Create a message whose body is produced on first access
    pub fn with_body_source(source: impl BodySource + 'static) -> Self {
        Self {
            body_source: Some(Arc::new(source)),
            ..Self::default()
        }
    }

    /// Message id, generated on first access
    pub fn id(&self) -> &str {
        self.id.get_or_init(generate_id)
    }

    /// Whether an id has been assigned or generated yet
    pub fn has_id(&self) -> bool {
        self.id.get().is_some()
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = OnceLock::from(id.into());
    }

    /// Forget the id so a new one is generated on next access
    pub fn reset_id(&mut self) {
        self.id = OnceLock::new();
    }

    /// Message timestamp in epoch milliseconds
    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: i64) {
        self.timestamp = Some(timestamp);
    }

    /// Attach the type converter used for typed access
    pub fn set_converter(&mut self, converter: Arc<dyn TypeConverter>) {
        self.converter = Some(converter);
    }

    /// Converter used for typed access, standard coercion when none is attached
    pub fn converter(&self) -> &dyn TypeConverter {
        match &self.converter {
            Some(converter) => converter.as_ref(),
            None => &STANDARD_CONVERTER,
        }
    }

    /// Enable or disable data-type tagging on `set_body`
    pub fn set_data_type_tracking(&mut self, enabled: bool) {
        self.track_data_type = enabled;
    }

    /// Body, created from the body source on first access
    pub fn body(&self) -> &Value {
        self.body.get_or_init(|| {
            self.body_source
                .as_ref()
                .map(|source| source.create_body())
                .unwrap_or_default()
        })
    }

    /// Whether the body is present and not null
    pub fn has_body(&self) -> bool {
        !self.body().is_null()
    }

    /// Body converted to `T`, `None` when the body is null or not convertible
    pub fn body_as<T: FromValue>(&self) -> Option<T> {
        self.convert_value(self.body())
    }

    /// Body converted to `T`, failing when absent or not convertible
    pub fn mandatory_body_as<T: FromValue>(&self) -> MessageResult<T> {
        let body = self.body();
        if body.is_null() {
            return Err(MessageError::InvalidPayload { expected: T::KIND });
        }
        self.mandatory_convert_value(body)
    }

    /// Take the body out of the message, leaving null behind
    pub fn take_body(&mut self) -> Value {
        self.body();
        self.body_source = None;
        self.body.take().unwrap_or_default()
    }

    /// Replace the body
    pub fn set_body(&mut self, body: impl Into<Value>) {
        let body = body.into();
        if self.track_data_type {
            self.data_type = (!body.is_null()).then(|| DataType::of(&body));
        }
        self.body_source = None;
        self.body = OnceLock::from(body);
    }

    /// Replace the body, converting it to `kind` first when possible
    ///
    /// Values that cannot be converted are stored as given.
    pub fn set_body_as(&mut self, body: impl Into<Value>, kind: ValueKind) {
        let body = body.into();
        let converted = self.converter().convert_to(kind, &body).unwrap_or(body);
        self.set_body(converted);
    }

    /// Replace the body with an explicit data-type tag
    pub fn set_body_with_data_type(&mut self, body: impl Into<Value>, data_type: DataType) {
        self.body_source = None;
        self.body = OnceLock::from(body.into());
        self.data_type = Some(data_type);
    }

    pub fn data_type(&self) -> Option<&DataType> {
        self.data_type.as_ref()
    }

    pub fn set_data_type(&mut self, data_type: Option<DataType>) {
        self.data_type = data_type;
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn set_headers(&mut self, headers: Headers) {
        self.headers = headers;
    }

    pub fn has_headers(&self) -> bool {
        !self.headers.is_empty()
    }

    /// Get a header by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    /// Get a header, or the default when absent
    pub fn header_or(&self, name: &str, default: impl Into<Value>) -> Value {
        self.headers
            .get(name)
            .cloned()
            .unwrap_or_else(|| default.into())
    }

    /// Get a header converted to `T`
    pub fn header_as<T: FromValue>(&self, name: &str) -> Option<T> {
        self.headers.get(name).and_then(|v| self.convert_value(v))
    }

    /// Boolean header, `false` when absent or not convertible
    pub fn header_flag(&self, name: &str) -> bool {
        self.header_as::<bool>(name).unwrap_or(false)
    }

    /// Get a header converted to `T`, failing when absent or not convertible
    pub fn mandatory_header_as<T: FromValue>(&self, name: &str) -> MessageResult<T> {
        let value = self.headers.get(name).ok_or_else(|| MessageError::NoSuchHeader {
            name: name.to_string(),
        })?;
        self.mandatory_convert_value(value)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.headers.insert(name, value);
    }

    pub fn remove_header(&mut self, name: &str) -> Option<Value> {
        self.headers.remove(name)
    }

    /// Independent copy of this message
    pub fn copy(&self) -> Message {
        self.clone()
    }

    /// Copy id, headers, body and data type from another message
    ///
    /// The converter and tracking switch of this message are kept. Copying a
    /// message onto itself cannot be expressed, so it needs no special case.
    pub fn copy_from(&mut self, other: &Message) {
        let body = other.body().clone();
        self.copy_from_with_new_body(other, body);
        self.data_type = other.data_type.clone();
    }

    /// Copy id and headers from another message but use the given body
    pub fn copy_from_with_new_body(&mut self, other: &Message, body: impl Into<Value>) {
        self.id = other.id.clone();
        self.timestamp = other.timestamp;
        self.headers = other.headers.clone();
        self.body_source = None;
        self.body = OnceLock::from(body.into());
        self.data_type = None;
    }

    fn convert_value<T: FromValue>(&self, value: &Value) -> Option<T> {
        if value.is_null() {
            return None;
        }
        courier_schema::convert::<T>(self.converter(), value)
            .or_else(|| courier_schema::convert::<T>(&STANDARD_CONVERTER, value))
    }

    fn mandatory_convert_value<T: FromValue>(&self, value: &Value) -> MessageResult<T> {
        match self.convert_value(value) {
            Some(v) => Ok(v),
            None => Err(ConversionError::NoConverter {
                from: value.kind(),
                to: T::KIND,
            }
            .into()),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id.get())
            .field("timestamp", &self.timestamp)
            .field("headers", &self.headers)
            .field("body", &self.body.get())
            .field("data_type", &self.data_type)
            .finish()
    }
}

/// Message builder for convenient message construction
#[derive(Default)]
pub struct MessageBuilder {
    id: Option<String>,
    timestamp: Option<i64>,
    headers: Headers,
    body: Option<Value>,
    data_type: Option<DataType>,
    converter: Option<Arc<dyn TypeConverter>>,
}

impl MessageBuilder {
    /// Set message id
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set timestamp
    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set body
    pub fn body(mut self, body: impl Into<Value>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set data type tag
    pub fn data_type(mut self, data_type: DataType) -> Self {
        self.data_type = Some(data_type);
        self
    }

    /// Set type converter
    pub fn converter(mut self, converter: Arc<dyn TypeConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    /// Build the message
    pub fn build(self) -> Message {
        let mut message = Message {
            timestamp: self.timestamp,
            headers: self.headers,
            data_type: self.data_type,
            converter: self.converter,
            ..Message::default()
        };
        if let Some(id) = self.id {
            message.set_id(id);
        }
        if let Some(body) = self.body {
            message.body = OnceLock::from(body);
        }
        message
    }
}

// Re-export courier_schema for convenience
pub use courier_schema;
