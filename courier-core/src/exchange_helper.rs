//! Free functions over exchanges
//!
//! Copying results between exchanges, correlated copies for sub-units of work,
//! mandatory lookups and pattern-aware body handling.

use crate::error::{ExecutionError, LookupError, LookupResult};
use crate::exchange::{Exchange, ExchangePattern, ExchangePropertyKey, VariableTarget};
use courier_message::Message;
use courier_schema::{FromValue, Value};
use tracing::trace;

/// In-message header marking a redelivery attempt
pub const REDELIVERED_HEADER: &str = "CourierRedelivered";

/// Property converted to `T`, failing when absent
pub fn mandatory_property<T: FromValue>(exchange: &Exchange, name: &str) -> LookupResult<T> {
    let value = exchange
        .property(name)
        .filter(|v| !v.is_null())
        .ok_or_else(|| LookupError::NoSuchProperty {
            name: name.to_string(),
            exchange_id: exchange.id().to_string(),
        })?;
    convert_to_mandatory_type(exchange, value)
}

/// Header of the current message converted to `T`, failing when absent
pub fn mandatory_header<T: FromValue>(exchange: &Exchange, name: &str) -> LookupResult<T> {
    let value = exchange
        .message()
        .header(name)
        .filter(|v| !v.is_null())
        .ok_or_else(|| LookupError::NoSuchHeader {
            name: name.to_string(),
            exchange_id: exchange.id().to_string(),
        })?;
    convert_to_mandatory_type(exchange, value)
}

/// Header of the in message, falling back to the property of the same name
pub fn header_or_property<T: FromValue>(exchange: &Exchange, name: &str) -> Option<T> {
    exchange
        .in_message()
        .header_as::<T>(name)
        .or_else(|| exchange.property_as::<T>(name))
}

/// Convert through the exchange's context converter
pub fn convert_to_type<T: FromValue>(exchange: &Exchange, value: &Value) -> Option<T> {
    if value.is_null() {
        return None;
    }
    courier_schema::convert::<T>(exchange.context().converter_registry().as_ref(), value)
}

/// Convert through the exchange's context converter, failing when impossible
pub fn convert_to_mandatory_type<T: FromValue>(
    exchange: &Exchange,
    value: &Value,
) -> LookupResult<T> {
    Ok(courier_schema::mandatory_convert::<T>(
        exchange.context().converter_registry().as_ref(),
        value,
    )?)
}

/// Copy an exchange, optionally keeping its id
pub fn create_copy(exchange: &Exchange, preserve_id: bool) -> Exchange {
    let mut copy = exchange.copy();
    if preserve_id {
        copy.set_id(exchange.id());
    }
    copy
}

/// Copy an exchange for a separate unit of work
///
/// The copy gets fresh message ids unless `use_same_message_id` is set, has no
/// unit of work and carries the original exchange id as its correlation id.
/// With `handover`, on-completion callbacks that allow it move to the copy.
pub fn create_correlated_copy(
    exchange: &mut Exchange,
    handover: bool,
    use_same_message_id: bool,
) -> Exchange {
    let id = exchange.id().to_string();
    let mut copy = exchange.copy();

    if !use_same_message_id {
        copy.in_message_mut().reset_id();
        if copy.has_out() {
            copy.out_mut().reset_id();
        }
    }
    copy.set_unit_of_work(None);
    if handover {
        exchange.handover_completions(&mut copy);
    }
    copy.set_property_key(ExchangePropertyKey::CorrelationId, id.as_str());

    trace!(exchange_id = %id, copy_id = %copy.id(), handover, "Created correlated copy");
    copy
}

/// Copy the outcome of `source` into `target`
///
/// The result lands in the out message when `target` is out-capable.
/// Properties, routing flags and the failure are copied as well.
pub fn copy_results(target: &mut Exchange, source: &Exchange) {
    do_copy_results(target, source, false);
}

/// Like [`copy_results`], but keeps `target`'s pattern deciding the result slot
pub fn copy_results_preserve_pattern(target: &mut Exchange, source: &Exchange) {
    do_copy_results(target, source, true);
}

fn do_copy_results(result: &mut Exchange, source: &Exchange, preserve_pattern: bool) {
    match source.out() {
        Some(out) if preserve_pattern => result_message_mut(result).copy_from(out),
        Some(out) => result.out_mut().copy_from(out),
        None if !preserve_pattern && result.pattern().is_out_capable() => {
            result.out_mut().copy_from(source.in_message());
        }
        None => {
            result.in_message_mut().copy_from(source.in_message());
            result.take_out();
        }
    }

    if source.has_properties() {
        result.properties_mut().put_all(source.properties());
    }
    result.copy_flags_from(source);
    result.set_exception_arc(source.exception_arc().cloned());
}

/// Put the result in the out message when the pattern expects one
///
/// Applies when an exchange is both source and target of a result copy.
pub fn ensure_result_slot(exchange: &mut Exchange) {
    if exchange.pattern().is_out_capable() && !exchange.has_out() && !exchange.is_failed() {
        let input = exchange.in_message().copy();
        exchange.out_mut().copy_from(&input);
    }
}

/// Message that holds the result for the exchange's pattern
pub fn result_message(exchange: &mut Exchange) -> &Message {
    result_message_mut(exchange)
}

fn result_message_mut(exchange: &mut Exchange) -> &mut Message {
    if exchange.pattern().is_out_capable() {
        exchange.out_mut()
    } else {
        exchange.in_message_mut()
    }
}

pub fn is_out_capable(exchange: &Exchange) -> bool {
    exchange.pattern().is_out_capable()
}

/// Body of the result, or the recorded failure
///
/// A pattern that is not out-capable forces the in body even when an out
/// message exists.
pub fn extract_result_body(
    exchange: &Exchange,
    pattern: Option<ExchangePattern>,
) -> Result<Value, ExecutionError> {
    if let Some(cause) = exchange.exception_arc() {
        return Err(ExecutionError {
            exchange_id: exchange.id().to_string(),
            cause: cause.clone(),
        });
    }

    let not_out = pattern.is_some_and(|p| !p.is_out_capable());
    let body = match exchange.out() {
        Some(out) if !not_out => out.body(),
        _ => exchange.in_message().body(),
    };
    Ok(body.clone())
}

/// Move the out message to the in slot
pub fn prepare_out_to_in(exchange: &mut Exchange) {
    if let Some(out) = exchange.take_out() {
        exchange.set_in(out);
    }
}

/// Move results to the in slot of both sides before aggregating them
pub fn prepare_aggregation(old: Option<&mut Exchange>, new: Option<&mut Exchange>) {
    if let Some(old) = old {
        prepare_out_to_in(old);
    }
    if let Some(new) = new {
        prepare_out_to_in(new);
    }
}

/// Message and exchange ids for log lines
pub fn log_ids(exchange: &Exchange) -> String {
    format!(
        "(MessageId: {} on ExchangeId: {})",
        exchange.message().id(),
        exchange.id()
    )
}

/// Set the result body, in the out message when the pattern allows one
pub fn set_in_out_body_pattern_aware(exchange: &mut Exchange, body: impl Into<Value>) {
    if exchange.pattern().is_out_capable() {
        let input = exchange.in_message().copy();
        exchange.out_mut().copy_from_with_new_body(&input, body);
    } else {
        exchange.in_message_mut().set_body(body);
    }
}

/// Set the out body from the in message when the pattern allows an out message
pub fn set_out_body_pattern_aware(exchange: &mut Exchange, body: impl Into<Value>) {
    if exchange.pattern().is_out_capable() {
        let input = exchange.in_message().copy();
        exchange.out_mut().copy_from_with_new_body(&input, body);
    }
}

/// Replace the current message
///
/// Replaces the out message when `out_only` is set or one already exists,
/// the in message otherwise.
pub fn replace_message(exchange: &mut Exchange, message: Message, out_only: bool) {
    if out_only || exchange.has_out() {
        exchange.set_out(message);
    } else {
        exchange.set_in(message);
    }
}

/// In message the unit of work started with, if it kept one
pub fn original_in_message(exchange: &Exchange) -> Option<Message> {
    exchange
        .unit_of_work()
        .and_then(|uow| uow.original_in_message())
}

/// Mark the failure as handled and clear it
pub fn set_failure_handled(exchange: &mut Exchange) {
    exchange.clear_exception();
    exchange.set_failure_handled(true);
}

pub fn is_failure_handled(exchange: &Exchange) -> bool {
    exchange.is_failure_handled()
}

pub fn is_redelivered(exchange: &Exchange) -> bool {
    let input = exchange.in_message();
    input.has_headers() && input.header_flag(REDELIVERED_HEADER)
}

pub fn is_error_handler_bridge(exchange: &Exchange) -> bool {
    exchange
        .property_key_as::<bool>(ExchangePropertyKey::ErrorHandlerBridge)
        .unwrap_or(false)
}

pub fn is_unit_of_work_exhausted(exchange: &Exchange) -> bool {
    exchange
        .property_key_as::<bool>(ExchangePropertyKey::UnitOfWorkExhausted)
        .unwrap_or(false)
}

/// Store a message's body and headers as variables
///
/// The body goes under `name`, each header under `header:name.key`. A
/// `repo-id:` prefix on `name` stores them all in that repository.
pub fn set_variable_from_message_body_and_headers(
    exchange: &mut Exchange,
    name: &str,
    message: &Message,
) -> LookupResult<()> {
    let body = message.body().clone();
    let headers: Vec<(String, Value)> = message
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();

    match exchange.resolve_variable(name)? {
        VariableTarget::Local(key) => {
            for (header, value) in headers {
                exchange.set_local_variable(format!("header:{}.{}", key, header), value);
            }
            exchange.set_local_variable(key, body);
        }
        VariableTarget::Repository(repository, key) => {
            for (header, value) in headers {
                repository.set_variable(&format!("header:{}.{}", key, header), value);
            }
            repository.set_variable(&key, body);
        }
    }
    Ok(())
}
