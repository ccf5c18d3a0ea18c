//! Message helper functions

use crate::Message;
use courier_schema::Value;

/// Default number of body characters kept by [`extract_body_for_logging`]
pub const DEFAULT_MAX_LOG_CHARS: usize = 1000;

/// Copy headers from `source` into `target`
///
/// Existing target headers are only replaced when `override_existing` is set.
pub fn copy_headers(source: &Message, target: &mut Message, override_existing: bool) {
    if !source.has_headers() {
        return;
    }
    for (name, value) in source.headers().iter() {
        if override_existing || !target.headers().contains(name) {
            target.set_header(name, value.clone());
        }
    }
}

/// Copy the body from `source` to `target`, keeping the data-type tag
pub fn copy_body(source: &Message, target: &mut Message) {
    match source.data_type() {
        Some(data_type) => target.set_body_with_data_type(source.body().clone(), data_type.clone()),
        None => target.set_body(source.body().clone()),
    }
}

/// Runtime type name of the body, `"null"` when there is none
pub fn body_type_name(message: &Message) -> &'static str {
    message.body().type_name()
}

/// Render the body for log output, clipped to `max_chars`
pub fn extract_body_for_logging(message: &Message, prefix: &str, max_chars: usize) -> String {
    format!("{}{}", prefix, extract_body_as_string(message.body(), max_chars))
}

fn extract_body_as_string(body: &Value, max_chars: usize) -> String {
    match body {
        Value::Null => "[Body is null]".to_string(),
        Value::Shared(obj) => format!("[Body is instance of {}]", obj.type_name()),
        other => {
            let text = other.to_string();
            let total = text.chars().count();
            if max_chars > 0 && total > max_chars {
                let clipped: String = text.chars().take(max_chars).collect();
                format!(
                    "{}... [Body clipped after {} chars, total length is {}]",
                    clipped, max_chars, total
                )
            } else {
                text
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_schema::{DataType, SharedObject};

    #[test]
    fn test_copy_headers_without_override() {
        let source = Message::builder().header("a", 1).header("b", 2).build();
        let mut target = Message::builder().header("A", 10).build();

        copy_headers(&source, &mut target, false);

        assert_eq!(target.header("a"), Some(&Value::from(10)));
        assert_eq!(target.header("b"), Some(&Value::from(2)));
    }

    #[test]
    fn test_copy_headers_with_override() {
        let source = Message::builder().header("a", 1).build();
        let mut target = Message::builder().header("a", 10).build();

        copy_headers(&source, &mut target, true);

        assert_eq!(target.header("a"), Some(&Value::from(1)));
    }

    #[test]
    fn test_copy_body_keeps_data_type() {
        let source = Message::builder()
            .body("{}")
            .data_type(DataType::new("json"))
            .build();
        let mut target = Message::new();

        copy_body(&source, &mut target);

        assert_eq!(target.body(), &Value::from("{}"));
        assert_eq!(target.data_type().map(|d| d.name()), Some("json"));
    }

    #[test]
    fn test_extract_body_for_logging() {
        let message = Message::with_body("abcdefghij");
        assert_eq!(
            extract_body_for_logging(&message, "Message: ", 4),
            "Message: abcd... [Body clipped after 4 chars, total length is 10]"
        );
        assert_eq!(
            extract_body_for_logging(&Message::new(), "", DEFAULT_MAX_LOG_CHARS),
            "[Body is null]"
        );

        struct Stream;
        let message = Message::with_body(SharedObject::new(Stream));
        assert!(extract_body_for_logging(&message, "", 10).starts_with("[Body is instance of"));
    }

    #[test]
    fn test_body_type_name() {
        assert_eq!(body_type_name(&Message::with_body(1)), "i64");
        assert_eq!(body_type_name(&Message::new()), "null");
    }
}
