//! Conflict copy construction.

use serde_json::Value;

/// Appended to the title of a conflict copy.
pub const CONFLICT_SUFFIX: &str = " (conflict copy)";

/// Marker field set on conflict copies.
const CONFLICT_MARKER: &str = "is_conflict";

const UNTITLED: &str = "Untitled";

/// Payload field that carries the display title of `item_type`.
pub fn title_field(item_type: &str) -> &'static str {
    match item_type {
        "vault_entry" | "ai_config" => "name",
        _ => "title",
    }
}

/// Builds the payload of a conflict copy from the local payload.
///
/// The title is annotated and the conflict marker set. Payloads that are
/// not JSON objects are copied unchanged.
pub fn conflict_copy_payload(item_type: &str, payload: &str) -> String {
    let Ok(Value::Object(mut fields)) = serde_json::from_str::<Value>(payload) else {
        return payload.to_string();
    };

    let field = title_field(item_type);
    let title = match fields.get(field) {
        Some(Value::String(title)) if !title.is_empty() => title.clone(),
        _ => UNTITLED.to_string(),
    };
    fields.insert(field.to_string(), Value::String(format!("{title}{CONFLICT_SUFFIX}")));
    fields.insert(CONFLICT_MARKER.to_string(), Value::Bool(true));

    Value::Object(fields).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(payload: &str) -> Value {
        serde_json::from_str(payload).unwrap()
    }

    #[test]
    fn annotates_title_and_sets_marker() {
        let copy = parse(&conflict_copy_payload(
            "note",
            r#"{"title":"Groceries","body":"eggs"}"#,
        ));
        assert_eq!(copy["title"], "Groceries (conflict copy)");
        assert_eq!(copy["is_conflict"], true);
        assert_eq!(copy["body"], "eggs");
    }

    #[test]
    fn vault_entries_use_name() {
        let copy = parse(&conflict_copy_payload("vault_entry", r#"{"name":"bank"}"#));
        assert_eq!(copy["name"], "bank (conflict copy)");
        assert!(copy.get("title").is_none());
    }

    #[test]
    fn missing_title_becomes_untitled() {
        let copy = parse(&conflict_copy_payload("todo", r#"{"done":false}"#));
        assert_eq!(copy["title"], "Untitled (conflict copy)");
    }

    #[test]
    fn non_object_payload_is_kept() {
        assert_eq!(conflict_copy_payload("note", "plain text"), "plain text");
        assert_eq!(conflict_copy_payload("note", "[1,2]"), "[1,2]");
    }
}
