//! Normalizer for legacy document payload shapes.
//!
//! Older clients wrote record documents in several envelope forms. Readers
//! must tolerate all of them:
//!
//!   (a) a bare array of records
//!   (b) an array wrapping `{"result": [...]}` entries
//!   (c) a single `{"result": ...}` object
//!   (d) a single record object
//!
//! Empty or null payloads normalize to an empty list.

use serde_json::Value;

/// Flatten any of the four supported payload shapes into a flat record list.
pub fn normalize_rows(value: Value) -> Vec<Value> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    // shape (b): each element may itself wrap a result set
                    Value::Object(mut obj) if obj.contains_key("result") => {
                        match obj.remove("result") {
                            Some(Value::Array(inner)) => out.extend(inner),
                            Some(Value::Null) | None => {}
                            Some(single) => out.push(single),
                        }
                    }
                    other => out.push(other),
                }
            }
            out
        }
        // shape (c): single result wrapper
        Value::Object(mut obj) if obj.contains_key("result") => match obj.remove("result") {
            Some(Value::Array(inner)) => inner,
            Some(Value::Null) | None => Vec::new(),
            Some(single) => vec![single],
        },
        // shape (d): single record
        other => vec![other],
    }
}

/// Normalize to a single record, taking the first row when the payload is a
/// list. Returns `None` for empty payloads.
pub fn normalize_single(value: Value) -> Option<Value> {
    normalize_rows(value).into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_array_passes_through() {
        let rows = normalize_rows(json!([{"id": "a"}, {"id": "b"}]));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], "a");
    }

    #[test]
    fn result_wrapped_array_flattens() {
        let rows = normalize_rows(json!([{"result": [{"id": "a"}, {"id": "b"}]}]));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["id"], "b");
    }

    #[test]
    fn single_result_object_unwraps() {
        let rows = normalize_rows(json!({"result": {"id": "a"}}));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "a");
    }

    #[test]
    fn single_record_dict_wraps_into_list() {
        let rows = normalize_rows(json!({"id": "a", "content": "hi"}));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["content"], "hi");
    }

    #[test]
    fn null_and_empty_normalize_to_empty() {
        assert!(normalize_rows(Value::Null).is_empty());
        assert!(normalize_rows(json!([])).is_empty());
        assert!(normalize_rows(json!({"result": null})).is_empty());
        assert!(normalize_single(Value::Null).is_none());
    }

    #[test]
    fn first_row_wins_for_single() {
        let one = normalize_single(json!([{"id": "first"}, {"id": "second"}])).unwrap();
        assert_eq!(one["id"], "first");
    }
}
