//! RPC boundary for the UI shell.
//!
//! Every function here takes the loosely-typed JSON payload the dialogs
//! send, validates the cheap structural things before any transaction opens,
//! delegates to a service module and folds the outcome into a
//! `{success, message, ...}` object. Errors never cross this boundary as
//! anything other than `success: false` plus a message the toast can show.

pub mod appointments;
pub mod catalog;
pub mod packages;
pub mod payments;

use tracing::warn;

/// Fold a service result into the wire shape.
fn fold(op: &str, result: Result<serde_json::Value, String>) -> serde_json::Value {
    match result {
        Ok(v) => v,
        Err(message) => {
            warn!(op = op, message = %message, "Operation failed");
            serde_json::json!({ "success": false, "message": message })
        }
    }
}

/// Accept either a bare string argument or an object carrying one of `keys`.
fn arg0_as_string(arg0: Option<serde_json::Value>, keys: &[&str]) -> Option<String> {
    match arg0 {
        Some(serde_json::Value::String(s)) => {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        }
        Some(serde_json::Value::Object(obj)) => {
            let payload = serde_json::Value::Object(obj);
            crate::value_str(&payload, keys)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_wraps_errors() {
        let v = fold("op", Err("Müşteri bulunamadı: c-1".to_string()));
        assert_eq!(v["success"], false);
        assert_eq!(v["message"], "Müşteri bulunamadı: c-1");

        let v = fold("op", Ok(serde_json::json!({ "success": true })));
        assert_eq!(v["success"], true);
    }

    #[test]
    fn test_arg0_as_string_accepts_string_and_object() {
        assert_eq!(
            arg0_as_string(Some(serde_json::json!("g-1")), &["groupId"]).as_deref(),
            Some("g-1")
        );
        assert_eq!(
            arg0_as_string(
                Some(serde_json::json!({ "group_id": "g-2" })),
                &["groupId", "group_id"]
            )
            .as_deref(),
            Some("g-2")
        );
        assert_eq!(arg0_as_string(Some(serde_json::json!("  ")), &["id"]), None);
        assert_eq!(arg0_as_string(None, &["id"]), None);
    }
}
