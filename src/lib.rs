//! Salon Desk backend.
//!
//! Appointment, package-sale, product-sale and cash-register services for a
//! salon/clinic front desk. The UI shell calls the functions in [`commands`]
//! with loosely-typed JSON payloads and always gets a `{success, message}`
//! JSON object back; everything underneath runs against one SQLite database
//! where every multi-entity mutation is a single transaction.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod appointments;
pub mod catalog;
pub mod commands;
pub mod db;
pub mod packages;
pub mod payments;
pub mod stock;

/// Initialize console logging. `RUST_LOG` overrides the default filter.
///
/// Safe to call more than once; subsequent calls are ignored.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,salon_desk=debug"));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}

// ---------------------------------------------------------------------------
// Payload field helpers
// ---------------------------------------------------------------------------
// The UI invokes commands with camelCase payloads, older screens with
// snake_case. Every lookup takes the accepted aliases in preference order.

pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

pub(crate) fn value_f64(v: &serde_json::Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(|x| x.as_f64()) {
            return Some(n);
        }
    }
    None
}

pub(crate) fn value_i64(v: &serde_json::Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(|x| x.as_i64()) {
            return Some(n);
        }
    }
    None
}

pub(crate) fn value_bool(v: &serde_json::Value, keys: &[&str]) -> Option<bool> {
    for key in keys {
        if let Some(b) = v.get(*key).and_then(|x| x.as_bool()) {
            return Some(b);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_helpers_respect_alias_order() {
        let payload = serde_json::json!({
            "customer_id": "c-1",
            "customerId": "c-2",
            "price": 150.0,
            "quantity": 3,
            "isPackage": true,
        });

        assert_eq!(
            value_str(&payload, &["customerId", "customer_id"]).as_deref(),
            Some("c-2")
        );
        assert_eq!(
            value_str(&payload, &["customer_id", "customerId"]).as_deref(),
            Some("c-1")
        );
        assert_eq!(value_f64(&payload, &["price"]), Some(150.0));
        assert_eq!(value_i64(&payload, &["quantity"]), Some(3));
        assert_eq!(value_bool(&payload, &["isPackage"]), Some(true));
        assert_eq!(value_str(&payload, &["missing"]), None);
    }

    #[test]
    fn test_value_str_skips_blank() {
        let payload = serde_json::json!({ "name": "   ", "fallback": "ok" });
        assert_eq!(
            value_str(&payload, &["name", "fallback"]).as_deref(),
            Some("ok")
        );
    }
}
