//! Cash-register commands: completion, ledger reads, reversal, product sales.

use serde_json::Value;

use super::{arg0_as_string, fold};
use crate::db::DbState;
use crate::{payments, value_str};

/// `completeAndPay(groupId, totals, paymentMethod)`
pub fn complete_and_pay(db: &DbState, payload: Option<Value>) -> Value {
    let payload = match payload {
        Some(p) => p,
        None => return missing_payload(),
    };
    fold("complete_and_pay", payments::complete_and_pay(db, &payload))
}

/// `deletePaymentTransaction(transactionId)` — reverses per payment type.
pub fn delete_payment_transaction(db: &DbState, arg0: Option<Value>) -> Value {
    let tx_id = match arg0_as_string(arg0, &["transactionId", "transaction_id", "id"]) {
        Some(id) => id,
        None => return fold("delete_payment_transaction", Err("Ödeme kaydı seçilmedi".into())),
    };
    fold(
        "delete_payment_transaction",
        payments::delete_transaction(db, &tx_id),
    )
}

/// Ledger read with derived descriptions: `{from?, to?}`.
pub fn list_payment_transactions(db: &DbState, payload: Option<Value>) -> Value {
    let payload = payload.unwrap_or_default();
    let from = value_str(&payload, &["from", "start"]);
    let to = value_str(&payload, &["to", "end"]);
    fold(
        "list_payment_transactions",
        payments::list_transactions(db, from.as_deref(), to.as_deref()),
    )
}

/// End-of-day totals: accepts `"YYYY-MM-DD"` or `{date}`.
pub fn daily_summary(db: &DbState, arg0: Option<Value>) -> Value {
    let day = match arg0_as_string(arg0, &["date", "day"]) {
        Some(d) => d,
        None => return fold("daily_summary", Err("Gün seçilmedi".into())),
    };
    fold("daily_summary", payments::daily_summary(db, &day))
}

/// Over-the-counter product sale.
pub fn record_product_sale(db: &DbState, payload: Option<Value>) -> Value {
    let payload = match payload {
        Some(p) => p,
        None => return missing_payload(),
    };
    fold("record_product_sale", payments::record_sale(db, &payload))
}

/// Delete a product sale, restoring its stock.
pub fn delete_product_sale(db: &DbState, arg0: Option<Value>) -> Value {
    let sale_id = match arg0_as_string(arg0, &["saleId", "sale_id", "id"]) {
        Some(id) => id,
        None => return fold("delete_product_sale", Err("Satış kaydı seçilmedi".into())),
    };
    fold("delete_product_sale", payments::delete_sale(db, &sale_id))
}

fn missing_payload() -> Value {
    serde_json::json!({ "success": false, "message": "Eksik istek verisi" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::run_migrations_for_test(&conn);
        conn.execute_batch(
            "INSERT INTO appointments (id, group_id, customer_id, customer_name,
                personnel_id, personnel_name, service_id, service_name, price,
                start_at, end_at, status)
             VALUES ('a1', 'g-1', 'c-1', 'Ayşe', 'per-1', 'Elif', 'srv-1',
                'Manikür', 200.0, '2024-03-01T10:00:00Z',
                '2024-03-01T10:30:00Z', 'active');",
        )
        .expect("seed");
        DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }
    }

    #[test]
    fn test_complete_and_reverse_through_commands() {
        let db = test_db();
        let result = complete_and_pay(
            &db,
            Some(serde_json::json!({
                "groupId": "g-1",
                "serviceAmount": 200.0,
                "productAmount": 0.0,
                "paymentMethod": "Nakit",
            })),
        );
        assert_eq!(result["success"], true);
        let tx_id = result["transactionId"].as_str().unwrap().to_string();

        // Double submission folds to success: false.
        let again = complete_and_pay(
            &db,
            Some(serde_json::json!({
                "groupId": "g-1",
                "serviceAmount": 200.0,
                "productAmount": 0.0,
                "paymentMethod": "Nakit",
            })),
        );
        assert_eq!(again["success"], false);

        let deleted = delete_payment_transaction(&db, Some(serde_json::json!({ "id": tx_id })));
        assert_eq!(deleted["success"], true);
    }

    #[test]
    fn test_daily_summary_requires_day() {
        let db = test_db();
        let result = daily_summary(&db, None);
        assert_eq!(result["success"], false);

        let result = daily_summary(&db, Some(serde_json::json!("2024-03-01")));
        assert_eq!(result["transactionCount"], 0);
    }
}
