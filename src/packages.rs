//! Package sales and the session ledger.
//!
//! A package sale is a pre-paid pool of sessions: `total_sessions =
//! session_count × covered service count`, counted down one session per
//! completed package-session appointment. Money on the sale is tracked as
//! `paid_amount` / `remaining_amount`, kept in step with the package-type
//! rows in the payment ledger.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::db::DbState;
use crate::payments::validate_method;
use crate::{value_f64, value_str};

const AMOUNT_EPS: f64 = 0.001;

// ---------------------------------------------------------------------------
// Sale creation
// ---------------------------------------------------------------------------

/// Sell a package, optionally recording a same-moment partial payment.
pub fn create_sale(db: &DbState, payload: &Value) -> Result<Value, String> {
    let package_id =
        value_str(payload, &["packageId", "package_id"]).ok_or("Paket seçilmedi")?;
    let customer_id =
        value_str(payload, &["customerId", "customer_id"]).ok_or("Müşteri seçilmedi")?;
    let personnel_id = value_str(payload, &["personnelId", "personnel_id"]);
    let paid_amount = value_f64(payload, &["paidAmount", "paid_amount"]).unwrap_or(0.0);
    if paid_amount < 0.0 {
        return Err("Ödenen tutar negatif olamaz".to_string());
    }
    let method = value_str(payload, &["paymentMethod", "payment_method", "method"]);
    if paid_amount > AMOUNT_EPS {
        validate_method(method.as_deref().unwrap_or(""))?;
    }
    let sale_date = value_str(payload, &["saleDate", "sale_date"])
        .unwrap_or_else(|| Utc::now().to_rfc3339());

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let sale_id = Uuid::new_v4().to_string();
    let result = (|| -> Result<(), String> {
        let (package_name, price, session_count, service_ids_raw): (String, f64, i64, String) =
            conn.query_row(
                "SELECT name, price, session_count, service_ids FROM packages WHERE id = ?1",
                params![package_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .map_err(|_| format!("Paket bulunamadı: {package_id}"))?;
        let customer_name: String = conn
            .query_row(
                "SELECT name FROM customers WHERE id = ?1",
                params![customer_id],
                |row| row.get(0),
            )
            .map_err(|_| format!("Müşteri bulunamadı: {customer_id}"))?;

        if paid_amount > price + AMOUNT_EPS {
            return Err("Ödenen tutar paket fiyatını aşamaz".to_string());
        }

        let service_ids: Vec<String> = serde_json::from_str(&service_ids_raw).unwrap_or_default();
        let total_sessions = session_count * service_ids.len().max(1) as i64;
        let remaining_amount = (price - paid_amount).max(0.0);

        conn.execute(
            "INSERT INTO package_sales (
                id, package_id, package_name, customer_id, customer_name,
                personnel_id, price, paid_amount, remaining_amount,
                total_sessions, remaining_sessions, service_ids, sale_date
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, ?11, ?12)",
            params![
                sale_id,
                package_id,
                package_name,
                customer_id,
                customer_name,
                personnel_id,
                price,
                paid_amount,
                remaining_amount,
                total_sessions,
                service_ids_raw,
                sale_date,
            ],
        )
        .map_err(|e| format!("insert package sale: {e}"))?;
        // SQLite binds ?10 twice: total and remaining start equal.

        if paid_amount > AMOUNT_EPS {
            let tx_id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO payment_transactions (
                    id, appointment_group_id, customer_id, customer_name,
                    service_amount, product_amount, grand_total, method,
                    payment_date, payment_type
                ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?5, ?6, ?7, 'package')",
                params![
                    tx_id,
                    sale_id,
                    customer_id,
                    customer_name,
                    paid_amount,
                    method,
                    sale_date,
                ],
            )
            .map_err(|e| format!("insert package payment: {e}"))?;
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    }

    info!(sale_id = %sale_id, package_id = %package_id, "Package sold");
    Ok(serde_json::json!({
        "success": true,
        "packageSaleId": sale_id,
        "message": "Paket satışı kaydedildi",
    }))
}

// ---------------------------------------------------------------------------
// Payment recording / update
// ---------------------------------------------------------------------------

/// Apply edits to the sale's existing payment rows, append an optional new
/// payment, and recompute the sale's paid/remaining amounts from the ledger.
///
/// The recompute is a full sum over the sale's package payments after the
/// writes, not an increment, so repeated edits cannot drift the counters.
pub fn record_or_update_payments(db: &DbState, payload: &Value) -> Result<Value, String> {
    let sale_id = value_str(payload, &["packageSaleId", "package_sale_id"])
        .ok_or("Paket satışı seçilmedi")?;
    let edited = payload
        .get("editedPayments")
        .or_else(|| payload.get("edited_payments"))
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    let new_payment = payload
        .get("newPayment")
        .or_else(|| payload.get("new_payment"))
        .filter(|v| !v.is_null())
        .cloned();

    // Pre-transaction shape checks.
    for row in &edited {
        if value_str(row, &["id", "transactionId", "transaction_id"]).is_none() {
            return Err("Düzenlenen ödeme satırında kimlik eksik".to_string());
        }
        if value_f64(row, &["amount"]).unwrap_or(-1.0) <= 0.0 {
            return Err("Ödeme tutarı pozitif olmalı".to_string());
        }
    }
    if let Some(ref row) = new_payment {
        if value_f64(row, &["amount"]).unwrap_or(-1.0) <= 0.0 {
            return Err("Ödeme tutarı pozitif olmalı".to_string());
        }
        validate_method(
            &value_str(row, &["method", "paymentMethod", "payment_method"]).unwrap_or_default(),
        )?;
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(f64, f64), String> {
        let (price, customer_id, customer_name): (f64, String, String) = conn
            .query_row(
                "SELECT price, customer_id, customer_name FROM package_sales WHERE id = ?1",
                params![sale_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(|_| format!("Paket satışı bulunamadı: {sale_id}"))?;

        for row in &edited {
            let tx_id = value_str(row, &["id", "transactionId", "transaction_id"])
                .ok_or("Düzenlenen ödeme satırında kimlik eksik")?;
            let amount = value_f64(row, &["amount"]).unwrap_or(0.0);
            let date = value_str(row, &["date", "paymentDate", "payment_date"]);
            let method = value_str(row, &["method", "paymentMethod", "payment_method"]);
            if let Some(ref m) = method {
                validate_method(m)?;
            }

            let updated = conn
                .execute(
                    "UPDATE payment_transactions SET
                        service_amount = ?1,
                        grand_total = ?1,
                        payment_date = COALESCE(?2, payment_date),
                        method = COALESCE(?3, method)
                     WHERE id = ?4 AND appointment_group_id = ?5
                       AND payment_type = 'package'",
                    params![amount, date, method, tx_id, sale_id],
                )
                .map_err(|e| format!("update payment: {e}"))?;
            if updated == 0 {
                return Err(format!("Ödeme kaydı bulunamadı: {tx_id}"));
            }
        }

        if let Some(ref row) = new_payment {
            let amount = value_f64(row, &["amount"]).unwrap_or(0.0);
            let method =
                value_str(row, &["method", "paymentMethod", "payment_method"]).unwrap_or_default();
            let date = value_str(row, &["date", "paymentDate", "payment_date"])
                .unwrap_or_else(|| Utc::now().to_rfc3339());
            let tx_id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO payment_transactions (
                    id, appointment_group_id, customer_id, customer_name,
                    service_amount, product_amount, grand_total, method,
                    payment_date, payment_type
                ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?5, ?6, ?7, 'package')",
                params![tx_id, sale_id, customer_id, customer_name, amount, method, date],
            )
            .map_err(|e| format!("insert payment: {e}"))?;
        }

        let paid: f64 = conn
            .query_row(
                "SELECT COALESCE(SUM(grand_total), 0) FROM payment_transactions
                 WHERE appointment_group_id = ?1 AND payment_type = 'package'",
                params![sale_id],
                |row| row.get(0),
            )
            .map_err(|e| format!("sum payments: {e}"))?;
        if paid > price + AMOUNT_EPS {
            return Err(format!(
                "Toplam ödeme {paid:.2} paket fiyatını ({price:.2}) aşıyor"
            ));
        }
        let remaining = (price - paid).max(0.0);
        conn.execute(
            "UPDATE package_sales SET paid_amount = ?1, remaining_amount = ?2 WHERE id = ?3",
            params![paid, remaining, sale_id],
        )
        .map_err(|e| format!("update sale amounts: {e}"))?;
        Ok((paid, remaining))
    })();

    let (paid, remaining) = match result {
        Ok(v) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
            v
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    };

    info!(sale_id = %sale_id, paid = paid, "Package payments updated");
    Ok(serde_json::json!({
        "success": true,
        "paidAmount": paid,
        "remainingAmount": remaining,
        "message": "Ödemeler güncellendi",
    }))
}

// ---------------------------------------------------------------------------
// Session consumption
// ---------------------------------------------------------------------------

/// Consume one session from a package sale's pool.
///
/// Joins the caller's transaction (complete-and-pay holds one open). A sale
/// with no sessions left rejects, which aborts the surrounding completion.
pub(crate) fn consume_session(conn: &Connection, sale_id: &str) -> Result<(), String> {
    let (package_name, remaining): (String, i64) = conn
        .query_row(
            "SELECT package_name, remaining_sessions FROM package_sales WHERE id = ?1",
            params![sale_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|_| format!("Paket satışı bulunamadı: {sale_id}"))?;
    if remaining <= 0 {
        return Err(format!("Pakette kalan seans yok: {package_name}"));
    }
    conn.execute(
        "UPDATE package_sales SET remaining_sessions = remaining_sessions - 1 WHERE id = ?1",
        params![sale_id],
    )
    .map_err(|e| format!("consume session: {e}"))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cancel an unused package sale, removing its payment rows with it.
/// Hard-locked once any session has been consumed.
pub fn cancel_sale(db: &DbState, sale_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(), String> {
        let (total, remaining): (i64, i64) = conn
            .query_row(
                "SELECT total_sessions, remaining_sessions FROM package_sales WHERE id = ?1",
                params![sale_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|_| format!("Paket satışı bulunamadı: {sale_id}"))?;
        if remaining < total {
            return Err("Kullanılmış seansı olan paket iptal edilemez".to_string());
        }
        conn.execute(
            "DELETE FROM payment_transactions
             WHERE appointment_group_id = ?1 AND payment_type = 'package'",
            params![sale_id],
        )
        .map_err(|e| format!("delete package payments: {e}"))?;
        conn.execute(
            "DELETE FROM package_sales WHERE id = ?1",
            params![sale_id],
        )
        .map_err(|e| format!("delete package sale: {e}"))?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    }

    info!(sale_id = %sale_id, "Package sale cancelled");
    Ok(serde_json::json!({
        "success": true,
        "message": "Paket satışı iptal edildi",
    }))
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// List package sales, optionally restricted to one customer.
pub fn list_sales(db: &DbState, customer_id: Option<&str>) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let sql = "SELECT id, package_id, package_name, customer_id, customer_name,
                      price, paid_amount, remaining_amount, total_sessions,
                      remaining_sessions, sale_date
               FROM package_sales
               WHERE (?1 IS NULL OR customer_id = ?1)
               ORDER BY sale_date DESC";
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| format!("prepare package sales: {e}"))?;
    let rows: Vec<Value> = stmt
        .query_map(params![customer_id], |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "packageId": row.get::<_, String>(1)?,
                "packageName": row.get::<_, String>(2)?,
                "customerId": row.get::<_, String>(3)?,
                "customerName": row.get::<_, String>(4)?,
                "price": row.get::<_, f64>(5)?,
                "paidAmount": row.get::<_, f64>(6)?,
                "remainingAmount": row.get::<_, f64>(7)?,
                "totalSessions": row.get::<_, i64>(8)?,
                "remainingSessions": row.get::<_, i64>(9)?,
                "saleDate": row.get::<_, String>(10)?,
            }))
        })
        .map_err(|e| format!("query package sales: {e}"))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(Value::Array(rows))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::run_migrations_for_test(&conn);
        conn.execute_batch(
            "INSERT INTO customers (id, name) VALUES ('c-1', 'Ayşe Yılmaz');
             INSERT INTO services (id, name, duration_minutes, price)
                VALUES ('srv-1', 'Masaj', 60, 400.0);
             INSERT INTO services (id, name, duration_minutes, price)
                VALUES ('srv-2', 'Cilt Bakımı', 45, 350.0);
             INSERT INTO packages (id, name, price, session_count, service_ids)
                VALUES ('pkg-1', 'Masaj Paketi', 2000.0, 5, '[\"srv-1\",\"srv-2\"]');",
        )
        .expect("seed");
        DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }
    }

    fn sell_package(db: &DbState, paid: f64) -> String {
        let result = create_sale(
            db,
            &serde_json::json!({
                "packageId": "pkg-1",
                "customerId": "c-1",
                "paidAmount": paid,
                "paymentMethod": "Nakit",
                "saleDate": "2024-01-10T09:00:00Z",
            }),
        )
        .expect("create sale");
        result["packageSaleId"].as_str().unwrap().to_string()
    }

    fn sale_amounts(db: &DbState, sale_id: &str) -> (f64, f64, f64) {
        let conn = db.conn.lock().unwrap();
        conn.query_row(
            "SELECT price, paid_amount, remaining_amount FROM package_sales WHERE id = ?1",
            params![sale_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .unwrap()
    }

    #[test]
    fn test_create_sale_with_initial_payment() {
        let db = test_db();
        let sale_id = sell_package(&db, 500.0);

        let (price, paid, remaining) = sale_amounts(&db, &sale_id);
        assert_eq!(price, 2000.0);
        assert_eq!(paid, 500.0);
        assert_eq!(remaining, 1500.0);

        let conn = db.conn.lock().unwrap();
        // 5 sessions × 2 covered services
        let (total, rem_sessions): (i64, i64) = conn
            .query_row(
                "SELECT total_sessions, remaining_sessions FROM package_sales WHERE id = ?1",
                params![sale_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(total, 10);
        assert_eq!(rem_sessions, 10);

        let (tx_count, tx_type): (i64, String) = conn
            .query_row(
                "SELECT COUNT(*), MAX(payment_type) FROM payment_transactions
                 WHERE appointment_group_id = ?1",
                params![sale_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(tx_count, 1);
        assert_eq!(tx_type, "package");
    }

    #[test]
    fn test_create_sale_without_payment_writes_no_transaction() {
        let db = test_db();
        let sale_id = sell_package(&db, 0.0);

        let conn = db.conn.lock().unwrap();
        let tx_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM payment_transactions WHERE appointment_group_id = ?1",
                params![sale_id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tx_count, 0);
    }

    #[test]
    fn test_create_sale_overpayment_rejected() {
        let db = test_db();
        let err = create_sale(
            &db,
            &serde_json::json!({
                "packageId": "pkg-1",
                "customerId": "c-1",
                "paidAmount": 2500.0,
                "paymentMethod": "Kart",
            }),
        )
        .unwrap_err();
        assert!(err.contains("paket fiyatını aşamaz"), "got: {err}");
    }

    #[test]
    fn test_paid_plus_remaining_equals_price_through_edits() {
        let db = test_db();
        let sale_id = sell_package(&db, 500.0);

        // Add a second payment.
        record_or_update_payments(
            &db,
            &serde_json::json!({
                "packageSaleId": sale_id,
                "editedPayments": [],
                "newPayment": { "amount": 700.0, "method": "Kart", "date": "2024-02-01T10:00:00Z" },
            }),
        )
        .unwrap();
        let (price, paid, remaining) = sale_amounts(&db, &sale_id);
        assert_eq!(paid, 1200.0);
        assert!((paid + remaining - price).abs() < 0.001);

        // Edit the first payment down.
        let tx_id: String = {
            let conn = db.conn.lock().unwrap();
            conn.query_row(
                "SELECT id FROM payment_transactions
                 WHERE appointment_group_id = ?1 ORDER BY payment_date LIMIT 1",
                params![sale_id],
                |row| row.get(0),
            )
            .unwrap()
        };
        record_or_update_payments(
            &db,
            &serde_json::json!({
                "packageSaleId": sale_id,
                "editedPayments": [ { "id": tx_id, "amount": 300.0 } ],
            }),
        )
        .unwrap();
        let (price, paid, remaining) = sale_amounts(&db, &sale_id);
        assert_eq!(paid, 1000.0);
        assert!((paid + remaining - price).abs() < 0.001);
    }

    #[test]
    fn test_payments_exceeding_price_rejected_and_rolled_back() {
        let db = test_db();
        let sale_id = sell_package(&db, 1500.0);

        let err = record_or_update_payments(
            &db,
            &serde_json::json!({
                "packageSaleId": sale_id,
                "newPayment": { "amount": 900.0, "method": "Nakit" },
            }),
        )
        .unwrap_err();
        assert!(err.contains("aşıyor"), "got: {err}");

        // Counters and ledger unchanged.
        let (_, paid, remaining) = sale_amounts(&db, &sale_id);
        assert_eq!(paid, 1500.0);
        assert_eq!(remaining, 500.0);
        let conn = db.conn.lock().unwrap();
        let tx_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM payment_transactions WHERE appointment_group_id = ?1",
                params![sale_id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tx_count, 1);
    }

    #[test]
    fn test_consume_session_counts_down_and_stops_at_zero() {
        let db = test_db();
        let sale_id = sell_package(&db, 2000.0);

        let conn = db.conn.lock().unwrap();
        for _ in 0..3 {
            consume_session(&conn, &sale_id).unwrap();
        }
        let remaining: i64 = conn
            .query_row(
                "SELECT remaining_sessions FROM package_sales WHERE id = ?1",
                params![sale_id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(remaining, 7);

        for _ in 0..7 {
            consume_session(&conn, &sale_id).unwrap();
        }
        let err = consume_session(&conn, &sale_id).unwrap_err();
        assert!(err.contains("kalan seans yok"), "got: {err}");
    }

    #[test]
    fn test_cancel_sale_locked_after_consumption() {
        let db = test_db();
        let sale_id = sell_package(&db, 500.0);
        {
            let conn = db.conn.lock().unwrap();
            consume_session(&conn, &sale_id).unwrap();
        }

        let err = cancel_sale(&db, &sale_id).unwrap_err();
        assert!(err.contains("iptal edilemez"), "got: {err}");
    }

    #[test]
    fn test_cancel_unused_sale_removes_payments_too() {
        let db = test_db();
        let sale_id = sell_package(&db, 500.0);

        cancel_sale(&db, &sale_id).unwrap();

        let conn = db.conn.lock().unwrap();
        let sales: i64 = conn
            .query_row("SELECT COUNT(*) FROM package_sales", [], |row| row.get(0))
            .unwrap();
        let txs: i64 = conn
            .query_row("SELECT COUNT(*) FROM payment_transactions", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(sales, 0);
        assert_eq!(txs, 0);
    }

    #[test]
    fn test_list_sales_filters_by_customer() {
        let db = test_db();
        sell_package(&db, 0.0);

        let all = list_sales(&db, None).unwrap();
        assert_eq!(all.as_array().unwrap().len(), 1);
        assert_eq!(all[0]["packageName"], "Masaj Paketi");

        let other = list_sales(&db, Some("c-2")).unwrap();
        assert!(other.as_array().unwrap().is_empty());
    }
}
