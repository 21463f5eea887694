//! Payment ledger and the complete-and-pay state transition.
//!
//! Closing a visit charges the customer, consumes package sessions and flips
//! the whole appointment group to completed in one transaction: a crash or a
//! concurrent submission can never charge without closing, or close without
//! consuming the sessions it promised. Reversal deletes the ledger row and
//! undoes its side effects — with one deliberate asymmetry: reversing a
//! package payment adjusts the money counters only and never restores
//! consumed sessions.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::db::DbState;
use crate::packages;
use crate::stock;
use crate::{value_f64, value_i64, value_str};

const AMOUNT_EPS: f64 = 0.001;

/// Accepted cash-register payment methods.
pub const PAYMENT_METHODS: [&str; 3] = ["Nakit", "Kart", "Havale/EFT"];

pub(crate) fn validate_method(method: &str) -> Result<(), String> {
    if PAYMENT_METHODS.contains(&method) {
        Ok(())
    } else {
        Err(format!(
            "Geçersiz ödeme yöntemi: {method}. Nakit, Kart veya Havale/EFT olmalı"
        ))
    }
}

/// What a ledger row means, resolved once at read time from the legacy
/// string tag plus the linked sale's date. Nothing downstream re-inspects
/// the raw tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentKind {
    /// Settlement of an appointment group (legacy rows with no tag included).
    AppointmentPayment,
    /// Package payment taken on the day of the sale itself.
    PackageSale,
    /// Package payment taken later, against the remaining balance.
    PackageInstallment,
}

/// Calendar-day comparison tolerant of the stored timestamp shapes.
fn same_day(a: &str, b: &str) -> bool {
    match (
        DateTime::parse_from_rfc3339(a),
        DateTime::parse_from_rfc3339(b),
    ) {
        (Ok(da), Ok(db)) => da.date_naive() == db.date_naive(),
        // Legacy rows carry bare dates; the ISO prefix is the calendar day.
        _ => a.get(..10) == b.get(..10) && a.len() >= 10,
    }
}

fn resolve_kind(payment_type: Option<&str>, payment_date: &str, sale_date: Option<&str>) -> PaymentKind {
    match payment_type {
        Some("package") => match sale_date {
            Some(sd) if same_day(payment_date, sd) => PaymentKind::PackageSale,
            _ => PaymentKind::PackageInstallment,
        },
        // None or "appointment" — legacy rows predate the tag.
        _ => PaymentKind::AppointmentPayment,
    }
}

// ---------------------------------------------------------------------------
// Complete and pay
// ---------------------------------------------------------------------------

/// Close an appointment group with payment.
///
/// Atomically: re-reads every appointment in the group (rejecting if any is
/// already completed, so two concurrent submissions settle at most once),
/// consumes one session per package-session line, writes one ledger row when
/// the total is positive, and marks the whole group completed.
pub fn complete_and_pay(db: &DbState, payload: &Value) -> Result<Value, String> {
    let group_id =
        value_str(payload, &["groupId", "group_id"]).ok_or("Randevu grubu seçilmedi")?;
    let service_amount =
        value_f64(payload, &["serviceAmount", "service_amount", "totalServiceAmount"])
            .unwrap_or(0.0);
    let product_amount =
        value_f64(payload, &["productAmount", "product_amount", "totalProductAmount"])
            .unwrap_or(0.0);
    if service_amount < 0.0 || product_amount < 0.0 {
        return Err("Tutar negatif olamaz".to_string());
    }
    let grand_total = service_amount + product_amount;
    let method = value_str(payload, &["paymentMethod", "payment_method", "method"])
        .unwrap_or_default();
    if grand_total > AMOUNT_EPS {
        validate_method(&method)?;
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<Option<String>, String> {
        // Idempotency guard: the authoritative statuses are the ones read
        // inside this transaction, not whatever the dialog had in memory.
        let mut stmt = conn
            .prepare(
                "SELECT id, status, is_package_session, package_sale_id,
                        customer_id, customer_name
                 FROM appointments WHERE group_id = ?1",
            )
            .map_err(|e| format!("prepare group read: {e}"))?;
        let rows: Vec<(String, String, i64, Option<String>, String, String)> = stmt
            .query_map(params![group_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })
            .map_err(|e| format!("read group: {e}"))?
            .filter_map(|r| r.ok())
            .collect();

        if rows.is_empty() {
            return Err(format!("Randevu grubu bulunamadı: {group_id}"));
        }
        if rows.iter().any(|(_, status, ..)| status == "completed") {
            return Err("Randevu grubu zaten kapatılmış".to_string());
        }

        for (_, _, is_session, sale_id, _, _) in &rows {
            if *is_session != 0 {
                let sale_id = sale_id
                    .as_deref()
                    .ok_or("Paket seansı satırında paket satışı eksik")?;
                packages::consume_session(&conn, sale_id)?;
            }
        }

        let tx_id = if grand_total > AMOUNT_EPS {
            let (customer_id, customer_name) = (&rows[0].4, &rows[0].5);
            let tx_id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO payment_transactions (
                    id, appointment_group_id, customer_id, customer_name,
                    service_amount, product_amount, grand_total, method,
                    payment_date, payment_type
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'appointment')",
                params![
                    tx_id,
                    group_id,
                    customer_id,
                    customer_name,
                    service_amount,
                    product_amount,
                    grand_total,
                    method,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| format!("insert payment: {e}"))?;
            Some(tx_id)
        } else {
            None
        };

        conn.execute(
            "UPDATE appointments SET status = 'completed' WHERE group_id = ?1",
            params![group_id],
        )
        .map_err(|e| format!("complete appointments: {e}"))?;

        Ok(tx_id)
    })();

    let tx_id = match result {
        Ok(id) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
            id
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    };

    info!(
        group_id = %group_id,
        grand_total = grand_total,
        "Appointment group completed"
    );
    Ok(serde_json::json!({
        "success": true,
        "transactionId": tx_id,
        "grandTotal": grand_total,
        "message": "Randevu tamamlandı ve ödeme alındı",
    }))
}

// ---------------------------------------------------------------------------
// Payment reversal
// ---------------------------------------------------------------------------

/// Delete a ledger row and reverse its side effects.
///
/// Appointment payments re-activate the linked group. Package payments only
/// walk the money counters back; consumed sessions stay consumed.
pub fn delete_transaction(db: &DbState, tx_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(), String> {
        let (link_id, grand_total, payment_type): (String, f64, Option<String>) = conn
            .query_row(
                "SELECT appointment_group_id, grand_total, payment_type
                 FROM payment_transactions WHERE id = ?1",
                params![tx_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(|_| format!("Ödeme kaydı bulunamadı: {tx_id}"))?;

        if payment_type.as_deref() == Some("package") {
            let updated = conn
                .execute(
                    "UPDATE package_sales SET
                        paid_amount = MAX(paid_amount - ?1, 0),
                        remaining_amount = remaining_amount + ?1
                     WHERE id = ?2",
                    params![grand_total, link_id],
                )
                .map_err(|e| format!("reverse sale amounts: {e}"))?;
            if updated == 0 {
                return Err(format!("Paket satışı bulunamadı: {link_id}"));
            }
        } else {
            conn.execute(
                "UPDATE appointments SET status = 'active' WHERE group_id = ?1",
                params![link_id],
            )
            .map_err(|e| format!("reactivate appointments: {e}"))?;
        }

        conn.execute(
            "DELETE FROM payment_transactions WHERE id = ?1",
            params![tx_id],
        )
        .map_err(|e| format!("delete payment: {e}"))?;
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

    info!(tx_id = %tx_id, "Payment transaction reversed");
    Ok(serde_json::json!({
        "success": true,
        "message": "Ödeme kaydı silindi",
    }))
}

// ---------------------------------------------------------------------------
// Ledger reads
// ---------------------------------------------------------------------------

/// Derive the human-readable description for one ledger row.
fn describe(conn: &Connection, link_id: &str, kind: PaymentKind, package_name: Option<&str>) -> String {
    match kind {
        PaymentKind::PackageSale => {
            format!("Paket Satışı: {}", package_name.unwrap_or("Paket"))
        }
        PaymentKind::PackageInstallment => {
            format!("Kalan Ödeme: {}", package_name.unwrap_or("Paket"))
        }
        PaymentKind::AppointmentPayment => {
            let mut names: Vec<String> = Vec::new();
            let mut stmt = match conn.prepare(
                "SELECT service_name FROM appointments WHERE group_id = ?1 ORDER BY start_at",
            ) {
                Ok(s) => s,
                Err(_) => return "Randevu Ödemesi".to_string(),
            };
            if let Ok(rows) = stmt.query_map(params![link_id], |row| row.get::<_, String>(0)) {
                names.extend(rows.filter_map(|r| r.ok()));
            }
            let mut stmt = match conn.prepare(
                "SELECT product_name FROM sales WHERE appointment_group_id = ?1 ORDER BY sale_date",
            ) {
                Ok(s) => s,
                Err(_) => return "Randevu Ödemesi".to_string(),
            };
            if let Ok(rows) = stmt.query_map(params![link_id], |row| row.get::<_, String>(0)) {
                names.extend(rows.filter_map(|r| r.ok()));
            }
            if names.is_empty() {
                "Randevu Ödemesi".to_string()
            } else {
                names.join(", ")
            }
        }
    }
}

/// List ledger rows in `[from, to)` (both optional), enriched with a derived
/// description and the resolved payment kind.
pub fn list_transactions(
    db: &DbState,
    from: Option<&str>,
    to: Option<&str>,
) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(
            "SELECT id, appointment_group_id, customer_id, customer_name,
                    service_amount, product_amount, grand_total, method,
                    payment_date, payment_type
             FROM payment_transactions
             WHERE (?1 IS NULL OR payment_date >= ?1)
               AND (?2 IS NULL OR payment_date < ?2)
             ORDER BY payment_date DESC",
        )
        .map_err(|e| format!("prepare transactions: {e}"))?;

    struct TxRow {
        id: String,
        link_id: String,
        customer_id: Option<String>,
        customer_name: String,
        service_amount: f64,
        product_amount: f64,
        grand_total: f64,
        method: String,
        payment_date: String,
        payment_type: Option<String>,
    }

    let raw: Vec<TxRow> = stmt
        .query_map(params![from, to], |row| {
            Ok(TxRow {
                id: row.get(0)?,
                link_id: row.get(1)?,
                customer_id: row.get(2)?,
                customer_name: row.get(3)?,
                service_amount: row.get(4)?,
                product_amount: row.get(5)?,
                grand_total: row.get(6)?,
                method: row.get(7)?,
                payment_date: row.get(8)?,
                payment_type: row.get(9)?,
            })
        })
        .map_err(|e| format!("query transactions: {e}"))?
        .filter_map(|r| r.ok())
        .collect();

    let mut out = Vec::with_capacity(raw.len());
    for tx in raw {
        let package: Option<(String, String)> = if tx.payment_type.as_deref() == Some("package") {
            conn.query_row(
                "SELECT package_name, sale_date FROM package_sales WHERE id = ?1",
                params![tx.link_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok()
        } else {
            None
        };
        let kind = resolve_kind(
            tx.payment_type.as_deref(),
            &tx.payment_date,
            package.as_ref().map(|(_, d)| d.as_str()),
        );
        let description = describe(
            &conn,
            &tx.link_id,
            kind,
            package.as_ref().map(|(n, _)| n.as_str()),
        );
        out.push(serde_json::json!({
            "id": tx.id,
            "linkedId": tx.link_id,
            "customerId": tx.customer_id,
            "customerName": tx.customer_name,
            "serviceAmount": tx.service_amount,
            "productAmount": tx.product_amount,
            "grandTotal": tx.grand_total,
            "method": tx.method,
            "paymentDate": tx.payment_date,
            "kind": match kind {
                PaymentKind::AppointmentPayment => "appointment",
                PaymentKind::PackageSale => "packageSale",
                PaymentKind::PackageInstallment => "packageInstallment",
            },
            "description": description,
        }));
    }
    Ok(Value::Array(out))
}

/// Cash-register reconciliation for one calendar day: per-method totals.
pub fn daily_summary(db: &DbState, day: &str) -> Result<Value, String> {
    if day.len() != 10 {
        return Err(format!("Geçersiz gün: {day} (YYYY-AA-GG bekleniyor)"));
    }
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(
            "SELECT method, COUNT(*), COALESCE(SUM(grand_total), 0)
             FROM payment_transactions
             WHERE substr(payment_date, 1, 10) = ?1
             GROUP BY method",
        )
        .map_err(|e| format!("prepare summary: {e}"))?;
    let mut by_method = serde_json::Map::new();
    let mut grand = 0.0;
    let mut count = 0i64;
    let rows: Vec<(String, i64, f64)> = stmt
        .query_map(params![day], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })
        .map_err(|e| format!("query summary: {e}"))?
        .filter_map(|r| r.ok())
        .collect();
    for (method, n, total) in rows {
        grand += total;
        count += n;
        by_method.insert(
            method,
            serde_json::json!({ "count": n, "total": total }),
        );
    }
    Ok(serde_json::json!({
        "day": day,
        "byMethod": by_method,
        "transactionCount": count,
        "grandTotal": grand,
    }))
}

// ---------------------------------------------------------------------------
// Standalone product sales
// ---------------------------------------------------------------------------

/// Sell a product over the counter, outside any appointment group.
pub fn record_sale(db: &DbState, payload: &Value) -> Result<Value, String> {
    let product_id =
        value_str(payload, &["productId", "product_id"]).ok_or("Ürün seçilmedi")?;
    let quantity = value_i64(payload, &["quantity"]).unwrap_or(0);
    if quantity <= 0 {
        return Err("Ürün adedi pozitif olmalı".to_string());
    }
    let customer_id = value_str(payload, &["customerId", "customer_id"]);
    let personnel_id = value_str(payload, &["personnelId", "personnel_id"]);

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let sale_id = Uuid::new_v4().to_string();
    let result = (|| -> Result<f64, String> {
        let (product_name, unit_price): (String, f64) = conn
            .query_row(
                "SELECT name, price FROM products WHERE id = ?1",
                params![product_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|_| format!("Ürün bulunamadı: {product_id}"))?;
        let total_amount = value_f64(payload, &["totalAmount", "total_amount"])
            .unwrap_or(unit_price * quantity as f64);

        stock::deplete(&conn, &product_id, quantity)?;
        conn.execute(
            "INSERT INTO sales (
                id, product_id, product_name, quantity, total_amount,
                customer_id, personnel_id, appointment_group_id, sale_date
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8)",
            params![
                sale_id,
                product_id,
                product_name,
                quantity,
                total_amount,
                customer_id,
                personnel_id,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| format!("insert sale: {e}"))?;
        Ok(total_amount)
    })();

    let total_amount = match result {
        Ok(t) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
            t
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    };

    info!(sale_id = %sale_id, quantity = quantity, "Product sale recorded");
    Ok(serde_json::json!({
        "success": true,
        "saleId": sale_id,
        "totalAmount": total_amount,
        "message": "Satış kaydedildi",
    }))
}

/// Delete a product sale and put its units back on the shelf.
pub fn delete_sale(db: &DbState, sale_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(), String> {
        let (product_id, quantity): (String, i64) = conn
            .query_row(
                "SELECT product_id, quantity FROM sales WHERE id = ?1",
                params![sale_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|_| format!("Satış kaydı bulunamadı: {sale_id}"))?;
        stock::restore(&conn, &product_id, quantity)?;
        conn.execute("DELETE FROM sales WHERE id = ?1", params![sale_id])
            .map_err(|e| format!("delete sale: {e}"))?;
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

    info!(sale_id = %sale_id, "Product sale deleted, stock restored");
    Ok(serde_json::json!({
        "success": true,
        "message": "Satış silindi, stok iade edildi",
    }))
}

// ===========================================================================
// Tests
// ===========================================================================
