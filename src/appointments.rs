//! Appointment group orchestration.
//!
//! One customer visit is a *group*: a shared group id over N appointment
//! rows, one per service/personnel line, laid out back to back in time.
//! Groups are created, fully rewritten (delete-and-recreate, no diffing) and
//! cancelled inside single transactions so no reader ever observes a
//! half-edited visit. Product-sale line items ride along with the group and
//! move stock through the stock ledger inside the same transaction.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::db::DbState;
use crate::stock;
use crate::{value_bool, value_f64, value_i64, value_str};

/// One resolved service/package line, ready to be laid out on the timeline.
struct ResolvedLine {
    personnel_id: String,
    personnel_name: String,
    item_id: String,
    item_name: String,
    price: f64,
    is_package: bool,
    is_package_session: bool,
    package_sale_id: Option<String>,
    duration_minutes: i64,
}

fn parse_start(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| format!("Geçersiz tarih: {raw}"))
}

/// Cheap structural checks before any transaction opens.
fn validate_lines(lines: &[Value]) -> Result<(), String> {
    if lines.is_empty() {
        return Err("En az bir hizmet satırı gerekli".to_string());
    }
    for line in lines {
        if value_str(line, &["personnelId", "personnel_id"]).is_none() {
            return Err("Satırda personel seçilmedi".to_string());
        }
        if value_str(line, &["serviceId", "service_id", "packageId", "package_id"]).is_none() {
            return Err("Satırda hizmet veya paket seçilmedi".to_string());
        }
        if value_f64(line, &["price"]).unwrap_or(0.0) < 0.0 {
            return Err("Satır fiyatı negatif olamaz".to_string());
        }
    }
    Ok(())
}

/// Resolve a request line against the catalog. Must run inside the caller's
/// transaction so the referenced rows cannot change before the writes land.
fn resolve_line(conn: &Connection, line: &Value) -> Result<ResolvedLine, String> {
    let personnel_id =
        value_str(line, &["personnelId", "personnel_id"]).ok_or("Satırda personel seçilmedi")?;
    let personnel_name: String = conn
        .query_row(
            "SELECT name FROM personnel WHERE id = ?1",
            params![personnel_id],
            |row| row.get(0),
        )
        .map_err(|_| format!("Personel bulunamadı: {personnel_id}"))?;

    let item_id = value_str(line, &["serviceId", "service_id", "packageId", "package_id"])
        .ok_or("Satırda hizmet veya paket seçilmedi")?;
    let is_package_session =
        value_bool(line, &["isPackageSession", "is_package_session"]).unwrap_or(false);
    let mut price = value_f64(line, &["price"]).unwrap_or(0.0);

    // Try the service catalog first, then packages.
    let service: Option<(String, i64)> = conn
        .query_row(
            "SELECT name, duration_minutes FROM services WHERE id = ?1",
            params![item_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .ok();

    let (item_name, duration_minutes, is_package) = match service {
        Some((name, duration)) => (name, duration, false),
        None => {
            let (name, service_ids_raw): (String, String) = conn
                .query_row(
                    "SELECT name, service_ids FROM packages WHERE id = ?1",
                    params![item_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(|_| format!("Hizmet veya paket bulunamadı: {item_id}"))?;
            // A package slot spans all of its covered services back to back.
            let service_ids: Vec<String> =
                serde_json::from_str(&service_ids_raw).unwrap_or_default();
            let mut total = 0i64;
            for sid in &service_ids {
                let d: i64 = conn
                    .query_row(
                        "SELECT duration_minutes FROM services WHERE id = ?1",
                        params![sid],
                        |row| row.get(0),
                    )
                    .map_err(|_| format!("Hizmet bulunamadı: {sid}"))?;
                total += d;
            }
            (name, total.max(15), true)
        }
    };

    let package_sale_id = if is_package_session {
        let sale_id = value_str(line, &["packageSaleId", "package_sale_id"])
            .ok_or("Paket seansı için paket satışı seçilmedi")?;
        let exists: bool = conn
            .query_row(
                "SELECT 1 FROM package_sales WHERE id = ?1",
                params![sale_id],
                |_| Ok(true),
            )
            .unwrap_or(false);
        if !exists {
            return Err(format!("Paket satışı bulunamadı: {sale_id}"));
        }
        // Session lines are pre-paid through the package; never priced here.
        price = 0.0;
        Some(sale_id)
    } else {
        None
    };

    Ok(ResolvedLine {
        personnel_id,
        personnel_name,
        item_id,
        item_name,
        price,
        is_package,
        is_package_session,
        package_sale_id,
        duration_minutes,
    })
}

/// Lay the resolved lines out sequentially from `start` and insert one
/// appointment row per line. Returns the total service amount.
#[allow(clippy::too_many_arguments)]
fn insert_group_rows(
    conn: &Connection,
    group_id: &str,
    customer_id: &str,
    customer_name: &str,
    lines: &[ResolvedLine],
    start: DateTime<Utc>,
    notes: &str,
    status: &str,
) -> Result<f64, String> {
    let mut cursor = start;
    let mut service_total = 0.0;
    for line in lines {
        let end = cursor + Duration::minutes(line.duration_minutes);
        let appointment_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO appointments (
                id, group_id, customer_id, customer_name, personnel_id,
                personnel_name, service_id, service_name, price, is_package,
                is_package_session, package_sale_id, start_at, end_at, notes,
                status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                appointment_id,
                group_id,
                customer_id,
                customer_name,
                line.personnel_id,
                line.personnel_name,
                line.item_id,
                line.item_name,
                line.price,
                line.is_package as i64,
                line.is_package_session as i64,
                line.package_sale_id,
                cursor.to_rfc3339(),
                end.to_rfc3339(),
                notes,
                status,
            ],
        )
        .map_err(|e| format!("insert appointment: {e}"))?;
        service_total += line.price;
        cursor = end;
    }
    Ok(service_total)
}

// ---------------------------------------------------------------------------
// Create group
// ---------------------------------------------------------------------------

/// Create a new appointment group from a visit request.
///
/// Every line becomes one active appointment row; missing referenced
/// entities abort the whole transaction with nothing written.
pub fn create_group(db: &DbState, payload: &Value) -> Result<Value, String> {
    let customer_id =
        value_str(payload, &["customerId", "customer_id"]).ok_or("Müşteri seçilmedi")?;
    let start_raw = value_str(payload, &["startDateTime", "start_date_time", "start"])
        .ok_or("Başlangıç zamanı zorunlu")?;
    let start = parse_start(&start_raw)?;
    let notes = value_str(payload, &["notes"]).unwrap_or_default();
    let lines = payload
        .get("lines")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    validate_lines(&lines)?;

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let group_id = Uuid::new_v4().to_string();
    let result = (|| -> Result<(), String> {
        let customer_name: String = conn
            .query_row(
                "SELECT name FROM customers WHERE id = ?1",
                params![customer_id],
                |row| row.get(0),
            )
            .map_err(|_| format!("Müşteri bulunamadı: {customer_id}"))?;

        let mut resolved = Vec::with_capacity(lines.len());
        for line in &lines {
            resolved.push(resolve_line(&conn, line)?);
        }
        insert_group_rows(
            &conn,
            &group_id,
            &customer_id,
            &customer_name,
            &resolved,
            start,
            &notes,
            "active",
        )?;
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

    info!(group_id = %group_id, lines = lines.len(), "Appointment group created");
    Ok(serde_json::json!({
        "success": true,
        "groupId": group_id,
        "message": "Randevu oluşturuldu",
    }))
}

// ---------------------------------------------------------------------------
// Full group update (delete-and-recreate)
// ---------------------------------------------------------------------------

/// Rewrite an appointment group in place: restore stock for the old product
/// sales, drop all old rows, lay the new lines out from the (possibly new)
/// start time, re-deplete stock for the new sale lines, and refresh the
/// group's payment transaction amounts when one already exists (the legacy
/// edit-and-pay screen finalizes through this path).
pub fn full_update_group(db: &DbState, payload: &Value) -> Result<Value, String> {
    let group_id = value_str(payload, &["groupId", "group_id"]).ok_or("Randevu grubu seçilmedi")?;
    let customer_id =
        value_str(payload, &["customerId", "customer_id"]).ok_or("Müşteri seçilmedi")?;
    let start_raw = value_str(payload, &["startDateTime", "start_date_time", "start"])
        .ok_or("Başlangıç zamanı zorunlu")?;
    let start = parse_start(&start_raw)?;
    let notes = value_str(payload, &["notes"]).unwrap_or_default();
    let lines = payload
        .get("lines")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    validate_lines(&lines)?;
    let sale_lines = payload
        .get("saleLines")
        .or_else(|| payload.get("sale_lines"))
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(f64, f64), String> {
        // The group must exist; its status carries over to the rewritten rows
        // so an administrative edit of a closed visit does not re-open it.
        let statuses = group_statuses(&conn, &group_id)?;
        if statuses.is_empty() {
            return Err(format!("Randevu grubu bulunamadı: {group_id}"));
        }
        let status = if statuses.iter().all(|s| s == "completed") {
            "completed"
        } else {
            "active"
        };

        let customer_name: String = conn
            .query_row(
                "SELECT name FROM customers WHERE id = ?1",
                params![customer_id],
                |row| row.get(0),
            )
            .map_err(|_| format!("Müşteri bulunamadı: {customer_id}"))?;

        // Give back stock for every existing product sale, then drop them.
        restore_group_sales(&conn, &group_id)?;
        conn.execute(
            "DELETE FROM appointments WHERE group_id = ?1",
            params![group_id],
        )
        .map_err(|e| format!("delete appointments: {e}"))?;

        let mut resolved = Vec::with_capacity(lines.len());
        for line in &lines {
            resolved.push(resolve_line(&conn, line)?);
        }
        let service_total = insert_group_rows(
            &conn,
            &group_id,
            &customer_id,
            &customer_name,
            &resolved,
            start,
            &notes,
            status,
        )?;

        let product_total = insert_sale_lines(
            &conn,
            &group_id,
            &customer_id,
            resolved.first().map(|l| l.personnel_id.as_str()),
            &sale_lines,
        )?;

        // Legacy edit-and-pay: keep the ledger row in step with the new totals.
        conn.execute(
            "UPDATE payment_transactions SET
                service_amount = ?1, product_amount = ?2, grand_total = ?3
             WHERE appointment_group_id = ?4
               AND (payment_type IS NULL OR payment_type = 'appointment')",
            params![
                service_total,
                product_total,
                service_total + product_total,
                group_id
            ],
        )
        .map_err(|e| format!("update payment amounts: {e}"))?;

        Ok((service_total, product_total))
    })();

    let (service_total, product_total) = match result {
        Ok(totals) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
            totals
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    };

    info!(group_id = %group_id, "Appointment group rewritten");
    Ok(serde_json::json!({
        "success": true,
        "groupId": group_id,
        "serviceAmount": service_total,
        "productAmount": product_total,
        "message": "Randevu güncellendi",
    }))
}

/// Insert product sale lines for a group, depleting stock per line.
fn insert_sale_lines(
    conn: &Connection,
    group_id: &str,
    customer_id: &str,
    personnel_id: Option<&str>,
    sale_lines: &[Value],
) -> Result<f64, String> {
    let mut product_total = 0.0;
    let now = Utc::now().to_rfc3339();
    for line in sale_lines {
        let product_id =
            value_str(line, &["productId", "product_id"]).ok_or("Satırda ürün seçilmedi")?;
        let quantity = value_i64(line, &["quantity"]).unwrap_or(0);
        if quantity <= 0 {
            return Err("Ürün adedi pozitif olmalı".to_string());
        }
        let (product_name, unit_price): (String, f64) = conn
            .query_row(
                "SELECT name, price FROM products WHERE id = ?1",
                params![product_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|_| format!("Ürün bulunamadı: {product_id}"))?;
        let total_amount = value_f64(line, &["totalAmount", "total_amount"])
            .unwrap_or(unit_price * quantity as f64);

        stock::deplete(conn, &product_id, quantity)?;

        let sale_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO sales (
                id, product_id, product_name, quantity, total_amount,
                customer_id, personnel_id, appointment_group_id, sale_date
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                sale_id,
                product_id,
                product_name,
                quantity,
                total_amount,
                customer_id,
                personnel_id,
                group_id,
                now,
            ],
        )
        .map_err(|e| format!("insert sale: {e}"))?;
        product_total += total_amount;
    }
    Ok(product_total)
}

/// Restore stock for every product sale linked to a group, then delete them.
fn restore_group_sales(conn: &Connection, group_id: &str) -> Result<(), String> {
    let mut stmt = conn
        .prepare("SELECT product_id, quantity FROM sales WHERE appointment_group_id = ?1")
        .map_err(|e| format!("prepare sales scan: {e}"))?;
    let existing: Vec<(String, i64)> = stmt
        .query_map(params![group_id], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(|e| format!("scan sales: {e}"))?
        .filter_map(|r| r.ok())
        .collect();
    for (product_id, quantity) in existing {
        stock::restore(conn, &product_id, quantity)?;
    }
    conn.execute(
        "DELETE FROM sales WHERE appointment_group_id = ?1",
        params![group_id],
    )
    .map_err(|e| format!("delete sales: {e}"))?;
    Ok(())
}

fn group_statuses(conn: &Connection, group_id: &str) -> Result<Vec<String>, String> {
    let mut stmt = conn
        .prepare("SELECT status FROM appointments WHERE group_id = ?1")
        .map_err(|e| format!("prepare status scan: {e}"))?;
    let statuses = stmt
        .query_map(params![group_id], |row| row.get::<_, String>(0))
        .map_err(|e| format!("scan statuses: {e}"))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(statuses)
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cancel a visit: delete the group's appointments and, for any linked
/// product sales, restore stock before deleting the sale rows.
pub fn cancel_group(db: &DbState, group_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<usize, String> {
        let statuses = group_statuses(&conn, group_id)?;
        if statuses.is_empty() {
            return Err(format!("Randevu grubu bulunamadı: {group_id}"));
        }
        restore_group_sales(&conn, group_id)?;
        let deleted = conn
            .execute(
                "DELETE FROM appointments WHERE group_id = ?1",
                params![group_id],
            )
            .map_err(|e| format!("delete appointments: {e}"))?;
        Ok(deleted)
    })();

    let deleted = match result {
        Ok(n) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
            n
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    };

    info!(group_id = %group_id, deleted = deleted, "Appointment group cancelled");
    Ok(serde_json::json!({
        "success": true,
        "message": "Randevu grubu iptal edildi",
    }))
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

fn appointment_row_to_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(serde_json::json!({
        "id": row.get::<_, String>(0)?,
        "groupId": row.get::<_, String>(1)?,
        "customerId": row.get::<_, String>(2)?,
        "customerName": row.get::<_, String>(3)?,
        "personnelId": row.get::<_, String>(4)?,
        "personnelName": row.get::<_, String>(5)?,
        "serviceId": row.get::<_, String>(6)?,
        "serviceName": row.get::<_, String>(7)?,
        "price": row.get::<_, f64>(8)?,
        "isPackage": row.get::<_, i64>(9)? != 0,
        "isPackageSession": row.get::<_, i64>(10)? != 0,
        "packageSaleId": row.get::<_, Option<String>>(11)?,
        "startAt": row.get::<_, String>(12)?,
        "endAt": row.get::<_, String>(13)?,
        "notes": row.get::<_, String>(14)?,
        "status": row.get::<_, String>(15)?,
    }))
}

const APPOINTMENT_COLS: &str = "id, group_id, customer_id, customer_name, personnel_id, \
     personnel_name, service_id, service_name, price, is_package, \
     is_package_session, package_sale_id, start_at, end_at, notes, status";

/// Rehydrate visit groups for an edit dialog: appointments plus linked
/// product sales for each candidate group id.
pub fn get_groups(db: &DbState, group_ids: &[String]) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut groups = Vec::with_capacity(group_ids.len());
    for group_id in group_ids {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {APPOINTMENT_COLS} FROM appointments
                 WHERE group_id = ?1 ORDER BY start_at"
            ))
            .map_err(|e| format!("prepare appointments: {e}"))?;
        let appointments: Vec<Value> = stmt
            .query_map(params![group_id], |row| appointment_row_to_json(row))
            .map_err(|e| format!("query appointments: {e}"))?
            .filter_map(|r| r.ok())
            .collect();

        let mut stmt = conn
            .prepare(
                "SELECT id, product_id, product_name, quantity, total_amount, sale_date
                 FROM sales WHERE appointment_group_id = ?1 ORDER BY sale_date",
            )
            .map_err(|e| format!("prepare sales: {e}"))?;
        let sales: Vec<Value> = stmt
            .query_map(params![group_id], |row| {
                Ok(serde_json::json!({
                    "id": row.get::<_, String>(0)?,
                    "productId": row.get::<_, String>(1)?,
                    "productName": row.get::<_, String>(2)?,
                    "quantity": row.get::<_, i64>(3)?,
                    "totalAmount": row.get::<_, f64>(4)?,
                    "saleDate": row.get::<_, String>(5)?,
                }))
            })
            .map_err(|e| format!("query sales: {e}"))?
            .filter_map(|r| r.ok())
            .collect();

        groups.push(serde_json::json!({
            "groupId": group_id,
            "appointments": appointments,
            "sales": sales,
        }));
    }
    Ok(Value::Array(groups))
}

/// Calendar read: appointments whose start falls inside `[from, to)`.
pub fn list_between(db: &DbState, from: &str, to: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {APPOINTMENT_COLS} FROM appointments
             WHERE start_at >= ?1 AND start_at < ?2
             ORDER BY start_at"
        ))
        .map_err(|e| format!("prepare range: {e}"))?;
    let rows: Vec<Value> = stmt
        .query_map(params![from, to], |row| appointment_row_to_json(row))
        .map_err(|e| format!("query range: {e}"))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(Value::Array(rows))
}

// ===========================================================================
// Tests
// ===========================================================================
