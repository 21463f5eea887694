//! Reference collections: customers, personnel, services, packages, products.
//!
//! Mostly plain create/list plumbing for the dialogs, plus the snapshot
//! rename cascade: operational rows carry denormalized name copies
//! (customer_name, personnel_name, service_name) so list screens never join;
//! a rename therefore fans out to every snapshot column in one transaction.

use rusqlite::params;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::db::DbState;
use crate::{value_f64, value_i64, value_str};

/// Strip a phone number down to its digits.
pub(crate) fn normalize_phone(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>()
}

// ---------------------------------------------------------------------------
// Customers
// ---------------------------------------------------------------------------

pub fn create_customer(db: &DbState, payload: &Value) -> Result<Value, String> {
    let name = value_str(payload, &["name"]).ok_or("Müşteri adı zorunlu")?;
    let phone_raw = value_str(payload, &["phone"]).unwrap_or_default();
    let phone = normalize_phone(&phone_raw);
    if !phone_raw.is_empty() && (phone.len() < 7 || phone.len() > 15) {
        return Err(format!("Geçersiz telefon numarası: {phone_raw}"));
    }
    let notes = value_str(payload, &["notes"]).unwrap_or_default();

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO customers (id, name, phone, notes) VALUES (?1, ?2, ?3, ?4)",
        params![id, name, phone, notes],
    )
    .map_err(|e| format!("insert customer: {e}"))?;

    info!(customer_id = %id, "Customer created");
    Ok(serde_json::json!({ "success": true, "customerId": id }))
}

pub fn list_customers(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare("SELECT id, name, phone, notes, created_at FROM customers ORDER BY name")
        .map_err(|e| format!("prepare customers: {e}"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "phone": row.get::<_, String>(2)?,
                "notes": row.get::<_, String>(3)?,
                "createdAt": row.get::<_, String>(4)?,
            }))
        })
        .map_err(|e| format!("query customers: {e}"))?
        .filter_map(|r| r.ok())
        .collect::<Vec<_>>();
    Ok(Value::Array(rows))
}

/// Rename a customer and cascade to every denormalized snapshot.
pub fn rename_customer(db: &DbState, customer_id: &str, new_name: &str) -> Result<Value, String> {
    let new_name = new_name.trim();
    if new_name.is_empty() {
        return Err("Müşteri adı zorunlu".to_string());
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(), String> {
        let updated = conn
            .execute(
                "UPDATE customers SET name = ?1 WHERE id = ?2",
                params![new_name, customer_id],
            )
            .map_err(|e| format!("update customer: {e}"))?;
        if updated == 0 {
            return Err(format!("Müşteri bulunamadı: {customer_id}"));
        }
        conn.execute(
            "UPDATE appointments SET customer_name = ?1 WHERE customer_id = ?2",
            params![new_name, customer_id],
        )
        .map_err(|e| format!("cascade appointments: {e}"))?;
        conn.execute(
            "UPDATE package_sales SET customer_name = ?1 WHERE customer_id = ?2",
            params![new_name, customer_id],
        )
        .map_err(|e| format!("cascade package sales: {e}"))?;
        conn.execute(
            "UPDATE payment_transactions SET customer_name = ?1 WHERE customer_id = ?2",
            params![new_name, customer_id],
        )
        .map_err(|e| format!("cascade payments: {e}"))?;
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

    info!(customer_id = %customer_id, "Customer renamed");
    Ok(serde_json::json!({ "success": true }))
}

// ---------------------------------------------------------------------------
// Personnel
// ---------------------------------------------------------------------------

pub fn create_personnel(db: &DbState, payload: &Value) -> Result<Value, String> {
    let name = value_str(payload, &["name"]).ok_or("Personel adı zorunlu")?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO personnel (id, name) VALUES (?1, ?2)",
        params![id, name],
    )
    .map_err(|e| format!("insert personnel: {e}"))?;
    Ok(serde_json::json!({ "success": true, "personnelId": id }))
}

pub fn list_personnel(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare("SELECT id, name, created_at FROM personnel ORDER BY name")
        .map_err(|e| format!("prepare personnel: {e}"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "createdAt": row.get::<_, String>(2)?,
            }))
        })
        .map_err(|e| format!("query personnel: {e}"))?
        .filter_map(|r| r.ok())
        .collect::<Vec<_>>();
    Ok(Value::Array(rows))
}

/// Rename a personnel record and cascade to appointment snapshots.
pub fn rename_personnel(db: &DbState, personnel_id: &str, new_name: &str) -> Result<Value, String> {
    let new_name = new_name.trim();
    if new_name.is_empty() {
        return Err("Personel adı zorunlu".to_string());
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(), String> {
        let updated = conn
            .execute(
                "UPDATE personnel SET name = ?1 WHERE id = ?2",
                params![new_name, personnel_id],
            )
            .map_err(|e| format!("update personnel: {e}"))?;
        if updated == 0 {
            return Err(format!("Personel bulunamadı: {personnel_id}"));
        }
        conn.execute(
            "UPDATE appointments SET personnel_name = ?1 WHERE personnel_id = ?2",
            params![new_name, personnel_id],
        )
        .map_err(|e| format!("cascade appointments: {e}"))?;
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

    info!(personnel_id = %personnel_id, "Personnel renamed");
    Ok(serde_json::json!({ "success": true }))
}

// ---------------------------------------------------------------------------
// Services and categories
// ---------------------------------------------------------------------------

pub fn create_service_category(db: &DbState, payload: &Value) -> Result<Value, String> {
    let name = value_str(payload, &["name"]).ok_or("Kategori adı zorunlu")?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO service_categories (id, name) VALUES (?1, ?2)",
        params![id, name],
    )
    .map_err(|e| format!("insert category: {e}"))?;
    Ok(serde_json::json!({ "success": true, "categoryId": id }))
}

pub fn create_service(db: &DbState, payload: &Value) -> Result<Value, String> {
    let name = value_str(payload, &["name"]).ok_or("Hizmet adı zorunlu")?;
    let duration = value_i64(payload, &["durationMinutes", "duration_minutes", "duration"])
        .ok_or("Hizmet süresi zorunlu")?;
    if duration <= 0 {
        return Err("Hizmet süresi pozitif olmalı".to_string());
    }
    let price = value_f64(payload, &["price"]).unwrap_or(0.0);
    if price < 0.0 {
        return Err("Hizmet fiyatı negatif olamaz".to_string());
    }
    let category_id = value_str(payload, &["categoryId", "category_id"]);

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO services (id, category_id, name, duration_minutes, price)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, category_id, name, duration, price],
    )
    .map_err(|e| format!("insert service: {e}"))?;
    Ok(serde_json::json!({ "success": true, "serviceId": id }))
}

pub fn list_services(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.name, s.duration_minutes, s.price, c.name
             FROM services s LEFT JOIN service_categories c ON c.id = s.category_id
             ORDER BY s.name",
        )
        .map_err(|e| format!("prepare services: {e}"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "durationMinutes": row.get::<_, i64>(2)?,
                "price": row.get::<_, f64>(3)?,
                "category": row.get::<_, Option<String>>(4)?,
            }))
        })
        .map_err(|e| format!("query services: {e}"))?
        .filter_map(|r| r.ok())
        .collect::<Vec<_>>();
    Ok(Value::Array(rows))
}

// ---------------------------------------------------------------------------
// Packages
// ---------------------------------------------------------------------------

pub fn create_package(db: &DbState, payload: &Value) -> Result<Value, String> {
    let name = value_str(payload, &["name"]).ok_or("Paket adı zorunlu")?;
    let price = value_f64(payload, &["price"]).ok_or("Paket fiyatı zorunlu")?;
    if price <= 0.0 {
        return Err("Paket fiyatı pozitif olmalı".to_string());
    }
    let session_count = value_i64(payload, &["sessionCount", "session_count"])
        .ok_or("Seans sayısı zorunlu")?;
    if session_count <= 0 {
        return Err("Seans sayısı pozitif olmalı".to_string());
    }
    let service_ids = payload
        .get("serviceIds")
        .or_else(|| payload.get("service_ids"))
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if service_ids.is_empty() {
        return Err("Paket en az bir hizmet içermeli".to_string());
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    for sid in &service_ids {
        let exists: bool = conn
            .query_row("SELECT 1 FROM services WHERE id = ?1", params![sid], |_| {
                Ok(true)
            })
            .unwrap_or(false);
        if !exists {
            return Err(format!("Hizmet bulunamadı: {sid}"));
        }
    }

    let id = Uuid::new_v4().to_string();
    let ids_json = serde_json::to_string(&service_ids).map_err(|e| e.to_string())?;
    conn.execute(
        "INSERT INTO packages (id, name, price, session_count, service_ids)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, name, price, session_count, ids_json],
    )
    .map_err(|e| format!("insert package: {e}"))?;
    Ok(serde_json::json!({ "success": true, "packageId": id }))
}

pub fn list_packages(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare("SELECT id, name, price, session_count, service_ids FROM packages ORDER BY name")
        .map_err(|e| format!("prepare packages: {e}"))?;
    let rows = stmt
        .query_map([], |row| {
            let ids_raw: String = row.get(4)?;
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "price": row.get::<_, f64>(2)?,
                "sessionCount": row.get::<_, i64>(3)?,
                "serviceIds": serde_json::from_str::<Value>(&ids_raw).unwrap_or_default(),
            }))
        })
        .map_err(|e| format!("query packages: {e}"))?
        .filter_map(|r| r.ok())
        .collect::<Vec<_>>();
    Ok(Value::Array(rows))
}

// ---------------------------------------------------------------------------
// Products
// ---------------------------------------------------------------------------

pub fn create_product(db: &DbState, payload: &Value) -> Result<Value, String> {
    let name = value_str(payload, &["name"]).ok_or("Ürün adı zorunlu")?;
    let price = value_f64(payload, &["price"]).unwrap_or(0.0);
    if price < 0.0 {
        return Err("Ürün fiyatı negatif olamaz".to_string());
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO products (id, name, price) VALUES (?1, ?2, ?3)",
        params![id, name, price],
    )
    .map_err(|e| format!("insert product: {e}"))?;
    Ok(serde_json::json!({ "success": true, "productId": id }))
}

/// List products with their current on-hand stock total.
pub fn list_products(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(
            "SELECT p.id, p.name, p.price,
                    COALESCE((SELECT SUM(b.remaining) FROM stock_batches b
                              WHERE b.product_id = p.id), 0)
             FROM products p ORDER BY p.name",
        )
        .map_err(|e| format!("prepare products: {e}"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "price": row.get::<_, f64>(2)?,
                "stock": row.get::<_, i64>(3)?,
            }))
        })
        .map_err(|e| format!("query products: {e}"))?
        .filter_map(|r| r.ok())
        .collect::<Vec<_>>();
    Ok(Value::Array(rows))
}

// ===========================================================================
// Tests
// ===========================================================================
