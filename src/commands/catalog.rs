//! Reference-data commands: customers, personnel, services, packages,
//! products, stock intake, business hours.

use serde_json::Value;

use super::{arg0_as_string, fold};
use crate::db::DbState;
use crate::{catalog, db, stock, value_i64, value_str};

pub fn create_customer(db: &DbState, payload: Option<Value>) -> Value {
    fold(
        "create_customer",
        catalog::create_customer(db, &payload.unwrap_or_default()),
    )
}

pub fn list_customers(db: &DbState) -> Value {
    fold("list_customers", catalog::list_customers(db))
}

/// `{customerId, name}`
pub fn rename_customer(db: &DbState, payload: Option<Value>) -> Value {
    let payload = payload.unwrap_or_default();
    let id = value_str(&payload, &["customerId", "customer_id", "id"]);
    let name = value_str(&payload, &["name"]);
    match (id, name) {
        (Some(id), Some(name)) => fold("rename_customer", catalog::rename_customer(db, &id, &name)),
        _ => fold("rename_customer", Err("Müşteri ve yeni ad zorunlu".into())),
    }
}

pub fn create_personnel(db: &DbState, payload: Option<Value>) -> Value {
    fold(
        "create_personnel",
        catalog::create_personnel(db, &payload.unwrap_or_default()),
    )
}

pub fn list_personnel(db: &DbState) -> Value {
    fold("list_personnel", catalog::list_personnel(db))
}

/// `{personnelId, name}`
pub fn rename_personnel(db: &DbState, payload: Option<Value>) -> Value {
    let payload = payload.unwrap_or_default();
    let id = value_str(&payload, &["personnelId", "personnel_id", "id"]);
    let name = value_str(&payload, &["name"]);
    match (id, name) {
        (Some(id), Some(name)) => {
            fold("rename_personnel", catalog::rename_personnel(db, &id, &name))
        }
        _ => fold("rename_personnel", Err("Personel ve yeni ad zorunlu".into())),
    }
}

pub fn create_service_category(db: &DbState, payload: Option<Value>) -> Value {
    fold(
        "create_service_category",
        catalog::create_service_category(db, &payload.unwrap_or_default()),
    )
}

pub fn create_service(db: &DbState, payload: Option<Value>) -> Value {
    fold(
        "create_service",
        catalog::create_service(db, &payload.unwrap_or_default()),
    )
}

pub fn list_services(db: &DbState) -> Value {
    fold("list_services", catalog::list_services(db))
}

pub fn create_package(db: &DbState, payload: Option<Value>) -> Value {
    fold(
        "create_package",
        catalog::create_package(db, &payload.unwrap_or_default()),
    )
}

pub fn list_packages(db: &DbState) -> Value {
    fold("list_packages", catalog::list_packages(db))
}

pub fn create_product(db: &DbState, payload: Option<Value>) -> Value {
    fold(
        "create_product",
        catalog::create_product(db, &payload.unwrap_or_default()),
    )
}

pub fn list_products(db: &DbState) -> Value {
    fold("list_products", catalog::list_products(db))
}

/// Stock intake: `{productId, quantity, purchaseDate?}`.
pub fn add_stock_batch(db: &DbState, payload: Option<Value>) -> Value {
    let payload = payload.unwrap_or_default();
    let result = (|| -> Result<Value, String> {
        let product_id =
            value_str(&payload, &["productId", "product_id"]).ok_or("Ürün seçilmedi")?;
        let quantity = value_i64(&payload, &["quantity"]).ok_or("Alım miktarı zorunlu")?;
        let purchase_date = value_str(&payload, &["purchaseDate", "purchase_date"]);
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        let batch_id = stock::add_batch(&conn, &product_id, quantity, purchase_date.as_deref())?;
        Ok(serde_json::json!({ "success": true, "batchId": batch_id }))
    })();
    fold("add_stock_batch", result)
}

pub fn get_business_hours(state: &DbState) -> Value {
    let result = (|| -> Result<Value, String> {
        let conn = state.conn.lock().map_err(|e| e.to_string())?;
        Ok(db::get_business_hours(&conn))
    })();
    fold("get_business_hours", result)
}

pub fn set_business_hours(state: &DbState, payload: Option<Value>) -> Value {
    let hours = match payload {
        Some(p) if p.is_object() => p,
        _ => return fold("set_business_hours", Err("Geçersiz çalışma saatleri".into())),
    };
    let result = (|| -> Result<Value, String> {
        let conn = state.conn.lock().map_err(|e| e.to_string())?;
        db::set_business_hours(&conn, &hours)?;
        Ok(serde_json::json!({ "success": true }))
    })();
    fold("set_business_hours", result)
}

/// Back-compat alias used by older dialogs that send a bare product id.
pub fn product_stock(state: &DbState, arg0: Option<Value>) -> Value {
    let product_id = match arg0_as_string(arg0, &["productId", "product_id", "id"]) {
        Some(id) => id,
        None => return fold("product_stock", Err("Ürün seçilmedi".into())),
    };
    let result = (|| -> Result<Value, String> {
        let conn = state.conn.lock().map_err(|e| e.to_string())?;
        let on_hand = stock::available(&conn, &product_id)?;
        Ok(serde_json::json!({ "productId": product_id, "stock": on_hand }))
    })();
    fold("product_stock", result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        crate::db::run_migrations_for_test(&conn);
        DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }
    }

    #[test]
    fn test_product_and_stock_commands() {
        let db = test_db();
        let created = create_product(&db, Some(serde_json::json!({ "name": "Krem", "price": 90.0 })));
        assert_eq!(created["success"], true);
        let product_id = created["productId"].as_str().unwrap().to_string();

        let added = add_stock_batch(
            &db,
            Some(serde_json::json!({ "productId": product_id, "quantity": 12 })),
        );
        assert_eq!(added["success"], true);

        let stock = product_stock(&db, Some(serde_json::json!(product_id)));
        assert_eq!(stock["stock"], 12);

        let products = list_products(&db);
        assert_eq!(products[0]["stock"], 12);
    }

    #[test]
    fn test_business_hours_command_roundtrip() {
        let db = test_db();
        let hours = get_business_hours(&db);
        assert_eq!(hours["open"], "09:00");

        let updated = set_business_hours(
            &db,
            Some(serde_json::json!({ "open": "08:30", "close": "21:00", "closedDays": [] })),
        );
        assert_eq!(updated["success"], true);
        let hours = get_business_hours(&db);
        assert_eq!(hours["open"], "08:30");

        let bad = set_business_hours(&db, Some(serde_json::json!("not-hours")));
        assert_eq!(bad["success"], false);
    }
}
