//! Package-sale commands: selling, payment recording, cancellation.

use serde_json::Value;

use super::{arg0_as_string, fold};
use crate::db::DbState;
use crate::{packages, value_str};

/// Sell a package to a customer, optionally with an initial payment.
pub fn create_package_sale(db: &DbState, payload: Option<Value>) -> Value {
    let payload = match payload {
        Some(p) => p,
        None => return missing_payload(),
    };
    fold("create_package_sale", packages::create_sale(db, &payload))
}

/// `recordOrUpdatePackagePayments(packageSaleId, editedPayments[], newPayment?)`
pub fn record_or_update_package_payments(db: &DbState, payload: Option<Value>) -> Value {
    let payload = match payload {
        Some(p) => p,
        None => return missing_payload(),
    };
    fold(
        "record_or_update_package_payments",
        packages::record_or_update_payments(db, &payload),
    )
}

/// Cancel an unused package sale. Accepts a bare id or `{packageSaleId}`.
pub fn cancel_package_sale(db: &DbState, arg0: Option<Value>) -> Value {
    let sale_id = match arg0_as_string(arg0, &["packageSaleId", "package_sale_id", "id"]) {
        Some(id) => id,
        None => return fold("cancel_package_sale", Err("Paket satışı seçilmedi".into())),
    };
    fold("cancel_package_sale", packages::cancel_sale(db, &sale_id))
}

/// List package sales: `{customerId?}`.
pub fn list_package_sales(db: &DbState, payload: Option<Value>) -> Value {
    let payload = payload.unwrap_or_default();
    let customer_id = value_str(&payload, &["customerId", "customer_id"]);
    fold(
        "list_package_sales",
        packages::list_sales(db, customer_id.as_deref()),
    )
}

fn missing_payload() -> Value {
    serde_json::json!({ "success": false, "message": "Eksik istek verisi" })
}
