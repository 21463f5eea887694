//! Appointment-group commands: the calendar and edit-dialog entry points.

use serde_json::Value;

use super::{arg0_as_string, fold};
use crate::db::DbState;
use crate::{appointments, value_str};

/// `createAppointmentGroup(customerId, lines[], startDateTime, notes)`
pub fn create_appointment_group(db: &DbState, payload: Option<Value>) -> Value {
    let payload = match payload {
        Some(p) => p,
        None => return missing_payload(),
    };
    fold(
        "create_appointment_group",
        appointments::create_group(db, &payload),
    )
}

/// `fullUpdateAppointmentGroup(groupId, customerId, lines[], saleLines[], startDateTime, notes)`
pub fn full_update_appointment_group(db: &DbState, payload: Option<Value>) -> Value {
    let payload = match payload {
        Some(p) => p,
        None => return missing_payload(),
    };
    fold(
        "full_update_appointment_group",
        appointments::full_update_group(db, &payload),
    )
}

/// `cancelAppointmentGroup(groupId)` — accepts a bare id or `{groupId}`.
pub fn cancel_appointment_group(db: &DbState, arg0: Option<Value>) -> Value {
    let group_id = match arg0_as_string(arg0, &["groupId", "group_id", "id"]) {
        Some(id) => id,
        None => return fold("cancel_appointment_group", Err("Randevu grubu seçilmedi".into())),
    };
    fold(
        "cancel_appointment_group",
        appointments::cancel_group(db, &group_id),
    )
}

/// Rehydration read for the edit dialog: `{groupIds: [...]}`.
pub fn get_appointment_groups(db: &DbState, payload: Option<Value>) -> Value {
    let group_ids: Vec<String> = payload
        .as_ref()
        .and_then(|p| p.get("groupIds").or_else(|| p.get("group_ids")))
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    if group_ids.is_empty() {
        return fold("get_appointment_groups", Err("Randevu grubu seçilmedi".into()));
    }
    fold(
        "get_appointment_groups",
        appointments::get_groups(db, &group_ids),
    )
}

/// Calendar range read: `{from, to}` as RFC 3339 instants.
pub fn list_appointments(db: &DbState, payload: Option<Value>) -> Value {
    let payload = payload.unwrap_or_default();
    let from = value_str(&payload, &["from", "start"]);
    let to = value_str(&payload, &["to", "end"]);
    match (from, to) {
        (Some(from), Some(to)) => fold(
            "list_appointments",
            appointments::list_between(db, &from, &to),
        ),
        _ => fold("list_appointments", Err("Tarih aralığı zorunlu".into())),
    }
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
            "INSERT INTO customers (id, name) VALUES ('c-1', 'Ayşe');
             INSERT INTO personnel (id, name) VALUES ('per-1', 'Elif');
             INSERT INTO services (id, name, duration_minutes, price)
                VALUES ('srv-1', 'Manikür', 30, 200.0);",
        )
        .expect("seed");
        DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }
    }

    #[test]
    fn test_create_and_cancel_through_commands() {
        let db = test_db();
        let created = create_appointment_group(
            &db,
            Some(serde_json::json!({
                "customerId": "c-1",
                "startDateTime": "2024-03-01T10:00:00Z",
                "lines": [
                    { "personnelId": "per-1", "serviceId": "srv-1", "price": 200.0 },
                ],
            })),
        );
        assert_eq!(created["success"], true);
        let group_id = created["groupId"].as_str().unwrap().to_string();

        // Bare-string argument form.
        let cancelled = cancel_appointment_group(&db, Some(serde_json::json!(group_id)));
        assert_eq!(cancelled["success"], true);
    }

    #[test]
    fn test_errors_fold_to_success_false() {
        let db = test_db();
        let result = create_appointment_group(
            &db,
            Some(serde_json::json!({
                "customerId": "c-missing",
                "startDateTime": "2024-03-01T10:00:00Z",
                "lines": [
                    { "personnelId": "per-1", "serviceId": "srv-1", "price": 200.0 },
                ],
            })),
        );
        assert_eq!(result["success"], false);
        assert!(result["message"]
            .as_str()
            .unwrap()
            .contains("Müşteri bulunamadı"));

        let result = create_appointment_group(&db, None);
        assert_eq!(result["success"], false);
    }

    #[test]
    fn test_get_appointment_groups_requires_ids() {
        let db = test_db();
        let result = get_appointment_groups(&db, Some(serde_json::json!({ "groupIds": [] })));
        assert_eq!(result["success"], false);
    }
}
