//! Product stock ledger.
//!
//! Each product carries an ordered list of purchase batches with a remaining
//! quantity. Selling depletes the oldest batch first (FIFO); deleting a sale
//! restores the most recent batch first (LIFO), so a sale followed by its
//! deletion is an exact round trip.
//!
//! All functions take a `&Connection` rather than `DbState` so they join
//! whatever transaction the caller has open — stock moves are never committed
//! separately from the sale that caused them.

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::warn;
use uuid::Uuid;

/// Total units currently on hand for a product.
pub fn available(conn: &Connection, product_id: &str) -> Result<i64, String> {
    conn.query_row(
        "SELECT COALESCE(SUM(remaining), 0) FROM stock_batches WHERE product_id = ?1",
        params![product_id],
        |row| row.get(0),
    )
    .map_err(|e| format!("stock available: {e}"))
}

/// Record a purchase batch. Returns the new batch id.
pub fn add_batch(
    conn: &Connection,
    product_id: &str,
    quantity: i64,
    purchase_date: Option<&str>,
) -> Result<String, String> {
    if quantity <= 0 {
        return Err("Alım miktarı pozitif olmalı".to_string());
    }
    let exists: bool = conn
        .query_row(
            "SELECT 1 FROM products WHERE id = ?1",
            params![product_id],
            |_| Ok(true),
        )
        .unwrap_or(false);
    if !exists {
        return Err(format!("Ürün bulunamadı: {product_id}"));
    }

    let batch_id = Uuid::new_v4().to_string();
    let date = purchase_date
        .map(|d| d.to_string())
        .unwrap_or_else(|| Utc::now().to_rfc3339());
    conn.execute(
        "INSERT INTO stock_batches (id, product_id, purchase_date, quantity, remaining)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![batch_id, product_id, date, quantity],
    )
    .map_err(|e| format!("insert stock batch: {e}"))?;
    Ok(batch_id)
}

/// Deplete `quantity` units FIFO (oldest purchase date first).
///
/// Fails without touching any batch when the product does not have enough
/// stock on hand; the caller's transaction is expected to roll back.
pub fn deplete(conn: &Connection, product_id: &str, quantity: i64) -> Result<(), String> {
    if quantity <= 0 {
        return Err("Satış miktarı pozitif olmalı".to_string());
    }

    let on_hand = available(conn, product_id)?;
    if on_hand < quantity {
        let name: String = conn
            .query_row(
                "SELECT name FROM products WHERE id = ?1",
                params![product_id],
                |row| row.get(0),
            )
            .unwrap_or_else(|_| product_id.to_string());
        return Err(format!(
            "Yetersiz stok: {name} (istenen {quantity}, mevcut {on_hand})"
        ));
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, remaining FROM stock_batches
             WHERE product_id = ?1 AND remaining > 0
             ORDER BY purchase_date ASC, id ASC",
        )
        .map_err(|e| format!("prepare batch scan: {e}"))?;
    let batches: Vec<(String, i64)> = stmt
        .query_map(params![product_id], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(|e| format!("scan batches: {e}"))?
        .filter_map(|r| r.ok())
        .collect();

    let mut left = quantity;
    for (batch_id, remaining) in batches {
        if left == 0 {
            break;
        }
        let take = left.min(remaining);
        conn.execute(
            "UPDATE stock_batches SET remaining = remaining - ?1 WHERE id = ?2",
            params![take, batch_id],
        )
        .map_err(|e| format!("deplete batch: {e}"))?;
        left -= take;
    }

    Ok(())
}

/// Restore `quantity` units LIFO (most recent batch first), the reverse of
/// [`deplete`]. Batches are topped back up to their original quantity; any
/// surplus beyond that lands on the newest batch so the total never drifts.
pub fn restore(conn: &Connection, product_id: &str, quantity: i64) -> Result<(), String> {
    if quantity <= 0 {
        return Err("İade miktarı pozitif olmalı".to_string());
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, quantity, remaining FROM stock_batches
             WHERE product_id = ?1
             ORDER BY purchase_date DESC, id DESC",
        )
        .map_err(|e| format!("prepare batch scan: {e}"))?;
    let batches: Vec<(String, i64, i64)> = stmt
        .query_map(params![product_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })
        .map_err(|e| format!("scan batches: {e}"))?
        .filter_map(|r| r.ok())
        .collect();

    if batches.is_empty() {
        return Err(format!("Ürünün stok kaydı yok: {product_id}"));
    }

    let mut left = quantity;
    for (batch_id, total, remaining) in &batches {
        if left == 0 {
            break;
        }
        let headroom = total - remaining;
        if headroom <= 0 {
            continue;
        }
        let put = left.min(headroom);
        conn.execute(
            "UPDATE stock_batches SET remaining = remaining + ?1 WHERE id = ?2",
            params![put, batch_id],
        )
        .map_err(|e| format!("restore batch: {e}"))?;
        left -= put;
    }

    if left > 0 {
        // More restored than was ever depleted (manual stock edits in
        // between). Keep the totals honest on the newest batch.
        warn!(
            product_id = %product_id,
            surplus = left,
            "Stock restore exceeded batch headroom"
        );
        conn.execute(
            "UPDATE stock_batches SET remaining = remaining + ?1, quantity = quantity + ?1
             WHERE id = ?2",
            params![left, batches[0].0],
        )
        .map_err(|e| format!("restore surplus: {e}"))?;
    }

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::run_migrations_for_test(&conn);
        conn.execute(
            "INSERT INTO products (id, name, price) VALUES ('p-1', 'Şampuan', 120.0)",
            [],
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_deplete_restore_round_trip() {
        let conn = test_conn();
        add_batch(&conn, "p-1", 5, Some("2024-01-05T00:00:00Z")).unwrap();

        assert_eq!(available(&conn, "p-1").unwrap(), 5);
        deplete(&conn, "p-1", 5).unwrap();
        assert_eq!(available(&conn, "p-1").unwrap(), 0);
        restore(&conn, "p-1", 5).unwrap();
        assert_eq!(available(&conn, "p-1").unwrap(), 5);
    }

    #[test]
    fn test_deplete_is_fifo_across_batches() {
        let conn = test_conn();
        add_batch(&conn, "p-1", 3, Some("2024-01-01T00:00:00Z")).unwrap();
        add_batch(&conn, "p-1", 4, Some("2024-02-01T00:00:00Z")).unwrap();

        deplete(&conn, "p-1", 5).unwrap();

        // Oldest batch fully consumed, newer one partially.
        let (old_rem, new_rem): (i64, i64) = conn
            .query_row(
                "SELECT
                    (SELECT remaining FROM stock_batches WHERE purchase_date = '2024-01-01T00:00:00Z'),
                    (SELECT remaining FROM stock_batches WHERE purchase_date = '2024-02-01T00:00:00Z')",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(old_rem, 0);
        assert_eq!(new_rem, 2);
    }

    #[test]
    fn test_restore_is_lifo() {
        let conn = test_conn();
        add_batch(&conn, "p-1", 3, Some("2024-01-01T00:00:00Z")).unwrap();
        add_batch(&conn, "p-1", 4, Some("2024-02-01T00:00:00Z")).unwrap();
        deplete(&conn, "p-1", 6).unwrap();

        restore(&conn, "p-1", 3).unwrap();

        // Newest batch refilled first.
        let new_rem: i64 = conn
            .query_row(
                "SELECT remaining FROM stock_batches WHERE purchase_date = '2024-02-01T00:00:00Z'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(new_rem, 4);
        let old_rem: i64 = conn
            .query_row(
                "SELECT remaining FROM stock_batches WHERE purchase_date = '2024-01-01T00:00:00Z'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(old_rem, 0);
    }

    #[test]
    fn test_deplete_insufficient_stock_leaves_batches_untouched() {
        let conn = test_conn();
        add_batch(&conn, "p-1", 2, None).unwrap();

        let err = deplete(&conn, "p-1", 3).unwrap_err();
        assert!(err.contains("Yetersiz stok"), "got: {err}");
        assert!(err.contains("Şampuan"), "got: {err}");
        assert_eq!(available(&conn, "p-1").unwrap(), 2);
    }

    #[test]
    fn test_add_batch_unknown_product_rejected() {
        let conn = test_conn();
        let err = add_batch(&conn, "nope", 5, None).unwrap_err();
        assert!(err.contains("Ürün bulunamadı"), "got: {err}");
    }
}
