// =============================================================================
// INVENTORY LEDGER
// =============================================================================
// Per-product stock counter, mutated only inside a caller-owned transaction.
//
// `reserve` takes a row lock (SELECT ... FOR UPDATE) before reading stock.
// Without it two concurrent orders can read the same stock value, both see
// enough inventory and both decrement: oversell. With it the second reader
// blocks until the first transaction commits or rolls back, then sees the
// updated value.
//
// Callers holding several product locks in one transaction must acquire
// them in ascending product id (see orders.rs).
// =============================================================================

use rust_decimal::Decimal;
use sqlx::PgConnection;

use crate::error::{AppError, AppResult};

/// Outcome of a successful reservation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reservation {
    /// Unit price read under the row lock; becomes the order line snapshot
    pub unit_price: Decimal,

    /// Stock left once the reservation commits
    pub remaining: i32,
}

/// Lock a product row, check availability and decrement its stock.
///
/// Returns the unit price snapshot read under the same lock.
///
/// # Errors
/// * `ProductNotFound` - no such product
/// * `CorruptStock` - stored stock is negative
/// * `OutOfStock` - `quantity` exceeds the locked stock
pub async fn reserve(
    conn: &mut PgConnection,
    product_id: i64,
    quantity: i32,
) -> AppResult<Reservation> {
    let row: Option<(Decimal, i32)> = sqlx::query_as(
        r#"
        SELECT price, stock
        FROM products
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(product_id)
    .fetch_optional(&mut *conn)
    .await?;

    let (price, stock) = row.ok_or(AppError::ProductNotFound(product_id))?;
    let remaining = remaining_after(product_id, stock, quantity)?;

    sqlx::query(
        r#"
        UPDATE products
        SET stock = $1, updated_at = NOW()
        WHERE id = $2
        "#,
    )
    .bind(remaining)
    .bind(product_id)
    .execute(&mut *conn)
    .await?;

    tracing::debug!(product_id, quantity, remaining, "Stock reserved");

    Ok(Reservation {
        unit_price: price,
        remaining,
    })
}

/// Give `quantity` units back to a product.
///
/// Used as compensation when an order is deleted; the foreign key on the
/// order line is the only existence guarantee.
pub async fn release(conn: &mut PgConnection, product_id: i64, quantity: i32) -> AppResult<()> {
    sqlx::query(
        r#"
        UPDATE products
        SET stock = stock + $1, updated_at = NOW()
        WHERE id = $2
        "#,
    )
    .bind(quantity)
    .bind(product_id)
    .execute(&mut *conn)
    .await?;

    tracing::debug!(product_id, quantity, "Stock released");

    Ok(())
}

/// Stock left after taking `requested` units out of `stock`.
fn remaining_after(product_id: i64, stock: i32, requested: i32) -> AppResult<i32> {
    if stock < 0 {
        return Err(AppError::CorruptStock {
            product_id,
            stock: i64::from(stock),
        });
    }

    if requested > stock {
        return Err(AppError::OutOfStock {
            product_id,
            available: stock,
            requested,
        });
    }

    Ok(stock - requested)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_after_exact_depletion() {
        assert_eq!(remaining_after(1, 2, 2).unwrap(), 0);
        assert_eq!(remaining_after(1, 5, 3).unwrap(), 2);
    }

    #[test]
    fn test_remaining_after_rejects_oversell() {
        match remaining_after(9, 1, 2) {
            Err(AppError::OutOfStock {
                product_id,
                available,
                requested,
            }) => {
                assert_eq!(product_id, 9);
                assert_eq!(available, 1);
                assert_eq!(requested, 2);
            }
            other => panic!("expected OutOfStock, got {:?}", other),
        }
    }

    #[test]
    fn test_remaining_after_flags_negative_stock() {
        assert!(matches!(
            remaining_after(4, -1, 1),
            Err(AppError::CorruptStock { product_id: 4, stock: -1 })
        ));
    }
}
