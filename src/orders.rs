// =============================================================================
// ORDER TRANSACTION MANAGER
// =============================================================================
// Places, cancels and updates orders.
//
// INVARIANTS:
// - An order and its lines are written in the same transaction as the stock
//   decrements; a failure anywhere rolls all of it back.
// - The total is derived from prices read under the product row locks.
//   Nothing monetary is taken from the request body.
// - Product locks are taken in ascending product id, whatever the order of
//   the lines in the request, so two orders sharing products cannot deadlock.
// =============================================================================

use rust_decimal::Decimal;
use sqlx::PgPool;

use crate::error::{AppError, AppResult};
use crate::inventory;
use crate::models::{
    CreateOrderRequest, NewOrder, Order, OrderDetails, OrderLineDetail, OrderLineInput,
    OrderStatus, OrderSummary, PaymentMode, PlacedOrder, RestoredLine, StockLevel,
};

#[derive(Clone)]
pub struct OrderManager {
    pool: PgPool,
}

impl OrderManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // -------------------------------------------------------------------------
    // VALIDATION
    // -------------------------------------------------------------------------
    /// Check the raw request and turn it into a `NewOrder`.
    ///
    /// Runs before any database work, so rejected requests never open a
    /// transaction.
    pub fn validate(request: CreateOrderRequest) -> AppResult<NewOrder> {
        let (Some(client_id), Some(mode), Some(address), Some(items)) = (
            request.id_client,
            request.mode_paiement,
            request.adresse_livraison,
            request.produits,
        ) else {
            return Err(AppError::BadRequest(
                "Incomplete order: 'id_client', 'mode_paiement', 'adresse_livraison' and a non-empty 'produits' array are required".into(),
            ));
        };

        if items.is_empty() || address.trim().is_empty() {
            return Err(AppError::BadRequest(
                "Incomplete order: 'adresse_livraison' and a non-empty 'produits' array are required".into(),
            ));
        }

        let payment_mode =
            PaymentMode::parse(&mode).ok_or_else(|| AppError::InvalidPaymentMode(mode.clone()))?;

        let lines = items
            .into_iter()
            .enumerate()
            .map(|(position, item)| {
                let product_id = item.id_produit.ok_or_else(|| {
                    AppError::BadRequest(format!("Line {}: 'id_produit' is required", position + 1))
                })?;

                let quantity = item
                    .quantity
                    .filter(|quantity| *quantity > 0)
                    .and_then(|quantity| i32::try_from(quantity).ok())
                    .ok_or_else(|| {
                        AppError::BadRequest(format!(
                            "Invalid quantity for product {}: a positive integer is required",
                            product_id
                        ))
                    })?;

                Ok(OrderLineInput {
                    product_id,
                    quantity,
                })
            })
            .collect::<AppResult<Vec<_>>>()?;

        Ok(NewOrder {
            client_id,
            delivery_address: address,
            payment_mode,
            lines,
        })
    }

    // -------------------------------------------------------------------------
    // PLACE ORDER
    // -------------------------------------------------------------------------
    /// Reserve stock for every line and persist the order atomically.
    pub async fn place_order(&self, order: &NewOrder) -> AppResult<PlacedOrder> {
        let mut tx = self.pool.begin().await?;

        // Any `?` below drops `tx` uncommitted, which rolls back every
        // decrement made so far.
        let mut snapshots = vec![Decimal::ZERO; order.lines.len()];
        let mut stock_levels = Vec::with_capacity(order.lines.len());
        let mut total = Decimal::ZERO;

        for index in lock_order(&order.lines) {
            let line = order.lines[index];
            let reservation = inventory::reserve(&mut *tx, line.product_id, line.quantity).await?;

            snapshots[index] = reservation.unit_price;
            total += reservation.unit_price * Decimal::from(line.quantity);
            stock_levels.push(StockLevel {
                product_id: line.product_id,
                stock: reservation.remaining,
            });
        }

        let order_id: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO orders (client_id, total_amount, delivery_address, payment_mode, status)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(order.client_id)
        .bind(total)
        .bind(&order.delivery_address)
        .bind(order.payment_mode.as_str())
        .bind(OrderStatus::Pending.as_str())
        .fetch_one(&mut *tx)
        .await?;

        for (line, unit_price) in order.lines.iter().zip(&snapshots) {
            sqlx::query(
                r#"
                INSERT INTO order_lines (order_id, product_id, quantity, unit_price)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(order_id.0)
            .bind(line.product_id)
            .bind(line.quantity)
            .bind(unit_price)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::info!(
            order_id = order_id.0,
            client_id = order.client_id,
            lines = order.lines.len(),
            total = %total,
            "Order placed"
        );

        Ok(PlacedOrder {
            order_id: order_id.0,
            total,
            stock_levels,
        })
    }

    // -------------------------------------------------------------------------
    // CANCEL ORDER
    // -------------------------------------------------------------------------
    /// Delete an order and give its quantities back to stock.
    ///
    /// The order row goes first: restoring stock compensates for an order
    /// that no longer exists, it is not a precondition for deleting it.
    pub async fn cancel_order(&self, order_id: i64) -> AppResult<Vec<RestoredLine>> {
        let mut tx = self.pool.begin().await?;

        let mut lines: Vec<RestoredLine> = sqlx::query_as(
            r#"
            SELECT product_id, quantity
            FROM order_lines
            WHERE order_id = $1
            FOR UPDATE
            "#,
        )
        .bind(order_id)
        .fetch_all(&mut *tx)
        .await?;

        let deleted = sqlx::query("DELETE FROM orders WHERE id = $1")
            .bind(order_id)
            .execute(&mut *tx)
            .await?;

        if deleted.rows_affected() == 0 {
            return Err(AppError::OrderNotFound(order_id));
        }

        lines.sort_by_key(|line| line.product_id);
        for line in &lines {
            inventory::release(&mut *tx, line.product_id, line.quantity).await?;
        }

        tx.commit().await?;

        tracing::info!(order_id, lines = lines.len(), "Order deleted, stock restored");

        Ok(lines)
    }

    // -------------------------------------------------------------------------
    // UPDATE STATUS
    // -------------------------------------------------------------------------
    /// Move an order to `status`. The first move to `validée` stamps
    /// the payment date.
    pub async fn update_status(&self, order_id: i64, status: OrderStatus) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $1::varchar,
                paid_at = CASE
                    WHEN $1::varchar = 'validée' THEN COALESCE(paid_at, NOW())
                    ELSE paid_at
                END
            WHERE id = $2
            "#,
        )
        .bind(status.as_str())
        .bind(order_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::OrderNotFound(order_id));
        }

        tracing::info!(order_id, status = status.as_str(), "Order status updated");

        Ok(())
    }

    // -------------------------------------------------------------------------
    // READ
    // -------------------------------------------------------------------------
    /// Every order with its client's name, newest first.
    pub async fn list_orders(&self) -> AppResult<Vec<OrderSummary>> {
        let orders = sqlx::query_as::<_, OrderSummary>(
            r#"
            SELECT o.id, o.client_id, o.payment_mode, o.total_amount, o.paid_at,
                   o.delivery_address, o.status, o.created_at,
                   c.name AS client_name
            FROM orders o
            JOIN clients c ON c.id = o.client_id
            ORDER BY o.created_at DESC, o.id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    /// Status as committed right now; `None` once the order is gone.
    pub async fn current_status(&self, order_id: i64) -> AppResult<Option<String>> {
        let status = sqlx::query_scalar::<_, String>("SELECT status FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(status)
    }

    pub async fn get_order(&self, order_id: i64) -> AppResult<OrderDetails> {
        let order = sqlx::query_as::<_, Order>(
            r#"
            SELECT id, client_id, payment_mode, total_amount, paid_at,
                   delivery_address, status, created_at
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::OrderNotFound(order_id))?;

        let lines = sqlx::query_as::<_, OrderLineDetail>(
            r#"
            SELECT ol.product_id, p.name AS product_name, ol.quantity, ol.unit_price
            FROM order_lines ol
            JOIN products p ON p.id = ol.product_id
            WHERE ol.order_id = $1
            ORDER BY ol.id
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(OrderDetails { order, lines })
    }
}

/// Indices of `lines` in the order their product rows must be locked.
///
/// Stable: repeated products keep their request order.
fn lock_order(lines: &[OrderLineInput]) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..lines.len()).collect();
    indices.sort_by_key(|&index| lines[index].product_id);
    indices
}
