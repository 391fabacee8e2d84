// =============================================================================
// TRANSACTION RECORD STORE
// =============================================================================
// Payment transaction rows keyed by merchant reference.
//
// The local PENDING write and the provider webhook can land in either order,
// so both go through one atomic upsert. A write only overwrites the fields it
// carries; the local write carries no status, so it can never downgrade a
// status the webhook already recorded.
// =============================================================================

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::AppResult;
use crate::models::{TransactionRecord, TransactionWrite};

/// Storage seam of the payment gateway.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Insert the record, or merge the write into the existing one.
    ///
    /// Insert defaults: status `PENDING`, operation `PAYMENT`. On an existing
    /// reference only `transaction_id`, `status`, `fees`, `total_amount`,
    /// `charge_owner` and `operator` are updated, and `updated_at` is touched.
    async fn upsert_by_reference(&self, write: &TransactionWrite) -> AppResult<TransactionRecord>;

    /// Point lookup; absence is an expected state, not an error.
    async fn find_by_reference(&self, reference: &str) -> AppResult<Option<TransactionRecord>>;
}

// -----------------------------------------------------------------------------
// POSTGRES IMPLEMENTATION
// -----------------------------------------------------------------------------
#[derive(Clone)]
pub struct PgTransactionStore {
    pool: PgPool,
}

impl PgTransactionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionStore for PgTransactionStore {
    async fn upsert_by_reference(&self, write: &TransactionWrite) -> AppResult<TransactionRecord> {
        // ON CONFLICT makes the check-then-write a single statement, so a
        // webhook and the local write racing on the same reference cannot
        // both insert.
        let record = sqlx::query_as::<_, TransactionRecord>(
            r#"
            INSERT INTO payment_transactions AS t (
                reference, transaction_id, status, amount, customer_account_number,
                fees, total_amount, charge_owner, free_info, transaction_operation, operator
            )
            VALUES ($1, $2, COALESCE($3, 'PENDING'), $4, $5, $6, $7, $8, $9,
                    COALESCE($10, 'PAYMENT'), $11)
            ON CONFLICT (reference) DO UPDATE SET
                transaction_id = COALESCE($2, t.transaction_id),
                status = COALESCE($3, t.status),
                fees = COALESCE($6, t.fees),
                total_amount = COALESCE($7, t.total_amount),
                charge_owner = COALESCE($8, t.charge_owner),
                operator = COALESCE($11, t.operator),
                updated_at = NOW()
            RETURNING id, transaction_id, reference, amount, status, customer_account_number,
                      fees, total_amount, charge_owner, free_info, transaction_operation,
                      operator, created_at, updated_at
            "#,
        )
        .bind(&write.reference)
        .bind(&write.transaction_id)
        .bind(&write.status)
        .bind(write.amount)
        .bind(&write.customer_account_number)
        .bind(write.fees)
        .bind(write.total_amount)
        .bind(&write.charge_owner)
        .bind(&write.free_info)
        .bind(&write.transaction_operation)
        .bind(&write.operator)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(
            reference = %record.reference,
            status = %record.status,
            "Transaction record upserted"
        );

        Ok(record)
    }

    async fn find_by_reference(&self, reference: &str) -> AppResult<Option<TransactionRecord>> {
        let record = sqlx::query_as::<_, TransactionRecord>(
            r#"
            SELECT id, transaction_id, reference, amount, status, customer_account_number,
                   fees, total_amount, charge_owner, free_info, transaction_operation,
                   operator, created_at, updated_at
            FROM payment_transactions
            WHERE reference = $1
            "#,
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }
}

// -----------------------------------------------------------------------------
// IN-MEMORY IMPLEMENTATION (tests)
// -----------------------------------------------------------------------------
#[cfg(test)]
pub mod memory {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Same merge rules as the Postgres upsert, held in a map.
    #[derive(Default)]
    pub struct MemoryTransactionStore {
        records: Mutex<HashMap<String, TransactionRecord>>,
    }

    #[async_trait]
    impl TransactionStore for MemoryTransactionStore {
        async fn upsert_by_reference(
            &self,
            write: &TransactionWrite,
        ) -> AppResult<TransactionRecord> {
            let mut records = self.records.lock().unwrap();
            let now = Utc::now();

            let record = match records.get(&write.reference) {
                Some(existing) => TransactionRecord {
                    transaction_id: write
                        .transaction_id
                        .clone()
                        .or_else(|| existing.transaction_id.clone()),
                    status: write.status.clone().unwrap_or_else(|| existing.status.clone()),
                    fees: write.fees.or(existing.fees),
                    total_amount: write.total_amount.or(existing.total_amount),
                    charge_owner: write
                        .charge_owner
                        .clone()
                        .or_else(|| existing.charge_owner.clone()),
                    operator: write.operator.clone().or_else(|| existing.operator.clone()),
                    updated_at: now,
                    ..existing.clone()
                },
                None => TransactionRecord {
                    id: Uuid::new_v4(),
                    transaction_id: write.transaction_id.clone(),
                    reference: write.reference.clone(),
                    amount: write.amount,
                    status: write.status.clone().unwrap_or_else(|| "PENDING".into()),
                    customer_account_number: write.customer_account_number.clone(),
                    fees: write.fees,
                    total_amount: write.total_amount,
                    charge_owner: write.charge_owner.clone(),
                    free_info: write.free_info.clone(),
                    transaction_operation: write
                        .transaction_operation
                        .clone()
                        .unwrap_or_else(|| "PAYMENT".into()),
                    operator: write.operator.clone(),
                    created_at: now,
                    updated_at: now,
                },
            };

            records.insert(write.reference.clone(), record.clone());
            Ok(record)
        }

        async fn find_by_reference(&self, reference: &str) -> AppResult<Option<TransactionRecord>> {
            Ok(self.records.lock().unwrap().get(reference).cloned())
        }
    }
}
