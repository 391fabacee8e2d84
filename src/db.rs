// =============================================================================
// DATABASE MODULE
// =============================================================================
// PostgreSQL connection pool and schema.
//
// The domain operations live next to their invariants:
// - inventory.rs : row-locked stock reservation
// - orders.rs    : order transaction manager
// - store.rs     : payment transaction records
// =============================================================================

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, PgPool};

// -----------------------------------------------------------------------------
// SCHEMA
// -----------------------------------------------------------------------------
// One statement per entry: prepared statements cannot carry several commands.
// IF NOT EXISTS keeps every statement safe to re-run on startup.
const SCHEMA: &[(&str, &str)] = &[
    (
        "clients",
        r#"
        CREATE TABLE IF NOT EXISTS clients (
            id BIGSERIAL PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            email VARCHAR(255) UNIQUE NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "categories",
        r#"
        CREATE TABLE IF NOT EXISTS categories (
            id BIGSERIAL PRIMARY KEY,
            name VARCHAR(255) UNIQUE NOT NULL
        )
        "#,
    ),
    (
        "products",
        r#"
        CREATE TABLE IF NOT EXISTS products (
            id BIGSERIAL PRIMARY KEY,
            category_id BIGINT REFERENCES categories(id) ON DELETE SET NULL,
            name VARCHAR(255) NOT NULL,
            price NUMERIC(12, 2) NOT NULL,
            stock INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

            CONSTRAINT non_negative_price CHECK (price >= 0),
            CONSTRAINT non_negative_stock CHECK (stock >= 0)
        )
        "#,
    ),
    (
        "orders",
        r#"
        CREATE TABLE IF NOT EXISTS orders (
            id BIGSERIAL PRIMARY KEY,
            client_id BIGINT NOT NULL REFERENCES clients(id),
            total_amount NUMERIC(14, 2) NOT NULL,
            delivery_address TEXT NOT NULL,
            payment_mode VARCHAR(32) NOT NULL,
            status VARCHAR(32) NOT NULL DEFAULT 'en_attente',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            paid_at TIMESTAMPTZ,

            CONSTRAINT valid_status CHECK (
                status IN ('en_attente', 'validée', 'expédiée', 'livrée', 'annulée')
            )
        )
        "#,
    ),
    (
        "order_lines",
        r#"
        CREATE TABLE IF NOT EXISTS order_lines (
            id BIGSERIAL PRIMARY KEY,
            order_id BIGINT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
            product_id BIGINT NOT NULL REFERENCES products(id),
            quantity INTEGER NOT NULL,
            unit_price NUMERIC(12, 2) NOT NULL,

            CONSTRAINT positive_quantity CHECK (quantity > 0)
        )
        "#,
    ),
    (
        "order_lines index",
        "CREATE INDEX IF NOT EXISTS idx_order_lines_order ON order_lines(order_id)",
    ),
    (
        "payment_transactions",
        r#"
        CREATE TABLE IF NOT EXISTS payment_transactions (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            transaction_id VARCHAR(64),

            -- Natural key: correlates local and provider state
            reference VARCHAR(64) UNIQUE NOT NULL,

            amount NUMERIC(14, 2),
            status VARCHAR(32) NOT NULL DEFAULT 'PENDING',
            customer_account_number VARCHAR(32),
            fees NUMERIC(14, 2),
            total_amount NUMERIC(14, 2),
            charge_owner VARCHAR(32),
            free_info VARCHAR(64),
            transaction_operation VARCHAR(32) NOT NULL DEFAULT 'PAYMENT',
            operator VARCHAR(32),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
];

// -----------------------------------------------------------------------------
// DATABASE WRAPPER
// -----------------------------------------------------------------------------
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    ///
    /// # Arguments
    /// * `database_url` - PostgreSQL connection string
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            // Every in-flight order holds one connection for its transaction
            .max_connections(10)
            .min_connections(2)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .idle_timeout(std::time::Duration::from_secs(300))
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self { pool })
    }

    /// Handle to the underlying pool, shared by the domain services
    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    // -------------------------------------------------------------------------
    // MIGRATIONS
    // -------------------------------------------------------------------------
    /// Create the tables if they don't exist and seed sample data.
    pub async fn run_migrations(&self) -> Result<()> {
        for &(name, statement) in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to create {}", name))?;
        }

        self.seed_sample_data().await?;

        Ok(())
    }

    /// Seed a client and a small catalogue when the product table is empty
    async fn seed_sample_data(&self) -> Result<()> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM products")
            .fetch_one(&self.pool)
            .await?;

        if count.0 > 0 {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO clients (name, email)
            VALUES ('Client Démo', 'demo@boutique.test')
            ON CONFLICT (email) DO NOTHING
            "#,
        )
        .execute(&self.pool)
        .await?;

        let category_id: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO categories (name) VALUES ('Prêt-à-porter')
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let sample_products = [
            ("Robe en wax", Decimal::new(2500000, 2), 12),
            ("Chemise en lin", Decimal::new(1500000, 2), 30),
            ("Sandales cuir", Decimal::new(900000, 2), 20),
            ("Sac tressé", Decimal::new(1200000, 2), 8),
            ("Foulard soie", Decimal::new(650000, 2), 40),
        ];

        for (name, price, stock) in sample_products {
            sqlx::query(
                r#"
                INSERT INTO products (category_id, name, price, stock)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(category_id.0)
            .bind(name)
            .bind(price)
            .bind(stock)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // HEALTH CHECK
    // -------------------------------------------------------------------------
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}
