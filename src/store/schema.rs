use crate::store::error::StoreResult;
use sqlx::SqlitePool;

pub struct SchemaManager {
    pool: SqlitePool,
}

impl SchemaManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn initialize_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                firewall INTEGER NOT NULL DEFAULT 0,
                network_roles TEXT NOT NULL DEFAULT '[]',
                host_nat INTEGER NOT NULL DEFAULT 0,
                host_nat_interface TEXT,
                host_nat_excludes TEXT NOT NULL DEFAULT '[]'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                id TEXT PRIMARY KEY,
                node_id TEXT NOT NULL,
                organization TEXT NOT NULL DEFAULT '',
                state TEXT NOT NULL DEFAULT 'stopped',
                network_roles TEXT NOT NULL DEFAULT '[]',
                private_ip TEXT,
                private_ip6 TEXT,
                public_ip TEXT,
                public_ip6 TEXT,
                cloud_ip TEXT,
                cloud_public_ip TEXT,
                cloud_attached INTEGER NOT NULL DEFAULT 0,
                vpc_attached INTEGER NOT NULL DEFAULT 0,
                node_port_gateway TEXT,
                node_port_mappings TEXT NOT NULL DEFAULT '[]'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_instances_node_state \
             ON instances (node_id, state)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS firewalls (
                id TEXT PRIMARY KEY,
                organization TEXT NOT NULL DEFAULT '',
                network_roles TEXT NOT NULL DEFAULT '[]',
                ingress TEXT NOT NULL DEFAULT '[]'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
