//! Durable record of assets, balances, VTXOs, sessions, challenges,
//! transactions and invoices.
//!
//! All multi-row mutations run inside a caller-owned transaction; the
//! operation modules take any `ConnectionTrait` so the same functions work
//! on the pool connection and inside `begin()`. Uniqueness constraints are
//! the primary defense against duplicate intents and double-spent VTXOs.

use std::sync::Arc;
use std::time::Duration;

use sea_orm::sea_query::{Index, IndexCreateStatement};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DatabaseTransaction,
    EntityTrait, Schema, TransactionTrait,
};
use tracing::{debug, info};

pub mod assets;
pub mod balances;
pub mod challenges;
pub mod entity;
pub mod error;
pub mod invoices;
pub mod sessions;
pub mod transactions;
pub mod types;
pub mod vtxos;

pub use error::{Result, StoreError};
pub use types::{
    AssetType, InvoiceStatus, InvoiceType, SessionStatus, SessionType, TxStatus, TxType,
    VtxoStatus,
};

/// Handle to the gateway database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Arc<DatabaseConnection>,
}

impl Store {
    /// Connect with a pooled connection and verify reachability.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        info!(
            "Connecting to database: {}",
            mask_connection_string(database_url)
        );

        let mut opt = ConnectOptions::new(database_url);
        opt.max_connections(max_connections)
            .min_connections(1)
            .connect_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .sqlx_logging(false);

        let conn = Database::connect(opt).await?;
        conn.ping().await?;
        info!("Database connection established");

        Ok(Self {
            conn: Arc::new(conn),
        })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }

    pub async fn begin(&self) -> Result<DatabaseTransaction> {
        Ok(self.conn.begin().await?)
    }

    /// Idempotent schema bootstrap: entity tables plus the compound
    /// uniqueness indexes that back intent and balance idempotency.
    pub async fn create_schema(&self) -> Result<()> {
        let backend = self.conn.get_database_backend();
        let schema = Schema::new(backend);

        create_table_if_missing(&*self.conn, &schema, entity::asset::Entity).await?;
        create_table_if_missing(&*self.conn, &schema, entity::asset_balance::Entity).await?;
        create_table_if_missing(&*self.conn, &schema, entity::vtxo::Entity).await?;
        create_table_if_missing(&*self.conn, &schema, entity::signing_session::Entity).await?;
        create_table_if_missing(&*self.conn, &schema, entity::signing_challenge::Entity).await?;
        create_table_if_missing(&*self.conn, &schema, entity::transaction::Entity).await?;
        create_table_if_missing(&*self.conn, &schema, entity::lightning_invoice::Entity).await?;
        create_table_if_missing(&*self.conn, &schema, entity::l1_commitment::Entity).await?;

        let indexes: Vec<IndexCreateStatement> = vec![
            Index::create()
                .name("uq_asset_balances_user_asset")
                .table(entity::asset_balance::Entity)
                .col(entity::asset_balance::Column::UserPubkey)
                .col(entity::asset_balance::Column::AssetId)
                .unique()
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("uq_sessions_user_action")
                .table(entity::signing_session::Entity)
                .col(entity::signing_session::Column::UserPubkey)
                .col(entity::signing_session::Column::ActionId)
                .unique()
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("ix_vtxos_asset_status")
                .table(entity::vtxo::Entity)
                .col(entity::vtxo::Column::AssetId)
                .col(entity::vtxo::Column::Status)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("ix_challenges_session")
                .table(entity::signing_challenge::Entity)
                .col(entity::signing_challenge::Column::SessionId)
                .if_not_exists()
                .to_owned(),
        ];

        for index in indexes {
            self.conn.execute(backend.build(&index)).await?;
        }

        info!("Database schema ready");
        Ok(())
    }
}

async fn create_table_if_missing<E>(
    conn: &DatabaseConnection,
    schema: &Schema,
    entity: E,
) -> Result<()>
where
    E: EntityTrait,
{
    let backend = conn.get_database_backend();
    let mut stmt = schema.create_table_from_entity(entity);
    stmt.if_not_exists();
    debug!("Ensuring table for {}", entity.table_name());
    conn.execute(backend.build(&stmt)).await?;
    Ok(())
}

fn mask_connection_string(conn_str: &str) -> String {
    match (conn_str.find("//"), conn_str.find('@')) {
        (Some(scheme_end), Some(at_pos)) if at_pos > scheme_end => {
            format!("{}****{}", &conn_str[..scheme_end + 2], &conn_str[at_pos..])
        }
        _ => conn_str.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::mask_connection_string;

    #[test]
    fn masks_credentials() {
        assert_eq!(
            mask_connection_string("mysql://user:pw@db:3306/arkrelay"),
            "mysql://****@db:3306/arkrelay"
        );
        assert_eq!(mask_connection_string("sqlite::memory:"), "sqlite::memory:");
    }
}
