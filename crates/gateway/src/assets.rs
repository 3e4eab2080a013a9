//! Asset registry and holdings (CRUD, minting, transfers, reserves).

use store::entity::asset::Model as Asset;
use store::{assets, balances, AssetType, StoreError};
use tracing::info;

use crate::error::{GatewayError, Result};
use crate::state::SharedState;

#[derive(Clone)]
pub struct AssetManager {
    state: SharedState,
}

/// Spendable vs. reserved split for admission decisions.
#[derive(Debug, Clone, Copy)]
pub struct ReserveSplit {
    pub balance: i64,
    pub reserved: i64,
}

impl ReserveSplit {
    pub fn spendable(&self) -> i64 {
        self.balance - self.reserved
    }
}

impl AssetManager {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    pub async fn create_asset(
        &self,
        asset_id: &str,
        name: &str,
        ticker: &str,
        asset_type: AssetType,
        decimals: i32,
    ) -> Result<Asset> {
        let asset = assets::insert(
            self.state.store.connection(),
            assets::NewAsset {
                asset_id: asset_id.to_string(),
                name: name.to_string(),
                ticker: ticker.to_string(),
                asset_type,
                decimals,
            },
        )
        .await?;
        info!("registered asset {} ({})", asset.asset_id, asset.ticker);
        Ok(asset)
    }

    /// Register the asset if it does not exist yet.
    pub async fn ensure_asset(
        &self,
        asset_id: &str,
        name: &str,
        ticker: &str,
        asset_type: AssetType,
    ) -> Result<Asset> {
        if let Some(existing) = assets::find(self.state.store.connection(), asset_id).await? {
            return Ok(existing);
        }
        match self.create_asset(asset_id, name, ticker, asset_type, 8).await {
            Ok(asset) => Ok(asset),
            // lost a create race; the row exists now
            Err(GatewayError::Store(StoreError::Duplicate(_))) => self.get_asset(asset_id).await,
            Err(err) => Err(err),
        }
    }

    pub async fn get_asset(&self, asset_id: &str) -> Result<Asset> {
        assets::find(self.state.store.connection(), asset_id)
            .await?
            .ok_or_else(|| GatewayError::Validation(format!("unknown asset {asset_id}")))
    }

    pub async fn list_assets(&self) -> Result<Vec<Asset>> {
        Ok(assets::list(self.state.store.connection(), true).await?)
    }

    /// Mint new supply to a recipient: total_supply and the recipient's
    /// balance move together in one transaction. Permissionless assets are
    /// issued through the Taproot-asset daemon first; the ledger only
    /// records what the daemon actually minted.
    pub async fn mint(&self, asset_id: &str, recipient: &str, amount: i64) -> Result<()> {
        if amount <= 0 {
            return Err(GatewayError::Validation(format!(
                "mint amount must be positive, got {amount}"
            )));
        }
        let asset = self.get_asset(asset_id).await?;
        if asset.asset_type == store::AssetType::Permissionless.as_str() {
            let minted = self
                .state
                .tap
                .mint_asset(&asset.name, &asset.ticker, amount)
                .await
                .map_err(GatewayError::from_daemon)?;
            // issued units land on the gateway's key; deliver them to the
            // recipient's script before the ledger records the credit
            let delivery = self
                .state
                .tap
                .transfer_asset(asset_id, recipient, amount)
                .await
                .map_err(GatewayError::from_daemon)?;
            info!(
                "tapd minted {amount} {asset_id} in batch {} and delivered in {}",
                minted.batch_txid, delivery.transfer_txid
            );
        }
        let txn = self.state.store.begin().await?;
        if !assets::adjust_supply(&txn, asset_id, amount).await? {
            txn.rollback().await.map_err(StoreError::from)?;
            return Err(GatewayError::Internal(format!(
                "supply adjustment for {asset_id} matched no row"
            )));
        }
        balances::credit(&txn, recipient, asset_id, amount).await?;
        txn.commit().await.map_err(StoreError::from)?;
        info!("minted {amount} {asset_id} to {}", abbrev(recipient));
        Ok(())
    }

    /// Move `amount` between two holders: exactly two balance rows change,
    /// inside one transaction, with the sender's non-negativity re-checked.
    pub async fn transfer(
        &self,
        sender: &str,
        recipient: &str,
        asset_id: &str,
        amount: i64,
    ) -> Result<()> {
        if amount <= 0 {
            return Err(GatewayError::Validation(format!(
                "transfer amount must be positive, got {amount}"
            )));
        }
        let txn = self.state.store.begin().await?;
        balances::debit(&txn, sender, asset_id, amount).await?;
        balances::credit(&txn, recipient, asset_id, amount).await?;
        txn.commit().await.map_err(StoreError::from)?;
        Ok(())
    }

    pub async fn reserve_split(&self, user_pubkey: &str, asset_id: &str) -> Result<ReserveSplit> {
        let row = balances::find(self.state.store.connection(), user_pubkey, asset_id).await?;
        Ok(row
            .map(|b| ReserveSplit {
                balance: b.balance,
                reserved: b.reserved_balance,
            })
            .unwrap_or(ReserveSplit {
                balance: 0,
                reserved: 0,
            }))
    }

    pub async fn spendable(&self, user_pubkey: &str, asset_id: &str) -> Result<i64> {
        Ok(balances::spendable(self.state.store.connection(), user_pubkey, asset_id).await?)
    }
}

fn abbrev(pubkey: &str) -> &str {
    pubkey.get(..8).unwrap_or(pubkey)
}
