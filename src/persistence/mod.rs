//! Durable state snapshots
//!
//! Risk counters and open positions are written as JSON under the data
//! directory. Writes go to a temp file first and are renamed into place,
//! so a crash mid-write leaves the previous snapshot intact.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::info;

use crate::lifecycle::Position;
use crate::risk::RiskState;
use crate::types::Asset;

const RISK_FILE: &str = "risk_state.json";

pub struct Store {
    data_dir: PathBuf,
}

impl Store {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Create the data directory if missing
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)
            .await
            .with_context(|| format!("creating data directory {}", self.data_dir.display()))?;
        Ok(())
    }

    pub async fn save_risk(&self, state: &RiskState) -> Result<()> {
        self.write_json(RISK_FILE, state).await
    }

    pub async fn load_risk(&self) -> Result<Option<RiskState>> {
        self.read_json(RISK_FILE).await
    }

    /// Save or clear the open position for one contract. Each contract has
    /// its own file so per-symbol tasks never contend on a shared snapshot.
    pub async fn save_position(&self, asset: Asset, position: Option<&Position>) -> Result<()> {
        let file = Self::position_file(asset);
        match position {
            Some(p) => self.write_json(&file, p).await,
            None => {
                let path = self.data_dir.join(&file);
                if Path::new(&path).exists() {
                    fs::remove_file(&path)
                        .await
                        .with_context(|| format!("removing {}", path.display()))?;
                }
                Ok(())
            }
        }
    }

    pub async fn load_position(&self, asset: Asset) -> Result<Option<Position>> {
        self.read_json(&Self::position_file(asset)).await
    }

    fn position_file(asset: Asset) -> String {
        format!("position_{asset}.json")
    }

    async fn write_json<T: serde::Serialize>(&self, file: &str, value: &T) -> Result<()> {
        let path = self.data_dir.join(file);
        let tmp = self.data_dir.join(format!("{file}.tmp"));
        let json = serde_json::to_string_pretty(value)
            .with_context(|| format!("serializing {file}"))?;
        fs::write(&tmp, json)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, file: &str) -> Result<Option<T>> {
        let path = self.data_dir.join(file);
        if !Path::new(&path).exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let value = serde_json::from_str(&json)
            .with_context(|| format!("parsing {}", path.display()))?;
        info!(path = %path.display(), "loaded snapshot");
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_store() -> Store {
        let dir = std::env::temp_dir().join(format!("scalpbot-test-{}", Uuid::new_v4()));
        Store::new(dir)
    }

    fn sample_risk() -> RiskState {
        RiskState {
            daily_realized_pnl: -42.5,
            daily_trade_count: 7,
            consecutive_losses: 2,
            period_start_ms: 1_700_000_000_000,
            halted_until_ms: None,
        }
    }

    #[tokio::test]
    async fn test_risk_state_roundtrip() {
        let store = temp_store();
        store.init().await.unwrap();

        assert!(store.load_risk().await.unwrap().is_none());
        store.save_risk(&sample_risk()).await.unwrap();
        let loaded = store.load_risk().await.unwrap().unwrap();
        assert_eq!(loaded, sample_risk());
    }

    #[tokio::test]
    async fn test_overwrite_keeps_latest() {
        let store = temp_store();
        store.init().await.unwrap();

        store.save_risk(&sample_risk()).await.unwrap();
        let mut updated = sample_risk();
        updated.daily_trade_count = 8;
        store.save_risk(&updated).await.unwrap();
        assert_eq!(store.load_risk().await.unwrap().unwrap().daily_trade_count, 8);
    }

    #[tokio::test]
    async fn test_missing_position_file_is_none() {
        let store = temp_store();
        store.init().await.unwrap();
        assert!(store.load_position(Asset::BTC).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_position_save_and_clear() {
        use crate::types::{Direction, OrderId};

        let store = temp_store();
        store.init().await.unwrap();

        let position = Position {
            direction: Direction::Long,
            entry_price: 50_000.0,
            atr: 100.0,
            initial_qty: 0.02,
            remaining_qty: 0.01,
            stop_price: 50_000.0,
            stop_order_id: OrderId("stop-1".into()),
            tp_orders: vec![],
            realized_pnl: 1.0,
            extreme_price: 50_150.0,
        };
        store.save_position(Asset::BTC, Some(&position)).await.unwrap();
        let loaded = store.load_position(Asset::BTC).await.unwrap().unwrap();
        assert_eq!(loaded.remaining_qty, 0.01);
        // Other contracts are unaffected
        assert!(store.load_position(Asset::ETH).await.unwrap().is_none());

        store.save_position(Asset::BTC, None).await.unwrap();
        assert!(store.load_position(Asset::BTC).await.unwrap().is_none());
        // Clearing an absent file is fine
        store.save_position(Asset::BTC, None).await.unwrap();
    }
}
