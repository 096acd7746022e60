//! Gateway adapter boundary
//!
//! All venue interaction goes through [`GatewayAdapter`]; the engine never
//! speaks a wire protocol directly. Implementations surface market data and
//! fills on a single broadcast stream and report failures through the tagged
//! [`GatewayError`] taxonomy so retry decisions stay variant-driven.
//!
//! [`PaperGateway`] is the dry-run implementation: orders rest in memory,
//! fills are triggered explicitly, and errors can be injected per call.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::info;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::types::{Asset, Fill, LivePosition, MarketUpdate, OrderId, OrderRequest};

/// Event delivered on the gateway stream
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Market(MarketUpdate),
    Fill(Fill),
}

#[async_trait]
pub trait GatewayAdapter: Send + Sync {
    /// Subscribe to the merged market-data and fill stream
    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent>;

    /// Submit an order; returns the venue order ID
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderId, GatewayError>;

    /// Cancel a resting order
    async fn cancel_order(&self, asset: Asset, order_id: &OrderId) -> Result<(), GatewayError>;

    /// Move a resting stop order to a new trigger price and size
    async fn amend_stop(
        &self,
        asset: Asset,
        order_id: &OrderId,
        new_price: f64,
        new_qty: f64,
    ) -> Result<(), GatewayError>;

    /// Available margin balance (USDT)
    async fn query_margin(&self) -> Result<f64, GatewayError>;

    /// Position currently held at the venue, for reconciliation
    async fn live_position(&self, asset: Asset) -> Result<Option<LivePosition>, GatewayError>;

    /// Apply leverage for a contract before trading starts
    async fn set_leverage(&self, asset: Asset, leverage: u32) -> Result<(), GatewayError>;
}

#[derive(Debug, Default)]
struct PaperBook {
    /// Resting orders by venue ID
    open_orders: HashMap<OrderId, OrderRequest>,
    /// Stop amendments applied, oldest first
    amendments: Vec<(OrderId, f64)>,
    /// Errors returned by the next calls, front first
    injected_errors: Vec<GatewayError>,
    /// Positions reported by `live_position`
    positions: HashMap<Asset, LivePosition>,
    /// Leverage applied per contract
    leverage: HashMap<Asset, u32>,
    margin: f64,
    orders_placed: u32,
}

/// In-memory venue simulation for dry runs and tests
pub struct PaperGateway {
    events: broadcast::Sender<GatewayEvent>,
    book: Mutex<PaperBook>,
}

impl PaperGateway {
    pub fn new(margin: f64) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            events,
            book: Mutex::new(PaperBook {
                margin,
                ..PaperBook::default()
            }),
        }
    }

    /// Feed a market update to subscribers
    pub fn inject_market(&self, update: MarketUpdate) {
        let _ = self.events.send(GatewayEvent::Market(update));
    }

    /// Queue an error to be returned by the next order-path call
    pub async fn inject_error(&self, error: GatewayError) {
        self.book.lock().await.injected_errors.push(error);
    }

    /// Report a position for reconciliation checks
    pub async fn set_position(&self, position: LivePosition) {
        self.book.lock().await.positions.insert(position.asset, position);
    }

    /// Fill a resting order at the given price and emit the fill event.
    /// The order is removed from the book.
    pub async fn fill(&self, order_id: &OrderId, price: f64, ts: i64) -> Option<Fill> {
        let request = self.book.lock().await.open_orders.remove(order_id)?;
        let fill = Fill {
            order_id: order_id.clone(),
            asset: request.asset,
            kind: request.kind,
            price,
            qty: request.qty,
            ts,
        };
        let _ = self.events.send(GatewayEvent::Fill(fill.clone()));
        Some(fill)
    }

    pub async fn open_order(&self, order_id: &OrderId) -> Option<OrderRequest> {
        self.book.lock().await.open_orders.get(order_id).cloned()
    }

    pub async fn open_order_count(&self) -> usize {
        self.book.lock().await.open_orders.len()
    }

    pub async fn open_order_ids(&self) -> Vec<OrderId> {
        self.book.lock().await.open_orders.keys().cloned().collect()
    }

    pub async fn orders_placed(&self) -> u32 {
        self.book.lock().await.orders_placed
    }

    pub async fn amendments(&self) -> Vec<(OrderId, f64)> {
        self.book.lock().await.amendments.clone()
    }

    pub async fn leverage_for(&self, asset: Asset) -> Option<u32> {
        self.book.lock().await.leverage.get(&asset).copied()
    }

    fn take_injected(book: &mut PaperBook) -> Option<GatewayError> {
        if book.injected_errors.is_empty() {
            None
        } else {
            Some(book.injected_errors.remove(0))
        }
    }
}

#[async_trait]
impl GatewayAdapter for PaperGateway {
    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderId, GatewayError> {
        let mut book = self.book.lock().await;
        if let Some(err) = Self::take_injected(&mut book) {
            return Err(err);
        }
        let order_id = OrderId(Uuid::new_v4().to_string());
        book.open_orders.insert(order_id.clone(), request.clone());
        book.orders_placed += 1;
        info!(
            asset = %request.asset,
            kind = %request.kind,
            qty = request.qty,
            price = ?request.price,
            %order_id,
            "paper order placed"
        );
        Ok(order_id)
    }

    async fn cancel_order(&self, _asset: Asset, order_id: &OrderId) -> Result<(), GatewayError> {
        let mut book = self.book.lock().await;
        if let Some(err) = Self::take_injected(&mut book) {
            return Err(err);
        }
        match book.open_orders.remove(order_id) {
            Some(_) => Ok(()),
            None => Err(GatewayError::UnknownOrder(order_id.0.clone())),
        }
    }

    async fn amend_stop(
        &self,
        _asset: Asset,
        order_id: &OrderId,
        new_price: f64,
        new_qty: f64,
    ) -> Result<(), GatewayError> {
        let mut book = self.book.lock().await;
        if let Some(err) = Self::take_injected(&mut book) {
            return Err(err);
        }
        match book.open_orders.get_mut(order_id) {
            Some(order) => {
                order.price = Some(new_price);
                order.qty = new_qty;
                book.amendments.push((order_id.clone(), new_price));
                Ok(())
            }
            None => Err(GatewayError::UnknownOrder(order_id.0.clone())),
        }
    }

    async fn query_margin(&self) -> Result<f64, GatewayError> {
        Ok(self.book.lock().await.margin)
    }

    async fn live_position(&self, asset: Asset) -> Result<Option<LivePosition>, GatewayError> {
        Ok(self.book.lock().await.positions.get(&asset).cloned())
    }

    async fn set_leverage(&self, asset: Asset, leverage: u32) -> Result<(), GatewayError> {
        self.book.lock().await.leverage.insert(asset, leverage);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, OrderKind, OrderSide};

    fn entry_request() -> OrderRequest {
        OrderRequest {
            client_id: "test-entry".into(),
            asset: Asset::BTC,
            side: OrderSide::entry_for(Direction::Long),
            kind: OrderKind::Entry,
            price: Some(50_000.0),
            qty: 0.01,
            reduce_only: false,
            post_only: true,
        }
    }

    #[tokio::test]
    async fn test_place_fill_roundtrip() {
        let gateway = PaperGateway::new(10_000.0);
        let mut events = gateway.subscribe();

        let order_id = gateway.place_order(&entry_request()).await.unwrap();
        assert_eq!(gateway.open_order_count().await, 1);

        let fill = gateway.fill(&order_id, 50_010.0, 1_000).await.unwrap();
        assert_eq!(fill.qty, 0.01);
        assert_eq!(gateway.open_order_count().await, 0);

        match events.recv().await.unwrap() {
            GatewayEvent::Fill(f) => assert_eq!(f.order_id, order_id),
            other => panic!("expected fill event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_injected_error_consumed_once() {
        let gateway = PaperGateway::new(10_000.0);
        gateway
            .inject_error(GatewayError::Network("connection reset".into()))
            .await;

        let err = gateway.place_order(&entry_request()).await.unwrap_err();
        assert!(err.is_transient());
        // Next attempt succeeds
        assert!(gateway.place_order(&entry_request()).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_unknown_order() {
        let gateway = PaperGateway::new(10_000.0);
        let err = gateway
            .cancel_order(Asset::BTC, &OrderId("missing".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UnknownOrder(_)));
    }

    #[tokio::test]
    async fn test_amend_stop_updates_price_and_qty() {
        let gateway = PaperGateway::new(10_000.0);
        let mut stop = entry_request();
        stop.kind = OrderKind::StopLoss;
        stop.reduce_only = true;
        let order_id = gateway.place_order(&stop).await.unwrap();

        gateway
            .amend_stop(Asset::BTC, &order_id, 49_500.0, 0.005)
            .await
            .unwrap();
        let resting = gateway.open_order(&order_id).await.unwrap();
        assert_eq!(resting.price, Some(49_500.0));
        assert!((resting.qty - 0.005).abs() < 1e-12);
        assert_eq!(gateway.amendments().await, vec![(order_id, 49_500.0)]);
    }
}
