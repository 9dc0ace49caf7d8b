#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use perpbot::api::ExecutionClient;
use perpbot::config::Settings;
use perpbot::engine::{EngineHandle, EngineSnapshot, TradingEngine};
use perpbot::error::ExchangeError;
use perpbot::execution::FeedHealth;
use perpbot::models::{
    MarginMode, OrderRequest, OrderResult, OrderSide, OrderStatus, Position, PositionSide,
    SignalKind, TradeSignal,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

pub const SYMBOL: &str = "BTCUSDT";
pub const MARK: f64 = 100.0;
pub const EQUITY: f64 = 1_000.0;
const WAIT: Duration = Duration::from_secs(5);

struct Book {
    /// Signed quantity: long positive, short negative
    qty: f64,
    entry_price: f64,
    leverage: u32,
    margin_mode: MarginMode,
    equity: f64,
    mark: f64,
    placed: Vec<OrderRequest>,
    pending: HashMap<String, OrderRequest>,
    hold_fills: bool,
    reject_next: bool,
    position_error: Option<ExchangeError>,
    active: usize,
    max_active: usize,
}

/// In-memory futures account that fills market orders at the mark price
pub struct MockExchange {
    book: Mutex<Book>,
}

impl MockExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            book: Mutex::new(Book {
                qty: 0.0,
                entry_price: 0.0,
                leverage: 10,
                margin_mode: MarginMode::Isolated,
                equity: EQUITY,
                mark: MARK,
                placed: Vec::new(),
                pending: HashMap::new(),
                hold_fills: false,
                reject_next: false,
                position_error: None,
                active: 0,
                max_active: 0,
            }),
        })
    }

    fn book(&self) -> std::sync::MutexGuard<'_, Book> {
        self.book.lock().unwrap()
    }

    /// Change the position behind the engine's back
    pub fn set_position(&self, side: PositionSide, size: f64, entry_price: f64) {
        let mut book = self.book();
        book.qty = match side {
            PositionSide::Long => size,
            PositionSide::Short => -size,
            PositionSide::Flat => 0.0,
        };
        book.entry_price = entry_price;
    }

    /// New orders stay NEW until `release_fills`
    pub fn hold_fills(&self) {
        self.book().hold_fills = true;
    }

    pub fn release_fills(&self) {
        self.book().hold_fills = false;
    }

    pub fn reject_next_order(&self) {
        self.book().reject_next = true;
    }

    pub fn fail_next_position_query(&self, error: ExchangeError) {
        self.book().position_error = Some(error);
    }

    pub fn placed(&self) -> Vec<OrderRequest> {
        self.book().placed.clone()
    }

    pub fn max_concurrent_orders(&self) -> usize {
        self.book().max_active
    }

    pub fn position(&self) -> Position {
        position_of(&self.book())
    }
}

fn position_of(book: &Book) -> Position {
    let side = if book.qty > 0.0 {
        PositionSide::Long
    } else if book.qty < 0.0 {
        PositionSide::Short
    } else {
        PositionSide::Flat
    };

    Position {
        symbol: SYMBOL.to_string(),
        side,
        size: book.qty.abs(),
        entry_price: if side == PositionSide::Flat { 0.0 } else { book.entry_price },
        leverage: book.leverage,
        margin_mode: book.margin_mode,
    }
}

fn fill(book: &mut Book, request: &OrderRequest) -> OrderResult {
    let delta = match request.side {
        OrderSide::Buy => request.size,
        OrderSide::Sell => -request.size,
    };
    let before = book.qty;
    let mut after = before + delta;
    if request.reduce_only && (after.signum() != before.signum() || before == 0.0) {
        after = 0.0;
    }
    if before == 0.0 || after.signum() != before.signum() {
        book.entry_price = book.mark;
    }
    book.qty = if after.abs() < 1e-12 { 0.0 } else { after };

    OrderResult {
        client_id: request.client_id.clone(),
        side: request.side,
        size: request.size,
        filled_size: request.size,
        avg_price: Some(book.mark),
        status: OrderStatus::Filled,
    }
}

#[async_trait]
impl ExecutionClient for MockExchange {
    async fn set_leverage(&self, _symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        self.book().leverage = leverage;
        Ok(())
    }

    async fn set_margin_mode(&self, _symbol: &str, mode: MarginMode) -> Result<(), ExchangeError> {
        self.book().margin_mode = mode;
        Ok(())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        let mut book = self.book();
        book.placed.push(request.clone());
        book.active += 1;
        book.max_active = book.max_active.max(book.active);

        if book.reject_next {
            book.reject_next = false;
            book.active -= 1;
            return Ok(OrderResult {
                client_id: request.client_id.clone(),
                side: request.side,
                size: request.size,
                filled_size: 0.0,
                avg_price: None,
                status: OrderStatus::Rejected,
            });
        }

        if book.hold_fills {
            book.pending
                .insert(request.client_id.clone(), request.clone());
            return Ok(OrderResult {
                client_id: request.client_id.clone(),
                side: request.side,
                size: request.size,
                filled_size: 0.0,
                avg_price: None,
                status: OrderStatus::Pending,
            });
        }

        book.active -= 1;
        Ok(fill(&mut book, request))
    }

    async fn cancel_order(&self, _symbol: &str, client_id: &str) -> Result<OrderResult, ExchangeError> {
        let mut book = self.book();
        let request = book
            .pending
            .remove(client_id)
            .ok_or_else(|| ExchangeError::Rejected {
                code: -2011,
                message: "Unknown order sent.".to_string(),
            })?;
        book.active -= 1;

        Ok(OrderResult {
            client_id: request.client_id.clone(),
            side: request.side,
            size: request.size,
            filled_size: 0.0,
            avg_price: None,
            status: OrderStatus::Canceled,
        })
    }

    async fn get_order_status(
        &self,
        _symbol: &str,
        client_id: &str,
    ) -> Result<OrderResult, ExchangeError> {
        let mut book = self.book();
        let Some(request) = book.pending.get(client_id).cloned() else {
            return Err(ExchangeError::Rejected {
                code: -2013,
                message: "Order does not exist.".to_string(),
            });
        };

        if book.hold_fills {
            return Ok(OrderResult {
                client_id: request.client_id.clone(),
                side: request.side,
                size: request.size,
                filled_size: 0.0,
                avg_price: None,
                status: OrderStatus::Pending,
            });
        }

        book.pending.remove(client_id);
        book.active -= 1;
        Ok(fill(&mut book, &request))
    }

    async fn get_position(&self, _symbol: &str) -> Result<Position, ExchangeError> {
        let mut book = self.book();
        if let Some(e) = book.position_error.take() {
            return Err(e);
        }
        Ok(position_of(&book))
    }

    async fn account_equity(&self) -> Result<f64, ExchangeError> {
        Ok(self.book().equity)
    }

    async fn mark_price(&self, _symbol: &str) -> Result<f64, ExchangeError> {
        Ok(self.book().mark)
    }
}

pub fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.market.symbol = SYMBOL.to_string();
    settings.engine.order_poll_interval_ms = 10;
    settings.engine.order_timeout_secs = 5;
    settings
}

pub struct Harness {
    pub exchange: Arc<MockExchange>,
    pub handle: EngineHandle,
    pub feed: watch::Sender<FeedHealth>,
}

impl Harness {
    pub fn spawn() -> Self {
        Self::spawn_with(MockExchange::new())
    }

    pub fn spawn_with(exchange: Arc<MockExchange>) -> Self {
        let (feed, feed_rx) = watch::channel(FeedHealth::default());
        let client: Arc<dyn ExecutionClient> = exchange.clone();
        let (engine, handle) = TradingEngine::new(&settings(), client, feed_rx);
        engine.spawn();

        Self {
            exchange,
            handle,
            feed,
        }
    }

    /// Start the strategy and wait until it is running
    pub async fn started() -> Self {
        let harness = Self::spawn();
        let ack = harness.handle.start().unwrap();
        harness.settle(ack.seq).await;
        harness
    }

    pub async fn settle(&self, seq: u64) -> EngineSnapshot {
        tokio::time::timeout(WAIT, self.handle.wait_processed(seq))
            .await
            .expect("engine did not settle in time")
            .expect("engine closed")
    }

    pub async fn wait_for(&self, predicate: impl Fn(&EngineSnapshot) -> bool) -> EngineSnapshot {
        let mut rx = self.handle.subscribe();
        tokio::time::timeout(WAIT, async move {
            rx.wait_for(|s| predicate(s)).await.map(|s| s.clone())
        })
        .await
        .expect("condition not reached in time")
        .expect("engine closed")
    }

    pub fn signal(&self, kind: SignalKind) -> u64 {
        let signal = TradeSignal {
            kind,
            source_candle_time: Utc::now(),
            strength: 1.0,
        };
        self.handle.submit_signal(signal, None).unwrap().seq
    }
}
