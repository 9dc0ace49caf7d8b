//! Trading engine: a single task that owns the state machine for one symbol.
//!
//! Automatic signals and manual commands both arrive through the
//! [`EngineHandle`] channel, so transitions never interleave. Work that
//! arrives while an order is in flight is queued and coalesced: a newer
//! automatic signal replaces an older queued one, and a manual intent
//! replaces every queued intent.

pub mod command;
pub mod driver;
pub mod handle;
pub mod state;
pub mod stats;

pub use command::ConsoleCommand;
pub use driver::{run_reconcile_loop, run_signal_loop};
pub use handle::{CommandAck, EngineCommand, EngineHandle};
pub use state::{EngineNotice, EngineSnapshot, EngineState, NoticeKind};
pub use stats::TradeStats;

use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::api::ExecutionClient;
use crate::config::Settings;
use crate::error::{ExchangeError, OrderError};
use crate::execution::{FeedHealth, OrderExecutor, PositionManager, TradeOrigin};
use crate::indicators::IndicatorState;
use crate::models::{MarginMode, OrderRequest, OrderStatus, PositionSide, SignalKind, TradeSignal};
use crate::risk::{DenialReason, RiskDecision, RiskGate, RiskRequest};
use handle::Envelope;

#[derive(Debug, Clone)]
struct EngineConfig {
    symbol: String,
    leverage: u32,
    margin_mode: MarginMode,
    allocation_fraction: f64,
    quantity_precision: u32,
    signal_history_len: usize,
    notice_history_len: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Intent {
    Open {
        side: PositionSide,
        size: Option<f64>,
    },
    Close,
}

#[derive(Debug, Clone, PartialEq)]
enum Work {
    Start,
    Stop,
    Reconcile,
    Intent { intent: Intent, origin: TradeOrigin },
}

pub struct TradingEngine {
    config: EngineConfig,
    exchange: Arc<dyn ExecutionClient>,
    executor: OrderExecutor,
    risk: RiskGate,
    positions: PositionManager,
    state: EngineState,
    queue: VecDeque<Work>,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    snapshot: watch::Sender<EngineSnapshot>,
    feed_health: watch::Receiver<FeedHealth>,
    indicator: Option<IndicatorState>,
    signals: VecDeque<TradeSignal>,
    notices: VecDeque<EngineNotice>,
    last_mark: Option<f64>,
    latency_ms: Option<u64>,
    received_seq: u64,
    processed_seq: u64,
}

impl TradingEngine {
    pub fn new(
        settings: &Settings,
        exchange: Arc<dyn ExecutionClient>,
        feed_health: watch::Receiver<FeedHealth>,
    ) -> (Self, EngineHandle) {
        let (tx, inbox) = mpsc::unbounded_channel();

        let positions = PositionManager::new(
            &settings.market.symbol,
            settings.risk.leverage,
            settings.risk.margin_mode,
            settings.engine.equity_curve_len,
            settings.engine.size_tolerance,
        );
        let (snapshot, snapshot_rx) =
            watch::channel(EngineSnapshot::initial(positions.position().clone()));

        let engine = Self {
            config: EngineConfig {
                symbol: settings.market.symbol.clone(),
                leverage: settings.risk.leverage,
                margin_mode: settings.risk.margin_mode,
                allocation_fraction: settings.engine.allocation_fraction,
                quantity_precision: settings.engine.quantity_precision,
                signal_history_len: settings.engine.signal_history_len.max(1),
                notice_history_len: settings.engine.notice_history_len.max(1),
            },
            executor: OrderExecutor::new(
                exchange.clone(),
                settings.engine.order_poll_interval(),
                settings.engine.order_timeout(),
            ),
            exchange,
            risk: RiskGate::from_settings(&settings.risk),
            positions,
            state: EngineState::Idle,
            queue: VecDeque::new(),
            inbox,
            snapshot,
            feed_health,
            indicator: None,
            signals: VecDeque::new(),
            notices: VecDeque::new(),
            last_mark: None,
            latency_ms: None,
            received_seq: 0,
            processed_seq: 0,
        };

        (engine, EngineHandle::new(tx, snapshot_rx))
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process commands until every handle is dropped
    pub async fn run(mut self) {
        tracing::info!(symbol = %self.config.symbol, "Trading engine task started");
        self.publish(None);

        while let Some(envelope) = self.inbox.recv().await {
            self.intake(envelope);
            self.drain_inbox();

            while let Some(work) = self.queue.pop_front() {
                self.process(work).await;
                self.drain_inbox();
                self.publish(None);
            }

            self.processed_seq = self.received_seq;
            self.publish(None);
        }

        tracing::info!(symbol = %self.config.symbol, "Trading engine task stopped");
    }

    fn drain_inbox(&mut self) {
        while let Ok(envelope) = self.inbox.try_recv() {
            self.intake(envelope);
        }
    }

    fn intake(&mut self, envelope: Envelope) {
        self.received_seq = self.received_seq.max(envelope.seq);

        match envelope.command {
            EngineCommand::Start => self.queue.push_back(Work::Start),
            EngineCommand::Stop => self.queue.push_back(Work::Stop),
            EngineCommand::Reconcile => {
                if !self.queue.contains(&Work::Reconcile) {
                    self.queue.push_back(Work::Reconcile);
                }
            }
            EngineCommand::Signal { signal, indicator } => self.on_signal(signal, indicator),
            EngineCommand::ManualOpen { side, size } => {
                self.on_manual(Intent::Open { side, size });
            }
            EngineCommand::ManualClose => self.on_manual(Intent::Close),
        }
    }

    fn on_signal(&mut self, signal: TradeSignal, indicator: Option<IndicatorState>) {
        if indicator.is_some() {
            self.indicator = indicator;
        }

        self.signals.push_back(signal.clone());
        while self.signals.len() > self.config.signal_history_len {
            self.signals.pop_front();
        }

        let intent = match signal.kind {
            SignalKind::OpenLong => Intent::Open {
                side: PositionSide::Long,
                size: None,
            },
            SignalKind::OpenShort => Intent::Open {
                side: PositionSide::Short,
                size: None,
            },
            SignalKind::Close => Intent::Close,
            SignalKind::Hold => return,
        };

        if !self.state.is_running() {
            tracing::debug!(kind = ?signal.kind, state = %self.state, "Signal ignored, strategy not running");
            return;
        }
        if self.feed_is_stale() {
            self.notify(
                NoticeKind::FeedStale,
                format!("{:?} signal dropped: candle feed is stale", signal.kind),
            );
            return;
        }

        let before = self.queue.len();
        self.queue.retain(|w| {
            !matches!(
                w,
                Work::Intent {
                    origin: TradeOrigin::Signal,
                    ..
                }
            )
        });
        if self.queue.len() < before {
            tracing::debug!("Queued signal superseded by newer {:?}", signal.kind);
        }

        tracing::info!(
            kind = ?signal.kind,
            candle = %signal.source_candle_time,
            strength = signal.strength,
            "🔔 Signal queued"
        );
        self.queue.push_back(Work::Intent {
            intent,
            origin: TradeOrigin::Signal,
        });
    }

    fn on_manual(&mut self, intent: Intent) {
        if !self.state.is_running() {
            self.notify(
                NoticeKind::CommandRejected,
                format!("manual {:?} rejected: strategy is {}", intent, self.state),
            );
            return;
        }

        let before = self.queue.len();
        self.queue.retain(|w| !matches!(w, Work::Intent { .. }));
        if self.queue.len() < before {
            tracing::info!(
                superseded = before - self.queue.len(),
                "Manual command supersedes queued intents"
            );
        }

        tracing::info!(?intent, "🖐️  Manual command queued");
        self.queue.push_back(Work::Intent {
            intent,
            origin: TradeOrigin::Manual,
        });
    }

    async fn process(&mut self, work: Work) {
        match work {
            Work::Start => self.start().await,
            Work::Stop => self.stop(),
            Work::Reconcile => self.reconcile().await,
            Work::Intent { intent, origin } => {
                if !self.state.is_running() {
                    tracing::debug!(?intent, state = %self.state, "Dropping intent, strategy not running");
                    return;
                }
                if origin == TradeOrigin::Signal && self.feed_is_stale() {
                    self.notify(
                        NoticeKind::FeedStale,
                        "queued signal dropped: candle feed is stale".to_string(),
                    );
                    return;
                }
                self.apply(intent, origin).await;
            }
        }
    }

    async fn start(&mut self) {
        if self.state.is_running() {
            tracing::debug!(state = %self.state, "Start ignored, already running");
            return;
        }

        let prior = self.state;
        tracing::info!(symbol = %self.config.symbol, from = %prior, "▶️  Starting strategy");

        if let Err(e) = self
            .exchange
            .set_leverage(&self.config.symbol, self.config.leverage)
            .await
        {
            self.on_exchange_error("set leverage", e, prior);
            return;
        }
        if let Err(e) = self
            .exchange
            .set_margin_mode(&self.config.symbol, self.config.margin_mode)
            .await
        {
            self.on_exchange_error("set margin mode", e, prior);
            return;
        }

        self.state = EngineState::Monitoring;
        self.reconcile().await;

        if self.state.is_running() {
            tracing::info!(
                state = %self.state,
                leverage = self.config.leverage,
                margin = %self.config.margin_mode,
                "✅ Strategy running"
            );
        }
    }

    fn stop(&mut self) {
        match self.state {
            EngineState::Monitoring => {
                self.state = EngineState::Idle;
                tracing::info!("⏹️  Strategy stopped");
            }
            EngineState::Halted => {
                self.state = EngineState::Idle;
                tracing::info!("⏹️  Halt acknowledged, engine idle");
            }
            EngineState::PositionOpen | EngineState::Closing => {
                self.notify(
                    NoticeKind::CommandRejected,
                    "stop rejected: close the open position first".to_string(),
                );
            }
            EngineState::Idle => tracing::debug!("Stop ignored, already idle"),
        }
    }

    /// Compare the cached position with the exchange and adopt exchange truth
    async fn reconcile(&mut self) {
        let symbol = self.config.symbol.clone();

        let started = Instant::now();
        let exchange_position = match self.exchange.get_position(&symbol).await {
            Ok(position) => position,
            Err(e) => {
                self.on_exchange_error("reconcile position", e, self.state);
                return;
            }
        };
        self.latency_ms = Some(started.elapsed().as_millis() as u64);

        match self.exchange.mark_price(&symbol).await {
            Ok(mark) => self.last_mark = Some(mark),
            Err(ExchangeError::Fatal(msg)) => {
                self.halt(format!("mark price: {}", msg));
                return;
            }
            Err(e) => tracing::warn!("Mark price unavailable during reconcile: {}", e),
        }

        let local = self.positions.position().clone();
        if self.positions.adopt(&exchange_position, self.last_mark) {
            self.notify(
                NoticeKind::DesyncDetected,
                format!(
                    "local {} {} vs exchange {} {}; adopted exchange state",
                    local.side, local.size, exchange_position.side, exchange_position.size
                ),
            );
        }

        if self.state.is_running() {
            self.state = if self.positions.position().is_flat() {
                EngineState::Monitoring
            } else {
                EngineState::PositionOpen
            };
        }

        self.refresh_equity().await;
        tracing::debug!(
            state = %self.state,
            side = %self.positions.position().side,
            latency_ms = ?self.latency_ms,
            "Reconciled with exchange"
        );
    }

    async fn refresh_equity(&mut self) {
        match self.exchange.account_equity().await {
            Ok(equity) => {
                let unrealized = self
                    .last_mark
                    .map_or(0.0, |mark| self.positions.unrealized_pnl(mark));
                self.positions.record_equity(equity, unrealized);
            }
            Err(ExchangeError::Fatal(msg)) => self.halt(format!("account equity: {}", msg)),
            Err(e) => tracing::warn!("Account equity unavailable: {}", e),
        }
    }

    async fn apply(&mut self, intent: Intent, origin: TradeOrigin) {
        let current = self.positions.position().clone();

        match intent {
            Intent::Close => {
                if current.is_flat() {
                    tracing::info!(?origin, "Already FLAT, nothing to close");
                    return;
                }
                self.close_position(origin).await;
            }
            Intent::Open { side, size } => {
                if side == PositionSide::Flat {
                    self.notify(
                        NoticeKind::CommandRejected,
                        "open requires LONG or SHORT".to_string(),
                    );
                    return;
                }
                if !current.is_flat() && current.side == side {
                    tracing::info!(%side, ?origin, "Already in requested position, nothing to do");
                    return;
                }
                // no order, not even the reversal close, before the new leg is authorized
                let Some((size, mark)) = self.prepare_open(size).await else {
                    return;
                };
                // reversal: the close must be confirmed FLAT before the new entry
                if !current.is_flat() && !self.close_position(origin).await {
                    tracing::warn!(%side, "Reversal aborted, close not confirmed");
                    return;
                }
                self.submit_open(side, size, mark, origin).await;
            }
        }
    }

    /// Close the whole position; true once the exchange confirms FLAT
    async fn close_position(&mut self, reason: TradeOrigin) -> bool {
        let position = self.positions.position().clone();
        let Some(exit_side) = position.side.opposite().entry_order_side() else {
            return true;
        };
        let prior = self.state;

        let decision = self.risk.authorize(&RiskRequest {
            size: position.size,
            price: self.last_mark.unwrap_or(position.entry_price),
            leverage: position.leverage,
            margin_mode: position.margin_mode,
            equity: 0.0,
            reduce_only: true,
        });
        if let RiskDecision::Deny(denial) = decision {
            self.deny(denial);
            return false;
        }

        let request = OrderRequest::market(&self.config.symbol, exit_side, position.size, true);
        tracing::info!(
            side = %position.side,
            size = position.size,
            ?reason,
            "Closing position"
        );
        self.state = EngineState::Closing;
        self.publish(Some(&request));

        match self.executor.execute(request).await {
            Ok(result) if result.status == OrderStatus::Filled => {
                let confirmed = match self.exchange.get_position(&self.config.symbol).await {
                    Ok(after) => after,
                    Err(e) => {
                        self.on_order_error(e, prior).await;
                        return false;
                    }
                };
                if !confirmed.is_flat() {
                    tracing::warn!(
                        side = %confirmed.side,
                        size = confirmed.size,
                        "Close filled but exchange still reports a position"
                    );
                    self.state = prior;
                    self.reconcile().await;
                    return self.positions.position().is_flat();
                }

                let exit_price = result
                    .avg_price
                    .or(self.last_mark)
                    .unwrap_or(position.entry_price);
                self.positions.record_close(exit_price, reason);
                self.state = EngineState::Monitoring;
                self.refresh_equity().await;
                true
            }
            Ok(result) => {
                self.state = prior;
                self.on_unfilled(result.status, result.filled_size).await;
                self.positions.position().is_flat()
            }
            Err(OrderError::SlotBusy(symbol)) => {
                self.state = prior;
                self.notify(
                    NoticeKind::OrderRejected,
                    format!("close refused: an order is already in flight for {}", symbol),
                );
                false
            }
            Err(OrderError::Exchange(e)) => {
                self.on_order_error(e, prior).await;
                false
            }
        }
    }

    /// Size an entry from mark price and equity and run it through the risk gate.
    ///
    /// Returns the authorized size and the mark it was priced at; nothing is
    /// sent to the exchange here.
    async fn prepare_open(&mut self, size: Option<f64>) -> Option<(f64, f64)> {
        let prior = self.state;
        let symbol = self.config.symbol.clone();

        let mark = match self.exchange.mark_price(&symbol).await {
            Ok(mark) => mark,
            Err(e) => {
                self.on_order_error(e, prior).await;
                return None;
            }
        };
        self.last_mark = Some(mark);

        let equity = match self.exchange.account_equity().await {
            Ok(equity) => equity,
            Err(e) => {
                self.on_order_error(e, prior).await;
                return None;
            }
        };

        let raw_size = size.unwrap_or_else(|| {
            equity * self.config.allocation_fraction * self.config.leverage as f64 / mark
        });
        let size = floor_to_precision(raw_size, self.config.quantity_precision);

        let decision = self.risk.authorize(&RiskRequest {
            size,
            price: mark,
            leverage: self.config.leverage,
            margin_mode: self.config.margin_mode,
            equity,
            reduce_only: false,
        });
        if let RiskDecision::Deny(reason) = decision {
            self.deny(reason);
            return None;
        }

        tracing::debug!(size, mark, equity, "Entry authorized");
        Some((size, mark))
    }

    async fn submit_open(&mut self, side: PositionSide, size: f64, mark: f64, origin: TradeOrigin) {
        let prior = self.state;
        let symbol = self.config.symbol.clone();

        let Some(order_side) = side.entry_order_side() else {
            return;
        };
        let request = OrderRequest::market(&symbol, order_side, size, false);
        tracing::info!(%side, size, mark, ?origin, "Opening position");
        self.publish(Some(&request));

        match self.executor.execute(request).await {
            Ok(result) if result.status == OrderStatus::Filled => {
                let filled = if result.filled_size > 0.0 { result.filled_size } else { size };
                self.positions
                    .record_open(side, filled, result.avg_price.unwrap_or(mark), origin);
                self.state = EngineState::PositionOpen;
            }
            Ok(result) => {
                self.state = prior;
                self.on_unfilled(result.status, result.filled_size).await;
            }
            Err(OrderError::SlotBusy(symbol)) => {
                self.state = prior;
                self.notify(
                    NoticeKind::OrderRejected,
                    format!("open refused: an order is already in flight for {}", symbol),
                );
            }
            Err(OrderError::Exchange(e)) => self.on_order_error(e, prior).await,
        }
    }

    /// Order ended without a full fill
    async fn on_unfilled(&mut self, status: OrderStatus, filled: f64) {
        if status == OrderStatus::Rejected || (status == OrderStatus::Canceled && filled <= 0.0) {
            self.notify(
                NoticeKind::OrderRejected,
                format!("order ended {:?} without a fill", status),
            );
            return;
        }

        // partial fills are adopted from the exchange position
        tracing::warn!(?status, filled, "Order ended partially filled, reconciling");
        self.reconcile().await;
    }

    /// Exchange failure while driving an order
    async fn on_order_error(&mut self, e: ExchangeError, prior: EngineState) {
        let transient = e.is_transient();
        self.on_exchange_error("order", e, prior);
        if transient {
            // the order may or may not have reached the exchange
            self.reconcile().await;
        }
    }

    fn on_exchange_error(&mut self, context: &str, e: ExchangeError, prior: EngineState) {
        self.state = prior;
        match e {
            ExchangeError::Fatal(msg) => self.halt(format!("{}: {}", context, msg)),
            ExchangeError::Rejected { code, message } => self.notify(
                NoticeKind::OrderRejected,
                format!("{} rejected by exchange ({}): {}", context, code, message),
            ),
            ExchangeError::Transient(msg) => self.notify(
                NoticeKind::TransientFailure,
                format!("{} failed after retries: {}", context, msg),
            ),
        }
    }

    fn deny(&mut self, reason: DenialReason) {
        self.notify(NoticeKind::RiskDenied, format!("risk gate denied order: {}", reason));
    }

    fn halt(&mut self, reason: String) {
        tracing::error!(symbol = %self.config.symbol, "💀 Fatal error, halting engine: {}", reason);
        self.state = EngineState::Halted;
        self.queue.retain(|w| !matches!(w, Work::Intent { .. }));
        self.notify(NoticeKind::Halted, reason);
    }

    fn notify(&mut self, kind: NoticeKind, message: String) {
        match kind {
            NoticeKind::Halted => {}
            NoticeKind::DesyncDetected | NoticeKind::FeedStale | NoticeKind::TransientFailure => {
                tracing::warn!(?kind, "⚠️  {}", message)
            }
            _ => tracing::warn!(?kind, "🛑 {}", message),
        }

        self.notices.push_back(EngineNotice {
            at: Utc::now(),
            kind,
            message,
        });
        while self.notices.len() > self.config.notice_history_len {
            self.notices.pop_front();
        }
    }

    fn feed_is_stale(&self) -> bool {
        self.feed_health.borrow().stale
    }

    fn publish(&mut self, in_flight: Option<&OrderRequest>) {
        let position = self.positions.position().clone();
        if self.state == EngineState::PositionOpen && position.is_flat() {
            tracing::error!("Invariant violated: POSITION_OPEN with a FLAT position");
        }

        let snapshot = EngineSnapshot {
            symbol: self.config.symbol.clone(),
            state: self.state,
            unrealized_pnl: self
                .last_mark
                .map_or(0.0, |mark| position.unrealized_pnl(mark)),
            position,
            open_trade: self.positions.open_trade().cloned(),
            in_flight: in_flight
                .cloned()
                .or_else(|| self.executor.slot().current()),
            indicator: self.indicator.clone(),
            recent_signals: self.signals.iter().cloned().collect(),
            equity_curve: self.positions.equity_curve().cloned().collect(),
            closed_trades: self.positions.closed_trades().to_vec(),
            stats: TradeStats::compute(
                self.positions.closed_trades(),
                self.positions.equity_curve(),
                self.positions.initial_equity(),
            ),
            notices: self.notices.iter().cloned().collect(),
            feed: self.feed_health.borrow().clone(),
            latency_ms: self.latency_ms,
            processed_seq: self.processed_seq,
            updated_at: Utc::now(),
        };

        self.snapshot.send_replace(snapshot);
    }
}

/// Round a quantity down to the exchange's step
pub fn floor_to_precision(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    // absorb representation error such as 0.3 * 1000 = 299.99999999999994
    ((value * factor) + 1e-9).floor() / factor
}
