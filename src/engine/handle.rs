use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

use super::state::EngineSnapshot;
use crate::error::EngineError;
use crate::indicators::IndicatorState;
use crate::models::{PositionSide, TradeSignal};

/// Inputs accepted by the engine task
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    Start,
    Stop,
    /// `size = None` sizes the entry from equity like an automatic signal
    ManualOpen {
        side: PositionSide,
        size: Option<f64>,
    },
    ManualClose,
    Signal {
        signal: TradeSignal,
        indicator: Option<IndicatorState>,
    },
    Reconcile,
}

#[derive(Debug)]
pub(crate) struct Envelope {
    pub seq: u64,
    pub command: EngineCommand,
}

/// Receipt for an accepted command; the effect shows up in a later snapshot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandAck {
    pub seq: u64,
    pub issued_at: DateTime<Utc>,
}

/// Command and query interface to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct EngineHandle {
    sender: Arc<Mutex<(u64, mpsc::UnboundedSender<Envelope>)>>,
    snapshot: watch::Receiver<EngineSnapshot>,
}

impl EngineHandle {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<Envelope>,
        snapshot: watch::Receiver<EngineSnapshot>,
    ) -> Self {
        Self {
            sender: Arc::new(Mutex::new((0, tx))),
            snapshot,
        }
    }

    pub fn start(&self) -> Result<CommandAck, EngineError> {
        self.send(EngineCommand::Start)
    }

    pub fn stop(&self) -> Result<CommandAck, EngineError> {
        self.send(EngineCommand::Stop)
    }

    pub fn manual_open(
        &self,
        side: PositionSide,
        size: Option<f64>,
    ) -> Result<CommandAck, EngineError> {
        self.send(EngineCommand::ManualOpen { side, size })
    }

    pub fn manual_close(&self) -> Result<CommandAck, EngineError> {
        self.send(EngineCommand::ManualClose)
    }

    pub fn submit_signal(
        &self,
        signal: TradeSignal,
        indicator: Option<IndicatorState>,
    ) -> Result<CommandAck, EngineError> {
        self.send(EngineCommand::Signal { signal, indicator })
    }

    pub fn reconcile_now(&self) -> Result<CommandAck, EngineError> {
        self.send(EngineCommand::Reconcile)
    }

    /// Sequence numbers are assigned and sent under one lock so the engine sees them in order
    pub fn send(&self, command: EngineCommand) -> Result<CommandAck, EngineError> {
        let mut sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        let seq = sender.0 + 1;
        sender
            .1
            .send(Envelope { seq, command })
            .map_err(|_| EngineError::Closed)?;
        sender.0 = seq;

        Ok(CommandAck {
            seq,
            issued_at: Utc::now(),
        })
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot.clone()
    }

    /// Resolve once the engine has fully handled command `seq`
    pub async fn wait_processed(&self, seq: u64) -> Result<EngineSnapshot, EngineError> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|s| s.processed_seq >= seq)
            .await
            .map_err(|_| EngineError::Closed)?;
        Ok(snapshot.clone())
    }
}
