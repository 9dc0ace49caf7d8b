use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::api::ExecutionClient;
use crate::error::OrderError;
use crate::models::{OrderRequest, OrderResult};

/// Single-slot holder for the order in flight on one symbol
#[derive(Debug, Clone, Default)]
pub struct InFlightSlot {
    inner: Arc<Mutex<Option<OrderRequest>>>,
}

/// Releases the slot when dropped
#[derive(Debug)]
pub struct InFlightGuard {
    inner: Arc<Mutex<Option<OrderRequest>>>,
}

impl InFlightSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for `request`; `None` if another order holds it
    pub fn try_acquire(&self, request: &OrderRequest) -> Option<InFlightGuard> {
        let mut slot = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return None;
        }
        *slot = Some(request.clone());

        Some(InFlightGuard {
            inner: self.inner.clone(),
        })
    }

    pub fn current(&self) -> Option<OrderRequest> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_busy(&self) -> bool {
        self.current().is_some()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Places market orders and follows them until the exchange reports a terminal status
pub struct OrderExecutor {
    exchange: Arc<dyn ExecutionClient>,
    slot: InFlightSlot,
    poll_interval: Duration,
    timeout: Duration,
}

impl OrderExecutor {
    pub fn new(exchange: Arc<dyn ExecutionClient>, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            exchange,
            slot: InFlightSlot::new(),
            poll_interval,
            timeout,
        }
    }

    pub fn slot(&self) -> &InFlightSlot {
        &self.slot
    }

    /// Submit `request` and poll until FILLED, REJECTED or CANCELED
    ///
    /// An order still open after the timeout is cancelled and its last known
    /// state returned, which may carry a partial fill.
    pub async fn execute(&self, request: OrderRequest) -> Result<OrderResult, OrderError> {
        let _guard = self
            .slot
            .try_acquire(&request)
            .ok_or_else(|| OrderError::SlotBusy(request.symbol.clone()))?;

        let mut result = self.exchange.place_order(&request).await?;
        tracing::info!(
            client_id = %request.client_id,
            status = ?result.status,
            "Order accepted by exchange"
        );

        let deadline = Instant::now() + self.timeout;
        while !result.status.is_terminal() {
            if Instant::now() >= deadline {
                tracing::warn!(
                    client_id = %request.client_id,
                    filled = result.filled_size,
                    "⏱️  Order not terminal after {:?}, cancelling",
                    self.timeout
                );
                result = match self
                    .exchange
                    .cancel_order(&request.symbol, &request.client_id)
                    .await
                {
                    Ok(cancelled) => cancelled,
                    Err(e) => {
                        // A fill can race the cancel
                        tracing::warn!(client_id = %request.client_id, "Cancel failed: {}", e);
                        self.exchange
                            .get_order_status(&request.symbol, &request.client_id)
                            .await?
                    }
                };
                break;
            }

            tokio::time::sleep(self.poll_interval).await;
            result = self
                .exchange
                .get_order_status(&request.symbol, &request.client_id)
                .await?;
        }

        tracing::info!(
            client_id = %request.client_id,
            status = ?result.status,
            filled = result.filled_size,
            avg_price = ?result.avg_price,
            "Order resolved"
        );
        Ok(result)
    }
}
