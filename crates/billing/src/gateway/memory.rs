use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use common::GatewaySessionId;
use parking_lot::Mutex;

use super::{CheckoutGateway, CheckoutRequest, CheckoutSession, GatewayError};

#[derive(Debug, Default)]
struct GatewayState {
    calls: usize,
    next_session: u64,
    failing: bool,
    scripted: VecDeque<GatewayError>,
    requests: Vec<CheckoutRequest>,
}

/// In-memory gateway for testing.
///
/// Hands out sequential `cs_test_<n>` sessions. Failures can be scripted per
/// call or switched on for every call.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckoutGateway {
    state: Arc<Mutex<GatewayState>>,
}

impl InMemoryCheckoutGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail transiently until switched off.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    /// Queues an error for the next call.
    pub fn fail_next(&self, error: GatewayError) {
        self.state.lock().scripted.push_back(error);
    }

    /// Number of calls that reached the gateway.
    pub fn call_count(&self) -> usize {
        self.state.lock().calls
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<CheckoutRequest> {
        self.state.lock().requests.clone()
    }
}

#[async_trait]
impl CheckoutGateway for InMemoryCheckoutGateway {
    async fn create_session(&self, request: &CheckoutRequest) -> Result<CheckoutSession, GatewayError> {
        let mut state = self.state.lock();
        state.calls += 1;
        state.requests.push(request.clone());

        if let Some(error) = state.scripted.pop_front() {
            return Err(error);
        }
        if state.failing {
            return Err(GatewayError::Transient("gateway unreachable".to_string()));
        }

        state.next_session += 1;
        let id = format!("cs_test_{}", state.next_session);
        Ok(CheckoutSession {
            checkout_url: format!("https://checkout.stripe.test/c/pay/{id}"),
            session_id: GatewaySessionId::new(id),
        })
    }
}
