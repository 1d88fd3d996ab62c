//! Shared test doubles.

use crate::delivery::{DeliveryClient, DeliveryFailure, DeliveryRequest};
use std::sync::Mutex;

/// Scripted delivery client: pops one outcome per call and records every
/// request it sees. Once the script runs out it answers with generated IDs.
pub(crate) struct MockDelivery {
    outcomes: Mutex<Vec<Result<String, DeliveryFailure>>>,
    pub calls: Mutex<Vec<DeliveryRequest>>,
}

impl MockDelivery {
    pub fn new(outcomes: Vec<Result<String, DeliveryFailure>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl DeliveryClient for MockDelivery {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<String, DeliveryFailure> {
        let call_number = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(request.clone());
            calls.len()
        };
        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.is_empty() {
            Ok(format!("mem_auto_{call_number}"))
        } else {
            outcomes.remove(0)
        }
    }
}
