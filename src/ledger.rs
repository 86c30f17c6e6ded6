//! Order ledger and delivery book
//!
//! The ledger owns every order and is the single place lifecycle
//! transitions are applied. `try_transition` enforces the monotonic state
//! machine, which is what lets the scheduler, the settlement path and the
//! cancel path race without extra coordination: whichever transition lands
//! first wins, the loser gets `false` back and leaves the books alone.

use crate::types::{DeliveryRecord, DeliveryStatus, Order, OrderState};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use uuid::Uuid;

pub struct OrderLedger {
    orders: DashMap<Uuid, Order>,
}

impl OrderLedger {
    pub fn new() -> Self {
        Self {
            orders: DashMap::new(),
        }
    }

    pub fn insert(&self, order: Order) {
        self.orders.insert(order.id, order);
    }

    pub fn get(&self, id: Uuid) -> Option<Order> {
        self.orders.get(&id).map(|o| o.clone())
    }

    /// Apply a lifecycle transition if the state machine allows it
    pub fn try_transition(&self, id: Uuid, next: OrderState) -> bool {
        let Some(mut order) = self.orders.get_mut(&id) else {
            return false;
        };
        if !order.state.can_transition_to(next) {
            return false;
        }
        order.state = next;
        true
    }

    /// Transition to Failed with a reason; no-op on terminal orders
    pub fn try_fail(&self, id: Uuid, reason: &str) -> bool {
        let Some(mut order) = self.orders.get_mut(&id) else {
            return false;
        };
        if !order.state.can_transition_to(OrderState::Failed) {
            return false;
        }
        order.state = OrderState::Failed;
        order.failure_reason = Some(reason.to_string());
        true
    }

    /// Fail the order only if it is still in `expected`. Lets a canceller
    /// know atomically whether it beat the scheduler to the order.
    pub fn try_fail_from(&self, id: Uuid, expected: OrderState, reason: &str) -> bool {
        let Some(mut order) = self.orders.get_mut(&id) else {
            return false;
        };
        if order.state != expected || !order.state.can_transition_to(OrderState::Failed) {
            return false;
        }
        order.state = OrderState::Failed;
        order.failure_reason = Some(reason.to_string());
        true
    }

    pub fn set_provider(&self, id: Uuid, provider_id: Uuid) {
        if let Some(mut order) = self.orders.get_mut(&id) {
            order.provider_id = Some(provider_id);
        }
    }

    pub fn bump_retries(&self, id: Uuid) {
        if let Some(mut order) = self.orders.get_mut(&id) {
            order.retries += 1;
        }
    }

    pub fn set_executed(&self, id: Uuid, realized_value: f64, executed_at: DateTime<Utc>) {
        if let Some(mut order) = self.orders.get_mut(&id) {
            order.realized_value = Some(realized_value);
            order.executed_at = Some(executed_at);
        }
    }

    pub fn filtered(
        &self,
        account_ref: Option<&str>,
        state: Option<OrderState>,
    ) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter(|o| account_ref.map_or(true, |a| o.account_ref == a))
            .filter(|o| state.map_or(true, |s| o.state == s))
            .map(|o| o.clone())
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        orders
    }

    pub fn counts_by_state(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for order in self.orders.iter() {
            *counts.entry(order.state.as_str().to_string()).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

impl Default for OrderLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Physical delivery records keyed by delivery id
pub struct DeliveryBook {
    deliveries: DashMap<Uuid, DeliveryRecord>,
}

impl DeliveryBook {
    pub fn new() -> Self {
        Self {
            deliveries: DashMap::new(),
        }
    }

    pub fn insert(&self, record: DeliveryRecord) {
        self.deliveries.insert(record.id, record);
    }

    pub fn get(&self, id: Uuid) -> Option<DeliveryRecord> {
        self.deliveries.get(&id).map(|d| d.clone())
    }

    /// Advance delivery status; backwards moves are rejected
    pub fn advance_status(&self, id: Uuid, next: DeliveryStatus) -> bool {
        let Some(mut record) = self.deliveries.get_mut(&id) else {
            return false;
        };
        if next.rank() <= record.status.rank() {
            return false;
        }
        record.status = next;
        true
    }

    pub fn all(&self) -> Vec<DeliveryRecord> {
        let mut records: Vec<DeliveryRecord> = self
            .deliveries
            .iter()
            .map(|d| d.clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }
}

impl Default for DeliveryBook {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Commodity, OrderSide};

    fn sample_order(state: OrderState) -> Order {
        Order {
            id: Uuid::new_v4(),
            account_ref: "ACC-1001".to_string(),
            commodity: Commodity::Gold9999,
            side: OrderSide::Buy,
            units: 10.0,
            unit_price: 60_000.0,
            total_value: 600_000.0,
            provider_id: None,
            state,
            realized_value: None,
            market_impact_bps: 1.5,
            failure_reason: None,
            retries: 0,
            created_at: Utc::now(),
            executed_at: None,
        }
    }

    #[test]
    fn lifecycle_only_moves_forward() {
        let ledger = OrderLedger::new();
        let order = sample_order(OrderState::Reserved);
        let id = order.id;
        ledger.insert(order);

        assert!(ledger.try_transition(id, OrderState::Executing));
        assert!(!ledger.try_transition(id, OrderState::Reserved));
        assert!(!ledger.try_transition(id, OrderState::Pending));
        assert!(ledger.try_transition(id, OrderState::Executed));
        assert!(ledger.try_transition(id, OrderState::Settled));
        assert_eq!(ledger.get(id).unwrap().state, OrderState::Settled);
    }

    #[test]
    fn failed_is_terminal() {
        let ledger = OrderLedger::new();
        let order = sample_order(OrderState::Executing);
        let id = order.id;
        ledger.insert(order);

        assert!(ledger.try_fail(id, "provider timeout"));
        assert!(!ledger.try_transition(id, OrderState::Executed));
        assert!(!ledger.try_fail(id, "second failure"));

        let stored = ledger.get(id).unwrap();
        assert_eq!(stored.state, OrderState::Failed);
        assert_eq!(stored.failure_reason.as_deref(), Some("provider timeout"));
    }

    #[test]
    fn racing_transitions_have_a_single_winner() {
        let ledger = OrderLedger::new();
        let order = sample_order(OrderState::Reserved);
        let id = order.id;
        ledger.insert(order);

        // Cancel and execution race on a reserved order
        let cancel_won = ledger.try_fail(id, "cancelled by account holder");
        let exec_won = ledger.try_transition(id, OrderState::Executing);
        assert!(cancel_won);
        assert!(!exec_won);
    }

    #[test]
    fn filters_by_account_and_state() {
        let ledger = OrderLedger::new();
        let mut other = sample_order(OrderState::Reserved);
        other.account_ref = "ACC-2002".to_string();
        ledger.insert(sample_order(OrderState::Reserved));
        ledger.insert(sample_order(OrderState::Settled));
        ledger.insert(other);

        assert_eq!(ledger.filtered(Some("ACC-1001"), None).len(), 2);
        assert_eq!(ledger.filtered(None, Some(OrderState::Reserved)).len(), 2);
        assert_eq!(
            ledger
                .filtered(Some("ACC-1001"), Some(OrderState::Settled))
                .len(),
            1
        );
        assert_eq!(ledger.counts_by_state()["reserved"], 2);
    }

    #[test]
    fn delivery_status_never_regresses() {
        let book = DeliveryBook::new();
        let record = DeliveryRecord {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            quantity: 10.0,
            origin: "Central bullion vault".to_string(),
            destination: "ACC-1001".to_string(),
            carrier: "armored-freight".to_string(),
            status: DeliveryStatus::Scheduled,
            tracking_id: "TRK-TEST".to_string(),
            scheduled_for: Utc::now(),
            created_at: Utc::now(),
        };
        let id = record.id;
        book.insert(record);

        assert!(book.advance_status(id, DeliveryStatus::InTransit));
        assert!(!book.advance_status(id, DeliveryStatus::Scheduled));
        assert!(book.advance_status(id, DeliveryStatus::Delivered));
        assert!(book.advance_status(id, DeliveryStatus::Confirmed));
        assert!(!book.advance_status(id, DeliveryStatus::Confirmed));
    }
}
