//! Transactional credit ledger boundary and an in-process implementation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::Mode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Reserved,
    Finalized,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditReservation {
    pub id: String,
    pub user_id: String,
    pub mode: Mode,
    pub max_credits: u32,
    pub actual_charged: Option<u32>,
    pub refunded: Option<u32>,
    pub status: ReservationStatus,
}

impl CreditReservation {
    fn settlement(&self, already_settled: bool) -> Settlement {
        Settlement {
            charged: self.actual_charged.unwrap_or(0),
            refunded: self.refunded.unwrap_or(0),
            already_settled,
        }
    }
}

/// Outcome of finalize or cancel. `charged + refunded` always equals the
/// reservation's `max_credits`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub charged: u32,
    pub refunded: u32,
    /// The reservation was already settled; nothing changed.
    pub already_settled: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The backing store has no such operation; callers treat this as "no
    /// reservation system".
    #[error("ledger operation '{0}' is not available")]
    FunctionNotFound(&'static str),

    #[error("insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: u32, available: u32 },

    #[error("credit rate limit reached")]
    RateLimited { retry_after: Option<Duration> },

    #[error("unknown reservation {0}")]
    UnknownReservation(String),

    #[error("ledger backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait CreditLedger: Send + Sync {
    async fn reserve(
        &self,
        user_id: &str,
        mode: Mode,
        max_credits: u32,
    ) -> Result<CreditReservation, LedgerError>;

    /// Idempotent by id: a repeated call reports the first settlement.
    async fn finalize(
        &self,
        reservation_id: &str,
        actual_credits: u32,
    ) -> Result<Settlement, LedgerError>;

    async fn cancel(&self, reservation_id: &str) -> Result<Settlement, LedgerError>;
}

#[derive(Default)]
struct LedgerState {
    balances: HashMap<String, u32>,
    reservations: HashMap<String, CreditReservation>,
    next_id: u64,
}

/// Ledger held in process memory. Reserved credits leave the balance at
/// reserve time and the unused part comes back on settle.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(self, user_id: &str, credits: u32) -> Self {
        self.set_balance(user_id, credits);
        self
    }

    pub fn set_balance(&self, user_id: &str, credits: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.balances.insert(user_id.to_string(), credits);
        }
    }

    pub fn balance(&self, user_id: &str) -> u32 {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.balances.get(user_id).copied())
            .unwrap_or(0)
    }

    pub fn reservation(&self, id: &str) -> Option<CreditReservation> {
        self.state.lock().ok()?.reservations.get(id).cloned()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LedgerState>, LedgerError> {
        self.state
            .lock()
            .map_err(|_| LedgerError::Backend("ledger state poisoned".into()))
    }

    fn settle(&self, id: &str, charge: Option<u32>) -> Result<Settlement, LedgerError> {
        let mut state = self.lock()?;
        let reservation = state
            .reservations
            .get_mut(id)
            .ok_or_else(|| LedgerError::UnknownReservation(id.to_string()))?;
        if reservation.status != ReservationStatus::Reserved {
            return Ok(reservation.settlement(true));
        }

        let (status, charged) = match charge {
            Some(actual) => (ReservationStatus::Finalized, actual.min(reservation.max_credits)),
            None => (ReservationStatus::Cancelled, 0),
        };
        let refunded = reservation.max_credits - charged;
        reservation.status = status;
        reservation.actual_charged = Some(charged);
        reservation.refunded = Some(refunded);
        let settlement = reservation.settlement(false);
        let user = reservation.user_id.clone();

        *state.balances.entry(user).or_insert(0) += refunded;
        Ok(settlement)
    }
}

#[async_trait]
impl CreditLedger for MemoryLedger {
    async fn reserve(
        &self,
        user_id: &str,
        mode: Mode,
        max_credits: u32,
    ) -> Result<CreditReservation, LedgerError> {
        let mut state = self.lock()?;
        let available = state.balances.get(user_id).copied().unwrap_or(0);
        if available < max_credits {
            return Err(LedgerError::InsufficientCredits {
                required: max_credits,
                available,
            });
        }
        state.balances.insert(user_id.to_string(), available - max_credits);

        state.next_id += 1;
        let reservation = CreditReservation {
            id: format!("res-{}", state.next_id),
            user_id: user_id.to_string(),
            mode,
            max_credits,
            actual_charged: None,
            refunded: None,
            status: ReservationStatus::Reserved,
        };
        state
            .reservations
            .insert(reservation.id.clone(), reservation.clone());
        Ok(reservation)
    }

    async fn finalize(
        &self,
        reservation_id: &str,
        actual_credits: u32,
    ) -> Result<Settlement, LedgerError> {
        self.settle(reservation_id, Some(actual_credits))
    }

    async fn cancel(&self, reservation_id: &str) -> Result<Settlement, LedgerError> {
        self.settle(reservation_id, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finalize_charges_actual_and_refunds_rest() {
        let ledger = MemoryLedger::new().with_balance("u1", 10);
        let r = ledger.reserve("u1", Mode::Brainstorm, 6).await.unwrap();
        assert_eq!(ledger.balance("u1"), 4);

        let s = ledger.finalize(&r.id, 2).await.unwrap();
        assert_eq!((s.charged, s.refunded), (2, 4));
        assert!(!s.already_settled);
        assert_eq!(ledger.balance("u1"), 8);

        let stored = ledger.reservation(&r.id).unwrap();
        assert_eq!(stored.status, ReservationStatus::Finalized);
        assert_eq!(
            stored.actual_charged.unwrap() + stored.refunded.unwrap(),
            stored.max_credits
        );
    }

    #[tokio::test]
    async fn second_finalize_is_a_no_op() {
        let ledger = MemoryLedger::new().with_balance("u1", 10);
        let r = ledger.reserve("u1", Mode::Brainstorm, 6).await.unwrap();
        ledger.finalize(&r.id, 2).await.unwrap();

        let again = ledger.finalize(&r.id, 5).await.unwrap();
        assert_eq!((again.charged, again.refunded), (2, 4));
        assert!(again.already_settled);
        assert_eq!(ledger.balance("u1"), 8);
    }

    #[tokio::test]
    async fn cancel_refunds_everything_and_blocks_finalize() {
        let ledger = MemoryLedger::new().with_balance("u1", 4);
        let r = ledger.reserve("u1", Mode::Research, 4).await.unwrap();
        assert_eq!(ledger.balance("u1"), 0);

        let s = ledger.cancel(&r.id).await.unwrap();
        assert_eq!((s.charged, s.refunded), (0, 4));
        assert_eq!(ledger.balance("u1"), 4);

        let late = ledger.finalize(&r.id, 3).await.unwrap();
        assert!(late.already_settled);
        assert_eq!(late.charged, 0);
        assert_eq!(ledger.balance("u1"), 4);
    }

    #[tokio::test]
    async fn finalize_caps_charge_at_reserved_max() {
        let ledger = MemoryLedger::new().with_balance("u1", 1);
        let r = ledger.reserve("u1", Mode::Web, 1).await.unwrap();
        let s = ledger.finalize(&r.id, 3).await.unwrap();
        assert_eq!((s.charged, s.refunded), (1, 0));
    }

    #[tokio::test]
    async fn reserve_rejects_short_balance() {
        let ledger = MemoryLedger::new().with_balance("u1", 2);
        match ledger.reserve("u1", Mode::Research, 4).await {
            Err(LedgerError::InsufficientCredits {
                required,
                available,
            }) => assert_eq!((required, available), (4, 2)),
            other => panic!("expected InsufficientCredits, got: {other:?}"),
        }
        assert_eq!(ledger.balance("u1"), 2);
    }

    #[tokio::test]
    async fn unknown_reservation_is_an_error() {
        let ledger = MemoryLedger::new();
        assert!(matches!(
            ledger.finalize("nope", 1).await,
            Err(LedgerError::UnknownReservation(_))
        ));
    }
}
