//! Reserve-at-max, finalize-on-actual credit protocol.
//!
//! `CreditClient::admit` runs before any paid work. The returned `Admission`
//! must be settled exactly once: `finalize` after success, `cancel` after a
//! failure. Settling happens in a detached task with its own timeout, and an
//! `Admission` dropped unsettled cancels its reservation.

pub mod ledger;
pub mod limiter;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ledger::{CreditLedger, CreditReservation, LedgerError, Settlement};
use limiter::LegacyLimiter;

const ANONYMOUS: &str = "anonymous";

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Web,
    #[default]
    Research,
    Brainstorm,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Web => "web",
            Mode::Research => "research",
            Mode::Brainstorm => "brainstorm",
        }
    }

    pub fn min_credits(self) -> u32 {
        match self {
            Mode::Web => 1,
            Mode::Research => 3,
            Mode::Brainstorm => 4,
        }
    }

    /// Amount reserved up front.
    pub fn max_credits(self) -> u32 {
        match self {
            Mode::Web => 1,
            Mode::Research => 4,
            Mode::Brainstorm => 6,
        }
    }

    /// Nothing is charged when every search came from cache.
    pub fn credits_for(self, live_searches: u32) -> u32 {
        if live_searches == 0 {
            0
        } else {
            live_searches.clamp(self.min_credits(), self.max_credits())
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hard denials; every other ledger problem admits the request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CreditDenial {
    #[error("insufficient credits: {required} required, {available} available")]
    Insufficient { required: u32, available: u32 },

    #[error("rate limit reached")]
    RateLimited { retry_after: Option<Duration> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metering {
    /// Credits held in the ledger until settled.
    Reserved,
    /// Ledger absent; admitted through the legacy counter.
    Legacy,
    /// Ledger failed; admitted without metering.
    Unmetered,
}

#[derive(Clone)]
pub struct CreditClient {
    ledger: Arc<dyn CreditLedger>,
    limiter: Arc<LegacyLimiter>,
    settle_timeout: Duration,
}

impl CreditClient {
    pub fn new(ledger: Arc<dyn CreditLedger>, settle_timeout: Duration) -> Self {
        Self {
            ledger,
            limiter: Arc::new(LegacyLimiter::default()),
            settle_timeout,
        }
    }

    pub fn with_limiter(mut self, limiter: LegacyLimiter) -> Self {
        self.limiter = Arc::new(limiter);
        self
    }

    /// Reserves the mode's maximum for `user_id`. Anonymous callers only go
    /// through the legacy counter.
    pub async fn admit(
        &self,
        user_id: Option<&str>,
        mode: Mode,
    ) -> Result<Admission, CreditDenial> {
        let Some(user_id) = user_id else {
            self.check_legacy(ANONYMOUS)?;
            return Ok(self.admission(mode, Metering::Legacy, None));
        };

        match self.ledger.reserve(user_id, mode, mode.max_credits()).await {
            Ok(reservation) => {
                info!(
                    reservation = %reservation.id,
                    user = user_id,
                    %mode,
                    credits = reservation.max_credits,
                    "credits reserved"
                );
                Ok(self.admission(mode, Metering::Reserved, Some(reservation)))
            }
            Err(LedgerError::InsufficientCredits {
                required,
                available,
            }) => Err(CreditDenial::Insufficient {
                required,
                available,
            }),
            Err(LedgerError::RateLimited { retry_after }) => {
                Err(CreditDenial::RateLimited { retry_after })
            }
            Err(LedgerError::FunctionNotFound(op)) => {
                info!(op, "credit ledger unavailable, using legacy rate limit");
                self.check_legacy(user_id)?;
                Ok(self.admission(mode, Metering::Legacy, None))
            }
            Err(e) => {
                warn!(user = user_id, error = %e, "credit reserve failed, admitting unmetered");
                Ok(self.admission(mode, Metering::Unmetered, None))
            }
        }
    }

    fn check_legacy(&self, key: &str) -> Result<(), CreditDenial> {
        self.limiter.check(key).map_err(|retry_after| {
            warn!(user = key, ?retry_after, "legacy rate limit reached");
            CreditDenial::RateLimited {
                retry_after: Some(retry_after),
            }
        })
    }

    fn admission(
        &self,
        mode: Mode,
        metering: Metering,
        reservation: Option<CreditReservation>,
    ) -> Admission {
        Admission {
            client: self.clone(),
            mode,
            metering,
            reservation,
        }
    }

    fn spawn_settle(
        &self,
        reservation: CreditReservation,
        actual: Option<u32>,
    ) -> JoinHandle<Option<Settlement>> {
        let ledger = Arc::clone(&self.ledger);
        let budget = self.settle_timeout;
        tokio::spawn(async move {
            let id = reservation.id.as_str();
            let call = async {
                match actual {
                    Some(credits) => ledger.finalize(id, credits).await,
                    None => ledger.cancel(id).await,
                }
            };
            match tokio::time::timeout(budget, call).await {
                Ok(Ok(settlement)) => {
                    info!(
                        reservation = id,
                        charged = settlement.charged,
                        refunded = settlement.refunded,
                        already_settled = settlement.already_settled,
                        "credits settled"
                    );
                    Some(settlement)
                }
                Ok(Err(LedgerError::FunctionNotFound(op))) => {
                    debug!(reservation = id, op, "ledger has no settle operation");
                    None
                }
                Ok(Err(e)) => {
                    warn!(reservation = id, error = %e, "credit settle failed");
                    None
                }
                Err(_) => {
                    warn!(
                        reservation = id,
                        timeout_secs = budget.as_secs(),
                        "credit settle timed out"
                    );
                    None
                }
            }
        })
    }
}

/// A request admitted by `CreditClient::admit`.
pub struct Admission {
    client: CreditClient,
    mode: Mode,
    metering: Metering,
    reservation: Option<CreditReservation>,
}

impl Admission {
    pub fn metering(&self) -> Metering {
        self.metering
    }

    pub fn reservation(&self) -> Option<&CreditReservation> {
        self.reservation.as_ref()
    }

    /// Charges for the live searches made and refunds the rest in the
    /// background. Returns the credits charged; zero when unmetered.
    pub fn finalize(
        mut self,
        live_searches: u32,
    ) -> (u32, Option<JoinHandle<Option<Settlement>>>) {
        let Some(reservation) = self.reservation.take() else {
            return (0, None);
        };
        let credits = self.mode.credits_for(live_searches);
        (credits, Some(self.client.spawn_settle(reservation, Some(credits))))
    }

    pub fn cancel(mut self) -> Option<JoinHandle<Option<Settlement>>> {
        let reservation = self.reservation.take()?;
        Some(self.client.spawn_settle(reservation, None))
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        let Some(reservation) = self.reservation.take() else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(reservation = %reservation.id, "no runtime to release unsettled reservation");
            return;
        }
        warn!(reservation = %reservation.id, "admission dropped unsettled, cancelling");
        drop(self.client.spawn_settle(reservation, None));
    }
}
