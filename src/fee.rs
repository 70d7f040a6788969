//! Platform fee calculation
//!
//! All fee rates use 10^6 precision: 100_000 = 10.00%
//!
//! The fee is rounded half-up to the nearest minor unit and the net payout is
//! derived as `amount - fee`, so any rounding remainder always lands in the
//! platform fee and `fee + net == amount` holds by construction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::config::FeesConfig;
use crate::escrow::store::LedgerStore;
use crate::money::Amount;

/// Fee rate precision (10^6 = 1,000,000)
pub const FEE_PRECISION: u64 = 1_000_000;

/// Default platform fee rate (100_000 = 10%)
pub const DEFAULT_PLATFORM_FEE: u64 = 100_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FeeError {
    #[error("Unknown plan tier: {0}")]
    UnknownTier(String),

    #[error("Fee rate {0} exceeds 100%")]
    InvalidRate(u64),

    #[error("Fee schedule unavailable: {0}")]
    Unavailable(String),
}

impl FeeError {
    pub fn code(&self) -> &'static str {
        match self {
            FeeError::UnknownTier(_) => "UNKNOWN_TIER",
            FeeError::InvalidRate(_) => "INVALID_FEE_RATE",
            FeeError::Unavailable(_) => "FEE_SCHEDULE_UNAVAILABLE",
        }
    }
}

/// Fee terms in effect for a payer at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSchedule {
    /// Platform fee rate in 10^6 precision
    pub platform_fee_rate: u64,
    /// Gross volume the payer may still fund without a platform fee
    pub fee_free_allowance_remaining: Amount,
}

/// Result of splitting a gross capture into fee and net payout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSplit {
    pub platform_fee: Amount,
    pub net: Amount,
}

/// Calculate fee from amount and rate, rounding half-up.
///
/// Uses u128 intermediate to prevent overflow. `rate` must not exceed
/// [`FEE_PRECISION`], which keeps the fee at or below `amount`.
///
/// # Example
/// ```
/// use escrow_ledger::fee::calculate_fee;
/// // $100.00 at 10% = $10.00
/// assert_eq!(calculate_fee(10_000, 100_000), 1_000);
/// // 0.5 cent rounds up
/// assert_eq!(calculate_fee(5, 100_000), 1);
/// ```
#[inline]
pub fn calculate_fee(amount: Amount, rate: u64) -> Amount {
    let product = amount as u128 * rate.min(FEE_PRECISION) as u128;
    let half = FEE_PRECISION as u128 / 2;
    ((product + half) / FEE_PRECISION as u128) as Amount
}

/// Split a gross amount into platform fee and net payout.
///
/// The fee-free allowance is applied to the gross amount first; the rate is
/// charged only on the remainder.
pub fn split_fee(amount: Amount, schedule: &FeeSchedule) -> FeeSplit {
    let exempt = amount.min(schedule.fee_free_allowance_remaining);
    let platform_fee = calculate_fee(amount - exempt, schedule.platform_fee_rate);
    FeeSplit {
        platform_fee,
        net: amount - platform_fee,
    }
}

/// Fee schedule lookup (external collaborator)
///
/// Implementations resolve the payer's plan tier at `at`; results must not
/// change for a capture once computed, so callers pass the capture time.
#[async_trait]
pub trait FeeScheduleSource: Send + Sync {
    async fn fee_schedule(&self, payer_id: &str, at: DateTime<Utc>)
    -> Result<FeeSchedule, FeeError>;
}

/// Config-backed plan tier table.
///
/// Configured allowances are lifetime fee-free volumes. The remaining part
/// is the configured volume less what the ledger has already captured for
/// the payer, so a payer with an allowance needs the ledger attached.
pub struct StaticFeeSchedule {
    default_tier: String,
    tiers: HashMap<String, u64>,
    payer_tiers: HashMap<String, String>,
    allowances: HashMap<String, Amount>,
    ledger: Option<Arc<dyn LedgerStore>>,
}

impl StaticFeeSchedule {
    /// Build from configuration, rejecting rates above 100%
    pub fn from_config(config: &FeesConfig) -> Result<Self, FeeError> {
        if let Some((_, rate)) = config.tiers.iter().find(|(_, r)| **r > FEE_PRECISION) {
            return Err(FeeError::InvalidRate(*rate));
        }
        if !config.tiers.contains_key(&config.default_tier) {
            return Err(FeeError::UnknownTier(config.default_tier.clone()));
        }
        Ok(Self {
            default_tier: config.default_tier.clone(),
            tiers: config.tiers.clone(),
            payer_tiers: config.payer_tiers.clone(),
            allowances: config.fee_free_allowances.clone(),
            ledger: None,
        })
    }

    /// Single flat rate for every payer
    pub fn flat(rate: u64) -> Self {
        Self {
            default_tier: "default".to_string(),
            tiers: HashMap::from([("default".to_string(), rate.min(FEE_PRECISION))]),
            payer_tiers: HashMap::new(),
            allowances: HashMap::new(),
            ledger: None,
        }
    }

    /// Set a payer's total fee-free allowance
    pub fn with_allowance(mut self, payer_id: &str, allowance: Amount) -> Self {
        self.allowances.insert(payer_id.to_string(), allowance);
        self
    }

    /// Ledger that allowance consumption is read from
    pub fn with_ledger(mut self, ledger: Arc<dyn LedgerStore>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    async fn allowance_remaining(&self, payer_id: &str) -> Result<Amount, FeeError> {
        let configured = self.allowances.get(payer_id).copied().unwrap_or(0);
        if configured == 0 {
            return Ok(0);
        }
        let ledger = self
            .ledger
            .as_ref()
            .ok_or_else(|| FeeError::Unavailable("allowance ledger not attached".to_string()))?;
        let consumed = ledger
            .captured_by_payer(payer_id)
            .await
            .map_err(|e| FeeError::Unavailable(e.to_string()))?;
        Ok(configured.saturating_sub(consumed))
    }
}

#[async_trait]
impl FeeScheduleSource for StaticFeeSchedule {
    async fn fee_schedule(
        &self,
        payer_id: &str,
        _at: DateTime<Utc>,
    ) -> Result<FeeSchedule, FeeError> {
        let tier = self
            .payer_tiers
            .get(payer_id)
            .unwrap_or(&self.default_tier);
        let rate = *self
            .tiers
            .get(tier)
            .ok_or_else(|| FeeError::UnknownTier(tier.clone()))?;

        Ok(FeeSchedule {
            platform_fee_rate: rate,
            fee_free_allowance_remaining: self.allowance_remaining(payer_id).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow::store::MemoryLedgerStore;

    fn schedule(rate: u64, allowance: Amount) -> FeeSchedule {
        FeeSchedule {
            platform_fee_rate: rate,
            fee_free_allowance_remaining: allowance,
        }
    }

    #[test]
    fn test_calculate_fee_basic() {
        // $100.00 * 10% = $10.00
        assert_eq!(calculate_fee(10_000, 100_000), 1_000);
        // $50.00 * 2.9% = $1.45
        assert_eq!(calculate_fee(5_000, 29_000), 145);
    }

    #[test]
    fn test_calculate_fee_rounds_half_up() {
        // 15 * 10% = 1.5 -> 2
        assert_eq!(calculate_fee(15, 100_000), 2);
        // 14 * 10% = 1.4 -> 1
        assert_eq!(calculate_fee(14, 100_000), 1);
        // 1 * 50% = 0.5 -> 1
        assert_eq!(calculate_fee(1, 500_000), 1);
    }

    #[test]
    fn test_calculate_fee_zero() {
        assert_eq!(calculate_fee(0, 100_000), 0);
        assert_eq!(calculate_fee(10_000, 0), 0);
    }

    #[test]
    fn test_rate_is_capped_at_full_amount() {
        assert_eq!(calculate_fee(10_000, 2 * FEE_PRECISION), 10_000);
    }

    #[test]
    fn test_no_overflow() {
        let fee = calculate_fee(u64::MAX, 100_000);
        assert!(fee <= u64::MAX / 9);
    }

    #[test]
    fn test_split_preserves_total() {
        for amount in [0u64, 1, 7, 15, 999, 10_001, 123_457] {
            for rate in [0u64, 29_000, 100_000, 333_333, FEE_PRECISION] {
                let split = split_fee(amount, &schedule(rate, 0));
                assert_eq!(split.platform_fee + split.net, amount);
            }
        }
    }

    #[test]
    fn test_split_remainder_goes_to_fee() {
        // 15 * 10% = 1.5 -> fee 2, net 13
        let split = split_fee(15, &schedule(100_000, 0));
        assert_eq!(split.platform_fee, 2);
        assert_eq!(split.net, 13);
    }

    #[test]
    fn test_split_with_allowance() {
        // $100 with $60 fee-free: fee on $40 at 10% = $4
        let split = split_fee(10_000, &schedule(100_000, 6_000));
        assert_eq!(split.platform_fee, 400);
        assert_eq!(split.net, 9_600);

        // Allowance larger than the amount: no fee
        let split = split_fee(10_000, &schedule(100_000, 50_000));
        assert_eq!(split.platform_fee, 0);
        assert_eq!(split.net, 10_000);
    }

    #[tokio::test]
    async fn test_static_schedule_tiers() {
        let config = FeesConfig {
            default_tier: "free".to_string(),
            tiers: HashMap::from([("free".to_string(), 100_000), ("pro".to_string(), 50_000)]),
            payer_tiers: HashMap::from([("payer-pro".to_string(), "pro".to_string())]),
            fee_free_allowances: HashMap::from([("payer-pro".to_string(), 2_500)]),
        };
        let detached = StaticFeeSchedule::from_config(&config).unwrap();
        assert!(matches!(
            detached.fee_schedule("payer-pro", Utc::now()).await,
            Err(FeeError::Unavailable(_))
        ));

        let fees = StaticFeeSchedule::from_config(&config)
            .unwrap()
            .with_ledger(Arc::new(MemoryLedgerStore::new()));
        let s = fees.fee_schedule("someone", Utc::now()).await.unwrap();
        assert_eq!(s, schedule(100_000, 0));

        let s = fees.fee_schedule("payer-pro", Utc::now()).await.unwrap();
        assert_eq!(s, schedule(50_000, 2_500));
    }

    #[test]
    fn test_static_schedule_rejects_bad_config() {
        let config = FeesConfig {
            default_tier: "missing".to_string(),
            tiers: HashMap::from([("free".to_string(), 100_000)]),
            ..FeesConfig::default()
        };
        assert!(matches!(
            StaticFeeSchedule::from_config(&config),
            Err(FeeError::UnknownTier(_))
        ));

        let config = FeesConfig {
            default_tier: "free".to_string(),
            tiers: HashMap::from([("free".to_string(), FEE_PRECISION + 1)]),
            ..FeesConfig::default()
        };
        assert!(matches!(
            StaticFeeSchedule::from_config(&config),
            Err(FeeError::InvalidRate(_))
        ));
    }
}
