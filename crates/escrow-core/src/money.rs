//! # Money and Fee Splitting
//!
//! Amounts are integers in the currency's minor unit (cents for `usd`).
//! Fee rates are held in basis points and parsed from their decimal text
//! exactly, so no floating-point value ever influences a payout.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Basis points in 100%.
const BPS_DENOMINATOR: u32 = 10_000;

/// Lowercase ISO 4217 currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    /// Validate a three-letter code. Input is normalized to lowercase.
    pub fn new(code: impl AsRef<str>) -> Result<Self, ValidationError> {
        let code = code.as_ref();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ValidationError::InvalidCurrency(code.to_string()));
        }
        Ok(Self(code.to_ascii_lowercase()))
    }

    /// Borrow the lowercase code.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Currency {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Currency> for String {
    fn from(c: Currency) -> Self {
        c.0
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A strictly positive amount in minor units of a currency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawMoney")]
pub struct Money {
    amount: u64,
    currency: Currency,
}

#[derive(Deserialize)]
struct RawMoney {
    amount: u64,
    currency: Currency,
}

impl TryFrom<RawMoney> for Money {
    type Error = ValidationError;

    fn try_from(raw: RawMoney) -> Result<Self, Self::Error> {
        Money::new(raw.amount, raw.currency)
    }
}

impl Money {
    /// Build an amount. Zero is rejected.
    pub fn new(amount: u64, currency: Currency) -> Result<Self, ValidationError> {
        if amount == 0 {
            return Err(ValidationError::NonPositiveAmount);
        }
        Ok(Self { amount, currency })
    }

    /// Amount in minor units.
    pub fn amount(&self) -> u64 {
        self.amount
    }

    /// Currency of the amount.
    pub fn currency(&self) -> &Currency {
        &self.currency
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

/// Platform fee rate in basis points, `0 <= bps < 10_000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct FeeRate(u32);

impl FeeRate {
    /// The default platform rate, 10%.
    pub const DEFAULT: FeeRate = FeeRate(1_000);

    /// Build a rate from basis points (1 bp = 0.01%).
    pub fn from_bps(bps: u32) -> Result<Self, ValidationError> {
        if bps >= BPS_DENOMINATOR {
            return Err(ValidationError::InvalidFeeRate {
                value: bps.to_string(),
                reason: "must be below 10000 basis points",
            });
        }
        Ok(Self(bps))
    }

    /// The rate in basis points.
    pub fn bps(&self) -> u32 {
        self.0
    }
}

impl Default for FeeRate {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl FromStr for FeeRate {
    type Err = ValidationError;

    /// Parse a decimal fraction such as `0.10` or `0.025`.
    ///
    /// At most four significant fractional digits are accepted; trailing
    /// zeros beyond that are ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let reject = |reason| ValidationError::InvalidFeeRate {
            value: s.to_string(),
            reason,
        };
        let text = s.trim();
        let (whole, frac) = match text.split_once('.') {
            Some((w, f)) => (w, f),
            None => (text, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(reject("empty"));
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit())
        {
            return Err(reject("expected a decimal fraction"));
        }
        if !whole.trim_start_matches('0').is_empty() {
            return Err(reject("must be below 1"));
        }
        let significant = frac.trim_end_matches('0');
        if significant.len() > 4 {
            return Err(reject("finer than one basis point"));
        }
        let mut bps: u32 = 0;
        for (i, digit) in significant.bytes().enumerate() {
            bps += u32::from(digit - b'0') * 10u32.pow(3 - i as u32);
        }
        Self::from_bps(bps)
    }
}

impl TryFrom<u32> for FeeRate {
    type Error = ValidationError;

    fn try_from(bps: u32) -> Result<Self, Self::Error> {
        Self::from_bps(bps)
    }
}

impl From<FeeRate> for u32 {
    fn from(rate: FeeRate) -> Self {
        rate.0
    }
}

impl std::fmt::Display for FeeRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
    }
}

/// Division of a released amount between the platform and the payee.
///
/// `platform_fee + payee_amount == amount` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeeSplit {
    /// Amount retained by the platform, in minor units.
    pub platform_fee: u64,
    /// Amount paid out to the provider, in minor units.
    pub payee_amount: u64,
}

impl FeeSplit {
    /// Split `amount` at `rate`.
    ///
    /// The fee is `ceil(amount * bps / 10_000)`, computed in `u128`, so any
    /// fractional minor unit goes to the platform and never exceeds one.
    pub fn compute(amount: u64, rate: FeeRate) -> Self {
        let denominator = u128::from(BPS_DENOMINATOR);
        let scaled = u128::from(amount) * u128::from(rate.bps());
        let fee = (scaled + denominator - 1) / denominator;
        // bps < 10_000 keeps fee <= amount, so the narrowing cannot fail.
        let platform_fee = u64::try_from(fee).unwrap_or(amount).min(amount);
        Self {
            platform_fee,
            payee_amount: amount - platform_fee,
        }
    }

    /// Sum of both shares.
    pub fn total(&self) -> u64 {
        self.platform_fee + self.payee_amount
    }
}
