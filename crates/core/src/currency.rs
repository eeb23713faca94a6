use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::warn;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("no exchange rate from `{from}` to `{to}`")]
    UnsupportedPair { from: String, to: String },
    #[error("exchange rate service unavailable: {0}")]
    Unavailable(String),
    #[error("exchange rate service returned an invalid response: {0}")]
    InvalidResponse(String),
    #[error("converting from `{from}` to `{to}` overflows the representable amount")]
    Overflow { from: String, to: String },
}

/// Multiplies by the rate and rounds to cents, reporting overflow instead of panicking.
pub fn apply_rate(
    amount: Decimal,
    rate: Decimal,
    from: &str,
    to: &str,
) -> Result<Decimal, ConversionError> {
    amount
        .checked_mul(rate)
        .map(|converted| converted.round_dp(2))
        .ok_or_else(|| ConversionError::Overflow { from: from.to_string(), to: to.to_string() })
}

#[async_trait]
pub trait CurrencyConverter: Send + Sync {
    async fn convert(&self, amount: Decimal, from: &str, to: &str)
        -> Result<Decimal, ConversionError>;
}

/// Converts into the company currency, falling back to the submitted amount when the
/// currencies already match or the converter fails.
pub async fn convert_or_fallback(
    converter: &dyn CurrencyConverter,
    amount: Decimal,
    from: &str,
    to: &str,
) -> Decimal {
    if from.trim().eq_ignore_ascii_case(to.trim()) {
        return amount;
    }

    match converter.convert(amount, from, to).await {
        Ok(converted) => converted,
        Err(error) => {
            warn!(
                event_name = "currency.conversion_fallback",
                from = %from,
                to = %to,
                error = %error,
                "currency conversion failed; using unconverted amount"
            );
            amount
        }
    }
}

/// Converts with a rate table keyed by currency code, where each rate is units per one unit
/// of the table's base. Cross rates go through the base.
#[derive(Clone, Debug)]
pub struct StaticRateConverter {
    rates: HashMap<String, Decimal>,
}

impl StaticRateConverter {
    pub fn new(rates: impl IntoIterator<Item = (String, Decimal)>) -> Self {
        let rates = rates
            .into_iter()
            .filter(|(_, rate)| *rate > Decimal::ZERO)
            .map(|(code, rate)| (code.trim().to_ascii_uppercase(), rate))
            .collect();
        Self { rates }
    }

    /// USD-based fallback table.
    pub fn usd_fallback() -> Self {
        Self::new(
            [
                ("USD", Decimal::new(100, 2)),
                ("EUR", Decimal::new(85, 2)),
                ("GBP", Decimal::new(73, 2)),
                ("JPY", Decimal::new(11_000, 2)),
                ("AUD", Decimal::new(135, 2)),
                ("CAD", Decimal::new(125, 2)),
                ("CHF", Decimal::new(92, 2)),
                ("CNY", Decimal::new(645, 2)),
                ("INR", Decimal::new(7_450, 2)),
            ]
            .into_iter()
            .map(|(code, rate)| (code.to_string(), rate)),
        )
    }

    pub fn rate(&self, from: &str, to: &str) -> Option<Decimal> {
        let from_rate = self.rates.get(&from.trim().to_ascii_uppercase())?;
        let to_rate = self.rates.get(&to.trim().to_ascii_uppercase())?;
        to_rate.checked_div(*from_rate)
    }
}

impl Default for StaticRateConverter {
    fn default() -> Self {
        Self::usd_fallback()
    }
}

#[async_trait]
impl CurrencyConverter for StaticRateConverter {
    async fn convert(
        &self,
        amount: Decimal,
        from: &str,
        to: &str,
    ) -> Result<Decimal, ConversionError> {
        let rate = self.rate(from, to).ok_or_else(|| ConversionError::UnsupportedPair {
            from: from.to_string(),
            to: to.to_string(),
        })?;
        apply_rate(amount, rate, from, to)
    }
}
