use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reimburse_core::config::CurrencyConfig;
use reimburse_core::{apply_rate, ConversionError, CurrencyConverter};
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

/// Looks up live rates at `{base_url}/{FROM}` and multiplies by `rates[TO]`.
pub struct HttpRateConverter {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

#[derive(Debug, Deserialize)]
struct RatesResponse {
    rates: HashMap<String, serde_json::Number>,
}

impl HttpRateConverter {
    pub fn from_config(config: &CurrencyConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(Duration::from_secs(config.timeout_secs)).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn rates_url(&self, from: &str) -> String {
        format!("{}/{}", self.base_url, from.trim().to_ascii_uppercase())
    }
}

#[async_trait]
impl CurrencyConverter for HttpRateConverter {
    async fn convert(
        &self,
        amount: Decimal,
        from: &str,
        to: &str,
    ) -> Result<Decimal, ConversionError> {
        let url = self.rates_url(from);
        let mut request = self.client.get(&url);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response = request
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|error| ConversionError::Unavailable(error.to_string()))?;
        let body: RatesResponse = response
            .json()
            .await
            .map_err(|error| ConversionError::InvalidResponse(error.to_string()))?;

        let rate = lookup_rate(&body.rates, to)?.ok_or_else(|| {
            ConversionError::UnsupportedPair { from: from.to_string(), to: to.to_string() }
        })?;
        debug!(from = from, to = to, rate = %rate, "exchange rate fetched");

        apply_rate(amount, rate, from, to)
    }
}

fn lookup_rate(
    rates: &HashMap<String, serde_json::Number>,
    to: &str,
) -> Result<Option<Decimal>, ConversionError> {
    let Some(raw) = rates.get(&to.trim().to_ascii_uppercase()) else {
        return Ok(None);
    };

    let text = raw.to_string();
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map(Some)
        .map_err(|error| ConversionError::InvalidResponse(format!("rate `{text}`: {error}")))
}
