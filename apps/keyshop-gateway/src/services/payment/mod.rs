pub mod enot;
pub mod freekassa;
pub mod unitpay;
pub mod yoomoney;

use keyshop_db::models::transaction::PaymentProvider;
use keyshop_db::repositories::SettingsRepository;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("provider is not configured: missing {0}")]
    MissingCredentials(&'static str),
    #[error("callback is missing or malformed: {0}")]
    MalformedCallback(&'static str),
    #[error("callback signature mismatch")]
    BadSignature,
}

/// Everything a provider needs to render its payment page.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub payment_id: String,
    /// Kopeks.
    pub amount: i64,
    pub description: String,
}

/// A provider callback reduced to the fields settlement cares about.
/// Authenticity has already been established by the adapter that built it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackNotification {
    pub provider: PaymentProvider,
    pub payment_id: String,
    /// Kopeks, as reported by the provider.
    pub amount: i64,
}

pub trait PaymentAdapter: Send + Sync {
    fn provider(&self) -> PaymentProvider;

    /// Deterministic URL construction: no network, no side effects.
    fn payment_url(&self, req: &PaymentRequest) -> Result<String, AdapterError>;

    /// Validates an inbound callback into a canonical notification. A
    /// signature mismatch is `AdapterError::BadSignature`, never a panic.
    fn parse_callback(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<CallbackNotification, AdapterError>;

    /// The acknowledgment body this provider expects on success.
    fn ack(&self) -> &'static str;
}

/// Builds the adapter for a provider from runtime settings. `Ok(None)` means
/// the provider is not configured; callers surface that as "temporarily
/// unavailable" before any transaction is created.
pub async fn load_adapter(
    provider: PaymentProvider,
    settings: &SettingsRepository,
) -> anyhow::Result<Option<Box<dyn PaymentAdapter>>> {
    Ok(match provider {
        PaymentProvider::YooMoney => yoomoney::YooMoneyAdapter::load(settings)
            .await?
            .map(boxed),
        PaymentProvider::Unitpay => unitpay::UnitpayAdapter::load(settings).await?.map(boxed),
        PaymentProvider::Freekassa => freekassa::FreekassaAdapter::load(settings)
            .await?
            .map(boxed),
        PaymentProvider::Enot => enot::EnotAdapter::load(settings).await?.map(boxed),
        PaymentProvider::Balance => None,
    })
}

fn boxed<A: PaymentAdapter + 'static>(adapter: A) -> Box<dyn PaymentAdapter> {
    Box::new(adapter)
}

/// "300.00"-style amount strings: always two decimals, dot separator. Both
/// signing and URL building go through here, so a formatting mismatch cannot
/// produce divergent digests.
pub fn format_amount(kopeks: i64) -> String {
    format!("{}.{:02}", kopeks / 100, (kopeks % 100).abs())
}

/// Parses a provider-reported amount into kopeks. Accepts zero to two
/// decimal digits; anything else is a malformed callback, not a crash.
pub fn parse_amount(s: &str) -> Option<i64> {
    let s = s.trim();
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if whole.is_empty() || frac.len() > 2 {
        return None;
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let whole: i64 = whole.parse().ok()?;
    let mut frac_val: i64 = if frac.is_empty() { 0 } else { frac.parse().ok()? };
    if frac.len() == 1 {
        frac_val *= 10;
    }
    whole.checked_mul(100)?.checked_add(frac_val)
}

pub(crate) fn get_param<'a>(
    params: &'a HashMap<String, String>,
    key: &'static str,
) -> Result<&'a str, AdapterError> {
    match params.get(key).map(|s| s.trim()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(AdapterError::MalformedCallback(key)),
    }
}

#[cfg(test)]
pub(crate) fn query_params(url: &str) -> HashMap<String, String> {
    let parsed = url::Url::parse(url).unwrap();
    parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amounts_format_with_two_decimals() {
        assert_eq!(format_amount(30_000), "300.00");
        assert_eq!(format_amount(30_005), "300.05");
        assert_eq!(format_amount(99), "0.99");
        assert_eq!(format_amount(0), "0.00");
    }

    #[test]
    fn amount_parsing_accepts_provider_shapes() {
        assert_eq!(parse_amount("300.00"), Some(30_000));
        assert_eq!(parse_amount("300.5"), Some(30_050));
        assert_eq!(parse_amount("300"), Some(30_000));
        assert_eq!(parse_amount(" 300.00 "), Some(30_000));
    }

    #[test]
    fn amount_parsing_rejects_garbage() {
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("300,00"), None);
        assert_eq!(parse_amount("300.000"), None);
        assert_eq!(parse_amount("-300.00"), None);
        assert_eq!(parse_amount("30O.00"), None);
    }

    #[test]
    fn format_and_parse_agree() {
        for kopeks in [0, 1, 99, 100, 30_000, 123_456_789] {
            assert_eq!(parse_amount(&format_amount(kopeks)), Some(kopeks));
        }
    }
}
