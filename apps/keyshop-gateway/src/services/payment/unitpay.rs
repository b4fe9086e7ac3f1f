use super::{
    format_amount, get_param, parse_amount, AdapterError, CallbackNotification, PaymentAdapter,
    PaymentRequest,
};
use keyshop_db::models::transaction::PaymentProvider;
use keyshop_db::repositories::SettingsRepository;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Unitpay joins signature inputs with this literal separator.
const SIG_SEPARATOR: &str = "{up}";

const DEFAULT_DOMAIN: &str = "unitpay.money";

pub struct UnitpayAdapter {
    public_key: String,
    secret_key: String,
    domain: String,
}

impl UnitpayAdapter {
    pub fn new(public_key: String, secret_key: String, domain: String) -> Self {
        Self {
            public_key,
            secret_key,
            domain,
        }
    }

    pub async fn load(settings: &SettingsRepository) -> anyhow::Result<Option<Self>> {
        let Some(public_key) = settings.get("unitpay_public_key").await? else {
            return Ok(None);
        };
        let Some(secret_key) = settings.get("unitpay_secret_key").await? else {
            return Ok(None);
        };
        let domain = settings
            .get("unitpay_domain")
            .await?
            .unwrap_or_else(|| DEFAULT_DOMAIN.to_string());
        Ok(Some(Self::new(public_key, secret_key, domain)))
    }

    /// SHA-256 over the values of {account, desc, sum} in alphabetical key
    /// order, joined with `{up}`, secret appended last.
    fn signature(&self, account: &str, desc: &str, sum: &str) -> String {
        let joined = [account, desc, sum, self.secret_key.as_str()].join(SIG_SEPARATOR);
        hex::encode(Sha256::digest(joined.as_bytes()))
    }
}

impl PaymentAdapter for UnitpayAdapter {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Unitpay
    }

    fn payment_url(&self, req: &PaymentRequest) -> Result<String, AdapterError> {
        let sum = format_amount(req.amount);
        let signature = self.signature(&req.payment_id, &req.description, &sum);
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("sum", &sum)
            .append_pair("account", &req.payment_id)
            .append_pair("desc", &req.description)
            .append_pair("signature", &signature)
            .finish();
        Ok(format!(
            "https://{}/pay/{}?{}",
            self.domain, self.public_key, query
        ))
    }

    fn parse_callback(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<CallbackNotification, AdapterError> {
        let account = get_param(params, "account")?;
        let sum = get_param(params, "sum")?;
        let desc = params.get("desc").map(String::as_str).unwrap_or("");
        let provided = get_param(params, "signature")?;

        let expected = self.signature(account, desc, sum);
        // Hex digests compare case-insensitively.
        if !provided.eq_ignore_ascii_case(&expected) {
            return Err(AdapterError::BadSignature);
        }

        let amount = parse_amount(sum).ok_or(AdapterError::MalformedCallback("sum"))?;
        Ok(CallbackNotification {
            provider: PaymentProvider::Unitpay,
            payment_id: account.to_string(),
            amount,
        })
    }

    fn ack(&self) -> &'static str {
        r#"{"result":{"message":"Request processed"}}"#
    }
}

#[cfg(test)]
mod tests {
    use super::super::query_params;
    use super::*;

    fn adapter() -> UnitpayAdapter {
        UnitpayAdapter::new(
            "123456-abcde".to_string(),
            "topsecret".to_string(),
            DEFAULT_DOMAIN.to_string(),
        )
    }

    fn request() -> PaymentRequest {
        PaymentRequest {
            payment_id: "7c9e6679-7425-40de-944b-e07fc1f90ae7".to_string(),
            amount: 45_050,
            description: "VPN access, 6 month(s) (user 7)".to_string(),
        }
    }

    #[test]
    fn url_signature_round_trips_through_callback_verification() {
        let url = adapter().payment_url(&request()).unwrap();
        assert!(url.starts_with("https://unitpay.money/pay/123456-abcde?"));
        let params = query_params(&url);
        let note = adapter().parse_callback(&params).unwrap();
        assert_eq!(note.payment_id, request().payment_id);
        assert_eq!(note.amount, 45_050);
    }

    #[test]
    fn signature_is_sha256_over_sorted_params_and_secret() {
        let sig = adapter().signature("acc", "desc", "10.00");
        let expected = hex::encode(Sha256::digest(
            "acc{up}desc{up}10.00{up}topsecret".as_bytes(),
        ));
        assert_eq!(sig, expected);
    }

    #[test]
    fn uppercase_digest_is_accepted() {
        let url = adapter().payment_url(&request()).unwrap();
        let mut params = query_params(&url);
        let upper = params["signature"].to_uppercase();
        params.insert("signature".to_string(), upper);
        assert!(adapter().parse_callback(&params).is_ok());
    }

    #[test]
    fn tampered_sum_fails_verification() {
        let url = adapter().payment_url(&request()).unwrap();
        let mut params = query_params(&url);
        params.insert("sum".to_string(), "1.00".to_string());
        assert!(matches!(
            adapter().parse_callback(&params),
            Err(AdapterError::BadSignature)
        ));
    }

    #[test]
    fn missing_signature_is_malformed() {
        let url = adapter().payment_url(&request()).unwrap();
        let mut params = query_params(&url);
        params.remove("signature");
        assert!(matches!(
            adapter().parse_callback(&params),
            Err(AdapterError::MalformedCallback("signature"))
        ));
    }
}
