use super::{
    format_amount, get_param, parse_amount, AdapterError, CallbackNotification, PaymentAdapter,
    PaymentRequest,
};
use keyshop_db::models::transaction::PaymentProvider;
use keyshop_db::repositories::SettingsRepository;
use std::collections::HashMap;

const CURRENCY: &str = "RUB";

pub struct FreekassaAdapter {
    shop_id: String,
    secret_key: String,
}

impl FreekassaAdapter {
    pub fn new(shop_id: String, secret_key: String) -> Self {
        Self { shop_id, secret_key }
    }

    pub async fn load(settings: &SettingsRepository) -> anyhow::Result<Option<Self>> {
        let Some(shop_id) = settings.get("freekassa_shop_id").await? else {
            return Ok(None);
        };
        let Some(secret_key) = settings.get("freekassa_api_key").await? else {
            return Ok(None);
        };
        Ok(Some(Self::new(shop_id, secret_key)))
    }

    /// MD5 over `shop_id:amount:secret:currency:order_id`.
    fn signature(&self, amount: &str, order_id: &str) -> String {
        let raw = format!(
            "{}:{}:{}:{}:{}",
            self.shop_id, amount, self.secret_key, CURRENCY, order_id
        );
        format!("{:x}", md5::compute(raw.as_bytes()))
    }
}

impl PaymentAdapter for FreekassaAdapter {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Freekassa
    }

    fn payment_url(&self, req: &PaymentRequest) -> Result<String, AdapterError> {
        let amount = format_amount(req.amount);
        let sign = self.signature(&amount, &req.payment_id);
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("m", &self.shop_id)
            .append_pair("oa", &amount)
            .append_pair("o", &req.payment_id)
            .append_pair("s", &sign)
            .append_pair("currency", CURRENCY)
            .finish();
        Ok(format!("https://pay.freekassa.ru/?{query}"))
    }

    fn parse_callback(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<CallbackNotification, AdapterError> {
        let amount = get_param(params, "oa")?;
        let order_id = get_param(params, "o")?;
        let provided = get_param(params, "s")?;

        if provided != self.signature(amount, order_id) {
            return Err(AdapterError::BadSignature);
        }

        let amount = parse_amount(amount).ok_or(AdapterError::MalformedCallback("oa"))?;
        Ok(CallbackNotification {
            provider: PaymentProvider::Freekassa,
            payment_id: order_id.to_string(),
            amount,
        })
    }

    fn ack(&self) -> &'static str {
        "YES"
    }
}

#[cfg(test)]
mod tests {
    use super::super::query_params;
    use super::*;

    fn adapter() -> FreekassaAdapter {
        FreekassaAdapter::new("31337".to_string(), "fk-secret-1".to_string())
    }

    fn request() -> PaymentRequest {
        PaymentRequest {
            payment_id: "0b1d7b4e-5cc5-4b56-9b4e-1f2a3c4d5e6f".to_string(),
            amount: 30_000,
            description: "VPN access, 1 month(s) (user 9)".to_string(),
        }
    }

    #[test]
    fn url_signature_round_trips_through_callback_verification() {
        let url = adapter().payment_url(&request()).unwrap();
        assert!(url.starts_with("https://pay.freekassa.ru/?"));
        let params = query_params(&url);
        assert_eq!(params["m"], "31337");
        assert_eq!(params["oa"], "300.00");
        assert_eq!(params["currency"], "RUB");
        let note = adapter().parse_callback(&params).unwrap();
        assert_eq!(note.payment_id, request().payment_id);
        assert_eq!(note.amount, 30_000);
    }

    #[test]
    fn signature_matches_known_digest() {
        let sig = adapter().signature("300.00", "order-1");
        let expected = format!(
            "{:x}",
            md5::compute("31337:300.00:fk-secret-1:RUB:order-1".as_bytes())
        );
        assert_eq!(sig, expected);
    }

    #[test]
    fn tampered_amount_fails_verification() {
        let url = adapter().payment_url(&request()).unwrap();
        let mut params = query_params(&url);
        params.insert("oa".to_string(), "1.00".to_string());
        assert!(matches!(
            adapter().parse_callback(&params),
            Err(AdapterError::BadSignature)
        ));
    }

    #[test]
    fn signature_from_wrong_secret_is_rejected() {
        let url = adapter().payment_url(&request()).unwrap();
        let params = query_params(&url);
        let other = FreekassaAdapter::new("31337".to_string(), "different".to_string());
        assert!(matches!(
            other.parse_callback(&params),
            Err(AdapterError::BadSignature)
        ));
    }
}
