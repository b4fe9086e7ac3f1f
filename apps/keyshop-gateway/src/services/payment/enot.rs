use super::{
    format_amount, get_param, parse_amount, AdapterError, CallbackNotification, PaymentAdapter,
    PaymentRequest,
};
use keyshop_db::models::transaction::PaymentProvider;
use keyshop_db::repositories::SettingsRepository;
use std::collections::HashMap;

pub struct EnotAdapter {
    shop_id: String,
    secret_key: String,
}

impl EnotAdapter {
    pub fn new(shop_id: String, secret_key: String) -> Self {
        Self { shop_id, secret_key }
    }

    pub async fn load(settings: &SettingsRepository) -> anyhow::Result<Option<Self>> {
        let Some(shop_id) = settings.get("enot_shop_id").await? else {
            return Ok(None);
        };
        let Some(secret_key) = settings.get("enot_secret_key").await? else {
            return Ok(None);
        };
        Ok(Some(Self::new(shop_id, secret_key)))
    }

    /// MD5 over `shop_id:amount:secret:order_id`.
    fn signature(&self, amount: &str, order_id: &str) -> String {
        let raw = format!("{}:{}:{}:{}", self.shop_id, amount, self.secret_key, order_id);
        format!("{:x}", md5::compute(raw.as_bytes()))
    }
}

impl PaymentAdapter for EnotAdapter {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Enot
    }

    fn payment_url(&self, req: &PaymentRequest) -> Result<String, AdapterError> {
        let amount = format_amount(req.amount);
        let sign = self.signature(&amount, &req.payment_id);
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("oa", &amount)
            .append_pair("o", &req.payment_id)
            .append_pair("s", &sign)
            .finish();
        Ok(format!("https://enot.io/pay/{}?{}", self.shop_id, query))
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
            provider: PaymentProvider::Enot,
            payment_id: order_id.to_string(),
            amount,
        })
    }

    fn ack(&self) -> &'static str {
        "OK"
    }
}

#[cfg(test)]
mod tests {
    use super::super::query_params;
    use super::*;

    fn adapter() -> EnotAdapter {
        EnotAdapter::new("shop-77".to_string(), "enot-secret".to_string())
    }

    fn request() -> PaymentRequest {
        PaymentRequest {
            payment_id: "e5a1c9d0-0000-4000-8000-aabbccddeeff".to_string(),
            amount: 15_000,
            description: "Balance top-up (user 3)".to_string(),
        }
    }

    #[test]
    fn url_signature_round_trips_through_callback_verification() {
        let url = adapter().payment_url(&request()).unwrap();
        assert!(url.starts_with("https://enot.io/pay/shop-77?"));
        let params = query_params(&url);
        let note = adapter().parse_callback(&params).unwrap();
        assert_eq!(note.payment_id, request().payment_id);
        assert_eq!(note.amount, 15_000);
    }

    #[test]
    fn signature_matches_known_digest() {
        let sig = adapter().signature("150.00", "order-9");
        let expected = format!(
            "{:x}",
            md5::compute("shop-77:150.00:enot-secret:order-9".as_bytes())
        );
        assert_eq!(sig, expected);
    }

    #[test]
    fn tampered_order_id_fails_verification() {
        let url = adapter().payment_url(&request()).unwrap();
        let mut params = query_params(&url);
        params.insert("o".to_string(), "some-other-order".to_string());
        assert!(matches!(
            adapter().parse_callback(&params),
            Err(AdapterError::BadSignature)
        ));
    }
}
