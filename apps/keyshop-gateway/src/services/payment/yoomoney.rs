use super::{
    format_amount, get_param, parse_amount, AdapterError, CallbackNotification, PaymentAdapter,
    PaymentRequest,
};
use keyshop_db::models::transaction::PaymentProvider;
use keyshop_db::repositories::SettingsRepository;
use std::collections::HashMap;

/// YooMoney quickpay. The payment id travels as the opaque `label`; there is
/// no shared-secret signature, so authenticity rests on the settlement
/// engine's pending-transaction lookup and amount check.
pub struct YooMoneyAdapter {
    wallet: String,
}

impl YooMoneyAdapter {
    pub fn new(wallet: String) -> Self {
        Self { wallet }
    }

    pub async fn load(settings: &SettingsRepository) -> anyhow::Result<Option<Self>> {
        Ok(settings.get("yoomoney_wallet").await?.map(Self::new))
    }
}

impl PaymentAdapter for YooMoneyAdapter {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::YooMoney
    }

    fn payment_url(&self, req: &PaymentRequest) -> Result<String, AdapterError> {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("receiver", &self.wallet)
            .append_pair("quickpay-form", "shop")
            .append_pair("targets", &req.description)
            .append_pair("paymentType", "PC")
            .append_pair("sum", &format_amount(req.amount))
            .append_pair("label", &req.payment_id)
            .finish();
        Ok(format!("https://yoomoney.ru/quickpay/confirm.xml?{query}"))
    }

    fn parse_callback(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<CallbackNotification, AdapterError> {
        let label = get_param(params, "label")?;
        // Notifications report the credited amount as `amount` and may also
        // carry `withdraw_amount`; the gross amount is what we quoted.
        let raw = params
            .get("withdraw_amount")
            .or_else(|| params.get("amount"))
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or(AdapterError::MalformedCallback("amount"))?;
        let amount = parse_amount(raw).ok_or(AdapterError::MalformedCallback("amount"))?;
        Ok(CallbackNotification {
            provider: PaymentProvider::YooMoney,
            payment_id: label.to_string(),
            amount,
        })
    }

    fn ack(&self) -> &'static str {
        ""
    }
}
