use async_trait::async_trait;
use chrono::Utc;
use keyshop_db::models::store::Host;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

pub const DAY_MS: i64 = 86_400_000;

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 500;

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Timeouts, connect failures, 5xx: worth retrying.
    #[error("panel temporarily unreachable: {0}")]
    Transient(String),
    /// The panel understood us and said no: retrying cannot help.
    #[error("panel rejected request: {0}")]
    Permanent(String),
}

impl ProvisionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProvisionError::Transient(_))
    }

    fn from_http(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return ProvisionError::Transient(err.to_string());
        }
        match err.status() {
            Some(status) if status.is_server_error() => ProvisionError::Transient(err.to_string()),
            Some(_) => ProvisionError::Permanent(err.to_string()),
            None => ProvisionError::Transient(err.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionResult {
    pub client_uuid: String,
    pub connection_string: String,
    pub expiry_ms: i64,
}

/// Create-or-extend a client on a remote panel. This call is not idempotent
/// on the panel side; the settlement engine guarantees it runs at most once
/// per payment.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(
        &self,
        host: &Host,
        email: &str,
        days_to_add: i64,
    ) -> Result<ProvisionResult, ProvisionError>;
}

/// New expiry after adding `days_to_add` days. Lapsed keys restart from now
/// instead of compounding from a past expiry; live keys never lose time.
pub fn extend_expiry(now_ms: i64, current_ms: i64, days_to_add: i64) -> i64 {
    now_ms.max(current_ms) + days_to_add * DAY_MS
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    success: bool,
    #[serde(default)]
    msg: String,
    obj: Option<T>,
}

#[derive(Debug, Deserialize)]
struct InboundInfo {
    settings: String,
}

#[derive(Debug, Deserialize)]
struct InboundSettings {
    #[serde(default)]
    clients: Vec<InboundClient>,
}

#[derive(Debug, Deserialize)]
struct InboundClient {
    id: String,
    #[serde(default)]
    email: String,
    #[serde(rename = "expiryTime", default)]
    expiry_time: i64,
}

/// 3x-ui panel client. Cookie-based session per request sequence; every
/// operation logs in first because panel sessions are short-lived.
pub struct XuiClient {
    http: Client,
}

impl XuiClient {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .build()?;
        Ok(Self { http })
    }

    async fn login(&self, host: &Host) -> Result<(), ProvisionError> {
        let url = format!("{}/login", base_url(host));
        let resp = self
            .http
            .post(&url)
            .form(&[
                ("username", host.panel_username.as_str()),
                ("password", host.panel_password.as_str()),
            ])
            .send()
            .await
            .map_err(ProvisionError::from_http)?;
        let envelope: ApiEnvelope<serde_json::Value> = decode(resp).await?;
        if !envelope.success {
            return Err(ProvisionError::Permanent(format!(
                "panel login rejected: {}",
                envelope.msg
            )));
        }
        Ok(())
    }

    async fn fetch_clients(&self, host: &Host) -> Result<Vec<InboundClient>, ProvisionError> {
        let url = format!("{}/panel/api/inbounds/get/{}", base_url(host), host.inbound_id);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(ProvisionError::from_http)?;
        let envelope: ApiEnvelope<InboundInfo> = decode(resp).await?;
        if !envelope.success {
            return Err(ProvisionError::Permanent(format!(
                "inbound lookup failed: {}",
                envelope.msg
            )));
        }
        let info = envelope
            .obj
            .ok_or_else(|| ProvisionError::Permanent("panel returned no inbound".to_string()))?;
        let settings: InboundSettings = serde_json::from_str(&info.settings)
            .map_err(|e| ProvisionError::Permanent(format!("unreadable inbound settings: {e}")))?;
        Ok(settings.clients)
    }

    async fn submit_client(
        &self,
        host: &Host,
        endpoint: String,
        client_uuid: &str,
        email: &str,
        expiry_ms: i64,
    ) -> Result<(), ProvisionError> {
        let settings = json!({
            "clients": [{
                "id": client_uuid,
                "email": email,
                "expiryTime": expiry_ms,
                "enable": true,
                "flow": "xtls-rprx-vision",
            }]
        })
        .to_string();
        let resp = self
            .http
            .post(&endpoint)
            .form(&[("id", host.inbound_id.to_string()), ("settings", settings)])
            .send()
            .await
            .map_err(ProvisionError::from_http)?;
        let envelope: ApiEnvelope<serde_json::Value> = decode(resp).await?;
        if !envelope.success {
            return Err(ProvisionError::Permanent(format!(
                "panel rejected client write: {}",
                envelope.msg
            )));
        }
        Ok(())
    }

    async fn provision_once(
        &self,
        host: &Host,
        email: &str,
        days_to_add: i64,
    ) -> Result<ProvisionResult, ProvisionError> {
        self.login(host).await?;
        let clients = self.fetch_clients(host).await?;
        let now_ms = Utc::now().timestamp_millis();

        match clients.iter().find(|c| c.email == email) {
            Some(existing) => {
                let expiry_ms = extend_expiry(now_ms, existing.expiry_time, days_to_add);
                let endpoint = format!(
                    "{}/panel/api/inbounds/updateClient/{}",
                    base_url(host),
                    existing.id
                );
                self.submit_client(host, endpoint, &existing.id, email, expiry_ms)
                    .await?;
                Ok(ProvisionResult {
                    connection_string: connection_string(host, &existing.id, email),
                    client_uuid: existing.id.clone(),
                    expiry_ms,
                })
            }
            None => {
                let client_uuid = uuid::Uuid::new_v4().to_string();
                let expiry_ms = now_ms + days_to_add * DAY_MS;
                let endpoint = format!("{}/panel/api/inbounds/addClient", base_url(host));
                self.submit_client(host, endpoint, &client_uuid, email, expiry_ms)
                    .await?;
                Ok(ProvisionResult {
                    connection_string: connection_string(host, &client_uuid, email),
                    client_uuid,
                    expiry_ms,
                })
            }
        }
    }
}

#[async_trait]
impl Provisioner for XuiClient {
    async fn provision(
        &self,
        host: &Host,
        email: &str,
        days_to_add: i64,
    ) -> Result<ProvisionResult, ProvisionError> {
        let mut delay = Duration::from_millis(BACKOFF_BASE_MS);
        let mut attempt = 1;
        loop {
            match self.provision_once(host, email, days_to_add).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    tracing::warn!(
                        host = %host.host_name,
                        attempt,
                        "provisioning attempt failed: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn base_url(host: &Host) -> &str {
    host.panel_url.trim_end_matches('/')
}

async fn decode<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<ApiEnvelope<T>, ProvisionError> {
    let status = resp.status();
    if status.is_server_error() {
        return Err(ProvisionError::Transient(format!("panel returned {status}")));
    }
    if !status.is_success() {
        return Err(ProvisionError::Permanent(format!("panel returned {status}")));
    }
    resp.json::<ApiEnvelope<T>>()
        .await
        .map_err(|e| ProvisionError::Permanent(format!("unreadable panel response: {e}")))
}

fn connection_string(host: &Host, client_uuid: &str, email: &str) -> String {
    let mut link = format!(
        "vless://{}@{}:{}?type=tcp&security=reality&fp=chrome&flow=xtls-rprx-vision",
        client_uuid, host.public_host, host.public_port
    );
    if let Some(pbk) = &host.reality_pbk {
        link.push_str("&pbk=");
        link.push_str(pbk);
    }
    if let Some(sni) = &host.reality_sni {
        link.push_str("&sni=");
        link.push_str(sni);
    }
    if let Some(sid) = &host.reality_sid {
        link.push_str("&sid=");
        link.push_str(sid);
    }
    link.push('#');
    link.push_str(email);
    link
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_never_shortens_remaining_access() {
        let now = 1_000 * DAY_MS;
        let live_until = now + 10 * DAY_MS;
        assert_eq!(extend_expiry(now, live_until, 30), live_until + 30 * DAY_MS);
    }

    #[test]
    fn lapsed_key_restarts_from_now() {
        let now = 1_000 * DAY_MS;
        let lapsed = now - 90 * DAY_MS;
        assert_eq!(extend_expiry(now, lapsed, 30), now + 30 * DAY_MS);
    }

    #[test]
    fn zero_expiry_means_fresh_client() {
        let now = 1_700_000_000_000;
        assert_eq!(extend_expiry(now, 0, 30), now + 30 * DAY_MS);
    }

    #[test]
    fn connection_string_carries_reality_params() {
        let host = Host {
            host_name: "nl-1".to_string(),
            panel_url: "https://panel.example:2053".to_string(),
            panel_username: "admin".to_string(),
            panel_password: "secret".to_string(),
            inbound_id: 1,
            public_host: "vpn.example.com".to_string(),
            public_port: 443,
            reality_pbk: Some("pbk123".to_string()),
            reality_sni: Some("google.com".to_string()),
            reality_sid: Some("ab12".to_string()),
        };
        let link = connection_string(&host, "f3f9...uuid", "user_1_abc123");
        assert!(link.starts_with("vless://f3f9...uuid@vpn.example.com:443?"));
        assert!(link.contains("security=reality"));
        assert!(link.contains("&pbk=pbk123"));
        assert!(link.contains("&sni=google.com"));
        assert!(link.contains("&sid=ab12"));
        assert!(link.ends_with("#user_1_abc123"));
    }
}
