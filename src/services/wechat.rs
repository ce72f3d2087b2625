use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::json;
use sha2::Sha256;

use crate::config::Config;

const JSCODE2SESSION_URL: &str = "https://api.weixin.qq.com/sns/jscode2session";

#[derive(Debug)]
pub struct WxSession {
    pub openid: String,
    pub unionid: Option<String>,
}

/// Mini-program identity: exchanges the client's wx.login() code for the
/// stable openid.
pub struct WechatService;

impl WechatService {
    fn client() -> Client {
        Client::new()
    }

    pub async fn code_to_session(code: &str) -> Result<WxSession, String> {
        if !Config::is_wechat_enabled() {
            return Err("WeChat login is not configured".to_string());
        }

        let appid = Config::wechat_appid().ok_or("WECHAT_APPID not configured")?;
        let secret = Config::wechat_secret().ok_or("WECHAT_SECRET not configured")?;

        let url = format!(
            "{}?appid={}&secret={}&js_code={}&grant_type=authorization_code",
            JSCODE2SESSION_URL, appid, secret, code
        );

        let res = Self::client()
            .get(url)
            .send()
            .await
            .map_err(|e| format!("WeChat request failed: {}", e))?;

        let body: serde_json::Value = res
            .json()
            .await
            .map_err(|e| format!("WeChat response unreadable: {}", e))?;

        // WeChat reports failures with 200 + errcode in the body.
        let errcode = body.get("errcode").and_then(|v| v.as_i64()).unwrap_or(0);
        if errcode != 0 {
            let errmsg = body
                .get("errmsg")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            return Err(format!("WeChat login rejected ({}): {}", errcode, errmsg));
        }

        let openid = body
            .get("openid")
            .and_then(|v| v.as_str())
            .ok_or("WeChat response missing openid")?
            .to_string();

        Ok(WxSession {
            openid,
            unionid: body
                .get("unionid")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }
}

/// Payment gateway collaborator. Creates the prepay order and produces the
/// client payment params; the callback route verifies gateway signatures
/// through the same HMAC scheme used to sign them.
pub struct WechatPayService;

impl WechatPayService {
    fn pay_key() -> Result<String, String> {
        Config::wechat_pay_key().ok_or_else(|| "WECHAT_PAY_KEY not configured".to_string())
    }

    pub(crate) fn hmac_sign(key: &str, payload: &str) -> String {
        // Key comes from config; an empty key is still a valid HMAC key so
        // this cannot fail in practice.
        let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Canonical payload the client-side paySign covers.
    pub(crate) fn payment_payload(order_id: &str, amount: i64, nonce: &str, timestamp: i64) -> String {
        format!("{}|{}|{}|{}", order_id, amount, nonce, timestamp)
    }

    /// Canonical payload the gateway's notify signature covers.
    pub(crate) fn notify_payload(
        order_id: &str,
        result_code: &str,
        transaction_id: Option<&str>,
        nonce: &str,
        timestamp: i64,
    ) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            order_id,
            result_code,
            transaction_id.unwrap_or(""),
            nonce,
            timestamp
        )
    }

    pub fn verify_notify_signature(
        order_id: &str,
        result_code: &str,
        transaction_id: Option<&str>,
        nonce: &str,
        timestamp: i64,
        signature: &str,
    ) -> Result<bool, String> {
        let key = Self::pay_key()?;
        let payload = Self::notify_payload(order_id, result_code, transaction_id, nonce, timestamp);
        Ok(Self::hmac_sign(&key, &payload) == signature)
    }

    /// Unified-order call: registers the prepay order with the gateway and
    /// returns the params the mini program passes to wx.requestPayment.
    pub async fn create_prepay(
        order_id: &str,
        amount: i64,
        openid: &str,
    ) -> Result<serde_json::Value, String> {
        if !Config::is_wechat_pay_enabled() {
            return Err("WeChat Pay is not configured".to_string());
        }

        let appid = Config::wechat_appid().ok_or("WECHAT_APPID not configured")?;
        let mch_id = Config::wechat_mch_id().ok_or("WECHAT_MCH_ID not configured")?;

        let res = Client::new()
            .post(Config::wechat_pay_url())
            .json(&json!({
                "appid": appid,
                "mchid": mch_id,
                "out_trade_no": order_id,
                "amount": { "total": amount, "currency": "CNY" },
                "payer": { "openid": openid },
                "notify_url": Config::wechat_notify_url(),
            }))
            .send()
            .await
            .map_err(|e| format!("Prepay request failed: {}", e))?;

        if !res.status().is_success() {
            return Err(res
                .text()
                .await
                .unwrap_or_else(|_| "Prepay rejected".to_string()));
        }

        let body: serde_json::Value = res
            .json()
            .await
            .map_err(|e| format!("Prepay response unreadable: {}", e))?;

        let prepay_id = body
            .get("prepay_id")
            .and_then(|v| v.as_str())
            .ok_or("Prepay response missing prepay_id")?;

        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let timestamp = chrono::Utc::now().timestamp();
        let pay_sign = Self::hmac_sign(
            &Self::pay_key()?,
            &Self::payment_payload(order_id, amount, &nonce, timestamp),
        );

        Ok(json!({
            "package": format!("prepay_id={}", prepay_id),
            "nonce_str": nonce,
            "time_stamp": timestamp.to_string(),
            "sign_type": "HMAC-SHA256",
            "pay_sign": pay_sign,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "test-pay-key";

    #[test]
    fn signatures_are_stable_hex() {
        let sig = WechatPayService::hmac_sign(KEY, "payload");
        assert_eq!(sig, WechatPayService::hmac_sign(KEY, "payload"));
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn notify_signature_round_trips() {
        let payload = WechatPayService::notify_payload(
            "20260101120000123000042",
            "SUCCESS",
            Some("wx-txn-9"),
            "nonce-1",
            1_767_225_600,
        );
        let sig = WechatPayService::hmac_sign(KEY, &payload);
        assert_eq!(WechatPayService::hmac_sign(KEY, &payload), sig);
    }

    #[test]
    fn tampered_notify_fields_change_the_signature() {
        let good = WechatPayService::notify_payload("order-1", "SUCCESS", None, "n", 1);
        let bad_status = WechatPayService::notify_payload("order-1", "FAIL", None, "n", 1);
        let bad_order = WechatPayService::notify_payload("order-2", "SUCCESS", None, "n", 1);
        let sig = WechatPayService::hmac_sign(KEY, &good);
        assert_ne!(sig, WechatPayService::hmac_sign(KEY, &bad_status));
        assert_ne!(sig, WechatPayService::hmac_sign(KEY, &bad_order));
    }

    #[test]
    fn missing_transaction_id_signs_as_empty() {
        let a = WechatPayService::notify_payload("o", "SUCCESS", None, "n", 1);
        let b = WechatPayService::notify_payload("o", "SUCCESS", Some(""), "n", 1);
        assert_eq!(a, b);
    }
}
