use rocket::figment::{Figment, providers::{Env, Format, Toml}};
use rocket::Config as RocketConfig;
use std::env;

pub struct Config;

impl Config {
    fn figment() -> Figment {
        // Get the current profile
        let profile = env::var("ROCKET_PROFILE").unwrap_or_else(|_| "development".to_string());

        Figment::from(RocketConfig::default())
            .merge(Toml::file("Rocket.toml").nested())
            .select(&profile)
            .merge(Env::prefixed("ROCKET_").split("_"))
    }

    pub fn jwt_secret() -> String {
        Self::figment()
            .extract_inner("jwt_secret")
            .unwrap_or_else(|_| "default-secret".to_string())
    }

    pub fn jwt_refresh_secret() -> String {
        Self::figment()
            .extract_inner("jwt_refresh_secret")
            .unwrap_or_else(|_| "default-refresh-secret".to_string())
    }

    pub fn jwt_expiry() -> i64 {
        Self::figment()
            .extract_inner("jwt_expiry")
            .unwrap_or(900)
    }

    pub fn jwt_refresh_expiry() -> i64 {
        Self::figment()
            .extract_inner("jwt_refresh_expiry")
            .unwrap_or(604800)
    }

    pub fn mongodb_uri() -> String {
        Self::figment()
            .extract_inner("mongodb_uri")
            .unwrap_or_else(|_| "mongodb://localhost:27017/jobwave".to_string())
    }

    pub fn mail_host() -> String {
        Self::figment()
            .extract_inner("mail_host")
            .unwrap_or_else(|_| "smtp.example.com".to_string())
    }

    pub fn mail_port() -> u16 {
        Self::figment()
            .extract_inner("mail_port")
            .unwrap_or(587)
    }

    pub fn mail_user() -> String {
        Self::figment()
            .extract_inner("mail_user")
            .unwrap_or_default()
    }

    pub fn mail_password() -> String {
        Self::figment()
            .extract_inner("mail_password")
            .unwrap_or_default()
    }

    pub fn mail_from() -> String {
        Self::figment()
            .extract_inner("mail_from")
            .unwrap_or_else(|_| "JobWave <noreply@jobwave.app>".to_string())
    }

    pub fn is_development() -> bool {
        let profile = env::var("ROCKET_PROFILE").unwrap_or_else(|_| "development".to_string());
        profile == "development"
    }

    pub fn wechat_appid() -> Option<String> {
        Self::figment()
            .extract_inner("wechat_appid")
            .ok()
    }

    pub fn wechat_secret() -> Option<String> {
        Self::figment()
            .extract_inner("wechat_secret")
            .ok()
    }

    pub fn is_wechat_enabled() -> bool {
        Self::wechat_appid().is_some()
            && Self::wechat_secret().is_some()
    }

    pub fn wechat_mch_id() -> Option<String> {
        Self::figment()
            .extract_inner("wechat_mch_id")
            .ok()
    }

    pub fn wechat_pay_key() -> Option<String> {
        Self::figment()
            .extract_inner("wechat_pay_key")
            .ok()
    }

    pub fn wechat_pay_url() -> String {
        Self::figment()
            .extract_inner("wechat_pay_url")
            .unwrap_or_else(|_| "https://api.mch.weixin.qq.com/v3/pay/transactions/jsapi".to_string())
    }

    pub fn wechat_notify_url() -> String {
        Self::figment()
            .extract_inner("wechat_notify_url")
            .unwrap_or_else(|_| "https://api.jobwave.app/api/v1/membership/order/notify".to_string())
    }

    pub fn is_wechat_pay_enabled() -> bool {
        Self::wechat_mch_id().is_some()
            && Self::wechat_pay_key().is_some()
    }

    pub fn ai_backend_url() -> Option<String> {
        Self::figment()
            .extract_inner("ai_backend_url")
            .ok()
    }

    pub fn is_ai_enabled() -> bool {
        Self::ai_backend_url().is_some()
    }
}
