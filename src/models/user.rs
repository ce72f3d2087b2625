use mongodb::bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};
use rocket_okapi::okapi::schemars::JsonSchema;

/// Membership entitlement embedded in the user document.
///
/// `resume_quota`/`email_quota` hold the REMAINING pooled balance for
/// pooled-mode schemes; `-1` means the balance is not pooled and per-job
/// limits on the scheme apply instead. `used`/`used_jobs_count` only grow.
///
/// Every write to this sub-document must bump `version`; snapshot writers
/// (activation, expiry reaper) additionally guard on the version they read,
/// so an interleaved counter update forces them to re-read instead of
/// silently overwriting it.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Membership {
    pub level: i32,
    pub expire_at: Option<DateTime>,
    pub resume_quota: i64,
    pub resume_used: i64,
    pub email_quota: i64,
    pub email_used: i64,
    pub used_jobs_count: i64,
    /// Order ids of every activation applied to this membership, newest
    /// last. Each one is a durable receipt: a replayed activation that finds
    /// its order id here knows the grant already landed even if the order
    /// flag write was lost, no matter how many later orders have run.
    #[serde(default)]
    pub activated_orders: Vec<String>,
    pub version: i64,
}

impl Membership {
    pub fn none() -> Self {
        Membership {
            level: 0,
            expire_at: None,
            resume_quota: -1,
            resume_used: 0,
            email_quota: -1,
            email_used: 0,
            used_jobs_count: 0,
            activated_orders: Vec::new(),
            version: 0,
        }
    }

    /// Re-derived from raw fields on every call; validity is time-based and
    /// must never be cached.
    pub fn is_valid(&self, now: DateTime) -> bool {
        self.level > 0
            && self
                .expire_at
                .map(|e| e.timestamp_millis() > now.timestamp_millis())
                .unwrap_or(false)
    }

    /// Expiry has passed (distinct from "never was a member").
    pub fn is_expired(&self, now: DateTime) -> bool {
        self.expire_at
            .map(|e| e.timestamp_millis() <= now.timestamp_millis())
            .unwrap_or(false)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct User {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub openid: String,
    pub unionid: Option<String>,
    pub nickname: Option<String>,
    pub avatar_url: Option<String>,
    pub email: Option<String>,
    pub city: Option<String>,
    pub membership: Membership,
    pub is_active: bool,
    pub last_login_at: DateTime,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct LoginDto {
    /// js_code obtained from wx.login() on the client.
    pub code: String,
    pub nickname: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct UpdateProfileDto {
    pub nickname: Option<String>,
    pub avatar_url: Option<String>,
    pub email: Option<String>,
    pub city: Option<String>,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct MembershipSnapshot {
    pub level: i32,
    /// Milliseconds since epoch; null when there is no entitlement.
    pub expire_at: Option<i64>,
    pub resume_quota: i64,
    pub resume_used: i64,
    pub email_quota: i64,
    pub email_used: i64,
    pub used_jobs_count: i64,
}

impl From<&Membership> for MembershipSnapshot {
    fn from(m: &Membership) -> Self {
        MembershipSnapshot {
            level: m.level,
            expire_at: m.expire_at.map(|e| e.timestamp_millis()),
            resume_quota: m.resume_quota,
            resume_used: m.resume_used,
            email_quota: m.email_quota,
            email_used: m.email_used,
            used_jobs_count: m.used_jobs_count,
        }
    }
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct UserResponse {
    pub id: String,
    pub openid: String,
    pub nickname: Option<String>,
    pub avatar_url: Option<String>,
    pub email: Option<String>,
    pub city: Option<String>,
    pub membership: MembershipSnapshot,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        UserResponse {
            id: user.id.map(|id| id.to_hex()).unwrap_or_default(),
            openid: user.openid,
            nickname: user.nickname,
            avatar_url: user.avatar_url,
            email: user.email,
            city: user.city,
            membership: MembershipSnapshot::from(&user.membership),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: i64) -> DateTime {
        DateTime::from_millis(ms)
    }

    #[test]
    fn fresh_user_is_not_a_member() {
        let m = Membership::none();
        assert!(!m.is_valid(at(1_000)));
        assert!(!m.is_expired(at(1_000)));
    }

    #[test]
    fn member_with_future_expiry_is_valid() {
        let m = Membership {
            level: 2,
            expire_at: Some(at(10_000)),
            ..Membership::none()
        };
        assert!(m.is_valid(at(9_999)));
        assert!(!m.is_expired(at(9_999)));
    }

    #[test]
    fn validity_flips_exactly_at_expiry() {
        let m = Membership {
            level: 2,
            expire_at: Some(at(10_000)),
            ..Membership::none()
        };
        assert!(!m.is_valid(at(10_000)));
        assert!(m.is_expired(at(10_000)));
    }

    #[test]
    fn level_zero_with_future_expiry_is_still_invalid() {
        let m = Membership {
            level: 0,
            expire_at: Some(at(10_000)),
            ..Membership::none()
        };
        assert!(!m.is_valid(at(1_000)));
    }

    #[test]
    fn snapshot_reports_expiry_in_millis() {
        let m = Membership {
            level: 3,
            expire_at: Some(at(123_456_789)),
            resume_quota: 60,
            ..Membership::none()
        };
        let snap = MembershipSnapshot::from(&m);
        assert_eq!(snap.expire_at, Some(123_456_789));
        assert_eq!(snap.resume_quota, 60);
    }
}
