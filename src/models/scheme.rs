use mongodb::bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};
use rocket_okapi::okapi::schemars::JsonSchema;

use crate::models::EmailKind;

/// Sentinel for "unlimited" in per-job caps and `max_jobs`, and for
/// "not pooled" in the total limits.
pub const UNLIMITED: i64 = -1;

/// Which regime governs a resource for a given scheme. Debit logic branches
/// on this, never on raw tier ordinals, so adding a tier is a catalog edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaMode {
    /// Caps are applied per distinct job (`max_jobs` bounds how many).
    PerJob,
    /// A single remaining balance on the user covers all jobs.
    Pooled,
}

/// How a single email debit is charged under a scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailRule {
    /// Follow-up emails are not part of the plan at all (cap 0). A feature
    /// gate, not a numeric limit.
    Forbidden,
    /// Counted against the per-job counter, capped at this many.
    PerJobCap(i64),
    /// Uncounted per job; every debit draws from the pooled email balance.
    Pooled,
}

/// Membership tier catalog document. Read-only at runtime; seeded on first
/// start when the collection is empty.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MembershipScheme {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub scheme_id: i32,
    /// Tier ordinal recorded on the user entitlement after activation.
    pub level: i32,
    pub name: String,
    /// Price in fen.
    pub price: i64,
    pub duration_days: i64,
    /// Distinct jobs the user may act on; -1 = unlimited (pooled regimes).
    pub max_jobs: i64,
    pub max_resume_edits_per_job: i64,
    pub max_email_sends_per_job: i64,
    pub max_email_communications_per_job: i64,
    /// Pooled grants; meaningful only when the per-job fields are -1.
    pub total_resume_limit: i64,
    pub total_email_limit: i64,
    /// Top-up packs extend whatever tier the buyer already holds instead of
    /// replacing it.
    pub is_addon: bool,
    pub is_active: bool,
    pub created_at: DateTime,
}

impl MembershipScheme {
    pub fn resume_mode(&self) -> QuotaMode {
        if self.max_jobs > 0 {
            QuotaMode::PerJob
        } else {
            QuotaMode::Pooled
        }
    }

    pub fn pools_resume(&self) -> bool {
        self.resume_mode() == QuotaMode::Pooled
    }

    pub fn pools_email(&self) -> bool {
        self.max_email_sends_per_job < 0
    }

    /// Whether this scheme tracks distinct-job slots at all.
    pub fn limits_distinct_jobs(&self) -> bool {
        self.max_jobs > 0
    }

    pub fn email_cap(&self, kind: EmailKind) -> i64 {
        match kind {
            EmailKind::Send => self.max_email_sends_per_job,
            EmailKind::Communication => self.max_email_communications_per_job,
        }
    }

    pub fn email_rule(&self, kind: EmailKind) -> EmailRule {
        let cap = self.email_cap(kind);
        if kind == EmailKind::Communication && cap == 0 {
            return EmailRule::Forbidden;
        }
        if cap < 0 {
            EmailRule::Pooled
        } else {
            EmailRule::PerJobCap(cap)
        }
    }

    /// Catalog inserted on first start. Levels 1-2 are per-job regimes;
    /// levels 3-4 grant pooled banks (4 is the top-up pack).
    pub fn default_catalog() -> Vec<MembershipScheme> {
        let now = DateTime::now();
        let scheme = |scheme_id: i32,
                      name: &str,
                      price: i64,
                      duration_days: i64,
                      max_jobs: i64,
                      resume_edits: i64,
                      email_sends: i64,
                      email_comms: i64,
                      total_resume: i64,
                      total_email: i64,
                      is_addon: bool| {
            MembershipScheme {
                id: None,
                scheme_id,
                level: scheme_id,
                name: name.to_string(),
                price,
                duration_days,
                max_jobs,
                max_resume_edits_per_job: resume_edits,
                max_email_sends_per_job: email_sends,
                max_email_communications_per_job: email_comms,
                total_resume_limit: total_resume,
                total_email_limit: total_email,
                is_addon,
                is_active: true,
                created_at: now,
            }
        };

        vec![
            scheme(1, "Starter", 990, 7, 3, 2, 1, 0, UNLIMITED, UNLIMITED, false),
            scheme(2, "Standard", 2990, 30, 10, 3, 2, 1, UNLIMITED, UNLIMITED, false),
            scheme(3, "Pro", 6990, 90, UNLIMITED, UNLIMITED, UNLIMITED, UNLIMITED, 60, 40, false),
            scheme(4, "Booster Pack", 1990, 30, UNLIMITED, UNLIMITED, UNLIMITED, UNLIMITED, 20, 10, true),
        ]
    }
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct SchemeResponse {
    pub scheme_id: i32,
    pub level: i32,
    pub name: String,
    pub price: i64,
    pub duration_days: i64,
    pub max_jobs: i64,
    pub max_resume_edits_per_job: i64,
    pub max_email_sends_per_job: i64,
    pub max_email_communications_per_job: i64,
    pub total_resume_limit: i64,
    pub total_email_limit: i64,
    pub is_addon: bool,
}

impl From<MembershipScheme> for SchemeResponse {
    fn from(s: MembershipScheme) -> Self {
        SchemeResponse {
            scheme_id: s.scheme_id,
            level: s.level,
            name: s.name,
            price: s.price,
            duration_days: s.duration_days,
            max_jobs: s.max_jobs,
            max_resume_edits_per_job: s.max_resume_edits_per_job,
            max_email_sends_per_job: s.max_email_sends_per_job,
            max_email_communications_per_job: s.max_email_communications_per_job,
            total_resume_limit: s.total_resume_limit,
            total_email_limit: s.total_email_limit,
            is_addon: s.is_addon,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(scheme_id: i32) -> MembershipScheme {
        MembershipScheme::default_catalog()
            .into_iter()
            .find(|s| s.scheme_id == scheme_id)
            .unwrap()
    }

    #[test]
    fn starter_and_standard_are_per_job_regimes() {
        for id in [1, 2] {
            let s = catalog(id);
            assert_eq!(s.resume_mode(), QuotaMode::PerJob);
            assert!(!s.pools_email());
            assert!(s.limits_distinct_jobs());
            // Pooled sentinels must stay -1 while per-job caps govern.
            assert_eq!(s.total_resume_limit, UNLIMITED);
            assert_eq!(s.total_email_limit, UNLIMITED);
        }
    }

    #[test]
    fn pro_and_booster_are_pooled_regimes() {
        for id in [3, 4] {
            let s = catalog(id);
            assert_eq!(s.resume_mode(), QuotaMode::Pooled);
            assert!(s.pools_email());
            assert!(!s.limits_distinct_jobs());
            assert_eq!(s.max_resume_edits_per_job, UNLIMITED);
        }
    }

    #[test]
    fn exactly_one_regime_per_resource() {
        // A tier never mixes a positive per-job cap with a positive pooled
        // total for the same resource.
        for s in MembershipScheme::default_catalog() {
            let resume_per_job = s.max_jobs > 0;
            let resume_pooled = s.total_resume_limit > 0;
            assert!(!(resume_per_job && resume_pooled), "scheme {}", s.scheme_id);

            let email_per_job = s.max_email_sends_per_job >= 0;
            let email_pooled = s.total_email_limit > 0;
            assert!(!(email_per_job && email_pooled), "scheme {}", s.scheme_id);
        }
    }

    #[test]
    fn starter_forbids_follow_up_emails() {
        let s = catalog(1);
        assert_eq!(s.email_rule(EmailKind::Communication), EmailRule::Forbidden);
        assert_eq!(s.email_rule(EmailKind::Send), EmailRule::PerJobCap(1));
    }

    #[test]
    fn standard_caps_both_email_kinds_per_job() {
        let s = catalog(2);
        assert_eq!(s.email_rule(EmailKind::Send), EmailRule::PerJobCap(2));
        assert_eq!(s.email_rule(EmailKind::Communication), EmailRule::PerJobCap(1));
    }

    #[test]
    fn pro_emails_draw_from_the_pool() {
        let s = catalog(3);
        assert_eq!(s.email_rule(EmailKind::Send), EmailRule::Pooled);
        assert_eq!(s.email_rule(EmailKind::Communication), EmailRule::Pooled);
    }

    #[test]
    fn only_the_booster_is_an_addon() {
        let addons: Vec<i32> = MembershipScheme::default_catalog()
            .iter()
            .filter(|s| s.is_addon)
            .map(|s| s.scheme_id)
            .collect();
        assert_eq!(addons, vec![4]);
    }
}
