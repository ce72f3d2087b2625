use log::{error, info};
use mongodb::bson::{doc, oid::ObjectId, DateTime};
use mongodb::options::{FindOneAndUpdateOptions, ReturnDocument};
use mongodb::Collection;

use crate::db::{is_duplicate_key_error, DbConn};
use crate::models::{EmailKind, EmailRule, MembershipScheme, QuotaMode, UsageRecord, User};
use crate::services::MembershipService;
use crate::utils::{codes, ApiError};

/// Successful debit. `remaining` is the pooled balance left after the
/// debit, or -1 when the scheme meters per job and no shared bank exists.
#[derive(Debug, Clone, Copy)]
pub struct QuotaOutcome {
    pub remaining: i64,
}

/// How a résumé debit will be charged, decided from the scheme regime and
/// whether a usage record already exists for the (user, job) pair. Record
/// existence, not the client's `is_edit` flag, discriminates first actions:
/// a record means the job slot was already consumed and every further
/// generation counts against the edit cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResumePlan {
    /// Debit the shared bank; the usage record is bookkeeping only.
    Pooled,
    /// Claim a job slot and create the usage record.
    FirstAction,
    /// Guarded increment of the per-job edit counter.
    EditCapped(i64),
    /// Per-job tier with no edit cap configured; count without a guard.
    EditUnlimited,
}

fn resume_plan(scheme: &MembershipScheme, record_exists: bool) -> ResumePlan {
    match scheme.resume_mode() {
        QuotaMode::Pooled => ResumePlan::Pooled,
        QuotaMode::PerJob if !record_exists => ResumePlan::FirstAction,
        QuotaMode::PerJob => {
            if scheme.max_resume_edits_per_job <= 0 {
                ResumePlan::EditUnlimited
            } else {
                ResumePlan::EditCapped(scheme.max_resume_edits_per_job)
            }
        }
    }
}

/// How an email debit will be charged. The communication feature gate and
/// the send-first workflow rule are checked before any quota question, so
/// they win even when a pooled balance is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmailPlan {
    /// Follow-ups are not part of the plan (cap 0). A feature gate.
    Forbidden,
    /// Follow-up requested for a job that never had a send.
    NeedSendFirst,
    /// The plan grants zero sends; nothing to claim a slot for.
    NoAllowance,
    /// Debit the shared email bank.
    Pooled,
    /// First send on a new job: claim a slot, create the record at count 1.
    FirstSend,
    /// Guarded increment of this kind's per-job counter.
    Counted(i64),
}

fn email_plan(scheme: &MembershipScheme, kind: EmailKind, record_exists: bool) -> EmailPlan {
    match scheme.email_rule(kind) {
        EmailRule::Forbidden => EmailPlan::Forbidden,
        // The send-first workflow rule outranks quota questions, pooled or not.
        _ if kind == EmailKind::Communication && !record_exists => EmailPlan::NeedSendFirst,
        EmailRule::Pooled => EmailPlan::Pooled,
        EmailRule::PerJobCap(cap) => {
            if kind == EmailKind::Send && !record_exists {
                if cap == 0 {
                    EmailPlan::NoAllowance
                } else {
                    EmailPlan::FirstSend
                }
            } else {
                EmailPlan::Counted(cap)
            }
        }
    }
}

fn email_counter_field(kind: EmailKind) -> &'static str {
    match kind {
        EmailKind::Send => "email_sends_count",
        EmailKind::Communication => "email_communications_count",
    }
}

pub struct QuotaService;

impl QuotaService {
    /// Charges one résumé generation for `(user, job)` against the user's
    /// plan. Must succeed before the generation task is submitted; a
    /// rejection means the action never happens.
    ///
    /// `is_edit` is the client's intent and is passed through to logging
    /// and the generation payload; enforcement derives first-vs-edit from
    /// the usage record so a retried "first" call cannot consume a second
    /// job slot.
    pub async fn debit_resume(
        db: &DbConn,
        user_id: ObjectId,
        job_id: ObjectId,
        is_edit: bool,
    ) -> Result<QuotaOutcome, ApiError> {
        let scheme = Self::governing_scheme(db, &user_id).await?;
        let records = db.collection::<UsageRecord>("usage_records");
        let record_exists = Self::record_exists(&records, user_id, job_id).await?;

        let plan = resume_plan(&scheme, record_exists);
        info!(
            "Resume debit user={} job={} edit={} plan={:?}",
            user_id.to_hex(),
            job_id.to_hex(),
            is_edit,
            plan
        );

        match plan {
            ResumePlan::Pooled => {
                let remaining =
                    Self::debit_bank(db, user_id, "membership.resume_quota", "membership.resume_used")
                        .await?
                        .ok_or_else(|| {
                            ApiError::rejection(
                                codes::QUOTA_EXHAUSTED,
                                "Resume quota exhausted",
                                true,
                            )
                        })?;
                Self::bookkeep(&records, user_id, job_id, "resume_edits_count").await;
                Ok(QuotaOutcome { remaining })
            }
            ResumePlan::FirstAction => {
                if scheme.limits_distinct_jobs() {
                    Self::claim_job_slot(db, user_id, scheme.max_jobs).await?;
                }
                match records.insert_one(UsageRecord::new(user_id, job_id), None).await {
                    Ok(_) => Ok(QuotaOutcome { remaining: -1 }),
                    Err(e) if is_duplicate_key_error(&e) => {
                        // Lost the create race to a concurrent first action;
                        // give the slot back and charge this call as an edit.
                        if scheme.limits_distinct_jobs() {
                            Self::release_job_slot(db, user_id).await;
                        }
                        Self::debit_resume_edit(&records, user_id, job_id, &scheme).await
                    }
                    Err(e) => {
                        error!("Failed to create usage record: {}", e);
                        Err(ApiError::internal_error("Failed to record usage"))
                    }
                }
            }
            ResumePlan::EditCapped(_) | ResumePlan::EditUnlimited => {
                Self::debit_resume_edit(&records, user_id, job_id, &scheme).await
            }
        }
    }

    /// Charges one email of `kind` for `(user, job)`. Same contract as
    /// `debit_resume`: rejection means the email must not be sent.
    pub async fn debit_email(
        db: &DbConn,
        user_id: ObjectId,
        job_id: ObjectId,
        kind: EmailKind,
    ) -> Result<QuotaOutcome, ApiError> {
        let scheme = Self::governing_scheme(db, &user_id).await?;
        let records = db.collection::<UsageRecord>("usage_records");
        let record_exists = Self::record_exists(&records, user_id, job_id).await?;

        let plan = email_plan(&scheme, kind, record_exists);
        info!(
            "Email debit user={} job={} kind={:?} plan={:?}",
            user_id.to_hex(),
            job_id.to_hex(),
            kind,
            plan
        );

        match plan {
            EmailPlan::Forbidden => Err(ApiError::rejection(
                codes::COMMUNICATION_NOT_ALLOWED,
                "Your plan does not include follow-up emails",
                true,
            )),
            EmailPlan::NeedSendFirst => Err(ApiError::rejection(
                codes::SEND_REQUIRED_FIRST,
                "Send an application email for this job first",
                false,
            )),
            EmailPlan::NoAllowance => Err(ApiError::rejection(
                codes::QUOTA_EXHAUSTED,
                "Your plan does not include email sends",
                true,
            )),
            EmailPlan::Pooled => {
                let remaining =
                    Self::debit_bank(db, user_id, "membership.email_quota", "membership.email_used")
                        .await?
                        .ok_or_else(|| {
                            ApiError::rejection(
                                codes::QUOTA_EXHAUSTED,
                                "Email quota exhausted",
                                true,
                            )
                        })?;
                Self::bookkeep(&records, user_id, job_id, email_counter_field(kind)).await;
                Ok(QuotaOutcome { remaining })
            }
            EmailPlan::FirstSend => {
                if scheme.limits_distinct_jobs() {
                    Self::claim_job_slot(db, user_id, scheme.max_jobs).await?;
                }
                let mut record = UsageRecord::new(user_id, job_id);
                record.email_sends_count = 1;
                match records.insert_one(record, None).await {
                    Ok(_) => Ok(QuotaOutcome { remaining: -1 }),
                    Err(e) if is_duplicate_key_error(&e) => {
                        if scheme.limits_distinct_jobs() {
                            Self::release_job_slot(db, user_id).await;
                        }
                        Self::debit_email_counted(&records, user_id, job_id, kind, scheme.email_cap(kind))
                            .await
                    }
                    Err(e) => {
                        error!("Failed to create usage record: {}", e);
                        Err(ApiError::internal_error("Failed to record usage"))
                    }
                }
            }
            EmailPlan::Counted(cap) => {
                Self::debit_email_counted(&records, user_id, job_id, kind, cap).await
            }
        }
    }

    /// Loads the (lazily reaped) user, rejects non-members, and resolves
    /// the scheme their level is governed by. Shared entry of both debits.
    async fn governing_scheme(
        db: &DbConn,
        user_id: &ObjectId,
    ) -> Result<MembershipScheme, ApiError> {
        let (user, _) = MembershipService::check_membership(db, user_id).await?;

        if !user.membership.is_valid(DateTime::now()) {
            return Err(ApiError::rejection(
                codes::NOT_A_MEMBER,
                "An active membership is required",
                true,
            ));
        }

        db.collection::<MembershipScheme>("membership_schemes")
            .find_one(
                doc! { "level": user.membership.level, "is_active": true },
                None,
            )
            .await
            .map_err(|e| {
                error!(
                    "Failed to load scheme for level {}: {}",
                    user.membership.level, e
                );
                ApiError::internal_error("Failed to load scheme")
            })?
            .ok_or_else(|| ApiError::missing(codes::SCHEME_NOT_FOUND, "Scheme not found"))
    }

    async fn record_exists(
        records: &Collection<UsageRecord>,
        user_id: ObjectId,
        job_id: ObjectId,
    ) -> Result<bool, ApiError> {
        records
            .find_one(doc! { "user_id": user_id, "job_id": job_id }, None)
            .await
            .map(|r| r.is_some())
            .map_err(|e| {
                error!("Failed to load usage record: {}", e);
                ApiError::internal_error("Failed to load usage record")
            })
    }

    /// Atomic decrement-and-check on a shared bank field. `None` means the
    /// balance was not positive; two concurrent debits of a balance of 1
    /// resolve to exactly one `Some`.
    async fn debit_bank(
        db: &DbConn,
        user_id: ObjectId,
        quota_field: &str,
        used_field: &str,
    ) -> Result<Option<i64>, ApiError> {
        let users = db.collection::<User>("users");
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        let updated = users
            .find_one_and_update(
                doc! { "_id": user_id, quota_field: { "$gt": 0 } },
                doc! { "$inc": {
                    quota_field: -1,
                    used_field: 1,
                    "membership.version": 1,
                } },
                options,
            )
            .await
            .map_err(|e| {
                error!("Failed to debit {} for {}: {}", quota_field, user_id.to_hex(), e);
                ApiError::internal_error("Failed to debit quota")
            })?;

        Ok(updated.map(|u| match quota_field {
            "membership.resume_quota" => u.membership.resume_quota,
            _ => u.membership.email_quota,
        }))
    }

    /// One distinct-job slot, claimed with the cap in the filter so the
    /// guard and the increment are a single atomic step.
    async fn claim_job_slot(db: &DbConn, user_id: ObjectId, max_jobs: i64) -> Result<(), ApiError> {
        let users = db.collection::<User>("users");
        let result = users
            .update_one(
                doc! { "_id": user_id, "membership.used_jobs_count": { "$lt": max_jobs } },
                doc! { "$inc": { "membership.used_jobs_count": 1, "membership.version": 1 } },
                None,
            )
            .await
            .map_err(|e| {
                error!("Failed to claim job slot for {}: {}", user_id.to_hex(), e);
                ApiError::internal_error("Failed to claim job slot")
            })?;

        if result.modified_count == 0 {
            return Err(ApiError::rejection(
                codes::JOB_LIMIT_REACHED,
                "Job limit for your plan reached",
                true,
            ));
        }
        Ok(())
    }

    /// Returns a slot claimed by a first action that lost the record-create
    /// race. Best effort: the caller proceeds either way.
    async fn release_job_slot(db: &DbConn, user_id: ObjectId) {
        let users = db.collection::<User>("users");
        if let Err(e) = users
            .update_one(
                doc! { "_id": user_id },
                doc! { "$inc": { "membership.used_jobs_count": -1, "membership.version": 1 } },
                None,
            )
            .await
        {
            error!("Failed to release job slot for {}: {}", user_id.to_hex(), e);
        }
    }

    async fn debit_resume_edit(
        records: &Collection<UsageRecord>,
        user_id: ObjectId,
        job_id: ObjectId,
        scheme: &MembershipScheme,
    ) -> Result<QuotaOutcome, ApiError> {
        let cap = scheme.max_resume_edits_per_job;
        let now = DateTime::now();

        if cap <= 0 {
            records
                .update_one(
                    doc! { "user_id": user_id, "job_id": job_id },
                    doc! { "$inc": { "resume_edits_count": 1 }, "$set": { "updated_at": now } },
                    None,
                )
                .await
                .map_err(|e| {
                    error!("Failed to count resume edit: {}", e);
                    ApiError::internal_error("Failed to record usage")
                })?;
            return Ok(QuotaOutcome { remaining: -1 });
        }

        let updated = records
            .find_one_and_update(
                doc! {
                    "user_id": user_id,
                    "job_id": job_id,
                    "resume_edits_count": { "$lt": cap },
                },
                doc! { "$inc": { "resume_edits_count": 1 }, "$set": { "updated_at": now } },
                FindOneAndUpdateOptions::builder()
                    .return_document(ReturnDocument::After)
                    .build(),
            )
            .await
            .map_err(|e| {
                error!("Failed to count resume edit: {}", e);
                ApiError::internal_error("Failed to record usage")
            })?;

        match updated {
            Some(_) => Ok(QuotaOutcome { remaining: -1 }),
            None => Err(ApiError::rejection(
                codes::JOB_LIMIT_REACHED,
                "Resume edit limit reached for this job",
                true,
            )),
        }
    }

    async fn debit_email_counted(
        records: &Collection<UsageRecord>,
        user_id: ObjectId,
        job_id: ObjectId,
        kind: EmailKind,
        cap: i64,
    ) -> Result<QuotaOutcome, ApiError> {
        let field = email_counter_field(kind);
        let now = DateTime::now();

        let updated = records
            .find_one_and_update(
                doc! { "user_id": user_id, "job_id": job_id, field: { "$lt": cap } },
                doc! { "$inc": { field: 1 }, "$set": { "updated_at": now } },
                FindOneAndUpdateOptions::builder()
                    .return_document(ReturnDocument::After)
                    .build(),
            )
            .await
            .map_err(|e| {
                error!("Failed to count email {:?}: {}", kind, e);
                ApiError::internal_error("Failed to record usage")
            })?;

        match updated {
            Some(_) => Ok(QuotaOutcome { remaining: -1 }),
            None => {
                let message = match kind {
                    EmailKind::Send => "Email send limit reached for this job",
                    EmailKind::Communication => "Follow-up limit reached for this job",
                };
                Err(ApiError::rejection(codes::QUOTA_EXHAUSTED, message, true))
            }
        }
    }

    /// History for pooled debits. The bank already moved, so failures here
    /// are logged and the debit still succeeds.
    async fn bookkeep(
        records: &Collection<UsageRecord>,
        user_id: ObjectId,
        job_id: ObjectId,
        field: &str,
    ) {
        let now = DateTime::now();
        let others: Vec<&str> = ["resume_edits_count", "email_sends_count", "email_communications_count"]
            .into_iter()
            .filter(|f| *f != field)
            .collect();

        let mut on_insert = doc! { "created_at": now };
        for f in others {
            on_insert.insert(f, 0i64);
        }

        let result = records
            .update_one(
                doc! { "user_id": user_id, "job_id": job_id },
                doc! {
                    "$inc": { field: 1 },
                    "$set": { "updated_at": now },
                    "$setOnInsert": on_insert,
                },
                mongodb::options::UpdateOptions::builder().upsert(true).build(),
            )
            .await;

        match result {
            Ok(_) => {}
            Err(e) if is_duplicate_key_error(&e) => {
                // Concurrent upserts can both miss then collide on the
                // unique index; the record exists now, count on it plainly.
                if let Err(e) = records
                    .update_one(
                        doc! { "user_id": user_id, "job_id": job_id },
                        doc! { "$inc": { field: 1 }, "$set": { "updated_at": now } },
                        None,
                    )
                    .await
                {
                    error!("Failed to bookkeep {}: {}", field, e);
                }
            }
            Err(e) => error!("Failed to bookkeep {}: {}", field, e),
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

    fn per_job_scheme(max_jobs: i64, edits: i64, sends: i64, comms: i64) -> MembershipScheme {
        MembershipScheme {
            max_jobs,
            max_resume_edits_per_job: edits,
            max_email_sends_per_job: sends,
            max_email_communications_per_job: comms,
            total_resume_limit: -1,
            total_email_limit: -1,
            ..catalog(1)
        }
    }

    #[test]
    fn first_resume_action_claims_a_slot() {
        let starter = catalog(1);
        assert_eq!(resume_plan(&starter, false), ResumePlan::FirstAction);
    }

    #[test]
    fn existing_record_makes_every_resume_call_an_edit() {
        let starter = catalog(1);
        assert_eq!(resume_plan(&starter, true), ResumePlan::EditCapped(2));
        let standard = catalog(2);
        assert_eq!(resume_plan(&standard, true), ResumePlan::EditCapped(3));
    }

    #[test]
    fn per_job_tier_without_edit_cap_is_unrestricted_after_first_action() {
        let scheme = per_job_scheme(5, 0, 1, 0);
        assert_eq!(resume_plan(&scheme, true), ResumePlan::EditUnlimited);
        let scheme = per_job_scheme(5, -1, 1, 0);
        assert_eq!(resume_plan(&scheme, true), ResumePlan::EditUnlimited);
    }

    #[test]
    fn pooled_tier_resume_ignores_the_record() {
        let pro = catalog(3);
        assert_eq!(resume_plan(&pro, false), ResumePlan::Pooled);
        assert_eq!(resume_plan(&pro, true), ResumePlan::Pooled);
    }

    #[test]
    fn communication_gate_wins_over_everything() {
        let starter = catalog(1);
        // Even with a record in place the feature gate holds.
        assert_eq!(
            email_plan(&starter, EmailKind::Communication, true),
            EmailPlan::Forbidden
        );
        assert_eq!(
            email_plan(&starter, EmailKind::Communication, false),
            EmailPlan::Forbidden
        );
        // A pooled balance does not unlock a gated feature either.
        let gated_pool = MembershipScheme {
            max_email_communications_per_job: 0,
            ..catalog(3)
        };
        assert_eq!(
            email_plan(&gated_pool, EmailKind::Communication, true),
            EmailPlan::Forbidden
        );
    }

    #[test]
    fn communication_requires_a_prior_send() {
        let standard = catalog(2);
        assert_eq!(
            email_plan(&standard, EmailKind::Communication, false),
            EmailPlan::NeedSendFirst
        );
        assert_eq!(
            email_plan(&standard, EmailKind::Communication, true),
            EmailPlan::Counted(1)
        );
        // Holds for pooled tiers too.
        let pro = catalog(3);
        assert_eq!(
            email_plan(&pro, EmailKind::Communication, false),
            EmailPlan::NeedSendFirst
        );
        assert_eq!(
            email_plan(&pro, EmailKind::Communication, true),
            EmailPlan::Pooled
        );
    }

    #[test]
    fn first_send_on_a_new_job_claims_a_slot() {
        let starter = catalog(1);
        assert_eq!(email_plan(&starter, EmailKind::Send, false), EmailPlan::FirstSend);
        assert_eq!(email_plan(&starter, EmailKind::Send, true), EmailPlan::Counted(1));
    }

    #[test]
    fn pooled_sends_skip_slot_accounting() {
        let pro = catalog(3);
        assert_eq!(email_plan(&pro, EmailKind::Send, false), EmailPlan::Pooled);
        assert_eq!(email_plan(&pro, EmailKind::Send, true), EmailPlan::Pooled);
    }

    #[test]
    fn zero_send_allowance_fails_before_claiming_a_slot() {
        let scheme = per_job_scheme(5, 2, 0, 0);
        assert_eq!(email_plan(&scheme, EmailKind::Send, false), EmailPlan::NoAllowance);
        // With a record the guarded counter path reports exhaustion instead.
        assert_eq!(email_plan(&scheme, EmailKind::Send, true), EmailPlan::Counted(0));
    }

    #[test]
    fn email_counters_are_independent_per_kind() {
        assert_eq!(email_counter_field(EmailKind::Send), "email_sends_count");
        assert_eq!(
            email_counter_field(EmailKind::Communication),
            "email_communications_count"
        );
    }
}
