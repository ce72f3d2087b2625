use log::{error, info, warn};
use mongodb::bson::{self, doc, oid::ObjectId, DateTime};
use mongodb::Collection;

use crate::db::DbConn;
use crate::models::{Membership, MembershipScheme, MembershipSnapshot, Order, OrderStatus, User};
use crate::utils::{codes, ApiError};

const DAY_MS: i64 = 86_400_000;

/// Attempts against the entitlement version guard before giving up. Counter
/// debits bump the version too, so a busy user can move it under us; each
/// miss re-reads and recomputes.
const CAS_RETRIES: usize = 5;

/// Renewal policy: extend from the existing expiry while it is still in the
/// future, otherwise start from now. Holds for every tier.
fn next_expire_at(current: Option<DateTime>, now: DateTime, duration_days: i64) -> DateTime {
    let base = current
        .filter(|e| e.timestamp_millis() > now.timestamp_millis())
        .map(|e| e.timestamp_millis())
        .unwrap_or_else(|| now.timestamp_millis());
    DateTime::from_millis(base + duration_days * DAY_MS)
}

/// The entitlement produced by activating `scheme` on top of `current`.
///
/// Pooled banks accumulate only when the buyer renews the tier they already
/// hold while it is still active; any other grant sets them fresh from the
/// scheme. Per-job schemes reset the bank fields to the not-pooled sentinel,
/// so a non-negative bank always means the holder's own tier pools. Top-up
/// packs keep the holder's level and pour their banks on top of an active
/// pooled entitlement; without one (a per-job holder included) they behave
/// like a normal grant of their own tier.
fn next_membership(
    current: &Membership,
    scheme: &MembershipScheme,
    now: DateTime,
    order_id: &str,
) -> Membership {
    let active = current.is_valid(now);
    let expire_at = Some(next_expire_at(current.expire_at, now, scheme.duration_days));
    let mut receipts = current.activated_orders.clone();
    receipts.push(order_id.to_string());

    if scheme.is_addon && active && current.resume_quota >= 0 {
        return Membership {
            level: current.level,
            expire_at,
            resume_quota: current.resume_quota + scheme.total_resume_limit.max(0),
            resume_used: current.resume_used,
            email_quota: current.email_quota.max(0) + scheme.total_email_limit.max(0),
            email_used: current.email_used,
            used_jobs_count: current.used_jobs_count,
            activated_orders: receipts,
            version: current.version + 1,
        };
    }

    let same_tier = active && current.level == scheme.level;

    Membership {
        level: scheme.level,
        expire_at,
        resume_quota: if !scheme.pools_resume() {
            -1
        } else if same_tier {
            current.resume_quota.max(0) + scheme.total_resume_limit
        } else {
            scheme.total_resume_limit
        },
        resume_used: if scheme.pools_resume() && !same_tier {
            0
        } else {
            current.resume_used
        },
        email_quota: if !scheme.pools_email() {
            -1
        } else if same_tier {
            current.email_quota.max(0) + scheme.total_email_limit
        } else {
            scheme.total_email_limit
        },
        email_used: if scheme.pools_email() && !same_tier {
            0
        } else {
            current.email_used
        },
        used_jobs_count: if same_tier { current.used_jobs_count } else { 0 },
        activated_orders: receipts,
        version: current.version + 1,
    }
}

/// Entitlement after expiry: back to level 0 with the banks reset to the
/// not-pooled sentinel, exactly the shape a never-member has. Consumption
/// history and the activation receipts survive the downgrade.
fn reaped(current: &Membership) -> Membership {
    Membership {
        level: 0,
        expire_at: None,
        resume_quota: -1,
        resume_used: current.resume_used,
        email_quota: -1,
        email_used: current.email_used,
        used_jobs_count: current.used_jobs_count,
        activated_orders: current.activated_orders.clone(),
        version: current.version + 1,
    }
}

/// A granted level whose expiry has passed. The reaper acts on exactly this,
/// and it is the only signal that an entitlement just lapsed: the downgraded
/// snapshot carries no expiry of its own.
fn lapsed(membership: &Membership, now: DateTime) -> bool {
    membership.level > 0 && membership.is_expired(now)
}

pub struct MembershipService;

impl MembershipService {
    /// Applies a paid order to its buyer's entitlement, exactly once.
    ///
    /// Re-entrant by construction: the order's `is_activated` flag
    /// short-circuits completed activations, and the receipt list on the
    /// entitlement catches the crash window where the grant landed but the
    /// flag write did not, even when other orders have activated in
    /// between. `claimed_user` restricts manual activation calls to the
    /// order's owner; the payment callback passes `None`.
    pub async fn activate_order(
        db: &DbConn,
        order_id: &str,
        claimed_user: Option<&ObjectId>,
    ) -> Result<MembershipSnapshot, ApiError> {
        let orders = db.collection::<Order>("orders");
        let users = db.collection::<User>("users");
        let schemes = db.collection::<MembershipScheme>("membership_schemes");

        let order = orders
            .find_one(doc! { "order_id": order_id }, None)
            .await
            .map_err(|e| {
                error!("Failed to load order {}: {}", order_id, e);
                ApiError::internal_error("Failed to load order")
            })?
            .ok_or_else(|| ApiError::missing(codes::ORDER_NOT_FOUND, "Order not found"))?;

        if let Some(user_id) = claimed_user {
            // Someone else's order id is indistinguishable from a missing one.
            if order.user_id != *user_id {
                return Err(ApiError::missing(codes::ORDER_NOT_FOUND, "Order not found"));
            }
        }

        if order.is_activated {
            let user = Self::load_user(&users, &order.user_id).await?;
            info!("Order {} already activated, returning current entitlement", order_id);
            return Ok(MembershipSnapshot::from(&user.membership));
        }

        if order.status != OrderStatus::Paid {
            return Err(ApiError::order_not_paid(format!(
                "Order {} has not been paid",
                order_id
            )));
        }

        let scheme = schemes
            .find_one(doc! { "scheme_id": order.scheme_id }, None)
            .await
            .map_err(|e| {
                error!("Failed to load scheme {}: {}", order.scheme_id, e);
                ApiError::internal_error("Failed to load scheme")
            })?
            .ok_or_else(|| ApiError::missing(codes::SCHEME_NOT_FOUND, "Scheme not found"))?;

        let mut granted = None;
        for attempt in 0..CAS_RETRIES {
            let user = Self::load_user(&users, &order.user_id).await?;

            if user.membership.activated_orders.iter().any(|o| o == order_id) {
                // The grant landed on a previous attempt; only the order
                // flag write was lost. Repair it and report success.
                Self::flag_activated(&orders, order_id).await?;
                return Ok(MembershipSnapshot::from(&user.membership));
            }

            let now = DateTime::now();
            let next = next_membership(&user.membership, &scheme, now, order_id);
            let next_doc = bson::to_bson(&next).map_err(|e| {
                error!("Failed to serialize entitlement: {}", e);
                ApiError::internal_error("Failed to apply entitlement")
            })?;

            let result = users
                .update_one(
                    doc! {
                        "_id": order.user_id,
                        "membership.version": user.membership.version,
                    },
                    doc! { "$set": { "membership": next_doc, "updated_at": now } },
                    None,
                )
                .await
                .map_err(|e| {
                    error!("Failed to write entitlement for order {}: {}", order_id, e);
                    ApiError::internal_error("Failed to apply entitlement")
                })?;

            if result.modified_count == 1 {
                granted = Some(next);
                break;
            }
            warn!(
                "Entitlement moved under activation of order {} (attempt {})",
                order_id,
                attempt + 1
            );
        }

        let granted = granted.ok_or_else(|| {
            ApiError::internal_error("Entitlement update kept conflicting, please retry")
        })?;

        Self::flag_activated(&orders, order_id).await?;
        info!(
            "Activated order {}: user {} now level {} until {:?}",
            order_id,
            order.user_id.to_hex(),
            granted.level,
            granted.expire_at
        );
        Ok(MembershipSnapshot::from(&granted))
    }

    /// Loads the user and lazily downgrades an expired entitlement before
    /// returning. The only place expiry is materialized; there is no
    /// background sweep. The flag reports whether this call performed the
    /// downgrade, i.e. whether the entitlement lapsed just now.
    pub async fn check_membership(
        db: &DbConn,
        user_id: &ObjectId,
    ) -> Result<(User, bool), ApiError> {
        let users = db.collection::<User>("users");

        for _ in 0..CAS_RETRIES {
            let mut user = Self::load_user(&users, user_id).await?;

            let now = DateTime::now();
            if !lapsed(&user.membership, now) {
                return Ok((user, false));
            }

            let next = reaped(&user.membership);
            let next_doc = bson::to_bson(&next).map_err(|e| {
                error!("Failed to serialize entitlement: {}", e);
                ApiError::internal_error("Failed to update membership")
            })?;

            let result = users
                .update_one(
                    doc! {
                        "_id": *user_id,
                        "membership.version": user.membership.version,
                    },
                    doc! { "$set": { "membership": next_doc, "updated_at": now } },
                    None,
                )
                .await
                .map_err(|e| {
                    error!("Failed to reap membership for {}: {}", user_id.to_hex(), e);
                    ApiError::internal_error("Failed to update membership")
                })?;

            if result.modified_count == 1 {
                info!("Membership expired for user {}, reset to level 0", user_id.to_hex());
                user.membership = next;
                return Ok((user, true));
            }
            // A renewal raced the downgrade. Re-read and re-decide.
        }

        Err(ApiError::internal_error("Membership state kept changing, please retry"))
    }

    async fn load_user(users: &Collection<User>, user_id: &ObjectId) -> Result<User, ApiError> {
        users
            .find_one(doc! { "_id": *user_id }, None)
            .await
            .map_err(|e| {
                error!("Failed to load user {}: {}", user_id.to_hex(), e);
                ApiError::internal_error("Failed to load user")
            })?
            .ok_or_else(|| ApiError::missing(codes::USER_NOT_FOUND, "User not found"))
    }

    async fn flag_activated(orders: &Collection<Order>, order_id: &str) -> Result<(), ApiError> {
        let result = orders
            .update_one(
                doc! { "order_id": order_id, "is_activated": false },
                doc! { "$set": { "is_activated": true, "updated_at": DateTime::now() } },
                None,
            )
            .await
            .map_err(|e| {
                error!("Failed to flag order {} activated: {}", order_id, e);
                ApiError::internal_error("Failed to finalize activation")
            })?;

        if result.modified_count == 0 {
            warn!("Order {} was already flagged activated", order_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: i64) -> DateTime {
        DateTime::from_millis(ms)
    }

    fn catalog(scheme_id: i32) -> MembershipScheme {
        MembershipScheme::default_catalog()
            .into_iter()
            .find(|s| s.scheme_id == scheme_id)
            .unwrap()
    }

    fn pro_member(expire_ms: i64, resume_left: i64, email_left: i64) -> Membership {
        Membership {
            level: 3,
            expire_at: Some(at(expire_ms)),
            resume_quota: resume_left,
            resume_used: 60 - resume_left,
            email_quota: email_left,
            email_used: 40 - email_left,
            used_jobs_count: 0,
            activated_orders: vec!["previous-order".to_string()],
            version: 9,
        }
    }

    #[test]
    fn first_grant_starts_from_now() {
        let now = at(1_000);
        let next = next_membership(&Membership::none(), &catalog(1), now, "order-1");

        assert_eq!(next.level, 1);
        assert_eq!(next.expire_at, Some(at(1_000 + 7 * DAY_MS)));
        // Per-job tier: the bank fields stay at the not-pooled sentinel.
        assert_eq!(next.resume_quota, -1);
        assert_eq!(next.email_quota, -1);
        assert_eq!(next.used_jobs_count, 0);
        assert_eq!(next.activated_orders, vec!["order-1".to_string()]);
        assert_eq!(next.version, 1);
    }

    #[test]
    fn renewing_while_active_extends_from_existing_expiry() {
        let now = at(0);
        let current = Membership {
            level: 2,
            expire_at: Some(at(5 * DAY_MS)),
            ..Membership::none()
        };
        let next = next_membership(&current, &catalog(2), now, "order-2");
        assert_eq!(next.expire_at, Some(at(35 * DAY_MS)));
    }

    #[test]
    fn expired_membership_renews_from_now() {
        let now = at(100 * DAY_MS);
        let current = Membership {
            level: 2,
            expire_at: Some(at(50 * DAY_MS)),
            ..Membership::none()
        };
        let next = next_membership(&current, &catalog(2), now, "order-3");
        assert_eq!(next.expire_at, Some(at(130 * DAY_MS)));
    }

    #[test]
    fn expiry_at_this_exact_instant_counts_as_expired() {
        let now = at(50 * DAY_MS);
        let current = Membership {
            level: 2,
            expire_at: Some(at(50 * DAY_MS)),
            ..Membership::none()
        };
        let next = next_membership(&current, &catalog(2), now, "order-4");
        assert_eq!(next.expire_at, Some(at(80 * DAY_MS)));
        // Same tier but no longer active, so job slots start over.
        assert_eq!(next.used_jobs_count, 0);
    }

    #[test]
    fn same_tier_pooled_renewal_accumulates_remaining_bank() {
        let now = at(0);
        let current = pro_member(10 * DAY_MS, 7, 12);
        let next = next_membership(&current, &catalog(3), now, "order-5");

        assert_eq!(next.level, 3);
        assert_eq!(next.resume_quota, 67);
        assert_eq!(next.email_quota, 52);
        // History carries over on a same-tier renewal.
        assert_eq!(next.resume_used, 53);
        assert_eq!(next.email_used, 28);
        assert_eq!(next.expire_at, Some(at(100 * DAY_MS)));
    }

    #[test]
    fn tier_change_sets_pooled_bank_fresh() {
        let now = at(0);
        let current = Membership {
            level: 2,
            expire_at: Some(at(3 * DAY_MS)),
            used_jobs_count: 6,
            ..Membership::none()
        };
        let next = next_membership(&current, &catalog(3), now, "order-6");

        assert_eq!(next.level, 3);
        assert_eq!(next.resume_quota, 60);
        assert_eq!(next.email_quota, 40);
        assert_eq!(next.resume_used, 0);
        assert_eq!(next.email_used, 0);
        assert_eq!(next.used_jobs_count, 0);
        // Expiry still extends from the existing one even across tiers.
        assert_eq!(next.expire_at, Some(at(93 * DAY_MS)));
    }

    #[test]
    fn buying_again_after_expiry_does_not_inherit_the_old_bank() {
        let now = at(200 * DAY_MS);
        let current = pro_member(100 * DAY_MS, 33, 21);
        let next = next_membership(&current, &catalog(3), now, "order-7");

        assert_eq!(next.resume_quota, 60);
        assert_eq!(next.email_quota, 40);
        assert_eq!(next.expire_at, Some(at(290 * DAY_MS)));
    }

    #[test]
    fn downgrade_to_per_job_tier_resets_the_bank_to_the_sentinel() {
        let now = at(0);
        let current = pro_member(10 * DAY_MS, 12, 5);
        let next = next_membership(&current, &catalog(2), now, "order-8");

        assert_eq!(next.level, 2);
        // The leftover pooled balance is wiped, not kept as a stale value: a
        // non-negative bank must always mean the holder's tier pools.
        assert_eq!(next.resume_quota, -1);
        assert_eq!(next.email_quota, -1);
        assert_eq!(next.used_jobs_count, 0);
        assert_eq!(next.expire_at, Some(at(40 * DAY_MS)));
    }

    #[test]
    fn booster_on_a_per_job_holder_grants_its_own_tier() {
        let now = at(0);
        // A pooled member who moved down to a per-job tier. The downgrade
        // wiped the bank, so the top-up path must not fire and pour quota
        // into banks the per-job level never reads.
        let holder = next_membership(&pro_member(10 * DAY_MS, 12, 5), &catalog(2), now, "order-14");
        let next = next_membership(&holder, &catalog(4), now, "order-15");

        assert_eq!(next.level, 4);
        assert_eq!(next.resume_quota, 20);
        assert_eq!(next.email_quota, 10);
        assert_eq!(next.expire_at, Some(at(70 * DAY_MS)));
    }

    #[test]
    fn upgrade_resets_job_slots_but_extends_expiry() {
        let now = at(0);
        let current = Membership {
            level: 1,
            expire_at: Some(at(2 * DAY_MS)),
            used_jobs_count: 3,
            ..Membership::none()
        };
        let next = next_membership(&current, &catalog(2), now, "order-9");
        assert_eq!(next.used_jobs_count, 0);
        assert_eq!(next.expire_at, Some(at(32 * DAY_MS)));
    }

    #[test]
    fn booster_tops_up_an_active_pooled_bank() {
        let now = at(0);
        let current = pro_member(10 * DAY_MS, 5, 0);
        let next = next_membership(&current, &catalog(4), now, "order-10");

        // Level and history survive; banks grow; expiry extends.
        assert_eq!(next.level, 3);
        assert_eq!(next.resume_quota, 25);
        assert_eq!(next.email_quota, 10);
        assert_eq!(next.resume_used, 55);
        assert_eq!(next.expire_at, Some(at(40 * DAY_MS)));
    }

    #[test]
    fn exhausted_bank_still_accepts_a_top_up() {
        let now = at(0);
        let current = pro_member(10 * DAY_MS, 0, 0);
        let next = next_membership(&current, &catalog(4), now, "order-11");
        assert_eq!(next.level, 3);
        assert_eq!(next.resume_quota, 20);
        assert_eq!(next.email_quota, 10);
    }

    #[test]
    fn booster_without_an_active_pool_grants_its_own_tier() {
        let now = at(0);
        let next = next_membership(&Membership::none(), &catalog(4), now, "order-12");
        assert_eq!(next.level, 4);
        assert_eq!(next.resume_quota, 20);
        assert_eq!(next.email_quota, 10);
        assert_eq!(next.expire_at, Some(at(30 * DAY_MS)));
    }

    #[test]
    fn every_grant_bumps_version_and_appends_its_receipt() {
        let now = at(0);
        let current = pro_member(10 * DAY_MS, 7, 12);
        let next = next_membership(&current, &catalog(3), now, "order-13");
        assert_eq!(next.version, current.version + 1);
        assert_eq!(
            next.activated_orders,
            vec!["previous-order".to_string(), "order-13".to_string()]
        );
    }

    #[test]
    fn receipts_from_earlier_orders_survive_later_activations() {
        let now = at(0);
        let first = next_membership(&Membership::none(), &catalog(3), now, "order-a");
        let second = next_membership(&first, &catalog(1), now, "order-b");

        // A redelivered callback for the first order must still find its
        // receipt after the second one activated, or it would grant twice.
        assert_eq!(
            second.activated_orders,
            vec!["order-a".to_string(), "order-b".to_string()]
        );
    }

    #[test]
    fn reaping_downgrades_and_resets_banks_to_sentinel() {
        let current = pro_member(10 * DAY_MS, 7, 12);
        let next = reaped(&current);

        assert_eq!(next.level, 0);
        assert_eq!(next.expire_at, None);
        assert_eq!(next.resume_quota, -1);
        assert_eq!(next.email_quota, -1);
        // Consumption history and the receipt are kept.
        assert_eq!(next.resume_used, 53);
        assert_eq!(next.email_used, 28);
        assert_eq!(next.activated_orders, vec!["previous-order".to_string()]);
        assert_eq!(next.version, 10);
    }

    #[test]
    fn reaped_membership_is_no_longer_valid() {
        let current = pro_member(10 * DAY_MS, 7, 12);
        let next = reaped(&current);
        assert!(!next.is_valid(at(0)));
        assert!(!next.is_expired(at(20 * DAY_MS)));
    }

    #[test]
    fn lapse_is_reported_by_the_check_not_by_the_reset_snapshot() {
        let now = at(20 * DAY_MS);
        let current = pro_member(10 * DAY_MS, 7, 12);
        assert!(lapsed(&current, now));

        // The downgrade wipes the expiry, so only the lapse report can tell
        // an expired member apart from someone who never was one.
        let next = reaped(&current);
        assert!(!lapsed(&next, now));
        assert!(!next.is_expired(now));
        assert!(!lapsed(&Membership::none(), now));
    }
}
