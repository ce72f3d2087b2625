use mongodb::bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};
use rocket_okapi::okapi::schemars::JsonSchema;

/// Which email counter a debit charges.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum EmailKind {
    /// Application email to the employer; first contact for a job.
    Send,
    /// Follow-up on an existing application. Requires a prior send.
    Communication,
}

/// Per-(user, job) consumption counters. Created lazily on the first action
/// for a job and never deleted; a unique compound index on
/// `(user_id, job_id)` turns concurrent first-actions into a duplicate-key
/// error the debit engine resolves.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UsageRecord {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub user_id: ObjectId,
    pub job_id: ObjectId,
    pub resume_edits_count: i64,
    pub email_sends_count: i64,
    pub email_communications_count: i64,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

impl UsageRecord {
    pub fn new(user_id: ObjectId, job_id: ObjectId) -> Self {
        let now = DateTime::now();
        UsageRecord {
            id: None,
            user_id,
            job_id,
            resume_edits_count: 0,
            email_sends_count: 0,
            email_communications_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}
