use mongodb::bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};
use rocket_okapi::okapi::schemars::JsonSchema;

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RemoteType {
    Full,
    Hybrid,
    Flexible,
}

/// Remote job listing. Read-mostly: browsing is a plain filtered read, all
/// quota accounting happens against usage records, never against the job.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JobPosting {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub title: String,
    pub company: String,
    pub company_logo: Option<String>,
    pub category: String,
    pub tags: Vec<String>,

    pub remote_type: RemoteType,
    /// Monthly salary band in yuan; either bound may be open.
    pub salary_min: Option<i64>,
    pub salary_max: Option<i64>,

    pub description: String,
    pub requirements: Vec<String>,
    pub contact_email: Option<String>,
    pub source_url: Option<String>,

    pub is_active: bool,
    pub views_count: i64,
    pub posted_at: DateTime,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

#[derive(Debug, FromForm, Deserialize, JsonSchema)]
pub struct JobQuery {
    pub category: Option<String>,
    /// Substring match on the title.
    pub keyword: Option<String>,
    pub remote_type: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct JobResponse {
    pub id: String,
    pub title: String,
    pub company: String,
    pub company_logo: Option<String>,
    pub category: String,
    pub tags: Vec<String>,
    pub remote_type: String,
    pub salary_min: Option<i64>,
    pub salary_max: Option<i64>,
    pub description: String,
    pub requirements: Vec<String>,
    pub views_count: i64,
    pub posted_at: i64,
}

impl From<JobPosting> for JobResponse {
    fn from(job: JobPosting) -> Self {
        JobResponse {
            id: job.id.map(|id| id.to_hex()).unwrap_or_default(),
            title: job.title,
            company: job.company,
            company_logo: job.company_logo,
            category: job.category,
            tags: job.tags,
            remote_type: format!("{:?}", job.remote_type).to_lowercase(),
            salary_min: job.salary_min,
            salary_max: job.salary_max,
            description: job.description,
            requirements: job.requirements,
            views_count: job.views_count,
            posted_at: job.posted_at.timestamp_millis(),
        }
    }
}
