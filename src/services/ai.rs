use log::{info, warn};
use reqwest::Client;
use serde_json::json;

use crate::config::Config;
use crate::models::{JobPosting, User};

/// Résumé generation backend. The engine only needs the task accepted;
/// generation itself runs asynchronously on the backend and the client
/// polls there for the result.
pub struct AiResumeService;

impl AiResumeService {
    pub async fn submit_generation(
        user: &User,
        job: &JobPosting,
        is_edit: bool,
    ) -> Result<String, String> {
        if !Config::is_ai_enabled() {
            // Local/dev setup without the generation backend: accept the task
            // so the quota flow can be exercised end to end.
            let task_id = uuid::Uuid::new_v4().to_string();
            warn!(
                "AI backend not configured, queuing stub task {} for job '{}'",
                task_id, job.title
            );
            return Ok(task_id);
        }

        let base = Config::ai_backend_url().ok_or("AI backend URL not configured")?;
        let url = format!("{}/api/v1/resume/tasks", base);

        let res = Client::new()
            .post(&url)
            .json(&json!({
                "applicant": {
                    "nickname": user.nickname,
                    "email": user.email,
                    "city": user.city,
                },
                "job": {
                    "title": job.title,
                    "company": job.company,
                    "category": job.category,
                    "description": job.description,
                    "requirements": job.requirements,
                },
                "is_edit": is_edit,
            }))
            .send()
            .await
            .map_err(|e| format!("AI backend request failed: {}", e))?;

        if !res.status().is_success() {
            return Err(res
                .text()
                .await
                .unwrap_or_else(|_| "AI backend rejected the task".to_string()));
        }

        let body: serde_json::Value = res
            .json()
            .await
            .map_err(|e| format!("AI backend response unreadable: {}", e))?;

        let task_id = body
            .get("task_id")
            .and_then(|v| v.as_str())
            .ok_or("AI backend response missing task_id")?
            .to_string();

        info!("Queued resume task {} for job '{}'", task_id, job.title);
        Ok(task_id)
    }
}
