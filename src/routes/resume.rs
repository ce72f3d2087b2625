use rocket::serde::json::Json;
use rocket::State;
use rocket_okapi::openapi;
use log::error;
use mongodb::bson::{doc, oid::ObjectId};
use crate::db::DbConn;
use crate::guards::AuthGuard;
use crate::models::{JobPosting, User};
use crate::services::{AiResumeService, QuotaService};
use crate::utils::{codes, ApiResponse, ApiError};

#[derive(serde::Deserialize, rocket_okapi::okapi::schemars::JsonSchema)]
pub struct GenerateResumeDto {
    pub job_id: String,
    /// Client intent: regenerating after a previous pass. Enforcement is
    /// server-side either way.
    pub is_edit: Option<bool>,
}

#[openapi(tag = "Resume")]
#[post("/resume/generate", data = "<dto>")]
pub async fn generate_resume(
    db: &State<DbConn>,
    auth: AuthGuard,
    dto: Json<GenerateResumeDto>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let job_id = ObjectId::parse_str(&dto.job_id)
        .map_err(|_| ApiError::bad_request("Invalid job id"))?;
    let is_edit = dto.is_edit.unwrap_or(false);

    let job = db.collection::<JobPosting>("jobs")
        .find_one(doc! { "_id": job_id, "is_active": true }, None)
        .await
        .map_err(|e| ApiError::internal_error(e.to_string()))?
        .ok_or_else(|| ApiError::not_found("Job not found"))?;

    // Quota is charged before the generation task exists; a rejection here
    // means nothing was submitted.
    let outcome = QuotaService::debit_resume(db, auth.user_id, job_id, is_edit).await?;

    let user = db.collection::<User>("users")
        .find_one(doc! { "_id": auth.user_id }, None)
        .await
        .map_err(|e| ApiError::internal_error(e.to_string()))?
        .ok_or_else(|| ApiError::missing(codes::USER_NOT_FOUND, "User not found"))?;

    let task_id = AiResumeService::submit_generation(&user, &job, is_edit)
        .await
        .map_err(|e| {
            error!("Resume task submission failed for job {}: {}", dto.job_id, e);
            ApiError::internal_error("Failed to queue resume generation")
        })?;

    Ok(Json(ApiResponse::success(serde_json::json!({
        "taskId": task_id,
        "remaining": outcome.remaining,
    }))))
}
