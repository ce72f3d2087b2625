use rocket::serde::json::Json;
use rocket::State;
use rocket_okapi::openapi;
use mongodb::bson::{doc, oid::ObjectId};
use crate::db::DbConn;
use crate::guards::AuthGuard;
use crate::models::{EmailKind, JobPosting, User};
use crate::services::{EmailService, QuotaService};
use crate::utils::{codes, validate_email, ApiResponse, ApiError};

#[derive(serde::Deserialize, rocket_okapi::okapi::schemars::JsonSchema)]
pub struct SendEmailDto {
    pub job_id: String,
    pub kind: EmailKind,
    /// Required for follow-ups, optional note for applications.
    pub message: Option<String>,
}

#[openapi(tag = "Email")]
#[post("/email/send", data = "<dto>")]
pub async fn send_email(
    db: &State<DbConn>,
    auth: AuthGuard,
    dto: Json<SendEmailDto>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let job_id = ObjectId::parse_str(&dto.job_id)
        .map_err(|_| ApiError::bad_request("Invalid job id"))?;

    let job = db.collection::<JobPosting>("jobs")
        .find_one(doc! { "_id": job_id, "is_active": true }, None)
        .await
        .map_err(|e| ApiError::internal_error(e.to_string()))?
        .ok_or_else(|| ApiError::not_found("Job not found"))?;

    // An undeliverable job must not cost quota; check before debiting.
    let contact_email = job.contact_email.clone()
        .filter(|e| validate_email(e))
        .ok_or_else(|| ApiError::bad_request("This job has no contact email"))?;

    let message = dto.message.as_deref().map(str::trim).filter(|m| !m.is_empty());
    if dto.kind == EmailKind::Communication && message.is_none() {
        return Err(ApiError::bad_request("A message is required for a follow-up"));
    }

    let outcome = QuotaService::debit_email(db, auth.user_id, job_id, dto.kind).await?;

    let user = db.collection::<User>("users")
        .find_one(doc! { "_id": auth.user_id }, None)
        .await
        .map_err(|e| ApiError::internal_error(e.to_string()))?
        .ok_or_else(|| ApiError::missing(codes::USER_NOT_FOUND, "User not found"))?;

    let applicant_name = user.nickname.as_deref().unwrap_or("");
    let sent = match dto.kind {
        EmailKind::Send => {
            EmailService::send_application_email(
                &contact_email,
                applicant_name,
                user.email.as_deref(),
                &job.title,
                &job.company,
                message,
            )
            .await
        }
        EmailKind::Communication => {
            EmailService::send_followup_email(
                &contact_email,
                applicant_name,
                user.email.as_deref(),
                &job.title,
                &job.company,
                message.unwrap_or_default(),
            )
            .await
        }
    };

    if !sent {
        return Err(ApiError::internal_error("Failed to send email"));
    }

    Ok(Json(ApiResponse::success(serde_json::json!({
        "remaining": outcome.remaining,
    }))))
}
