use rocket::serde::json::Json;
use rocket::State;
use rocket_okapi::openapi;
use mongodb::bson::{doc, oid::ObjectId};
use mongodb::options::{FindOneAndUpdateOptions, FindOptions, ReturnDocument};
use crate::db::DbConn;
use crate::models::{JobPosting, JobQuery, JobResponse};
use crate::utils::{ApiResponse, ApiError};

#[openapi(tag = "Jobs")]
#[get("/jobs?<query..>")]
pub async fn list_jobs(
    db: &State<DbConn>,
    query: JobQuery,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(20).min(100);
    let skip = (page - 1) * limit;

    let mut filter = doc! {
        "is_active": true,
    };

    if let Some(category) = query.category {
        filter.insert("category", category);
    }

    if let Some(remote_type) = query.remote_type {
        filter.insert("remote_type", remote_type);
    }

    if let Some(keyword) = query.keyword {
        filter.insert("title", doc! { "$regex": keyword, "$options": "i" });
    }

    let find_options = FindOptions::builder()
        .skip(skip as u64)
        .limit(limit)
        .sort(doc! { "posted_at": -1 })
        .build();

    let mut cursor = db.collection::<JobPosting>("jobs")
        .find(filter.clone(), find_options)
        .await
        .map_err(|e| ApiError::internal_error(format!("Database error: {}", e)))?;

    let mut jobs = Vec::new();
    while cursor.advance().await.map_err(|e| ApiError::internal_error(format!("Cursor error: {}", e)))? {
        let job = cursor.deserialize_current()
            .map_err(|e| ApiError::internal_error(format!("Deserialization error: {}", e)))?;
        jobs.push(JobResponse::from(job));
    }

    let total = db.collection::<JobPosting>("jobs")
        .count_documents(filter, None)
        .await
        .map_err(|e| ApiError::internal_error(format!("Count error: {}", e)))?;

    Ok(Json(ApiResponse::success(serde_json::json!({
        "jobs": jobs,
        "pagination": {
            "page": page,
            "limit": limit,
            "total": total,
            "pages": (total as f64 / limit as f64).ceil() as i64,
        }
    }))))
}

#[openapi(tag = "Jobs")]
#[get("/jobs/<id>")]
pub async fn get_job(
    db: &State<DbConn>,
    id: String,
) -> Result<Json<ApiResponse<JobResponse>>, ApiError> {
    let job_id = ObjectId::parse_str(&id)
        .map_err(|_| ApiError::bad_request("Invalid job id"))?;

    // Detail views count as a read receipt; bump and return in one step.
    let job = db.collection::<JobPosting>("jobs")
        .find_one_and_update(
            doc! { "_id": job_id, "is_active": true },
            doc! { "$inc": { "views_count": 1 } },
            FindOneAndUpdateOptions::builder()
                .return_document(ReturnDocument::After)
                .build(),
        )
        .await
        .map_err(|e| ApiError::internal_error(format!("Database error: {}", e)))?
        .ok_or_else(|| ApiError::not_found("Job not found"))?;

    Ok(Json(ApiResponse::success(JobResponse::from(job))))
}
