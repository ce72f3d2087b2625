use rocket::serde::json::Json;
use rocket::State;
use rocket_okapi::openapi;
use mongodb::bson::{doc, DateTime};
use crate::db::DbConn;
use crate::models::{User, UpdateProfileDto, UserResponse};
use crate::guards::AuthGuard;
use crate::services::MembershipService;
use crate::utils::{ApiResponse, ApiError, validate_email};

#[openapi(tag = "User")]
#[get("/user/profile")]
pub async fn get_profile(
    db: &State<DbConn>,
    auth: AuthGuard,
) -> Result<Json<ApiResponse<UserResponse>>, ApiError> {
    // Reads go through the expiry check so a lapsed membership shows up as
    // level 0 on the very next profile load.
    let (user, _) = MembershipService::check_membership(db, &auth.user_id).await?;

    Ok(Json(ApiResponse::success(UserResponse::from(user))))
}

#[openapi(tag = "User")]
#[put("/user/profile", data = "<dto>")]
pub async fn update_profile(
    db: &State<DbConn>,
    auth: AuthGuard,
    dto: Json<UpdateProfileDto>,
) -> Result<Json<ApiResponse<UserResponse>>, ApiError> {
    // Validate inputs
    if let Some(ref email) = dto.email {
        if !validate_email(email) {
            return Err(ApiError::bad_request("Invalid email address"));
        }
    }

    // Build update document
    let mut update_doc = doc! {
        "updated_at": DateTime::now()
    };

    if let Some(ref nickname) = dto.nickname {
        update_doc.insert("nickname", nickname);
    }
    if let Some(ref avatar_url) = dto.avatar_url {
        update_doc.insert("avatar_url", avatar_url);
    }
    if let Some(ref email) = dto.email {
        update_doc.insert("email", email);
    }
    if let Some(ref city) = dto.city {
        update_doc.insert("city", city);
    }

    db.collection::<User>("users")
        .update_one(
            doc! { "_id": auth.user_id },
            doc! { "$set": update_doc },
            None
        )
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to update profile: {}", e)))?;

    // Fetch updated user
    let user = db.collection::<User>("users")
        .find_one(doc! { "_id": auth.user_id }, None)
        .await
        .map_err(|e| ApiError::internal_error(format!("Database error: {}", e)))?
        .ok_or_else(|| ApiError::not_found("User not found"))?;

    Ok(Json(ApiResponse::success_with_message(
        "Profile updated successfully".to_string(),
        UserResponse::from(user)
    )))
}
