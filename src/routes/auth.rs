use rocket::serde::json::Json;
use rocket::State;
use mongodb::bson::{doc, DateTime, oid::ObjectId};
use crate::db::{is_duplicate_key_error, DbConn};
use crate::models::{LoginDto, Membership, User, UserResponse};
use crate::services::{JwtService, WechatService};
use crate::utils::{validate_login_code, ApiResponse, ApiError};

const LOGIN_LIMIT: i32 = 5;
const LOGIN_WINDOW_MS: i64 = 60 * 1000;
const REFRESH_LIMIT: i32 = 10;
const REFRESH_WINDOW_MS: i64 = 60 * 1000;


/// --------------------
/// Rate limiter helper
/// --------------------
pub(crate) async fn rate_limit(
    db: &DbConn,
    key: &str,
    limit: i32,
    window_ms: i64,
) -> Result<(), ApiError> {
    let now = chrono::Utc::now().timestamp_millis();
    let window_expires = DateTime::from_millis(now + window_ms);

    let collection = db.collection::<mongodb::bson::Document>("rate_limits");

    let doc = collection
        .find_one(doc! { "key": key }, None)
        .await
        .map_err(|_| ApiError::internal_error("Rate limiter lookup failed"))?;

    match doc {
        // First request OR expired window
        None => {
            collection
                .insert_one(
                    doc! {
                        "key": key,
                        "count": 1,
                        "expires_at": window_expires
                    },
                    None,
                )
                .await
                .map_err(|_| ApiError::internal_error("Rate limiter insert failed"))?;
            Ok(())
        }

        Some(d) => {
            let count = d.get_i32("count").unwrap_or(0);
            let expires_at = d.get_datetime("expires_at").ok();

            // Window expired → reset
            if expires_at.map(|e| *e < DateTime::now()).unwrap_or(true) {
                collection
                    .update_one(
                        doc! { "key": key },
                        doc! {
                            "$set": {
                                "count": 1,
                                "expires_at": window_expires
                            }
                        },
                        None,
                    )
                    .await
                    .map_err(|_| ApiError::internal_error("Rate limiter reset failed"))?;
                return Ok(());
            }

            // Limit exceeded
            if count >= limit {
                return Err(ApiError::too_many_requests(
                    "Too many requests. Please try later.",
                ));
            }

            // Increment count
            collection
                .update_one(
                    doc! { "key": key },
                    doc! { "$inc": { "count": 1 } },
                    None,
                )
                .await
                .map_err(|_| ApiError::internal_error("Rate limiter increment failed"))?;

            Ok(())
        }
    }
}

/// --------------------
/// Mini-program login
/// --------------------
#[post("/auth/login", data = "<dto>")]
pub async fn login(
    db: &State<DbConn>,
    dto: Json<LoginDto>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    if !validate_login_code(&dto.code) {
        return Err(ApiError::bad_request("Invalid login code"));
    }

    rate_limit(
        db,
        &format!("wx_login:{}", dto.code),
        LOGIN_LIMIT,
        LOGIN_WINDOW_MS,
    ).await?;

    let session = WechatService::code_to_session(&dto.code)
        .await
        .map_err(|e| {
            log::warn!("code2session failed: {}", e);
            ApiError::unauthorized("WeChat login failed")
        })?;

    let users = db.collection::<User>("users");
    let existing = users
        .find_one(doc! { "openid": &session.openid }, None)
        .await
        .map_err(|e| ApiError::internal_error(e.to_string()))?;

    let (user, is_new_user) = match existing {
        Some(mut u) => {
            let mut set = doc! { "last_login_at": DateTime::now() };
            if let Some(nickname) = &dto.nickname {
                set.insert("nickname", nickname);
                u.nickname = Some(nickname.clone());
            }
            if let Some(avatar_url) = &dto.avatar_url {
                set.insert("avatar_url", avatar_url);
                u.avatar_url = Some(avatar_url.clone());
            }
            users
                .update_one(doc! { "_id": u.id }, doc! { "$set": set }, None)
                .await
                .ok();
            (u, false)
        }
        None => {
            let user = User {
                id: None,
                openid: session.openid.clone(),
                unionid: session.unionid.clone(),
                nickname: dto.nickname.clone(),
                avatar_url: dto.avatar_url.clone(),
                email: None,
                city: None,
                membership: Membership::none(),
                is_active: true,
                last_login_at: DateTime::now(),
                created_at: DateTime::now(),
                updated_at: DateTime::now(),
            };

            match users.insert_one(&user, None).await {
                Ok(res) => {
                    let mut u = user;
                    u.id = Some(res.inserted_id.as_object_id().unwrap());
                    (u, true)
                }
                // Two first logins racing on the unique openid index: the
                // loser picks up the row the winner created.
                Err(e) if is_duplicate_key_error(&e) => {
                    let u = users
                        .find_one(doc! { "openid": &session.openid }, None)
                        .await
                        .map_err(|e| ApiError::internal_error(e.to_string()))?
                        .ok_or_else(|| ApiError::internal_error("Login race lost its user"))?;
                    (u, false)
                }
                Err(e) => return Err(ApiError::internal_error(e.to_string())),
            }
        }
    };

    let access_token = JwtService::generate_access_token(
        user.id.as_ref().unwrap(),
        &user.openid,
    )
    .map_err(|e| ApiError::internal_error(e.to_string()))?;

    let refresh_token = JwtService::generate_refresh_token(
        user.id.as_ref().unwrap(),
        &user.openid,
    )
    .map_err(|e| ApiError::internal_error(e.to_string()))?;

    Ok(Json(ApiResponse::success(serde_json::json!({
        "message": if is_new_user { "Registration successful" } else { "Login successful" },
        "isNewUser": is_new_user,
        "user": UserResponse::from(user),
        "accessToken": access_token,
        "refreshToken": refresh_token
    }))))
}

/// --------------------
/// Silent Refresh Token
/// --------------------
#[derive(serde::Deserialize)]
pub struct RefreshTokenDto {
    pub refresh_token: String,
}

#[post("/auth/refresh", data = "<dto>")]
pub async fn refresh_token(
    db: &State<DbConn>,
    dto: Json<RefreshTokenDto>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    rate_limit(
        db,
        "refresh_token",
        REFRESH_LIMIT,
        REFRESH_WINDOW_MS,
    ).await?;

    let claims = JwtService::verify_token(&dto.refresh_token, true)
        .map_err(|_| ApiError::unauthorized("Invalid refresh token"))?;

    let user_id = ObjectId::parse_str(&claims.sub)
        .map_err(|_| ApiError::unauthorized("Invalid user id in token"))?;

    let access = JwtService::generate_access_token(&user_id, &claims.openid)
        .map_err(|e| ApiError::internal_error(e.to_string()))?;

    Ok(Json(ApiResponse::success(serde_json::json!({
        "accessToken": access
    }))))
}
