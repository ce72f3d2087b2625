use rocket_okapi::okapi::Map;
use serde::{Deserialize, Serialize};
use rocket::http::Status;
use rocket::response::{self, Responder, Response};
use rocket::Request;
use std::io::Cursor;
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::response::OpenApiResponderInner;
use rocket_okapi::r#gen::OpenApiGenerator;
use rocket_okapi::okapi::openapi3::{MediaType, Response as OpenApiResponse, Responses};

/// -----------------------------
/// Generic API response
/// -----------------------------
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        ApiResponse {
            success: true,
            message: None,
            data: Some(data),
        }
    }

    pub fn success_with_message(message: String, data: T) -> Self {
        ApiResponse {
            success: true,
            message: Some(message),
            data: Some(data),
        }
    }
}

/// Stable machine-readable error codes. Clients branch on these (and on
/// `need_upgrade`), never on message text.
pub mod codes {
    pub const NOT_A_MEMBER: &str = "NOT_A_MEMBER";
    pub const QUOTA_EXHAUSTED: &str = "QUOTA_EXHAUSTED";
    pub const JOB_LIMIT_REACHED: &str = "JOB_LIMIT_REACHED";
    pub const COMMUNICATION_NOT_ALLOWED: &str = "COMMUNICATION_NOT_ALLOWED";
    pub const SEND_REQUIRED_FIRST: &str = "SEND_REQUIRED_FIRST";
    pub const ORDER_NOT_FOUND: &str = "ORDER_NOT_FOUND";
    pub const ORDER_NOT_PAID: &str = "ORDER_NOT_PAID";
    pub const SCHEME_NOT_FOUND: &str = "SCHEME_NOT_FOUND";
    pub const USER_NOT_FOUND: &str = "USER_NOT_FOUND";
}

/// -----------------------------
/// API Error
/// -----------------------------
///
/// Business-rule rejections carry a `code` plus the `need_upgrade` hint so
/// the client can route the user into the membership purchase flow; plain
/// infrastructure errors carry neither.
#[derive(Debug, Serialize, JsonSchema)]
pub struct ApiError {
    #[schemars(skip)]
    #[serde(skip_serializing)]
    pub status: Status,
    pub message: String,
    pub code: Option<&'static str>,
    pub need_upgrade: bool,
}

/// Wire shape of an error response.
#[derive(Debug, Serialize, JsonSchema)]
struct ErrorBody {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    need_upgrade: bool,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError {
            status: Status::BadRequest,
            message: message.into(),
            code: None,
            need_upgrade: false,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        ApiError {
            status: Status::Unauthorized,
            message: message.into(),
            code: None,
            need_upgrade: false,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError {
            status: Status::NotFound,
            message: message.into(),
            code: None,
            need_upgrade: false,
        }
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        ApiError {
            status: Status::TooManyRequests,
            message: message.into(),
            code: None,
            need_upgrade: false,
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        ApiError {
            status: Status::InternalServerError,
            message: message.into(),
            code: None,
            need_upgrade: false,
        }
    }

    /// 404 family with a stable code (order/scheme/user lookups inside the
    /// engines). Terminal: callers must not retry these.
    pub fn missing(code: &'static str, message: impl Into<String>) -> Self {
        ApiError {
            status: Status::NotFound,
            message: message.into(),
            code: Some(code),
            need_upgrade: false,
        }
    }

    /// Business-rule rejection (membership/quota gating). Always 403 with a
    /// code; `need_upgrade` tells the client whether buying a plan fixes it.
    pub fn rejection(code: &'static str, message: impl Into<String>, need_upgrade: bool) -> Self {
        ApiError {
            status: Status::Forbidden,
            message: message.into(),
            code: Some(code),
            need_upgrade,
        }
    }

    pub fn order_not_paid(message: impl Into<String>) -> Self {
        ApiError {
            status: Status::BadRequest,
            message: message.into(),
            code: Some(codes::ORDER_NOT_PAID),
            need_upgrade: false,
        }
    }
}

/// -----------------------------
/// Rocket Responder
/// -----------------------------
impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        let body = serde_json::to_string(&ErrorBody {
            success: false,
            message: self.message,
            code: self.code,
            need_upgrade: self.need_upgrade,
        })
        .unwrap_or_else(|_| r#"{"success":false,"message":"Internal error"}"#.to_string());

        Response::build()
            .status(self.status)
            .header(rocket::http::ContentType::JSON)
            .sized_body(body.len(), Cursor::new(body))
            .ok()
    }
}

/// -----------------------------
/// OpenAPI integration
/// -----------------------------
impl OpenApiResponderInner for ApiError {
    fn responses(generator: &mut OpenApiGenerator) -> rocket_okapi::Result<Responses> {
        let schema = generator.json_schema::<ErrorBody>();

        let mut content = Map::new();
        content.insert(
            "application/json".to_owned(),
            MediaType {
                schema: Some(schema),
                ..Default::default()
            },
        );

        let mut responses = Responses::default();

        for (code, description) in [
            ("400", "Bad request"),
            ("401", "Unauthorized"),
            ("403", "Rejected by membership/quota rules"),
            ("404", "Not found"),
            ("429", "Too many requests"),
            ("500", "Internal server error"),
        ] {
            responses.responses.insert(
                code.to_string(),
                rocket_okapi::okapi::openapi3::RefOr::Object(OpenApiResponse {
                    description: description.to_string(),
                    content: content.clone(),
                    ..Default::default()
                }),
            );
        }

        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_carries_code_and_upgrade_hint() {
        let err = ApiError::rejection(codes::QUOTA_EXHAUSTED, "Resume quota exhausted", true);
        assert_eq!(err.status, Status::Forbidden);
        assert_eq!(err.code, Some(codes::QUOTA_EXHAUSTED));
        assert!(err.need_upgrade);
    }

    #[test]
    fn plain_errors_carry_no_code() {
        let err = ApiError::internal_error("boom");
        assert_eq!(err.status, Status::InternalServerError);
        assert_eq!(err.code, None);
        assert!(!err.need_upgrade);
    }

    #[test]
    fn error_body_omits_code_when_absent() {
        let body = serde_json::to_string(&ErrorBody {
            success: false,
            message: "nope".to_string(),
            code: None,
            need_upgrade: false,
        })
        .unwrap();
        assert!(!body.contains("\"code\""));
        assert!(body.contains("\"need_upgrade\":false"));
    }
}
