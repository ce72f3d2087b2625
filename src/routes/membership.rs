use rocket::serde::json::Json;
use rocket::State;
use rocket_okapi::openapi;
use mongodb::bson::{doc, DateTime};
use mongodb::options::FindOptions;
use log::{error, info, warn};
use crate::db::{is_duplicate_key_error, DbConn};
use crate::guards::AuthGuard;
use crate::models::{
    ActivateOrderDto, CreateOrderDto, MembershipScheme, MembershipSnapshot, Order, OrderResponse,
    OrderStatus, PaymentNotifyDto, SchemeResponse,
};
use crate::services::{MembershipService, WechatPayService};
use crate::utils::{codes, generate_order_id, ApiResponse, ApiError};

#[openapi(tag = "Membership")]
#[get("/membership/schemes")]
pub async fn list_schemes(
    db: &State<DbConn>,
) -> Result<Json<ApiResponse<Vec<SchemeResponse>>>, ApiError> {
    let find_options = FindOptions::builder().sort(doc! { "scheme_id": 1 }).build();

    let mut cursor = db.collection::<MembershipScheme>("membership_schemes")
        .find(doc! { "is_active": true }, find_options)
        .await
        .map_err(|e| ApiError::internal_error(format!("Database error: {}", e)))?;

    let mut schemes = Vec::new();
    while cursor.advance().await.map_err(|e| ApiError::internal_error(format!("Cursor error: {}", e)))? {
        let scheme = cursor.deserialize_current()
            .map_err(|e| ApiError::internal_error(format!("Deserialization error: {}", e)))?;
        schemes.push(SchemeResponse::from(scheme));
    }

    Ok(Json(ApiResponse::success(schemes)))
}

#[openapi(tag = "Membership")]
#[get("/membership/status")]
pub async fn get_membership_status(
    db: &State<DbConn>,
    auth: AuthGuard,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let (user, just_lapsed) = MembershipService::check_membership(db, &auth.user_id).await?;

    // The check resets a lapsed entitlement before returning, so its report
    // is the only carrier of "expired": the snapshot no longer shows it.
    Ok(Json(ApiResponse::success(serde_json::json!({
        "membership": MembershipSnapshot::from(&user.membership),
        "isValidMember": user.membership.is_valid(DateTime::now()),
        "isExpired": just_lapsed,
    }))))
}

#[openapi(tag = "Membership")]
#[post("/membership/order", data = "<dto>")]
pub async fn create_order(
    db: &State<DbConn>,
    auth: AuthGuard,
    dto: Json<CreateOrderDto>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let scheme = db.collection::<MembershipScheme>("membership_schemes")
        .find_one(doc! { "scheme_id": dto.scheme_id, "is_active": true }, None)
        .await
        .map_err(|e| ApiError::internal_error(e.to_string()))?
        .ok_or_else(|| ApiError::missing(codes::SCHEME_NOT_FOUND, "Scheme not found"))?;

    // The client echoes the price it displayed; a stale catalog must not
    // silently buy at the current one.
    if let Some(amount) = dto.amount {
        if amount != scheme.price {
            return Err(ApiError::bad_request("Price has changed, refresh and try again"));
        }
    }

    let (user, _) = MembershipService::check_membership(db, &auth.user_id).await?;

    if scheme.is_addon {
        let pooled_active = user.membership.is_valid(DateTime::now())
            && user.membership.resume_quota >= 0;
        if !pooled_active {
            return Err(ApiError::rejection(
                codes::NOT_A_MEMBER,
                "Booster packs top up an active pooled plan",
                true,
            ));
        }
    }

    let orders = db.collection::<Order>("orders");

    // Probe for an unused id; the unique index is the last line of defense.
    let mut order_id = generate_order_id();
    for _ in 0..4 {
        let exists = orders
            .find_one(doc! { "order_id": &order_id }, None)
            .await
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        if exists.is_none() {
            break;
        }
        order_id = generate_order_id();
    }

    let now = DateTime::now();
    let order = Order {
        id: None,
        order_id: order_id.clone(),
        user_id: auth.user_id,
        scheme_id: scheme.scheme_id,
        amount: scheme.price,
        status: OrderStatus::Pending,
        pay_time: None,
        is_activated: false,
        transaction_id: None,
        created_at: now,
        updated_at: now,
    };

    match orders.insert_one(&order, None).await {
        Ok(_) => {}
        Err(e) if is_duplicate_key_error(&e) => {
            return Err(ApiError::internal_error("Could not allocate an order id, please retry"));
        }
        Err(e) => return Err(ApiError::internal_error(e.to_string())),
    }

    let payment_params = match WechatPayService::create_prepay(&order_id, scheme.price, &user.openid).await {
        Ok(params) => params,
        Err(e) => {
            error!("Prepay failed for order {}: {}", order_id, e);
            // The order can never be paid without prepay params; close it.
            orders
                .update_one(
                    doc! { "order_id": &order_id },
                    doc! { "$set": { "status": "closed", "updated_at": DateTime::now() } },
                    None,
                )
                .await
                .ok();
            return Err(ApiError::internal_error("Failed to create payment"));
        }
    };

    info!("Created order {} for user {} (scheme {})", order_id, auth.user_id.to_hex(), scheme.scheme_id);

    Ok(Json(ApiResponse::success(serde_json::json!({
        "orderId": order_id,
        "amount": scheme.price,
        "schemeName": scheme.name,
        "paymentParams": payment_params,
    }))))
}

/// Gateway-facing callback; unauthenticated, gated by the HMAC signature.
/// Must answer SUCCESS for anything redelivery cannot fix, otherwise the
/// gateway keeps retrying.
#[openapi(tag = "Membership")]
#[post("/membership/order/notify", data = "<dto>")]
pub async fn payment_notify(
    db: &State<DbConn>,
    dto: Json<PaymentNotifyDto>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let valid = WechatPayService::verify_notify_signature(
        &dto.order_id,
        &dto.result_code,
        dto.transaction_id.as_deref(),
        &dto.nonce,
        dto.timestamp,
        &dto.signature,
    )
    .map_err(|e| {
        error!("Notify verification unavailable: {}", e);
        ApiError::internal_error("Payment verification unavailable")
    })?;

    if !valid {
        warn!("Rejected notify with bad signature for order {}", dto.order_id);
        return Err(ApiError::bad_request("Invalid payment signature"));
    }

    let orders = db.collection::<Order>("orders");

    if dto.result_code != "SUCCESS" {
        // Failed payment: close the order if it is still open.
        orders
            .update_one(
                doc! { "order_id": &dto.order_id, "status": "pending" },
                doc! { "$set": { "status": "closed", "updated_at": DateTime::now() } },
                None,
            )
            .await
            .map_err(|e| ApiError::internal_error(e.to_string()))?;
        info!("Payment failed for order {}, closed", dto.order_id);
        return Ok(Json(serde_json::json!({ "code": "SUCCESS" })));
    }

    // Flip pending → paid. matched_count 0 means a redelivery already did
    // it (or the order is terminal); activation sorts that out.
    let mut set = doc! { "status": "paid", "pay_time": DateTime::now(), "updated_at": DateTime::now() };
    if let Some(transaction_id) = &dto.transaction_id {
        set.insert("transaction_id", transaction_id);
    }
    orders
        .update_one(
            doc! { "order_id": &dto.order_id, "status": "pending" },
            doc! { "$set": set },
            None,
        )
        .await
        .map_err(|e| ApiError::internal_error(e.to_string()))?;

    match MembershipService::activate_order(db, &dto.order_id, None).await {
        Ok(snapshot) => {
            info!("Order {} activated via notify, level {}", dto.order_id, snapshot.level);
            Ok(Json(serde_json::json!({ "code": "SUCCESS" })))
        }
        Err(e) if matches!(
            e.code,
            Some(codes::ORDER_NOT_FOUND)
                | Some(codes::ORDER_NOT_PAID)
                | Some(codes::SCHEME_NOT_FOUND)
                | Some(codes::USER_NOT_FOUND)
        ) =>
        {
            // Terminal: redelivering the same notify cannot change these.
            error!("Activation of order {} failed terminally: {}", dto.order_id, e.message);
            Ok(Json(serde_json::json!({ "code": "SUCCESS" })))
        }
        Err(e) => Err(e),
    }
}

#[openapi(tag = "Membership")]
#[get("/membership/orders")]
pub async fn list_orders(
    db: &State<DbConn>,
    auth: AuthGuard,
) -> Result<Json<ApiResponse<Vec<OrderResponse>>>, ApiError> {
    let find_options = FindOptions::builder()
        .sort(doc! { "created_at": -1 })
        .limit(50)
        .build();

    let mut cursor = db.collection::<Order>("orders")
        .find(doc! { "user_id": auth.user_id }, find_options)
        .await
        .map_err(|e| ApiError::internal_error(format!("Database error: {}", e)))?;

    let mut orders = Vec::new();
    while cursor.advance().await.map_err(|e| ApiError::internal_error(format!("Cursor error: {}", e)))? {
        let order = cursor.deserialize_current()
            .map_err(|e| ApiError::internal_error(format!("Deserialization error: {}", e)))?;
        orders.push(OrderResponse::from(order));
    }

    Ok(Json(ApiResponse::success(orders)))
}

#[openapi(tag = "Membership")]
#[post("/membership/order/activate", data = "<dto>")]
pub async fn activate_order(
    db: &State<DbConn>,
    auth: AuthGuard,
    dto: Json<ActivateOrderDto>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let snapshot = MembershipService::activate_order(db, &dto.order_id, Some(&auth.user_id)).await?;

    Ok(Json(ApiResponse::success(serde_json::json!({
        "membership": snapshot,
    }))))
}
