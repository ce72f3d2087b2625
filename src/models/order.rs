use mongodb::bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};
use rocket_okapi::okapi::schemars::JsonSchema;

/// Order lifecycle: `pending` until the gateway confirms, then `paid`;
/// activation is recorded separately in `is_activated` so a crash between
/// granting the entitlement and flagging the order stays repairable.
/// `refunded`/`closed` are terminal and never activate.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Refunded,
    Closed,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Order {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    /// Externally unique id (timestamp + random digits, probed for
    /// collision before insert; a unique index backs the probe).
    pub order_id: String,
    pub user_id: ObjectId,
    pub scheme_id: i32,
    /// Fen, copied from the scheme at creation time.
    pub amount: i64,
    pub status: OrderStatus,
    pub pay_time: Option<DateTime>,
    /// Idempotency guard: flipped to true exactly once, after the
    /// entitlement write has landed.
    pub is_activated: bool,
    pub transaction_id: Option<String>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateOrderDto {
    pub scheme_id: i32,
    /// Optional client echo of the displayed price; rejected on mismatch so
    /// a stale catalog on the client cannot silently buy at another price.
    pub amount: Option<i64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ActivateOrderDto {
    pub order_id: String,
}

/// Gateway callback payload. The signature covers every other field; see
/// `WechatPayService::verify_notify_signature`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct PaymentNotifyDto {
    pub order_id: String,
    /// "SUCCESS" or "FAIL".
    pub result_code: String,
    pub transaction_id: Option<String>,
    pub nonce: String,
    pub timestamp: i64,
    pub signature: String,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct OrderResponse {
    pub order_id: String,
    pub scheme_id: i32,
    pub amount: i64,
    pub status: OrderStatus,
    pub is_activated: bool,
    pub created_at: i64,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        OrderResponse {
            order_id: order.order_id,
            scheme_id: order.scheme_id,
            amount: order.amount,
            status: order.status,
            is_activated: order.is_activated,
            created_at: order.created_at.timestamp_millis(),
        }
    }
}
