pub mod ai;
pub mod email;
pub mod jwt;
pub mod membership;
pub mod quota;
pub mod wechat;

pub use ai::AiResumeService;
pub use email::EmailService;
pub use jwt::JwtService;
pub use membership::MembershipService;
pub use quota::{QuotaOutcome, QuotaService};
pub use wechat::{WechatPayService, WechatService};
