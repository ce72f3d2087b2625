pub mod auth;
pub mod email;
pub mod job;
pub mod membership;
pub mod resume;
pub mod user;
