pub mod user;
pub mod scheme;
pub mod order;
pub mod usage;
pub mod job;

pub use user::*;
pub use scheme::*;
pub use order::*;
pub use usage::*;
pub use job::*;
