pub mod admin;
pub mod user;

pub use admin::{AdminContext, ADMIN_KEY_HEADER};
pub use user::{UserContext, USER_ID_HEADER};
