pub mod identity;

pub use identity::{GatewayUser, USER_ID_HEADER};
