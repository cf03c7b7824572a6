// Model modules
pub mod api;
pub mod common;
pub mod intent;
pub mod product;
pub mod receipt;
pub mod user;
