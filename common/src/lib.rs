pub mod backends;
pub mod claims;
pub mod models;
pub mod secrets;
