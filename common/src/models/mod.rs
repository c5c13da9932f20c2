pub mod application;
pub mod error;
