pub mod cache;
pub mod headers;
