pub mod api;
pub mod config;
pub mod image_compress;
pub mod ingest_service;
pub mod item_repo;
pub mod object_store;
pub mod orm;
pub mod qr;
pub mod rate_limit;
pub mod sanitize;
pub mod short_code;
