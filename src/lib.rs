pub mod config;
pub mod error;
pub mod index;
pub mod library;
pub mod media;
pub mod routes;
pub mod storage;
