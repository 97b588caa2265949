pub mod api_client;
pub mod cleanup;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod keyword;
pub mod login;
pub mod models;
pub mod shared_state;
pub mod sharing;
pub mod utils;

pub use error::{ServiceError, ServiceResult};
