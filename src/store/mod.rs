pub mod client;
pub mod error;
pub mod types;

pub use client::{DEFAULT_STORE_URL, HttpRecordStore};
pub use error::StoreError;
