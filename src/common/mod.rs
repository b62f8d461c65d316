//! Common utilities and types shared across agencycomm

pub mod config;
pub mod error;
pub mod utils;

pub use config::AgencyConfig;
pub use error::{Error, Result};
pub use utils::{decode_key, encode_key, normalize_prefix, parse_duration, timestamp_now};
