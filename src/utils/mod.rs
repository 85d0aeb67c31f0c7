pub mod error_codes;
pub mod time_utils;

// Re-export commonly used functions
pub use error_codes::ErrorCode;
pub use time_utils::*;
