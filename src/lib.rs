pub mod apk;
pub mod core;
pub mod error;

pub use error::{Error, PartialFailure, Result};
