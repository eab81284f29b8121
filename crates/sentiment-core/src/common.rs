pub mod envelope;
pub mod error;
pub mod types;

pub use error::{Error, Result};
