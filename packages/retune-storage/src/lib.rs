pub mod jsonl;
pub mod memory;
pub mod models;

mod error;

pub use error::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;
