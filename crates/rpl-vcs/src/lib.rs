pub mod contract;
pub mod fake;
pub mod types;

pub use fake::*;
pub use types::*;
