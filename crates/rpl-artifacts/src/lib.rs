pub mod label;
pub mod manifest;
pub mod scan;
pub mod store;

pub use label::*;
pub use manifest::*;
pub use scan::*;
pub use store::*;
