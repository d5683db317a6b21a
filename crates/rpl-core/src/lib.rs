pub mod engine;
pub mod error;
pub mod gate;
pub mod ids;
pub mod model;
pub mod outcomes;
pub mod provenance;
pub mod tiers;
pub mod types;
pub mod version;

pub use engine::*;
pub use error::*;
pub use gate::*;
pub use ids::*;
pub use model::*;
pub use outcomes::*;
pub use provenance::*;
pub use tiers::*;
pub use types::*;
pub use version::*;
