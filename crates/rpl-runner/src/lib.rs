pub mod backup;
pub mod builder;
pub mod cancel;
pub mod commands;
pub mod config;
pub mod deployer;
pub mod docker;
pub mod doctor;
pub mod fakes;
pub mod gate;
pub mod health;
pub mod pipeline;
pub mod probes;
pub mod publisher;
pub mod rollback;
pub mod stage;
pub mod tagger;
pub mod testing;
pub mod traits;
pub mod util;
pub mod verify;

pub use backup::*;
pub use builder::*;
pub use cancel::*;
pub use commands::*;
pub use config::*;
pub use deployer::*;
pub use docker::*;
pub use doctor::*;
pub use gate::*;
pub use health::*;
pub use pipeline::*;
pub use probes::*;
pub use publisher::*;
pub use rollback::*;
pub use stage::*;
pub use tagger::*;
pub use testing::*;
pub use traits::*;
pub use util::*;
pub use verify::*;
