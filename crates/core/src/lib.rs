pub mod config;
pub mod error;
pub mod event_bus;
pub mod types;

pub use config::AppConfig;
pub use error::{ErrorKind, RotatorError, RotatorResult};
pub use types::{Arm, ArmSnapshot, BannerId, SlotId, SocialGroupId};
