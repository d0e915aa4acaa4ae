pub mod identity;
pub mod registry;
pub mod sealer;

pub use identity::DeviceIdentity;
pub use registry::DeviceKeyRegistry;
pub use sealer::{SealError, Sealer};
