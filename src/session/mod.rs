mod docsession;
mod presence;

pub use docsession::{DocSession, TxnOrigin};
pub use presence::{AwarenessRegistry, DocLockCoordinator, LockCoordinator};
