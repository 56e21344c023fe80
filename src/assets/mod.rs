mod coordinator;
mod queue;
mod scan;

pub use coordinator::{AssetCoordinator, AssetEvent};
pub use queue::{QueueEntry, TransferQueue};
pub use scan::extract_asset_refs;
