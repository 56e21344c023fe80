mod store;

pub use store::DurableCache;
