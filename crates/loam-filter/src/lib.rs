pub mod engine;
pub mod model;
pub mod store;

pub use engine::{EpochHandle, EpochSummary, FilterEngine};
pub use model::{predict_layer, update_layer};
pub use store::CellStateStore;
