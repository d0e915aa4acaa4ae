pub mod canonical;
pub mod cell;
pub mod config;
pub mod covariate;
pub mod geometry;
pub mod ownership;
pub mod publication;
pub mod reading;
pub mod seal;
pub mod soil;

pub use canonical::{canonical_bytes, EncodeError};
pub use cell::{CellState, LayerEstimate};
pub use config::{
    FailoverConfig, FilterConfig, IngestConfig, InterpolatorConfig, NodeConfig, SchedulerConfig,
};
pub use covariate::{CovariateKind, CovariateSample};
pub use geometry::{CellIndex, GeoPosition, GridGeometry};
pub use ownership::{OwnerLocation, OwnershipRecord};
pub use publication::{CellProvenance, GridPublication, PublishedCell};
pub use reading::{Reading, ReadingBody, ReadingId, RejectReason};
pub use seal::SealedRecord;
pub use soil::{DepthLayer, SoilTexture, TexturePrior};
