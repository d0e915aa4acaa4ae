pub mod kriging;
pub mod render;
pub mod solver;
pub mod trend;
pub mod variogram;

pub use render::{Interpolator, RenderError};
pub use solver::{DenseSolver, LinearSolver, SolveError};
pub use variogram::ExponentialVariogram;
