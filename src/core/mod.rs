pub mod blas;
pub mod traits;
pub mod wrappers;

pub use traits::{LinearOperator, OperatorRef, Prepared, SiteSubset};
pub use wrappers::{DenseOp, Rounded, Shifted};
