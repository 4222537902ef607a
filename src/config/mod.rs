pub mod mg_param;
pub mod param;

pub use mg_param::*;
pub use param::*;
