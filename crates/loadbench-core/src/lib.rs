pub mod config;
pub mod error;
pub mod invoker;
pub mod matrix;
pub mod percentile;
pub mod pool;
pub mod providers;
pub mod recorder;
pub mod result;
pub mod scheduler;
pub mod variant;

pub use config::*;
pub use error::*;
pub use invoker::*;
pub use matrix::*;
pub use percentile::*;
pub use pool::*;
pub use recorder::*;
pub use result::*;
pub use scheduler::*;
pub use variant::*;
