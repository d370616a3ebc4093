pub mod etl;
pub mod extract;
pub mod load;
pub mod lock;
pub mod rate_limiter;
pub mod retry;
pub mod sql;
pub mod stage;
pub mod transform;
pub mod watermark;

pub use crate::domain::model::{Batch, Category, Record, RunStamp, Window};
pub use crate::domain::ports::{ObjectStore, SourceApi, Warehouse};
pub use crate::utils::error::Result;
