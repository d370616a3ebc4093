// Adapters layer: concrete implementations of the domain ports (source APIs, S3, Redshift).

pub mod http;
pub mod storage;
pub mod warehouse;

pub use http::build_source;
pub use storage::S3Storage;
pub use warehouse::RedshiftWarehouse;
