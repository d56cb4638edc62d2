//! Ecowitt consoles and gateways

pub mod csvlog;
pub mod driver;
pub mod local_api;

pub use csvlog::{classify_column, merge_by_timestamp, CsvLogStream, CsvStats, Field};
pub use driver::{read_log_dir, EcowittConfig, EcowittDriver};
pub use local_api::{decode_livedata, split_value, LocalApiClient};
