//! WeatherFlow Tempest: UDP broadcasts and REST history

pub mod driver;
pub mod rest;
pub mod udp;

pub use driver::{TempestConfig, TempestDriver, TEMPEST_UDP_PORT};
pub use rest::{fetch_history, history_windows, HistoryFetcher, HistoryOutcome, HistoryPage, RestClient};
pub use udp::{Message, TempestDecoder, TempestEvent};
