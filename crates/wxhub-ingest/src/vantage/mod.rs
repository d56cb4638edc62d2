//! Davis Vantage consoles

pub mod driver;
pub mod packets;

pub use driver::{VantageConfig, VantageConsole, VantageDriver};
pub use packets::{LoopPacket, RainCollector, VantageDecoder};
