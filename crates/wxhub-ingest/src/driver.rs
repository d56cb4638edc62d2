//! Configured station drivers, built on demand in configuration order

use crate::{IngestError, IngestResult, StationDriver};

/// Builds a fresh, not yet started driver instance
pub type BuildDriver = Box<dyn Fn() -> IngestResult<Box<dyn StationDriver>> + Send + Sync>;

struct Slot {
    name: String,
    kind: &'static str,
    build: BuildDriver,
}

/// One slot per configured station driver.
///
/// Slots keep the order they were registered in, so workers start in the
/// same order as the `[[drivers]]` entries. Names are unique.
#[derive(Default)]
pub struct DriverRegistry {
    slots: Vec<Slot>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a driver of the given kind (`"vantage"`, `"tempest"`, ...)
    pub fn register(&mut self, name: impl Into<String>, kind: &'static str, build: BuildDriver) -> IngestResult<()> {
        let name = name.into();
        if self.slot(&name).is_some() {
            return Err(IngestError::DriverError(format!("driver {name} registered twice")));
        }
        self.slots.push(Slot { name, kind, build });
        Ok(())
    }

    fn slot(&self, name: &str) -> Option<&Slot> {
        self.slots.iter().find(|s| s.name == name)
    }

    pub fn create(&self, name: &str) -> IngestResult<Box<dyn StationDriver>> {
        let slot = self
            .slot(name)
            .ok_or_else(|| IngestError::DriverError(format!("no driver named {name}")))?;
        (slot.build)()
    }

    pub fn kind(&self, name: &str) -> Option<&'static str> {
        self.slot(name).map(|s| s.kind)
    }

    /// `(name, kind)` pairs in registration order
    pub fn drivers(&self) -> impl Iterator<Item = (&str, &'static str)> {
        self.slots.iter().map(|s| (s.name.as_str(), s.kind))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
