//! Source unit detection and conversion into the target unit system

use tracing::warn;
use wxhub_core::units::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitCategory {
    Temperature,
    Wind,
    Pressure,
    Rain,
    Solar,
    Laser,
    Lightning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedUnit {
    Temperature(TempUnit),
    Wind(WindUnit),
    Pressure(PressureUnit),
    Rain(RainUnit),
    Solar(SolarUnit),
    Laser(LaserUnit),
    Lightning(DistanceUnit),
}

use DetectedUnit as D;
use UnitCategory as C;

/// Header suffix tokens, matched case-insensitively against the end of a
/// column name. The longest matching suffix in a category wins.
const SUFFIX_RULES: &[(UnitCategory, &str, DetectedUnit)] = &[
    (C::Temperature, "°c)", D::Temperature(TempUnit::Celsius)),
    (C::Temperature, "℃)", D::Temperature(TempUnit::Celsius)),
    (C::Temperature, "c)", D::Temperature(TempUnit::Celsius)),
    (C::Temperature, "°f)", D::Temperature(TempUnit::Fahrenheit)),
    (C::Temperature, "℉)", D::Temperature(TempUnit::Fahrenheit)),
    (C::Temperature, "f)", D::Temperature(TempUnit::Fahrenheit)),
    (C::Wind, "m/s)", D::Wind(WindUnit::MetresPerSecond)),
    (C::Wind, "mph)", D::Wind(WindUnit::MilesPerHour)),
    (C::Wind, "km/h)", D::Wind(WindUnit::KilometresPerHour)),
    (C::Wind, "knots)", D::Wind(WindUnit::Knots)),
    (C::Pressure, "hpa)", D::Pressure(PressureUnit::Hpa)),
    (C::Pressure, "inhg)", D::Pressure(PressureUnit::InHg)),
    (C::Pressure, "kpa)", D::Pressure(PressureUnit::Kpa)),
    (C::Pressure, "mmhg)", D::Pressure(PressureUnit::MmHg)),
    (C::Rain, "mm)", D::Rain(RainUnit::Mm)),
    (C::Rain, "mm/hr)", D::Rain(RainUnit::Mm)),
    (C::Rain, "in)", D::Rain(RainUnit::In)),
    (C::Rain, "in/hr)", D::Rain(RainUnit::In)),
    (C::Solar, "w/m2)", D::Solar(SolarUnit::Wm2)),
    (C::Solar, "klux)", D::Solar(SolarUnit::Klux)),
    (C::Solar, "kfc)", D::Solar(SolarUnit::Kfc)),
    (C::Laser, "mm)", D::Laser(LaserUnit::Mm)),
    (C::Laser, "cm)", D::Laser(LaserUnit::Cm)),
    (C::Laser, "in)", D::Laser(LaserUnit::In)),
    (C::Lightning, "km)", D::Lightning(DistanceUnit::Km)),
    (C::Lightning, "mi)", D::Lightning(DistanceUnit::Mi)),
];

/// Unit declared by a header column of the given category, if recognizable
pub fn detect_unit(category: UnitCategory, column: &str) -> Option<DetectedUnit> {
    let column = column.trim().to_lowercase();
    SUFFIX_RULES
        .iter()
        .filter(|(c, suffix, _)| *c == category && column.ends_with(suffix))
        .max_by_key(|(_, suffix, _)| suffix.chars().count())
        .map(|(_, _, unit)| *unit)
}

/// Source and target units for one decoder instance.
///
/// Built once per file/session and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitProfile {
    pub source: UnitSystem,
    pub target: UnitSystem,
    /// Categories that had columns but no recognizable unit token
    pub fallbacks: Vec<UnitCategory>,
}

impl UnitProfile {
    /// Profile for a feed whose units are fixed by the vendor
    pub fn fixed(source: UnitSystem, target: UnitSystem) -> Self {
        Self {
            source,
            target,
            fallbacks: Vec::new(),
        }
    }

    /// Detect source units from categorized header columns. Undetectable
    /// categories fall back to the target unit, so values pass through.
    pub fn from_header<'a, I>(columns: I, target: UnitSystem) -> Self
    where
        I: IntoIterator<Item = (UnitCategory, &'a str)>,
    {
        let mut source = target;
        let mut seen: Vec<UnitCategory> = Vec::new();
        let mut detected: Vec<UnitCategory> = Vec::new();

        for (category, column) in columns {
            if !seen.contains(&category) {
                seen.push(category);
            }
            if detected.contains(&category) {
                continue;
            }
            let Some(unit) = detect_unit(category, column) else {
                continue;
            };
            detected.push(category);
            match unit {
                D::Temperature(u) => source.temperature = u,
                D::Wind(u) => source.wind = u,
                D::Pressure(u) => source.pressure = u,
                D::Rain(u) => source.rain = u,
                D::Solar(u) => source.solar = u,
                D::Laser(u) => source.laser = u,
                D::Lightning(u) => source.lightning = u,
            }
        }

        let fallbacks: Vec<UnitCategory> = seen
            .into_iter()
            .filter(|c| !detected.contains(c))
            .collect();
        for category in &fallbacks {
            warn!(?category, "no unit token recognized in header, using configured unit");
        }

        Self {
            source,
            target,
            fallbacks,
        }
    }

    pub fn temperature(&self, v: f64) -> f64 {
        convert(v, self.source.temperature, self.target.temperature)
    }

    /// Temperature difference (no offset applied)
    pub fn temperature_delta(&self, v: f64) -> f64 {
        self.source
            .temperature
            .convert_delta(v, self.target.temperature)
    }

    pub fn wind(&self, v: f64) -> f64 {
        convert(v, self.source.wind, self.target.wind)
    }

    pub fn pressure(&self, v: f64) -> f64 {
        convert(v, self.source.pressure, self.target.pressure)
    }

    pub fn rain(&self, v: f64) -> f64 {
        convert(v, self.source.rain, self.target.rain)
    }

    pub fn solar(&self, v: f64) -> f64 {
        convert(v, self.source.solar, self.target.solar)
    }

    pub fn laser(&self, v: f64) -> f64 {
        convert(v, self.source.laser, self.target.laser)
    }

    pub fn lightning(&self, v: f64) -> f64 {
        convert(v, self.source.lightning, self.target.lightning)
    }
}
