//! Unit model and conversion functions
//!
//! Every measurement category has its own unit enum. Conversions go through
//! a base unit per category, are pure, and are total over every enum pair.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Unit parsing error
#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    #[error("Unknown {category} unit: {token}")]
    UnknownUnit {
        category: &'static str,
        token: String,
    },
}

/// Conversion through a per-category base unit
pub trait Convert: Copy + PartialEq {
    /// Express `value` (in `self`) in the base unit of the category
    fn to_base(self, value: f64) -> f64;

    /// Express a base-unit `value` in `self`
    fn from_base(self, value: f64) -> f64;

    /// Convert `value` from `self` into `to`
    fn convert_to(self, value: f64, to: Self) -> f64 {
        if self == to {
            return value;
        }
        to.from_base(self.to_base(value))
    }
}

/// Convert `value` from one unit to another of the same category
pub fn convert<U: Convert>(value: f64, from: U, to: U) -> f64 {
    from.convert_to(value, to)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TempUnit {
    #[serde(alias = "c")]
    Celsius,
    #[serde(alias = "f")]
    Fahrenheit,
}

impl Convert for TempUnit {
    fn to_base(self, value: f64) -> f64 {
        match self {
            TempUnit::Celsius => value,
            TempUnit::Fahrenheit => (value - 32.0) * 5.0 / 9.0,
        }
    }

    fn from_base(self, value: f64) -> f64 {
        match self {
            TempUnit::Celsius => value,
            TempUnit::Fahrenheit => value * 9.0 / 5.0 + 32.0,
        }
    }
}

impl TempUnit {
    /// Convert a temperature difference (no offset applied)
    pub fn convert_delta(self, delta: f64, to: TempUnit) -> f64 {
        match (self, to) {
            (TempUnit::Celsius, TempUnit::Fahrenheit) => delta * 9.0 / 5.0,
            (TempUnit::Fahrenheit, TempUnit::Celsius) => delta * 5.0 / 9.0,
            _ => delta,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindUnit {
    #[serde(alias = "m/s")]
    MetresPerSecond,
    #[serde(alias = "mph")]
    MilesPerHour,
    #[serde(alias = "km/h", alias = "kph")]
    KilometresPerHour,
    #[serde(alias = "kt", alias = "knot")]
    Knots,
}

impl Convert for WindUnit {
    // base: m/s
    fn to_base(self, value: f64) -> f64 {
        match self {
            WindUnit::MetresPerSecond => value,
            WindUnit::MilesPerHour => value * 0.44704,
            WindUnit::KilometresPerHour => value / 3.6,
            WindUnit::Knots => value * 0.514444,
        }
    }

    fn from_base(self, value: f64) -> f64 {
        match self {
            WindUnit::MetresPerSecond => value,
            WindUnit::MilesPerHour => value / 0.44704,
            WindUnit::KilometresPerHour => value * 3.6,
            WindUnit::Knots => value / 0.514444,
        }
    }
}

impl WindUnit {
    /// Distance travelled in one hour at a speed of 1 unit, in the run unit
    /// (km for m/s and km/h, miles for mph, nautical miles for knots)
    pub fn run_per_hour(self) -> f64 {
        match self {
            WindUnit::MetresPerSecond => 3.6,
            WindUnit::MilesPerHour | WindUnit::KilometresPerHour | WindUnit::Knots => 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureUnit {
    #[serde(alias = "mb", alias = "mbar")]
    Hpa,
    InHg,
    Kpa,
    MmHg,
}

impl Convert for PressureUnit {
    // base: hPa
    fn to_base(self, value: f64) -> f64 {
        match self {
            PressureUnit::Hpa => value,
            PressureUnit::InHg => value * 33.8638866667,
            PressureUnit::Kpa => value * 10.0,
            PressureUnit::MmHg => value * 1.3332239,
        }
    }

    fn from_base(self, value: f64) -> f64 {
        match self {
            PressureUnit::Hpa => value,
            PressureUnit::InHg => value / 33.8638866667,
            PressureUnit::Kpa => value / 10.0,
            PressureUnit::MmHg => value / 1.3332239,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RainUnit {
    Mm,
    In,
}

impl Convert for RainUnit {
    fn to_base(self, value: f64) -> f64 {
        match self {
            RainUnit::Mm => value,
            RainUnit::In => value * 25.4,
        }
    }

    fn from_base(self, value: f64) -> f64 {
        match self {
            RainUnit::Mm => value,
            RainUnit::In => value / 25.4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolarUnit {
    #[serde(alias = "w/m2")]
    Wm2,
    Klux,
    Kfc,
}

/// Lux per W/m² for daylight, as used by Ecowitt consoles
const LUX_PER_WM2: f64 = 126.7;
const LUX_PER_FOOT_CANDLE: f64 = 10.764;

impl Convert for SolarUnit {
    // base: W/m²
    fn to_base(self, value: f64) -> f64 {
        match self {
            SolarUnit::Wm2 => value,
            SolarUnit::Klux => value * 1000.0 / LUX_PER_WM2,
            SolarUnit::Kfc => value * 1000.0 * LUX_PER_FOOT_CANDLE / LUX_PER_WM2,
        }
    }

    fn from_base(self, value: f64) -> f64 {
        match self {
            SolarUnit::Wm2 => value,
            SolarUnit::Klux => value * LUX_PER_WM2 / 1000.0,
            SolarUnit::Kfc => value * LUX_PER_WM2 / (1000.0 * LUX_PER_FOOT_CANDLE),
        }
    }
}

/// Laser distance sensors (snow depth, air gap)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaserUnit {
    Mm,
    Cm,
    In,
}

impl Convert for LaserUnit {
    // base: mm
    fn to_base(self, value: f64) -> f64 {
        match self {
            LaserUnit::Mm => value,
            LaserUnit::Cm => value * 10.0,
            LaserUnit::In => value * 25.4,
        }
    }

    fn from_base(self, value: f64) -> f64 {
        match self {
            LaserUnit::Mm => value,
            LaserUnit::Cm => value / 10.0,
            LaserUnit::In => value / 25.4,
        }
    }
}

/// Lightning strike distance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceUnit {
    Km,
    Mi,
}

impl Convert for DistanceUnit {
    fn to_base(self, value: f64) -> f64 {
        match self {
            DistanceUnit::Km => value,
            DistanceUnit::Mi => value * 1.609344,
        }
    }

    fn from_base(self, value: f64) -> f64 {
        match self {
            DistanceUnit::Km => value,
            DistanceUnit::Mi => value / 1.609344,
        }
    }
}

macro_rules! impl_from_str {
    ($ty:ty, $category:literal, { $($($token:literal)|+ => $unit:expr),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = UnitError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($($token)|+ => Ok($unit),)+
                    other => Err(UnitError::UnknownUnit {
                        category: $category,
                        token: other.to_string(),
                    }),
                }
            }
        }
    };
}

impl_from_str!(TempUnit, "temperature", {
    "c" | "°c" | "℃" | "celsius" => TempUnit::Celsius,
    "f" | "°f" | "℉" | "fahrenheit" => TempUnit::Fahrenheit,
});

impl_from_str!(WindUnit, "wind", {
    "m/s" | "mps" | "metres_per_second" => WindUnit::MetresPerSecond,
    "mph" | "miles_per_hour" => WindUnit::MilesPerHour,
    "km/h" | "kmh" | "kph" | "kilometres_per_hour" => WindUnit::KilometresPerHour,
    "knots" | "knot" | "kt" | "kts" => WindUnit::Knots,
});

impl_from_str!(PressureUnit, "pressure", {
    "hpa" | "mb" | "mbar" => PressureUnit::Hpa,
    "inhg" => PressureUnit::InHg,
    "kpa" => PressureUnit::Kpa,
    "mmhg" => PressureUnit::MmHg,
});

impl_from_str!(RainUnit, "rain", {
    "mm" => RainUnit::Mm,
    "in" => RainUnit::In,
});

impl_from_str!(SolarUnit, "solar", {
    "w/m2" | "w/m²" | "wm2" => SolarUnit::Wm2,
    "klux" => SolarUnit::Klux,
    "kfc" => SolarUnit::Kfc,
});

impl_from_str!(LaserUnit, "laser distance", {
    "mm" => LaserUnit::Mm,
    "cm" => LaserUnit::Cm,
    "in" => LaserUnit::In,
});

impl_from_str!(DistanceUnit, "lightning distance", {
    "km" => DistanceUnit::Km,
    "mi" | "miles" => DistanceUnit::Mi,
});

/// Target unit per measurement category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitSystem {
    pub temperature: TempUnit,
    pub wind: WindUnit,
    pub pressure: PressureUnit,
    pub rain: RainUnit,
    pub solar: SolarUnit,
    pub laser: LaserUnit,
    pub lightning: DistanceUnit,
}

impl UnitSystem {
    pub fn metric() -> Self {
        Self {
            temperature: TempUnit::Celsius,
            wind: WindUnit::MetresPerSecond,
            pressure: PressureUnit::Hpa,
            rain: RainUnit::Mm,
            solar: SolarUnit::Wm2,
            laser: LaserUnit::Mm,
            lightning: DistanceUnit::Km,
        }
    }

    pub fn us() -> Self {
        Self {
            temperature: TempUnit::Fahrenheit,
            wind: WindUnit::MilesPerHour,
            pressure: PressureUnit::InHg,
            rain: RainUnit::In,
            solar: SolarUnit::Wm2,
            laser: LaserUnit::In,
            lightning: DistanceUnit::Mi,
        }
    }
}

impl Default for UnitSystem {
    fn default() -> Self {
        Self::metric()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 0.001
    }

    #[test]
    fn test_temperature_conversion() {
        assert!(close(convert(32.0, TempUnit::Fahrenheit, TempUnit::Celsius), 0.0));
        assert!(close(convert(0.0, TempUnit::Celsius, TempUnit::Fahrenheit), 32.0));
        assert!(close(convert(212.0, TempUnit::Fahrenheit, TempUnit::Celsius), 100.0));
        assert!(close(TempUnit::Celsius.convert_delta(10.0, TempUnit::Fahrenheit), 18.0));
    }

    #[test]
    fn test_same_unit_conversion() {
        assert_eq!(convert(25.0, TempUnit::Celsius, TempUnit::Celsius), 25.0);
        assert_eq!(convert(3.3, WindUnit::Knots, WindUnit::Knots), 3.3);
    }

    #[test]
    fn test_wind_conversion() {
        assert!(close(convert(10.0, WindUnit::MetresPerSecond, WindUnit::KilometresPerHour), 36.0));
        assert!(close(convert(1.0, WindUnit::MilesPerHour, WindUnit::MetresPerSecond), 0.44704));
        assert!(close(convert(1.0, WindUnit::Knots, WindUnit::KilometresPerHour), 1.852));
    }

    #[test]
    fn test_pressure_and_rain_conversion() {
        assert!(close(convert(29.92, PressureUnit::InHg, PressureUnit::Hpa), 1013.207));
        assert!(close(convert(101.3, PressureUnit::Kpa, PressureUnit::Hpa), 1013.0));
        assert!(close(convert(1.0, RainUnit::In, RainUnit::Mm), 25.4));
        assert!(close(convert(12.7, LaserUnit::Mm, LaserUnit::In), 0.5));
    }

    #[test]
    fn test_solar_conversion_roundtrip() {
        let wm2 = convert(10.0, SolarUnit::Klux, SolarUnit::Wm2);
        assert!(close(wm2, 78.926));
        assert!(close(convert(wm2, SolarUnit::Wm2, SolarUnit::Klux), 10.0));
        let kfc = convert(wm2, SolarUnit::Wm2, SolarUnit::Kfc);
        assert!(close(convert(kfc, SolarUnit::Kfc, SolarUnit::Klux), 10.0));
    }

    #[test]
    fn test_unit_tokens() {
        assert_eq!("hPa".parse::<PressureUnit>().unwrap(), PressureUnit::Hpa);
        assert_eq!("km/h".parse::<WindUnit>().unwrap(), WindUnit::KilometresPerHour);
        assert_eq!("℃".parse::<TempUnit>().unwrap(), TempUnit::Celsius);
        assert!("furlongs".parse::<RainUnit>().is_err());
    }

    #[test]
    fn test_unit_system_serde() {
        let sys: UnitSystem =
            serde_json::from_str(r#"{"temperature":"f","wind":"mph","pressure":"inhg"}"#).unwrap();
        assert_eq!(sys.temperature, TempUnit::Fahrenheit);
        assert_eq!(sys.wind, WindUnit::MilesPerHour);
        assert_eq!(sys.rain, RainUnit::Mm);
    }
}
