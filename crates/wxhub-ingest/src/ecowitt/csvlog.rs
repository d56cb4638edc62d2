//! Ecowitt console log files (SD card / export CSV)
//!
//! Column order and unit annotations vary by firmware, so every file is
//! read through its own header: columns map to fields by normalized name,
//! units come from the parenthesized suffix of each column.

use std::collections::{BTreeMap, HashSet};
use std::io::Read;

use chrono::NaiveDateTime;
use csv::{ReaderBuilder, StringRecord, StringRecordsIntoIter, Trim};
use tracing::{debug, warn};
use wxhub_core::{LocalClock, Observation, UnitSystem};

use crate::{round_down, DecodeError, UnitCategory, UnitProfile};

/// Accepted formats for the local `Time` column
const TIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%Y-%m-%dT%H:%M:%S",
];

/// What a CSV column holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Time,
    Timestamp,
    IndoorTemp,
    IndoorHumidity,
    OutdoorTemp,
    OutdoorHumidity,
    DewPoint,
    Wind,
    Gust,
    WindDir,
    AbsPressure,
    RelPressure,
    Solar,
    Uvi,
    RainRate,
    YearlyRain,
    ExtraTemp(usize),
    ExtraHumidity(usize),
    SoilMoisture(usize),
    Pm25(usize),
    LeafWetness(usize),
    UserTemp(usize),
    LaserAir(usize),
    LaserDepth(usize),
    LightningCount,
    LightningDistance,
    LightningTime,
    AqiTemp,
    AqiHumidity,
    AqiCo2,
    AqiPm25,
    AqiPm10,
    Ignored,
}

impl Field {
    pub fn unit_category(self) -> Option<UnitCategory> {
        use Field::*;
        match self {
            IndoorTemp | OutdoorTemp | DewPoint | ExtraTemp(_) | UserTemp(_) | AqiTemp => {
                Some(UnitCategory::Temperature)
            }
            Wind | Gust => Some(UnitCategory::Wind),
            AbsPressure | RelPressure => Some(UnitCategory::Pressure),
            RainRate | YearlyRain => Some(UnitCategory::Rain),
            Solar => Some(UnitCategory::Solar),
            LaserAir(_) | LaserDepth(_) => Some(UnitCategory::Laser),
            LightningDistance => Some(UnitCategory::Lightning),
            _ => None,
        }
    }
}

/// Column name without its unit suffix, lowercased, single-spaced
fn normalize(column: &str) -> String {
    let name = column.split('(').next().unwrap_or(column);
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Channel number from a `chN` token anywhere in the name
fn channel(name: &str) -> Option<usize> {
    name.split(|c: char| c == ' ' || c == '_')
        .filter_map(|tok| tok.strip_prefix("ch"))
        .find_map(|n| n.parse().ok())
}

pub fn classify_column(column: &str) -> Field {
    let name = normalize(column);
    let has = |s: &str| name.contains(s);

    match name.as_str() {
        "time" | "date" | "date/time" => return Field::Time,
        "timestamp" => return Field::Timestamp,
        "indoor temperature" => return Field::IndoorTemp,
        "indoor humidity" => return Field::IndoorHumidity,
        "outdoor temperature" => return Field::OutdoorTemp,
        "outdoor humidity" => return Field::OutdoorHumidity,
        "dew point" | "dewpoint" => return Field::DewPoint,
        "wind" | "wind speed" => return Field::Wind,
        "gust" | "wind gust" => return Field::Gust,
        "wind direction" => return Field::WindDir,
        "abs pressure" | "abs" => return Field::AbsPressure,
        "rel pressure" | "rel" => return Field::RelPressure,
        "solar rad" | "solar radiation" => return Field::Solar,
        "uvi" | "uv" => return Field::Uvi,
        "rain rate" | "hourly rain rate" => return Field::RainRate,
        "yearly rain" => return Field::YearlyRain,
        "thunder count" | "lightning count" => return Field::LightningCount,
        "thunder distance" | "lightning distance" => return Field::LightningDistance,
        "thunder time" | "lightning time" => return Field::LightningTime,
        _ => {}
    }

    if has("aqin") {
        return if has("pm2.5") {
            Field::AqiPm25
        } else if has("pm10") {
            Field::AqiPm10
        } else if has("co2") {
            Field::AqiCo2
        } else if has("temperature") {
            Field::AqiTemp
        } else if has("humidity") {
            Field::AqiHumidity
        } else {
            Field::Ignored
        };
    }

    let Some(ch) = channel(&name) else {
        return Field::Ignored;
    };
    if has("battery") {
        Field::Ignored
    } else if has("pm2.5") {
        Field::Pm25(ch)
    } else if has("soil") {
        Field::SoilMoisture(ch)
    } else if has("leaf") {
        Field::LeafWetness(ch)
    } else if has("wn34") || has("user temp") {
        Field::UserTemp(ch)
    } else if has("lds") && has("air") {
        Field::LaserAir(ch)
    } else if has("lds") && (has("depth") || has("height")) {
        Field::LaserDepth(ch)
    } else if has("temperature") {
        Field::ExtraTemp(ch)
    } else if has("humidity") {
        Field::ExtraHumidity(ch)
    } else {
        Field::Ignored
    }
}

/// Per-file decode counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsvStats {
    pub lines: usize,
    pub decoded: usize,
    pub too_few_fields: usize,
    pub bad_timestamp: usize,
    pub duplicates: usize,
    pub bad_values: usize,
}

fn parse_time(raw: &str) -> Option<NaiveDateTime> {
    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

/// Lazily decodes one CSV log into observations
pub struct CsvLogStream<R: Read> {
    records: StringRecordsIntoIter<R>,
    columns: Vec<Field>,
    profile: UnitProfile,
    clock: LocalClock,
    interval_minutes: u32,
    seen: HashSet<NaiveDateTime>,
    line: usize,
    stats: CsvStats,
}

impl<R: Read> CsvLogStream<R> {
    /// Read the header line and build the column map and unit profile
    pub fn new(
        reader: R,
        target: UnitSystem,
        clock: LocalClock,
        interval_minutes: u32,
    ) -> Result<Self, DecodeError> {
        let mut records = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(reader)
            .into_records();

        let header: StringRecord = records.next().ok_or(DecodeError::Empty)??;
        let names: Vec<String> = header
            .iter()
            .map(|c| c.trim_start_matches('\u{feff}').to_string())
            .collect();
        let columns: Vec<Field> = names.iter().map(|n| classify_column(n)).collect();
        if !columns.iter().any(|f| matches!(f, Field::Time | Field::Timestamp)) {
            return Err(DecodeError::Timestamp("header has no Time or Timestamp column".into()));
        }

        let profile = UnitProfile::from_header(
            columns
                .iter()
                .zip(&names)
                .filter_map(|(f, n)| f.unit_category().map(|c| (c, n.as_str()))),
            target,
        );
        debug!(columns = columns.len(), source = ?profile.source, "csv header parsed");

        Ok(Self {
            records,
            columns,
            profile,
            clock,
            interval_minutes: interval_minutes.max(1),
            seen: HashSet::new(),
            line: 1,
            stats: CsvStats::default(),
        })
    }

    pub fn stats(&self) -> &CsvStats {
        &self.stats
    }

    pub fn profile(&self) -> &UnitProfile {
        &self.profile
    }

    fn timestamp(&self, record: &StringRecord) -> Result<NaiveDateTime, DecodeError> {
        let cell = |field: Field| {
            self.columns
                .iter()
                .position(|f| *f == field)
                .and_then(|i| record.get(i))
                .filter(|v| !v.is_empty() && *v != "--")
        };
        if let Some(raw) = cell(Field::Timestamp) {
            let epoch: i64 = raw
                .parse()
                .map_err(|_| DecodeError::Timestamp(raw.to_string()))?;
            let local = self
                .clock
                .from_epoch(epoch)
                .ok_or_else(|| DecodeError::Timestamp(raw.to_string()))?;
            return Ok(round_down(local, self.interval_minutes));
        }
        let raw = cell(Field::Time).ok_or_else(|| DecodeError::Timestamp("missing".into()))?;
        let local = parse_time(raw).ok_or_else(|| DecodeError::Timestamp(raw.to_string()))?;
        Ok(round_down(local, self.interval_minutes))
    }

    fn decode_record(&mut self, record: &StringRecord) -> Result<Observation, DecodeError> {
        if record.len() < self.columns.len() {
            return Err(DecodeError::TooFewFields {
                line: self.line,
                need: self.columns.len(),
                got: record.len(),
            });
        }
        let mut obs = Observation::new(self.timestamp(record)?);
        obs.report_interval_minutes = Some(self.interval_minutes);
        let p = &self.profile;

        for (field, raw) in self.columns.iter().zip(record.iter()) {
            if raw.is_empty() || raw == "--" || matches!(field, Field::Time | Field::Timestamp) {
                continue;
            }
            if *field == Field::LightningTime {
                obs.lightning.last_strike = parse_time(raw);
                continue;
            }
            let Ok(v) = raw.trim_end_matches('%').parse::<f64>() else {
                self.stats.bad_values += 1;
                debug!(line = self.line, ?field, value = raw, "unparsable value");
                continue;
            };
            match *field {
                Field::IndoorTemp => obs.indoor_temp = Some(p.temperature(v)),
                Field::IndoorHumidity => obs.indoor_humidity = Some(v),
                Field::OutdoorTemp => obs.outdoor_temp = Some(p.temperature(v)),
                Field::OutdoorHumidity => obs.outdoor_humidity = Some(v),
                Field::DewPoint => obs.dew_point = Some(p.temperature(v)),
                Field::Wind => obs.wind_speed = Some(p.wind(v)),
                Field::Gust => obs.wind_gust = Some(p.wind(v)),
                Field::WindDir => obs.wind_dir = Some(v),
                Field::AbsPressure => obs.station_pressure = Some(p.pressure(v)),
                Field::RelPressure => obs.sea_level_pressure = Some(p.pressure(v)),
                Field::Solar => obs.solar_radiation = Some(p.solar(v)),
                Field::Uvi => obs.uv_index = Some(v),
                Field::RainRate => obs.rain_rate = Some(p.rain(v)),
                Field::YearlyRain => {
                    obs.rain_ytd = Some(p.rain(v));
                    obs.rain_counter = Some(p.rain(v));
                }
                Field::ExtraTemp(ch) => obs.extra_temp.set(ch, Some(p.temperature(v))),
                Field::ExtraHumidity(ch) => obs.extra_humidity.set(ch, Some(v)),
                Field::SoilMoisture(ch) => obs.soil_moisture.set(ch, Some(v)),
                Field::Pm25(ch) => obs.pm2_5.set(ch, Some(v)),
                Field::LeafWetness(ch) => obs.leaf_wetness.set(ch, Some(v)),
                Field::UserTemp(ch) => obs.user_temp.set(ch, Some(p.temperature(v))),
                Field::LaserAir(ch) => obs.laser_air.set(ch, Some(p.laser(v))),
                Field::LaserDepth(ch) => obs.laser_depth.set(ch, Some(p.laser(v))),
                Field::LightningCount => obs.lightning.count = Some(v as u32),
                Field::LightningDistance => obs.lightning.distance = Some(p.lightning(v)),
                Field::AqiTemp => obs.aqi_combo.temperature = Some(p.temperature(v)),
                Field::AqiHumidity => obs.aqi_combo.humidity = Some(v),
                Field::AqiCo2 => obs.aqi_combo.co2 = Some(v),
                Field::AqiPm25 => obs.aqi_combo.pm2_5 = Some(v),
                Field::AqiPm10 => obs.aqi_combo.pm10 = Some(v),
                Field::Time | Field::Timestamp | Field::LightningTime | Field::Ignored => {}
            }
        }
        Ok(obs)
    }
}

impl<R: Read> Iterator for CsvLogStream<R> {
    type Item = Observation;

    fn next(&mut self) -> Option<Observation> {
        loop {
            let next = self.records.next()?;
            self.line += 1;
            self.stats.lines += 1;
            let record = match next {
                Ok(r) => r,
                Err(e) => {
                    warn!(line = self.line, error = %e, "unreadable csv line");
                    continue;
                }
            };
            if record.iter().all(str::is_empty) {
                continue;
            }
            match self.decode_record(&record) {
                Ok(obs) => {
                    if !self.seen.insert(obs.timestamp) {
                        self.stats.duplicates += 1;
                        warn!(line = self.line, timestamp = %obs.timestamp, "duplicate timestamp skipped");
                        continue;
                    }
                    self.stats.decoded += 1;
                    return Some(obs);
                }
                Err(e) => {
                    match e {
                        DecodeError::TooFewFields { .. } => self.stats.too_few_fields += 1,
                        DecodeError::Timestamp(_) => self.stats.bad_timestamp += 1,
                        _ => {}
                    }
                    warn!(line = self.line, error = %e, "skipping csv line");
                }
            }
        }
    }
}

/// Join main-file and extra-sensor records into one ascending backlog.
/// Fields already present in the main record win.
pub fn merge_by_timestamp<M, E>(main: M, extra: E) -> Vec<Observation>
where
    M: IntoIterator<Item = Observation>,
    E: IntoIterator<Item = Observation>,
{
    let mut merged: BTreeMap<NaiveDateTime, Observation> = BTreeMap::new();
    for obs in main {
        merged.entry(obs.timestamp).or_insert(obs);
    }
    for obs in extra {
        merged
            .entry(obs.timestamp)
            .and_modify(|m| m.merge_from(&obs))
            .or_insert(obs);
    }
    merged.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use wxhub_core::{TempUnit, WindUnit};

    fn ts(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 12)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn utc_plus_2() -> LocalClock {
        LocalClock::from_offset_minutes(120).unwrap()
    }

    #[test]
    fn test_classify_columns() {
        assert_eq!(classify_column("Outdoor Temperature(℃)"), Field::OutdoorTemp);
        assert_eq!(classify_column("REL Pressure(hPa)"), Field::RelPressure);
        assert_eq!(classify_column("CH3 Temperature(℃)"), Field::ExtraTemp(3));
        assert_eq!(classify_column("CH3 Humidity(%)"), Field::ExtraHumidity(3));
        assert_eq!(classify_column("Soil CH12 Moisture(%)"), Field::SoilMoisture(12));
        assert_eq!(classify_column("PM2.5 CH2(ug/m3)"), Field::Pm25(2));
        assert_eq!(classify_column("WN34 CH1(℃)"), Field::UserTemp(1));
        assert_eq!(classify_column("LDS_Air CH1(mm)"), Field::LaserAir(1));
        assert_eq!(classify_column("LDS_Depth CH2(mm)"), Field::LaserDepth(2));
        assert_eq!(classify_column("AQIN CO2(ppm)"), Field::AqiCo2);
        assert_eq!(classify_column("Thunder distance(km)"), Field::LightningDistance);
        assert_eq!(classify_column("CH1 Battery"), Field::Ignored);
        assert_eq!(classify_column("\u{feff}Time"), Field::Ignored);
        assert_eq!(classify_column("Time"), Field::Time);
    }

    #[test]
    fn test_epoch_column_wins_and_rounds_down() {
        let text = "Time,Timestamp,Outdoor Temperature(℃),Outdoor Humidity(%)\n\
                    2025-06-12 13:44,1749732293,3.8,--\n";
        let mut stream = CsvLogStream::new(text.as_bytes(), UnitSystem::metric(), utc_plus_2(), 5).unwrap();
        let obs = stream.next().unwrap();

        // epoch 1749732293 is 12:44:53 UTC, so 14:44:53 at +02:00
        assert_eq!(obs.timestamp, ts(14, 40));
        assert_eq!(obs.outdoor_temp, Some(3.8));
        assert_eq!(obs.outdoor_humidity, None);
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_formatted_time_used_without_epoch_column() {
        let text = "Time,Outdoor Temperature(℉),Wind(mph)\n2025/06/12 13:44,50.0,10\n";
        let target = UnitSystem {
            temperature: TempUnit::Celsius,
            wind: WindUnit::MetresPerSecond,
            ..UnitSystem::metric()
        };
        let obs = CsvLogStream::new(text.as_bytes(), target, utc_plus_2(), 1)
            .unwrap()
            .next()
            .unwrap();
        assert_eq!(obs.timestamp, ts(13, 44));
        assert!((obs.outdoor_temp.unwrap() - 10.0).abs() < 1e-9);
        assert!((obs.wind_speed.unwrap() - 4.4704).abs() < 1e-9);
    }

    #[test]
    fn test_bad_lines_skipped_and_counted() {
        let text = "\u{feff}Time,Outdoor Temperature(C),Yearly Rain(mm)\n\
                    2025-06-12 13:00,10.0,100.0\n\
                    2025-06-12 13:05,10.5\n\
                    not a date,11.0,101.0\n\
                    2025-06-12 13:10,11.0,101.0\n\
                    2025-06-12 13:10,99.0,999.0\n";
        let mut stream = CsvLogStream::new(text.as_bytes(), UnitSystem::metric(), utc_plus_2(), 5).unwrap();
        let out: Vec<_> = stream.by_ref().collect();

        assert_eq!(out.len(), 2);
        assert_eq!(out[1].outdoor_temp, Some(11.0));
        assert_eq!(out[1].rain_counter, Some(101.0));
        let stats = stream.stats();
        assert_eq!(stats.too_few_fields, 1);
        assert_eq!(stats.bad_timestamp, 1);
        assert_eq!(stats.duplicates, 1);
    }

    #[test]
    fn test_header_without_time_rejected() {
        let text = "Outdoor Temperature(C)\n10.0\n";
        assert!(CsvLogStream::new(text.as_bytes(), UnitSystem::metric(), utc_plus_2(), 5).is_err());
        assert!(matches!(
            CsvLogStream::new("".as_bytes(), UnitSystem::metric(), utc_plus_2(), 5),
            Err(DecodeError::Empty)
        ));
    }

    #[test]
    fn test_merge_main_and_extra() {
        let mut main = Observation::new(ts(13, 0));
        main.outdoor_temp = Some(10.0);
        let mut extra = Observation::new(ts(13, 0));
        extra.extra_temp.set(1, Some(20.0));
        extra.outdoor_temp = Some(55.0);
        let extra_only = Observation::new(ts(12, 55));

        let merged = merge_by_timestamp(vec![main], vec![extra, extra_only]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].timestamp, ts(12, 55));
        assert_eq!(merged[1].outdoor_temp, Some(10.0));
        assert_eq!(merged[1].extra_temp.get(1), Some(20.0));
    }
}
