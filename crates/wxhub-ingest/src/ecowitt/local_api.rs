//! Ecowitt gateway local HTTP API (`/get_livedata_info`)
//!
//! The payload is grouped by sensor category. Most values are strings with
//! the unit embedded (`"3.6 m/s"`, `"65%"`); temperatures carry the unit in
//! a sibling `unit` field instead. A malformed value only drops that field.

use std::time::Duration;

use chrono::NaiveDateTime;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, instrument, warn};
use wxhub_core::units::*;
use wxhub_core::Observation;

use crate::{DecodeError, IngestResult};

/// Split `"23.5 km"` into `(23.5, Some("km"))`; `"65%"` into `(65.0, Some("%"))`
pub fn split_value(raw: &str) -> Option<(f64, Option<&str>)> {
    let raw = raw.trim();
    let end = raw
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.' || *c == '-' || *c == '+'))
        .map(|(i, _)| i)
        .unwrap_or(raw.len());
    let value = raw[..end].parse().ok()?;
    let unit = raw[end..].trim();
    Some((value, (!unit.is_empty()).then_some(unit)))
}

fn text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Converts one payload into target units
struct LiveDecoder<'a> {
    target: &'a UnitSystem,
    obs: Observation,
}

impl LiveDecoder<'_> {
    /// Numeric value of `key` in `item`, with its embedded or sibling unit
    fn value(&self, item: &Value, key: &str) -> Option<(f64, Option<String>)> {
        let raw = text(item.get(key)?)?;
        match split_value(&raw) {
            Some((v, unit)) => {
                let unit = unit
                    .map(str::to_string)
                    .or_else(|| item.get("unit").and_then(text));
                Some((v, unit))
            }
            None => {
                debug!(key, value = %raw, "skipping malformed live value");
                None
            }
        }
    }

    fn unit_or<U>(&self, unit: Option<&str>, fallback: U) -> U
    where
        U: std::str::FromStr,
    {
        unit.and_then(|u| u.parse().ok()).unwrap_or(fallback)
    }

    fn temp(&self, item: &Value, key: &str) -> Option<f64> {
        let (v, unit) = self.value(item, key)?;
        let from = self.unit_or(unit.as_deref(), self.target.temperature);
        Some(convert(v, from, self.target.temperature))
    }

    fn wind(&self, item: &Value, key: &str) -> Option<f64> {
        let (v, unit) = self.value(item, key)?;
        let from = self.unit_or(unit.as_deref(), self.target.wind);
        Some(convert(v, from, self.target.wind))
    }

    fn pressure(&self, item: &Value, key: &str) -> Option<f64> {
        let (v, unit) = self.value(item, key)?;
        let from = self.unit_or(unit.as_deref(), self.target.pressure);
        Some(convert(v, from, self.target.pressure))
    }

    fn rain(&self, item: &Value, key: &str) -> Option<f64> {
        let (v, unit) = self.value(item, key)?;
        // rates are reported as "mm/Hr"
        let unit = unit.as_deref().map(|u| u.split('/').next().unwrap_or(u));
        let from = self.unit_or(unit, self.target.rain);
        Some(convert(v, from, self.target.rain))
    }

    fn solar(&self, item: &Value, key: &str) -> Option<f64> {
        let (v, unit) = self.value(item, key)?;
        let from = self.unit_or(unit.as_deref(), self.target.solar);
        Some(convert(v, from, self.target.solar))
    }

    fn laser(&self, item: &Value, key: &str) -> Option<f64> {
        let (v, unit) = self.value(item, key)?;
        let from = self.unit_or(unit.as_deref(), self.target.laser);
        Some(convert(v, from, self.target.laser))
    }

    fn distance(&self, item: &Value, key: &str) -> Option<f64> {
        let (v, unit) = self.value(item, key)?;
        let from = self.unit_or(unit.as_deref(), self.target.lightning);
        Some(convert(v, from, self.target.lightning))
    }

    fn plain(&self, item: &Value, key: &str) -> Option<f64> {
        self.value(item, key).map(|(v, _)| v)
    }

    fn common(&mut self, items: &[Value]) {
        for item in items {
            let Some(id) = item.get("id").and_then(text) else {
                continue;
            };
            match id.to_ascii_lowercase().as_str() {
                "0x02" => self.obs.outdoor_temp = self.temp(item, "val"),
                "0x07" => self.obs.outdoor_humidity = self.plain(item, "val"),
                "0x03" => self.obs.dew_point = self.temp(item, "val"),
                "0x0a" => self.obs.wind_dir = self.plain(item, "val"),
                "0x0b" => self.obs.wind_speed = self.wind(item, "val"),
                "0x0c" => self.obs.wind_gust = self.wind(item, "val"),
                "0x15" => self.obs.solar_radiation = self.solar(item, "val"),
                "0x17" => self.obs.uv_index = self.plain(item, "val"),
                _ => {}
            }
        }
    }

    fn rain_section(&mut self, items: &[Value]) {
        for item in items {
            match item.get("id").and_then(text).as_deref() {
                Some("0x0E") | Some("0x0e") => self.obs.rain_rate = self.rain(item, "val"),
                Some("0x13") => {
                    let year = self.rain(item, "val");
                    self.obs.rain_ytd = year;
                    self.obs.rain_counter = year;
                }
                _ => {}
            }
        }
    }

    fn channels(&mut self, section: &str, items: &[Value]) {
        for item in items {
            let Some(ch) = item
                .get("channel")
                .and_then(text)
                .and_then(|c| c.trim().parse::<usize>().ok())
            else {
                continue;
            };
            match section {
                "ch_pm25" => self.obs.pm2_5.set(ch, self.plain(item, "PM25")),
                "ch_aisle" => {
                    self.obs.extra_temp.set(ch, self.temp(item, "temp"));
                    self.obs.extra_humidity.set(ch, self.plain(item, "humidity"));
                }
                "ch_soil" => self.obs.soil_moisture.set(ch, self.plain(item, "humidity")),
                "ch_temp" => self.obs.user_temp.set(ch, self.temp(item, "temp")),
                "ch_leaf" => self.obs.leaf_wetness.set(ch, self.plain(item, "humidity")),
                "ch_lds" => {
                    self.obs.laser_air.set(ch, self.laser(item, "air"));
                    self.obs.laser_depth.set(ch, self.laser(item, "depth"));
                }
                _ => {}
            }
        }
    }
}

fn section<'v>(payload: &'v Value, key: &str) -> &'v [Value] {
    payload
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Decode a `get_livedata_info` payload. An empty object is an error so
/// the caller produces no observation for that poll.
pub fn decode_livedata(
    payload: &Value,
    timestamp: NaiveDateTime,
    target: &UnitSystem,
) -> Result<Observation, DecodeError> {
    let Some(map) = payload.as_object().filter(|m| !m.is_empty()) else {
        return Err(DecodeError::Empty);
    };
    let mut d = LiveDecoder {
        target,
        obs: Observation::new(timestamp),
    };

    d.common(section(payload, "common_list"));
    if map.contains_key("rain") {
        d.rain_section(section(payload, "rain"));
    } else {
        d.rain_section(section(payload, "piezoRain"));
    }

    if let Some(wh25) = section(payload, "wh25").first() {
        d.obs.indoor_temp = d.temp(wh25, "intemp");
        d.obs.indoor_humidity = d.plain(wh25, "inhumi");
        d.obs.station_pressure = d.pressure(wh25, "abs");
        d.obs.sea_level_pressure = d.pressure(wh25, "rel");
    }

    if let Some(lightning) = section(payload, "lightning").first() {
        d.obs.lightning.distance = d.distance(lightning, "distance");
        d.obs.lightning.count = d.plain(lightning, "count").map(|c| c as u32);
        d.obs.lightning.last_strike = lightning
            .get("date")
            .and_then(text)
            .and_then(|s| NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S").ok());
    }

    if let Some(co2) = section(payload, "co2").first() {
        d.obs.aqi_combo.temperature = d.temp(co2, "temp");
        d.obs.aqi_combo.humidity = d.plain(co2, "humidity");
        d.obs.aqi_combo.pm2_5 = d.plain(co2, "PM25");
        d.obs.aqi_combo.pm10 = d.plain(co2, "PM10");
        d.obs.aqi_combo.co2 = d.plain(co2, "CO2");
    }

    for key in ["ch_pm25", "ch_aisle", "ch_soil", "ch_temp", "ch_leaf", "ch_lds"] {
        d.channels(key, section(payload, key));
    }

    Ok(d.obs)
}

/// HTTP client for one gateway
#[derive(Debug, Clone)]
pub struct LocalApiClient {
    client: Client,
    url: url::Url,
}

impl LocalApiClient {
    pub fn new(host: &str, timeout: Duration) -> IngestResult<Self> {
        let base = if host.contains("://") {
            host.to_string()
        } else {
            format!("http://{host}")
        };
        let url = url::Url::parse(&base)
            .and_then(|u| u.join("/get_livedata_info"))
            .map_err(|e| crate::IngestError::DriverError(format!("invalid gateway host {host}: {e}")))?;
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &url::Url {
        &self.url
    }

    /// Fetch one snapshot; `None` when the gateway answered non-200
    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn fetch(&self) -> IngestResult<Option<Value>> {
        let response = self.client.get(self.url.clone()).send().await?;
        if response.status() != StatusCode::OK {
            warn!(status = %response.status(), "gateway returned non-success status");
            return Ok(None);
        }
        Ok(Some(response.json::<Value>().await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 12)
            .unwrap()
            .and_hms_opt(13, 44, 53)
            .unwrap()
    }

    #[test]
    fn test_split_value() {
        assert_eq!(split_value("23.5 km"), Some((23.5, Some("km"))));
        assert_eq!(split_value("65%"), Some((65.0, Some("%"))));
        assert_eq!(split_value("-3.2"), Some((-3.2, None)));
        assert_eq!(split_value("--"), None);
        assert_eq!(split_value("n/a"), None);
    }

    #[test]
    fn test_decode_full_payload() {
        let payload = json!({
            "common_list": [
                {"id": "0x02", "val": "71.6", "unit": "F"},
                {"id": "0x07", "val": "65%"},
                {"id": "0x0B", "val": "10.8 km/h"},
                {"id": "0x0C", "val": "garbage"},
                {"id": "0x0A", "val": "225"},
                {"id": "0x15", "val": "450.00 W/m2"},
                {"id": "0x17", "val": "3"}
            ],
            "rain": [
                {"id": "0x0E", "val": "0.12 in/Hr"},
                {"id": "0x13", "val": "123.4 mm"}
            ],
            "wh25": [{"intemp": "22.0", "unit": "C", "inhumi": "45%", "abs": "29.92 inHg", "rel": "1013.2 hPa"}],
            "lightning": [{"distance": "12 km", "date": "2025-06-12T13:20:00", "count": "3"}],
            "co2": [{"temp": "21.0", "unit": "C", "humidity": "40%", "PM25": "5.0", "PM10": "7.0", "CO2": "420"}],
            "ch_aisle": [{"channel": "2", "temp": "18.2", "unit": "C", "humidity": "55%"}],
            "ch_soil": [{"channel": "3", "humidity": "34%"}],
            "ch_lds": [{"channel": "1", "air": "150 cm", "depth": "--"}]
        });
        let obs = decode_livedata(&payload, ts(), &UnitSystem::metric()).unwrap();

        assert!((obs.outdoor_temp.unwrap() - 22.0).abs() < 1e-9);
        assert_eq!(obs.outdoor_humidity, Some(65.0));
        assert!((obs.wind_speed.unwrap() - 3.0).abs() < 1e-9);
        assert_eq!(obs.wind_gust, None);
        assert_eq!(obs.wind_dir, Some(225.0));
        assert!((obs.rain_rate.unwrap() - 3.048).abs() < 1e-9);
        assert_eq!(obs.rain_counter, Some(123.4));
        assert!((obs.station_pressure.unwrap() - 1013.21).abs() < 0.01);
        assert_eq!(obs.lightning.count, Some(3));
        assert_eq!(obs.lightning.distance, Some(12.0));
        assert_eq!(obs.aqi_combo.co2, Some(420.0));
        assert_eq!(obs.extra_temp.get(2), Some(18.2));
        assert_eq!(obs.soil_moisture.get(3), Some(34.0));
        assert_eq!(obs.laser_air.get(1), Some(1500.0));
        assert_eq!(obs.laser_depth.get(1), None);
    }

    #[test]
    fn test_piezo_rain_fallback() {
        let payload = json!({"piezoRain": [{"id": "0x13", "val": "50.0 mm"}]});
        let obs = decode_livedata(&payload, ts(), &UnitSystem::metric()).unwrap();
        assert_eq!(obs.rain_counter, Some(50.0));
    }

    #[test]
    fn test_empty_payload_yields_nothing() {
        assert!(matches!(
            decode_livedata(&json!({}), ts(), &UnitSystem::metric()),
            Err(DecodeError::Empty)
        ));
        assert!(decode_livedata(&json!([]), ts(), &UnitSystem::metric()).is_err());
    }

    #[test]
    fn test_client_url() {
        let client = LocalApiClient::new("192.168.1.20", Duration::from_secs(5)).unwrap();
        assert_eq!(client.url().as_str(), "http://192.168.1.20/get_livedata_info");
    }
}
