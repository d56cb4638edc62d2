//! Fixed-offset decoders for Vantage LOOP, LOOP2 and archive records
//!
//! Buffers are checked for length only; the transport verifies the CRC
//! before handing them over. Console units are fixed: °F, mph, inHg and
//! rain-collector clicks.

use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;
use wxhub_core::units::{convert, RainUnit};
use wxhub_core::Observation;

use crate::{DecodeError, UnitProfile};

pub const LOOP_LEN: usize = 99;
pub const ARCHIVE_RECORD_LEN: usize = 52;
pub const ARCHIVE_PAGE_LEN: usize = 267;
pub const RECORDS_PER_PAGE: usize = 5;

const LOOP_TYPE: u8 = 0;
const LOOP2_TYPE: u8 = 1;
const ARCHIVE_REV_B: u8 = 0x00;

/// Rain collector fitted to the station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RainCollector {
    #[default]
    #[serde(alias = "0.01in")]
    Hundredth,
    #[serde(alias = "0.2mm")]
    FifthMm,
    #[serde(alias = "0.1mm")]
    TenthMm,
}

impl RainCollector {
    /// Rain represented by `clicks`, in `target` units
    pub fn amount(self, clicks: u16, target: RainUnit) -> f64 {
        let clicks = f64::from(clicks);
        match self {
            RainCollector::Hundredth => convert(clicks * 0.01, RainUnit::In, target),
            RainCollector::FifthMm => convert(clicks * 0.2, RainUnit::Mm, target),
            RainCollector::TenthMm => convert(clicks * 0.1, RainUnit::Mm, target),
        }
    }
}

fn check_len(buf: &[u8], need: usize) -> Result<(), DecodeError> {
    if buf.len() < need {
        return Err(DecodeError::ShortBuffer {
            need,
            got: buf.len(),
        });
    }
    Ok(())
}

fn u16_at(buf: &[u8], i: usize) -> u16 {
    u16::from_le_bytes([buf[i], buf[i + 1]])
}

fn i16_at(buf: &[u8], i: usize) -> i16 {
    i16::from_le_bytes([buf[i], buf[i + 1]])
}

/// Tenths of a degree F; 0x7FFF and its negative twin are dashes
fn temp_tenths(buf: &[u8], i: usize) -> Option<f64> {
    match i16_at(buf, i) {
        32767 | -32768 => None,
        raw => Some(f64::from(raw) / 10.0),
    }
}

/// Whole degrees F stored in a 16-bit field
fn temp_whole(buf: &[u8], i: usize) -> Option<f64> {
    match i16_at(buf, i) {
        255 | 32767 | -32768 => None,
        raw => Some(f64::from(raw)),
    }
}

/// Extra sensor byte: degrees F offset by 90, 255 when not fitted
fn temp_offset(b: u8) -> Option<f64> {
    (b != 255).then(|| f64::from(b) - 90.0)
}

fn byte(b: u8) -> Option<f64> {
    (b != 255).then(|| f64::from(b))
}

fn word(buf: &[u8], i: usize, dashed: u16) -> Option<u16> {
    let raw = u16_at(buf, i);
    (raw != dashed).then_some(raw)
}

fn pressure_thousandths(buf: &[u8], i: usize) -> Option<f64> {
    word(buf, i, 0).map(|raw| f64::from(raw) / 1000.0)
}

/// Fields common to the start of every LOOP variant
fn decode_loop_common(buf: &[u8], obs: &mut Observation, p: &UnitProfile) {
    obs.sea_level_pressure = pressure_thousandths(buf, 7).map(|v| p.pressure(v));
    obs.indoor_temp = temp_tenths(buf, 9).map(|v| p.temperature(v));
    obs.indoor_humidity = byte(buf[11]);
    obs.outdoor_temp = temp_tenths(buf, 12).map(|v| p.temperature(v));
    obs.wind_speed = byte(buf[14]).map(|v| p.wind(v));
    obs.wind_dir = word(buf, 16, 0x7FFF)
        .filter(|d| *d > 0 && *d <= 360)
        .map(f64::from);
    obs.outdoor_humidity = byte(buf[33]);
    obs.uv_index = byte(buf[43]).map(|v| v / 10.0);
    obs.solar_radiation = word(buf, 44, 32767).map(|v| p.solar(f64::from(v)));
}

fn check_loop(buf: &[u8], packet_type: u8) -> Result<(), DecodeError> {
    check_len(buf, LOOP_LEN)?;
    if &buf[0..3] != b"LOO" || buf[4] != packet_type {
        return Err(DecodeError::UnexpectedPacket(format!(
            "expected LOOP type {packet_type}, header {:02X?}",
            &buf[0..5]
        )));
    }
    Ok(())
}

/// A decoded live packet with its resettable daily rain total
#[derive(Debug, Clone, PartialEq)]
pub struct LoopPacket {
    pub observation: Observation,
    /// Rain since midnight in target units, cleared by the console
    pub day_rain: Option<f64>,
}

/// Decodes console packets into target units
#[derive(Debug, Clone)]
pub struct VantageDecoder {
    profile: UnitProfile,
    collector: RainCollector,
}

impl VantageDecoder {
    pub fn new(profile: UnitProfile, collector: RainCollector) -> Self {
        Self { profile, collector }
    }

    fn rain(&self, clicks: u16) -> f64 {
        self.collector.amount(clicks, self.profile.target.rain)
    }

    /// LOOP (type 0): extra sensors, year rain
    pub fn decode_loop(&self, buf: &[u8], timestamp: NaiveDateTime) -> Result<LoopPacket, DecodeError> {
        check_loop(buf, LOOP_TYPE)?;
        let p = &self.profile;
        let mut obs = Observation::new(timestamp);
        decode_loop_common(buf, &mut obs, p);

        obs.wind_avg_10min = byte(buf[15]).map(|v| p.wind(v));
        for ch in 0..7 {
            obs.extra_temp
                .set(ch + 1, temp_offset(buf[18 + ch]).map(|v| p.temperature(v)));
            obs.extra_humidity.set(ch + 1, byte(buf[34 + ch]));
        }
        obs.rain_rate = word(buf, 41, 0xFFFF).map(|c| self.rain(c));
        obs.rain_ytd = Some(self.rain(u16_at(buf, 54)));
        for ch in 0..4 {
            obs.soil_moisture.set(ch + 1, byte(buf[62 + ch]));
            obs.leaf_wetness.set(ch + 1, byte(buf[66 + ch]));
        }

        Ok(LoopPacket {
            observation: obs,
            day_rain: Some(self.rain(u16_at(buf, 50))),
        })
    }

    /// LOOP2 (type 1): gust, 10-minute average, dew point, absolute pressure
    pub fn decode_loop2(&self, buf: &[u8], timestamp: NaiveDateTime) -> Result<LoopPacket, DecodeError> {
        check_loop(buf, LOOP2_TYPE)?;
        let p = &self.profile;
        let mut obs = Observation::new(timestamp);
        decode_loop_common(buf, &mut obs, p);

        obs.wind_avg_10min = word(buf, 18, 0x7FFF).map(|v| p.wind(f64::from(v) / 10.0));
        obs.wind_gust = word(buf, 22, 0x7FFF).map(|v| p.wind(f64::from(v)));
        obs.dew_point = temp_whole(buf, 30).map(|v| p.temperature(v));
        obs.rain_rate = word(buf, 41, 0xFFFF).map(|c| self.rain(c));
        obs.station_pressure = pressure_thousandths(buf, 67).map(|v| p.pressure(v));

        Ok(LoopPacket {
            observation: obs,
            day_rain: Some(self.rain(u16_at(buf, 50))),
        })
    }

    /// Revision B archive record. Empty slots (erased flash) yield `None`.
    /// The returned rain amount covers the archive interval.
    pub fn decode_archive(&self, rec: &[u8]) -> Result<Option<(Observation, f64)>, DecodeError> {
        check_len(rec, ARCHIVE_RECORD_LEN)?;
        let date = u16_at(rec, 0);
        let time = u16_at(rec, 2);
        if date == 0xFFFF || date == 0 || time == 0xFFFF {
            return Ok(None);
        }
        if rec[42] != ARCHIVE_REV_B {
            return Err(DecodeError::UnexpectedPacket(format!(
                "archive record type {:#04x}",
                rec[42]
            )));
        }
        let timestamp = decode_timestamp(date, time)?;
        let p = &self.profile;
        let mut obs = Observation::new(timestamp);

        obs.outdoor_temp = temp_tenths(rec, 4).map(|v| p.temperature(v));
        // upper nibble carries the collector type
        let rain = self.rain(u16_at(rec, 10) & 0x0FFF);
        obs.sea_level_pressure = pressure_thousandths(rec, 14).map(|v| p.pressure(v));
        obs.solar_radiation = word(rec, 16, 32767).map(|v| p.solar(f64::from(v)));
        obs.indoor_temp = temp_tenths(rec, 20).map(|v| p.temperature(v));
        obs.indoor_humidity = byte(rec[22]);
        obs.outdoor_humidity = byte(rec[23]);
        obs.wind_speed = byte(rec[24]).map(|v| p.wind(v));
        obs.wind_gust = byte(rec[25]).map(|v| p.wind(v));
        obs.wind_dir = (rec[27] < 16).then(|| f64::from(rec[27]) * 22.5);
        obs.uv_index = byte(rec[28]).map(|v| v / 10.0);
        for ch in 0..2 {
            obs.leaf_wetness.set(ch + 1, byte(rec[36 + ch]));
            obs.extra_humidity.set(ch + 1, byte(rec[43 + ch]));
        }
        for ch in 0..3 {
            obs.extra_temp
                .set(ch + 1, temp_offset(rec[45 + ch]).map(|v| p.temperature(v)));
        }
        for ch in 0..4 {
            obs.soil_moisture.set(ch + 1, byte(rec[48 + ch]));
        }
        Ok(Some((obs, rain)))
    }
}

/// Console date/time stamp: `day + month*32 + (year-2000)*512`, `hour*100 + minute`
pub fn decode_timestamp(date: u16, time: u16) -> Result<NaiveDateTime, DecodeError> {
    let day = u32::from(date & 0x1F);
    let month = u32::from((date >> 5) & 0x0F);
    let year = 2000 + i32::from(date >> 9);
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(u32::from(time / 100), u32::from(time % 100), 0))
        .ok_or_else(|| DecodeError::Timestamp(format!("date {date:#06x} time {time}")))
}

pub fn encode_timestamp(ts: NaiveDateTime) -> (u16, u16) {
    use chrono::{Datelike, Timelike};
    let date = ts.day() + ts.month() * 32 + (ts.year() - 2000).max(0) as u32 * 512;
    let time = ts.hour() * 100 + ts.minute();
    (date as u16, time as u16)
}

/// Split a 267-byte archive page into its sequence number and records
pub fn split_page(page: &[u8]) -> Result<(u8, [&[u8]; RECORDS_PER_PAGE]), DecodeError> {
    check_len(page, ARCHIVE_PAGE_LEN)?;
    let record = |i: usize| &page[1 + i * ARCHIVE_RECORD_LEN..1 + (i + 1) * ARCHIVE_RECORD_LEN];
    Ok((
        page[0],
        [record(0), record(1), record(2), record(3), record(4)],
    ))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::frame::crc16_ccitt;

    pub fn put_u16(buf: &mut [u8], i: usize, v: u16) {
        buf[i..i + 2].copy_from_slice(&v.to_le_bytes());
    }

    pub fn with_crc(mut buf: Vec<u8>) -> Vec<u8> {
        let n = buf.len() - 2;
        let crc = crc16_ccitt(&buf[..n]);
        buf[n..].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// LOOP packet: 29.921 inHg, 70.0°F in, 50.0°F out, 10 mph from 180°
    pub fn loop_packet(day_rain_clicks: u16) -> Vec<u8> {
        let mut b = vec![0u8; LOOP_LEN];
        b[0..3].copy_from_slice(b"LOO");
        b[4] = LOOP_TYPE;
        put_u16(&mut b, 7, 29921);
        put_u16(&mut b, 9, 700);
        b[11] = 40;
        put_u16(&mut b, 12, 500);
        b[14] = 10;
        b[15] = 8;
        put_u16(&mut b, 16, 180);
        b[18..25].fill(255);
        b[18] = 150;
        b[25..33].fill(255);
        b[33] = 85;
        b[34..41].fill(255);
        put_u16(&mut b, 41, 0);
        b[43] = 255;
        put_u16(&mut b, 44, 32767);
        put_u16(&mut b, 50, day_rain_clicks);
        put_u16(&mut b, 54, 1234);
        b[62..70].fill(255);
        b[95] = b'\n';
        b[96] = b'\r';
        with_crc(b)
    }

    pub fn loop2_packet() -> Vec<u8> {
        let mut b = vec![0u8; LOOP_LEN];
        b[0..3].copy_from_slice(b"LOO");
        b[4] = LOOP2_TYPE;
        put_u16(&mut b, 7, 29921);
        put_u16(&mut b, 9, 700);
        b[11] = 40;
        put_u16(&mut b, 12, 500);
        b[14] = 10;
        put_u16(&mut b, 16, 180);
        put_u16(&mut b, 18, 85);
        put_u16(&mut b, 22, 17);
        put_u16(&mut b, 30, 46);
        b[33] = 85;
        b[43] = 255;
        put_u16(&mut b, 44, 32767);
        put_u16(&mut b, 67, 29500);
        b[95] = b'\n';
        b[96] = b'\r';
        with_crc(b)
    }

    pub fn archive_record(ts: NaiveDateTime, rain_clicks: u16) -> Vec<u8> {
        let mut r = vec![0u8; ARCHIVE_RECORD_LEN];
        let (date, time) = encode_timestamp(ts);
        put_u16(&mut r, 0, date);
        put_u16(&mut r, 2, time);
        put_u16(&mut r, 4, 655);
        put_u16(&mut r, 10, rain_clicks);
        put_u16(&mut r, 12, 0);
        put_u16(&mut r, 14, 30012);
        put_u16(&mut r, 16, 420);
        put_u16(&mut r, 20, 712);
        r[22] = 45;
        r[23] = 62;
        r[24] = 7;
        r[25] = 15;
        r[26] = 4;
        r[27] = 4;
        r[28] = 255;
        r[36..38].fill(255);
        r[42] = ARCHIVE_REV_B;
        r[43..48].fill(255);
        r[48..52].fill(255);
        r
    }

    pub fn empty_record() -> Vec<u8> {
        vec![0xFF; ARCHIVE_RECORD_LEN]
    }

    pub fn archive_page(sequence: u8, records: &[Vec<u8>]) -> Vec<u8> {
        let mut page = vec![sequence];
        for i in 0..RECORDS_PER_PAGE {
            match records.get(i) {
                Some(r) => page.extend_from_slice(r),
                None => page.extend(empty_record()),
            }
        }
        page.extend_from_slice(&[0; 4]);
        page.extend_from_slice(&[0; 2]);
        with_crc(page)
    }
}
