//! Frame codec for the binary serial protocols
//!
//! WS2300 transactions address memory one nibble at a time. Each address
//! byte is `0x82 + nibble * 4` and must be acknowledged with
//! `sequence * 16 + nibble`; the length byte `0xC2 + len * 4` is echoed back
//! as `len + 0x30`; data is followed by an 8-bit additive checksum.

use std::time::Duration;

use tracing::{debug, warn};

use crate::serial::SerialLink;
use crate::{sleep_blocking, FrameError};

pub const RESET_BYTE: u8 = 0x06;
pub const RESET_ACK: u8 = 0x02;
const ADDRESS_BASE: u8 = 0x82;
const LENGTH_BASE: u8 = 0xC2;
const LENGTH_CAP: u8 = 0xFE;
const LENGTH_ACK_BASE: u8 = 0x30;

/// Largest read a single length byte can express
pub const MAX_READ_LEN: usize = ((LENGTH_CAP - LENGTH_BASE) / 4) as usize;

pub fn address_command(nibble: u8) -> u8 {
    ADDRESS_BASE + (nibble & 0x0F) * 4
}

/// Expected acknowledgement for the `sequence`-th address byte
pub fn address_ack(sequence: u8, command: u8) -> u8 {
    sequence * 16 + (command - ADDRESS_BASE) / 4
}

/// The four address bytes, most significant nibble first
pub fn encode_address(address: u16) -> [u8; 4] {
    let mut out = [0u8; 4];
    for (i, slot) in out.iter_mut().enumerate() {
        let shift = 4 * (3 - i);
        *slot = address_command(((address >> shift) & 0x0F) as u8);
    }
    out
}

pub fn decode_address(bytes: &[u8; 4]) -> Result<u16, FrameError> {
    bytes.iter().try_fold(0u16, |acc, &b| {
        if !(ADDRESS_BASE..=ADDRESS_BASE + 15 * 4).contains(&b) || (b - ADDRESS_BASE) % 4 != 0 {
            return Err(FrameError::Malformed(format!("bad address byte {b:#04x}")));
        }
        Ok(acc << 4 | u16::from((b - ADDRESS_BASE) / 4))
    })
}

pub fn length_command(len: usize) -> u8 {
    let raw = usize::from(LENGTH_BASE) + len * 4;
    raw.min(usize::from(LENGTH_CAP)) as u8
}

pub fn length_ack(len: usize) -> u8 {
    len as u8 + LENGTH_ACK_BASE
}

pub fn decode_length(command: u8) -> Result<usize, FrameError> {
    if command < LENGTH_BASE || (command - LENGTH_BASE) % 4 != 0 {
        return Err(FrameError::Malformed(format!("bad length byte {command:#04x}")));
    }
    Ok(usize::from((command - LENGTH_BASE) / 4))
}

/// 8-bit unsigned sum of all data bytes
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// A memory read request: four address bytes and one length byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub address: u16,
    pub length: usize,
}

impl ReadRequest {
    pub fn encode(&self) -> [u8; 5] {
        let a = encode_address(self.address);
        [a[0], a[1], a[2], a[3], length_command(self.length)]
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let Ok(header) = <&[u8; 5]>::try_from(bytes) else {
            return Err(FrameError::Malformed(format!(
                "read request is {} bytes",
                bytes.len()
            )));
        };
        let address = decode_address(&[header[0], header[1], header[2], header[3]])?;
        let length = decode_length(header[4])?;
        Ok(Self { address, length })
    }
}

/// Data bytes followed by their checksum
pub fn encode_data_frame(data: &[u8]) -> Vec<u8> {
    let mut frame = data.to_vec();
    frame.push(checksum(data));
    frame
}

/// Verify the trailing checksum and return the data bytes
pub fn decode_data_frame(frame: &[u8]) -> Result<&[u8], FrameError> {
    let Some((&received, data)) = frame.split_last() else {
        return Err(FrameError::Malformed("empty data frame".into()));
    };
    let computed = checksum(data);
    if computed != received {
        return Err(FrameError::Checksum { computed, received });
    }
    Ok(data)
}

/// CRC-CCITT (poly 0x1021, init 0) as used by Davis consoles.
/// Running it over a packet including its big-endian CRC yields zero.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |mut crc, &b| {
        crc ^= u16::from(b) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
        crc
    })
}

/// Bounded retry settings for one logical read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Reset writes tried before the handshake is declared failed
    pub reset_polls: u32,
    /// Back-off unit; attempt `n` waits `n * backoff`
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            reset_polls: 100,
            backoff: Duration::from_millis(10),
        }
    }
}

/// WS2300 memory reader over a serial link
pub struct Ws2300Link<L> {
    link: L,
    policy: RetryPolicy,
}

impl<L: SerialLink> Ws2300Link<L> {
    pub fn new(link: L, policy: RetryPolicy) -> Self {
        Self { link, policy }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Write reset bytes until the station answers `0x02`
    pub fn reset(&mut self) -> Result<(), FrameError> {
        for poll in 0..self.policy.reset_polls {
            self.link.clear_input()?;
            self.link.write_all(&[RESET_BYTE])?;
            while let Some(b) = self.link.read_byte()? {
                if b == RESET_ACK {
                    return Ok(());
                }
            }
            sleep_blocking(self.policy.backoff * poll.min(10));
        }
        Err(FrameError::Handshake)
    }

    fn expect_ack(&mut self, expected: u8) -> Result<(), FrameError> {
        match self.link.read_byte()? {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => Err(FrameError::AckMismatch { expected, actual }),
            None => Err(FrameError::Timeout),
        }
    }

    fn read_once(&mut self, request: ReadRequest) -> Result<Vec<u8>, FrameError> {
        self.reset()?;
        for (sequence, command) in encode_address(request.address).into_iter().enumerate() {
            self.link.write_all(&[command])?;
            self.expect_ack(address_ack(sequence as u8, command))?;
        }
        self.link.write_all(&[length_command(request.length)])?;
        self.expect_ack(length_ack(request.length))?;

        let frame = self
            .link
            .read_exact_bytes(request.length + 1)?
            .ok_or(FrameError::Timeout)?;
        decode_data_frame(&frame).map(<[u8]>::to_vec)
    }

    /// Read `length` bytes at `address`, retrying whole transactions.
    ///
    /// Exhausting the attempts is an error; callers treat the value as
    /// unavailable rather than substituting a default.
    pub fn read(&mut self, address: u16, length: usize) -> Result<Vec<u8>, FrameError> {
        if length == 0 || length > MAX_READ_LEN {
            return Err(FrameError::Malformed(format!("read length {length}")));
        }
        let request = ReadRequest { address, length };
        for attempt in 1..=self.policy.max_attempts {
            match self.read_once(request) {
                Ok(data) => return Ok(data),
                Err(FrameError::Io(e)) => return Err(FrameError::Io(e)),
                Err(e) => {
                    debug!(address = format_args!("{address:#05x}"), attempt, error = %e, "ws2300 read failed");
                    sleep_blocking(self.policy.backoff * attempt.min(10));
                }
            }
        }
        warn!(
            address = format_args!("{address:#05x}"),
            attempts = self.policy.max_attempts,
            "ws2300 read gave up"
        );
        Err(FrameError::RetriesExhausted(self.policy.max_attempts))
    }
}
