//! Blocking serial transport shared by the binary and ASCII protocols
//!
//! All reads are bounded by the link's read timeout, so a transaction never
//! blocks indefinitely. Async drivers run transactions inside
//! `tokio::task::spawn_blocking`.

use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};
use tracing::trace;

/// Byte-level serial link
pub trait SerialLink: Send {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read one byte; `None` when nothing arrived within the read timeout
    fn read_byte(&mut self) -> io::Result<Option<u8>>;

    /// Discard anything waiting in the input buffer
    fn clear_input(&mut self) -> io::Result<()>;

    /// Read exactly `n` bytes, `None` if the link goes quiet first
    fn read_exact_bytes(&mut self, n: usize) -> io::Result<Option<Vec<u8>>> {
        let mut buf = Vec::with_capacity(n);
        while buf.len() < n {
            match self.read_byte()? {
                Some(b) => buf.push(b),
                None => return Ok(None),
            }
        }
        Ok(Some(buf))
    }

    /// Read a line terminated by LF, with CR stripped.
    /// Returns `None` if the link times out before any byte arrives;
    /// a partial line is returned as-is when the timeout hits mid-line.
    fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut buf = Vec::new();
        loop {
            match self.read_byte()? {
                Some(b'\n') => break,
                Some(b'\r') => {}
                Some(b) => buf.push(b),
                None if buf.is_empty() => return Ok(None),
                None => break,
            }
        }
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }
}

/// Serial port opened through the `serialport` crate
pub struct SerialPortLink {
    name: String,
    port: Box<dyn SerialPort>,
}

impl SerialPortLink {
    /// Open `port_name` at `baud_rate`, 8N1, with a per-read timeout
    pub fn open(port_name: &str, baud_rate: u32, read_timeout: Duration) -> io::Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(read_timeout)
            .open()
            .map_err(io::Error::from)?;
        Ok(Self {
            name: port_name.to_string(),
            port,
        })
    }

    /// Drive the modem control lines (WS2300 interfaces are powered from them)
    pub fn set_control_lines(&mut self, dtr: bool, rts: bool) -> io::Result<()> {
        self.port
            .write_data_terminal_ready(dtr)
            .map_err(io::Error::from)?;
        self.port.write_request_to_send(rts).map_err(io::Error::from)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl SerialLink for SerialPortLink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        trace!(port = %self.name, bytes = ?bytes, "serial write");
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(1) => Ok(Some(buf[0])),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port
            .clear(ClearBuffer::Input)
            .map_err(io::Error::from)
    }
}


#[cfg(test)]
pub(crate) use scripted::ScriptedLink;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_line_strips_crlf() {
        let mut link = ScriptedLink::silent();
        link.push_input(b"rdlg,1,2\r\nOK\r\n");
        assert_eq!(link.read_line().unwrap().as_deref(), Some("rdlg,1,2"));
        assert_eq!(link.read_line().unwrap().as_deref(), Some("OK"));
        assert_eq!(link.read_line().unwrap(), None);
    }

    #[test]
    fn test_partial_line_on_timeout() {
        let mut link = ScriptedLink::silent();
        link.push_input(b"partial");
        assert_eq!(link.read_line().unwrap().as_deref(), Some("partial"));
    }

    #[test]
    fn test_responder_feeds_input() {
        let mut link = ScriptedLink::new(|req| req.iter().map(|b| b + 1).collect());
        link.write_all(&[1, 2]).unwrap();
        assert_eq!(link.read_exact_bytes(2).unwrap(), Some(vec![2, 3]));
        assert_eq!(link.read_exact_bytes(1).unwrap(), None);
        assert_eq!(link.written(), &[1, 2]);
    }
}
