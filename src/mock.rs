//! Test doubles: a register-level mock device for coordinator tests and a
//! byte-level mock serial port for the framing adapter.

use std::collections::{BTreeMap, HashMap};

use crate::transport::Transport;

/// Transport error produced on demand by [`MockDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptedFailure;

/// An in-memory register space with scripted failures and a request log.
pub struct MockDevice {
    pub space: BTreeMap<u16, u16>,
    /// Fail this many upcoming reads regardless of address.
    fail_all_reads: u32,
    /// Fail upcoming reads whose start address matches the key.
    addressed_failures: HashMap<u16, u32>,
    fail_writes: u32,
    pub reads: Vec<(u16, u16)>,
    pub writes: Vec<(u16, Vec<u16>)>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            space: BTreeMap::new(),
            fail_all_reads: 0,
            addressed_failures: HashMap::new(),
            fail_writes: 0,
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }

    pub fn set(&mut self, address: u16, word: u16) {
        self.space.insert(address, word);
    }

    pub fn set_u32(&mut self, address: u16, value: u32) {
        self.set(address, (value >> 16) as u16);
        self.set(address + 1, value as u16);
    }

    pub fn set_i32(&mut self, address: u16, value: i32) {
        self.set_u32(address, value as u32);
    }

    /// Pack a string two bytes per word across `words` registers, NUL padded.
    pub fn set_ascii(&mut self, address: u16, text: &str, words: u16) {
        let bytes = text.as_bytes();
        for i in 0..words {
            let hi = bytes.get(i as usize * 2).copied().unwrap_or(0);
            let lo = bytes.get(i as usize * 2 + 1).copied().unwrap_or(0);
            self.set(address + i, u16::from_be_bytes([hi, lo]));
        }
    }

    pub fn fail_next_reads(&mut self, n: u32) {
        self.fail_all_reads = n;
    }

    pub fn fail_reads_at(&mut self, start: u16, n: u32) {
        self.addressed_failures.insert(start, n);
    }

    pub fn fail_next_writes(&mut self, n: u32) {
        self.fail_writes = n;
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockDevice {
    type Error = ScriptedFailure;

    fn read_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>, ScriptedFailure> {
        self.reads.push((start, count));
        if self.fail_all_reads > 0 {
            self.fail_all_reads -= 1;
            return Err(ScriptedFailure);
        }
        if let Some(n) = self.addressed_failures.get_mut(&start) {
            if *n > 0 {
                *n -= 1;
                return Err(ScriptedFailure);
            }
        }
        Ok((start..start + count)
            .map(|a| self.space.get(&a).copied().unwrap_or(0))
            .collect())
    }

    fn write_registers(&mut self, start: u16, words: &[u16]) -> Result<(), ScriptedFailure> {
        self.writes.push((start, words.to_vec()));
        if self.fail_writes > 0 {
            self.fail_writes -= 1;
            return Err(ScriptedFailure);
        }
        for (i, &w) in words.iter().enumerate() {
            self.space.insert(start + i as u16, w);
        }
        Ok(())
    }
}

/// Byte-level serial double with canned responses and error injection, for
/// exercising the framing adapter.
pub struct MockSerial {
    written: Vec<u8>,
    canned: Vec<u8>,
    position: usize,
    error_on_read: bool,
    error_on_write: bool,
}

#[derive(Debug)]
pub enum MockSerialError {
    Simulated,
    WouldBlock,
}

impl core::fmt::Display for MockSerialError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MockSerialError::Simulated => write!(f, "simulated serial error"),
            MockSerialError::WouldBlock => write!(f, "would block"),
        }
    }
}

impl core::error::Error for MockSerialError {}

impl embedded_io::Error for MockSerialError {
    fn kind(&self) -> embedded_io::ErrorKind {
        embedded_io::ErrorKind::Other
    }
}

impl embedded_io::ErrorType for MockSerial {
    type Error = MockSerialError;
}

impl embedded_io::Write for MockSerial {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if self.error_on_write {
            return Err(MockSerialError::Simulated);
        }
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl embedded_io::Read for MockSerial {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if self.error_on_read {
            return Err(MockSerialError::Simulated);
        }
        if self.position >= self.canned.len() {
            return Err(MockSerialError::WouldBlock);
        }
        let n = buf.len().min(self.canned.len() - self.position);
        buf[..n].copy_from_slice(&self.canned[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}

impl MockSerial {
    pub fn new() -> Self {
        Self {
            written: Vec::new(),
            canned: Vec::new(),
            position: 0,
            error_on_read: false,
            error_on_write: false,
        }
    }

    pub fn set_read_data(&mut self, data: &[u8]) {
        self.canned = data.to_vec();
        self.position = 0;
    }

    pub fn written_data(&self) -> &[u8] {
        &self.written
    }

    pub fn set_read_error(&mut self, fail: bool) {
        self.error_on_read = fail;
    }

    pub fn set_write_error(&mut self, fail: bool) {
        self.error_on_write = fail;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_io::{Read, Write};

    #[test]
    fn device_reads_window_with_holes_as_zero() {
        let mut device = MockDevice::new();
        device.set(100, 7);
        device.set(102, 9);
        assert_eq!(device.read_registers(100, 3).unwrap(), vec![7, 0, 9]);
        assert_eq!(device.reads, vec![(100, 3)]);
    }

    #[test]
    fn device_scripted_failures_run_out() {
        let mut device = MockDevice::new();
        device.set(100, 7);
        device.fail_reads_at(100, 2);
        assert!(device.read_registers(100, 1).is_err());
        assert!(device.read_registers(100, 1).is_err());
        assert_eq!(device.read_registers(100, 1).unwrap(), vec![7]);
        // Other addresses are unaffected throughout.
        assert!(device.read_registers(200, 1).is_ok());
    }

    #[test]
    fn device_applies_writes() {
        let mut device = MockDevice::new();
        device.write_registers(300, &[1, 2]).unwrap();
        assert_eq!(device.space.get(&300), Some(&1));
        assert_eq!(device.space.get(&301), Some(&2));
        assert_eq!(device.writes, vec![(300, vec![1, 2])]);
    }

    #[test]
    fn serial_captures_writes_and_drains_reads() {
        let mut serial = MockSerial::new();
        serial.write(b"abc").unwrap();
        assert_eq!(serial.written_data(), b"abc");

        serial.set_read_data(b"xy");
        let mut buf = [0u8; 8];
        assert_eq!(serial.read(&mut buf).unwrap(), 2);
        assert!(matches!(
            serial.read(&mut buf),
            Err(MockSerialError::WouldBlock)
        ));
    }
}
