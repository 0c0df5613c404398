//! The register-level transport contract and a Modbus framing adapter.
//!
//! The coordinator only ever speaks [`Transport`]: read a block of holding
//! registers, write one back. Whether that is a real gateway round trip or an
//! in-memory simulation is invisible to the core. [`ModbusLink`] is the
//! bundled implementation for real hardware, framing requests over any byte
//! stream that implements [`embedded_io::Read`] and [`embedded_io::Write`].

use embedded_io::Error as _;
use rmodbus::client::ModbusRequest;
use rmodbus::ModbusProto;
use thiserror::Error;

/// Blocking register-level access to the device.
pub trait Transport {
    type Error;

    /// Read `count` consecutive holding registers starting at `start`.
    fn read_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>, Self::Error>;

    /// Write consecutive holding registers starting at `start`.
    fn write_registers(&mut self, start: u16, words: &[u16]) -> Result<(), Self::Error>;
}

/// Errors of the bundled Modbus framing adapter.
#[derive(Error, Debug)]
pub enum LinkError<E> {
    #[error("serial communication error")]
    Io(E),
    #[error("modbus protocol error: {0}")]
    Protocol(rmodbus::ErrorKind),
    #[error("response exceeds the link buffer")]
    BufferOverflow,
    #[error("invalid response received")]
    InvalidResponse,
}

impl<E> From<rmodbus::ErrorKind> for LinkError<E> {
    fn from(err: rmodbus::ErrorKind) -> Self {
        LinkError::Protocol(err)
    }
}

/// Modbus client over a raw byte interface.
///
/// `L` bounds the frame buffer; the default fits a full 125-register read.
/// The unit id defaults to 1 on the Venus.
pub struct ModbusLink<S: embedded_io::Read + embedded_io::Write, const L: usize = 256> {
    interface: S,
    unit_id: u8,
    proto: ModbusProto,
}

impl<S: embedded_io::Read + embedded_io::Write, const L: usize> ModbusLink<S, L> {
    /// RTU framing, for RS485 links.
    pub fn rtu(interface: S, unit_id: u8) -> Self {
        Self {
            interface,
            unit_id,
            proto: ModbusProto::Rtu,
        }
    }

    /// TCP framing, for the network gateway.
    pub fn tcp(interface: S, unit_id: u8) -> Self {
        Self {
            interface,
            unit_id,
            proto: ModbusProto::TcpUdp,
        }
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    /// Accumulate response bytes until the expected frame length arrives or
    /// the interface runs dry.
    fn collect(&mut self, expected: usize) -> Result<heapless::Vec<u8, L>, LinkError<S::Error>> {
        let mut buf: heapless::Vec<u8, L> = heapless::Vec::new();
        let mut chunk = [0u8; 32];
        loop {
            match self.interface.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if buf.extend_from_slice(&chunk[..n]).is_err() {
                        return Err(LinkError::BufferOverflow);
                    }
                    if buf.len() >= expected {
                        break;
                    }
                }
                Err(e) => {
                    // A would-block or timeout after some data means the
                    // device is done talking; anything else is a real fault.
                    let kind = e.kind();
                    if matches!(
                        kind,
                        embedded_io::ErrorKind::Other | embedded_io::ErrorKind::TimedOut
                    ) && !buf.is_empty()
                    {
                        break;
                    }
                    return Err(LinkError::Io(e));
                }
            }
        }
        Ok(buf)
    }

    fn read_response_len(&self, count: u16) -> usize {
        match self.proto {
            ModbusProto::Rtu => 5 + 2 * count as usize,
            _ => 9 + 2 * count as usize,
        }
    }

    fn write_response_len(&self) -> usize {
        match self.proto {
            ModbusProto::Rtu => 8,
            _ => 12,
        }
    }
}

impl<S: embedded_io::Read + embedded_io::Write, const L: usize> Transport for ModbusLink<S, L> {
    type Error = LinkError<S::Error>;

    fn read_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>, Self::Error> {
        let mut request: heapless::Vec<u8, L> = heapless::Vec::new();
        let mut req = ModbusRequest::new(self.unit_id, self.proto);
        req.generate_get_holdings(start, count, &mut request)?;
        self.interface
            .write_all(&request)
            .map_err(LinkError::Io)?;

        let response = self.collect(self.read_response_len(count))?;
        let mut data: heapless::Vec<u16, 125> = heapless::Vec::new();
        req.parse_u16(&response, &mut data)?;
        if data.len() < count as usize {
            return Err(LinkError::InvalidResponse);
        }
        Ok(data[..count as usize].to_vec())
    }

    fn write_registers(&mut self, start: u16, words: &[u16]) -> Result<(), Self::Error> {
        let mut request: heapless::Vec<u8, L> = heapless::Vec::new();
        let mut req = ModbusRequest::new(self.unit_id, self.proto);
        match words {
            [] => return Err(LinkError::InvalidResponse),
            [single] => req.generate_set_holding(start, *single, &mut request)?,
            _ => req.generate_set_holdings_bulk(start, words, &mut request)?,
        }
        self.interface
            .write_all(&request)
            .map_err(LinkError::Io)?;

        let response = self.collect(self.write_response_len())?;
        req.parse_ok(&response)?;
        Ok(())
    }
}
