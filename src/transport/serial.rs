//! Serial Transportation.
use std::{
    io::{self, Read, Write},
    thread::sleep,
    time::Duration,
};

use serialport::{ClearBuffer, SerialPort};

use super::Transport;
use crate::constants::Layout;
use crate::error::{Error, Result};

/// USB CDC link to the programmer. The port is closed on drop.
pub struct SerialTransport {
    serial_port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    pub fn open(port: &str, baudrate: u32, timeout: Duration, settle: Duration) -> Result<Self> {
        log::info!("Opening serial port: \"{}\" @ {} baud", port, baudrate);
        let serial_port = serialport::new(port, baudrate).timeout(timeout).open()?;
        // the programmer drops bytes sent right after enumeration
        sleep(settle);
        Ok(SerialTransport { serial_port })
    }

    pub fn open_with(port: &str, layout: &Layout) -> Result<Self> {
        Self::open(
            port,
            layout.baudrate,
            layout.read_timeout,
            layout.settle_delay,
        )
    }

    pub fn open_nth(nth: usize, layout: &Layout) -> Result<Self> {
        let ports = serialport::available_ports()?;

        match ports.get(nth) {
            Some(port) => Self::open_with(&port.port_name, layout),
            None => Err(Error::Serial(serialport::Error::new(
                serialport::ErrorKind::NoDevice,
                "No serial ports found!",
            ))),
        }
    }

    pub fn open_any(layout: &Layout) -> Result<Self> {
        Self::open_nth(0, layout)
    }
}

impl Transport for SerialTransport {
    fn clear_input(&mut self) -> io::Result<()> {
        self.serial_port.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn send_raw(&mut self, raw: &[u8]) -> io::Result<()> {
        self.serial_port.write_all(raw)?;
        self.serial_port.flush()
    }

    fn recv_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.serial_port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}
