use anyhow::Context;
use std::time::Duration;

/// Opens and closes a serial port at a given baud rate. At 1200 baud this
/// resets SAM/SAMD boards into their bootloader.
pub trait SerialTouch: Send + Sync {
    fn touch(&self, port: &str, baud: u32) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct SerialPortTouch;

impl SerialTouch for SerialPortTouch {
    fn touch(&self, port: &str, baud: u32) -> anyhow::Result<()> {
        let handle = serialport::new(port, baud)
            .timeout(Duration::from_millis(500))
            .open()
            .with_context(|| format!("Failed to open serial port {} at {} baud", port, baud))?;
        drop(handle);
        Ok(())
    }
}

/// Serial ports currently visible to the host.
pub fn available_ports() -> anyhow::Result<Vec<String>> {
    let ports = serialport::available_ports().context("Failed to enumerate serial ports")?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
