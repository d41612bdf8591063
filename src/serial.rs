//! Serial line access. The port is opened exclusively and handed to the
//! transport, which is its sole owner from then on.

use anyhow::{anyhow, Result};
use std::time::Duration;

/// Read timeout on the raw port. This paces the transport's receive loop;
/// the per-request deadline lives in the transport itself.
const PORT_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Open a serial port at 8N1 with the requested baud rate, enabling exclusive
/// access on Unix systems.
pub fn open_serial_port(port: &str, baud_rate: u32) -> Result<Box<dyn serialport::SerialPort>> {
    let builder = serialport::new(port, baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .timeout(PORT_READ_TIMEOUT);

    #[cfg(unix)]
    {
        let mut handle = builder
            .open_native()
            .map_err(|err| anyhow!("Failed to open port {port}: {err}"))?;
        handle
            .set_exclusive(true)
            .map_err(|err| anyhow!("Failed to acquire exclusive access to {port}: {err}"))?;
        Ok(Box::new(handle))
    }

    #[cfg(not(unix))]
    {
        builder
            .open()
            .map_err(|err| anyhow!("Failed to open port {port}: {err}"))
    }
}

/// Return a sorted list of available ports as (port_name, port_type_string).
pub fn enumerate_ports() -> Vec<(String, String)> {
    let mut ports = serialport::available_ports().unwrap_or_default();
    ports.sort_by_key(|p| p.port_name.clone());
    ports
        .into_iter()
        .map(|p| (p.port_name.clone(), format!("{:?}", p.port_type)))
        .collect()
}
