//! Serial port link
//!
//! Opens a USB CDC or UART port at 8N1 without flow control. RTS is asserted
//! for radio bridges and DTR can be pulsed after opening to wake boards that
//! gate their UART on it.

use super::{LinkReceiver, StreamLink};
use crate::config::SerialConfig;
use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialPortType};

/// Manufacturer prefix of the USB CDC stack used by the controllers
const VESC_MANUFACTURER: &str = "STMicroelectronics";

/// A port found during enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialPortCandidate {
    /// Display name, prefixed with `VESC - ` for likely controllers
    pub name: String,
    /// Path or name passed to open
    pub system_path: String,
    pub is_vesc: bool,
}

/// List serial ports, likely controllers first
pub fn list_serial_ports() -> Vec<SerialPortCandidate> {
    let ports = match tokio_serial::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            tracing::warn!("Failed to enumerate serial ports: {}", e);
            return Vec::new();
        }
    };

    rank_ports(
        ports
            .into_iter()
            .map(|port| {
                let manufacturer = match &port.port_type {
                    SerialPortType::UsbPort(usb) => usb.manufacturer.clone(),
                    _ => None,
                };
                (port.port_name, manufacturer)
            })
            .collect(),
    )
}

/// Order `(path, manufacturer)` pairs with controller ports first
fn rank_ports(ports: Vec<(String, Option<String>)>) -> Vec<SerialPortCandidate> {
    let mut candidates: Vec<SerialPortCandidate> = ports
        .into_iter()
        .map(|(path, manufacturer)| {
            let is_vesc = manufacturer
                .as_deref()
                .is_some_and(|m| m.starts_with(VESC_MANUFACTURER));
            let short = path.rsplit('/').next().unwrap_or(&path).to_string();
            SerialPortCandidate {
                name: if is_vesc {
                    format!("VESC - {}", short)
                } else {
                    short
                },
                system_path: path,
                is_vesc,
            }
        })
        .collect();
    // stable: enumeration order is kept within each group
    candidates.sort_by_key(|c| !c.is_vesc);
    candidates
}

/// Fail early on device nodes the user cannot write
#[cfg(unix)]
fn check_writable(port: &str) -> Result<(), TransportError> {
    let path = std::path::Path::new(port);
    if !path.exists() {
        return Err(TransportError::InvalidEndpoint(format!(
            "Invalid serial port: {}",
            port
        )));
    }
    match std::fs::OpenOptions::new().write(true).open(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(TransportError::PortNotWritable(port.to_string()))
        }
        // let the real open report anything else
        Err(_) => Ok(()),
    }
}

#[cfg(not(unix))]
fn check_writable(_port: &str) -> Result<(), TransportError> {
    Ok(())
}

/// Open `port` at `baud_rate`
pub async fn open(
    port: &str,
    baud_rate: u32,
    config: &SerialConfig,
) -> Result<(StreamLink, LinkReceiver), TransportError> {
    check_writable(port)?;

    let mut stream = tokio_serial::new(port, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| match e.kind {
            tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                TransportError::PortNotWritable(port.to_string())
            }
            tokio_serial::ErrorKind::NoDevice => {
                TransportError::InvalidEndpoint(format!("Invalid serial port: {}", port))
            }
            _ => TransportError::Open {
                endpoint: port.to_string(),
                reason: e.description,
            },
        })?;

    // radio bridges listen on RTS
    if let Err(e) = stream.write_request_to_send(true) {
        tracing::debug!("Failed to assert RTS on {}: {}", port, e);
    }

    if config.pulse_dtr {
        let _ = stream.write_data_terminal_ready(true);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _ = stream.write_data_terminal_ready(false);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    tracing::info!("Serial port {} open at {} baud", port, baud_rate);
    Ok(StreamLink::spawn(stream, Vec::new()))
}
