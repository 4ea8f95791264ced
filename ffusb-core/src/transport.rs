//! USB bulk access and the raw read/write primitives built on it.

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rusb::{Context, Device, DeviceHandle, TransferType, UsbContext};

use crate::{
    error::{permission_hint, Error, Result},
    profile::{self, PrinterProfile},
    response,
};

/// Interface carrying the printer's command and transfer endpoints
pub const INTERFACE: u8 = 0;

/// Size of a single bulk read
const READ_CHUNK: usize = 512;

/// Which endpoint pair a transfer uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Command,
    Transfer,
}

/// Blocking bulk transfers against a device
pub trait BulkTransport: Send + Sync {
    /// Returns the number of bytes accepted by the device
    fn write(&self, channel: Channel, data: &[u8], timeout: Duration) -> Result<usize>;

    /// Returns zero when nothing arrived within `timeout`
    fn read(&self, channel: Channel, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Release the device, later calls fail with [`Error::Disconnected`]
    fn close(&self) -> Result<()>;
}

/// Resolved endpoint addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub command_in: u8,
    pub command_out: u8,
    pub transfer_in: u8,
    pub transfer_out: u8,
}

impl Endpoints {
    /// Assign bulk endpoint addresses, given in discovery order
    ///
    /// The first in/out pair carries commands, a second pair carries file transfers. Without a
    /// second pair transfers share the command endpoints.
    pub fn assign(addresses: impl IntoIterator<Item = u8>) -> Option<Self> {
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        for address in addresses {
            let list = if address & 0x80 != 0 {
                &mut inputs
            } else {
                &mut outputs
            };
            if !list.contains(&address) {
                list.push(address);
            }
        }
        let (&command_in, &command_out) = (inputs.first()?, outputs.first()?);
        let (transfer_in, transfer_out) = match (inputs.get(1), outputs.get(1)) {
            (Some(&transfer_in), Some(&transfer_out)) => (transfer_in, transfer_out),
            _ => (command_in, command_out),
        };
        Some(Self {
            command_in,
            command_out,
            transfer_in,
            transfer_out,
        })
    }

    pub fn input(&self, channel: Channel) -> u8 {
        match channel {
            Channel::Command => self.command_in,
            Channel::Transfer => self.transfer_in,
        }
    }

    pub fn output(&self, channel: Channel) -> u8 {
        match channel {
            Channel::Command => self.command_out,
            Channel::Transfer => self.transfer_out,
        }
    }
}

/// Which attached device to open
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DeviceLocator {
    /// First device in the identity table
    #[default]
    Auto,
    Id { vendor_id: u16, product_id: u16 },
    Bus { bus: u8, address: u8 },
}

impl DeviceLocator {
    pub fn matches(&self, vendor_id: u16, product_id: u16, bus: u8, address: u8) -> bool {
        match *self {
            DeviceLocator::Auto => profile::find(vendor_id, product_id).is_some(),
            DeviceLocator::Id {
                vendor_id: vid,
                product_id: pid,
            } => vendor_id == vid && product_id == pid,
            DeviceLocator::Bus {
                bus: wanted_bus,
                address: wanted_address,
            } => bus == wanted_bus && address == wanted_address,
        }
    }
}

fn bulk_endpoints<T: UsbContext>(device: &Device<T>) -> Vec<u8> {
    let mut found = Vec::new();
    let Ok(descriptor) = device.device_descriptor() else {
        return found;
    };
    for index in 0..descriptor.num_configurations() {
        let Ok(config) = device.config_descriptor(index) else {
            continue;
        };
        for interface in config.interfaces() {
            for setting in interface.descriptors() {
                for endpoint in setting.endpoint_descriptors() {
                    if endpoint.transfer_type() == TransferType::Bulk {
                        tracing::debug!(
                            "Found bulk endpoint {:#04x} ({:?}) on interface {}",
                            endpoint.address(),
                            endpoint.direction(),
                            setting.interface_number()
                        );
                        found.push(endpoint.address());
                    }
                }
            }
        }
    }
    found
}

fn claim_error(error: rusb::Error, vendor_id: u16, product_id: u16) -> Error {
    match error {
        rusb::Error::Access => Error::PermissionDenied(permission_hint(vendor_id, product_id)),
        rusb::Error::Busy => Error::DeviceBusy,
        other => Error::Transport(other),
    }
}

/// A printer opened through libusb
pub struct UsbTransport {
    handle: RwLock<Option<DeviceHandle<Context>>>,
    endpoints: Endpoints,
}

impl std::fmt::Debug for UsbTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbTransport")
            .field("open", &self.handle.read().is_some())
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

impl UsbTransport {
    /// Find, open and claim a printer
    #[tracing::instrument(level = "debug")]
    pub fn open(locator: DeviceLocator) -> Result<(Self, PrinterProfile)> {
        let context = Context::new()?;
        let device = context
            .devices()?
            .iter()
            .find(|device| {
                device.device_descriptor().is_ok_and(|descriptor| {
                    locator.matches(
                        descriptor.vendor_id(),
                        descriptor.product_id(),
                        device.bus_number(),
                        device.address(),
                    )
                })
            })
            .ok_or(Error::NoDeviceFound)?;
        let descriptor = device.device_descriptor()?;
        let (vendor_id, product_id) = (descriptor.vendor_id(), descriptor.product_id());
        let profile = profile::lookup(vendor_id, product_id);

        let handle = device
            .open()
            .map_err(|e| claim_error(e, vendor_id, product_id))?;
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            tracing::debug!("Kernel driver auto-detach unavailable: {e}");
        }
        handle
            .claim_interface(INTERFACE)
            .map_err(|e| claim_error(e, vendor_id, product_id))?;

        let Some(endpoints) = Endpoints::assign(bulk_endpoints(&device)) else {
            if let Err(e) = handle.release_interface(INTERFACE) {
                tracing::warn!("Failed to release interface after endpoint discovery: {e}");
            }
            return Err(Error::NoUsableEndpoint);
        };
        tracing::info!("Opened {profile} with endpoints {endpoints:x?}");
        Ok((
            Self {
                handle: RwLock::new(Some(handle)),
                endpoints,
            },
            profile,
        ))
    }

    pub fn endpoints(&self) -> Endpoints {
        self.endpoints
    }
}

impl BulkTransport for UsbTransport {
    fn write(&self, channel: Channel, data: &[u8], timeout: Duration) -> Result<usize> {
        let handle = self.handle.read();
        let handle = handle.as_ref().ok_or(Error::Disconnected)?;
        Ok(handle.write_bulk(self.endpoints.output(channel), data, timeout)?)
    }

    fn read(&self, channel: Channel, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let handle = self.handle.read();
        let handle = handle.as_ref().ok_or(Error::Disconnected)?;
        match handle.read_bulk(self.endpoints.input(channel), buf, timeout) {
            Err(rusb::Error::Timeout) => Ok(0),
            other => Ok(other?),
        }
    }

    fn close(&self) -> Result<()> {
        let Some(handle) = self.handle.write().take() else {
            return Ok(());
        };
        handle.release_interface(INTERFACE)?;
        Ok(())
    }
}

/// Write `data` in one bulk transfer, returning how much the device accepted
pub fn raw_write(
    transport: &dyn BulkTransport,
    channel: Channel,
    data: &[u8],
    timeout: Duration,
) -> Result<usize> {
    let written = transport.write(channel, data, timeout)?;
    if written < data.len() {
        tracing::warn!("Short write: {written} of {} bytes accepted", data.len());
    }
    Ok(written)
}

/// Read until the output ends with the terminator and `complete` agrees, or `timeout` elapses
///
/// Hitting the timeout is not an error, whatever arrived so far is returned.
pub fn raw_read(
    transport: &dyn BulkTransport,
    channel: Channel,
    timeout: Duration,
    mut complete: impl FnMut(&str) -> bool,
) -> Result<String> {
    let deadline = Instant::now() + timeout;
    let mut data = Vec::new();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            if !data.is_empty() {
                tracing::debug!("Read timed out with {} bytes of partial output", data.len());
            }
            break;
        }
        let count = transport.read(channel, &mut buf, remaining)?;
        if count == 0 {
            continue;
        }
        data.extend_from_slice(&buf[..count]);
        let text = String::from_utf8_lossy(&data);
        if response::ends_with_terminator(&text) && complete(&text) {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data).into_owned();
    if !text.is_empty() {
        tracing::debug!("Received `{}` from printer", text.trim());
    }
    Ok(text)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock::MockTransport;

    #[test]
    fn claim_failures_are_explained() {
        match claim_error(rusb::Error::Access, 0x2b71, 0x00ff) {
            Error::PermissionDenied(hint) => {
                assert!(hint.contains("2b71:00ff"));
                assert!(hint.contains("udev"));
            }
            other => panic!("expected PermissionDenied, got {other:?}"),
        }
        assert!(matches!(
            claim_error(rusb::Error::Busy, 0x2b71, 0x00ff),
            Error::DeviceBusy
        ));
        assert!(matches!(
            claim_error(rusb::Error::Pipe, 0x2b71, 0x00ff),
            Error::Transport(rusb::Error::Pipe)
        ));
    }

    #[test]
    fn single_pair_is_shared() {
        let endpoints = Endpoints::assign([0x81, 0x01]).unwrap();
        assert_eq!(
            endpoints,
            Endpoints {
                command_in: 0x81,
                command_out: 0x01,
                transfer_in: 0x81,
                transfer_out: 0x01,
            }
        );
    }

    #[test]
    fn second_pair_carries_transfers() {
        let endpoints = Endpoints::assign([0x01, 0x81, 0x83, 0x03, 0x81]).unwrap();
        assert_eq!(endpoints.input(Channel::Command), 0x81);
        assert_eq!(endpoints.output(Channel::Command), 0x01);
        assert_eq!(endpoints.input(Channel::Transfer), 0x83);
        assert_eq!(endpoints.output(Channel::Transfer), 0x03);
    }

    #[test]
    fn one_direction_is_unusable() {
        assert!(Endpoints::assign([0x81, 0x82]).is_none());
        assert!(Endpoints::assign([]).is_none());
    }

    #[test]
    fn locators() {
        assert!(DeviceLocator::Auto.matches(0x2b71, 0x00ff, 1, 4));
        assert!(!DeviceLocator::Auto.matches(0x046d, 0xc077, 1, 4));
        let id = DeviceLocator::Id {
            vendor_id: 0x2b71,
            product_id: 0x7777,
        };
        assert!(id.matches(0x2b71, 0x7777, 3, 9));
        let bus = DeviceLocator::Bus { bus: 3, address: 9 };
        assert!(bus.matches(0x1234, 0x5678, 3, 9));
        assert!(!bus.matches(0x2b71, 0x00ff, 3, 8));
    }

    #[test]
    fn read_stops_at_terminator() {
        let mock = MockTransport::new();
        mock.reply("CMD M105 Received.\r\nT0:20 /0");
        mock.reply(" B:19 /0\r\nok\r\n");
        mock.reply("CMD M119 Received.\r\nok\r\n");
        let text = raw_read(&mock, Channel::Command, Duration::from_secs(1), |_| true).unwrap();
        assert_eq!(text, "CMD M105 Received.\r\nT0:20 /0 B:19 /0\r\nok\r\n");
    }

    #[test]
    fn read_timeout_is_empty() {
        let mock = MockTransport::new();
        let text = raw_read(&mock, Channel::Command, Duration::from_millis(20), |_| true).unwrap();
        assert!(text.is_empty());
    }

    #[test]
    fn read_waits_for_predicate() {
        let mock = MockTransport::new();
        mock.reply("CMD M119 Received.\r\nok\r\n");
        mock.reply("CMD M27 Received.\r\nok\r\n");
        let text = raw_read(&mock, Channel::Command, Duration::from_secs(1), |text| {
            text.contains("CMD M27 ")
        })
        .unwrap();
        assert!(text.ends_with("CMD M27 Received.\r\nok\r\n"));
    }

    #[test]
    fn closed_transport_refuses_io() {
        let mock = MockTransport::new();
        mock.close().unwrap();
        assert!(matches!(
            raw_write(&mock, Channel::Command, b"~M119\r\n", Duration::from_secs(1)),
            Err(Error::Disconnected)
        ));
    }
}
