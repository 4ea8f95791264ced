//! Present a FlashForge-family printer, which speaks its own line protocol over raw USB bulk
//! endpoints, as an ordinary serial G-code device.
//!
//! Open a [`Connection`], then drive it with [`Connection::write`] and [`Connection::readline`]
//! exactly as a serial port. Commands are rewritten into the printer's dialect on the way out,
//! responses are rewritten into what a serial host expects on the way in, and a keep-alive task
//! polls the printer in the background.

pub mod config;
mod connection;
pub mod decode;
mod error;
pub mod gcode;
pub mod host;
pub mod keepalive;
pub mod position;
pub mod profile;
pub mod response;
pub mod session;
pub mod state;
pub mod translate;
pub mod transport;
pub mod upload;

#[cfg(test)]
mod mock;

pub use config::ConnectionConfig;
pub use connection::{Connection, Exclusive};
pub use error::{permission_hint, Error, Result};
pub use host::{HostCallbacks, NullHost};
pub use position::PositionModel;
pub use profile::{PrinterProfile, Quirk, Quirks};
pub use state::PrinterState;
pub use transport::{BulkTransport, Channel, DeviceLocator, UsbTransport};
pub use upload::{UploadHandle, UploadSession};
