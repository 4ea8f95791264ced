#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No FlashForge printer found")]
    NoDeviceFound,

    #[error("Permission denied opening printer\n{0}")]
    PermissionDenied(String),

    #[error("Unable to claim printer interface, it may already be in use by another program")]
    DeviceBusy,

    #[error("Printer exposes no usable bulk in/out endpoint pair")]
    NoUsableEndpoint,

    #[error("USB error: {0}")]
    Transport(#[from] rusb::Error),

    #[error("Printer is not ready, refusing to start upload")]
    PrinterBusy,

    #[error("Printer could not create file `{0}`")]
    CouldNotCreateFile(String),

    #[error("File transfer interrupted after {sent} of {total} bytes")]
    TransferInterrupted { sent: u64, total: u64 },

    #[error("Local file ended after {sent} of {total} bytes")]
    UnexpectedEof { sent: u64, total: u64 },

    #[error("Printer did not confirm the end of the file transfer")]
    TransferIncomplete,

    #[error("Couldn't read local file\nError message: {0}")]
    DiskRead(#[source] std::io::Error),

    #[error("Upload worker stopped before reporting a result")]
    UploadAborted,

    #[error("Underlying printer connection was closed")]
    Disconnected,

    #[error("Background tasks need a running tokio runtime")]
    NoRuntime,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Remediation text shown when the OS refuses access to the device node.
pub fn permission_hint(vendor_id: u16, product_id: u16) -> String {
    format!(
        "The current user may not access USB device {vendor_id:04x}:{product_id:04x}.\n\
         On Linux, add a udev rule such as\n\
         \tSUBSYSTEM==\"usb\", ATTR{{idVendor}}==\"{vendor_id:04x}\", ATTR{{idProduct}}==\"{product_id:04x}\", MODE=\"0666\"\n\
         to /etc/udev/rules.d/99-flashforge.rules, run `udevadm control --reload-rules`, then unplug and replug the printer.\n\
         On Windows, bind the printer to the WinUSB driver (for example with Zadig)."
    )
}
