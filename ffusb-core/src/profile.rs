use core::fmt;

pub const FLASHFORGE_VENDOR_ID: u16 = 0x2b71;

/// Firmware quirks known for specific printer models
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Quirk {
    /// `G91` is ignored, relative moves must be emulated
    NoRelativePositioning,
    /// `G28 X Y` only homes the first axis
    NoCombinedHoming,
    /// `M132` (load axis offsets) hangs the command queue
    NoM132,
}

impl Quirk {
    const ALL: [Quirk; 3] = [
        Quirk::NoRelativePositioning,
        Quirk::NoCombinedHoming,
        Quirk::NoM132,
    ];

    const fn bit(self) -> u8 {
        match self {
            Quirk::NoRelativePositioning => 1 << 0,
            Quirk::NoCombinedHoming => 1 << 1,
            Quirk::NoM132 => 1 << 2,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Quirk::NoRelativePositioning => "NO_RELATIVE_POSITIONING",
            Quirk::NoCombinedHoming => "NO_COMBINED_HOMING",
            Quirk::NoM132 => "NO_M132",
        }
    }
}

impl AsRef<str> for Quirk {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// Set of quirks a printer model is flagged with
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quirks(u8);

impl Quirks {
    pub const NONE: Quirks = Quirks(0);

    /// Builder used by the identity table
    pub const fn with(self, quirk: Quirk) -> Self {
        Self(self.0 | quirk.bit())
    }

    pub fn has(&self, quirk: Quirk) -> bool {
        self.0 & quirk.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Quirk> + '_ {
        Quirk::ALL.into_iter().filter(|quirk| self.has(*quirk))
    }
}

impl fmt::Display for Quirks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for quirk in self.iter() {
            if !first {
                f.write_str(",")?;
            }
            f.write_str(quirk.as_ref())?;
            first = false;
        }
        Ok(())
    }
}

/// Static description of a connected printer model, looked up once at connect time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrinterProfile {
    pub vendor_id: u16,
    pub product_id: u16,
    pub name: &'static str,
    pub quirks: Quirks,
}

impl PrinterProfile {
    const fn known(vendor_id: u16, product_id: u16, name: &'static str, quirks: Quirks) -> Self {
        Self {
            vendor_id,
            product_id,
            name,
            quirks,
        }
    }

    pub fn has_quirk(&self, quirk: Quirk) -> bool {
        self.quirks.has(quirk)
    }
}

impl fmt::Display for PrinterProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:04x}:{:04x})",
            self.name, self.vendor_id, self.product_id
        )
    }
}

const RELATIVE_AND_HOMING: Quirks = Quirks::NONE
    .with(Quirk::NoRelativePositioning)
    .with(Quirk::NoCombinedHoming);
const SAILFISH: Quirks = Quirks::NONE.with(Quirk::NoM132);

/// Device identity table
///
/// The PowerSpec Ultra is a rebadged FlashForge and enumerates under the FlashForge vendor id.
pub static KNOWN_PRINTERS: &[PrinterProfile] = &[
    PrinterProfile::known(FLASHFORGE_VENDOR_ID, 0x00ff, "FlashForge Dreamer", RELATIVE_AND_HOMING),
    PrinterProfile::known(FLASHFORGE_VENDOR_ID, 0x0001, "PowerSpec Ultra 3D", SAILFISH),
];

pub fn find(vendor_id: u16, product_id: u16) -> Option<&'static PrinterProfile> {
    KNOWN_PRINTERS
        .iter()
        .find(|printer| printer.vendor_id == vendor_id && printer.product_id == product_id)
}

/// Resolve the profile for a device, unmapped products get no quirks
pub fn lookup(vendor_id: u16, product_id: u16) -> PrinterProfile {
    find(vendor_id, product_id)
        .copied()
        .unwrap_or(PrinterProfile {
            vendor_id,
            product_id,
            name: "Unknown FlashForge-compatible printer",
            quirks: Quirks::NONE,
        })
}
