//! The core constants and node names shared by every part of the DAQ board interface

/// Number of ARCADIA chips served by a single DAQ board
pub const CHIPS: usize = 3;

/// Number of serial data lanes coming out of each chip
pub const LANES: usize = 16;

/// Number of delay taps available on each lane's input delay
pub const TAP_VALUES: usize = 32;

/// Prefix shared by every board-level register in the address table
pub const REGFILE_PREFIX: &str = "regfile.";

/// Mask applied to the FIFO occupancy register, which only carries 17 meaningful bits
pub const OCCUPANCY_MASK: u32 = 0x1ffff;

/// The registers of the SPI master attached to each chip
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SpiRegister {
    Ctrl,
    TxRx,
    Divider,
    SlaveSelect,
}

impl SpiRegister {
    fn suffix(self) -> &'static str {
        match self {
            SpiRegister::Ctrl => "CTRL",
            SpiRegister::TxRx => "TxRx0",
            SpiRegister::Divider => "DIVIDER",
            SpiRegister::SlaveSelect => "SS",
        }
    }

    pub(crate) fn from_suffix(s: &str) -> Option<Self> {
        match s {
            "CTRL" => Some(SpiRegister::Ctrl),
            "TxRx0" => Some(SpiRegister::TxRx),
            "DIVIDER" => Some(SpiRegister::Divider),
            "SS" => Some(SpiRegister::SlaveSelect),
            _ => None,
        }
    }
}

/// The registers of the readout FIFO attached to each chip
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FifoRegister {
    Occupancy,
    Data,
    Reset,
}

impl FifoRegister {
    fn suffix(self) -> &'static str {
        match self {
            FifoRegister::Occupancy => "occupancy",
            FifoRegister::Data => "data",
            FifoRegister::Reset => "reset",
        }
    }

    pub(crate) fn from_suffix(s: &str) -> Option<Self> {
        match s {
            "occupancy" => Some(FifoRegister::Occupancy),
            "data" => Some(FifoRegister::Data),
            "reset" => Some(FifoRegister::Reset),
            _ => None,
        }
    }
}

#[must_use]
pub fn spi_node(chip: u8, register: SpiRegister) -> String {
    format!("spi_id{chip}.{}", register.suffix())
}

#[must_use]
pub fn fifo_node(chip: u8, register: FifoRegister) -> String {
    format!("fifo_id{chip}.{}", register.suffix())
}

#[must_use]
pub fn controller_node(chip: u8) -> String {
    format!("controller_id{chip}")
}

/// Parse the chip index out of the `<prefix><id>` part of a node or config section name
pub(crate) fn chip_index(s: &str, prefix: &str) -> Option<u8> {
    let id: u8 = s.strip_prefix(prefix)?.parse().ok()?;
    (usize::from(id) < CHIPS).then_some(id)
}
