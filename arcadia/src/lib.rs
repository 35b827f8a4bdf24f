//! Configuration and readout of ARCADIA sensor chips through the FPGA DAQ board that hosts them.
//!
//! The [`Fpga`] context owns the register transport and one [`Chip`] context for each of the
//! three chips on the board. Chips are configured through their global configuration registers
//! and the board-side link controller, and each one can run a background acquisition that drains
//! its readout FIFO into memory.

pub mod chip;
pub mod config;
pub mod core;
pub mod fpga;
pub mod packet;
pub mod prelude;
pub mod transport;

pub use chip::Chip;
pub use fpga::Fpga;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] transport::Error),
    #[error("SPI core of chip {0} stayed busy")]
    Timeout(u8),
    #[error("Unknown GCR parameter `{0}`")]
    UnknownParameter(String),
    #[error("Unknown controller command `{0}`")]
    UnknownCommand(String),
    #[error("Unknown ICR `{0}`")]
    UnknownIcr(String),
    #[error("Unknown chip mode `{0}`")]
    UnknownMode(String),
    #[error("GCR address {0} is out of range")]
    BadAddress(u16),
    #[error("There is no chip with id {0}")]
    BadChipId(usize),
    #[error("SPI core of chip {0} is unavailable")]
    ChipUnavailable(u8),
    #[error("FIFO of chip {chip} reported occupancy {occupancy} with depth {depth}")]
    InvalidHardwareState {
        chip: u8,
        occupancy: u32,
        depth: usize,
    },
    #[error("Acquisition on chip {0} is already running")]
    AlreadyRunning(u8),
    #[error("Acquisition on chip {0} was never started")]
    NotRunning(u8),
    #[error("Acquisition on chip {0} is running")]
    Busy(u8),
    #[error("Blocking acquisition on chip {0} needs a packet target or a timeout")]
    Unbounded(u8),
    #[error("Acquisition worker of chip {0} panicked")]
    WorkerPanicked(u8),
    #[error("The transport this block belonged to has been dropped")]
    TransportDropped,
    #[error("The transport lock was poisoned")]
    Poisoned,
    #[error("Configuration line {line}: {reason}")]
    Config { line: usize, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
