//! The instruction protocol spoken to each chip through the DAQ board's SPI master core
use crate::{
    core::{
        spi_node,
        SpiRegister,
    },
    transport::{
        Deserialize,
        Error as TransportError,
        Serialize,
        Transport,
        TransportResult,
    },
    Error,
};
use packed_struct::prelude::*;
use tracing::{
    trace,
    warn,
};

/// Number of times the busy flag is polled before a transfer is given up on
pub const BUSY_RETRIES: usize = 3;

/// Clock divider programmed into every SPI core at startup
pub const CLOCK_DIVIDER: u32 = 7;

/// Pointer-space flag that selects the GCR bank
pub const GCR_SPACE: u16 = 0x2000;

/// The chip's SPI instruction set, carried in bits 20 and up of the transmitted word
#[derive(PrimitiveEnum_u8, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Opcode {
    WritePointer = 0x0,
    WriteData = 0x1,
    WriteStatus = 0x2,
    WriteIcr0 = 0x3,
    WriteIcr1 = 0x4,
    ReadPointer = 0x8,
    ReadData = 0x9,
    ReadStatus = 0xa,
    ReadIcr0 = 0xb,
    ReadIcr1 = 0xc,
}

/// The control register of the SPI master core
#[derive(PackedStruct, Debug, Default, Copy, Clone)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4")]
#[allow(clippy::struct_excessive_bools)]
pub struct SpiControl {
    /// Number of bits in each transfer
    #[packed_field(bits = "0..=6")]
    pub char_len: Integer<u8, packed_bits::Bits<7>>,
    /// Set to start a transfer, cleared by the core when it's done
    #[packed_field(bits = "8")]
    pub go_busy: bool,
    #[packed_field(bits = "9")]
    pub rx_negedge: bool,
    #[packed_field(bits = "10")]
    pub tx_negedge: bool,
    #[packed_field(bits = "11")]
    pub lsb_first: bool,
    #[packed_field(bits = "12")]
    pub interrupt_enable: bool,
    #[packed_field(bits = "13")]
    pub auto_slave_select: bool,
}

impl SpiControl {
    /// The framing every chip expects: 24 bit characters sampled on the falling edge with
    /// automatic slave select
    #[must_use]
    pub fn framing(go: bool) -> Self {
        Self {
            char_len: 24.into(),
            go_busy: go,
            rx_negedge: true,
            auto_slave_select: true,
            ..Default::default()
        }
    }
}

fn packing(e: PackingError) -> TransportError {
    TransportError::Lower(anyhow::anyhow!("SPI control packing failed: {e:?}"))
}

impl Serialize for SpiControl {
    fn serialize(&self) -> TransportResult<u32> {
        Ok(u32::from_be_bytes(self.pack().map_err(packing)?))
    }
}

impl Deserialize for SpiControl {
    fn deserialize(word: u32) -> TransportResult<Self> {
        Self::unpack(&word.to_be_bytes()).map_err(packing)
    }
}

/// Build the 24 bit word that carries `opcode` and its 16 bit `payload`
#[must_use]
pub fn instruction(opcode: Opcode, payload: u16) -> u32 {
    (u32::from(opcode.to_primitive()) << 20) | u32::from(payload)
}

/// Put the SPI core of `chip` into its idle state with the standard clock divider
/// # Errors
/// Returns an error on bad transport
pub fn configure<T>(transport: &mut T, chip: u8) -> TransportResult<()>
where
    T: Transport,
{
    transport.write(&spi_node(chip, SpiRegister::Ctrl), 0)?;
    transport.write(&spi_node(chip, SpiRegister::Divider), CLOCK_DIVIDER)?;
    transport.write(&spi_node(chip, SpiRegister::SlaveSelect), 1)?;
    transport.dispatch()
}

/// Perform a single instruction exchange with `chip`, returning the word shifted back in
/// # Errors
/// Returns an error on bad transport or if the core is still busy after [`BUSY_RETRIES`] polls
pub fn transfer<T>(transport: &mut T, chip: u8, opcode: Opcode, payload: u16) -> crate::Result<u32>
where
    T: Transport,
{
    let ctrl = spi_node(chip, SpiRegister::Ctrl);
    let txrx = spi_node(chip, SpiRegister::TxRx);
    let word = instruction(opcode, payload);
    trace!(chip, ?opcode, "SPI transfer of {word:#08x}");
    transport.write_word(&ctrl, &SpiControl::framing(false))?;
    transport.write(&txrx, word)?;
    transport.write_word(&ctrl, &SpiControl::framing(true))?;
    transport.dispatch()?;

    let mut idle = false;
    for _ in 0..BUSY_RETRIES {
        let status: SpiControl = transport.read_word(&ctrl)?;
        transport.dispatch()?;
        if !status.go_busy {
            idle = true;
            break;
        }
    }
    if !idle {
        warn!(chip, ?opcode, "Timeout on SPI transfer");
        return Err(Error::Timeout(chip));
    }

    let rx = transport.read(&txrx)?;
    transport.dispatch()?;
    Ok(rx)
}
