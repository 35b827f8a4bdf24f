//! The context of a single ARCADIA chip: its configuration registers, its link controller and
//! its acquisition engine

pub mod calibration;
pub mod daq;
pub mod pixels;
pub mod registers;
pub mod spi;

use self::{
    daq::{
        read_occupancy,
        BackpressurePolicy,
        Daq,
        DaqConfig,
        RunOutcome,
    },
    registers::{
        controller_command,
        gcr_default_word,
        gcr_param,
        CTRL_WORDS,
        GCR_WORDS,
    },
    spi::{
        Opcode,
        GCR_SPACE,
    },
};
use crate::{
    core::{
        controller_node,
        fifo_node,
        FifoRegister,
    },
    transport::Transport,
    Error,
};
use std::{
    str::FromStr,
    sync::{
        Arc,
        Mutex,
        Weak,
    },
};
use tracing::{
    debug,
    error,
    info,
    warn,
};

/// Value of ICR0 that resets the chip's logic without touching its configuration
pub const SOFT_RESET: u16 = 0x0015;

/// The chip's instant command registers
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Icr {
    Icr0,
    Icr1,
}

impl Icr {
    fn opcode(self) -> Opcode {
        match self {
            Icr::Icr0 => Opcode::WriteIcr0,
            Icr::Icr1 => Opcode::WriteIcr1,
        }
    }
}

impl FromStr for Icr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ICR0" => Ok(Icr::Icr0),
            "ICR1" => Ok(Icr::Icr1),
            _ => Err(Error::UnknownIcr(s.to_owned())),
        }
    }
}

/// Operating modes of the chip's readout
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChipMode {
    Normal,
    Space,
    Sync,
}

impl FromStr for ChipMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(ChipMode::Normal),
            "space" => Ok(ChipMode::Space),
            "sync" => Ok(ChipMode::Sync),
            _ => Err(Error::UnknownMode(s.to_owned())),
        }
    }
}

/// A single chip on the DAQ board
#[derive(Debug)]
pub struct Chip<T> {
    id: u8,
    /// Upwards pointer to the parent FPGA's transport
    transport: Weak<Mutex<T>>,
    /// Last known value of every GCR word
    gcr: [u16; GCR_WORDS],
    /// Accumulated fields of every controller command word
    ctrl: [u32; CTRL_WORDS],
    spi_unavailable: bool,
    daq: Daq,
}

impl<T> Chip<T>
where
    T: Transport,
{
    pub(crate) fn new(id: u8, transport: &Arc<Mutex<T>>, verbose: bool) -> Self {
        Self {
            id,
            transport: Arc::downgrade(transport),
            gcr: std::array::from_fn(|addr| gcr_default_word(addr as u16)),
            ctrl: [0; CTRL_WORDS],
            spi_unavailable: false,
            daq: Daq::new(id, verbose),
        }
    }

    #[must_use]
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Whether the SPI core of this chip failed to come up
    #[must_use]
    pub fn spi_unavailable(&self) -> bool {
        self.spi_unavailable
    }

    pub(crate) fn mark_spi_unavailable(&mut self) {
        self.spi_unavailable = true;
    }

    fn transport(&self) -> crate::Result<Arc<Mutex<T>>> {
        self.transport.upgrade().ok_or(Error::TransportDropped)
    }

    /// Run `f` while holding the transport, so its transactions can't interleave with anyone else's
    fn with_transport<R>(&self, f: impl FnOnce(&mut T) -> crate::Result<R>) -> crate::Result<R> {
        let tarc = self.transport()?;
        let mut transport = tarc.lock().map_err(|_| Error::Poisoned)?;
        f(&mut transport)
    }

    fn check_available(&self) -> crate::Result<()> {
        if self.spi_unavailable {
            return Err(Error::ChipUnavailable(self.id));
        }
        Ok(())
    }

    fn check_address(addr: u16) -> crate::Result<()> {
        if usize::from(addr) >= GCR_WORDS {
            return Err(Error::BadAddress(addr));
        }
        Ok(())
    }

    /// Perform a single raw SPI instruction exchange with this chip
    /// # Errors
    /// Returns an error on bad transport, an SPI timeout, or if the chip is unavailable
    pub fn spi_transfer(&self, opcode: Opcode, payload: u16) -> crate::Result<u32> {
        self.check_available()?;
        self.with_transport(|t| spi::transfer(t, self.id, opcode, payload))
    }

    /// Read GCR word `addr`, from the chip itself if `force` is set or from the cache otherwise
    /// # Errors
    /// Returns an error on bad transport, a bad address, or if the chip is unavailable
    pub fn read_gcr(&mut self, addr: u16, force: bool) -> crate::Result<u16> {
        self.check_available()?;
        Self::check_address(addr)?;
        if force {
            let id = self.id;
            let rx = self.with_transport(|t| {
                spi::transfer(t, id, Opcode::WritePointer, addr | GCR_SPACE)?;
                spi::transfer(t, id, Opcode::ReadData, 0)
            })?;
            self.gcr[usize::from(addr)] = (rx & 0xffff) as u16;
        }
        Ok(self.gcr[usize::from(addr)])
    }

    /// Write the whole of GCR word `addr`
    /// # Errors
    /// Returns an error on bad transport, a bad address, or if the chip is unavailable
    pub fn write_gcr(&mut self, addr: u16, data: u16) -> crate::Result<()> {
        self.check_available()?;
        Self::check_address(addr)?;
        let id = self.id;
        self.with_transport(|t| {
            spi::transfer(t, id, Opcode::WritePointer, addr | GCR_SPACE)?;
            spi::transfer(t, id, Opcode::WriteData, data)
        })?;
        self.gcr[usize::from(addr)] = data;
        Ok(())
    }

    /// Read the named GCR field
    /// # Errors
    /// Returns an error on bad transport, an unknown name, or if the chip is unavailable
    pub fn read_gcr_param(&mut self, name: &str, force: bool) -> crate::Result<u16> {
        self.check_available()?;
        let param = gcr_param(name).ok_or_else(|| Error::UnknownParameter(name.to_owned()))?;
        let word = self.read_gcr(param.word_address, force)?;
        Ok(param.extract(u32::from(word)) as u16)
    }

    /// Replace the named GCR field with `value`, keeping the rest of its word as cached
    /// # Errors
    /// Returns an error on bad transport, an unknown name, or if the chip is unavailable
    pub fn write_gcr_param(&mut self, name: &str, value: u16) -> crate::Result<()> {
        self.check_available()?;
        let param = gcr_param(name).ok_or_else(|| Error::UnknownParameter(name.to_owned()))?;
        let addr = param.word_address;
        let word = param.insert(u32::from(self.gcr[usize::from(addr)]), u32::from(value));
        debug!(chip = self.id, name, value, "GCR{addr} <- {word:#06x}");
        self.write_gcr(addr, word as u16)
    }

    /// Write the default value of every field into GCR word `addr`
    /// # Errors
    /// Returns an error on bad transport, a bad address, or if the chip is unavailable
    pub fn reinitialize_gcr(&mut self, addr: u16) -> crate::Result<()> {
        Self::check_address(addr)?;
        self.write_gcr(addr, gcr_default_word(addr))
    }

    /// Write the default value of every GCR field
    /// # Errors
    /// Returns an error on bad transport or if the chip is unavailable
    pub fn reinitialize_all_gcr(&mut self) -> crate::Result<()> {
        for addr in 0..GCR_WORDS as u16 {
            self.reinitialize_gcr(addr)?;
        }
        Ok(())
    }

    /// Read back every GCR word and compare it against the cache, returning the number of
    /// words that didn't match or couldn't be read
    /// # Errors
    /// Returns an error if the chip is unavailable
    pub fn check_gcr_consistency(&mut self) -> crate::Result<usize> {
        self.check_available()?;
        let mut errors = 0;
        for addr in 0..GCR_WORDS as u16 {
            let cached = self.gcr[usize::from(addr)];
            match self.read_gcr(addr, true) {
                Ok(word) if word != cached => {
                    warn!(
                        chip = self.id,
                        "GCR{addr} mismatch: cached {cached:#06x}, chip {word:#06x}"
                    );
                    errors += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(chip = self.id, "Failed to read GCR{addr}: {e}");
                    errors += 1;
                }
            }
        }
        info!(chip = self.id, errors, "GCR consistency check completed");
        Ok(errors)
    }

    /// Write `value` to one of the chip's instant command registers
    /// # Errors
    /// Returns an error on bad transport or if the chip is unavailable
    pub fn write_icr(&self, icr: Icr, value: u16) -> crate::Result<()> {
        debug!(chip = self.id, ?icr, "ICR <- {value:#06x}");
        self.spi_transfer(icr.opcode(), value)?;
        Ok(())
    }

    /// The current value of a controller command's field, as last sent
    #[must_use]
    pub fn controller_field(&self, name: &str) -> Option<u32> {
        let param = controller_command(name)?;
        Some(param.extract(self.ctrl[usize::from(param.word_address)]))
    }

    /// Send the named command with `value` to this chip's link controller and return its response.
    /// Other fields of the same command word keep the values they were last sent with.
    /// # Errors
    /// Returns an error on bad transport or an unknown command
    pub fn send_controller_command(&mut self, name: &str, value: u32) -> crate::Result<u32> {
        let param =
            controller_command(name).ok_or_else(|| Error::UnknownCommand(name.to_owned()))?;
        let addr = usize::from(param.word_address);
        let word = param.insert(self.ctrl[addr], value);
        let command = (u32::from(param.word_address) << 20) | word;
        let port = controller_node(self.id);
        let response = self.with_transport(|t| {
            t.write(&port, command)?;
            t.dispatch()?;
            // The read drains the controller's response FIFO
            let response = t.read(&port)?;
            t.dispatch()?;
            Ok(response)
        })?;
        self.ctrl[addr] = word;
        debug!(chip = self.id, name, value, response, "Controller command sent");
        Ok(response)
    }

    /// Program and fire a train of `count` test pulses
    /// # Errors
    /// Returns an error on bad transport
    pub fn send_pulse(&mut self, t_on: u32, t_off: u32, count: u32) -> crate::Result<()> {
        if self.spi_unavailable {
            warn!(chip = self.id, "Sending test pulses to a chip that isn't configured");
        }
        self.send_controller_command("loadTPOnTime", t_on)?;
        self.send_controller_command("loadTPOffTime", t_off)?;
        self.send_controller_command("loadTPNumber", count)?;
        self.send_controller_command("runTPSequence", 0)?;
        Ok(())
    }

    /// Enable data transmission on the lanes set in `lanes`
    /// # Errors
    /// Returns an error on bad transport
    pub fn enable_readout(&mut self, lanes: u16) -> crate::Result<()> {
        self.send_controller_command("setTxDataEnable", u32::from(lanes))?;
        Ok(())
    }

    /// Resynchronize the lanes set in `lanes`, returning the mask of lanes that are locked
    /// # Errors
    /// Returns an error on bad transport
    pub fn sync(&mut self, lanes: u16) -> crate::Result<u16> {
        self.send_controller_command("syncTX", u32::from(lanes))?;
        let state = self.send_controller_command("readTxState", 0)?;
        Ok((state & 0xffff) as u16)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn hard_reset(&mut self) -> crate::Result<()> {
        self.send_controller_command("doRESET", 1)?;
        Ok(())
    }

    /// # Errors
    /// Returns an error on bad transport or if the chip is unavailable
    pub fn soft_reset(&self) -> crate::Result<()> {
        self.write_icr(Icr::Icr0, SOFT_RESET)
    }

    /// # Errors
    /// Returns an error on bad transport or if the chip is unavailable
    pub fn set_mode(&mut self, mode: ChipMode) -> crate::Result<()> {
        match mode {
            ChipMode::Space => self.write_gcr_param("OPERATION", 1),
            ChipMode::Normal => {
                self.write_gcr_param("SERIALIZER_SYNC", 0)?;
                self.write_gcr_param("OPERATION", 0)
            }
            ChipMode::Sync => self.write_gcr_param("SERIALIZER_SYNC", 1),
        }
    }

    /// Queue a custom 48 bit `word` with an 8 bit `payload` to be inserted into the data stream
    /// # Errors
    /// Returns an error on bad transport
    pub fn custom_word(&mut self, word: u64, payload: u8) -> crate::Result<()> {
        // Laid out so the pushed packet reads 0xc, then the word, then the payload
        let chunks = [
            (((word << 8) | u64::from(payload)) & 0xffff) as u32,
            ((word >> 8) & 0xffff) as u32,
            ((word >> 24) & 0xffff) as u32,
            (((word >> 40) & 0x0fff) | 0xc000) as u32,
        ];
        for (i, chunk) in chunks.into_iter().enumerate() {
            self.send_controller_command(&format!("loadUserData_{i}"), chunk)?;
        }
        self.send_controller_command("loadUserDataPush", 0)?;
        Ok(())
    }

    /// Set the 40 bit offset added to the chip's timestamps
    /// # Errors
    /// Returns an error on bad transport
    pub fn set_timestamp_delta(&mut self, delta: u64) -> crate::Result<()> {
        self.send_controller_command("loadTSDeltaLSB", (delta & 0xfffff) as u32)?;
        self.send_controller_command("loadTSDeltaMSB", ((delta >> 20) & 0xfffff) as u32)?;
        Ok(())
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn set_timestamp_period(&mut self, period: u16) -> crate::Result<()> {
        self.send_controller_command("writeTimeStampPeriod", u32::from(period))?;
        Ok(())
    }

    /// Number of packets waiting in this chip's hardware FIFO
    /// # Errors
    /// Returns an error on bad transport or an inconsistent occupancy
    pub fn fifo_occupancy(&self) -> crate::Result<usize> {
        let id = self.id;
        self.with_transport(|t| {
            let depth = t.size(&fifo_node(id, FifoRegister::Data))?;
            read_occupancy(t, id, depth)
        })
    }

    /// Pulse the reset of this chip's hardware FIFO
    /// # Errors
    /// Returns an error on bad transport or while acquisition is running
    pub fn reset_fifo(&self) -> crate::Result<()> {
        if self.daq.is_running() {
            return Err(Error::Busy(self.id));
        }
        let node = fifo_node(self.id, FifoRegister::Reset);
        self.with_transport(|t| {
            t.write(&node, 0xffff_ffff)?;
            t.dispatch()?;
            Ok(())
        })?;
        info!(chip = self.id, "FIFO reset");
        Ok(())
    }

    /// Mutable access to the discard policy applied to the next run
    pub fn backpressure(&mut self) -> &mut BackpressurePolicy {
        &mut self.daq.policy
    }

    /// The acquisition state of this chip
    #[must_use]
    pub fn daq(&self) -> &Daq {
        &self.daq
    }

    /// Ask the acquisition worker to exit at its next poll
    pub fn stop(&self) {
        self.daq.stop();
    }

    /// Block until the acquisition worker exits
    /// # Errors
    /// Returns an error if no run was started, or the error that ended the run
    pub fn wait(&mut self) -> crate::Result<RunOutcome> {
        self.daq.wait()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.daq.is_running()
    }

    #[must_use]
    pub fn packet_count(&self) -> usize {
        self.daq.packet_count()
    }

    /// # Errors
    /// Returns an error while acquisition is running
    pub fn packets(&mut self) -> crate::Result<&[u64]> {
        self.daq.packets()
    }

    /// # Errors
    /// Returns an error while acquisition is running
    pub fn take_packets(&mut self) -> crate::Result<Vec<u64>> {
        self.daq.take_packets()
    }

    /// Take up to `count` of the oldest captured packets, or all of them if `count` is zero
    /// # Errors
    /// Returns an error while acquisition is running
    pub fn drain_packets(&mut self, count: usize) -> crate::Result<Vec<u64>> {
        self.daq.drain_packets(count)
    }

    /// Drain this chip's FIFO on the calling thread until the run ends, leaving the packets
    /// in the buffer
    /// # Errors
    /// Returns an error if the run has neither a packet target nor a timeout, acquisition is
    /// already running, or the error that ended the run
    pub fn fifo_read(&mut self, config: DaqConfig) -> crate::Result<RunOutcome> {
        let transport = self.transport()?;
        self.daq.run_blocking(transport, config)
    }

    /// # Errors
    /// Returns an error while acquisition is running
    pub fn clear_packets(&mut self) -> crate::Result<()> {
        self.daq.clear_packets()
    }
}

impl<T> Chip<T>
where
    T: Transport + 'static,
{
    /// Launch a background acquisition that drains this chip's FIFO
    /// # Errors
    /// Returns an error if acquisition is already running or the transport is gone
    pub fn start(&mut self, config: DaqConfig) -> crate::Result<()> {
        let transport = self.transport()?;
        self.daq.start(transport, config)
    }
}
