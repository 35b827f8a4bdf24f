//! Mock transport that simulates a DAQ board with its chips attached, used in testing the interface

use super::{
    Error,
    LogLevel,
    Transport,
    TransportResult,
};
use crate::{
    chip::{
        pixels::{
            HELPER_FIRST_WORD,
            WRITE_PCR,
        },
        spi::{
            Opcode,
            GCR_SPACE,
        },
    },
    core::{
        chip_index,
        FifoRegister,
        SpiRegister,
        CHIPS,
        LANES,
        REGFILE_PREFIX,
        TAP_VALUES,
    },
};
use kstring::KString;
use packed_struct::PrimitiveEnum;
use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    fmt,
};

/// Default depth of each simulated readout FIFO, in words
pub const DEFAULT_FIFO_DEPTH: usize = 0x10000;

/// Error counter value reported by a lane that has no lock
pub const UNLOCKED: u16 = 0xffff;

const GO_BUSY: u32 = 0x100;

/// Produces new FIFO contents, given the number of free words, every time occupancy is polled
pub type FifoSource = Box<dyn FnMut(usize) -> Vec<u32> + Send>;

/// A record of every transaction the mock board has seen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Write(String, u32),
    Read(String),
    Block(String, usize),
}

#[derive(Debug, Default)]
struct SpiCore {
    ctrl: u32,
    txrx: u32,
    divider: u32,
    slave_select: u32,
    stuck: bool,
    pointer: u16,
    gcr: HashMap<u16, u16>,
    icr: [u16; 2],
    /// Pixel configuration helper words at every PCR write
    pcr_writes: Vec<[u16; 4]>,
}

impl SpiCore {
    /// Shift the instruction in `txrx` out to the chip and latch its reply
    fn execute(&mut self) {
        let opcode = Opcode::from_primitive(((self.txrx >> 20) & 0xf) as u8);
        let payload = (self.txrx & 0xffff) as u16;
        let reply = match opcode {
            Some(Opcode::WritePointer) => {
                self.pointer = payload;
                0
            }
            Some(Opcode::WriteData) => {
                if self.pointer & GCR_SPACE != 0 {
                    self.gcr.insert(self.pointer & !GCR_SPACE, payload);
                }
                0
            }
            Some(Opcode::WriteIcr0) => {
                self.icr[0] = payload;
                if payload & WRITE_PCR != 0 {
                    let helper = std::array::from_fn(|i| {
                        let addr = HELPER_FIRST_WORD + i as u16;
                        self.gcr.get(&addr).copied().unwrap_or_default()
                    });
                    self.pcr_writes.push(helper);
                }
                0
            }
            Some(Opcode::WriteIcr1) => {
                self.icr[1] = payload;
                0
            }
            Some(Opcode::ReadPointer) => self.pointer,
            Some(Opcode::ReadData) => self
                .gcr
                .get(&(self.pointer & !GCR_SPACE))
                .copied()
                .unwrap_or_default(),
            Some(Opcode::ReadIcr0) => self.icr[0],
            Some(Opcode::ReadIcr1) => self.icr[1],
            _ => 0,
        };
        self.txrx = u32::from(reply);
    }
}

struct Fifo {
    words: VecDeque<u32>,
    depth: usize,
    source: Option<FifoSource>,
    forced_occupancy: Option<u32>,
    resets: usize,
}

impl Default for Fifo {
    fn default() -> Self {
        Self {
            words: VecDeque::new(),
            depth: DEFAULT_FIFO_DEPTH,
            source: None,
            forced_occupancy: None,
            resets: 0,
        }
    }
}

impl fmt::Debug for Fifo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fifo")
            .field("len", &self.words.len())
            .field("depth", &self.depth)
            .field("forced_occupancy", &self.forced_occupancy)
            .field("resets", &self.resets)
            .finish_non_exhaustive()
    }
}

impl Fifo {
    fn refill(&mut self) {
        let free = self.depth.saturating_sub(self.words.len());
        if let Some(source) = self.source.as_mut() {
            let mut words = source(free);
            words.truncate(free);
            self.words.extend(words);
        }
    }
}

#[derive(Debug)]
struct Controller {
    words: HashMap<u32, u32>,
    responses: VecDeque<u32>,
    taps: [u8; LANES],
    lane_errors: [[u16; TAP_VALUES]; LANES],
}

impl Default for Controller {
    fn default() -> Self {
        Self {
            words: HashMap::new(),
            responses: VecDeque::new(),
            taps: [0; LANES],
            lane_errors: [[0; TAP_VALUES]; LANES],
        }
    }
}

impl Controller {
    fn error_count(&self, lane: usize) -> u16 {
        self.lane_errors[lane][usize::from(self.taps[lane])]
    }

    fn command(&mut self, value: u32) {
        let addr = value >> 20;
        let data = value & 0xfffff;
        self.words.insert(addr, data);
        let response = match addr {
            0x03..=0x06 => {
                let first = (addr as usize - 3) * 4;
                for i in 0..4 {
                    self.taps[first + i] = ((data >> (5 * i)) & 0x1f) as u8;
                }
                0
            }
            // Lock state of every lane
            0x12 => (0..LANES)
                .filter(|&lane| self.error_count(lane) != UNLOCKED)
                .fold(0, |mask, lane| mask | (1 << lane)),
            // The 4 bit select holds twice the lane index, lanes 8 and up alias 0 to 7
            0x13 => u32::from(self.error_count(((data & 0xf) >> 1) as usize)),
            _ => 0,
        };
        self.responses.push_back(response);
    }
}

#[derive(Debug, Default)]
struct SimulatedChip {
    spi: SpiCore,
    fifo: Fifo,
    controller: Controller,
}

enum Route {
    Spi(usize, SpiRegister),
    Fifo(usize, FifoRegister),
    Controller(usize),
    Plain,
}

fn route(node: &str) -> Route {
    if let Some((chip, reg)) = node.split_once('.') {
        if let (Some(id), Some(reg)) = (chip_index(chip, "spi_id"), SpiRegister::from_suffix(reg)) {
            return Route::Spi(usize::from(id), reg);
        }
        if let (Some(id), Some(reg)) = (chip_index(chip, "fifo_id"), FifoRegister::from_suffix(reg))
        {
            return Route::Fifo(usize::from(id), reg);
        }
    } else if let Some(id) = chip_index(node, "controller_id") {
        return Route::Controller(usize::from(id));
    }
    Route::Plain
}

/// A simulated DAQ board, useful for testing
#[derive(Debug)]
pub struct Mock {
    registers: HashMap<KString, u32>,
    chips: [SimulatedChip; CHIPS],
    pending: Vec<(String, u32)>,
    failing: Vec<String>,
    accesses: Vec<Access>,
    dispatches: usize,
    log_level: LogLevel,
}

impl Default for Mock {
    fn default() -> Self {
        Self::new()
    }
}

impl Mock {
    /// Construct a new board with idle chips, empty FIFOs and the standard board registers
    #[must_use]
    pub fn new() -> Self {
        let registers = ["mode", "version", "scratch"]
            .into_iter()
            .map(|name| (KString::from(format!("{REGFILE_PREFIX}{name}")), 0))
            .collect();
        Self {
            registers,
            chips: Default::default(),
            pending: vec![],
            failing: vec![],
            accesses: vec![],
            dispatches: 0,
            log_level: LogLevel::default(),
        }
    }

    /// Add (or overwrite) a plain register
    #[must_use]
    pub fn with_register(mut self, name: &str, value: u32) -> Self {
        self.registers.insert(KString::from_ref(name), value);
        self
    }

    /// Make every transaction touching a node that starts with `prefix` fail
    pub fn fail_nodes(&mut self, prefix: &str) {
        self.failing.push(prefix.to_owned());
    }

    pub fn clear_failures(&mut self) {
        self.failing.clear();
    }

    #[must_use]
    pub fn accesses(&self) -> &[Access] {
        &self.accesses
    }

    pub fn clear_accesses(&mut self) {
        self.accesses.clear();
    }

    #[must_use]
    pub fn dispatches(&self) -> usize {
        self.dispatches
    }

    #[must_use]
    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    /// Keep the busy flag of a chip's SPI core asserted forever
    pub fn set_spi_stuck(&mut self, chip: usize, stuck: bool) {
        self.chips[chip].spi.stuck = stuck;
    }

    #[must_use]
    pub fn spi_pointer(&self, chip: usize) -> u16 {
        self.chips[chip].spi.pointer
    }

    /// The clock divider and slave select last programmed into a chip's SPI core
    #[must_use]
    pub fn spi_setup(&self, chip: usize) -> (u32, u32) {
        let spi = &self.chips[chip].spi;
        (spi.divider, spi.slave_select)
    }

    /// The value of GCR word `addr` as the chip itself holds it
    #[must_use]
    pub fn gcr(&self, chip: usize, addr: u16) -> u16 {
        self.chips[chip].spi.gcr.get(&addr).copied().unwrap_or_default()
    }

    /// Change a GCR word behind the library's back
    pub fn set_gcr(&mut self, chip: usize, addr: u16, value: u16) {
        self.chips[chip].spi.gcr.insert(addr, value);
    }

    #[must_use]
    pub fn icr(&self, chip: usize, which: usize) -> u16 {
        self.chips[chip].spi.icr[which]
    }

    /// Helper GCR words 8 to 11 as they stood at each pixel configuration write, oldest first
    #[must_use]
    pub fn pcr_writes(&self, chip: usize) -> &[[u16; 4]] {
        &self.chips[chip].spi.pcr_writes
    }

    pub fn set_fifo_depth(&mut self, chip: usize, depth: usize) {
        self.chips[chip].fifo.depth = depth;
    }

    pub fn push_fifo(&mut self, chip: usize, words: &[u32]) {
        self.chips[chip].fifo.words.extend(words);
    }

    /// Continuously feed a chip's FIFO from `source`
    pub fn set_fifo_source(&mut self, chip: usize, source: FifoSource) {
        self.chips[chip].fifo.source = Some(source);
    }

    /// Report `occupancy` from the occupancy register regardless of the FIFO's contents
    pub fn force_occupancy(&mut self, chip: usize, occupancy: Option<u32>) {
        self.chips[chip].fifo.forced_occupancy = occupancy;
    }

    #[must_use]
    pub fn fifo_len(&self, chip: usize) -> usize {
        self.chips[chip].fifo.words.len()
    }

    #[must_use]
    pub fn fifo_resets(&self, chip: usize) -> usize {
        self.chips[chip].fifo.resets
    }

    /// Set the error count a lane reports at each delay tap. [`UNLOCKED`] marks a tap without lock.
    pub fn set_lane_errors(&mut self, chip: usize, lane: usize, errors: [u16; TAP_VALUES]) {
        self.chips[chip].controller.lane_errors[lane] = errors;
    }

    #[must_use]
    pub fn taps(&self, chip: usize) -> [u8; LANES] {
        self.chips[chip].controller.taps
    }

    /// The last data field written to controller word `addr`
    #[must_use]
    pub fn controller_word(&self, chip: usize, addr: u32) -> Option<u32> {
        self.chips[chip].controller.words.get(&addr).copied()
    }

    #[must_use]
    pub fn pending_responses(&self, chip: usize) -> usize {
        self.chips[chip].controller.responses.len()
    }

    fn check(&self, node: &str) -> TransportResult<()> {
        if self.failing.iter().any(|prefix| node.starts_with(prefix.as_str())) {
            return Err(Error::Dispatch(format!("no reply for `{node}`")));
        }
        Ok(())
    }

    fn apply(&mut self, node: &str, value: u32) -> TransportResult<()> {
        match route(node) {
            Route::Spi(id, reg) => {
                let spi = &mut self.chips[id].spi;
                match reg {
                    SpiRegister::Ctrl => {
                        spi.ctrl = value;
                        if value & GO_BUSY != 0 && !spi.stuck {
                            spi.execute();
                            spi.ctrl &= !GO_BUSY;
                        }
                    }
                    SpiRegister::TxRx => spi.txrx = value,
                    SpiRegister::Divider => spi.divider = value,
                    SpiRegister::SlaveSelect => spi.slave_select = value,
                }
            }
            Route::Fifo(id, FifoRegister::Reset) => {
                let fifo = &mut self.chips[id].fifo;
                fifo.words.clear();
                fifo.resets += 1;
            }
            Route::Fifo(..) => {}
            Route::Controller(id) => self.chips[id].controller.command(value),
            Route::Plain => {
                let reg = self
                    .registers
                    .get_mut(node)
                    .ok_or_else(|| Error::MissingNode(node.to_owned()))?;
                *reg = value;
            }
        }
        Ok(())
    }
}

impl Transport for Mock {
    fn write(&mut self, node: &str, value: u32) -> TransportResult<()> {
        self.accesses.push(Access::Write(node.to_owned(), value));
        self.pending.push((node.to_owned(), value));
        Ok(())
    }

    fn read(&mut self, node: &str) -> TransportResult<u32> {
        self.dispatch()?;
        self.check(node)?;
        self.accesses.push(Access::Read(node.to_owned()));
        match route(node) {
            Route::Spi(id, reg) => {
                let spi = &self.chips[id].spi;
                Ok(match reg {
                    SpiRegister::Ctrl => spi.ctrl,
                    SpiRegister::TxRx => spi.txrx,
                    SpiRegister::Divider => spi.divider,
                    SpiRegister::SlaveSelect => spi.slave_select,
                })
            }
            Route::Fifo(id, reg) => {
                let fifo = &mut self.chips[id].fifo;
                match reg {
                    FifoRegister::Occupancy => {
                        fifo.refill();
                        Ok(fifo
                            .forced_occupancy
                            .unwrap_or(u32::try_from(fifo.words.len()).unwrap_or(u32::MAX)))
                    }
                    FifoRegister::Data => Ok(fifo.words.pop_front().unwrap_or_default()),
                    FifoRegister::Reset => Ok(0),
                }
            }
            Route::Controller(id) => Ok(self.chips[id]
                .controller
                .responses
                .pop_front()
                .unwrap_or_default()),
            Route::Plain => self
                .registers
                .get(node)
                .copied()
                .ok_or_else(|| Error::MissingNode(node.to_owned())),
        }
    }

    fn read_block(&mut self, node: &str, n: usize) -> TransportResult<Vec<u32>> {
        self.dispatch()?;
        self.check(node)?;
        self.accesses.push(Access::Block(node.to_owned(), n));
        match route(node) {
            Route::Fifo(id, FifoRegister::Data) => {
                let words = &mut self.chips[id].fifo.words;
                let n = n.min(words.len());
                Ok(words.drain(..n).collect())
            }
            _ => Err(Error::NotABlock(node.to_owned())),
        }
    }

    fn dispatch(&mut self) -> TransportResult<()> {
        self.dispatches += 1;
        let pending = std::mem::take(&mut self.pending);
        for (node, value) in pending {
            self.check(&node)?;
            self.apply(&node, value)?;
        }
        Ok(())
    }

    fn size(&mut self, node: &str) -> TransportResult<usize> {
        match route(node) {
            Route::Fifo(id, FifoRegister::Data) => Ok(self.chips[id].fifo.depth),
            Route::Plain if !self.registers.contains_key(node) => {
                Err(Error::MissingNode(node.to_owned()))
            }
            _ => Ok(1),
        }
    }

    fn nodes(&mut self, prefix: &str) -> TransportResult<Vec<KString>> {
        let mut nodes: Vec<_> = self
            .registers
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        nodes.sort();
        Ok(nodes)
    }

    fn set_log_level(&mut self, level: LogLevel) {
        self.log_level = level;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paste::paste;

    macro_rules! test_rw_register {
        ($name:ident, $v:literal) => {
            paste! {
                #[test]
                fn [<test_rw_$name>]() {
                    let mut transport = Mock::new();
                    let node = concat!("regfile.", stringify!($name));
                    transport.write(node, $v).unwrap();
                    assert_eq!(transport.read(node).unwrap(), $v);
                }
            }
        };
    }

    test_rw_register!(mode, 0x55);
    test_rw_register!(version, 0xdead_beef);
    test_rw_register!(scratch, 0);

    #[test]
    fn test_writes_wait_for_dispatch() {
        let mut transport = Mock::new();
        transport.write("regfile.mode", 3).unwrap();
        assert_eq!(transport.registers["regfile.mode"], 0);
        transport.dispatch().unwrap();
        assert_eq!(transport.registers["regfile.mode"], 3);
    }

    #[test]
    fn test_missing_node() {
        let mut transport = Mock::new();
        assert!(matches!(
            transport.read("regfile.nope"),
            Err(Error::MissingNode(_))
        ));
        transport.write("regfile.nope", 1).unwrap();
        assert!(transport.dispatch().is_err());
    }

    #[test]
    fn test_failing_nodes() {
        let mut transport = Mock::new();
        transport.fail_nodes("fifo_id1");
        assert!(matches!(
            transport.read("fifo_id1.occupancy"),
            Err(Error::Dispatch(_))
        ));
        assert!(transport.read("fifo_id0.occupancy").is_ok());
        transport.clear_failures();
        assert!(transport.read("fifo_id1.occupancy").is_ok());
    }

    #[test]
    fn test_fifo() {
        let mut transport = Mock::new();
        transport.set_fifo_depth(2, 8);
        assert_eq!(transport.size("fifo_id2.data").unwrap(), 8);
        transport.push_fifo(2, &[1, 2, 3, 4]);
        assert_eq!(transport.read("fifo_id2.occupancy").unwrap(), 4);
        assert_eq!(transport.read_block("fifo_id2.data", 3).unwrap(), vec![1, 2, 3]);
        assert_eq!(transport.read_block("fifo_id2.data", 3).unwrap(), vec![4]);
        transport.push_fifo(2, &[5]);
        transport.write("fifo_id2.reset", 0xffff_ffff).unwrap();
        transport.dispatch().unwrap();
        assert_eq!(transport.fifo_len(2), 0);
        assert_eq!(transport.fifo_resets(2), 1);
        assert!(transport.read_block("regfile.mode", 1).is_err());
    }

    #[test]
    fn test_fifo_source() {
        let mut transport = Mock::new();
        transport.set_fifo_depth(0, 4);
        transport.set_fifo_source(0, Box::new(|free: usize| vec![7; free + 10]));
        assert_eq!(transport.read("fifo_id0.occupancy").unwrap(), 4);
        transport.force_occupancy(0, Some(3));
        assert_eq!(transport.read("fifo_id0.occupancy").unwrap(), 3);
    }

    #[test]
    fn test_controller_taps_and_lock() {
        let mut transport = Mock::new();
        let mut errors = [0; TAP_VALUES];
        errors[5] = UNLOCKED;
        errors[6] = 12;
        transport.set_lane_errors(0, 1, errors);
        // Lane 1 (bits 5..10 of word 3) on tap 5
        transport.write("controller_id0", (0x03 << 20) | (5 << 5)).unwrap();
        assert_eq!(transport.read("controller_id0").unwrap(), 0);
        assert_eq!(transport.taps(0)[1], 5);
        transport.write("controller_id0", 0x12 << 20).unwrap();
        assert_eq!(transport.read("controller_id0").unwrap(), 0xfffd);
        transport.write("controller_id0", (0x03 << 20) | (6 << 5)).unwrap();
        transport.write("controller_id0", (0x13 << 20) | 2).unwrap();
        transport.dispatch().unwrap();
        assert_eq!(transport.pending_responses(0), 2);
        assert_eq!(transport.read("controller_id0").unwrap(), 0);
        assert_eq!(transport.read("controller_id0").unwrap(), 12);
        // Select 3 shares lane 1's counter
        transport.write("controller_id0", (0x13 << 20) | 3).unwrap();
        assert_eq!(transport.read("controller_id0").unwrap(), 12);
    }

    #[test]
    fn test_nodes() {
        let mut transport = Mock::new().with_register("other", 1);
        let nodes = transport.nodes(REGFILE_PREFIX).unwrap();
        let nodes: Vec<_> = nodes.iter().map(KString::as_str).collect();
        assert_eq!(nodes, vec![
            "regfile.mode",
            "regfile.scratch",
            "regfile.version"
        ]);
    }
}
