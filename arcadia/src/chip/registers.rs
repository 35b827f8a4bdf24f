//! Named bit fields of the chip's global configuration registers (GCR) and of the
//! per-chip command words understood by the DAQ board's controller

use std::{
    collections::HashMap,
    sync::OnceLock,
};

/// Number of 16 bit global configuration registers on each chip
pub const GCR_WORDS: usize = 60;

/// Number of command words understood by each chip's controller
pub const CTRL_WORDS: usize = 0x2c;

/// Location and default value of a named field inside a register word
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegisterParam {
    pub word_address: u16,
    /// Field mask, right aligned
    pub mask: u32,
    pub offset: u8,
    pub default_value: u32,
}

impl RegisterParam {
    const fn new(word_address: u16, mask: u32, offset: u8, default_value: u32) -> Self {
        Self {
            word_address,
            mask,
            offset,
            default_value,
        }
    }

    /// The field mask, shifted into place
    #[must_use]
    pub fn field_mask(&self) -> u32 {
        self.mask << self.offset
    }

    /// Replace this field in `word` with `value`, leaving every other bit alone
    #[must_use]
    pub fn insert(&self, word: u32, value: u32) -> u32 {
        (word & !self.field_mask()) | ((value & self.mask) << self.offset)
    }

    /// Pull this field's value out of `word`
    #[must_use]
    pub fn extract(&self, word: u32) -> u32 {
        (word >> self.offset) & self.mask
    }
}

type Table = &'static [(&'static str, RegisterParam)];

const fn p(word_address: u16, mask: u32, offset: u8, default_value: u32) -> RegisterParam {
    RegisterParam::new(word_address, mask, offset, default_value)
}

const GCR_TABLE: Table = &[
    ("READOUT_CLK_DIVIDER", p(0, 0xf, 0, 3)),
    ("TIMING_CLK_DIVIDER", p(0, 0xf, 4, 8)),
    ("MAX_READS", p(0, 0xf, 8, 8)),
    ("TOKEN_COUNTER", p(0, 0xf, 12, 8)),
    ("TEST_PULSE_MASK", p(1, 0xffff, 0, 0)),
    ("SECTION_READ_MASK", p(2, 0xffff, 0, 0)),
    ("SECTION_CLOCK_MASK", p(3, 0xffff, 0, 0)),
    ("DIGITAL_INJECTION", p(4, 0xffff, 0, 0)),
    ("FORCE_ENABLE_INJECTION", p(5, 0xffff, 0, 0xffff)),
    ("FORCE_DISABLE_MASK", p(6, 0xffff, 0, 0xffff)),
    ("OPERATION", p(7, 0x1, 0, 0)),
    ("SERIALIZER_SYNC", p(7, 0x1, 1, 0)),
    ("LVDS_STRENGTH", p(7, 0x7, 2, 4)),
    ("SECTION_CLOCK_GATING", p(7, 0x1, 5, 0)),
    ("TIMESTAMP_LATCHES", p(7, 0x1, 6, 1)),
    ("DISABLE_SMART_READOUT", p(7, 0x1, 7, 0)),
    ("EOS_CLOCK_GATING_ENABLE", p(7, 0x1, 8, 0)),
    ("HELPER_SECCFG_SECTIONS", p(8, 0xffff, 0, 0xffff)),
    ("HELPER_SECCFG_COLUMNS", p(9, 0xffff, 0, 0xffff)),
    ("HELPER_SECCFG_PRSTART", p(10, 0x7f, 0, 0x7f)),
    ("HELPER_SECCFG_PRSKIP", p(10, 0x7f, 7, 0)),
    ("HELPER_SECCFG_CFGDATA", p(10, 0x3, 14, 1)),
    ("HELPER_SECCFG_PRSTOP", p(11, 0x7f, 0, 0)),
    ("HELPER_SECCFG_PIXELSELECT", p(11, 0x1f, 7, 0x1f)),
];

// Every section has three bias words, starting at word 12
macro_rules! bias_sections {
    ($($x:literal)*) => {
        &[$(
            (concat!("BIAS", $x, "_VCAL_LO"), p(12 + $x * 3, 0x1, 0, 0)),
            (concat!("BIAS", $x, "_VCAL_HI"), p(12 + $x * 3, 0xf, 1, 15)),
            (concat!("BIAS", $x, "_VCASD"), p(12 + $x * 3, 0x7, 5, 4)),
            (concat!("BIAS", $x, "_VCASP"), p(12 + $x * 3, 0xf, 8, 4)),
            (concat!("BIAS", $x, "_ISF_VINREF"), p(12 + $x * 3, 0x7, 12, 7)),
            (concat!("BIAS", $x, "_IOTA"), p(12 + $x * 3, 0x1, 15, 0)),
            (concat!("BIAS", $x, "_VCASN"), p(13 + $x * 3, 0x3f, 0, 33)),
            (concat!("BIAS", $x, "_ICLIP"), p(13 + $x * 3, 0x3, 6, 1)),
            (concat!("BIAS", $x, "_IBIAS"), p(13 + $x * 3, 0x3, 8, 2)),
            (concat!("BIAS", $x, "_VREF_LDO"), p(13 + $x * 3, 0x3, 10, 1)),
            (concat!("BIAS", $x, "_IFB"), p(13 + $x * 3, 0x3, 12, 2)),
            (concat!("BIAS", $x, "_ISF"), p(13 + $x * 3, 0x3, 14, 2)),
            (concat!("BIAS", $x, "_BGR_MEAN"), p(14 + $x * 3, 0xf, 0, 7)),
            (concat!("BIAS", $x, "_BGR_SLOPE"), p(14 + $x * 3, 0xf, 4, 7)),
            (concat!("BIAS", $x, "_VINREF"), p(14 + $x * 3, 0x1f, 8, 7)),
            (concat!("BIAS", $x, "_ID"), p(14 + $x * 3, 0x3, 13, 1)),
            (concat!("BIAS", $x, "_LDO_EN"), p(14 + $x * 3, 0x1, 15, 1)),
        )*]
    };
}

const BIAS_TABLE: Table = bias_sections!(0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15);

const CONTROLLER_TABLE: Table = &[
    ("resetIDELAYTCTRL", p(0x01, 0x1, 0, 0)),
    ("resetISERDES", p(0x02, 0x1, 0, 0)),
    ("setIDELAYTap0", p(0x03, 0x1f, 0, 0)),
    ("setIDELAYTap1", p(0x03, 0x1f, 5, 0)),
    ("setIDELAYTap2", p(0x03, 0x1f, 10, 0)),
    ("setIDELAYTap3", p(0x03, 0x1f, 15, 0)),
    ("setIDELAYTap4", p(0x04, 0x1f, 0, 0)),
    ("setIDELAYTap5", p(0x04, 0x1f, 5, 0)),
    ("setIDELAYTap6", p(0x04, 0x1f, 10, 0)),
    ("setIDELAYTap7", p(0x04, 0x1f, 15, 0)),
    ("setIDELAYTap8", p(0x05, 0x1f, 0, 0)),
    ("setIDELAYTap9", p(0x05, 0x1f, 5, 0)),
    ("setIDELAYTapa", p(0x05, 0x1f, 10, 0)),
    ("setIDELAYTapb", p(0x05, 0x1f, 15, 0)),
    ("setIDELAYTapc", p(0x06, 0x1f, 0, 0)),
    ("setIDELAYTapd", p(0x06, 0x1f, 5, 0)),
    ("setIDELAYTape", p(0x06, 0x1f, 10, 0)),
    ("setIDELAYTapf", p(0x06, 0x1f, 15, 0)),
    ("setSyncResetPhase", p(0x07, 0x1, 0, 0)),
    ("doRESET", p(0x08, 0x1, 0, 0)),
    ("resetSPI", p(0x09, 0x1, 0, 0)),
    ("resetCounters", p(0x10, 0x1, 0, 0)),
    ("syncTX", p(0x11, 0xffff, 0, 0)),
    ("readTxState", p(0x12, 0xffff, 0, 0)),
    ("read8b10bErrCounters", p(0x13, 0xf, 0, 0)),
    ("writeTimeStampPeriod", p(0x14, 0xffff, 0, 0)),
    ("resetTimeStampCounter", p(0x15, 0xffff, 0, 0)),
    ("setTxDataEnable", p(0x20, 0xffff, 0, 0)),
    ("loadUserData_0", p(0x21, 0xffff, 0, 0)),
    ("loadUserData_1", p(0x22, 0xffff, 0, 0)),
    ("loadUserData_2", p(0x23, 0xffff, 0, 0)),
    ("loadUserData_3", p(0x24, 0xffff, 0, 0)),
    ("loadUserDataPush", p(0x25, 0x1, 0, 0)),
    ("loadTPOnTime", p(0x26, 0xfffff, 0, 0)),
    ("loadTPOffTime", p(0x27, 0xfffff, 0, 0)),
    ("loadTPNumber", p(0x28, 0xfffff, 0, 0)),
    ("runTPSequence", p(0x29, 0x1, 0, 0)),
    ("loadTSDeltaLSB", p(0x2a, 0xfffff, 0, 0)),
    ("loadTSDeltaMSB", p(0x2b, 0xfffff, 0, 0)),
];

pub type ParamMap = HashMap<&'static str, RegisterParam>;

/// Every named GCR field
pub fn gcr_map() -> &'static ParamMap {
    static MAP: OnceLock<ParamMap> = OnceLock::new();
    MAP.get_or_init(|| GCR_TABLE.iter().chain(BIAS_TABLE).copied().collect())
}

/// Every named controller command
pub fn controller_map() -> &'static ParamMap {
    static MAP: OnceLock<ParamMap> = OnceLock::new();
    MAP.get_or_init(|| CONTROLLER_TABLE.iter().copied().collect())
}

#[must_use]
pub fn gcr_param(name: &str) -> Option<&'static RegisterParam> {
    gcr_map().get(name)
}

#[must_use]
pub fn controller_command(name: &str) -> Option<&'static RegisterParam> {
    controller_map().get(name)
}

/// Name of the controller command that sets the input delay tap of `lane`
#[must_use]
pub fn tap_command(lane: usize) -> String {
    format!("setIDELAYTap{lane:x}")
}

/// The power-on value of GCR word `addr`, built from the defaults of every field that lives in it
#[must_use]
pub fn gcr_default_word(addr: u16) -> u16 {
    let word = gcr_map()
        .values()
        .filter(|param| param.word_address == addr)
        .fold(0, |word, param| param.insert(word, param.default_value));
    // Every GCR field sits inside the low 16 bits
    (word & 0xffff) as u16
}
