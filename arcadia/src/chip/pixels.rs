//! Section-wide masks, subsystem resets and programming of the pixel configuration registers
use super::{
    Chip,
    Icr,
};
use crate::{
    packet::Pixel,
    transport::Transport,
};
use std::ops::RangeInclusive;
use tracing::debug;

/// ICR0 bit that latches the helper GCRs into the selected pixels' configuration registers
pub const WRITE_PCR: u16 = 1 << 8;

/// Pixel configuration that masks a pixel out of the readout
pub const PCR_MASKED: u8 = 0b11;

/// First GCR word of the pixel configuration helper
pub const HELPER_FIRST_WORD: u16 = 8;

/// GCR words that hold one bit per section
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SectionMask {
    /// Set bits block test pulse injection
    TestPulse,
    /// Set bits exclude a section from the readout
    Read,
    /// Set bits stop a section's clock
    Clock,
    /// Set bits select digital rather than analog injection
    DigitalInjection,
    /// Set bits force injection regardless of the pixels' own configuration
    ForceInjection,
    /// Set bits force every pixel unmasked regardless of its own configuration
    ForceNoMask,
}

impl SectionMask {
    #[must_use]
    pub fn address(self) -> u16 {
        match self {
            SectionMask::TestPulse => 1,
            SectionMask::Read => 2,
            SectionMask::Clock => 3,
            SectionMask::DigitalInjection => 4,
            SectionMask::ForceInjection => 5,
            SectionMask::ForceNoMask => 6,
        }
    }
}

/// On-chip blocks with their own reset line
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Subsystem {
    Chip,
    Gcr,
    Periphery,
    Sections,
    Timestamp,
}

impl Subsystem {
    fn icr_bit(self) -> u16 {
        match self {
            Subsystem::Chip => 3,
            Subsystem::Gcr => 4,
            Subsystem::Periphery => 5,
            Subsystem::Sections => 6,
            Subsystem::Timestamp => 7,
        }
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum ResetAction {
    #[default]
    Pulse,
    Assert,
    Release,
}

impl ResetAction {
    fn icr_bits(self) -> u16 {
        let shift = match self {
            ResetAction::Pulse => 0,
            ResetAction::Assert => 1,
            ResetAction::Release => 2,
        };
        (1 << shift) & 0x7
    }
}

/// A set of pixels whose configuration registers are programmed together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelSelection {
    /// One bit per section
    pub sections: u16,
    /// One bit per double column within each selected section
    pub columns: u16,
    /// Runs of pixel regions, counted from the bottom of the matrix
    pub regions: Vec<RangeInclusive<u8>>,
    /// Halves of each pixel region, 0 for the slave and 1 for the master
    pub halves: Vec<u8>,
    /// One bit per pixel within each selected half
    pub pixels: u8,
}

impl Default for PixelSelection {
    /// Every pixel of the matrix
    fn default() -> Self {
        Self {
            sections: 0xffff,
            columns: 0xffff,
            regions: vec![0..=127],
            halves: vec![0, 1],
            pixels: 0xf,
        }
    }
}

impl From<Pixel> for PixelSelection {
    fn from(pixel: Pixel) -> Self {
        let region = pixel.core_pr() as u8;
        Self {
            sections: 1 << pixel.section(),
            columns: 1 << pixel.double_column(),
            regions: vec![region..=region],
            halves: vec![u8::from(pixel.master())],
            pixels: 1 << pixel.index(),
        }
    }
}

macro_rules! section_controls {
    ($($mask:ident: $set:ident, $clear:ident;)*) => {
        $(
            #[doc = concat!("Set the `", stringify!($mask), "` bits of `sections`, clearing ")]
            #[doc = "every other bit unless `update` is set"]
            /// # Errors
            /// Returns an error on bad transport or if the chip is unavailable
            pub fn $set(&mut self, sections: u16, update: bool) -> crate::Result<()> {
                self.set_sections(SectionMask::$mask, sections, update)
            }

            #[doc = concat!("Clear the `", stringify!($mask), "` bits of `sections`, setting ")]
            #[doc = "every other bit unless `update` is set"]
            /// # Errors
            /// Returns an error on bad transport or if the chip is unavailable
            pub fn $clear(&mut self, sections: u16, update: bool) -> crate::Result<()> {
                self.clear_sections(SectionMask::$mask, sections, update)
            }
        )*
    };
}

impl<T> Chip<T>
where
    T: Transport,
{
    /// Set the bits of `sections` in a section mask. Without `update` the remaining bits are
    /// cleared, otherwise they keep their cached value.
    /// # Errors
    /// Returns an error on bad transport or if the chip is unavailable
    pub fn set_sections(
        &mut self,
        mask: SectionMask,
        sections: u16,
        update: bool,
    ) -> crate::Result<()> {
        let addr = mask.address();
        let base = if update { self.read_gcr(addr, false)? } else { 0 };
        self.write_gcr(addr, base | sections)
    }

    /// Clear the bits of `sections` in a section mask. Without `update` the remaining bits are
    /// set, otherwise they keep their cached value.
    /// # Errors
    /// Returns an error on bad transport or if the chip is unavailable
    pub fn clear_sections(
        &mut self,
        mask: SectionMask,
        sections: u16,
        update: bool,
    ) -> crate::Result<()> {
        let addr = mask.address();
        let base = if update {
            self.read_gcr(addr, false)?
        } else {
            0xffff
        };
        self.write_gcr(addr, base & !sections)
    }

    section_controls! {
        TestPulse: injection_disable, injection_enable;
        Read: read_disable, read_enable;
        Clock: clock_disable, clock_enable;
        DigitalInjection: injection_digital, injection_analog;
        ForceInjection: force_injection, noforce_injection;
        ForceNoMask: force_nomask, noforce_nomask;
    }

    /// Reset one of the chip's subsystems through ICR0
    /// # Errors
    /// Returns an error on bad transport or if the chip is unavailable
    pub fn reset_subsystem(&self, subsystem: Subsystem, action: ResetAction) -> crate::Result<()> {
        debug!(chip = self.id(), ?subsystem, ?action, "Subsystem reset");
        self.write_icr(Icr::Icr0, (1 << subsystem.icr_bit()) | action.icr_bits())
    }

    /// Latch the pixel configuration helper into the pixels it selects
    /// # Errors
    /// Returns an error on bad transport or if the chip is unavailable
    pub fn write_pcr(&self) -> crate::Result<()> {
        self.write_icr(Icr::Icr0, WRITE_PCR)
    }

    /// Program `cfg` into the configuration register of every pixel in `selection`
    /// # Errors
    /// Returns an error on bad transport or if the chip is unavailable
    pub fn pixels_cfg(&mut self, cfg: u8, selection: &PixelSelection) -> crate::Result<()> {
        self.write_gcr_param("HELPER_SECCFG_SECTIONS", selection.sections)?;
        self.write_gcr_param("HELPER_SECCFG_COLUMNS", selection.columns)?;
        for regions in &selection.regions {
            self.write_gcr_param("HELPER_SECCFG_PRSTART", u16::from(*regions.start()))?;
            self.write_gcr_param("HELPER_SECCFG_PRSKIP", 0)?;
            self.write_gcr_param("HELPER_SECCFG_CFGDATA", u16::from(cfg))?;
            self.write_gcr_param("HELPER_SECCFG_PRSTOP", u16::from(*regions.end()))?;
            for half in &selection.halves {
                let select = (u16::from(*half) << 4) | u16::from(selection.pixels & 0xf);
                self.write_gcr_param("HELPER_SECCFG_PIXELSELECT", select)?;
                self.write_pcr()?;
            }
        }
        debug!(chip = self.id(), cfg, ?selection, "Pixels configured");
        Ok(())
    }

    /// # Errors
    /// Returns an error on bad transport or if the chip is unavailable
    pub fn pixel_cfg(&mut self, cfg: u8, pixel: Pixel) -> crate::Result<()> {
        self.pixels_cfg(cfg, &pixel.into())
    }

    /// Mask every pixel in `selection` out of the readout
    /// # Errors
    /// Returns an error on bad transport or if the chip is unavailable
    pub fn pixels_mask(&mut self, selection: &PixelSelection) -> crate::Result<()> {
        self.pixels_cfg(PCR_MASKED, selection)
    }
}
