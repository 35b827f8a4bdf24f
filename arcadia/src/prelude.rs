//! Prelude (helpful reexports) for this package

pub use crate::{
    chip::{
        calibration::{
            CalibrationConfig,
            CalibrationReport,
        },
        daq::{
            BackpressurePolicy,
            DaqConfig,
            RunOutcome,
        },
        pixels::{
            PixelSelection,
            ResetAction,
            SectionMask,
            Subsystem,
        },
        ChipMode,
        Icr,
    },
    packet::{
        Packet,
        Sequence,
    },
    transport::{
        mock::Mock,
        LogLevel,
        Transport,
    },
    Chip,
    Error,
    Fpga,
};
