//! The DAQ board as a whole: its register transport and the chips attached to it
use crate::{
    chip::{
        daq::RunOutcome,
        spi,
        Chip,
        Icr,
    },
    config::{
        self,
        Entry,
    },
    core::{
        chip_index,
        CHIPS,
        REGFILE_PREFIX,
    },
    transport::{
        LogLevel,
        Transport,
    },
    Error,
};
use kstring::KString;
use std::{
    path::Path,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
    },
};
use tracing::{
    error,
    info,
    warn,
};

/// A connected DAQ board with its three chips
#[derive(Debug)]
pub struct Fpga<T> {
    pub transport: Arc<Mutex<T>>,
    chips: [Chip<T>; CHIPS],
}

impl<T> Fpga<T>
where
    T: Transport,
{
    /// Take ownership of a connected `transport` and bring up the SPI core of every chip.
    /// A chip whose SPI core fails to come up is marked unavailable rather than failing the
    /// whole board. `verbose` chips report FIFO occupancy statistics while acquiring.
    /// # Errors
    /// Returns an error if the transport lock is poisoned
    pub fn new(transport: T, verbose: bool) -> crate::Result<Self> {
        let transport = Arc::new(Mutex::new(transport));
        let mut chips: [Chip<T>; CHIPS] =
            std::array::from_fn(|id| Chip::new(id as u8, &transport, verbose));
        {
            let mut t = transport.lock().map_err(|_| Error::Poisoned)?;
            for chip in &mut chips {
                if let Err(e) = spi::configure(&mut *t, chip.id()) {
                    error!(chip = chip.id(), "SPI core configuration failed: {e}");
                    chip.mark_spi_unavailable();
                }
            }
        }
        Ok(Self {
            transport,
            chips,
        })
    }

    fn lock(&self) -> crate::Result<MutexGuard<'_, T>> {
        self.transport.lock().map_err(|_| Error::Poisoned)
    }

    /// # Errors
    /// Returns an error if there is no chip `id`
    pub fn chip(&self, id: usize) -> crate::Result<&Chip<T>> {
        self.chips.get(id).ok_or(Error::BadChipId(id))
    }

    /// # Errors
    /// Returns an error if there is no chip `id`
    pub fn chip_mut(&mut self, id: usize) -> crate::Result<&mut Chip<T>> {
        self.chips.get_mut(id).ok_or(Error::BadChipId(id))
    }

    #[must_use]
    pub fn chips(&self) -> &[Chip<T>; CHIPS] {
        &self.chips
    }

    pub fn chips_mut(&mut self) -> &mut [Chip<T>; CHIPS] {
        &mut self.chips
    }

    /// Read a board-level register
    /// # Errors
    /// Returns an error on bad transport
    pub fn read_register(&self, node: &str) -> crate::Result<u32> {
        let mut transport = self.lock()?;
        let value = transport.read(node)?;
        transport.dispatch()?;
        Ok(value)
    }

    /// Write a board-level register
    /// # Errors
    /// Returns an error on bad transport
    pub fn write_register(&self, node: &str, value: u32) -> crate::Result<()> {
        let mut transport = self.lock()?;
        transport.write(node, value)?;
        transport.dispatch()?;
        Ok(())
    }

    /// Read every board-level register
    /// # Errors
    /// Returns an error on bad transport
    pub fn dump_registers(&self) -> crate::Result<Vec<(KString, u32)>> {
        let nodes = self.lock()?.nodes(REGFILE_PREFIX)?;
        let mut dump = Vec::with_capacity(nodes.len());
        for node in nodes {
            let value = self.read_register(&node)?;
            info!("{node} = {value:#010x}");
            dump.push((node, value));
        }
        Ok(dump)
    }

    /// Adjust how chatty the transport itself is
    /// # Errors
    /// Returns an error if the transport lock is poisoned
    pub fn set_transport_log_level(&self, level: LogLevel) -> crate::Result<()> {
        self.lock()?.set_log_level(level);
        Ok(())
    }

    fn apply_entry(&mut self, entry: &Entry) -> crate::Result<()> {
        let result = if let Some(id) = chip_index(&entry.section, "controller_id") {
            self.chips[usize::from(id)]
                .send_controller_command(&entry.key, entry.value)
                .map(|_| ())
        } else if let Some(id) = chip_index(&entry.section, "id") {
            let value = u16::try_from(entry.value).map_err(|_| Error::Config {
                line: entry.line,
                reason: format!("{:#x} doesn't fit a 16 bit register", entry.value),
            })?;
            let chip = &mut self.chips[usize::from(id)];
            match entry.key.parse::<Icr>() {
                Ok(icr) => chip.write_icr(icr, value),
                Err(_) => chip.write_gcr_param(&entry.key, value),
            }
        } else {
            warn!(line = entry.line, "Skipping unknown section `{}`", entry.section);
            return Ok(());
        };
        match result {
            Err(Error::UnknownParameter(name) | Error::UnknownCommand(name)) => {
                warn!(line = entry.line, section = %entry.section, "Skipping unknown key `{name}`");
                Ok(())
            }
            other => other,
        }
    }

    /// Apply the configuration in `text` to the chips, in file order
    /// # Errors
    /// Returns an error on malformed text or bad transport
    pub fn apply_config(&mut self, text: &str) -> crate::Result<()> {
        config::for_each_entry(text, |entry| self.apply_entry(&entry))
    }

    /// Apply the configuration file at `path` to the chips
    /// # Errors
    /// Returns an error if the file can't be read, is malformed, or on bad transport
    pub fn read_config<P>(&mut self, path: P) -> crate::Result<()>
    where
        P: AsRef<Path>,
    {
        let text = std::fs::read_to_string(path.as_ref())?;
        info!("Loading configuration from {}", path.as_ref().display());
        self.apply_config(&text)
    }

    /// Ask every running acquisition to stop
    pub fn stop_all(&self) {
        for chip in &self.chips {
            chip.stop();
        }
    }

    /// Wait for every started acquisition to finish. Every worker is joined even if one of them
    /// failed, in which case the first failure is returned.
    /// # Errors
    /// Returns the first error that ended a run
    pub fn wait_all(&mut self) -> crate::Result<[Option<RunOutcome>; CHIPS]> {
        let mut outcomes = [None; CHIPS];
        let mut first_error = None;
        for (chip, outcome) in self.chips.iter_mut().zip(outcomes.iter_mut()) {
            if !chip.daq().has_worker() {
                continue;
            }
            match chip.wait() {
                Ok(o) => *outcome = Some(o),
                Err(e) => {
                    error!(chip = chip.id(), "Acquisition failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::Mock;

    #[test]
    fn test_spi_bringup() {
        let fpga = Fpga::new(Mock::new(), false).unwrap();
        let transport = fpga.transport.lock().unwrap();
        for chip in 0..CHIPS {
            assert_eq!(transport.spi_setup(chip), (spi::CLOCK_DIVIDER, 1));
        }
        drop(transport);
        assert!(fpga.chips().iter().all(|c| !c.spi_unavailable()));
    }

    #[test]
    fn test_failed_bringup_marks_chip() {
        let mut mock = Mock::new();
        mock.fail_nodes("spi_id1");
        let mut fpga = Fpga::new(mock, false).unwrap();
        assert!(!fpga.chip(0).unwrap().spi_unavailable());
        assert!(fpga.chip(1).unwrap().spi_unavailable());
        assert!(!fpga.chip(2).unwrap().spi_unavailable());
        assert!(matches!(
            fpga.chip_mut(1).unwrap().read_gcr(0, true),
            Err(Error::ChipUnavailable(1))
        ));
    }

    #[test]
    fn test_bad_chip_id() {
        let mut fpga = Fpga::new(Mock::new(), false).unwrap();
        assert!(matches!(fpga.chip(3), Err(Error::BadChipId(3))));
        assert!(matches!(fpga.chip_mut(7), Err(Error::BadChipId(7))));
    }

    #[test]
    fn test_registers() {
        let fpga = Fpga::new(Mock::new().with_register("regfile.mode", 2), false).unwrap();
        assert_eq!(fpga.read_register("regfile.mode").unwrap(), 2);
        fpga.write_register("regfile.scratch", 0xcafe).unwrap();
        let dump = fpga.dump_registers().unwrap();
        let dump: Vec<_> = dump.iter().map(|(n, v)| (n.as_str(), *v)).collect();
        assert_eq!(dump, vec![
            ("regfile.mode", 2),
            ("regfile.scratch", 0xcafe),
            ("regfile.version", 0)
        ]);
        assert!(fpga.read_register("regfile.nope").is_err());
    }

    #[test]
    fn test_log_level() {
        let fpga = Fpga::new(Mock::new(), false).unwrap();
        fpga.set_transport_log_level(LogLevel::Warning).unwrap();
        assert_eq!(fpga.transport.lock().unwrap().log_level(), LogLevel::Warning);
    }

    #[test]
    fn test_apply_config() {
        let mut fpga = Fpga::new(Mock::new(), false).unwrap();
        fpga.apply_config(
            "[id1]\nICR1 = 0x3\nLVDS_STRENGTH = 6\nNOT_A_FIELD = 1\n\
             [controller_id1]\nsetTxDataEnable = 0xffff\nnotACommand = 1\n\
             [somewhere_else]\nx = 1\n",
        )
        .unwrap();
        let chip = fpga.chip_mut(1).unwrap();
        assert_eq!(chip.read_gcr_param("LVDS_STRENGTH", true).unwrap(), 6);
        assert_eq!(chip.controller_field("setTxDataEnable"), Some(0xffff));
        let transport = fpga.transport.lock().unwrap();
        assert_eq!(transport.icr(1, 1), 0x3);
        assert_eq!(transport.icr(0, 1), 0);
    }

    #[test]
    fn test_config_value_too_wide() {
        let mut fpga = Fpga::new(Mock::new(), false).unwrap();
        assert!(matches!(
            fpga.apply_config("[id0]\nMAX_READS = 0x10000\n"),
            Err(Error::Config { line: 2, .. })
        ));
    }

    #[test]
    fn test_config_hardware_error_aborts() {
        let mut mock = Mock::new();
        mock.set_spi_stuck(0, true);
        let mut fpga = Fpga::new(mock, false).unwrap();
        assert!(matches!(
            fpga.apply_config("[id0]\nMAX_READS = 2\n[id1]\nMAX_READS = 2\n"),
            Err(Error::Timeout(0))
        ));
        assert_eq!(fpga.chip_mut(1).unwrap().read_gcr_param("MAX_READS", false).unwrap(), 8);
    }

    #[test]
    fn test_wait_all_without_runs() {
        let mut fpga = Fpga::new(Mock::new(), false).unwrap();
        assert_eq!(fpga.wait_all().unwrap(), [None; CHIPS]);
    }
}
