//! Defines the register transport that every connection to an ARCADIA DAQ board must implement

pub mod mock;

use kstring::KString;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Requested node doesn't exist - `{0}`")]
    MissingNode(String),
    #[error("Dispatch of queued transactions failed: {0}")]
    Dispatch(String),
    #[error("Node `{0}` doesn't support block reads")]
    NotABlock(String),
    #[error(transparent)]
    Lower(#[from] anyhow::Error),
}

pub type TransportResult<T> = Result<T, Error>;

/// Verbosity of the log output produced by the transport library itself
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum LogLevel {
    #[default]
    Off,
    Error,
    Warning,
}

/// Types that implement this trait can be packed into a single 32 bit register word
pub trait Serialize {
    /// # Errors
    /// Returns an error if the value can't be represented in a register word
    fn serialize(&self) -> TransportResult<u32>;
}

/// Types that implement this trait can be unpacked from a single 32 bit register word
pub trait Deserialize: Sized {
    /// # Errors
    /// Returns an error if the word doesn't hold a valid `Self`
    fn deserialize(word: u32) -> TransportResult<Self>;
}

impl Serialize for u32 {
    fn serialize(&self) -> TransportResult<u32> {
        Ok(*self)
    }
}

impl Deserialize for u32 {
    fn deserialize(word: u32) -> TransportResult<Self> {
        Ok(word)
    }
}

/// The trait that is implemented for every named-register transport to the DAQ board.
///
/// Writes are queued and only reach the hardware on [`Transport::dispatch`]. A read flushes
/// everything queued ahead of it, so the value returned always reflects earlier writes.
/// The methods of this trait *assume* that the board is already connected.
pub trait Transport: Send {
    /// Queue a write of `value` to the register `node`
    fn write(&mut self, node: &str, value: u32) -> TransportResult<()>;

    /// Read the current value of the register `node`
    fn read(&mut self, node: &str) -> TransportResult<u32>;

    /// Read up to `n` words from the non-incrementing port `node`
    fn read_block(&mut self, node: &str, n: usize) -> TransportResult<Vec<u32>>;

    /// Push every queued transaction to the hardware
    fn dispatch(&mut self) -> TransportResult<()>;

    /// The size in words of `node` as declared in the address table
    fn size(&mut self, node: &str) -> TransportResult<usize>;

    /// List the names of every node that begins with `prefix`
    fn nodes(&mut self, prefix: &str) -> TransportResult<Vec<KString>>;

    /// Adjust how chatty the transport itself is
    fn set_log_level(&mut self, _level: LogLevel) {}

    /// Generically read a `Deserialize` register word from `node`
    /// ```
    /// # use arcadia::transport::{mock::Mock, Transport};
    /// let mut transport = Mock::new().with_register("regfile.mode", 0x55);
    /// let mode: u32 = transport.read_word("regfile.mode").unwrap();
    /// assert_eq!(mode, 0x55);
    /// ```
    fn read_word<W>(&mut self, node: &str) -> TransportResult<W>
    where
        W: Deserialize,
        Self: Sized,
    {
        W::deserialize(self.read(node)?)
    }

    /// Generically queue a write of a `Serialize` register word to `node`
    fn write_word<W>(&mut self, node: &str, word: &W) -> TransportResult<()>
    where
        W: Serialize,
        Self: Sized,
    {
        self.write(node, word.serialize()?)
    }
}
