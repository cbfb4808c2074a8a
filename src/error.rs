use core::fmt::{self, Debug, Display};
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

mod private {
    #[derive(Debug)]
    pub enum Private {}
}

/// Result codes of the driver's command entry points.
///
/// All of these are detected synchronously, before the worker is armed; the
/// one exception is [`Error::UnknownState`], which is latched on the handle
/// when the worker trips an internal invariant and is surfaced through
/// [`FlashQueue::last_error`](crate::FlashQueue::last_error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The flash descriptor is unusable (zero page size, inconsistent
    /// sector geometry).
    NoFlash,
    /// No free slot in the caller-provided queue table.
    NoMemory,
    /// The requested queue allocation runs past the end of the flash.
    FlashFull,
    /// A command is already in flight.
    WorkerBusy,
    /// No queue with that ordinal has been declared.
    NoSuchQueue,
    /// The queue's live metadata is stale; run a scan first.
    QueueNotReady,
    /// The request does not fit the scratch buffer or payload region.
    BufferTooSmall,
    /// The queue holds no complete record.
    QueueEmpty,
    /// The worker reached a command/stage combination it never should.
    UnknownState,
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::NoFlash => "flash descriptor unusable",
            Error::NoMemory => "no free queue slot",
            Error::FlashFull => "queue allocation exceeds flash size",
            Error::WorkerBusy => "command already in flight",
            Error::NoSuchQueue => "no such queue",
            Error::QueueNotReady => "queue metadata stale, scan required",
            Error::BufferTooSmall => "buffer too small",
            Error::QueueEmpty => "queue holds no complete record",
            Error::UnknownState => "worker reached an unknown state",
        };
        f.write_str(msg)
    }
}

/// The error type of the blocking [`host`](crate::host) adapter.
///
/// This can encapsulate an SPI or GPIO error, and adds the driver's own
/// result codes on top of that.
pub enum HostError<SPI: Transfer<u8>, CS: OutputPin> {
    /// An SPI transfer failed.
    Spi(SPI::Error),

    /// A GPIO could not be set.
    Gpio(CS::Error),

    /// The driver rejected or aborted the command.
    Driver(Error),

    #[doc(hidden)]
    __NonExhaustive(private::Private),
}

impl<SPI: Transfer<u8>, CS: OutputPin> From<Error> for HostError<SPI, CS> {
    fn from(e: Error) -> Self {
        HostError::Driver(e)
    }
}

impl<SPI: Transfer<u8>, CS: OutputPin> Debug for HostError<SPI, CS>
where
    SPI::Error: Debug,
    CS::Error: Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::Spi(spi) => write!(f, "HostError::Spi({:?})", spi),
            HostError::Gpio(gpio) => write!(f, "HostError::Gpio({:?})", gpio),
            HostError::Driver(e) => write!(f, "HostError::Driver({:?})", e),
            HostError::__NonExhaustive(_) => unreachable!(),
        }
    }
}

impl<SPI: Transfer<u8>, CS: OutputPin> Display for HostError<SPI, CS>
where
    SPI::Error: Display,
    CS::Error: Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::Spi(spi) => write!(f, "SPI error: {}", spi),
            HostError::Gpio(gpio) => write!(f, "GPIO error: {}", gpio),
            HostError::Driver(e) => write!(f, "driver error: {}", e),
            HostError::__NonExhaustive(_) => unreachable!(),
        }
    }
}
