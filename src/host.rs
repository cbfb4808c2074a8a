//! Blocking host loop for [`embedded-hal`] SPI buses.
//!
//! The driver core only stages packets; somebody has to clock them through
//! the flash. Hosts with interrupt-driven SPI do that themselves around
//! [`FlashQueue::step`]. For the common blocking case, [`SpiHost`] owns the
//! bus and chip-select pin and pumps the worker until it goes idle.
//!
//! [`embedded-hal`]: https://docs.rs/embedded-hal/

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

use crate::driver::FlashQueue;

pub use crate::error::HostError;

/// Blocking SPI transport for the worker loop.
///
/// # Type Parameters
///
/// * **`SPI`**: The SPI master to which the flash chip is attached.
/// * **`CS`**: The **C**hip-**S**elect line attached to the `\CS`/`\CE` pin
///   of the flash chip.
#[derive(Debug)]
pub struct SpiHost<SPI: Transfer<u8>, CS: OutputPin> {
    spi: SPI,
    cs: CS,
}

impl<SPI: Transfer<u8>, CS: OutputPin> SpiHost<SPI, CS> {
    /// Creates a host around an SPI master and a chip-select pin.
    ///
    /// The pin is driven low for the duration of each packet exchange.
    pub fn new(spi: SPI, cs: CS) -> Self {
        Self { spi, cs }
    }

    /// Releases the SPI and chip select objects so they can be used
    /// elsewhere.
    pub fn free(self) -> (SPI, CS) {
        (self.spi, self.cs)
    }

    /// Exchanges one packet with the flash, full duplex.
    ///
    /// Used by the worker loop below; also available to hosts that need
    /// instructions outside the queue layout (device ID, bulk erase).
    pub fn exchange(&mut self, bytes: &mut [u8]) -> Result<(), HostError<SPI, CS>> {
        // If the SPI transfer fails, make sure to disable CS anyways
        self.cs.set_low().map_err(HostError::Gpio)?;
        let spi_result = self.spi.transfer(bytes).map_err(HostError::Spi);
        self.cs.set_high().map_err(HostError::Gpio)?;
        spi_result?;
        Ok(())
    }

    /// Drives the armed command to completion.
    ///
    /// Alternates worker turns and packet exchanges until
    /// [`FlashQueue::busy`] clears, then reports any error the worker
    /// latched along the way.
    pub fn run(&mut self, drv: &mut FlashQueue<'_>) -> Result<(), HostError<SPI, CS>> {
        while drv.busy() {
            drv.step();
            if drv.spi_len() == 0 {
                // nothing to clock out this turn
                continue;
            }
            self.exchange(drv.spi_packet())?;
        }
        match drv.last_error() {
            Some(e) => Err(HostError::Driver(e)),
            None => Ok(()),
        }
    }
}
