//! Circular record queues on SPI NOR flash, driven as a non-blocking
//! packet stream.
//!
//! This crate organizes one or more independent circular buffer queues
//! inside a page-erase SPI NOR flash. Each queue stores fixed-capacity,
//! ordered records that survive power loss: every record is bracketed by an
//! 8-byte header and footer carrying the queue's magic number and a
//! monotonically increasing record id, and a record only counts once both
//! tags match bit for bit.
//!
//! The driver never touches an SPI peripheral itself. It produces one
//! request packet at a time in a caller-provided scratch buffer; the host
//! performs the full-duplex exchange and calls the worker again:
//!
//! ```ignore
//! let mut queues = [Queue::new(); 2];
//! let mut scratch = [0u8; 260];
//! let mut drv = FlashQueue::new(&device::W25Q16JV, &mut queues, &mut scratch)?;
//! let q = drv.add_queue(0x4711_4711, 244, 32)?;
//!
//! drv.scan()?;
//! while drv.busy() {
//!     drv.step();
//!     spi_exchange(drv.spi_packet()); // host-owned, full duplex
//! }
//! ```
//!
//! For hosts with a blocking [`embedded-hal`] SPI bus, [`host::SpiHost`]
//! wraps that loop.
//!
//! [`embedded-hal`]: https://docs.rs/embedded-hal/

#![doc(html_root_url = "https://docs.rs/spi-flash-queue/0.1.0")]
#![warn(missing_debug_implementations, rust_2018_idioms)]
#![cfg_attr(not(test), no_std)]

#[macro_use]
mod log;
mod driver;
mod error;
mod packet;
mod queue;
mod utils;
pub mod device;
pub mod host;

pub use crate::driver::FlashQueue;
pub use crate::error::Error;
pub use crate::queue::Queue;
