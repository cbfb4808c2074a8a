use log::{error, info};

use structopt::StructOpt;

pub use linux_embedded_hal::sysfs_gpio::Direction;
pub use linux_embedded_hal::{spidev, spidev::SpiModeFlags, Pin as Pindev, Spidev};

use simplelog::{LevelFilter, TermLogger, TerminalMode};

use ihex::Record;

use spi_flash_queue::device::{Status, W25Q16JV};
use spi_flash_queue::host::SpiHost;
use spi_flash_queue::{FlashQueue, Queue};

#[derive(Debug, PartialEq, StructOpt)]
struct Options {
    #[structopt(subcommand)]
    operation: Operations,

    /// SPI device
    #[structopt(long, default_value = "/dev/spidev0.0", env = "SPI_DEV")]
    spi_dev: String,

    /// SPI baud rate
    #[structopt(long, default_value = "1000000", env = "SPI_BAUD")]
    spi_baud: u32,

    /// Chip Select (output) pin
    #[structopt(long, default_value = "8", env = "CS_PIN")]
    cs_pin: u64,

    /// Queue declarations as MAGICHEX:PAYLOAD:CAPACITY, in flash order
    #[structopt(long = "queue")]
    queues: Vec<QueueSpec>,

    /// Configure log level
    #[structopt(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: LevelFilter,
}

#[derive(Debug, PartialEq, StructOpt)]
pub enum Operations {
    /// Read device information
    Info,
    /// Scan the declared queues and print their metadata
    Scan,
    /// Append one record to a queue (sealed early if shorter than the
    /// declared payload size)
    Append {
        /// Queue ordinal
        queue: u8,

        /// Record payload in hexadecimal
        #[structopt(long)]
        data: HexData,
    },
    /// Read the newest complete record of a queue
    Last {
        /// Queue ordinal
        queue: u8,
    },
    /// Raw read, bypassing the queue layout
    Read {
        /// Flash address for read start in hex
        #[structopt(parse(try_from_str = parse_hex))]
        address: u32,
        /// Length of flash read in bytes
        #[structopt()]
        length: u32,
    },
    /// Dump flash into a hex file
    Dump {
        /// Flash address for read start in hex
        #[structopt(parse(try_from_str = parse_hex))]
        address: u32,

        /// Length of flash read in bytes
        #[structopt()]
        length: u32,

        /// Output ihex file
        #[structopt(long, default_value = "dump.ihex")]
        file: String,
    },
    /// Erase all data on the device
    EraseAll,
}

#[derive(Debug, PartialEq)]
pub struct HexData(Vec<u8>);

impl std::str::FromStr for HexData {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        hex::decode(s).map(HexData)
    }
}

/// One `--queue` flag: magic (hex), payload size and capacity.
#[derive(Debug, PartialEq)]
pub struct QueueSpec {
    magic: u32,
    payload: u16,
    capacity: u16,
}

impl std::str::FromStr for QueueSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let magic = parts
            .next()
            .and_then(|p| u32::from_str_radix(p, 16).ok())
            .ok_or("bad magic")?;
        let payload = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or("bad payload size")?;
        let capacity = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or("bad capacity")?;
        if parts.next().is_some() {
            return Err("expected MAGICHEX:PAYLOAD:CAPACITY".into());
        }
        Ok(QueueSpec { magic, payload, capacity })
    }
}

fn parse_hex(s: &str) -> Result<u32, std::num::ParseIntError> {
    u32::from_str_radix(s, 16)
}

type Host = SpiHost<Spidev, Pindev>;

/// Raw read of an arbitrary region, chunked to the scratch buffer size.
///
/// Each chunk is split off `buf` and handed to the driver for good, so the
/// borrows of successive commands never overlap.
fn read_region<'a>(
    drv: &mut FlashQueue<'a>,
    host: &mut Host,
    mut buf: &'a mut [u8],
    mut addr: u32,
    length: usize,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(length);
    let mut remaining = length;
    while remaining > 0 {
        let n = remaining.min(W25Q16JV.page_size as usize);
        let (chunk, tail) = {
            let whole = buf;
            whole.split_at_mut(n)
        };
        drv.read(addr, chunk).unwrap();
        host.run(drv).unwrap();
        out.extend_from_slice(drv.take_read().unwrap());
        buf = tail;
        addr += n as u32;
        remaining -= n;
    }
    out
}

fn scan_and_print(drv: &mut FlashQueue<'_>, host: &mut Host, count: usize) {
    drv.scan().unwrap();
    host.run(drv).unwrap();
    for i in 0..count {
        let q = drv.queue(i as u8).unwrap();
        info!(
            "queue {}: magic {:#010x}, sectors {}..={}, capacity {}, \
             entries {}, id {}..={}, last complete {}, write at {:#010x}",
            i,
            q.magic(),
            q.start_sector(),
            q.stop_sector(),
            q.capacity(),
            q.num_entries(),
            q.id_min(),
            q.id_max(),
            q.last_complete_id(),
            q.start_page_write(),
        );
    }
}

fn main() {
    // Load options
    let opts = Options::from_args();

    // Setup logging
    TermLogger::init(opts.log_level, simplelog::Config::default(), TerminalMode::Mixed).unwrap();

    // Long-lived buffers; command payload borrows share the driver's
    // lifetime, so everything is allocated up front
    let mut queues = [Queue::new(); 8];
    let mut scratch = [0u8; 260];
    let read_len = match &opts.operation {
        Operations::Read { length, .. } | Operations::Dump { length, .. } => *length as usize,
        _ => u16::MAX as usize,
    };
    let mut readback = vec![0u8; read_len];

    // Connect and configure GPIO pin
    let cs_pin = Pindev::new(opts.cs_pin);

    cs_pin.export().unwrap();
    cs_pin.set_direction(Direction::Out).unwrap();

    // Connect and configure SPI device
    let mut spi = Spidev::open(&opts.spi_dev).unwrap();

    let mut spi_config = spidev::SpidevOptions::new();
    spi_config.mode(SpiModeFlags::SPI_MODE_0 | SpiModeFlags::SPI_NO_CS);
    spi_config.max_speed_hz(opts.spi_baud);
    spi.configure(&spi_config).unwrap();

    let mut host = SpiHost::new(spi, cs_pin);

    // Instantiate the queue driver
    let mut drv = match FlashQueue::new(&W25Q16JV, &mut queues, &mut scratch) {
        Ok(d) => d,
        Err(e) => {
            error!("Error initialising driver: {}", e);
            return;
        }
    };
    for spec in &opts.queues {
        if let Err(e) = drv.add_queue(spec.magic, spec.payload, spec.capacity) {
            error!("Error declaring queue {:?}: {}", spec, e);
            return;
        }
    }

    // Perform the requested operation
    match &opts.operation {
        Operations::Info => {
            let dummy = W25Q16JV.read_id_dummy as usize;
            let mut buf = vec![0u8; 1 + dummy + 2];
            buf[0] = W25Q16JV.inst_read_id;
            host.exchange(&mut buf).unwrap();

            info!("Flash ID ({}): {}", W25Q16JV.name, hex::encode(&buf[1 + dummy..]));
        }
        Operations::Scan => {
            scan_and_print(&mut drv, &mut host, opts.queues.len());
        }
        Operations::Append { queue, data } => {
            info!("Appending {} bytes to queue {}", data.0.len(), queue);

            scan_and_print(&mut drv, &mut host, opts.queues.len());
            drv.append(*queue, &data.0).unwrap();
            host.run(&mut drv).unwrap();
            // a short payload still makes a complete record
            drv.finish_append(*queue).unwrap();
            host.run(&mut drv).unwrap();
            scan_and_print(&mut drv, &mut host, opts.queues.len());

            info!("Append complete, id {}", drv.id_max(*queue));
        }
        Operations::Last { queue } => {
            scan_and_print(&mut drv, &mut host, opts.queues.len());
            let len = drv.queue(*queue).unwrap().payload_size() as usize;
            let id = match drv.get_last(*queue, &mut readback) {
                Ok(id) => id,
                Err(e) => {
                    error!("get_last failed: {}", e);
                    return;
                }
            };
            host.run(&mut drv).unwrap();
            let data = drv.take_read().unwrap();

            info!("Record {}: {}", id, hex::encode(&data[..len]));
        }
        Operations::Read { address, length } => {
            info!("Reading {} bytes from address 0x{:08x}", length, address);

            let data = read_region(&mut drv, &mut host, &mut readback, *address, *length as usize);

            info!("Read: {}", hex::encode(&data));
        }
        Operations::Dump { address, length, file } => {
            info!("Reading {} bytes from address 0x{:08x} to file {}", length, address, &file);

            let data = read_region(&mut drv, &mut host, &mut readback, *address, *length as usize);

            let mut records = Vec::new();
            for (c, chunk) in data.chunks(32).enumerate() {
                records.push(Record::Data {
                    offset: (*address as usize + c * 32) as u16,
                    value: chunk.to_vec(),
                });
            }
            records.push(Record::EndOfFile);

            let out = ihex::create_object_file_representation(&records).unwrap();

            std::fs::write(file, out).unwrap();

            info!("Dump complete");
        }
        Operations::EraseAll => {
            info!("Erasing the whole device");

            host.exchange(&mut [W25Q16JV.inst_write_enable]).unwrap();
            host.exchange(&mut [W25Q16JV.inst_erase_bulk]).unwrap();
            loop {
                let mut poll = [W25Q16JV.inst_read_status, 0];
                host.exchange(&mut poll).unwrap();
                if !Status::from_bits_truncate(poll[1]).contains(Status::WIP) {
                    break;
                }
            }

            info!("Full erase complete");
        }
    }
}
