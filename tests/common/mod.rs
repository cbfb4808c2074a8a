//! Software model of a W25Q16JV-style SPI NOR flash.
//!
//! Implements the full-duplex packet exchange the driver emits, including
//! write-enable latching and a write-in-progress countdown, so the worker's
//! polling discipline is exercised for real. Protocol violations (missing
//! WR_ENABLE, page-crossing programs, traffic while busy) panic the test.

use spi_flash_queue::device::{FlashDevice, W25Q16JV};
use spi_flash_queue::FlashQueue;

/// Status polls a program or erase stays busy for.
const WIP_CYCLES: u8 = 2;

pub struct FlashModel {
    dev: &'static FlashDevice,
    mem: Vec<u8>,
    wip: u8,
    wel: bool,
    pub programs: u32,
    pub erases: u32,
}

impl FlashModel {
    pub fn new() -> Self {
        let dev = &W25Q16JV;
        FlashModel {
            dev,
            mem: vec![0xFF; dev.total_size as usize],
            wip: 0,
            wel: false,
            programs: 0,
            erases: 0,
        }
    }

    pub fn mem(&self) -> &[u8] {
        &self.mem
    }

    /// Plants a record directly in memory, optionally without its footer,
    /// to set up torn-record and recovery fixtures.
    pub fn install_record(
        &mut self,
        slot_addr: usize,
        elem_bytes: usize,
        magic: u32,
        id: u32,
        payload: &[u8],
        complete: bool,
    ) {
        self.mem[slot_addr..slot_addr + 4].copy_from_slice(&magic.to_le_bytes());
        self.mem[slot_addr + 4..slot_addr + 8].copy_from_slice(&id.to_le_bytes());
        self.mem[slot_addr + 8..slot_addr + 8 + payload.len()].copy_from_slice(payload);
        if complete {
            let foot = slot_addr + elem_bytes - 8;
            self.mem[foot..foot + 4].copy_from_slice(&magic.to_le_bytes());
            self.mem[foot + 4..foot + 8].copy_from_slice(&id.to_le_bytes());
        }
    }

    fn addr(&self, buf: &[u8]) -> usize {
        let mut a = 0usize;
        for &b in &buf[1..1 + self.dev.addr_bytes as usize] {
            a = a << 8 | b as usize;
        }
        a
    }

    /// One full-duplex SPI transaction.
    pub fn exchange(&mut self, buf: &mut [u8]) {
        if buf.is_empty() {
            return;
        }
        let d = self.dev;
        let op = buf[0];
        let ofs = 1 + d.addr_bytes as usize;
        if op == d.inst_read_status {
            assert_eq!(buf.len(), 2, "malformed status poll");
            let mut status = 0u8;
            if self.wip > 0 {
                status |= d.mask_wip;
                self.wip -= 1;
            }
            if self.wel {
                status |= d.mask_wel;
            }
            buf[1] = status;
        } else if op == d.inst_write_enable {
            assert_eq!(buf.len(), 1, "malformed WR_ENABLE");
            self.wel = true;
        } else if op == d.inst_erase_sector {
            assert_eq!(buf.len(), ofs, "malformed ERASE_SECTOR");
            assert!(self.wel, "ERASE_SECTOR without WR_ENABLE");
            assert_eq!(self.wip, 0, "ERASE_SECTOR while write in progress");
            let base = self.addr(buf) & !(d.sector_size as usize - 1);
            for b in &mut self.mem[base..base + d.sector_size as usize] {
                *b = 0xFF;
            }
            self.wel = false;
            self.wip = WIP_CYCLES;
            self.erases += 1;
        } else if op == d.inst_page_program {
            assert!(buf.len() > ofs, "empty PAGE_PROGRAM");
            assert!(self.wel, "PAGE_PROGRAM without WR_ENABLE");
            assert_eq!(self.wip, 0, "PAGE_PROGRAM while write in progress");
            let addr = self.addr(buf);
            let data = &buf[ofs..];
            let page = d.page_size as usize;
            assert_eq!(
                addr / page,
                (addr + data.len() - 1) / page,
                "PAGE_PROGRAM crosses a page boundary"
            );
            for (i, &v) in data.iter().enumerate() {
                // NOR programming can only clear bits
                self.mem[addr + i] &= v;
            }
            self.wel = false;
            self.wip = WIP_CYCLES;
            self.programs += 1;
        } else if op == d.inst_read_data {
            assert!(buf.len() >= ofs, "malformed READ_DATA");
            assert_eq!(self.wip, 0, "READ_DATA while write in progress");
            let addr = self.addr(buf);
            let n = buf.len() - ofs;
            buf[ofs..].copy_from_slice(&self.mem[addr..addr + n]);
        } else {
            panic!("unexpected opcode {:#04x}", op);
        }
    }
}

/// Runs the armed command to completion against the model.
pub fn pump(drv: &mut FlashQueue<'_>, flash: &mut FlashModel) {
    let mut turns = 0u32;
    while drv.busy() {
        drv.step();
        flash.exchange(drv.spi_packet());
        turns += 1;
        assert!(turns < 100_000, "worker did not settle");
    }
    assert_eq!(drv.last_error(), None);
}
