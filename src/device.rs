//! Flash device descriptors.
//!
//! The driver is chip-agnostic: everything it needs to know about the
//! attached flash (instruction opcodes, address width, page/sector/total
//! sizes and the status-register bit masks) comes from a [`FlashDevice`]
//! the caller injects at construction time. One well-known entry,
//! [`W25Q16JV`], is provided; adding a chip means adding a constant.

use bitflags::bitflags;

bitflags! {
    /// Status register bits of common 25-series NOR chips.
    ///
    /// Only a decoding aid for hosts; the worker itself masks the raw
    /// status byte with [`FlashDevice::mask_wip`].
    pub struct Status: u8 {
        /// Erase or write in progress.
        const WIP = 1 << 0;
        /// Status of the **W**rite **E**nable **L**atch.
        const WEL = 1 << 1;
    }
}

/// Parameter table of one SPI NOR flash chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashDevice {
    /// Chip name, for diagnostics.
    pub name: &'static str,
    /// Read the manufacturer/device ID.
    pub inst_read_id: u8,
    /// Set the write enable latch.
    pub inst_write_enable: u8,
    /// Clear the write enable latch.
    pub inst_write_disable: u8,
    /// Erase the whole chip.
    pub inst_erase_bulk: u8,
    /// Erase the smallest erasable unit.
    pub inst_erase_sector: u8,
    /// Read the status register.
    pub inst_read_status: u8,
    /// Read data.
    pub inst_read_data: u8,
    /// Program within one page.
    pub inst_page_program: u8,
    /// Width of the wire address field in bytes.
    pub addr_bytes: u8,
    /// Smallest erase unit, an integer multiple of `page_size`.
    pub sector_size: u32,
    /// Smallest write unit, a power of two.
    pub page_size: u32,
    /// End of addressable flash.
    pub total_size: u32,
    /// Dummy bytes clocked after `inst_read_id` before the ID appears.
    pub read_id_dummy: u8,
    /// Write-in-progress bit in the status byte.
    pub mask_wip: u8,
    /// Write-enable-latch bit in the status byte.
    pub mask_wel: u8,
}

impl FlashDevice {
    /// Program-aligned pages per erase sector.
    pub fn pages_per_sector(&self) -> u32 {
        self.sector_size / self.page_size
    }

    /// Whether the geometry is self-consistent enough to drive.
    pub(crate) fn is_sane(&self) -> bool {
        self.page_size != 0
            && self.page_size.is_power_of_two()
            && self.sector_size % self.page_size == 0
            && self.addr_bytes > 0
            && self.addr_bytes <= 4
            && self.total_size % self.sector_size == 0
    }
}

/// Winbond W25Q16JV, 2 MiB SPI NOR.
pub const W25Q16JV: FlashDevice = FlashDevice {
    name: "W25Q16JV",
    inst_read_id: 0x90,
    inst_write_enable: 0x06,
    inst_write_disable: 0x04,
    inst_erase_bulk: 0xC7,
    inst_erase_sector: 0x20,
    inst_read_status: 0x05,
    inst_read_data: 0x03,
    inst_page_program: 0x02,
    addr_bytes: 3,
    sector_size: 4096,
    page_size: 256,
    total_size: 2 * 1024 * 1024,
    read_id_dummy: 3,
    mask_wip: Status::WIP.bits(),
    mask_wel: Status::WEL.bits(),
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_w25q16jv_geometry() {
        assert!(W25Q16JV.is_sane());
        assert_eq!(W25Q16JV.pages_per_sector(), 16);
        assert_eq!(W25Q16JV.total_size / W25Q16JV.sector_size, 512);
    }
}
