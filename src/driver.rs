//! The driver handle: command entry points and the cooperative worker.
//!
//! One [`FlashQueue`] exists per flash device. A command entry point
//! validates its preconditions and arms the worker; afterwards the host
//! repeatedly calls [`FlashQueue::step`], clocks the staged packet through
//! the flash full-duplex, and calls [`FlashQueue::step`] again until
//! [`FlashQueue::busy`] clears. The worker itself never blocks and never
//! performs I/O.

use core::fmt;

use crate::device::FlashDevice;
use crate::error::Error;
use crate::packet;
use crate::queue::{Queue, Tag};
use crate::utils::HexSlice;

/// Active high-level operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Idle,
    Scan,
    Append,
    Get,
    Raw,
}

/// Sub-state within a command.
///
/// `S0` is shared by all commands and re-synchronizes with the flash's
/// write-in-progress flag; the meaning of the later stages is
/// command-specific (see the `step_*` methods).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    S0,
    S1,
    S2,
    S3,
    S4,
}

/// Driver handle for a set of circular record queues on one flash device.
///
/// The queue table and the SPI scratch buffer are caller-owned; the scratch
/// buffer must hold at least `page_size + addr_bytes + 1` bytes. Payload
/// buffers passed to [`FlashQueue::append`], [`FlashQueue::get_last`] and
/// [`FlashQueue::read`] are borrowed until the command completes; a read
/// buffer is handed back through [`FlashQueue::take_read`].
pub struct FlashQueue<'a> {
    dev: &'a FlashDevice,
    queues: &'a mut [Queue],
    spi: &'a mut [u8],
    spi_len: u16,
    busy: bool,
    cmd: Command,
    stage: Stage,
    error: Option<Error>,
    // iteration cursors of the in-flight command
    cursor_queue: u8,
    cursor_elem: u16,
    cursor_addr: u32,
    // scan scratch: header of the slot under inspection and whether it is
    // the current id_max candidate
    scan_head: Tag,
    cand: bool,
    erase_done: bool,
    // append state
    wr: Option<&'a [u8]>,
    wr_pos: usize,
    seal: bool,
    // get-last / raw-read state
    rd: Option<&'a mut [u8]>,
    rd_pos: usize,
    rd_len: usize,
}

impl<'a> FlashQueue<'a> {
    /// Creates a driver handle.
    ///
    /// # Parameters
    ///
    /// * **`dev`**: Parameter table of the attached flash chip.
    /// * **`queues`**: Caller-owned queue table; all entries are reset.
    /// * **`spi`**: SPI scratch buffer, staging one transaction at a time.
    pub fn new(
        dev: &'a FlashDevice,
        queues: &'a mut [Queue],
        spi: &'a mut [u8],
    ) -> Result<Self, Error> {
        if !dev.is_sane() {
            return Err(Error::NoFlash);
        }
        if (spi.len() as u32) < dev.page_size + dev.addr_bytes as u32 + 1 {
            return Err(Error::BufferTooSmall);
        }
        for q in queues.iter_mut() {
            *q = Queue::new();
        }
        info!("FlashQueue::new: {}, {} B", dev.name, dev.total_size);
        Ok(FlashQueue {
            dev,
            queues,
            spi,
            spi_len: 0,
            busy: false,
            cmd: Command::Idle,
            stage: Stage::S0,
            error: None,
            cursor_queue: 0,
            cursor_elem: 0,
            cursor_addr: 0,
            scan_head: Tag { magic: 0, id: 0 },
            cand: false,
            erase_done: false,
            wr: None,
            wr_pos: 0,
            seal: false,
            rd: None,
            rd_pos: 0,
            rd_len: 0,
        })
    }

    /// Aborts the in-flight command and returns the worker to idle.
    ///
    /// Queue declarations survive; live metadata of a queue touched by the
    /// aborted command must be rebuilt by a scan. Hosts call this from
    /// their own timeout handling.
    pub fn reset(&mut self) {
        self.cmd = Command::Idle;
        self.stage = Stage::S0;
        self.busy = false;
        self.spi_len = 0;
        self.error = None;
        self.wr = None;
        self.wr_pos = 0;
        self.seal = false;
        self.rd = None;
        self.rd_pos = 0;
        self.rd_len = 0;
    }

    /// Declares a new queue and allocates its sectors.
    ///
    /// Sectors are handed out contiguously in declaration order, starting
    /// at sector 0. The queue is not usable before a [`FlashQueue::scan`]
    /// has rebuilt its metadata.
    ///
    /// # Parameters
    ///
    /// * **`magic`**: Per-queue tag, unique across queues on this flash.
    /// * **`payload_size`**: Fixed payload capacity of one record in bytes.
    /// * **`min_capacity`**: Minimum number of live records to provision.
    pub fn add_queue(
        &mut self,
        magic: u32,
        payload_size: u16,
        min_capacity: u16,
    ) -> Result<u8, Error> {
        if self.busy {
            return Err(Error::WorkerBusy);
        }
        let mut start_sector = 0;
        let mut free = None;
        for (i, q) in self.queues.iter().enumerate() {
            if q.used {
                start_sector = q.stop_sector + 1;
            } else {
                free = Some(i);
                break;
            }
        }
        let i = free.ok_or(Error::NoMemory)?;

        let mut q = Queue::new();
        q.declare(magic, payload_size, min_capacity, start_sector, self.dev);
        let end = (q.stop_sector as u64 + 1) * self.dev.sector_size as u64;
        if end > self.dev.total_size as u64 {
            return Err(Error::FlashFull);
        }
        self.queues[i] = q;
        debug!(
            "add_queue {}: magic {:#010x}, sectors {}..={}, capacity {}",
            i, magic, q.start_sector, q.stop_sector, q.capacity
        );
        Ok(i as u8)
    }

    /// Cached highest record id of a queue; 0 when the queue is unused.
    pub fn id_max(&self, queue: u8) -> u32 {
        match self.queues.get(queue as usize) {
            Some(q) if q.used => q.id_max,
            _ => 0,
        }
    }

    /// Read access to a declared queue's definition and live metadata.
    pub fn queue(&self, queue: u8) -> Option<&Queue> {
        self.queues.get(queue as usize).filter(|q| q.used)
    }

    /// Whether a command is in flight.
    pub fn busy(&self) -> bool {
        self.busy
    }

    /// Length of the pending SPI request; 0 means the scratch buffer is
    /// invalid and must not be clocked out.
    pub fn spi_len(&self) -> u16 {
        self.spi_len
    }

    /// The pending SPI request. The host exchanges exactly these bytes,
    /// full duplex, and leaves the response in place.
    pub fn spi_packet(&mut self) -> &mut [u8] {
        let n = self.spi_len as usize;
        &mut self.spi[..n]
    }

    /// Error latched by the worker, if any.
    pub fn last_error(&self) -> Option<Error> {
        self.error
    }

    /// Hands a completed read buffer back to the caller.
    ///
    /// Returns `None` while a command is still in flight or when no read
    /// buffer is held.
    pub fn take_read(&mut self) -> Option<&'a mut [u8]> {
        if self.busy {
            return None;
        }
        self.rd.take()
    }

    /// Rebuilds the live metadata of every declared queue from flash.
    ///
    /// Required after power-up and after every completed append. When a
    /// queue has no free slot left, the sector holding its oldest record
    /// is erased along the way (FIFO rotation).
    pub fn scan(&mut self) -> Result<(), Error> {
        if self.busy {
            return Err(Error::WorkerBusy);
        }
        debug!("scan: rebuilding metadata of {} queues", self.queues.len());
        self.arm(Command::Scan);
        Ok(())
    }

    /// Appends payload bytes to the queue's next record.
    ///
    /// The first chunk of a record writes the HEADER, the chunk completing
    /// `payload_size` bytes writes the FOOTER; in between, a record may be
    /// built up across several calls. `data` is borrowed until the command
    /// completes. Arming an append invalidates the queue's metadata so
    /// that a crash mid-write forces a rescan on the next boot.
    pub fn append(&mut self, queue: u8, data: &'a [u8]) -> Result<(), Error> {
        if self.busy {
            return Err(Error::WorkerBusy);
        }
        let qi = queue as usize;
        let q = *self
            .queues
            .get(qi)
            .filter(|q| q.used)
            .ok_or(Error::NoSuchQueue)?;
        if !q.is_ready() {
            return Err(Error::QueueNotReady);
        }
        let footer_at = q.payload_size as u32 + Tag::SIZE;
        if q.pl_flash_ofs > footer_at {
            // record already sealed; a scan must move the write pointer on
            return Err(Error::QueueNotReady);
        }
        let written = q.pl_flash_ofs.saturating_sub(Tag::SIZE);
        if written as u64 + data.len() as u64 > q.payload_size as u64 {
            return Err(Error::BufferTooSmall);
        }
        debug!("append: q{}, {} B at record offset {}", queue, data.len(), written);
        self.arm(Command::Append);
        self.cursor_queue = queue;
        self.cursor_addr = q.start_page_write + q.pl_flash_ofs;
        self.wr = Some(data);
        self.queues[qi].mgmt_valid = false;
        Ok(())
    }

    /// Seals the in-progress record early.
    ///
    /// Forces the FOOTER write when at least one payload byte but fewer
    /// than `payload_size` bytes have been committed; the remainder of the
    /// payload region keeps its erased value. A no-op when the record is
    /// already complete or holds no payload byte yet.
    pub fn finish_append(&mut self, queue: u8) -> Result<(), Error> {
        if self.busy {
            return Err(Error::WorkerBusy);
        }
        let qi = queue as usize;
        let q = *self
            .queues
            .get(qi)
            .filter(|q| q.used)
            .ok_or(Error::NoSuchQueue)?;
        if !q.is_ready() {
            return Err(Error::QueueNotReady);
        }
        let footer_at = q.payload_size as u32 + Tag::SIZE;
        if q.pl_flash_ofs <= Tag::SIZE || q.pl_flash_ofs > footer_at {
            return Ok(());
        }
        debug!("finish_append: q{} at record offset {}", queue, q.pl_flash_ofs);
        self.arm(Command::Append);
        self.cursor_queue = queue;
        self.cursor_addr = q.start_page_write + q.pl_flash_ofs;
        self.seal = true;
        self.queues[qi].mgmt_valid = false;
        Ok(())
    }

    /// Reads the newest complete record of a queue.
    ///
    /// Returns the record's id immediately; the payload arrives in `buf`
    /// (clamped to `payload_size`) once the worker finishes. Fails with
    /// [`Error::QueueEmpty`] when no complete record exists.
    pub fn get_last(&mut self, queue: u8, buf: &'a mut [u8]) -> Result<u32, Error> {
        if self.busy {
            return Err(Error::WorkerBusy);
        }
        let q = *self
            .queues
            .get(queue as usize)
            .filter(|q| q.used)
            .ok_or(Error::NoSuchQueue)?;
        if !q.mgmt_valid {
            return Err(Error::QueueNotReady);
        }
        if q.last_complete_id == 0 {
            return Err(Error::QueueEmpty);
        }
        let len = (q.payload_size as usize).min(buf.len());
        debug!("get_last: q{}, id {}, {} B", queue, q.last_complete_id, len);
        self.arm(Command::Get);
        self.cursor_queue = queue;
        self.cursor_addr = q.start_page_id_max + Tag::SIZE;
        self.rd_len = len;
        self.rd = Some(buf);
        Ok(q.last_complete_id)
    }

    /// Raw flash read, bypassing the queue layout.
    ///
    /// One READ_DATA transaction; `buf` plus the instruction overhead must
    /// fit the scratch buffer.
    pub fn read(&mut self, addr: u32, buf: &'a mut [u8]) -> Result<(), Error> {
        if self.busy {
            return Err(Error::WorkerBusy);
        }
        if buf.len() + 1 + self.dev.addr_bytes as usize > self.spi.len() {
            return Err(Error::BufferTooSmall);
        }
        debug!("read: {} B at {:#010x}", buf.len(), addr);
        self.arm(Command::Raw);
        self.cursor_addr = addr;
        self.rd_len = buf.len();
        self.rd = Some(buf);
        Ok(())
    }

    /// Advances the state machine one turn.
    ///
    /// Afterwards the scratch buffer holds the next request packet of
    /// [`FlashQueue::spi_len`] bytes; length 0 means there is nothing to
    /// clock out this turn and the worker wants to be called again.
    pub fn step(&mut self) {
        match self.cmd {
            Command::Idle => self.spi_len = 0,
            Command::Scan => self.step_scan(),
            Command::Append => self.step_append(),
            Command::Get => self.step_read(true),
            Command::Raw => self.step_read(false),
        }
    }

    fn arm(&mut self, cmd: Command) {
        self.cmd = cmd;
        self.stage = Stage::S0;
        self.spi_len = 0;
        self.error = None;
        self.busy = true;
        self.cursor_queue = 0;
        self.cursor_elem = 0;
        self.cursor_addr = 0;
        self.cand = false;
        self.erase_done = false;
        self.wr = None;
        self.wr_pos = 0;
        self.seal = false;
        self.rd = None;
        self.rd_pos = 0;
        self.rd_len = 0;
    }

    fn finish(&mut self) {
        self.cmd = Command::Idle;
        self.stage = Stage::S0;
        self.busy = false;
        self.spi_len = 0;
        self.wr = None;
    }

    fn fault(&mut self) {
        self.error = Some(Error::UnknownState);
        self.finish();
    }

    /// Shared stage S0: poll READ_STATUS until WIP clears.
    ///
    /// Returns `true` when a poll request was staged; `false` once the
    /// flash is idle, with the scratch buffer released for the next stage.
    fn poll_wip(&mut self) -> bool {
        let idle = self.spi_len == 2 && self.spi[1] & self.dev.mask_wip == 0;
        if idle {
            self.spi_len = 0;
            false
        } else {
            self.spi_len = packet::status_poll(self.spi, self.dev.inst_read_status);
            true
        }
    }

    /// Offset of response data in an exchanged READ_DATA packet.
    fn resp_ofs(&self) -> usize {
        1 + self.dev.addr_bytes as usize
    }

    // ---- scan -----------------------------------------------------------

    fn step_scan(&mut self) {
        match self.stage {
            Stage::S0 => {
                if self.poll_wip() {
                    return;
                }
                self.scan_request();
            }
            // header response of the slot under the cursor
            Stage::S1 => {
                let qi = self.cursor_queue as usize;
                let ofs = self.resp_ofs();
                let raw_end = ofs + Tag::SIZE as usize;
                let blank = Tag::is_blank(&self.spi[ofs..raw_end]);
                let tag = Tag::from_le_bytes(&self.spi[ofs..raw_end]);
                let q = self.queues[qi];
                let slot = q.slot_addr(self.cursor_elem, self.dev);

                if !blank && tag.magic == q.magic {
                    let e = &mut self.queues[qi];
                    if tag.id < e.id_min {
                        e.id_min = tag.id;
                        e.start_page_id_min = slot;
                    }
                    if tag.id > e.id_max {
                        e.id_max = tag.id;
                        self.cand = true;
                    } else {
                        self.cand = false;
                    }
                    self.scan_head = tag;
                    let foot = slot + q.elem_bytes(self.dev) - Tag::SIZE;
                    self.spi_len = packet::read(
                        self.spi,
                        self.dev.inst_read_data,
                        foot,
                        self.dev.addr_bytes,
                        Tag::SIZE as usize,
                    );
                    self.stage = Stage::S2;
                    return;
                }
                if blank && !q.mgmt_valid {
                    // first clean slot: this is where the next record goes
                    let e = &mut self.queues[qi];
                    e.start_page_write = slot;
                    e.mgmt_valid = true;
                    trace!("scan: q{} free slot at {:#010x}", qi, slot);
                }
                // clean slots past the first, foreign tags and corrupted
                // padding are all skipped
                self.cursor_elem += 1;
                self.scan_request();
            }
            // footer response: the matching-pair test
            Stage::S2 => {
                let qi = self.cursor_queue as usize;
                let ofs = self.resp_ofs();
                let foot = Tag::from_le_bytes(&self.spi[ofs..ofs + Tag::SIZE as usize]);
                let q = self.queues[qi];
                if foot == self.scan_head && foot.magic == q.magic {
                    let slot = q.slot_addr(self.cursor_elem, self.dev);
                    let e = &mut self.queues[qi];
                    e.num_entries += 1;
                    if self.cand {
                        e.start_page_id_max = slot;
                        e.last_complete_id = foot.id;
                    }
                } else {
                    trace!(
                        "scan: q{} torn record id {} ignored",
                        qi,
                        self.scan_head.id
                    );
                }
                self.stage = Stage::S1;
                self.cursor_elem += 1;
                self.scan_request();
            }
            // WR_ENABLE is on the wire; erase the oldest sector
            Stage::S3 => {
                let qi = self.cursor_queue as usize;
                let q = self.queues[qi];
                let target = if q.id_min == u32::MAX {
                    // nothing decodable survived; reclaim the queue's first
                    // sector to get going again
                    q.start_sector * self.dev.sector_size
                } else {
                    q.start_page_id_min - q.start_page_id_min % self.dev.sector_size
                };
                info!("scan: q{} erasing sector at {:#010x}", qi, target);
                self.spi_len = packet::addressed(
                    self.spi,
                    self.dev.inst_erase_sector,
                    target,
                    self.dev.addr_bytes,
                );
                self.queues[qi].reset_live();
                self.cursor_elem = 0;
                self.stage = Stage::S0;
            }
            Stage::S4 => self.fault(),
        }
    }

    /// Emits the next header read, moves between queues, or starts the
    /// erase sequence when a queue ran out of free slots.
    fn scan_request(&mut self) {
        loop {
            let qi = self.cursor_queue as usize;
            if qi >= self.queues.len() {
                debug!("scan: done");
                self.finish();
                return;
            }
            if !self.queues[qi].used {
                self.cursor_queue += 1;
                continue;
            }
            if self.cursor_elem == 0 {
                // fresh sweep of this queue
                self.queues[qi].reset_live();
            }
            let q = self.queues[qi];
            if self.cursor_elem < q.capacity {
                let addr = q.slot_addr(self.cursor_elem, self.dev);
                self.spi_len = packet::read(
                    self.spi,
                    self.dev.inst_read_data,
                    addr,
                    self.dev.addr_bytes,
                    Tag::SIZE as usize,
                );
                self.stage = Stage::S1;
                return;
            }
            // every slot inspected
            if q.mgmt_valid {
                self.cursor_queue += 1;
                self.cursor_elem = 0;
                self.erase_done = false;
                continue;
            }
            if self.erase_done {
                // an erase freed a sector and the rescan still found no
                // clean slot; the device is not behaving like NOR flash
                self.fault();
                return;
            }
            self.erase_done = true;
            self.spi_len = packet::instruction(self.spi, self.dev.inst_write_enable);
            self.stage = Stage::S3;
            return;
        }
    }

    // ---- append ---------------------------------------------------------

    fn step_append(&mut self) {
        match self.stage {
            Stage::S0 => {
                if self.poll_wip() {
                    return;
                }
                self.stage = Stage::S1;
                self.append_boundary();
            }
            Stage::S1 => self.append_boundary(),
            // program the HEADER (record start) or FOOTER (record end)
            Stage::S2 => {
                let qi = self.cursor_queue as usize;
                let q = self.queues[qi];
                let base = q.start_page_write;
                let elem = q.elem_bytes(self.dev);
                let tag = Tag { magic: q.magic, id: q.id_max + 1 };
                let mut raw = [0u8; Tag::SIZE as usize];
                tag.write_le_bytes(&mut raw);
                let sealing = q.pl_flash_ofs != 0;
                let addr = if sealing { base + elem - Tag::SIZE } else { base };
                self.spi_len = packet::write(
                    self.spi,
                    self.dev.inst_page_program,
                    addr,
                    self.dev.addr_bytes,
                    &raw,
                );
                let e = &mut self.queues[qi];
                if sealing {
                    e.pl_flash_ofs = e.payload_size as u32 + 2 * Tag::SIZE;
                    self.cursor_addr = base + elem;
                    trace!("append: q{} footer, id {}", qi, tag.id);
                } else {
                    e.pl_flash_ofs = Tag::SIZE;
                    self.cursor_addr = base + Tag::SIZE;
                    trace!("append: q{} header, id {}", qi, tag.id);
                }
                self.stage = Stage::S4;
            }
            // program the next payload run, bounded by the page end
            Stage::S3 => {
                let data = self.wr.unwrap_or(&[]);
                let room = (self.dev.page_size - self.cursor_addr % self.dev.page_size) as usize;
                let n = (data.len() - self.wr_pos).min(room);
                self.spi_len = packet::write(
                    self.spi,
                    self.dev.inst_page_program,
                    self.cursor_addr,
                    self.dev.addr_bytes,
                    &data[self.wr_pos..self.wr_pos + n],
                );
                self.wr_pos += n;
                self.cursor_addr += n as u32;
                self.queues[self.cursor_queue as usize].pl_flash_ofs += n as u32;
                self.stage = Stage::S4;
            }
            // release the scratch buffer so S0 re-polls WIP
            Stage::S4 => {
                self.spi_len = 0;
                self.stage = Stage::S0;
            }
        }
    }

    /// Stage S1 of append: classify the write boundary and stage WR_ENABLE
    /// for the sub-operation that is due, or finish the command.
    fn append_boundary(&mut self) {
        let qi = self.cursor_queue as usize;
        let q = self.queues[qi];
        let wr_len = self.wr.map_or(0, |d| d.len());
        let footer_at = q.payload_size as u32 + Tag::SIZE;
        let next = if q.pl_flash_ofs == 0 && !self.seal {
            Some(Stage::S2)
        } else if self.wr_pos < wr_len {
            Some(Stage::S3)
        } else if q.pl_flash_ofs == footer_at
            || (self.seal && q.pl_flash_ofs > Tag::SIZE && q.pl_flash_ofs <= footer_at)
        {
            Some(Stage::S2)
        } else {
            None
        };
        match next {
            Some(stage) => {
                self.spi_len = packet::instruction(self.spi, self.dev.inst_write_enable);
                self.stage = stage;
            }
            None => {
                debug!(
                    "append: q{} done, {} B in record",
                    qi, self.queues[qi].pl_flash_ofs
                );
                self.finish();
            }
        }
    }

    // ---- get-last / raw read --------------------------------------------

    /// `Get` reads page-sized runs of the newest record's payload; `Raw`
    /// is the same loop with the chunk bound lifted to the scratch buffer
    /// (a single transaction, enforced at the entry point).
    fn step_read(&mut self, paged: bool) {
        match self.stage {
            Stage::S0 => {
                if self.poll_wip() {
                    return;
                }
                self.stage = Stage::S1;
                self.read_request(paged);
            }
            // response chunk: move it out of the scratch buffer
            Stage::S2 => {
                let ofs = self.resp_ofs();
                let n = self.spi_len as usize - ofs;
                if let Some(rd) = self.rd.as_mut() {
                    rd[self.rd_pos..self.rd_pos + n].copy_from_slice(&self.spi[ofs..ofs + n]);
                }
                self.rd_pos += n;
                self.read_request(paged);
            }
            _ => self.fault(),
        }
    }

    fn read_request(&mut self, paged: bool) {
        if self.rd_pos < self.rd_len {
            let cap = if paged {
                self.dev.page_size as usize
            } else {
                self.spi.len() - self.resp_ofs()
            };
            let n = (self.rd_len - self.rd_pos).min(cap);
            self.spi_len = packet::read(
                self.spi,
                self.dev.inst_read_data,
                self.cursor_addr,
                self.dev.addr_bytes,
                n,
            );
            self.cursor_addr += n as u32;
            self.stage = Stage::S2;
        } else {
            debug!("read: {} B done", self.rd_pos);
            self.finish();
        }
    }
}

impl fmt::Debug for FlashQueue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlashQueue")
            .field("dev", &self.dev.name)
            .field("cmd", &self.cmd)
            .field("stage", &self.stage)
            .field("busy", &self.busy)
            .field("error", &self.error)
            .field("spi", &HexSlice(&self.spi[..self.spi_len as usize]))
            .field("queues", &self.queues)
            .finish()
    }
}
