use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;

use crate::CircularMapBuffer;
use crate::Error;
use crate::ExhaustedSlotPolicy;
use crate::SubSystem;
use crate::TRIG_WORD_CNT;
use crate::WORD_SIZE;

/// Size of the map file header in bytes.
pub const MAP_HEADER_LEN: usize = 5 * 4;

/// Header of a map file: five little-endian `u32`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapHeader {
    pub arp_us: u32,
    pub acp_count: u32,
    pub trig_us: u32,
    pub trig_word_size: u32,
    pub block_count: u32,
}

impl MapHeader {
    pub fn read_from<R: Read>(input: &mut R) -> std::io::Result<MapHeader> {
        let mut raw = [0u8; MAP_HEADER_LEN];
        input.read_exact(&mut raw)?;
        let field = |i: usize| {
            u32::from_le_bytes([raw[4 * i], raw[4 * i + 1], raw[4 * i + 2], raw[4 * i + 3]])
        };
        Ok(MapHeader {
            arp_us: field(0),
            acp_count: field(1),
            trig_us: field(2),
            trig_word_size: field(3),
            block_count: field(4),
        })
    }

    pub fn write_to<W: Write>(&self, output: &mut W) -> std::io::Result<()> {
        for v in [
            self.arp_us,
            self.acp_count,
            self.trig_us,
            self.trig_word_size,
            self.block_count,
        ] {
            output.write_all(&v.to_le_bytes())?;
        }
        Ok(())
    }

    /// Bytes per record, derived from the header's own ACP count. `None` if
    /// the size does not fit a `usize`.
    pub fn record_byte_size(&self) -> Option<usize> {
        (self.acp_count as usize)
            .checked_mul(TRIG_WORD_CNT)?
            .checked_mul(WORD_SIZE)
    }

    /// File offset of record `block`.
    pub fn record_offset(&self, block: u64) -> Option<u64> {
        let record = self.record_byte_size()? as u64;
        block
            .checked_mul(record)?
            .checked_add(MAP_HEADER_LEN as u64)
    }
}

/// What a single [`MapLoader::refill`] did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefillReport {
    /// `(absolute block, slot)` for every block loaded, in order.
    pub loaded: Vec<(u64, usize)>,
    /// Slots cleared because the source is exhausted.
    pub zeroed: Vec<usize>,
    /// Nothing was loaded because the hardware has not caught up.
    pub queue_full: bool,
    /// The source has no more blocks to offer.
    pub end_of_data: bool,
}

impl RefillReport {
    pub fn is_idle(&self) -> bool {
        self.loaded.is_empty() && self.zeroed.is_empty()
    }
}

/// Tops up a [`CircularMapBuffer`] from a map file.
pub struct MapLoader<R> {
    subsystem: SubSystem,
    input: R,
    policy: ExhaustedSlotPolicy,
}

impl<R: Read + Seek> MapLoader<R> {
    pub fn new(subsystem: SubSystem, input: R, policy: ExhaustedSlotPolicy) -> MapLoader<R> {
        MapLoader {
            subsystem,
            input,
            policy,
        }
    }

    pub fn into_inner(self) -> R {
        self.input
    }

    fn incompatible(&self, reason: String) -> Error {
        Error::IncompatibleFile {
            subsystem: self.subsystem,
            reason,
        }
    }

    /// Reads the header from the start of the file.
    pub fn header(&mut self) -> Result<MapHeader, Error> {
        self.input.seek(SeekFrom::Start(0))?;
        let header = MapHeader::read_from(&mut self.input)
            .map_err(|e| self.incompatible(format!("unable to read header: {}", e)))?;
        if header.acp_count == 0 && header.block_count > 0 {
            return Err(self.incompatible("header has zero ACP count".to_string()));
        }
        if header.record_byte_size().is_none() {
            return Err(self.incompatible(format!(
                "ACP count {} too large",
                header.acp_count
            )));
        }
        Ok(header)
    }

    /// Loads as many of the next blocks as fit without overwriting slots the
    /// hardware has yet to play, at most one ring worth per call.
    ///
    /// Running out of data is not an error. The header is read again on each
    /// call since the file may be replaced between calls.
    pub fn refill(
        &mut self,
        buffer: &mut CircularMapBuffer,
        current_revision: u64,
    ) -> Result<RefillReport, Error> {
        let tag = self.subsystem.tag();
        let header = self.header()?;
        let record = header
            .record_byte_size()
            .ok_or_else(|| self.incompatible("record size overflow".to_string()))?;
        let capacity = buffer.capacity() as u64;
        let file_len = self.input.seek(SeekFrom::End(0))?;
        let mut report = RefillReport::default();

        if record != buffer.block_byte_size() {
            log::debug!(
                "{}_FILE_BYTE_BLOCK_SIZE={}/{}",
                tag,
                record,
                buffer.block_byte_size()
            );
        }

        let mut queue = buffer.queue_size(current_revision);
        if buffer.next_block() >= u64::from(header.block_count) {
            log::debug!("STOP_{}_EOD={}/{}", tag, buffer.next_block(), header.block_count);
            report.end_of_data = true;
            self.clear_free_slots(buffer, current_revision, &mut report)?;
            return Ok(report);
        }
        if queue >= capacity {
            log::debug!(
                "STOP_{}_QUEUE_FULL={}/{}/{}",
                tag,
                buffer.load_index(),
                current_revision,
                queue
            );
            report.queue_full = true;
            return Ok(report);
        }

        for _ in 0..capacity {
            if queue >= capacity {
                break;
            }
            let block = buffer.next_block();
            if block >= u64::from(header.block_count) {
                log::debug!("STOP_{}_EOD={}/{}", tag, block, header.block_count);
                report.end_of_data = true;
                break;
            }

            let offset = header.record_offset(block);
            let end = offset.and_then(|o| o.checked_add(record as u64));
            let offset = match (offset, end) {
                (Some(offset), Some(end)) if end <= file_len => offset,
                _ => {
                    log::debug!("STOP_{}_EOF={}/{}", tag, block, file_len);
                    report.end_of_data = true;
                    break;
                }
            };
            self.input.seek(SeekFrom::Start(offset))?;

            let slot = buffer.slot_of(buffer.load_index());
            let wanted = record.min(buffer.block_byte_size());
            let copied = buffer.load_slot(slot, wanted, &mut self.input)?;
            if copied < wanted {
                log::debug!("STOP_{}_EOF={}/{}", tag, offset + copied as u64, file_len);
                report.end_of_data = true;
                break;
            }
            // a short record leaves the tail of the slot empty
            buffer.zero_slot(slot, copied)?;

            log::info!(
                "LOAD_{}_ARP_MAP={}/{}/{}/{:#010x}/{}",
                tag,
                block,
                slot,
                offset,
                buffer.slot_physical(slot)?,
                header.block_count
            );
            report.loaded.push((block, slot));
            buffer.advance();
            queue = buffer.queue_size(current_revision);
        }

        if report.end_of_data {
            self.clear_free_slots(buffer, current_revision, &mut report)?;
        }
        log::info!(
            "LOAD_{}_COMPLETE={}/{}/{}",
            tag,
            buffer.load_index(),
            current_revision,
            queue
        );
        Ok(report)
    }

    /// Zeroes the slots the hardware has already played, if asked to.
    fn clear_free_slots(
        &self,
        buffer: &CircularMapBuffer,
        current_revision: u64,
        report: &mut RefillReport,
    ) -> Result<(), Error> {
        if self.policy != ExhaustedSlotPolicy::Zero {
            return Ok(());
        }
        let capacity = buffer.capacity() as u64;
        let free = capacity - buffer.queue_size(current_revision).min(capacity);
        for k in 0..free {
            let slot = buffer.slot_of(buffer.load_index() + k);
            buffer.zero_slot(slot, 0)?;
            report.zeroed.push(slot);
        }
        if free > 0 {
            log::debug!("CLR_{}_FREE_SLOTS={:?}", self.subsystem.tag(), report.zeroed);
        }
        Ok(())
    }
}
