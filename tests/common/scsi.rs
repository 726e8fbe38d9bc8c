use std::collections::HashMap;

pub const TEST_UNIT_READY: u8 = 0x00;
pub const REQUEST_SENSE: u8 = 0x03;
pub const INQUIRY: u8 = 0x12;
pub const MODE_SENSE_6: u8 = 0x1A;
pub const READ_CAPACITY_10: u8 = 0x25;
pub const READ_10: u8 = 0x28;
pub const WRITE_10: u8 = 0x2A;
pub const READ_16: u8 = 0x88;
pub const WRITE_16: u8 = 0x8A;
pub const SERVICE_ACTION_IN_16: u8 = 0x9E;

pub const SENSE_NO_SENSE: u8 = 0x00;
pub const SENSE_NOT_READY: u8 = 0x02;
pub const SENSE_MEDIUM_ERROR: u8 = 0x03;
pub const SENSE_ILLEGAL_REQUEST: u8 = 0x05;
pub const SENSE_UNIT_ATTENTION: u8 = 0x06;
pub const SENSE_DATA_PROTECT: u8 = 0x07;

pub const ASC_NOT_READY: u8 = 0x04;
pub const ASC_NO_MEDIA: u8 = 0x3A;
pub const ASC_MEDIA_CHANGE: u8 = 0x28;
pub const ASC_INVALID_OPCODE: u8 = 0x20;
pub const ASC_LBA_OUT_OF_RANGE: u8 = 0x21;
pub const ASC_WRITE_PROTECTED: u8 = 0x27;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Sense {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl Sense {
    pub const fn new(key: u8, asc: u8) -> Self {
        Self { key, asc, ascq: 0 }
    }
}

/// Reply to a single command
#[derive(Debug)]
pub struct Reply {
    pub data: Vec<u8>,
    pub passed: bool,
}

impl Reply {
    fn pass(data: Vec<u8>) -> Self {
        Self { data, passed: true }
    }

    fn fail() -> Self {
        Self {
            data: vec![],
            passed: false,
        }
    }
}

/// A SCSI block device with just enough smarts for the boot command set
pub struct ScsiDisk {
    pub pdt: u8,
    pub removable: bool,
    pub block_size: u32,
    pub blocks: u64,
    pub media_present: bool,
    pub write_protected: bool,
    /// Report a zero block length from READ CAPACITY
    pub zero_block_len: bool,
    /// Fail MODE SENSE as unsupported
    pub no_mode_sense: bool,
    /// Next `n` media commands fail with NOT READY / becoming ready
    pub not_ready_for: usize,
    /// Next media command fails with UNIT ATTENTION / medium changed
    pub unit_attention: bool,
    /// Next `n` INQUIRY commands fail with NOT READY / becoming ready
    pub failing_inquiries: usize,
    /// Next `n` READ/WRITE commands fail with a medium error
    pub medium_errors: usize,
    /// Sense returned by the next REQUEST SENSE, overriding the pending one
    pub forced_sense: Option<Sense>,
    pending_sense: Option<Sense>,
    storage: HashMap<u64, Vec<u8>>,
}

impl ScsiDisk {
    pub fn new(block_size: u32, blocks: u64) -> Self {
        Self {
            pdt: 0x00,
            removable: true,
            block_size,
            blocks,
            media_present: true,
            write_protected: false,
            zero_block_len: false,
            no_mode_sense: false,
            not_ready_for: 0,
            unit_attention: false,
            failing_inquiries: 0,
            medium_errors: 0,
            forced_sense: None,
            pending_sense: None,
            storage: HashMap::new(),
        }
    }

    pub fn pending_sense(&self) -> Option<Sense> {
        self.pending_sense
    }

    pub fn block(&self, lba: u64) -> Vec<u8> {
        self.storage
            .get(&lba)
            .cloned()
            .unwrap_or_else(|| pattern(lba, self.block_size))
    }

    /// Bytes the host is expected to send for a command
    pub fn data_out_len(&self, cdb: &[u8]) -> usize {
        match cdb[0] {
            WRITE_10 => u16::from_be_bytes([cdb[7], cdb[8]]) as usize * self.block_size as usize,
            WRITE_16 => {
                u32::from_be_bytes(cdb[10..14].try_into().unwrap()) as usize
                    * self.block_size as usize
            }
            _ => 0,
        }
    }

    pub fn execute(&mut self, cdb: &[u8], data_out: &[u8]) -> Reply {
        let opcode = cdb[0];
        match opcode {
            REQUEST_SENSE => return Reply::pass(self.sense_data()),
            INQUIRY => return self.inquiry(),
            _ => {}
        }

        if self.not_ready_for > 0 {
            self.not_ready_for -= 1;
            return self.fail(Sense::new(SENSE_NOT_READY, ASC_NOT_READY));
        }
        if self.unit_attention {
            self.unit_attention = false;
            return self.fail(Sense::new(SENSE_UNIT_ATTENTION, ASC_MEDIA_CHANGE));
        }
        if !self.media_present {
            return self.fail(Sense::new(SENSE_NOT_READY, ASC_NO_MEDIA));
        }

        match opcode {
            TEST_UNIT_READY => Reply::pass(vec![]),
            READ_CAPACITY_10 => {
                let last = self.blocks - 1;
                let last = if last > u32::MAX as u64 {
                    u32::MAX
                } else {
                    last as u32
                };
                let mut data = last.to_be_bytes().to_vec();
                data.extend_from_slice(&self.reported_block_len().to_be_bytes());
                Reply::pass(data)
            }
            SERVICE_ACTION_IN_16 if cdb[1] == 0x10 => {
                let mut data = vec![0u8; 32];
                data[..8].copy_from_slice(&(self.blocks - 1).to_be_bytes());
                data[8..12].copy_from_slice(&self.reported_block_len().to_be_bytes());
                data[13] = 0x03; // 8 logical blocks per physical block
                data[15] = 0x07; // lowest aligned LBA 7
                Reply::pass(data)
            }
            MODE_SENSE_6 if !self.no_mode_sense => Reply::pass(vec![
                0x03,
                0x00,
                if self.write_protected { 0x80 } else { 0x00 },
                0x00,
            ]),
            READ_10 | READ_16 => {
                let (lba, count) = block_range(cdb);
                if let Some(reply) = self.check_range(lba, count) {
                    return reply;
                }
                let mut data = vec![];
                for block in lba..lba + count {
                    data.extend_from_slice(&self.block(block));
                }
                Reply::pass(data)
            }
            WRITE_10 | WRITE_16 => {
                let (lba, count) = block_range(cdb);
                if self.write_protected {
                    return self.fail(Sense::new(SENSE_DATA_PROTECT, ASC_WRITE_PROTECTED));
                }
                if let Some(reply) = self.check_range(lba, count) {
                    return reply;
                }
                for (i, chunk) in data_out.chunks(self.block_size as usize).enumerate() {
                    self.storage.insert(lba + i as u64, chunk.to_vec());
                }
                Reply::pass(vec![])
            }
            _ => self.fail(Sense::new(SENSE_ILLEGAL_REQUEST, ASC_INVALID_OPCODE)),
        }
    }

    fn reported_block_len(&self) -> u32 {
        if self.zero_block_len {
            0
        } else {
            self.block_size
        }
    }

    fn check_range(&mut self, lba: u64, count: u64) -> Option<Reply> {
        if lba + count > self.blocks {
            return Some(self.fail(Sense::new(SENSE_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE)));
        }
        if self.medium_errors > 0 {
            self.medium_errors -= 1;
            return Some(self.fail(Sense::new(SENSE_MEDIUM_ERROR, 0x11)));
        }
        None
    }

    fn inquiry(&mut self) -> Reply {
        if self.failing_inquiries > 0 {
            self.failing_inquiries -= 1;
            return self.fail(Sense::new(SENSE_NOT_READY, ASC_NOT_READY));
        }
        let mut data = vec![0u8; 36];
        data[0] = self.pdt;
        data[1] = if self.removable { 0x80 } else { 0x00 };
        data[2] = 0x04;
        data[3] = 0x02;
        data[4] = 31;
        data[8..16].copy_from_slice(b"DUMMY   ");
        data[16..32].copy_from_slice(b"MASS STORAGE    ");
        data[32..36].copy_from_slice(b"1.00");
        Reply::pass(data)
    }

    fn sense_data(&mut self) -> Vec<u8> {
        let sense = self
            .forced_sense
            .take()
            .or(self.pending_sense.take())
            .unwrap_or(Sense::new(SENSE_NO_SENSE, 0));
        let mut data = vec![0u8; 18];
        data[0] = 0x70;
        data[2] = sense.key;
        data[7] = 10;
        data[12] = sense.asc;
        data[13] = sense.ascq;
        data
    }

    fn fail(&mut self, sense: Sense) -> Reply {
        self.pending_sense = Some(sense);
        Reply::fail()
    }
}

fn block_range(cdb: &[u8]) -> (u64, u64) {
    match cdb[0] {
        READ_10 | WRITE_10 => (
            u32::from_be_bytes(cdb[2..6].try_into().unwrap()) as u64,
            u16::from_be_bytes([cdb[7], cdb[8]]) as u64,
        ),
        _ => (
            u64::from_be_bytes(cdb[2..10].try_into().unwrap()),
            u32::from_be_bytes(cdb[10..14].try_into().unwrap()) as u64,
        ),
    }
}

/// Content of a block never written
pub fn pattern(lba: u64, block_size: u32) -> Vec<u8> {
    (0..block_size as u64)
        .map(|i| (lba.wrapping_mul(31).wrapping_add(i) & 0xFF) as u8)
        .collect()
}
