//! Byte-level helpers shared by the demuxers: bounds-checked integer reads,
//! a big-endian bit reader and the CRCs used by FLAC and Ogg.

/// Reads a big-endian integer of `N` bytes at `offset`.
pub(crate) fn be_uint(data: &[u8], offset: usize, len: usize) -> Option<u64> {
    let bytes = data.get(offset..offset.checked_add(len)?)?;
    Some(bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64))
}

/// Reads a little-endian integer of `len` bytes at `offset`.
pub(crate) fn le_uint(data: &[u8], offset: usize, len: usize) -> Option<u64> {
    let bytes = data.get(offset..offset.checked_add(len)?)?;
    Some(bytes.iter().rev().fold(0u64, |acc, &b| (acc << 8) | b as u64))
}

pub(crate) fn be_u16(data: &[u8], offset: usize) -> Option<u16> {
    be_uint(data, offset, 2).map(|v| v as u16)
}

pub(crate) fn be_u32(data: &[u8], offset: usize) -> Option<u32> {
    be_uint(data, offset, 4).map(|v| v as u32)
}

pub(crate) fn le_u16(data: &[u8], offset: usize) -> Option<u16> {
    le_uint(data, offset, 2).map(|v| v as u16)
}

pub(crate) fn le_u32(data: &[u8], offset: usize) -> Option<u32> {
    le_uint(data, offset, 4).map(|v| v as u32)
}

pub(crate) fn le_u64(data: &[u8], offset: usize) -> Option<u64> {
    le_uint(data, offset, 8)
}

/// MSB-first bit reader over a byte slice.
pub(crate) struct BitReader<'a> {
    data: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, bit_pos: 0 }
    }

    /// Reads up to 32 bits.
    pub(crate) fn read(&mut self, bits: u32) -> Option<u32> {
        debug_assert!(bits <= 32);
        let mut value = 0u32;
        for _ in 0..bits {
            let byte = *self.data.get(self.bit_pos / 8)?;
            let bit = (byte >> (7 - (self.bit_pos % 8))) & 1;
            value = (value << 1) | bit as u32;
            self.bit_pos += 1;
        }
        Some(value)
    }

    pub(crate) fn read_u64(&mut self, bits: u32) -> Option<u64> {
        if bits <= 32 {
            return self.read(bits).map(u64::from);
        }
        let high = self.read(bits - 32)? as u64;
        let low = self.read(32)? as u64;
        Some((high << 32) | low)
    }

    pub(crate) fn skip(&mut self, bits: usize) -> Option<()> {
        let end = self.bit_pos.checked_add(bits)?;
        if end > self.data.len() * 8 {
            return None;
        }
        self.bit_pos = end;
        Some(())
    }
}

// ============================================================================
// CRCs
// ============================================================================

const fn crc8_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x80 != 0 { (crc << 1) ^ 0x07 } else { crc << 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const fn crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x8005 } else { crc << 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000_0000 != 0 { (crc << 1) ^ 0x04c1_1db7 } else { crc << 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC8: [u8; 256] = crc8_table();
static CRC16: [u16; 256] = crc16_table();
static CRC32: [u32; 256] = crc32_table();

/// CRC-8 (poly 0x07) protecting FLAC frame headers.
pub(crate) fn crc8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |crc, &b| CRC8[(crc ^ b) as usize])
}

/// CRC-16 (poly 0x8005) protecting whole FLAC frames.
pub(crate) fn crc16(data: &[u8]) -> u16 {
    data.iter()
        .fold(0u16, |crc, &b| (crc << 8) ^ CRC16[((crc >> 8) as u8 ^ b) as usize])
}

/// Ogg page CRC-32 (poly 0x04c11db7, unreflected, zero init).
pub(crate) fn crc32_ogg(data: &[u8]) -> u32 {
    crc32_ogg_update(0, data)
}

pub(crate) fn crc32_ogg_update(crc: u32, data: &[u8]) -> u32 {
    data.iter()
        .fold(crc, |crc, &b| (crc << 8) ^ CRC32[((crc >> 24) as u8 ^ b) as usize])
}
