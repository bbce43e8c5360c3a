//! Sorted Table Reader
//!
//! `variables.index` is an immutable sorted key/value table in the LevelDB
//! layout: data blocks, a metaindex block, an index block, and a 48-byte
//! footer. Only uncompressed blocks are accepted.

use anyhow::{anyhow, bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use prost::encoding::decode_varint;

pub const TABLE_MAGIC: u64 = 0xdb47_7524_8b80_fb57;
pub const FOOTER_LEN: usize = 48;
/// 1 byte compression type + 4 byte CRC
pub const BLOCK_TRAILER_LEN: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        let offset = decode_varint(buf).context("Malformed block handle offset")?;
        let size = decode_varint(buf).context("Malformed block handle size")?;
        Ok(Self { offset, size })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Footer {
    pub metaindex: BlockHandle,
    pub index: BlockHandle,
}

pub fn read_footer(data: &[u8]) -> Result<Footer> {
    if data.len() < FOOTER_LEN {
        bail!(
            "Table is {} bytes, smaller than its {}-byte footer",
            data.len(),
            FOOTER_LEN
        );
    }
    let footer = &data[data.len() - FOOTER_LEN..];
    let magic = LittleEndian::read_u64(&footer[FOOTER_LEN - 8..]);
    if magic != TABLE_MAGIC {
        bail!("Bad table magic: {:#018x}", magic);
    }

    let mut handles = &footer[..FOOTER_LEN - 8];
    let metaindex = BlockHandle::decode(&mut handles)?;
    let index = BlockHandle::decode(&mut handles)?;
    Ok(Footer { metaindex, index })
}

/// Slice out a block's contents (without trailer).
pub fn read_block(data: &[u8], handle: BlockHandle) -> Result<&[u8]> {
    let start = usize::try_from(handle.offset)?;
    let len = usize::try_from(handle.size)?;
    let end = start
        .checked_add(len)
        .filter(|end| end.saturating_add(BLOCK_TRAILER_LEN) <= data.len())
        .ok_or_else(|| {
            anyhow!(
                "Block at offset {} (size {}) runs past end of table ({} bytes)",
                start,
                len,
                data.len()
            )
        })?;

    let compression = data[end];
    if compression != 0 {
        bail!(
            "Compressed table blocks are not supported (block at offset {}, type {})",
            start,
            compression
        );
    }
    Ok(&data[start..end])
}

/// Decode every entry of a block, undoing key prefix compression.
pub fn decode_block(block: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    if block.len() < 4 {
        bail!("Block too short ({} bytes)", block.len());
    }
    let num_restarts = LittleEndian::read_u32(&block[block.len() - 4..]) as usize;
    let restarts_len = num_restarts
        .checked_mul(4)
        .and_then(|n| n.checked_add(4))
        .filter(|&n| n <= block.len())
        .ok_or_else(|| anyhow!("Restart array ({} entries) exceeds block", num_restarts))?;

    let mut cur = &block[..block.len() - restarts_len];
    let mut key: Vec<u8> = Vec::new();
    let mut entries = Vec::new();

    while !cur.is_empty() {
        let shared = decode_varint(&mut cur)? as usize;
        let non_shared = decode_varint(&mut cur)? as usize;
        let value_len = decode_varint(&mut cur)? as usize;

        if shared > key.len() {
            bail!(
                "Entry shares {} bytes with a {}-byte previous key",
                shared,
                key.len()
            );
        }
        let needed = non_shared.saturating_add(value_len);
        if needed > cur.len() {
            bail!("Entry needs {} bytes, {} left in block", needed, cur.len());
        }

        key.truncate(shared);
        key.extend_from_slice(&cur[..non_shared]);
        let value = cur[non_shared..needed].to_vec();
        cur = &cur[needed..];

        entries.push((key.clone(), value));
    }

    Ok(entries)
}

/// Read all key/value pairs of a table, in key order.
pub fn read_table(data: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let footer = read_footer(data)?;
    let index_block = read_block(data, footer.index).context("Reading index block")?;
    let index = decode_block(index_block).context("Decoding index block")?;

    let mut entries = Vec::new();
    for (separator, handle_bytes) in index {
        let handle = BlockHandle::decode(&mut handle_bytes.as_slice())?;
        let block = read_block(data, handle)?;
        let decoded = decode_block(block).with_context(|| {
            format!(
                "Decoding data block before key {:?}",
                String::from_utf8_lossy(&separator)
            )
        })?;
        entries.extend(decoded);
    }

    tracing::debug!("Table: {} entries", entries.len());
    Ok(entries)
}
