//! Tensor Bundle - checkpoint storage under `variables/`
//!
//! A bundle is `<prefix>.index` (a sorted table of `BundleEntryProto`s keyed
//! by checkpoint key, plus a header under the empty key) and one or more data
//! shards `<prefix>.data-NNNNN-of-NNNNN` holding raw little-endian tensor bytes.

use crate::dtype::DataType;
use crate::graph::TensorShape;
use crate::proto::{BundleEntryProto, BundleHeaderProto};
use crate::table;
use anyhow::{anyhow, bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use candle_core::{Device, Tensor};
use half::{bf16, f16};
use memmap2::Mmap;
use prost::encoding::decode_varint;
use prost::Message;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};

pub fn index_path(prefix: &Path) -> PathBuf {
    with_suffix(prefix, ".index")
}

pub fn shard_path(prefix: &Path, shard_id: usize, num_shards: usize) -> PathBuf {
    with_suffix(
        prefix,
        &format!(".data-{:05}-of-{:05}", shard_id, num_shards),
    )
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut s = OsString::from(prefix.as_os_str());
    s.push(suffix);
    PathBuf::from(s)
}

pub struct TensorBundle {
    prefix: PathBuf,
    entries: BTreeMap<String, BundleEntryProto>,
    shards: Vec<Mmap>,
}

impl TensorBundle {
    pub fn open<P: AsRef<Path>>(prefix: P) -> Result<Self> {
        let prefix = prefix.as_ref().to_path_buf();
        let index_path = index_path(&prefix);
        let bytes = std::fs::read(&index_path)
            .with_context(|| format!("Failed to read bundle index {:?}", index_path))?;

        let mut header = None;
        let mut entries = BTreeMap::new();
        let table = table::read_table(&bytes)
            .with_context(|| format!("Failed to parse bundle index {:?}", index_path))?;
        for (key, value) in table {
            if key.is_empty() {
                header = Some(
                    BundleHeaderProto::decode(value.as_slice()).context("Decoding bundle header")?,
                );
                continue;
            }
            let key = String::from_utf8(key).context("Bundle key is not UTF-8")?;
            let entry = BundleEntryProto::decode(value.as_slice())
                .with_context(|| format!("Decoding bundle entry {:?}", key))?;
            entries.insert(key, entry);
        }

        let header =
            header.ok_or_else(|| anyhow!("Bundle index {:?} has no header entry", index_path))?;
        if header.endianness != 0 {
            bail!("Big-endian tensor bundle {:?} is not supported", index_path);
        }

        let num_shards = usize::try_from(header.num_shards)
            .with_context(|| format!("Bad shard count {}", header.num_shards))?;
        let mut shards = Vec::with_capacity(num_shards);
        for shard_id in 0..num_shards {
            let path = shard_path(&prefix, shard_id, num_shards);
            let file = File::open(&path)
                .with_context(|| format!("Failed to open bundle shard {:?}", path))?;
            let mmap = unsafe { Mmap::map(&file)? };
            shards.push(mmap);
        }

        tracing::info!(
            "TensorBundle: Loaded {:?} (Entries: {}, Shards: {})",
            prefix,
            entries.len(),
            num_shards
        );

        Ok(Self {
            prefix,
            entries,
            shards,
        })
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Checkpoint keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn entry(&self, key: &str) -> Option<&BundleEntryProto> {
        self.entries.get(key)
    }

    pub fn dtype(&self, key: &str) -> Option<DataType> {
        self.entry(key).map(|e| DataType::from_i32(e.dtype))
    }

    pub fn shape(&self, key: &str) -> Option<TensorShape> {
        self.entry(key)
            .map(|e| TensorShape::from_proto(e.shape.as_ref()))
    }

    fn entry_or_err(&self, key: &str) -> Result<&BundleEntryProto> {
        self.entry(key)
            .ok_or_else(|| anyhow!("Key {:?} not found in bundle {:?}", key, self.prefix))
    }

    /// Raw stored bytes of an entry.
    pub fn raw_bytes(&self, key: &str) -> Result<&[u8]> {
        let entry = self.entry_or_err(key)?;
        if !entry.slices.is_empty() {
            bail!(
                "Tensor {:?} is stored as {} slices; partitioned variables are not supported",
                key,
                entry.slices.len()
            );
        }

        let shard = usize::try_from(entry.shard_id)
            .ok()
            .and_then(|id| self.shards.get(id))
            .ok_or_else(|| {
                anyhow!(
                    "Tensor {:?} refers to shard {} but the bundle has {}",
                    key,
                    entry.shard_id,
                    self.shards.len()
                )
            })?;

        let start = usize::try_from(entry.offset)?;
        let len = usize::try_from(entry.size)?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= shard.len())
            .ok_or_else(|| {
                anyhow!(
                    "Tensor {:?} (offset {}, size {}) runs past end of shard {} ({} bytes)",
                    key,
                    start,
                    len,
                    entry.shard_id,
                    shard.len()
                )
            })?;
        Ok(&shard[start..end])
    }

    /// Materialize a numeric entry as a CPU tensor.
    pub fn read_tensor(&self, key: &str) -> Result<Tensor> {
        let entry = self.entry_or_err(key)?;
        let dtype = DataType::from_i32(entry.dtype);
        let shape = TensorShape::from_proto(entry.shape.as_ref());
        let dims = shape
            .known_dims()
            .ok_or_else(|| anyhow!("Tensor {:?} has no fully-defined shape {}", key, shape))?;
        let width = dtype
            .size_in_bytes()
            .ok_or_else(|| anyhow!("Tensor {:?} has non-numeric dtype {}", key, dtype))?;

        let count = shape
            .num_elements()
            .ok_or_else(|| anyhow!("Tensor {:?}: element count of shape {} overflows", key, shape))?;
        let expected = count
            .checked_mul(width)
            .ok_or_else(|| anyhow!("Tensor {:?}: byte size of shape {} overflows", key, shape))?;

        let bytes = self.raw_bytes(key)?;
        if bytes.len() != expected {
            bail!(
                "Tensor {:?}: {} bytes stored, expected {} ({} x {} {})",
                key,
                bytes.len(),
                expected,
                count,
                width,
                dtype
            );
        }

        decode_numeric(dtype, bytes, &dims).with_context(|| format!("Decoding tensor {:?}", key))
    }

    /// Read a scalar string entry (e.g. the serialized object graph).
    pub fn read_string_scalar(&self, key: &str) -> Result<Vec<u8>> {
        let entry = self.entry_or_err(key)?;
        let dtype = DataType::from_i32(entry.dtype);
        if dtype != DataType::String {
            bail!("Tensor {:?} is {}, not a string", key, dtype);
        }

        // [varint64 len][4-byte checksum of lengths][payload]
        let mut cur = self.raw_bytes(key)?;
        let len = decode_varint(&mut cur)
            .with_context(|| format!("Malformed string length in {:?}", key))?
            as usize;
        if cur.len() < 4 + len {
            bail!(
                "String tensor {:?} is truncated ({} bytes for a {}-byte payload)",
                key,
                cur.len(),
                len
            );
        }
        Ok(cur[4..4 + len].to_vec())
    }
}

fn decode_numeric(dtype: DataType, bytes: &[u8], dims: &[usize]) -> Result<Tensor> {
    let device = Device::Cpu;
    let tensor = match dtype {
        DataType::Float => {
            let mut v = vec![0f32; bytes.len() / 4];
            LittleEndian::read_f32_into(bytes, &mut v);
            Tensor::from_vec(v, dims, &device)?
        }
        DataType::Double => {
            let mut v = vec![0f64; bytes.len() / 8];
            LittleEndian::read_f64_into(bytes, &mut v);
            Tensor::from_vec(v, dims, &device)?
        }
        DataType::Half => {
            let v: Vec<f16> = bytes
                .chunks_exact(2)
                .map(|c| f16::from_bits(LittleEndian::read_u16(c)))
                .collect();
            Tensor::from_vec(v, dims, &device)?
        }
        DataType::BFloat16 => {
            let v: Vec<bf16> = bytes
                .chunks_exact(2)
                .map(|c| bf16::from_bits(LittleEndian::read_u16(c)))
                .collect();
            Tensor::from_vec(v, dims, &device)?
        }
        DataType::UInt8 => Tensor::from_vec(bytes.to_vec(), dims, &device)?,
        DataType::Bool => {
            let v: Vec<u8> = bytes.iter().map(|&b| u8::from(b != 0)).collect();
            Tensor::from_vec(v, dims, &device)?
        }
        DataType::UInt32 => {
            let mut v = vec![0u32; bytes.len() / 4];
            LittleEndian::read_u32_into(bytes, &mut v);
            Tensor::from_vec(v, dims, &device)?
        }
        DataType::UInt16 => {
            let v: Vec<u32> = bytes
                .chunks_exact(2)
                .map(|c| u32::from(LittleEndian::read_u16(c)))
                .collect();
            Tensor::from_vec(v, dims, &device)?
        }
        // candle has no narrow signed types; widen to i64
        DataType::Int8 => {
            let v: Vec<i64> = bytes.iter().map(|&b| i64::from(b as i8)).collect();
            Tensor::from_vec(v, dims, &device)?
        }
        DataType::Int16 => {
            let v: Vec<i64> = bytes
                .chunks_exact(2)
                .map(|c| i64::from(LittleEndian::read_i16(c)))
                .collect();
            Tensor::from_vec(v, dims, &device)?
        }
        DataType::Int32 => {
            let mut raw = vec![0i32; bytes.len() / 4];
            LittleEndian::read_i32_into(bytes, &mut raw);
            let v: Vec<i64> = raw.into_iter().map(i64::from).collect();
            Tensor::from_vec(v, dims, &device)?
        }
        DataType::Int64 => {
            let mut v = vec![0i64; bytes.len() / 8];
            LittleEndian::read_i64_into(bytes, &mut v);
            Tensor::from_vec(v, dims, &device)?
        }
        DataType::UInt64 => {
            let mut raw = vec![0u64; bytes.len() / 8];
            LittleEndian::read_u64_into(bytes, &mut raw);
            let v = raw
                .into_iter()
                .map(i64::try_from)
                .collect::<std::result::Result<Vec<i64>, _>>()
                .context("uint64 value does not fit in int64")?;
            Tensor::from_vec(v, dims, &device)?
        }
        other => bail!("Unsupported tensor dtype {}", other),
    };
    Ok(tensor)
}
