//! Android sparse image codec.
//!
//! A [`SparseFile`] describes a logical image as a sorted list of raw and
//! fill chunks; blocks not covered by any chunk are "don't care". Raw
//! chunk data stays in its backing file until it is encoded, so multi
//! gigabyte images never have to be held in memory.

use anyhow::{anyhow, bail, Context, Result};
use std::{
    fs::File,
    io::{self, BufReader, Read, Seek, SeekFrom, Write},
    ops::Range,
    sync::{Arc, Mutex},
};

pub const SPARSE_HEADER_MAGIC: u32 = 0xed26_ff3a;
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

const SPARSE_HEADER_LEN: u64 = 28;
const CHUNK_HEADER_LEN: u64 = 12;

const CHUNK_TYPE_RAW: u16 = 0xcac1;
const CHUNK_TYPE_FILL: u16 = 0xcac2;
const CHUNK_TYPE_DONT_CARE: u16 = 0xcac3;
const CHUNK_TYPE_CRC32: u16 = 0xcac4;

const COPY_BUF_LEN: usize = 1024 * 1024;
/// Raw runs longer than this are stored as several chunks.
const MAX_RAW_CHUNK_LEN: u64 = 64 * 1024 * 1024;

#[derive(Clone)]
enum Backing {
    Bytes(Arc<Vec<u8>>, u64),
    File(Arc<Mutex<File>>, u64),
}

impl Backing {
    fn advance(&self, by: u64) -> Backing {
        match self {
            Backing::Bytes(data, off) => Backing::Bytes(data.clone(), off + by),
            Backing::File(file, off) => Backing::File(file.clone(), off + by),
        }
    }

    /// Streams `len` bytes to `out`, zero padding past the end of the
    /// backing data.
    fn copy_to(&self, out: &mut dyn Write, len: u64) -> Result<()> {
        let mut written = 0u64;
        match self {
            Backing::Bytes(data, off) => {
                let start = (*off as usize).min(data.len());
                let end = (start as u64 + len).min(data.len() as u64) as usize;
                out.write_all(&data[start..end])?;
                written = (end - start) as u64;
            }
            Backing::File(file, off) => {
                let mut file = file
                    .lock()
                    .map_err(|_| anyhow!("sparse backing file lock poisoned"))?;
                file.seek(SeekFrom::Start(*off))?;
                let mut buf = vec![0u8; COPY_BUF_LEN];
                while written < len {
                    let want = (len - written).min(COPY_BUF_LEN as u64) as usize;
                    let n = file.read(&mut buf[..want])?;
                    if n == 0 {
                        break;
                    }
                    out.write_all(&buf[..n])?;
                    written += n as u64;
                }
            }
        }
        write_zeros(out, len - written)
    }

    fn read(&self, len: u64) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len as usize);
        self.copy_to(&mut out, len)?;
        Ok(out)
    }
}

#[derive(Clone)]
enum ChunkData {
    Raw(Backing),
    Fill(u32),
}

#[derive(Clone)]
struct Chunk {
    block: u32,
    blocks: u32,
    data: ChunkData,
}

impl Chunk {
    fn end(&self) -> u32 {
        self.block + self.blocks
    }

    fn encoded_len(&self, block_size: u32) -> u64 {
        match self.data {
            ChunkData::Raw(_) => CHUNK_HEADER_LEN + self.blocks as u64 * block_size as u64,
            ChunkData::Fill(_) => CHUNK_HEADER_LEN + 4,
        }
    }

    /// The part of this chunk inside `[start, end)`.
    fn clip(&self, start: u32, end: u32, block_size: u32) -> Option<Chunk> {
        let s = self.block.max(start);
        let e = self.end().min(end);
        if s >= e {
            return None;
        }
        let data = match &self.data {
            ChunkData::Raw(backing) => {
                ChunkData::Raw(backing.advance((s - self.block) as u64 * block_size as u64))
            }
            ChunkData::Fill(value) => ChunkData::Fill(*value),
        };
        Some(Chunk {
            block: s,
            blocks: e - s,
            data,
        })
    }
}

enum Segment<'a> {
    Skip(u32),
    Chunk(&'a Chunk),
}

#[derive(Clone)]
pub struct SparseFile {
    block_size: u32,
    len: u64,
    chunks: Vec<Chunk>,
    covered: Range<u32>,
}

impl SparseFile {
    pub fn new(block_size: u32, len: u64) -> Result<Self> {
        if block_size == 0 || block_size % 4 != 0 {
            bail!("invalid sparse block size {block_size}");
        }
        let blocks = len.div_ceil(block_size as u64);
        if blocks > u32::MAX as u64 {
            bail!("image of {len} bytes is too large for the sparse format");
        }
        Ok(Self {
            block_size,
            len,
            chunks: Vec::new(),
            covered: 0..blocks as u32,
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Logical (decoded) length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn block_count(&self) -> u32 {
        self.len.div_ceil(self.block_size as u64) as u32
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Byte range of the logical image this file is responsible for. A
    /// whole image covers everything; a resparsed piece covers its share.
    pub fn covered_range(&self) -> Range<u64> {
        let bs = self.block_size as u64;
        let start = (self.covered.start as u64 * bs).min(self.len);
        let end = (self.covered.end as u64 * bs).min(self.len);
        start..end
    }

    fn insert(&mut self, chunk: Chunk) -> Result<()> {
        if chunk.blocks == 0 {
            return Ok(());
        }
        if chunk.end() > self.block_count() {
            bail!(
                "sparse chunk at block {} ({} blocks) exceeds image of {} blocks",
                chunk.block,
                chunk.blocks,
                self.block_count()
            );
        }
        let idx = self.chunks.partition_point(|c| c.block < chunk.block);
        if idx > 0 && self.chunks[idx - 1].end() > chunk.block {
            bail!("sparse chunk at block {} overlaps existing data", chunk.block);
        }
        if idx < self.chunks.len() && chunk.end() > self.chunks[idx].block {
            bail!("sparse chunk at block {} overlaps existing data", chunk.block);
        }
        let block_size = self.block_size;
        let max_blocks = (MAX_RAW_CHUNK_LEN / block_size as u64).max(1) as u32;
        if matches!(chunk.data, ChunkData::Raw(_)) && chunk.blocks > max_blocks {
            let pieces = (chunk.block..chunk.end())
                .step_by(max_blocks as usize)
                .filter_map(|start| {
                    chunk.clip(start, start.saturating_add(max_blocks), block_size)
                });
            self.chunks.splice(idx..idx, pieces);
        } else {
            self.chunks.insert(idx, chunk);
        }
        Ok(())
    }

    pub fn add_data(&mut self, data: Vec<u8>, block: u32) -> Result<()> {
        let blocks = (data.len() as u64).div_ceil(self.block_size as u64) as u32;
        self.insert(Chunk {
            block,
            blocks,
            data: ChunkData::Raw(Backing::Bytes(Arc::new(data), 0)),
        })
    }

    pub fn add_fill(&mut self, value: u32, len: u64, block: u32) -> Result<()> {
        let blocks = len.div_ceil(self.block_size as u64) as u32;
        self.insert(Chunk {
            block,
            blocks,
            data: ChunkData::Fill(value),
        })
    }

    /// Copies every chunk of `image` into this file, shifted to `block`.
    pub fn place(&mut self, image: &SparseFile, block: u32) -> Result<()> {
        if image.block_size != self.block_size {
            bail!(
                "block size mismatch: {} vs {}",
                image.block_size,
                self.block_size
            );
        }
        for chunk in &image.chunks {
            let mut shifted = chunk.clone();
            shifted.block = chunk
                .block
                .checked_add(block)
                .ok_or_else(|| anyhow!("sparse chunk offset overflow"))?;
            self.insert(shifted)?;
        }
        Ok(())
    }

    /// Parses a sparse-format file. Returns `None` (with the file rewound)
    /// when the file does not start with the sparse magic.
    pub fn import(file: &File) -> Result<Option<SparseFile>> {
        let mut reader = file.try_clone().context("failed to duplicate file handle")?;
        reader.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; SPARSE_HEADER_LEN as usize];
        if let Err(e) = reader.read_exact(&mut header) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                reader.seek(SeekFrom::Start(0))?;
                return Ok(None);
            }
            return Err(e.into());
        }
        if le_u32(&header, 0) != SPARSE_HEADER_MAGIC {
            reader.seek(SeekFrom::Start(0))?;
            return Ok(None);
        }
        let major = le_u16(&header, 4);
        let file_hdr_sz = le_u16(&header, 8) as u64;
        let chunk_hdr_sz = le_u16(&header, 10) as u64;
        let block_size = le_u32(&header, 12);
        let total_blocks = le_u32(&header, 16);
        let total_chunks = le_u32(&header, 20);
        if major != 1 {
            bail!("unsupported sparse major version {major}");
        }
        if file_hdr_sz < SPARSE_HEADER_LEN || chunk_hdr_sz < CHUNK_HEADER_LEN {
            bail!("malformed sparse header");
        }

        let mut sparse = SparseFile::new(block_size, total_blocks as u64 * block_size as u64)?;
        let backing = Arc::new(Mutex::new(file.try_clone()?));
        let mut pos = file_hdr_sz;
        let mut block = 0u32;
        reader.seek(SeekFrom::Start(pos))?;
        for index in 0..total_chunks {
            let mut chunk_header = [0u8; CHUNK_HEADER_LEN as usize];
            reader
                .read_exact(&mut chunk_header)
                .with_context(|| format!("truncated sparse chunk header {index}"))?;
            let chunk_type = le_u16(&chunk_header, 0);
            let blocks = le_u32(&chunk_header, 4);
            let total_sz = le_u32(&chunk_header, 8) as u64;
            if total_sz < chunk_hdr_sz {
                bail!("sparse chunk {index} has invalid size {total_sz}");
            }
            let data_pos = pos + chunk_hdr_sz;
            let data_len = total_sz - chunk_hdr_sz;
            match chunk_type {
                CHUNK_TYPE_RAW => {
                    if data_len != blocks as u64 * block_size as u64 {
                        bail!("raw sparse chunk {index} has {data_len} bytes for {blocks} blocks");
                    }
                    sparse.insert(Chunk {
                        block,
                        blocks,
                        data: ChunkData::Raw(Backing::File(backing.clone(), data_pos)),
                    })?;
                }
                CHUNK_TYPE_FILL => {
                    if data_len != 4 {
                        bail!("fill sparse chunk {index} has {data_len} data bytes");
                    }
                    let mut value = [0u8; 4];
                    reader.seek(SeekFrom::Start(data_pos))?;
                    reader.read_exact(&mut value)?;
                    sparse.insert(Chunk {
                        block,
                        blocks,
                        data: ChunkData::Fill(u32::from_le_bytes(value)),
                    })?;
                }
                CHUNK_TYPE_DONT_CARE => {
                    if data_len != 0 {
                        bail!("don't care sparse chunk {index} carries data");
                    }
                }
                CHUNK_TYPE_CRC32 => {
                    if data_len != 4 {
                        bail!("crc sparse chunk {index} has {data_len} data bytes");
                    }
                }
                other => bail!("unknown sparse chunk type {other:#06x}"),
            }
            block = block
                .checked_add(blocks)
                .ok_or_else(|| anyhow!("sparse block count overflow"))?;
            pos = data_pos + data_len;
            reader.seek(SeekFrom::Start(pos))?;
        }
        if block != total_blocks {
            bail!("sparse chunks cover {block} blocks, header says {total_blocks}");
        }
        Ok(Some(sparse))
    }

    /// Imports a sparse-format file, or builds a sparse description of a
    /// raw file where every block made of one repeated 32-bit word becomes
    /// a fill chunk.
    pub fn import_auto(file: &File) -> Result<SparseFile> {
        if let Some(sparse) = Self::import(file)? {
            return Ok(sparse);
        }
        let len = file.metadata()?.len();
        let block_size = DEFAULT_BLOCK_SIZE;
        let mut sparse = SparseFile::new(block_size, len)?;
        let backing = Arc::new(Mutex::new(file.try_clone()?));

        let mut reader = BufReader::with_capacity(COPY_BUF_LEN, file.try_clone()?);
        reader.seek(SeekFrom::Start(0))?;
        let mut buf = vec![0u8; block_size as usize];
        let mut run: Option<Chunk> = None;
        for block in 0..sparse.block_count() {
            let offset = block as u64 * block_size as u64;
            let want = (len - offset).min(block_size as u64) as usize;
            reader.read_exact(&mut buf[..want])?;
            let fill = if want == block_size as usize {
                fill_value(&buf)
            } else {
                None
            };
            let extends = match (&mut run, fill) {
                (Some(Chunk { data: ChunkData::Fill(v), .. }), Some(f)) => *v == f,
                (Some(Chunk { data: ChunkData::Raw(_), .. }), None) => true,
                _ => false,
            };
            if extends {
                if let Some(chunk) = run.as_mut() {
                    chunk.blocks += 1;
                }
                continue;
            }
            if let Some(chunk) = run.take() {
                sparse.insert(chunk)?;
            }
            let data = match fill {
                Some(value) => ChunkData::Fill(value),
                None => ChunkData::Raw(Backing::File(backing.clone(), offset)),
            };
            run = Some(Chunk {
                block,
                blocks: 1,
                data,
            });
        }
        if let Some(chunk) = run {
            sparse.insert(chunk)?;
        }
        Ok(sparse)
    }

    fn segments(&self) -> Vec<Segment<'_>> {
        let mut out = Vec::with_capacity(self.chunks.len() * 2 + 1);
        let mut cursor = 0u32;
        for chunk in &self.chunks {
            if chunk.block > cursor {
                out.push(Segment::Skip(chunk.block - cursor));
            }
            out.push(Segment::Chunk(chunk));
            cursor = chunk.end();
        }
        if self.block_count() > cursor {
            out.push(Segment::Skip(self.block_count() - cursor));
        }
        out
    }

    /// Size of the sparse encoding in bytes.
    pub fn encoded_len(&self) -> u64 {
        SPARSE_HEADER_LEN
            + self
                .segments()
                .iter()
                .map(|s| match s {
                    Segment::Skip(_) => CHUNK_HEADER_LEN,
                    Segment::Chunk(c) => c.encoded_len(self.block_size),
                })
                .sum::<u64>()
    }

    pub fn write_sparse(&self, out: &mut dyn Write) -> Result<()> {
        let segments = self.segments();
        let mut header = Vec::with_capacity(SPARSE_HEADER_LEN as usize);
        header.extend_from_slice(&SPARSE_HEADER_MAGIC.to_le_bytes());
        header.extend_from_slice(&1u16.to_le_bytes());
        header.extend_from_slice(&0u16.to_le_bytes());
        header.extend_from_slice(&(SPARSE_HEADER_LEN as u16).to_le_bytes());
        header.extend_from_slice(&(CHUNK_HEADER_LEN as u16).to_le_bytes());
        header.extend_from_slice(&self.block_size.to_le_bytes());
        header.extend_from_slice(&self.block_count().to_le_bytes());
        header.extend_from_slice(&(segments.len() as u32).to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        out.write_all(&header)?;

        for segment in segments {
            match segment {
                Segment::Skip(blocks) => {
                    write_chunk_header(out, CHUNK_TYPE_DONT_CARE, blocks, CHUNK_HEADER_LEN)?;
                }
                Segment::Chunk(chunk) => {
                    let total = chunk.encoded_len(self.block_size);
                    match &chunk.data {
                        ChunkData::Raw(backing) => {
                            write_chunk_header(out, CHUNK_TYPE_RAW, chunk.blocks, total)?;
                            backing.copy_to(out, total - CHUNK_HEADER_LEN)?;
                        }
                        ChunkData::Fill(value) => {
                            write_chunk_header(out, CHUNK_TYPE_FILL, chunk.blocks, total)?;
                            out.write_all(&value.to_le_bytes())?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Writes the data chunks into `image`, growing it to the logical length.
    /// Don't-care regions are left untouched.
    pub fn apply_to(&self, image: &mut Vec<u8>) -> Result<()> {
        if (image.len() as u64) < self.len {
            image.resize(self.len as usize, 0);
        }
        let bs = self.block_size as u64;
        for chunk in &self.chunks {
            let start = chunk.block as u64 * bs;
            let end = (chunk.end() as u64 * bs).min(self.len);
            if start >= end {
                continue;
            }
            let dest = &mut image[start as usize..end as usize];
            match &chunk.data {
                ChunkData::Raw(backing) => {
                    let data = backing.read(end - start)?;
                    dest.copy_from_slice(&data);
                }
                ChunkData::Fill(value) => {
                    let pattern = value.to_le_bytes();
                    for (i, byte) in dest.iter_mut().enumerate() {
                        *byte = pattern[i % 4];
                    }
                }
            }
        }
        Ok(())
    }

    /// Sizing pass: block boundaries of pieces whose encodings fit in
    /// `max_len`. The first boundary is 0 and the last is the block count.
    fn resparse_boundaries(&self, max_len: u64) -> Result<Vec<u32>> {
        let bs = self.block_size as u64;
        // header plus a leading and a trailing skip chunk
        let overhead = SPARSE_HEADER_LEN + 2 * CHUNK_HEADER_LEN;
        if max_len <= overhead + CHUNK_HEADER_LEN + bs {
            bail!("sparse limit {max_len} cannot hold a single {bs} byte block");
        }
        let budget = max_len - overhead;

        let mut boundaries = vec![0u32];
        let mut used = 0u64;
        let mut last_end: Option<u32> = None;
        let mut idx = 0usize;
        let mut pos = self.chunks.first().map(|c| c.block).unwrap_or(0);
        while idx < self.chunks.len() {
            let chunk = &self.chunks[idx];
            let start = pos.max(chunk.block);
            let blocks = chunk.end() - start;
            let gap = match last_end {
                Some(end) if start > end => CHUNK_HEADER_LEN,
                _ => 0,
            };
            let cost = match chunk.data {
                ChunkData::Raw(_) => CHUNK_HEADER_LEN + blocks as u64 * bs,
                ChunkData::Fill(_) => CHUNK_HEADER_LEN + 4,
            };
            if used + gap + cost <= budget {
                used += gap + cost;
                last_end = Some(chunk.end());
                idx += 1;
                if let Some(next) = self.chunks.get(idx) {
                    pos = next.block;
                }
                continue;
            }

            let remaining = budget - used;
            let piece_empty = last_end.is_none();
            if let ChunkData::Raw(_) = chunk.data {
                let room = remaining.saturating_sub(gap + CHUNK_HEADER_LEN) / bs;
                if room >= 1 && (piece_empty || remaining > budget / 8) {
                    let split = start + room as u32;
                    boundaries.push(split);
                    pos = split;
                    used = 0;
                    last_end = None;
                    continue;
                }
            }
            if piece_empty {
                bail!("sparse limit {max_len} is too small for chunk at block {start}");
            }
            boundaries.push(start);
            used = 0;
            last_end = None;
        }
        boundaries.push(self.block_count());
        boundaries.dedup();
        if boundaries.len() == 1 {
            boundaries.push(self.block_count());
        }
        Ok(boundaries)
    }

    /// Splits this image into independently decodable files, each encoding
    /// to at most `max_len` bytes.
    pub fn resparse(&self, max_len: u64) -> Result<Vec<SparseFile>> {
        let boundaries = self.resparse_boundaries(max_len)?;
        let mut pieces = Vec::with_capacity(boundaries.len() - 1);
        for window in boundaries.windows(2) {
            let (start, end) = (window[0], window[1]);
            let chunks = self
                .chunks
                .iter()
                .filter_map(|c| c.clip(start, end, self.block_size))
                .collect();
            pieces.push(SparseFile {
                block_size: self.block_size,
                len: self.len,
                chunks,
                covered: start..end,
            });
        }
        Ok(pieces)
    }
}

fn fill_value(block: &[u8]) -> Option<u32> {
    let first = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
    block
        .chunks_exact(4)
        .all(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]) == first)
        .then_some(first)
}

fn write_chunk_header(out: &mut dyn Write, chunk_type: u16, blocks: u32, total: u64) -> Result<()> {
    let mut header = [0u8; CHUNK_HEADER_LEN as usize];
    header[0..2].copy_from_slice(&chunk_type.to_le_bytes());
    header[4..8].copy_from_slice(&blocks.to_le_bytes());
    let total = u32::try_from(total)
        .map_err(|_| anyhow!("sparse chunk of {total} bytes does not fit the chunk header"))?;
    header[8..12].copy_from_slice(&total.to_le_bytes());
    out.write_all(&header)?;
    Ok(())
}

fn write_zeros(out: &mut dyn Write, mut len: u64) -> Result<()> {
    let zeros = [0u8; 4096];
    while len > 0 {
        let n = len.min(zeros.len() as u64) as usize;
        out.write_all(&zeros[..n])?;
        len -= n as u64;
    }
    Ok(())
}

fn le_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn le_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_detection() {
        assert_eq!(fill_value(&[0u8; 4096]), Some(0));
        let mut block = [0xabu8; 4096];
        assert_eq!(fill_value(&block), Some(0xabab_abab));
        block[7] = 1;
        assert_eq!(fill_value(&block), None);
    }

    #[test]
    fn gaps_are_encoded_as_skips() {
        let mut sparse = SparseFile::new(4096, 10 * 4096).unwrap();
        sparse.add_data(vec![1u8; 4096], 2).unwrap();
        sparse.add_fill(7, 4096 * 2, 5).unwrap();
        // skip, raw, skip, fill, skip
        assert_eq!(sparse.segments().len(), 5);
        assert_eq!(sparse.encoded_len(), 28 + 12 + (12 + 4096) + 12 + 16 + 12);
        let mut out = Vec::new();
        sparse.write_sparse(&mut out).unwrap();
        assert_eq!(out.len() as u64, sparse.encoded_len());
    }

    #[test]
    fn long_raw_runs_are_split() {
        let max_blocks = (MAX_RAW_CHUNK_LEN / 4096) as u32;
        let blocks = 2 * max_blocks + 1;
        let mut sparse = SparseFile::new(4096, blocks as u64 * 4096).unwrap();
        sparse
            .insert(Chunk {
                block: 0,
                blocks,
                data: ChunkData::Raw(Backing::Bytes(Arc::new(vec![9u8; 4096]), 0)),
            })
            .unwrap();

        assert_eq!(sparse.chunk_count(), 3);
        let sizes: Vec<u32> = sparse.chunks.iter().map(|c| c.blocks).collect();
        assert_eq!(sizes, [max_blocks, max_blocks, 1]);
        assert_eq!(sparse.chunks[1].block, max_blocks);
        assert!(sparse
            .chunks
            .iter()
            .all(|c| c.encoded_len(4096) <= u32::MAX as u64));
        assert_eq!(
            sparse.encoded_len(),
            28 + 3 * 12 + blocks as u64 * 4096
        );
    }

    #[test]
    fn oversized_chunk_headers_are_refused() {
        let mut out = Vec::new();
        assert!(write_chunk_header(&mut out, CHUNK_TYPE_RAW, 1, 1 << 32).is_err());
        assert!(out.is_empty());
        write_chunk_header(&mut out, CHUNK_TYPE_RAW, 1, 4096 + 12).unwrap();
        assert_eq!(out.len(), 12);
    }

    #[test]
    fn overlapping_chunks_are_rejected() {
        let mut sparse = SparseFile::new(4096, 4 * 4096).unwrap();
        sparse.add_fill(0, 2 * 4096, 0).unwrap();
        assert!(sparse.add_data(vec![1u8; 10], 1).is_err());
        assert!(sparse.add_fill(0, 4096, 4).is_err());
    }
}
