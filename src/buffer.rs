use anyhow::{bail, Context, Result};
use std::{
    fs::File,
    io::{Seek, SeekFrom},
    path::Path,
};

use crate::plan::FlashingPlan;
use crate::sparse::SparseFile;

/// Images larger than this are always split, whatever the device accepts.
pub const RESPARSE_LIMIT: u64 = 1024 * 1024 * 1024;

/// How the bytes of an image file are encoded on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Raw,
    Sparse,
}

/// How an image is sent to the device.
pub enum BufferKind {
    /// Streamed from `file` as is.
    Fd,
    /// Sent as a series of sparse chunks; never empty.
    Sparse(Vec<SparseFile>),
}

/// One image, ready to be flashed.
pub struct FastbootBuffer {
    pub file: File,
    /// Bytes to send for an `Fd` buffer.
    pub size: u64,
    /// Logical size of the image once decoded.
    pub image_size: u64,
    pub file_type: FileType,
    pub kind: BufferKind,
}

/// The chunk size to resparse an image of `size` bytes with, or 0 when it
/// can be sent whole.
pub fn get_sparse_limit(size: u64, plan: &mut FlashingPlan) -> Result<u64> {
    let mut limit = plan.sparse_limit;
    if limit == 0 {
        if plan.is_capturing() {
            bail!("sparse limit is not set");
        }
        limit = plan.target_sparse_limit();
        if limit == 0 {
            return Ok(0);
        }
    }
    if size > limit {
        return Ok(limit.min(RESPARSE_LIMIT));
    }
    Ok(0)
}

pub fn resparse_file(sparse: &SparseFile, max_size: i64) -> Result<Vec<SparseFile>> {
    if max_size <= 0 || max_size > u32::MAX as i64 {
        bail!("invalid max size {max_size}");
    }
    let files = sparse.resparse(max_size as u64)?;
    if files.is_empty() {
        bail!("Failed to resparse");
    }
    Ok(files)
}

fn load_sparse_files(file: &File, max_size: u64) -> Result<Vec<SparseFile>> {
    let sparse = SparseFile::import_auto(file).context("cannot read sparse file")?;
    resparse_file(&sparse, max_size as i64)
}

pub fn load_buf_fd(mut file: File, plan: &mut FlashingPlan) -> Result<FastbootBuffer> {
    let size = file.metadata().context("cannot stat image")?.len();
    let (file_type, image_size) = match SparseFile::import(&file)? {
        Some(sparse) => (FileType::Sparse, sparse.len()),
        None => (FileType::Raw, size),
    };
    file.seek(SeekFrom::Start(0))?;

    let limit = get_sparse_limit(size, plan)?;
    let kind = if limit > 0 {
        BufferKind::Sparse(load_sparse_files(&file, limit)?)
    } else {
        BufferKind::Fd
    };
    file.seek(SeekFrom::Start(0))?;
    Ok(FastbootBuffer {
        file,
        size,
        image_size,
        file_type,
        kind,
    })
}

pub fn load_buf(path: &Path, plan: &mut FlashingPlan) -> Result<FastbootBuffer> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("cannot load '{}'", path.display()))?;
    if !meta.is_file() {
        bail!("cannot load '{}': not a regular file", path.display());
    }
    let file = File::open(path).with_context(|| format!("cannot load '{}'", path.display()))?;
    load_buf_fd(file, plan)
}
