use anyhow::{Context, Result};
use std::{
    cell::RefCell,
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

/// Where flash-all and update read their images from.
pub trait ImageSource {
    /// Reads a whole entry into memory; `None` when the entry is absent.
    fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Opens an entry as a seekable file positioned at the start.
    fn open_file(&self, name: &str) -> Result<Option<File>>;
}

/// Images stored in an update archive.
pub struct ZipImageSource {
    archive: RefCell<zip::ZipArchive<File>>,
}

impl ZipImageSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Self::from_file(file).with_context(|| format!("failed to read archive {}", path.display()))
    }

    pub fn from_file(file: File) -> Result<Self> {
        let archive = zip::ZipArchive::new(file).context("Failed to open zip archive")?;
        Ok(Self {
            archive: RefCell::new(archive),
        })
    }
}

impl ImageSource for ZipImageSource {
    fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let mut archive = self.archive.borrow_mut();
        let mut entry = match archive.by_name(name) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("failed to read {name} from archive")),
        };
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut data)
            .with_context(|| format!("failed to extract {name}"))?;
        Ok(Some(data))
    }

    fn open_file(&self, name: &str) -> Result<Option<File>> {
        let mut archive = self.archive.borrow_mut();
        let mut entry = match archive.by_name(name) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("failed to read {name} from archive")),
        };
        let mut tmp = tempfile::tempfile().context("Failed to create temp file")?;
        io::copy(&mut entry, &mut tmp).with_context(|| format!("failed to extract {name}"))?;
        tmp.seek(SeekFrom::Start(0))?;
        Ok(Some(tmp))
    }
}

/// Images in a build output directory.
pub struct LocalImageSource {
    dir: PathBuf,
}

impl LocalImageSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ImageSource for LocalImageSource {
    fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.dir.join(name);
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    fn open_file(&self, name: &str) -> Result<Option<File>> {
        let path = self.dir.join(name);
        match File::open(&path) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to open {}", path.display())),
        }
    }
}
