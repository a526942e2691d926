/// Shared memory region management using mmap.
///
/// Creates or opens a named memory-mapped file that backs the whole
/// allocator heap: allocator header, cache shell, and every entry pool.
/// Unlike ephemeral caches there is no separate lock file; all locks
/// are embedded in the mapped structures.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use super::layout::{RegionHeader, MAGIC, REGION_HEADER_SIZE};

/// Where to store the mmap files.
fn shm_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        PathBuf::from("/dev/shm")
    } else {
        // macOS and other Unix: use TMPDIR
        std::env::temp_dir().join("shmcache")
    }
}

/// A mapped region, owning the mmap handle.
pub struct ShmRegion {
    mmap: MmapMut,
    path: PathBuf,
}

impl ShmRegion {
    /// Create a new region of `size` bytes, truncating any stale file,
    /// and stamp the allocator header magic.
    pub fn create(name: &str, size: usize) -> io::Result<Self> {
        let dir = shm_dir();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        if size < REGION_HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "region size smaller than allocator header",
            ));
        }

        let path = dir.join(format!("{name}.shm"));

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size as u64)?;

        // Safety: we just created and truncated this file; nobody else
        // has mapped it yet.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        mmap.fill(0);

        let header = unsafe { &mut *(mmap.as_mut_ptr() as *mut RegionHeader) };
        header.magic = MAGIC;
        header.version = 1;
        header.total_size = size as u64;

        mmap.flush()?;

        Ok(ShmRegion { mmap, path })
    }

    /// Open an existing region and validate its magic.
    pub fn open(name: &str) -> io::Result<Self> {
        let path = shm_dir().join(format!("{name}.shm"));
        Self::open_path(&path)
    }

    fn open_path(path: &Path) -> io::Result<Self> {
        let file = fs::OpenOptions::new().read(true).write(true).open(path)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        if mmap.len() < REGION_HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "shared region file too small",
            ));
        }
        let header = unsafe { &*(mmap.as_ptr() as *const RegionHeader) };
        if header.magic != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid shared region file: bad magic",
            ));
        }
        if header.total_size != mmap.len() as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid shared region file: size mismatch",
            ));
        }

        Ok(ShmRegion {
            mmap,
            path: path.to_path_buf(),
        })
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn base_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    /// Remove the backing file. Mappings held by other processes stay
    /// valid until they unmap.
    pub fn unlink(&self) -> io::Result<()> {
        let _ = fs::remove_file(&self.path);
        Ok(())
    }
}
