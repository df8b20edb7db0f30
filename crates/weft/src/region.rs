//! Named shared-memory regions, each sized to exactly one [`TripleBuffer`].
//!
//! A region is a file in the host's shared-memory directory (`/dev/shm` on
//! Linux, the temp directory elsewhere) mapped read/write into both the
//! router and one worker. The creator is the unique destroyer: the router
//! creates the region, hands its name to the worker over the control
//! websocket, and unlinks it when the owning session ends. Attachers map the
//! existing object and never remove it. If the creator dies without
//! unlinking, the name leaks until administrative cleanup; that is the
//! accepted cost of kernel-persistent regions.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use memmap2::{MmapOptions, MmapRaw};
use rand::Rng;

use crate::buffer::TripleBuffer;
use crate::protocol::{is_valid_region_name, REGION_NAME_LEN};

/// Exact size of a region in bytes.
pub const REGION_SIZE: usize = std::mem::size_of::<TripleBuffer>();

const NAME_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// A mapped shared-memory region backing one [`TripleBuffer`].
pub struct SharedRegion {
    name: String,
    path: PathBuf,
    map: MmapRaw,
    owner: bool,
}

impl SharedRegion {
    /// Create a fresh region under a random 32-character name and
    /// initialise the triple buffer inside it.
    ///
    /// The returned handle owns the region: dropping it unlinks the backing
    /// object.
    pub fn create() -> Result<SharedRegion> {
        let dir = region_dir();
        loop {
            let name = generate_name();
            let path = dir.join(&name);
            let file = match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => file,
                // Name collision: roll a new one.
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("create shared region {:?}", path))
                }
            };

            file.set_len(REGION_SIZE as u64)
                .with_context(|| format!("size shared region {:?}", path))?;
            let map = MmapOptions::new()
                .len(REGION_SIZE)
                .map_raw(&file)
                .with_context(|| format!("map shared region {:?}", path))?;

            // Fresh mappings are zero-filled; only the markers need setting.
            unsafe { TripleBuffer::init(map.as_mut_ptr()) };

            tracing::debug!(region = %name, "created shared region");
            return Ok(SharedRegion {
                name,
                path,
                map,
                owner: true,
            });
        }
    }

    /// Attach to a region created by another process.
    ///
    /// The handle is read/write but never destroys: dropping it only unmaps.
    pub fn attach(name: &str) -> Result<SharedRegion> {
        if !is_valid_region_name(name) {
            bail!("invalid shared region name {:?}", name);
        }
        let path = region_dir().join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("open shared region {:?}", path))?;
        let len = file
            .metadata()
            .with_context(|| format!("stat shared region {:?}", path))?
            .len();
        if len != REGION_SIZE as u64 {
            bail!(
                "shared region {:?} has size {}, expected {}",
                path,
                len,
                REGION_SIZE
            );
        }
        let map = MmapOptions::new()
            .len(REGION_SIZE)
            .map_raw(&file)
            .with_context(|| format!("map shared region {:?}", path))?;

        tracing::debug!(region = %name, "attached shared region");
        Ok(SharedRegion {
            name: name.to_owned(),
            path,
            map,
            owner: false,
        })
    }

    /// The region's name, which doubles as the owning device's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The triple buffer living inside the mapping.
    pub fn buffer(&self) -> &TripleBuffer {
        unsafe { TripleBuffer::from_raw(self.map.as_mut_ptr()) }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if !self.owner {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(region = %self.name, error = %e, "failed to unlink shared region");
        } else {
            tracing::debug!(region = %self.name, "destroyed shared region");
        }
    }
}

fn generate_name() -> String {
    let mut rng = rand::rng();
    (0..REGION_NAME_LEN)
        .map(|_| NAME_ALPHABET[rng.random_range(0..NAME_ALPHABET.len())] as char)
        .collect()
}

fn region_dir() -> PathBuf {
    let dev_shm = Path::new("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}
