//! Shared memory channel for handing raw pixels to a co-located server.
//!
//! The segment is created lazily on the first write under a name that stays
//! fixed for the lifetime of the channel and is unique across the instances
//! of this process. Its capacity only grows: a payload
//! larger than the current capacity resizes the segment in place and bumps the
//! generation counter, smaller payloads reuse the existing mapping.
//!
//! Only the owning `Instance` writes to the segment; the server only reads it.
// Mapping the segment is an OS boundary: `mmap` cannot be expressed safely.
#![allow(unsafe_code)]

use crate::config::SharedMemoryConfig;
use crate::error::{Result, VisionError};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Channels created by this process so far.
static CHANNEL_COUNTER: AtomicU64 = AtomicU64::new(0);

#[cfg(unix)]
use memmap2::{MmapMut, MmapOptions};
#[cfg(unix)]
use std::fs::File;

/// Where the server finds the payload of one analyze call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmReference {
    /// Segment name as passed to the server (no leading slash).
    pub name: String,
    /// Incremented every time the segment is (re)allocated.
    pub generation: u64,
    /// Number of payload bytes at the start of the segment.
    pub length: usize,
}

#[cfg(unix)]
struct Segment {
    file: File,
    map: MmapMut,
}

/// Named shared memory segment owned by a single instance.
pub struct SharedMemoryChannel {
    name: String,
    #[cfg(unix)]
    segment: Option<Segment>,
    /// The OS object exists and must be unlinked by this channel.
    created: bool,
    capacity: usize,
    len: usize,
    generation: u64,
    closed: bool,
}

impl SharedMemoryChannel {
    /// Whether this platform supports the shared memory transport.
    pub const fn is_supported() -> bool {
        cfg!(unix)
    }

    /// Create a channel with an explicit segment name. Nothing is allocated yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            #[cfg(unix)]
            segment: None,
            created: false,
            capacity: 0,
            len: 0,
            generation: 0,
            closed: false,
        }
    }

    /// Create a channel under a fresh name: process id, a per-process
    /// counter and a random suffix from the thread-local generator.
    pub fn unique() -> Self {
        let serial = CHANNEL_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut rng = rand::rng();
        let suffix: String = (0..SharedMemoryConfig::NAME_RANDOM_LEN)
            .map(|_| rng.random_range(b'a'..=b'z') as char)
            .collect();
        Self::new(format!(
            "{}{}_{}_{}",
            SharedMemoryConfig::NAME_PREFIX,
            std::process::id(),
            serial,
            suffix
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Length of the last payload written.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the segment currently exists.
    pub fn is_open(&self) -> bool {
        #[cfg(unix)]
        {
            self.segment.is_some()
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    fn os_name(&self) -> String {
        format!("/{}", self.name)
    }

    fn error(&self, message: impl Into<String>, source: Option<std::io::Error>) -> VisionError {
        VisionError::SharedMemory {
            name: self.name.clone(),
            message: message.into(),
            source,
        }
    }

    /// Copy `bytes` into the segment, growing it first if needed.
    pub fn write(&mut self, bytes: &[u8]) -> Result<ShmReference> {
        if self.closed {
            return Err(self.error("channel is closed", None));
        }
        if bytes.is_empty() {
            return Err(self.error("refusing to map an empty payload", None));
        }

        #[cfg(unix)]
        {
            if bytes.len() > self.capacity {
                self.grow(bytes.len())?;
            }
            let segment = self
                .segment
                .as_mut()
                .ok_or_else(|| VisionError::SharedMemory {
                    name: self.name.clone(),
                    message: "segment missing after allocation".to_string(),
                    source: None,
                })?;
            segment.map[..bytes.len()].copy_from_slice(bytes);
            self.len = bytes.len();

            Ok(ShmReference {
                name: self.name.clone(),
                generation: self.generation,
                length: self.len,
            })
        }

        #[cfg(not(unix))]
        {
            Err(self.error("shared memory is not supported on this platform", None))
        }
    }

    #[cfg(unix)]
    fn grow(&mut self, capacity: usize) -> Result<()> {
        use nix::fcntl::OFlag;
        use nix::sys::mman::shm_open;
        use nix::sys::stat::Mode;

        let file = match self.segment.take() {
            Some(segment) => {
                // Unmap before resizing so no stale view outlives the old size.
                drop(segment.map);
                segment.file
            }
            None => {
                let fd = shm_open(
                    self.os_name().as_str(),
                    OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
                    Mode::S_IRUSR | Mode::S_IWUSR,
                )
                .map_err(|e| self.error("shm_open failed", Some(e.into())))?;
                self.created = true;
                info!("Created shared memory segment {}", self.name);
                File::from(fd)
            }
        };

        match resize_and_map(&file, capacity) {
            Ok(map) => {
                debug!(
                    "Shared memory {} grown from {} to {} bytes",
                    self.name, self.capacity, capacity
                );
                self.segment = Some(Segment { file, map });
                self.capacity = capacity;
                self.generation += 1;
                Ok(())
            }
            Err((message, source)) => {
                // Start from a fresh object on the next write.
                drop(file);
                self.unlink();
                self.capacity = 0;
                self.len = 0;
                Err(self.error(message, Some(source)))
            }
        }
    }

    #[cfg(unix)]
    fn unlink(&mut self) {
        if !self.created {
            return;
        }
        self.created = false;
        match nix::sys::mman::shm_unlink(self.os_name().as_str()) {
            Ok(()) => debug!("Unlinked shared memory segment {}", self.name),
            Err(nix::errno::Errno::ENOENT) => {}
            Err(e) => warn!("Failed to unlink shared memory {}: {}", self.name, e),
        }
    }

    /// Unmap and unlink the segment. Safe to call repeatedly or before any write.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        #[cfg(unix)]
        {
            drop(self.segment.take());
            self.unlink();
        }

        self.capacity = 0;
        self.len = 0;
    }
}

#[cfg(unix)]
fn resize_and_map(
    file: &File,
    capacity: usize,
) -> std::result::Result<MmapMut, (String, std::io::Error)> {
    file.set_len(capacity as u64)
        .map_err(|e| (format!("resize to {} bytes failed", capacity), e))?;

    // SAFETY: the segment is private to this instance, is never truncated
    // while mapped, and the co-located server only reads from it.
    unsafe { MmapOptions::new().len(capacity).map_mut(file) }
        .map_err(|e| (format!("mmap of {} bytes failed", capacity), e))
}

impl Drop for SharedMemoryChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SharedMemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemoryChannel")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &self.len)
            .field("generation", &self.generation)
            .field("created", &self.created)
            .field("closed", &self.closed)
            .finish()
    }
}
