//! Client buffer storage: SHM pools and the buffers cut from them.
//!
//! A pool is a client-provided file descriptor mapped read-only. Buffers are
//! rectangles within the pool described by offset, stride and format. The
//! compositor never writes through the mapping; texture upload reads it at
//! commit time. Buffers are borrowed references: destruction is signalled so
//! surfaces can drop their texture handles before the next frame.

use crate::geometry::Size;
use crate::protocol::{ClientEvent, ClientId, Clients, ProtocolError};
use memmap2::{Mmap, MmapOptions};
use std::collections::HashMap;
use std::ffi::CString;
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

/// Pixel formats every client can rely on. Values are the wl_shm format
/// codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShmFormat {
    /// 32-bit ARGB, little-endian, pre-multiplied alpha.
    Argb8888,
    /// 32-bit RGB, alpha byte ignored.
    Xrgb8888,
}

impl ShmFormat {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(ShmFormat::Argb8888),
            1 => Some(ShmFormat::Xrgb8888),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            ShmFormat::Argb8888 => 0,
            ShmFormat::Xrgb8888 => 1,
        }
    }

    pub const fn bytes_per_pixel(self) -> i32 {
        4
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// Events delivered on a buffer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferEvent {
    /// The compositor no longer reads the buffer; the client may reuse it.
    Released,
}

struct ShmPool {
    owner: ClientId,
    file: File,
    /// None when the mapping failed: buffers from this pool are permanently
    /// unrenderable but the connection survives (resource shortage, not a
    /// protocol error).
    map: Option<Mmap>,
    size: usize,
    destroyed: bool,
    buffer_count: usize,
}

impl std::fmt::Debug for ShmPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmPool")
            .field("owner", &self.owner)
            .field("size", &self.size)
            .field("mapped", &self.map.is_some())
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

/// Geometry of a buffer within its pool.
#[derive(Debug, Clone, Copy)]
pub struct ShmBufferDesc {
    pub pool: PoolId,
    pub offset: i32,
    pub width: i32,
    pub height: i32,
    pub stride: i32,
    pub format: ShmFormat,
}

#[derive(Debug)]
pub struct BufferRecord {
    pub id: BufferId,
    pub owner: ClientId,
    pub desc: ShmBufferDesc,
    pub alive: bool,
}

impl BufferRecord {
    pub fn size(&self) -> Size<i32> {
        Size::new(self.desc.width, self.desc.height)
    }
}

/// All pools and buffers, across clients.
#[derive(Debug, Default)]
pub struct Buffers {
    pools: HashMap<PoolId, ShmPool>,
    buffers: HashMap<BufferId, BufferRecord>,
    next_pool: u64,
    next_buffer: u64,
}

impl Buffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a client-provided pool fd read-only. A failed mapping leaves the
    /// pool unusable but is not fatal to the connection.
    pub fn create_pool(
        &mut self,
        owner: ClientId,
        fd: OwnedFd,
        size: i32,
    ) -> Result<PoolId, ProtocolError> {
        if size <= 0 {
            return Err(ProtocolError::InvalidPoolSize(size));
        }
        let file = File::from(fd);
        let map = match unsafe { MmapOptions::new().len(size as usize).map(&file) } {
            Ok(map) => Some(map),
            Err(err) => {
                tracing::warn!(%err, size, "failed to map shm pool; buffers will not render");
                None
            }
        };
        self.next_pool += 1;
        let id = PoolId(self.next_pool);
        self.pools.insert(
            id,
            ShmPool {
                owner,
                file,
                map,
                size: size as usize,
                destroyed: false,
                buffer_count: 0,
            },
        );
        Ok(id)
    }

    /// Pools may only grow. The grown region becomes visible through a fresh
    /// mapping of the same backing file.
    pub fn resize_pool(&mut self, pool: PoolId, size: i32) -> Result<(), ProtocolError> {
        let record = match self.pools.get_mut(&pool) {
            Some(record) => record,
            None => return Ok(()),
        };
        if size <= 0 || (size as usize) < record.size {
            return Err(ProtocolError::InvalidPoolSize(size));
        }
        record.size = size as usize;
        record.map = match unsafe { MmapOptions::new().len(record.size).map(&record.file) } {
            Ok(map) => Some(map),
            Err(err) => {
                tracing::warn!(%err, size, "failed to remap grown shm pool");
                None
            }
        };
        Ok(())
    }

    /// The pool object is destroyed, but the mapping lives until the last
    /// buffer cut from it goes away.
    pub fn destroy_pool(&mut self, pool: PoolId) {
        if let Some(record) = self.pools.get_mut(&pool) {
            record.destroyed = true;
            if record.buffer_count == 0 {
                self.pools.remove(&pool);
            }
        }
    }

    pub fn create_buffer(
        &mut self,
        owner: ClientId,
        pool: PoolId,
        offset: i32,
        width: i32,
        height: i32,
        stride: i32,
        format_code: u32,
    ) -> Result<BufferId, ProtocolError> {
        let format = ShmFormat::from_code(format_code)
            .ok_or(ProtocolError::UnsupportedFormat(format_code))?;
        let pool_record = self
            .pools
            .get_mut(&pool)
            .ok_or(ProtocolError::InvalidPoolSize(0))?;
        if width <= 0 || height <= 0 {
            return Err(ProtocolError::InvalidSize(width, height));
        }
        let min_stride = width
            .checked_mul(format.bytes_per_pixel())
            .ok_or(ProtocolError::InvalidSize(width, height))?;
        let end = (|| {
            let span = stride.checked_mul(height)?;
            offset.checked_add(span)
        })();
        let in_bounds = offset >= 0
            && stride >= min_stride
            && matches!(end, Some(end) if end as usize <= pool_record.size);
        if !in_bounds {
            return Err(ProtocolError::BufferOutOfBounds {
                offset,
                stride,
                width,
                height,
                pool_size: pool_record.size,
            });
        }
        pool_record.buffer_count += 1;
        self.next_buffer += 1;
        let id = BufferId(self.next_buffer);
        self.buffers.insert(
            id,
            BufferRecord {
                id,
                owner,
                desc: ShmBufferDesc {
                    pool,
                    offset,
                    width,
                    height,
                    stride,
                    format,
                },
                alive: true,
            },
        );
        Ok(id)
    }

    /// Client destroyed the buffer. Returns true if the buffer existed; the
    /// caller cascades texture release through the surfaces referencing it.
    pub fn destroy_buffer(&mut self, buffer: BufferId) -> bool {
        let record = match self.buffers.remove(&buffer) {
            Some(record) => record,
            None => return false,
        };
        if let Some(pool) = self.pools.get_mut(&record.desc.pool) {
            pool.buffer_count = pool.buffer_count.saturating_sub(1);
            if pool.destroyed && pool.buffer_count == 0 {
                self.pools.remove(&record.desc.pool);
            }
        }
        true
    }

    pub fn get(&self, buffer: BufferId) -> Option<&BufferRecord> {
        self.buffers.get(&buffer)
    }

    pub fn size_of(&self, buffer: BufferId) -> Option<Size<i32>> {
        self.get(buffer).map(|b| b.size())
    }

    /// Tell the owner it may reuse the buffer storage.
    pub fn release(&self, buffer: BufferId, clients: &mut Clients) {
        if let Some(record) = self.buffers.get(&buffer) {
            clients.send(
                record.owner,
                ClientEvent::Buffer(buffer, BufferEvent::Released),
            );
        }
    }

    /// Read access to the buffer's pixels, if the pool mapping survived.
    pub fn data(&self, buffer: BufferId) -> Option<&[u8]> {
        let record = self.buffers.get(&buffer)?;
        let pool = self.pools.get(&record.desc.pool)?;
        let map = pool.map.as_ref()?;
        let start = record.desc.offset as usize;
        let len = (record.desc.stride as usize).checked_mul(record.desc.height as usize)?;
        map.get(start..start.checked_add(len)?)
    }

    /// Drop every buffer and pool owned by a departing client. Returns the
    /// destroyed buffer ids so surface state can be scrubbed.
    pub fn remove_client(&mut self, client: ClientId) -> Vec<BufferId> {
        let doomed: Vec<BufferId> = self
            .buffers
            .values()
            .filter(|b| b.owner == client)
            .map(|b| b.id)
            .collect();
        for id in &doomed {
            self.destroy_buffer(*id);
        }
        self.pools.retain(|_, pool| pool.owner != client);
        doomed
    }
}

/// Create a sealed memfd holding `contents`. Used for the keymap fd handed
/// to clients and by tests standing in for client shm pools.
pub fn create_sealed_memfd(name: &str, contents: &[u8]) -> io::Result<OwnedFd> {
    let c_name = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let fd = unsafe { libc::memfd_create(c_name.as_ptr(), libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    let mut file = File::from(owned);
    file.write_all(contents)?;
    file.flush()?;
    let seals = libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_WRITE | libc::F_SEAL_SEAL;
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_ADD_SEALS, seals) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(OwnedFd::from(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(buffers: &mut Buffers, client: ClientId, size: i32) -> PoolId {
        let fd = create_sealed_memfd("test-pool", &vec![0u8; size as usize]).unwrap();
        buffers.create_pool(client, fd, size).unwrap()
    }

    #[test]
    fn buffer_within_pool_bounds() {
        let mut buffers = Buffers::new();
        let client = ClientId(1);
        let pool = test_pool(&mut buffers, client, 800 * 600 * 4);

        let ok = buffers.create_buffer(client, pool, 0, 800, 600, 800 * 4, 0);
        assert!(ok.is_ok());

        let too_big = buffers.create_buffer(client, pool, 0, 800, 601, 800 * 4, 0);
        assert!(matches!(
            too_big,
            Err(ProtocolError::BufferOutOfBounds { .. })
        ));

        let bad_stride = buffers.create_buffer(client, pool, 0, 800, 600, 100, 0);
        assert!(matches!(
            bad_stride,
            Err(ProtocolError::BufferOutOfBounds { .. })
        ));
    }

    #[test]
    fn unsupported_format_rejected() {
        let mut buffers = Buffers::new();
        let client = ClientId(1);
        let pool = test_pool(&mut buffers, client, 4096);
        let result = buffers.create_buffer(client, pool, 0, 16, 16, 64, 0x3432_3142);
        assert!(matches!(result, Err(ProtocolError::UnsupportedFormat(_))));
    }

    #[test]
    fn pool_outlives_its_buffers() {
        let mut buffers = Buffers::new();
        let client = ClientId(1);
        let pool = test_pool(&mut buffers, client, 4096);
        let buffer = buffers
            .create_buffer(client, pool, 0, 16, 16, 64, 0)
            .unwrap();

        buffers.destroy_pool(pool);
        // Pixels still reachable while the buffer lives.
        assert!(buffers.data(buffer).is_some());

        buffers.destroy_buffer(buffer);
        assert!(buffers.data(buffer).is_none());
    }

    #[test]
    fn pixel_data_window() {
        let mut buffers = Buffers::new();
        let client = ClientId(1);
        let bytes: Vec<u8> = (0..64).map(|i| i as u8).collect();
        let fd = create_sealed_memfd("test-pool", &bytes).unwrap();
        let pool = buffers.create_pool(client, fd, 64).unwrap();
        let buffer = buffers.create_buffer(client, pool, 16, 2, 2, 8, 1).unwrap();
        let data = buffers.data(buffer).unwrap();
        assert_eq!(data.len(), 16);
        assert_eq!(data[0], 16);
    }
}
