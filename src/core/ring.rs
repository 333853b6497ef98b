// src/core/ring.rs

//! POSIX shared-memory single-producer/single-consumer ring buffer used to exchange
//! heartbeat and status payloads with the worker processes attached to this node.
//!
//! The on-disk layout (a `CircularBufferHeader` of two `u32` atomics followed by a flat
//! byte region) and the read/write semantics are bit-identical to the management
//! service's own shared-memory ring, since other processes on the node map the same
//! segment and must agree on the wire format.

use crate::core::errors::{ControlPlaneError, Result};
use crate::core::metrics;
use std::ffi::CString;
use std::sync::atomic::{AtomicU32, Ordering};

const DEFAULT_BUFFER_SIZE: usize = 10 * 1024 * 1024;

#[repr(C)]
struct CircularBufferHeader {
    read_idx: AtomicU32,
    write_idx: AtomicU32,
}

/// Write behavior when the ring has no room for a new message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Reject the write and return `Ok(false)` if it would not fit.
    Retain,
    /// Overwrite whatever is currently in the ring with the new message.
    Overwrite,
}

/// A POSIX shared-memory ring buffer backing a single named segment + semaphore pair.
///
/// Only one process may construct this as the *owner* (the first to `shm_open` with
/// `O_CREAT | O_EXCL`); all others attach to the existing segment. The owner's `Drop`
/// unlinks both the segment and the semaphore.
pub struct Ring {
    shm_name: String,
    sem_name: String,
    buffer_size: usize,
    mode: WriteMode,
    mmap_addr: *mut libc::c_void,
    mmap_len: usize,
    header: *mut CircularBufferHeader,
    data: *mut u8,
    sem: *mut libc::sem_t,
    shm_fd: libc::c_int,
    is_owner: bool,
}

// Safety: the shared segment is accessed only through atomics and the named semaphore
// serializes all read/write access; the raw pointers themselves are never dereferenced
// concurrently from more than one `Ring` handle without holding the semaphore.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    /// Opens or creates the named ring, enforcing owner-uid permissions on both the
    /// shared memory segment and the semaphore.
    pub fn open(shm_name: &str, sem_name: &str, mode: WriteMode) -> Result<Self> {
        Self::open_with_size(shm_name, sem_name, DEFAULT_BUFFER_SIZE, mode)
    }

    pub fn open_with_size(
        shm_name: &str,
        sem_name: &str,
        buffer_size: usize,
        mode: WriteMode,
    ) -> Result<Self> {
        let header_size = std::mem::size_of::<CircularBufferHeader>();
        let total_size = header_size + buffer_size;
        let c_shm_name = CString::new(shm_name)
            .map_err(|_| ControlPlaneError::Ring(format!("invalid shm name: {shm_name}")))?;
        let c_sem_name = CString::new(sem_name)
            .map_err(|_| ControlPlaneError::Ring(format!("invalid sem name: {sem_name}")))?;

        let mut is_owner = false;
        let mut shm_fd =
            unsafe { libc::shm_open(c_shm_name.as_ptr(), libc::O_RDWR, 0o600) };
        if shm_fd == -1 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() != Some(libc::ENOENT) {
                return Err(ControlPlaneError::Ring(format!(
                    "shm_open({shm_name}) failed: {errno}"
                )));
            }
            shm_fd = unsafe {
                libc::shm_open(
                    c_shm_name.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                    0o600,
                )
            };
            if shm_fd == -1 {
                return Err(ControlPlaneError::Ring(format!(
                    "shm_open(O_CREAT) ({shm_name}) failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
            if unsafe { libc::ftruncate(shm_fd, total_size as libc::off_t) } == -1 {
                let err = std::io::Error::last_os_error();
                unsafe {
                    libc::close(shm_fd);
                    libc::shm_unlink(c_shm_name.as_ptr());
                }
                return Err(ControlPlaneError::Ring(format!(
                    "ftruncate({shm_name}) failed: {err}"
                )));
            }
            is_owner = true;
        }

        let mmap_addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                shm_fd,
                0,
            )
        };
        if mmap_addr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(shm_fd) };
            return Err(ControlPlaneError::Ring(format!(
                "mmap({shm_name}) failed: {err}"
            )));
        }

        let header = mmap_addr as *mut CircularBufferHeader;
        let data = unsafe { (mmap_addr as *mut u8).add(header_size) };

        if is_owner {
            unsafe {
                (*header).read_idx = AtomicU32::new(0);
                (*header).write_idx = AtomicU32::new(0);
                std::ptr::write_bytes(data, 0, buffer_size);
            }
        }

        let sem_flags = if is_owner { libc::O_CREAT } else { 0 };
        let sem = unsafe { libc::sem_open(c_sem_name.as_ptr(), sem_flags, 0o600u32, 1u32) };
        if sem == libc::SEM_FAILED {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::munmap(mmap_addr, total_size);
                libc::close(shm_fd);
                if is_owner {
                    libc::shm_unlink(c_shm_name.as_ptr());
                }
            }
            return Err(ControlPlaneError::Ring(format!(
                "sem_open({sem_name}) failed: {err}"
            )));
        }

        let ring = Self {
            shm_name: shm_name.to_string(),
            sem_name: sem_name.to_string(),
            buffer_size,
            mode,
            mmap_addr,
            mmap_len: total_size,
            header,
            data,
            sem,
            shm_fd,
            is_owner,
        };
        ring.check_owner_permission()?;
        Ok(ring)
    }

    /// Verifies the segment and semaphore belong to this process's uid, then forces
    /// their mode to 0600. Only meaningful on Linux, where `/dev/shm` paths are stable.
    fn check_owner_permission(&self) -> Result<()> {
        #[cfg(target_os = "linux")]
        {
            let shm_path = format!("/dev/shm{}", self.shm_name);
            let sem_base = self.sem_name.strip_prefix('/').unwrap_or(&self.sem_name);
            let sem_path = format!("/dev/shm/sem.{sem_base}");

            check_path_owned_by_self(&shm_path)?;
            force_mode_0600(&shm_path)?;
            check_path_owned_by_self(&sem_path)?;
            force_mode_0600(&sem_path)?;
            Ok(())
        }
        #[cfg(not(target_os = "linux"))]
        {
            Err(ControlPlaneError::Ring(
                "shared-memory ring permission checks require Linux".to_string(),
            ))
        }
    }

    fn header(&self) -> &CircularBufferHeader {
        unsafe { &*self.header }
    }

    /// Reads one length-delimited message, blocking on the named semaphore.
    /// Returns `Ok(None)` if the ring is currently empty.
    pub fn read(&self) -> Result<Option<Vec<u8>>> {
        self.sem_wait()?;
        let result = self.read_locked();
        self.sem_post()?;
        result
    }

    fn read_locked(&self) -> Result<Option<Vec<u8>>> {
        let read_pos = self.header().read_idx.load(Ordering::Relaxed);
        let write_pos = self.header().write_idx.load(Ordering::Acquire);
        if read_pos == write_pos {
            return Ok(None);
        }

        let buffer_size = self.buffer_size as u32;
        let mut len = 0u32;
        while len < buffer_size {
            let idx = ((read_pos + len) % buffer_size) as usize;
            if unsafe { *self.data.add(idx) } == 0 {
                break;
            }
            len += 1;
        }

        if len == 0 {
            return Ok(Some(Vec::new()));
        }

        let mut out = Vec::with_capacity(len as usize);
        for i in 0..len {
            let idx = ((read_pos + i) % buffer_size) as usize;
            out.push(unsafe { *self.data.add(idx) });
        }
        self.header()
            .read_idx
            .store((read_pos + len + 1) % buffer_size, Ordering::Release);
        Ok(Some(out))
    }

    /// Writes `msg` to the ring according to this ring's `WriteMode`.
    /// Returns `Ok(false)` if the message was rejected (too large, or full in retain mode).
    pub fn write(&self, msg: &[u8]) -> Result<bool> {
        self.sem_wait()?;
        let result = match self.mode {
            WriteMode::Retain => self.write_retain_locked(msg),
            WriteMode::Overwrite => self.write_overwrite_locked(msg),
        };
        self.sem_post()?;
        if matches!(result, Ok(false)) {
            metrics::RING_WRITE_ERRORS_TOTAL
                .with_label_values(&[self.shm_name.as_str()])
                .inc();
        }
        result
    }

    fn write_retain_locked(&self, msg: &[u8]) -> Result<bool> {
        let buffer_size = self.buffer_size as u32;
        let write_pos = self.header().write_idx.load(Ordering::Relaxed);
        let read_pos = self.header().read_idx.load(Ordering::Acquire);
        let total_len = msg.len() as u32 + 1;
        if total_len >= buffer_size {
            return Ok(false);
        }

        let data_in_buffer = if write_pos >= read_pos {
            write_pos - read_pos
        } else {
            buffer_size - read_pos + write_pos
        };
        let available_space = buffer_size - data_in_buffer - 1;
        if total_len > available_space {
            return Ok(false);
        }

        // `msg` plus an implicit trailing nul byte, written starting at `write_pos`
        // and wrapping around the end of the buffer.
        for i in 0..total_len as usize {
            let byte = msg.get(i).copied().unwrap_or(0);
            let idx = (write_pos as usize + i) % self.buffer_size;
            unsafe { *self.data.add(idx) = byte };
        }
        self.header()
            .write_idx
            .store((write_pos + total_len) % buffer_size, Ordering::Release);
        Ok(true)
    }

    fn write_overwrite_locked(&self, msg: &[u8]) -> Result<bool> {
        let buffer_size = self.buffer_size as u32;
        let total_len = msg.len() as u32 + 1;
        if total_len >= buffer_size {
            return Ok(false);
        }
        for (i, b) in msg.iter().enumerate() {
            unsafe { *self.data.add(i) = *b };
        }
        unsafe { *self.data.add(msg.len()) = 0 };
        self.header().read_idx.store(0, Ordering::Release);
        self.header()
            .write_idx
            .store(total_len, Ordering::Release);
        Ok(true)
    }

    fn sem_wait(&self) -> Result<()> {
        loop {
            let rc = unsafe { libc::sem_wait(self.sem) };
            if rc == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(ControlPlaneError::Ring(format!("sem_wait failed: {err}")));
        }
    }

    fn sem_post(&self) -> Result<()> {
        if unsafe { libc::sem_post(self.sem) } == -1 {
            return Err(ControlPlaneError::Ring(format!(
                "sem_post failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        unsafe {
            if !self.sem.is_null() {
                libc::sem_close(self.sem);
                if self.is_owner {
                    if let Ok(name) = CString::new(self.sem_name.clone()) {
                        libc::sem_unlink(name.as_ptr());
                    }
                }
            }
            libc::munmap(self.mmap_addr, self.mmap_len);
            if self.shm_fd != -1 {
                libc::close(self.shm_fd);
            }
            if self.is_owner {
                if let Ok(name) = CString::new(self.shm_name.clone()) {
                    libc::shm_unlink(name.as_ptr());
                }
            }
        }
    }
}

/// Unlinks a ring's backing segment and semaphore without attaching to them first.
/// Used during process teardown to clean up a ring this process does not own.
pub fn clear_resources(shm_name: &str, sem_name: &str) {
    if let Ok(name) = CString::new(shm_name) {
        unsafe { libc::shm_unlink(name.as_ptr()) };
    }
    if let Ok(name) = CString::new(sem_name) {
        unsafe { libc::sem_unlink(name.as_ptr()) };
    }
}

#[cfg(target_os = "linux")]
fn check_path_owned_by_self(path: &str) -> Result<()> {
    let c_path =
        CString::new(path).map_err(|_| ControlPlaneError::Ring(format!("invalid path: {path}")))?;
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::stat(c_path.as_ptr(), &mut stat) } != 0 {
        return Err(ControlPlaneError::Ring(format!(
            "stat({path}) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    let my_uid = unsafe { libc::getuid() };
    if stat.st_uid != my_uid {
        return Err(ControlPlaneError::Ring(format!(
            "owner mismatch for {path}: expected uid {my_uid}, found {}",
            stat.st_uid
        )));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn force_mode_0600(path: &str) -> Result<()> {
    let c_path =
        CString::new(path).map_err(|_| ControlPlaneError::Ring(format!("invalid path: {path}")))?;
    if unsafe { libc::chmod(c_path.as_ptr(), 0o600) } != 0 {
        return Err(ControlPlaneError::Ring(format!(
            "chmod({path}) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_names(tag: &str) -> (String, String) {
        let pid = std::process::id();
        (format!("/ictl_test_{tag}_{pid}"), format!("/ictl_sem_{tag}_{pid}"))
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(32))]
        /// Any message that fits the buffer round-trips byte-for-byte through a single
        /// write/read pair in retain mode.
        #[test]
        fn retain_mode_round_trips_any_message_that_fits(msg in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..200)) {
            let (shm, sem) = unique_names(&format!("rt_{}", uuid::Uuid::new_v4().simple()));
            let ring = Ring::open_with_size(&shm, &sem, 4096, WriteMode::Retain).unwrap();
            proptest::prop_assert!(ring.write(&msg).unwrap());
            let got = ring.read().unwrap().unwrap();
            proptest::prop_assert_eq!(got, msg);
        }
    }

    #[test]
    fn retain_write_then_read_round_trips() {
        let (shm, sem) = unique_names("retain");
        let ring = Ring::open_with_size(&shm, &sem, 4096, WriteMode::Retain).unwrap();
        assert!(ring.write(b"hello").unwrap());
        let got = ring.read().unwrap().unwrap();
        assert_eq!(got, b"hello");
        assert!(ring.read().unwrap().is_none());
    }

    #[test]
    fn retain_mode_rejects_when_full() {
        let (shm, sem) = unique_names("full");
        let ring = Ring::open_with_size(&shm, &sem, 16, WriteMode::Retain).unwrap();
        assert!(ring.write(b"0123456789abcd").is_ok());
        assert!(!ring.write(b"too big to ever fit").unwrap());
    }

    #[test]
    fn overwrite_mode_always_keeps_latest() {
        let (shm, sem) = unique_names("overwrite");
        let ring = Ring::open_with_size(&shm, &sem, 4096, WriteMode::Overwrite).unwrap();
        assert!(ring.write(b"first").unwrap());
        assert!(ring.write(b"second").unwrap());
        let got = ring.read().unwrap().unwrap();
        assert_eq!(got, b"second");
    }
}
