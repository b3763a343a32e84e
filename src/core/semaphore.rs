//! Purpose: Wake registry lock waiters across processes via named semaphores.
//! Exports: `RegistrySemaphore`, `SemaphoreError`, `WaitOutcome`, `registry_semaphore_name`, `open_for_path`.
//! Role: Blocking half of the registry lock; the spin word in the region stays authoritative.
//! Invariants: Name derivation is deterministic for a given region path.
//! Invariants: Posts are counted, so a post that lands before the wait is not lost.
use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;
use std::time::Duration;

#[cfg(unix)]
use std::ffi::CString;
#[cfg(unix)]
use std::os::unix::ffi::OsStrExt;
#[cfg(unix)]
use std::time::Instant;

/// POSIX limits portable semaphore names to 31 bytes on some platforms.
const NAME_HASH_CHARS: usize = 24;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum WaitOutcome {
    Signaled,
    TimedOut,
}

#[derive(Debug)]
pub(crate) enum SemaphoreError {
    Unavailable,
    Io(io::Error),
}

pub(crate) trait SemaphoreBackend {
    type Handle;

    fn open(&self, name: &str) -> Result<Self::Handle, SemaphoreError>;
    fn post(&self, handle: &Self::Handle) -> Result<(), SemaphoreError>;
    fn wait(
        &self,
        handle: &Self::Handle,
        timeout: Duration,
    ) -> Result<WaitOutcome, SemaphoreError>;
    fn close(&self, handle: &Self::Handle);
}

pub(crate) struct Semaphore<B: SemaphoreBackend> {
    handle: B::Handle,
    backend: B,
}

impl<B: SemaphoreBackend> Semaphore<B> {
    fn open_with_backend(name: &str, backend: B) -> Result<Self, SemaphoreError> {
        let handle = backend.open(name)?;
        Ok(Self { handle, backend })
    }

    pub(crate) fn post(&self) -> Result<(), SemaphoreError> {
        self.backend.post(&self.handle)
    }

    pub(crate) fn wait(&self, timeout: Duration) -> Result<WaitOutcome, SemaphoreError> {
        self.backend.wait(&self.handle, timeout)
    }
}

impl<B: SemaphoreBackend> Drop for Semaphore<B> {
    fn drop(&mut self) {
        self.backend.close(&self.handle);
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct OsSemaphoreBackend;

/// `sem_t` handle returned by `sem_open`; shared by every thread of the process.
#[cfg(unix)]
pub(crate) struct OsHandle(*mut libc::sem_t);

// SAFETY: named POSIX semaphores are process-wide objects designed for concurrent use.
#[cfg(unix)]
unsafe impl Send for OsHandle {}
#[cfg(unix)]
unsafe impl Sync for OsHandle {}

#[cfg(unix)]
impl SemaphoreBackend for OsSemaphoreBackend {
    type Handle = OsHandle;

    fn open(&self, name: &str) -> Result<Self::Handle, SemaphoreError> {
        let full = format!("/{name}");
        let c_name = CString::new(full).map_err(|_| SemaphoreError::Unavailable)?;
        let mode = (libc::S_IRUSR | libc::S_IWUSR) as libc::mode_t;
        let handle =
            unsafe { libc::sem_open(c_name.as_ptr(), libc::O_CREAT, mode as libc::c_uint, 0) };
        if handle == libc::SEM_FAILED {
            return Err(map_sem_error());
        }
        Ok(OsHandle(handle))
    }

    fn post(&self, handle: &Self::Handle) -> Result<(), SemaphoreError> {
        let rc = unsafe { libc::sem_post(handle.0) };
        if rc != 0 {
            return Err(map_sem_error());
        }
        Ok(())
    }

    fn wait(
        &self,
        handle: &Self::Handle,
        timeout: Duration,
    ) -> Result<WaitOutcome, SemaphoreError> {
        let start = Instant::now();
        let poll = Duration::from_millis(1).min(timeout.max(Duration::from_micros(100)));

        loop {
            let rc = unsafe { libc::sem_trywait(handle.0) };
            if rc == 0 {
                return Ok(WaitOutcome::Signaled);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(code) if code == libc::EAGAIN => {
                    if start.elapsed() >= timeout {
                        return Ok(WaitOutcome::TimedOut);
                    }
                    std::thread::sleep(poll);
                }
                Some(code) if code == libc::EINTR => continue,
                _ => return Err(map_sem_error_with(err)),
            }
        }
    }

    fn close(&self, handle: &Self::Handle) {
        unsafe {
            libc::sem_close(handle.0);
        }
    }
}

#[cfg(not(unix))]
impl SemaphoreBackend for OsSemaphoreBackend {
    type Handle = ();

    fn open(&self, _name: &str) -> Result<Self::Handle, SemaphoreError> {
        Err(SemaphoreError::Unavailable)
    }

    fn post(&self, _handle: &Self::Handle) -> Result<(), SemaphoreError> {
        Err(SemaphoreError::Unavailable)
    }

    fn wait(
        &self,
        _handle: &Self::Handle,
        _timeout: Duration,
    ) -> Result<WaitOutcome, SemaphoreError> {
        Err(SemaphoreError::Unavailable)
    }

    fn close(&self, _handle: &Self::Handle) {}
}

pub(crate) type RegistrySemaphore = Semaphore<OsSemaphoreBackend>;

pub(crate) fn registry_semaphore_name(path: &Path) -> String {
    let bytes = canonical_path_bytes(path);
    let digest = hex::encode(Sha256::digest(&bytes));
    format!("tcrg-{}", &digest[..NAME_HASH_CHARS])
}

pub(crate) fn open_for_path(path: &Path) -> Result<RegistrySemaphore, SemaphoreError> {
    let name = registry_semaphore_name(path);
    RegistrySemaphore::open_with_backend(&name, OsSemaphoreBackend)
}

fn canonical_path_bytes(path: &Path) -> Vec<u8> {
    let resolved = std::fs::canonicalize(path);
    let path = resolved.as_ref().map_or(path, |value| value.as_path());
    #[cfg(unix)]
    {
        path.as_os_str().as_bytes().to_vec()
    }
    #[cfg(not(unix))]
    {
        path.to_string_lossy().as_bytes().to_vec()
    }
}

#[cfg(unix)]
fn map_sem_error() -> SemaphoreError {
    map_sem_error_with(io::Error::last_os_error())
}

#[cfg(unix)]
fn map_sem_error_with(err: io::Error) -> SemaphoreError {
    match err.raw_os_error() {
        Some(code) if code == libc::ENOSYS || code == libc::ENOTSUP => SemaphoreError::Unavailable,
        _ => SemaphoreError::Io(err),
    }
}
