//! Purpose: Cross-process registry of reader slots kept in a shared mapped region.
//! Exports: `Registry`, `RegistryGuard`, `RegistryOptions`, `SlotInfo`, `stable_id`, `id_matches`.
//! Role: Lets independent processes discover, lease and release readers without double-opening them.
//! Invariants: Slot state is only read or written through a `RegistryGuard`.
//! Invariants: A refresh never touches the path or payload of a slot with `ref > 0`.
//! Invariants: Timed re-checks keep waiters live even if a wakeup is consumed by someone else.
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use fs2::FileExt;
use libc::{EACCES, EPERM};
use memmap2::MmapRaw;
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::device::DeviceEnumerator;
use crate::core::error::{Error, ErrorKind};
use crate::core::semaphore::{self, RegistrySemaphore, SemaphoreError, WaitOutcome};

pub const SIGNATURE: u32 = 0x935F_BC8A;
pub const SLOT_COUNT: u32 = 8;
pub const MAX_REF_COUNT: u32 = 16;
pub const PATH_SIZE: usize = 512;
pub const ID_SIZE: usize = 64;
pub const MAX_NAME_LEN: usize = 127;
pub const REGION_EXTENSION: &str = "tcreg";
pub const DIR_ENV: &str = "TUNERCARD_DIR";

const HEADER_SIZE: usize = 24;
const OFF_SIGNATURE: usize = 0;
const OFF_LOCK: usize = 4;
const OFF_AVAILABLE: usize = 8;
const OFF_WAITING: usize = 12;
const OFF_COUNT: usize = 16;
const OFF_SLOT_SIZE: usize = 20;

const SLOT_PATH: usize = 0;
const SLOT_ID: usize = SLOT_PATH + PATH_SIZE;
const SLOT_REF: usize = SLOT_ID + ID_SIZE;
const SLOT_AVAILABLE: usize = SLOT_REF + 4;
const SLOT_USER: usize = SLOT_AVAILABLE + 4;

const WAIT_SLICE: Duration = Duration::from_millis(20);

pub fn slot_size(user_size: usize) -> usize {
    (SLOT_USER + user_size + 3) & !3
}

pub fn region_size(user_size: usize) -> usize {
    HEADER_SIZE + slot_size(user_size) * SLOT_COUNT as usize
}

/// `$TUNERCARD_DIR`, then `/dev/shm`, then the system temp dir.
pub fn default_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DIR_ENV).filter(|value| !value.is_empty()) {
        return PathBuf::from(dir);
    }
    let shm = Path::new("/dev/shm");
    if cfg!(unix) && shm.is_dir() {
        return shm.to_path_buf();
    }
    std::env::temp_dir()
}

#[derive(Clone, Debug)]
pub struct RegistryOptions {
    /// Friendly name devices must report; also names the region.
    pub name: String,
    pub dir: PathBuf,
    pub user_size: usize,
    /// Stable-id pattern; `*` matches any single character.
    pub id_filter: Option<String>,
}

impl RegistryOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dir: default_dir(),
            user_size: 0,
            id_filter: None,
        }
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    pub fn with_user_size(mut self, user_size: usize) -> Self {
        self.user_size = user_size;
        self
    }

    pub fn with_id_filter(mut self, filter: impl Into<String>) -> Self {
        self.id_filter = Some(filter.into());
        self
    }

    pub fn region_path(&self) -> PathBuf {
        let stem: String = self
            .name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{stem}.{REGION_EXTENSION}"))
    }

    fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() || self.name.len() > MAX_NAME_LEN {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("registry name must be 1..={MAX_NAME_LEN} bytes")));
        }
        if let Some(filter) = &self.id_filter {
            if filter.len() >= ID_SIZE {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("id filter must be shorter than {ID_SIZE} bytes")));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SlotInfo {
    pub index: u32,
    pub path: String,
    pub id: String,
    pub ref_count: u32,
    pub available: bool,
}

pub struct Registry {
    path: PathBuf,
    name: String,
    id_filter: Option<String>,
    user_size: usize,
    slot_size: usize,
    map: MmapRaw,
    _file: File,
    semaphore: Option<RegistrySemaphore>,
    enumerator: Box<dyn DeviceEnumerator + Send + Sync>,
}

impl Registry {
    /// Creates the region on first use, otherwise attaches and validates it.
    pub fn open<E>(options: RegistryOptions, enumerator: E) -> Result<Self, Error>
    where
        E: DeviceEnumerator + Send + Sync + 'static,
    {
        options.validate()?;
        fs::create_dir_all(&options.dir)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&options.dir).with_source(err))?;

        let path = options.region_path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| Error::new(io_error_kind(&err)).with_path(&path).with_source(err))?;

        FileExt::lock_exclusive(&file).map_err(|err| {
            Error::new(io_error_kind(&err))
                .with_path(&path)
                .with_source(err)
        })?;
        let prepared = prepare_region(&file, &path, options.user_size);
        if let Err(err) = FileExt::unlock(&file) {
            debug!(path = %path.display(), %err, "registry creation lock release failed");
        }
        let map = prepared?;

        let semaphore = match semaphore::open_for_path(&path) {
            Ok(semaphore) => Some(semaphore),
            Err(SemaphoreError::Unavailable) => {
                debug!(path = %path.display(), "named semaphores unavailable; lock waiters will poll");
                None
            }
            Err(SemaphoreError::Io(err)) => {
                warn!(path = %path.display(), error = %err, "registry semaphore open failed; lock waiters will poll");
                None
            }
        };

        Ok(Self {
            path,
            name: options.name,
            id_filter: options.id_filter,
            user_size: options.user_size,
            slot_size: slot_size(options.user_size),
            map,
            _file: file,
            semaphore,
            enumerator: Box::new(enumerator),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn user_size(&self) -> usize {
        self.user_size
    }

    /// Blocks until this caller holds the registry; the guard releases it on drop.
    /// Not reentrant: locking twice from one thread deadlocks.
    pub fn lock(&self) -> RegistryGuard<'_> {
        loop {
            if self.try_take_permit(false) {
                return RegistryGuard { registry: self };
            }
            if self.wait_for_wakeup() {
                return RegistryGuard { registry: self };
            }
        }
    }

    pub fn update(&self) -> Result<(), Error> {
        self.lock().update()
    }

    pub fn enumerate(&self) -> Result<Vec<SlotInfo>, Error> {
        self.lock().enumerate()
    }

    pub fn slots(&self) -> Vec<SlotInfo> {
        self.lock().slots()
    }

    pub fn get_slot(&self, index: u32) -> Result<SlotInfo, Error> {
        self.lock().get_slot(index)
    }

    pub fn ref_slot(&self, index: u32) -> Result<u32, Error> {
        self.lock().ref_slot(index)
    }

    pub fn unref_slot(&self, index: u32) -> Result<u32, Error> {
        self.lock().unref_slot(index)
    }

    pub fn slot_path(&self, index: u32) -> Result<String, Error> {
        self.lock().path(index)
    }

    pub fn ref_count(&self, index: u32) -> Result<u32, Error> {
        self.lock().ref_count(index)
    }

    pub fn user_data(&self, index: u32) -> Result<Vec<u8>, Error> {
        self.lock().user_data(index).map(<[u8]>::to_vec)
    }

    pub fn set_user_data(&self, index: u32, data: &[u8]) -> Result<(), Error> {
        self.lock().set_user_data(index, data)
    }

    fn word(&self, offset: usize) -> &AtomicU32 {
        // SAFETY: header words are 4-byte aligned inside a page-aligned mapping that lives
        // as long as `self`; every process touches them only through atomics.
        unsafe { AtomicU32::from_ptr(self.map.as_mut_ptr().add(offset).cast::<u32>()) }
    }

    fn spin_lock(&self) {
        let lock = self.word(OFF_LOCK);
        while lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::thread::yield_now();
        }
    }

    fn spin_unlock(&self) {
        self.word(OFF_LOCK).store(0, Ordering::Release);
    }

    /// Takes a permit if one is free; otherwise registers as a waiter unless `rechecking`.
    fn try_take_permit(&self, rechecking: bool) -> bool {
        self.spin_lock();
        let available = self.word(OFF_AVAILABLE);
        let waiting = self.word(OFF_WAITING);
        let taken = if available.load(Ordering::Relaxed) > 0 {
            available.fetch_sub(1, Ordering::Relaxed);
            if rechecking {
                let count = waiting.load(Ordering::Relaxed);
                waiting.store(count.saturating_sub(1), Ordering::Relaxed);
            }
            true
        } else {
            if !rechecking {
                waiting.fetch_add(1, Ordering::Relaxed);
            }
            false
        };
        self.spin_unlock();
        taken
    }

    /// Returns true when the permit was taken while re-checking, false on a plain wakeup.
    fn wait_for_wakeup(&self) -> bool {
        loop {
            let outcome = match &self.semaphore {
                Some(semaphore) => semaphore.wait(WAIT_SLICE).unwrap_or_else(|err| {
                    debug!(?err, "registry semaphore wait failed");
                    std::thread::sleep(WAIT_SLICE);
                    WaitOutcome::TimedOut
                }),
                None => {
                    std::thread::sleep(WAIT_SLICE);
                    WaitOutcome::TimedOut
                }
            };
            if outcome == WaitOutcome::Signaled {
                return false;
            }
            if self.try_take_permit(true) {
                return true;
            }
        }
    }

    fn unlock(&self) {
        self.spin_lock();
        self.word(OFF_AVAILABLE).fetch_add(1, Ordering::Relaxed);
        let waiting = self.word(OFF_WAITING);
        if waiting.load(Ordering::Relaxed) > 0 {
            waiting.fetch_sub(1, Ordering::Relaxed);
            if let Some(semaphore) = &self.semaphore {
                if let Err(err) = semaphore.post() {
                    debug!(?err, "registry semaphore post failed");
                }
            }
        }
        self.spin_unlock();
    }

    fn slot_ptr(&self, index: u32) -> *mut u8 {
        let offset = HEADER_SIZE + index as usize * self.slot_size;
        // SAFETY: `index < SLOT_COUNT` is checked by every caller and the mapping covers
        // `region_size(user_size)` bytes.
        unsafe { self.map.as_mut_ptr().add(offset) }
    }

    fn id_allowed(&self, id: &str) -> bool {
        match &self.id_filter {
            Some(filter) if !filter.is_empty() => id_matches(id, filter),
            _ => true,
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("path", &self.path)
            .field("name", &self.name)
            .field("user_size", &self.user_size)
            .finish()
    }
}

/// Exclusive access to the slot table; drop releases the registry lock.
pub struct RegistryGuard<'a> {
    registry: &'a Registry,
}

impl<'a> RegistryGuard<'a> {
    pub fn registry(&self) -> &'a Registry {
        self.registry
    }

    /// Reconciles the slot table against the devices currently present.
    pub fn update(&mut self) -> Result<(), Error> {
        let devices = self.registry.enumerator.enumerate().map_err(|err| {
            Error::new(ErrorKind::Api)
                .with_message("device enumeration failed")
                .with_source(err)
        })?;

        let capacity = SLOT_COUNT as usize - 1;
        let mut candidates: Vec<Option<String>> = Vec::new();
        for (path, friendly) in devices {
            if friendly != self.registry.name {
                continue;
            }
            if candidates.len() >= capacity {
                warn!(capacity, "more matching devices than registry slots");
                break;
            }
            if path.is_empty() || path.len() >= PATH_SIZE {
                warn!(len = path.len(), "device path does not fit a registry slot");
                continue;
            }
            candidates.push(Some(path));
        }
        let found = !candidates.is_empty();

        for index in 0..SLOT_COUNT {
            let path = read_str(&self.slot(index)[SLOT_PATH..SLOT_PATH + PATH_SIZE]);
            if path.is_empty() {
                continue;
            }
            let survivor = candidates
                .iter_mut()
                .find(|candidate| candidate.as_deref() == Some(path.as_str()));
            match survivor {
                Some(candidate) => {
                    *candidate = None;
                    write_u32(self.slot_mut(index), SLOT_AVAILABLE, 1);
                }
                None if read_u32(self.slot(index), SLOT_REF) > 0 => {
                    debug!(index, path = %path, "open device vanished; slot kept unavailable");
                    write_u32(self.slot_mut(index), SLOT_AVAILABLE, 0);
                }
                None => {
                    debug!(index, path = %path, "device removed");
                    self.slot_mut(index).fill(0);
                }
            }
        }

        let mut next = 0u32;
        for path in candidates.into_iter().flatten() {
            let Some(id) = stable_id(&path) else {
                debug!(path = %path, "no stable id in device path; skipped");
                continue;
            };
            let free = (next..SLOT_COUNT).find(|index| self.slot(*index)[SLOT_PATH] == 0);
            match free {
                Some(index) => {
                    let slot = self.slot_mut(index);
                    slot.fill(0);
                    write_str(&mut slot[SLOT_PATH..SLOT_PATH + PATH_SIZE], &path);
                    write_str(&mut slot[SLOT_ID..SLOT_ID + ID_SIZE], &id);
                    write_u32(slot, SLOT_AVAILABLE, 1);
                    debug!(index, path = %path, id = %id, "device placed");
                    next = index + 1;
                }
                None => {
                    warn!(path = %path, "no free registry slot");
                    next = SLOT_COUNT;
                }
            }
        }

        if !found {
            return Err(Error::new(ErrorKind::NoDevices)
                .with_message(format!("no device named {:?}", self.registry.name)));
        }
        Ok(())
    }

    /// Valid slots: occupied, available and allowed by the id filter.
    pub fn enumerate(&self) -> Result<Vec<SlotInfo>, Error> {
        let valid: Vec<SlotInfo> = (0..SLOT_COUNT)
            .filter(|index| self.is_valid(*index))
            .map(|index| self.info(index))
            .collect();
        if valid.is_empty() {
            return Err(Error::new(ErrorKind::NoDevices).with_message("no usable reader slots"));
        }
        Ok(valid)
    }

    /// Every slot, occupied or not.
    pub fn slots(&self) -> Vec<SlotInfo> {
        (0..SLOT_COUNT).map(|index| self.info(index)).collect()
    }

    pub fn get_slot(&mut self, index: u32) -> Result<SlotInfo, Error> {
        check_index(index)?;
        if !self.is_valid(index) {
            self.update()?;
            if !self.is_valid(index) {
                return Err(Error::new(ErrorKind::DeviceNotFound)
                    .with_message("reader slot is empty or unavailable")
                    .with_slot(index));
            }
        }
        Ok(self.info(index))
    }

    pub fn ref_slot(&mut self, index: u32) -> Result<u32, Error> {
        check_index(index)?;
        let count = read_u32(self.slot(index), SLOT_REF);
        if count > MAX_REF_COUNT {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("reference count {count} above limit"))
                .with_slot(index));
        }
        if count == MAX_REF_COUNT {
            return Err(Error::new(ErrorKind::InternalLimit)
                .with_message(format!("reader already has {MAX_REF_COUNT} references"))
                .with_slot(index));
        }
        write_u32(self.slot_mut(index), SLOT_REF, count + 1);
        Ok(count + 1)
    }

    pub fn unref_slot(&mut self, index: u32) -> Result<u32, Error> {
        check_index(index)?;
        let count = read_u32(self.slot(index), SLOT_REF);
        if count > MAX_REF_COUNT {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("reference count {count} above limit"))
                .with_slot(index));
        }
        if count == 0 {
            return Err(Error::new(ErrorKind::InternalLimit)
                .with_message("reader has no references")
                .with_slot(index));
        }
        write_u32(self.slot_mut(index), SLOT_REF, count - 1);
        Ok(count - 1)
    }

    pub fn path(&self, index: u32) -> Result<String, Error> {
        check_index(index)?;
        Ok(read_str(&self.slot(index)[SLOT_PATH..SLOT_PATH + PATH_SIZE]))
    }

    pub fn ref_count(&self, index: u32) -> Result<u32, Error> {
        check_index(index)?;
        Ok(read_u32(self.slot(index), SLOT_REF))
    }

    pub fn user_data(&self, index: u32) -> Result<&[u8], Error> {
        check_index(index)?;
        let user_size = self.registry.user_size;
        Ok(&self.slot(index)[SLOT_USER..SLOT_USER + user_size])
    }

    pub fn user_data_mut(&mut self, index: u32) -> Result<&mut [u8], Error> {
        check_index(index)?;
        let user_size = self.registry.user_size;
        Ok(&mut self.slot_mut(index)[SLOT_USER..SLOT_USER + user_size])
    }

    /// Replaces the payload; bytes past `data` are zeroed.
    pub fn set_user_data(&mut self, index: u32, data: &[u8]) -> Result<(), Error> {
        let user_size = self.registry.user_size;
        if data.len() > user_size {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("payload of {} bytes exceeds {user_size}", data.len()))
                .with_slot(index));
        }
        let user = self.user_data_mut(index)?;
        user[..data.len()].copy_from_slice(data);
        user[data.len()..].fill(0);
        Ok(())
    }

    fn is_valid(&self, index: u32) -> bool {
        let slot = self.slot(index);
        if slot[SLOT_PATH] == 0 || read_u32(slot, SLOT_AVAILABLE) == 0 {
            return false;
        }
        self.registry
            .id_allowed(&read_str(&slot[SLOT_ID..SLOT_ID + ID_SIZE]))
    }

    fn info(&self, index: u32) -> SlotInfo {
        let slot = self.slot(index);
        SlotInfo {
            index,
            path: read_str(&slot[SLOT_PATH..SLOT_PATH + PATH_SIZE]),
            id: read_str(&slot[SLOT_ID..SLOT_ID + ID_SIZE]),
            ref_count: read_u32(slot, SLOT_REF),
            available: read_u32(slot, SLOT_AVAILABLE) != 0,
        }
    }

    fn slot(&self, index: u32) -> &[u8] {
        // SAFETY: the guard holds the registry lock, so no other process or thread writes
        // the slot table while this borrow lives.
        unsafe { std::slice::from_raw_parts(self.registry.slot_ptr(index), self.registry.slot_size) }
    }

    fn slot_mut(&mut self, index: u32) -> &mut [u8] {
        // SAFETY: as in `slot`; `&mut self` rules out overlapping borrows through this guard.
        unsafe {
            std::slice::from_raw_parts_mut(self.registry.slot_ptr(index), self.registry.slot_size)
        }
    }
}

impl Drop for RegistryGuard<'_> {
    fn drop(&mut self) {
        self.registry.unlock();
    }
}

/// Extracts the serial from `\\?\usb#vid_xxxx&pid_xxxx#SERIAL#{guid}`; other paths use their
/// final component.
pub fn stable_id(path: &str) -> Option<String> {
    let id = match path.find('\\') {
        Some(start) => {
            let rest = path[start..].strip_prefix(r"\\?\")?;
            let (_, rest) = rest.split_once('#')?;
            let (_, rest) = rest.split_once('#')?;
            let (serial, _) = rest.split_once('#')?;
            serial
        }
        None => path.rsplit('/').next()?,
    };
    if id.is_empty() || id.len() >= ID_SIZE {
        return None;
    }
    Some(id.to_string())
}

/// Same length, and every pattern character is `*` or equal.
pub fn id_matches(id: &str, pattern: &str) -> bool {
    id.chars().count() == pattern.chars().count()
        && id
            .chars()
            .zip(pattern.chars())
            .all(|(c, p)| p == '*' || c == p)
}

fn check_index(index: u32) -> Result<(), Error> {
    if index >= SLOT_COUNT {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("slot index must be below {SLOT_COUNT}"))
            .with_slot(index));
    }
    Ok(())
}

fn prepare_region(file: &File, path: &Path, user_size: usize) -> Result<MmapRaw, Error> {
    let expected = region_size(user_size);
    let len = file
        .metadata()
        .map(|meta| meta.len())
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
    if len == 0 {
        file.set_len(expected as u64)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
    }

    let map = MmapRaw::map_raw(file)
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
    if map.len() < HEADER_SIZE {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message("region smaller than its header")
            .with_path(path));
    }

    let word = |offset: usize| {
        // SAFETY: offset < HEADER_SIZE <= map.len(), 4-byte aligned in a page-aligned map.
        unsafe { AtomicU32::from_ptr(map.as_mut_ptr().add(offset).cast::<u32>()) }
    };

    let signature = word(OFF_SIGNATURE).load(Ordering::Acquire);
    if signature == 0 {
        // New file, or a creator that died before publishing; the file lock is ours.
        if map.len() != expected {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("unpublished region has an unexpected size")
                .with_path(path));
        }
        // SAFETY: nobody attaches before the signature is published under the file lock.
        unsafe { std::ptr::write_bytes(map.as_mut_ptr(), 0, expected) };
        word(OFF_LOCK).store(0, Ordering::Relaxed);
        word(OFF_AVAILABLE).store(1, Ordering::Relaxed);
        word(OFF_WAITING).store(0, Ordering::Relaxed);
        word(OFF_COUNT).store(SLOT_COUNT, Ordering::Relaxed);
        word(OFF_SLOT_SIZE).store(slot_size(user_size) as u32, Ordering::Relaxed);
        word(OFF_SIGNATURE).store(SIGNATURE, Ordering::Release);
        debug!(path = %path.display(), size = expected, "registry region created");
        return Ok(map);
    }

    if signature != SIGNATURE {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message("bad registry signature")
            .with_path(path));
    }
    if word(OFF_COUNT).load(Ordering::Relaxed) != SLOT_COUNT {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message("unexpected slot count")
            .with_path(path));
    }
    if word(OFF_SLOT_SIZE).load(Ordering::Relaxed) as usize != slot_size(user_size)
        || map.len() < expected
    {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message("registry slot size does not match this payload size")
            .with_path(path));
    }
    debug!(path = %path.display(), "registry region attached");
    Ok(map)
}

fn io_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        _ => ErrorKind::Io,
    }
}

fn read_str(buf: &[u8]) -> String {
    let end = buf.iter().position(|byte| *byte == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn write_str(buf: &mut [u8], value: &str) {
    buf.fill(0);
    buf[..value.len()].copy_from_slice(value.as_bytes());
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
