//! Purpose: Open, use and close one registry slot as a card reader.
//! Exports: `Reader`, `ReaderInfo`, `ReaderState`, `CardStatus`, `ShareMode`, `Disposition`, `reader_state`.
//! Role: Applies the sharing policy and keeps the card state in the slot payload so every
//! process talking to the same reader continues the same T=1 sequence.
//! Invariants: Card state is loaded before and stored after every exchange, under the registry lock.
//! Invariants: A reader holds exactly one slot reference from connect until release.
use tracing::{debug, warn};

use crate::core::device::{DeviceControl, DeviceOpener, Pacer};
use crate::core::error::{Error, ErrorCategory, ErrorKind};
use crate::core::registry::{Registry, RegistryGuard};
use crate::core::session::{CARD_STATE_SIZE, CardSession, CardState};

pub const READER_INFO_SIZE: usize = 4 + CARD_STATE_SIZE;

const FLAG_EXCLUSIVE: u8 = 0x01;
const FLAG_RESET_PENDING: u8 = 0x02;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShareMode {
    Shared,
    Exclusive,
    Direct,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    Leave,
    Reset,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Protocol {
    T1,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CardStatus {
    Absent,
    Powered,
    Specific(Protocol),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReaderState {
    Unavailable,
    Empty,
    Mute,
    Present {
        in_use: bool,
        exclusive: bool,
        atr: Vec<u8>,
    },
}

/// Per-slot record shared by every process that opens the reader.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReaderInfo {
    pub exclusive: bool,
    pub reset_pending: bool,
    pub card: CardState,
}

impl ReaderInfo {
    pub fn encode(&self) -> [u8; READER_INFO_SIZE] {
        let mut buf = [0u8; READER_INFO_SIZE];
        if self.exclusive {
            buf[0] |= FLAG_EXCLUSIVE;
        }
        if self.reset_pending {
            buf[0] |= FLAG_RESET_PENDING;
        }
        buf[4..].copy_from_slice(&self.card.encode());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < READER_INFO_SIZE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("reader record too small"));
        }
        Ok(Self {
            exclusive: buf[0] & FLAG_EXCLUSIVE != 0,
            reset_pending: buf[0] & FLAG_RESET_PENDING != 0,
            card: CardState::decode(&buf[4..READER_INFO_SIZE])?,
        })
    }

    fn load(guard: &RegistryGuard<'_>, slot: u32) -> Result<Self, Error> {
        Self::decode(guard.user_data(slot)?).map_err(|err| {
            Error::new(ErrorKind::Corrupt)
                .with_message("reader record in slot payload is unreadable")
                .with_slot(slot)
                .with_source(err)
        })
    }

    fn store(&self, guard: &mut RegistryGuard<'_>, slot: u32) -> Result<(), Error> {
        guard.set_user_data(slot, &self.encode())
    }
}

pub struct Reader<'r, D, P> {
    registry: &'r Registry,
    slot: u32,
    mode: ShareMode,
    session: CardSession<D, P>,
    released: bool,
}

impl<'r, D: DeviceControl, P: Pacer> Reader<'r, D, P> {
    /// Leases `slot`, powers the card up if needed and checks it speaks T=1.
    pub fn connect<O>(
        registry: &'r Registry,
        slot: u32,
        opener: &O,
        mode: ShareMode,
        pacer: P,
    ) -> Result<Self, Error>
    where
        O: DeviceOpener<Device = D>,
    {
        if mode == ShareMode::Direct {
            return Err(Error::new(ErrorKind::Unsupported)
                .with_message("direct reader access is not supported")
                .with_slot(slot));
        }
        check_payload(registry)?;

        let mut guard = registry.lock();
        let info = guard.get_slot(slot)?;
        let mut record = ReaderInfo::load(&guard, slot)?;
        if record.exclusive {
            return Err(Error::new(ErrorKind::NotShared)
                .with_message("reader is held exclusively")
                .with_slot(slot));
        }
        if mode == ShareMode::Exclusive && info.ref_count > 0 {
            return Err(Error::new(ErrorKind::SharingViolation)
                .with_message("reader is already open in shared mode")
                .with_slot(slot));
        }

        let device = open_device(opener, &info.path, slot)?;
        let mut session = CardSession::with_state(device, pacer, std::mem::take(&mut record.card));
        let ready = session.init(false).and_then(|_| require_t1(&session));
        record.card = session.state().clone();
        if let Err(err) = ready {
            record.store(&mut guard, slot)?;
            return Err(err.with_slot(slot));
        }

        guard.ref_slot(slot)?;
        if mode == ShareMode::Exclusive {
            record.exclusive = true;
        }
        record.store(&mut guard, slot)?;
        debug!(slot, ?mode, "reader connected");
        drop(guard);

        Ok(Self {
            registry,
            slot,
            mode,
            session,
            released: false,
        })
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn mode(&self) -> ShareMode {
        self.mode
    }

    pub fn session(&self) -> &CardSession<D, P> {
        &self.session
    }

    /// One APDU exchange against the shared card state.
    pub fn transmit(&mut self, request: &[u8]) -> Result<Vec<u8>, Error> {
        let mut guard = self.registry.lock();
        let mut record = ReaderInfo::load(&guard, self.slot)?;
        self.session.set_state(std::mem::take(&mut record.card));
        let response = self.session.transmit(request);
        record.card = self.session.state().clone();
        record.store(&mut guard, self.slot)?;
        response
    }

    pub fn status(&mut self) -> Result<CardStatus, Error> {
        let mut guard = self.registry.lock();
        let mut record = ReaderInfo::load(&guard, self.slot)?;
        self.session.set_state(std::mem::take(&mut record.card));
        let outcome = self.session.init(false);
        record.card = self.session.state().clone();
        record.store(&mut guard, self.slot)?;

        match outcome {
            Ok(_) if record.card.params().t1.enabled => Ok(CardStatus::Specific(Protocol::T1)),
            Ok(_) => Ok(CardStatus::Powered),
            Err(err) if err.kind() == ErrorKind::NoCard => Ok(CardStatus::Absent),
            Err(err)
                if matches!(
                    err.kind().category(),
                    ErrorCategory::Parse | ErrorCategory::Comm
                ) =>
            {
                Ok(CardStatus::Powered)
            }
            Err(err) => Err(err.with_slot(self.slot)),
        }
    }

    pub fn atr(&self) -> Result<Vec<u8>, Error> {
        let guard = self.registry.lock();
        Ok(ReaderInfo::load(&guard, self.slot)?.card.atr().to_vec())
    }

    pub fn disconnect(mut self, disposition: Disposition) -> Result<(), Error> {
        self.release(disposition)
    }

    fn release(&mut self, disposition: Disposition) -> Result<(), Error> {
        if self.released {
            return Ok(());
        }

        let mut guard = self.registry.lock();
        let mut record = ReaderInfo::load(&guard, self.slot)?;
        if self.mode == ShareMode::Exclusive {
            record.exclusive = false;
        }
        let remaining = guard.unref_slot(self.slot)?;
        // The reference is gone; later failures must not release it twice.
        self.released = true;
        if disposition == Disposition::Reset || record.reset_pending {
            if remaining == 0 {
                record.card.clear();
                record.reset_pending = false;
            } else {
                record.reset_pending = true;
            }
        }
        record.store(&mut guard, self.slot)?;
        debug!(slot = self.slot, remaining, ?disposition, "reader released");
        Ok(())
    }
}

impl<D, P> Drop for Reader<'_, D, P> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        // Mirrors `release(Disposition::Leave)` without the DeviceControl bound. The reference
        // goes first so an unreadable record cannot pin the slot.
        let mut guard = self.registry.lock();
        let remaining = match guard.unref_slot(self.slot) {
            Ok(remaining) => remaining,
            Err(err) => {
                warn!(slot = self.slot, error = %err, "reader dropped without releasing its reference");
                return;
            }
        };
        let result = ReaderInfo::load(&guard, self.slot).and_then(|mut record| {
            if self.mode == ShareMode::Exclusive {
                record.exclusive = false;
            }
            if record.reset_pending && remaining == 0 {
                record.card.clear();
                record.reset_pending = false;
            }
            record.store(&mut guard, self.slot)
        });
        if let Err(err) = result {
            warn!(slot = self.slot, error = %err, "reader dropped without a clean release");
        }
    }
}

/// Probes a slot without keeping a reference to it.
pub fn reader_state<O, P>(registry: &Registry, slot: u32, opener: &O, pacer: P) -> ReaderState
where
    O: DeviceOpener,
    P: Pacer,
{
    if check_payload(registry).is_err() {
        return ReaderState::Unavailable;
    }
    let mut guard = registry.lock();
    let Ok(info) = guard.get_slot(slot) else {
        return ReaderState::Unavailable;
    };
    let Ok(mut record) = ReaderInfo::load(&guard, slot) else {
        return ReaderState::Unavailable;
    };
    let Ok(device) = open_device(opener, &info.path, slot) else {
        return ReaderState::Unavailable;
    };

    let mut session = CardSession::with_state(device, pacer, std::mem::take(&mut record.card));
    let outcome = session.init(false);
    record.card = session.state().clone();
    if let Err(err) = record.store(&mut guard, slot) {
        warn!(slot, error = %err, "could not persist probed card state");
    }

    match outcome {
        Ok(_) => ReaderState::Present {
            in_use: info.ref_count > 0 && !record.exclusive,
            exclusive: info.ref_count > 0 && record.exclusive,
            atr: record.card.atr().to_vec(),
        },
        Err(err) if err.kind() == ErrorKind::NoCard => ReaderState::Empty,
        Err(err) => {
            debug!(slot, error = %err, "card present but not answering");
            ReaderState::Mute
        }
    }
}

fn check_payload(registry: &Registry) -> Result<(), Error> {
    if registry.user_size() < READER_INFO_SIZE {
        return Err(Error::new(ErrorKind::Usage).with_message(format!(
            "registry payload must hold {READER_INFO_SIZE} bytes for reader records"
        )));
    }
    Ok(())
}

fn open_device<O: DeviceOpener>(opener: &O, path: &str, slot: u32) -> Result<O::Device, Error> {
    opener.open(path).map_err(|err| {
        Error::new(ErrorKind::DeviceNotFound)
            .with_message("device could not be opened")
            .with_slot(slot)
            .with_source(err)
    })
}

fn require_t1<D: DeviceControl, P: Pacer>(session: &CardSession<D, P>) -> Result<(), Error> {
    if session.state().params().t1.enabled {
        return Ok(());
    }
    Err(Error::new(ErrorKind::ProtoMismatch).with_message("card does not offer T=1"))
}
