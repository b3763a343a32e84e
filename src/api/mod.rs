//! Purpose: Public Rust API boundary for tunercard.
//! Exports: Core types and operations needed by the CLI and by callers embedding the reader.
//! Role: Additive-only surface; hides module layout.
//! Invariants: This module is the only public path to core primitives.

pub use crate::core::atr::{
    self, CardParameters, MAX_ATR_LEN, T0Params, T1Params, baud_divisor, clock_rate,
};
pub use crate::core::block::{self, Block, BlockKind, Defect, check_edc, make_block};
pub use crate::core::device::{
    DeviceControl, DeviceEnumerator, DeviceOpener, Pacer, StaticEnumerator, ThreadPacer,
    VirtualPacer,
};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorCategory, ErrorKind};
pub use crate::core::handle::{HandleGuard, HandleTable};
pub use crate::core::reader::{
    CardStatus, Disposition, Protocol, READER_INFO_SIZE, Reader, ReaderInfo, ReaderState,
    ShareMode, reader_state,
};
pub use crate::core::registry::{
    DIR_ENV, MAX_REF_COUNT, Registry, RegistryGuard, RegistryOptions, SLOT_COUNT, SlotInfo,
    default_dir, id_matches, stable_id,
};
pub use crate::core::session::{CARD_STATE_SIZE, CardSession, CardState, InitOutcome};
pub use crate::core::t1::Link;
