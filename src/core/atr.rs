//! Purpose: Parse an Answer-To-Reset into the card's timing and T=1 link parameters.
//! Exports: `CardParameters`, `T0Params`, `T1Params`, `parse`, TA1 lookup helpers.
//! Role: Leaf module; runs once per power-up, results feed the T=1 engine.
//! Invariants: A failed parse never yields partial parameters.
//! Invariants: All derived times are integer microseconds.
use serde::Serialize;
use tracing::debug;

use crate::core::error::{Error, ErrorKind};

/// Initial character for direct convention, the only convention supported.
pub const ATR_TS: u8 = 0x3B;
pub const MAX_ATR_LEN: usize = 64;
pub const DEFAULT_IFSC: u8 = 32;
pub const DEFAULT_IFSD: u8 = 32;
pub const MAX_IFSD: u8 = 254;

const TA_PRESENT: u8 = 0x10;
const TB_PRESENT: u8 = 0x20;
const TC_PRESENT: u8 = 0x40;
const TD_PRESENT: u8 = 0x80;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct T0Params {
    pub enabled: bool,
    pub wi: u8,
    pub wt: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct T1Params {
    pub enabled: bool,
    pub seq: u8,
    pub ifsc: u8,
    pub ifsd: u8,
    pub cwi: u8,
    pub bwi: u8,
    pub edc: u8,
    pub cwt: u32,
    pub bwt: u32,
    pub bgt: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct CardParameters {
    pub fi: u16,
    pub di: u8,
    /// Card clock in MHz (7.5 MHz is truncated to 7).
    pub f: u8,
    pub etu: u32,
    pub n: u8,
    pub t0: T0Params,
    pub t1: T1Params,
}

impl Default for CardParameters {
    /// Values assumed while the ATR itself is being received.
    fn default() -> Self {
        Self {
            fi: 372,
            di: 1,
            f: 4,
            etu: 372 / 4,
            n: 0,
            t0: T0Params {
                enabled: false,
                wi: 10,
                wt: 0,
            },
            t1: T1Params {
                enabled: false,
                seq: 0,
                ifsc: DEFAULT_IFSC,
                ifsd: DEFAULT_IFSD,
                cwi: 13,
                bwi: 4,
                edc: 0,
                cwt: 0,
                bwt: 0,
                bgt: 0,
            },
        }
    }
}

impl CardParameters {
    /// Returns the link to the state both sides share right after a reset.
    pub fn reset_link(&mut self) {
        self.t1.seq = 0;
        self.t1.ifsd = DEFAULT_IFSD;
    }

    fn derive_timing(&mut self) {
        self.etu = u32::from(self.fi) / (u32::from(self.di) * u32::from(self.f));

        if self.t0.enabled {
            self.t0.wt = u32::from(self.t0.wi) * 960 * u32::from(self.di);
        }

        if self.t1.enabled {
            let bwi = u32::from(self.t1.bwi);
            let cwi = u32::from(self.t1.cwi);
            self.t1.bwt = (2 * bwi * 960 * 372 / u32::from(self.f)) + 11 * self.etu;
            self.t1.cwt = (2 * cwi + 11) * self.etu;
            self.t1.bgt = 22 * self.etu;
            debug!(
                bwt = self.t1.bwt,
                cwt = self.t1.cwt,
                bgt = self.t1.bgt,
                "derived T=1 timing"
            );
        }
    }
}

/// Maps the TA1 high nibble to `(Fi, f)`.
pub fn clock_rate(code: u8) -> Option<(u16, u8)> {
    match code & 0x0F {
        0x0 => Some((372, 4)),
        0x1 => Some((372, 5)),
        0x2 => Some((558, 6)),
        0x3 => Some((744, 8)),
        0x4 => Some((1116, 12)),
        0x5 => Some((1488, 16)),
        0x6 => Some((1860, 20)),
        0x9 => Some((512, 5)),
        0xA => Some((768, 7)),
        0xB => Some((1024, 10)),
        0xC => Some((1536, 15)),
        0xD => Some((2048, 20)),
        _ => None,
    }
}

/// Maps the TA1 low nibble to `Di`.
pub fn baud_divisor(code: u8) -> Option<u8> {
    match code & 0x0F {
        0x1 => Some(1),
        0x2 => Some(2),
        0x3 => Some(4),
        0x4 => Some(8),
        0x5 => Some(16),
        0x6 => Some(32),
        0x7 => Some(64),
        0x8 => Some(12),
        0x9 => Some(20),
        _ => None,
    }
}

pub fn parse(atr: &[u8]) -> Result<CardParameters, Error> {
    debug!(len = atr.len(), atr = %hex::encode(atr), "parsing ATR");

    if atr.len() > MAX_ATR_LEN {
        return Err(unsupported("ATR exceeds 64 bytes"));
    }
    if atr.first() != Some(&ATR_TS) {
        return Err(unsupported("initial character is not 0x3B"));
    }
    let format = *atr.get(1).ok_or_else(|| unsupported("ATR has no format byte"))?;

    let historical = usize::from(format & 0x0F);
    let mut presence = format & 0xF0;
    if presence == 0 {
        return Err(unsupported("ATR carries no interface bytes"));
    }

    let interface_len = atr
        .len()
        .checked_sub(2 + historical + 1)
        .ok_or_else(|| unsupported("ATR shorter than its declared historical bytes"))?;
    let interface = &atr[2..2 + interface_len];

    let mut params = CardParameters::default();
    let mut cursor = InterfaceCursor::new(interface);
    let mut group: u32 = 1;
    let mut protocol: Option<u8> = None;

    loop {
        if presence & TA_PRESENT != 0 {
            let value = cursor.next("TA")?;
            apply_ta(&mut params, group, protocol, value)?;
        }
        if presence & TB_PRESENT != 0 {
            let value = cursor.next("TB")?;
            apply_tb(&mut params, group, protocol, value);
        }
        if presence & TC_PRESENT != 0 {
            let value = cursor.next("TC")?;
            apply_tc(&mut params, group, protocol, value);
        }
        if presence & TD_PRESENT == 0 {
            break;
        }

        let td = cursor.next("TD")?;
        presence = td & 0xF0;
        let announced = td & 0x0F;
        if announced == 0 {
            params.t0.enabled = true;
        }
        protocol = Some(announced);
        group += 1;
        if presence == 0 {
            break;
        }
    }

    if !cursor.is_exhausted() {
        return Err(unsupported("interface bytes do not match the declared length"));
    }

    let check = atr[1..].iter().fold(0u8, |acc, byte| acc ^ byte);
    if check != 0 {
        return Err(Error::new(ErrorKind::Checksum)
            .with_message(format!("TCK mismatch (residue {check:#04x})")));
    }

    params.derive_timing();
    debug!(
        fi = params.fi,
        di = params.di,
        f = params.f,
        etu = params.etu,
        t1 = params.t1.enabled,
        "ATR accepted"
    );
    Ok(params)
}

fn unsupported(message: &str) -> Error {
    Error::new(ErrorKind::UnsupportedCard).with_message(message)
}

struct InterfaceCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> InterfaceCursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn next(&mut self, name: &str) -> Result<u8, Error> {
        let value = self
            .bytes
            .get(self.pos)
            .copied()
            .ok_or_else(|| unsupported(&format!("ATR truncated before {name}")))?;
        self.pos += 1;
        Ok(value)
    }

    fn is_exhausted(&self) -> bool {
        self.pos == self.bytes.len()
    }
}

fn apply_ta(
    params: &mut CardParameters,
    group: u32,
    protocol: Option<u8>,
    value: u8,
) -> Result<(), Error> {
    match group {
        1 => {
            let (fi, f) = clock_rate(value >> 4).ok_or_else(|| {
                unsupported(&format!("TA1 clock rate code {:#x} unsupported", value >> 4))
            })?;
            let di = baud_divisor(value).ok_or_else(|| {
                unsupported(&format!("TA1 baud code {:#x} unsupported", value & 0x0F))
            })?;
            params.fi = fi;
            params.f = f;
            params.di = di;
        }
        2 => {
            if value & 0x0F != 1 {
                return Err(unsupported(&format!("TA2 mode {value:#04x} unsupported")));
            }
            params.t1.enabled = true;
        }
        _ => {
            if protocol == Some(1) {
                if value == 0 || value == 0xFF {
                    debug!(group, value, "unexpected IFSC value");
                }
                params.t1.ifsc = value;
            }
        }
    }
    Ok(())
}

fn apply_tb(params: &mut CardParameters, group: u32, protocol: Option<u8>, value: u8) {
    // TB1 and TB2 (programming voltage) are deprecated.
    if group > 2 && protocol == Some(1) {
        params.t1.bwi = value >> 4;
        params.t1.cwi = value & 0x0F;
        debug!(bwi = params.t1.bwi, cwi = params.t1.cwi, "TB sets T=1 wait integers");
    }
}

fn apply_tc(params: &mut CardParameters, group: u32, protocol: Option<u8>, value: u8) {
    match group {
        1 => params.n = value,
        2 => params.t0.wi = value,
        _ => {
            if protocol == Some(1) {
                params.t1.edc = value;
            }
        }
    }
}
