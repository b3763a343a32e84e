// T=1 block framing: prologue construction and the XOR epilogue.
use std::fmt;

use crate::core::error::{Error, ErrorKind};

pub const NAD: u8 = 0x00;
pub const MAX_INF: usize = 254;
/// NAD, PCB, LEN, INF and EDC.
pub const MAX_BLOCK: usize = 3 + MAX_INF + 1;

pub const I_BLOCK: u8 = 0x00;
pub const R_BLOCK: u8 = 0x80;
pub const S_BLOCK: u8 = 0xC0;

pub const S_RESYNCH_REQUEST: u8 = 0xC0;
pub const S_IFS_REQUEST: u8 = 0xC1;
pub const R_EDC_ERROR: u8 = 0x81;
pub const R_OTHER_ERROR: u8 = 0x82;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockKind {
    Information,
    ReceiveReady,
    Supervisory,
}

impl BlockKind {
    pub fn from_pcb(pcb: u8) -> Self {
        match pcb & 0xC0 {
            R_BLOCK => BlockKind::ReceiveReady,
            S_BLOCK => BlockKind::Supervisory,
            _ => BlockKind::Information,
        }
    }
}

/// Why a received byte sequence is not a usable block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Defect {
    Edc,
    Length,
}

#[derive(Clone, Eq, PartialEq)]
pub struct Block {
    buf: [u8; MAX_BLOCK],
    len: usize,
}

impl Block {
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn pcb(&self) -> u8 {
        self.buf[1]
    }

    pub fn kind(&self) -> BlockKind {
        BlockKind::from_pcb(self.pcb())
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[3..3 + usize::from(self.buf[2])]
    }

    /// N(R) of an R-block, N(S) of an I-block.
    pub fn sequence_bit(&self) -> u8 {
        match self.kind() {
            BlockKind::Information => (self.pcb() >> 6) & 1,
            BlockKind::ReceiveReady => (self.pcb() >> 4) & 1,
            BlockKind::Supervisory => 0,
        }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("kind", &self.kind())
            .field("bytes", &hex::encode(self.as_bytes()))
            .finish()
    }
}

/// Builds a block; the kind comes from the top two bits of `code`.
pub fn make_block(code: u8, payload: &[u8], seq: u8) -> Result<Block, Error> {
    if payload.len() > MAX_INF {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("block payload of {} bytes exceeds 254", payload.len())));
    }

    let seq = seq & 1;
    let pcb = match BlockKind::from_pcb(code) {
        BlockKind::Information => seq << 6,
        BlockKind::ReceiveReady => (code & 0xAF) | (seq << 4),
        BlockKind::Supervisory => code & 0xE3,
    };

    let mut buf = [0u8; MAX_BLOCK];
    buf[0] = NAD;
    buf[1] = pcb;
    buf[2] = payload.len() as u8;
    buf[3..3 + payload.len()].copy_from_slice(payload);
    let edc_at = 3 + payload.len();
    buf[edc_at] = edc(&buf[..edc_at]);

    Ok(Block {
        buf,
        len: edc_at + 1,
    })
}

pub fn edc(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, byte| acc ^ byte)
}

/// True when the XOR over the whole block, EDC included, is zero.
pub fn check_edc(bytes: &[u8]) -> bool {
    edc(bytes) == 0
}

/// Validates a received block: EDC first, then `4 + LEN == len`.
pub fn decode(bytes: &[u8]) -> Result<Block, Defect> {
    if bytes.is_empty() || !check_edc(bytes) {
        return Err(Defect::Edc);
    }
    if bytes.len() < 4 || bytes.len() > MAX_BLOCK || 4 + usize::from(bytes[2]) != bytes.len() {
        return Err(Defect::Length);
    }
    let mut buf = [0u8; MAX_BLOCK];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(Block {
        buf,
        len: bytes.len(),
    })
}
