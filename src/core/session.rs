//! Purpose: Card lifecycle on one reader: presence, power-up with ATR capture, and data exchange.
//! Exports: `CardSession`, `CardState`, `InitOutcome`, `CARD_STATE_SIZE`.
//! Role: Glue between the device channel, the ATR parser and the T=1 link.
//! Invariants: A card state is initialised iff its ATR is non-empty.
//! Invariants: A failed initialisation never leaves a partial state behind.
//! Invariants: `transmit` re-initialises at most once per call.
use tracing::{debug, warn};

use crate::core::atr::{self, CardParameters, MAX_ATR_LEN};
use crate::core::block::I_BLOCK;
use crate::core::device::{DeviceControl, Pacer};
use crate::core::error::{Error, ErrorKind};
use crate::core::t1::Link;

pub const CARD_STATE_SIZE: usize = 128;
pub const CARD_BAUD: u32 = 19_200;
pub const INIT_ROUNDS: u32 = 3;
pub const POST_RESET_SETTLE_US: u64 = 10_000;

const ATR_POLL_ETUS: u32 = 24;
const ATR_IDLE_ETUS: u32 = 9_600;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InitOutcome {
    Initialized,
    AlreadyInitialized,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CardState {
    atr: Vec<u8>,
    params: CardParameters,
}

impl CardState {
    pub fn is_initialized(&self) -> bool {
        !self.atr.is_empty()
    }

    pub fn atr(&self) -> &[u8] {
        &self.atr
    }

    pub fn params(&self) -> &CardParameters {
        &self.params
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Fixed-size little-endian record, sized to live in a registry slot payload.
    pub fn encode(&self) -> [u8; CARD_STATE_SIZE] {
        let mut buf = [0u8; CARD_STATE_SIZE];
        let p = &self.params;

        buf[0] = self.atr.len() as u8;
        buf[1..1 + self.atr.len()].copy_from_slice(&self.atr);
        buf[66..68].copy_from_slice(&p.fi.to_le_bytes());
        buf[68] = p.di;
        buf[69] = p.f;
        buf[70] = p.n;
        buf[71] = u8::from(p.t0.enabled);
        write_u32(&mut buf, 72, p.etu);
        buf[76] = p.t0.wi;
        buf[77] = u8::from(p.t1.enabled);
        buf[78] = p.t1.seq;
        buf[79] = p.t1.ifsc;
        buf[80] = p.t1.ifsd;
        buf[81] = p.t1.cwi;
        buf[82] = p.t1.bwi;
        buf[83] = p.t1.edc;
        write_u32(&mut buf, 84, p.t0.wt);
        write_u32(&mut buf, 88, p.t1.cwt);
        write_u32(&mut buf, 92, p.t1.bwt);
        write_u32(&mut buf, 96, p.t1.bgt);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < CARD_STATE_SIZE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("card state record too small"));
        }
        let atr_len = usize::from(buf[0]);
        if atr_len > MAX_ATR_LEN {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("card state holds an ATR of {atr_len} bytes")));
        }
        if atr_len == 0 {
            return Ok(Self::default());
        }

        let mut params = CardParameters {
            fi: u16::from_le_bytes([buf[66], buf[67]]),
            di: buf[68],
            f: buf[69],
            n: buf[70],
            etu: read_u32(buf, 72),
            ..CardParameters::default()
        };
        params.t0.enabled = buf[71] != 0;
        params.t0.wi = buf[76];
        params.t0.wt = read_u32(buf, 84);
        params.t1.enabled = buf[77] != 0;
        params.t1.seq = buf[78] & 1;
        params.t1.ifsc = buf[79];
        params.t1.ifsd = buf[80];
        params.t1.cwi = buf[81];
        params.t1.bwi = buf[82];
        params.t1.edc = buf[83];
        params.t1.cwt = read_u32(buf, 88);
        params.t1.bwt = read_u32(buf, 92);
        params.t1.bgt = read_u32(buf, 96);

        Ok(Self {
            atr: buf[1..1 + atr_len].to_vec(),
            params,
        })
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub struct CardSession<D, P> {
    device: D,
    pacer: P,
    state: CardState,
}

impl<D: DeviceControl, P: Pacer> CardSession<D, P> {
    pub fn new(device: D, pacer: P) -> Self {
        Self::with_state(device, pacer, CardState::default())
    }

    pub fn with_state(device: D, pacer: P, state: CardState) -> Self {
        Self {
            device,
            pacer,
            state,
        }
    }

    pub fn state(&self) -> &CardState {
        &self.state
    }

    pub fn set_state(&mut self, state: CardState) {
        self.state = state;
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn pacer(&self) -> &P {
        &self.pacer
    }

    pub fn into_parts(self) -> (D, P, CardState) {
        (self.device, self.pacer, self.state)
    }

    pub fn detect(&mut self) -> Result<bool, Error> {
        self.device.detect()
    }

    /// Powers the card up and parses its ATR unless that already happened.
    pub fn init(&mut self, force: bool) -> Result<InitOutcome, Error> {
        let present = match self.device.detect() {
            Ok(present) => present,
            Err(err) => {
                self.state.clear();
                return Err(err);
            }
        };
        if !present {
            self.state.clear();
            return Err(Error::new(ErrorKind::NoCard).with_message("no card in the reader"));
        }
        if self.state.is_initialized() && !force {
            return Ok(InitOutcome::AlreadyInitialized);
        }

        // Each round starts from a fresh reset: a rejected ATR is fatal to its power-up cycle.
        let mut round = 1;
        loop {
            self.state.clear();
            match self.power_up() {
                Ok(()) => break,
                Err(err) => {
                    warn!(round, error = %err, "card power-up attempt failed");
                    self.state.clear();
                    if round == INIT_ROUNDS {
                        return Err(err);
                    }
                    round += 1;
                }
            }
        }

        if let Err(err) = self.device.set_baud(CARD_BAUD) {
            self.state.clear();
            return Err(err);
        }
        debug!(atr = %hex::encode(&self.state.atr), "card initialised");
        Ok(InitOutcome::Initialized)
    }

    /// Exchanges one APDU, re-initialising the card once if the link is lost.
    pub fn transmit(&mut self, request: &[u8]) -> Result<Vec<u8>, Error> {
        self.init(false)?;
        self.require_t1()?;

        match self.exchange(request) {
            Err(err) if err.kind() == ErrorKind::CommFailed => {
                warn!(error = %err, "link lost, re-initialising card");
                self.init(true)?;
                self.require_t1()?;
                self.exchange(request)
            }
            other => other,
        }
    }

    fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, Error> {
        Link::new(&mut self.device, &mut self.pacer, &mut self.state.params)
            .transmit(I_BLOCK, request)
    }

    fn require_t1(&self) -> Result<(), Error> {
        if self.state.params.t1.enabled {
            return Ok(());
        }
        Err(Error::new(ErrorKind::ProtoMismatch).with_message("card does not offer T=1"))
    }

    fn power_up(&mut self) -> Result<(), Error> {
        self.device.reset()?;
        self.pacer.sleep_us(POST_RESET_SETTLE_US);
        let atr = self.capture_atr()?;
        if atr.is_empty() {
            return Err(Error::new(ErrorKind::UnresponsiveCard).with_message("card sent no ATR"));
        }
        let params = atr::parse(&atr)?;
        self.state = CardState { atr, params };
        Ok(())
    }

    fn capture_atr(&mut self) -> Result<Vec<u8>, Error> {
        let etu = self.state.params.etu;
        let step = u64::from((ATR_POLL_ETUS * etu).max(1));
        let budget = u64::from(ATR_IDLE_ETUS * etu);
        let mut idle = 0u64;
        let mut atr = Vec::with_capacity(MAX_ATR_LEN);

        while idle <= budget && atr.len() < MAX_ATR_LEN {
            let want = MAX_ATR_LEN - atr.len();
            let fragment = self.device.recv(want)?;
            if fragment.is_empty() {
                idle += step;
            } else {
                atr.extend_from_slice(&fragment[..fragment.len().min(want)]);
                idle = 0;
            }
            self.pacer.sleep_us(step);
        }
        debug!(len = atr.len(), atr = %hex::encode(&atr), "ATR capture finished");
        Ok(atr)
    }
}
