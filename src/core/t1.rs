//! Purpose: Half-duplex ISO 7816-3 T=1 exchange over a `DeviceControl` channel.
//! Exports: `Link`, `MAX_ATTEMPTS`, `MAX_NESTING`, `NEGOTIATED_IFSD`.
//! Role: Sits between the card session and the raw device; owns sequencing and recovery.
//! Invariants: `seq` toggles only after an I-block request is answered.
//! Invariants: A resynchronisation resets `seq` to 0 and `IFSD` to 32 before the request is rebuilt.
//! Invariants: `NoData` ends the exchange as `CommFailed` without consuming an attempt.
use tracing::{debug, trace, warn};

use crate::core::atr::CardParameters;
use crate::core::block::{
    self, Block, BlockKind, Defect, MAX_BLOCK, R_EDC_ERROR, R_OTHER_ERROR, S_IFS_REQUEST,
    S_RESYNCH_REQUEST,
};
use crate::core::device::{DeviceControl, Pacer};
use crate::core::error::{Error, ErrorKind};

pub const MAX_ATTEMPTS: u32 = 4;
/// An IFS request may itself need a RESYNCH; nothing nests deeper.
pub const MAX_NESTING: u8 = 2;
pub const NEGOTIATED_IFSD: u8 = 254;

const POLL_ETUS: u32 = 32;
const MAX_SEND_CHUNK: usize = 255;
const RESYNCH_ATTEMPT: u32 = 3;

enum Step {
    /// Rebuild the request block with the current sequence bit.
    SendInitial,
    AwaitResponse,
    SendRBlock(u8),
    Resync,
    Done(Vec<u8>),
    Failed(Error),
}

/// One card's T=1 link: the channel, its pacing and the mutable link parameters.
pub struct Link<'a, D: ?Sized, P: ?Sized> {
    device: &'a mut D,
    pacer: &'a mut P,
    params: &'a mut CardParameters,
}

impl<'a, D, P> Link<'a, D, P>
where
    D: DeviceControl + ?Sized,
    P: Pacer + ?Sized,
{
    pub fn new(device: &'a mut D, pacer: &'a mut P, params: &'a mut CardParameters) -> Self {
        Self {
            device,
            pacer,
            params,
        }
    }

    pub fn params(&self) -> &CardParameters {
        &*self.params
    }

    /// Sends one block and collects whatever the card returns within the wait budget.
    pub fn transceive_once(&mut self, tx: &[u8]) -> Result<Vec<u8>, Error> {
        trace!(tx = %hex::encode(tx), "T=1 send");
        for chunk in tx.chunks(MAX_SEND_CHUNK) {
            self.device.send(chunk)?;
        }

        let t1 = self.params.t1;
        self.pacer.sleep_us(u64::from(t1.bgt));

        let step = u64::from((POLL_ETUS * self.params.etu).max(1));
        let mut budget = u64::from(t1.bwt.saturating_sub(t1.bgt));
        let mut idle = 0u64;
        let mut rx = Vec::with_capacity(MAX_BLOCK);

        while idle <= budget && rx.len() < MAX_BLOCK {
            let want = (MAX_BLOCK - rx.len()).min(MAX_SEND_CHUNK);
            let fragment = self.device.recv(want)?;
            if fragment.is_empty() {
                idle += step;
            } else {
                if rx.is_empty() {
                    budget = u64::from(t1.cwt);
                }
                let take = fragment.len().min(want);
                rx.extend_from_slice(&fragment[..take]);
                idle = 0;
            }
            self.pacer.sleep_us(step);
        }

        if rx.is_empty() {
            return Err(Error::new(ErrorKind::NoData).with_message("card sent nothing"));
        }
        trace!(rx = %hex::encode(&rx), "T=1 receive");
        Ok(rx)
    }

    /// Runs one request to completion: `code` selects an I, R or S block.
    pub fn transmit(&mut self, code: u8, request: &[u8]) -> Result<Vec<u8>, Error> {
        self.exchange(code, request, 0)
    }

    fn exchange(&mut self, code: u8, request: &[u8], depth: u8) -> Result<Vec<u8>, Error> {
        if depth > MAX_NESTING {
            return Err(Error::new(ErrorKind::Internal)
                .with_message(format!("nested T=1 exchange at depth {depth}")));
        }
        if request.len() > usize::from(self.params.t1.ifsc) {
            return Err(Error::new(ErrorKind::TooLarge).with_message(format!(
                "request of {} bytes exceeds IFSC {}",
                request.len(),
                self.params.t1.ifsc
            )));
        }

        let is_information = BlockKind::from_pcb(code) == BlockKind::Information;
        let mut current = block::make_block(code, request, self.params.t1.seq)?;
        let mut failures = 0u32;
        let mut step = Step::AwaitResponse;

        loop {
            step = match step {
                Step::SendInitial => {
                    current = block::make_block(code, request, self.params.t1.seq)?;
                    Step::AwaitResponse
                }
                Step::AwaitResponse => {
                    self.await_response(&current, code, is_information, &mut failures, depth)
                }
                Step::SendRBlock(r_code) => {
                    debug!(pcb = r_code, "requesting retransmission");
                    current = block::make_block(r_code, &[], self.params.t1.seq)?;
                    Step::AwaitResponse
                }
                Step::Resync => {
                    debug!(depth, "sending RESYNCH request");
                    match self.exchange(S_RESYNCH_REQUEST, &[], depth + 1) {
                        Ok(_) => {
                            self.params.reset_link();
                            Step::SendInitial
                        }
                        Err(err) => Step::Failed(err),
                    }
                }
                Step::Done(payload) => return Ok(payload),
                Step::Failed(err) => return Err(err),
            };
        }
    }

    fn await_response(
        &mut self,
        current: &Block,
        code: u8,
        is_information: bool,
        failures: &mut u32,
        depth: u8,
    ) -> Step {
        if is_information && self.params.t1.ifsd < NEGOTIATED_IFSD {
            if let Err(err) = self.negotiate_ifsd(depth) {
                return Step::Failed(err);
            }
        }

        let rx = match self.transceive_once(current.as_bytes()) {
            Ok(rx) => rx,
            Err(err) if err.kind() == ErrorKind::NoData => {
                return Step::Failed(
                    Error::new(ErrorKind::CommFailed)
                        .with_message("no answer from card")
                        .with_source(err),
                );
            }
            Err(err) => return Step::Failed(err),
        };

        let (defect, peer_seq) = match block::decode(&rx) {
            Ok(answer) if answer.kind() != BlockKind::ReceiveReady => {
                if is_information {
                    self.params.t1.seq ^= 1;
                }
                debug!(kind = ?answer.kind(), len = answer.payload().len(), "block answered");
                return Step::Done(answer.payload().to_vec());
            }
            Ok(answer) => {
                debug!(pcb = answer.pcb(), "card answered with an R-block");
                (None, Some(answer.sequence_bit()))
            }
            Err(defect) => {
                warn!(?defect, len = rx.len(), "received damaged block");
                (Some(defect), None)
            }
        };

        *failures += 1;
        if *failures >= MAX_ATTEMPTS {
            return Step::Failed(
                Error::new(ErrorKind::CommFailed)
                    .with_message(format!("no valid answer after {MAX_ATTEMPTS} attempts")),
            );
        }
        if *failures == RESYNCH_ATTEMPT && code != S_RESYNCH_REQUEST {
            return Step::Resync;
        }
        if is_information && peer_seq != Some(self.params.t1.seq) {
            let r_code = match defect {
                Some(Defect::Edc) => R_EDC_ERROR,
                _ => R_OTHER_ERROR,
            };
            return Step::SendRBlock(r_code);
        }
        Step::AwaitResponse
    }

    fn negotiate_ifsd(&mut self, depth: u8) -> Result<(), Error> {
        debug!(from = self.params.t1.ifsd, to = NEGOTIATED_IFSD, "negotiating IFSD");
        let answer = self.exchange(S_IFS_REQUEST, &[NEGOTIATED_IFSD], depth + 1)?;
        if answer.first() != Some(&NEGOTIATED_IFSD) {
            return Err(Error::new(ErrorKind::ProtoMismatch)
                .with_message(format!("card answered IFS request with {}", hex::encode(&answer))));
        }
        self.params.t1.ifsd = NEGOTIATED_IFSD;
        Ok(())
    }
}
