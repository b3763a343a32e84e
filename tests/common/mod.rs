// Scripted card double shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tunercard::api::{
    BlockKind, DeviceControl, DeviceOpener, Error, ErrorKind, block::I_BLOCK, make_block,
};

pub const BCAS_ATR: [u8; 13] = [
    0x3B, 0xF0, 0x12, 0x00, 0xFF, 0x91, 0x81, 0xB1, 0x7C, 0x45, 0x1F, 0x03, 0x99,
];
pub const MINIMAL_T1_ATR: [u8; 5] = [0x3B, 0x80, 0x11, 0x01, 0x90];
/// TD1 announces protocol 0 only.
pub const T0_ONLY_ATR: [u8; 4] = [0x3B, 0x80, 0x00, 0x80];
pub const FRIENDLY: &str = "tunercard";

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Reply {
    Proper,
    Corrupt,
    Silent,
}

/// Card plus reader front end: answers reset with its ATR and I-blocks with the payload reversed.
#[derive(Default)]
pub struct CardModel {
    pub present: bool,
    pub mute: bool,
    pub atr: Vec<u8>,
    pub script: VecDeque<Reply>,
    pub resets: usize,
    pub bauds: Vec<u32>,
    pub sent: Vec<Vec<u8>>,
    pub fail_detect: bool,
    inbound: Vec<u8>,
    outbound: VecDeque<u8>,
    card_seq: u8,
    last_answer: Option<Vec<u8>>,
}

impl CardModel {
    pub fn sent_pcbs(&self) -> Vec<u8> {
        self.sent.iter().map(|bytes| bytes[1]).collect()
    }

    fn answer(&mut self, request: &[u8]) -> Vec<u8> {
        let pcb = request[1];
        let payload = &request[3..request.len() - 1];
        let answer = match BlockKind::from_pcb(pcb) {
            BlockKind::Information => {
                let reversed: Vec<u8> = payload.iter().rev().copied().collect();
                let answer = make_block(I_BLOCK, &reversed, self.card_seq).expect("block");
                self.card_seq ^= 1;
                answer.as_bytes().to_vec()
            }
            BlockKind::ReceiveReady => match &self.last_answer {
                Some(previous) => previous.clone(),
                None => make_block(0x82, &[], 0).expect("block").as_bytes().to_vec(),
            },
            BlockKind::Supervisory if pcb == 0xC0 => {
                self.card_seq = 0;
                make_block(0xE0, &[], 0).expect("block").as_bytes().to_vec()
            }
            BlockKind::Supervisory => make_block(0xE1, payload, 0)
                .expect("block")
                .as_bytes()
                .to_vec(),
        };
        if BlockKind::from_pcb(pcb) != BlockKind::ReceiveReady {
            self.last_answer = Some(answer.clone());
        }
        answer
    }
}

#[derive(Clone, Default)]
pub struct SharedCard(Arc<Mutex<CardModel>>);

impl SharedCard {
    pub fn new(atr: &[u8]) -> Self {
        Self(Arc::new(Mutex::new(CardModel {
            present: true,
            atr: atr.to_vec(),
            ..CardModel::default()
        })))
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut CardModel) -> R) -> R {
        let mut model = self.0.lock().expect("card lock");
        f(&mut model)
    }

    pub fn script(&self, replies: &[Reply]) {
        self.with(|model| model.script.extend(replies.iter().copied()));
    }
}

impl DeviceControl for SharedCard {
    fn detect(&mut self) -> Result<bool, Error> {
        self.with(|model| {
            if model.fail_detect {
                return Err(Error::new(ErrorKind::Io).with_message("control channel closed"));
            }
            Ok(model.present)
        })
    }

    fn reset(&mut self) -> Result<(), Error> {
        self.with(|model| {
            model.resets += 1;
            model.inbound.clear();
            model.outbound.clear();
            model.card_seq = 0;
            model.last_answer = None;
            if model.present && !model.mute {
                let atr = model.atr.clone();
                model.outbound.extend(atr);
            }
            Ok(())
        })
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.with(|model| {
            model.inbound.extend_from_slice(bytes);
            if model.inbound.len() < 4 || model.inbound.len() < 4 + usize::from(model.inbound[2]) {
                return Ok(());
            }
            let request = std::mem::take(&mut model.inbound);
            model.sent.push(request.clone());
            let answer = model.answer(&request);
            match model.script.pop_front().unwrap_or(Reply::Proper) {
                Reply::Proper => model.outbound.extend(answer),
                Reply::Corrupt => {
                    let mut damaged = answer;
                    let last = damaged.len() - 1;
                    damaged[last] ^= 0xFF;
                    model.outbound.extend(damaged);
                }
                Reply::Silent => {}
            }
            Ok(())
        })
    }

    fn recv(&mut self, max_len: usize) -> Result<Vec<u8>, Error> {
        self.with(|model| {
            let take = max_len.min(model.outbound.len());
            Ok(model.outbound.drain(..take).collect())
        })
    }

    fn set_baud(&mut self, rate: u32) -> Result<(), Error> {
        self.with(|model| model.bauds.push(rate));
        Ok(())
    }
}

/// Hands out channels to the simulated cards by device path.
#[derive(Clone, Default)]
pub struct SimOpener {
    cards: HashMap<String, SharedCard>,
}

impl SimOpener {
    pub fn insert(&mut self, path: &str, card: SharedCard) {
        self.cards.insert(path.to_string(), card);
    }
}

impl DeviceOpener for SimOpener {
    type Device = SharedCard;

    fn open(&self, path: &str) -> Result<SharedCard, Error> {
        self.cards
            .get(path)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::NotFound).with_message(format!("no device at {path}")))
    }
}

pub fn device(path: &str) -> (String, String) {
    (path.to_string(), FRIENDLY.to_string())
}
