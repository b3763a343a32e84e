//! Purpose: Seams between the card core and the outside world.
//! Exports: `DeviceControl`, `DeviceOpener`, `DeviceEnumerator`, `Pacer`, `ThreadPacer`, `VirtualPacer`.
//! Role: The T=1 engine, card session and registry only ever talk to hardware through these.
//! Invariants: `recv` returning an empty buffer means "nothing yet", not an error.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::core::error::Error;

/// Byte-level control channel to the reader behind a tuner device.
pub trait DeviceControl {
    fn detect(&mut self) -> Result<bool, Error>;
    fn reset(&mut self) -> Result<(), Error>;
    fn send(&mut self, bytes: &[u8]) -> Result<(), Error>;
    fn recv(&mut self, max_len: usize) -> Result<Vec<u8>, Error>;
    fn set_baud(&mut self, rate: u32) -> Result<(), Error>;
}

impl<D: DeviceControl + ?Sized> DeviceControl for &mut D {
    fn detect(&mut self) -> Result<bool, Error> {
        (**self).detect()
    }

    fn reset(&mut self) -> Result<(), Error> {
        (**self).reset()
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), Error> {
        (**self).send(bytes)
    }

    fn recv(&mut self, max_len: usize) -> Result<Vec<u8>, Error> {
        (**self).recv(max_len)
    }

    fn set_baud(&mut self, rate: u32) -> Result<(), Error> {
        (**self).set_baud(rate)
    }
}

impl<D: DeviceControl + ?Sized> DeviceControl for Box<D> {
    fn detect(&mut self) -> Result<bool, Error> {
        (**self).detect()
    }

    fn reset(&mut self) -> Result<(), Error> {
        (**self).reset()
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), Error> {
        (**self).send(bytes)
    }

    fn recv(&mut self, max_len: usize) -> Result<Vec<u8>, Error> {
        (**self).recv(max_len)
    }

    fn set_baud(&mut self, rate: u32) -> Result<(), Error> {
        (**self).set_baud(rate)
    }
}

/// Turns a registry slot path into an open control channel.
pub trait DeviceOpener {
    type Device: DeviceControl;

    fn open(&self, path: &str) -> Result<Self::Device, Error>;
}

/// Lists `(device_path, friendly_name)` pairs for every present interface.
pub trait DeviceEnumerator {
    fn enumerate(&self) -> Result<Vec<(String, String)>, Error>;
}

/// A device list supplied by the caller; clones share the same list.
#[derive(Clone, Debug, Default)]
pub struct StaticEnumerator {
    devices: Arc<Mutex<Vec<(String, String)>>>,
}

impl StaticEnumerator {
    pub fn new(devices: Vec<(String, String)>) -> Self {
        Self {
            devices: Arc::new(Mutex::new(devices)),
        }
    }

    pub fn set(&self, devices: Vec<(String, String)>) {
        let mut guard = self.devices.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = devices;
    }
}

impl DeviceEnumerator for StaticEnumerator {
    fn enumerate(&self) -> Result<Vec<(String, String)>, Error> {
        let guard = self.devices.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(guard.clone())
    }
}

/// Source of the blocking waits used by the transport.
pub trait Pacer {
    fn sleep_us(&mut self, micros: u64);
}

impl<P: Pacer + ?Sized> Pacer for &mut P {
    fn sleep_us(&mut self, micros: u64) {
        (**self).sleep_us(micros)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadPacer;

impl Pacer for ThreadPacer {
    fn sleep_us(&mut self, micros: u64) {
        std::thread::sleep(Duration::from_micros(micros));
    }
}

/// Advances a counter instead of sleeping.
#[derive(Clone, Copy, Debug, Default)]
pub struct VirtualPacer {
    elapsed_us: u64,
    sleeps: u64,
}

impl VirtualPacer {
    pub fn elapsed_us(&self) -> u64 {
        self.elapsed_us
    }

    pub fn sleeps(&self) -> u64 {
        self.sleeps
    }
}

impl Pacer for VirtualPacer {
    fn sleep_us(&mut self, micros: u64) {
        self.elapsed_us = self.elapsed_us.saturating_add(micros);
        self.sleeps += 1;
    }
}
