//! Prefetch queue model for the prefetch core.
//!
//! Bytes already in the queue are served even if guest memory has changed
//! since they were fetched, which is what self-modifying code on an 8086 or
//! 286 observes.

use crate::exec::decode::Fetch;
use crate::mem::CpuBus;
use crate::Fault;

#[derive(Debug, Clone)]
pub struct PrefetchQueue {
    buf: Vec<u8>,
    /// Linear address of `buf[0]`.
    start: u32,
    size: usize,
    refills: u64,
}

impl PrefetchQueue {
    pub fn new(size: usize) -> Self {
        Self {
            buf: Vec::with_capacity(size),
            start: 0,
            size,
            refills: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes currently queued.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Number of times the queue restarted at a new address.
    pub fn refills(&self) -> u64 {
        self.refills
    }

    pub fn invalidate(&mut self) {
        self.buf.clear();
    }

    fn top_up<B: CpuBus>(&mut self, bus: &mut B) {
        while self.buf.len() < self.size {
            let addr = self.start.wrapping_add(self.buf.len() as u32);
            match bus.read_u8(addr) {
                Ok(byte) => self.buf.push(byte),
                // Only the byte actually executed may fault.
                Err(_) => break,
            }
        }
    }
}

impl<B: CpuBus> Fetch<B> for PrefetchQueue {
    fn byte(&mut self, bus: &mut B, linear: u32) -> Result<u8, Fault> {
        let index = linear.wrapping_sub(self.start) as usize;
        if let Some(&byte) = self.buf.get(index) {
            if index >= self.size / 2 {
                self.buf.drain(..index);
                self.start = linear;
                self.top_up(bus);
            }
            return Ok(byte);
        }

        self.buf.clear();
        self.start = linear;
        self.refills += 1;
        let byte = bus.read_u8(linear)?;
        self.buf.push(byte);
        self.top_up(bus);
        Ok(byte)
    }
}
