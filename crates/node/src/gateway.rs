//! Single-consumer hardware gateway.
//!
//! Every physical pin operation goes through one FIFO queue drained by one
//! worker thread, so writes from actuators and reads from sensors never
//! interleave on the bus. Producers only enqueue; they never block on the
//! hardware.
//!
//! A pin's direction is set lazily, exactly once, on the first operation
//! the worker performs for it. The flag lives on the channel itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::error::HardwareError;

/// Value delivered to an input channel when its read fails.
pub const READ_FAILURE_DEFAULT: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// Raw pin access. Every call may fail; the gateway decides what a failure
/// means for the caller.
pub trait PinBackend: Send + 'static {
    fn set_pin_mode(&mut self, pin: u8, direction: Direction) -> Result<(), HardwareError>;
    fn digital_write(&mut self, pin: u8, level: u8) -> Result<(), HardwareError>;
    fn digital_read(&mut self, pin: u8) -> Result<u8, HardwareError>;
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

struct PinState {
    connector: u8,
    direction: Direction,
    pin_initialized: AtomicBool,
    current_state: AtomicBool,
    results: Option<UnboundedSender<u8>>,
}

/// Handle to a registered pin. Cheap to clone; the state behind it is only
/// mutated by the gateway worker.
#[derive(Clone)]
pub struct PinChannel {
    inner: Arc<PinState>,
}

impl PinChannel {
    pub fn connector(&self) -> u8 {
        self.inner.connector
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// Last level successfully written (outputs) or read (inputs).
    pub fn current_state(&self) -> bool {
        self.inner.current_state.load(Ordering::Acquire)
    }

    pub fn pin_initialized(&self) -> bool {
        self.inner.pin_initialized.load(Ordering::Acquire)
    }
}

/// An input pin plus the receiving end of its result channel.
pub struct InputChannel {
    pub channel: PinChannel,
    pub results: UnboundedReceiver<u8>,
}

enum QueueEntry {
    Op { pin: Arc<PinState>, value: u8 },
    Stop,
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

pub struct HardwareGateway {
    tx: UnboundedSender<QueueEntry>,
    accepting: Mutex<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HardwareGateway {
    /// Spawn the worker thread that owns `backend`.
    pub fn start<B: PinBackend>(backend: B) -> std::io::Result<Self> {
        let (tx, rx) = unbounded_channel();
        let worker = thread::Builder::new()
            .name("hw-gateway".to_string())
            .spawn(move || process_queue(backend, rx))?;
        info!("hardware gateway started");
        Ok(Self {
            tx,
            accepting: Mutex::new(true),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn register_output(&self, connector: u8) -> PinChannel {
        PinChannel {
            inner: Arc::new(PinState {
                connector,
                direction: Direction::Output,
                pin_initialized: AtomicBool::new(false),
                current_state: AtomicBool::new(false),
                results: None,
            }),
        }
    }

    pub fn register_input(&self, connector: u8) -> InputChannel {
        let (results_tx, results) = unbounded_channel();
        InputChannel {
            channel: PinChannel {
                inner: Arc::new(PinState {
                    connector,
                    direction: Direction::Input,
                    pin_initialized: AtomicBool::new(false),
                    current_state: AtomicBool::new(false),
                    results: Some(results_tx),
                }),
            },
            results,
        }
    }

    fn accepting(&self) -> MutexGuard<'_, bool> {
        self.accepting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an operation. For outputs `value` is the desired level; inputs
    /// ignore it and deliver the read on their result channel.
    /// Returns false if the gateway has been stopped.
    pub fn submit(&self, channel: &PinChannel, value: u8) -> bool {
        // Held across the send so an accepted entry is always ahead of Stop.
        let accepting = self.accepting();
        if !*accepting {
            warn!(pin = channel.connector(), "gateway stopped; dropping operation");
            return false;
        }
        self.tx
            .send(QueueEntry::Op {
                pin: Arc::clone(&channel.inner),
                value,
            })
            .is_ok()
    }

    /// Stop accepting new work and enqueue the stop marker. Everything
    /// already queued is still processed before the worker exits.
    pub fn stop(&self) {
        let mut accepting = self.accepting();
        if !*accepting {
            return;
        }
        *accepting = false;
        let _ = self.tx.send(QueueEntry::Stop);
        drop(accepting);
        info!("hardware gateway stopping");
    }

    /// Wait for the worker to drain the queue and exit.
    pub fn join(&self) {
        let handle = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("hardware gateway worker panicked");
            }
        }
    }
}

impl Drop for HardwareGateway {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

fn process_queue<B: PinBackend>(mut backend: B, mut rx: UnboundedReceiver<QueueEntry>) {
    while let Some(entry) = rx.blocking_recv() {
        match entry {
            QueueEntry::Op { pin, value } => work_entry(&mut backend, &pin, value),
            QueueEntry::Stop => break,
        }
    }
    debug!("hardware gateway worker exited");
}

fn work_entry<B: PinBackend>(backend: &mut B, pin: &PinState, value: u8) {
    if !pin.pin_initialized.load(Ordering::Acquire) {
        match backend.set_pin_mode(pin.connector, pin.direction) {
            Ok(()) => pin.pin_initialized.store(true, Ordering::Release),
            Err(e) => warn!(pin = pin.connector, "set_pin_mode failed: {e}"),
        }
    }

    match pin.direction {
        Direction::Output => {
            let level = u8::from(value != 0);
            match backend.digital_write(pin.connector, level) {
                Ok(()) => pin.current_state.store(level == 1, Ordering::Release),
                Err(e) => warn!(pin = pin.connector, level, "digital_write failed: {e}"),
            }
        }
        Direction::Input => {
            let read = match backend.digital_read(pin.connector) {
                Ok(v) => {
                    pin.current_state.store(v != 0, Ordering::Release);
                    v
                }
                Err(e) => {
                    warn!(pin = pin.connector, "digital_read failed: {e}");
                    READ_FAILURE_DEFAULT
                }
            };
            if let Some(results) = &pin.results {
                let _ = results.send(read);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Mock backend (development: no hardware, logs pin traffic)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinOp {
    Mode(u8, Direction),
    Write(u8, u8),
    Read(u8),
}

/// In-memory backend. Records every call and keeps pin levels so reads see
/// earlier writes. Pins listed in `failing` return an I/O error.
#[derive(Clone, Default)]
pub struct MockPins {
    pub ops: Arc<Mutex<Vec<PinOp>>>,
    levels: Arc<Mutex<std::collections::HashMap<u8, u8>>>,
    failing: Arc<Mutex<Vec<u8>>>,
}

impl MockPins {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn fail_pin(&self, pin: u8) {
        self.failing.lock().unwrap().push(pin);
    }

    #[cfg(test)]
    pub fn set_level(&self, pin: u8, level: u8) {
        self.levels.lock().unwrap().insert(pin, level);
    }

    fn record(&self, op: PinOp) {
        if let Ok(mut ops) = self.ops.lock() {
            ops.push(op);
        }
    }

    fn check(&self, pin: u8) -> Result<(), HardwareError> {
        let failing = self.failing.lock().map(|f| f.contains(&pin)).unwrap_or(false);
        if failing {
            return Err(HardwareError::Io {
                device: "mock-gpio",
                detail: format!("pin {pin} unavailable"),
            });
        }
        Ok(())
    }
}

impl PinBackend for MockPins {
    fn set_pin_mode(&mut self, pin: u8, direction: Direction) -> Result<(), HardwareError> {
        self.record(PinOp::Mode(pin, direction));
        debug!(pin, ?direction, "[mock-gpio] pin mode");
        Ok(())
    }

    fn digital_write(&mut self, pin: u8, level: u8) -> Result<(), HardwareError> {
        self.record(PinOp::Write(pin, level));
        self.check(pin)?;
        if let Ok(mut levels) = self.levels.lock() {
            levels.insert(pin, level);
        }
        info!(pin, state = if level != 0 { "ON" } else { "OFF" }, "[mock-gpio] write");
        Ok(())
    }

    fn digital_read(&mut self, pin: u8) -> Result<u8, HardwareError> {
        self.record(PinOp::Read(pin));
        self.check(pin)?;
        Ok(self
            .levels
            .lock()
            .map(|l| l.get(&pin).copied().unwrap_or(0))
            .unwrap_or(0))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
