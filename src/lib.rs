// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Emulator core for pairs of cross-wired ("null modem") virtual serial
//! ports.
//!
//! Endpoints come in fixed pairs: endpoint `i` is wired to endpoint `i ^ 1`.
//! Bytes written to one side are delivered to the partner's inbound queue at
//! the pace of the configured baud rate, and modem control lines asserted on
//! one side show up as modem status lines on the other: RTS drives CTS, and
//! DTR drives both DSR and DCD. Blocking callers can wait for status line
//! transitions and can be interrupted through a [`CancelToken`].
//!
//! The character-device surface (file descriptors, ioctl dispatch, tty
//! registration) is out of scope. Collaborators drive this core through
//! [`NullModem`] and receive inbound bytes through their own [`InboundQueue`]
//! implementations.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod cancel;
mod queue;
mod spec;

pub use self::cancel::CancelToken;
pub use self::queue::Discard;
pub use self::queue::FlipBuffer;
pub use self::queue::InboundQueue;
pub use self::spec::propagate;
pub use self::spec::ModemControlRegister;
pub use self::spec::ModemStatusRegister;
pub use self::spec::StatusLines;

use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

/// Maximum number of endpoint pairs a registry may be configured with.
pub const MAX_PAIRS: usize = 128;

/// Per-call write budget in bytes.
///
/// A write never admits more than this many bytes, and an endpoint with no
/// open partner absorbs exactly this much per call before the remainder is
/// discarded.
pub const WRITE_ROOM_MAX: usize = 64;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// An error returned by [`NullModem::new`] or a line configuration update.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// The pair count is zero or above [`MAX_PAIRS`].
    #[error("invalid pair count: {0}")]
    InvalidPairCount(usize),
    /// The baud rate is zero.
    #[error("zero baud rate")]
    ZeroBaudRate,
    /// The data width is outside the 5..=8 range.
    #[error("invalid data bits: {0}")]
    InvalidDataBits(u8),
}

/// An error returned by null modem endpoint operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The endpoint index is outside the configured range.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(usize),
    /// The endpoint has no open session.
    #[error("endpoint {0} is not open")]
    NotOpen(usize),
    /// The line configuration is unusable.
    #[error("invalid line configuration")]
    Config(#[from] ConfigurationError),
    /// A blocking operation was interrupted by its [`CancelToken`].
    #[error("operation cancelled")]
    Cancelled,
    /// A waiter woke without any status line transition to report.
    #[error("woke with no status line change")]
    SpuriousWake,
}

/// Negotiated line parameters, used to derive the per-byte pacing cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineConfig {
    /// Baud rate in bits per second. Must be nonzero.
    pub baud_rate: u32,
    /// Data bits per character, 5 through 8.
    pub data_bits: u8,
    /// Whether a parity bit is sent.
    pub parity: bool,
    /// Whether two stop bits are sent instead of one.
    pub two_stop_bits: bool,
}

impl Default for LineConfig {
    /// 38400 baud, 8N1: the classic tty default line discipline.
    fn default() -> Self {
        Self {
            baud_rate: 38400,
            data_bits: 8,
            parity: false,
            two_stop_bits: false,
        }
    }
}

impl LineConfig {
    /// Returns the wire cost of one byte in nanoseconds: one start bit, the
    /// data bits, an optional parity bit, and the stop bits, at `baud_rate`
    /// bits per second.
    pub fn nanos_per_byte(&self) -> Result<u64, ConfigurationError> {
        if self.baud_rate == 0 {
            return Err(ConfigurationError::ZeroBaudRate);
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(ConfigurationError::InvalidDataBits(self.data_bits));
        }
        let frame_bits =
            1 + self.data_bits as u64 + self.parity as u64 + 1 + self.two_stop_bits as u64;
        Ok(frame_bits * NANOS_PER_SEC / self.baud_rate as u64)
    }
}

/// Running event counters for one endpoint.
///
/// The four line counters advance once per observed transition of the
/// corresponding status line and wrap around like the kernel's serial
/// interrupt counters. `rx` and `tx` count bytes, not transitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineCounts {
    /// CTS transitions.
    pub cts: u32,
    /// DSR transitions.
    pub dsr: u32,
    /// DCD transitions.
    pub dcd: u32,
    /// Ring indicator transitions.
    pub ring: u32,
    /// Bytes delivered into this endpoint's inbound queue.
    pub rx: u32,
    /// Bytes accepted from this endpoint's writer.
    pub tx: u32,
}

impl LineCounts {
    fn lines_equal(&self, other: &Self) -> bool {
        self.cts == other.cts
            && self.dsr == other.dsr
            && self.dcd == other.dcd
            && self.ring == other.ring
    }
}

struct PortState {
    open_count: u32,
    mcr: ModemControlRegister,
    msr: ModemStatusRegister,
    nanos_per_byte: u64,
    counts: LineCounts,
    queue: Box<dyn InboundQueue>,
}

impl PortState {
    /// Room a write toward this endpoint may use. An endpoint with no open
    /// session reports the full budget; those bytes get dumped, like a write
    /// into an unconnected wire.
    fn inbound_room(&self) -> usize {
        if self.open_count > 0 {
            self.queue.room().min(WRITE_ROOM_MAX)
        } else {
            WRITE_ROOM_MAX
        }
    }
}

struct Slot {
    index: usize,
    state: Mutex<PortState>,
    status_changed: Condvar,
}

impl Slot {
    /// Sole writer of `msr`. Counts per-line transitions and wakes waiters
    /// if any status line flipped.
    ///
    /// An endpoint with no open session is left untouched; its stale msr is
    /// recomputed from the live partner when it next opens.
    fn apply_msr(&self, state: &mut PortState, msr: ModemStatusRegister) {
        if state.open_count == 0 {
            return;
        }
        let old = state.msr;
        state.msr = msr;
        let mut changed = false;
        if old.cts() != msr.cts() {
            state.counts.cts = state.counts.cts.wrapping_add(1);
            changed = true;
        }
        if old.dsr() != msr.dsr() {
            state.counts.dsr = state.counts.dsr.wrapping_add(1);
            changed = true;
        }
        if old.dcd() != msr.dcd() {
            state.counts.dcd = state.counts.dcd.wrapping_add(1);
            changed = true;
        }
        if old.ri() != msr.ri() {
            state.counts.ring = state.counts.ring.wrapping_add(1);
            changed = true;
        }
        if changed {
            tracing::trace!(index = self.index, msr = u8::from(msr), "msr update");
            self.status_changed.notify_all();
        }
    }
}

impl cancel::Notify for Slot {
    fn notify(&self) {
        let _state = self.state.lock();
        self.status_changed.notify_all();
    }
}

/// A registry of virtual serial endpoints wired in fixed cross-connected
/// pairs.
///
/// All state is in-memory and lives for the registry's lifetime; endpoints
/// are never destroyed on close, since a closed port keeps partner-visible
/// signal state.
pub struct NullModem {
    slots: Vec<Arc<Slot>>,
}

impl NullModem {
    /// Creates a registry with `pairs` cross-wired endpoint pairs.
    ///
    /// `queue_for` supplies the inbound queue for each endpoint index in
    /// `[0, 2 * pairs)`; bytes written to an endpoint land in its partner's
    /// queue. Endpoints start closed, with all lines deasserted and the
    /// default line configuration applied.
    pub fn new(
        pairs: usize,
        mut queue_for: impl FnMut(usize) -> Box<dyn InboundQueue>,
    ) -> Result<Self, ConfigurationError> {
        if pairs == 0 || pairs > MAX_PAIRS {
            return Err(ConfigurationError::InvalidPairCount(pairs));
        }
        let nanos_per_byte = LineConfig::default().nanos_per_byte()?;
        let slots = (0..pairs * 2)
            .map(|index| {
                Arc::new(Slot {
                    index,
                    state: Mutex::new(PortState {
                        open_count: 0,
                        mcr: ModemControlRegister::new(),
                        msr: ModemStatusRegister::new(),
                        nanos_per_byte,
                        counts: LineCounts::default(),
                        queue: queue_for(index),
                    }),
                    status_changed: Condvar::new(),
                })
            })
            .collect();
        Ok(Self { slots })
    }

    /// Returns the number of endpoints, twice the configured pair count.
    pub fn endpoints(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, index: usize) -> Result<&Arc<Slot>, Error> {
        self.slots.get(index).ok_or(Error::InvalidEndpoint(index))
    }

    /// Locks an endpoint and its partner, lower index first, and returns the
    /// guards as (endpoint, partner). Callers must have validated `index`.
    fn lock_pair(
        &self,
        index: usize,
    ) -> (MutexGuard<'_, PortState>, MutexGuard<'_, PortState>) {
        let partner = index ^ 1;
        let first = self.slots[index.min(partner)].state.lock();
        let second = self.slots[index.max(partner)].state.lock();
        if index < partner {
            (first, second)
        } else {
            (second, first)
        }
    }

    /// Opens a session on `index`, recomputing its status lines from the
    /// partner's current state.
    ///
    /// Multiple concurrent sessions per endpoint are allowed, matching
    /// multi-open character-device semantics.
    pub fn open(&self, index: usize) -> Result<(), Error> {
        self.slot(index)?;
        let (mut state, partner_state) = self.lock_pair(index);
        state.open_count += 1;
        let msr = spec::propagate(partner_state.mcr, partner_state.open_count > 0);
        self.slots[index].apply_msr(&mut state, msr);
        tracing::debug!(index, open_count = state.open_count, "port opened");
        Ok(())
    }

    /// Closes one session on `index`.
    ///
    /// The partner sees a hang-up pulse: its propagated status lines drop,
    /// then reassert if a session on `index` remains open. Waiters on the
    /// partner observe both edges. Closing an endpoint with no open session
    /// is a no-op.
    pub fn close(&self, index: usize) -> Result<(), Error> {
        self.slot(index)?;
        self.do_close(index);
        Ok(())
    }

    fn do_close(&self, index: usize) {
        let (mut state, mut partner_state) = self.lock_pair(index);
        if state.open_count == 0 {
            return;
        }
        state.open_count -= 1;
        let partner = &self.slots[index ^ 1];
        partner.apply_msr(&mut partner_state, ModemStatusRegister::new());
        let msr = spec::propagate(state.mcr, state.open_count > 0);
        partner.apply_msr(&mut partner_state, msr);
        tracing::debug!(index, open_count = state.open_count, "port closed");
    }

    /// Returns whether `index` has at least one open session.
    pub fn is_open(&self, index: usize) -> Result<bool, Error> {
        let state = self.slot(index)?.state.lock();
        Ok(state.open_count > 0)
    }

    /// Updates the modem control register: `set` bits are asserted, then
    /// `clear` bits are dropped. The partner's status lines are
    /// re-propagated afterwards.
    ///
    /// Allowed on closed endpoints; a closed endpoint's lines simply do not
    /// propagate until it opens.
    pub fn set_control_lines(
        &self,
        index: usize,
        set: ModemControlRegister,
        clear: ModemControlRegister,
    ) -> Result<(), Error> {
        self.slot(index)?;
        let (mut state, mut partner_state) = self.lock_pair(index);
        let mcr =
            ModemControlRegister::from((u8::from(state.mcr) | u8::from(set)) & !u8::from(clear));
        state.mcr = mcr;
        tracing::debug!(index, mcr = u8::from(mcr), "mcr update");
        let msr = spec::propagate(state.mcr, state.open_count > 0);
        self.slots[index ^ 1].apply_msr(&mut partner_state, msr);
        Ok(())
    }

    /// Returns a snapshot of the endpoint's control and status registers.
    pub fn line_status(
        &self,
        index: usize,
    ) -> Result<(ModemControlRegister, ModemStatusRegister), Error> {
        let state = self.slot(index)?.state.lock();
        Ok((state.mcr, state.msr))
    }

    /// Returns a snapshot of the endpoint's event counters.
    pub fn line_counts(&self, index: usize) -> Result<LineCounts, Error> {
        let state = self.slot(index)?.state.lock();
        Ok(state.counts)
    }

    /// Applies a new line configuration, recomputing the pacing cost used by
    /// subsequent writes. In-flight writes keep the cost they snapshotted at
    /// entry.
    pub fn set_line_config(&self, index: usize, config: LineConfig) -> Result<(), Error> {
        let slot = self.slot(index)?;
        let nanos_per_byte = config.nanos_per_byte()?;
        let mut state = slot.state.lock();
        state.nanos_per_byte = nanos_per_byte;
        tracing::debug!(index, ?config, nanos_per_byte, "line config update");
        Ok(())
    }

    /// Writes `data` toward the partner endpoint, pacing the call to the
    /// configured baud rate.
    ///
    /// At most the partner's available room is admitted per call, capped at
    /// [`WRITE_ROOM_MAX`]. A closed partner absorbs the full budget and the
    /// bytes are silently dropped; that is still a successful write, as on a
    /// real unconnected line. The call then sleeps so its total latency
    /// matches the wire cost of the admitted bytes. `cancel` interrupts the
    /// sleep; the admitted bytes stay delivered, but the call reports
    /// [`Error::Cancelled`].
    pub fn write(&self, index: usize, data: &[u8], cancel: &CancelToken) -> Result<usize, Error> {
        let start = Instant::now();
        self.slot(index)?;
        let (accepted, nanos_per_byte) = {
            let (mut state, mut partner_state) = self.lock_pair(index);
            if state.open_count == 0 {
                return Err(Error::NotOpen(index));
            }
            let accepted = data.len().min(partner_state.inbound_room());
            if accepted > 0 {
                if partner_state.open_count > 0 {
                    partner_state.queue.receive(&data[..accepted]);
                    partner_state.counts.rx =
                        partner_state.counts.rx.wrapping_add(accepted as u32);
                } else {
                    tracing::trace!(index, dropped = accepted, "partner closed, dropping write");
                }
                state.counts.tx = state.counts.tx.wrapping_add(accepted as u32);
            }
            (accepted, state.nanos_per_byte)
        };
        if accepted == 0 {
            return Ok(0);
        }
        let budget = Duration::from_nanos(accepted as u64 * nanos_per_byte);
        if let Some(remaining) = budget.checked_sub(start.elapsed()) {
            if !cancel.sleep(remaining) {
                return Err(Error::Cancelled);
            }
        }
        Ok(accepted)
    }

    /// Returns how many bytes a write on `index` would currently admit.
    pub fn write_room(&self, index: usize) -> Result<usize, Error> {
        self.slot(index)?;
        let (state, partner_state) = self.lock_pair(index);
        if state.open_count == 0 {
            return Err(Error::NotOpen(index));
        }
        Ok(partner_state.inbound_room())
    }

    /// Blocks until a status line in `interest` transitions.
    ///
    /// Returns [`Error::SpuriousWake`] when woken with none of the four line
    /// counters advanced since the last check (a quirk of the historical
    /// TIOCMIWAIT contract this models, reported rather than retried), and
    /// [`Error::Cancelled`] when `cancel` fires. A wake for a line outside
    /// `interest` refreshes the baseline and goes back to sleep.
    pub fn wait_for_change(
        &self,
        index: usize,
        interest: StatusLines,
        cancel: &CancelToken,
    ) -> Result<(), Error> {
        let slot = self.slot(index)?.clone();
        let _watch = cancel.watch(slot.clone());
        let mut state = slot.state.lock();
        if state.open_count == 0 {
            return Err(Error::NotOpen(index));
        }
        let mut prev = state.counts;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            slot.status_changed.wait(&mut state);
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let now = state.counts;
            if now.lines_equal(&prev) {
                return Err(Error::SpuriousWake);
            }
            if (interest.cts() && now.cts != prev.cts)
                || (interest.dsr() && now.dsr != prev.dsr)
                || (interest.dcd() && now.dcd != prev.dcd)
                || (interest.ring() && now.ring != prev.ring)
            {
                return Ok(());
            }
            prev = now;
        }
    }

    /// Force-closes every remaining session on every endpoint, delivering
    /// the usual hang-up pulses.
    pub fn shutdown(&self) {
        for index in 0..self.slots.len() {
            while self.slots[index].state.lock().open_count > 0 {
                self.do_close(index);
            }
        }
        tracing::debug!("null modem shut down");
    }
}
