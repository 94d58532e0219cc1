//! Channel buffer store
//!
//! Fixed-size per-channel sample slots with readiness flags, shared between
//! the PCM source readers (producers) and the pump coordinator (consumer).
//!
//! # Synchronisation
//!
//! ```text
//!  reader 0 ──mark_ready()──┐                      ┌──take_block()── pump coordinator
//!  reader 1 ──mark_ready()──┼──► Mutex<StoreState> ◄┘
//!  reader N ──mark_ready()──┘     │            │
//!                          slot_free (readers)  all_ready (coordinator)
//! ```
//!
//! - A reader waits on `slot_free` while either of its slots still holds an
//!   unconsumed block, so no channel ever runs more than one block ahead of
//!   the slowest one.
//! - The coordinator waits on `all_ready` until every channel holds a block,
//!   copies all of them out and clears every flag in the same critical
//!   section. A partial block is never handed on.

mod error;

use std::sync::{Condvar, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::types::{Sample, SourceBinding, CHANNELS_PER_SOURCE};

pub use error::{StoreError, StoreResult};

/// What happens to a source's channels once it reaches end of source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndOfSourcePolicy {
    /// The finished source never becomes ready again; the pump stalls
    #[default]
    Halt,
    /// The finished source's channels carry silence from then on
    Silence,
}

impl std::str::FromStr for EndOfSourcePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "halt" => Ok(Self::Halt),
            "silence" => Ok(Self::Silence),
            other => Err(format!("unknown policy '{}' (expected halt or silence)", other)),
        }
    }
}

/// One logical channel: a block of samples plus its readiness flag
#[derive(Debug, Clone)]
pub struct ChannelSlot {
    samples: Vec<Sample>,
    ready: bool,
    /// Number of blocks deposited into this slot so far
    version: u64,
}

impl ChannelSlot {
    fn new(block_size: usize) -> Self {
        Self {
            samples: vec![0; block_size],
            ready: false,
            version: 0,
        }
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

/// State guarded by the store mutex
struct StoreState {
    slots: Vec<ChannelSlot>,
    finished: Vec<bool>,
    blocks_taken: u64,
    shutdown: bool,
    stall_reported: bool,
}

enum Readiness {
    Ready,
    Pending,
    Exhausted,
}

/// Shared block store for all configured sources
///
/// Constructed once and shared by `Arc` between every reader and the
/// pump coordinator.
pub struct ChannelBufferStore {
    block_size: usize,
    bindings: Vec<SourceBinding>,
    policy: EndOfSourcePolicy,
    state: Mutex<StoreState>,
    slot_free: Condvar,
    all_ready: Condvar,
}

impl ChannelBufferStore {
    /// Create a store with one channel pair per binding
    ///
    /// The store holds `2 * bindings.len()` channels; every binding must
    /// refer to channels inside that range and no channel may be fed twice.
    pub fn new(
        block_size: usize,
        bindings: Vec<SourceBinding>,
        policy: EndOfSourcePolicy,
    ) -> StoreResult<Self> {
        if block_size == 0 {
            return Err(StoreError::ZeroBlockSize);
        }
        if bindings.is_empty() {
            return Err(StoreError::NoSources);
        }

        let channels = bindings.len() * CHANNELS_PER_SOURCE;
        let mut bound = vec![false; channels];
        for binding in &bindings {
            for channel in binding.channels() {
                if channel >= channels {
                    return Err(StoreError::ChannelOutOfRange { channel, channels });
                }
                if bound[channel] {
                    return Err(StoreError::DuplicateChannel(channel));
                }
                bound[channel] = true;
            }
        }

        log::debug!(
            "ChannelBufferStore: {} sources, {} channels x {} frames, {:?} on end of source",
            bindings.len(),
            channels,
            block_size,
            policy
        );

        let state = StoreState {
            slots: (0..channels).map(|_| ChannelSlot::new(block_size)).collect(),
            finished: vec![false; bindings.len()],
            blocks_taken: 0,
            shutdown: false,
            stall_reported: false,
        };

        Ok(Self {
            block_size,
            bindings,
            policy,
            state: Mutex::new(state),
            slot_free: Condvar::new(),
            all_ready: Condvar::new(),
        })
    }

    /// Fundamental block size in frames per channel
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total number of logical channels
    pub fn channel_count(&self) -> usize {
        self.bindings.len() * CHANNELS_PER_SOURCE
    }

    pub fn source_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn binding(&self, source: usize) -> Option<SourceBinding> {
        self.bindings.get(source).copied()
    }

    pub fn policy(&self) -> EndOfSourcePolicy {
        self.policy
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, StoreState>> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }

    fn check_source(&self, source: usize) -> StoreResult<SourceBinding> {
        self.binding(source).ok_or(StoreError::SourceOutOfRange {
            index: source,
            sources: self.bindings.len(),
        })
    }

    /// Deposit one interleaved stereo block for `source`
    ///
    /// Blocks while either of the source's slots still holds an unconsumed
    /// block. On success the block is deinterleaved into both slots, both
    /// flags are set and the coordinator is signalled.
    ///
    /// Returns the slot version (1 for the first block).
    pub fn mark_ready(&self, source: usize, interleaved: &[Sample]) -> StoreResult<u64> {
        let binding = self.check_source(source)?;
        let expected = self.block_size * CHANNELS_PER_SOURCE;
        if interleaved.len() != expected {
            return Err(StoreError::BlockSizeMismatch {
                expected,
                actual: interleaved.len(),
            });
        }

        let mut state = self.lock()?;
        loop {
            if state.shutdown {
                return Err(StoreError::Shutdown);
            }
            if state.finished[source] {
                return Err(StoreError::SourceFinished(source));
            }
            if !state.slots[binding.left].ready && !state.slots[binding.right].ready {
                break;
            }
            state = self
                .slot_free
                .wait(state)
                .map_err(|_| StoreError::Poisoned)?;
        }

        for (position, channel) in binding.channels().into_iter().enumerate() {
            let slot = &mut state.slots[channel];
            for (dst, frame) in slot
                .samples
                .iter_mut()
                .zip(interleaved.chunks_exact(CHANNELS_PER_SOURCE))
            {
                *dst = frame[position];
            }
            slot.ready = true;
            slot.version += 1;
        }
        let version = state.slots[binding.left].version;
        drop(state);

        self.all_ready.notify_one();
        Ok(version)
    }

    /// Wait for a complete block across all channels and take it
    ///
    /// Copies every channel into `dest` (one buffer per channel, each
    /// `block_size` long), clears all readiness flags and wakes blocked
    /// readers, all in one critical section. Channels of a finished source
    /// are filled with silence under [`EndOfSourcePolicy::Silence`].
    ///
    /// Returns the 1-based index of the block taken.
    pub fn take_block(&self, dest: &mut [Vec<Sample>]) -> StoreResult<u64> {
        let channels = self.channel_count();
        if dest.len() != channels {
            return Err(StoreError::BlockSizeMismatch {
                expected: channels,
                actual: dest.len(),
            });
        }
        if let Some(bad) = dest.iter().find(|d| d.len() != self.block_size) {
            return Err(StoreError::BlockSizeMismatch {
                expected: self.block_size,
                actual: bad.len(),
            });
        }

        let mut state = self.lock()?;
        loop {
            if state.shutdown {
                return Err(StoreError::Shutdown);
            }
            match self.readiness(&state) {
                Readiness::Ready => break,
                Readiness::Exhausted => return Err(StoreError::Exhausted),
                Readiness::Pending => {}
            }
            if self.policy == EndOfSourcePolicy::Halt
                && !state.stall_reported
                && state.finished.iter().any(|&f| f)
            {
                state.stall_reported = true;
                log::warn!(
                    "Pump stalled: a source reached end of source and end_of_source=halt"
                );
            }
            state = self
                .all_ready
                .wait(state)
                .map_err(|_| StoreError::Poisoned)?;
        }

        for (slot, dst) in state.slots.iter_mut().zip(dest.iter_mut()) {
            if slot.ready {
                dst.copy_from_slice(&slot.samples);
            } else {
                dst.fill(0);
            }
            slot.ready = false;
        }
        state.blocks_taken += 1;
        let block_index = state.blocks_taken;
        drop(state);

        self.slot_free.notify_all();
        Ok(block_index)
    }

    fn readiness(&self, state: &StoreState) -> Readiness {
        let silence = self.policy == EndOfSourcePolicy::Silence;

        if silence
            && state.finished.iter().all(|&f| f)
            && !state.slots.iter().any(|s| s.ready)
        {
            return Readiness::Exhausted;
        }

        for (source, binding) in self.bindings.iter().enumerate() {
            let ready = state.slots[binding.left].ready && state.slots[binding.right].ready;
            if ready || (silence && state.finished[source]) {
                continue;
            }
            return Readiness::Pending;
        }
        Readiness::Ready
    }

    /// Record that `source` reached end of source
    ///
    /// Any block it already deposited is still consumed.
    pub fn mark_finished(&self, source: usize) -> StoreResult<()> {
        self.check_source(source)?;
        let mut state = self.lock()?;
        if state.finished[source] {
            return Ok(());
        }
        state.finished[source] = true;
        drop(state);

        if self.policy == EndOfSourcePolicy::Halt {
            log::warn!(
                "Source {} finished; remaining channels cannot complete a block",
                source
            );
        } else {
            log::info!("Source {} finished; its channels now carry silence", source);
        }
        self.all_ready.notify_all();
        Ok(())
    }

    /// Wake every waiter and make all further waits fail with `Shutdown`
    pub fn shutdown(&self) {
        // Shutdown must get through even if a holder panicked
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.shutdown = true;
        drop(state);

        self.slot_free.notify_all();
        self.all_ready.notify_all();
        log::debug!("ChannelBufferStore shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().map(|s| s.shutdown).unwrap_or(true)
    }

    /// Per-channel deposit counters
    pub fn versions(&self) -> StoreResult<Vec<u64>> {
        let state = self.lock()?;
        Ok(state.slots.iter().map(|s| s.version).collect())
    }

    /// Per-channel readiness flags
    pub fn ready_flags(&self) -> StoreResult<Vec<bool>> {
        let state = self.lock()?;
        Ok(state.slots.iter().map(|s| s.ready).collect())
    }

    /// Number of blocks handed to the coordinator so far
    pub fn blocks_taken(&self) -> StoreResult<u64> {
        Ok(self.lock()?.blocks_taken)
    }

    pub fn is_finished(&self, source: usize) -> StoreResult<bool> {
        self.check_source(source)?;
        Ok(self.lock()?.finished[source])
    }
}
