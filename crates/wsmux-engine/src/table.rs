use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;
use wsmux_frame::{ChannelId, DropCode, WireError};

use crate::channel::LogicalChannel;
use crate::writer::lock;

/// Why a channel could not be added.
#[derive(Debug)]
pub(crate) enum AdmissionError {
    /// The engine is draining and refuses new channels.
    NotAccepting,
    /// The peer violated the protocol (duplicate id or no slot).
    Protocol(WireError),
}

struct TableState {
    channels: HashMap<ChannelId, Arc<LogicalChannel>>,
    /// Runs of `(count, receive_quota)` granted to the peer, oldest first.
    slots: VecDeque<(u64, u64)>,
    /// Ids this side sent DropChannel for and the peer has not acknowledged.
    awaiting_ack: HashSet<ChannelId>,
    /// Channels removed whose DropChannel is not queued yet.
    retiring: usize,
    accepting: bool,
}

impl TableState {
    fn check_admission(&self, channel_id: ChannelId) -> Result<(), AdmissionError> {
        if !self.accepting {
            return Err(AdmissionError::NotAccepting);
        }
        if self.channels.contains_key(&channel_id) {
            return Err(AdmissionError::Protocol(WireError::physical(
                DropCode::ChannelAlreadyExists,
                format!("channel {channel_id} already exists"),
            )));
        }
        if self.awaiting_ack.contains(&channel_id) {
            return Err(AdmissionError::Protocol(WireError::physical(
                DropCode::ChannelAlreadyExists,
                format!("channel {channel_id} still awaits its DropChannel acknowledgment"),
            )));
        }
        if self.slots.is_empty() {
            return Err(AdmissionError::Protocol(WireError::physical(
                DropCode::NewChannelSlotViolation,
                format!("no slot available for channel {channel_id}"),
            )));
        }
        Ok(())
    }

    fn is_idle(&self) -> bool {
        self.channels.is_empty() && self.retiring == 0
    }

    fn pop_slot(&mut self) -> Option<u64> {
        let (count, quota) = self.slots.front_mut()?;
        let quota = *quota;
        *count -= 1;
        if *count == 0 {
            self.slots.pop_front();
        }
        Some(quota)
    }
}

/// Open channels plus the slots granted to the peer.
///
/// One lock covers both, so consuming a slot and inserting the channel
/// happen together.
pub(crate) struct ChannelTable {
    state: Mutex<TableState>,
    /// Signalled whenever a removal completes.
    removed: Condvar,
}

impl ChannelTable {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                channels: HashMap::new(),
                slots: VecDeque::new(),
                awaiting_ack: HashSet::new(),
                retiring: 0,
                accepting: true,
            }),
            removed: Condvar::new(),
        }
    }

    /// Check that `channel_id` could be added right now, without taking a slot.
    pub(crate) fn check_admission(&self, channel_id: ChannelId) -> Result<(), AdmissionError> {
        lock(&self.state).check_admission(channel_id)
    }

    /// Pop one slot and insert the channel built from its receive quota.
    pub(crate) fn add_channel(
        &self,
        channel_id: ChannelId,
        build: impl FnOnce(u64) -> LogicalChannel,
    ) -> Result<Arc<LogicalChannel>, AdmissionError> {
        let mut state = lock(&self.state);
        state.check_admission(channel_id)?;
        let receive_quota = state.pop_slot().unwrap_or_default();
        let channel = Arc::new(build(receive_quota));
        state.channels.insert(channel_id, Arc::clone(&channel));
        debug!(channel_id, receive_quota, "channel added");
        Ok(channel)
    }

    /// Add a channel through a slot that exists only for this call.
    pub(crate) fn add_channel_with_slot(
        &self,
        channel_id: ChannelId,
        receive_quota: u64,
        build: impl FnOnce(u64) -> LogicalChannel,
    ) -> Result<Arc<LogicalChannel>, AdmissionError> {
        lock(&self.state).slots.push_front((1, receive_quota));
        let added = self.add_channel(channel_id, build);
        if added.is_err() {
            self.discard_slot();
        }
        added
    }

    /// Grant `count` more slots, each carrying `receive_quota`.
    pub(crate) fn add_slots(&self, count: u64, receive_quota: u64) {
        if count == 0 {
            return;
        }
        lock(&self.state).slots.push_back((count, receive_quota));
    }

    /// Consume a slot without creating a channel (rejected request).
    pub(crate) fn discard_slot(&self) {
        lock(&self.state).pop_slot();
    }

    pub(crate) fn slots_available(&self) -> u64 {
        lock(&self.state).slots.iter().map(|(count, _)| *count).sum()
    }

    pub(crate) fn get(&self, channel_id: ChannelId) -> Option<Arc<LogicalChannel>> {
        lock(&self.state).channels.get(&channel_id).cloned()
    }

    /// Take `channel_id` out of the table.
    ///
    /// With `await_ack` the id stays reserved until `acknowledge_drop`. The
    /// table does not count as idle until `finish_removal` is called, once
    /// the channel's DropChannel is queued.
    pub(crate) fn remove_channel(
        &self,
        channel_id: ChannelId,
        await_ack: bool,
    ) -> Option<Arc<LogicalChannel>> {
        let mut state = lock(&self.state);
        let removed = state.channels.remove(&channel_id)?;
        if await_ack {
            state.awaiting_ack.insert(channel_id);
        }
        state.retiring += 1;
        Some(removed)
    }

    pub(crate) fn finish_removal(&self) {
        let mut state = lock(&self.state);
        state.retiring = state.retiring.saturating_sub(1);
        self.removed.notify_all();
    }

    /// Release an id reserved by `remove_channel`. False if none was pending.
    pub(crate) fn acknowledge_drop(&self, channel_id: ChannelId) -> bool {
        lock(&self.state).awaiting_ack.remove(&channel_id)
    }

    pub(crate) fn channels(&self) -> Vec<Arc<LogicalChannel>> {
        lock(&self.state).channels.values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.state).channels.len()
    }

    /// No channel open and no removal in progress.
    pub(crate) fn is_idle(&self) -> bool {
        lock(&self.state).is_idle()
    }

    #[cfg(test)]
    pub(crate) fn is_accepting(&self) -> bool {
        lock(&self.state).accepting
    }

    pub(crate) fn stop_accepting(&self) {
        lock(&self.state).accepting = false;
    }

    /// Stop accepting if no channel is open. True if this call stopped it.
    pub(crate) fn stop_accepting_if_empty(&self) -> bool {
        let mut state = lock(&self.state);
        if !state.accepting || !state.is_idle() {
            return false;
        }
        state.accepting = false;
        true
    }

    /// Wait until no channel is open, then stop accepting new ones.
    ///
    /// Returns false if `timeout` elapsed first; the table keeps accepting
    /// in that case.
    pub(crate) fn wait_until_empty(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = lock(&self.state);
        while !state.is_idle() {
            state = match deadline {
                None => self
                    .removed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.removed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        state.accepting = false;
        true
    }
}
