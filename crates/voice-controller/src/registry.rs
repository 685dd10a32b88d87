//! Session registry.
//!
//! Maps each guild to at most one slot. A slot is either a pending
//! reservation (a connect is handshaking) or an active session. The registry
//! is owned by the controller actor, so every operation here is atomic with
//! respect to every other.

use crate::errors::VcError;

use common::types::{ChannelId, GuildId, UserId};
use std::collections::HashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A connect that has reserved its guild and is still handshaking.
#[derive(Debug)]
pub struct PendingSession {
    /// Attempt identifier, matched against the handshake's completion.
    pub attempt: u64,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    /// Cancels the handshake task.
    pub cancel_token: CancellationToken,
    pub started_at: Instant,
    /// Callers of `cancel_connect` waiting for the handshake to wind down.
    pub cancel_waiters: Vec<oneshot::Sender<Result<(), VcError>>>,
}

/// An established session.
#[derive(Debug)]
pub struct ActiveSession<H> {
    /// Attempt identifier the session was created from.
    pub attempt: u64,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub connected_at: Instant,
    /// Set once a disconnect has been issued; the session no longer accepts
    /// speak or disconnect requests.
    pub disconnecting: bool,
    /// Handle used to reach the session.
    pub handle: H,
}

/// Registry slot for one guild.
#[derive(Debug)]
pub enum SessionSlot<H> {
    Pending(PendingSession),
    Active(ActiveSession<H>),
}

/// Guild → slot map.
#[derive(Debug)]
pub struct SessionRegistry<H> {
    slots: HashMap<GuildId, SessionSlot<H>>,
}

impl<H> Default for SessionRegistry<H> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }
}

impl<H> SessionRegistry<H> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `guild_id` for a connect.
    ///
    /// # Errors
    ///
    /// Returns `VcError::AlreadyConnected` if the guild holds any slot.
    pub fn reserve(&mut self, guild_id: GuildId, pending: PendingSession) -> Result<(), VcError> {
        if self.slots.contains_key(&guild_id) {
            return Err(VcError::AlreadyConnected(guild_id));
        }
        self.slots.insert(guild_id, SessionSlot::Pending(pending));
        Ok(())
    }

    /// Promote the pending reservation made by `attempt` to an active session.
    ///
    /// # Errors
    ///
    /// Returns `VcError::Cancelled` (with the handle dropped) when the guild
    /// no longer holds that reservation.
    pub fn activate(&mut self, guild_id: GuildId, attempt: u64, handle: H) -> Result<(), VcError> {
        let Some(SessionSlot::Pending(pending)) = self.slots.get(&guild_id) else {
            return Err(VcError::Cancelled);
        };
        if pending.attempt != attempt {
            return Err(VcError::Cancelled);
        }

        let channel_id = pending.channel_id;
        let user_id = pending.user_id;
        self.slots.insert(
            guild_id,
            SessionSlot::Active(ActiveSession {
                attempt,
                channel_id,
                user_id,
                connected_at: Instant::now(),
                disconnecting: false,
                handle,
            }),
        );
        Ok(())
    }

    /// Slot for `guild_id`, if any.
    #[must_use]
    pub fn get(&self, guild_id: GuildId) -> Option<&SessionSlot<H>> {
        self.slots.get(&guild_id)
    }

    /// Pending reservation for `guild_id`, if that is what the guild holds.
    #[must_use]
    pub fn pending(&self, guild_id: GuildId) -> Option<&PendingSession> {
        match self.slots.get(&guild_id) {
            Some(SessionSlot::Pending(pending)) => Some(pending),
            _ => None,
        }
    }

    /// Mutable pending reservation for `guild_id`.
    pub fn pending_mut(&mut self, guild_id: GuildId) -> Option<&mut PendingSession> {
        match self.slots.get_mut(&guild_id) {
            Some(SessionSlot::Pending(pending)) => Some(pending),
            _ => None,
        }
    }

    /// Active session for `guild_id`, if that is what the guild holds.
    #[must_use]
    pub fn active(&self, guild_id: GuildId) -> Option<&ActiveSession<H>> {
        match self.slots.get(&guild_id) {
            Some(SessionSlot::Active(active)) => Some(active),
            _ => None,
        }
    }

    /// Mutable active session for `guild_id`.
    pub fn active_mut(&mut self, guild_id: GuildId) -> Option<&mut ActiveSession<H>> {
        match self.slots.get_mut(&guild_id) {
            Some(SessionSlot::Active(active)) => Some(active),
            _ => None,
        }
    }

    /// Remove whatever slot `guild_id` holds.
    pub fn remove(&mut self, guild_id: GuildId) -> Option<SessionSlot<H>> {
        self.slots.remove(&guild_id)
    }

    /// Remove the slot only if it belongs to `attempt`.
    pub fn remove_attempt(&mut self, guild_id: GuildId, attempt: u64) -> Option<SessionSlot<H>> {
        let owned = match self.slots.get(&guild_id)? {
            SessionSlot::Pending(pending) => pending.attempt == attempt,
            SessionSlot::Active(active) => active.attempt == attempt,
        };
        if owned {
            self.slots.remove(&guild_id)
        } else {
            None
        }
    }

    /// Number of occupied slots (pending and active).
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no guild holds a slot.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of active sessions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, SessionSlot::Active(_)))
            .count()
    }

    /// Number of pending reservations.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.slots.len() - self.active_count()
    }

    /// Iterate over active sessions.
    pub fn active_sessions(&self) -> impl Iterator<Item = (GuildId, &ActiveSession<H>)> {
        self.slots.iter().filter_map(|(guild_id, slot)| match slot {
            SessionSlot::Active(active) => Some((*guild_id, active)),
            SessionSlot::Pending(_) => None,
        })
    }

    /// Iterate over pending reservations.
    pub fn pending_sessions(&self) -> impl Iterator<Item = (GuildId, &PendingSession)> {
        self.slots.iter().filter_map(|(guild_id, slot)| match slot {
            SessionSlot::Pending(pending) => Some((*guild_id, pending)),
            SessionSlot::Active(_) => None,
        })
    }
}
