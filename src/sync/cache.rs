// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! What this server has heard about peers' activity.
//!
//! Purely advisory: fast reads for display and pre-checks. Decisions that
//! matter go through the storage backend.

use std::sync::Arc;

use dashmap::DashMap;

use super::bus::EventHandler;
use super::event::{SyncEvent, SyncEventKind};
use crate::types::PlayerId;

/// Latest peer-reported state for one (player, crate).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    /// Timestamp of the newest open or cooldown update
    pub cooldown: Option<i64>,
    /// Newest granted reward and when
    pub last_reward: Option<(String, i64)>,
    /// Timestamp of the newest key consumption
    pub last_key_consumed: Option<i64>,
    /// Server that reported the newest applied event
    pub origin_server: String,
}

/// Store `at` if it is newer than what the slot holds.
fn newer(slot: &mut Option<i64>, at: i64) -> bool {
    match slot {
        Some(current) if *current >= at => false,
        _ => {
            *slot = Some(at);
            true
        }
    }
}

#[derive(Default)]
pub struct ObservationCache {
    entries: DashMap<(PlayerId, String), Observation>,
}

impl ObservationCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event in, last-write-wins by event timestamp.
    /// Returns `false` when the event was older than what is cached.
    pub fn apply(&self, event: &SyncEvent) -> bool {
        let mut entry = self
            .entries
            .entry((event.player, event.crate_id.clone()))
            .or_default();
        let at = event.timestamp;

        let changed = match event.kind {
            SyncEventKind::CooldownSet => newer(&mut entry.cooldown, at),
            SyncEventKind::CrateOpened => {
                let opened = newer(&mut entry.cooldown, at);
                match &event.reward_id {
                    Some(reward) => Self::apply_reward(&mut entry, reward, at) || opened,
                    None => opened,
                }
            }
            SyncEventKind::RewardGranted => match &event.reward_id {
                Some(reward) => Self::apply_reward(&mut entry, reward, at),
                None => false,
            },
            SyncEventKind::KeyConsumed => newer(&mut entry.last_key_consumed, at),
        };

        if changed {
            entry.origin_server.clone_from(&event.origin_server);
        }
        changed
    }

    fn apply_reward(entry: &mut Observation, reward: &str, at: i64) -> bool {
        match &entry.last_reward {
            Some((_, current)) if *current >= at => false,
            _ => {
                entry.last_reward = Some((reward.to_string(), at));
                true
            }
        }
    }

    #[must_use]
    pub fn get(&self, player: PlayerId, crate_id: &str) -> Option<Observation> {
        self.entries
            .get(&(player, crate_id.to_string()))
            .map(|r| r.value().clone())
    }

    #[must_use]
    pub fn cooldown(&self, player: PlayerId, crate_id: &str) -> Option<i64> {
        self.get(player, crate_id).and_then(|o| o.cooldown)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Handler that feeds this cache, for [`SyncCoordinator::start`](super::SyncCoordinator::start).
    pub fn handler(self: &Arc<Self>) -> EventHandler {
        let cache = Arc::clone(self);
        Arc::new(move |event| {
            cache.apply(&event);
        })
    }
}
