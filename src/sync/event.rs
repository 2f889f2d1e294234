// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use serde::{Deserialize, Serialize};

use crate::types::{now_millis, PlayerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncEventKind {
    CrateOpened,
    RewardGranted,
    KeyConsumed,
    CooldownSet,
}

impl SyncEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CrateOpened => "CRATE_OPENED",
            Self::RewardGranted => "REWARD_GRANTED",
            Self::KeyConsumed => "KEY_CONSUMED",
            Self::CooldownSet => "COOLDOWN_SET",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CRATE_OPENED" => Some(Self::CrateOpened),
            "REWARD_GRANTED" => Some(Self::RewardGranted),
            "KEY_CONSUMED" => Some(Self::KeyConsumed),
            "COOLDOWN_SET" => Some(Self::CooldownSet),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something one server did that its peers should know about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub kind: SyncEventKind,
    /// Server that produced the event; used for echo suppression
    pub origin_server: String,
    pub player: PlayerId,
    pub crate_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward_id: Option<String>,
    /// Epoch millis at the origin
    pub timestamp: i64,
}

impl SyncEvent {
    pub fn new(
        kind: SyncEventKind,
        origin_server: impl Into<String>,
        player: PlayerId,
        crate_id: impl Into<String>,
        reward_id: Option<String>,
    ) -> Self {
        Self {
            kind,
            origin_server: origin_server.into(),
            player,
            crate_id: crate_id.into(),
            reward_id,
            timestamp: now_millis(),
        }
    }

    pub fn crate_opened(
        origin_server: impl Into<String>,
        player: PlayerId,
        crate_id: impl Into<String>,
        reward_id: Option<String>,
    ) -> Self {
        Self::new(SyncEventKind::CrateOpened, origin_server, player, crate_id, reward_id)
    }

    pub fn reward_granted(
        origin_server: impl Into<String>,
        player: PlayerId,
        crate_id: impl Into<String>,
        reward_id: impl Into<String>,
    ) -> Self {
        Self::new(SyncEventKind::RewardGranted, origin_server, player, crate_id, Some(reward_id.into()))
    }

    pub fn key_consumed(origin_server: impl Into<String>, player: PlayerId, crate_id: impl Into<String>) -> Self {
        Self::new(SyncEventKind::KeyConsumed, origin_server, player, crate_id, None)
    }

    pub fn cooldown_set(origin_server: impl Into<String>, player: PlayerId, crate_id: impl Into<String>) -> Self {
        Self::new(SyncEventKind::CooldownSet, origin_server, player, crate_id, None)
    }

    /// Override the origin timestamp.
    #[must_use]
    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn to_json(&self) -> Result<String, super::SyncError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> Result<Self, super::SyncError> {
        Ok(serde_json::from_str(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_wire_format() {
        let player = Uuid::new_v4();
        let event = SyncEvent::reward_granted("hub-1", player, "vote", "diamond").at(1_000);
        let json = event.to_json().unwrap();

        assert!(json.contains("\"kind\":\"REWARD_GRANTED\""));
        assert!(json.contains("\"originServer\":\"hub-1\""));
        assert!(json.contains("\"rewardId\":\"diamond\""));
        assert_eq!(SyncEvent::from_json(&json).unwrap(), event);
    }

    #[test]
    fn test_missing_reward_is_omitted() {
        let event = SyncEvent::key_consumed("hub-1", Uuid::new_v4(), "vote");
        let json = event.to_json().unwrap();
        assert!(!json.contains("rewardId"));
        assert_eq!(SyncEvent::from_json(&json).unwrap().reward_id, None);
    }

    #[test]
    fn test_garbage_is_a_serialization_error() {
        let err = SyncEvent::from_json("{not json").unwrap_err();
        assert!(matches!(err, crate::sync::SyncError::Serialization(_)));
    }

    #[test]
    fn test_kind_names() {
        for kind in [
            SyncEventKind::CrateOpened,
            SyncEventKind::RewardGranted,
            SyncEventKind::KeyConsumed,
            SyncEventKind::CooldownSet,
        ] {
            assert_eq!(SyncEventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(SyncEventKind::parse("TELEPORTED"), None);
    }
}
