//! A small in-memory player table standing in for a game database.
//!
//! Everything here is fictional and seeded at startup.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use pitboss_contracts::error::{PitbossError, PitbossResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Player {
    pub id: String,
    pub name: String,
    pub level: u32,
    pub coins: u64,
    pub banned: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ban_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ban_hours: Option<u32>,
}

impl Player {
    fn new(id: &str, name: &str, level: u32, coins: u64) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            level,
            coins,
            banned: false,
            ban_reason: String::new(),
            ban_hours: None,
        }
    }
}

pub struct PlayerStore {
    players: Mutex<BTreeMap<String, Player>>,
}

impl PlayerStore {
    pub fn seeded() -> Self {
        let players = [
            Player::new("u-1", "Thorn", 42, 12_500),
            Player::new("u-2", "Maelis", 17, 830),
            Player::new("u-3", "Quickfang", 63, 98_000),
            Player::new("u-4", "Oriel", 5, 40),
            Player::new("u-5", "Brask", 29, 4_100),
            Player::new("u-6", "Vesna", 51, 22_750),
        ];
        Self { players: Mutex::new(players.into_iter().map(|p| (p.id.clone(), p)).collect()) }
    }

    fn with_player<T>(&self, id: &str, f: impl FnOnce(&mut Player) -> T) -> PitbossResult<T> {
        let mut players = self.players.lock().unwrap_or_else(PoisonError::into_inner);
        let player = players
            .get_mut(id)
            .ok_or_else(|| PitbossError::not_found(format!("player '{id}'")))?;
        Ok(f(player))
    }

    pub fn get(&self, id: &str) -> PitbossResult<Player> {
        self.with_player(id, |p| p.clone())
    }

    pub fn ban(&self, id: &str, reason: &str, hours: Option<u32>) -> PitbossResult<Player> {
        self.with_player(id, |p| {
            p.banned = true;
            p.ban_reason = reason.to_string();
            p.ban_hours = hours;
            p.clone()
        })
    }

    /// Reset progress; the ban state is kept.
    pub fn wipe(&self, id: &str) -> PitbossResult<Player> {
        self.with_player(id, |p| {
            p.level = 1;
            p.coins = 0;
            p.clone()
        })
    }

    /// Snapshot ordered by id.
    pub fn all(&self) -> Vec<Player> {
        self.players
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

impl Default for PlayerStore {
    fn default() -> Self {
        Self::seeded()
    }
}

#[cfg(test)]
mod tests {
    use pitboss_contracts::error::ErrorKind;

    use super::*;

    #[test]
    fn ban_then_wipe_keeps_the_ban() {
        let store = PlayerStore::seeded();
        store.ban("u-2", "botting", Some(24)).unwrap();
        let wiped = store.wipe("u-2").unwrap();
        assert!(wiped.banned);
        assert_eq!(wiped.level, 1);
        assert_eq!(wiped.coins, 0);
        assert_eq!(wiped.ban_hours, Some(24));
    }

    #[test]
    fn unknown_player_is_not_found() {
        let store = PlayerStore::seeded();
        assert_eq!(store.ban("u-99", "x", None).unwrap_err().kind(), ErrorKind::NotFound);
    }
}
