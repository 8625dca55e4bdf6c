//! The shard-configuration state machine.
//!
//! Each mutating command produces a new numbered [`ShardConfig`] appended
//! to an immutable history; queries read the history. Rebalancing is
//! deterministic: identical command sequences yield identical histories on
//! every replica.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::application::Application;
use crate::error::ServiceError;
use crate::protocol::Status;

pub const SHARD_COUNT: usize = 10;

/// One version of the shard→group assignment. Group id 0 means a shard is
/// unassigned.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardConfig {
    pub num: u64,
    pub shards: [u64; SHARD_COUNT],
    pub groups: HashMap<u64, Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CtrlCommand {
    /// Add replica groups (gid → server names) and rebalance.
    Join { groups: HashMap<u64, Vec<String>> },
    /// Remove groups and hand their shards to the survivors.
    Leave { gids: Vec<u64> },
    /// Pin one shard to one group, bypassing the balancer.
    Move { shard: usize, gid: u64 },
    /// Read configuration `num`; -1 (or any out-of-range value) reads the
    /// latest.
    Query { num: i64 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CtrlReply {
    pub status: Status,
    pub config: Option<ShardConfig>,
}

impl CtrlReply {
    fn ok() -> Self {
        CtrlReply {
            status: Status::Ok,
            config: None,
        }
    }
}

pub struct ShardController {
    history: Vec<ShardConfig>,
}

impl ShardController {
    pub fn new() -> Self {
        // config #0: all shards unassigned, no groups
        ShardController {
            history: vec![ShardConfig::default()],
        }
    }

    fn latest(&self) -> &ShardConfig {
        self.history.last().expect("history is never empty")
    }

    fn next_config(&self) -> ShardConfig {
        let mut config = self.latest().clone();
        config.num += 1;
        config
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

impl Default for ShardController {
    fn default() -> Self {
        ShardController::new()
    }
}

impl Application for ShardController {
    type Command = CtrlCommand;
    type Reply = CtrlReply;

    fn apply(&mut self, cmd: CtrlCommand) -> CtrlReply {
        match cmd {
            CtrlCommand::Join { groups } => {
                let mut config = self.next_config();
                config.groups.extend(groups);
                rebalance(&mut config);
                self.history.push(config);
                CtrlReply::ok()
            }
            CtrlCommand::Leave { gids } => {
                let mut config = self.next_config();
                for gid in gids {
                    config.groups.remove(&gid);
                }
                rebalance(&mut config);
                self.history.push(config);
                CtrlReply::ok()
            }
            CtrlCommand::Move { shard, gid } => {
                let mut config = self.next_config();
                if shard < SHARD_COUNT {
                    config.shards[shard] = gid;
                }
                self.history.push(config);
                CtrlReply::ok()
            }
            CtrlCommand::Query { num } => {
                let config = if num < 0 || num as usize >= self.history.len() {
                    self.latest()
                } else {
                    &self.history[num as usize]
                };
                CtrlReply {
                    status: Status::Ok,
                    config: Some(config.clone()),
                }
            }
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>, ServiceError> {
        Ok(bincode::serialize(&self.history)?)
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), ServiceError> {
        self.history = bincode::deserialize(data)?;
        Ok(())
    }
}

/// Spreads shards over the live groups with at most one shard of skew,
/// moving as few shards as possible. Iteration order is fixed (ascending
/// gid) so every replica lands on the same assignment.
fn rebalance(config: &mut ShardConfig) {
    if config.groups.is_empty() {
        config.shards = [0; SHARD_COUNT];
        return;
    }
    let mut owned: BTreeMap<u64, Vec<usize>> =
        config.groups.keys().map(|&gid| (gid, Vec::new())).collect();
    let mut orphans = Vec::new();
    for (shard, &gid) in config.shards.iter().enumerate() {
        match owned.get_mut(&gid) {
            Some(shards) => shards.push(shard),
            None => orphans.push(shard),
        }
    }
    for shard in orphans {
        let gid = least_loaded(&owned);
        owned.get_mut(&gid).expect("gid from owned").push(shard);
    }
    loop {
        let donor = most_loaded(&owned);
        let taker = least_loaded(&owned);
        if owned[&donor].len() - owned[&taker].len() <= 1 {
            break;
        }
        let shard = owned.get_mut(&donor).expect("gid from owned").pop().expect("donor owns shards");
        owned.get_mut(&taker).expect("gid from owned").push(shard);
    }
    for (gid, shards) in &owned {
        for &shard in shards {
            config.shards[shard] = *gid;
        }
    }
}

fn least_loaded(owned: &BTreeMap<u64, Vec<usize>>) -> u64 {
    let mut best = 0;
    let mut best_len = usize::MAX;
    for (&gid, shards) in owned {
        if shards.len() < best_len {
            best = gid;
            best_len = shards.len();
        }
    }
    best
}

fn most_loaded(owned: &BTreeMap<u64, Vec<usize>>) -> u64 {
    let mut best = 0;
    let mut best_len = 0;
    for (&gid, shards) in owned {
        if shards.len() > best_len {
            best = gid;
            best_len = shards.len();
        }
    }
    best
}
