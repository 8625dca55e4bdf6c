//! A replicated key-value store: the second application behind the same
//! server, exercising the NoKey path the controller never takes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::application::Application;
use crate::error::ServiceError;
use crate::protocol::Status;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum KvCommand {
    Get { key: String },
    Put { key: String, value: String },
    Append { key: String, value: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KvReply {
    pub status: Status,
    pub value: String,
}

impl KvReply {
    fn ok(value: String) -> Self {
        KvReply {
            status: Status::Ok,
            value,
        }
    }
}

#[derive(Default)]
pub struct Database {
    data: HashMap<String, String>,
}

impl Database {
    pub fn new() -> Self {
        Database::default()
    }
}

impl Application for Database {
    type Command = KvCommand;
    type Reply = KvReply;

    fn apply(&mut self, cmd: KvCommand) -> KvReply {
        match cmd {
            KvCommand::Get { key } => match self.data.get(&key) {
                Some(value) => KvReply::ok(value.clone()),
                None => KvReply {
                    status: Status::NoKey,
                    value: String::new(),
                },
            },
            KvCommand::Put { key, value } => {
                self.data.insert(key, value);
                KvReply::ok(String::new())
            }
            KvCommand::Append { key, value } => {
                self.data.entry(key).or_default().push_str(&value);
                KvReply::ok(String::new())
            }
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>, ServiceError> {
        Ok(bincode::serialize(&self.data)?)
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), ServiceError> {
        self.data = bincode::deserialize(data)?;
        Ok(())
    }
}
