use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use crate::{
    config::ConnectionConfig, position::PositionModel, profile::PrinterProfile,
    state::StateMachine,
};

/// How much of a response block belongs to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mute {
    /// Internal poll, the whole block is dropped
    Block,
    /// Only the payload is shown, echo and terminator are dropped
    Echo,
}

/// Outstanding internal commands per echoed tag, matched first in first out
#[derive(Debug, Default, Clone)]
pub struct Mutes(HashMap<String, VecDeque<Mute>>);

impl Mutes {
    pub fn push(&mut self, tag: impl Into<String>, mute: Mute) {
        self.0.entry(tag.into()).or_default().push_back(mute);
    }

    /// Claim the oldest mute registered for `tag`
    pub fn take(&mut self, tag: &str) -> Option<Mute> {
        let queue = self.0.get_mut(tag)?;
        let mute = queue.pop_front();
        if queue.is_empty() {
            self.0.remove(tag);
        }
        mute
    }

    pub fn count(&self, tag: &str) -> usize {
        self.0.get(tag).map_or(0, VecDeque::len)
    }

    /// Withdraw the newest mute for `tag`, whose command never reached the printer
    pub fn cancel(&mut self, tag: &str) -> Option<Mute> {
        let queue = self.0.get_mut(tag)?;
        let mute = queue.pop_back();
        if queue.is_empty() {
            self.0.remove(tag);
        }
        mute
    }
}

/// Mutable per-connection state shared by the read path, write path and keep-alive
#[derive(Debug, Clone)]
pub struct Session {
    pub profile: PrinterProfile,
    pub state: StateMachine,
    pub position: PositionModel,
    pub mutes: Mutes,
    /// Mnemonic of the last command the host sent
    pub pending: Option<String>,
    /// Host blocks from earlier reads still owed a terminator
    pub unacknowledged: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Session {
    pub fn new(profile: PrinterProfile, config: &ConnectionConfig) -> Self {
        Self {
            profile,
            state: StateMachine::new(config.wait_temp_report_secs),
            position: PositionModel::default(),
            mutes: Mutes::default(),
            pending: None,
            unacknowledged: 0,
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
        }
    }
}
