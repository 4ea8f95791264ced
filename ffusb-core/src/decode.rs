//! Turns raw printer output into the lines a serial host expects.
//!
//! Output is split into blocks, one per echoed command, and each block is rewritten by the rule
//! registered for its tag.

use std::collections::VecDeque;

use crate::{
    response::{self, is_terminator, Line, TERMINATOR},
    session::{Mute, Session},
    state::PrinterState,
};

pub const DONE_PRINTING: &str = "Done printing file";
pub const NOT_PRINTING: &str = "Not SD printing";
pub const SD_PAUSED: &str = "SD printing paused";
pub const BEGIN_LISTING: &str = "Begin file list";
pub const END_LISTING: &str = "End file list";
pub const AUTOREPORT_CAPABILITY: &str = "Cap:AUTOREPORT_TEMP:1";

/// Output belonging to one command
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Block {
    /// Upper-cased mnemonic from the echo line
    pub tag: Option<String>,
    pub echo: Option<String>,
    pub body: Vec<String>,
    pub terminated: bool,
}

impl Block {
    fn has_content(&self) -> bool {
        self.echo.is_some() || !self.body.is_empty()
    }

    fn echo_line(&self) -> Vec<String> {
        self.echo.iter().cloned().collect()
    }

    fn finish(&self, lines: &mut Vec<String>) {
        if self.terminated {
            lines.push(TERMINATOR.to_owned());
        }
    }
}

/// Group raw output into blocks, carriage returns and blank lines dropped
pub fn split_blocks(raw: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut current = Block::default();
    for line in raw.split('\n').map(|line| line.trim_end_matches('\r')) {
        match response::classify(line) {
            Line::Echo(tag) => {
                if current.has_content() {
                    blocks.push(std::mem::take(&mut current));
                }
                current.tag = Some(tag.to_ascii_uppercase());
                current.echo = Some(line.trim().to_owned());
            }
            Line::Ok => {
                current.terminated = true;
                blocks.push(std::mem::take(&mut current));
            }
            Line::Text(text) if text.trim().is_empty() => (),
            Line::Text(text) => current.body.push(text.trim_end().to_owned()),
        }
    }
    if current.has_content() {
        blocks.push(current);
    }
    blocks
}

type Rule = fn(&Block, &mut Session) -> Vec<String>;

static RULES: &[(&str, Rule)] = &[
    ("M661", listing),
    ("M27", sd_progress),
    ("M114", position),
    ("M115", identify),
    ("M119", status),
];

fn rule_for(tag: &str) -> Rule {
    RULES
        .iter()
        .find(|(rule_tag, _)| *rule_tag == tag)
        .map_or(passthrough as Rule, |(_, rule)| *rule)
}

fn passthrough(block: &Block, _: &mut Session) -> Vec<String> {
    let mut lines = block.echo_line();
    lines.extend(block.body.iter().cloned());
    block.finish(&mut lines);
    lines
}

fn listing(block: &Block, _: &mut Session) -> Vec<String> {
    let mut lines = block.echo_line();
    lines.push(BEGIN_LISTING.to_owned());
    lines.extend(response::listing_entries(&block.body.join("\n")));
    lines.push(END_LISTING.to_owned());
    block.finish(&mut lines);
    lines
}

fn progress_line(state: PrinterState, progress: response::SdProgress) -> Option<&'static str> {
    match state {
        PrinterState::Ready | PrinterState::Unknown if progress.is_complete() => Some(DONE_PRINTING),
        PrinterState::Ready | PrinterState::Unknown => Some(NOT_PRINTING),
        PrinterState::SdPaused => Some(SD_PAUSED),
        _ => None,
    }
}

fn sd_progress(block: &Block, session: &mut Session) -> Vec<String> {
    let state = session.state.state();
    let mut lines = block.echo_line();
    let mut found = false;
    for line in &block.body {
        match response::sd_progress(line) {
            Some(progress) => {
                found = true;
                let replaced = progress_line(state, progress).map_or_else(|| line.clone(), str::to_owned);
                lines.push(replaced);
            }
            None => lines.push(line.clone()),
        }
    }
    if !found {
        let synthetic = match state {
            PrinterState::Ready => Some(DONE_PRINTING),
            PrinterState::SdPaused => Some(SD_PAUSED),
            PrinterState::Unknown => Some(NOT_PRINTING),
            _ => None,
        };
        lines.extend(synthetic.map(str::to_owned));
    }
    if block.terminated || state != PrinterState::Unknown {
        lines.push(TERMINATOR.to_owned());
    }
    lines
}

fn position(block: &Block, session: &mut Session) -> Vec<String> {
    let mut lines = block.echo_line();
    for line in &block.body {
        match response::position_report(line) {
            Some(report) => {
                session.position.apply_report(&report);
                lines.push(response::rename_extruders(line));
            }
            None => lines.push(line.clone()),
        }
    }
    block.finish(&mut lines);
    lines
}

fn identify(block: &Block, _: &mut Session) -> Vec<String> {
    let mut lines = block.echo_line();
    lines.extend(block.body.iter().cloned());
    let firmware = block
        .body
        .iter()
        .find_map(|line| response::field(line, "Firmware"));
    let machine = block
        .body
        .iter()
        .find_map(|line| response::field(line, "Machine Type"));
    if let (Some(firmware), Some(machine)) = (firmware, machine) {
        lines.push(format!("FIRMWARE_NAME:{firmware} MACHINE_TYPE:{machine}"));
    }
    lines.push(AUTOREPORT_CAPABILITY.to_owned());
    block.finish(&mut lines);
    lines
}

fn status(block: &Block, session: &mut Session) -> Vec<String> {
    match response::status_report(block.body.iter().map(String::as_str)) {
        Some(report) => {
            session.state.apply(&report);
        }
        None if block.terminated => {
            tracing::warn!("Status poll reply carried no machine status: {:?}", block.body)
        }
        None => (),
    }
    let mut lines = block.echo_line();
    block.finish(&mut lines);
    lines
}

/// Decode one raw read into host-visible lines, updating session state on the way
pub fn decode(raw: &str, session: &mut Session) -> Vec<String> {
    let mut rendered: Vec<Vec<String>> = Vec::new();
    // host-visible blocks still missing their terminator
    let mut awaiting: Vec<usize> = Vec::new();
    for block in split_blocks(raw) {
        let Some(tag) = block.tag.as_deref() else {
            // a bare terminator settles a block left open by an earlier read
            if block.terminated && block.body.is_empty() && session.unacknowledged > 0 {
                session.unacknowledged -= 1;
            }
            rendered.push(passthrough(&block, session));
            continue;
        };
        if session.pending.as_deref() == Some(tag) {
            session.pending = None;
        }
        let mute = session.mutes.take(tag);
        let mut lines = rule_for(tag)(&block, session);
        match mute {
            Some(Mute::Block) => lines.clear(),
            Some(Mute::Echo) => {
                lines.retain(|line| block.echo.as_ref() != Some(line) && !is_terminator(line))
            }
            None => (),
        }
        if tag == "M119" && session.state.is_ready() {
            for index in awaiting.drain(..) {
                rendered[index].push(TERMINATOR.to_owned());
            }
            if session.unacknowledged > 0 {
                tracing::debug!("Completing {} earlier host block(s)", session.unacknowledged);
                rendered.push(vec![TERMINATOR.to_owned(); session.unacknowledged]);
                session.unacknowledged = 0;
            }
        }
        if mute.is_none() && lines.last().is_some_and(|line| !is_terminator(line)) {
            awaiting.push(rendered.len());
        }
        rendered.push(lines);
    }
    session.unacknowledged += awaiting.len();
    rendered.concat()
}

/// Decoded lines waiting to be handed to the host, oldest first
#[derive(Debug, Default, Clone)]
pub struct LineBuffer(VecDeque<String>);

impl LineBuffer {
    pub fn extend(&mut self, lines: impl IntoIterator<Item = String>) {
        self.0.extend(lines);
    }

    pub fn pop(&mut self) -> Option<String> {
        self.0.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}
