//! Rewrites host G-code into commands the printer accepts.

use crate::{
    gcode::{self, format_coordinate, Command},
    position::Axis,
    profile::Quirk,
    response::USER_DIR,
    session::{Mute, Session},
};

/// Harmless command used to keep a host command slot occupied
pub const NOOP: &str = "M119";

/// A command ready to be framed and written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub command: String,
    /// `None` for commands whose response belongs to the host
    pub mute: Option<Mute>,
}

impl Outgoing {
    pub fn host(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            mute: None,
        }
    }

    pub fn internal(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            mute: Some(Mute::Block),
        }
    }

    /// Mnemonic the printer will echo back
    pub fn tag(&self) -> Option<String> {
        gcode::parse(&self.command).map(|cmd| cmd.mnemonic())
    }

    /// Wire representation
    pub fn frame(&self) -> Vec<u8> {
        frame(&self.command)
    }
}

pub fn frame(command: &str) -> Vec<u8> {
    format!("~{command}\r\n").into_bytes()
}

fn noop() -> Vec<Outgoing> {
    vec![Outgoing::host(NOOP)]
}

/// Translate one host line, updating session state for anything it tracks
pub fn translate(line: &str, session: &mut Session) -> Vec<Outgoing> {
    let code = gcode::strip(line);
    if code.is_empty() {
        return noop();
    }
    let Some(cmd) = gcode::parse(code) else {
        tracing::warn!("Replacing unrecognized command `{code}` with a no-op");
        return noop();
    };
    let quirks = session.profile.quirks;
    match (cmd.letter, cmd.number) {
        ('M', 117) => noop(),
        ('M', 110) => vec![Outgoing::host("M601 S0")],
        ('M', 155) => {
            let secs = cmd.value('S').map(|secs| secs.max(0.0) as u32);
            session.state.set_host_interval(secs);
            noop()
        }
        ('M', 106) if cmd.value('S') == Some(0.0) => vec![Outgoing::host("M107")],
        ('M', 20) => vec![Outgoing::host("M661")],
        ('M', 23) => select_file(&cmd),
        ('M', 27) => vec![Outgoing::internal(NOOP), Outgoing::host("M27")],
        ('M', 132) if quirks.has(Quirk::NoM132) => noop(),
        ('T', tool) => {
            session.position.select_extruder(tool as usize);
            vec![Outgoing::host(format!("M108 T{tool}"))]
        }
        ('M', 108) => {
            if let Some(tool) = cmd.value('T') {
                session.position.select_extruder(tool as usize);
            }
            vec![Outgoing::host(code)]
        }
        ('G', 90) => {
            session.position.relative = false;
            vec![Outgoing::host(code)]
        }
        ('G', 91) => {
            session.position.relative = true;
            if quirks.has(Quirk::NoRelativePositioning) {
                vec![Outgoing::host("G90")]
            } else {
                vec![Outgoing::host(code)]
            }
        }
        ('G', 0 | 1) => linear_move(&cmd, code, session),
        ('G', 92) => {
            set_position(&cmd, session);
            vec![Outgoing::host(code)]
        }
        ('G', 28) => home(&cmd, code, session),
        _ => vec![Outgoing::host(code)],
    }
}

fn select_file(cmd: &Command<'_>) -> Vec<Outgoing> {
    let name = cmd.args.trim_start_matches('/');
    let path = if name.starts_with("0:/") {
        name.to_owned()
    } else {
        format!("{USER_DIR}{name}")
    };
    vec![
        Outgoing::host(format!("M23 {path}")),
        Outgoing::internal(NOOP),
    ]
}

fn linear_move(cmd: &Command<'_>, code: &str, session: &mut Session) -> Vec<Outgoing> {
    let position = &mut session.position;
    let emulate = position.relative && session.profile.has_quirk(Quirk::NoRelativePositioning);
    let mut words = Vec::new();
    for word in cmd.words() {
        let (Some(axis), Some(value)) = (Axis::from_letter(word.letter), word.value) else {
            words.push(format!("{}{}", word.letter, word.text));
            continue;
        };
        if position.relative {
            let target = position.offset(axis, value);
            if emulate {
                words.push(format!("{}{}", word.letter, format_coordinate(target)));
                continue;
            }
        } else {
            position.set(axis, value);
        }
        words.push(format!("{}{}", word.letter, word.text));
    }
    if !emulate {
        return vec![Outgoing::host(code)];
    }
    let mut command = cmd.mnemonic();
    for word in words {
        command.push(' ');
        command.push_str(&word);
    }
    vec![Outgoing::host(command)]
}

fn set_position(cmd: &Command<'_>, session: &mut Session) {
    let mut any = false;
    for word in cmd.words() {
        if let (Some(axis), Some(value)) = (Axis::from_letter(word.letter), word.value) {
            session.position.set(axis, value);
            any = true;
        }
    }
    if !any {
        for axis in [Axis::X, Axis::Y, Axis::Z, Axis::E] {
            session.position.set(axis, 0.0);
        }
    }
}

fn home(cmd: &Command<'_>, code: &str, session: &mut Session) -> Vec<Outgoing> {
    let axes: Vec<Axis> = cmd
        .words()
        .filter_map(|word| Axis::from_letter(word.letter))
        .filter(|axis| *axis != Axis::E)
        .collect();
    let homed = if axes.is_empty() {
        vec![Axis::X, Axis::Y, Axis::Z]
    } else {
        axes.clone()
    };
    for axis in homed {
        session.position.set(axis, 0.0);
    }
    let split = session.profile.has_quirk(Quirk::NoCombinedHoming)
        && axes.contains(&Axis::X)
        && axes.contains(&Axis::Y);
    if !split {
        return vec![Outgoing::host(code)];
    }
    let rest = cmd
        .words()
        .filter(|word| word.letter != 'X')
        .map(|word| format!("{}{}", word.letter, word.text))
        .collect::<Vec<_>>()
        .join(" ");
    vec![
        Outgoing::internal("G28 X"),
        Outgoing::host(format!("G28 {rest}")),
    ]
}
