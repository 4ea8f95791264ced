//! Parsers for the text the printer sends back.
//!
//! Every command is echoed as `CMD <mnemonic> Received.`, followed by any payload lines and a
//! closing `ok`.

use winnow::{
    ascii::{dec_uint, float, space0, space1},
    combinator::{alt, opt, preceded, separated_pair, terminated},
    error::ContextError,
    prelude::*,
    stream::AsChar,
    token::{one_of, rest, take_while},
};

use crate::state::{MachineStatus, MoveMode, StatusReport};

/// Token closing every response block
pub const TERMINATOR: &str = "ok";

/// One physical line of printer output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line<'a> {
    /// `CMD M119 Received.`, carrying the mnemonic
    Echo(&'a str),
    Ok,
    Text(&'a str),
}

fn mnemonic<'a>(input: &mut &'a str) -> PResult<&'a str> {
    take_while(2.., AsChar::is_alphanum)
        .verify(|tag: &str| {
            let mut chars = tag.chars();
            chars
                .next()
                .is_some_and(|c| matches!(c.to_ascii_uppercase(), 'G' | 'M' | 'T'))
                && chars.all(|c| c.is_ascii_digit())
        })
        .parse_next(input)
}

fn echo_line<'a>(input: &mut &'a str) -> PResult<Line<'a>> {
    preceded(
        (space0, "CMD", space1),
        terminated(mnemonic, (space1, "Received", opt('.'), space0)),
    )
    .map(Line::Echo)
    .parse_next(input)
}

fn ok_line<'a>(input: &mut &'a str) -> PResult<Line<'a>> {
    (space0, TERMINATOR, space0).map(|_| Line::Ok).parse_next(input)
}

pub fn classify(line: &str) -> Line<'_> {
    alt((echo_line, ok_line))
        .parse(line)
        .unwrap_or(Line::Text(line))
}

pub fn is_terminator(line: &str) -> bool {
    matches!(classify(line), Line::Ok)
}

/// True when the last non-blank line of `text` is the terminator
pub fn ends_with_terminator(text: &str) -> bool {
    text.trim_end()
        .rsplit('\n')
        .next()
        .is_some_and(is_terminator)
}

fn status_token<'a>(input: &mut &'a str) -> PResult<&'a str> {
    take_while(1.., |c: char| c.is_ascii_alphanumeric() || c == '_').parse_next(input)
}

fn keyed_token<'a>(key: &'static str) -> impl Parser<&'a str, &'a str, ContextError> {
    preceded((space0, key, ':', space0), status_token)
}

/// Pull `MachineStatus` and `MoveMode` out of a status poll payload
pub fn status_report<'a>(lines: impl IntoIterator<Item = &'a str>) -> Option<StatusReport> {
    let mut machine = None;
    let mut move_mode = None;
    for line in lines {
        if let Ok(token) = terminated(keyed_token("MachineStatus"), rest).parse(line) {
            machine = Some(MachineStatus::from_token(token));
        } else if let Ok(token) = terminated(keyed_token("MoveMode"), rest).parse(line) {
            move_mode = Some(MoveMode::from_token(token));
        }
    }
    Some(StatusReport {
        machine: machine?,
        move_mode: move_mode.unwrap_or(MoveMode::Other),
    })
}

/// Byte counts reported by an SD progress poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdProgress {
    pub current: u64,
    pub total: u64,
}

impl SdProgress {
    pub fn is_complete(&self) -> bool {
        self.current >= self.total
    }
}

fn byte_counts(input: &mut &str) -> PResult<SdProgress> {
    separated_pair(dec_uint, '/', dec_uint)
        .map(|(current, total)| SdProgress { current, total })
        .parse_next(input)
}

/// Find a `<current>/<total>` pair anywhere in the line
pub fn sd_progress(line: &str) -> Option<SdProgress> {
    line.split_whitespace()
        .find_map(|token| byte_counts.parse(token).ok())
}

fn axis_value(input: &mut &str) -> PResult<(char, f64)> {
    separated_pair(one_of(AsChar::is_alpha), ':', preceded(space0, float)).parse_next(input)
}

/// Coordinates from a position report, `A`/`B` are the printer's extruder axes
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PositionReport {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub a: Option<f64>,
    pub b: Option<f64>,
}

pub fn position_report(line: &str) -> Option<PositionReport> {
    let mut report = PositionReport::default();
    for token in line.split_whitespace() {
        let Ok((axis, value)) = axis_value.parse(token) else {
            continue;
        };
        match axis.to_ascii_uppercase() {
            'X' => report.x = Some(value),
            'Y' => report.y = Some(value),
            'Z' => report.z = Some(value),
            'A' => report.a = Some(value),
            'B' => report.b = Some(value),
            _ => (),
        }
    }
    (report.x.is_some() && report.y.is_some() && report.z.is_some()).then_some(report)
}

/// Rename the printer's extruder axes to the names hosts expect
pub fn rename_extruders(line: &str) -> String {
    line.split(' ')
        .map(|token| {
            if let Some(value) = token.strip_prefix("A:") {
                format!("E0:{value}")
            } else if let Some(value) = token.strip_prefix("B:") {
                format!("E1:{value}")
            } else {
                token.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Value of a `Key: value` line
pub fn field<'a>(line: &'a str, key: &'static str) -> Option<&'a str> {
    let mut value = |input: &mut &'a str| -> PResult<&'a str> {
        preceded((space0, key, ':', space0), rest).parse_next(input)
    };
    value.parse(line).ok().map(str::trim)
}

/// Storage prefix the printer puts in front of every user file
pub const USER_DIR: &str = "0:/user/";

/// File names out of a directory listing payload
///
/// Entries are binary-framed, each name starting with [`USER_DIR`] and ending at the next `::`
/// separator or non-printable byte.
pub fn listing_entries(payload: &str) -> Vec<String> {
    payload
        .split(USER_DIR)
        .skip(1)
        .map(|chunk| {
            chunk
                .chars()
                .take_while(|c| !c.is_control() && *c != ':' && *c != char::REPLACEMENT_CHARACTER)
                .collect::<String>()
        })
        .map(|name| name.trim().to_owned())
        .filter(|name| !name.is_empty())
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classify_lines() {
        assert_eq!(classify("CMD M119 Received."), Line::Echo("M119"));
        assert_eq!(classify("CMD G28 Received"), Line::Echo("G28"));
        assert_eq!(classify("ok"), Line::Ok);
        assert_eq!(classify("  ok "), Line::Ok);
        assert_eq!(classify("okay"), Line::Text("okay"));
        assert_eq!(classify("CMD hello Received."), Line::Text("CMD hello Received."));
    }

    #[test]
    fn terminator_detection() {
        assert!(ends_with_terminator("CMD M105 Received.\nT0:20 /0\nok\n\n"));
        assert!(!ends_with_terminator("CMD G28 Received.\n"));
        assert!(!ends_with_terminator(""));
        assert!(!ends_with_terminator("Book"));
    }

    #[test]
    fn parse_status() {
        let lines = [
            "Endstop: X-max:1 Y-max:0 Z-min:0",
            "MachineStatus: BUILDING_FROM_SD",
            "MoveMode: PAUSED",
            "Status: S:0 L:0 J:0 F:0",
        ];
        let report = status_report(lines).unwrap();
        assert_eq!(report.machine, MachineStatus::BuildingFromSd);
        assert_eq!(report.move_mode, MoveMode::Paused);
        assert!(status_report(["Endstop: X-max:1"]).is_none());
    }

    #[test]
    fn parse_progress() {
        assert_eq!(
            sd_progress("SD printing byte 1234/5678"),
            Some(SdProgress {
                current: 1234,
                total: 5678
            })
        );
        assert!(sd_progress("Not SD printing").is_none());
        assert!(sd_progress("SD printing byte 10/10").unwrap().is_complete());
    }

    #[test]
    fn parse_position() {
        let report = position_report("X:10.5 Y:-3 Z:0.2 A:102.3 B:0").unwrap();
        assert_eq!(report.x, Some(10.5));
        assert_eq!(report.y, Some(-3.0));
        assert_eq!(report.a, Some(102.3));
        assert_eq!(report.b, Some(0.0));
        assert!(position_report("T0:210 /210").is_none());
    }

    #[test]
    fn extruder_names() {
        assert_eq!(
            rename_extruders("X:1 Y:2 Z:3 A:4.5 B:0"),
            "X:1 Y:2 Z:3 E0:4.5 E1:0"
        );
    }

    #[test]
    fn key_value_fields() {
        assert_eq!(field("Firmware: V2.1.5", "Firmware"), Some("V2.1.5"));
        assert_eq!(
            field("Machine Type: Flashforge Finder", "Machine Type"),
            Some("Flashforge Finder")
        );
        assert_eq!(field("SN: 123", "Firmware"), None);
    }

    #[test]
    fn listing() {
        let payload = "info_list.\nD\u{0}\u{0}\u{0}\u{2}::\u{fffd}\u{fffd}\u{0}\u{0}\u{0}\u{12}0:/user/cube.gx::\u{fffd}\u{fffd}\u{0}\u{0}\u{0}\u{13}0:/user/vase 2.g";
        assert_eq!(listing_entries(payload), vec!["cube.gx", "vase 2.g"]);
        assert!(listing_entries("info_list.").is_empty());
    }
}
