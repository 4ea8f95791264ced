//! Minimal G-code line model for the write path.

use winnow::{
    ascii::{dec_uint, float, space0},
    combinator::{opt, preceded, terminated},
    error::{ContextError, ErrMode},
    prelude::*,
    token::{one_of, rest, take_till},
};

/// One address word such as `X10.5` or `F3000`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Word<'a> {
    pub letter: char,
    /// Raw text after the letter
    pub text: &'a str,
    pub value: Option<f64>,
}

/// A parsed command: mnemonic plus everything after it
#[derive(Debug, Clone, PartialEq)]
pub struct Command<'a> {
    pub letter: char,
    pub number: u32,
    /// Argument text, trimmed
    pub args: &'a str,
}

impl<'a> Command<'a> {
    pub fn is(&self, letter: char, number: u32) -> bool {
        self.letter == letter && self.number == number
    }

    pub fn mnemonic(&self) -> String {
        format!("{}{}", self.letter, self.number)
    }

    pub fn words(&self) -> impl Iterator<Item = Word<'a>> + 'a {
        self.args.split_whitespace().filter_map(word)
    }

    pub fn word(&self, letter: char) -> Option<Word<'a>> {
        self.words().find(|word| word.letter == letter)
    }

    pub fn value(&self, letter: char) -> Option<f64> {
        self.word(letter).and_then(|word| word.value)
    }
}

fn word(token: &str) -> Option<Word<'_>> {
    let mut chars = token.chars();
    let letter = chars.next().filter(char::is_ascii_alphabetic)?;
    let text = chars.as_str();
    let value = float::<_, f64, ContextError>.parse(text).ok();
    Some(Word {
        letter: letter.to_ascii_uppercase(),
        text,
        value,
    })
}

fn line_number(input: &mut &str) -> PResult<u64> {
    preceded((space0, one_of(['N', 'n'])), terminated(dec_uint, space0)).parse_next(input)
}

fn command<'a>(input: &mut &'a str) -> PResult<Command<'a>> {
    let _ = opt(line_number).parse_next(input)?;
    let letter = preceded(space0, one_of(['G', 'M', 'T', 'g', 'm', 't'])).parse_next(input)?;
    let number = dec_uint.parse_next(input)?;
    // `G1X10` is legal, but `M23file` or `G1.5` is not something the printer accepts
    let args = rest.parse_next(input)?;
    if args
        .chars()
        .next()
        .is_some_and(|c| !c.is_ascii_whitespace() && !c.is_ascii_alphabetic())
    {
        return Err(ErrMode::Backtrack(ContextError::new()));
    }
    Ok(Command {
        letter: letter.to_ascii_uppercase(),
        number,
        args: args.trim(),
    })
}

fn checksummed<'a>(input: &mut &'a str) -> PResult<&'a str> {
    terminated(take_till(0.., '*'), ('*', dec_uint::<_, u8, _>, space0)).parse_next(input)
}

/// Strip comments and a trailing `*checksum`
pub fn strip(line: &str) -> &str {
    let line = line.trim_matches(|c| c == '\r' || c == '\n');
    let mut code = line;
    if let Some(idx) = code.find(';') {
        code = &code[..idx];
    }
    if let Ok(before) = checksummed.parse(code) {
        code = before;
    }
    code.trim()
}

/// Parse a cleaned line; `None` when it doesn't start with a G, M or T code
pub fn parse(line: &str) -> Option<Command<'_>> {
    command.parse(line).ok()
}

/// Format an axis value the way the printer expects rewritten coordinates
pub fn format_coordinate(value: f64) -> String {
    format!("{:.4}", round4(value))
}

pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_move() {
        let cmd = parse("G1 X10.5 Y-2 F3000").unwrap();
        assert!(cmd.is('G', 1));
        assert_eq!(cmd.value('X'), Some(10.5));
        assert_eq!(cmd.value('Y'), Some(-2.0));
        assert_eq!(cmd.value('F'), Some(3000.0));
        assert_eq!(cmd.value('Z'), None);
        assert_eq!(cmd.mnemonic(), "G1");
    }

    #[test]
    fn parse_lowercase_and_line_numbers() {
        let cmd = parse("N12 m106 s0").unwrap();
        assert!(cmd.is('M', 106));
        assert_eq!(cmd.value('S'), Some(0.0));
    }

    #[test]
    fn free_text_arguments() {
        let cmd = parse("M23 my part.gx").unwrap();
        assert!(cmd.is('M', 23));
        assert_eq!(cmd.args, "my part.gx");
        let bare = parse("G28").unwrap();
        assert_eq!(bare.args, "");
        assert_eq!(bare.words().count(), 0);
    }

    #[test]
    fn rejects_non_codes() {
        assert!(parse("hello").is_none());
        assert!(parse("").is_none());
        assert!(parse("G").is_none());
        assert!(parse("G1.5 X1").is_none());
        assert!(parse("@pause").is_none());
    }

    #[test]
    fn strip_comments_and_checksum() {
        assert_eq!(strip("G1 X1 ; move\r\n"), "G1 X1");
        assert_eq!(strip("N3 G28*97\n"), "N3 G28");
        assert_eq!(strip("; only a comment"), "");
    }

    #[test]
    fn coordinate_format() {
        assert_eq!(format_coordinate(15.5), "15.5000");
        assert_eq!(format_coordinate(0.123456), "0.1235");
        assert_eq!(format_coordinate(-1.0), "-1.0000");
    }
}
