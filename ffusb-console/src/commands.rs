use ffusb_core::DeviceLocator;
use winnow::{
    ascii::{alpha1, dec_uint, hex_uint, space0, space1},
    combinator::{alt, dispatch, empty, eof, fail, opt, preceded, separated, separated_pair},
    prelude::*,
    token::{rest, take_till},
};

pub fn version() -> String {
    const VERSION: Option<&str> = option_env!("CARGO_PKG_VERSION");
    format!("ffusb version {ver}\n", ver = VERSION.unwrap_or("???"))
}

static FULL_HELP: &str = "
Anything entered not matching one of the following commands is sent to the printer,
translated into the printer's own dialect on the way.

Multiple Gcodes can be sent on the same line by separating with ';'.

Arguments with ? are optional.

Available commands:
:help        <command?>         display this message or details for specified command
:version                        display version
:connect     <vid:pid|@bus.addr?> connect to a printer (default: first known printer found)
:disconnect                     disconnect from printer
:upload      <file> <remote?>   copy a file onto printer storage and print it
:status                         display printer model, state and position
:quit                           exit program
";

pub fn help(command: &str) -> &'static str {
    let command = command.trim().strip_prefix(':').unwrap_or(command.trim());
    match command {
        "connect" => "connect: open a printer over USB. Without arguments the first attached printer from the known model list is used. A specific device can be chosen by hexadecimal vendor and product id, like `:connect 2b71:00ff`, or by bus number and address, like `:connect @3.9`. If the printer can't be opened due to permissions, instructions to fix them are printed.\n",
        "disconnect" => "disconnect: release the printer so other programs can use it.\n",
        "upload" => "upload: copy a local G-code file onto the printer's storage and start printing it once the transfer completes. The name on the printer defaults to the local file name, a numeric suffix is added if that name is already taken. The printer must be idle.\n",
        "status" => "status: show the connected model, its firmware quirks, the state inferred from its last status poll, and the tracked head position.\n",
        _ => FULL_HELP,
    }
}

#[derive(Debug, PartialEq)]
pub enum Command<'a> {
    Gcodes(Vec<&'a str>),
    Connect(DeviceLocator),
    Disconnect,
    Upload(&'a str, Option<&'a str>),
    Status,
    Help(&'a str),
    Version,
    Quit,
    Unrecognized,
}

fn parse_gcodes<'a>(input: &mut &'a str) -> PResult<Vec<&'a str>> {
    separated(0.., take_till(1.., ';').map(str::trim), ';').parse_next(input)
}

fn device_id(input: &mut &str) -> PResult<DeviceLocator> {
    separated_pair(hex_uint, ':', hex_uint)
        .map(|(vendor_id, product_id)| DeviceLocator::Id {
            vendor_id,
            product_id,
        })
        .parse_next(input)
}

fn bus_address(input: &mut &str) -> PResult<DeviceLocator> {
    preceded('@', separated_pair(dec_uint, '.', dec_uint))
        .map(|(bus, address)| DeviceLocator::Bus { bus, address })
        .parse_next(input)
}

fn parse_locator(input: &mut &str) -> PResult<DeviceLocator> {
    preceded(
        space0,
        alt((
            bus_address,
            device_id,
            eof.map(|_| DeviceLocator::Auto),
        )),
    )
    .parse_next(input)
}

fn parse_upload<'a>(input: &mut &'a str) -> PResult<Command<'a>> {
    (
        preceded(space1, take_till(1.., [' ', '\t'])),
        opt(preceded(space1, take_till(1.., [' ', '\t']))),
    )
        .map(|(local, remote)| Command::Upload(local, remote))
        .parse_next(input)
}

fn inner_command<'a>(input: &mut &'a str) -> PResult<Command<'a>> {
    let explicit = opt(":").parse_next(input)?;
    let command = opt(dispatch! {alpha1;
        "help" => rest.map(Command::Help),
        "version" => empty.map(|_| Command::Version),
        "connect" => parse_locator.map(Command::Connect),
        "disconnect" => empty.map(|_| Command::Disconnect),
        "upload" => parse_upload,
        "status" => empty.map(|_| Command::Status),
        "quit" | "exit" => empty.map(|_| Command::Quit),
        _ => empty.map(|_| Command::Unrecognized)
    })
    .parse_next(input)?;
    match (explicit, command) {
        (None, _) => fail.parse_next(input),
        (_, None) => Ok(Command::Unrecognized),
        (_, Some(command)) => Ok(command),
    }
}

pub fn parse_command<'a>(input: &mut &'a str) -> PResult<Command<'a>> {
    alt((inner_command, parse_gcodes.map(Command::Gcodes))).parse_next(input)
}
