//! # ffusb
//!  A shell to talk to FlashForge printers attached over USB, as if they were serial G-code devices
//!

mod commands;
mod config;
mod host;

use std::sync::Arc;

use ffusb_core::{
    decode::{BEGIN_LISTING, END_LISTING},
    Connection, ConnectionConfig, DeviceLocator,
};
use futures_util::AsyncWriteExt;
use rustyline_async::{Readline, ReadlineEvent, SharedWriter};
use tokio::{
    sync::mpsc::{self, UnboundedSender},
    task::JoinHandle,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use winnow::Parser;

use commands::Command;
use host::{ConsoleEvent, ConsoleHost};

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error("Printer error: {0}")]
    Printer(#[from] ffusb_core::Error),
    #[error("Console error: {0}")]
    Readline(#[from] rustyline_async::ReadlineError),
    #[error("Can't write to console")]
    Writer(#[from] futures_util::io::Error),
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

fn prompt_string(printer: Option<&Connection>) -> String {
    let status = match printer {
        Some(printer) => format!("{}|{}", printer.profile().name, printer.state()),
        None => "Disconnected".to_owned(),
    };
    format!("[{status}]> ")
}

fn setup_logging(writer: SharedWriter) {
    if let Ok(env_log) = tracing_subscriber::EnvFilter::builder()
        .with_env_var("FFUSB_LOG")
        .try_from_env()
    {
        let write_layer = tracing_subscriber::fmt::layer().with_writer(move || writer.clone());
        let format_layer = tracing_subscriber::fmt::layer().without_time().compact();
        let logger = tracing_subscriber::registry()
            .with(env_log)
            .with(write_layer)
            .with(format_layer);

        logger.init();
    }
}

/// Pump printer output into `lines` until the connection closes
fn start_reader(printer: Arc<Connection>, lines: UnboundedSender<String>) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || loop {
        match printer.readline() {
            Ok(line) if line.is_empty() => continue,
            Ok(line) => {
                if lines.send(line).is_err() {
                    break;
                }
            }
            Err(ffusb_core::Error::Disconnected) => break,
            Err(e) => {
                tracing::warn!("Reading from printer failed: {e}");
                break;
            }
        }
    })
}

async fn send_lines(printer: &Arc<Connection>, lines: Vec<String>) -> Result<(), AppError> {
    let printer = Arc::clone(printer);
    tokio::task::spawn_blocking(move || {
        lines
            .iter()
            .try_for_each(|line| printer.write(line))
    })
    .await??;
    Ok(())
}

async fn connect(
    locator: DeviceLocator,
    config: ConnectionConfig,
    host: Arc<ConsoleHost>,
) -> Result<Arc<Connection>, AppError> {
    let printer =
        tokio::task::spawn_blocking(move || Connection::open(locator, config, host)).await??;
    // take control of the front panel, then learn what is already on storage
    send_lines(&printer, vec!["M110 N0".to_owned(), "M20".to_owned()]).await?;
    Ok(printer)
}

fn status_report(printer: &Connection) -> String {
    let profile = printer.profile();
    let position = printer.position();
    format!(
        "{name} ({vendor:04x}:{product:04x})\nquirks: [{quirks}]\nstate: {state}\nposition: X:{x:.2} Y:{y:.2} Z:{z:.2} E{tool}:{e:.2}{mode}\n",
        name = profile.name,
        vendor = profile.vendor_id,
        product = profile.product_id,
        quirks = profile.quirks,
        state = printer.state(),
        x = position.x,
        y = position.y,
        z = position.z,
        tool = position.extruder,
        e = position.e.get(position.extruder).copied().unwrap_or_default(),
        mode = if position.relative { " (relative)" } else { "" },
    )
}

/// Collects the names between the listing markers in printer output
#[derive(Debug, Default)]
struct ListingTracker(Option<Vec<String>>);

impl ListingTracker {
    /// Returns the complete listing once its end marker is seen
    fn observe(&mut self, line: &str) -> Option<Vec<String>> {
        match line {
            BEGIN_LISTING => {
                self.0 = Some(Vec::new());
                None
            }
            END_LISTING => self.0.take(),
            name => {
                if let Some(ref mut files) = self.0 {
                    files.push(name.to_owned());
                }
                None
            }
        }
    }
}

fn describe_event(event: &ConsoleEvent) -> Option<String> {
    let message = match event {
        ConsoleEvent::Connected(name) => format!("Connected to {name}\n"),
        ConsoleEvent::Disconnected => "Printer disconnected\n".to_owned(),
        ConsoleEvent::UploadStarted { local, remote } => {
            format!("Uploading {local} as {remote}\n")
        }
        ConsoleEvent::UploadProgress { remote, percent } => format!("{remote}: {percent}%\n"),
        ConsoleEvent::UploadSucceeded { remote, elapsed } => {
            format!("Uploaded {remote} in {:.1}s\n", elapsed.as_secs_f32())
        }
        ConsoleEvent::UploadFailed {
            remote,
            error,
            elapsed,
        } => format!(
            "Upload of {remote} failed after {:.1}s: {error}\n",
            elapsed.as_secs_f32()
        ),
        ConsoleEvent::SelectFile { .. } => return None,
    };
    Some(message)
}

fn disconnect(printer: &mut Option<Arc<Connection>>, reader: &mut Option<JoinHandle<()>>) {
    if let Some(printer) = printer.take() {
        if let Err(e) = printer.close() {
            tracing::warn!("Error while closing printer: {e}");
        }
    }
    // reader exits on its own once the connection reports closed
    reader.take();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), AppError> {
    let (mut readline, mut writer) = Readline::new(prompt_string(None))?;

    writer.write_all(commands::version().as_bytes()).await?;
    writer
        .write_all(b"\ntype `:help` for a list of commands\n")
        .await?;
    setup_logging(writer.clone());

    let config = config::load().unwrap_or_else(|e| {
        tracing::warn!("Using default settings: {e}");
        ConnectionConfig::default()
    });

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let host = Arc::new(ConsoleHost::new(events_tx));
    let (lines_tx, mut lines) = mpsc::unbounded_channel::<String>();

    let mut printer: Option<Arc<Connection>> = None;
    let mut reader: Option<JoinHandle<()>> = None;
    let mut listing = ListingTracker::default();

    loop {
        tokio::select! {
            Some(line) = lines.recv() => {
                if let Some(files) = listing.observe(&line) {
                    host.set_files(files);
                }
                writer.write_all(format!("{line}\n").as_bytes()).await?;
            },
            Some(event) = events.recv() => {
                if let Some(message) = describe_event(&event) {
                    writer.write_all(message.as_bytes()).await?;
                }
                if let ConsoleEvent::SelectFile { remote, print } = event {
                    if let Some(ref printer) = printer {
                        let mut select = vec![format!("M23 {remote}")];
                        if print {
                            select.push("M24".to_owned());
                        }
                        if let Err(e) = send_lines(printer, select).await {
                            writer.write_all(format!("Error: {e}\n").as_bytes()).await?;
                        }
                    }
                }
            },
            Ok(event) = readline.readline() => {
                let line = match event {
                    ReadlineEvent::Line(line) => line,
                    _ => {
                        disconnect(&mut printer, &mut reader);
                        readline.flush()?;
                        return Ok(());
                    }
                };
                let command = match commands::parse_command.parse(&line) {
                    Ok(command) => command,
                    Err(_e) => {
                        writer.write_all(b"invalid command!\n").await?;
                        continue;
                    }
                };
                match command {
                    Command::Gcodes(gcodes) => match printer {
                        Some(ref connected) => {
                            let gcodes = gcodes.into_iter().map(str::to_owned).collect();
                            if let Err(e) = send_lines(connected, gcodes).await {
                                writer.write_all(format!("Error: {e}\n").as_bytes()).await?;
                            }
                        }
                        None => {
                            writer
                                .write_all(b"No printer connected! Use ':help connect' for help connecting.\n")
                                .await?;
                        }
                    },
                    Command::Connect(locator) => {
                        disconnect(&mut printer, &mut reader);
                        match connect(locator, config.clone(), Arc::clone(&host)).await {
                            Ok(connected) => {
                                reader = Some(start_reader(Arc::clone(&connected), lines_tx.clone()));
                                printer = Some(connected);
                            }
                            Err(e) => {
                                writer.write_all(format!("Error: {e}\n").as_bytes()).await?;
                            }
                        }
                    }
                    Command::Disconnect => disconnect(&mut printer, &mut reader),
                    Command::Upload(local, remote) => match printer {
                        Some(ref connected) => {
                            if let Err(e) = connected.upload_to_sd(local, remote) {
                                writer.write_all(format!("Error: {e}\n").as_bytes()).await?;
                            }
                        }
                        None => writer.write_all(b"No printer connected!\n").await?,
                    },
                    Command::Status => {
                        let status = match printer {
                            Some(ref connected) => status_report(connected),
                            None => "Disconnected\n".to_owned(),
                        };
                        writer.write_all(status.as_bytes()).await?;
                    }
                    Command::Help(subcommand) => {
                        writer.write_all(commands::help(subcommand).as_bytes()).await?;
                    }
                    Command::Version => {
                        writer.write_all(commands::version().as_bytes()).await?;
                    }
                    Command::Quit => {
                        disconnect(&mut printer, &mut reader);
                        readline.flush()?;
                        return Ok(());
                    }
                    Command::Unrecognized => {
                        writer.write_all(b"Unrecognized command, try `:help`\n").await?;
                    }
                }
                readline.add_history_entry(line);
            },
        }
        readline.update_prompt(&prompt_string(printer.as_deref()))?;
    }
}
