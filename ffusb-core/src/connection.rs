use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Mutex, MutexGuard};
use tokio::runtime::Handle;

use crate::{
    config::ConnectionConfig,
    decode::{self, LineBuffer},
    error::{Error, Result},
    gcode,
    host::HostCallbacks,
    keepalive::{self, BackgroundTask, KeepAliveControl, Polls},
    position::PositionModel,
    profile::PrinterProfile,
    session::{Mute, Session},
    state::PrinterState,
    translate::{self, Outgoing, NOOP},
    transport::{raw_read, raw_write, BulkTransport, Channel, DeviceLocator, UsbTransport},
    upload::{self, UploadHandle},
};

fn echoes(text: &str, tag: &str) -> bool {
    text.contains(&format!("CMD {tag} "))
}

/// An open printer, driven like a serial port through [`write`](Connection::write) and
/// [`readline`](Connection::readline)
///
/// Locks are always taken in the order reader, writer, session.
pub struct Connection {
    transport: Box<dyn BulkTransport>,
    reader: Mutex<LineBuffer>,
    writer: Mutex<()>,
    session: Mutex<Session>,
    control: Arc<KeepAliveControl>,
    config: ConnectionConfig,
    pub(crate) host: Arc<dyn HostCallbacks>,
    pub(crate) runtime: Handle,
    closed: AtomicBool,
    keepalive: Mutex<Option<BackgroundTask>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("profile", &self.profile())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Open an attached printer over USB
    ///
    /// Must be called from within a tokio runtime, which will run the keep-alive task.
    #[tracing::instrument(level = "debug", skip(config, host))]
    pub fn open(
        locator: DeviceLocator,
        config: ConnectionConfig,
        host: Arc<dyn HostCallbacks>,
    ) -> Result<Arc<Self>> {
        Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let (transport, profile) = UsbTransport::open(locator)?;
        Self::with_transport(transport, profile, config, host)
    }

    /// Drive an already opened transport
    pub fn with_transport(
        transport: impl BulkTransport + 'static,
        profile: PrinterProfile,
        config: ConnectionConfig,
        host: Arc<dyn HostCallbacks>,
    ) -> Result<Arc<Self>> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let connection = Arc::new(Self {
            transport: Box::new(transport),
            reader: Mutex::new(LineBuffer::default()),
            writer: Mutex::new(()),
            session: Mutex::new(Session::new(profile, &config)),
            control: Arc::new(KeepAliveControl::default()),
            config,
            host,
            runtime,
            closed: AtomicBool::new(false),
            keepalive: Mutex::new(None),
        });
        let task = keepalive::spawn(
            &connection.runtime,
            Arc::downgrade(&connection),
            connection.config.keepalive_tick(),
            connection.config.status_poll_ticks,
        );
        *connection.keepalive.lock() = Some(task);
        tracing::info!("Connected to {profile}, quirks: [{}]", profile.quirks);
        connection.host.on_connect(&profile);
        Ok(connection)
    }

    /// Translate and send one host line
    ///
    /// Writes on a closed connection are dropped.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn write(&self, line: &str) -> Result<()> {
        if self.is_closed() {
            tracing::debug!("Dropping write on closed connection");
            return Ok(());
        }
        let _writer = self.writer.lock();
        let outgoing = translate::translate(line, &mut self.session.lock());
        self.control.note_activity();
        for out in &outgoing {
            self.send(out)?;
        }
        Ok(())
    }

    /// Caller holds the writer lock
    ///
    /// The mute is registered before writing since the reply may be decoded before this returns.
    fn send(&self, out: &Outgoing) -> Result<()> {
        let tag = out.tag();
        let write_timeout = {
            let mut session = self.session.lock();
            match (out.mute, &tag) {
                (Some(mute), Some(tag)) => session.mutes.push(tag.as_str(), mute),
                (None, tag) => session.pending = tag.clone(),
                (Some(_), None) => (),
            }
            session.write_timeout
        };
        tracing::debug!("Sending `{}`", out.command);
        if let Err(e) = raw_write(&*self.transport, Channel::Command, &out.frame(), write_timeout) {
            let mut session = self.session.lock();
            match (out.mute, tag) {
                (Some(_), Some(tag)) => {
                    session.mutes.cancel(&tag);
                }
                (None, _) => session.pending = None,
                (Some(_), None) => (),
            }
            return Err(e);
        }
        Ok(())
    }

    /// Next host-visible line, empty when the printer had nothing to say within the read timeout
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn readline(&self) -> Result<String> {
        let mut buffer = self.reader.lock();
        if let Some(line) = buffer.pop() {
            return Ok(line);
        }
        if self.is_closed() {
            return Err(Error::Disconnected);
        }
        let read_timeout = self.session.lock().read_timeout;
        let raw = raw_read(&*self.transport, Channel::Command, read_timeout, |text| {
            self.session
                .lock()
                .pending
                .as_deref()
                .map_or(true, |tag| echoes(text, tag))
        })?;
        let lines = {
            let mut session = self.session.lock();
            let lines = decode::decode(&raw, &mut session);
            // only one read waits on a given command
            session.pending = None;
            lines
        };
        for line in &lines {
            tracing::trace!("Host line `{line}`");
        }
        buffer.extend(lines);
        Ok(buffer.pop().unwrap_or_default())
    }

    /// Release the device and notify the host, later calls do nothing
    ///
    /// A failure to release is returned, but the host is notified regardless.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        drop(self.keepalive.lock().take());
        let result = self.transport.close();
        if let Err(e) = &result {
            tracing::warn!("Error while closing printer: {e}");
        }
        tracing::info!("Disconnected from {}", self.profile());
        self.host.on_disconnect();
        result
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn read_timeout(&self) -> Duration {
        self.session.lock().read_timeout
    }

    pub fn set_read_timeout(&self, timeout: Duration) {
        self.session.lock().read_timeout = timeout;
    }

    pub fn write_timeout(&self) -> Duration {
        self.session.lock().write_timeout
    }

    pub fn set_write_timeout(&self, timeout: Duration) {
        self.session.lock().write_timeout = timeout;
    }

    pub fn profile(&self) -> PrinterProfile {
        self.session.lock().profile
    }

    pub fn state(&self) -> PrinterState {
        self.session.lock().state.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    pub fn is_printing(&self) -> bool {
        self.state().is_printing()
    }

    pub fn position(&self) -> PositionModel {
        self.session.lock().position
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Take both the reader and writer locks, shutting out host and keep-alive traffic
    pub fn exclusive(&self) -> Exclusive<'_> {
        let reader = self.reader.lock();
        let writer = self.writer.lock();
        tracing::debug!("Entered exclusive access");
        Exclusive {
            connection: self,
            _reader: reader,
            _writer: writer,
        }
    }

    /// Copy a local file onto printer storage and start printing it, see [`upload::start`]
    pub fn upload_to_sd(
        self: &Arc<Self>,
        local: impl Into<PathBuf>,
        remote: Option<&str>,
    ) -> Result<UploadHandle> {
        upload::start(self, local, remote)
    }

    pub(crate) fn keepalive_control(&self) -> &Arc<KeepAliveControl> {
        &self.control
    }

    pub(crate) fn temperature_report_ticks(&self) -> u32 {
        let secs = self.session.lock().state.report_interval();
        self.config.ticks_for_secs(secs)
    }

    /// Issue the polls due on a keep-alive tick
    pub(crate) fn keepalive_poll(&self, polls: Polls) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Disconnected);
        }
        let _writer = self.writer.lock();
        if self.control.is_suspended() {
            return Ok(());
        }
        if polls.status {
            self.send(&Outgoing::internal(NOOP))?;
        }
        if polls.temperature {
            self.send(&Outgoing {
                command: "M105".to_owned(),
                mute: Some(Mute::Echo),
            })?;
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.is_closed() {
            let _ = self.close();
        }
    }
}

/// Sole access to the command channel, released on drop
pub struct Exclusive<'a> {
    connection: &'a Connection,
    _reader: MutexGuard<'a, LineBuffer>,
    _writer: MutexGuard<'a, ()>,
}

impl Exclusive<'_> {
    /// Send a raw command and collect its response block, bypassing translation
    pub fn command(&self, command: &str) -> Result<String> {
        let tag = gcode::parse(command).map(|cmd| cmd.mnemonic());
        let (read_timeout, write_timeout) = {
            let session = self.connection.session.lock();
            (session.read_timeout, session.write_timeout)
        };
        tracing::debug!("Sending `{command}` exclusively");
        raw_write(
            &*self.connection.transport,
            Channel::Command,
            &translate::frame(command),
            write_timeout,
        )?;
        let reply = raw_read(
            &*self.connection.transport,
            Channel::Command,
            read_timeout,
            |text| tag.as_deref().map_or(true, |tag| echoes(text, tag)),
        )?;
        self.consume_strays(&reply, tag.as_deref());
        Ok(reply)
    }

    /// Internal poll replies swallowed here must not mute later host replies
    fn consume_strays(&self, reply: &str, own: Option<&str>) {
        let mut session = self.connection.session.lock();
        for block in decode::split_blocks(reply) {
            match block.tag.as_deref() {
                Some(tag) if Some(tag) != own => {
                    session.mutes.take(tag);
                }
                _ => (),
            }
        }
    }

    /// Write one chunk to the transfer endpoint, returning how much was accepted
    pub fn transfer(&self, data: &[u8]) -> Result<usize> {
        let write_timeout = self.connection.session.lock().write_timeout;
        raw_write(
            &*self.connection.transport,
            Channel::Transfer,
            data,
            write_timeout,
        )
    }
}

impl Drop for Exclusive<'_> {
    fn drop(&mut self) {
        tracing::debug!("Left exclusive access");
    }
}
