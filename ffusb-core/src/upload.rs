//! Streaming a print file onto printer storage.

use std::{
    fs::File,
    io::{ErrorKind, Read},
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use tokio::task::JoinHandle;

use crate::{
    connection::Connection,
    error::{Error, Result},
    response::USER_DIR,
};

/// Commands sent before a transfer so heaters don't idle on during a long upload
pub const HEATERS_OFF: [&str; 3] = ["M104 S0 T0", "M104 S0 T1", "M140 S0"];

/// One file transfer in progress
pub struct UploadSession {
    pub remote_name: String,
    pub length: u64,
    source: Box<dyn Read + Send>,
    pub sent: u64,
    pub percent: u8,
}

impl std::fmt::Debug for UploadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSession")
            .field("remote_name", &self.remote_name)
            .field("length", &self.length)
            .field("sent", &self.sent)
            .field("percent", &self.percent)
            .finish_non_exhaustive()
    }
}

impl UploadSession {
    pub fn new(remote_name: impl Into<String>, length: u64, source: impl Read + Send + 'static) -> Self {
        Self {
            remote_name: remote_name.into(),
            length,
            source: Box::new(source),
            sent: 0,
            percent: 0,
        }
    }

    pub fn open(local: &Path, remote_name: impl Into<String>) -> Result<Self> {
        let file = File::open(local).map_err(Error::DiskRead)?;
        let length = file.metadata().map_err(Error::DiskRead)?.len();
        Ok(Self::new(remote_name, length, file))
    }

    /// Fill `buf` from the source, stopping early only at end of input
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.source.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(count) => filled += count,
                Err(e) if e.kind() == ErrorKind::Interrupted => (),
                Err(e) => return Err(Error::DiskRead(e)),
            }
        }
        Ok(filled)
    }

    fn advance(&mut self, count: usize) {
        self.sent += count as u64;
        self.percent = if self.length == 0 {
            100
        } else {
            (self.sent.min(self.length) * 100 / self.length) as u8
        };
    }
}

/// `wanted`, or `wanted` with a numeric suffix when that name is already taken
pub fn free_remote_name(wanted: &str, existing: &[String]) -> String {
    let taken = |name: &str| existing.iter().any(|file| file.eq_ignore_ascii_case(name));
    if !taken(wanted) {
        return wanted.to_owned();
    }
    let (stem, extension) = match wanted.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() => (stem, Some(extension)),
        _ => (wanted, None),
    };
    (1..)
        .map(|n| match extension {
            Some(extension) => format!("{stem}_{n}.{extension}"),
            None => format!("{stem}_{n}"),
        })
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| wanted.to_owned())
}

fn acknowledged(reply: &str, tag: &str) -> bool {
    reply.contains(&format!("CMD {tag} ")) && crate::response::ends_with_terminator(reply)
}

/// Run the transfer protocol under exclusive access
///
/// Locks and keep-alive suspension are released when this returns, before any outcome is
/// reported. `progress` runs while the transfer holds the channel.
pub fn run(
    connection: &Connection,
    upload: &mut UploadSession,
    chunk_size: usize,
    mut progress: impl FnMut(u8),
) -> Result<()> {
    let _suspension = connection.keepalive_control().suspend();
    let exclusive = connection.exclusive();
    // state only changes while decoding, which the reader lock now shuts out
    if !connection.is_ready() {
        return Err(Error::PrinterBusy);
    }

    for command in HEATERS_OFF {
        exclusive.command(command)?;
    }

    let reply = exclusive.command(&format!(
        "M28 {} {USER_DIR}{}",
        upload.length, upload.remote_name
    ))?;
    if !acknowledged(&reply, "M28") || reply.to_ascii_lowercase().contains("open failed") {
        tracing::warn!("Printer refused file creation: {}", reply.trim());
        return Err(Error::CouldNotCreateFile(upload.remote_name.clone()));
    }

    let mut buf = vec![0u8; chunk_size.max(1)];
    while upload.sent < upload.length {
        let want = (upload.length - upload.sent).min(buf.len() as u64) as usize;
        let count = upload.read_chunk(&mut buf[..want])?;
        if count == 0 {
            return Err(Error::UnexpectedEof {
                sent: upload.sent,
                total: upload.length,
            });
        }
        let written = exclusive.transfer(&buf[..count])?;
        if written != count {
            return Err(Error::TransferInterrupted {
                sent: upload.sent + written as u64,
                total: upload.length,
            });
        }
        upload.advance(count);
        progress(upload.percent);
    }

    let reply = exclusive.command("M29")?;
    if !acknowledged(&reply, "M29") || reply.to_ascii_lowercase().contains("fail") {
        tracing::warn!("Printer did not confirm saving: {}", reply.trim());
        return Err(Error::TransferIncomplete);
    }
    Ok(())
}

/// A running upload; the outcome also reaches the host through its callbacks
#[derive(Debug)]
pub struct UploadHandle {
    pub remote_name: String,
    task: JoinHandle<Result<()>>,
}

impl UploadHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn finished(self) -> Result<()> {
        self.task.await.map_err(|e| {
            tracing::error!("Upload worker failed: {e}");
            Error::UploadAborted
        })?
    }
}

/// Start uploading `local` on a blocking worker
///
/// The remote name defaults to the local file name and is made unique against the files the
/// host reports as already present.
pub fn start(
    connection: &Arc<Connection>,
    local: impl Into<PathBuf>,
    remote: Option<&str>,
) -> Result<UploadHandle> {
    if connection.is_closed() {
        return Err(Error::Disconnected);
    }
    let local = local.into();
    let wanted = match remote {
        Some(remote) => remote.to_owned(),
        None => local
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| Error::DiskRead(ErrorKind::InvalidInput.into()))?,
    };
    let remote_name = free_remote_name(&wanted, &connection.host.existing_remote_files());
    let chunk_size = connection.config().chunk_size();
    let conn = Arc::clone(connection);
    let remote = remote_name.clone();
    let task = connection.runtime.spawn_blocking(move || {
        let host = Arc::clone(&conn.host);
        let local_name = local.display().to_string();
        let started = Instant::now();
        tracing::info!("Uploading {local_name} as {remote}");
        host.upload_started(&local_name, &remote);
        let result = UploadSession::open(&local, remote.as_str()).and_then(|mut upload| {
            run(&conn, &mut upload, chunk_size, |percent| {
                host.upload_progress(&remote, percent)
            })
        });
        let elapsed = started.elapsed();
        match &result {
            Ok(()) => {
                tracing::info!("Uploaded {remote} in {elapsed:?}");
                host.upload_succeeded(&local_name, &remote, elapsed);
                host.select_file(&remote, true);
            }
            Err(e) => {
                tracing::warn!("Upload of {remote} failed: {e}");
                host.upload_failed(&local_name, &remote, e, elapsed);
            }
        }
        result
    });
    Ok(UploadHandle { remote_name, task })
}

#[cfg(test)]
mod test {
    use std::{io::Cursor, sync::Arc, time::Duration};

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        config::ConnectionConfig,
        host::HostCallbacks,
        mock::MockTransport,
        profile::{self, PrinterProfile},
        transport::{BulkTransport, Channel},
    };

    struct Shared(Arc<MockTransport>);

    impl BulkTransport for Shared {
        fn write(&self, channel: Channel, data: &[u8], timeout: Duration) -> Result<usize> {
            self.0.write(channel, data, timeout)
        }

        fn read(&self, channel: Channel, buf: &mut [u8], timeout: Duration) -> Result<usize> {
            self.0.read(channel, buf, timeout)
        }

        fn close(&self) -> Result<()> {
            self.0.close()
        }
    }

    #[derive(Default)]
    struct RecordingHost {
        events: Mutex<Vec<String>>,
        progress: Mutex<Vec<u8>>,
        existing: Vec<String>,
    }

    impl HostCallbacks for RecordingHost {
        fn on_connect(&self, _: &PrinterProfile) {}

        fn on_disconnect(&self) {}

        fn upload_started(&self, _: &str, remote: &str) {
            self.events.lock().push(format!("started {remote}"));
        }

        fn upload_succeeded(&self, _: &str, remote: &str, _: Duration) {
            self.events.lock().push(format!("succeeded {remote}"));
        }

        fn upload_failed(&self, _: &str, remote: &str, error: &Error, _: Duration) {
            self.events.lock().push(format!("failed {remote}: {error}"));
        }

        fn upload_progress(&self, _: &str, percent: u8) {
            self.progress.lock().push(percent);
        }

        fn existing_remote_files(&self) -> Vec<String> {
            self.existing.clone()
        }

        fn select_file(&self, remote: &str, print: bool) {
            self.events.lock().push(format!("select {remote} {print}"));
        }
    }

    /// Printer that acknowledges everything, with overrides for the transfer commands
    fn printer(m28: &'static str, m29: &'static str) -> Arc<MockTransport> {
        let mock = Arc::new(MockTransport::new());
        mock.respond_with(move |cmd| {
            let tag = cmd.split_whitespace().next()?.to_owned();
            Some(match tag.as_str() {
                "M28" => m28.to_owned(),
                "M29" => m29.to_owned(),
                _ => format!("CMD {tag} Received.\r\nok\r\n"),
            })
        });
        mock
    }

    const M28_OK: &str = "CMD M28 Received.\r\nWriting to file: 0:/user/part.gx\r\nok\r\n";
    const M29_OK: &str = "CMD M29 Received.\r\nDone saving file.\r\nok\r\n";

    fn connect(mock: &Arc<MockTransport>, host: Arc<RecordingHost>) -> Arc<Connection> {
        Connection::with_transport(
            Shared(Arc::clone(mock)),
            profile::lookup(profile::FLASHFORGE_VENDOR_ID, 0x00ff),
            ConnectionConfig {
                read_timeout_ms: 200,
                keepalive_tick_ms: 3_600_000,
                ..Default::default()
            },
            host,
        )
        .unwrap()
    }

    fn make_ready(connection: &Connection, mock: &MockTransport) {
        mock.reply("CMD M119 Received.\r\nMachineStatus: READY\r\nMoveMode: READY\r\nok\r\n");
        while !connection.readline().unwrap().is_empty() {}
        assert!(connection.is_ready());
        mock.clear_writes();
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn chunks_cover_payload_exactly() {
        let mock = printer(M28_OK, M29_OK);
        let connection = connect(&mock, Arc::default());
        make_ready(&connection, &mock);
        let data = payload(10_000);
        let mut upload = UploadSession::new("part.gx", 10_000, Cursor::new(data.clone()));
        let mut percents = Vec::new();
        run(&connection, &mut upload, 1024, |percent| percents.push(percent)).unwrap();

        let chunks = mock.transfer_chunks();
        assert_eq!(chunks.len(), 10);
        assert!(chunks[..9].iter().all(|chunk| chunk.len() == 1024));
        assert_eq!(chunks[9].len(), 784);
        assert_eq!(chunks.concat(), data);
        assert_eq!(percents.len(), 10);
        assert!(percents[..9].iter().all(|percent| *percent < 100));
        assert_eq!(percents.last(), Some(&100));
        assert_eq!(
            mock.commands(),
            ["M104 S0 T0", "M104 S0 T1", "M140 S0", "M28 10000 0:/user/part.gx", "M29"]
        );
    }

    #[tokio::test]
    async fn busy_printer_is_refused() {
        let mock = printer(M28_OK, M29_OK);
        let connection = connect(&mock, Arc::default());
        let mut upload = UploadSession::new("part.gx", 4, Cursor::new(vec![0; 4]));
        assert!(matches!(
            run(&connection, &mut upload, 1024, |_| ()),
            Err(Error::PrinterBusy)
        ));
        assert!(mock.commands().is_empty());
        assert!(!connection.keepalive_control().is_suspended());
    }

    #[tokio::test]
    async fn readiness_is_judged_under_exclusive_access() {
        let mock = printer(M28_OK, M29_OK);
        let connection = connect(&mock, Arc::default());
        let exclusive = connection.exclusive();
        let worker = {
            let connection = Arc::clone(&connection);
            std::thread::spawn(move || {
                let mut upload = UploadSession::new("part.gx", 4, Cursor::new(vec![0; 4]));
                run(&connection, &mut upload, 1024, |_| ())
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!worker.is_finished());
        drop(exclusive);
        assert!(matches!(worker.join().unwrap(), Err(Error::PrinterBusy)));
    }

    #[tokio::test]
    async fn open_failure() {
        let mock = printer(
            "CMD M28 Received.\r\nopen failed, File: 0:/user/part.gx.\r\nok\r\n",
            M29_OK,
        );
        let connection = connect(&mock, Arc::default());
        make_ready(&connection, &mock);
        let mut upload = UploadSession::new("part.gx", 4, Cursor::new(vec![0; 4]));
        assert!(matches!(
            run(&connection, &mut upload, 1024, |_| ()),
            Err(Error::CouldNotCreateFile(name)) if name == "part.gx"
        ));
        assert!(mock.transfer_chunks().is_empty());
    }

    #[tokio::test]
    async fn short_write_interrupts() {
        let mock = printer(M28_OK, M29_OK);
        mock.short_transfer_write(1);
        let connection = connect(&mock, Arc::default());
        make_ready(&connection, &mock);
        let mut upload = UploadSession::new("part.gx", 3000, Cursor::new(payload(3000)));
        assert!(matches!(
            run(&connection, &mut upload, 1024, |_| ()),
            Err(Error::TransferInterrupted { sent: 1536, total: 3000 })
        ));
        assert!(!mock.commands().iter().any(|cmd| cmd == "M29"));
    }

    #[tokio::test]
    async fn short_source_is_unexpected_eof() {
        let mock = printer(M28_OK, M29_OK);
        let connection = connect(&mock, Arc::default());
        make_ready(&connection, &mock);
        let mut upload = UploadSession::new("part.gx", 2000, Cursor::new(payload(1500)));
        assert!(matches!(
            run(&connection, &mut upload, 1024, |_| ()),
            Err(Error::UnexpectedEof { sent: 1500, total: 2000 })
        ));
    }

    #[tokio::test]
    async fn unconfirmed_save_is_incomplete() {
        let mock = printer(M28_OK, "CMD M29 Received.\r\nSave failed.\r\nok\r\n");
        let connection = connect(&mock, Arc::default());
        make_ready(&connection, &mock);
        let mut upload = UploadSession::new("part.gx", 10, Cursor::new(payload(10)));
        assert!(matches!(
            run(&connection, &mut upload, 1024, |_| ()),
            Err(Error::TransferIncomplete)
        ));
    }

    #[tokio::test]
    async fn failure_releases_locks_and_keepalive() {
        let mock = printer(
            "CMD M28 Received.\r\nopen failed\r\nok\r\n",
            M29_OK,
        );
        let connection = connect(&mock, Arc::default());
        make_ready(&connection, &mock);
        let mut upload = UploadSession::new("part.gx", 4, Cursor::new(vec![0; 4]));
        assert!(run(&connection, &mut upload, 1024, |_| ()).is_err());
        assert!(!connection.keepalive_control().is_suspended());
        connection.write("G28").unwrap();
        assert_eq!(mock.commands().last().map(String::as_str), Some("G28"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn worker_reports_through_callbacks() {
        let mock = printer(M28_OK, M29_OK);
        let host = Arc::new(RecordingHost {
            existing: vec!["part.gx".to_owned()],
            ..Default::default()
        });
        let connection = connect(&mock, host.clone());
        make_ready(&connection, &mock);

        let dir = std::env::temp_dir().join(format!("ffusb-upload-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let local = dir.join("part.gx");
        std::fs::write(&local, payload(2048)).unwrap();

        let handle = start(&connection, &local, None).unwrap();
        assert_eq!(handle.remote_name, "part_1.gx");
        handle.finished().await.unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(
            *host.events.lock(),
            ["started part_1.gx", "succeeded part_1.gx", "select part_1.gx true"]
        );
        assert_eq!(*host.progress.lock(), [50, 100]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_file_is_reported() {
        let mock = printer(M28_OK, M29_OK);
        let host = Arc::new(RecordingHost::default());
        let connection = connect(&mock, host.clone());
        let handle = start(&connection, "/definitely/not/here.gx", None).unwrap();
        assert!(matches!(handle.finished().await, Err(Error::DiskRead(_))));
        let events = host.events.lock();
        assert_eq!(events.len(), 2);
        assert!(events[1].starts_with("failed here.gx"));
    }

    #[test]
    fn remote_names_avoid_collisions() {
        let existing = vec!["cube.gx".to_owned(), "CUBE_1.gx".to_owned(), "notes".to_owned()];
        assert_eq!(free_remote_name("vase.gx", &existing), "vase.gx");
        assert_eq!(free_remote_name("cube.gx", &existing), "cube_2.gx");
        assert_eq!(free_remote_name("notes", &existing), "notes_1");
    }
}
