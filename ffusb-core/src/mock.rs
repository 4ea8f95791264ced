//! In-memory printer for exercising the engine without hardware.

use std::{collections::VecDeque, time::Duration};

use parking_lot::Mutex;

use crate::{
    error::{Error, Result},
    transport::{BulkTransport, Channel},
};

type Responder = Box<dyn FnMut(&str) -> Option<String> + Send>;

#[derive(Default)]
struct MockState {
    replies: VecDeque<Vec<u8>>,
    writes: Vec<(Channel, Vec<u8>)>,
    responder: Option<Responder>,
    short_transfer_write: Option<usize>,
    transfer_writes: usize,
    closed: bool,
    close_error: Option<rusb::Error>,
    write_error: Option<rusb::Error>,
}

/// Scripted device: queued replies are handed out in order, writes are recorded
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue output for a later read
    pub fn reply(&self, text: &str) {
        self.state.lock().replies.push_back(text.as_bytes().to_vec());
    }

    /// Answer every framed command with whatever `responder` returns
    pub fn respond_with(&self, responder: impl FnMut(&str) -> Option<String> + Send + 'static) {
        self.state.lock().responder = Some(Box::new(responder));
    }

    /// Accept only half of the `index`th transfer chunk
    pub fn short_transfer_write(&self, index: usize) {
        self.state.lock().short_transfer_write = Some(index);
    }

    /// Fail the next write of any kind with `error`
    pub fn fail_next_write(&self, error: rusb::Error) {
        self.state.lock().write_error = Some(error);
    }

    pub fn fail_close(&self, error: rusb::Error) {
        self.state.lock().close_error = Some(error);
    }

    /// Commands written to the command endpoint, framing removed
    pub fn commands(&self) -> Vec<String> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|(channel, _)| *channel == Channel::Command)
            .map(|(_, data)| unframe(data))
            .collect()
    }

    /// Every transfer-channel write, in order
    pub fn transfer_chunks(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|(channel, _)| *channel == Channel::Transfer)
            .map(|(_, data)| data.clone())
            .collect()
    }

    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

fn unframe(data: &[u8]) -> String {
    let text = String::from_utf8_lossy(data);
    text.trim_start_matches('~').trim_end().to_owned()
}

impl BulkTransport for MockTransport {
    fn write(&self, channel: Channel, data: &[u8], _timeout: Duration) -> Result<usize> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Disconnected);
        }
        if let Some(error) = state.write_error.take() {
            return Err(error.into());
        }
        let mut accepted = data.len();
        if channel == Channel::Transfer {
            if state.short_transfer_write == Some(state.transfer_writes) {
                accepted /= 2;
            }
            state.transfer_writes += 1;
        }
        state.writes.push((channel, data[..accepted].to_vec()));
        if channel == Channel::Command {
            let command = unframe(data);
            let reply = state.responder.as_mut().and_then(|respond| respond(&command));
            if let Some(reply) = reply {
                state.replies.push_back(reply.into_bytes());
            }
        }
        Ok(accepted)
    }

    fn read(&self, _channel: Channel, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Disconnected);
        }
        let Some(mut chunk) = state.replies.pop_front() else {
            drop(state);
            std::thread::sleep(Duration::from_millis(1));
            return Ok(0);
        };
        let count = chunk.len().min(buf.len());
        buf[..count].copy_from_slice(&chunk[..count]);
        if count < chunk.len() {
            state.replies.push_front(chunk.split_off(count));
        }
        Ok(count)
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.closed = true;
        match state.close_error.take() {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }
}
