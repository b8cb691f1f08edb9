//! One connection to the serial CAN bridge.
//!
//! A [`ConnectionSession`] owns the channel and three kinds of worker
//! thread:
//!
//! - the reader, which polls the channel, splits the byte stream into lines
//!   and runs every line through the codec and the TP2 decoder on its own,
//!   so a bad line never affects the next one;
//! - the writer, the only code that writes to the channel. Everything that
//!   wants to send (the operator, presets, repeats, synthetic signals) goes
//!   through a [`CommandSender`] into one bounded queue, so commands can
//!   never interleave on the wire;
//! - at most one transmit worker, see [`crate::transmitter`].
//!
//! Workers never call into the presentation layer. They post
//! [`SessionEvent`]s on a channel and move on.

use crate::angle_store::{AngleStore, GroupRow};
use crate::cancel::CancelToken;
use crate::emitter::{ChannelKey, Trigger};
use crate::error::SessionError;
use crate::frame_codec::{decode_line, BridgeStatus, CanFrame, CanMode, Command, Line};
use crate::tp2::{self, AngleMagnitude, AngleUpdate, GroupId};
use crate::transmitter::{self, TransmitJob};

use log::{debug, error, info, warn};
use serial2::SerialPort;

use std::{
    io,
    str,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// Default baud rate of the bridge firmware.
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Lines longer than this without a newline are line noise and dropped.
const MAX_LINE_LEN: usize = 1024;

/// How long the writer waits on its queue before looking at its token.
const WRITER_POLL: Duration = Duration::from_millis(20);

/// The byte channel underneath a session. Reads must not block forever:
/// when nothing arrives within the channel's timeout they fail with
/// [`io::ErrorKind::TimedOut`] (or `WouldBlock`), which the reader treats as
/// "no data yet". `Ok(0)` means the other side is gone.
pub trait Transport: Send + Sync + 'static {
    /// Reads whatever is available into `buf`.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    /// Writes all of `buf` or fails.
    fn write_all(&self, buf: &[u8]) -> io::Result<()>;
}

impl Transport for SerialPort {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        SerialPort::read(self, buf)
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        SerialPort::write_all(self, buf)
    }
}

/// Opens `port` with a short read timeout so the reader can poll.
pub fn open_serial(port: &str, baud_rate: u32, read_timeout: Duration) -> io::Result<SerialPort> {
    let mut serial = SerialPort::open(port, baud_rate)?;
    serial.set_read_timeout(read_timeout)?;
    Ok(serial)
}

/// Locks `mutex`, carrying on with the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Notifications for whoever presents the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A line arrived, frame or text
    Received(Line),
    /// A received frame carried a TP2 angle
    Angle(AngleUpdate),
    /// A command was written to the channel
    Sent(Command),
    /// The synthetic transmitter decided to send
    Emitted {
        /// Channel the value was sent on
        key: ChannelKey,
        /// Degrees
        value: i32,
        /// Why it was sent
        trigger: Trigger,
    },
    /// The transmit worker ended, with the error that stopped it, if any
    TransmissionStopped(Option<String>),
    /// A transport failure; the link is down afterwards
    Error(String),
}

/// Fire-and-forget delivery of [`SessionEvent`]s. A dropped receiver is
/// not an error, events are simply lost.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<SessionEvent>>,
}

impl EventSink {
    /// A sink that discards everything.
    pub fn none() -> Self {
        Self::default()
    }

    /// A sink and the receiving end of its events.
    pub fn channel() -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Posts `event`, ignoring a receiver that went away.
    pub fn notify(&self, event: SessionEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

/// Handle for queueing commands to the writer. Cheap to clone; every clone
/// rejects commands as soon as the link is down.
#[derive(Debug, Clone)]
pub struct CommandSender {
    queue: mpsc::SyncSender<Command>,
    link: Arc<AtomicBool>,
}

impl CommandSender {
    /// Queues `command`. Fails with [`SessionError::Closed`] before anything
    /// is queued if the session is disconnected.
    pub fn send(&self, command: Command) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::Closed);
        }
        self.queue.send(command)?;
        Ok(())
    }

    /// Queues a [`Command::Send`].
    pub fn send_frame(&self, frame: CanFrame) -> Result<(), SessionError> {
        self.send(Command::Send(frame))
    }

    /// Whether the link is still up.
    pub fn is_open(&self) -> bool {
        self.link.load(Ordering::SeqCst)
    }
}

/// Tunables of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Freshness window of the angle store
    pub stale_after: Duration,
    /// Capacity of the outbound command queue
    pub queue_depth: usize,
    /// Pause between reads that returned nothing
    pub poll_delay: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            stale_after: crate::angle_store::DEFAULT_STALE_AFTER,
            queue_depth: 64,
            poll_delay: Duration::from_millis(10),
        }
    }
}

struct Worker {
    cancel: CancelToken,
    handle: JoinHandle<()>,
}

impl Worker {
    fn spawn<F>(name: &str, body: F) -> Result<Self, SessionError>
    where
        F: FnOnce(CancelToken) + Send + 'static,
    {
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || body(token))?;
        Ok(Self { cancel, handle })
    }

    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    fn stop(self) -> Result<(), SessionError> {
        self.cancel.cancel();
        self.handle.join().map_err(|_| SessionError::Worker)
    }
}

/// An open connection to the bridge, with its workers and its angle store.
pub struct ConnectionSession<T: Transport> {
    transport: Option<Arc<T>>,
    store: Arc<Mutex<AngleStore>>,
    link: Arc<AtomicBool>,
    sender: CommandSender,
    events: EventSink,
    reader: Option<Worker>,
    writer: Option<Worker>,
    transmission: Option<Worker>,
}

impl ConnectionSession<SerialPort> {
    /// Opens a serial port and starts a session on it.
    pub fn open(
        port: &str,
        baud_rate: u32,
        read_timeout: Duration,
        options: SessionOptions,
        events: EventSink,
    ) -> Result<Self, SessionError> {
        let serial = open_serial(port, baud_rate, read_timeout)?;
        info!("Connected to {port} @ {baud_rate} bps");
        Self::connect(serial, options, events)
    }
}

impl<T: Transport> ConnectionSession<T> {
    /// Starts the reader and writer on `transport`, with an empty store.
    pub fn connect(transport: T, options: SessionOptions, events: EventSink) -> Result<Self, SessionError> {
        let transport = Arc::new(transport);
        let store = Arc::new(Mutex::new(AngleStore::new(options.stale_after)));
        let link = Arc::new(AtomicBool::new(true));
        let (queue, outbound) = mpsc::sync_channel(options.queue_depth);

        let reader = {
            let transport = transport.clone();
            let store = store.clone();
            let link = link.clone();
            let events = events.clone();
            Worker::spawn("canmon-reader", move |cancel| {
                read_loop(&*transport, &store, &link, &events, &cancel, options.poll_delay)
            })?
        };

        let writer = {
            let transport = transport.clone();
            let link = link.clone();
            let events = events.clone();
            Worker::spawn("canmon-writer", move |cancel| {
                write_loop(&*transport, &outbound, &link, &events, &cancel)
            })?
        };

        Ok(Self {
            transport: Some(transport),
            store,
            sender: CommandSender {
                queue,
                link: link.clone(),
            },
            link,
            events,
            reader: Some(reader),
            writer: Some(writer),
            transmission: None,
        })
    }

    /// Whether the channel is open and no transport error has occurred.
    pub fn is_connected(&self) -> bool {
        self.transport.is_some() && self.link.load(Ordering::SeqCst)
    }

    /// A handle for queueing commands from other threads.
    pub fn sender(&self) -> CommandSender {
        self.sender.clone()
    }

    /// The store, for readers that want to hold on to it.
    pub fn store(&self) -> Arc<Mutex<AngleStore>> {
        self.store.clone()
    }

    /// The current table of all groups.
    pub fn snapshot(&self) -> Vec<GroupRow> {
        lock(&self.store).snapshot(Instant::now())
    }

    /// Queues any bridge command.
    pub fn send(&self, command: Command) -> Result<(), SessionError> {
        self.sender.send(command)
    }

    /// Queues a raw frame.
    pub fn send_frame(&self, frame: CanFrame) -> Result<(), SessionError> {
        self.sender.send_frame(frame)
    }

    /// Switches the bridge between normal and loopback mode.
    pub fn set_mode(&self, mode: CanMode) -> Result<(), SessionError> {
        self.send(Command::Mode(mode))
    }

    /// Validates and sends a numeric TP2 angle.
    pub fn send_angle(
        &self,
        group: GroupId,
        magnitude: AngleMagnitude,
        value: i32,
    ) -> Result<(), SessionError> {
        let frame = tp2::angle_frame(group, magnitude, value)?;
        self.send_frame(frame)
    }

    /// Validates and sends an operator angle string such as `R-34`.
    pub fn send_angle_string(&self, group: GroupId, text: &str) -> Result<(), SessionError> {
        self.send_frame(tp2::angle_string_frame(group, text)?)
    }

    /// Whether a transmit worker is currently running.
    pub fn is_transmitting(&self) -> bool {
        self.transmission.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Starts the transmit worker. Only one may run per session.
    pub fn start_transmission(&mut self, job: TransmitJob) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::Closed);
        }
        if self.is_transmitting() {
            return Err(SessionError::TransmissionActive);
        }
        if let Some(finished) = self.transmission.take() {
            finished.stop()?;
        }

        let sender = self.sender.clone();
        let events = self.events.clone();
        let worker = Worker::spawn("canmon-transmit", move |cancel| {
            let outcome = transmitter::run(job, &sender, &events, &cancel);
            if let Err(e) = &outcome {
                warn!("Transmission stopped: {e}");
            }
            events.notify(SessionEvent::TransmissionStopped(
                outcome.err().map(|e| e.to_string()),
            ));
        })?;
        self.transmission = Some(worker);
        Ok(())
    }

    /// Stops the transmit worker, if any. Idempotent.
    pub fn stop_transmission(&mut self) -> Result<(), SessionError> {
        match self.transmission.take() {
            Some(worker) => worker.stop(),
            None => Ok(()),
        }
    }

    /// Stops every worker, closes the channel and clears the store. Calling
    /// it again is a no-op. Commands queued before the call are still
    /// written; commands sent after it are rejected.
    pub fn disconnect(&mut self) -> Result<(), SessionError> {
        let Some(transport) = self.transport.take() else {
            return Ok(());
        };

        let transmission = self.stop_transmission();
        self.link.store(false, Ordering::SeqCst);
        let reader = self.reader.take().map_or(Ok(()), Worker::stop);
        let writer = self.writer.take().map_or(Ok(()), Worker::stop);

        drop(transport);
        lock(&self.store).reset();
        info!("Disconnected");

        transmission.and(reader).and(writer)
    }
}

impl<T: Transport> Drop for ConnectionSession<T> {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            warn!("Error while closing the session: {e}");
        }
    }
}

/// Runs one received line through the codec and the TP2 decoder, applies
/// any angle to `store` and posts the events. Returns the angle, if any.
pub fn process_line(
    raw: &[u8],
    store: &Mutex<AngleStore>,
    events: &EventSink,
    now: Instant,
) -> Option<AngleUpdate> {
    let text = match str::from_utf8(raw) {
        Ok(text) => text.trim(),
        // Often happens right after connecting, when the bridge's buffer
        // still holds half a line
        Err(e) => {
            warn!("Failed to decode utf-8: {e}");
            return None;
        }
    };
    if text.is_empty() {
        return None;
    }

    let line = decode_line(text);
    let update = match &line {
        Line::Frame(frame) => tp2::try_extract(frame, now),
        Line::PlainText(text) => {
            if let Some(status) = BridgeStatus::classify(text) {
                debug!("Bridge reports {status:?}");
            }
            None
        }
    };
    events.notify(SessionEvent::Received(line));

    if let Some(update) = &update {
        debug!(
            "Group {} {} = {}",
            update.group, update.magnitude, update.value
        );
        lock(store).apply(update);
        events.notify(SessionEvent::Angle(update.clone()));
    }
    update
}

/// Reassembles newline-terminated lines from arbitrary read chunks.
///
/// A line that grows past [MAX_LINE_LEN] is dropped up to and including
/// its newline.
#[derive(Debug, Default)]
struct LineSplitter {
    line: Vec<u8>,
    discarding: bool,
}

impl LineSplitter {
    fn feed<F: FnMut(&[u8])>(&mut self, chunk: &[u8], mut on_line: F) {
        for &c in chunk {
            match c {
                b'\n' => {
                    if !self.discarding {
                        on_line(&self.line);
                    }
                    self.line.clear();
                    self.discarding = false;
                }
                _ if self.discarding => {}
                _ if self.line.len() < MAX_LINE_LEN => self.line.push(c),
                _ => {
                    warn!("Dropping a line longer than {MAX_LINE_LEN} bytes");
                    self.line.clear();
                    self.discarding = true;
                }
            }
        }
    }
}

fn read_loop<T: Transport>(
    transport: &T,
    store: &Mutex<AngleStore>,
    link: &AtomicBool,
    events: &EventSink,
    cancel: &CancelToken,
    poll_delay: Duration,
) {
    let mut buffer = [0; 256];
    let mut lines = LineSplitter::default();

    while !cancel.is_cancelled() {
        match transport.read(&mut buffer) {
            Ok(0) => {
                warn!("Channel reached end of stream");
                link.store(false, Ordering::SeqCst);
                events.notify(SessionEvent::Error("channel closed by the device".to_owned()));
                break;
            }
            Ok(read_len) => {
                lines.feed(&buffer[..read_len], |line| {
                    process_line(line, store, events, Instant::now());
                });
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                cancel.sleep(poll_delay);
            }
            Err(e) => {
                error!("Read error: {e}");
                link.store(false, Ordering::SeqCst);
                events.notify(SessionEvent::Error(format!("read error: {e}")));
                break;
            }
        }
    }
    debug!("Reader stopped");
}

fn write_loop<T: Transport>(
    transport: &T,
    outbound: &mpsc::Receiver<Command>,
    link: &AtomicBool,
    events: &EventSink,
    cancel: &CancelToken,
) {
    let write = |command: Command| -> bool {
        let line = format!("{}\n", command.encode());
        match transport.write_all(line.as_bytes()) {
            Ok(()) => {
                debug!("Sent {command}");
                events.notify(SessionEvent::Sent(command));
                true
            }
            Err(e) => {
                error!("Write error: {e}");
                link.store(false, Ordering::SeqCst);
                events.notify(SessionEvent::Error(format!("write error: {e}")));
                false
            }
        }
    };

    while !cancel.is_cancelled() {
        match outbound.recv_timeout(WRITER_POLL) {
            Ok(command) => {
                if !write(command) {
                    return;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }

    // Whatever was accepted before the link went down still goes out
    while let Ok(command) = outbound.try_recv() {
        if !write(command) {
            return;
        }
    }
    debug!("Writer stopped");
}
