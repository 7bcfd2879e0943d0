//! Host-side streaming driver for Marlin/Sprinter/Repetier-family 3D
//! printer firmwares.
//!
//! A [`Printer`] keeps the firmware's command buffer fed over a serial
//! link: outgoing print lines are numbered and checksummed, pacing follows
//! the firmware's one-in-flight `ok` handshake, lost lines are replayed
//! from the resend history, and a priority queue lets a supervisor slip
//! unnumbered commands (status polls, jogs, emergency stops) between the
//! numbered stream without disturbing it.

use std::{sync::Arc, time::Duration};

mod observer;
mod receiver;
mod response;
mod state;

pub use observer::{NullObserver, Observer};

use bytes::{Bytes, BytesMut};
use state::{Action, Shared};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{broadcast, mpsc},
    task::{AbortHandle, JoinHandle},
};
use tokio_serial::{SerialPort, SerialPortBuilderExt};

/// All lines the firmware sends, for ancillary consumers.
pub type PrinterLines = broadcast::Receiver<Bytes>;

/// Read timeout configured on freshly opened serial ports.
const SERIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// How long `pause` waits for the sender to notice and wind down.
const PAUSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no printer connected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),
}

#[derive(Debug)]
struct Connection {
    outgoing: mpsc::Sender<Bytes>,
    lines: broadcast::Sender<Bytes>,
    link_abort: AbortHandle,
    receive_task: JoinHandle<()>,
    print_task: Option<JoinHandle<()>>,
}

/// One printer session: owns the transport tasks and the shared protocol
/// state, and hands out the supervisor-facing contract (`connect`,
/// `start_print`, `pause`/`resume`, `send`, `send_now`, `disconnect`).
pub struct Printer {
    shared: Arc<Shared>,
    observer: Arc<dyn Observer>,
    connection: Option<Connection>,
}

impl std::fmt::Debug for Printer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Printer")
            .field("connected", &self.is_connected())
            .field("online", &self.is_online())
            .field("printing", &self.is_printing())
            .finish_non_exhaustive()
    }
}

impl Default for Printer {
    fn default() -> Self {
        Self::new()
    }
}

impl Printer {
    /// New idle session with no observer attached.
    pub fn new() -> Self {
        Self::with_observer(NullObserver)
    }

    /// New idle session whose protocol events fan out to `observer`.
    pub fn with_observer(observer: impl Observer + 'static) -> Self {
        Self {
            shared: Arc::new(Shared::new()),
            observer: Arc::new(observer),
            connection: None,
        }
    }

    /// Attach `transport` and start listening for firmware responses.
    ///
    /// Any previous link is torn down first. The session stays offline
    /// until the firmware answers the greeting or volunteers a `start`.
    pub fn connect<T>(&mut self, transport: T)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.disconnect();
        let (outgoing, outgoing_rx) = mpsc::channel::<Bytes>(8);
        let (lines, lines_rx) = broadcast::channel(64);
        let link = tokio::spawn(link_task(transport, outgoing_rx, lines.clone()));
        let link_abort = link.abort_handle();
        self.shared.with_state(|st| st.connected = true);
        let receive_task = tokio::spawn(receiver::receive_task(
            Arc::clone(&self.shared),
            Arc::clone(&self.observer),
            lines_rx,
            outgoing.clone(),
            link,
        ));
        self.connection = Some(Connection {
            outgoing,
            lines,
            link_abort,
            receive_task,
            print_task: None,
        });
        tracing::info!("printer link up");
    }

    /// Open `port` at `baud` and connect over it.
    pub fn connect_serial(&mut self, port: &str, baud: u32) -> Result<(), Error> {
        let mut serial = tokio_serial::new(port, baud)
            .timeout(SERIAL_TIMEOUT)
            .open_native_async()?;
        serial.write_data_terminal_ready(true)?;
        self.connect(serial);
        Ok(())
    }

    /// Drop the link. Safe to call when already disconnected; running loops
    /// observe the loss and wind down on their own.
    pub fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.link_abort.abort();
            tracing::info!("printer link down");
        }
        self.shared.mark_disconnected();
    }

    /// Begin streaming `lines` as a numbered, checksummed print.
    ///
    /// Replaces the whole main queue, resets line numbering on both ends,
    /// and spawns the sender. Returns `false` when already printing,
    /// offline, or disconnected. An empty job still resets the firmware's
    /// line counter and reports success, but spawns no sender.
    pub async fn start_print(&mut self, lines: Vec<String>) -> bool {
        let Some(connection) = &mut self.connection else {
            return false;
        };
        let empty = lines.is_empty();
        let accepted = self.shared.with_state(|st| {
            if st.printing || !st.online || !st.connected {
                return false;
            }
            st.printing = true;
            st.main_queue = lines;
            st.line_no = 0;
            st.queue_index = 0;
            st.resend_from = None;
            true
        });
        if !accepted {
            return false;
        }
        let reset = self
            .shared
            .with_state(|st| st.formatter.sequenced(-1, state::LINE_RESET));
        if transmit(&self.shared, &self.observer, &connection.outgoing, reset)
            .await
            .is_err()
        {
            return false;
        }
        if empty {
            return true;
        }
        self.shared.with_state(|st| st.clear_to_send = false);
        connection.print_task = Some(tokio::spawn(print_task(
            Arc::clone(&self.shared),
            Arc::clone(&self.observer),
            connection.outgoing.clone(),
        )));
        true
    }

    /// Stop the sender after its current line, holding position.
    ///
    /// Waits up to a second for the sender to notice; queue index and line
    /// number stay where they are so [`resume`](Self::resume) continues
    /// mid-print.
    pub async fn pause(&mut self) {
        self.shared.with_state(|st| st.printing = false);
        self.shared.notify();
        if let Some(connection) = &mut self.connection {
            if let Some(print) = connection.print_task.take() {
                let _ = tokio::time::timeout(PAUSE_GRACE, print).await;
            }
        }
    }

    /// Restart the sender from the stored queue position. No-op when
    /// disconnected or when a sender is already running.
    pub fn resume(&mut self) {
        let Some(connection) = &mut self.connection else {
            return;
        };
        if let Some(print) = &connection.print_task {
            if !print.is_finished() {
                return;
            }
        }
        self.shared.with_state(|st| st.printing = true);
        self.shared.notify();
        connection.print_task = Some(tokio::spawn(print_task(
            Arc::clone(&self.shared),
            Arc::clone(&self.observer),
            connection.outgoing.clone(),
        )));
    }

    /// Queue `command` at the back of the running print, or — when idle —
    /// transmit it numbered and checksummed once the firmware is ready.
    ///
    /// The print queue is unbounded: a supervisor feeding it faster than
    /// the firmware drains it trades memory for the difference.
    pub async fn send(&self, command: &str) -> Result<(), Error> {
        let queued = self.shared.with_state(|st| {
            if st.printing {
                st.main_queue.push(command.to_owned());
                true
            } else {
                false
            }
        });
        if queued {
            return Ok(());
        }
        let outgoing = self.outgoing()?;
        if !self.shared.acquire_idle_slot().await {
            return Err(Error::Disconnected);
        }
        let wire = self.shared.with_state(|st| st.encode_sequenced(command));
        transmit(&self.shared, &self.observer, &outgoing, wire).await
    }

    /// Send `command` ahead of the print, unnumbered and unchecksummed.
    ///
    /// During a print it joins the priority queue and goes out between
    /// numbered lines; when idle it goes out as soon as the firmware is
    /// ready for one more line.
    pub async fn send_now(&self, command: &str) -> Result<(), Error> {
        let queued = self.shared.with_state(|st| {
            if st.printing {
                st.pri_queue.push_back(command.to_owned());
                true
            } else {
                false
            }
        });
        if queued {
            return Ok(());
        }
        let outgoing = self.outgoing()?;
        if !self.shared.acquire_idle_slot().await {
            return Err(Error::Disconnected);
        }
        let wire = self.shared.with_state(|st| st.formatter.raw(command));
        transmit(&self.shared, &self.observer, &outgoing, wire).await
    }

    pub fn is_connected(&self) -> bool {
        self.shared.with_state(|st| st.connected)
    }

    pub fn is_online(&self) -> bool {
        self.shared.with_state(|st| st.online)
    }

    pub fn is_printing(&self) -> bool {
        self.shared.with_state(|st| st.printing)
    }

    /// Lines of the active print already handed to the firmware, and the
    /// total queued.
    pub fn progress(&self) -> (usize, usize) {
        self.shared
            .with_state(|st| (st.queue_index, st.main_queue.len()))
    }

    /// Snapshot of every line received, oldest first. Grows for the life
    /// of the session.
    pub fn received_lines(&self) -> Vec<String> {
        self.shared.with_state(|st| st.received.clone())
    }

    /// Snapshot of every line transmitted, as formatted for the wire.
    /// Grows for the life of the session.
    pub fn sent_lines(&self) -> Vec<String> {
        self.shared.with_state(|st| st.sent.clone())
    }

    /// Subscribe to raw firmware lines, independent of the observer.
    pub fn subscribe_lines(&self) -> Result<PrinterLines, Error> {
        self.connection
            .as_ref()
            .map(|connection| connection.lines.subscribe())
            .ok_or(Error::Disconnected)
    }

    fn outgoing(&self) -> Result<mpsc::Sender<Bytes>, Error> {
        self.connection
            .as_ref()
            .map(|connection| connection.outgoing.clone())
            .ok_or(Error::Disconnected)
    }
}

impl Drop for Printer {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.link_abort.abort();
            connection.receive_task.abort();
            if let Some(print) = connection.print_task {
                print.abort();
            }
        }
    }
}

/// Owns the transport: multiplexes queued writes against buffered reads,
/// fanning complete lines out on the broadcast channel. Ends with the
/// transport.
async fn link_task<T>(
    mut transport: T,
    mut outgoing: mpsc::Receiver<Bytes>,
    lines: broadcast::Sender<Bytes>,
) -> Result<(), Error>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        tokio::select! {
            queued = outgoing.recv() => match queued {
                Some(line) => {
                    transport.write_all(&line).await?;
                    transport.flush().await?;
                }
                None => break,
            },
            read = transport.read_buf(&mut buf) => match read {
                Ok(0) => break,
                Ok(_) => {
                    while let Some(end) = buf.iter().position(|b| *b == b'\n') {
                        let line = buf.split_to(end + 1).freeze();
                        let _ = lines.send(line); // no subscribers is fine
                    }
                }
                Err(error) => {
                    tracing::warn!("printer transport failed: {error}");
                    return Err(error.into());
                }
            },
        }
    }
    Ok(())
}

/// One print run: fills each acquired send slot with a resend, a priority
/// command, or the next numbered line, until the queue drains or the run
/// is stopped.
async fn print_task(
    shared: Arc<Shared>,
    observer: Arc<dyn Observer>,
    outgoing: mpsc::Sender<Bytes>,
) {
    observer.on_start();
    loop {
        if !shared.acquire_print_slot().await {
            break;
        }
        match shared.next_action() {
            Action::Resend(line) | Action::Priority(line) | Action::Sequenced(line) => {
                if transmit(&shared, &observer, &outgoing, line).await.is_err() {
                    break;
                }
            }
            Action::Skip => continue,
            Action::MissingHistory(line_no) => {
                tracing::warn!("resend of line {line_no} requested but never sent");
                observer.on_error(&format!("resend requested for unknown line {line_no}"));
            }
            Action::Finished(reset) => {
                let _ = transmit(&shared, &observer, &outgoing, reset).await;
                break;
            }
        }
    }
    observer.on_end();
}

/// Record and announce `wire`, then hand it to the link. Failure means the
/// link is gone.
pub(crate) async fn transmit(
    shared: &Shared,
    observer: &Arc<dyn Observer>,
    outgoing: &mpsc::Sender<Bytes>,
    wire: Bytes,
) -> Result<(), Error> {
    let shown = String::from_utf8_lossy(&wire)
        .trim_end_matches(['\r', '\n'])
        .to_string();
    shared.with_state(|st| st.sent.push(shown.clone()));
    tracing::debug!("sent `{shown}` to printer");
    observer.on_send(&shown);
    outgoing.send(wire).await.map_err(|_| Error::Disconnected)
}
