use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard},
};

use bytes::Bytes;
use printhost_serializer::LineFormatter;
use tokio::sync::watch;

/// Protocol-reserved command that resets the firmware's line counter.
/// Never recorded for resends.
pub(crate) const LINE_RESET: &str = "M110";

/// Everything the receiver, the sender, and the supervisor mutate.
/// Lives behind [`Shared`]'s mutex; the lock is never held across an await.
#[derive(Debug, Default)]
pub(crate) struct ProtocolState {
    pub connected: bool,
    pub online: bool,
    pub printing: bool,
    /// One-slot permission to put a line on the wire. Armed by the
    /// firmware's responses, consumed before each write.
    pub clear_to_send: bool,
    /// Next line number to assign. Strictly increasing between resets.
    pub line_no: i32,
    /// Line number the firmware asked to be replayed from, if any.
    pub resend_from: Option<i32>,
    /// Index of the next unsent line in `main_queue`.
    pub queue_index: usize,
    pub main_queue: Vec<String>,
    pub pri_queue: VecDeque<String>,
    /// Numbered lines exactly as framed for the wire, keyed by line number;
    /// consulted only to answer resend requests.
    pub history: HashMap<i32, Bytes>,
    pub received: Vec<String>,
    pub sent: Vec<String>,
    pub formatter: LineFormatter,
}

impl ProtocolState {
    /// Frame `command` with the next line number and remember the exact
    /// bytes for resends. Line-counter resets are deliberately forgotten.
    pub fn encode_sequenced(&mut self, command: &str) -> Bytes {
        let line = self.formatter.sequenced(self.line_no, command);
        if !command.contains(LINE_RESET) {
            self.history.insert(self.line_no, line.clone());
        }
        self.line_no += 1;
        line
    }
}

/// What fills a just-acquired send slot.
#[derive(Debug)]
pub(crate) enum Action {
    /// Remembered bytes, replayed exactly as first sent.
    Resend(Bytes),
    /// Head of the priority queue, unnumbered.
    Priority(Bytes),
    /// Next main-queue line, numbered and checksummed.
    Sequenced(Bytes),
    /// Comment or blank line: nothing on the wire, slot re-armed.
    Skip,
    /// The firmware asked for a line that was never recorded.
    MissingHistory(i32),
    /// Main queue drained: final line-counter reset, then stop.
    Finished(Bytes),
}

/// Protocol state plus the wakeup channel standing in for a condition
/// variable: every mutation that can unblock a waiter bumps the watch.
#[derive(Debug)]
pub(crate) struct Shared {
    state: Mutex<ProtocolState>,
    wake: watch::Sender<()>,
}

impl Shared {
    pub fn new() -> Self {
        let (wake, _) = watch::channel(());
        Self {
            state: Mutex::new(ProtocolState::default()),
            wake,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProtocolState> {
        self.state.lock().expect("protocol state poisoned")
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut ProtocolState) -> R) -> R {
        f(&mut self.lock())
    }

    /// Wake every task blocked on a state change.
    pub fn notify(&self) {
        self.wake.send_replace(());
    }

    /// Arm the send slot and wake whoever is waiting on it.
    pub fn open_send_slot(&self) {
        self.with_state(|st| st.clear_to_send = true);
        self.notify();
    }

    /// The link is gone: knock every flag down and leave the slot open so
    /// blocked tasks wake to discover the disconnect.
    pub fn mark_disconnected(&self) {
        self.with_state(|st| {
            st.connected = false;
            st.online = false;
            st.printing = false;
            st.clear_to_send = true;
        });
        self.notify();
    }

    /// Wait for the send slot while a print run is allowed to continue,
    /// consuming the token. `false` means stop: printing was switched off,
    /// the link dropped, or the firmware went offline.
    pub async fn acquire_print_slot(&self) -> bool {
        let mut wake = self.wake.subscribe();
        loop {
            {
                let mut st = self.lock();
                if !(st.printing && st.connected && st.online) {
                    return false;
                }
                if st.clear_to_send {
                    st.clear_to_send = false;
                    return true;
                }
            }
            if wake.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Out-of-print variant: only the link matters.
    pub async fn acquire_idle_slot(&self) -> bool {
        let mut wake = self.wake.subscribe();
        loop {
            {
                let mut st = self.lock();
                if !st.connected {
                    return false;
                }
                if st.clear_to_send {
                    st.clear_to_send = false;
                    return true;
                }
            }
            if wake.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Decide what fills the slot the sender just acquired. Resends outrank
    /// the priority queue, which outranks the main queue; draining the main
    /// queue ends the run.
    pub fn next_action(&self) -> Action {
        let mut st = self.lock();
        if let Some(from) = st.resend_from {
            if from >= 0 && from < st.line_no {
                match st.history.get(&from).cloned() {
                    Some(line) => {
                        st.resend_from = Some(from + 1);
                        return Action::Resend(line);
                    }
                    None => {
                        st.resend_from = None;
                        st.clear_to_send = true;
                        drop(st);
                        self.notify();
                        return Action::MissingHistory(from);
                    }
                }
            }
            st.resend_from = None;
        }
        if let Some(command) = st.pri_queue.pop_front() {
            return Action::Priority(st.formatter.raw(&command));
        }
        if st.queue_index < st.main_queue.len() {
            let line = st.main_queue[st.queue_index].clone();
            st.queue_index += 1;
            if line.is_empty() || line.starts_with(';') {
                // the firmware never answers what it never hears
                st.clear_to_send = true;
                drop(st);
                self.notify();
                return Action::Skip;
            }
            return Action::Sequenced(st.encode_sequenced(&line));
        }
        st.printing = false;
        st.queue_index = 0;
        st.line_no = 0;
        let reset = st.formatter.sequenced(-1, LINE_RESET);
        drop(st);
        self.notify();
        Action::Finished(reset)
    }
}
