use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};

use crate::{
    observer::Observer,
    response::{self, Kind, Resend},
    state::Shared,
    Error,
};

/// Settle time between link-up and the first status poll.
const GREETING_DELAY: Duration = Duration::from_secs(1);
/// Status poll that provokes a first `ok` out of a quiet firmware.
const GREETING_POLL: &str = "M105";

/// Consumes firmware lines until the link dies: updates the shared protocol
/// state, fans lines out to the observer, and keeps the send slot honest.
pub(crate) async fn receive_task(
    shared: Arc<Shared>,
    observer: Arc<dyn Observer>,
    mut lines: broadcast::Receiver<Bytes>,
    outgoing: mpsc::Sender<Bytes>,
    mut link: JoinHandle<Result<(), Error>>,
) {
    // Nothing is in flight on a fresh link: open the slot, then poke the
    // firmware so it answers something and the online transition can run.
    shared.open_send_slot();
    tokio::time::sleep(GREETING_DELAY).await;
    let poll = shared.with_state(|st| st.formatter.raw(GREETING_POLL));
    let _ = crate::transmit(&shared, &observer, &outgoing, poll).await;

    loop {
        tokio::select! {
            line = lines.recv() => match line {
                Ok(line) => handle_line(&shared, &observer, &line),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("receiver lagging, dropped {missed} firmware lines");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            outcome = &mut link => {
                if let Ok(Err(error)) = outcome {
                    tracing::warn!("printer link failed: {error}");
                }
                break;
            }
        }
    }
    shared.mark_disconnected();
    tracing::info!("printer link closed");
}

fn handle_line(shared: &Shared, observer: &Arc<dyn Observer>, raw: &[u8]) {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim_end_matches(['\r', '\n']);
    if !line.is_empty() {
        shared.with_state(|st| st.received.push(line.to_string()));
        tracing::debug!("received `{line}` from printer");
        observer.on_recv(line);
    }
    match response::kind(line) {
        Kind::Start => {
            let first = shared.with_state(|st| {
                st.clear_to_send = true;
                !std::mem::replace(&mut st.online, true)
            });
            shared.notify();
            if first {
                observer.on_online();
            }
        }
        Kind::Ok => {
            let first = shared.with_state(|st| {
                st.clear_to_send = true;
                st.resend_from = None;
                !std::mem::replace(&mut st.online, true)
            });
            shared.notify();
            if first {
                observer.on_online();
            }
            if response::carries_temperature(line) {
                observer.on_temp(line);
            }
        }
        Kind::Error => observer.on_error(line),
        Kind::Other => {}
    }
    match response::resend(line) {
        Resend::From(number) => {
            shared.with_state(|st| {
                st.resend_from = Some(number);
                st.clear_to_send = true;
            });
            shared.notify();
        }
        Resend::Malformed => observer.on_error(line),
        Resend::None => {}
    }
}
