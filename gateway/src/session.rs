use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_channel::{Receiver, Sender};
use futures_util::{stream::SplitSink, SinkExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::Mutex,
};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::debug;

/// Any transport a WebSocket can run over; accepted TLS sockets, plain
/// TCP sockets and in-memory pipes all erase to this.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type WsStream = WebSocketStream<Box<dyn AsyncStream>>;
pub type WsSink = SplitSink<WsStream, Message>;

/// Frames queued from the browser toward the PBX before the newest is
/// dropped.
pub const AUDIO_QUEUE_CAPACITY: usize = 100;

const INTERNAL_HANGUP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CallState {
    Idle,
    Ringing,
    Talking,
}

/// The browser sink and the call state live under one mutex: WebSocket
/// framing forbids interleaved writes, and every state decision has to
/// be atomic with respect to them.
struct SessionInner {
    sink: WsSink,
    state: CallState,
}

/// Live state of one registered softphone.
pub struct ClientSession {
    pub extension: String,
    inner: Mutex<SessionInner>,
    audio_tx: Sender<Vec<u8>>,
    audio_rx: Receiver<Vec<u8>>,
    control_tx: Sender<String>,
    control_rx: Receiver<String>,
}

impl ClientSession {
    pub fn new(extension: &str, sink: WsSink) -> Arc<ClientSession> {
        let (audio_tx, audio_rx) = async_channel::bounded(AUDIO_QUEUE_CAPACITY);
        let (control_tx, control_rx) = async_channel::bounded(1);
        Arc::new(ClientSession {
            extension: extension.to_string(),
            inner: Mutex::new(SessionInner {
                sink,
                state: CallState::Idle,
            }),
            audio_tx,
            audio_rx,
            control_tx,
            control_rx,
        })
    }

    pub async fn state(&self) -> CallState {
        self.inner.lock().await.state
    }

    /// Compare-and-set claim on the session. Succeeds from Idle, or for
    /// the Ringing -> Talking commit; a second Ringing claim on an
    /// already-ringing session fails. This is the exclusion token
    /// routers race on: failure means another call owns the extension.
    pub async fn try_set_state(&self, new: CallState) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state == CallState::Talking {
            return false;
        }
        if inner.state == CallState::Ringing && new == CallState::Ringing {
            return false;
        }
        inner.state = new;
        if new == CallState::Ringing {
            // tokens queued while no router owned the session are stale
            while self.control_rx.try_recv().is_ok() {}
        }
        true
    }

    pub async fn reset_state(&self) {
        self.inner.lock().await.state = CallState::Idle;
    }

    /// Serialized write of a control text frame to the browser.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.sink.send(Message::Text(text.to_string())).await?;
        Ok(())
    }

    /// Forward a PBX frame to the browser, only while the call is up.
    pub async fn forward_frame(&self, msg: Message) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != CallState::Talking {
            return Ok(());
        }
        inner.sink.send(msg).await?;
        Ok(())
    }

    /// Non-blocking control hand-off from the browser read loop. A token
    /// nobody is around to take is dropped: the command was stale.
    pub fn push_control(&self, token: String) -> bool {
        self.control_tx.try_send(token).is_ok()
    }

    /// Non-blocking audio enqueue; the newest frame is dropped when the
    /// queue is full so the browser read loop never stalls.
    pub fn push_audio(&self, frame: Vec<u8>) -> bool {
        self.audio_tx.try_send(frame).is_ok()
    }

    pub fn control_receiver(&self) -> Receiver<String> {
        self.control_rx.clone()
    }

    pub fn audio_receiver(&self) -> Receiver<Vec<u8>> {
        self.audio_rx.clone()
    }

    /// Deliver the internal HANGUP that unwinds whichever router still
    /// owns the session after its browser disconnected. Gives up after a
    /// second; no listener means nothing to unwind.
    pub async fn send_internal_hangup(&self) {
        tokio::select! {
            result = self.control_tx.send("HANGUP".to_string()) => {
                if result.is_ok() {
                    debug!(ext = %self.extension, "internal hangup sent after disconnect");
                }
            }
            _ = tokio::time::sleep(INTERNAL_HANGUP_TIMEOUT) => {
                debug!(ext = %self.extension, "internal hangup skipped");
            }
        }
    }
}
