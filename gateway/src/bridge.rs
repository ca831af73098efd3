use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_channel::Receiver;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::{
    pbx::PbxParser,
    session::{CallState, ClientSession, WsSink, WsStream},
};

/// How long a directly-called extension may ring before the PBX leg is
/// abandoned.
const DIRECT_RING_TIMEOUT: Duration = Duration::from_secs(60);

/// Drive the PBX leg of a claimed call to completion: the answer
/// handshake, then full-duplex forwarding until either side hangs up.
/// Whatever happens inside, the session leaves Idle with a terminal
/// HANGUP on its browser socket; the PBX socket dies with this scope.
pub async fn run(
    pbx: WsStream,
    session: Arc<ClientSession>,
    is_group: bool,
    media_start: bool,
    parser: &PbxParser,
) {
    let (mut pbx_sink, mut pbx_read) = pbx.split();

    // One reader task pumps PBX frames toward the browser for the whole
    // call; outside the Talking window they fall on the floor.
    let (err_tx, err_rx) = async_channel::bounded::<()>(1);
    let reader_session = session.clone();
    let reader = tokio::spawn(async move {
        loop {
            match pbx_read.next().await {
                Some(Ok(msg)) => {
                    let _ = reader_session.forward_frame(msg).await;
                }
                _ => {
                    let _ = err_tx.try_send(());
                    return;
                }
            }
        }
    });

    let _ = drive(&mut pbx_sink, &session, is_group, media_start, parser, &err_rx)
        .await;

    session.reset_state().await;
    debug!(ext = %session.extension, "bridge end");
    let _ = session.send_text("HANGUP").await;
    reader.abort();
}

async fn drive(
    pbx_sink: &mut WsSink,
    session: &Arc<ClientSession>,
    is_group: bool,
    media_start: bool,
    parser: &PbxParser,
    pbx_gone: &Receiver<()>,
) -> Result<()> {
    if !media_start {
        // no media offered; hold the leg until the PBX goes away
        let _ = pbx_gone.recv().await;
        return Ok(());
    }

    if is_group {
        // the group race already produced an answered member
        debug!(winner = %session.extension, "group winner, answering pbx");
        pbx_sink.send(parser.command("ANSWER")).await?;
        if !session.try_set_state(CallState::Talking).await {
            return Ok(());
        }
    } else {
        debug!(target = %session.extension, "incoming call, ringing");
        session.send_text("RINGING").await?;

        let control = session.control_receiver();
        tokio::select! {
            cmd = control.recv() => match cmd.as_deref() {
                Ok("ANSWER") => {
                    debug!(ext = %session.extension, "user answered");
                    pbx_sink.send(parser.command("ANSWER")).await?;
                    session.try_set_state(CallState::Talking).await;
                }
                _ => {
                    let _ = pbx_sink.send(parser.command("HANGUP")).await;
                    return Ok(());
                }
            },
            _ = tokio::time::sleep(DIRECT_RING_TIMEOUT) => {
                debug!(ext = %session.extension, "ringing timeout");
                return Ok(());
            }
            _ = pbx_gone.recv() => {
                return Ok(());
            }
        }
    }

    debug!(ext = %session.extension, "bridge start");

    let audio = session.audio_receiver();
    let control = session.control_receiver();
    loop {
        tokio::select! {
            frame = audio.recv() => {
                let Ok(data) = frame else { return Ok(()) };
                if pbx_sink.send(Message::Binary(data)).await.is_err() {
                    return Ok(());
                }
            }
            cmd = control.recv() => match cmd.as_deref() {
                Ok("HANGUP") => {
                    debug!(ext = %session.extension, "user hangup");
                    let _ = pbx_sink.send(parser.command("HANGUP")).await;
                    return Ok(());
                }
                Ok(_) => {}
                Err(_) => return Ok(()),
            },
            _ = pbx_gone.recv() => {
                debug!(ext = %session.extension, "pbx hangup");
                return Ok(());
            }
        }
    }
}
