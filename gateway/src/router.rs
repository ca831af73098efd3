use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    config::{GroupDef, Strategy},
    registry::ClientRegistry,
    session::{CallState, ClientSession},
};

/// Overall bound on a sequential hunt; without it the member loop would
/// retry forever when everyone stays busy or offline.
pub const SEQUENTIAL_CALL_DEADLINE: Duration = Duration::from_secs(300);

/// Pause between passes when not a single member could be rung.
const EMPTY_PASS_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("target offline")]
    Offline,
    #[error("target busy")]
    Busy,
    #[error("all members busy or offline")]
    AllBusy,
    #[error("no member answered in time")]
    NoAnswer,
}

/// Claim a single registered extension for an incoming call. The
/// Ringing claim is the exclusion token: losing it means another call
/// already owns the extension.
pub async fn claim_direct(
    registry: &ClientRegistry,
    ext: &str,
) -> Result<Arc<ClientSession>, RouteError> {
    let session = registry.lookup(ext).await.ok_or(RouteError::Offline)?;
    if !session.try_set_state(CallState::Ringing).await {
        return Err(RouteError::Busy);
    }
    Ok(session)
}

pub async fn ring_group(
    registry: &ClientRegistry,
    group: &str,
    def: &GroupDef,
) -> Result<Arc<ClientSession>, RouteError> {
    match def.strategy {
        Strategy::RingAll => ring_all(registry, group, def).await,
        Strategy::Sequential => sequential(registry, group, def).await,
    }
}

/// Ring every available member in parallel; the first ANSWER wins and
/// every other rung member is reverted to Idle with a terminal HANGUP.
async fn ring_all(
    registry: &ClientRegistry,
    group: &str,
    def: &GroupDef,
) -> Result<Arc<ClientSession>, RouteError> {
    debug!(group = %group, members = ?def.members, "ring-all start");

    let mut rung = Vec::new();
    for ext in &def.members {
        if let Some(session) = registry.lookup(ext).await {
            if session.try_set_state(CallState::Ringing).await {
                rung.push(session);
            } else {
                debug!(ext = %ext, "member is busy");
            }
        }
    }
    if rung.is_empty() {
        return Err(RouteError::AllBusy);
    }

    let (winner_tx, winner_rx) = async_channel::bounded::<Arc<ClientSession>>(1);
    let cancel = CancellationToken::new();

    for session in rung {
        let winner_tx = winner_tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = session.send_text("RINGING").await;
            let control = session.control_receiver();
            loop {
                tokio::select! {
                    cmd = control.recv() => match cmd.as_deref() {
                        Ok("ANSWER") => {
                            if winner_tx.try_send(session.clone()).is_err() {
                                // a faster member took the call
                                session.reset_state().await;
                                let _ = session.send_text("HANGUP").await;
                            }
                            return;
                        }
                        Ok("HANGUP") => {
                            session.reset_state().await;
                            return;
                        }
                        // other tokens are not for us; keep waiting
                        Ok(_) => {}
                        Err(_) => {
                            session.reset_state().await;
                            return;
                        }
                    },
                    _ = cancel.cancelled() => {
                        session.reset_state().await;
                        let _ = session.send_text("HANGUP").await;
                        return;
                    }
                }
            }
        });
    }
    // the parent keeps its sender alive: the race ends only on an
    // answer or the group timeout, not when every member has declined
    let _winner_tx = winner_tx;

    let winner = tokio::select! {
        winner = winner_rx.recv() => winner.ok(),
        _ = sleep(Duration::from_secs(def.timeout)) => None,
    };
    cancel.cancel();
    // an ANSWER racing the outcome may still land in the slot; once the
    // channel is closed it loses like any other late answer
    winner_rx.close();
    if let Ok(late) = winner_rx.try_recv() {
        late.reset_state().await;
        let _ = late.send_text("HANGUP").await;
    }

    match winner {
        Some(winner) => {
            debug!(group = %group, winner = %winner.extension, "ring-all winner");
            Ok(winner)
        }
        None => Err(RouteError::NoAnswer),
    }
}

/// Offer the call to one member at a time, looping over the list until
/// someone answers or the overall deadline passes.
async fn sequential(
    registry: &ClientRegistry,
    group: &str,
    def: &GroupDef,
) -> Result<Arc<ClientSession>, RouteError> {
    debug!(group = %group, members = ?def.members, "sequential start");

    let deadline = Instant::now() + SEQUENTIAL_CALL_DEADLINE;
    loop {
        let mut rang_any = false;
        for ext in &def.members {
            if Instant::now() >= deadline {
                return Err(RouteError::NoAnswer);
            }
            let Some(session) = registry.lookup(ext).await else {
                continue;
            };
            if !session.try_set_state(CallState::Ringing).await {
                debug!(ext = %ext, "member is busy, next");
                continue;
            }
            rang_any = true;

            debug!(ext = %ext, "ringing");
            let _ = session.send_text("RINGING").await;

            let member_deadline =
                deadline.min(Instant::now() + Duration::from_secs(def.timeout));
            let control = session.control_receiver();
            loop {
                tokio::select! {
                    cmd = control.recv() => match cmd.as_deref() {
                        Ok("ANSWER") => return Ok(session),
                        Ok("HANGUP") => {
                            debug!(ext = %ext, "rejected, next");
                            session.reset_state().await;
                            break;
                        }
                        Ok(_) => {}
                        Err(_) => {
                            session.reset_state().await;
                            break;
                        }
                    },
                    _ = sleep_until(member_deadline) => {
                        debug!(ext = %ext, "ring timeout, next");
                        let _ = session.send_text("HANGUP").await;
                        session.reset_state().await;
                        break;
                    }
                }
            }
        }
        if !rang_any {
            if Instant::now() + EMPTY_PASS_PAUSE >= deadline {
                return Err(RouteError::NoAnswer);
            }
            sleep(EMPTY_PASS_PAUSE).await;
        }
    }
}
