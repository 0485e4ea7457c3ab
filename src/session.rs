// SPDX-License-Identifier: MIT
//! The per-user session machine.
//!
//! One session per authenticated user. The session subscribes a coalescing
//! signal to every course, loads the user's durable choices, then multiplexes
//! three inputs on one select loop: inbound frames, coalesced update signals
//! (via the per-course forwarder tasks), and its cancellation handle.
//! Handlers run serially on that loop, which is what lets the engine mutate
//! the session's group set and type counters without locks.

use crate::engine::{self, SessionState};
use crate::modes::Mode;
use crate::protocol::{self, Message, ProtocolError};
use crate::registry::SessionHandle;
use crate::usem::Usem;
use crate::AppContext;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt as _, StreamExt as _};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocket, WsMessage>;

/// What a handled frame means for the session's future.
enum Disposition {
    /// Send the replies and keep serving.
    Continue(Vec<Message>),
    /// Send the replies, then close the session.
    Terminal(Vec<Message>),
}

/// Serve an authenticated WebSocket until disconnect or cancellation.
pub async fn run(ctx: Arc<AppContext>, socket: WebSocket, user_id: String) {
    // Installing preempts (and awaits) any prior session for this user.
    let handle = ctx.registry.install(&user_id).await;
    let epoch = handle.epoch();
    // Fires `exited` on every exit path, panics included, so a successor's
    // install never waits out the full preemption timeout.
    let _exit_guard = handle.exited.clone().drop_guard();

    // Subscribe to every course before loading choices, so no update
    // between load and subscribe can be missed.
    let mut signals: Vec<(i64, Arc<Usem>)> = Vec::with_capacity(ctx.catalogue.len());
    for course in ctx.catalogue.iter() {
        let usem = Arc::new(Usem::new());
        course.subscribers.insert(user_id.clone(), usem.clone());
        signals.push((course.id, usem));
    }
    ctx.usem_count
        .fetch_add(signals.len() as u64, Ordering::Relaxed);
    info!(user = %user_id, "session attached");

    serve(&ctx, socket, &user_id, &handle, &signals).await;

    // Teardown. Remove only our own signals — a successor that out-waited
    // the preemption timeout may already have installed its own.
    for (course_id, usem) in &signals {
        if let Some(course) = ctx.catalogue.lookup(*course_id) {
            course
                .subscribers
                .remove_if(&user_id, |_, v| Arc::ptr_eq(v, usem));
        }
    }
    ctx.usem_count
        .fetch_sub(signals.len() as u64, Ordering::Relaxed);
    ctx.registry.compare_and_delete(&user_id, epoch);
    info!(user = %user_id, "session detached");
}

async fn serve(
    ctx: &Arc<AppContext>,
    socket: WebSocket,
    user_id: &str,
    handle: &SessionHandle,
    signals: &[(i64, Arc<Usem>)],
) {
    let (mut sink, mut stream) = socket.split();

    // Subscribe to mode transitions before announcing the current mode, so
    // a transition racing the attach is delivered rather than dropped.
    let mut broadcast_rx = ctx.broadcaster.subscribe();

    // Reconstruct the session's bookkeeping from its durable choices.
    let mut state = SessionState::new(user_id);
    let held = match ctx.storage.user_choices(user_id).await {
        Ok(rows) => {
            let mut held = Vec::with_capacity(rows.len());
            for row in &rows {
                state.hold(&row.grp, &row.kind, row.courseid);
                held.push(row.courseid);
            }
            held
        }
        Err(e) => {
            warn!(user = %user_id, err = %e, "failed to populate session from choices");
            let _ = send(&mut sink, protocol::error("Database error")).await;
            return;
        }
    };

    // Current choices go out unconditionally at attach; HELLO below merely
    // re-emits them for clients that still perform the legacy handshake.
    if send(&mut sink, protocol::welcome(&held)).await.is_err() {
        return;
    }
    if ctx.modes.current() == Mode::Open && send(&mut sink, protocol::start()).await.is_err() {
        return;
    }

    // One forwarder task per course turns that course's coalescing signal
    // into ids on the session's single updates channel. The child token
    // stops them on session exit even when the session itself was never
    // cancelled (plain disconnect).
    let (updates_tx, mut updates_rx) = mpsc::channel::<i64>(ctx.config.perf.senq);
    let forwarder_cancel = handle.cancel.child_token();
    for (course_id, usem) in signals {
        tokio::spawn(forward_updates(
            ctx.clone(),
            *course_id,
            usem.clone(),
            updates_tx.clone(),
            forwarder_cancel.clone(),
        ));
    }
    drop(updates_tx);

    loop {
        tokio::select! {
            biased;

            _ = handle.cancel.cancelled() => {
                // Best-effort farewell on the transport; the peer may
                // already be gone.
                let _ = send(&mut sink, protocol::error("Context canceled")).await;
                debug!(user = %user_id, "session cancelled");
                break;
            }

            msg = stream.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        let disposition = handle_frame(ctx, &mut state, text.as_str()).await;
                        match disposition {
                            Disposition::Continue(replies) => {
                                if send_all(&mut sink, replies).await.is_err() {
                                    break;
                                }
                            }
                            Disposition::Terminal(replies) => {
                                let _ = send_all(&mut sink, replies).await;
                                break;
                            }
                        }
                    }
                    // Ping/pong is handled by the transport layer.
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Binary(_))) => {}
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(user = %user_id, err = %e, "websocket read error");
                        break;
                    }
                }
            }

            id = updates_rx.recv() => {
                let Some(id) = id else { break };
                if let Some(course) = ctx.catalogue.lookup(id) {
                    // The atomic read may be fresher than the triggering
                    // event; clients only want the latest value.
                    if send(&mut sink, protocol::seat_count(id, course.selected())).await.is_err() {
                        break;
                    }
                }
            }

            frame = broadcast_rx.recv() => {
                match frame {
                    Ok(f) => {
                        if send(&mut sink, f).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(user = %user_id, skipped = n, "mode broadcast lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    forwarder_cancel.cancel();
    let _ = sink.close().await;
}

/// Dispatch one inbound frame to a reply set.
async fn handle_frame(ctx: &AppContext, state: &mut SessionState, raw: &str) -> Disposition {
    let msg = match Message::parse(raw, ctx.config.perf.msg_args_cap, ctx.config.perf.msg_bytes_cap)
    {
        Ok(m) => m,
        Err(ProtocolError::Empty) => {
            return Disposition::Continue(vec![protocol::error("Empty message")])
        }
        Err(ProtocolError::TooLong) => {
            return Disposition::Continue(vec![protocol::error("Message too long")])
        }
        Err(ProtocolError::TooManyFields) => {
            return Disposition::Continue(vec![protocol::error("Too many fields")])
        }
        Err(ProtocolError::IllegalByte) => {
            return Disposition::Continue(vec![protocol::error("Illegal byte in message")])
        }
    };

    match msg.verb.as_str() {
        // Legacy handshake: re-emit the welcome; selections already went
        // out at attach time.
        "HELLO" => {
            let held = match ctx.storage.user_choices(&state.user_id).await {
                Ok(rows) => rows.into_iter().map(|r| r.courseid).collect::<Vec<_>>(),
                Err(e) => {
                    warn!(user = %state.user_id, err = %e, "HELLO choice reload failed");
                    return Disposition::Terminal(vec![protocol::error("Database error")]);
                }
            };
            let mut replies = vec![protocol::welcome(&held)];
            if ctx.modes.current() == Mode::Open {
                replies.push(protocol::start());
            }
            Disposition::Continue(replies)
        }
        "Y" => match course_id_arg(&msg) {
            Ok(id) => match engine::choose(ctx, state, id).await {
                Ok(replies) => Disposition::Continue(replies),
                Err(fault) => {
                    warn!(user = %state.user_id, err = %fault, "choose failed");
                    Disposition::Terminal(vec![protocol::error(fault.wire_reason())])
                }
            },
            Err(reply) => Disposition::Continue(vec![reply]),
        },
        "N" => match course_id_arg(&msg) {
            Ok(id) => match engine::unchoose(ctx, state, id).await {
                Ok(replies) => Disposition::Continue(replies),
                Err(fault) => {
                    warn!(user = %state.user_id, err = %fault, "unchoose failed");
                    Disposition::Terminal(vec![protocol::error(fault.wire_reason())])
                }
            },
            Err(reply) => Disposition::Continue(vec![reply]),
        },
        _ => Disposition::Continue(vec![protocol::error("Unknown command")]),
    }
}

/// `Y`/`N` take exactly one integer argument.
fn course_id_arg(msg: &Message) -> Result<i64, Message> {
    if msg.args.len() != 1 || msg.trailing.is_some() {
        return Err(protocol::error("Expected one argument"));
    }
    msg.args[0]
        .parse::<i64>()
        .map_err(|_| protocol::error("Course ID must be an integer"))
}

/// Forward one course's coalesced signal into the session's updates
/// channel, pacing by the global signal population. With U live signals
/// and shift S, each wake is followed by a `U >> S` ms sleep, which keeps
/// total wake-up rate sub-linear in the subscription population.
async fn forward_updates(
    ctx: Arc<AppContext>,
    course_id: i64,
    usem: Arc<Usem>,
    updates: mpsc::Sender<i64>,
    cancel: CancellationToken,
) {
    let shift = ctx.config.perf.usem_delay_shift_bits;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = usem.wait() => {}
        }
        // A full channel blocks here; the session will drain it. Updates
        // arrive late under pressure, never wrong.
        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = updates.send(course_id) => {
                if sent.is_err() {
                    break;
                }
            }
        }
        let delay_ms = ctx.usem_count.load(Ordering::Relaxed) >> shift;
        if delay_ms > 0 {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            }
        }
    }
}

async fn send(sink: &mut WsSink, frame: Message) -> Result<(), axum::Error> {
    sink.send(WsMessage::Text(frame.encode().into())).await
}

async fn send_all(sink: &mut WsSink, frames: Vec<Message>) -> Result<(), axum::Error> {
    for frame in frames {
        send(sink, frame).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::FrameBroadcaster;
    use crate::catalogue::Catalogue;
    use crate::config::ServerConfig;
    use crate::modes::ModeController;
    use crate::registry::SessionRegistry;
    use crate::storage::Storage;
    use std::sync::atomic::AtomicU64;

    async fn test_ctx() -> (Arc<AppContext>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("session.db");
        let storage = Arc::new(Storage::new(db.to_str().unwrap()).await.unwrap());
        storage.insert_course(1, "A", "x", "t", 5).await.unwrap();
        let catalogue = Arc::new(Catalogue::load(&storage).await.unwrap());
        let broadcaster = Arc::new(FrameBroadcaster::new());
        let modes = Arc::new(
            ModeController::load(storage.clone(), broadcaster.clone())
                .await
                .unwrap(),
        );
        let registry = Arc::new(SessionRegistry::new());
        modes.set(&registry, Mode::Open).await.unwrap();
        let ctx = Arc::new(AppContext {
            config: Arc::new(ServerConfig::default()),
            storage,
            catalogue,
            registry,
            modes,
            broadcaster,
            usem_count: AtomicU64::new(0),
            started_at: std::time::Instant::now(),
        });
        (ctx, dir)
    }

    async fn frame(ctx: &AppContext, state: &mut SessionState, raw: &str) -> Vec<String> {
        match handle_frame(ctx, state, raw).await {
            Disposition::Continue(replies) | Disposition::Terminal(replies) => {
                replies.iter().map(Message::encode).collect()
            }
        }
    }

    #[tokio::test]
    async fn malformed_frames_get_an_error_and_the_session_lives() {
        let (ctx, _dir) = test_ctx().await;
        let mut state = SessionState::new("alice");
        assert_eq!(frame(&ctx, &mut state, "").await, ["E :Empty message"]);
        assert_eq!(
            frame(&ctx, &mut state, "Y").await,
            ["E :Expected one argument"]
        );
        assert_eq!(
            frame(&ctx, &mut state, "Y 1 2").await,
            ["E :Expected one argument"]
        );
        assert_eq!(
            frame(&ctx, &mut state, "Y seven").await,
            ["E :Course ID must be an integer"]
        );
        assert_eq!(
            frame(&ctx, &mut state, "WHAT 1").await,
            ["E :Unknown command"]
        );
    }

    #[tokio::test]
    async fn hello_reemits_current_choices_and_start() {
        let (ctx, _dir) = test_ctx().await;
        let mut state = SessionState::new("alice");
        assert_eq!(frame(&ctx, &mut state, "Y 1").await, ["Y 1"]);
        assert_eq!(frame(&ctx, &mut state, "HELLO").await, ["HI :1", "START"]);

        ctx.modes.set(&ctx.registry, Mode::Frozen).await.unwrap();
        assert_eq!(frame(&ctx, &mut state, "HELLO").await, ["HI :1"]);
    }

    #[tokio::test]
    async fn y_and_n_dispatch_to_the_engine() {
        let (ctx, _dir) = test_ctx().await;
        let mut state = SessionState::new("alice");
        assert_eq!(frame(&ctx, &mut state, "Y 1").await, ["Y 1"]);
        assert_eq!(ctx.catalogue.lookup(1).unwrap().selected(), 1);
        assert_eq!(frame(&ctx, &mut state, "N 1").await, ["N 1"]);
        assert_eq!(ctx.catalogue.lookup(1).unwrap().selected(), 0);
    }

    #[tokio::test]
    async fn forwarder_paces_and_coalesces() {
        let (ctx, _dir) = test_ctx().await;
        let usem = Arc::new(Usem::new());
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(forward_updates(
            ctx.clone(),
            1,
            usem.clone(),
            tx,
            cancel.clone(),
        ));

        // A burst of sets produces at least one forward, at most a few —
        // never one per set.
        for _ in 0..50 {
            usem.set();
        }
        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("forwarder should forward")
            .unwrap();
        assert_eq!(first, 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("forwarder observes cancellation")
            .unwrap();
    }
}
