//! Lifecycle of one answer session on a duplex connection.
//!
//! A session reads a single `ask` frame, then runs three flows at once: the
//! answer pipeline, a keepalive loop pinging the peer, and a watcher reading
//! the peer's frames (pongs push the read deadline forward, `cancel` stops
//! the pipeline at its next stage boundary). The first of them to finish
//! decides how the session ends. Every outbound frame goes through one
//! [`EventWriter`].

use super::SessionTimings;
use super::events::{ClientMessage, ServerMessage};
use crate::error::{ProtocolError, ValidationError};
use crate::providers::FragmentSink;
use crate::rag::{RagService, StatusSink};
use async_trait::async_trait;
use axum::extract::ws::Message;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Message sent when the first frame is missing, late or malformed.
pub const INVALID_ASK: &str = "invalid ask";

const EMBEDDING_STAGE: &str = "embedding";
const PING_PAYLOAD: &[u8] = b"ping";

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    AwaitingAsk,
    Working,
    /// Absorbing: nothing is read or written once here.
    Terminated,
}

/// Live state of one connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub connection_id: Uuid,
    pub phase: SessionPhase,
    pub has_received_ask: bool,
    pub last_read_deadline: Option<Instant>,
    pub last_write_deadline: Option<Instant>,
    pub heartbeat_active: bool,
}

impl Session {
    pub fn new(connection_id: Uuid) -> Self {
        Self {
            connection_id,
            phase: SessionPhase::AwaitingAsk,
            has_received_ask: false,
            last_read_deadline: None,
            last_write_deadline: None,
            heartbeat_active: false,
        }
    }
}

struct WriterState<S> {
    sink: S,
    terminated: bool,
    last_deadline: Option<Instant>,
}

/// Single writer for a connection's outbound half.
///
/// Writes are serialized by an async mutex, so pings never interleave with
/// events. Once a terminal event has been accepted every later event is
/// refused. A failed or timed-out write trips [`EventWriter::lost`].
pub struct EventWriter<S> {
    state: Mutex<WriterState<S>>,
    write_deadline: Duration,
    lost: CancellationToken,
}

impl<S> EventWriter<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display + Send,
{
    pub fn new(sink: S, write_deadline: Duration) -> Self {
        Self {
            state: Mutex::new(WriterState {
                sink,
                terminated: false,
                last_deadline: None,
            }),
            write_deadline,
            lost: CancellationToken::new(),
        }
    }

    /// Cancelled once the connection can no longer be written to.
    pub fn lost(&self) -> &CancellationToken {
        &self.lost
    }

    /// Send one event. Returns `Ok(false)` when the event was refused because
    /// a terminal event already went out.
    pub async fn send(&self, event: &ServerMessage) -> Result<bool, ProtocolError> {
        let json = serde_json::to_string(event).map_err(|e| ProtocolError::WriteFailed {
            message: e.to_string(),
        })?;

        let mut state = self.state.lock().await;
        if state.terminated {
            debug!(?event, "Refusing event after terminal event");
            return Ok(false);
        }
        if event.is_terminal() {
            state.terminated = true;
        }
        self.write(&mut state, Message::Text(json.into()), self.write_deadline)
            .await?;
        Ok(true)
    }

    /// Send a keepalive ping bounded by `deadline`.
    pub async fn ping(&self, deadline: Duration) -> Result<(), ProtocolError> {
        let mut state = self.state.lock().await;
        self.write(
            &mut state,
            Message::Ping(Bytes::from_static(PING_PAYLOAD)),
            deadline,
        )
        .await
    }

    /// Close the outbound half, best effort.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if timeout(self.write_deadline, state.sink.close()).await.is_err() {
            debug!("Close frame not flushed before the write deadline");
        }
    }

    pub async fn is_terminated(&self) -> bool {
        self.state.lock().await.terminated
    }

    pub async fn last_write_deadline(&self) -> Option<Instant> {
        self.state.lock().await.last_deadline
    }

    async fn write(
        &self,
        state: &mut WriterState<S>,
        frame: Message,
        deadline: Duration,
    ) -> Result<(), ProtocolError> {
        if self.lost.is_cancelled() {
            return Err(ProtocolError::ConnectionClosed);
        }
        state.last_deadline = Some(Instant::now() + deadline);
        let message = match timeout(deadline, state.sink.send(frame)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "write deadline exceeded".to_string(),
        };
        self.lost.cancel();
        Err(ProtocolError::WriteFailed { message })
    }
}

/// Adapts pipeline callbacks to outbound events.
struct SessionEvents<'a, S> {
    writer: &'a EventWriter<S>,
}

#[async_trait]
impl<S> FragmentSink for SessionEvents<'_, S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display + Send,
{
    async fn on_fragment(&self, text: &str) {
        let event = ServerMessage::Delta {
            text: text.to_string(),
        };
        // A failed write trips `lost`, which ends the session.
        let _ = self.writer.send(&event).await;
    }
}

#[async_trait]
impl<S> StatusSink for SessionEvents<'_, S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display + Send,
{
    async fn on_status(&self, stage: &str, msg: &str) {
        let _ = self.writer.send(&ServerMessage::status(stage, msg)).await;
    }
}

/// Reads the peer's frames while the pipeline runs.
struct PeerWatcher<'a, R> {
    stream: &'a mut R,
    read_deadline: Duration,
    deadline: Instant,
}

impl<R, E> PeerWatcher<'_, R>
where
    R: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display,
{
    /// Runs until the peer goes away or stays silent past the deadline.
    async fn run(&mut self, stop: &CancellationToken) -> ProtocolError {
        loop {
            let frame = tokio::select! {
                _ = sleep_until(self.deadline) => return ProtocolError::ReadDeadline,
                frame = self.stream.next() => frame,
            };
            match frame {
                Some(Ok(Message::Pong(_))) => {
                    self.deadline = Instant::now() + self.read_deadline;
                }
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientMessage>(text.as_str()) {
                        Ok(ClientMessage::Cancel) => {
                            info!("Cancel requested by client");
                            stop.cancel();
                        }
                        Ok(ClientMessage::Ask { .. }) => {
                            debug!("Ignoring ask while a session is working");
                        }
                        Err(e) => debug!(error = %e, "Ignoring malformed frame"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => return ProtocolError::ConnectionClosed,
                Some(Err(e)) => {
                    debug!(error = %e, "Read failed");
                    return ProtocolError::ConnectionClosed;
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

async fn heartbeat<S>(writer: &EventWriter<S>, timings: SessionTimings) -> ProtocolError
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display + Send,
{
    let start = Instant::now() + timings.heartbeat_interval;
    let mut ticker = tokio::time::interval_at(start, timings.heartbeat_interval);
    loop {
        ticker.tick().await;
        if let Err(e) = writer.ping(timings.ping_write_deadline).await {
            return e;
        }
    }
}

async fn read_ask<R, E>(stream: &mut R) -> Result<(String, i64), ProtocolError>
where
    R: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                return match serde_json::from_str::<ClientMessage>(text.as_str()) {
                    Ok(ClientMessage::Ask { query, top_k }) => Ok((query, top_k)),
                    Ok(other) => Err(ProtocolError::MalformedFrame {
                        message: format!("expected ask, got {other:?}"),
                    }),
                    Err(e) => Err(ProtocolError::MalformedFrame {
                        message: e.to_string(),
                    }),
                };
            }
            Some(Ok(Message::Binary(_))) => {
                return Err(ProtocolError::MalformedFrame {
                    message: "binary frame".to_string(),
                });
            }
            Some(Ok(Message::Close(_))) | None => return Err(ProtocolError::ConnectionClosed),
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(error = %e, "Read failed before ask");
                return Err(ProtocolError::ConnectionClosed);
            }
        }
    }
}

fn validate_ask(rag: &RagService, query: &str, top_k: i64) -> Result<usize, ValidationError> {
    if query.trim().is_empty() {
        return Err(ValidationError::MissingField {
            field: "query".to_string(),
        });
    }
    rag.effective_top_k(top_k)
}

enum Outcome {
    Finished,
    Lost(ProtocolError),
}

/// Drive one session to completion and return its final state.
///
/// Dropping the returned future aborts any in-flight upstream call.
pub async fn run_session<S, R, E>(
    mut session: Session,
    sink: S,
    mut stream: R,
    rag: &RagService,
    timings: SessionTimings,
) -> Session
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display + Send,
    R: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display,
{
    let writer = EventWriter::new(sink, timings.write_deadline);

    session.last_read_deadline = Some(Instant::now() + timings.ask_timeout);
    let ask = match timeout(timings.ask_timeout, read_ask(&mut stream)).await {
        Ok(Ok(ask)) => Ok(ask),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ProtocolError::AskTimeout),
    };
    let (query, top_k) = match ask {
        Ok(ask) => ask,
        Err(ProtocolError::ConnectionClosed) => {
            debug!("Peer left before asking");
            return terminate(session, &writer, false).await;
        }
        Err(e) => {
            warn!(error = %e, "Rejecting session");
            let _ = writer.send(&ServerMessage::error(INVALID_ASK)).await;
            return terminate(session, &writer, true).await;
        }
    };
    session.has_received_ask = true;

    let top_k = match validate_ask(rag, &query, top_k) {
        Ok(top_k) => top_k,
        Err(e) => {
            warn!(error = %e, "Invalid ask");
            let _ = writer.send(&ServerMessage::error(e.to_string())).await;
            return terminate(session, &writer, true).await;
        }
    };

    session.phase = SessionPhase::Working;
    info!(query_len = query.len(), top_k, "Ask received");
    let _ = writer
        .send(&ServerMessage::status(EMBEDDING_STAGE, "embed query"))
        .await;

    let stop = CancellationToken::new();
    let events = SessionEvents { writer: &writer };
    let mut watcher = PeerWatcher {
        stream: &mut stream,
        read_deadline: timings.read_deadline,
        deadline: Instant::now() + timings.read_deadline,
    };

    let work = async {
        match rag
            .answer_stream_until(&query, top_k as i64, &events, &events, &stop)
            .await
        {
            Ok(hits) => {
                info!(hits = hits.len(), "Answer complete");
                writer.send(&ServerMessage::Hits { items: hits }).await?;
                writer.send(&ServerMessage::Done).await?;
            }
            Err(e) => {
                warn!(error = %e, upstream = e.upstream(), "Answer failed");
                writer.send(&ServerMessage::error(e.to_string())).await?;
            }
        }
        Ok::<(), ProtocolError>(())
    };

    session.heartbeat_active = true;
    let outcome = tokio::select! {
        result = work => match result {
            Ok(()) => Outcome::Finished,
            Err(e) => Outcome::Lost(e),
        },
        e = heartbeat(&writer, timings) => Outcome::Lost(e),
        e = watcher.run(&stop) => Outcome::Lost(e),
        _ = writer.lost().cancelled() => Outcome::Lost(ProtocolError::WriteFailed {
            message: "connection lost".to_string(),
        }),
    };
    session.heartbeat_active = false;
    session.last_read_deadline = Some(watcher.deadline);

    match outcome {
        Outcome::Finished => terminate(session, &writer, true).await,
        Outcome::Lost(e) => {
            warn!(error = %e, "Connection lost, abandoning session");
            let closable = !writer.lost().is_cancelled();
            terminate(session, &writer, closable).await
        }
    }
}

async fn terminate<S>(mut session: Session, writer: &EventWriter<S>, close: bool) -> Session
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display + Send,
{
    if close {
        writer.close().await;
    }
    session.phase = SessionPhase::Terminated;
    session.heartbeat_active = false;
    session.last_write_deadline = writer.last_write_deadline().await;
    debug!(connection_id = %session.connection_id, "Session terminated");
    session
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LlmError, RetrievalError};
    use crate::providers::ChatCompletion;
    use crate::rag::RagSettings;
    use crate::retrieval::SearchBackend;
    use crate::types::{ChatMessage, ChatOptions, Hit, SearchResult};
    use futures::channel::mpsc;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};

    type Inbound = mpsc::UnboundedSender<Result<Message, std::io::Error>>;

    struct FixedSearch {
        hits: Vec<Hit>,
        delay: Duration,
    }

    #[async_trait]
    impl SearchBackend for FixedSearch {
        async fn search(&self, query: &str, top_k: usize) -> Result<SearchResult, RetrievalError> {
            tokio::time::sleep(self.delay).await;
            Ok(SearchResult {
                query: query.to_string(),
                requested_top_k: top_k,
                hits: self.hits.clone(),
            })
        }
    }

    struct SlowLlm {
        delay: Duration,
        fragments: Vec<&'static str>,
    }

    #[async_trait]
    impl ChatCompletion for SlowLlm {
        async fn complete_once(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _options: &ChatOptions,
        ) -> Result<String, LlmError> {
            Ok(self.fragments.concat())
        }

        async fn complete_streaming(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _options: &ChatOptions,
            on_fragment: &dyn FragmentSink,
        ) -> Result<String, LlmError> {
            tokio::time::sleep(self.delay).await;
            for fragment in &self.fragments {
                on_fragment.on_fragment(fragment).await;
            }
            Ok(self.fragments.concat())
        }
    }

    fn rag_with(search_ms: u64, llm_ms: u64) -> Arc<RagService> {
        Arc::new(RagService::new(
            Arc::new(FixedSearch {
                hits: vec![Hit::new("1", 0.9, "alpha")],
                delay: Duration::from_millis(search_ms),
            }),
            Arc::new(SlowLlm {
                delay: Duration::from_millis(llm_ms),
                fragments: vec!["Hel", "lo"],
            }),
            RagSettings::default(),
        ))
    }

    fn rag(llm_ms: u64) -> Arc<RagService> {
        rag_with(0, llm_ms)
    }

    fn fast_timings() -> SessionTimings {
        SessionTimings {
            ask_timeout: Duration::from_millis(200),
            heartbeat_interval: Duration::from_secs(30),
            read_deadline: Duration::from_secs(30),
            write_deadline: Duration::from_secs(1),
            ping_write_deadline: Duration::from_secs(1),
        }
    }

    /// Accepts `capacity` frames, then fails every write.
    struct FailingSink {
        written: Arc<std::sync::Mutex<Vec<Message>>>,
        capacity: usize,
    }

    impl Sink<Message> for FailingSink {
        type Error = std::io::Error;

        fn poll_ready(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            if self.written.lock().unwrap().len() >= self.capacity {
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "peer unreachable",
                )));
            }
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            self.written.lock().unwrap().push(item);
            Ok(())
        }

        fn poll_flush(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    /// A peer that never drains its socket: no write ever completes.
    struct StalledSink;

    impl Sink<Message> for StalledSink {
        type Error = std::io::Error;

        fn poll_ready(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn poll_close(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }
    }

    fn text(json: &str) -> Result<Message, std::io::Error> {
        Ok(Message::Text(json.to_string().into()))
    }

    /// Runs a session in the background; returns the inbound sender, the
    /// outbound receiver and the session handle.
    fn spawn_session(
        rag: Arc<RagService>,
        timings: SessionTimings,
    ) -> (
        Inbound,
        mpsc::UnboundedReceiver<Message>,
        tokio::task::JoinHandle<Session>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded::<Message>();
        let (in_tx, in_rx) = mpsc::unbounded::<Result<Message, std::io::Error>>();
        let handle = tokio::spawn(async move {
            run_session(Session::new(Uuid::new_v4()), out_tx, in_rx, &rag, timings).await
        });
        (in_tx, out_rx, handle)
    }

    /// Decode every text frame; pings become `"<ping>"`.
    fn transcript(frames: &[Message]) -> Vec<serde_json::Value> {
        frames
            .iter()
            .filter_map(|m| match m {
                Message::Text(t) => serde_json::from_str(t.as_str()).ok(),
                Message::Ping(_) => Some(serde_json::json!("<ping>")),
                _ => None,
            })
            .collect()
    }

    fn event_types(frames: &[Message]) -> Vec<String> {
        transcript(frames)
            .iter()
            .filter_map(|v| v["type"].as_str().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_writer_refuses_events_after_terminal() {
        let (tx, rx) = mpsc::unbounded::<Message>();
        let writer = EventWriter::new(tx, Duration::from_secs(1));

        assert!(writer.send(&ServerMessage::status("search", "x")).await.unwrap());
        assert!(writer.send(&ServerMessage::Done).await.unwrap());
        assert!(writer.is_terminated().await);
        assert!(
            !writer
                .send(&ServerMessage::Delta { text: "late".into() })
                .await
                .unwrap()
        );
        assert!(!writer.send(&ServerMessage::error("late")).await.unwrap());
        assert!(writer.last_write_deadline().await.is_some());
        drop(writer);

        let frames: Vec<Message> = rx.collect().await;
        assert_eq!(event_types(&frames), vec!["status", "done"]);
    }

    #[tokio::test]
    async fn test_writer_failure_trips_lost() {
        let (tx, rx) = mpsc::unbounded::<Message>();
        drop(rx);
        let writer = EventWriter::new(tx, Duration::from_secs(1));

        let err = writer.ping(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ProtocolError::WriteFailed { .. }));
        assert!(writer.lost().is_cancelled());

        let err = writer.send(&ServerMessage::Done).await.unwrap_err();
        assert_eq!(err, ProtocolError::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_session_happy_path() {
        let (in_tx, out_rx, handle) = spawn_session(rag(0), fast_timings());
        in_tx
            .unbounded_send(text(r#"{"type":"ask","query":"test","top_k":2}"#))
            .unwrap();

        let session = handle.await.unwrap();
        assert_eq!(session.phase, SessionPhase::Terminated);
        assert!(session.has_received_ask);
        assert!(!session.heartbeat_active);
        assert!(session.last_write_deadline.is_some());

        let frames: Vec<Message> = out_rx.collect().await;
        let events = transcript(&frames);
        assert_eq!(
            event_types(&frames),
            vec!["status", "status", "status", "delta", "delta", "hits", "done"]
        );
        assert_eq!(events[0]["stage"], "embedding");
        assert_eq!(events[1]["stage"], "search");
        assert_eq!(events[2]["stage"], "llm");
        assert_eq!(events[5]["items"][0]["id"], "1");
    }

    #[tokio::test]
    async fn test_session_malformed_ask() {
        let (in_tx, out_rx, handle) = spawn_session(rag(0), fast_timings());
        in_tx.unbounded_send(text(r#"{"type":"ask"}"#)).unwrap();

        let session = handle.await.unwrap();
        assert!(!session.has_received_ask);
        assert_eq!(session.phase, SessionPhase::Terminated);

        let frames: Vec<Message> = out_rx.collect().await;
        let events = transcript(&frames);
        assert_eq!(events, vec![serde_json::json!({"type": "error", "msg": "invalid ask"})]);
    }

    #[tokio::test]
    async fn test_session_ask_timeout() {
        let (in_tx, out_rx, handle) = spawn_session(rag(0), fast_timings());

        let session = handle.await.unwrap();
        drop(in_tx);
        assert_eq!(session.phase, SessionPhase::Terminated);

        let frames: Vec<Message> = out_rx.collect().await;
        assert_eq!(
            transcript(&frames),
            vec![serde_json::json!({"type": "error", "msg": "invalid ask"})]
        );
    }

    #[tokio::test]
    async fn test_session_top_k_out_of_range() {
        let (in_tx, out_rx, handle) = spawn_session(rag(0), fast_timings());
        in_tx
            .unbounded_send(text(r#"{"type":"ask","query":"q","top_k":500}"#))
            .unwrap();

        let session = handle.await.unwrap();
        assert!(session.has_received_ask);

        let frames: Vec<Message> = out_rx.collect().await;
        let events = transcript(&frames);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "error");
        assert!(events[0]["msg"].as_str().unwrap().contains("top_k"));
    }

    #[tokio::test]
    async fn test_session_cancel_frame() {
        let (in_tx, out_rx, handle) = spawn_session(rag_with(150, 0), fast_timings());
        in_tx
            .unbounded_send(text(r#"{"type":"ask","query":"q"}"#))
            .unwrap();
        in_tx.unbounded_send(text(r#"{"type":"cancel"}"#)).unwrap();

        handle.await.unwrap();
        let frames: Vec<Message> = out_rx.collect().await;
        let events = transcript(&frames);
        let last = events.last().unwrap();
        assert_eq!(last["type"], "error");
        assert_eq!(last["msg"], "cancelled");
        let types = event_types(&frames);
        assert!(!types.contains(&"hits".to_string()));
        assert!(!types.contains(&"done".to_string()));
        assert!(!types.contains(&"delta".to_string()));
    }

    #[tokio::test]
    async fn test_session_peer_close_sends_no_terminal_event() {
        let (in_tx, out_rx, handle) = spawn_session(rag(500), fast_timings());
        in_tx
            .unbounded_send(text(r#"{"type":"ask","query":"q"}"#))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(in_tx);

        let session = handle.await.unwrap();
        assert_eq!(session.phase, SessionPhase::Terminated);

        let frames: Vec<Message> = out_rx.collect().await;
        let types = event_types(&frames);
        assert!(!types.iter().any(|t| t == "done" || t == "error" || t == "delta"));
    }

    #[tokio::test]
    async fn test_session_read_deadline_without_pongs() {
        let timings = SessionTimings {
            read_deadline: Duration::from_millis(80),
            ..fast_timings()
        };
        let (in_tx, out_rx, handle) = spawn_session(rag(1_000), timings);
        in_tx
            .unbounded_send(text(r#"{"type":"ask","query":"q"}"#))
            .unwrap();

        let session = handle.await.unwrap();
        assert_eq!(session.phase, SessionPhase::Terminated);
        drop(in_tx);

        let frames: Vec<Message> = out_rx.collect().await;
        let types = event_types(&frames);
        assert!(!types.iter().any(|t| t == "done" || t == "error"));
    }

    #[tokio::test]
    async fn test_session_heartbeat_pongs_extend_deadline() {
        let timings = SessionTimings {
            heartbeat_interval: Duration::from_millis(20),
            read_deadline: Duration::from_millis(60),
            ..fast_timings()
        };
        let (in_tx, mut out_rx, handle) = spawn_session(rag(250), timings);
        in_tx
            .unbounded_send(text(r#"{"type":"ask","query":"q"}"#))
            .unwrap();

        // Answer every ping like a browser would.
        let mut frames = Vec::new();
        while let Some(frame) = out_rx.next().await {
            if let Message::Ping(payload) = &frame {
                let _ = in_tx.unbounded_send(Ok(Message::Pong(payload.clone())));
            }
            frames.push(frame);
        }

        let session = handle.await.unwrap();
        assert_eq!(session.phase, SessionPhase::Terminated);
        let events = transcript(&frames);
        assert!(events.iter().filter(|e| *e == "<ping>").count() >= 3);
        let types = event_types(&frames);
        assert_eq!(types.last().map(String::as_str), Some("done"));
    }

    #[tokio::test]
    async fn test_failed_ping_write_ends_session() {
        let written = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = FailingSink {
            written: written.clone(),
            capacity: 3,
        };
        let (in_tx, in_rx) = mpsc::unbounded::<Result<Message, std::io::Error>>();
        in_tx
            .unbounded_send(text(r#"{"type":"ask","query":"q"}"#))
            .unwrap();
        let timings = SessionTimings {
            heartbeat_interval: Duration::from_millis(30),
            ..fast_timings()
        };
        let rag = rag(2_000);

        let started = Instant::now();
        let session = timeout(
            Duration::from_secs(1),
            run_session(Session::new(Uuid::new_v4()), sink, in_rx, &rag, timings),
        )
        .await
        .expect("session must end once a ping cannot be written");

        assert_eq!(session.phase, SessionPhase::Terminated);
        assert!(!session.heartbeat_active);
        assert!(started.elapsed() < Duration::from_millis(500));

        // Only the three statuses made it out; nothing follows the failed ping.
        let frames = written.lock().unwrap().clone();
        assert_eq!(event_types(&frames), vec!["status", "status", "status"]);
        assert_eq!(frames.len(), 3);
        drop(in_tx);
    }

    #[tokio::test]
    async fn test_stalled_write_hits_deadline() {
        let writer = EventWriter::new(StalledSink, Duration::from_millis(50));
        let err = writer
            .send(&ServerMessage::status("search", "x"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::WriteFailed {
                message: "write deadline exceeded".to_string()
            }
        );
        assert!(writer.lost().is_cancelled());
        assert_eq!(
            writer.send(&ServerMessage::Done).await.unwrap_err(),
            ProtocolError::ConnectionClosed
        );
    }

    #[tokio::test]
    async fn test_stalled_peer_ends_session() {
        let (in_tx, in_rx) = mpsc::unbounded::<Result<Message, std::io::Error>>();
        in_tx
            .unbounded_send(text(r#"{"type":"ask","query":"q"}"#))
            .unwrap();
        let timings = SessionTimings {
            write_deadline: Duration::from_millis(50),
            ping_write_deadline: Duration::from_millis(50),
            ..fast_timings()
        };
        let rag = rag(2_000);

        let started = Instant::now();
        let session = timeout(
            Duration::from_secs(2),
            run_session(Session::new(Uuid::new_v4()), StalledSink, in_rx, &rag, timings),
        )
        .await
        .expect("session must end once a write misses its deadline");

        assert_eq!(session.phase, SessionPhase::Terminated);
        assert!(session.last_write_deadline.is_some());
        assert!(started.elapsed() < Duration::from_secs(1));
        drop(in_tx);
    }
}
