//! The request/response loop shared by both peers.
//!
//! One reader task per transport consumes frames and routes them: RESULT
//! and ERROR wake the completion registered for their request id, CALL-ish
//! kinds become worker-pool tasks executed under the logical-thread id the
//! frame carries, and RELEASE_HANDLE is applied inline without a worker.
//! Outgoing calls allocate a fresh request id, register a completion, and
//! park; a worker parked this way is marked busy-awaiting-response so the
//! pool can grow when a re-entrant callback needs serving.
//!
//! Session close fails every pending completion with `session_closed`. A
//! request that times out on the caller's side stays registered until its
//! response eventually arrives and is discarded, preserving request-id
//! integrity.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::sync::{oneshot, watch};
use tokio_util::codec::FramedRead;
use tracing::{debug, error, trace, warn};

use crate::{
    codec::{self, Cursor, Value, put_blob, put_str},
    error::{BridgeError, ErrorKind, ErrorPayload},
    logical::{self, LogicalThreads},
    pool::WorkerPool,
    protocol::{Frame, FrameCodec, MessageKind, write_frame},
    transport::{PeerInfo, Transport, TransportWriter},
};

tokio::task_local! {
    static IN_WORKER: bool;
}

/// Per-session traffic counters, exposed for tests and the admin surface.
#[derive(Debug, Default)]
pub struct Counters {
    /// Requests this side has served.
    pub requests_served: AtomicU64,
    /// Frames read off the transport.
    pub frames_in: AtomicU64,
    /// Frames written to the transport.
    pub frames_out: AtomicU64,
    /// Payload-inclusive bytes read.
    pub bytes_in: AtomicU64,
    /// Payload-inclusive bytes written.
    pub bytes_out: AtomicU64,
}

impl Counters {
    fn frame_len(frame: &Frame) -> u64 {
        (4 + crate::protocol::FRAME_META_LEN + frame.payload.len()) as u64
    }
}

/// Role-specific request processing plugged into the engine.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Serve one inbound request; the returned value (or failure payload)
    /// becomes the RESULT/ERROR frame.
    async fn handle(&self, engine: &Engine, frame: Frame) -> Result<Value, ErrorPayload>;

    /// Apply an inline RELEASE_HANDLE.
    fn release(&self, handle: u64, count: u64);

    /// Observe session teardown.
    fn on_close(&self) {}
}

struct EngineShared {
    writer: tokio::sync::Mutex<TransportWriter>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, ErrorPayload>>>>,
    next_request: AtomicU64,
    pool: WorkerPool,
    logical: Arc<LogicalThreads>,
    peer: PeerInfo,
    closed: Arc<AtomicBool>,
    close_tx: watch::Sender<bool>,
    handler: OnceLock<Arc<dyn Handler>>,
    counters: Counters,
}

/// The dispatch engine for one session endpoint.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("peer", &self.shared.peer)
            .field("closed", &self.shared.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Build an engine over a transport; `start` must be called with the
    /// role handler before frames flow.
    #[must_use]
    pub fn new(transport: Transport, min_workers: u32, logical: Arc<LogicalThreads>) -> Self {
        let (reader, writer, peer, closed) = transport.into_parts();
        let (close_tx, _) = watch::channel(false);
        let shared = Arc::new(EngineShared {
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(0),
            pool: WorkerPool::new(min_workers.max(1) as usize),
            logical,
            peer,
            closed,
            close_tx,
            handler: OnceLock::new(),
            counters: Counters::default(),
        });
        let engine = Self { shared };
        engine.spawn_reader(reader);
        engine
    }

    /// Install the role handler and let queued work proceed.
    pub fn start(&self, handler: Arc<dyn Handler>) {
        let _ = self.shared.handler.set(handler);
    }

    /// Peer metadata for this session.
    #[must_use]
    pub fn peer(&self) -> &PeerInfo { &self.shared.peer }

    /// Logical-thread allocator for this endpoint.
    #[must_use]
    pub fn logical(&self) -> &Arc<LogicalThreads> { &self.shared.logical }

    /// Traffic counters.
    #[must_use]
    pub fn counters(&self) -> &Counters { &self.shared.counters }

    /// Whether the session has been torn down.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.shared.closed.load(Ordering::Acquire) }

    /// Completes when the session closes.
    pub async fn closed(&self) {
        let mut rx = self.shared.close_tx.subscribe();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    fn spawn_reader(&self, reader: crate::transport::TransportReader) {
        let engine = self.clone();
        let mut close_rx = self.shared.close_tx.subscribe();
        let mut frames = FramedRead::new(reader, FrameCodec);
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = frames.next() => frame,
                    _ = close_rx.changed() => break,
                };
                match frame {
                    None => break,
                    Some(Ok(frame)) => {
                        engine.shared.counters.frames_in.fetch_add(1, Ordering::Relaxed);
                        engine
                            .shared
                            .counters
                            .bytes_in
                            .fetch_add(Counters::frame_len(&frame), Ordering::Relaxed);
                        engine.route(frame);
                    }
                    Some(Err(e)) => {
                        debug!(peer = %engine.shared.peer.address, "reader stopping: {e}");
                        break;
                    }
                }
            }
            engine.close().await;
        });
    }

    fn route(&self, frame: Frame) {
        match frame.kind {
            MessageKind::Result => self.complete(frame.request_id, Self::decode_result(&frame)),
            MessageKind::Error => {
                self.complete(frame.request_id, Err(Self::decode_error(&frame)));
            }
            MessageKind::ReleaseHandle => {
                let mut cur = Cursor::new(&frame.payload);
                if let (Ok(handle), Ok(count)) = (cur.get_u64(), cur.get_u64()) {
                    if let Some(handler) = self.shared.handler.get() {
                        handler.release(handle, count);
                    }
                } else {
                    warn!("malformed RELEASE_HANDLE payload");
                }
            }
            MessageKind::Goodbye => {
                let engine = self.clone();
                tokio::spawn(async move { engine.close().await });
            }
            _ => self.submit_request(frame),
        }
    }

    fn decode_result(frame: &Frame) -> Result<Value, ErrorPayload> {
        let mut cur = Cursor::new(&frame.payload);
        Value::decode(&mut cur).map_err(|e| {
            ErrorPayload::new(ErrorKind::ProtocolError, format!("bad RESULT payload: {e}"))
        })
    }

    fn decode_error(frame: &Frame) -> ErrorPayload {
        let mut cur = Cursor::new(&frame.payload);
        let parsed = (|| -> Result<ErrorPayload, codec::CodecError> {
            let code = cur.get_u8()?;
            let kind = ErrorKind::from_code(code).ok_or(codec::CodecError::BadTag(code))?;
            let message = cur.get_str()?;
            let stack = cur.get_blob()?;
            Ok(ErrorPayload {
                kind,
                message,
                stack,
            })
        })();
        parsed.unwrap_or_else(|e| {
            ErrorPayload::new(ErrorKind::ProtocolError, format!("bad ERROR payload: {e}"))
        })
    }

    fn complete(&self, request_id: u64, outcome: Result<Value, ErrorPayload>) {
        let sender = self
            .shared
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&request_id);
        match sender {
            // A dropped receiver is a caller that timed out; the response
            // is discarded, as promised.
            Some(tx) => drop(tx.send(outcome)),
            None => trace!(request_id, "response for unknown request discarded"),
        }
    }

    fn submit_request(&self, frame: Frame) {
        let engine = self.clone();
        let submitted = self.shared.pool.submit(Box::new(move |worker_id| {
            Box::pin(async move {
                engine.serve(worker_id, frame).await;
            })
        }));
        if !submitted {
            warn!("request dropped: pool is shut down");
        }
    }

    async fn serve(&self, worker_id: u64, frame: Frame) {
        let (request_id, logical_id) = (frame.request_id, frame.logical_id);
        if let Err(e) = self.shared.logical.bind(worker_id, logical_id) {
            error!("logical bind failed: {e}");
            let payload = ErrorPayload::new(ErrorKind::ProtocolError, e.to_string());
            let _ = self.write_error(request_id, logical_id, &payload).await;
            return;
        }
        let outcome = logical::scope(logical_id, IN_WORKER.scope(true, async {
            let Some(handler) = self.shared.handler.get() else {
                return Err(ErrorPayload::new(
                    ErrorKind::ProtocolError,
                    "no handler installed",
                ));
            };
            handler.handle(self, frame).await
        }))
        .await;
        self.shared.logical.unbind(worker_id);
        self.shared
            .counters
            .requests_served
            .fetch_add(1, Ordering::Relaxed);
        let write_result = match outcome {
            Ok(value) => self.write_result(request_id, logical_id, &value).await,
            Err(payload) => self.write_error(request_id, logical_id, &payload).await,
        };
        if let Err(e) = write_result {
            debug!("reply write failed: {e}");
        }
    }

    async fn write(&self, frame: Frame) -> Result<(), BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::local(
                ErrorKind::SessionClosed,
                "session is closed",
            ));
        }
        let mut writer = self.shared.writer.lock().await;
        write_frame(&mut *writer, &frame)
            .await
            .map_err(|e| BridgeError::local(ErrorKind::SessionClosed, e.to_string()))?;
        self.shared.counters.frames_out.fetch_add(1, Ordering::Relaxed);
        self.shared
            .counters
            .bytes_out
            .fetch_add(Counters::frame_len(&frame), Ordering::Relaxed);
        Ok(())
    }

    async fn write_result(
        &self,
        request_id: u64,
        logical_id: u64,
        value: &Value,
    ) -> Result<(), BridgeError> {
        let mut payload = BytesMut::new();
        value.encode(&mut payload);
        self.write(Frame::new(
            MessageKind::Result,
            request_id,
            logical_id,
            payload.freeze(),
        ))
        .await
    }

    async fn write_error(
        &self,
        request_id: u64,
        logical_id: u64,
        payload: &ErrorPayload,
    ) -> Result<(), BridgeError> {
        let mut buf = BytesMut::new();
        buf.put_u8(payload.kind.code());
        put_str(&mut buf, &payload.message);
        put_blob(&mut buf, &payload.stack);
        self.write(Frame::new(
            MessageKind::Error,
            request_id,
            logical_id,
            buf.freeze(),
        ))
        .await
    }

    /// The logical id the current task runs under, minting a fresh
    /// top-level id when called from outside any request context.
    #[must_use]
    pub fn current_logical(&self) -> u64 {
        logical::current().unwrap_or_else(|| self.shared.logical.allocate())
    }

    /// Issue a request and wait for its correlated response.
    ///
    /// # Errors
    /// Returns the peer's failure payload as [`BridgeError::Remote`], or a
    /// local `session_closed` failure.
    pub async fn call(&self, kind: MessageKind, payload: Bytes) -> Result<Value, BridgeError> {
        self.call_with_timeout(kind, payload, None).await
    }

    /// Issue a request with an optional caller-side timeout.
    ///
    /// Expiry raises `timed_out` locally without signalling the peer; the
    /// eventual response is discarded on arrival.
    ///
    /// # Errors
    /// As [`Engine::call`], plus a local `timed_out` failure.
    pub async fn call_with_timeout(
        &self,
        kind: MessageKind,
        payload: Bytes,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::local(
                ErrorKind::SessionClosed,
                "session is closed",
            ));
        }
        let request_id = self.shared.next_request.fetch_add(1, Ordering::Relaxed) + 1;
        let logical_id = self.current_logical();
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(request_id, tx);
        let frame = Frame::new(kind, request_id, logical_id, payload);
        if let Err(e) = self.write(frame).await {
            self.shared
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(&request_id);
            return Err(e);
        }
        trace!(request_id, logical_id, ?kind, "request sent");
        // Workers parked on a response are what the pool grows around.
        let _guard = IN_WORKER
            .try_with(|in_worker| *in_worker)
            .unwrap_or(false)
            .then(|| self.shared.pool.awaiting_guard());
        let wait = async {
            match rx.await {
                Ok(outcome) => outcome.map_err(BridgeError::Remote),
                Err(_) => Err(BridgeError::local(
                    ErrorKind::SessionClosed,
                    "session closed while waiting",
                )),
            }
        };
        match timeout {
            None => wait.await,
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(outcome) => outcome,
                // The pending entry stays registered; the late response is
                // discarded when it lands.
                Err(_) => Err(BridgeError::local(
                    ErrorKind::TimedOut,
                    format!("no response within {limit:?}"),
                )),
            },
        }
    }

    /// Send a frame that expects no response.
    ///
    /// # Errors
    /// Returns a local `session_closed` failure when the transport is
    /// down.
    pub async fn notify(&self, kind: MessageKind, payload: Bytes) -> Result<(), BridgeError> {
        let logical_id = self.current_logical();
        self.write(Frame::new(kind, 0, logical_id, payload)).await
    }

    /// Tear the session down: fail every pending completion with
    /// `session_closed`, stop the pool, and notify observers.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(peer = %self.shared.peer.address, "closing session");
        let _ = self.shared.close_tx.send(true);
        let pending: Vec<_> = {
            let mut map = self
                .shared
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            map.drain().collect()
        };
        for (_, tx) in pending {
            let _ = tx.send(Err(ErrorPayload::new(
                ErrorKind::SessionClosed,
                "session closed",
            )));
        }
        self.shared.pool.shutdown();
        if let Some(handler) = self.shared.handler.get() {
            handler.on_close();
        }
        let mut writer = self.shared.writer.lock().await;
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut *writer).await;
    }

    /// Announce an orderly shutdown to the peer, then close locally.
    pub async fn goodbye(&self) {
        let _ = self
            .notify(MessageKind::Goodbye, Bytes::new())
            .await;
        self.close().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(&self, _engine: &Engine, frame: Frame) -> Result<Value, ErrorPayload> {
            let mut cur = Cursor::new(&frame.payload);
            let value = Value::decode(&mut cur)
                .map_err(|e| ErrorPayload::new(ErrorKind::ProtocolError, e.to_string()))?;
            match value {
                Value::Str(s) if s == "fail" => {
                    Err(ErrorPayload::new(ErrorKind::RemoteException, "asked to"))
                }
                other => Ok(other),
            }
        }

        fn release(&self, _handle: u64, _count: u64) {}
    }

    fn pair() -> (Engine, Engine) {
        let (a, b) = Transport::pair(4096);
        let left = Engine::new(a, 2, Arc::new(LogicalThreads::originator()));
        let right = Engine::new(b, 2, Arc::new(LogicalThreads::responder()));
        left.start(Arc::new(Echo));
        right.start(Arc::new(Echo));
        (left, right)
    }

    fn encoded(value: &Value) -> Bytes {
        let mut buf = BytesMut::new();
        value.encode(&mut buf);
        buf.freeze()
    }

    #[tokio::test]
    async fn request_and_response_correlate() {
        let (left, _right) = pair();
        let out = left
            .call(MessageKind::Ping, encoded(&Value::Str("hi".into())))
            .await
            .unwrap();
        assert_eq!(out, Value::Str("hi".into()));
    }

    #[tokio::test]
    async fn errors_surface_with_kind() {
        let (left, _right) = pair();
        let err = left
            .call(MessageKind::Ping, encoded(&Value::Str("fail".into())))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteException);
    }

    #[tokio::test]
    async fn many_in_flight_requests_all_complete() {
        let (left, _right) = pair();
        let mut handles = Vec::new();
        for i in 0..16i64 {
            let left = left.clone();
            handles.push(tokio::spawn(async move {
                left.call(MessageKind::Ping, encoded(&Value::I64(i))).await
            }));
        }
        for (i, h) in handles.into_iter().enumerate() {
            let out = h.await.unwrap().unwrap();
            assert_eq!(out, Value::I64(i64::try_from(i).unwrap()));
        }
    }

    #[tokio::test]
    async fn close_fails_pending_with_session_closed() {
        let (a, _b) = Transport::pair(4096);
        let left = Engine::new(a, 1, Arc::new(LogicalThreads::originator()));
        left.start(Arc::new(Echo));
        // _b is never started, so nothing will answer.
        let call = {
            let left = left.clone();
            tokio::spawn(async move {
                left.call(MessageKind::Ping, encoded(&Value::Null)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        left.close().await;
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionClosed);
    }

    #[tokio::test]
    async fn timeout_is_local_and_keeps_request_registered() {
        let (a, _b) = Transport::pair(4096);
        let left = Engine::new(a, 1, Arc::new(LogicalThreads::originator()));
        left.start(Arc::new(Echo));
        let err = left
            .call_with_timeout(
                MessageKind::Ping,
                encoded(&Value::Null),
                Some(Duration::from_millis(10)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert!(!left.is_closed(), "timeout does not tear the session down");
    }
}
