//! An asynchronous Rust client for the [NATS](https://nats.io/) messaging
//! protocol.
//!
//! The client owns a single long lived TCP connection and multiplexes any
//! number of publishers, subscribers, and request/response exchanges over
//! it. A supervisor task keeps the connection alive: when the socket fails
//! it tears the connection cycle down, reconnects, replays the `CONNECT`
//! handshake and every registered subscription, and carries on. Publishes
//! that were still queued locally survive a reconnect; publishes already
//! written to the socket are considered delivered.
//!
//! Each connected cycle runs three tasks. The receiver moves socket bytes
//! into a bounded pipe, the dispatcher parses frames and fans messages out
//! to per-subscription bounded inboxes, and the sender drains the outbound
//! frame queue coalescing bursts of small frames into single socket writes.
//! A slow subscriber eventually fills its inbox, which suspends the
//! dispatcher and in turn the receiver; the whole connection slows down
//! rather than dropping messages.
//!
//! # Example
//!
//! ```no_run
//! use natter::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let address = "127.0.0.1".parse()?;
//!     let client = Client::new(address);
//!     client.connect_mut().echo(true);
//!     client.connect().await?;
//!
//!     let subject = "greet".parse()?;
//!     let (_, mut subscriber) = client.subscribe(&subject, 16).await?;
//!     client.publish(&subject, b"hello").await?;
//!     let msg = subscriber.recv().await.unwrap();
//!     assert_eq!(msg.payload(), b"hello");
//!
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```

mod codec;
mod frame;
mod pool;
mod sender;
mod subscriptions;
mod types;
mod util;

pub use crate::types::{
    error::{Error, Result},
    Address, Authorization, ClientState, Connect, Counters, Headers, Info, Msg, Options,
    ProtocolError, Sid, Subject,
};

use bytes::{Bytes, BytesMut};
use futures::stream::Stream;
use log::{debug, error, info, trace, warn};
use rand::{distributions::Alphanumeric, Rng};
use std::{
    collections::{HashMap, VecDeque},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    io::AsyncReadExt,
    net::{tcp::OwnedReadHalf, TcpStream},
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time,
};
use tokio_util::{codec::Decoder, sync::CancellationToken};

use crate::{
    codec::Codec,
    pool::{BufferPool, PooledBuf},
    sender::SenderExit,
    subscriptions::Registry,
    types::ServerMessage,
};

/// An asynchronous NATS client
///
/// `Client` is a cheaply cloneable handle; clones share one connection.
/// Call [`connect`](Client::connect) to start the connection supervisor,
/// [`disconnect`](Client::disconnect) to stop it (the client can connect
/// again later), and [`dispose`](Client::dispose) to shut down permanently.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    address: Address,
    options: Options,
    connect: Mutex<Connect>,
    pool: BufferPool,
    counters: Arc<Counters>,
    registry: Registry,
    // Serializes subscription installs/removals with the supervisor's
    // resubscribe snapshot so each subscription is announced exactly once
    // per connection. The fan-out read path never takes this lock.
    sub_lock: tokio::sync::Mutex<()>,
    queue_tx: mpsc::Sender<PooledBuf>,
    queue_rx: Mutex<Option<mpsc::Receiver<PooledBuf>>>,
    state_tx: watch::Sender<ClientState>,
    info_tx: watch::Sender<Option<Info>>,
    error_tx: broadcast::Sender<Arc<Error>>,
    pongs: Mutex<VecDeque<oneshot::Sender<()>>>,
    requests: Requests,
    supervisor: Mutex<Option<Supervisor>>,
    disposed: AtomicBool,
}

struct Supervisor {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Requests {
    // "_INBOX.<token>", unique per client
    prefix: String,
    next_id: AtomicU64,
    slots: Mutex<HashMap<String, oneshot::Sender<Msg>>>,
    // Reader of the wildcard inbox subscription; taken by the correlator
    // task on first connect.
    reader: Mutex<Option<mpsc::Receiver<Msg>>>,
}

impl Requests {
    fn next_reply_subject(&self) -> String {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{}.{}", self.prefix, id)
    }
}

impl Client {
    /// Create a client that will connect to `address` with default
    /// [`Options`]
    pub fn new(address: Address) -> Self {
        Self::with_options(address, Options::default())
    }

    pub fn with_options(address: Address, options: Options) -> Self {
        let pool = BufferPool::new();
        let registry = Registry::new();
        let (queue_tx, queue_rx) = mpsc::channel(options.sender_queue_length.max(1));
        let (state_tx, _) = watch::channel(ClientState::Disconnected);
        let (info_tx, _) = watch::channel(None);
        let (error_tx, _) = broadcast::channel(64);

        // One wildcard subscription under a private prefix feeds all
        // request/response exchanges for the lifetime of the client. It is
        // installed before the first connect so the resubscribe preamble
        // replays it like any other subscription.
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(util::INBOX_TOKEN_LENGTH)
            .map(char::from)
            .collect();
        let prefix = format!("{}.{}", util::INBOX_PREFIX, token);
        let inbox_subject: Subject = format!("{}.>", prefix)
            .parse()
            .expect("inbox subject is valid");
        let (_, inbox_reader) =
            registry.add(inbox_subject, None, util::REQUEST_INBOX_CAPACITY);

        Self {
            inner: Arc::new(ClientInner {
                address,
                options,
                connect: Mutex::new(Connect::default()),
                pool,
                counters: Arc::new(Counters::default()),
                registry,
                sub_lock: tokio::sync::Mutex::new(()),
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                state_tx,
                info_tx,
                error_tx,
                pongs: Mutex::new(VecDeque::new()),
                requests: Requests {
                    prefix,
                    next_id: AtomicU64::new(0),
                    slots: Mutex::new(HashMap::new()),
                    reader: Mutex::new(Some(inbox_reader)),
                },
                supervisor: Mutex::new(None),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// The address this client connects to
    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    /// Mutable access to the `CONNECT` options sent on every (re)connect
    pub fn connect_mut(&self) -> MutexGuard<'_, Connect> {
        self.inner.connect.lock().expect("connect lock poisoned")
    }

    /// Start the connection supervisor and wait until the first successful
    /// connection.
    ///
    /// The supervisor keeps retrying (with the configured
    /// `reconnect_delay`) until it reaches the server, and keeps
    /// reconnecting after transient failures until
    /// [`disconnect`](Client::disconnect) or [`dispose`](Client::dispose).
    pub async fn connect(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(Error::AlreadyDisposed);
        }
        let token = {
            let mut supervisor = self
                .inner
                .supervisor
                .lock()
                .expect("supervisor lock poisoned");
            if supervisor.is_some() {
                return Err(Error::AlreadyConnected);
            }
            // A supervisor that was just cancelled may not have handed the
            // queue back yet; treat that window as still connected.
            let queue_rx = match self
                .inner
                .queue_rx
                .lock()
                .expect("queue lock poisoned")
                .take()
            {
                Some(queue_rx) => queue_rx,
                None => return Err(Error::AlreadyConnected),
            };
            let token = CancellationToken::new();
            let handle = tokio::spawn(supervise(
                Arc::clone(&self.inner),
                queue_rx,
                token.clone(),
            ));
            *supervisor = Some(Supervisor {
                token: token.clone(),
                handle,
            });
            token
        };

        // The correlator outlives individual connections; spawn it once.
        let correlator_reader = self
            .inner
            .requests
            .reader
            .lock()
            .expect("request lock poisoned")
            .take();
        if let Some(reader) = correlator_reader {
            tokio::spawn(correlate(Arc::downgrade(&self.inner), reader));
        }

        let mut state_rx = self.inner.state_tx.subscribe();
        loop {
            if state_rx.borrow_and_update().is_connected() {
                return Ok(());
            }
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Stop the connection supervisor and wait for it to wind down. The
    /// client may [`connect`](Client::connect) again afterwards;
    /// subscriptions stay registered in between.
    pub async fn disconnect(&self) {
        let supervisor = self
            .inner
            .supervisor
            .lock()
            .expect("supervisor lock poisoned")
            .take();
        if let Some(Supervisor { token, handle }) = supervisor {
            token.cancel();
            if let Err(e) = handle.await {
                error!("supervisor task failed: {}", e);
            }
        }
    }

    /// Permanently shut the client down: disconnect, close every
    /// subscription inbox, and fail all pending requests.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.disconnect().await;
        self.inner.registry.clear();
        self.inner
            .requests
            .slots
            .lock()
            .expect("request lock poisoned")
            .clear();
        self.inner.drop_pong_waiters();
        info!("client disposed");
    }

    /// Publish `payload` to `subject`
    pub async fn publish(&self, subject: &Subject, payload: &[u8]) -> Result<()> {
        self.publish_with_optional_reply(subject, None, payload)
            .await
    }

    /// Publish `payload` to `subject` asking for replies on `reply_to`
    pub async fn publish_with_reply(
        &self,
        subject: &Subject,
        reply_to: &Subject,
        payload: &[u8],
    ) -> Result<()> {
        self.publish_with_optional_reply(subject, Some(reply_to), payload)
            .await
    }

    pub async fn publish_with_optional_reply(
        &self,
        subject: &Subject,
        reply_to: Option<&Subject>,
        payload: &[u8],
    ) -> Result<()> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(Error::AlreadyDisposed);
        }
        let frame = frame::publish(&self.inner.pool, subject, reply_to, None, payload)?;
        self.inner.enqueue(frame).await
    }

    /// Publish `payload` with `headers` to `subject` as an `HPUB` frame
    pub async fn publish_with_headers(
        &self,
        subject: &Subject,
        headers: &Headers,
        payload: &[u8],
    ) -> Result<()> {
        self.publish_with_headers_and_optional_reply(subject, headers, None, payload)
            .await
    }

    pub async fn publish_with_headers_and_optional_reply(
        &self,
        subject: &Subject,
        headers: &Headers,
        reply_to: Option<&Subject>,
        payload: &[u8],
    ) -> Result<()> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(Error::AlreadyDisposed);
        }
        let frame = frame::publish(&self.inner.pool, subject, reply_to, Some(headers), payload)?;
        self.inner.enqueue(frame).await
    }

    /// Subscribe to `subject` with a bounded inbox of `capacity` messages.
    ///
    /// The subscription takes effect on the server once connected; while
    /// disconnected it is still installed and will be announced by the next
    /// connection's resubscribe. Dropping the returned [`Subscriber`]
    /// unsubscribes.
    pub async fn subscribe(
        &self,
        subject: &Subject,
        capacity: usize,
    ) -> Result<(Sid, Subscriber)> {
        self.subscribe_inner(subject, None, capacity).await
    }

    /// Subscribe as part of `queue_group`, letting the server load balance
    /// deliveries among the group's members
    pub async fn subscribe_with_queue_group(
        &self,
        subject: &Subject,
        queue_group: &str,
        capacity: usize,
    ) -> Result<(Sid, Subscriber)> {
        self.subscribe_inner(subject, Some(String::from(queue_group)), capacity)
            .await
    }

    async fn subscribe_inner(
        &self,
        subject: &Subject,
        queue_group: Option<String>,
        capacity: usize,
    ) -> Result<(Sid, Subscriber)> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(Error::AlreadyDisposed);
        }
        let (sid, reader, announce) = {
            let _guard = self.inner.sub_lock.lock().await;
            let (sid, reader) =
                self.inner
                    .registry
                    .add(subject.clone(), queue_group.clone(), capacity);
            // While disconnected the next resubscribe announces it instead.
            (sid, reader, self.state().is_connected())
        };
        if announce {
            let frame =
                frame::subscribe(&self.inner.pool, subject, queue_group.as_deref(), sid);
            self.inner.enqueue(frame).await?;
        }
        debug!("subscribed to {} with sid {}", subject, sid);
        Ok((
            sid,
            Subscriber {
                sid,
                reader,
                client: Arc::downgrade(&self.inner),
                unsubscribed: false,
            },
        ))
    }

    /// Remove the subscription identified by `sid`
    pub async fn unsubscribe(&self, sid: Sid) -> Result<()> {
        let announce = {
            let _guard = self.inner.sub_lock.lock().await;
            if !self.inner.registry.remove(sid) {
                return Err(Error::UnknownSid(sid));
            }
            self.state().is_connected()
        };
        if announce {
            let frame = frame::unsubscribe(&self.inner.pool, sid, None);
            self.inner.enqueue(frame).await?;
        }
        debug!("unsubscribed sid {}", sid);
        Ok(())
    }

    /// Publish a request and await the reply
    ///
    /// A fresh reply subject under this client's private inbox prefix is
    /// attached to the publish; the reply is routed back through the
    /// client's single inbox subscription. Dropping the returned future
    /// forgets the reply subject, so a late reply is silently discarded.
    pub async fn request(&self, subject: &Subject, payload: &[u8]) -> Result<Msg> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(Error::AlreadyDisposed);
        }
        let reply = self.inner.requests.next_reply_subject();
        let reply_subject: Subject = reply.parse().expect("inbox subject is valid");
        let (tx, rx) = oneshot::channel();
        self.inner
            .requests
            .slots
            .lock()
            .expect("request lock poisoned")
            .insert(reply.clone(), tx);
        let _slot = SlotGuard {
            inner: &self.inner,
            key: &reply,
        };
        self.publish_with_optional_reply(subject, Some(&reply_subject), payload)
            .await?;
        rx.await.map_err(|_| Error::NoResponse)
    }

    /// [`request`](Client::request) failing with
    /// [`RequestTimeout`](Error::RequestTimeout) when no reply arrives
    /// within `timeout`
    pub async fn request_with_timeout(
        &self,
        subject: &Subject,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Msg> {
        match time::timeout(timeout, self.request(subject, payload)).await {
            Ok(result) => result,
            Err(_) => Err(Error::RequestTimeout),
        }
    }

    /// Send a `PING` and await the server's `PONG`, which also acts as a
    /// flush barrier for everything queued before it
    pub async fn ping_pong(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(Error::AlreadyDisposed);
        }
        let (tx, rx) = oneshot::channel();
        self.inner
            .pongs
            .lock()
            .expect("pong lock poisoned")
            .push_back(tx);
        let frame = frame::ping(&self.inner.pool);
        self.inner.enqueue(frame).await?;
        rx.await.map_err(|_| Error::NoResponse)
    }

    /// The current connection state
    pub fn state(&self) -> ClientState {
        self.inner.state_tx.borrow().clone()
    }

    /// A watch over connection state transitions
    pub fn state_stream(&self) -> watch::Receiver<ClientState> {
        self.inner.state_tx.subscribe()
    }

    /// The most recent `INFO` sent by the server, if any
    pub fn server_info(&self) -> Option<Info> {
        self.inner.info_tx.borrow().clone()
    }

    /// A watch over server `INFO` updates
    pub fn info_stream(&self) -> watch::Receiver<Option<Info>> {
        self.inner.info_tx.subscribe()
    }

    /// Transport and protocol errors the supervisor recovered from
    pub fn errors(&self) -> broadcast::Receiver<Arc<Error>> {
        self.inner.error_tx.subscribe()
    }

    /// The client's traffic counters
    pub fn counters(&self) -> &Counters {
        &self.inner.counters
    }
}

// Removes the pending request slot when the request future completes or is
// dropped. Removal is idempotent; after a successful reply the correlator
// has already taken the slot.
struct SlotGuard<'a> {
    inner: &'a ClientInner,
    key: &'a str,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.inner
            .requests
            .slots
            .lock()
            .expect("request lock poisoned")
            .remove(self.key);
    }
}

impl ClientInner {
    /// Reserve queue capacity, then move the frame in. Reserving first
    /// keeps the queue-bytes gauge exact even when the caller's future is
    /// dropped while waiting for capacity (the frame then returns to the
    /// pool unwritten).
    async fn enqueue(&self, frame: PooledBuf) -> Result<()> {
        match self.queue_tx.reserve().await {
            Ok(permit) => {
                self.counters.add_sender_queue_bytes(frame.len() as u64);
                permit.send(frame);
                Ok(())
            }
            Err(_) => Err(Error::AlreadyDisposed),
        }
    }

    // Best effort variant for non-async contexts (drop handlers).
    fn try_enqueue(&self, frame: PooledBuf) {
        if let Ok(permit) = self.queue_tx.try_reserve() {
            self.counters.add_sender_queue_bytes(frame.len() as u64);
            permit.send(frame);
        } else {
            trace!("outbound queue full, dropping control frame");
        }
    }

    fn set_state(&self, state: ClientState) {
        info!("transitioning to state {}", state);
        self.state_tx.send_replace(state);
    }

    fn report_error(&self, error: Error) {
        error!("{}", error);
        let _ = self.error_tx.send(Arc::new(error));
    }

    fn drop_pong_waiters(&self) {
        self.pongs.lock().expect("pong lock poisoned").clear();
    }
}

/// A handle to one subscription's stream of messages
///
/// Obtained from [`Client::subscribe`]. Yields messages in wire order for
/// its sid. The stream ends when the client is disposed or the subscription
/// is removed; dropping the handle unsubscribes.
pub struct Subscriber {
    sid: Sid,
    reader: mpsc::Receiver<Msg>,
    client: Weak<ClientInner>,
    unsubscribed: bool,
}

impl Subscriber {
    pub fn sid(&self) -> Sid {
        self.sid
    }

    /// The next message, or `None` once the subscription is closed
    pub async fn recv(&mut self) -> Option<Msg> {
        self.reader.recv().await
    }

    /// Unsubscribe explicitly. Equivalent to dropping the handle, but reads
    /// better at call sites where the unsubscribe is the point.
    pub fn unsubscribe(mut self) {
        self.remove_registration();
    }

    fn remove_registration(&mut self) {
        if self.unsubscribed {
            return;
        }
        self.unsubscribed = true;
        if let Some(inner) = self.client.upgrade() {
            if inner.registry.remove(self.sid) {
                if inner.state_tx.borrow().is_connected() {
                    inner.try_enqueue(frame::unsubscribe(&inner.pool, self.sid, None));
                }
                debug!("unsubscribed sid {} on drop", self.sid);
            }
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.remove_registration();
    }
}

impl Stream for Subscriber {
    type Item = Msg;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Msg>> {
        self.get_mut().reader.poll_recv(cx)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
// Connection tasks

// The supervisor: connect, run one connection cycle, reconnect on failure,
// until cancelled from the outside.
async fn supervise(
    inner: Arc<ClientInner>,
    mut queue: mpsc::Receiver<PooledBuf>,
    token: CancellationToken,
) {
    let address = inner.address.clone();
    loop {
        inner.set_state(ClientState::Connecting(address.clone()));
        let connected = tokio::select! {
            _ = token.cancelled() => break,
            result = TcpStream::connect(address.address()) => result,
        };
        let stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                inner.report_error(Error::Io(e));
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = time::sleep(inner.options.reconnect_delay) => continue,
                }
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to disable Nagle's algorithm: {}", e);
        }
        info!("connected to {}", address);
        let (read_half, write_half) = stream.into_split();

        let mut connect = inner.connect.lock().expect("connect lock poisoned").clone();
        if let Some(authorization) = address.authorization() {
            connect.apply_authorization(authorization);
        }

        let child = token.child_token();
        let pipe_capacity =
            (inner.options.read_pipe_high_water / util::READ_CHUNK_SIZE).max(1);
        let (pipe_tx, pipe_rx) = mpsc::channel(pipe_capacity);

        let mut receiver_handle = tokio::spawn(receive(
            read_half,
            pipe_tx,
            Arc::clone(&inner.counters),
            child.clone(),
        ));
        let mut dispatcher_handle =
            tokio::spawn(dispatch(Arc::clone(&inner), pipe_rx, child.clone()));

        // The preamble is CONNECT plus one SUB per registered subscription,
        // written before anything that survived in the queue. Building it
        // and flipping to Connected under the subscription lock means a
        // concurrent subscribe either lands in this snapshot or sends its
        // own SUB, never neither.
        let preamble = {
            let _guard = inner.sub_lock.lock().await;
            let mut preamble = vec![frame::connect(&inner.pool, &connect)];
            let snapshot = inner.registry.snapshot();
            let mut sids: Vec<Sid> = snapshot.keys().copied().collect();
            sids.sort_unstable();
            for sid in sids {
                let entry = &snapshot[&sid];
                preamble.push(frame::subscribe(
                    &inner.pool,
                    &entry.subject,
                    entry.queue_group.as_deref(),
                    sid,
                ));
            }
            inner.set_state(ClientState::Connected(address.clone()));
            preamble
        };
        let mut sender_handle = tokio::spawn(sender::run(
            queue,
            write_half,
            preamble,
            Arc::clone(&inner.counters),
            child.clone(),
        ));

        // The first task to stop ends the cycle; cancel the siblings and
        // collect everyone.
        let mut receiver_result = None;
        let mut dispatcher_result = None;
        let mut sender_exit = None;
        tokio::select! {
            r = &mut receiver_handle => receiver_result = Some(r),
            r = &mut dispatcher_handle => dispatcher_result = Some(r),
            r = &mut sender_handle => sender_exit = Some(r),
            _ = token.cancelled() => {}
        }
        child.cancel();
        let receiver_result = match receiver_result {
            Some(r) => r,
            None => receiver_handle.await,
        };
        let dispatcher_result = match dispatcher_result {
            Some(r) => r,
            None => dispatcher_handle.await,
        };
        let sender_exit = match sender_exit {
            Some(r) => r,
            None => sender_handle.await,
        };

        let SenderExit {
            queue: reclaimed,
            result: sender_result,
        } = sender_exit.expect("sender task panicked");
        queue = reclaimed;
        for result in [receiver_result, dispatcher_result] {
            match result {
                Ok(Err(e)) => inner.report_error(e),
                Ok(Ok(())) => {}
                Err(e) => error!("connection task failed: {}", e),
            }
        }
        if let Err(e) = sender_result {
            inner.report_error(e);
        }

        // Outstanding pings can no longer be answered by this connection.
        inner.drop_pong_waiters();
        inner.set_state(ClientState::Disconnected);
        if token.is_cancelled() {
            break;
        }
        info!("connection cycle ended, reconnecting to {}", address);
    }

    // Hand the queue back for a future connect.
    *inner.queue_rx.lock().expect("queue lock poisoned") = Some(queue);
    inner.set_state(ClientState::Disconnected);
    debug!("supervisor stopped");
}

// The receiver: socket bytes into the parser pipe. No parsing here; a slow
// dispatcher fills the pipe and suspends this task, which is what pushes
// back pressure into the server's TCP window.
async fn receive(
    mut reader: OwnedReadHalf,
    pipe: mpsc::Sender<Bytes>,
    counters: Arc<Counters>,
    token: CancellationToken,
) -> Result<()> {
    loop {
        let mut chunk = BytesMut::with_capacity(util::READ_CHUNK_SIZE);
        let read = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            read = reader.read_buf(&mut chunk) => read?,
        };
        if read == 0 {
            debug!("server closed the connection");
            return Ok(());
        }
        counters.add_received_bytes(read as u64);
        counters.add_receiver_queue_bytes(read as u64);
        let sent = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            sent = pipe.send(chunk.freeze()) => sent,
        };
        if sent.is_err() {
            return Ok(());
        }
    }
}

// The dispatcher: drain the pipe through the codec and route every frame.
async fn dispatch(
    inner: Arc<ClientInner>,
    mut pipe: mpsc::Receiver<Bytes>,
    token: CancellationToken,
) -> Result<()> {
    let mut codec = Codec::new(inner.options.max_payload);
    let mut buf = BytesMut::new();
    loop {
        let chunk = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            chunk = pipe.recv() => match chunk {
                Some(chunk) => chunk,
                None => return Ok(()),
            },
        };
        inner.counters.sub_receiver_queue_bytes(chunk.len() as u64);
        buf.extend_from_slice(&chunk);
        while let Some(message) = codec.decode(&mut buf)? {
            handle_message(&inner, message, &token).await;
        }
    }
}

async fn handle_message(inner: &Arc<ClientInner>, message: ServerMessage, token: &CancellationToken) {
    match message {
        ServerMessage::Info(info) => {
            debug!("received INFO from {}", info.server_id);
            inner.info_tx.send_replace(Some(info));
        }
        ServerMessage::Ping => {
            trace!("received PING");
            let pong = frame::pong(&inner.pool);
            tokio::select! {
                _ = token.cancelled() => {}
                result = inner.enqueue(pong) => {
                    if result.is_err() {
                        trace!("PONG not enqueued, client shutting down");
                    }
                }
            }
        }
        ServerMessage::Pong => {
            trace!("received PONG");
            let waiter = inner
                .pongs
                .lock()
                .expect("pong lock poisoned")
                .pop_front();
            if let Some(waiter) = waiter {
                let _ = waiter.send(());
            }
        }
        ServerMessage::Ok => trace!("received +OK"),
        ServerMessage::Err(e) => {
            inner.report_error(Error::ServerError(e));
        }
        ServerMessage::Msg(msg) => {
            inner.counters.add_received_message();
            let sid = msg.sid();
            let snapshot = inner.registry.snapshot();
            match snapshot.get(&sid) {
                Some(entry) => match entry.inbox.try_send(msg) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(msg)) => {
                        // Intentional: a full inbox suspends dispatch, which
                        // suspends the receiver, which slows the connection.
                        tokio::select! {
                            _ = token.cancelled() => {}
                            _ = entry.inbox.send(msg) => {}
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        trace!("subscription {} closed, dropping message", sid);
                    }
                },
                None => trace!("no subscription for sid {}, dropping message", sid),
            }
        }
    }
}

// The request correlator: match replies arriving on the inbox wildcard
// subscription with their pending request. A reply whose slot is gone (the
// request timed out or was dropped) disappears without a trace.
async fn correlate(inner: Weak<ClientInner>, mut reader: mpsc::Receiver<Msg>) {
    while let Some(msg) = reader.recv().await {
        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => break,
        };
        let key = msg.subject().to_string();
        let slot = inner
            .requests
            .slots
            .lock()
            .expect("request lock poisoned")
            .remove(&key);
        match slot {
            Some(tx) => {
                let _ = tx.send(msg);
            }
            None => trace!("no pending request for {}, dropping reply", key),
        }
    }
    debug!("request correlator stopped");
}
