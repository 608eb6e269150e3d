//! The connection session.
use std::{
    collections::BTreeMap,
    pin::Pin,
    sync::{
        Arc, Mutex, Once,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll, ready},
};

use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    time::Instant,
};

use crate::{
    Result,
    cancel,
    config::Config,
    error::ClientClosed,
    postgres::{Notice, Notification},
    query::{Query, QueryJob, QueryOutput, TextQuery},
};

mod driver;
mod shared;

use driver::{CancelAction, Command, Driver, Pending};
use shared::Shared;

/// A single postgres session.
///
/// One session owns one backend connection for its entire lifetime: it
/// is created unconnected, [`connect`][Session::connect] drives it to
/// ready exactly once, queries then execute strictly one at a time on
/// the wire, and [`end`][Session::end] is terminal. A session is never
/// reused after its connection is gone.
///
/// All work is handed to a driver task through a mailbox, so every
/// query completion and error reaches the caller on a later tick.
pub struct Session {
    chan: UnboundedSender<Command>,
    shared: Arc<Shared>,
    config: Config,
    events: Mutex<Option<UnboundedReceiver<Event>>>,
    query_id: AtomicU64,
}

/// A lifecycle signal observed through [`Session::events`].
#[derive(Debug)]
pub enum Event {
    /// The first `ReadyForQuery` arrived; the session is usable.
    Connected,
    /// A backend warning or informational message.
    Notice(Notice),
    /// A `NOTIFY` delivery.
    Notification(Notification),
    /// The queue emptied after at least one query has executed.
    Drain,
    /// A session-fatal error that was not deliverable to a caller.
    Error(crate::Error),
    /// The transport is closed; the session is terminal.
    Ended,
}

impl Session {
    /// Create an unconnected session and spawn its driver task.
    pub fn new(config: Config) -> Session {
        let (chan, commands) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());

        tokio::spawn(Driver::new(
            config.clone(),
            commands,
            events_tx,
            shared.clone(),
        ));

        Session {
            chan,
            shared,
            config,
            events: Mutex::new(Some(events_rx)),
            query_id: AtomicU64::new(0),
        }
    }

    /// Connect and authenticate, resolving on the first `ReadyForQuery`.
    ///
    /// Completes exactly once; a second call fails with
    /// [`AlreadyConnected`][crate::error::AlreadyConnected], a session
    /// cannot be reused.
    pub async fn connect(&self) -> Result<()> {
        let (reply, outcome) = oneshot::channel();
        if self.chan.send(Command::Connect(reply)).is_err() {
            return Err(ClientClosed.into());
        }
        match outcome.await {
            Ok(result) => result,
            Err(_) => Err(ClientClosed.into()),
        }
    }

    /// Create a session and connect it.
    pub async fn connect_with(config: Config) -> Result<Session> {
        let session = Session::new(config);
        session.connect().await?;
        Ok(session)
    }

    /// Enqueue a query; at most one query is on the wire at a time and
    /// the FIFO order is strict.
    ///
    /// The returned handle completes when the query completes or fails.
    /// After [`end`][Session::end] it fails with "client was closed",
    /// and after a transport failure with "not queryable".
    pub fn query(&self, query: impl Into<Query>) -> QueryHandle {
        let query: Query = query.into();
        let (send, recv) = oneshot::channel();

        let id = self.next_query_id();
        let deadline = deadline(query.timeout.or(self.config.query_timeout));
        let job = TextQuery::new(query, self.config.binary, self.config.types.clone(), send);

        self.dispatch(Pending { id, job: Box::new(job), deadline });
        QueryHandle { id, recv }
    }

    /// Enqueue a pre-built query object; returns its id for
    /// [`cancel_query`][Session::cancel_query].
    pub fn submit(&self, job: Box<dyn QueryJob>) -> u64 {
        let id = self.next_query_id();
        let deadline = deadline(job.read_timeout().or(self.config.query_timeout));
        self.dispatch(Pending { id, job, deadline });
        id
    }

    /// Ask the server to abandon a query of this session.
    ///
    /// A still-queued query is simply removed (its handle completes
    /// with a cancellation error). The active query is cancelled
    /// through a second short-lived connection carrying a
    /// `CancelRequest`; the primary connection is never touched.
    pub async fn cancel(&self, query: &QueryHandle) -> Result<()> {
        self.cancel_query(query.id()).await
    }

    /// See [`cancel`][Session::cancel].
    pub async fn cancel_query(&self, id: u64) -> Result<()> {
        let (reply, outcome) = oneshot::channel();
        if self.chan.send(Command::Cancel { id, reply }).is_err() {
            return Ok(());
        }

        match outcome.await {
            Ok(CancelAction::Active) => {
                let Some((process_id, secret_key)) = self.shared.key() else {
                    return Ok(());
                };
                cancel::cancel_request(&self.config, process_id, secret_key).await
            }
            _ => Ok(()),
        }
    }

    /// Shut the session down; idempotent.
    ///
    /// Never-connected sessions resolve immediately. An idle session
    /// sends `Terminate` and closes; a session with an active query or
    /// an unhealthy transport is destroyed instead. Resolves when the
    /// transport is closed.
    pub async fn end(&self) {
        let (reply, closed) = oneshot::channel();
        if self.chan.send(Command::End(reply)).is_err() {
            return;
        }
        let _ = closed.await;
    }

    /// The session's lifecycle event stream. Yields `None` the second
    /// time, the stream can only be taken once.
    pub fn events(&self) -> Option<Events> {
        let mut slot = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.take().map(|recv| Events { recv })
    }

    /// The backend process id from `BackendKeyData`, once connected.
    pub fn process_id(&self) -> Option<i32> {
        self.shared.key().map(|(process_id, _)| process_id)
    }

    /// The backend secret key from `BackendKeyData`, once connected.
    pub fn secret_key(&self) -> Option<i32> {
        self.shared.key().map(|(_, secret_key)| secret_key)
    }

    /// A server parameter reported by `ParameterStatus`.
    pub fn parameter(&self, name: &str) -> Option<String> {
        self.shared.parameter(name)
    }

    /// All server parameters reported so far.
    pub fn parameters(&self) -> BTreeMap<String, String> {
        self.shared.parameters()
    }

    /// The server version in `libpq` numeric format.
    pub fn server_version_num(&self) -> Option<u32> {
        match self.shared.server_version_num.load(Ordering::Relaxed) {
            0 => None,
            version => Some(version),
        }
    }

    /// Number of queued (not yet submitted) queries.
    #[deprecated = "observation window; rely on query handles instead"]
    pub fn queue_len(&self) -> usize {
        observation_warning();
        self.shared.queue_len.load(Ordering::Relaxed)
    }

    /// Whether a query currently owns the wire.
    #[deprecated = "observation window; rely on query handles instead"]
    pub fn has_active_query(&self) -> bool {
        observation_warning();
        self.shared.active_query.load(Ordering::Relaxed) != 0
    }

    fn next_query_id(&self) -> u64 {
        self.query_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn dispatch(&self, pending: Pending) {
        if let Err(failed) = self.chan.send(Command::Query(pending)) {
            // the driver is gone; the job still owes its caller an answer
            if let Command::Query(mut pending) = failed.0 {
                pending.job.handle_error(ClientClosed.into());
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn deadline(timeout: Option<std::time::Duration>) -> Option<Instant> {
    timeout.map(|timeout| Instant::now() + timeout)
}

fn observation_warning() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        #[cfg(feature = "log")]
        log::warn!("session queue observation is deprecated; rely on query handles instead");
    });
}

pin_project_lite::pin_project! {
    /// Completion handle of one enqueued query.
    #[must_use = "futures do nothing unless you `.await` or poll them"]
    pub struct QueryHandle {
        id: u64,
        #[pin]
        recv: oneshot::Receiver<Result<QueryOutput>>,
    }
}

impl QueryHandle {
    /// Identifier for [`Session::cancel_query`].
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for QueryHandle {
    type Output = Result<QueryOutput>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.project();
        match ready!(this.recv.poll(cx)) {
            Ok(result) => Poll::Ready(result),
            // the driver dropped the job without answering
            Err(_) => Poll::Ready(Err(ClientClosed.into())),
        }
    }
}

/// Stream of [`Event`]s, taken once from [`Session::events`].
pub struct Events {
    recv: UnboundedReceiver<Event>,
}

impl Events {
    /// Receive the next event; `None` once the session driver is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.recv.recv().await
    }
}

impl futures_core::Stream for Events {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Event>> {
        self.recv.poll_recv(cx)
    }
}
