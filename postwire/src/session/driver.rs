//! The session driver task.
//!
//! One driver owns the transport for the whole session. Callers hand
//! work in through the command mailbox and get answers back through
//! oneshot channels, so every completion reaches them on a later tick
//! and no handler re-enters the dispatcher.
use std::{
    collections::VecDeque,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tokio::{
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    time::{Instant, Sleep, sleep_until},
};

use super::{Event, shared::Shared};
use crate::{
    Error, ErrorKind, Result,
    config::Config,
    error::{
        AlreadyConnected, ClientClosed, ConnectTimeout, ConnectionTerminated, NotQueryable,
        QueryCanceled, QueryTimeout, TerminatedUnexpectedly,
    },
    postgres::{BackendMessage, ProtocolError, frontend},
    query::QueryJob,
    startup::{Handshake, handshake},
    transport::PgStream,
};

/// A caller request handed through the mailbox.
pub(crate) enum Command {
    Connect(oneshot::Sender<Result<()>>),
    Query(Pending),
    Cancel { id: u64, reply: oneshot::Sender<CancelAction> },
    End(oneshot::Sender<()>),
}

/// What the driver decided about a cancel request.
pub(crate) enum CancelAction {
    /// The query owns the wire; a `CancelRequest` side connection is
    /// the only way to stop it.
    Active,
    /// The query was still queued and has been removed.
    Removed,
    Unknown,
}

/// One enqueued query with its single-shot read deadline.
pub(crate) struct Pending {
    pub id: u64,
    pub job: Box<dyn QueryJob>,
    pub deadline: Option<Instant>,
}

type HandshakeFuture = Pin<Box<dyn Future<Output = Result<Handshake>> + Send>>;

/// `New -> Connecting -> Open (ready/executing) -> Ending -> Ended`
enum State {
    /// Created, waiting for `connect()`.
    New,
    /// Transport + startup + authentication in flight.
    Connecting { f: HandshakeFuture },
    /// Connected; executing whenever a query owns the wire.
    Open { io: PgStream },
    /// `Terminate` buffered; flushing and closing the transport.
    Ending { io: PgStream },
    /// Terminal.
    Ended,
}

pub(crate) struct Driver {
    recv: UnboundedReceiver<Command>,
    state: State,
    sess: Core,
}

/// Session bookkeeping shared by every state.
struct Core {
    config: Config,
    events: UnboundedSender<Event>,
    shared: Arc<Shared>,
    queue: VecDeque<Pending>,
    active: Option<Pending>,
    ready_for_query: bool,
    queryable: bool,
    ending: bool,
    has_executed: bool,
    /// connect-phase callback; taken by the first outcome, which
    /// makes later connect-phase errors no-ops
    connect_reply: Option<oneshot::Sender<Result<()>>>,
    end_replies: Vec<oneshot::Sender<()>>,
    timer: Option<Pin<Box<Sleep>>>,
}

impl Driver {
    pub(crate) fn new(
        config: Config,
        recv: UnboundedReceiver<Command>,
        events: UnboundedSender<Event>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            recv,
            state: State::New,
            sess: Core {
                config,
                events,
                shared,
                queue: VecDeque::new(),
                active: None,
                ready_for_query: false,
                queryable: true,
                ending: false,
                has_executed: false,
                connect_reply: None,
                end_replies: Vec::new(),
                timer: None,
            },
        }
    }
}

impl Future for Driver {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        let Driver { recv, state, sess } = self.as_mut().get_mut();

        // set when every session handle is gone; only then may the
        // terminal state stop answering
        let mut orphaned = false;

        loop {
            // 1. collect all caller requests upfront
            loop {
                match recv.poll_recv(cx) {
                    Poll::Ready(Some(cmd)) => command(state, sess, cmd),
                    Poll::Ready(None) => {
                        orphaned = true;
                        hangup(state, sess);
                        break;
                    }
                    Poll::Pending => break,
                }
            }

            // 2. the read deadline runs in every state, queries can be
            //    enqueued before the session is connected
            sess.poll_timer(cx);

            // 3. advance the state machine
            match state {
                State::New => return Poll::Pending,

                State::Connecting { f } => match f.as_mut().poll(cx) {
                    Poll::Ready(Ok(handshake)) => {
                        *state = finish_connect(sess, handshake);
                    }
                    Poll::Ready(Err(err)) => {
                        fail_connect(state, sess, err);
                    }
                    Poll::Pending => return Poll::Pending,
                },

                State::Open { io } => {
                    if let Poll::Ready(Err(err)) = io.poll_flush(cx) {
                        broken(state, sess, err.into());
                        continue;
                    }

                    let mut fatal = None;
                    loop {
                        match io.poll_recv(cx) {
                            Poll::Ready(Ok(message)) => {
                                if let Err(err) = sess.route(message, io) {
                                    fatal = Some(err);
                                    break;
                                }
                            }
                            Poll::Ready(Err(err)) => {
                                fatal = Some(err);
                                break;
                            }
                            Poll::Pending => break,
                        }
                    }
                    if let Some(err) = fatal {
                        broken(state, sess, err);
                        continue;
                    }

                    // a pulse inside route() may have buffered frames
                    if let Poll::Ready(Err(err)) = io.poll_flush(cx) {
                        broken(state, sess, err.into());
                        continue;
                    }

                    // routing may have re-armed the read deadline; poll
                    // it so the new timer's waker is registered
                    sess.poll_timer(cx);

                    return Poll::Pending;
                }

                State::Ending { io } => {
                    // this close is ours; io failures here are moot
                    match io.poll_flush(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(_) => {}
                    }
                    match io.poll_shutdown(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(_) => {}
                    }
                    *state = State::Ended;
                    finish_end(sess);
                }

                // terminal, but the mailbox keeps answering misuse:
                // a second connect() must observe AlreadyConnected
                State::Ended if orphaned => return Poll::Ready(()),
                State::Ended => return Poll::Pending,
            }
        }
    }
}

fn command(state: &mut State, sess: &mut Core, cmd: Command) {
    match cmd {
        Command::Connect(reply) => match state {
            State::New => {
                sess.connect_reply = Some(reply);
                let config = sess.config.clone();
                *state = State::Connecting { f: Box::pin(connect_with_deadline(config)) };
            }
            _ => {
                let _ = reply.send(Err(AlreadyConnected.into()));
            }
        },

        Command::Query(mut pending) => {
            if sess.ending {
                pending.job.handle_error(ClientClosed.into());
            } else if !sess.queryable {
                pending.job.handle_error(NotQueryable.into());
            } else {
                sess.queue.push_back(pending);
                sess.rearm_timer();
                if let State::Open { io } = state {
                    sess.pulse(io);
                }
                sess.sync_shared();
            }
        }

        Command::Cancel { id, reply } => {
            if sess.active.as_ref().is_some_and(|active| active.id == id) {
                let _ = reply.send(CancelAction::Active);
            } else if let Some(at) = sess.queue.iter().position(|pending| pending.id == id) {
                if let Some(mut pending) = sess.queue.remove(at) {
                    pending.job.handle_error(QueryCanceled.into());
                }
                sess.rearm_timer();
                sess.sync_shared();
                let _ = reply.send(CancelAction::Removed);
            } else {
                let _ = reply.send(CancelAction::Unknown);
            }
        }

        Command::End(reply) => end(state, sess, reply),
    }
}

fn end(state: &mut State, sess: &mut Core, reply: oneshot::Sender<()>) {
    match state {
        // never connected, nothing to close
        State::New => {
            sess.ending = true;
            sess.fail_all(&ClientClosed.into());
            let _ = reply.send(());
            *state = State::Ended;
        }

        // dropping the handshake future closes the half-open transport
        State::Connecting { .. } => {
            sess.ending = true;
            if let Some(connect) = sess.connect_reply.take() {
                let _ = connect.send(Err(ConnectionTerminated.into()));
            }
            sess.fail_all(&ClientClosed.into());
            sess.end_replies.push(reply);
            *state = State::Ended;
            finish_end(sess);
        }

        State::Open { .. } => {
            sess.ending = true;
            sess.end_replies.push(reply);

            match std::mem::replace(state, State::Ended) {
                State::Open { mut io } => {
                    if sess.active.is_some() || !sess.queryable {
                        // forced: destroy the transport instead of a
                        // clean Terminate
                        sess.fail_all(&ConnectionTerminated.into());
                        drop(io);
                        finish_end(sess);
                    } else {
                        let _ = io.send(frontend::Terminate);
                        *state = State::Ending { io };
                    }
                }
                other => *state = other,
            }
        }

        State::Ending { .. } => sess.end_replies.push(reply),

        State::Ended => {
            let _ = reply.send(());
        }
    }
}

/// All session handles are gone; nobody can observe this session
/// anymore, tear it down.
fn hangup(state: &mut State, sess: &mut Core) {
    sess.ending = true;
    sess.fail_all(&ConnectionTerminated.into());
    *state = State::Ended;
}

async fn connect_with_deadline(config: Config) -> Result<Handshake> {
    match config.connect_timeout {
        // on expiry the whole handshake future is dropped, which
        // destroys the half-open transport
        Some(deadline) => match tokio::time::timeout(deadline, handshake(&config)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectTimeout.into()),
        },
        None => handshake(&config).await,
    }
}

fn finish_connect(sess: &mut Core, handshake: Handshake) -> State {
    let Handshake { mut io, key, parameters, server_version_num } = handshake;

    if let Some(key) = key {
        sess.shared.set_key(key);
    }
    if let Some(version) = server_version_num {
        sess.shared
            .server_version_num
            .store(version, std::sync::atomic::Ordering::Relaxed);
    }
    sess.shared.set_parameters(parameters);

    sess.ready_for_query = true;
    if let Some(reply) = sess.connect_reply.take() {
        let _ = reply.send(Ok(()));
    }
    sess.emit(Event::Connected);

    #[cfg(feature = "verbose")]
    tracing::trace!("connected, pulsing {} queued queries", sess.queue.len());
    sess.pulse(&mut io);
    sess.sync_shared();

    State::Open { io }
}

fn fail_connect(state: &mut State, sess: &mut Core, err: Error) {
    sess.queryable = false;

    // the first connect-phase error completes the connect call; any
    // later one in the same window is dropped
    match sess.connect_reply.take() {
        Some(reply) => {
            // with the caller gone, the error event is the fallback
            if let Err(Err(err)) = reply.send(Err(err)) {
                sess.emit(Event::Error(err));
            }
        }
        None => {
            #[cfg(feature = "log")]
            log::debug!("swallowed connect-phase error: {err}");
            let _ = err;
        }
    }

    sess.fail_all(&ConnectionTerminated.into());
    *state = State::Ended;
    finish_end(sess);
}

/// Session-phase fatal: the wire is compromised (§transport error or
/// protocol violation), nothing on this connection can continue.
fn broken(state: &mut State, sess: &mut Core, err: Error) {
    sess.queryable = false;

    // a clean EOF without our Terminate is its own kind of failure
    let err = match err.kind() {
        ErrorKind::Io(io_err) if io_err.kind() == io::ErrorKind::UnexpectedEof => {
            TerminatedUnexpectedly.into()
        }
        _ => err,
    };

    sess.fail_all(&err);
    sess.emit(Event::Error(err));

    *state = State::Ended;
    finish_end(sess);
}

fn finish_end(sess: &mut Core) {
    for reply in sess.end_replies.drain(..) {
        let _ = reply.send(());
    }
    sess.emit(Event::Ended);
    sess.timer = None;
    sess.sync_shared();
}

impl Core {
    /// Route one backend message to its owner per the executing-window
    /// table. An error return means the session is broken.
    fn route(&mut self, message: BackendMessage, io: &mut PgStream) -> Result<()> {
        use BackendMessage::*;

        match message {
            NoticeResponse(notice) => {
                #[cfg(feature = "log")]
                log::info!("{notice}");
                self.emit(Event::Notice(notice));
            }

            NotificationResponse(notification) => {
                self.emit(Event::Notification(notification));
            }

            ParameterStatus(status) => {
                self.shared.set_parameter(status.name, status.value);
            }

            BackendKeyData(key) => self.shared.set_key(key),

            RowDescription(description) => match &mut self.active {
                Some(active) => active.job.handle_row_description(description),
                None => return Err(orphan("RowDescription")),
            },

            DataRow(row) => match &mut self.active {
                Some(active) => active.job.handle_data_row(row),
                None => return Err(orphan("DataRow")),
            },

            CommandComplete(complete) => match &mut self.active {
                Some(active) => active.job.handle_command_complete(complete),
                None => return Err(orphan("CommandComplete")),
            },

            EmptyQueryResponse => match &mut self.active {
                Some(active) => active.job.handle_empty_query_response(),
                None => return Err(orphan("EmptyQueryResponse")),
            },

            PortalSuspended => match &mut self.active {
                Some(active) => active.job.handle_portal_suspended(),
                None => return Err(orphan("PortalSuspended")),
            },

            CopyInResponse(_) => match &mut self.active {
                Some(active) => active.job.handle_copy_in_response(io)?,
                None => return Err(orphan("CopyInResponse")),
            },

            CopyData(data) => match &mut self.active {
                Some(active) => active.job.handle_copy_data(data),
                None => return Err(orphan("CopyData")),
            },

            ParseComplete => match &self.active {
                Some(active) => {
                    if let Some((name, sql)) = active.job.parsed_statement() {
                        io.add_stmt(name.to_owned(), sql.to_owned());
                    }
                }
                None => return Err(orphan("ParseComplete")),
            },

            // extended-protocol bookkeeping with nothing to carry
            BindComplete | CloseComplete | NoData | CopyOutResponse(_) | CopyDone => { }

            ErrorResponse(err) => match self.active.take() {
                // the backend still closes the window with ReadyForQuery,
                // which is what pulses the queue
                Some(mut active) => {
                    active.job.handle_error(err.into());
                    self.rearm_timer();
                    self.sync_shared();
                }
                None => return Err(err.into()),
            },

            ReadyForQuery(_) => {
                if let Some(mut active) = self.active.take() {
                    active.job.handle_ready_for_query();
                }
                self.ready_for_query = true;
                self.pulse(io);
                self.rearm_timer();
                self.sync_shared();
            }

            Authentication(_) => {
                return Err(ProtocolError::new(
                    "unexpected authentication message on a ready session",
                )
                .into());
            }
        }

        Ok(())
    }

    /// Promote the next queued query to active while the connection is
    /// idle. A preflight submit error fails only that query and the
    /// pulse moves on.
    fn pulse(&mut self, io: &mut PgStream) {
        while self.ready_for_query {
            match self.queue.pop_front() {
                Some(mut pending) => match pending.job.submit(io) {
                    Ok(()) => {
                        self.ready_for_query = false;
                        self.has_executed = true;
                        self.active = Some(pending);
                    }
                    Err(err) => {
                        pending.job.handle_error(err);
                        continue;
                    }
                },
                None => {
                    if self.has_executed {
                        self.emit(Event::Drain);
                    }
                    break;
                }
            }
        }
    }

    /// Fail the active query and everything queued, each exactly once.
    fn fail_all(&mut self, err: &Error) {
        if let Some(mut active) = self.active.take() {
            active.job.handle_error(mirror(err));
        }
        while let Some(mut pending) = self.queue.pop_front() {
            pending.job.handle_error(mirror(err));
        }
        self.timer = None;
        self.sync_shared();
    }

    fn poll_timer(&mut self, cx: &mut Context) {
        loop {
            let Some(timer) = self.timer.as_mut() else { return };
            if timer.as_mut().poll(cx).is_pending() {
                return;
            }

            let now = Instant::now();

            let mut at = 0;
            while at < self.queue.len() {
                if self.queue[at].deadline.is_some_and(|deadline| deadline <= now) {
                    if let Some(mut pending) = self.queue.remove(at) {
                        pending.job.handle_error(QueryTimeout.into());
                    }
                } else {
                    at += 1;
                }
            }

            if let Some(active) = self.active.as_mut() {
                if active.deadline.is_some_and(|deadline| deadline <= now) {
                    // the query still owns the wire until its
                    // ReadyForQuery; later completions for it are
                    // swallowed by the consumed result channel
                    active.deadline = None;
                    active.job.handle_error(QueryTimeout.into());
                }
            }

            self.sync_shared();
            self.rearm_timer();
        }
    }

    /// Single timer armed for the earliest outstanding read deadline.
    fn rearm_timer(&mut self) {
        let next = self
            .queue
            .iter()
            .filter_map(|pending| pending.deadline)
            .chain(self.active.as_ref().and_then(|active| active.deadline))
            .min();

        self.timer = next.map(|deadline| Box::pin(sleep_until(deadline)));
    }

    fn sync_shared(&self) {
        use std::sync::atomic::Ordering::Relaxed;
        self.shared.queue_len.store(self.queue.len(), Relaxed);
        self.shared
            .active_query
            .store(self.active.as_ref().map(|a| a.id).unwrap_or(0), Relaxed);
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

fn orphan(name: &str) -> Error {
    ProtocolError::new(format!("unexpected {name} message with no active query")).into()
}

/// Equivalent error for fan-out delivery; `Error` itself is not `Clone`.
fn mirror(err: &Error) -> Error {
    match err.kind() {
        ErrorKind::Io(io_err) => io::Error::new(io_err.kind(), io_err.to_string()).into(),
        ErrorKind::TerminatedUnexpectedly(_) => TerminatedUnexpectedly.into(),
        ErrorKind::Protocol(protocol) => ProtocolError::new(protocol.to_string()).into(),
        ErrorKind::Closed(_) => ClientClosed.into(),
        _ => ConnectionTerminated.into(),
    }
}
