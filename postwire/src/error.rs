//! `postwire` error types.
use std::{backtrace::Backtrace, fmt, io};

use crate::{
    config::ParseError,
    postgres::{ErrorResponse, ProtocolError},
};

pub use crate::scram::SaslError;

/// A specialized [`Result`] type for `postwire` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from the `postwire` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// The backend error response, if this is a database error.
    pub fn as_database_error(&self) -> Option<&ErrorResponse> {
        match &self.kind {
            ErrorKind::Database(e) => Some(e),
            _ => None,
        }
    }
}

/// All possible error kind from the `postwire` library.
pub enum ErrorKind {
    Config(ParseError),
    Io(io::Error),
    Tls(native_tls::Error),
    Protocol(ProtocolError),
    Database(ErrorResponse),
    Sasl(SaslError),
    UnsupportedAuth(UnsupportedAuth),
    AlreadyConnected(AlreadyConnected),
    Closed(ClientClosed),
    NotQueryable(NotQueryable),
    ConnectTimeout(ConnectTimeout),
    QueryTimeout(QueryTimeout),
    Canceled(QueryCanceled),
    Terminated(ConnectionTerminated),
    TerminatedUnexpectedly(TerminatedUnexpectedly),
}

/// Declare the session's one-message error types.
///
/// Most of what can go wrong with a session has a fixed wording
/// ("client was closed", "query read timeout"); each line here becomes
/// a unit struct whose `Display` is that message, so callers can match
/// on the type instead of the text.
macro_rules! session_errors {
    ($($(#[$meta:meta])* $name:ident => $msg:literal,)+) => {$(
        $(#[$meta])*
        pub struct $name;

        impl std::error::Error for $name { }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str($msg)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "\"{self}\"")
            }
        }
    )+};
}

session_errors! {
    /// An error when the backend requests an authentication
    /// method that is not supported by `postwire`.
    UnsupportedAuth => "auth method is not supported",

    /// A single session is single-use, [`connect`][crate::Session::connect]
    /// can only be called once.
    AlreadyConnected => "client already connected; cannot be reused",

    /// The session was shut down by [`end`][crate::Session::end].
    ClientClosed => "client was closed",

    /// The connection is no longer usable after a transport failure.
    NotQueryable => "the connection is not queryable",

    /// The connect deadline fired before the first `ReadyForQuery`.
    ConnectTimeout => "timeout expired",

    /// The per-query read timeout fired before the query completed.
    QueryTimeout => "query read timeout",

    /// The query was removed from the queue by a cancel request.
    QueryCanceled => "query canceled",

    /// The transport was destroyed while work was outstanding.
    ConnectionTerminated => "connection terminated",

    /// The backend closed the connection without a `Terminate` from us.
    TerminatedUnexpectedly => "connection terminated unexpectedly",
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ParseError>e => ErrorKind::Config(e));
from!(<io::Error>e => ErrorKind::Io(e));
from!(<native_tls::Error>e => ErrorKind::Tls(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<ErrorResponse>e => ErrorKind::Database(e));
from!(<SaslError>e => ErrorKind::Sasl(e));
from!(<UnsupportedAuth>e => ErrorKind::UnsupportedAuth(e));
from!(<AlreadyConnected>e => ErrorKind::AlreadyConnected(e));
from!(<ClientClosed>e => ErrorKind::Closed(e));
from!(<NotQueryable>e => ErrorKind::NotQueryable(e));
from!(<ConnectTimeout>e => ErrorKind::ConnectTimeout(e));
from!(<QueryTimeout>e => ErrorKind::QueryTimeout(e));
from!(<QueryCanceled>e => ErrorKind::Canceled(e));
from!(<ConnectionTerminated>e => ErrorKind::Terminated(e));
from!(<TerminatedUnexpectedly>e => ErrorKind::TerminatedUnexpectedly(e));

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Tls(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Database(e) => e.fmt(f),
            Self::Sasl(e) => e.fmt(f),
            Self::UnsupportedAuth(e) => e.fmt(f),
            Self::AlreadyConnected(e) => e.fmt(f),
            Self::Closed(e) => e.fmt(f),
            Self::NotQueryable(e) => e.fmt(f),
            Self::ConnectTimeout(e) => e.fmt(f),
            Self::QueryTimeout(e) => e.fmt(f),
            Self::Canceled(e) => e.fmt(f),
            Self::Terminated(e) => e.fmt(f),
            Self::TerminatedUnexpectedly(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
