//! The buffered postgres transport.
//!
//! One [`PgStream`] wraps the TCP, unix-socket or TLS stream for the
//! lifetime of a session. Writes are buffered until
//! [`poll_flush`][PgStream::poll_flush]; reads are framed into
//! [`BackendMessage`]s.
use std::{
    io,
    num::NonZeroUsize,
    pin::Pin,
    task::{Context, Poll, ready},
};

use bytes::{Buf, BytesMut};
use lru::LruCache;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::{TcpStream, UnixStream},
};
use tokio_native_tls::TlsStream;

use crate::{
    Result,
    config::{Config, SslMode},
    postgres::{BackendMessage, ProtocolError, frontend},
};

const DEFAULT_BUF_CAPACITY: usize = 1024;

pub struct PgStream {
    stream: Stream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    /// name -> text of statements the backend has already parsed.
    /// A new transport starts with an empty map.
    statements: LruCache<String, String>,
    peer_cert: Option<Vec<u8>>,
}

enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl PgStream {
    /// Open a transport to the configured address.
    ///
    /// A host with a leading `/` is a unix socket directory, the socket
    /// is `<host>/.s.PGSQL.<port>`. TCP transports negotiate TLS here
    /// when the ssl mode asks for it.
    pub(crate) async fn connect(config: &Config) -> Result<Self> {
        let mut peer_cert = None;

        let stream = if config.is_unix() {
            Stream::Unix(UnixStream::connect(config.unix_path()).await?)
        } else {
            let tcp = TcpStream::connect((config.host.as_str(), config.port)).await?;
            tcp.set_nodelay(true)?;

            if config.keep_alive {
                let mut keepalive = socket2::TcpKeepalive::new();
                if let Some(delay) = config.keep_alive_initial_delay {
                    keepalive = keepalive.with_time(delay);
                }
                socket2::SockRef::from(&tcp).set_tcp_keepalive(&keepalive)?;
            }

            match config.ssl {
                SslMode::Disable => Stream::Tcp(tcp),
                _ => {
                    let (stream, cert) = upgrade(tcp, config).await?;
                    peer_cert = cert;
                    stream
                }
            }
        };

        let capacity = NonZeroUsize::new(config.statement_cache_capacity)
            .unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            stream,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            statements: LruCache::new(capacity),
            peer_cert,
        })
    }

    /// Write a message to the buffer, this does not write to the
    /// underlying io.
    pub fn send<F: frontend::FrontendProtocol>(&mut self, message: F) -> Result<()> {
        message.write(&mut self.write_buf).map_err(Into::into)
    }

    /// Buffer the startup message, which carries no message-type byte.
    pub(crate) fn send_startup(&mut self, startup: frontend::Startup) {
        startup.encode(&mut self.write_buf);
    }

    /// Buffer a cancel-request frame, which carries no message-type byte.
    pub(crate) fn send_cancel(&mut self, cancel: frontend::CancelRequest) {
        cancel.encode(&mut self.write_buf);
    }

    /// Poll to write all buffered messages to the underlying io.
    pub(crate) fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.stream).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    /// Poll to receive one backend message.
    ///
    /// Returns `UnexpectedEof` when the backend closed the connection.
    pub(crate) fn poll_recv(&mut self, cx: &mut Context) -> Poll<Result<BackendMessage>> {
        // every regular backend message starts with a 5-byte header:
        // the message type and the length including the length itself
        const PREFIX: usize = 5;

        loop {
            if self.read_buf.len() >= PREFIX {
                let mut header = &self.read_buf[..PREFIX];
                let msgtype = header.get_u8();
                let frame = 1 + header.get_i32() as usize;

                if self.read_buf.len() >= frame {
                    let mut message = self.read_buf.split_to(frame).freeze();
                    message.advance(PREFIX);
                    #[cfg(feature = "verbose")]
                    tracing::trace!("recv {:?}", msgtype as char);
                    return Poll::Ready(
                        BackendMessage::decode(msgtype, message).map_err(Into::into),
                    );
                }
            }

            if let Err(err) = ready!(self.poll_read(cx)) {
                return Poll::Ready(Err(err.into()));
            }
        }
    }

    fn poll_read(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        let mut chunk = [0u8; DEFAULT_BUF_CAPACITY];
        let mut buf = ReadBuf::new(&mut chunk);
        ready!(Pin::new(&mut self.stream).poll_read(cx, &mut buf))?;

        let filled = buf.filled();
        if filled.is_empty() {
            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
        }
        self.read_buf.extend_from_slice(filled);
        Poll::Ready(Ok(()))
    }

    pub(crate) fn poll_shutdown(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }

    /// Flush all buffered messages to the underlying io.
    pub(crate) fn flush(&mut self) -> impl Future<Output = io::Result<()>> {
        std::future::poll_fn(|cx| self.poll_flush(cx))
    }

    /// Receive one backend message.
    pub(crate) fn recv(&mut self) -> impl Future<Output = Result<BackendMessage>> {
        std::future::poll_fn(|cx| self.poll_recv(cx))
    }

    pub(crate) fn is_tls(&self) -> bool {
        matches!(self.stream, Stream::Tls(_))
    }

    /// DER encoding of the server certificate, when on TLS.
    pub(crate) fn peer_cert_der(&self) -> Option<&[u8]> {
        self.peer_cert.as_deref()
    }

    /// Check for an already parsed statement with this name.
    pub(crate) fn stmt_text(&mut self, name: &str) -> Option<&str> {
        self.statements.get(name).map(String::as_str)
    }

    /// Record a statement the backend has parsed.
    pub(crate) fn add_stmt(&mut self, name: String, sql: String) {
        self.statements.put(name, sql);
    }
}

/// Negotiate TLS with `SSLRequest`; the server answers with a single
/// `S` or `N` byte before any regular message framing.
async fn upgrade(mut tcp: TcpStream, config: &Config) -> Result<(Stream, Option<Vec<u8>>)> {
    let mut buf = BytesMut::with_capacity(8);
    frontend::SslRequest.encode(&mut buf);
    tcp.write_all(&buf).await?;

    let mut answer = [0u8; 1];
    tcp.read_exact(&mut answer).await?;

    match answer[0] {
        b'S' => {
            let connector = tokio_native_tls::TlsConnector::from(connector(config)?);
            let tls = connector.connect(&config.host, tcp).await?;

            let cert = tls
                .get_ref()
                .peer_certificate()
                .ok()
                .flatten()
                .and_then(|cert| cert.to_der().ok());

            Ok((Stream::Tls(Box::new(tls)), cert))
        }
        b'N' if config.ssl == SslMode::Prefer => Ok((Stream::Tcp(tcp), None)),
        b'N' => Err(ProtocolError::new(
            "server does not support TLS, but the ssl mode requires it",
        )
        .into()),
        f => Err(ProtocolError::new(format!(
            "unexpected SSLRequest answer {:?}",
            f as char,
        ))
        .into()),
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

fn connector(config: &Config) -> Result<native_tls::TlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    match config.ssl {
        SslMode::Prefer | SslMode::Require => {
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }
        SslMode::VerifyCa => {
            builder.danger_accept_invalid_hostnames(true);
        }
        SslMode::Disable | SslMode::VerifyFull => {}
    }

    if let Some(path) = &config.ssl_root_cert {
        let pem = std::fs::read(path)?;
        builder.add_root_certificate(native_tls::Certificate::from_pem(&pem)?);
    }

    Ok(builder.build()?)
}
