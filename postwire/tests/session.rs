//! Session scenarios against a scripted in-process backend.
use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use postwire::{Config, ErrorKind, Event, Query, Session};

// ===== scripted backend helpers =====

fn msg(msgtype: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 5);
    out.push(msgtype);
    out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn authentication(code: i32, extra: &[u8]) -> Vec<u8> {
    let mut body = code.to_be_bytes().to_vec();
    body.extend_from_slice(extra);
    msg(b'R', &body)
}

fn backend_key_data(process_id: i32, secret_key: i32) -> Vec<u8> {
    let mut body = process_id.to_be_bytes().to_vec();
    body.extend_from_slice(&secret_key.to_be_bytes());
    msg(b'K', &body)
}

fn parameter_status(name: &str, value: &str) -> Vec<u8> {
    let mut body = name.as_bytes().to_vec();
    body.push(0);
    body.extend_from_slice(value.as_bytes());
    body.push(0);
    msg(b'S', &body)
}

fn command_complete(tag: &str) -> Vec<u8> {
    let mut body = tag.as_bytes().to_vec();
    body.push(0);
    msg(b'C', &body)
}

fn ready_for_query() -> Vec<u8> {
    msg(b'Z', b"I")
}

fn error_response(severity: &str, code: &str, message: &str) -> Vec<u8> {
    let mut body = Vec::new();
    for (field, value) in [(b'S', severity), (b'C', code), (b'M', message)] {
        body.push(field);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    body.push(0);
    msg(b'E', &body)
}

/// Read the startup message, which has no message-type byte.
async fn read_startup(stream: &mut TcpStream) -> Vec<u8> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await.unwrap();
    let mut body = vec![0; i32::from_be_bytes(len) as usize - 4];
    stream.read_exact(&mut body).await.unwrap();
    body
}

/// Read one regular frontend message.
async fn read_message(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await.unwrap();
    let len = i32::from_be_bytes(header[1..5].try_into().unwrap()) as usize - 4;
    let mut body = vec![0; len];
    stream.read_exact(&mut body).await.unwrap();
    (header[0], body)
}

/// Accept the startup message and drive the client to ready without
/// an authentication challenge.
async fn trusting_handshake(stream: &mut TcpStream) {
    read_startup(stream).await;

    let mut out = authentication(0, b"");
    out.extend(backend_key_data(42, 7));
    out.extend(parameter_status("server_version", "15.4"));
    out.extend(ready_for_query());
    stream.write_all(&out).await.unwrap();
}

async fn listen() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

async fn accept(listener: &TcpListener) -> TcpStream {
    listener.accept().await.unwrap().0
}

fn config(port: u16) -> Config {
    Config::new().host("127.0.0.1").port(port).user("alice")
}

// ===== scenarios =====

#[tokio::test]
async fn connect_and_graceful_end() {
    let (listener, port) = listen().await;

    let server = tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        trusting_handshake(&mut stream).await;

        // a graceful end is a Terminate followed by a close
        let (msgtype, _) = read_message(&mut stream).await;
        assert_eq!(msgtype, b'X');
        assert_eq!(stream.read(&mut [0u8; 8]).await.unwrap(), 0);
    });

    let session = Session::connect_with(config(port)).await.unwrap();
    let mut events = session.events().unwrap();

    assert!(matches!(events.recv().await, Some(Event::Connected)));
    assert_eq!(session.process_id(), Some(42));
    assert_eq!(session.secret_key(), Some(7));
    assert_eq!(session.parameter("server_version").as_deref(), Some("15.4"));
    assert_eq!(session.server_version_num(), Some(150004));

    session.end().await;
    assert!(matches!(events.recv().await, Some(Event::Ended)));

    // end is idempotent
    session.end().await;

    server.await.unwrap();
}

#[tokio::test]
async fn queries_before_connect_are_queued() {
    let (listener, port) = listen().await;

    let server = tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        trusting_handshake(&mut stream).await;

        let (msgtype, body) = read_message(&mut stream).await;
        assert_eq!(msgtype, b'Q');
        assert_eq!(body, b"SELECT 'early'\0");

        let mut out = command_complete("SELECT 1");
        out.extend(ready_for_query());
        stream.write_all(&out).await.unwrap();

        read_message(&mut stream).await.0
    });

    let session = Session::new(config(port));
    let early = session.query("SELECT 'early'");

    session.connect().await.unwrap();
    early.await.unwrap();

    session.end().await;
    assert_eq!(server.await.unwrap(), b'X');
}

#[tokio::test]
async fn fifo_order_and_single_drain() {
    let (listener, port) = listen().await;

    let server = tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        trusting_handshake(&mut stream).await;

        let mut texts = Vec::new();
        for _ in 0..3 {
            let (msgtype, body) = read_message(&mut stream).await;
            assert_eq!(msgtype, b'Q');
            texts.push(String::from_utf8(body[..body.len() - 1].to_vec()).unwrap());

            let mut out = command_complete("SELECT 1");
            out.extend(ready_for_query());
            stream.write_all(&out).await.unwrap();
        }

        let (msgtype, _) = read_message(&mut stream).await;
        assert_eq!(msgtype, b'X');
        texts
    });

    let session = Session::connect_with(config(port)).await.unwrap();
    let mut events = session.events().unwrap();

    let q1 = session.query("SELECT 'one'");
    let q2 = session.query("SELECT 'two'");
    let q3 = session.query("SELECT 'three'");

    let (o1, o2, o3) = tokio::join!(q1, q2, q3);
    o1.unwrap();
    o2.unwrap();
    o3.unwrap();

    session.end().await;

    // exactly one drain, after the last query
    assert!(matches!(events.recv().await, Some(Event::Connected)));
    assert!(matches!(events.recv().await, Some(Event::Drain)));
    assert!(matches!(events.recv().await, Some(Event::Ended)));

    // the wire saw strict FIFO order
    let texts = server.await.unwrap();
    assert_eq!(texts, ["SELECT 'one'", "SELECT 'two'", "SELECT 'three'"]);
}

#[tokio::test]
async fn transport_failure_fails_active_and_queued_once() {
    let (listener, port) = listen().await;

    let server = tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        trusting_handshake(&mut stream).await;

        // the first query goes on the wire, then the backend dies
        let (msgtype, _) = read_message(&mut stream).await;
        assert_eq!(msgtype, b'Q');
    });

    let session = Session::connect_with(config(port)).await.unwrap();
    let mut events = session.events().unwrap();
    assert!(matches!(events.recv().await, Some(Event::Connected)));

    let active = session.query("SELECT pg_sleep(10)");
    let queued = session.query("SELECT 2");

    let err = active.await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::TerminatedUnexpectedly(_)));
    let err = queued.await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::TerminatedUnexpectedly(_)));

    // exactly one error event, then the end
    assert!(matches!(events.recv().await, Some(Event::Error(_))));
    assert!(matches!(events.recv().await, Some(Event::Ended)));

    // whatever comes later is rejected without touching the wire
    let err = session.query("SELECT 3").await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::NotQueryable(_)));

    server.await.unwrap();
}

#[tokio::test]
async fn backend_error_is_routed_to_its_query_only() {
    let (listener, port) = listen().await;

    let server = tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        trusting_handshake(&mut stream).await;

        let (msgtype, _) = read_message(&mut stream).await;
        assert_eq!(msgtype, b'Q');
        let mut out = error_response("ERROR", "42703", "column \"nope\" does not exist");
        out.extend(ready_for_query());
        stream.write_all(&out).await.unwrap();

        let (msgtype, _) = read_message(&mut stream).await;
        assert_eq!(msgtype, b'Q');
        let mut out = command_complete("SELECT 1");
        out.extend(ready_for_query());
        stream.write_all(&out).await.unwrap();

        read_message(&mut stream).await.0
    });

    let session = Session::connect_with(config(port)).await.unwrap();

    let failed = session.query("SELECT nope");
    let err = failed.await.unwrap_err();
    assert_eq!(err.as_database_error().unwrap().code(), "42703");

    // the session stays usable
    session.query("SELECT 1").await.unwrap();

    session.end().await;
    assert_eq!(server.await.unwrap(), b'X');
}

#[tokio::test]
async fn query_read_timeout_hits_only_that_query() {
    let (listener, port) = listen().await;

    let server = tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        trusting_handshake(&mut stream).await;

        let (msgtype, _) = read_message(&mut stream).await;
        assert_eq!(msgtype, b'Q');

        // answer long after the client side read timeout fired
        tokio::time::sleep(Duration::from_millis(800)).await;
        let mut out = command_complete("SELECT 1");
        out.extend(ready_for_query());
        stream.write_all(&out).await.unwrap();

        let (msgtype, body) = read_message(&mut stream).await;
        assert_eq!(msgtype, b'Q');
        assert_eq!(body, b"SELECT 'after'\0");
        let mut out = command_complete("SELECT 1");
        out.extend(ready_for_query());
        stream.write_all(&out).await.unwrap();

        read_message(&mut stream).await.0
    });

    let session = Session::connect_with(
        config(port).query_timeout(Duration::from_millis(50)),
    )
    .await
    .unwrap();

    let started = tokio::time::Instant::now();
    let err = session.query("SELECT 'slow'").await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::QueryTimeout(_)));
    // the timeout fired, not the late server answer
    assert!(started.elapsed() < Duration::from_millis(700));

    // the late completion is discarded; the next query runs normally
    session
        .query(Query::new("SELECT 'after'").timeout(Duration::from_secs(5)))
        .await
        .unwrap();

    session.end().await;
    assert_eq!(server.await.unwrap(), b'X');
}

#[tokio::test]
async fn forced_end_destroys_the_transport() {
    let (listener, port) = listen().await;

    let server = tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        trusting_handshake(&mut stream).await;

        let (msgtype, _) = read_message(&mut stream).await;
        assert_eq!(msgtype, b'Q');

        // no Terminate: the client just closes the socket
        assert_eq!(stream.read(&mut [0u8; 8]).await.unwrap(), 0);
    });

    let session = Session::connect_with(config(port)).await.unwrap();

    let active = session.query("SELECT pg_sleep(10)");
    // let the query reach the wire before ending
    tokio::time::sleep(Duration::from_millis(50)).await;

    session.end().await;

    let err = active.await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Terminated(_)));

    server.await.unwrap();
}

#[tokio::test]
async fn cancel_removes_queued_and_signals_active() {
    let (listener, port) = listen().await;

    let server = tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        trusting_handshake(&mut stream).await;

        let (msgtype, _) = read_message(&mut stream).await;
        assert_eq!(msgtype, b'Q');

        // the cancel of the active query arrives on a second,
        // short-lived connection as a bare CancelRequest frame
        let mut side = accept(&listener).await;
        let mut frame = [0u8; 16];
        side.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame[..4], &16i32.to_be_bytes());
        assert_eq!(&frame[4..8], &80877102i32.to_be_bytes());
        assert_eq!(&frame[8..12], &42i32.to_be_bytes());
        assert_eq!(&frame[12..16], &7i32.to_be_bytes());
        drop(side);

        // the primary connection was never touched; finish the query
        let mut out = command_complete("SELECT 1");
        out.extend(ready_for_query());
        stream.write_all(&out).await.unwrap();

        read_message(&mut stream).await.0
    });

    let session = Session::connect_with(config(port)).await.unwrap();

    let active = session.query("SELECT pg_sleep(10)");
    let queued = session.query("SELECT 'queued'");
    tokio::time::sleep(Duration::from_millis(50)).await;

    // a queued query is simply removed
    session.cancel(&queued).await.unwrap();
    let err = queued.await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Canceled(_)));

    // the active query needs the side-channel request
    session.cancel(&active).await.unwrap();
    active.await.unwrap();

    session.end().await;
    assert_eq!(server.await.unwrap(), b'X');
}

#[tokio::test]
async fn connect_phase_backend_error_completes_connect() {
    let (listener, port) = listen().await;

    let server = tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        read_startup(&mut stream).await;
        let out = error_response("FATAL", "28P01", "password authentication failed");
        stream.write_all(&out).await.unwrap();
    });

    let session = Session::new(config(port));
    let err = session.connect().await.unwrap_err();
    assert_eq!(err.as_database_error().unwrap().code(), "28P01");

    // a session is single-use, also after a failed connect
    let err = session.connect().await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::AlreadyConnected(_)));

    server.await.unwrap();
}

#[tokio::test]
async fn second_connect_is_rejected() {
    let (listener, port) = listen().await;

    let server = tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        trusting_handshake(&mut stream).await;
        read_message(&mut stream).await.0
    });

    let session = Session::connect_with(config(port)).await.unwrap();

    let err = session.connect().await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::AlreadyConnected(_)));

    session.end().await;
    assert_eq!(server.await.unwrap(), b'X');
}

#[tokio::test]
async fn connect_deadline_expires() {
    let (listener, port) = listen().await;

    let server = tokio::spawn(async move {
        // accept and go silent
        let stream = accept(&listener).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        drop(stream);
    });

    let session = Session::new(
        config(port).connect_timeout(Duration::from_millis(100)),
    );
    let err = session.connect().await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::ConnectTimeout(_)));

    server.abort();
}

#[tokio::test]
async fn cleartext_password_authentication() {
    let (listener, port) = listen().await;

    let server = tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        read_startup(&mut stream).await;

        stream.write_all(&authentication(3, b"")).await.unwrap();
        let (msgtype, body) = read_message(&mut stream).await;
        assert_eq!(msgtype, b'p');
        assert_eq!(body, b"swordfish\0");

        let mut out = authentication(0, b"");
        out.extend(ready_for_query());
        stream.write_all(&out).await.unwrap();
    });

    let session = Session::connect_with(config(port).password("swordfish"))
        .await
        .unwrap();
    session.end().await;

    server.await.unwrap();
}

#[tokio::test]
async fn md5_password_authentication() {
    let (listener, port) = listen().await;

    let server = tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        read_startup(&mut stream).await;

        stream.write_all(&authentication(5, &[1, 2, 3, 4])).await.unwrap();
        let (msgtype, body) = read_message(&mut stream).await;
        assert_eq!(msgtype, b'p');
        // md5(md5("s3cret" + "alice") hex + salt) for alice/s3cret
        assert_eq!(body, b"md5b79948bbeb35dee03ab8fe15a839030b\0");

        let mut out = authentication(0, b"");
        out.extend(ready_for_query());
        stream.write_all(&out).await.unwrap();
    });

    let session = Session::connect_with(config(port).password("s3cret"))
        .await
        .unwrap();
    session.end().await;

    server.await.unwrap();
}

// ===== SCRAM exchange against a computing server =====

mod scram_server {
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
    use hmac::{Hmac, Mac};
    use sha2::{Digest, Sha256};

    pub struct Verification {
        pub proof_ok: bool,
        pub server_final: String,
    }

    /// Verify a client-final message and produce the server signature,
    /// the way the backend would.
    pub fn verify(
        password: &str,
        salt: &[u8],
        iterations: u32,
        client_first_bare: &str,
        server_first: &str,
        client_final: &str,
    ) -> Verification {
        let mut salted = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut salted);

        let hmac = |key: &[u8], data: &[u8]| -> [u8; 32] {
            let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
            mac.update(data);
            mac.finalize().into_bytes().into()
        };

        let (without_proof, proof) = client_final.rsplit_once(",p=").unwrap();
        let auth_message = format!("{client_first_bare},{server_first},{without_proof}");

        let client_key = hmac(&salted, b"Client Key");
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();
        let signature = hmac(&stored_key, auth_message.as_bytes());

        let mut expected = client_key;
        for (expected, signature) in expected.iter_mut().zip(signature) {
            *expected ^= signature;
        }

        let server_key = hmac(&salted, b"Server Key");
        let server_signature = hmac(&server_key, auth_message.as_bytes());

        Verification {
            proof_ok: BASE64.decode(proof).ok().as_deref() == Some(&expected),
            server_final: format!("v={}", BASE64.encode(server_signature)),
        }
    }
}

#[tokio::test]
async fn scram_sha_256_authentication() {
    let (listener, port) = listen().await;

    let server = tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        read_startup(&mut stream).await;

        stream
            .write_all(&authentication(10, b"SCRAM-SHA-256\0\0"))
            .await
            .unwrap();

        // SASLInitialResponse: mechanism, payload length, payload
        let (msgtype, body) = read_message(&mut stream).await;
        assert_eq!(msgtype, b'p');
        let nul = body.iter().position(|b| *b == 0).unwrap();
        assert_eq!(&body[..nul], b"SCRAM-SHA-256");
        let payload = String::from_utf8(body[nul + 5..].to_vec()).unwrap();
        let client_first_bare = payload.strip_prefix("n,,").unwrap().to_owned();
        let client_nonce = client_first_bare.strip_prefix("n=*,r=").unwrap();

        let salt = b"0123456789abcdef";
        let server_first = format!(
            "r={client_nonce}3rfcNHYJY1ZVvWVs7j,s={},i=4096",
            BASE64.encode(salt),
        );
        stream
            .write_all(&authentication(11, server_first.as_bytes()))
            .await
            .unwrap();

        let (msgtype, body) = read_message(&mut stream).await;
        assert_eq!(msgtype, b'p');
        let client_final = String::from_utf8(body).unwrap();

        let verification = scram_server::verify(
            "pencil",
            salt,
            4096,
            &client_first_bare,
            &server_first,
            &client_final,
        );
        assert!(verification.proof_ok, "client proof did not verify");

        let mut out = authentication(12, verification.server_final.as_bytes());
        out.extend(authentication(0, b""));
        out.extend(ready_for_query());
        stream.write_all(&out).await.unwrap();

        read_message(&mut stream).await.0
    });

    let session = Session::connect_with(config(port).password("pencil"))
        .await
        .unwrap();
    session.end().await;

    assert_eq!(server.await.unwrap(), b'X');
}

#[tokio::test]
async fn scram_rejects_forged_server_signature() {
    let (listener, port) = listen().await;

    let server = tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        read_startup(&mut stream).await;

        stream
            .write_all(&authentication(10, b"SCRAM-SHA-256\0\0"))
            .await
            .unwrap();

        let (_, body) = read_message(&mut stream).await;
        let nul = body.iter().position(|b| *b == 0).unwrap();
        let payload = String::from_utf8(body[nul + 5..].to_vec()).unwrap();
        let client_nonce = payload.strip_prefix("n,,n=*,r=").unwrap();

        let server_first = format!(
            "r={client_nonce}3rfcNHYJY1ZVvWVs7j,s={},i=4096",
            BASE64.encode(b"0123456789abcdef"),
        );
        stream
            .write_all(&authentication(11, server_first.as_bytes()))
            .await
            .unwrap();

        let _ = read_message(&mut stream).await;

        // a signature the client cannot have derived
        let forged = format!("v={}", BASE64.encode([0u8; 32]));
        stream
            .write_all(&authentication(12, forged.as_bytes()))
            .await
            .unwrap();
    });

    let session = Session::new(config(port).password("pencil"));
    let err = session.connect().await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Sasl(_)));

    server.await.unwrap();
}
