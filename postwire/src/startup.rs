//! The connect-phase handshake.
//!
//! <https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-FLOW-START-UP>
use std::collections::BTreeMap;

use crate::{
    Result,
    auth::Authenticator,
    config::Config,
    postgres::{BackendKeyData, BackendMessage, frontend::Startup},
    transport::PgStream,
};

/// Everything the session learns before the first `ReadyForQuery`.
pub(crate) struct Handshake {
    pub io: PgStream,
    pub key: Option<BackendKeyData>,
    pub parameters: BTreeMap<String, String>,
    pub server_version_num: Option<u32>,
}

/// Drive a fresh transport to the ready state.
pub(crate) async fn handshake(config: &Config) -> Result<Handshake> {
    let mut io = PgStream::connect(config).await?;

    // To begin a session, a frontend opens a connection to the server
    // and sends a startup message.
    let params = startup_params(config);
    io.send_startup(Startup { params: &params });
    io.flush().await?;

    // The server then sends an appropriate authentication request
    // message, to which the frontend must reply. For SASL, multiple
    // exchanges of packets may be needed.
    //
    // After AuthenticationOk the backend process is being started, and
    // the frontend is just an interested bystander: ParameterStatus
    // messages, BackendKeyData, and finally ReadyForQuery.
    let mut auth = Authenticator::new(config);
    let mut key = None;
    let mut parameters = BTreeMap::new();
    let mut server_version_num = None;

    loop {
        use BackendMessage::*;
        match io.recv().await? {
            Authentication(request) => auth.respond(request, &mut io).await?,
            BackendKeyData(new_key) => key = Some(new_key),
            ParameterStatus(status) => {
                if status.name == "server_version" {
                    server_version_num = parse_server_version(&status.value);
                }
                parameters.insert(status.name, status.value);
            }
            NoticeResponse(_notice) => {
                #[cfg(feature = "log")]
                log::info!("{_notice}");
            }
            ErrorResponse(err) => return Err(err.into()),
            ReadyForQuery(_) => break,
            f => return Err(f.unexpected("connecting").into()),
        }
    }

    Ok(Handshake { io, key, parameters, server_version_num })
}

/// Assemble the startup key/value pairs from the session config.
pub(crate) fn startup_params(config: &Config) -> Vec<(&'static str, String)> {
    let mut params = vec![("user", config.user.clone())];

    if let Some(database) = &config.database {
        params.push(("database", database.clone()));
    }

    if let Some(name) = config
        .application_name
        .as_ref()
        .or(config.fallback_application_name.as_ref())
    {
        params.push(("application_name", name.clone()));
    }

    // an empty string means the server default, which is not sent
    if let Some(replication) = &config.replication {
        if !replication.is_empty() {
            params.push(("replication", replication.clone()));
        }
    }

    let mut millis = itoa::Buffer::new();
    if let Some(timeout) = config.statement_timeout {
        params.push(("statement_timeout", millis.format(timeout).to_owned()));
    }
    if let Some(timeout) = config.lock_timeout {
        params.push(("lock_timeout", millis.format(timeout).to_owned()));
    }
    if let Some(timeout) = config.idle_in_transaction_session_timeout {
        params.push((
            "idle_in_transaction_session_timeout",
            millis.format(timeout).to_owned(),
        ));
    }

    if let Some(options) = &config.options {
        params.push(("options", options.clone()));
    }

    params
}

// reference:
// https://github.com/postgres/postgres/blob/master/src/interfaces/libpq/fe-exec.c
fn parse_server_version(s: &str) -> Option<u32> {
    let mut parts = Vec::<u32>::with_capacity(3);

    let mut from = 0;
    let mut chs = s.char_indices().peekable();
    while let Some((i, ch)) = chs.next() {
        match ch {
            '.' => {
                if let Ok(num) = s[from..i].parse::<u32>() {
                    parts.push(num);
                    from = i + 1;
                } else {
                    break;
                }
            }
            _ if ch.is_ascii_digit() => {
                if chs.peek().is_none() {
                    if let Ok(num) = s[from..].parse::<u32>() {
                        parts.push(num);
                    }
                    break;
                }
            }
            _ => {
                if let Ok(num) = s[from..i].parse::<u32>() {
                    parts.push(num);
                }
                break;
            }
        };
    }

    let version_num = match parts.as_slice() {
        [major, minor, rev] => (100 * major + minor) * 100 + rev,
        [major, minor] if *major >= 10 => 100 * 100 * major + minor,
        [major, minor] => (100 * major + minor) * 100,
        [major] => 100 * 100 * major,
        _ => return None,
    };

    Some(version_num)
}
