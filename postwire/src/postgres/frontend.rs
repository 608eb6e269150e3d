//! Frontend message encoding.
use bytes::{BufMut, BytesMut};

use super::ProtocolError;

/// A type that can be encoded as a postgres frontend message.
pub trait FrontendProtocol {
    /// The message type byte.
    const MSGTYPE: u8;

    /// Write the message body, everything after the length field.
    fn body(&self, buf: &mut BytesMut);

    /// Write the full message: type byte, then the length-prefixed body.
    ///
    /// The length is reserved up front and patched afterwards.
    fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u8(Self::MSGTYPE);

        let offset = buf.len();
        buf.put_i32(0);
        self.body(buf);

        // Length of message contents in bytes, including self.
        let size = buf.len() - offset;
        let Ok(size) = i32::try_from(size) else {
            return Err(ProtocolError::new(format!(
                "message size out of range for protocol: {size}",
            )));
        };
        buf[offset..offset + 4].copy_from_slice(&size.to_be_bytes());

        Ok(())
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(b'\0');
}

/// The very first message of a session.
///
/// For historical reasons the startup message has no message-type byte,
/// so it does not implement [`FrontendProtocol`].
#[derive(Debug)]
pub struct Startup<'a> {
    /// Parameter name and value pairs; `user` is required by the server.
    pub params: &'a [(&'static str, String)],
}

/// The most significant 16 bits are the major version (3), the least
/// significant 16 bits the minor version (0).
const PROTOCOL_VERSION: i32 = 196608;

impl Startup<'_> {
    pub fn encode(&self, buf: &mut BytesMut) {
        let offset = buf.len();
        buf.put_i32(0);
        buf.put_i32(PROTOCOL_VERSION);
        for (name, value) in self.params {
            put_str(buf, name);
            put_str(buf, value);
        }
        // terminator after the last name/value pair
        buf.put_u8(b'\0');

        let size = (buf.len() - offset) as i32;
        buf[offset..offset + 4].copy_from_slice(&size.to_be_bytes());
    }
}

/// Requests the TLS upgrade; answered by a single `S` or `N` byte.
#[derive(Debug)]
pub struct SslRequest;

impl SslRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(8);
        buf.put_i32(80877103);
    }
}

/// Asks the server to abandon the current query of another session,
/// identified by its [`BackendKeyData`][super::BackendKeyData]. Sent
/// instead of a startup message over a dedicated connection.
#[derive(Debug)]
pub struct CancelRequest {
    pub process_id: i32,
    pub secret_key: i32,
}

impl CancelRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(16);
        buf.put_i32(80877102);
        buf.put_i32(self.process_id);
        buf.put_i32(self.secret_key);
    }
}

/// A password response, clear-text or already digested.
#[derive(Debug)]
pub struct PasswordMessage<'a> {
    pub password: &'a str,
}

impl FrontendProtocol for PasswordMessage<'_> {
    const MSGTYPE: u8 = b'p';

    fn body(&self, buf: &mut BytesMut) {
        put_str(buf, self.password);
    }
}

/// The first SASL response, carrying the selected mechanism.
#[derive(Debug)]
pub struct SaslInitialResponse<'a> {
    pub mechanism: &'a str,
    pub data: &'a str,
}

impl FrontendProtocol for SaslInitialResponse<'_> {
    const MSGTYPE: u8 = b'p';

    fn body(&self, buf: &mut BytesMut) {
        put_str(buf, self.mechanism);
        buf.put_i32(self.data.len() as i32);
        buf.put_slice(self.data.as_bytes());
    }
}

/// A SASL continuation response.
#[derive(Debug)]
pub struct SaslResponse<'a> {
    pub data: &'a str,
}

impl FrontendProtocol for SaslResponse<'_> {
    const MSGTYPE: u8 = b'p';

    fn body(&self, buf: &mut BytesMut) {
        buf.put_slice(self.data.as_bytes());
    }
}

/// A simple query, executed over the text protocol.
#[derive(Debug)]
pub struct Query<'a> {
    pub sql: &'a str,
}

impl FrontendProtocol for Query<'_> {
    const MSGTYPE: u8 = b'Q';

    fn body(&self, buf: &mut BytesMut) {
        put_str(buf, self.sql);
    }
}

/// Create a prepared statement from a query text.
#[derive(Debug)]
pub struct Parse<'a> {
    /// Prepared statement name, empty selects the unnamed statement.
    pub name: &'a str,
    pub sql: &'a str,
    /// Parameter type oids to prespecify; unlisted types are inferred.
    pub param_oids: &'a [u32],
}

impl FrontendProtocol for Parse<'_> {
    const MSGTYPE: u8 = b'P';

    fn body(&self, buf: &mut BytesMut) {
        put_str(buf, self.name);
        put_str(buf, self.sql);
        buf.put_i16(self.param_oids.len() as i16);
        for oid in self.param_oids {
            buf.put_u32(*oid);
        }
    }
}

/// Bind parameter values to a prepared statement, producing a portal.
#[derive(Debug)]
pub struct Bind<'a> {
    /// Destination portal name, empty selects the unnamed portal.
    pub portal: &'a str,
    pub statement: &'a str,
    /// Text-format parameter values, `None` for SQL NULL.
    pub params: &'a [Option<String>],
    /// Request binary result columns instead of text.
    pub binary_result: bool,
}

impl FrontendProtocol for Bind<'_> {
    const MSGTYPE: u8 = b'B';

    fn body(&self, buf: &mut BytesMut) {
        put_str(buf, self.portal);
        put_str(buf, self.statement);

        // one parameter format code applied to all parameters: text
        buf.put_i16(1);
        buf.put_i16(0);

        buf.put_i16(self.params.len() as i16);
        for param in self.params {
            match param {
                Some(value) => {
                    buf.put_i32(value.len() as i32);
                    buf.put_slice(value.as_bytes());
                }
                None => buf.put_i32(-1),
            }
        }

        // one result format code applied to all result columns
        buf.put_i16(1);
        buf.put_i16(self.binary_result as i16);
    }
}

/// Request a description of a statement (`S`) or portal (`P`).
#[derive(Debug)]
pub struct Describe<'a> {
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendProtocol for Describe<'_> {
    const MSGTYPE: u8 = b'D';

    fn body(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind);
        put_str(buf, self.name);
    }
}

/// Execute a portal.
#[derive(Debug)]
pub struct Execute<'a> {
    pub portal: &'a str,
    /// Maximum number of rows to return; zero means no limit.
    pub max_rows: i32,
}

impl FrontendProtocol for Execute<'_> {
    const MSGTYPE: u8 = b'E';

    fn body(&self, buf: &mut BytesMut) {
        put_str(buf, self.portal);
        buf.put_i32(self.max_rows);
    }
}

/// Close the current extended-protocol transaction unit; the backend
/// answers with `ReadyForQuery`.
#[derive(Debug)]
pub struct Sync;

impl FrontendProtocol for Sync {
    const MSGTYPE: u8 = b'S';

    fn body(&self, _: &mut BytesMut) { }
}

/// Graceful session shutdown; the backend closes the connection.
#[derive(Debug)]
pub struct Terminate;

impl FrontendProtocol for Terminate {
    const MSGTYPE: u8 = b'X';

    fn body(&self, _: &mut BytesMut) { }
}

/// Abort an in-progress `COPY FROM STDIN`.
#[derive(Debug)]
pub struct CopyFail<'a> {
    pub message: &'a str,
}

impl FrontendProtocol for CopyFail<'_> {
    const MSGTYPE: u8 = b'f';

    fn body(&self, buf: &mut BytesMut) {
        put_str(buf, self.message);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn length_is_patched() {
        let mut buf = BytesMut::new();
        Query { sql: "SELECT 1" }.write(&mut buf).unwrap();

        assert_eq!(buf[0], b'Q');
        // len field + sql + nul
        assert_eq!(&buf[1..5], &13i32.to_be_bytes());
        assert_eq!(&buf[5..], b"SELECT 1\0");
    }

    #[test]
    fn startup_has_no_type_byte() {
        let mut buf = BytesMut::new();
        let params = [("user", String::from("alice"))];
        Startup { params: &params }.encode(&mut buf);

        assert_eq!(&buf[..4], &(buf.len() as i32).to_be_bytes());
        assert_eq!(&buf[4..8], &196608i32.to_be_bytes());
        assert_eq!(&buf[8..], b"user\0alice\0\0");
    }

    #[test]
    fn bind_encodes_null_params() {
        let mut buf = BytesMut::new();
        let params = [Some(String::from("7")), None];
        Bind { portal: "", statement: "", params: &params, binary_result: false }
            .write(&mut buf)
            .unwrap();

        let body = &buf[5..];
        assert_eq!(
            body,
            // empty portal and statement, one text format code, then a
            // "7" value, a NULL, and one text result format code
            b"\0\0\
              \x00\x01\x00\x00\
              \x00\x02\
              \x00\x00\x00\x017\
              \xff\xff\xff\xff\
              \x00\x01\x00\x00",
        );
    }

    #[test]
    fn cancel_request_frame() {
        let mut buf = BytesMut::new();
        CancelRequest { process_id: 42, secret_key: 7 }.encode(&mut buf);
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[..4], &16i32.to_be_bytes());
        assert_eq!(&buf[4..8], &80877102i32.to_be_bytes());
        assert_eq!(&buf[8..12], &42i32.to_be_bytes());
        assert_eq!(&buf[12..16], &7i32.to_be_bytes());
    }
}
