//! Backend message decoding.
use bytes::{Buf, Bytes};

use super::ProtocolError;

/// Read a nul-terminated utf8 string from the front of `body`.
fn nul_string(body: &mut Bytes) -> Result<String, ProtocolError> {
    let Some(end) = body.iter().position(|e| matches!(e, b'\0')) else {
        return Err(ProtocolError::new("no nul termination in backend message"));
    };
    let string = body.split_to(end);
    body.advance(1);
    match String::from_utf8(string.into()) {
        Ok(ok) => Ok(ok),
        Err(err) => Err(ProtocolError::new(format!(
            "non utf8 string in backend message: {err}",
        ))),
    }
}

macro_rules! need {
    ($body:ident,$n:expr,$id:literal) => {
        if $body.remaining() < $n {
            return Err(ProtocolError::new(concat!("truncated ", $id, " message")));
        }
    };
}

/// A decoded postgres backend message.
#[derive(Debug)]
pub enum BackendMessage {
    Authentication(Authentication),
    BackendKeyData(BackendKeyData),
    BindComplete,
    CloseComplete,
    CommandComplete(CommandComplete),
    CopyData(Bytes),
    CopyDone,
    CopyInResponse(CopyResponse),
    CopyOutResponse(CopyResponse),
    DataRow(DataRow),
    EmptyQueryResponse,
    ErrorResponse(ErrorResponse),
    NoData,
    NoticeResponse(Notice),
    NotificationResponse(Notification),
    ParameterStatus(ParameterStatus),
    ParseComplete,
    PortalSuspended,
    ReadyForQuery(ReadyForQuery),
    RowDescription(RowDescription),
}

impl BackendMessage {
    /// Decode a message from its type byte and length-delimited body.
    pub fn decode(msgtype: u8, mut body: Bytes) -> Result<BackendMessage, ProtocolError> {
        let message = match msgtype {
            b'R' => Self::Authentication(Authentication::decode(body)?),
            b'K' => {
                need!(body, 8, "BackendKeyData");
                Self::BackendKeyData(BackendKeyData {
                    process_id: body.get_i32(),
                    secret_key: body.get_i32(),
                })
            }
            b'2' => Self::BindComplete,
            b'3' => Self::CloseComplete,
            b'C' => Self::CommandComplete(CommandComplete { tag: nul_string(&mut body)? }),
            b'd' => Self::CopyData(body),
            b'c' => Self::CopyDone,
            b'G' => Self::CopyInResponse(CopyResponse::decode(body)?),
            b'H' => Self::CopyOutResponse(CopyResponse::decode(body)?),
            b'D' => Self::DataRow(DataRow::decode(body)?),
            b'I' => Self::EmptyQueryResponse,
            b'E' => Self::ErrorResponse(ErrorResponse(Fields::decode(body)?)),
            b'n' => Self::NoData,
            b'N' => Self::NoticeResponse(Notice(Fields::decode(body)?)),
            b'A' => {
                need!(body, 4, "NotificationResponse");
                Self::NotificationResponse(Notification {
                    process_id: body.get_i32(),
                    channel: nul_string(&mut body)?,
                    payload: nul_string(&mut body)?,
                })
            }
            b'S' => Self::ParameterStatus(ParameterStatus {
                name: nul_string(&mut body)?,
                value: nul_string(&mut body)?,
            }),
            b'1' => Self::ParseComplete,
            b's' => Self::PortalSuspended,
            b'Z' => {
                need!(body, 1, "ReadyForQuery");
                Self::ReadyForQuery(ReadyForQuery {
                    status: TransactionStatus::decode(body.get_u8())?,
                })
            }
            b'T' => Self::RowDescription(RowDescription::decode(body)?),
            f => {
                return Err(ProtocolError::new(format!(
                    "unsupported backend message {:?}",
                    f as char,
                )));
            }
        };

        Ok(message)
    }

    /// Protocol violation error for a message arriving in the wrong window.
    pub fn unexpected(&self, context: &str) -> ProtocolError {
        ProtocolError::new(format!("unexpected {} message while {context}", self.name()))
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "Authentication",
            Self::BackendKeyData(_) => "BackendKeyData",
            Self::BindComplete => "BindComplete",
            Self::CloseComplete => "CloseComplete",
            Self::CommandComplete(_) => "CommandComplete",
            Self::CopyData(_) => "CopyData",
            Self::CopyDone => "CopyDone",
            Self::CopyInResponse(_) => "CopyInResponse",
            Self::CopyOutResponse(_) => "CopyOutResponse",
            Self::DataRow(_) => "DataRow",
            Self::EmptyQueryResponse => "EmptyQueryResponse",
            Self::ErrorResponse(_) => "ErrorResponse",
            Self::NoData => "NoData",
            Self::NoticeResponse(_) => "NoticeResponse",
            Self::NotificationResponse(_) => "NotificationResponse",
            Self::ParameterStatus(_) => "ParameterStatus",
            Self::ParseComplete => "ParseComplete",
            Self::PortalSuspended => "PortalSuspended",
            Self::ReadyForQuery(_) => "ReadyForQuery",
            Self::RowDescription(_) => "RowDescription",
        }
    }
}

/// Identifies the message as an authentication request.
#[derive(Debug)]
pub enum Authentication {
    /// The authentication exchange is successfully completed.
    Ok,
    /// A clear-text password is required.
    CleartextPassword,
    /// An MD5-encrypted password is required.
    Md5Password { salt: [u8; 4] },
    /// SASL authentication is required, with the listed mechanisms in
    /// the server's order of preference.
    Sasl { mechanisms: Vec<String> },
    /// Continuation of a SASL exchange, with mechanism-specific data.
    SaslContinue { data: Bytes },
    /// Final SASL message, with mechanism-specific outcome data.
    SaslFinal { data: Bytes },
    /// A request this client does not implement (GSSAPI, SSPI, ...).
    Other(i32),
}

impl Authentication {
    fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        need!(body, 4, "Authentication");
        let message = match body.get_i32() {
            0 => Self::Ok,
            3 => Self::CleartextPassword,
            5 => {
                need!(body, 4, "AuthenticationMD5Password");
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Self::Md5Password { salt }
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.first().is_some_and(|b| *b != b'\0') {
                    mechanisms.push(nul_string(&mut body)?);
                }
                Self::Sasl { mechanisms }
            }
            11 => Self::SaslContinue { data: body },
            12 => Self::SaslFinal { data: body },
            code => Self::Other(code),
        };
        Ok(message)
    }
}

/// Identifies the message as cancellation key data.
///
/// The frontend must save these values if it wishes to be able to
/// issue CancelRequest messages later.
#[derive(Debug, Clone, Copy)]
pub struct BackendKeyData {
    /// The process ID of this backend.
    pub process_id: i32,
    /// The secret key of this backend.
    pub secret_key: i32,
}

/// Identifies the message as a command-completed response.
#[derive(Debug)]
pub struct CommandComplete {
    /// The command tag, usually a single word identifying which SQL
    /// command was completed, followed by the affected row count.
    pub tag: String,
}

impl CommandComplete {
    /// Number of rows the completed command affected.
    pub fn rows_affected(&self) -> u64 {
        let mut whs = self.tag.split_whitespace();
        let Some(tag) = whs.next() else {
            return 0;
        };
        let Some(rows) = whs.next() else {
            return 0;
        };
        match tag {
            "INSERT" => whs.next().unwrap_or_default(),
            "SELECT" => rows,
            "UPDATE" => rows,
            "DELETE" => rows,
            "MERGE" => rows,
            "FETCH" => rows,
            "MOVE" => rows,
            "COPY" => rows,
            _ => return 0,
        }
        .parse()
        .unwrap_or_default()
    }
}

/// Start-of-copy response, shared by `CopyInResponse` and
/// `CopyOutResponse`.
#[derive(Debug)]
pub struct CopyResponse {
    /// 0 for textual, 1 for binary.
    pub format: i8,
    pub column_formats: Vec<i16>,
}

impl CopyResponse {
    fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        need!(body, 3, "CopyResponse");
        let format = body.get_i8();
        let len = body.get_i16();
        let mut column_formats = Vec::with_capacity(len.max(0) as usize);
        for _ in 0..len {
            need!(body, 2, "CopyResponse");
            column_formats.push(body.get_i16());
        }
        Ok(Self { format, column_formats })
    }
}

/// Identifies the message as a data row.
#[derive(Debug)]
pub struct DataRow {
    /// Column values in result-column order, `None` for SQL NULL.
    pub values: Vec<Option<Bytes>>,
}

impl DataRow {
    fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        need!(body, 2, "DataRow");
        let len = body.get_i16();
        let mut values = Vec::with_capacity(len.max(0) as usize);
        for _ in 0..len {
            need!(body, 4, "DataRow");
            match body.get_i32() {
                -1 => values.push(None),
                n => {
                    let n = n.max(0) as usize;
                    need!(body, n, "DataRow");
                    values.push(Some(body.split_to(n)));
                }
            }
        }
        Ok(Self { values })
    }
}

/// Tagged fields shared by `ErrorResponse` and `NoticeResponse`.
///
/// <https://www.postgresql.org/docs/current/protocol-error-fields.html>
#[derive(Debug)]
pub struct Fields(Vec<(u8, String)>);

impl Fields {
    fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        let mut fields = Vec::new();
        loop {
            need!(body, 1, "error fields");
            let code = body.get_u8();
            if code == b'\0' {
                break;
            }
            fields.push((code, nul_string(&mut body)?));
        }
        Ok(Self(fields))
    }

    pub fn get(&self, code: u8) -> Option<&str> {
        self.0
            .iter()
            .find_map(|(c, v)| (*c == code).then_some(v.as_str()))
    }

    pub fn severity(&self) -> &str {
        self.get(b'V').or_else(|| self.get(b'S')).unwrap_or("ERROR")
    }

    pub fn code(&self) -> &str {
        self.get(b'C').unwrap_or("XX000")
    }

    pub fn message(&self) -> &str {
        self.get(b'M').unwrap_or("")
    }
}

macro_rules! field_message {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        pub struct $name(pub(crate) Fields);

        impl $name {
            pub fn get(&self, code: u8) -> Option<&str> {
                self.0.get(code)
            }

            pub fn severity(&self) -> &str {
                self.0.severity()
            }

            pub fn code(&self) -> &str {
                self.0.code()
            }

            pub fn message(&self) -> &str {
                self.0.message()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}: {} ({})", self.severity(), self.message(), self.code())
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "\"{self}\"")
            }
        }
    };
}

field_message! {
    /// An error returned from the backend.
    ErrorResponse
}

field_message! {
    /// A warning or informational message from the backend.
    Notice
}

impl std::error::Error for ErrorResponse { }

/// Identifies the message as a `NOTIFY` delivery.
#[derive(Debug, Clone)]
pub struct Notification {
    /// The process ID of the notifying backend.
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

/// Identifies the message as a run-time parameter status report.
#[derive(Debug)]
pub struct ParameterStatus {
    /// The name of the run-time parameter being reported.
    pub name: String,
    /// The current value of the parameter.
    pub value: String,
}

/// Identifies the message as the end-of-query-response delimiter.
#[derive(Debug, Clone, Copy)]
pub struct ReadyForQuery {
    pub status: TransactionStatus,
}

/// The backend transaction status indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Not in a transaction block.
    Idle,
    /// In a transaction block.
    Transaction,
    /// In a failed transaction block, queries will be rejected until
    /// the block is ended.
    Error,
}

impl TransactionStatus {
    fn decode(status: u8) -> Result<Self, ProtocolError> {
        match status {
            b'I' => Ok(Self::Idle),
            b'T' => Ok(Self::Transaction),
            b'E' => Ok(Self::Error),
            f => Err(ProtocolError::new(format!(
                "unknown transaction status {:?}",
                f as char,
            ))),
        }
    }
}

/// Identifies the message as a row description.
#[derive(Debug)]
pub struct RowDescription {
    pub fields: Vec<Field>,
}

/// One result-column description.
#[derive(Debug)]
pub struct Field {
    pub name: String,
    /// The table oid, or zero if the field is not a table column.
    pub table_oid: i32,
    /// The attribute number, or zero if the field is not a table column.
    pub column_id: i16,
    /// The object ID of the field's data type.
    pub type_oid: u32,
    /// The data type size; negative values denote variable-width types.
    pub type_size: i16,
    /// The type modifier, meaning is type-specific.
    pub type_modifier: i32,
    /// Zero (text) or one (binary).
    pub format: i16,
}

impl RowDescription {
    fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        need!(body, 2, "RowDescription");
        let len = body.get_i16();
        let mut fields = Vec::with_capacity(len.max(0) as usize);
        for _ in 0..len {
            let name = nul_string(&mut body)?;
            need!(body, 18, "RowDescription");
            fields.push(Field {
                name,
                table_oid: body.get_i32(),
                column_id: body.get_i16(),
                type_oid: body.get_u32(),
                type_size: body.get_i16(),
                type_modifier: body.get_i32(),
                format: body.get_i16(),
            });
        }
        Ok(Self { fields })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decode_authentication_sasl() {
        let mut body = Vec::new();
        body.extend_from_slice(&10i32.to_be_bytes());
        body.extend_from_slice(b"SCRAM-SHA-256-PLUS\0SCRAM-SHA-256\0\0");

        let message = BackendMessage::decode(b'R', body.into()).unwrap();
        match message {
            BackendMessage::Authentication(Authentication::Sasl { mechanisms }) => {
                assert_eq!(mechanisms, ["SCRAM-SHA-256-PLUS", "SCRAM-SHA-256"]);
            }
            f => panic!("unexpected decode: {f:?}"),
        }
    }

    #[test]
    fn decode_data_row_with_null() {
        let mut body = Vec::new();
        body.extend_from_slice(&2i16.to_be_bytes());
        body.extend_from_slice(&3i32.to_be_bytes());
        body.extend_from_slice(b"420");
        body.extend_from_slice(&(-1i32).to_be_bytes());

        let message = BackendMessage::decode(b'D', body.into()).unwrap();
        match message {
            BackendMessage::DataRow(row) => {
                assert_eq!(row.values.len(), 2);
                assert_eq!(row.values[0].as_deref(), Some(&b"420"[..]));
                assert_eq!(row.values[1], None);
            }
            f => panic!("unexpected decode: {f:?}"),
        }
    }

    #[test]
    fn decode_error_response_fields() {
        let body = b"SFATAL\0C28P01\0Mpassword authentication failed\0\0";
        let message = BackendMessage::decode(b'E', Bytes::copy_from_slice(body)).unwrap();
        match message {
            BackendMessage::ErrorResponse(err) => {
                assert_eq!(err.severity(), "FATAL");
                assert_eq!(err.code(), "28P01");
                assert_eq!(err.message(), "password authentication failed");
            }
            f => panic!("unexpected decode: {f:?}"),
        }
    }

    #[test]
    fn command_complete_rows_affected() {
        let insert = CommandComplete { tag: "INSERT 0 3".into() };
        assert_eq!(insert.rows_affected(), 3);
        let select = CommandComplete { tag: "SELECT 14".into() };
        assert_eq!(select.rows_affected(), 14);
        let begin = CommandComplete { tag: "BEGIN".into() };
        assert_eq!(begin.rows_affected(), 0);
    }

    #[test]
    fn truncated_message_is_an_error() {
        assert!(BackendMessage::decode(b'K', Bytes::from_static(&[0, 0])).is_err());
    }
}
