//! Query API types and the query-object contract.
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::{
    Error, Result,
    postgres::{CommandComplete, DataRow, RowDescription, frontend},
    transport::PgStream,
};

/// A query configuration.
///
/// A plain text without name, parameters or binary preference runs over
/// the simple query protocol; anything else uses the extended protocol.
#[derive(Debug)]
pub struct Query {
    pub(crate) text: String,
    pub(crate) name: Option<String>,
    pub(crate) params: Vec<Option<String>>,
    pub(crate) binary: Option<bool>,
    pub(crate) timeout: Option<Duration>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Query {
        Query {
            text: text.into(),
            name: None,
            params: Vec::new(),
            binary: None,
            timeout: None,
        }
    }

    /// Prepared statement name. A session remembers which names the
    /// backend has parsed and skips the `Parse` for repeats.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Bind a text-format parameter value.
    pub fn bind(mut self, value: impl Into<String>) -> Self {
        self.params.push(Some(value.into()));
        self
    }

    /// Bind a SQL NULL parameter.
    pub fn bind_null(mut self) -> Self {
        self.params.push(None);
        self
    }

    /// Request binary result columns, overriding the session default.
    pub fn binary(mut self, binary: bool) -> Self {
        self.binary = Some(binary);
        self
    }

    /// Per-query read timeout, overriding the session default.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl From<&str> for Query {
    fn from(text: &str) -> Self {
        Query::new(text)
    }
}

impl From<String> for Query {
    fn from(text: String) -> Self {
        Query::new(text)
    }
}

/// The polymorphic handler a session delegates backend events to.
///
/// The session is pure glue: it routes every event of the active
/// window here and never introspects row data.
pub trait QueryJob: Send {
    /// Write the query's frames to the transport buffer.
    ///
    /// Returning an error is a preflight failure: nothing was sent and
    /// the session moves on to the next queued query.
    fn submit(&mut self, io: &mut PgStream) -> Result<()>;

    /// The `name -> text` pair to record once the backend acknowledges
    /// the `Parse` with `ParseComplete`.
    fn parsed_statement(&self) -> Option<(&str, &str)> {
        None
    }

    /// Read timeout for this query, when not using the session default.
    fn read_timeout(&self) -> Option<Duration> {
        None
    }

    fn handle_row_description(&mut self, _: RowDescription) { }

    fn handle_data_row(&mut self, _: DataRow) { }

    fn handle_command_complete(&mut self, _: CommandComplete) { }

    fn handle_empty_query_response(&mut self) { }

    fn handle_portal_suspended(&mut self) { }

    /// The backend switched to copy-in mode. The default answers with
    /// `CopyFail` so the wire does not wedge; the backend follows up
    /// with an `ErrorResponse` routed to this query.
    fn handle_copy_in_response(&mut self, io: &mut PgStream) -> Result<()> {
        io.send(frontend::CopyFail { message: "COPY is not supported by this query" })
    }

    fn handle_copy_data(&mut self, _: Bytes) { }

    /// A backend error, transport failure, timeout or cancellation for
    /// this query. Must complete the caller exactly once.
    fn handle_error(&mut self, err: Error);

    /// The window closed; whatever was collected is the result.
    fn handle_ready_for_query(&mut self);
}

/// The built-in query job backing [`Session::query`][crate::Session::query].
///
/// Collects row descriptions and data rows verbatim and answers the
/// caller through a oneshot channel on the closing `ReadyForQuery`.
pub(crate) struct TextQuery {
    query: Query,
    binary: bool,
    parse_sent: bool,
    columns: Vec<Column>,
    rows: Vec<Vec<Option<Bytes>>>,
    tag: Option<CommandComplete>,
    types: Option<Arc<Types>>,
    send: Option<oneshot::Sender<Result<QueryOutput>>>,
}

impl TextQuery {
    pub(crate) fn new(
        query: Query,
        default_binary: bool,
        types: Option<Arc<Types>>,
        send: oneshot::Sender<Result<QueryOutput>>,
    ) -> Self {
        let binary = query.binary.unwrap_or(default_binary);
        Self {
            query,
            binary,
            parse_sent: false,
            columns: Vec::new(),
            rows: Vec::new(),
            tag: None,
            types,
            send: Some(send),
        }
    }

    fn extended(&self) -> bool {
        self.query.name.is_some() || !self.query.params.is_empty() || self.binary
    }

    fn complete(&mut self, result: Result<QueryOutput>) {
        if let Some(send) = self.send.take() {
            let _ = send.send(result);
        }
    }
}

impl QueryJob for TextQuery {
    fn submit(&mut self, io: &mut PgStream) -> Result<()> {
        if !self.extended() {
            return io.send(frontend::Query { sql: &self.query.text });
        }

        let name = self.query.name.as_deref().unwrap_or("");
        let parsed = !name.is_empty() && io.stmt_text(name) == Some(self.query.text.as_str());

        if !parsed {
            io.send(frontend::Parse { name, sql: &self.query.text, param_oids: &[] })?;
            self.parse_sent = !name.is_empty();
        }
        io.send(frontend::Bind {
            portal: "",
            statement: name,
            params: &self.query.params,
            binary_result: self.binary,
        })?;
        io.send(frontend::Describe { kind: b'P', name: "" })?;
        io.send(frontend::Execute { portal: "", max_rows: 0 })?;
        io.send(frontend::Sync)?;

        Ok(())
    }

    fn parsed_statement(&self) -> Option<(&str, &str)> {
        if !self.parse_sent {
            return None;
        }
        self.query
            .name
            .as_deref()
            .map(|name| (name, self.query.text.as_str()))
    }

    fn read_timeout(&self) -> Option<Duration> {
        self.query.timeout
    }

    fn handle_row_description(&mut self, description: RowDescription) {
        self.columns = description
            .fields
            .into_iter()
            .map(|field| Column {
                name: field.name,
                type_oid: field.type_oid,
                binary: field.format == 1,
            })
            .collect();
    }

    fn handle_data_row(&mut self, row: DataRow) {
        self.rows.push(row.values);
    }

    fn handle_command_complete(&mut self, complete: CommandComplete) {
        self.tag = Some(complete);
    }

    fn handle_error(&mut self, err: Error) {
        self.complete(Err(err));
    }

    fn handle_ready_for_query(&mut self) {
        let rows_affected = self.tag.as_ref().map(CommandComplete::rows_affected);
        let output = QueryOutput {
            columns: std::mem::take(&mut self.columns),
            rows: std::mem::take(&mut self.rows),
            command_tag: self.tag.take().map(|tag| tag.tag),
            rows_affected: rows_affected.unwrap_or_default(),
            types: self.types.clone(),
        };
        self.complete(Ok(output));
    }
}

/// The collected result of one query.
#[derive(Debug)]
pub struct QueryOutput {
    pub columns: Vec<Column>,
    /// Raw column values in result order, `None` for SQL NULL.
    pub rows: Vec<Vec<Option<Bytes>>>,
    pub command_tag: Option<String>,
    pub rows_affected: u64,
    /// The injected type-parser registry, when the session has one.
    pub types: Option<Arc<Types>>,
}

/// One result column.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub type_oid: u32,
    pub binary: bool,
}

/// Parse a raw column value of one type oid.
pub type TypeParser = Arc<dyn Fn(&[u8]) -> String + Send + Sync>;

/// An injected table of value parsers, keyed by type oid.
///
/// The session only carries this table; registration and lookup are
/// the caller's business.
#[derive(Default)]
pub struct Types {
    parsers: HashMap<u32, TypeParser>,
}

impl Types {
    pub fn new() -> Types {
        Types::default()
    }

    pub fn register(&mut self, oid: u32, parser: TypeParser) {
        self.parsers.insert(oid, parser);
    }

    pub fn parser(&self, oid: u32) -> Option<&TypeParser> {
        self.parsers.get(&oid)
    }
}

impl fmt::Debug for Types {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Types")
            .field("registered", &self.parsers.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn text_query(query: Query) -> TextQuery {
        let (send, _recv) = oneshot::channel();
        TextQuery::new(query, false, None, send)
    }

    #[test]
    fn protocol_selection() {
        assert!(!text_query(Query::new("SELECT 1")).extended());
        assert!(text_query(Query::new("SELECT 1").name("st0")).extended());
        assert!(text_query(Query::new("SELECT $1").bind("x")).extended());
        assert!(text_query(Query::new("SELECT 1").binary(true)).extended());
    }

    #[test]
    fn session_binary_default_applies() {
        let (send, _recv) = oneshot::channel();
        let job = TextQuery::new(Query::new("SELECT 1"), true, None, send);
        assert!(job.binary);

        let (send, _recv) = oneshot::channel();
        let job = TextQuery::new(Query::new("SELECT 1").binary(false), true, None, send);
        assert!(!job.binary);
    }

    #[test]
    fn output_carries_command_tag() {
        let (send, mut recv) = oneshot::channel();
        let mut job = TextQuery::new(Query::new("DELETE FROM foo"), false, None, send);

        job.handle_command_complete(CommandComplete { tag: "DELETE 7".into() });
        job.handle_ready_for_query();

        let output = recv.try_recv().unwrap().unwrap();
        assert_eq!(output.command_tag.as_deref(), Some("DELETE 7"));
        assert_eq!(output.rows_affected, 7);
    }

    #[test]
    fn completes_exactly_once() {
        let (send, mut recv) = oneshot::channel();
        let mut job = TextQuery::new(Query::new("SELECT 1"), false, None, send);

        job.handle_error(crate::error::QueryTimeout.into());
        // a late completion for a failed query is ignored
        job.handle_ready_for_query();

        assert!(recv.try_recv().unwrap().is_err());
    }
}
