//! MySQL collaborators: connection setup, the streaming source cursor and the
//! per-writer sink, behind the pipeline's source/sink traits.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, QueryResult, TextProtocol, Value};

use crate::batch::{Escape, Row};
use crate::copy::SourceCursor;
use crate::target::Target;
use crate::writer::{SinkConnection, SinkConnector};

/// Connection options shared by the source connection and every writer.
#[derive(Clone)]
pub struct ConnectOptions {
    pub user: Option<String>,
    pub password: Option<String>,
    /// Connection character set, applied with `SET NAMES`
    pub charset: String,
    /// Crazy fast, super unsafe: disable binlog, unique checks and the RocksDB
    /// WAL on the session; refusal by the server is only a warning
    pub crazy: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            user: None,
            password: None,
            charset: "binary".to_string(),
            crazy: false,
        }
    }
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("charset", &self.charset)
            .field("crazy", &self.crazy)
            .finish()
    }
}

/// Opens a connection to `target` and applies the session settings.
pub async fn connect(target: &Target, options: &ConnectOptions) -> Result<Conn> {
    let mut builder = OptsBuilder::default()
        .ip_or_hostname(target.host.clone())
        .tcp_port(target.port)
        .db_name(Some(target.db.clone()));
    if let Some(user) = &options.user {
        builder = builder.user(Some(user.clone()));
    }
    if let Some(password) = &options.password {
        builder = builder.pass(Some(password.clone()));
    }
    let mut conn = Conn::new(Opts::from(builder))
        .await
        .with_context(|| format!("could not connect to {target}"))?;
    conn.query_drop(format!("SET NAMES {}", options.charset))
        .await
        .with_context(|| format!("could not set connection character set {:?}", options.charset))?;
    conn.query_drop("SET wait_timeout=3600")
        .await
        .context("could not set wait_timeout")?;
    if options.crazy {
        if let Err(error) = conn
            .query_drop("SET sql_log_bin=0, unique_checks=0, rocksdb_write_disable_wal=1")
            .await
        {
            tracing::warn!("could not set crazy session variables: {error:#}");
        }
    }
    tracing::debug!("connected to {target}");
    Ok(conn)
}

/// Streaming read of the source table.
///
/// Wraps a text-protocol query result, so rows are pulled off the wire as the
/// pipeline consumes them; the whole table is never resident.
pub struct MysqlSource<'a> {
    result: QueryResult<'a, 'static, TextProtocol>,
}

impl<'a> MysqlSource<'a> {
    pub async fn select(conn: &'a mut Conn, query: &str) -> Result<MysqlSource<'a>> {
        tracing::info!("reading source rows with {query:?}");
        let result = conn
            .query_iter(query.to_string())
            .await
            .with_context(|| format!("source query failed: {query}"))?;
        Ok(Self { result })
    }
}

#[async_trait]
impl SourceCursor for MysqlSource<'_> {
    async fn next_row(&mut self) -> Result<Option<Row>> {
        let Some(row) = self
            .result
            .next()
            .await
            .context("could not read next row from source")?
        else {
            return Ok(None);
        };
        let fields = row.unwrap().into_iter().map(field_bytes).collect();
        Ok(Some(Row { fields }))
    }
}

/// Collapses a protocol value to its raw bytes, `None` for NULL.
///
/// The text protocol only ever produces `NULL` and `Bytes`; the other variants
/// show up when a custom `--query` routes through the binary protocol, and are
/// rendered through the protocol crate's own literal formatting.
fn field_bytes(value: Value) -> Option<Bytes> {
    match value {
        Value::NULL => None,
        Value::Bytes(bytes) => Some(Bytes::from(bytes)),
        other => {
            let mut literal = other.as_sql(true);
            if literal.len() >= 2 && literal.starts_with('\'') && literal.ends_with('\'') {
                literal = literal[1..literal.len() - 1].to_string();
            }
            Some(Bytes::from(literal.into_bytes()))
        }
    }
}

/// One destination connection, exclusively owned by a writer.
pub struct MysqlSink {
    conn: Conn,
}

#[async_trait]
impl SinkConnection for MysqlSink {
    async fn execute(&mut self, statement: &[u8]) -> Result<()> {
        self.conn
            .query_drop(statement)
            .await
            .context("insert failed")?;
        Ok(())
    }
}

/// Opens one destination connection per pool writer, and supplies the literal
/// escaping the batch builder renders through.
#[derive(Debug, Clone)]
pub struct MysqlConnector {
    target: Target,
    options: ConnectOptions,
}

impl MysqlConnector {
    pub fn new(target: Target, options: ConnectOptions) -> Self {
        Self { target, options }
    }
}

#[async_trait]
impl SinkConnector for MysqlConnector {
    type Connection = MysqlSink;

    async fn connect(&self) -> Result<MysqlSink> {
        let conn = connect(&self.target, &self.options).await?;
        Ok(MysqlSink { conn })
    }
}

impl Escape for MysqlConnector {
    fn escape_into(&self, raw: &[u8], out: &mut Vec<u8>) -> Result<()> {
        append_escaped(raw, out);
        Ok(())
    }
}

/// Backslash-escapes a byte string for embedding in a single-quoted literal.
///
/// Byte-for-byte the classic server escaping. The protocol crate's own literal
/// formatting is not binary-safe (it goes through lossy UTF-8), so with the
/// default `binary` connection character set the escaping has to stay at the
/// byte level.
pub fn append_escaped(raw: &[u8], out: &mut Vec<u8>) {
    for &b in raw {
        match b {
            0x00 => out.extend_from_slice(b"\\0"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            0x1a => out.extend_from_slice(b"\\Z"),
            b'\'' => out.extend_from_slice(b"\\'"),
            b'"' => out.extend_from_slice(b"\\\""),
            b'\\' => out.extend_from_slice(b"\\\\"),
            _ => out.push(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn unescape(escaped: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut iter = escaped.iter();
        while let Some(&b) = iter.next() {
            if b != b'\\' {
                out.push(b);
                continue;
            }
            match iter.next() {
                Some(b'0') => out.push(0x00),
                Some(b'n') => out.push(b'\n'),
                Some(b'r') => out.push(b'\r'),
                Some(b'Z') => out.push(0x1a),
                Some(&c) => out.push(c),
                None => out.push(b'\\'),
            }
        }
        out
    }

    #[test]
    fn escapes_quotes_and_control_bytes() {
        let mut out = Vec::new();
        append_escaped(b"a'b\\c\x00d\ne", &mut out);
        assert_eq!(out, b"a\\'b\\\\c\\0d\\ne");
    }

    #[test]
    fn null_value_maps_to_none() {
        assert_eq!(field_bytes(Value::NULL), None);
    }

    #[test]
    fn bytes_value_passes_through() {
        assert_eq!(
            field_bytes(Value::Bytes(b"hello".to_vec())),
            Some(Bytes::from_static(b"hello"))
        );
    }

    #[test]
    fn numeric_values_render_as_text() {
        assert_eq!(field_bytes(Value::Int(-42)), Some(Bytes::from_static(b"-42")));
        assert_eq!(field_bytes(Value::UInt(7)), Some(Bytes::from_static(b"7")));
    }

    proptest! {
        #[test]
        fn escaping_round_trips(raw in proptest::collection::vec(any::<u8>(), 0..256)) {
            let mut escaped = Vec::new();
            append_escaped(&raw, &mut escaped);
            // no unescaped quote may survive, or the literal would terminate early
            for (i, &b) in escaped.iter().enumerate() {
                if b == b'\'' {
                    prop_assert!(i > 0 && escaped[i - 1] == b'\\');
                }
            }
            prop_assert_eq!(unescape(&escaped), raw);
        }
    }
}
