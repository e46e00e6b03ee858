//! Row batching: accumulates source rows into rendered multi-row INSERT statements.

use anyhow::Result;
use bytes::Bytes;

/// One source record: ordered field values, `None` for SQL NULL.
///
/// Rows are ephemeral; they are rendered into the current batch buffer as soon as
/// the cursor produces them and never retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub fields: Vec<Option<Bytes>>,
}

/// Safe-literal rendering, supplied by the sink dialect.
pub trait Escape {
    /// Appends the escaped form of `raw` to `out`, without surrounding quotes.
    fn escape_into(&self, raw: &[u8], out: &mut Vec<u8>) -> Result<()>;
}

/// One fully-rendered bulk INSERT statement, covering one or more source rows.
///
/// Exclusively owned: built by the producer, handed through the queue, freed by
/// the writer that executed it.
#[derive(Debug)]
pub struct BatchPayload {
    statement: Vec<u8>,
    rows: usize,
}

impl BatchPayload {
    pub fn statement(&self) -> &[u8] {
        &self.statement
    }

    /// Number of rows rendered into this statement.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Rendered statement size in bytes.
    pub fn len(&self) -> usize {
        self.statement.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statement.is_empty()
    }
}

/// Accumulates rows into size-bounded [`BatchPayload`]s.
///
/// Every appended row lands in exactly one payload and payloads preserve row
/// order. A payload is finalized as soon as the buffer grows past the flush
/// threshold, so each payload except the final one is at least threshold-sized;
/// the final one (from [`BatchBuilder::finish`]) may be smaller, and any payload
/// may exceed the threshold by up to one rendered row.
pub struct BatchBuilder<'a, E> {
    escape: &'a E,
    prefix: String,
    buf: Vec<u8>,
    rows: usize,
    flush_threshold: usize,
}

impl<'a, E: Escape> BatchBuilder<'a, E> {
    pub fn new(table: &str, flush_threshold: usize, escape: &'a E) -> Self {
        Self {
            escape,
            prefix: format!("INSERT INTO {table} VALUES \n"),
            buf: Vec::with_capacity(Self::buffer_capacity(flush_threshold)),
            rows: 0,
            flush_threshold,
        }
    }

    // a new buffer gets ten times the threshold (10 MiB at the default), so
    // growing past the soft limit by one more row does not reallocate
    fn buffer_capacity(flush_threshold: usize) -> usize {
        flush_threshold.saturating_mul(10)
    }

    /// Renders `row` into the current buffer; returns a finalized payload when the
    /// buffer crossed the flush threshold.
    ///
    /// An escape failure poisons the in-progress buffer; the builder must be
    /// dropped, no payload is emitted for the failed row.
    pub fn push_row(&mut self, row: &Row) -> Result<Option<BatchPayload>> {
        if self.buf.is_empty() {
            self.buf.extend_from_slice(self.prefix.as_bytes());
        } else {
            self.buf.extend_from_slice(b",\n");
        }
        self.buf.push(b'(');
        for (i, field) in row.fields.iter().enumerate() {
            if i > 0 {
                self.buf.push(b',');
            }
            match field {
                None => self.buf.extend_from_slice(b"NULL"),
                Some(raw) => {
                    // worst case every byte escapes to two, plus the closing quote
                    self.buf.reserve(raw.len() * 2 + 1);
                    self.buf.push(b'\'');
                    self.escape.escape_into(raw, &mut self.buf)?;
                    self.buf.push(b'\'');
                }
            }
        }
        self.buf.push(b')');
        self.rows += 1;
        if self.buf.len() > self.flush_threshold {
            return Ok(Some(self.take_payload()));
        }
        Ok(None)
    }

    /// Finalizes whatever is buffered; `None` when no rows are pending.
    pub fn finish(mut self) -> Option<BatchPayload> {
        if self.rows == 0 {
            return None;
        }
        Some(self.take_payload())
    }

    fn take_payload(&mut self) -> BatchPayload {
        let statement = std::mem::replace(
            &mut self.buf,
            Vec::with_capacity(Self::buffer_capacity(self.flush_threshold)),
        );
        BatchPayload {
            statement,
            rows: std::mem::take(&mut self.rows),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // backslash-doubling stand-in for the sink's escaping function
    struct TestEscape;

    impl Escape for TestEscape {
        fn escape_into(&self, raw: &[u8], out: &mut Vec<u8>) -> Result<()> {
            for &b in raw {
                if b == b'\'' || b == b'\\' {
                    out.push(b'\\');
                }
                out.push(b);
            }
            Ok(())
        }
    }

    struct FailingEscape;

    impl Escape for FailingEscape {
        fn escape_into(&self, _raw: &[u8], _out: &mut Vec<u8>) -> Result<()> {
            Err(anyhow::anyhow!("escape failed"))
        }
    }

    fn row(fields: &[Option<&[u8]>]) -> Row {
        Row {
            fields: fields
                .iter()
                .map(|f| f.map(Bytes::copy_from_slice))
                .collect(),
        }
    }

    #[test]
    fn renders_insert_prefix_and_tuples() {
        let escape = TestEscape;
        let mut builder = BatchBuilder::new("dst_table", 1024, &escape);
        assert!(
            builder
                .push_row(&row(&[Some(b"1"), Some(b"alice")]))
                .unwrap()
                .is_none()
        );
        assert!(
            builder
                .push_row(&row(&[Some(b"2"), Some(b"bob")]))
                .unwrap()
                .is_none()
        );
        let payload = builder.finish().unwrap();
        assert_eq!(payload.rows(), 2);
        assert_eq!(
            std::str::from_utf8(payload.statement()).unwrap(),
            "INSERT INTO dst_table VALUES \n('1','alice'),\n('2','bob')"
        );
    }

    #[test]
    fn null_field_renders_unquoted() {
        let escape = TestEscape;
        let mut builder = BatchBuilder::new("t", 1024, &escape);
        builder.push_row(&row(&[None, Some(b"x")])).unwrap();
        let payload = builder.finish().unwrap();
        assert_eq!(
            std::str::from_utf8(payload.statement()).unwrap(),
            "INSERT INTO t VALUES \n(NULL,'x')"
        );
    }

    #[test]
    fn quotes_and_backslashes_are_escaped() {
        let escape = TestEscape;
        let mut builder = BatchBuilder::new("t", 1024, &escape);
        builder.push_row(&row(&[Some(br"it's a \ test")])).unwrap();
        let payload = builder.finish().unwrap();
        assert_eq!(
            std::str::from_utf8(payload.statement()).unwrap(),
            "INSERT INTO t VALUES \n('it\\'s a \\\\ test')"
        );
    }

    #[test]
    fn flushes_when_threshold_crossed() {
        let escape = TestEscape;
        let mut builder = BatchBuilder::new("t", 64, &escape);
        let mut payloads = Vec::new();
        for n in 0..100 {
            let value = format!("{n:04}");
            if let Some(payload) = builder.push_row(&row(&[Some(value.as_bytes())])).unwrap() {
                payloads.push(payload);
            }
        }
        if let Some(payload) = builder.finish() {
            payloads.push(payload);
        }
        let total: usize = payloads.iter().map(BatchPayload::rows).sum();
        assert_eq!(total, 100);
        // all but the trailing flush crossed the threshold
        for payload in &payloads[..payloads.len() - 1] {
            assert!(payload.len() > 64);
        }
        // row order is preserved across consecutive payloads
        let joined: Vec<u8> = payloads
            .iter()
            .flat_map(|p| p.statement().to_vec())
            .collect();
        let joined = String::from_utf8(joined).unwrap();
        let mut last = 0;
        for n in 0..100 {
            let pos = joined.find(&format!("('{n:04}')")).unwrap();
            assert!(pos >= last);
            last = pos;
        }
    }

    #[test]
    fn oversized_row_makes_oversized_payload() {
        let escape = TestEscape;
        let mut builder = BatchBuilder::new("t", 16, &escape);
        let big = vec![b'x'; 1000];
        let payload = builder
            .push_row(&row(&[Some(&big)]))
            .unwrap()
            .expect("oversized row must flush immediately");
        assert_eq!(payload.rows(), 1);
        assert!(payload.len() > 1000);
    }

    #[test]
    fn empty_input_emits_nothing() {
        let escape = TestEscape;
        let builder = BatchBuilder::new("t", 1024, &escape);
        assert!(builder.finish().is_none());
    }

    #[test]
    fn escape_failure_propagates() {
        let escape = FailingEscape;
        let mut builder = BatchBuilder::new("t", 1024, &escape);
        assert!(builder.push_row(&row(&[Some(b"v")])).is_err());
    }

    proptest! {
        #[test]
        fn every_row_lands_in_exactly_one_payload(
            rows in proptest::collection::vec(
                proptest::collection::vec(
                    proptest::option::of(proptest::collection::vec(any::<u8>(), 0..32)),
                    1..6,
                ),
                0..200,
            ),
            threshold in 16usize..512,
        ) {
            let escape = TestEscape;
            let mut builder = BatchBuilder::new("t", threshold, &escape);
            let mut payloads = Vec::new();
            for fields in &rows {
                let row = Row {
                    fields: fields.iter().map(|f| f.clone().map(Bytes::from)).collect(),
                };
                if let Some(payload) = builder.push_row(&row).unwrap() {
                    payloads.push(payload);
                }
            }
            if let Some(payload) = builder.finish() {
                payloads.push(payload);
            }
            let total: usize = payloads.iter().map(BatchPayload::rows).sum();
            prop_assert_eq!(total, rows.len());
            for payload in payloads.iter().rev().skip(1) {
                prop_assert!(payload.len() > threshold);
            }
        }
    }
}
