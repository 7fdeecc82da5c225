//! Multi-row statement batching.
//!
//! Rows are appended as bound values to one flat buffer; when the buffer
//! holds `max_rows` rows it is handed to a flush callback together with the
//! matching `VALUES` clause. Only placeholders and fixed literals from the
//! row template ever appear in generated SQL text.

use rusqlite::types::Value;

use crate::{DbError, Result};

/// SQLite's default bound-parameter limit per statement.
pub const MAX_BOUND_PARAMETERS: usize = 32766;

/// Accumulates rows for a multi-row statement and flushes at a threshold.
pub struct Batch<F>
where
    F: FnMut(&str, &[Value]) -> Result<()>,
{
    row_template: &'static str,
    columns: usize,
    max_rows: usize,
    values: Vec<Value>,
    rows: usize,
    written: usize,
    flush: F,
}

impl<F> Batch<F>
where
    F: FnMut(&str, &[Value]) -> Result<()>,
{
    /// `row_template` is one parenthesised row, e.g. `"(?, ?, NULL)"`; each
    /// `?` is one value per pushed row. `flush` receives the joined rows and
    /// the values to bind.
    ///
    /// `max_rows` is lowered so one flush never binds more than
    /// [`MAX_BOUND_PARAMETERS`] values.
    pub fn new(row_template: &'static str, max_rows: usize, flush: F) -> Self {
        let columns = row_template.matches('?').count();
        let max_rows = max_rows
            .min(MAX_BOUND_PARAMETERS / columns.max(1))
            .max(1);
        Self {
            row_template,
            columns,
            max_rows,
            values: Vec::with_capacity(columns * max_rows.min(1024)),
            rows: 0,
            written: 0,
            flush,
        }
    }

    /// Append one row, flushing once the batch is full.
    pub fn push<I>(&mut self, row: I) -> Result<()>
    where
        I: IntoIterator<Item = Value>,
    {
        let before = self.values.len();
        self.values.extend(row);
        let pushed = self.values.len() - before;
        if pushed != self.columns {
            self.values.truncate(before);
            return Err(DbError::InvalidInput(format!(
                "batch row has {pushed} values, template expects {}",
                self.columns
            )));
        }
        self.rows += 1;

        if self.rows >= self.max_rows {
            self.flush_pending()?;
        }
        Ok(())
    }

    /// Flush the remainder. Returns the total number of rows written.
    pub fn finish(mut self) -> Result<usize> {
        self.flush_pending()?;
        Ok(self.written)
    }

    fn flush_pending(&mut self) -> Result<()> {
        if self.rows == 0 {
            return Ok(());
        }
        let values_clause = repeat_joined(self.row_template, self.rows);
        tracing::trace!(rows = self.rows, columns = self.columns, "flushing batch");
        (self.flush)(&values_clause, &self.values)?;
        self.written += self.rows;
        self.rows = 0;
        self.values.clear();
        Ok(())
    }
}

/// `?, ?, ?` with `n` placeholders, for `IN (...)` lists.
pub fn placeholders(n: usize) -> String {
    repeat_joined("?", n)
}

fn repeat_joined(item: &str, n: usize) -> String {
    let mut out = String::with_capacity((item.len() + 2) * n);
    for i in 0..n {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(item);
    }
    out
}

/// Text value helper for building batch rows.
pub fn text(s: impl Into<String>) -> Value {
    Value::Text(s.into())
}

/// Optional text; `None` binds NULL.
pub fn opt_text(s: Option<&str>) -> Value {
    s.map_or(Value::Null, |s| Value::Text(s.to_string()))
}
