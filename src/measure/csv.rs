//! Reader for the CSV report xray-knife writes with `-x csv`.
//!
//! The first row is the header. Fields may be double-quoted; a doubled quote
//! inside a quoted field is a literal quote. Rows whose field count does not
//! match the header are dropped.

use tracing::warn;

use super::{MeasureError, Record};

/// Parse a whole report into header-keyed records.
pub fn parse(text: &str) -> Result<Vec<Record>, MeasureError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut rows = split_rows(text)?.into_iter();

    let Some(header) = rows.next() else {
        return Ok(Vec::new());
    };
    let header: Vec<String> = header.into_iter().map(|h| h.trim().to_lowercase()).collect();
    if header.iter().all(String::is_empty) {
        return Err(MeasureError::Output("empty CSV header".into()));
    }

    let mut records = Vec::new();
    for (index, fields) in rows.enumerate() {
        if fields.len() == 1 && fields[0].is_empty() {
            continue;
        }
        if fields.len() != header.len() {
            warn!(
                row = index + 1,
                expected = header.len(),
                got = fields.len(),
                "CSV row has the wrong number of fields, skipping"
            );
            continue;
        }
        records.push(header.iter().cloned().zip(fields).collect());
    }
    Ok(records)
}

fn split_rows(text: &str) -> Result<Vec<Vec<String>>, MeasureError> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => row.push(std::mem::take(&mut field)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(MeasureError::Output("unterminated quoted CSV field".into()));
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    Ok(rows)
}
