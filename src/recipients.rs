//! Turning pasted text or an uploaded spreadsheet into a list of addresses.
//!
//! Addresses are only trimmed. They are not validated and duplicates are
//! kept, in input order; the server is the judge of what it accepts.

use csv::{ReaderBuilder, StringRecord};
use thiserror::Error;

use crate::error::ParseError;

/// Header that selects the address column, compared case-insensitively.
const EMAIL_COLUMN: &str = "email";

/// Reasons a table parse attempt is abandoned for the next fallback.
#[derive(Debug, Error)]
enum TableError {
    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error("no header row")]
    NoColumns,

    #[error("expected {expected} fields on line {line}, saw {found}")]
    TooManyFields {
        line: u64,
        expected: usize,
        found: usize,
    },
}

/// Splits text on commas, semicolons and newlines.
///
/// Each piece is trimmed and empty pieces are dropped, so any mix of
/// separators and stray whitespace is accepted.
#[must_use]
pub fn parse_text(text: &str) -> Vec<String> {
    text.split([',', ';', '\n'])
        .map(str::trim)
        .filter(|address| !address.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Reads addresses out of a CSV file.
///
/// The data is tried as comma-separated, then semicolon-separated, and
/// finally as plain text for [`parse_text`]. From a table, the column headed
/// `email` (any case) is used, or the first column when there is none.
///
/// # Errors
///
/// Returns [`ParseError::Decode`] only when both table attempts fail and the
/// bytes are not valid UTF-8 either.
pub fn parse_table(data: &[u8]) -> Result<Vec<String>, ParseError> {
    for delimiter in [b',', b';'] {
        match read_column(data, delimiter) {
            Ok(addresses) => return Ok(addresses),
            Err(e) => {
                tracing::debug!(
                    delimiter = %char::from(delimiter),
                    "Recipient table did not parse, trying the next format: {e}"
                );
            }
        }
    }

    let text = std::str::from_utf8(data)?;
    Ok(parse_text(text))
}

/// Picks the recipient source the way the sender form does: an uploaded
/// table wins over pasted text, and neither gives an empty list.
///
/// # Errors
///
/// Propagates [`parse_table`] errors.
pub fn parse_any(text: Option<&str>, table: Option<&[u8]>) -> Result<Vec<String>, ParseError> {
    match (table, text) {
        (Some(table), _) => parse_table(table),
        (None, Some(text)) => Ok(parse_text(text)),
        (None, None) => Ok(Vec::new()),
    }
}

fn read_column(data: &[u8], delimiter: u8) -> Result<Vec<String>, TableError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        // Short rows are missing cells; long rows are rejected below.
        .flexible(true)
        .from_reader(data);

    let headers = reader.headers()?.clone();
    if headers.is_empty() {
        return Err(TableError::NoColumns);
    }
    let column = address_column(&headers);

    let mut addresses = Vec::new();
    for record in reader.records() {
        let record = record?;
        if record.len() > headers.len() {
            return Err(TableError::TooManyFields {
                line: record.position().map_or(0, csv::Position::line),
                expected: headers.len(),
                found: record.len(),
            });
        }

        if let Some(cell) = record.get(column).map(str::trim)
            && !cell.is_empty()
        {
            addresses.push(cell.to_string());
        }
    }

    Ok(addresses)
}

fn address_column(headers: &StringRecord) -> usize {
    headers
        .iter()
        .position(|header| {
            header
                .trim_start_matches('\u{feff}')
                .trim()
                .eq_ignore_ascii_case(EMAIL_COLUMN)
        })
        .unwrap_or(0)
}
