//! Per-recipient outcomes and the CSV report built from them.

use std::{fmt, io};

use serde::{Deserialize, Serialize};

/// File name the report is saved under unless the caller picks another.
pub const REPORT_FILE_NAME: &str = "send_report.csv";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    /// The server accepted the message.
    Sent,
    /// Building or transmitting this recipient's message failed.
    Failed,
    /// The session could not be established; no recipient was attempted.
    Error,
}

impl fmt::Display for SendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Error => "error",
        })
    }
}

/// The outcome of one send attempt.
///
/// The column order here is the column order of the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResult {
    /// Absent only for the connection/login error.
    pub recipient: Option<String>,
    pub status: SendStatus,
    /// Empty on success.
    pub error: String,
}

impl SendResult {
    #[must_use]
    pub fn sent(recipient: impl Into<String>) -> Self {
        Self {
            recipient: Some(recipient.into()),
            status: SendStatus::Sent,
            error: String::new(),
        }
    }

    #[must_use]
    pub fn failed(recipient: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            recipient: Some(recipient.into()),
            status: SendStatus::Failed,
            error: error.to_string(),
        }
    }

    /// The single result reported when connecting or logging in fails.
    #[must_use]
    pub fn session_error(error: impl fmt::Display) -> Self {
        Self {
            recipient: None,
            status: SendStatus::Error,
            error: error.to_string(),
        }
    }

    #[must_use]
    pub fn is_sent(&self) -> bool {
        self.status == SendStatus::Sent
    }
}

/// Aggregate counts shown after a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub sent: usize,
    /// Everything that was not sent, session errors included.
    pub failed: usize,
}

impl Summary {
    #[must_use]
    pub fn of(results: &[SendResult]) -> Self {
        let sent = results.iter().filter(|result| result.is_sent()).count();
        Self {
            sent,
            failed: results.len() - sent,
        }
    }

    #[must_use]
    pub const fn all_sent(&self) -> bool {
        self.failed == 0
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sent: {}. Failed: {}.", self.sent, self.failed)
    }
}

/// Writes `results` as CSV with a `recipient,status,error` header.
///
/// # Errors
///
/// Returns an error if writing to `writer` fails.
pub fn write_csv<W: io::Write>(writer: W, results: &[SendResult]) -> csv::Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);

    // Written by hand so that an empty report still has its header row.
    writer.write_record(["recipient", "status", "error"])?;
    for result in results {
        writer.serialize(result)?;
    }
    writer.flush()?;
    Ok(())
}
