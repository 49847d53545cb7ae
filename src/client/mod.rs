//! SMTP submission client.
//!
//! This module speaks just enough SMTP to submit mail on behalf of an
//! authenticated user:
//!
//! - Plain TCP, implicit TLS (SMTPS) and STARTTLS upgrades
//! - EHLO with extension discovery
//! - AUTH PLAIN and AUTH LOGIN
//! - One MAIL/RCPT/DATA transaction per message, with RSET after a rejection
//! - Per-exchange timeouts
//!
//! # Examples
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use mailshot::client::SmtpClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client =
//!     SmtpClient::connect_tls("smtp.example.com:465", "smtp.example.com", Duration::from_secs(30))
//!         .await?;
//! client.read_greeting().await?;
//! client.ehlo().await?;
//! client.authenticate("me@example.com", "app-password").await?;
//! client
//!     .send_mail(
//!         "me@example.com",
//!         "you@example.com",
//!         b"Subject: Hi\r\n\r\nHello\r\n",
//!     )
//!     .await?;
//! client.quit().await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod response;
mod smtp_client;

pub use error::{ClientError, Result};
pub use response::{Response, ResponseLine};
pub use smtp_client::{SmtpClient, encode_data};
