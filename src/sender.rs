//! Sends one message to each recipient of a batch over a single session.

use std::{future::Future, time::Duration};

use crate::{
    client::{ClientError, SmtpClient},
    config::{Credentials, DEFAULT_TIMEOUT, Endpoint, Security},
    error::SendError,
    message::{Attachment, MessageSpec, build_message},
    report::SendResult,
};

/// An authenticated connection that can carry several mail transactions.
pub trait MailSession: Send {
    /// Submits `message` for a single recipient.
    fn send(
        &mut self,
        sender: &str,
        recipient: &str,
        message: &[u8],
    ) -> impl Future<Output = Result<(), ClientError>> + Send;

    /// Ends the session politely.
    fn quit(&mut self) -> impl Future<Output = Result<(), ClientError>> + Send;

    /// Drops the transport without a goodbye. Must be safe to call at any time.
    fn close(&mut self);
}

/// Opens authenticated sessions.
pub trait Connector: Send + Sync {
    type Session: MailSession;

    /// Connects, secures the transport and logs in.
    ///
    /// # Errors
    ///
    /// Any failure before the session is ready to send.
    fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        timeout: Duration,
    ) -> impl Future<Output = Result<Self::Session, ClientError>> + Send;
}

impl MailSession for SmtpClient {
    async fn send(
        &mut self,
        sender: &str,
        recipient: &str,
        message: &[u8],
    ) -> Result<(), ClientError> {
        self.send_mail(sender, recipient, message).await.map(|_| ())
    }

    async fn quit(&mut self) -> Result<(), ClientError> {
        Self::quit(self).await.map(|_| ())
    }

    fn close(&mut self) {
        Self::close(self);
    }
}

/// Connects to a real submission server.
///
/// The transport is always TLS before credentials are sent: either from the
/// first byte, or upgraded with STARTTLS.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmtpConnector;

impl SmtpConnector {
    async fn handshake(
        client: &mut SmtpClient,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<(), ClientError> {
        client.read_greeting().await?;
        client.ehlo().await?;

        if endpoint.security == Security::StartTls {
            client.starttls().await?;
            client.ehlo().await?;
        }

        client
            .authenticate(credentials.username(), credentials.secret())
            .await?;
        Ok(())
    }
}

impl Connector for SmtpConnector {
    type Session = SmtpClient;

    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<SmtpClient, ClientError> {
        let address = endpoint.address();
        let mut client = match endpoint.security {
            Security::Implicit => {
                SmtpClient::connect_tls(&address, endpoint.host.as_str(), timeout).await?
            }
            Security::StartTls => {
                SmtpClient::connect(&address, endpoint.host.as_str(), timeout).await?
            }
        };

        if let Err(e) = Self::handshake(&mut client, endpoint, credentials).await {
            if client.is_connected() && SmtpClient::quit(&mut client).await.is_err() {
                client.close();
            }
            return Err(e);
        }

        Ok(client)
    }
}

/// Everything needed to send one batch.
#[derive(Debug, Clone)]
pub struct Batch {
    pub endpoint: Endpoint,
    pub credentials: Credentials,
    /// Sent to in this order.
    pub recipients: Vec<String>,
    pub message: MessageSpec,
    pub attachments: Vec<Attachment>,
    /// Bounds connecting and each exchange with the server.
    pub timeout: Duration,
}

impl Batch {
    #[must_use]
    pub fn new(
        endpoint: Endpoint,
        credentials: Credentials,
        recipients: Vec<String>,
        message: MessageSpec,
    ) -> Self {
        Self {
            endpoint,
            credentials,
            recipients,
            message,
            attachments: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A connected session that is closed on every way out of a batch.
///
/// Before it exists the batch is disconnected; [`finish`](Self::finish)
/// moves it to closed. If the batch future is dropped or panics while the
/// session is still connected, the transport is closed on drop.
struct LiveSession<S: MailSession> {
    session: S,
    closed: bool,
}

impl<S: MailSession> LiveSession<S> {
    const fn new(session: S) -> Self {
        Self {
            session,
            closed: false,
        }
    }

    async fn finish(mut self) {
        if let Err(e) = self.session.quit().await {
            tracing::warn!("QUIT failed, closing the connection: {e}");
            self.session.close();
        }
        self.closed = true;
        tracing::debug!("Session closed");
    }
}

impl<S: MailSession> Drop for LiveSession<S> {
    fn drop(&mut self) {
        if !self.closed {
            tracing::warn!("Batch ended before the session was closed, forcing it shut");
            self.session.close();
        }
    }
}

/// Runs batches: one session each, one message per recipient.
#[derive(Debug, Clone, Default)]
pub struct BulkSender<C = SmtpConnector> {
    connector: C,
}

impl BulkSender {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<C: Connector> BulkSender<C> {
    pub const fn with_connector(connector: C) -> Self {
        Self { connector }
    }

    /// Sends the batch and returns one result per recipient, in input order.
    ///
    /// If the session cannot be opened the result is a single
    /// [`SendStatus::Error`](crate::report::SendStatus::Error) entry and no
    /// recipient is attempted. An empty recipient list never connects.
    pub async fn send_batch(&self, batch: &Batch) -> Vec<SendResult> {
        self.send_batch_with_progress(batch, |_, _, _| {}).await
    }

    /// Like [`send_batch`](Self::send_batch), calling `progress` with
    /// `(done, total, result)` after every recipient. It is not called when
    /// the session cannot be opened.
    #[tracing::instrument(
        level = tracing::Level::INFO,
        skip_all,
        fields(endpoint = %batch.endpoint, recipients = batch.recipients.len())
    )]
    pub async fn send_batch_with_progress<F>(&self, batch: &Batch, mut progress: F) -> Vec<SendResult>
    where
        F: FnMut(usize, usize, &SendResult) + Send,
    {
        let total = batch.recipients.len();
        if total == 0 {
            tracing::info!("No recipients, nothing to send");
            return Vec::new();
        }

        tracing::info!("Opening session");

        let session = match self
            .connector
            .connect(&batch.endpoint, &batch.credentials, batch.timeout)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                tracing::error!("Could not open session: {e}");
                return vec![SendResult::session_error(e)];
            }
        };

        let mut live = LiveSession::new(session);
        let mut results = Vec::with_capacity(total);

        for recipient in &batch.recipients {
            let result = match send_one(&mut live.session, batch, recipient).await {
                Ok(()) => {
                    tracing::info!(%recipient, "Sent");
                    SendResult::sent(recipient.as_str())
                }
                Err(e) => {
                    tracing::warn!(%recipient, "Failed: {e}");
                    SendResult::failed(recipient.as_str(), e)
                }
            };

            progress(results.len() + 1, total, &result);
            results.push(result);
        }

        live.finish().await;
        results
    }
}

async fn send_one<S: MailSession>(
    session: &mut S,
    batch: &Batch,
    recipient: &str,
) -> Result<(), SendError> {
    let message = build_message(&batch.message, recipient, &batch.attachments)?;
    session
        .send(&batch.message.sender, recipient, &message.to_bytes())
        .await?;
    Ok(())
}
