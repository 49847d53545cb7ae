//! Test support utilities for driving batches against a local server.
#![allow(dead_code)] // Each test binary uses a different subset

pub mod mock_server;

use std::time::Duration;

use mailshot::{
    Credentials, Endpoint,
    client::{ClientError, SmtpClient},
    sender::Connector,
};
pub use mock_server::{MockSmtpServer, SmtpCommand};

/// Logs in over plain TCP, for talking to [`MockSmtpServer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextConnector;

impl Connector for PlaintextConnector {
    type Session = SmtpClient;

    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<SmtpClient, ClientError> {
        let mut client = SmtpClient::connect(&endpoint.address(), endpoint.host.as_str(), timeout).await?;
        client.read_greeting().await?;
        client.ehlo().await?;
        client
            .authenticate(credentials.username(), credentials.secret())
            .await?;
        Ok(client)
    }
}
