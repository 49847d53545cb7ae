//! SMTP submission client with implicit TLS and STARTTLS support.

use std::{future::Future, net::IpAddr, sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, RootCertStore, pki_types::ServerName},
};
use zeroize::Zeroizing;

use super::{
    error::{ClientError, Result},
    response::Response,
};

/// Initial size of the read buffer for SMTP responses.
const BUFFER_SIZE: usize = 8192;

/// Maximum size of the read buffer to prevent unbounded growth (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// An SMTP connection that can be either plain TCP or TLS-wrapped.
enum ClientConnection {
    Plain(TcpStream),
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

impl ClientConnection {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
            Self::Tls(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }

    async fn shutdown(&mut self) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.shutdown().await?,
            Self::Tls(stream) => stream.shutdown().await?,
        }
        Ok(())
    }

    /// Wraps a plain connection in TLS, verifying the server certificate
    /// against the platform trust store.
    async fn upgrade_to_tls(self, domain: &str) -> Result<Self> {
        match self {
            Self::Plain(stream) => {
                let connector = tls_connector()?;
                let server_name = ServerName::try_from(domain.to_string())
                    .map_err(|e| ClientError::TlsError(format!("Invalid domain: {e}")))?;

                let tls_stream = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| ClientError::TlsError(e.to_string()))?;

                Ok(Self::Tls(tls_stream))
            }
            Self::Tls(_) => Err(ClientError::TlsError(
                "Connection is already TLS".to_string(),
            )),
        }
    }
}

fn tls_connector() -> Result<TlsConnector> {
    let mut root_store = RootCertStore::empty();

    let certs = rustls_native_certs::load_native_certs();
    // Log errors but don't fail if some certs couldn't be loaded
    if !certs.errors.is_empty() {
        tracing::warn!(?certs.errors, "Some certificates could not be loaded");
    }

    let (added, ignored) = root_store.add_parsable_certificates(certs.certs);
    if added == 0 {
        return Err(ClientError::TlsError(
            "No trusted root certificates could be loaded".to_string(),
        ));
    }
    tracing::debug!(added, ignored, "Loaded platform root certificates");

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Runs `future`, failing with [`ClientError::Timeout`] once `after` elapses.
async fn with_timeout<T, E>(
    after: Duration,
    operation: &str,
    future: impl Future<Output = std::result::Result<T, E>>,
) -> Result<T>
where
    ClientError: From<E>,
{
    match tokio::time::timeout(after, future).await {
        Ok(result) => result.map_err(ClientError::from),
        Err(_) => Err(ClientError::Timeout {
            operation: operation.to_string(),
            after,
        }),
    }
}

/// RFC 5321 address literal for the EHLO greeting.
fn address_literal(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(ip) => format!("[{ip}]"),
        IpAddr::V6(ip) => format!("[IPv6:{ip}]"),
    }
}

/// Prepares message content for the DATA phase.
///
/// Line endings are normalised to CRLF, lines starting with `.` get an
/// extra `.`, and the end-of-data marker is appended.
#[must_use]
pub fn encode_data(data: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(data.len() + data.len() / 64 + 5);
    let mut line_start = true;
    let mut bytes = data.iter().copied().peekable();

    while let Some(byte) = bytes.next() {
        if line_start && byte == b'.' {
            encoded.push(b'.');
        }

        match byte {
            b'\r' => {
                if bytes.peek() == Some(&b'\n') {
                    bytes.next();
                }
                encoded.extend_from_slice(b"\r\n");
                line_start = true;
            }
            b'\n' => {
                encoded.extend_from_slice(b"\r\n");
                line_start = true;
            }
            _ => {
                encoded.push(byte);
                line_start = false;
            }
        }
    }

    if !line_start {
        encoded.extend_from_slice(b"\r\n");
    }
    encoded.extend_from_slice(b".\r\n");
    encoded
}

/// A connection to a mail submission server.
///
/// Every exchange with the server is bounded by the timeout given at
/// connect time.
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    server_domain: String,
    local_name: String,
    timeout: Duration,
    extensions: Vec<String>,
}

impl SmtpClient {
    /// Opens a plain TCP connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or times out.
    pub async fn connect(
        addr: &str,
        server_domain: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let stream = with_timeout(timeout, "Connect", TcpStream::connect(addr)).await?;

        let local_name = stream
            .local_addr()
            .map_or_else(|_| "[127.0.0.1]".to_string(), |addr| address_literal(addr.ip()));

        crate::internal!(level = DEBUG, "Connected to {addr}");

        Ok(Self {
            connection: Some(ClientConnection::Plain(stream)),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            server_domain: server_domain.into(),
            local_name,
            timeout,
            extensions: Vec::new(),
        })
    }

    /// Opens a connection that is TLS from the first byte (SMTPS).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the TLS handshake fails.
    pub async fn connect_tls(
        addr: &str,
        server_domain: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut client = Self::connect(addr, server_domain, timeout).await?;
        client.upgrade().await?;
        Ok(client)
    }

    /// Reads the server greeting, which must be a 220.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the server turns us away.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        let after = self.timeout;
        let response = with_timeout(after, "Greeting", self.read_response()).await;
        self.drop_on_failure(response)?.expect(220)
    }

    /// Sends EHLO and records the extensions the server advertises.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails or is rejected.
    pub async fn ehlo(&mut self) -> Result<Response> {
        let response = self
            .command(&format!("EHLO {}", self.local_name))
            .await?
            .expect_success()?;

        self.extensions = response.lines.iter().skip(1).cloned().collect();
        Ok(response)
    }

    /// Whether the last EHLO reply advertised `extension`.
    #[must_use]
    pub fn supports(&self, extension: &str) -> bool {
        self.extensions.iter().any(|line| {
            line.split([' ', '='])
                .next()
                .is_some_and(|keyword| keyword.eq_ignore_ascii_case(extension))
        })
    }

    /// The SASL mechanisms listed in the last EHLO reply, upper-cased.
    ///
    /// `None` when the server does not offer AUTH at all.
    #[must_use]
    pub fn auth_mechanisms(&self) -> Option<Vec<String>> {
        let mut found = false;
        let mut mechanisms = Vec::new();

        for line in &self.extensions {
            let mut words = line.split([' ', '=']);
            if words
                .next()
                .is_some_and(|keyword| keyword.eq_ignore_ascii_case("AUTH"))
            {
                found = true;
                mechanisms.extend(
                    words
                        .filter(|word| !word.is_empty())
                        .map(str::to_ascii_uppercase),
                );
            }
        }

        found.then_some(mechanisms)
    }

    /// Sends STARTTLS and upgrades the connection to TLS.
    ///
    /// The server's extensions are forgotten afterwards; send EHLO again.
    ///
    /// # Errors
    ///
    /// Returns an error if the server does not offer STARTTLS, rejects it,
    /// or the handshake fails.
    pub async fn starttls(&mut self) -> Result<Response> {
        if !self.supports("STARTTLS") {
            return Err(ClientError::NotSupported("STARTTLS"));
        }

        let response = self.command("STARTTLS").await?.expect(220)?;
        self.upgrade().await?;

        crate::internal!(level = DEBUG, "TLS negotiated via STARTTLS");
        Ok(response)
    }

    /// Logs in with the first usable mechanism: PLAIN, then LOGIN.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotSupported`] if the server offers no AUTH,
    /// and [`ClientError::AuthenticationFailed`] if no mechanism fits or
    /// the credentials are refused.
    pub async fn authenticate(&mut self, username: &str, secret: &str) -> Result<Response> {
        let mechanisms = self.auth_mechanisms().ok_or(ClientError::NotSupported("AUTH"))?;

        let result = if mechanisms.iter().any(|m| m == "PLAIN") {
            self.auth_plain(username, secret).await
        } else if mechanisms.iter().any(|m| m == "LOGIN") {
            self.auth_login(username, secret).await
        } else {
            return Err(ClientError::AuthenticationFailed(format!(
                "No suitable authentication mechanism among [{}]",
                mechanisms.join(", ")
            )));
        };

        result.map_err(|e| match e {
            ClientError::SmtpError { code, message } => {
                ClientError::AuthenticationFailed(format!("{code} {message}"))
            }
            other => other,
        })
    }

    async fn auth_plain(&mut self, username: &str, secret: &str) -> Result<Response> {
        let token = Zeroizing::new(format!("\0{username}\0{secret}"));
        let line = Zeroizing::new(format!("AUTH PLAIN {}", BASE64.encode(token.as_bytes())));

        self.secret_command(&line, "AUTH PLAIN <redacted>")
            .await?
            .expect(235)
    }

    async fn auth_login(&mut self, username: &str, secret: &str) -> Result<Response> {
        self.command("AUTH LOGIN").await?.expect(334)?;

        let user = BASE64.encode(username.as_bytes());
        self.secret_command(&user, "<redacted username>")
            .await?
            .expect(334)?;

        let password = Zeroizing::new(BASE64.encode(secret.as_bytes()));
        self.secret_command(&password, "<redacted password>")
            .await?
            .expect(235)
    }

    /// Sends MAIL FROM.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails or is rejected.
    pub async fn mail_from(&mut self, from: &str) -> Result<Response> {
        self.command(&format!("MAIL FROM:<{from}>"))
            .await?
            .expect_success()
    }

    /// Sends RCPT TO.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails or is rejected.
    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>"))
            .await?
            .expect_success()
    }

    /// Sends DATA, expecting the server to ask for content with a 354.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails or is rejected.
    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await?.expect(354)
    }

    /// Sends message content followed by the end-of-data marker.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails or the server refuses the message.
    pub async fn send_data(&mut self, data: &[u8]) -> Result<Response> {
        let encoded = encode_data(data);
        crate::outgoing!("<{} bytes of message data>", encoded.len());

        let after = self.timeout;
        let exchange = async {
            self.write(&encoded).await?;
            self.read_response().await
        };

        let response = with_timeout(after, "Message data", exchange).await;
        self.drop_on_failure(response)?.expect_success()
    }

    /// Runs one mail transaction for a single recipient.
    ///
    /// When the server rejects a step the transaction is reset with RSET so
    /// the connection can be used for the next message. Any other failure
    /// leaves the client disconnected.
    ///
    /// # Errors
    ///
    /// Returns the first failure of MAIL FROM, RCPT TO, DATA or the content.
    pub async fn send_mail(&mut self, from: &str, to: &str, data: &[u8]) -> Result<Response> {
        let result = self.transaction(from, to, data).await;

        if let Err(ClientError::SmtpError { .. }) = &result
            && let Err(e) = self.rset().await
        {
            crate::internal!(level = DEBUG, "RSET after rejected transaction failed: {e}");
        }

        result
    }

    async fn transaction(&mut self, from: &str, to: &str, data: &[u8]) -> Result<Response> {
        self.mail_from(from).await?;
        self.rcpt_to(to).await?;
        self.data().await?;
        self.send_data(data).await
    }

    /// Sends RSET to abandon the current transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails or is rejected.
    pub async fn rset(&mut self) -> Result<Response> {
        self.command("RSET").await?.expect_success()
    }

    /// Sends QUIT and shuts the connection down.
    ///
    /// The server's reply code is not checked; the session is over either
    /// way.
    ///
    /// # Errors
    ///
    /// Returns an error if QUIT cannot be sent or answered; the connection
    /// is dropped in that case.
    pub async fn quit(&mut self) -> Result<Response> {
        let response = self.command("QUIT").await?;
        if response.code != 221 {
            crate::internal!(level = DEBUG, "Unexpected reply to QUIT: {response}");
        }

        if let Some(mut connection) = self.connection.take()
            && let Err(e) = connection.shutdown().await
        {
            crate::internal!(level = DEBUG, "Shutdown after QUIT failed: {e}");
        }

        Ok(response)
    }

    /// Drops the connection without saying goodbye.
    pub fn close(&mut self) {
        if self.connection.take().is_some() {
            crate::internal!(level = DEBUG, "Connection to {} closed", self.server_domain);
        }
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    async fn upgrade(&mut self) -> Result<()> {
        let connection = self.connection.take().ok_or(ClientError::ConnectionClosed)?;
        let after = self.timeout;

        let upgraded = with_timeout(
            after,
            "TLS handshake",
            connection.upgrade_to_tls(&self.server_domain),
        )
        .await?;

        self.connection = Some(upgraded);
        // Anything read before the handshake must not be trusted.
        self.buffer_pos = 0;
        self.extensions.clear();
        Ok(())
    }

    async fn command(&mut self, command: &str) -> Result<Response> {
        crate::outgoing!("{command}");
        let operation = command.split(' ').next().unwrap_or(command).to_string();
        self.exchange(command, &operation).await
    }

    /// Like `command`, but the line is replaced by `shown` in the trace log.
    async fn secret_command(&mut self, line: &str, shown: &str) -> Result<Response> {
        crate::outgoing!("{shown}");
        self.exchange(line, "AUTH").await
    }

    async fn exchange(&mut self, line: &str, operation: &str) -> Result<Response> {
        let data = Zeroizing::new(format!("{line}\r\n"));
        let after = self.timeout;

        let exchange = async {
            self.write(data.as_bytes()).await?;
            self.read_response().await
        };

        let response = with_timeout(after, operation, exchange).await;
        self.drop_on_failure(response)
    }

    /// Drops the connection when an exchange did not complete.
    ///
    /// After a timeout or I/O error the server's reply may still be in
    /// flight, so nothing later read from the stream can be matched to the
    /// command that was sent. Every later command fails with
    /// [`ClientError::ConnectionClosed`].
    fn drop_on_failure<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result
            && self.connection.is_some()
        {
            crate::internal!(level = DEBUG, "Dropping connection after failed exchange: {e}");
            self.close();
        }
        result
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(data)
            .await
    }

    /// Reads a complete SMTP response from the server.
    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;

                crate::incoming!("{response}");
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = connection.read(&mut self.buffer[self.buffer_pos..]).await?;
            self.buffer_pos += n;
        }
    }
}
