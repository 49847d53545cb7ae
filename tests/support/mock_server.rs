//! Mock submission server for exercising whole batches.
//!
//! The server speaks plain SMTP only. It can:
#![allow(dead_code)] // Not every test uses every knob
//! - Require a login with AUTH PLAIN or AUTH LOGIN
//! - Reject chosen recipients at RCPT TO
//! - Hang on a given command, or hold back the reply to a given message,
//!   to trigger client timeouts
//! - Record every command and message it receives
//!
//! # Example
//!
//! ```rust,no_run
//! use support::mock_server::MockSmtpServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = MockSmtpServer::builder()
//!     .with_credentials("me@example.com", "secret")
//!     .with_rejected_recipient("nobody@example.com")
//!     .build()
//!     .await?;
//!
//! // Connect to server.addr() and send mail
//!
//! server.shutdown();
//! # Ok(())
//! # }
//! ```

use std::{
    collections::HashSet,
    fmt::Write,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};

/// SMTP command received by the mock server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    /// AUTH with the mechanism and the decoded username; the secret is not kept
    Auth { mechanism: String, username: String },
    MailFrom(String),
    RcptTo(String),
    Data,
    /// Message content between DATA and the terminating dot, as received
    MessageContent(Vec<u8>),
    Rset,
    Quit,
    StartTls,
    Other(String),
}

impl SmtpCommand {
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

struct Reply {
    code: u16,
    message: String,
}

impl Reply {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Clone)]
struct MockServerConfig {
    capabilities: Vec<String>,
    username: String,
    secret: String,
    rejected_recipients: HashSet<String>,
    data_end_code: u16,
    quit_code: u16,
    timeout_on_command: Option<usize>,
    delayed_message: Option<(usize, Duration)>,
}

impl MockServerConfig {
    fn ehlo_reply(&self) -> Vec<u8> {
        let mut response = String::new();
        let lines: Vec<&str> = std::iter::once("mock.example.com")
            .chain(self.capabilities.iter().map(String::as_str))
            .collect();

        for (i, line) in lines.iter().enumerate() {
            let separator = if i + 1 < lines.len() { '-' } else { ' ' };
            let _ = write!(&mut response, "250{separator}{line}\r\n");
        }

        response.into_bytes()
    }

    fn check_login(&self, username: &str, secret: &str) -> Reply {
        if username == self.username && secret == self.secret {
            Reply::new(235, "2.7.0 Accepted")
        } else {
            Reply::new(535, "5.7.8 Username and Password not accepted")
        }
    }
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            capabilities: vec!["SIZE 35882577".to_string(), "AUTH LOGIN PLAIN".to_string()],
            username: "sender@example.com".to_string(),
            secret: "app-password".to_string(),
            rejected_recipients: HashSet::new(),
            data_end_code: 250,
            quit_code: 221,
            timeout_on_command: None,
            delayed_message: None,
        }
    }
}

/// Mock SMTP server for testing
pub struct MockSmtpServer {
    addr: SocketAddr,
    commands_received: Arc<RwLock<Vec<SmtpCommand>>>,
    connections: Arc<RwLock<usize>>,
    shutdown: Arc<AtomicBool>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            config: MockServerConfig::default(),
        }
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get all commands received by the server, over all connections
    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.commands_received.read().await.clone()
    }

    /// Messages accepted so far, in order
    pub async fn messages(&self) -> Vec<String> {
        self.commands()
            .await
            .into_iter()
            .filter_map(|command| match command {
                SmtpCommand::MessageContent(content) => {
                    Some(String::from_utf8_lossy(&content).into_owned())
                }
                _ => None,
            })
            .collect()
    }

    pub async fn connections(&self) -> usize {
        *self.connections.read().await
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    async fn handle_client(
        mut stream: TcpStream,
        config: Arc<MockServerConfig>,
        commands: Arc<RwLock<Vec<SmtpCommand>>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let mut command_index = 0;
        let mut message_index = 0;

        writer.write_all(b"220 mock.example.com ESMTP ready\r\n").await?;
        writer.flush().await?;

        loop {
            line.clear();

            if config.timeout_on_command == Some(command_index) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Ok(());
            }

            let Ok(read) = timeout(Duration::from_secs(10), reader.read_line(&mut line)).await
            else {
                return Ok(());
            };
            if read? == 0 {
                return Ok(());
            }
            command_index += 1;

            let cmd_line = line.trim_end().to_string();
            tracing::debug!("Mock server received: {cmd_line}");

            let (verb, argument) = cmd_line.split_once(' ').unwrap_or((cmd_line.as_str(), ""));

            let (reply, command) = match verb.to_ascii_uppercase().as_str() {
                "EHLO" => {
                    let command = SmtpCommand::Ehlo(argument.to_string());
                    commands.write().await.push(command);
                    writer.write_all(&config.ehlo_reply()).await?;
                    writer.flush().await?;
                    continue;
                }
                "AUTH" => {
                    let (command, reply) =
                        Self::authenticate(argument, &config, &mut reader, &mut writer).await?;
                    (reply, command)
                }
                "MAIL" => (Reply::new(250, "2.1.0 OK"), SmtpCommand::MailFrom(argument.to_string())),
                "RCPT" => {
                    let address = argument
                        .trim_start_matches("TO:")
                        .trim_matches(|c| c == '<' || c == '>');
                    let reply = if config.rejected_recipients.contains(address) {
                        Reply::new(550, "5.1.1 User unknown")
                    } else {
                        Reply::new(250, "2.1.5 OK")
                    };
                    (reply, SmtpCommand::RcptTo(argument.to_string()))
                }
                "DATA" => {
                    commands.write().await.push(SmtpCommand::Data);
                    writer
                        .write_all(&Reply::new(354, "Go ahead").to_bytes())
                        .await?;
                    writer.flush().await?;

                    let content = Self::read_message(&mut reader).await?;
                    commands
                        .write()
                        .await
                        .push(SmtpCommand::MessageContent(content));

                    if let Some((index, delay)) = config.delayed_message
                        && index == message_index
                    {
                        tokio::time::sleep(delay).await;
                    }
                    message_index += 1;

                    let reply = if config.data_end_code == 250 {
                        Reply::new(250, "2.0.0 OK: queued")
                    } else {
                        Reply::new(config.data_end_code, "Message rejected")
                    };
                    writer.write_all(&reply.to_bytes()).await?;
                    writer.flush().await?;
                    continue;
                }
                "RSET" => (Reply::new(250, "2.0.0 OK"), SmtpCommand::Rset),
                "STARTTLS" => (
                    Reply::new(502, "Command not implemented"),
                    SmtpCommand::StartTls,
                ),
                "QUIT" => {
                    commands.write().await.push(SmtpCommand::Quit);
                    writer
                        .write_all(&Reply::new(config.quit_code, "Bye").to_bytes())
                        .await?;
                    writer.flush().await?;
                    return Ok(());
                }
                _ => (
                    Reply::new(500, "Unknown command"),
                    SmtpCommand::Other(cmd_line.clone()),
                ),
            };

            commands.write().await.push(command);
            writer.write_all(&reply.to_bytes()).await?;
            writer.flush().await?;
        }
    }

    async fn authenticate<R, W>(
        argument: &str,
        config: &MockServerConfig,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<(SmtpCommand, Reply), Box<dyn std::error::Error + Send + Sync>>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (mechanism, initial) = argument.split_once(' ').unwrap_or((argument, ""));
        let mechanism = mechanism.to_ascii_uppercase();

        let (username, secret) = match mechanism.as_str() {
            "PLAIN" => {
                let decoded = String::from_utf8(BASE64.decode(initial.trim())?)?;
                let mut parts = decoded.split('\0').skip(1);
                (
                    parts.next().unwrap_or_default().to_string(),
                    parts.next().unwrap_or_default().to_string(),
                )
            }
            "LOGIN" => {
                writer.write_all(b"334 VXNlcm5hbWU6\r\n").await?;
                writer.flush().await?;
                let username = Self::read_base64_line(reader).await?;

                writer.write_all(b"334 UGFzc3dvcmQ6\r\n").await?;
                writer.flush().await?;
                let secret = Self::read_base64_line(reader).await?;
                (username, secret)
            }
            _ => {
                return Ok((
                    SmtpCommand::Other(format!("AUTH {mechanism}")),
                    Reply::new(504, "Unrecognized authentication type"),
                ));
            }
        };

        let reply = config.check_login(&username, &secret);
        Ok((SmtpCommand::Auth { mechanism, username }, reply))
    }

    async fn read_base64_line<R: AsyncBufRead + Unpin>(
        reader: &mut R,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        Ok(String::from_utf8(BASE64.decode(line.trim())?)?)
    }

    /// Reads until `<CRLF>.<CRLF>`, keeping the content exactly as sent.
    async fn read_message<R: AsyncBufRead + Unpin>(
        reader: &mut R,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        let mut content = Vec::new();
        let mut line = Vec::new();

        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                break;
            }
            if line == b".\r\n" {
                break;
            }
            content.extend_from_slice(&line);
        }

        Ok(content)
    }
}

/// Builder for configuring a `MockSmtpServer`
pub struct MockSmtpServerBuilder {
    config: MockServerConfig,
}

impl MockSmtpServerBuilder {
    /// The only login the server accepts
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, secret: impl Into<String>) -> Self {
        self.config.username = username.into();
        self.config.secret = secret.into();
        self
    }

    /// Replace the EHLO keywords (the greeting line is added automatically)
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.config.capabilities = capabilities.iter().map(ToString::to_string).collect();
        self
    }

    /// Answer RCPT TO for this address with 550
    #[must_use]
    pub fn with_rejected_recipient(mut self, address: impl Into<String>) -> Self {
        self.config.rejected_recipients.insert(address.into());
        self
    }

    /// Reply code after the message content
    #[must_use]
    pub const fn with_data_end_code(mut self, code: u16) -> Self {
        self.config.data_end_code = code;
        self
    }

    #[must_use]
    pub const fn with_quit_code(mut self, code: u16) -> Self {
        self.config.quit_code = code;
        self
    }

    /// Hang instead of answering the Nth command (0-indexed)
    #[must_use]
    pub const fn with_timeout_on_command(mut self, command_index: usize) -> Self {
        self.config.timeout_on_command = Some(command_index);
        self
    }

    /// Hold back the reply to the Nth message of a connection (0-indexed)
    #[must_use]
    pub const fn with_reply_delay_on_message(mut self, message_index: usize, delay: Duration) -> Self {
        self.config.delayed_message = Some((message_index, delay));
        self
    }

    /// Build and start the mock SMTP server
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind to a port
    pub async fn build(self) -> Result<MockSmtpServer, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = Arc::new(self.config);
        let commands = Arc::new(RwLock::new(Vec::new()));
        let connections = Arc::new(RwLock::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));

        let commands_clone = Arc::clone(&commands);
        let connections_clone = Arc::clone(&connections);
        let shutdown_clone = Arc::clone(&shutdown);

        tokio::spawn(async move {
            while !shutdown_clone.load(Ordering::Relaxed) {
                // Accept with a timeout so the shutdown flag gets checked
                let accept_result = timeout(Duration::from_millis(100), listener.accept()).await;

                if let Ok(Ok((stream, _peer))) = accept_result {
                    *connections_clone.write().await += 1;
                    let config = Arc::clone(&config);
                    let commands = Arc::clone(&commands_clone);

                    tokio::spawn(async move {
                        if let Err(e) = MockSmtpServer::handle_client(stream, config, commands).await
                        {
                            tracing::debug!("Mock server client error: {e}");
                        }
                    });
                }
            }
        });

        Ok(MockSmtpServer {
            addr,
            commands_received: commands,
            connections,
            shutdown,
        })
    }
}
