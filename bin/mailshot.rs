//! Sends one email to every address in a list and writes a CSV report.
//!
//! Connection settings and the login fall back to the `SMTP_HOST`,
//! `SMTP_PORT`, `SENDER_EMAIL` and `SENDER_PASSWORD` environment variables.

use std::{path::PathBuf, process::ExitCode, time::Duration};

use anyhow::{Context, bail};
use clap::Parser;
use mailshot::{
    Attachment, Batch, BulkSender, Credentials, Endpoint, MessageSpec, Security, Summary,
    config::Defaults, recipients, report,
};
use zeroize::Zeroizing;

#[derive(Parser, Debug)]
#[command(name = "mailshot")]
#[command(about = "Send the same email to a list of recipients", long_about = None)]
#[command(version)]
struct Cli {
    /// SMTP server [default: $SMTP_HOST or smtp.gmail.com]
    #[arg(long)]
    host: Option<String>,

    /// SMTP port [default: $SMTP_PORT or 465]
    #[arg(long)]
    port: Option<u16>,

    /// Connect in plain text and upgrade with STARTTLS instead of implicit TLS
    #[arg(long)]
    starttls: bool,

    /// Sender address, also used to log in [default: $SENDER_EMAIL]
    #[arg(long)]
    from: Option<String>,

    /// Password or app password [default: $SENDER_PASSWORD]
    #[arg(long)]
    password: Option<String>,

    /// Recipients separated by commas, semicolons or newlines
    #[arg(long)]
    to: Option<String>,

    /// CSV file of recipients, read from the `email` column if there is one.
    /// Takes precedence over --to
    #[arg(long)]
    recipients_file: Option<PathBuf>,

    #[arg(short, long, default_value = "")]
    subject: String,

    /// Plain-text body
    #[arg(long, conflicts_with = "body_file")]
    body: Option<String>,

    /// Read the plain-text body from a file
    #[arg(long)]
    body_file: Option<PathBuf>,

    /// Read an HTML body from a file
    #[arg(long)]
    html_file: Option<PathBuf>,

    /// Attach a file to every message; may be repeated
    #[arg(short, long = "attach")]
    attachments: Vec<PathBuf>,

    /// Seconds to wait for the server on each step
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    /// Where to write the per-recipient report
    #[arg(long, default_value = report::REPORT_FILE_NAME)]
    report: PathBuf,
}

impl Cli {
    fn endpoint(&self, defaults: &Defaults) -> Endpoint {
        let security = if self.starttls {
            Security::StartTls
        } else {
            Security::Implicit
        };

        Endpoint::new(
            self.host.clone().unwrap_or_else(|| defaults.host().to_string()),
            self.port.unwrap_or_else(|| defaults.port()),
            security,
        )
    }

    fn credentials(&self, defaults: &Defaults) -> anyhow::Result<Credentials> {
        let Some(sender) = self.from.clone().or_else(|| defaults.sender.clone()) else {
            bail!("No sender address: pass --from or set SENDER_EMAIL");
        };

        let password = match (&self.password, &defaults.password) {
            (Some(password), _) => Zeroizing::new(password.clone()),
            (None, Some(password)) => password.clone(),
            (None, None) => bail!("No password: pass --password or set SENDER_PASSWORD"),
        };

        Ok(Credentials::new(sender, password.as_str()))
    }

    async fn recipients(&self) -> anyhow::Result<Vec<String>> {
        let table = match &self.recipients_file {
            Some(path) => Some(
                tokio::fs::read(path)
                    .await
                    .with_context(|| format!("Unable to read {}", path.display()))?,
            ),
            None => None,
        };

        let recipients = recipients::parse_any(self.to.as_deref(), table.as_deref())?;
        if recipients.is_empty() {
            bail!("No recipients: pass --to or --recipients-file");
        }
        Ok(recipients)
    }

    async fn message(&self, sender: &str) -> anyhow::Result<MessageSpec> {
        let text = match (&self.body, &self.body_file) {
            (Some(body), _) => body.clone(),
            (None, Some(path)) => tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Unable to read {}", path.display()))?,
            (None, None) => String::new(),
        };

        let mut spec = MessageSpec::new(sender, self.subject.as_str()).text(text);
        if let Some(path) = &self.html_file {
            let html = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Unable to read {}", path.display()))?;
            spec = spec.html(html);
        }
        Ok(spec)
    }

    async fn attachments(&self) -> Vec<Attachment> {
        let mut attachments = Vec::with_capacity(self.attachments.len());
        for path in &self.attachments {
            match Attachment::from_path(path).await {
                Ok(attachment) => attachments.push(attachment),
                Err(e) => tracing::warn!("Skipping attachment {}: {e}", path.display()),
            }
        }
        attachments
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    mailshot::logging::init();

    let cli = Cli::parse();
    let defaults = Defaults::from_env();
    tracing::debug!(?defaults, "Environment defaults");

    let credentials = cli.credentials(&defaults)?;
    let recipients = cli.recipients().await?;
    let message = cli.message(credentials.username()).await?;

    let batch = Batch::new(cli.endpoint(&defaults), credentials, recipients, message)
        .attachments(cli.attachments().await)
        .timeout(Duration::from_secs(cli.timeout));

    let results = BulkSender::new()
        .send_batch_with_progress(&batch, |done, total, _| println!("Sent {done}/{total}"))
        .await;

    let summary = Summary::of(&results);
    println!("Finished. {summary}");

    let file = std::fs::File::create(&cli.report)
        .with_context(|| format!("Unable to create {}", cli.report.display()))?;
    report::write_csv(file, &results)
        .with_context(|| format!("Unable to write {}", cli.report.display()))?;
    println!("Report written to {}", cli.report.display());

    Ok(if summary.all_sent() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
