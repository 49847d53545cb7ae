pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod message;
pub mod recipients;
pub mod report;
pub mod sender;

pub use config::{Credentials, Endpoint, Security};
pub use message::{Attachment, MessageSpec, build_message};
pub use report::{SendResult, SendStatus, Summary};
pub use sender::{Batch, BulkSender, SmtpConnector};
pub use tracing;
