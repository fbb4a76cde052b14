use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use lambda_runtime::{Error, LambdaEvent};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::env;
use std::fmt::{Display, Formatter};
use std::io::Read;
use tracing::{error, info};

const SLACK_WEBHOOK_URL: &str = "SLACK_WEBHOOK_URL";

/// Event delivered by a CloudWatch Logs subscription filter. The interesting
/// part is a base64-encoded, gzip-compressed JSON document.
#[derive(Debug, Serialize, Deserialize)]
pub struct LogsEvent {
    pub awslogs: AwsLogs,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AwsLogs {
    pub data: String,
}

/// The decompressed subscription payload. CloudWatch also includes owner,
/// logGroup, logStream and friends; only the events themselves matter here.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogBatch {
    #[serde(default)]
    pub log_events: Vec<LogLine>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogLine {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardSummary {
    pub status_code: u16,
    pub body: String,
}

#[derive(Debug)]
pub enum ForwardError {
    MissingWebhookUrl,
    Delivery { status: u16, body: String },
}

impl std::error::Error for ForwardError {}

impl Display for ForwardError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardError::MissingWebhookUrl => {
                write!(f, "{} is not set in environment variables", SLACK_WEBHOOK_URL)
            }
            ForwardError::Delivery { status, body } => {
                write!(f, "failed to send message to Slack: {}, {}", status, body)
            }
        }
    }
}

/// Decodes the subscription payload. Any failure along the
/// base64 -> gunzip -> JSON chain is logged and treated as an empty batch so
/// the invocation still succeeds.
pub fn decode_log_batch(event: &LogsEvent) -> LogBatch {
    match decompress(&event.awslogs.data) {
        Ok(batch) => batch,
        Err(e) => {
            error!("failed to decode log event: {}", e);
            LogBatch::default()
        }
    }
}

fn decompress(data: &str) -> Result<LogBatch, Error> {
    let compressed = STANDARD.decode(data)?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(serde_json::from_slice(&decompressed)?)
}

pub struct Forwarder {
    webhook_url: Option<String>,
    http: reqwest::Client,
}

impl Forwarder {
    pub fn new(webhook_url: Option<String>) -> Self {
        Forwarder {
            webhook_url,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Self {
        Forwarder::new(env::var(SLACK_WEBHOOK_URL).ok())
    }

    pub async fn function_handler(
        &self,
        event: LambdaEvent<LogsEvent>,
    ) -> Result<ForwardSummary, Error> {
        let batch = decode_log_batch(&event.payload);
        self.dispatch(batch).await
    }

    /// Sends one notification per non-empty message, in order. A send
    /// failure aborts the remaining lines.
    pub async fn dispatch(&self, batch: LogBatch) -> Result<ForwardSummary, Error> {
        if batch.log_events.is_empty() {
            info!("no log events found");
            return Ok(ForwardSummary {
                status_code: 200,
                body: json!({"message": "No error logs found."}).to_string(),
            });
        }
        let mut sent = 0;
        for line in &batch.log_events {
            if line.message.is_empty() {
                continue;
            }
            info!("sending to Slack: {}", line.message);
            self.send(&line.message).await?;
            sent += 1;
        }
        Ok(ForwardSummary {
            status_code: 200,
            body: json!({"message": format!("Sent {} log events to Slack", sent)}).to_string(),
        })
    }

    async fn send(&self, message: &str) -> Result<(), Error> {
        let webhook_url = self
            .webhook_url
            .as_ref()
            .ok_or(ForwardError::MissingWebhookUrl)?;
        let payload = json!({
            "text": format!(":warning: ERROR detected in logs:\n```{}```", message)
        });
        let response = self
            .http
            .post(webhook_url)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::from(ForwardError::Delivery {
                status: status.as_u16(),
                body,
            }));
        }
        Ok(())
    }
}
