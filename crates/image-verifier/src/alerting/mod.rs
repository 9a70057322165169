mod channel;
mod template;

pub use channel::Channel;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const DEFAULT_TEMPLATE_DIR: &str = "/app/alerts/templates";

#[derive(Error, Debug)]
pub enum AlertError {
    #[error("timeout after handling {handled}/{total} receivers of {stream} alerts")]
    Timeout {
        handled: usize,
        total: usize,
        stream: &'static str,
    },
    #[error("failed sending a notification for receiver {name} with failIfAlertSendingFails set: {reason}")]
    SendFailed { name: String, reason: String },
}

/// Outcome category of an admission request, driving receiver selection
/// and message wording.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationResult {
    #[default]
    Success,
    Error,
    Skip,
    Timeout,
    Invalid,
}

impl fmt::Display for NotificationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotificationResult::Success => "success",
            NotificationResult::Error => "error",
            NotificationResult::Skip => "skip",
            NotificationResult::Timeout => "timeout",
            NotificationResult::Invalid => "invalid",
        };
        write!(f, "{s}")
    }
}

/// Everything a notification template can refer to.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationValues {
    pub result: NotificationResult,
    pub error: String,
    pub images: String,
    pub request_id: String,
    pub priority: i64,
    pub pod_id: String,
    pub cluster: String,
    pub namespace: String,
    pub timestamp: String,
    pub alert_message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestSender {
    #[serde(default)]
    pub receivers: Vec<Channel>,
}

/// Alerting configuration: the receivers notified on admitted and on
/// rejected requests.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub cluster_identifier: String,
    #[serde(default)]
    pub admit_request: RequestSender,
    #[serde(default)]
    pub reject_request: RequestSender,
    #[serde(skip, default = "default_template_dir")]
    pub template_dir: PathBuf,
}

fn default_template_dir() -> PathBuf {
    PathBuf::from(DEFAULT_TEMPLATE_DIR)
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cluster_identifier: String::new(),
            admit_request: RequestSender::default(),
            reject_request: RequestSender::default(),
            template_dir: default_template_dir(),
        }
    }
}

impl Config {
    /// Names every channel after its template and position; called once
    /// after deserialization.
    pub fn finalize(&mut self, template_dir: Option<PathBuf>) {
        if let Some(template_dir) = template_dir {
            self.template_dir = template_dir;
        }
        for sender in [&mut self.admit_request, &mut self.reject_request] {
            for (idx, channel) in sender.receivers.iter_mut().enumerate() {
                channel.channel_name = format!("{}-{idx}", channel.template);
            }
        }
    }

    /// Fans the notification out to the receivers of the matching
    /// stream. Receivers with `failIfAlertSendingFails` are awaited and
    /// their failure fails the whole evaluation; the rest report success
    /// immediately and only log delivery errors.
    pub async fn eval_and_send(
        &self,
        token: &CancellationToken,
        values: &mut NotificationValues,
    ) -> Result<(), AlertError> {
        values.cluster = if self.cluster_identifier.is_empty() {
            "not specified".to_string()
        } else {
            self.cluster_identifier.clone()
        };

        let (receivers, stream) = match values.result {
            NotificationResult::Success | NotificationResult::Skip => {
                values.alert_message = "TrustGate admitted a request".to_string();
                (&self.admit_request.receivers, "admit")
            }
            NotificationResult::Error => {
                values.alert_message =
                    format!("TrustGate rejected a request: {}", values.error);
                (&self.reject_request.receivers, "reject")
            }
            NotificationResult::Timeout => {
                values.alert_message = format!(
                    "TrustGate validation timed out for admission request {}",
                    values.request_id
                );
                (&self.reject_request.receivers, "reject")
            }
            NotificationResult::Invalid => {
                values.alert_message = format!(
                    "TrustGate failed to parse admission request {}",
                    values.request_id
                );
                (&self.reject_request.receivers, "reject")
            }
        };

        if receivers.is_empty() {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel(receivers.len());
        for channel in receivers {
            // blocking behavior only for failIfAlertSendingFails
            // receivers; the rest run detached from the request deadline
            let channel_token = if channel.fail {
                token.clone()
            } else {
                CancellationToken::new()
            };
            let channel = channel.clone();
            let template_dir = self.template_dir.clone();
            let channel_values = values.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                channel
                    .send(channel_token, template_dir, channel_values, tx)
                    .await;
            });
        }
        drop(tx);

        let total = receivers.len();
        for handled in 0..total {
            let report = tokio::select! {
                _ = token.cancelled() => {
                    return Err(AlertError::Timeout { handled, total, stream })
                }
                report = rx.recv() => report,
            };
            match report {
                Some((name, Some(reason))) => {
                    return Err(AlertError::SendFailed { name, reason })
                }
                Some((_, None)) => {}
                None => break,
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(result: NotificationResult) -> NotificationValues {
        NotificationValues {
            result,
            error: "boom".to_string(),
            request_id: "uid-1".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn no_receivers_is_a_no_op() {
        let config = Config::default();
        let token = CancellationToken::new();
        let mut v = values(NotificationResult::Success);
        assert!(config.eval_and_send(&token, &mut v).await.is_ok());
        assert_eq!(v.cluster, "not specified");
        assert_eq!(v.alert_message, "TrustGate admitted a request");
    }

    #[tokio::test]
    async fn messages_follow_the_result() {
        let config = Config {
            cluster_identifier: "prod".to_string(),
            ..Default::default()
        };
        let token = CancellationToken::new();

        let mut v = values(NotificationResult::Error);
        config.eval_and_send(&token, &mut v).await.unwrap();
        assert_eq!(v.cluster, "prod");
        assert_eq!(v.alert_message, "TrustGate rejected a request: boom");

        let mut v = values(NotificationResult::Timeout);
        config.eval_and_send(&token, &mut v).await.unwrap();
        assert_eq!(
            v.alert_message,
            "TrustGate validation timed out for admission request uid-1"
        );

        let mut v = values(NotificationResult::Invalid);
        config.eval_and_send(&token, &mut v).await.unwrap();
        assert_eq!(
            v.alert_message,
            "TrustGate failed to parse admission request uid-1"
        );
    }

    #[test]
    fn finalize_names_channels() {
        let yaml = r#"
clusterIdentifier: test
admitRequest:
  receivers:
    - receiverUrl: https://hooks.example.com/a
      template: slack
    - receiverUrl: https://hooks.example.com/b
      template: opsgenie
"#;
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        config.finalize(None);
        assert_eq!(config.admit_request.receivers[0].channel_name, "slack-0");
        assert_eq!(
            config.admit_request.receivers[1].channel_name,
            "opsgenie-1"
        );
    }
}
