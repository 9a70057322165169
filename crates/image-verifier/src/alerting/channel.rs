use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::template::render_template;
use super::NotificationValues;

const DEFAULT_PRIORITY: i64 = 3;

/// A single webhook receiver: a template, a URL, and optional static
/// payload fields and headers.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Channel {
    /// Assigned at load time from the template name and position.
    #[serde(skip)]
    pub channel_name: String,
    #[serde(rename = "receiverUrl")]
    pub url: String,
    #[serde(default)]
    pub priority: Option<i64>,
    /// Additional JSON fields merged into the rendered body.
    #[serde(default, rename = "payloadFields")]
    pub payload_fields: HashMap<String, Value>,
    /// `Key: value` strings sent as request headers.
    #[serde(default, rename = "customHeaders")]
    pub headers: Vec<String>,
    pub template: String,
    /// Whether a delivery failure fails the whole admission.
    #[serde(default, rename = "failIfAlertSendingFails")]
    pub fail: bool,
}

impl Channel {
    /// Renders and posts the notification. Failing channels report their
    /// outcome on the channel unless the request was cancelled; the rest
    /// report success right away and only log errors.
    pub async fn send(
        &self,
        token: CancellationToken,
        template_dir: PathBuf,
        mut values: NotificationValues,
        out: mpsc::Sender<(String, Option<String>)>,
    ) {
        if !self.fail {
            let _ = out.try_send((self.channel_name.clone(), None));
        }

        values.priority = self.priority.unwrap_or(DEFAULT_PRIORITY);
        values.timestamp = Utc::now().to_rfc3339();

        let result = self.dispatch(&template_dir, &values).await;
        if let Err(e) = &result {
            warn!(
                receiver = self.channel_name.as_str(),
                error = e.as_str(),
                "error sending notification"
            );
        }

        if self.fail && !token.is_cancelled() {
            let _ = out.try_send((self.channel_name.clone(), result.err()));
        }
    }

    async fn dispatch(
        &self,
        template_dir: &PathBuf,
        values: &NotificationValues,
    ) -> Result<(), String> {
        let rendered = render_template(template_dir, &self.template, values)
            .map_err(|e| format!("couldn't generate alert message: {e}"))?;

        if rendered.trim().is_empty() || rendered.trim() == "{}" {
            warn!(
                receiver = self.channel_name.as_str(),
                "skipping notification as message is empty"
            );
            return Ok(());
        }

        let mut body: serde_json::Map<String, Value> = serde_json::from_str(&rendered)
            .map_err(|e| format!("failed to parse rendered template: {e}"))?;
        for (key, value) in &self.payload_fields {
            body.insert(key.clone(), value.clone());
        }

        debug!(
            receiver = self.channel_name.as_str(),
            url = self.url.as_str(),
            "sending notification"
        );

        let client = reqwest::Client::new();
        let mut request = client.post(&self.url).json(&body);
        for header in &self.headers {
            let (key, value) = header
                .split_once(':')
                .ok_or_else(|| format!("invalid header configuration: {header}"))?;
            request = request.header(key.trim(), value.trim());
        }

        let response = request
            .send()
            .await
            .map_err(|e| format!("failed to send notification: {e}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("failed to send notification: {status}: {body}"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    fn channel(fail: bool) -> Channel {
        Channel {
            channel_name: "slack-0".to_string(),
            url: "https://hooks.invalid/endpoint".to_string(),
            priority: None,
            payload_fields: HashMap::new(),
            headers: Vec::new(),
            template: "slack".to_string(),
            fail,
        }
    }

    #[tokio::test]
    async fn non_failing_channel_reports_success_immediately() {
        let dir = tempfile::tempdir().unwrap();
        // no template file: dispatch fails, but the channel already
        // reported success
        let (tx, mut rx) = mpsc::channel(1);
        channel(false)
            .send(
                CancellationToken::new(),
                dir.path().to_path_buf(),
                NotificationValues::default(),
                tx,
            )
            .await;

        let (name, error) = rx.recv().await.unwrap();
        assert_eq!(name, "slack-0");
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn failing_channel_reports_template_error() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        channel(true)
            .send(
                CancellationToken::new(),
                dir.path().to_path_buf(),
                NotificationValues::default(),
                tx,
            )
            .await;

        let (_, error) = rx.recv().await.unwrap();
        assert!(error.unwrap().contains("couldn't generate alert message"));
    }

    #[tokio::test]
    async fn empty_rendered_template_skips_delivery() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("slack.json"), "{}").unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        channel(true)
            .send(
                CancellationToken::new(),
                dir.path().to_path_buf(),
                NotificationValues::default(),
                tx,
            )
            .await;

        // an empty message is not an error
        let (_, error) = rx.recv().await.unwrap();
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn cancelled_failing_channel_stays_silent() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let (tx, mut rx) = mpsc::channel(1);
        channel(true)
            .send(
                token,
                dir.path().to_path_buf(),
                NotificationValues::default(),
                tx,
            )
            .await;

        assert!(rx.try_recv().is_err());
    }
}
