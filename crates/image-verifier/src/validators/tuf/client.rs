use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::data::SignedEnvelope;
use super::errors::TrustDataError;
use crate::auth::Auth;
use crate::image::{Image, RegistryRepo};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of fetching a single trust-data role.
#[derive(Debug)]
pub struct TrustData {
    pub role: String,
    pub envelope: Option<SignedEnvelope>,
    pub raw: Vec<u8>,
    pub error: Option<TrustDataError>,
}

/// HTTP client against a notary server. Authentication is discovered via
/// a preflight `/v2/` ping: a 401 carries the WWW-Authenticate challenge
/// naming the token endpoint, from which a pull-scoped bearer token is
/// obtained.
#[derive(Debug, Clone)]
pub struct NotaryClient {
    client: reqwest::Client,
    host: String,
    repo: String,
    bearer_token: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    access_token: String,
}

impl NotaryClient {
    pub async fn new(
        host: &str,
        cert: Option<&str>,
        auth: &Auth,
        image: &Image,
    ) -> Result<Self, TrustDataError> {
        debug!(
            image = image.original_string(),
            host = host,
            "creating new notary client"
        );

        let repo = image.notary_reference();
        let client = base_client(cert).map_err(TrustDataError::Client)?;

        // ping the notary instance to see if it is up and to acquire the
        // authentication realm
        let ping = client
            .get(format!("{host}/v2/"))
            .timeout(PING_TIMEOUT)
            .send()
            .await
            .map_err(|e| TrustDataError::Client(format!("error pinging notary server: {e}")))?;

        let bearer_token = if ping.status() == reqwest::StatusCode::UNAUTHORIZED {
            let challenge = ping
                .headers()
                .get(reqwest::header::WWW_AUTHENTICATE)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_bearer_challenge)
                .ok_or_else(|| {
                    TrustDataError::Client("malformed authentication challenge".to_string())
                })?;
            Some(fetch_bearer_token(&client, host, auth, &repo, challenge).await?)
        } else {
            None
        };

        Ok(NotaryClient {
            client,
            host: host.to_string(),
            repo,
            bearer_token,
        })
    }

    /// Fetches one role document and reports it on the channel. A
    /// cancelled request does not report at all; the receiver is already
    /// gone by then.
    pub async fn fetch_trust_data(
        &self,
        token: &CancellationToken,
        role: &str,
        out: mpsc::Sender<TrustData>,
    ) {
        debug!(role = role, "getting trust data");

        let mut data = TrustData {
            role: role.to_string(),
            envelope: None,
            raw: Vec::new(),
            error: None,
        };

        match self.fetch_role(role).await {
            Ok((envelope, raw)) => {
                data.envelope = Some(envelope);
                data.raw = raw;
            }
            Err(e) => data.error = Some(e),
        }

        if token.is_cancelled() {
            return;
        }
        let _ = out.try_send(data);
    }

    async fn fetch_role(&self, role: &str) -> Result<(SignedEnvelope, Vec<u8>), TrustDataError> {
        // host and repo come from the configuration and role is either a
        // base role or inside the required delegations, so none of these
        // values is attacker-controlled
        let url = format!("{}/v2/{}/_trust/tuf/{}.json", self.host, self.repo, role);

        let mut request = self.client.get(url);
        if let Some(bearer) = &self.bearer_token {
            request = request.bearer_auth(bearer);
        }

        let response = request.send().await.map_err(|e| TrustDataError::Request {
            role: role.to_string(),
            reason: e.to_string(),
        })?;

        if !response.status().is_success() {
            return Err(TrustDataError::Status {
                role: role.to_string(),
                status: response.status().to_string(),
            });
        }

        let raw = response
            .bytes()
            .await
            .map_err(|e| TrustDataError::Request {
                role: role.to_string(),
                reason: e.to_string(),
            })?
            .to_vec();

        let envelope: SignedEnvelope =
            serde_json::from_slice(&raw).map_err(|e| TrustDataError::Parse {
                role: role.to_string(),
                reason: e.to_string(),
            })?;

        Ok((envelope, raw))
    }
}

fn base_client(cert: Option<&str>) -> Result<reqwest::Client, String> {
    let mut builder = reqwest::Client::builder()
        .timeout(CLIENT_TIMEOUT)
        .use_rustls_tls();

    if let Some(cert) = cert {
        let certificate = reqwest::Certificate::from_pem(cert.as_bytes())
            .map_err(|e| format!("failed to parse root certificate: {e}"))?;
        builder = builder.add_root_certificate(certificate);
    }

    builder
        .build()
        .map_err(|e| format!("unable to configure http client: {e}"))
}

/// Parses `Bearer realm="...",service="..."` challenges.
fn parse_bearer_challenge(header: &str) -> Option<(String, String)> {
    let params = header.strip_prefix("Bearer ")?;

    let mut realm = None;
    let mut service = None;
    for param in params.split(',') {
        let (key, value) = param.trim().split_once('=')?;
        let value = value.trim_matches('"');
        match key {
            "realm" => realm = Some(value.to_string()),
            "service" => service = Some(value.to_string()),
            _ => {}
        }
    }

    Some((realm?, service.unwrap_or_default()))
}

async fn fetch_bearer_token(
    client: &reqwest::Client,
    host: &str,
    auth: &Auth,
    repo: &str,
    (realm, service): (String, String),
) -> Result<String, TrustDataError> {
    let client_error = |reason: String| TrustDataError::Client(reason);

    let registry = RegistryRepo::new(host)
        .map_err(|e| client_error(format!("unable to parse registry {host}: {e}")))?;
    let credentials = auth.look_up(&registry.to_string());

    let mut request = client.get(&realm).query(&[
        ("service", service.as_str()),
        ("scope", &format!("repository:{repo}:pull")),
    ]);
    if !credentials.username.is_empty() {
        request = request.basic_auth(&credentials.username, Some(&credentials.password));
    }

    let response = request
        .send()
        .await
        .map_err(|e| client_error(format!("error requesting bearer token: {e}")))?;

    if !response.status().is_success() {
        return Err(client_error(format!(
            "token endpoint returned {}",
            response.status()
        )));
    }

    let token: TokenResponse = response
        .json()
        .await
        .map_err(|e| client_error(format!("error parsing token response: {e}")))?;

    if !token.token.is_empty() {
        Ok(token.token)
    } else if !token.access_token.is_empty() {
        Ok(token.access_token)
    } else {
        Err(client_error("token response carries no token".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bearer_challenge() {
        let (realm, service) = parse_bearer_challenge(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io""#,
        )
        .unwrap();
        assert_eq!(realm, "https://auth.docker.io/token");
        assert_eq!(service, "registry.docker.io");
    }

    #[test]
    fn challenge_without_bearer_scheme_is_rejected() {
        assert!(parse_bearer_challenge(r#"Basic realm="registry""#).is_none());
    }

    #[test]
    fn challenge_without_realm_is_rejected() {
        assert!(parse_bearer_challenge(r#"Bearer service="registry""#).is_none());
    }
}
