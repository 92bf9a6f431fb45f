// Outbound lobby connectivity: OAuth2 client-credentials handshake and the
// authenticated duplex text channel.

use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

/// Pins the lobby wire version during the channel upgrade.
pub const TACHYON_SUBPROTOCOL: &str = "v0.tachyon";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct LobbyClientSettings {
    pub host: String,
    pub port: Option<u16>,
    pub secure: bool,
    pub client_id: String,
    pub client_secret: String,
}

impl LobbyClientSettings {
    fn authority(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{port}", self.host),
            None => self.host.clone(),
        }
    }

    fn http_base(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}", self.authority())
    }

    fn ws_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}/tachyon", self.authority())
    }
}

#[derive(Debug)]
pub enum LobbyClientError {
    /// OAuth metadata endpoint failure or unusable metadata.
    Metadata { details: String },
    /// Token endpoint failure, surfaced as `error[: error_description]`
    /// when the body is a well-formed OAuth2 error.
    OAuth { details: String },
    /// The duplex channel could not be established.
    Connect { details: String },
    /// The peer broke the text-frames-only contract.
    Protocol { details: String },
    /// Sending or receiving on an established channel failed.
    Channel { details: String },
}

impl fmt::Display for LobbyClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LobbyClientError::Metadata { details } => write!(f, "oauth metadata: {details}"),
            LobbyClientError::OAuth { details } => write!(f, "oauth token: {details}"),
            LobbyClientError::Connect { details } => write!(f, "lobby connect: {details}"),
            LobbyClientError::Protocol { details } => write!(f, "lobby protocol: {details}"),
            LobbyClientError::Channel { details } => write!(f, "lobby channel: {details}"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthServerMetadata {
    token_endpoint: String,
    #[serde(default)]
    response_types_supported: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: String,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// An established, authenticated duplex text channel to the lobby.
pub struct LobbyConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl LobbyConnection {
    pub async fn send_text(&mut self, text: String) -> Result<(), LobbyClientError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| LobbyClientError::Channel {
                details: format!("send failed: {e}"),
            })
    }

    /// Next inbound text frame. `None` means the peer closed the channel.
    /// A binary frame is a protocol violation and closes the connection.
    pub async fn recv_text(&mut self) -> Option<Result<String, LobbyClientError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Binary(_)) => {
                    warn!("lobby sent a binary frame; closing");
                    self.close(CloseCode::Protocol, "only text frames are supported")
                        .await;
                    return Some(Err(LobbyClientError::Protocol {
                        details: "received binary frame".to_string(),
                    }));
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "lobby closed the channel");
                    return None;
                }
                Err(e) => {
                    return Some(Err(LobbyClientError::Channel {
                        details: format!("recv failed: {e}"),
                    }));
                }
            }
        }
    }

    pub async fn close(&mut self, code: CloseCode, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        if let Err(e) = self.stream.close(Some(frame)).await {
            debug!(error = %e, "error while closing lobby channel");
        }
    }
}

/// Run the full handshake: OAuth metadata, client-credentials token, then
/// the authenticated channel upgrade.
pub async fn connect(settings: &LobbyClientSettings) -> Result<LobbyConnection, LobbyClientError> {
    let token = fetch_token(settings).await?;

    let mut request = settings
        .ws_url()
        .into_client_request()
        .map_err(|e| LobbyClientError::Connect {
            details: format!("bad lobby url: {e}"),
        })?;
    let bearer =
        HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| LobbyClientError::Connect {
            details: format!("token is not a valid header value: {e}"),
        })?;
    request.headers_mut().insert(AUTHORIZATION, bearer);
    request.headers_mut().insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(TACHYON_SUBPROTOCOL),
    );

    let (stream, _response) =
        connect_async(request)
            .await
            .map_err(|e| LobbyClientError::Connect {
                details: format!("channel upgrade failed: {e}"),
            })?;
    info!(url = %settings.ws_url(), "lobby channel established");
    Ok(LobbyConnection { stream })
}

async fn fetch_token(settings: &LobbyClientSettings) -> Result<String, LobbyClientError> {
    let http = reqwest::Client::builder()
        .timeout(HANDSHAKE_TIMEOUT)
        .build()
        .map_err(|e| LobbyClientError::Connect {
            details: format!("failed to build http client: {e}"),
        })?;

    let metadata_url = format!(
        "{}/.well-known/oauth-authorization-server",
        settings.http_base()
    );
    let response = http
        .get(&metadata_url)
        .send()
        .await
        .map_err(|e| LobbyClientError::Metadata {
            details: format!("request failed: {e}"),
        })?;
    if !response.status().is_success() {
        return Err(LobbyClientError::Metadata {
            details: format!("endpoint returned {}", response.status()),
        });
    }
    let metadata: AuthServerMetadata =
        response.json().await.map_err(|e| LobbyClientError::Metadata {
            details: format!("invalid metadata: {e}"),
        })?;
    if metadata.token_endpoint.is_empty() {
        return Err(LobbyClientError::Metadata {
            details: "metadata has no token_endpoint".to_string(),
        });
    }
    if !metadata
        .response_types_supported
        .iter()
        .any(|t| t == "token")
    {
        return Err(LobbyClientError::Metadata {
            details: "server does not support the token response type".to_string(),
        });
    }

    // Client credentials go into basic auth, each half URL-encoded first.
    let credentials = format!(
        "{}:{}",
        form_encode(&settings.client_id),
        form_encode(&settings.client_secret)
    );
    let basic = base64::engine::general_purpose::STANDARD.encode(credentials);

    let response = http
        .post(&metadata.token_endpoint)
        .header(reqwest::header::AUTHORIZATION, format!("Basic {basic}"))
        .form(&[
            ("grant_type", "client_credentials"),
            ("scope", "tachyon.lobby"),
        ])
        .send()
        .await
        .map_err(|e| LobbyClientError::OAuth {
            details: format!("token request failed: {e}"),
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let details = match serde_json::from_str::<OAuthErrorBody>(&body) {
            Ok(error) => match error.error_description {
                Some(description) => format!("{}: {description}", error.error),
                None => error.error,
            },
            Err(_) => format!("token endpoint returned {status}"),
        };
        return Err(LobbyClientError::OAuth { details });
    }

    let token: TokenResponse = response.json().await.map_err(|e| LobbyClientError::OAuth {
        details: format!("invalid token response: {e}"),
    })?;
    if token.token_type != "Bearer" {
        return Err(LobbyClientError::OAuth {
            details: format!("unsupported token type {:?}", token.token_type),
        });
    }
    Ok(token.access_token)
}

fn form_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_build_expected_urls() {
        let settings = LobbyClientSettings {
            host: "lobby.example.com".to_string(),
            port: None,
            secure: true,
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
        };
        assert_eq!(settings.http_base(), "https://lobby.example.com");
        assert_eq!(settings.ws_url(), "wss://lobby.example.com/tachyon");

        let settings = LobbyClientSettings {
            host: "localhost".to_string(),
            port: Some(8080),
            secure: false,
            ..settings
        };
        assert_eq!(settings.http_base(), "http://localhost:8080");
        assert_eq!(settings.ws_url(), "ws://localhost:8080/tachyon");
    }

    #[test]
    fn credentials_are_form_encoded() {
        assert_eq!(form_encode("plain"), "plain");
        assert_eq!(form_encode("with:colon&amp"), "with%3Acolon%26amp");
    }
}
