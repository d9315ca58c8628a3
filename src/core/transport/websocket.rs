// src/core/transport/websocket.rs

//! The production transport: the hub protocol over a WebSocket, plain or TLS.

use super::{Transport, TransportSession};
use crate::config::HubConfig;
use crate::core::SightwireError;
use crate::core::protocol::{HandshakeRequest, HandshakeResponse, HubMessage, HubProtocolCodec};
use crate::core::session::SessionCredential;
use async_trait::async_trait;
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The query parameter browsers use to hand the bearer token to the hub,
/// since they cannot set headers on a WebSocket upgrade.
const ACCESS_TOKEN_PARAM: &str = "access_token";

/// Maps an `http(s)`/`ws(s)` hub URL onto the WebSocket scheme.
pub fn normalize_endpoint(raw: &str) -> Result<Url, SightwireError> {
    let mut url = Url::parse(raw)?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(SightwireError::InvalidEndpoint(format!(
                "unsupported scheme '{other}' in '{raw}'"
            )));
        }
    };
    url.set_scheme(scheme).map_err(|_| {
        SightwireError::InvalidEndpoint(format!("cannot use scheme '{scheme}' for '{raw}'"))
    })?;
    if url.host_str().is_none() {
        return Err(SightwireError::InvalidEndpoint(format!(
            "'{raw}' has no host"
        )));
    }
    Ok(url)
}

/// Opens hub sessions over WebSockets.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    endpoint: Url,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(
        endpoint: &str,
        connect_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Result<Self, SightwireError> {
        Ok(Self {
            endpoint: normalize_endpoint(endpoint)?,
            connect_timeout,
            handshake_timeout,
        })
    }

    pub fn from_config(hub: &HubConfig) -> Result<Self, SightwireError> {
        Self::new(&hub.url, hub.connect_timeout, hub.handshake_timeout)
    }

    /// The endpoint, without credentials.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn open(&self, credential: &SessionCredential) -> Result<WsStream, SightwireError> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair(ACCESS_TOKEN_PARAM, credential.expose());

        let mut request = url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.expose()))
            .map_err(|_| {
                SightwireError::InvalidCredential(
                    "credential contains characters not allowed in a header".into(),
                )
            })?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws, _response) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| {
                SightwireError::Timeout(format!(
                    "connecting to {} took longer than {:?}",
                    self.endpoint, self.connect_timeout
                ))
            })??;
        Ok(ws)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        credential: &SessionCredential,
    ) -> Result<Box<dyn TransportSession>, SightwireError> {
        debug!("Opening WebSocket to {}", self.endpoint);
        let mut ws = self.open(credential).await?;

        let request = HandshakeRequest::default().encode_to_vec()?;
        ws.send(Message::Text(record_text(request)?.into())).await?;

        let mut buffer = BytesMut::new();
        let response = tokio::time::timeout(
            self.handshake_timeout,
            read_handshake(&mut ws, &mut buffer),
        )
        .await
        .map_err(|_| {
            SightwireError::Timeout(format!(
                "hub handshake took longer than {:?}",
                self.handshake_timeout
            ))
        })??;

        if let Some(error) = response.error {
            let _ = ws.close(None).await;
            return Err(classify_handshake_error(error));
        }

        info!("Hub handshake with {} completed.", self.endpoint);
        Ok(Box::new(WebSocketSession {
            ws,
            buffer,
            codec: HubProtocolCodec,
        }))
    }
}

/// Reads frames until the handshake response is complete. Records that arrive
/// in the same frame after the response are left in `buffer`.
async fn read_handshake(
    ws: &mut WsStream,
    buffer: &mut BytesMut,
) -> Result<HandshakeResponse, SightwireError> {
    loop {
        if let Some(response) = HandshakeResponse::decode(buffer)? {
            return Ok(response);
        }
        match ws.next().await {
            Some(Ok(Message::Text(text))) => buffer.extend_from_slice(text.as_bytes()),
            Some(Ok(Message::Binary(data))) => buffer.extend_from_slice(&data),
            Some(Ok(Message::Close(frame))) => {
                return Err(SightwireError::Handshake(format!(
                    "hub closed the connection during the handshake ({frame:?})"
                )));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(SightwireError::Handshake(
                    "connection ended during the handshake".into(),
                ));
            }
        }
    }
}

fn classify_handshake_error(error: String) -> SightwireError {
    let lowered = error.to_ascii_lowercase();
    if lowered.contains("unauthorized") || lowered.contains("401") {
        SightwireError::Authentication(error)
    } else {
        SightwireError::Handshake(error)
    }
}

fn record_text(record: Vec<u8>) -> Result<String, SightwireError> {
    String::from_utf8(record)
        .map_err(|e| SightwireError::Protocol(format!("record is not valid UTF-8: {e}")))
}

struct WebSocketSession {
    ws: WsStream,
    buffer: BytesMut,
    codec: HubProtocolCodec,
}

#[async_trait]
impl TransportSession for WebSocketSession {
    async fn recv(&mut self) -> Option<Result<HubMessage, SightwireError>> {
        loop {
            // Drain buffered records before touching the socket again.
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(message)) => return Some(Ok(message)),
                Ok(None) => {}
                Err(SightwireError::MalformedMessage(reason)) => {
                    warn!("Skipping malformed hub record: {reason}");
                    continue;
                }
                Err(e) => {
                    self.buffer.clear();
                    return Some(Err(e));
                }
            }

            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => self.buffer.extend_from_slice(text.as_bytes()),
                Some(Ok(Message::Binary(data))) => self.buffer.extend_from_slice(&data),
                // tungstenite answers pings on its own.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!("Hub closed the WebSocket: {frame:?}");
                    return None;
                }
                Some(Err(e)) => return Some(Err(e.into())),
                None => return None,
            }
        }
    }

    async fn send(&mut self, message: HubMessage) -> Result<(), SightwireError> {
        let text = record_text(message.encode_to_vec()?)?;
        self.ws.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            debug!("Error while closing WebSocket: {e}");
        }
    }
}
