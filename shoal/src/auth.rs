//! Connection authentication handshake.
//!
//! The binary dialect authenticates with SASL PLAIN before any operation
//! traffic flows. The textual dialect has no authentication commands at
//! all, so its "handshake" is a `version` probe that detects servers
//! demanding auth the dialect cannot provide.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use shoal_protocol::ascii::{AsciiRequest, AsciiResponse};
use shoal_protocol::binary::{
    BinaryRequest, BinaryResponse, STATUS_AUTH_ERROR, STATUS_NO_ERROR, STATUS_UNKNOWN_COMMAND,
};

use crate::error::Error;

/// One username/password pair. Read-only after construction.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    username: String,
    password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// SASL PLAIN initial response: `\0authcid\0password` with an empty
    /// authorization identity.
    fn plain_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(2 + self.username.len() + self.password.len());
        payload.push(0);
        payload.extend_from_slice(self.username.as_bytes());
        payload.push(0);
        payload.extend_from_slice(self.password.as_bytes());
        payload
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Run the binary-dialect SASL handshake on a fresh connection.
///
/// Credentials are tried in order. An AuthError status moves to the next
/// credential; exhausting the list is a fatal authentication error for
/// this attempt. A server that answers UnknownCommand does not support
/// SASL and accepts unauthenticated traffic, which satisfies the
/// handshake. With no credentials configured, a noop round-trip checks
/// that the server actually serves unauthenticated commands; an
/// auth-error reply fails the handshake instead of leaving a connection
/// that rejects everything.
pub async fn binary_handshake<S>(stream: &mut S, credentials: &[Credential]) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if credentials.is_empty() {
        return verify_open(stream).await;
    }

    let mut buf = BytesMut::with_capacity(4096);
    for credential in credentials {
        let payload = credential.plain_payload();
        let mut frame = Vec::new();
        BinaryRequest::SaslAuth {
            mechanism: b"PLAIN",
            payload: &payload,
        }
        .encode(&mut frame);
        stream.write_all(&frame).await?;

        let response = read_binary_frame(stream, &mut buf).await?;
        match response.status {
            STATUS_NO_ERROR => {
                debug!(username = credential.username(), "sasl auth accepted");
                return Ok(());
            }
            STATUS_AUTH_ERROR => {
                debug!(username = credential.username(), "sasl auth rejected");
                continue;
            }
            STATUS_UNKNOWN_COMMAND => {
                debug!("server does not support sasl, proceeding unauthenticated");
                return Ok(());
            }
            status => {
                return Err(Error::Protocol(format!(
                    "unexpected sasl auth status {status:#06x}"
                )));
            }
        }
    }

    warn!("all credentials rejected by server");
    Err(Error::Authentication(
        "wrong credentials: server rejected every configured credential".into(),
    ))
}

/// Confirm a credential-less connection is actually usable by round-
/// tripping a noop. A server enforcing SASL answers with the auth-error
/// status, which must fail the connection here rather than surface on
/// the first real operation.
async fn verify_open<S>(stream: &mut S) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut frame = Vec::new();
    BinaryRequest::Noop.encode(&mut frame);
    stream.write_all(&frame).await?;

    let mut buf = BytesMut::with_capacity(256);
    let response = read_binary_frame(stream, &mut buf).await?;
    match response.status {
        STATUS_NO_ERROR => Ok(()),
        STATUS_AUTH_ERROR => Err(Error::Authentication(
            "server requires authentication and no credentials are configured".into(),
        )),
        status => Err(Error::Protocol(format!(
            "unexpected noop status {status:#06x}"
        ))),
    }
}

/// Probe an ascii-dialect connection with `version`.
///
/// A CLIENT_ERROR reply proves the server demands authentication this
/// dialect cannot express, which is fatal. A VERSION reply means the
/// connection is usable.
pub async fn ascii_probe<S>(stream: &mut S) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut frame = Vec::new();
    AsciiRequest::Version.encode(&mut frame);
    stream.write_all(&frame).await?;

    let mut buf = BytesMut::with_capacity(256);
    let response = read_ascii_frame(stream, &mut buf).await?;
    match response {
        AsciiResponse::Version(_) => Ok(()),
        AsciiResponse::ClientError(_) => Err(Error::Authentication(
            "server requires authentication, which the ascii dialect cannot provide".into(),
        )),
        other => Err(Error::Protocol(format!(
            "unexpected version probe reply: {other:?}"
        ))),
    }
}

async fn read_binary_frame<S>(stream: &mut S, buf: &mut BytesMut) -> Result<BinaryResponse, Error>
where
    S: AsyncRead + Unpin,
{
    loop {
        match BinaryResponse::parse(buf) {
            Ok((response, _consumed)) => return Ok(response),
            Err(err) if err.is_incomplete() => {}
            Err(err) => return Err(err.into()),
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(Error::ConnectionReset);
        }
    }
}

async fn read_ascii_frame<S>(stream: &mut S, buf: &mut BytesMut) -> Result<AsciiResponse, Error>
where
    S: AsyncRead + Unpin,
{
    loop {
        match AsciiResponse::parse(buf) {
            Ok((response, _consumed)) => return Ok(response),
            Err(err) if err.is_incomplete() => {}
            Err(err) => return Err(err.into()),
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(Error::ConnectionReset);
        }
    }
}
