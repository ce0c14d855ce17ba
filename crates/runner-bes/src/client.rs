//! Transport: dialing the backend and driving the bidirectional RPC.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio_stream::wrappers::ReceiverStream;
use tonic::codec::ProstCodec;
use tonic::transport::{Channel, Endpoint};
use tonic::Streaming;

use crate::proto::{
    PublishBuildToolEventStreamRequest, PublishBuildToolEventStreamResponse, PUBLISH_METHOD_PATH,
};

/// Dial `bes_backend`. Scheme `grpc` implies plaintext; any other scheme
/// implies TLS with the platform's native root store.
pub async fn dial(bes_backend: &str) -> Result<Channel> {
    let (endpoint_url, tls) = if let Some(rest) = bes_backend.strip_prefix("grpc://") {
        (format!("http://{rest}"), false)
    } else if let Some(rest) = bes_backend.strip_prefix("grpcs://") {
        (format!("https://{rest}"), true)
    } else {
        (bes_backend.to_string(), true)
    };

    let mut endpoint = Endpoint::from_shared(endpoint_url)
        .context("invalid --bes_backend URL")?
        .timeout(Duration::from_secs(60))
        .connect_timeout(Duration::from_secs(10));

    if tls {
        endpoint = endpoint
            .tls_config(tonic::transport::ClientTlsConfig::new().with_native_roots())
            .context("failed to configure TLS for --bes_backend")?;
    }

    endpoint
        .connect()
        .await
        .context("failed to dial build-event backend")
}

/// Open the bidirectional streaming RPC: send every envelope from
/// `outbound` (fed from a channel by the caller) and return the inbound
/// ack stream.
pub async fn open_stream(
    channel: Channel,
    outbound: tokio::sync::mpsc::Receiver<PublishBuildToolEventStreamRequest>,
) -> Result<Streaming<PublishBuildToolEventStreamResponse>> {
    let mut client = tonic::client::Grpc::new(channel);
    client.ready().await.context("backend channel not ready")?;

    let codec = ProstCodec::default();
    let path = http::uri::PathAndQuery::from_static(PUBLISH_METHOD_PATH);

    let request = tonic::Request::new(ReceiverStream::new(outbound));

    let response = client
        .streaming(request, path, codec)
        .await
        .context("failed to open build-event stream")?;

    Ok(response.into_inner())
}
