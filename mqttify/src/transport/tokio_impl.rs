/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Transport adapter built on [`tokio`](https://crates.io/crates/tokio).

Each connection attempt runs as a task on a caller-supplied runtime.  The task opens the stream
(TCP, then optionally TLS and/or a websocket upgrade), reports the outcome through the event
sink, and then pumps bytes in both directions until either side closes.
 */

use crate::config::{ConnectionProtocol, Endpoint};
use crate::error::{MqttifyError, MqttifyResult};
use crate::transport::{TransportAdapter, TransportEventSink};
#[cfg(feature = "tokio-rustls")]
use crate::transport::tls::{TlsOptions, TlsOptionsBuilder};

use log::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use ::tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use ::tokio::net::TcpStream;
use ::tokio::runtime::Handle;
use ::tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use ::tokio::task::JoinHandle;

#[cfg(feature = "tokio-websockets")]
use stream_ws::{tungstenite::WsMessageHandler, WsMessageHandle, WsByteStream};
#[cfg(feature = "tokio-websockets")]
use tokio_tungstenite::{client_async, WebSocketStream};
#[cfg(feature = "tokio-websockets")]
use tungstenite::client::IntoClientRequest;
#[cfg(feature = "tokio-websockets")]
use tungstenite::Message;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_BUFFER_SIZE: usize = 16 * 1024;

trait TransportStream : AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> TransportStream for T where T : AsyncRead + AsyncWrite + Send + Unpin {}

type BoxedTransportStream = Box<dyn TransportStream>;

#[derive(Clone, Default)]
struct StreamConfig {
    #[cfg(feature = "tokio-rustls")]
    tls_options: Option<TlsOptions>,
}

struct TokioConnection {
    task: JoinHandle<()>,
    writer: UnboundedSender<Vec<u8>>,
    established: Arc<AtomicBool>,
}

/// Transport adapter that runs each connection as a task on a tokio runtime
pub struct TokioTransport {
    runtime: Handle,
    connect_timeout: Duration,
    stream_config: StreamConfig,
    connection: Option<TokioConnection>,
}

impl TokioTransport {

    /// Creates an adapter that spawns connection tasks onto `runtime`
    pub fn new(runtime: Handle) -> Self {
        TokioTransport {
            runtime,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stream_config: StreamConfig::default(),
            connection: None,
        }
    }

    /// Bounds the time from starting a connection attempt to a usable stream, TLS and websocket
    /// handshakes included
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// TLS configuration for `mqtts` and `wss` endpoints.  Native roots are used when unset.
    #[cfg(feature = "tokio-rustls")]
    pub fn with_tls_options(mut self, tls_options: TlsOptions) -> Self {
        self.stream_config.tls_options = Some(tls_options);
        self
    }
}

impl TransportAdapter for TokioTransport {
    fn connect(&mut self, endpoint: &Endpoint, sink: TransportEventSink) -> MqttifyResult<()> {
        self.close();

        let (writer, outbound) = unbounded_channel();
        let established = Arc::new(AtomicBool::new(false));

        info!("TokioTransport - starting connection {} to {}", sink.connection_id(), endpoint);
        let task = self.runtime.spawn(run_connection(endpoint.clone(), self.stream_config.clone(), self.connect_timeout, sink, outbound, established.clone()));

        self.connection = Some(TokioConnection {
            task,
            writer,
            established,
        });

        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> MqttifyResult<()> {
        let Some(connection) = &self.connection else {
            return Err(MqttifyError::new_transport_error("no open connection"));
        };

        connection.writer.send(bytes.to_vec())
            .map_err(|_| MqttifyError::new_transport_error("connection task has stopped"))
    }

    fn close(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        // an established connection drains queued writes before shutting down
        if !connection.established.load(Ordering::Acquire) {
            debug!("TokioTransport - aborting in-progress connection attempt");
            connection.task.abort();
        }
    }
}

impl Drop for TokioTransport {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.task.abort();
        }
    }
}

async fn run_connection(endpoint: Endpoint, stream_config: StreamConfig, connect_timeout: Duration, sink: TransportEventSink, outbound: UnboundedReceiver<Vec<u8>>, established: Arc<AtomicBool>) {
    let stream =
        match ::tokio::time::timeout(connect_timeout, open_stream(&endpoint, stream_config)).await {
            Ok(Ok(stream)) => { stream }
            Ok(Err(error)) => {
                warn!("run_connection - connection {} to {} failed: {}", sink.connection_id(), endpoint, error);
                sink.on_connect_failed(error);
                return;
            }
            Err(_) => {
                warn!("run_connection - connection {} to {} timed out", sink.connection_id(), endpoint);
                sink.on_connect_failed(MqttifyError::new_connection_establishment_failure("transport connect timeout exceeded"));
                return;
            }
        };

    established.store(true, Ordering::Release);
    sink.on_connected();

    let result = run_stream(stream, &sink, outbound).await;
    debug!("run_connection - connection {} ended: {:?}", sink.connection_id(), result);
    sink.on_transport_closed(result.err());
}

async fn run_stream(stream: BoxedTransportStream, sink: &TransportEventSink, mut outbound: UnboundedReceiver<Vec<u8>>) -> MqttifyResult<()> {
    let (mut reader, mut writer) = ::tokio::io::split(stream);
    let mut inbound = vec![0u8; READ_BUFFER_SIZE];

    loop {
        ::tokio::select! {
            read_result = reader.read(&mut inbound) => {
                let bytes_read = read_result?;
                if bytes_read == 0 {
                    info!("run_stream - connection {} closed by remote", sink.connection_id());
                    return Ok(());
                }

                sink.on_bytes_received(&inbound[..bytes_read]);
            }
            write_request = outbound.recv() => {
                match write_request {
                    Some(bytes) => {
                        writer.write_all(&bytes).await?;
                        writer.flush().await?;
                    }
                    None => {
                        debug!("run_stream - connection {} closed locally", sink.connection_id());
                        let _ = writer.shutdown().await;
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn make_leaf_stream(endpoint: &Endpoint) -> MqttifyResult<TcpStream> {
    debug!("make_leaf_stream - opening TCP stream to {}:{}", endpoint.host(), endpoint.port());
    let stream = TcpStream::connect((endpoint.host(), endpoint.port())).await?;
    stream.set_nodelay(true)?;
    debug!("make_leaf_stream - TCP stream successfully established");

    Ok(stream)
}

async fn open_stream(endpoint: &Endpoint, stream_config: StreamConfig) -> MqttifyResult<BoxedTransportStream> {
    let tcp_stream = make_leaf_stream(endpoint).await?;

    match endpoint.protocol() {
        ConnectionProtocol::Mqtt => {
            Ok(Box::new(tcp_stream))
        }
        #[cfg(feature = "tokio-rustls")]
        ConnectionProtocol::Mqtts => {
            let tls_stream = wrap_stream_with_tls(tcp_stream, endpoint.host(), stream_config.tls_options).await?;
            Ok(Box::new(tls_stream))
        }
        #[cfg(feature = "tokio-websockets")]
        ConnectionProtocol::Ws => {
            let ws_stream = wrap_stream_with_websockets(tcp_stream, endpoint).await?;
            Ok(Box::new(ws_stream))
        }
        #[cfg(all(feature = "tokio-rustls", feature = "tokio-websockets"))]
        ConnectionProtocol::Wss => {
            let tls_stream = wrap_stream_with_tls(tcp_stream, endpoint.host(), stream_config.tls_options).await?;
            let ws_stream = wrap_stream_with_websockets(tls_stream, endpoint).await?;
            Ok(Box::new(ws_stream))
        }
        #[allow(unreachable_patterns)]
        protocol => {
            let _ = stream_config;
            Err(MqttifyError::new_transport_error(format!("{} support is not enabled in this build", protocol)))
        }
    }
}

#[cfg(feature = "tokio-rustls")]
async fn wrap_stream_with_tls<S>(stream: S, host: &str, tls_options: Option<TlsOptions>) -> MqttifyResult<tokio_rustls::client::TlsStream<S>> where S : AsyncRead + AsyncWrite + Unpin {
    let domain = rustls_pki_types::ServerName::try_from(host.to_string())?;

    let tls_options =
        match tls_options {
            Some(tls_options) => { tls_options }
            None => { TlsOptionsBuilder::new().build()? }
        };

    let connector = tokio_rustls::TlsConnector::from(tls_options.config);

    debug!("wrap_stream_with_tls - performing tls handshake");
    let tls_stream = connector.connect(domain, stream).await?;
    debug!("wrap_stream_with_tls - tls handshake successfully completed");

    Ok(tls_stream)
}

#[cfg(feature = "tokio-websockets")]
async fn wrap_stream_with_websockets<S>(stream: S, endpoint: &Endpoint) -> MqttifyResult<WsByteStream<WebSocketStream<S>, Message, tungstenite::Error, WsMessageHandler>> where S : AsyncRead + AsyncWrite + Unpin {
    let mut request = endpoint.websocket_uri().into_client_request()?;
    request.headers_mut().insert("Sec-WebSocket-Protocol", tungstenite::http::HeaderValue::from_static("mqtt"));

    debug!("wrap_stream_with_websockets - upgrading stream to websockets");
    let (message_stream, _) = client_async(request, stream).await?;
    let byte_stream = WsMessageHandler::wrap_stream(message_stream);
    debug!("wrap_stream_with_websockets - successfully upgraded stream to websockets");

    Ok(byte_stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TaggedTransportEvent, TransportEvent};
    use assert_matches::assert_matches;
    use ::tokio::net::TcpListener;

    fn next_event(receiver: &std::sync::mpsc::Receiver<TaggedTransportEvent>) -> TransportEvent {
        receiver.recv_timeout(Duration::from_secs(10)).unwrap().event
    }

    #[test]
    fn tcp_round_trip() {
        let runtime = ::tokio::runtime::Runtime::new().unwrap();
        let listener = runtime.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = runtime.spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = [0u8; 4];
            socket.read_exact(&mut buffer).await.unwrap();
            socket.write_all(&buffer).await.unwrap();
        });

        let (sender, receiver) = std::sync::mpsc::channel();
        let mut transport = TokioTransport::new(runtime.handle().clone());
        let endpoint = Endpoint::new(ConnectionProtocol::Mqtt, "127.0.0.1", port);
        transport.connect(&endpoint, TransportEventSink::new(3, sender)).unwrap();

        assert_matches!(next_event(&receiver), TransportEvent::Connected);
        transport.send(&[1, 2, 3, 4]).unwrap();

        let mut echoed = Vec::new();
        while echoed.len() < 4 {
            match next_event(&receiver) {
                TransportEvent::BytesReceived(bytes) => { echoed.extend_from_slice(&bytes); }
                _ => { panic!("unexpected transport event"); }
            }
        }
        assert_eq!(vec!(1, 2, 3, 4), echoed);

        runtime.block_on(server).unwrap();
        assert_matches!(next_event(&receiver), TransportEvent::Closed(None));
    }

    #[test]
    fn refused_connection_reports_failure() {
        let runtime = ::tokio::runtime::Runtime::new().unwrap();
        let port = {
            let listener = runtime.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
            listener.local_addr().unwrap().port()
        };

        let (sender, receiver) = std::sync::mpsc::channel();
        let mut transport = TokioTransport::new(runtime.handle().clone());
        transport.connect(&Endpoint::new(ConnectionProtocol::Mqtt, "127.0.0.1", port), TransportEventSink::new(1, sender)).unwrap();

        assert_matches!(next_event(&receiver), TransportEvent::ConnectFailed(_));
    }

    #[test]
    fn send_without_connection_fails() {
        let runtime = ::tokio::runtime::Runtime::new().unwrap();
        let mut transport = TokioTransport::new(runtime.handle().clone());

        assert_matches!(transport.send(&[0]), Err(MqttifyError::TransportError(_)));
    }
}
