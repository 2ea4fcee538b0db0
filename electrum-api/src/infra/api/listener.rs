// This file is part of corvid-indexer.
// Copyright (C) 2026 Corvid Project
// SPDX-License-Identifier: Apache-2.0

//! Listeners and transports. TCP, TLS and local RPC connections carry
//! newline-framed JSON-RPC; WebSocket connections carry one payload per
//! message. TLS endpoints share one lazily built acceptor.

use crate::{
    domain::{
        chain::{BlockProcessor, PeerManager},
        daemon::Daemon,
        mempool::Mempool,
        storage::Db,
    },
    infra::api::{Service, manager::SessionManager, session::Session},
};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use log::{debug, warn};
use std::{
    fs::File,
    io::BufReader,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    io::{AsyncWriteExt, ReadHalf, WriteHalf, split},
    net::{TcpSocket, TcpStream},
    select,
    task::JoinHandle,
};
use tokio_rustls::{TlsAcceptor, rustls, server::TlsStream};
use tokio_tungstenite::{
    WebSocketStream, accept_async_with_config,
    tungstenite::{self, Message, protocol::WebSocketConfig},
};
use tokio_util::{
    codec::{FramedRead, LinesCodec, LinesCodecError},
    either::Either,
    sync::CancellationToken,
};

/// A plain or TLS-wrapped connection.
pub type ServerStream = Either<TcpStream, TlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("cannot bind {0}")]
    Bind(Service, #[source] std::io::Error),

    #[error("TLS cert or key file not configured")]
    TlsNotConfigured,

    #[error("cannot read TLS cert or key file")]
    TlsFiles(#[from] std::io::Error),

    #[error("cannot build TLS configuration")]
    Tls(#[from] rustls::Error),
}

/// The shared TLS acceptor, built from cert and key files on first use.
pub struct TlsContext {
    certfile: PathBuf,
    keyfile: PathBuf,
    acceptor: parking_lot::Mutex<Option<TlsAcceptor>>,
}

impl TlsContext {
    pub fn new(certfile: PathBuf, keyfile: PathBuf) -> Self {
        Self {
            certfile,
            keyfile,
            acceptor: parking_lot::Mutex::new(None),
        }
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor, ListenerError> {
        let mut acceptor = self.acceptor.lock();
        if let Some(acceptor) = acceptor.as_ref() {
            return Ok(acceptor.clone());
        }

        let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(&self.certfile)?))
            .collect::<Result<Vec<_>, _>>()?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(&self.keyfile)?))?
            .ok_or(ListenerError::TlsNotConfigured)?;
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        let built = TlsAcceptor::from(Arc::new(config));
        *acceptor = Some(built.clone());
        Ok(built)
    }
}

/// A running listener. Closing stops accepting; established sessions live on.
pub struct ServerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub async fn wait_closed(self) {
        let _ = self.task.await;
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Bind and start accepting connections for one service.
pub fn start_service<D, M, R, P, B>(
    manager: Arc<SessionManager<D, M, R, P, B>>,
    service: Service,
    tls: Option<TlsAcceptor>,
) -> Result<ServerHandle, ListenerError>
where
    D: Db,
    M: Mempool,
    R: Daemon,
    P: PeerManager,
    B: BlockProcessor,
{
    let address = SocketAddr::new(
        service.host.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        service.port,
    );
    let socket = match address {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(|error| ListenerError::Bind(service.clone(), error))?;
    socket
        .set_reuseaddr(true)
        .map_err(|error| ListenerError::Bind(service.clone(), error))?;
    socket
        .bind(address)
        .map_err(|error| ListenerError::Bind(service.clone(), error))?;
    let listener = socket
        .listen(1024)
        .map_err(|error| ListenerError::Bind(service.clone(), error))?;
    let local_addr = listener
        .local_addr()
        .map_err(|error| ListenerError::Bind(service.clone(), error))?;

    let cancel = CancellationToken::new();
    let task = tokio::spawn(accept_loop(
        manager,
        service,
        listener,
        tls,
        cancel.clone(),
    ));

    Ok(ServerHandle {
        cancel,
        task,
        local_addr,
    })
}

async fn accept_loop<D, M, R, P, B>(
    manager: Arc<SessionManager<D, M, R, P, B>>,
    service: Service,
    listener: tokio::net::TcpListener,
    tls: Option<TlsAcceptor>,
    cancel: CancellationToken,
) where
    D: Db,
    M: Mempool,
    R: Daemon,
    P: PeerManager,
    B: BlockProcessor,
{
    loop {
        select! {
            _ = cancel.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(
                        manager.clone(),
                        service.clone(),
                        stream,
                        peer,
                        tls.clone(),
                    ));
                }

                Err(error) => {
                    warn!(service:%, error:%; "cannot accept connection");
                }
            }
        }
    }

    debug!(service:%; "listener closed");
}

async fn handle_connection<D, M, R, P, B>(
    manager: Arc<SessionManager<D, M, R, P, B>>,
    service: Service,
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
) where
    D: Db,
    M: Mempool,
    R: Daemon,
    P: PeerManager,
    B: BlockProcessor,
{
    let stream = match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(stream) => Either::Right(stream),

            Err(error) => {
                debug!(peer:%, error:%; "TLS handshake failed");
                return;
            }
        },

        None => Either::Left(stream),
    };

    let max_recv = manager.max_recv();

    let (reader, writer) = if service.protocol.uses_websocket() {
        let config = WebSocketConfig::default()
            .max_message_size(Some(max_recv))
            .max_frame_size(Some(max_recv));
        match accept_async_with_config(stream, Some(config)).await {
            Ok(websocket) => {
                let (sink, stream) = websocket.split();
                (SessionReader::Ws(stream), SessionWriter::Ws(sink))
            }

            Err(error) => {
                debug!(peer:%, error:%; "websocket handshake failed");
                return;
            }
        }
    } else {
        let (read_half, write_half) = split(stream);
        let framed = FramedRead::new(read_half, LinesCodec::new_with_max_length(max_recv));
        (SessionReader::Lines(framed), SessionWriter::Lines(write_half))
    };

    Session::spawn(manager, service.protocol, peer, reader, writer);
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request exceeds maximum size")]
    OversizedRequest,

    #[error("request is not valid UTF-8")]
    Encoding,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ws(#[from] tungstenite::Error),
}

/// One event read off a transport.
#[derive(Debug)]
pub enum ReadEvent {
    Message(String),
    Ping(Vec<u8>),
}

pub enum SessionReader {
    Lines(FramedRead<ReadHalf<ServerStream>, LinesCodec>),
    Ws(SplitStream<WebSocketStream<ServerStream>>),
}

impl SessionReader {
    /// The next request payload or control event; `None` at end of stream.
    pub async fn next(&mut self) -> Result<Option<ReadEvent>, TransportError> {
        match self {
            SessionReader::Lines(framed) => match framed.next().await {
                Some(Ok(line)) => Ok(Some(ReadEvent::Message(line))),
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    Err(TransportError::OversizedRequest)
                }
                Some(Err(LinesCodecError::Io(error))) => Err(error.into()),
                None => Ok(None),
            },

            SessionReader::Ws(stream) => loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        break Ok(Some(ReadEvent::Message(text.to_string())));
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        let text = String::from_utf8(bytes.to_vec())
                            .map_err(|_| TransportError::Encoding)?;
                        break Ok(Some(ReadEvent::Message(text)));
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        break Ok(Some(ReadEvent::Ping(payload.to_vec())));
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(None),
                    Some(Ok(_)) => continue,
                    Some(Err(tungstenite::Error::Capacity(_))) => {
                        break Err(TransportError::OversizedRequest);
                    }
                    Some(Err(error)) => break Err(error.into()),
                }
            },
        }
    }
}

pub enum SessionWriter {
    Lines(WriteHalf<ServerStream>),
    Ws(SplitSink<WebSocketStream<ServerStream>, Message>),
}

impl SessionWriter {
    pub async fn send(&mut self, payload: &str) -> Result<(), TransportError> {
        match self {
            SessionWriter::Lines(writer) => {
                writer.write_all(payload.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
                Ok(())
            }

            SessionWriter::Ws(sink) => {
                sink.send(Message::text(payload.to_string())).await?;
                Ok(())
            }
        }
    }

    pub async fn pong(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        match self {
            SessionWriter::Lines(_) => Ok(()),
            SessionWriter::Ws(sink) => {
                sink.send(Message::Pong(payload.into())).await?;
                Ok(())
            }
        }
    }

    pub async fn shutdown(&mut self) {
        match self {
            SessionWriter::Lines(writer) => {
                let _ = writer.shutdown().await;
            }
            SessionWriter::Ws(sink) => {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
            }
        }
    }

    /// Connection-accept log line address, respecting anonymized logs.
    pub fn describe_peer(peer: SocketAddr, anon: bool) -> String {
        if anon {
            "xx.xx.xx.xx:xx".to_string()
        } else {
            peer.to_string()
        }
    }
}

/// Whether an address is private (exempt from IP session groups).
pub fn is_private_ip(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unique_local() || v6.is_unicast_link_local(),
    }
}

/// The name of the IP session group: a /24 prefix for IPv4, a /48 prefix for
/// IPv6, `None` for private addresses.
pub fn ip_group_name(addr: IpAddr) -> Option<String> {
    if is_private_ip(addr) {
        return None;
    }

    match addr {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            Some(format!("{}.{}.{}", octets[0], octets[1], octets[2]))
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            Some(format!(
                "{:04x}:{:04x}:{:04x}",
                segments[0], segments[1], segments[2]
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_group_name() {
        assert_eq!(
            ip_group_name("93.184.216.34".parse().unwrap()),
            Some("93.184.216".to_string())
        );
        assert_eq!(ip_group_name("192.168.1.2".parse().unwrap()), None);
        assert_eq!(ip_group_name("127.0.0.1".parse().unwrap()), None);
        assert_eq!(
            ip_group_name("2001:db8:abcd::1".parse().unwrap()),
            Some("2001:0db8:abcd".to_string())
        );
    }

    #[test]
    fn test_describe_peer_anonymized() {
        let peer = "1.2.3.4:56789".parse().unwrap();
        assert_eq!(SessionWriter::describe_peer(peer, false), "1.2.3.4:56789");
        assert_eq!(SessionWriter::describe_peer(peer, true), "xx.xx.xx.xx:xx");
    }
}
