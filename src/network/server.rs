//! TCP listener and per-connection message loop
//!
//! Each connection runs `HANDSHAKING -> UNACCEPTED -> ACCEPTED -> CLOSED`.
//! Only accepted connections live in the registry and receive floods;
//! detection probes and refusals are served while still unaccepted.

use crate::network::codec::{EnvelopeCodec, Frame, MessageType};
use crate::network::connection::PeerConnection;
use crate::network::error::NodeError;
use crate::network::handler;
use crate::network::handshake;
use crate::network::message::{ConnectionRefuse, Message, NodesExchange};
use crate::network::node::NodeContext;
use crate::pow;
use futures::stream::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::codec::FramedRead;

/// Reason sent with a refusal
pub const REFUSE_REASON: &str = "Connections are full";

/// Pause after a failed accept
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Create a listening socket
pub(crate) fn bind(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Accept connections until the node shuts down
pub(crate) async fn accept_loop(ctx: Arc<NodeContext>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    log::debug!("Incoming connection from {}", addr);
                    ctx.spawn(handle_connection(Arc::clone(&ctx), stream, addr, false));
                }
                Err(e) => {
                    log::warn!("Accept error: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    if let Ok(addr) = listener.local_addr() {
        log::info!("Stopped listening on {}", addr);
    }
}

/// Run one connection from handshake to close
pub(crate) async fn handle_connection(
    ctx: Arc<NodeContext>,
    stream: TcpStream,
    addr: SocketAddr,
    is_client: bool,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    let matched = tokio::select! {
        _ = ctx.shutdown.cancelled() => return,
        result = handshake::exchange(&mut reader, &mut writer, ctx.config.handshake_timeout()) => result,
    };
    match matched {
        Ok(true) => {}
        Ok(false) => {
            log::debug!("Handshake mismatch with {}", addr);
            return;
        }
        Err(e) => {
            log::debug!("Handshake with {} failed: {}", addr, e);
            return;
        }
    }

    let conn = Arc::new(
        PeerConnection::new(addr, is_client, writer).with_write_timeout(ctx.config.write_timeout()),
    );

    if is_client {
        let request = Message::NodesExchange(NodesExchange {
            max_req: ctx.config.exchange_request_size,
            listen_port: ctx.listen_port(),
            nodes: ctx
                .public_nodes
                .pick(ctx.config.exchange_request_size as usize),
        });
        if let Err(e) = ctx.send_message(&conn, &request).await {
            log::debug!("Node exchange request to {} failed: {}", addr, e);
            conn.close().await;
            return;
        }
    }

    message_loop(&ctx, &conn, reader).await;
    ctx.disconnect(&conn).await;
}

/// What the loop does after a frame
enum Flow {
    Continue,
    Disconnect,
}

async fn message_loop(ctx: &Arc<NodeContext>, conn: &Arc<PeerConnection>, reader: OwnedReadHalf) {
    let mut frames = FramedRead::new(reader, EnvelopeCodec::new(ctx.config.max_payload_size));
    let closed = conn.closed_token();

    loop {
        let frame = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = closed.cancelled() => break,
            next = frames.next() => match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    log::debug!("Bad frame from {}: {}", conn.addr(), e);
                    break;
                }
                None => {
                    log::info!("Peer {} disconnected", conn.addr());
                    break;
                }
            },
        };
        conn.touch();

        if let Flow::Disconnect = process_frame(ctx, conn, frame).await {
            break;
        }
        if !conn.is_accepted() {
            break;
        }
    }
}

async fn process_frame(ctx: &Arc<NodeContext>, conn: &Arc<PeerConnection>, frame: Frame) -> Flow {
    let addr = conn.addr();
    let envelope = frame.envelope.clone();

    if envelope.kind == MessageType::Custom && !conn.is_accepted() {
        log::debug!("Custom message from unaccepted {}", addr);
        return Flow::Disconnect;
    }

    if envelope.broadcast {
        let (source, nonce) = frame.proof_parts();
        if !pow::verify(source, nonce, ctx.config.broadcast_difficulty) {
            log::trace!("Dropping broadcast from {}: insufficient work", addr);
            return Flow::Continue;
        }
        if !ctx.bloom.add(frame.raw()) {
            log::trace!("Dropping broadcast from {}: already seen", addr);
            return Flow::Continue;
        }
    }

    // Other partitions' traffic is relayed but never decoded here
    if !envelope.kind.is_builtin() && envelope.network_id != ctx.network_id {
        if envelope.broadcast {
            ctx.flood_async(frame.raw().clone(), Some(addr), None);
        }
        return Flow::Continue;
    }

    let message = match Message::decode(envelope.kind, envelope.code, frame.payload()) {
        Ok(message) => message,
        Err(e) => {
            log::debug!("Undecodable message from {}: {}", addr, e);
            return Flow::Disconnect;
        }
    };
    if let Message::Custom(custom) = &message {
        if !ctx.handlers.contains(custom.code) {
            let e = NodeError::UnrecognizedMessage {
                kind: envelope.kind.as_u8(),
                code: custom.code,
            };
            log::debug!("Dropping {}: {}", addr, e);
            return Flow::Disconnect;
        }
    }

    if !conn.is_accepted() {
        if let Flow::Disconnect = try_accept(ctx, conn, &message).await {
            return Flow::Disconnect;
        }
    }

    let accepted = conn.is_accepted();
    if !accepted && !matches!(message, Message::NodeDetection | Message::ConnectionRefuse(_)) {
        return Flow::Continue;
    }

    let raw = envelope.broadcast.then(|| frame.raw().clone());
    if accepted && ctx.config.relay_broadcasts {
        if let Some(raw) = &raw {
            ctx.flood_async(raw.clone(), Some(addr), None);
        }
    }

    let task = ctx.spawn(handler::dispatch(
        Arc::clone(ctx),
        Arc::clone(conn),
        message,
        raw,
    ));
    // The loop ends after an unaccepted message; let its reply go out first
    if !accepted {
        let _ = task.await;
    }

    Flow::Continue
}

/// Decide acceptance on the first message after the handshake
async fn try_accept(ctx: &Arc<NodeContext>, conn: &Arc<PeerConnection>, message: &Message) -> Flow {
    let qualifies = if conn.is_client() {
        !matches!(message, Message::ConnectionRefuse(_))
    } else {
        !matches!(message, Message::NodeDetection)
    };
    if !qualifies {
        return Flow::Continue;
    }

    match ctx.registry.insert(Arc::clone(conn)).await {
        Ok(()) => {
            conn.mark_accepted();
            let addr = conn.addr();
            ctx.emit(move |events| events.on_connect(addr));
            Flow::Continue
        }
        Err(NodeError::ConnectionFull { .. }) if !conn.is_client() => {
            refuse(ctx, conn, message).await;
            Flow::Disconnect
        }
        Err(e) => {
            log::debug!("Not accepting {}: {}", conn.addr(), e);
            Flow::Disconnect
        }
    }
}

async fn refuse(ctx: &Arc<NodeContext>, conn: &Arc<PeerConnection>, message: &Message) {
    let wanted = match message {
        Message::NodesExchange(exchange) if exchange.max_req > 0 => exchange.max_req,
        _ => ctx.config.refusal_batch_size,
    };
    let refusal = Message::ConnectionRefuse(ConnectionRefuse {
        reason: REFUSE_REASON.to_string(),
        nodes: ctx.public_nodes.pick(wanted as usize),
    });

    log::info!("Refusing {}: {}", conn.addr(), REFUSE_REASON);
    if let Err(e) = ctx.send_message(conn, &refusal).await {
        log::debug!("Refusal to {} failed: {}", conn.addr(), e);
    }
}
