//! Bidirectional relay loops
//!
//! Two copy loops per connection, one per direction, joined before
//! teardown. Whichever loop ends first signals the shared stop channel and
//! shuts down its destination so the paired loop unblocks as well.

use crate::state::Direction;
use crate::trace::TraceInfo;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

/// Relay between the inbound (downstream) side and the upstream side until
/// both directions have terminated.
pub async fn run<D, U>(trace: &TraceInfo, downstream: D, upstream: U, buffer_size: usize)
where
    D: AsyncRead + AsyncWrite + Send,
    U: AsyncRead + AsyncWrite + Send,
{
    let (down_read, down_write) = tokio::io::split(downstream);
    let (up_read, up_write) = tokio::io::split(upstream);
    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);

    tokio::join!(
        copy_stream(
            Direction::Up,
            down_read,
            up_write,
            trace,
            buffer_size,
            stop_rx.clone(),
            Arc::clone(&stop_tx),
        ),
        copy_stream(
            Direction::Down,
            up_read,
            down_write,
            trace,
            buffer_size,
            stop_rx,
            stop_tx,
        ),
    );
}

/// One directional copy loop. Reads are recorded against the trace before
/// the EOF check; any read or write fault ends the loop as a peer
/// disconnect. Relay faults are routine, so they only log at debug level.
async fn copy_stream<R, W>(
    direction: Direction,
    mut src: R,
    mut dst: W,
    trace: &TraceInfo,
    buffer_size: usize,
    mut stop: watch::Receiver<bool>,
    stop_tx: Arc<watch::Sender<bool>>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; buffer_size];
    loop {
        let count = tokio::select! {
            read = src.read(&mut buffer) => match read {
                Ok(count) => count,
                Err(e) => {
                    log::debug!("[{}] {direction:?} relay read ended: {e}", trace.id());
                    break;
                }
            },
            _ = stop.changed() => break,
        };
        trace.add_bytes(direction, count as u64);
        if count == 0 {
            break;
        }
        if let Err(e) = dst.write_all(&buffer[..count]).await {
            log::debug!("[{}] {direction:?} relay write ended: {e}", trace.id());
            break;
        }
        // The cipher wrapper may stage bytes it could not push downstream;
        // without this flush a response tail would sit there until the next
        // read in the same direction.
        if let Err(e) = dst.flush().await {
            log::debug!("[{}] {direction:?} relay flush ended: {e}", trace.id());
            break;
        }
    }

    trace.set_state(direction.disconnect_state());
    // Unblock the paired loop and push a FIN towards our destination.
    let _ = stop_tx.send(true);
    let _ = dst.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::ConnectionId;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let (client, down_side) = tokio::io::duplex(4096);
        let (up_side, server) = tokio::io::duplex(4096);
        let trace = Arc::new(TraceInfo::new(ConnectionId::generate()));

        let relay_trace = Arc::clone(&trace);
        let relay = tokio::spawn(async move {
            run(&relay_trace, down_side, up_side, 4096).await;
        });

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        client_write.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server_write.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        // Client hangs up; both loops must terminate.
        drop(client_write);
        drop(client_read);
        timeout(Duration::from_secs(5), relay).await.unwrap().unwrap();

        assert_eq!(trace.up_bytes(), 4);
        assert_eq!(trace.down_bytes(), 5);
    }

    #[tokio::test]
    async fn test_backpressured_tunnel_leg_delivers_full_payload() {
        let (mut app, down_side) = tokio::io::duplex(4096);
        // Tunnel leg with a 4-byte pipe: the cipher wrapper has to stage
        // most of each write and drain it under backpressure.
        let (tunnel_near, tunnel_far) = tokio::io::duplex(4);
        let trace = Arc::new(TraceInfo::new(ConnectionId::generate()));

        let relay_trace = Arc::clone(&trace);
        let relay = tokio::spawn(async move {
            run(
                &relay_trace,
                down_side,
                crate::obfuscate::ObfuscatedStream::new(tunnel_near),
                4096,
            )
            .await;
        });

        let mut far = crate::obfuscate::ObfuscatedStream::new(tunnel_far);
        app.write_all(b"0123456789").await.unwrap();
        let mut buf = [0u8; 10];
        // Must arrive in full even though nothing else flows this direction.
        timeout(Duration::from_secs(5), far.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"0123456789");

        drop(app);
        drop(far);
        timeout(Duration::from_secs(5), relay).await.unwrap().unwrap();
        assert_eq!(trace.up_bytes(), 10);
    }

    #[tokio::test]
    async fn test_upstream_close_unblocks_both_loops() {
        let (client, down_side) = tokio::io::duplex(4096);
        let (up_side, server) = tokio::io::duplex(4096);
        let trace = Arc::new(TraceInfo::new(ConnectionId::generate()));

        let relay_trace = Arc::clone(&trace);
        let relay = tokio::spawn(async move {
            run(&relay_trace, down_side, up_side, 4096).await;
        });

        // Only the upstream side goes away; the client keeps its end open
        // and must still be released by the cross-closure.
        drop(server);
        let client = client;
        timeout(Duration::from_secs(5), relay).await.unwrap().unwrap();
        drop(client);

        let states: Vec<_> = trace.state_log().iter().map(|item| item.state).collect();
        assert!(states.contains(&crate::state::ConnectionState::ServerDisconnected));
    }
}
