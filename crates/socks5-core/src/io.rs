//! The TCP relay: two independent half-duplex copy pumps running
//! concurrently on the same reactor, inside one `tokio::select!` loop over
//! two fixed-size stack buffers. Every successful read/write renews the
//! deadline guard so it stays in sync with forward progress; either
//! direction hitting EOF or an error ends the whole relay.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::deadline::DeadlineGuard;

/// Buffer size for each direction of the relay.
pub const RELAY_BUFFER_SIZE: usize = 8 * 1024;

/// Bidirectionally relays octets between `client` and `upstream` until
/// either side hits EOF or an error. Returns the byte counts transferred in
/// each direction. Full-writes are looped internally by `write_all`, so a
/// short write is never observed by the caller.
pub async fn relay<A, B>(client: &mut A, upstream: &mut B, deadline: &DeadlineGuard) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut c2u = [0u8; RELAY_BUFFER_SIZE];
    let mut u2c = [0u8; RELAY_BUFFER_SIZE];

    let mut c2u_total = 0u64;
    let mut u2c_total = 0u64;

    loop {
        tokio::select! {
            res = client.read(&mut c2u) => match res {
                Ok(0) => break,
                Ok(n) => {
                    if upstream.write_all(&c2u[..n]).await.is_err() {
                        break;
                    }
                    c2u_total += n as u64;
                    deadline.renew();
                }
                Err(_) => break,
            },
            res = upstream.read(&mut u2c) => match res {
                Ok(0) => break,
                Ok(n) => {
                    if client.write_all(&u2c[..n]).await.is_err() {
                        break;
                    }
                    u2c_total += n as u64;
                    deadline.renew();
                }
                Err(_) => break,
            },
        }
    }

    (c2u_total, u2c_total)
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::duplex,
        net::{TcpListener, TcpStream},
    };
    use tokio_util::sync::CancellationToken;

    use super::*;

    #[tokio::test]
    async fn relays_bytes_both_ways() {
        let (mut client_a, mut client_b) = duplex(64);
        let (mut up_a, mut up_b) = duplex(64);
        let deadline = DeadlineGuard::new(None, CancellationToken::new());

        let relay_task = tokio::spawn(async move {
            relay(&mut client_a, &mut up_a, &deadline).await
        });

        client_b.write_all(b"hello-upstream").await.unwrap();
        let mut buf = [0u8; 32];
        let n = up_b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello-upstream");

        up_b.write_all(b"hello-client").await.unwrap();
        let n = client_b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello-client");

        drop(client_b);
        drop(up_b);
        relay_task.await.unwrap();
    }

    #[tokio::test]
    async fn real_sockets_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"abcde").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcde");
        server.await.unwrap();
    }
}
