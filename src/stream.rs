use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::time;

async fn with_timeout<F, T>(
    duration: Option<Duration>,
    future: F,
    timeout_message: &'static str,
) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    if let Some(duration) = duration {
        match time::timeout(duration, future).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, timeout_message)),
        }
    } else {
        future.await
    }
}

fn tune(stream: &TcpStream) -> io::Result<()> {
    // Frames are already coalesced by the writer task.
    stream.set_nodelay(true)
}

pub async fn create_tcp_stream(
    host: &str,
    port: u16,
    timeout: Option<Duration>,
) -> io::Result<TcpStream> {
    let stream = with_timeout(
        timeout,
        TcpStream::connect((host, port)),
        "TCP connection timed out",
    )
    .await?;
    tune(&stream)?;
    Ok(stream)
}

pub async fn bind_listener<A: ToSocketAddrs>(addr: A) -> io::Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    Ok((listener, local))
}

pub(crate) fn accepted(stream: TcpStream) -> io::Result<TcpStream> {
    tune(&stream)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connects_to_bound_listener() {
        let (listener, addr) = bind_listener("127.0.0.1:0").await.unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.map(|(s, _)| s) });
        let client = create_tcp_stream("127.0.0.1", addr.port(), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        let server = accepted(accept.await.unwrap().unwrap()).unwrap();
        assert_eq!(client.peer_addr().unwrap(), server.local_addr().unwrap());
    }
}
