use std::io;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

/// Minimal line-oriented client for the stream transport.
pub struct StreamClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl StreamClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer,
        })
    }

    /// Sends one raw request; the trailing newline is added here.
    pub async fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    /// Publishes `payload` to `topic` and returns the broker's reply.
    pub async fn publish(&mut self, topic: &str, payload: &str) -> io::Result<String> {
        self.send_line(&format!("PUB:{topic}:{payload}")).await?;
        self.expect_line().await
    }

    /// Subscribes to `topic` and returns the broker's reply. Deliveries are
    /// read afterwards with [`StreamClient::next_line`].
    pub async fn subscribe(&mut self, topic: &str) -> io::Result<String> {
        self.send_line(&format!("SUB:{topic}")).await?;
        self.expect_line().await
    }

    /// Next line from the server without its terminator, `None` once the
    /// server closed the connection.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let trimmed = line.strip_suffix('\n').unwrap_or(&line);
        Ok(Some(trimmed.strip_suffix('\r').unwrap_or(trimmed).to_string()))
    }

    async fn expect_line(&mut self) -> io::Result<String> {
        self.next_line().await?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "server closed the connection")
        })
    }

    /// Closes the write side, signalling end-of-stream to the server.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}
