//! Redis backend for the distributed store, on top of the `redis` crate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, FromRedisValue};
use tracing::{debug, warn};

use super::{KvConnection, KvConnector};
use crate::error::{Error, Result};

/// One multiplexed connection, with every command bounded by the I/O timeout.
pub struct RedisConnection {
    conn: MultiplexedConnection,
    io_timeout: Duration,
}

impl RedisConnection {
    pub fn new(conn: MultiplexedConnection, io_timeout: Duration) -> Self {
        Self { conn, io_timeout }
    }

    async fn query<T: FromRedisValue>(&mut self, cmd: &redis::Cmd) -> Result<T> {
        let io_timeout = self.io_timeout;
        match tokio::time::timeout(io_timeout, cmd.query_async(&mut self.conn)).await {
            Ok(reply) => reply.map_err(Error::from),
            Err(_) => Err(Error::StoreUnavailable(format!(
                "command timed out after {io_timeout:?}"
            ))),
        }
    }
}

#[async_trait]
impl KvConnection for RedisConnection {
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn set(&mut self, key: &str, value: &[u8], ttl_secs: Option<u64>) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl_secs {
            cmd.arg("EX").arg(ttl);
        }
        self.query(&cmd).await
    }

    async fn del(&mut self, key: &str) -> Result<bool> {
        let removed: u64 = self.query(redis::cmd("DEL").arg(key)).await?;
        Ok(removed > 0)
    }

    async fn exists(&mut self, key: &str) -> Result<bool> {
        let found: u64 = self.query(redis::cmd("EXISTS").arg(key)).await?;
        Ok(found > 0)
    }
}

/// Connects to the first reachable endpoint, rotating the starting endpoint
/// on every call.
pub struct RedisConnector {
    endpoints: Vec<(String, Client)>,
    next: AtomicUsize,
    io_timeout: Duration,
}

impl RedisConnector {
    /// Endpoints are `host:port` or full `redis://` URLs.
    pub fn new(endpoints: &[String], io_timeout: Duration) -> Result<Self> {
        let endpoints = endpoints
            .iter()
            .map(|endpoint| {
                let client = Client::open(endpoint_url(endpoint).as_str()).map_err(|e| {
                    Error::Config(format!("invalid session store endpoint '{endpoint}': {e}"))
                })?;
                Ok((endpoint.clone(), client))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            endpoints,
            next: AtomicUsize::new(0),
            io_timeout,
        })
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &str> {
        self.endpoints.iter().map(|(endpoint, _)| endpoint.as_str())
    }
}

fn endpoint_url(endpoint: &str) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("redis://{endpoint}")
    }
}

#[async_trait]
impl KvConnector for RedisConnector {
    type Connection = RedisConnection;

    async fn connect(&self) -> Result<Self::Connection> {
        if self.endpoints.is_empty() {
            return Err(Error::StoreUnavailable("no endpoints configured".to_string()));
        }

        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let mut last_error = String::new();
        for offset in 0..self.endpoints.len() {
            let (endpoint, client) = &self.endpoints[(start + offset) % self.endpoints.len()];
            match tokio::time::timeout(self.io_timeout, client.get_multiplexed_async_connection())
                .await
            {
                Ok(Ok(conn)) => {
                    debug!(endpoint = %endpoint, "Connected to session store");
                    return Ok(RedisConnection::new(conn, self.io_timeout));
                }
                Ok(Err(e)) => {
                    warn!(endpoint = %endpoint, error = %e, "Session store endpoint refused connection");
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!(endpoint = %endpoint, "Session store endpoint connect timed out");
                    last_error = format!("connect to {endpoint} timed out");
                }
            }
        }

        Err(Error::StoreUnavailable(format!(
            "no session store endpoint reachable: {last_error}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    /// Read one command as its list of arguments.
    async fn read_command(stream: &mut BufReader<TcpStream>) -> Option<Vec<String>> {
        let mut line = String::new();
        stream.read_line(&mut line).await.ok()?;
        let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;
        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            line.clear();
            stream.read_line(&mut line).await.ok()?;
            let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
            let mut buf = vec![0; len + 2];
            stream.read_exact(&mut buf).await.ok()?;
            buf.truncate(len);
            args.push(String::from_utf8_lossy(&buf).into_owned());
        }
        Some(args)
    }

    /// A peer that records each command and answers it with `reply(args)`.
    /// Connection setup commands are acknowledged and not recorded.
    async fn scripted_server(
        reply: fn(&[String]) -> &'static [u8],
    ) -> (String, tokio::sync::mpsc::UnboundedReceiver<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (seen, commands) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(stream);
            while let Some(args) = read_command(&mut stream).await {
                let out: &[u8] = if args[0].eq_ignore_ascii_case("CLIENT") {
                    b"+OK\r\n"
                } else {
                    let out = reply(&args);
                    seen.send(args).unwrap();
                    out
                };
                stream.get_mut().write_all(out).await.unwrap();
            }
        });
        (addr, commands)
    }

    async fn connect(addr: &str, io_timeout: Duration) -> RedisConnection {
        RedisConnector::new(&[addr.to_string()], io_timeout)
            .unwrap()
            .connect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_get_value_and_nil() {
        let (addr, mut commands) = scripted_server(|args| -> &'static [u8] {
            match args[1].as_str() {
                "present" => b"$5\r\nhello\r\n",
                _ => b"$-1\r\n",
            }
        })
        .await;
        let mut conn = connect(&addr, Duration::from_secs(1)).await;

        assert_eq!(conn.get("present").await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(conn.get("absent").await.unwrap(), None);
        assert_eq!(commands.recv().await.unwrap(), vec!["GET", "present"]);
    }

    #[tokio::test]
    async fn test_set_sends_expiry() {
        let (addr, mut commands) = scripted_server(|_| b"+OK\r\n").await;
        let mut conn = connect(&addr, Duration::from_secs(1)).await;

        conn.set("k", b"v", Some(30)).await.unwrap();
        conn.set("k", b"v", None).await.unwrap();
        assert_eq!(commands.recv().await.unwrap(), vec!["SET", "k", "v", "EX", "30"]);
        assert_eq!(commands.recv().await.unwrap(), vec!["SET", "k", "v"]);
    }

    #[tokio::test]
    async fn test_del_and_exists_read_counts() {
        let (addr, _commands) = scripted_server(|args| -> &'static [u8] {
            match args[0].as_str() {
                "DEL" => b":1\r\n",
                _ => b":0\r\n",
            }
        })
        .await;
        let mut conn = connect(&addr, Duration::from_secs(1)).await;

        assert!(conn.del("k").await.unwrap());
        assert!(!conn.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_server_error_is_recoverable() {
        let (addr, _commands) = scripted_server(|_| b"-LOADING dataset in memory\r\n").await;
        let mut conn = connect(&addr, Duration::from_secs(1)).await;

        let err = conn.get("k").await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_wrong_reply_type_is_protocol_error() {
        let (addr, _commands) = scripted_server(|_| b"+not-a-number\r\n").await;
        let mut conn = connect(&addr, Duration::from_secs(1)).await;

        assert!(matches!(conn.exists("k").await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _peer = tokio::spawn(async move {
            // Accept and hold the socket without ever replying
            let held = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(held);
        });

        // Depending on the handshake the stall shows up at connect or at the
        // first command
        let connector = RedisConnector::new(&[addr], Duration::from_millis(100)).unwrap();
        let err = match connector.connect().await {
            Ok(mut conn) => conn.get("k").await.unwrap_err(),
            Err(e) => e,
        };
        assert!(matches!(err, Error::StoreUnavailable(msg) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn test_connector_fails_over_to_next_endpoint() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap().to_string();
        drop(dead);

        let (live_addr, _commands) = scripted_server(|_| b":1\r\n").await;
        let connector =
            RedisConnector::new(&[dead_addr, live_addr], Duration::from_secs(1)).unwrap();
        let mut conn = connector.connect().await.unwrap();
        assert!(conn.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_connector_without_endpoints() {
        let connector = RedisConnector::new(&[], Duration::from_secs(1)).unwrap();
        assert!(matches!(
            connector.connect().await.err().unwrap(),
            Error::StoreUnavailable(_)
        ));
    }

    #[test]
    fn test_endpoint_urls() {
        assert_eq!(endpoint_url("10.0.0.1:6379"), "redis://10.0.0.1:6379");
        assert_eq!(endpoint_url("rediss://cache:6380/2"), "rediss://cache:6380/2");
        assert!(matches!(
            RedisConnector::new(&["redis://host:notaport".to_string()], Duration::from_secs(1)),
            Err(Error::Config(_))
        ));
    }
}
