//! Embedded Redis-compatible server.
//!
//! [`EmbeddedServer`] speaks enough RESP2 for [`RedisCache`]: it listens on
//! an ephemeral loopback port, requires a password generated at startup,
//! and keeps everything in memory. [`EmbeddedCache`] pairs it with a client
//! so a deployment needs no external cache server.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use model::{CacheKey, CacheVersion};
use rand::Rng;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{CacheError, CachedContent, RedisCache, RedisCacheConfig, VersionedCache};

/// Characters used in generated passwords.
const PASSWORD_ALPHABET: &[u8] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz-_";

/// Length of generated passwords.
pub const PASSWORD_LENGTH: usize = 32;

/// Largest accepted bulk string.
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Largest accepted number of arguments in one command.
const MAX_ARGS: usize = 1024 * 1024;

/// Size limits for one command.
#[derive(Debug, Clone, Copy)]
struct Limits {
    max_args: usize,
    max_bulk_len: usize,
}

impl Limits {
    /// Before `AUTH` succeeds a client may only send small commands.
    const UNAUTHENTICATED: Limits = Limits {
        max_args: 10,
        max_bulk_len: 16 * 1024,
    };

    const AUTHENTICATED: Limits = Limits {
        max_args: MAX_ARGS,
        max_bulk_len: MAX_BULK_LEN,
    };
}

/// Generate a random password from [`PASSWORD_ALPHABET`].
pub fn generate_password() -> String {
    let mut rng = rand::thread_rng();
    (0..PASSWORD_LENGTH)
        .map(|_| PASSWORD_ALPHABET[rng.gen_range(0..PASSWORD_ALPHABET.len())] as char)
        .collect()
}

type Store = Arc<RwLock<HashMap<Vec<u8>, Bytes>>>;

/// In-process server bound to the loopback interface.
pub struct EmbeddedServer {
    addr: SocketAddr,
    password: String,
    store: Store,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EmbeddedServer {
    /// Bind to an ephemeral loopback port and start serving.
    pub async fn start(password: String) -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let store = Store::default();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(accept_loop(
            listener,
            store.clone(),
            password.clone(),
            shutdown.clone(),
        ));

        info!(%addr, "Embedded cache server listening");
        Ok(Self {
            addr,
            password,
            store,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.store.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting, close every connection and wait for the server to
    /// finish. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Embedded cache server task failed");
            }
            info!(addr = %self.addr, "Embedded cache server stopped");
        }
    }
}

impl Drop for EmbeddedServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, store: Store, password: String, shutdown: CancellationToken) {
    let tracker = TaskTracker::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Embedded cache connection accepted");
                    let store = store.clone();
                    let password = password.clone();
                    let shutdown = shutdown.clone();
                    tracker.spawn(async move {
                        tokio::select! {
                            _ = shutdown.cancelled() => {}
                            result = serve_connection(stream, store, password) => {
                                if let Err(e) = result {
                                    debug!(%peer, error = %e, "Embedded cache connection closed with error");
                                }
                            }
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Embedded cache accept failed"),
            },
        }
    }

    tracker.close();
    tracker.wait().await;
}

/// Per-connection state.
struct Session {
    store: Store,
    password: String,
    authenticated: bool,
}

/// Outcome of one command.
enum Flow {
    Continue,
    Quit,
}

async fn serve_connection(stream: TcpStream, store: Store, password: String) -> io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut session = Session {
        store,
        password,
        authenticated: false,
    };

    loop {
        let limits = if session.authenticated {
            Limits::AUTHENTICATED
        } else {
            Limits::UNAUTHENTICATED
        };
        let command = match read_command(&mut reader, limits).await {
            Ok(Some(command)) => command,
            Ok(None) => return Ok(()),
            Err(RespError::Protocol(message)) => {
                let mut out = Vec::new();
                reply_error(&mut out, &format!("ERR Protocol error: {}", message));
                write_half.write_all(&out).await?;
                return Ok(());
            }
            Err(RespError::Io(e)) => return Err(e),
        };

        let mut out = Vec::new();
        let flow = session.execute(&command, &mut out);
        write_half.write_all(&out).await?;

        if let Flow::Quit = flow {
            write_half.shutdown().await?;
            return Ok(());
        }
    }
}

#[derive(Debug)]
enum RespError {
    Io(io::Error),
    Protocol(String),
}

impl From<io::Error> for RespError {
    fn from(e: io::Error) -> Self {
        RespError::Io(e)
    }
}

/// Read one line without its trailing CRLF. `None` at end of stream.
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>, RespError> {
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line).await? == 0 {
        return Ok(None);
    }
    if !line.ends_with(b"\r\n") {
        return Err(RespError::Protocol("expected CRLF".to_string()));
    }
    line.truncate(line.len() - 2);
    Ok(Some(line))
}

fn parse_len(line: &[u8], marker: u8, max: usize) -> Result<usize, RespError> {
    let digits = match line.split_first() {
        Some((&first, rest)) if first == marker => rest,
        _ => {
            return Err(RespError::Protocol(format!(
                "expected '{}', got {:?}",
                marker as char,
                String::from_utf8_lossy(line)
            )))
        }
    };
    let len = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| RespError::Protocol("invalid length".to_string()))?;
    if len > max {
        return Err(RespError::Protocol("length out of range".to_string()));
    }
    Ok(len)
}

/// Read one command: an array of bulk strings.
async fn read_command<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    limits: Limits,
) -> Result<Option<Vec<Vec<u8>>>, RespError> {
    let Some(header) = read_line(reader).await? else {
        return Ok(None);
    };
    let count = parse_len(&header, b'*', limits.max_args)?;

    let mut args = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let line = read_line(reader)
            .await?
            .ok_or_else(|| RespError::Protocol("unexpected end of stream".to_string()))?;
        let len = parse_len(&line, b'$', limits.max_bulk_len)?;

        let mut arg = vec![0; len + 2];
        reader.read_exact(&mut arg).await?;
        if !arg.ends_with(b"\r\n") {
            return Err(RespError::Protocol("expected CRLF after bulk string".to_string()));
        }
        arg.truncate(len);
        args.push(arg);
    }

    Ok(Some(args))
}

fn reply_simple(out: &mut Vec<u8>, s: &str) {
    out.push(b'+');
    out.extend_from_slice(s.as_bytes());
    out.extend_from_slice(b"\r\n");
}

fn reply_error(out: &mut Vec<u8>, s: &str) {
    out.push(b'-');
    out.extend_from_slice(s.as_bytes());
    out.extend_from_slice(b"\r\n");
}

fn reply_integer(out: &mut Vec<u8>, n: usize) {
    out.extend_from_slice(format!(":{}\r\n", n).as_bytes());
}

fn reply_bulk(out: &mut Vec<u8>, value: Option<&[u8]>) {
    match value {
        Some(value) => {
            out.extend_from_slice(format!("${}\r\n", value.len()).as_bytes());
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        None => out.extend_from_slice(b"$-1\r\n"),
    }
}

fn reply_array_len(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(format!("*{}\r\n", len).as_bytes());
}

fn wrong_arity(out: &mut Vec<u8>, name: &str) {
    reply_error(
        out,
        &format!("ERR wrong number of arguments for '{}' command", name),
    );
}

impl Session {
    fn execute(&mut self, command: &[Vec<u8>], out: &mut Vec<u8>) -> Flow {
        let Some((name, args)) = command.split_first() else {
            reply_error(out, "ERR empty command");
            return Flow::Continue;
        };
        let name = String::from_utf8_lossy(name).to_ascii_lowercase();

        if !self.authenticated && !matches!(name.as_str(), "auth" | "quit") {
            reply_error(out, "NOAUTH Authentication required.");
            return Flow::Continue;
        }

        match name.as_str() {
            "auth" => {
                // AUTH password, or AUTH username password.
                let password = match args {
                    [password] | [_, password] => password,
                    _ => {
                        wrong_arity(out, &name);
                        return Flow::Continue;
                    }
                };
                if password.as_slice() == self.password.as_bytes() {
                    self.authenticated = true;
                    reply_simple(out, "OK");
                } else {
                    reply_error(
                        out,
                        "WRONGPASS invalid username-password pair or user is disabled.",
                    );
                }
            }
            "ping" => match args {
                [] => reply_simple(out, "PONG"),
                [message] => reply_bulk(out, Some(message.as_slice())),
                _ => wrong_arity(out, &name),
            },
            "quit" => {
                reply_simple(out, "OK");
                return Flow::Quit;
            }
            "select" => match args {
                [db] if db.as_slice() == b"0" => reply_simple(out, "OK"),
                [_] => reply_error(out, "ERR DB index is out of range"),
                _ => wrong_arity(out, &name),
            },
            // Connection metadata such as CLIENT SETINFO is accepted and ignored.
            "client" => reply_simple(out, "OK"),
            "get" => match args {
                [key] => {
                    let store = self.store.read().unwrap_or_else(PoisonError::into_inner);
                    reply_bulk(out, store.get(key).map(|v| v.as_ref()));
                }
                _ => wrong_arity(out, &name),
            },
            "set" => match args {
                [key, value] => {
                    let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
                    store.insert(key.clone(), Bytes::copy_from_slice(value));
                    reply_simple(out, "OK");
                }
                [_, _, ..] => reply_error(out, "ERR syntax error"),
                _ => wrong_arity(out, &name),
            },
            "mget" => {
                if args.is_empty() {
                    wrong_arity(out, &name);
                } else {
                    let store = self.store.read().unwrap_or_else(PoisonError::into_inner);
                    reply_array_len(out, args.len());
                    for key in args {
                        reply_bulk(out, store.get(key).map(|v| v.as_ref()));
                    }
                }
            }
            "mset" => {
                if args.is_empty() || args.len() % 2 != 0 {
                    wrong_arity(out, &name);
                } else {
                    // One write lock for all pairs: readers see all or none.
                    let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
                    for pair in args.chunks_exact(2) {
                        store.insert(pair[0].clone(), Bytes::copy_from_slice(&pair[1]));
                    }
                    reply_simple(out, "OK");
                }
            }
            "del" => {
                if args.is_empty() {
                    wrong_arity(out, &name);
                } else {
                    let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
                    let removed = args.iter().filter(|key| store.remove(*key).is_some()).count();
                    reply_integer(out, removed);
                }
            }
            "exists" => {
                if args.is_empty() {
                    wrong_arity(out, &name);
                } else {
                    let store = self.store.read().unwrap_or_else(PoisonError::into_inner);
                    let found = args.iter().filter(|key| store.contains_key(*key)).count();
                    reply_integer(out, found);
                }
            }
            _ => reply_error(out, &format!("ERR unknown command '{}'", name)),
        }

        Flow::Continue
    }
}

/// [`RedisCache`] backed by its own [`EmbeddedServer`].
pub struct EmbeddedCache {
    client: RedisCache,
    server: EmbeddedServer,
}

impl EmbeddedCache {
    /// Start a server with a fresh password and connect to it.
    pub async fn start(prefix: &str) -> Result<Self, CacheError> {
        let server = EmbeddedServer::start(generate_password())
            .await
            .map_err(|e| CacheError::io("start embedded cache server", e))?;

        let config = RedisCacheConfig {
            address: server.addr().to_string(),
            password: Some(server.password().to_string()),
            prefix: prefix.to_string(),
        };
        let client = match RedisCache::connect(&config).await {
            Ok(client) => client,
            Err(e) => {
                server.shutdown().await;
                return Err(e);
            }
        };

        Ok(Self { client, server })
    }

    pub fn server(&self) -> &EmbeddedServer {
        &self.server
    }
}

impl VersionedCache for EmbeddedCache {
    async fn put(
        &self,
        key: &CacheKey,
        version: &CacheVersion,
        value: Bytes,
    ) -> Result<(), CacheError> {
        self.client.put(key, version, value).await
    }

    async fn get(
        &self,
        key: &CacheKey,
        version: &CacheVersion,
    ) -> Result<Option<Bytes>, CacheError> {
        self.client.get(key, version).await
    }

    /// Served from memory, like [`RedisCache`].
    async fn get_content(
        &self,
        key: &CacheKey,
        version: &CacheVersion,
        content_type: &str,
    ) -> Result<Option<CachedContent>, CacheError> {
        self.client.get_content(key, version, content_type).await
    }

    /// Close the client, then stop the server. Idempotent.
    async fn close(&self) -> Result<(), CacheError> {
        self.client.close().await?;
        self.server.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn encode(args: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        reply_array_len(&mut out, args.len());
        for arg in args {
            reply_bulk(&mut out, Some(*arg));
        }
        out
    }

    async fn roundtrip(stream: &mut BufReader<TcpStream>, args: &[&[u8]]) -> Vec<u8> {
        stream.get_mut().write_all(&encode(args)).await.unwrap();
        let mut line = Vec::new();
        stream.read_until(b'\n', &mut line).await.unwrap();
        line
    }

    #[test]
    fn test_generate_password() {
        let a = generate_password();
        let b = generate_password();
        assert_eq!(a.len(), PASSWORD_LENGTH);
        assert!(a.bytes().all(|c| PASSWORD_ALPHABET.contains(&c)));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_read_command() {
        let input = encode(&[b"MSET", b"k", b"v\r\n1"]);
        let mut reader = BufReader::new(&input[..]);
        let command = read_command(&mut reader, Limits::AUTHENTICATED)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(command, vec![b"MSET".to_vec(), b"k".to_vec(), b"v\r\n1".to_vec()]);
        assert!(read_command(&mut reader, Limits::AUTHENTICATED)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_read_command_rejects_inline() {
        let mut reader = BufReader::new(&b"PING\r\n"[..]);
        assert!(matches!(
            read_command(&mut reader, Limits::AUTHENTICATED).await,
            Err(RespError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_read_command_unauthenticated_limits() {
        let args = vec![&b"x"[..]; 11];
        let input = encode(&args);
        let mut reader = BufReader::new(&input[..]);
        assert!(matches!(
            read_command(&mut reader, Limits::UNAUTHENTICATED).await,
            Err(RespError::Protocol(_))
        ));

        let big = vec![b'a'; 16 * 1024 + 1];
        let input = encode(&[&b"AUTH"[..], &big[..]]);
        let mut reader = BufReader::new(&input[..]);
        assert!(matches!(
            read_command(&mut reader, Limits::UNAUTHENTICATED).await,
            Err(RespError::Protocol(_))
        ));

        let mut reader = BufReader::new(&input[..]);
        let command = read_command(&mut reader, Limits::AUTHENTICATED)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(command[1].len(), big.len());
    }

    #[test]
    fn test_session_requires_auth() {
        let mut session = Session {
            store: Store::default(),
            password: "secret".to_string(),
            authenticated: false,
        };
        let mut out = Vec::new();

        session.execute(&[b"GET".to_vec(), b"k".to_vec()], &mut out);
        assert!(out.starts_with(b"-NOAUTH"));

        out.clear();
        session.execute(&[b"AUTH".to_vec(), b"wrong".to_vec()], &mut out);
        assert!(out.starts_with(b"-WRONGPASS"));

        out.clear();
        session.execute(&[b"auth".to_vec(), b"secret".to_vec()], &mut out);
        assert_eq!(out, b"+OK\r\n");

        out.clear();
        session.execute(&[b"GET".to_vec(), b"k".to_vec()], &mut out);
        assert_eq!(out, b"$-1\r\n");
    }

    #[test]
    fn test_session_mset_mget() {
        let mut session = Session {
            store: Store::default(),
            password: String::new(),
            authenticated: true,
        };
        let mut out = Vec::new();

        session.execute(
            &[b"MSET".to_vec(), b"a".to_vec(), b"1".to_vec(), b"b".to_vec(), b"2".to_vec()],
            &mut out,
        );
        assert_eq!(out, b"+OK\r\n");

        out.clear();
        session.execute(&[b"MGET".to_vec(), b"b".to_vec(), b"x".to_vec(), b"a".to_vec()], &mut out);
        assert_eq!(out, b"*3\r\n$1\r\n2\r\n$-1\r\n$1\r\n1\r\n");

        out.clear();
        session.execute(&[b"MSET".to_vec(), b"a".to_vec()], &mut out);
        assert!(out.starts_with(b"-ERR wrong number of arguments"));

        out.clear();
        session.execute(&[b"DEL".to_vec(), b"a".to_vec(), b"x".to_vec()], &mut out);
        assert_eq!(out, b":1\r\n");

        out.clear();
        session.execute(&[b"EXISTS".to_vec(), b"a".to_vec(), b"b".to_vec()], &mut out);
        assert_eq!(out, b":1\r\n");

        out.clear();
        session.execute(&[b"FLUSHALL".to_vec()], &mut out);
        assert!(out.starts_with(b"-ERR unknown command"));
    }

    #[tokio::test]
    async fn test_server_over_tcp() {
        let server = EmbeddedServer::start("pw".to_string()).await.unwrap();
        assert!(server.addr().ip().is_loopback());

        let stream = TcpStream::connect(server.addr()).await.unwrap();
        let mut stream = BufReader::new(stream);

        assert!(roundtrip(&mut stream, &[b"SET", b"k", b"v"]).await.starts_with(b"-NOAUTH"));
        assert_eq!(roundtrip(&mut stream, &[b"AUTH", b"pw"]).await, b"+OK\r\n");
        assert_eq!(roundtrip(&mut stream, &[b"SET", b"k", b"v"]).await, b"+OK\r\n");
        assert_eq!(roundtrip(&mut stream, &[b"PING"]).await, b"+PONG\r\n");
        assert_eq!(server.len(), 1);

        server.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_server_drops_oversized_command_before_auth() {
        let server = EmbeddedServer::start("pw".to_string()).await.unwrap();
        let stream = TcpStream::connect(server.addr()).await.unwrap();
        let mut stream = BufReader::new(stream);

        // The header alone is rejected, nothing after it is read.
        stream.get_mut().write_all(b"*11\r\n").await.unwrap();
        let mut reply = Vec::new();
        stream.read_until(b'\n', &mut reply).await.unwrap();
        assert!(reply.starts_with(b"-ERR Protocol error"));
        assert_eq!(server.len(), 0);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_lost_server_is_miss_on_read_and_error_on_write() {
        let cache = EmbeddedCache::start("p:").await.unwrap();
        let k = CacheKey::new(&("k",)).unwrap();
        let v = CacheVersion::from_bytes("v");

        cache.put(&k, &v, Bytes::from_static(b"value")).await.unwrap();
        cache.server().shutdown().await;

        assert_eq!(cache.get(&k, &v).await.unwrap(), None);
        assert!(matches!(
            cache.put(&k, &v, Bytes::from_static(b"again")).await,
            Err(CacheError::BackendUnavailable(_))
        ));

        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_embedded_cache_close_stops_server() {
        let cache = EmbeddedCache::start("p:").await.unwrap();
        let addr = cache.server().addr();
        let k = CacheKey::new(&("k",)).unwrap();
        let v = CacheVersion::from_bytes("v");

        cache.put(&k, &v, Bytes::from_static(b"value")).await.unwrap();
        assert_eq!(cache.get(&k, &v).await.unwrap().unwrap(), &b"value"[..]);
        // Value and version keys.
        assert_eq!(cache.server().len(), 2);

        cache.close().await.unwrap();
        cache.close().await.unwrap();

        assert!(matches!(cache.get(&k, &v).await, Err(CacheError::Closed)));
        assert!(matches!(
            cache.put(&k, &v, Bytes::new()).await,
            Err(CacheError::Closed)
        ));
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
