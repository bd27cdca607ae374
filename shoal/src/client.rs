//! The client facade.
//!
//! # Example
//!
//! ```no_run
//! use shoal::{Config, MemcacheClient};
//!
//! async fn example() -> Result<(), shoal::Error> {
//!     let config = Config::builder()
//!         .server("127.0.0.1:11211".parse().unwrap())
//!         .server("127.0.0.1:11212".parse().unwrap())
//!         .build()?;
//!     let client = MemcacheClient::new(config);
//!     client.await_connected().await?;
//!
//!     client.set("hello", "world", 0).await?;
//!     let value = client.get("hello").await?;
//!     assert_eq!(value.unwrap().data.as_ref(), b"world");
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use tokio::time::timeout;

use shoal_protocol::MemcacheStatus;

use crate::config::{Config, Dialect};
use crate::connection::ConnectionHandle;
use crate::error::Error;
use crate::request::{GetValue, Operation, Reply, Request, Value, merge_statuses};
use crate::router::Router;

/// Longest key the protocol accepts.
const MAX_KEY_LEN: usize = 250;

struct Inner {
    router: Router,
    config: Arc<Config>,
}

/// An asynchronous, sharded memcache client.
///
/// Cloning is cheap and shares the underlying connections. Dropping the
/// last clone drains in-flight requests and closes every connection.
#[derive(Clone)]
pub struct MemcacheClient {
    inner: Arc<Inner>,
}

impl MemcacheClient {
    /// Start connecting to every configured server in the background and
    /// return immediately. Use [`await_connected`](Self::await_connected)
    /// to block until the cluster is usable.
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let router = Router::new(config.clone());
        Self {
            inner: Arc::new(Inner { router, config }),
        }
    }

    /// Wait until at least one shard is ready, or fail fast if a shard's
    /// handshake hit an authentication error.
    pub async fn await_connected(&self) -> Result<(), Error> {
        let deadline = self.inner.config.connect_timeout * self.shard_count() as u32;
        timeout(deadline, self.inner.router.wait_any_ready())
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Wait until every shard is ready.
    pub async fn await_fully_connected(&self) -> Result<(), Error> {
        let deadline = self.inner.config.connect_timeout * self.shard_count() as u32;
        timeout(deadline, self.inner.router.wait_all_ready())
            .await
            .map_err(|_| Error::Timeout)?
    }

    pub fn shard_count(&self) -> usize {
        self.inner.router.shard_count()
    }

    /// Retrieve a value. A miss is `Ok(None)`, not an error.
    pub async fn get(&self, key: impl Into<Bytes>) -> Result<Option<Value>, Error> {
        let key = checked_key(key)?;
        match self.perform(Operation::Get { key }).await? {
            Reply::Value(value) => Ok(value),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Retrieve several values with their CAS tokens. All keys must hash
    /// to the same shard. Missing keys are simply absent from the result.
    pub async fn gets(&self, keys: &[&[u8]]) -> Result<Vec<GetValue>, Error> {
        let keys: Vec<Bytes> = keys
            .iter()
            .map(|&key| checked_key(Bytes::copy_from_slice(key)))
            .collect::<Result<_, _>>()?;
        let shard = self.inner.router.route_same(&keys)?;
        let dialect = self.inner.config.dialect;

        match dialect {
            Dialect::Ascii => {
                let request = Request::new(Operation::Gets { keys }, dialect);
                match self.submit(shard, request).await? {
                    Reply::Values(values) => Ok(values),
                    other => Err(unexpected_reply(other)),
                }
            }
            Dialect::Binary => {
                // No multi-key frame in this dialect: pipeline one keyed
                // get per key on the owning shard and stitch the results.
                let submits = keys.into_iter().map(|key| {
                    let request = Request::new(Operation::GetWithCas { key }, dialect);
                    let shard = shard.clone();
                    async move { shard.submit(request).await }
                });
                let replies = timeout(self.inner.config.request_timeout, join_all(submits))
                    .await
                    .map_err(|_| Error::Timeout)?;
                let mut values = Vec::new();
                for reply in replies {
                    match reply? {
                        Reply::Values(found) => values.extend(found),
                        other => return Err(unexpected_reply(other)),
                    }
                }
                Ok(values)
            }
        }
    }

    /// Store a value unconditionally.
    pub async fn set(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        ttl: i64,
    ) -> Result<MemcacheStatus, Error> {
        self.set_with_flags(key, value, ttl, 0).await
    }

    /// Store a value with opaque client flags.
    pub async fn set_with_flags(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        ttl: i64,
        flags: u32,
    ) -> Result<MemcacheStatus, Error> {
        let key = checked_key(key)?;
        self.status(Operation::Set {
            key,
            value: value.into(),
            flags,
            ttl,
        })
        .await
    }

    /// Store a value only if the key does not exist.
    pub async fn add(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        ttl: i64,
    ) -> Result<MemcacheStatus, Error> {
        let key = checked_key(key)?;
        self.status(Operation::Add {
            key,
            value: value.into(),
            flags: 0,
            ttl,
        })
        .await
    }

    /// Store a value only if the key already exists.
    pub async fn replace(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        ttl: i64,
    ) -> Result<MemcacheStatus, Error> {
        let key = checked_key(key)?;
        self.status(Operation::Replace {
            key,
            value: value.into(),
            flags: 0,
            ttl,
        })
        .await
    }

    pub async fn append(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<MemcacheStatus, Error> {
        let key = checked_key(key)?;
        self.status(Operation::Append {
            key,
            value: value.into(),
        })
        .await
    }

    pub async fn prepend(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<MemcacheStatus, Error> {
        let key = checked_key(key)?;
        self.status(Operation::Prepend {
            key,
            value: value.into(),
        })
        .await
    }

    /// Store a value only if it has not changed since the CAS token was
    /// read. [`MemcacheStatus::Exists`] means someone else got there
    /// first.
    pub async fn cas(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        ttl: i64,
        cas: u64,
    ) -> Result<MemcacheStatus, Error> {
        let key = checked_key(key)?;
        self.status(Operation::Cas {
            key,
            value: value.into(),
            flags: 0,
            ttl,
            cas,
        })
        .await
    }

    pub async fn delete(&self, key: impl Into<Bytes>) -> Result<MemcacheStatus, Error> {
        let key = checked_key(key)?;
        self.status(Operation::Delete { key }).await
    }

    /// Increment a counter. `Ok(None)` means the key does not exist;
    /// counters are never auto-created.
    pub async fn incr(&self, key: impl Into<Bytes>, delta: u64) -> Result<Option<u64>, Error> {
        let key = checked_key(key)?;
        match self.perform(Operation::Incr { key, delta }).await? {
            Reply::Counter(counter) => Ok(counter),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Decrement a counter; saturates at zero on the server.
    pub async fn decr(&self, key: impl Into<Bytes>, delta: u64) -> Result<Option<u64>, Error> {
        let key = checked_key(key)?;
        match self.perform(Operation::Decr { key, delta }).await? {
            Reply::Counter(counter) => Ok(counter),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Update a value's TTL without touching its data.
    pub async fn touch(&self, key: impl Into<Bytes>, ttl: i64) -> Result<MemcacheStatus, Error> {
        let key = checked_key(key)?;
        self.status(Operation::Touch { key, ttl }).await
    }

    /// Invalidate every item on every ready shard. A positive delay
    /// staggers the flush; zero or negative flushes immediately.
    ///
    /// The merged result is Ok iff every shard reported Ok; otherwise the
    /// first non-Ok status in shard order. A shard that fails locally
    /// fails the whole broadcast.
    pub async fn flush_all(&self, delay: i64) -> Result<MemcacheStatus, Error> {
        let shards = self.inner.router.route_all()?;
        let request = Request::new(Operation::FlushAll { delay }, self.inner.config.dialect);

        let submits = shards.iter().map(|shard| {
            let request = request.duplicate();
            async move { shard.submit(request).await }
        });
        let replies = timeout(self.inner.config.request_timeout, join_all(submits))
            .await
            .map_err(|_| Error::Timeout)?;

        merge_statuses(replies.into_iter().map(|reply| match reply? {
            Reply::Status(status) => Ok(status),
            other => Err(unexpected_reply(other)),
        }))
    }

    /// Ask every ready shard for its server version.
    pub async fn version(&self) -> Result<Vec<(SocketAddr, String)>, Error> {
        let shards = self.inner.router.route_all()?;
        let request = Request::new(Operation::Version, self.inner.config.dialect);

        let submits = shards.iter().map(|shard| {
            let request = request.duplicate();
            async move { (shard.addr, shard.submit(request).await) }
        });
        let replies = timeout(self.inner.config.request_timeout, join_all(submits))
            .await
            .map_err(|_| Error::Timeout)?;

        replies
            .into_iter()
            .map(|(addr, reply)| match reply? {
                Reply::Version(version) => Ok((addr, version)),
                other => Err(unexpected_reply(other)),
            })
            .collect()
    }

    /// Route, submit, and await one keyed operation under the request
    /// timeout.
    async fn perform(&self, op: Operation) -> Result<Reply, Error> {
        let key = op
            .routing_key()
            .ok_or_else(|| Error::Config("operation has no routing key".into()))?;
        let shard = self.inner.router.route(key)?;
        let request = Request::new(op, self.inner.config.dialect);
        self.submit(shard, request).await
    }

    async fn submit(&self, shard: ConnectionHandle, request: Request) -> Result<Reply, Error> {
        // On timeout the reply slot is dropped; the connection still
        // consumes the response frame to stay synchronized.
        match timeout(self.inner.config.request_timeout, shard.submit(request)).await {
            Ok(reply) => reply,
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn status(&self, op: Operation) -> Result<MemcacheStatus, Error> {
        match self.perform(op).await? {
            Reply::Status(status) => Ok(status),
            other => Err(unexpected_reply(other)),
        }
    }
}

fn unexpected_reply(reply: Reply) -> Error {
    Error::Protocol(format!("reply shape mismatch: {reply:?}"))
}

/// Keys ride inside the wire framing, so a malformed key would corrupt
/// the conversation for every pipelined request behind it. Reject before
/// submission.
fn checked_key(key: impl Into<Bytes>) -> Result<Bytes, Error> {
    let key = key.into();
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(Error::Config(format!(
            "key length {} outside 1..={MAX_KEY_LEN}",
            key.len()
        )));
    }
    if key.iter().any(|b| *b <= b' ' || *b == 0x7f) {
        return Err(Error::Config(
            "key contains whitespace or control bytes".into(),
        ));
    }
    Ok(key)
}
