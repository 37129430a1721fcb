use crate::core::Mutex;
use anyhow::Error;
use log::{debug, warn};
use rand::Rng;
use redis::{self, AsyncCommands, ToRedisArgs};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
#[error("timed out waiting for lock {0}")]
pub(crate) struct LockTimeout(pub String);

// Owner value while a released lock waits for a queued contender to claim it.
// Tokens are hex, so they never collide with it.
const HANDOFF: &str = "handoff";

// KEYS[1]: owner
// KEYS[2]: waiter count
// ARGV[1]: token
// ARGV[2]: valid duration (ms)
const ACQUIRE_MUTEX_SCRIPT: &str = r#"
if redis.call("SET", KEYS[1], ARGV[1], "NX", "PX", ARGV[2]) then
    return 1
end
redis.call("INCR", KEYS[2])
redis.call("PEXPIRE", KEYS[2], tonumber(ARGV[2], 10) * 2)
return 0
"#;

// KEYS[1]: owner
// KEYS[2]: waiter count
// KEYS[3]: queue
// ARGV[1]: token
// ARGV[2]: valid duration (ms)
// ARGV[3]: handoff marker
const CLAIM_MUTEX_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[3] then
    redis.call("SET", KEYS[1], ARGV[1], "PX", ARGV[2])
    return 1
end
return 0
"#;

// Same keys and args as the claim script. Runs when a queued contender stops
// blocking without a token: a token pushed since then is still honoured,
// otherwise the contender leaves the queue.
const GIVE_UP_MUTEX_SCRIPT: &str = r#"
if redis.call("LPOP", KEYS[3]) then
    if redis.call("GET", KEYS[1]) == ARGV[3] then
        redis.call("SET", KEYS[1], ARGV[1], "PX", ARGV[2])
        return 1
    end
    return 0
end
if tonumber(redis.call("GET", KEYS[2]) or "0", 10) > 0 then
    redis.call("DECR", KEYS[2])
end
return 0
"#;

// KEYS[1]: owner
// KEYS[2]: waiter count
// KEYS[3]: queue
// ARGV[1]: token
// ARGV[2]: valid duration (ms)
// ARGV[3]: handoff marker
const RELEASE_MUTEX_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) ~= ARGV[1] then
    return 0
end
if tonumber(redis.call("GET", KEYS[2]) or "0", 10) > 0 then
    redis.call("DECR", KEYS[2])
    redis.call("SET", KEYS[1], ARGV[3], "PX", ARGV[2])
    redis.call("RPUSH", KEYS[3], "lock")
    redis.call("PEXPIRE", KEYS[3], ARGV[2])
else
    redis.call("DEL", KEYS[1])
end
return 1
"#;

struct LockKeys {
    owner: String,
    waiters: String,
    queue: String,
}

impl LockKeys {
    fn new(key: impl Display) -> Self {
        Self {
            owner: format!("{}_owner", key),
            waiters: format!("{}_waiters", key),
            queue: format!("{}_queue", key),
        }
    }
}

fn new_token() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}

#[derive(Clone)]
pub(crate) struct RedisMutex {
    client: redis::Client,
    // seconds after which a held lock is considered abandoned
    expire: usize,
    // seconds to wait in the queue before giving up
    timeout: usize,
    // token of every lock this process holds, by key
    held: Arc<std::sync::Mutex<HashMap<String, String>>>,
}

pub(crate) trait RedisArg: ToRedisArgs + Display + Send + Sync {}

impl RedisArg for String {}

impl<T: RedisArg> RedisArg for &T {}

impl RedisMutex {
    pub fn new(client: redis::Client, expire: usize, timeout: usize) -> Self {
        Self {
            client,
            expire,
            timeout,
            held: Default::default(),
        }
    }

    fn expire_ms(&self) -> usize {
        self.expire.max(1) * 1000
    }

    fn held(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn acquire<K: RedisArg>(&self, key: K) -> Result<(), Error> {
        let keys = LockKeys::new(&key);
        let token = new_token();
        let expire_ms = self.expire_ms();
        let deadline = Instant::now() + Duration::from_secs(self.timeout as u64);
        let mut conn = self.client.get_async_connection().await?;
        loop {
            let acquired: bool = redis::Script::new(ACQUIRE_MUTEX_SCRIPT)
                .key(&keys.owner)
                .key(&keys.waiters)
                .arg(&token)
                .arg(expire_ms)
                .invoke_async(&mut conn)
                .await?;
            if acquired {
                break;
            }
            // an abandoned owner never hands off, so wake up at least once per expiry period
            let wait = deadline
                .saturating_duration_since(Instant::now())
                .as_secs()
                .clamp(1, self.expire.max(1) as u64) as usize;
            let popped: Option<(String, String)> = conn.brpop(&keys.queue, wait).await?;
            let script = if popped.is_some() { CLAIM_MUTEX_SCRIPT } else { GIVE_UP_MUTEX_SCRIPT };
            let claimed: bool = redis::Script::new(script)
                .key(&keys.owner)
                .key(&keys.waiters)
                .key(&keys.queue)
                .arg(&token)
                .arg(expire_ms)
                .arg(HANDOFF)
                .invoke_async(&mut conn)
                .await?;
            if claimed {
                break;
            }
            if Instant::now() >= deadline {
                return Err(LockTimeout(key.to_string()).into());
            }
        }
        self.held().insert(key.to_string(), token);
        Ok(())
    }

    async fn release<K: RedisArg>(&self, key: K) -> Result<(), Error> {
        let token = self.held().remove(&key.to_string());
        let token = match token {
            Some(token) => token,
            None => {
                debug!("lock {} is not held by this process", key);
                return Ok(());
            }
        };
        let keys = LockKeys::new(&key);
        let mut conn = self.client.get_async_connection().await?;
        let released: bool = redis::Script::new(RELEASE_MUTEX_SCRIPT)
            .key(&keys.owner)
            .key(&keys.waiters)
            .key(&keys.queue)
            .arg(&token)
            .arg(self.expire_ms())
            .arg(HANDOFF)
            .invoke_async(&mut conn)
            .await?;
        if !released {
            warn!("lock {} expired before it was released", key);
        }
        Ok(())
    }
}

impl<K: RedisArg> Mutex<K> for RedisMutex {
    fn multiple_acquire<'a>(&'a self, keys: &'a [K]) -> Pin<Box<dyn Future<Output = Result<(), Error>> + 'a>>
    where
        K: 'a,
    {
        Box::pin(async move {
            for i in 0..keys.len() {
                if let Err(e) = self.acquire(&keys[i]).await {
                    for key in &keys[..i] {
                        if let Err(re) = self.release(key).await {
                            warn!("failed to release lock {} after acquiring {} failed: {:#}", key, keys[i], re);
                        }
                    }
                    return Err(e);
                }
            }
            Ok(())
        })
    }

    fn multiple_release<'a>(&'a self, keys: &'a [K]) -> Pin<Box<dyn Future<Output = Result<(), Error>> + 'a>>
    where
        K: 'a,
    {
        Box::pin(async move {
            for key in keys {
                self.release(key).await?;
            }
            Ok(())
        })
    }

    fn single_acquire<'a>(&'a self, key: &'a K) -> Pin<Box<dyn Future<Output = Result<(), Error>> + 'a>>
    where
        K: 'a,
    {
        Box::pin(async move { self.acquire(key).await })
    }

    fn single_release<'a>(&'a self, key: &'a K) -> Pin<Box<dyn Future<Output = Result<(), Error>> + 'a>>
    where
        K: 'a,
    {
        Box::pin(async move { self.release(key).await })
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn client() -> redis::Client {
        redis::Client::open("redis://localhost").unwrap()
    }

    async fn reset(key: &str) {
        let keys = LockKeys::new(key);
        let mut conn = client().get_async_connection().await.unwrap();
        let _: () = conn.del(vec![keys.owner, keys.waiters, keys.queue]).await.unwrap();
    }

    async fn contend(mutex: &RedisMutex, key: &String, inside: &AtomicUsize, peak: &AtomicUsize) {
        for _ in 0..3 {
            mutex.single_acquire(key).await.unwrap();
            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            inside.fetch_sub(1, Ordering::SeqCst);
            mutex.single_release(key).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_release_without_acquire_is_noop() {
        // nothing held, so no connection is made
        let mutex = RedisMutex::new(redis::Client::open("redis://127.0.0.1:1").unwrap(), 1, 1);
        mutex.single_release(&"extra:1".to_owned()).await.unwrap();
    }

    // the tests below need a redis server on localhost

    #[tokio::test]
    #[ignore]
    async fn test_three_contenders_never_overlap() {
        reset("test:exclusion").await;
        let key = "test:exclusion".to_owned();
        let (a, b, c) = (RedisMutex::new(client(), 10, 10), RedisMutex::new(client(), 10, 10), RedisMutex::new(client(), 10, 10));
        let inside = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        futures::join!(
            contend(&a, &key, &inside, &peak),
            contend(&b, &key, &inside, &peak),
            contend(&c, &key, &inside, &peak)
        );
        assert_eq!(peak.load(Ordering::SeqCst), 1);

        let keys = LockKeys::new(&key);
        let mut conn = client().get_async_connection().await.unwrap();
        let owner: Option<String> = conn.get(&keys.owner).await.unwrap();
        assert_eq!(owner, None);
        let queued: usize = conn.llen(&keys.queue).await.unwrap();
        assert_eq!(queued, 0);
    }

    #[tokio::test]
    #[ignore]
    async fn test_uncontended_release_leaves_no_token() {
        reset("test:stale").await;
        let key = "test:stale".to_owned();
        let a = RedisMutex::new(client(), 10, 1);
        let b = RedisMutex::new(client(), 10, 1);
        let c = RedisMutex::new(client(), 10, 1);

        a.single_acquire(&key).await.unwrap();
        a.single_release(&key).await.unwrap();
        b.single_acquire(&key).await.unwrap();
        let err = c.single_acquire(&key).await.unwrap_err();
        assert!(err.downcast_ref::<LockTimeout>().is_some());

        let keys = LockKeys::new(&key);
        let mut conn = client().get_async_connection().await.unwrap();
        let waiters: Option<i64> = conn.get(&keys.waiters).await.unwrap();
        assert_eq!(waiters.unwrap_or(0), 0);
        b.single_release(&key).await.unwrap();
        let queued: usize = conn.llen(&keys.queue).await.unwrap();
        assert_eq!(queued, 0);
    }

    #[tokio::test]
    #[ignore]
    async fn test_waiter_takes_over_on_release() {
        reset("test:handoff").await;
        let key = "test:handoff".to_owned();
        let a = RedisMutex::new(client(), 10, 5);
        let b = RedisMutex::new(client(), 10, 5);
        let c = RedisMutex::new(client(), 10, 1);

        a.single_acquire(&key).await.unwrap();
        let release_later = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            a.single_release(&key).await.unwrap();
        };
        let (acquired, _) = futures::join!(b.single_acquire(&key), release_later);
        acquired.unwrap();

        // b owns the lock now, a newcomer must not slip in
        assert!(c.single_acquire(&key).await.is_err());
        b.single_release(&key).await.unwrap();
        c.single_acquire(&key).await.unwrap();
        c.single_release(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_rollback_keeps_acquire_error() {
        reset("test:rollback-a").await;
        reset("test:rollback-b").await;
        let holder = RedisMutex::new(client(), 10, 1);
        let mutex = RedisMutex::new(client(), 10, 1);
        let taken = "test:rollback-b".to_owned();
        holder.single_acquire(&taken).await.unwrap();

        // turn a's owner key into a list while b is awaited, so releasing a fails
        let sabotage = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let owner = LockKeys::new("test:rollback-a").owner;
            let mut conn = client().get_async_connection().await.unwrap();
            let _: () = conn.del(&owner).await.unwrap();
            let _: () = conn.rpush(&owner, "x").await.unwrap();
        };
        let keys = vec!["test:rollback-a".to_owned(), taken.clone()];
        let (res, _) = futures::join!(mutex.multiple_acquire(&keys), sabotage);
        assert!(res.unwrap_err().downcast_ref::<LockTimeout>().is_some());

        holder.single_release(&taken).await.unwrap();
        reset("test:rollback-a").await;
    }
}
