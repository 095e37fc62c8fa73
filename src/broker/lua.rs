//! Lua scripts applying each job transition atomically on the server.
//!
//! Job records are serialized in Rust; the scripts only move ids between
//! the per-queue structures and swap records under a guard:
//! - claims compare the record read by the caller (`expected`)
//! - settlements compare the lease token held in `owners`
//!
//! A script that returns `0` lost a race and changed nothing.

use redis::Script;

/// KEYS: jobs, wait, delayed
/// ARGV: id, record, delayed flag, run-at millis
///
/// Returns the existing record when the id is taken, nil when stored.
const ENQUEUE: &str = r#"
if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 0 then
  return redis.call('HGET', KEYS[1], ARGV[1])
end
if ARGV[3] == '1' then
  redis.call('ZADD', KEYS[3], ARGV[4], ARGV[1])
else
  redis.call('LPUSH', KEYS[2], ARGV[1])
end
return false
"#;

/// KEYS: paused, wait, active, leases, owners, jobs
/// ARGV: id, expected record, active record, lease expiry millis, token
///
/// Returns -1 when the queue is paused.
const CLAIM: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return -1
end
if redis.call('HGET', KEYS[6], ARGV[1]) ~= ARGV[2] then
  return 0
end
if redis.call('LREM', KEYS[2], -1, ARGV[1]) == 0 then
  return 0
end
redis.call('LPUSH', KEYS[3], ARGV[1])
redis.call('ZADD', KEYS[4], ARGV[4], ARGV[1])
redis.call('HSET', KEYS[5], ARGV[1], ARGV[5])
redis.call('HSET', KEYS[6], ARGV[1], ARGV[3])
return 1
"#;

/// KEYS: delayed, wait, jobs
/// ARGV: id, expected record, waiting record
const PROMOTE: &str = r#"
if redis.call('HGET', KEYS[3], ARGV[1]) ~= ARGV[2] then
  return 0
end
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[3], ARGV[1], ARGV[3])
redis.call('LPUSH', KEYS[2], ARGV[1])
return 1
"#;

/// KEYS: leases, active, owners, jobs, delayed
/// ARGV: id, expected record, delayed record, now millis
///
/// Only fires while the lease is still registered and expired.
const RECOVER: &str = r#"
local expiry = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not expiry or tonumber(expiry) > tonumber(ARGV[4]) then
  return 0
end
if redis.call('HGET', KEYS[4], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('LREM', KEYS[2], 1, ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('HSET', KEYS[4], ARGV[1], ARGV[3])
redis.call('ZADD', KEYS[5], ARGV[4], ARGV[1])
return 1
"#;

/// KEYS: leases, active, owners, jobs, completed or failed list
/// ARGV: id, token, final record, keep (-1 keeps everything)
const FINISH: &str = r#"
if redis.call('HGET', KEYS[3], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('LREM', KEYS[2], 1, ARGV[1])
redis.call('HSET', KEYS[4], ARGV[1], ARGV[3])
redis.call('LPUSH', KEYS[5], ARGV[1])
local keep = tonumber(ARGV[4])
if keep >= 0 then
  local stale = redis.call('LRANGE', KEYS[5], keep, -1)
  for _, id in ipairs(stale) do
    redis.call('HDEL', KEYS[4], id)
  end
  if keep == 0 then
    redis.call('DEL', KEYS[5])
  else
    redis.call('LTRIM', KEYS[5], 0, keep - 1)
  end
end
return 1
"#;

/// KEYS: leases, active, owners, jobs, delayed
/// ARGV: id, token, delayed record, run-at millis
const REQUEUE: &str = r#"
if redis.call('HGET', KEYS[3], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('LREM', KEYS[2], 1, ARGV[1])
redis.call('HSET', KEYS[4], ARGV[1], ARGV[3])
redis.call('ZADD', KEYS[5], ARGV[4], ARGV[1])
return 1
"#;

/// Loaded once per broker; `invoke_async` falls back from EVALSHA to
/// EVAL when the server lost its script cache.
pub(crate) struct Scripts {
    pub enqueue: Script,
    pub claim: Script,
    pub promote: Script,
    pub recover: Script,
    pub finish: Script,
    pub requeue: Script,
}

impl Scripts {
    pub fn new() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE),
            claim: Script::new(CLAIM),
            promote: Script::new(PROMOTE),
            recover: Script::new(RECOVER),
            finish: Script::new(FINISH),
            requeue: Script::new(REQUEUE),
        }
    }
}
