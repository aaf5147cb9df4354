//! Redis-backed broker for distributed multi-process coordination.
//!
//! Queue state lives in Redis lists, registries in sorted sets, and every
//! multi-key transition (enqueue with dependencies, reserve, ack, cancel)
//! runs as an atomic Lua script so concurrent workers on other machines
//! cannot observe half-applied moves.
//!
//! Key layout under `civipipe:`:
//! - `q:<queue>`        pending job ids (list, FIFO)
//! - `job:<id>`         job fields (hash)
//! - `deps:<id>`        unfinished dependency ids (set)
//! - `dependents:<id>`  jobs waiting on `<id>` (set)
//! - `scheduled`        delayed jobs (zset, score = ready ms)
//! - `started`          in-flight jobs (zset, score = deadline ms)
//! - `failed`           failed registry (zset, score = failed ms)
//! - `workers`          worker heartbeats (zset, score = last seen ms)

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::models::{JobPayload, Priority};

use super::{
    AckOutcome, Broker, BrokerError, FailedJob, Job, JobSpec, Result, FAILED_RETENTION, WORKER_TTL,
};

/// Key prefix for all broker data in Redis.
const KEY_PREFIX: &str = "civipipe:";
/// TTL for completed job hashes (kept briefly for dependency checks).
const DONE_TTL_MS: i64 = 3_600_000;
/// Poll interval while waiting for a reservation.
const RESERVE_POLL: Duration = Duration::from_millis(250);

/// Lua helper shared by every script that terminates a job: removes the
/// finished id from its dependents' wait sets and promotes any dependent
/// whose last dependency just cleared.
const SETTLE_DEPENDENTS_FN: &str = r#"
local function settle_dependents(prefix, id, now)
    local waiting = redis.call('SMEMBERS', prefix..'dependents:'..id)
    for _, d in ipairs(waiting) do
        redis.call('SREM', prefix..'deps:'..d, id)
        if redis.call('SCARD', prefix..'deps:'..d) == 0 then
            redis.call('DEL', prefix..'deps:'..d)
            local dkey = prefix..'job:'..d
            if redis.call('HGET', dkey, 'state') == 'deferred' then
                local nb = tonumber(redis.call('HGET', dkey, 'not_before_ms') or '0')
                if nb > now then
                    redis.call('HSET', dkey, 'state', 'scheduled')
                    redis.call('ZADD', prefix..'scheduled', nb, d)
                else
                    redis.call('HSET', dkey, 'state', 'pending')
                    local q = redis.call('HGET', dkey, 'queue')
                    redis.call('RPUSH', prefix..'q:'..q, d)
                end
            end
        end
    end
    redis.call('DEL', prefix..'dependents:'..id)
end
"#;

fn enqueue_script() -> Script {
    Script::new(&format!(
        r#"{SETTLE_DEPENDENTS_FN}
        local prefix = ARGV[1]
        local id = ARGV[2]
        local queue = ARGV[3]
        local now = tonumber(ARGV[4])
        local not_before = tonumber(ARGV[5])
        local deps = cjson.decode(ARGV[6])
        local key = prefix..'job:'..id

        if redis.call('EXISTS', key) == 1 then
            return redis.error_reply('duplicate job id '..id)
        end
        redis.call('HSET', key,
            'id', id,
            'queue', queue,
            'payload', ARGV[7],
            'priority', ARGV[8],
            'timeout_ms', ARGV[9],
            'max_attempts', ARGV[10],
            'attempt', '0',
            'created_at_ms', ARGV[4],
            'not_before_ms', ARGV[5],
            'state', 'pending')

        local remaining = 0
        for _, dep in ipairs(deps) do
            local dep_state = redis.call('HGET', prefix..'job:'..dep, 'state')
            if dep_state and dep_state ~= 'done' and dep_state ~= 'failed'
                and dep_state ~= 'cancelled' then
                redis.call('SADD', prefix..'deps:'..id, dep)
                redis.call('SADD', prefix..'dependents:'..dep, id)
                remaining = remaining + 1
            end
        end

        if remaining > 0 then
            redis.call('HSET', key, 'state', 'deferred')
        elseif not_before > now then
            redis.call('HSET', key, 'state', 'scheduled')
            redis.call('ZADD', prefix..'scheduled', not_before, id)
        else
            redis.call('RPUSH', prefix..'q:'..queue, id)
        end
        return id
        "#
    ))
}

fn reserve_script() -> Script {
    Script::new(&format!(
        r#"{SETTLE_DEPENDENTS_FN}
        local prefix = ARGV[1]
        local now = tonumber(ARGV[2])
        local retention = tonumber(ARGV[3])

        -- Promote due scheduled jobs
        local due = redis.call('ZRANGEBYSCORE', prefix..'scheduled', '-inf', now, 'LIMIT', 0, 100)
        for _, id in ipairs(due) do
            redis.call('ZREM', prefix..'scheduled', id)
            local key = prefix..'job:'..id
            local q = redis.call('HGET', key, 'queue')
            if q then
                redis.call('HSET', key, 'state', 'pending')
                redis.call('RPUSH', prefix..'q:'..q, id)
            end
        end

        -- Recycle expired deliveries
        local expired = redis.call('ZRANGEBYSCORE', prefix..'started', '-inf', now, 'LIMIT', 0, 100)
        for _, id in ipairs(expired) do
            redis.call('ZREM', prefix..'started', id)
            local key = prefix..'job:'..id
            if redis.call('EXISTS', key) == 1 then
                local attempt = tonumber(redis.call('HGET', key, 'attempt') or '0')
                local max_attempts = tonumber(redis.call('HGET', key, 'max_attempts') or '3')
                if attempt >= max_attempts then
                    redis.call('HSET', key, 'state', 'failed',
                        'error', 'delivery timed out',
                        'failed_at_ms', now)
                    redis.call('ZADD', prefix..'failed', now, id)
                    settle_dependents(prefix, id, now)
                else
                    redis.call('HSET', key, 'state', 'pending')
                    local q = redis.call('HGET', key, 'queue')
                    redis.call('RPUSH', prefix..'q:'..q, id)
                end
            end
        end

        -- Failed-registry retention
        redis.call('ZREMRANGEBYSCORE', prefix..'failed', '-inf', now - retention)

        -- Pop the first runnable job across the listed queues, in order
        for i = 4, #ARGV do
            local id = redis.call('LPOP', prefix..'q:'..ARGV[i])
            while id do
                local key = prefix..'job:'..id
                if redis.call('EXISTS', key) == 1 then
                    local timeout = tonumber(redis.call('HGET', key, 'timeout_ms') or '600000')
                    local attempt = tonumber(redis.call('HGET', key, 'attempt') or '0') + 1
                    redis.call('HSET', key, 'state', 'started', 'attempt', attempt)
                    redis.call('ZADD', prefix..'started', now + timeout, id)
                    return redis.call('HGETALL', key)
                end
                id = redis.call('LPOP', prefix..'q:'..ARGV[i])
            end
        end
        return false
        "#
    ))
}

fn ack_script() -> Script {
    Script::new(&format!(
        r#"{SETTLE_DEPENDENTS_FN}
        local prefix = ARGV[1]
        local now = tonumber(ARGV[2])
        local id = ARGV[3]
        local outcome = ARGV[4]
        local err = ARGV[5]
        local done_ttl = tonumber(ARGV[6])
        local retention = tonumber(ARGV[7])
        local key = prefix..'job:'..id

        local state = redis.call('HGET', key, 'state')
        if not state or state ~= 'started' then
            return 0
        end
        redis.call('ZREM', prefix..'started', id)
        if outcome == 'done' then
            redis.call('HSET', key, 'state', 'done')
            redis.call('PEXPIRE', key, done_ttl)
        else
            redis.call('HSET', key, 'state', 'failed', 'error', err, 'failed_at_ms', now)
            redis.call('ZADD', prefix..'failed', now, id)
            redis.call('PEXPIRE', key, retention)
        end
        settle_dependents(prefix, id, now)
        return 1
        "#
    ))
}

fn cancel_script() -> Script {
    Script::new(&format!(
        r#"{SETTLE_DEPENDENTS_FN}
        local prefix = ARGV[1]
        local now = tonumber(ARGV[2])
        local id = ARGV[3]
        local key = prefix..'job:'..id

        if redis.call('EXISTS', key) == 0 then
            return 0
        end
        local q = redis.call('HGET', key, 'queue')
        if q then
            redis.call('LREM', prefix..'q:'..q, 0, id)
        end
        redis.call('ZREM', prefix..'scheduled', id)
        redis.call('ZREM', prefix..'started', id)
        redis.call('ZREM', prefix..'failed', id)
        redis.call('HSET', key, 'state', 'cancelled')
        settle_dependents(prefix, id, now)
        redis.call('DEL', prefix..'deps:'..id)
        redis.call('PEXPIRE', key, 60000)
        return 1
        "#
    ))
}

fn purge_script() -> Script {
    Script::new(&format!(
        r#"{SETTLE_DEPENDENTS_FN}
        local prefix = ARGV[1]
        local now = tonumber(ARGV[2])
        local queue = ARGV[3]
        local removed = 0

        local id = redis.call('LPOP', prefix..'q:'..queue)
        while id do
            local key = prefix..'job:'..id
            if redis.call('EXISTS', key) == 1 then
                redis.call('HSET', key, 'state', 'cancelled')
                settle_dependents(prefix, id, now)
                redis.call('DEL', prefix..'deps:'..id)
                redis.call('PEXPIRE', key, 60000)
                removed = removed + 1
            end
            id = redis.call('LPOP', prefix..'q:'..queue)
        end
        return removed
        "#
    ))
}

/// Redis broker backend. Cheap to clone: the connection manager multiplexes.
pub struct RedisBroker {
    conn: ConnectionManager,
}

impl RedisBroker {
    /// Connect to the broker at `redis_url` (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BrokerError::Connection(format!("Redis connection error: {e}")))?;
        let conn = ConnectionManager::new(client).await.map_err(|e| {
            BrokerError::Connection(format!("Redis connection manager error: {e}"))
        })?;
        Ok(Self { conn })
    }

    fn job_from_fields(fields: HashMap<String, String>) -> Result<Job> {
        let get = |name: &str| -> Result<&String> {
            fields
                .get(name)
                .ok_or_else(|| BrokerError::Other(format!("job record missing field {name}")))
        };
        let payload: JobPayload = serde_json::from_str(get("payload")?)?;
        let created_ms: i64 = get("created_at_ms")?
            .parse()
            .map_err(|_| BrokerError::Other("bad created_at_ms".to_string()))?;
        Ok(Job {
            id: get("id")?.clone(),
            queue: get("queue")?.clone(),
            payload,
            priority: Priority::parse(get("priority")?).unwrap_or(Priority::Normal),
            attempt: get("attempt")?.parse().unwrap_or(0),
            max_attempts: get("max_attempts")?.parse().unwrap_or(3),
            created_at: Utc
                .timestamp_millis_opt(created_ms)
                .single()
                .unwrap_or_else(Utc::now),
        })
    }
}

impl Clone for RedisBroker {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, spec: JobSpec) -> Result<String> {
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();
        let not_before_ms = spec
            .opts
            .not_before
            .map(|t| t.timestamp_millis())
            .unwrap_or(0);
        let deps = serde_json::to_string(&spec.opts.depends_on)?;
        let payload = serde_json::to_string(&spec.payload)?;

        let script = enqueue_script();
        let id: String = script
            .arg(KEY_PREFIX)
            .arg(&spec.id)
            .arg(&spec.queue)
            .arg(now_ms)
            .arg(not_before_ms)
            .arg(deps)
            .arg(payload)
            .arg(spec.opts.priority.as_str())
            .arg(spec.opts.timeout.as_millis() as i64)
            .arg(spec.opts.max_attempts)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(id)
    }

    async fn reserve(&self, queues: &[&str], wait: Duration) -> Result<Option<Job>> {
        let deadline = tokio::time::Instant::now() + wait;
        let script = reserve_script();
        loop {
            let mut conn = self.conn.clone();
            let mut invocation = script.prepare_invoke();
            invocation
                .arg(KEY_PREFIX)
                .arg(Utc::now().timestamp_millis())
                .arg(FAILED_RETENTION.as_millis() as i64);
            for queue in queues {
                invocation.arg(*queue);
            }
            let fields: Option<HashMap<String, String>> = invocation
                .invoke_async(&mut conn)
                .await
                .map_err(|e| BrokerError::Connection(e.to_string()))?;
            if let Some(fields) = fields {
                return Ok(Some(Self::job_from_fields(fields)?));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(RESERVE_POLL.min(deadline - now)).await;
        }
    }

    async fn ack(&self, job_id: &str, outcome: AckOutcome) -> Result<()> {
        let mut conn = self.conn.clone();
        let (outcome_str, error) = match &outcome {
            AckOutcome::Done => ("done", String::new()),
            AckOutcome::Failed(err) => ("failed", err.clone()),
        };
        let script = ack_script();
        let _: i64 = script
            .arg(KEY_PREFIX)
            .arg(Utc::now().timestamp_millis())
            .arg(job_id)
            .arg(outcome_str)
            .arg(error)
            .arg(DONE_TTL_MS)
            .arg(FAILED_RETENTION.as_millis() as i64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn cancel(&self, job_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let script = cancel_script();
        let existed: i64 = script
            .arg(KEY_PREFIX)
            .arg(Utc::now().timestamp_millis())
            .arg(job_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(existed == 1)
    }

    async fn purge_queue(&self, queue: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let script = purge_script();
        let removed: i64 = script
            .arg(KEY_PREFIX)
            .arg(Utc::now().timestamp_millis())
            .arg(queue)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(removed.max(0) as u64)
    }

    async fn depth(&self, queue: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let len: i64 = conn
            .llen(format!("{KEY_PREFIX}q:{queue}"))
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(len.max(0) as u64)
    }

    async fn failed_jobs(&self, limit: usize) -> Result<Vec<FailedJob>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(format!("{KEY_PREFIX}failed"))
            .arg(0)
            .arg(limit.saturating_sub(1) as i64)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let mut failed = Vec::with_capacity(ids.len());
        for id in ids {
            let fields: HashMap<String, String> = conn
                .hgetall(format!("{KEY_PREFIX}job:{id}"))
                .await
                .map_err(|e| BrokerError::Connection(e.to_string()))?;
            if fields.is_empty() {
                continue; // retention expired the hash
            }
            let error = fields.get("error").cloned().unwrap_or_default();
            let failed_ms: i64 = fields
                .get("failed_at_ms")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let mut fields = fields;
            fields.insert("id".to_string(), id);
            failed.push(FailedJob {
                job: Self::job_from_fields(fields)?,
                error,
                failed_at: Utc
                    .timestamp_millis_opt(failed_ms)
                    .single()
                    .unwrap_or_else(Utc::now),
            });
        }
        Ok(failed)
    }

    async fn heartbeat_worker(&self, worker_id: &str, stage: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let member = format!("{stage}|{worker_id}");
        let now_ms = Utc::now().timestamp_millis();
        redis::pipe()
            .zadd(format!("{KEY_PREFIX}workers"), member, now_ms)
            .cmd("ZREMRANGEBYSCORE")
            .arg(format!("{KEY_PREFIX}workers"))
            .arg("-inf")
            .arg(now_ms - WORKER_TTL.as_millis() as i64)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn active_worker_counts(&self) -> Result<HashMap<String, u64>> {
        let mut conn = self.conn.clone();
        let cutoff = Utc::now().timestamp_millis() - WORKER_TTL.as_millis() as i64;
        let members: Vec<String> = conn
            .zrangebyscore(format!("{KEY_PREFIX}workers"), cutoff, "+inf")
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let mut counts = HashMap::new();
        for member in members {
            if let Some((stage, _)) = member.split_once('|') {
                *counts.entry(stage.to_string()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }
}
