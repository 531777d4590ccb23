use async_trait::async_trait;
use anyhow::Result;
use redis::AsyncCommands;
use std::collections::HashMap;

use crate::error::FlowError;
use crate::runtime::expression::FlowExpression;
use crate::runtime::fei::{FlowExpressionId, wfid_split};
use crate::runtime::message::Message;
use crate::runtime::storage::{ExpressionStore, MessageQueue, sort_expressions};

const REMOVE_SCRIPT: &str = r#"
redis.call('HDEL', KEYS[1], ARGV[1])
if redis.call('HLEN', KEYS[1]) == 0 then
    redis.call('SREM', KEYS[2], ARGV[2])
    redis.call('HDEL', KEYS[3], ARGV[2])
end
return 0
"#;

pub struct RedisMessageQueue {
    client: redis::Client,
    queue_key: String,
}

impl RedisMessageQueue {
    pub fn new(client: redis::Client, queue_key: String) -> Self {
        Self { client, queue_key }
    }
}

#[async_trait]
impl MessageQueue for RedisMessageQueue {
    async fn push(&self, message: Message) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let serialized = serde_json::to_string(&message)?;
        let _: () = conn.lpush(&self.queue_key, serialized).await?;
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Message>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        // 1 second BRPOP so workers notice shutdown.
        let result: Option<(String, String)> = conn.brpop(&self.queue_key, 1.0).await?;

        if let Some((_, message_json)) = result {
            let message = serde_json::from_str(&message_json)?;
            Ok(Some(message))
        } else {
            Ok(None)
        }
    }
}

/// One hash per top-level instance (`<prefix>:exps:<parent_wfid>`), field
/// = storage id. A recovery scan reads an instance with a single HGETALL.
pub struct RedisExpressionStore {
    client: redis::Client,
    prefix: String,
}

impl RedisExpressionStore {
    pub fn new(client: redis::Client) -> Self {
        Self::with_prefix(client, "arbor")
    }

    pub fn with_prefix(client: redis::Client, prefix: &str) -> Self {
        Self {
            client,
            prefix: prefix.to_string(),
        }
    }

    fn instance_key(&self, parent_wfid: &str) -> String {
        format!("{}:exps:{}", self.prefix, parent_wfid)
    }

    fn instances_key(&self) -> String {
        format!("{}:instances", self.prefix)
    }

    fn subprocess_key(&self) -> String {
        format!("{}:subids", self.prefix)
    }

    fn decode_all(raw: HashMap<String, String>) -> Result<Vec<FlowExpression>> {
        let mut exps = Vec::with_capacity(raw.len());
        for (storage_id, json) in raw {
            let exp = serde_json::from_str(&json).map_err(|e| {
                FlowError::Storage(format!("undecodable expression at {}: {}", storage_id, e))
            })?;
            exps.push(exp);
        }
        Ok(exps)
    }
}

#[async_trait]
impl ExpressionStore for RedisExpressionStore {
    async fn put(&self, exp: &FlowExpression) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let parent_wfid = exp.fei.parent_wfid();
        let json = serde_json::to_string(exp)?;
        let _: () = conn
            .hset(self.instance_key(parent_wfid), exp.fei.to_storage_id(), json)
            .await?;
        let _: () = conn.sadd(self.instances_key(), parent_wfid).await?;
        Ok(())
    }

    async fn get(&self, fei: &FlowExpressionId) -> Result<Option<FlowExpression>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let json: Option<String> = conn
            .hget(self.instance_key(fei.parent_wfid()), fei.to_storage_id())
            .await?;

        match json {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn remove(&self, fei: &FlowExpressionId) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let parent_wfid = fei.parent_wfid();
        // The instance's last expression takes its bookkeeping along.
        let script = redis::Script::new(REMOVE_SCRIPT);
        let _: () = script
            .key(self.instance_key(parent_wfid))
            .key(self.instances_key())
            .key(self.subprocess_key())
            .arg(fei.to_storage_id())
            .arg(parent_wfid)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn expressions_for(&self, wfid: &str) -> Result<Vec<FlowExpression>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let (top, _) = wfid_split(wfid);
        let raw: HashMap<String, String> = conn.hgetall(self.instance_key(top)).await?;
        let mut exps = Self::decode_all(raw)?;
        sort_expressions(&mut exps);
        Ok(exps)
    }

    async fn all_expressions(&self) -> Result<Vec<FlowExpression>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let instances: Vec<String> = conn.smembers(self.instances_key()).await?;

        let mut all = Vec::new();
        for wfid in instances {
            let raw: HashMap<String, String> = conn.hgetall(self.instance_key(&wfid)).await?;
            all.extend(Self::decode_all(raw)?);
        }
        Ok(all)
    }

    async fn next_subprocess_id(&self, wfid: &str) -> Result<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        // HINCRBY is atomic; subtract one so numbering starts at 0 like the
        // in-memory store.
        let next: u64 = conn.hincr(self.subprocess_key(), wfid, 1u64).await?;
        Ok(next - 1)
    }
}
