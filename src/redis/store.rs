//! Bucket store backed by Redis
//!
//! Each tier of an entity is a sorted set of bucket starts plus one hash per
//! bucket. A persist's batch goes out as a single `MULTI`/`EXEC` pipeline so
//! readers see all of its tiers or none.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::connection::RedisPool;
use super::util::KeySpace;
use crate::error::StorageError;
use crate::metric::{EntityMeta, Number, RecordType};
use crate::storage::{BucketFields, BucketRecord, BucketStore, WriteBatch};
use crate::types::{Period, Timestamp};

/// [`BucketStore`] over a [`RedisPool`]
#[derive(Debug)]
pub struct RedisBucketStore {
    pool: Arc<RedisPool>,
    keys: KeySpace,
}

impl RedisBucketStore {
    /// Store using the pool's configured key prefix
    pub fn new(pool: Arc<RedisPool>) -> Self {
        let keys = KeySpace::new(pool.config().key_prefix.clone());
        Self { pool, keys }
    }

    /// Key layout in use
    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }
}

fn decode_fields(key: &str, raw: HashMap<String, String>) -> Result<BucketFields, StorageError> {
    raw.into_iter()
        .map(|(name, value)| {
            serde_json::from_str::<Number>(&value)
                .map(|number| (name, number))
                .map_err(|e| StorageError::Corrupted {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
        })
        .collect()
}

fn encode_fields(fields: &BucketFields) -> Result<Vec<(String, String)>, StorageError> {
    fields
        .iter()
        .map(|(name, value)| {
            serde_json::to_string(value)
                .map(|encoded| (name.clone(), encoded))
                .map_err(|e| StorageError::Backend(format!("encode '{}': {}", name, e)))
        })
        .collect()
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn read_bucket_range(
        &self,
        entity: &str,
        period: Period,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<BucketRecord>, StorageError> {
        if start > end {
            return Ok(Vec::new());
        }
        let index = self.keys.index(entity, period);

        let starts: Vec<Timestamp> = self
            .pool
            .execute(|mut conn| {
                let index = index.clone();
                async move {
                    redis::cmd("ZRANGEBYSCORE")
                        .arg(&index)
                        .arg(start)
                        .arg(end)
                        .query_async(&mut conn)
                        .await
                }
            })
            .await?;
        if starts.is_empty() {
            return Ok(Vec::new());
        }

        let bucket_keys: Vec<String> = starts
            .iter()
            .map(|s| self.keys.bucket(entity, period, *s))
            .collect();
        let raw: Vec<HashMap<String, String>> = self
            .pool
            .execute(|mut conn| {
                let mut pipe = redis::pipe();
                for key in &bucket_keys {
                    pipe.hgetall(key);
                }
                async move { pipe.query_async(&mut conn).await }
            })
            .await?;

        starts
            .into_iter()
            .zip(bucket_keys.iter().zip(raw))
            .map(|(key, (redis_key, fields))| {
                Ok(BucketRecord {
                    key,
                    fields: decode_fields(redis_key, fields)?,
                })
            })
            .collect()
    }

    async fn read_meta(&self, entity: &str) -> Result<EntityMeta, StorageError> {
        let key = self.keys.meta(entity);
        let raw: HashMap<String, String> = self
            .pool
            .execute(|mut conn| {
                let key = key.clone();
                async move { redis::cmd("HGETALL").arg(&key).query_async(&mut conn).await }
            })
            .await?;

        let mut meta = EntityMeta::new();
        for (name, value) in raw {
            let record_type: RecordType = value.parse().map_err(|_| StorageError::Corrupted {
                key: key.clone(),
                reason: format!("unknown record type '{}' for '{}'", value, name),
            })?;
            meta.insert(name, record_type);
        }
        Ok(meta)
    }

    async fn write_batch(&self, entity: &str, batch: WriteBatch) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.sadd(self.keys.entities(), entity).ignore();

        if !batch.meta.is_empty() {
            let meta: Vec<(&str, &str)> = batch
                .meta
                .iter()
                .map(|(name, record_type)| (name.as_str(), record_type.as_str()))
                .collect();
            pipe.hset_multiple(self.keys.meta(entity), &meta).ignore();
        }

        for (period, records) in &batch.buckets {
            let index = self.keys.index(entity, *period);
            for record in records {
                let key = self.keys.bucket(entity, *period, record.key);
                pipe.zadd(&index, record.key, record.key).ignore();
                pipe.del(&key).ignore();
                let fields = encode_fields(&record.fields)?;
                if !fields.is_empty() {
                    pipe.hset_multiple(&key, &fields).ignore();
                }
            }
        }

        self.pool
            .execute(|mut conn| {
                let pipe = pipe.clone();
                async move { pipe.query_async::<()>(&mut conn).await }
            })
            .await
    }

    async fn entities(&self) -> Result<Vec<String>, StorageError> {
        let key = self.keys.entities();
        self.pool
            .execute(|mut conn| {
                let key = key.clone();
                async move { redis::cmd("SMEMBERS").arg(&key).query_async(&mut conn).await }
            })
            .await
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_round_trip_through_json() {
        let mut fields = BucketFields::new();
        fields.insert("hits".into(), Number::Int(3));
        fields.insert("load".into(), Number::Float(0.5));

        let encoded: HashMap<String, String> = encode_fields(&fields).unwrap().into_iter().collect();
        assert_eq!(encoded["hits"], "3");
        assert_eq!(encoded["load"], "0.5");

        assert_eq!(decode_fields("k", encoded).unwrap(), fields);
    }

    #[test]
    fn test_undecodable_field_is_corruption() {
        let mut raw = HashMap::new();
        raw.insert("hits".to_string(), "three".to_string());
        let err = decode_fields("rollup:e:x:hourly:0", raw).unwrap_err();
        assert!(matches!(err, StorageError::Corrupted { ref key, .. } if key == "rollup:e:x:hourly:0"));
    }
}
