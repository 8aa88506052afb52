use std::{collections::HashMap, fmt::Debug};

use async_trait::async_trait;
use auto_impl::auto_impl;
use sea_orm::{
    sea_query::OnConflict, ActiveValue::*, ColumnTrait, DbErr, EntityTrait, QueryFilter,
    QueryOrder,
};
use tracing::instrument;

use oracle_base::db::{
    bytes_to_h256, from_chrono, generated::head, h256_to_bytes, i64_to_u64, now, to_chrono,
    u64_to_i64, OracleDb,
};
use oracle_core::{Head, H256};

/// Persistence of recent heads.
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait HeadStore: Send + Sync + Debug {
    /// Stores `head`; storing a hash twice is a no-op.
    async fn store_head(&self, head: &Head) -> Result<(), DbErr>;

    /// Head with the given hash.
    async fn head_by_hash(&self, hash: H256) -> Result<Option<Head>, DbErr>;

    /// Head with the highest number.
    async fn latest_head(&self) -> Result<Option<Head>, DbErr>;

    /// Every head at or above `number`.
    async fn heads_since(&self, number: u64) -> Result<Vec<Head>, DbErr>;

    /// Deletes heads below `number`, returning how many were removed.
    async fn trim_heads_below(&self, number: u64) -> Result<u64, DbErr>;

    /// The head with `hash`, with up to `lookback` ancestors linked in.
    async fn chain(&self, hash: H256, lookback: u64) -> Result<Option<Head>, DbErr> {
        let Some(head) = self.head_by_hash(hash).await? else {
            return Ok(None);
        };
        let by_hash: HashMap<H256, Head> = self
            .heads_since(head.number.saturating_sub(lookback))
            .await?
            .into_iter()
            .map(|h| (h.hash, h))
            .collect();
        Ok(Some(link_chain(&by_hash, head, lookback)))
    }
}

/// Links `head` with up to `lookback` ancestors found in `heads`.
pub fn link_chain(heads: &HashMap<H256, Head>, head: Head, lookback: u64) -> Head {
    let head = Head {
        parent: None,
        ..head
    };
    let mut ancestors: Vec<Head> = Vec::new();
    let (mut number, mut parent_hash) = (head.number, head.parent_hash);
    while (ancestors.len() as u64) < lookback && number > 0 {
        match heads.get(&parent_hash) {
            Some(parent) if parent.number + 1 == number => {
                number = parent.number;
                parent_hash = parent.parent_hash;
                ancestors.push(Head {
                    parent: None,
                    ..parent.clone()
                });
            }
            _ => break,
        }
    }
    let mut linked: Option<Head> = None;
    for ancestor in ancestors.into_iter().rev() {
        linked = Some(match linked {
            Some(parent) => ancestor.with_parent(parent),
            None => ancestor,
        });
    }
    match linked {
        Some(parent) => head.with_parent(parent),
        None => head,
    }
}

fn head_from_model(model: head::Model) -> Result<Head, DbErr> {
    let mut head = Head::new(
        bytes_to_h256(&model.hash)?,
        i64_to_u64(model.number),
        bytes_to_h256(&model.parent_hash)?,
        to_chrono(model.timestamp),
    );
    head.l1_block_number = model.l1_block_number.map(i64_to_u64);
    Ok(head)
}

#[async_trait]
impl HeadStore for OracleDb {
    #[instrument(skip(self, head), fields(number = head.number, hash = ?head.hash))]
    async fn store_head(&self, head: &Head) -> Result<(), DbErr> {
        let model = head::ActiveModel {
            id: NotSet,
            time_created: Set(now()),
            hash: Set(h256_to_bytes(&head.hash)),
            number: Set(u64_to_i64(head.number)),
            parent_hash: Set(h256_to_bytes(&head.parent_hash)),
            timestamp: Set(from_chrono(head.timestamp)),
            l1_block_number: Set(head.l1_block_number.map(u64_to_i64)),
        };
        match head::Entity::insert(model)
            .on_conflict(
                OnConflict::column(head::Column::Hash)
                    .do_nothing()
                    .to_owned(),
            )
            .exec(self.conn())
            .await
        {
            Ok(_) | Err(DbErr::RecordNotInserted) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn head_by_hash(&self, hash: H256) -> Result<Option<Head>, DbErr> {
        head::Entity::find()
            .filter(head::Column::Hash.eq(h256_to_bytes(&hash)))
            .one(self.conn())
            .await?
            .map(head_from_model)
            .transpose()
    }

    async fn latest_head(&self) -> Result<Option<Head>, DbErr> {
        head::Entity::find()
            .order_by_desc(head::Column::Number)
            .one(self.conn())
            .await?
            .map(head_from_model)
            .transpose()
    }

    async fn heads_since(&self, number: u64) -> Result<Vec<Head>, DbErr> {
        head::Entity::find()
            .filter(head::Column::Number.gte(u64_to_i64(number)))
            .order_by_desc(head::Column::Number)
            .all(self.conn())
            .await?
            .into_iter()
            .map(head_from_model)
            .collect()
    }

    #[instrument(skip(self))]
    async fn trim_heads_below(&self, number: u64) -> Result<u64, DbErr> {
        let res = head::Entity::delete_many()
            .filter(head::Column::Number.lt(u64_to_i64(number)))
            .exec(self.conn())
            .await?;
        Ok(res.rows_affected)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn head(number: u64, fork: u8) -> Head {
        let parent = if number == 0 {
            H256::zero()
        } else {
            H256::from_low_u64_be(number - 1)
        };
        let mut hash = H256::from_low_u64_be(number);
        hash.0[0] = fork;
        let mut head = Head::new(
            hash,
            number,
            parent,
            Utc.timestamp_opt(1_700_000_000 + number as i64, 0).unwrap(),
        );
        head.l1_block_number = (number % 2 == 0).then_some(number * 10);
        head
    }

    #[tokio::test]
    async fn heads_round_trip_and_store_is_idempotent() {
        let db = OracleDb::in_memory().await.unwrap();
        let h = head(5, 0);
        db.store_head(&h).await.unwrap();
        db.store_head(&h).await.unwrap();
        assert_eq!(db.heads_since(0).await.unwrap().len(), 1);
        assert_eq!(db.head_by_hash(h.hash).await.unwrap().unwrap(), h);
    }

    #[tokio::test]
    async fn chain_links_ancestors_and_trim_removes_old_heads() {
        let db = OracleDb::in_memory().await.unwrap();
        for n in 0..10 {
            db.store_head(&head(n, 0)).await.unwrap();
        }
        let latest = db.latest_head().await.unwrap().unwrap();
        assert_eq!(latest.number, 9);

        let chain = db.chain(latest.hash, 3).await.unwrap().unwrap();
        assert_eq!(chain.chain_length(), 4);
        assert_eq!(chain.earliest_in_chain().number, 6);

        assert_eq!(db.trim_heads_below(7).await.unwrap(), 7);
        let chain = db.chain(latest.hash, 5).await.unwrap().unwrap();
        assert_eq!(chain.chain_length(), 3);
    }
}
