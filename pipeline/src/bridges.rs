use std::fmt::Debug;

use async_trait::async_trait;
use auto_impl::auto_impl;
use chrono::{DateTime, Utc};
use sea_orm::{
    sea_query::OnConflict, ActiveValue::*, ColumnTrait, DbErr, EntityTrait, QueryFilter,
    QueryOrder,
};
use serde::Serialize;
use url::Url;

use oracle_base::{
    auth::{hash_token, new_token},
    db::{
        generated::bridge, i64_to_u64, now, string_to_u256, to_chrono, u256_to_string,
        u64_to_i64, OracleDb,
    },
};
use oracle_core::U256;

use crate::{PipelineError, PipelineResult};

/// A registered external adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bridge {
    /// Unique name tasks refer to
    pub name: String,
    /// Adapter endpoint
    pub url: Url,
    /// Sent to the adapter as a bearer token
    #[serde(skip)]
    pub outgoing_token: String,
    /// Hash of the key the adapter presents when calling back
    #[serde(skip)]
    pub incoming_token_hash: String,
    /// Confirmations required before calling the adapter
    pub confirmations: u64,
    /// Minimum payment a request must carry
    pub minimum_contract_payment: U256,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Operator input for a new bridge.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBridge {
    /// Unique name: lowercase letters, digits, `-` and `_`
    pub name: String,
    /// Adapter endpoint
    pub url: String,
    /// Confirmations required before calling the adapter
    #[serde(default)]
    pub confirmations: u64,
    /// Minimum payment, decimal wei
    #[serde(default)]
    pub minimum_contract_payment: Option<String>,
}

/// A created bridge with its secrets, shown once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedBridge {
    /// The stored bridge
    #[serde(flatten)]
    pub bridge: Bridge,
    /// Token sent to the adapter
    pub outgoing_token: String,
    /// Key the adapter presents to the node
    pub incoming_access_key: String,
}

impl NewBridge {
    /// Checks the input and generates the tokens.
    pub fn validate(&self) -> PipelineResult<(Bridge, String)> {
        let name = self.name.trim();
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(PipelineError::Validation(format!(
                "invalid bridge name {name:?}: use lowercase letters, digits, '-' and '_'"
            )));
        }
        let url = Url::parse(self.url.trim())
            .map_err(|e| PipelineError::Validation(format!("invalid bridge url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(PipelineError::Validation(format!(
                "bridge url must be http or https, got {}",
                url.scheme()
            )));
        }
        let minimum_contract_payment = match &self.minimum_contract_payment {
            Some(s) => U256::from_dec_str(s.trim()).map_err(|e| {
                PipelineError::Validation(format!("invalid minimumContractPayment: {e:?}"))
            })?,
            None => U256::zero(),
        };
        let incoming = new_token();
        Ok((
            Bridge {
                name: name.to_owned(),
                url,
                outgoing_token: new_token(),
                incoming_token_hash: hash_token(&incoming),
                confirmations: self.confirmations,
                minimum_contract_payment,
                created_at: Utc::now(),
            },
            incoming,
        ))
    }
}

/// Persistence of bridges.
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait BridgeStore: Send + Sync + Debug {
    /// Stores `bridge`. Returns false when the name is taken.
    async fn insert_bridge(&self, bridge: &Bridge) -> Result<bool, DbErr>;

    /// Bridge by name.
    async fn bridge(&self, name: &str) -> Result<Option<Bridge>, DbErr>;

    /// Every bridge, by name.
    async fn bridges(&self) -> Result<Vec<Bridge>, DbErr>;

    /// Removes a bridge. Returns whether it existed.
    async fn delete_bridge(&self, name: &str) -> Result<bool, DbErr>;
}

/// Validates and stores a new bridge.
pub async fn create_bridge(
    store: &dyn BridgeStore,
    new: &NewBridge,
) -> PipelineResult<CreatedBridge> {
    let (bridge, incoming_access_key) = new.validate()?;
    if !store.insert_bridge(&bridge).await? {
        return Err(PipelineError::Validation(format!(
            "bridge {:?} already exists",
            bridge.name
        )));
    }
    Ok(CreatedBridge {
        outgoing_token: bridge.outgoing_token.clone(),
        bridge,
        incoming_access_key,
    })
}

fn bridge_from_model(m: bridge::Model) -> Result<Bridge, DbErr> {
    Ok(Bridge {
        url: Url::parse(&m.url).map_err(|e| DbErr::Custom(format!("bad bridge url: {e}")))?,
        name: m.name,
        outgoing_token: m.outgoing_token,
        incoming_token_hash: m.incoming_token_hash,
        confirmations: i64_to_u64(m.confirmations),
        minimum_contract_payment: string_to_u256(&m.minimum_contract_payment)?,
        created_at: to_chrono(m.time_created),
    })
}

#[async_trait]
impl BridgeStore for OracleDb {
    async fn insert_bridge(&self, b: &Bridge) -> Result<bool, DbErr> {
        let model = bridge::ActiveModel {
            id: NotSet,
            time_created: Set(now()),
            name: Set(b.name.clone()),
            url: Set(b.url.to_string()),
            outgoing_token: Set(b.outgoing_token.clone()),
            incoming_token_hash: Set(b.incoming_token_hash.clone()),
            confirmations: Set(u64_to_i64(b.confirmations)),
            minimum_contract_payment: Set(u256_to_string(b.minimum_contract_payment)),
        };
        match bridge::Entity::insert(model)
            .on_conflict(
                OnConflict::column(bridge::Column::Name)
                    .do_nothing()
                    .to_owned(),
            )
            .exec(self.conn())
            .await
        {
            Ok(_) => Ok(true),
            Err(DbErr::RecordNotInserted) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn bridge(&self, name: &str) -> Result<Option<Bridge>, DbErr> {
        bridge::Entity::find()
            .filter(bridge::Column::Name.eq(name))
            .one(self.conn())
            .await?
            .map(bridge_from_model)
            .transpose()
    }

    async fn bridges(&self) -> Result<Vec<Bridge>, DbErr> {
        bridge::Entity::find()
            .order_by_asc(bridge::Column::Name)
            .all(self.conn())
            .await?
            .into_iter()
            .map(bridge_from_model)
            .collect()
    }

    async fn delete_bridge(&self, name: &str) -> Result<bool, DbErr> {
        let res = bridge::Entity::delete_many()
            .filter(bridge::Column::Name.eq(name))
            .exec(self.conn())
            .await?;
        Ok(res.rows_affected > 0)
    }
}
