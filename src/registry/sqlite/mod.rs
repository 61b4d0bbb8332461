//! SQLite implementation of the registry.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sea_query::{Expr, OnConflict, Order, Query, SelectStatement, SqliteQueryBuilder};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use super::schema::{
    AclFunctions, EventAclMapping, Subscribers, Subscriptions, CREATE_ACL_FUNCTIONS_TABLE,
    CREATE_EVENT_ACL_MAPPING_TABLE, CREATE_SUBSCRIBERS_TABLE, CREATE_SUBSCRIPTIONS_TABLE,
};
use super::{
    parse_timestamp, AclFunction, Registry, RegistryError, RegistryStore, Result, Subscriber,
    Subscription,
};

/// SQLite implementation of `Registry` and `RegistryStore`.
pub struct SqliteRegistry {
    pool: SqlitePool,
}

impl SqliteRegistry {
    /// Wrap an existing pool. Foreign keys must be enabled on it for the
    /// cascading deletes to apply.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a SQLite URL such as `sqlite:registry.db` or `sqlite::memory:`.
    ///
    /// In-memory databases are private to one connection, so the pool is
    /// pinned to a single connection that never expires.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        Ok(Self::new(pool))
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_SUBSCRIBERS_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(CREATE_SUBSCRIPTIONS_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(CREATE_ACL_FUNCTIONS_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(CREATE_EVENT_ACL_MAPPING_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_subscriber(&self, column: Subscribers, value: &str) -> Result<Option<Subscriber>> {
        let sql = select_subscribers()
            .and_where(Expr::col(column).eq(value))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.as_ref().map(subscriber_from_row).transpose()
    }
}

fn select_subscribers() -> SelectStatement {
    Query::select()
        .columns([
            Subscribers::Username,
            Subscribers::Role,
            Subscribers::ChannelRef,
            Subscribers::AuthCredential,
            Subscribers::AgentEndpoint,
            Subscribers::CreatedAt,
        ])
        .from(Subscribers::Table)
        .to_owned()
}

fn select_subscriptions() -> SelectStatement {
    Query::select()
        .columns([
            Subscriptions::Username,
            Subscriptions::EventType,
            Subscriptions::Command,
            Subscriptions::CreatedAt,
            Subscriptions::UpdatedAt,
        ])
        .from(Subscriptions::Table)
        .to_owned()
}

fn subscriber_from_row(row: &SqliteRow) -> Result<Subscriber> {
    let role: String = row.try_get("role")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(Subscriber {
        username: row.try_get("username")?,
        role: role.parse()?,
        channel_ref: row.try_get("channel_ref")?,
        auth_credential: row.try_get("auth_credential")?,
        agent_endpoint: row.try_get("agent_endpoint")?,
        created_at: parse_timestamp("created_at", &created_at)?,
    })
}

fn subscription_from_row(row: &SqliteRow) -> Result<Subscription> {
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Subscription {
        username: row.try_get("username")?,
        event_type: row.try_get("event_type")?,
        command: row.try_get("command")?,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

fn acl_function_from_row(row: &SqliteRow) -> Result<AclFunction> {
    Ok(AclFunction {
        name: row.try_get("name")?,
        reference: row.try_get("reference")?,
    })
}

#[async_trait]
impl Registry for SqliteRegistry {
    async fn subscribers_for_event(&self, event_type: &str) -> Result<Vec<String>> {
        let query = Query::select()
            .column(Subscriptions::Username)
            .from(Subscriptions::Table)
            .and_where(Expr::col(Subscriptions::EventType).eq(event_type))
            .order_by(Subscriptions::Username, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("username").map_err(Into::into))
            .collect()
    }

    async fn acl_chain_for_event(&self, event_type: &str) -> Result<Vec<AclFunction>> {
        let query = Query::select()
            .column((AclFunctions::Table, AclFunctions::Name))
            .column((AclFunctions::Table, AclFunctions::Reference))
            .from(EventAclMapping::Table)
            .inner_join(
                AclFunctions::Table,
                Expr::col((AclFunctions::Table, AclFunctions::Name))
                    .equals((EventAclMapping::Table, EventAclMapping::FunctionName)),
            )
            .and_where(Expr::col((EventAclMapping::Table, EventAclMapping::EventType)).eq(event_type))
            .order_by((EventAclMapping::Table, EventAclMapping::Position), Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(acl_function_from_row).collect()
    }

    async fn channel_for_subscriber(&self, username: &str) -> Result<Option<String>> {
        let query = Query::select()
            .column(Subscribers::ChannelRef)
            .from(Subscribers::Table)
            .and_where(Expr::col(Subscribers::Username).eq(username))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        Ok(row
            .map(|row| row.try_get::<String, _>("channel_ref"))
            .transpose()?)
    }

    async fn command_template(&self, username: &str, event_type: &str) -> Result<Option<String>> {
        let query = Query::select()
            .column(Subscriptions::Command)
            .from(Subscriptions::Table)
            .and_where(Expr::col(Subscriptions::Username).eq(username))
            .and_where(Expr::col(Subscriptions::EventType).eq(event_type))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        Ok(row.map(|row| row.try_get::<String, _>("command")).transpose()?)
    }

    async fn subscriber(&self, username: &str) -> Result<Option<Subscriber>> {
        self.fetch_subscriber(Subscribers::Username, username).await
    }

    async fn subscriber_by_channel(&self, channel_ref: &str) -> Result<Option<Subscriber>> {
        self.fetch_subscriber(Subscribers::ChannelRef, channel_ref)
            .await
    }

    async fn subscribers(&self) -> Result<Vec<Subscriber>> {
        let query = select_subscribers()
            .order_by(Subscribers::Username, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(subscriber_from_row).collect()
    }

    async fn all_subscriptions(&self) -> Result<Vec<Subscription>> {
        let query = select_subscriptions()
            .order_by(Subscriptions::Username, Order::Asc)
            .order_by(Subscriptions::EventType, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(subscription_from_row).collect()
    }

    async fn acl_functions(&self) -> Result<Vec<AclFunction>> {
        let query = Query::select()
            .columns([AclFunctions::Name, AclFunctions::Reference])
            .from(AclFunctions::Table)
            .order_by(AclFunctions::Name, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(acl_function_from_row).collect()
    }
}

#[async_trait]
impl RegistryStore for SqliteRegistry {
    async fn upsert_subscriber(&self, subscriber: &Subscriber) -> Result<()> {
        let query = Query::insert()
            .into_table(Subscribers::Table)
            .columns([
                Subscribers::Username,
                Subscribers::Role,
                Subscribers::ChannelRef,
                Subscribers::AuthCredential,
                Subscribers::AgentEndpoint,
                Subscribers::CreatedAt,
            ])
            .values_panic([
                subscriber.username.clone().into(),
                subscriber.role.as_str().into(),
                subscriber.channel_ref.clone().into(),
                subscriber.auth_credential.clone().into(),
                subscriber.agent_endpoint.clone().into(),
                subscriber.created_at.to_rfc3339().into(),
            ])
            .on_conflict(
                OnConflict::column(Subscribers::Username)
                    .update_columns([
                        Subscribers::Role,
                        Subscribers::AuthCredential,
                        Subscribers::AgentEndpoint,
                    ])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        debug!(username = %subscriber.username, "Subscriber upserted");
        Ok(())
    }

    async fn delete_subscriber(&self, username: &str) -> Result<bool> {
        let query = Query::delete()
            .from_table(Subscribers::Table)
            .and_where(Expr::col(Subscribers::Username).eq(username))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_subscription(
        &self,
        username: &str,
        event_type: &str,
        command: &str,
    ) -> Result<Subscription> {
        let mut tx = self.pool.begin().await?;

        let exists = Query::select()
            .column(Subscribers::Username)
            .from(Subscribers::Table)
            .and_where(Expr::col(Subscribers::Username).eq(username))
            .to_string(SqliteQueryBuilder);
        if sqlx::query(&exists).fetch_optional(&mut *tx).await?.is_none() {
            return Err(RegistryError::SubscriberNotFound(username.to_string()));
        }

        let now = Utc::now().to_rfc3339();
        let upsert = Query::insert()
            .into_table(Subscriptions::Table)
            .columns([
                Subscriptions::Username,
                Subscriptions::EventType,
                Subscriptions::Command,
                Subscriptions::CreatedAt,
                Subscriptions::UpdatedAt,
            ])
            .values_panic([
                username.into(),
                event_type.into(),
                command.into(),
                now.clone().into(),
                now.into(),
            ])
            .on_conflict(
                OnConflict::columns([Subscriptions::Username, Subscriptions::EventType])
                    .update_columns([Subscriptions::Command, Subscriptions::UpdatedAt])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);
        sqlx::query(&upsert).execute(&mut *tx).await?;

        let select = select_subscriptions()
            .and_where(Expr::col(Subscriptions::Username).eq(username))
            .and_where(Expr::col(Subscriptions::EventType).eq(event_type))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&select)
            .fetch_one(&mut *tx)
            .await?;
        let subscription = subscription_from_row(&row)?;

        tx.commit().await?;
        Ok(subscription)
    }

    async fn delete_subscription(&self, username: &str, event_type: &str) -> Result<bool> {
        let query = Query::delete()
            .from_table(Subscriptions::Table)
            .and_where(Expr::col(Subscriptions::Username).eq(username))
            .and_where(Expr::col(Subscriptions::EventType).eq(event_type))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_subscriptions(
        &self,
        username: &str,
        event_type: Option<&str>,
    ) -> Result<Vec<Subscription>> {
        // Rendered before awaiting: statements are not Send.
        let sql = {
            let mut query = select_subscriptions();
            query.and_where(Expr::col(Subscriptions::Username).eq(username));
            if let Some(event_type) = event_type {
                query.and_where(Expr::col(Subscriptions::EventType).eq(event_type));
            }
            query
                .order_by(Subscriptions::EventType, Order::Asc)
                .to_string(SqliteQueryBuilder)
        };

        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(subscription_from_row).collect()
    }

    async fn register_acl_function(&self, name: &str, reference: &str) -> Result<()> {
        let query = Query::insert()
            .into_table(AclFunctions::Table)
            .columns([AclFunctions::Name, AclFunctions::Reference])
            .values_panic([name.into(), reference.into()])
            .on_conflict(
                OnConflict::column(AclFunctions::Name)
                    .update_column(AclFunctions::Reference)
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn delete_acl_function(&self, name: &str) -> Result<bool> {
        let query = Query::delete()
            .from_table(AclFunctions::Table)
            .and_where(Expr::col(AclFunctions::Name).eq(name))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn map_acl_function(&self, event_type: &str, name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let exists = Query::select()
            .column(AclFunctions::Name)
            .from(AclFunctions::Table)
            .and_where(Expr::col(AclFunctions::Name).eq(name))
            .to_string(SqliteQueryBuilder);
        if sqlx::query(&exists).fetch_optional(&mut *tx).await?.is_none() {
            return Err(RegistryError::AclFunctionNotFound(name.to_string()));
        }

        let max_position = Query::select()
            .expr(Expr::col(EventAclMapping::Position).max())
            .from(EventAclMapping::Table)
            .and_where(Expr::col(EventAclMapping::EventType).eq(event_type))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&max_position).fetch_one(&mut *tx).await?;
        let next_position = row
            .try_get::<Option<i64>, _>(0)?
            .map(|p| p + 1)
            .unwrap_or(0);

        let insert = Query::insert()
            .into_table(EventAclMapping::Table)
            .columns([
                EventAclMapping::EventType,
                EventAclMapping::FunctionName,
                EventAclMapping::Position,
            ])
            .values_panic([event_type.into(), name.into(), next_position.into()])
            .on_conflict(
                OnConflict::columns([EventAclMapping::EventType, EventAclMapping::FunctionName])
                    .do_nothing()
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);
        sqlx::query(&insert).execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn unmap_acl_function(&self, event_type: &str, name: &str) -> Result<bool> {
        let query = Query::delete()
            .from_table(EventAclMapping::Table)
            .and_where(Expr::col(EventAclMapping::EventType).eq(event_type))
            .and_where(Expr::col(EventAclMapping::FunctionName).eq(name))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }
}
