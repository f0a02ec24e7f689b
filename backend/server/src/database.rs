//! # Storage
//!
//! Repository layer behind every service. Handlers and services only ever see
//! [`DatabaseClient`], so the backing store can be swapped at startup.
//!
//! ## Redis layout
//!
//! - `smpl:categories` hash: category id -> JSON [`Category`]
//! - `smpl:services` hash: service id -> JSON [`Service`]
//! - `smpl:users` hash: user id -> JSON [`User`]
//! - `smpl:user_phones` hash: E.164 phone -> user id, written with `HSETNX`
//!   after the user row so two sign-ups racing on one phone end up with the
//!   same user
//! - `smpl:user_services:{user_id}` hash: service id -> JSON [`UserService`],
//!   written with `HSETNX` so a selection is never duplicated
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{
    AsyncCommands, Client,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    models::{
        Category, Service, User, UserService, sort_categories, sort_services, sort_user_services,
    },
    utils::mask_phone,
};

const CATEGORIES_KEY: &str = "smpl:categories";
const SERVICES_KEY: &str = "smpl:services";
const USERS_KEY: &str = "smpl:users";
const USER_PHONES_KEY: &str = "smpl:user_phones";
const USER_SERVICES_PREFIX: &str = "smpl:user_services:";

const CONNECTION_RETRIES: usize = 1;
const CONNECTION_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0} not found")]
    NotFound(String),
}

pub type DbResult<T> = Result<T, DatabaseError>;

#[async_trait]
pub trait DatabaseClient: Send + Sync {
    async fn ping(&self) -> DbResult<()>;

    async fn find_user_by_phone(&self, phone_number: &str) -> DbResult<Option<User>>;

    async fn get_user(&self, user_id: Uuid) -> DbResult<Option<User>>;

    /// Returns the existing user when the phone number is already registered.
    async fn create_user(&self, phone_number: &str, now: DateTime<Utc>) -> DbResult<User>;

    async fn record_login(&self, user_id: Uuid, at: DateTime<Utc>) -> DbResult<User>;

    async fn upsert_category(&self, category: &Category) -> DbResult<()>;

    async fn upsert_service(&self, service: &Service) -> DbResult<()>;

    async fn list_categories(&self) -> DbResult<Vec<Category>>;

    async fn get_category(&self, category_id: &str) -> DbResult<Option<Category>>;

    async fn list_services(&self, category_id: Option<&str>) -> DbResult<Vec<Service>>;

    /// Unknown ids are skipped.
    async fn get_services(&self, service_ids: &[String]) -> DbResult<Vec<Service>>;

    async fn list_user_services(&self, user_id: Uuid) -> DbResult<Vec<UserService>>;

    /// Inserts rows that do not exist yet and returns only those.
    async fn add_user_services(
        &self,
        user_id: Uuid,
        service_ids: &[String],
        at: DateTime<Utc>,
    ) -> DbResult<Vec<UserService>>;

    /// Returns how many rows were removed.
    async fn remove_user_services(&self, user_id: Uuid, service_ids: &[String]) -> DbResult<usize>;

    /// Adds `add` and removes `remove` in one atomic write. Returns the
    /// inserted rows, like [`DatabaseClient::add_user_services`].
    async fn replace_user_services(
        &self,
        user_id: Uuid,
        add: &[String],
        remove: &[String],
        at: DateTime<Utc>,
    ) -> DbResult<Vec<UserService>>;
}

#[derive(Clone)]
pub struct RedisDatabase {
    connection: ConnectionManager,
}

impl RedisDatabase {
    pub async fn connect(redis_url: &str) -> DbResult<Self> {
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(CONNECTION_RETRIES)
            .set_connection_timeout(CONNECTION_TIMEOUT);

        let client = Client::open(redis_url)?;
        let connection = client.get_connection_manager_with_config(config).await?;

        info!("Connected to redis");

        Ok(Self { connection })
    }

    fn user_services_key(user_id: Uuid) -> String {
        format!("{USER_SERVICES_PREFIX}{user_id}")
    }

    fn selection_rows(
        user_id: Uuid,
        service_ids: &[String],
        at: DateTime<Utc>,
    ) -> Vec<UserService> {
        service_ids
            .iter()
            .map(|service_id| UserService {
                user_id,
                service_id: service_id.clone(),
                selected_at: at,
            })
            .collect()
    }

    async fn hash_values<T: serde::de::DeserializeOwned>(&self, key: &str) -> DbResult<Vec<T>> {
        let mut conn = self.connection.clone();
        let raw: Vec<String> = conn.hvals(key).await?;

        raw.iter()
            .map(|value| serde_json::from_str(value).map_err(DatabaseError::from))
            .collect()
    }

    async fn hash_get<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
        field: &str,
    ) -> DbResult<Option<T>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.hget(key, field).await?;

        raw.map(|value| serde_json::from_str(&value))
            .transpose()
            .map_err(DatabaseError::from)
    }

    async fn hash_put<T: serde::Serialize + Sync>(
        &self,
        key: &str,
        field: &str,
        value: &T,
    ) -> DbResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.hset(key, field, serde_json::to_string(value)?).await?;

        Ok(())
    }
}

#[async_trait]
impl DatabaseClient for RedisDatabase {
    async fn ping(&self) -> DbResult<()> {
        let mut conn = self.connection.clone();
        let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;

        Ok(())
    }

    async fn find_user_by_phone(&self, phone_number: &str) -> DbResult<Option<User>> {
        let mut conn = self.connection.clone();
        let user_id: Option<String> = conn.hget(USER_PHONES_KEY, phone_number).await?;

        match user_id {
            Some(user_id) => self.hash_get(USERS_KEY, &user_id).await,
            None => Ok(None),
        }
    }

    async fn get_user(&self, user_id: Uuid) -> DbResult<Option<User>> {
        self.hash_get(USERS_KEY, &user_id.to_string()).await
    }

    async fn create_user(&self, phone_number: &str, now: DateTime<Utc>) -> DbResult<User> {
        let user = User::new(phone_number.to_string(), now);
        let user_key = user.id.to_string();

        self.hash_put(USERS_KEY, &user_key, &user).await?;

        let mut conn = self.connection.clone();
        let claimed: bool = conn
            .hset_nx(USER_PHONES_KEY, phone_number, &user_key)
            .await?;

        if claimed {
            return Ok(user);
        }

        let _: usize = conn.hdel(USERS_KEY, &user_key).await?;

        let existing_id: Option<String> = conn.hget(USER_PHONES_KEY, phone_number).await?;
        let existing_id = existing_id
            .ok_or_else(|| DatabaseError::NotFound(format!("user for {}", mask_phone(phone_number))))?;

        if let Some(existing) = self.hash_get::<User>(USERS_KEY, &existing_id).await? {
            return Ok(existing);
        }

        // Phone index without a user row, left by a write that never finished.
        let id = Uuid::parse_str(&existing_id)
            .map_err(|_| DatabaseError::NotFound(format!("user {existing_id}")))?;
        let restored = User {
            id,
            ..User::new(phone_number.to_string(), now)
        };
        self.hash_put(USERS_KEY, &existing_id, &restored).await?;

        warn!(
            "Restored missing user row {existing_id} for {}",
            mask_phone(phone_number)
        );

        Ok(restored)
    }

    async fn record_login(&self, user_id: Uuid, at: DateTime<Utc>) -> DbResult<User> {
        let key = user_id.to_string();
        let mut user: User = self
            .hash_get(USERS_KEY, &key)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("user {user_id}")))?;

        user.last_login_at = Some(at);
        self.hash_put(USERS_KEY, &key, &user).await?;

        Ok(user)
    }

    async fn upsert_category(&self, category: &Category) -> DbResult<()> {
        self.hash_put(CATEGORIES_KEY, &category.id, category).await
    }

    async fn upsert_service(&self, service: &Service) -> DbResult<()> {
        self.hash_put(SERVICES_KEY, &service.id, service).await
    }

    async fn list_categories(&self) -> DbResult<Vec<Category>> {
        let mut categories: Vec<Category> = self.hash_values(CATEGORIES_KEY).await?;
        sort_categories(&mut categories);

        Ok(categories)
    }

    async fn get_category(&self, category_id: &str) -> DbResult<Option<Category>> {
        self.hash_get(CATEGORIES_KEY, category_id).await
    }

    async fn list_services(&self, category_id: Option<&str>) -> DbResult<Vec<Service>> {
        let mut services: Vec<Service> = self.hash_values(SERVICES_KEY).await?;

        if let Some(category_id) = category_id {
            services.retain(|service| service.category_id == category_id);
        }
        sort_services(&mut services);

        Ok(services)
    }

    async fn get_services(&self, service_ids: &[String]) -> DbResult<Vec<Service>> {
        if service_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection.clone();
        let raw: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(SERVICES_KEY)
            .arg(service_ids)
            .query_async(&mut conn)
            .await?;

        raw.into_iter()
            .flatten()
            .map(|value| serde_json::from_str(&value).map_err(DatabaseError::from))
            .collect()
    }

    async fn list_user_services(&self, user_id: Uuid) -> DbResult<Vec<UserService>> {
        let mut rows: Vec<UserService> = self
            .hash_values(&Self::user_services_key(user_id))
            .await?;
        sort_user_services(&mut rows);

        Ok(rows)
    }

    async fn add_user_services(
        &self,
        user_id: Uuid,
        service_ids: &[String],
        at: DateTime<Utc>,
    ) -> DbResult<Vec<UserService>> {
        if service_ids.is_empty() {
            return Ok(Vec::new());
        }

        let key = Self::user_services_key(user_id);
        let rows = Self::selection_rows(user_id, service_ids, at);

        let mut pipe = redis::pipe();
        for row in &rows {
            pipe.hset_nx(&key, &row.service_id, serde_json::to_string(row)?);
        }

        let mut conn = self.connection.clone();
        let inserted: Vec<bool> = pipe.query_async(&mut conn).await?;

        Ok(rows
            .into_iter()
            .zip(inserted)
            .filter_map(|(row, inserted)| inserted.then_some(row))
            .collect())
    }

    async fn remove_user_services(
        &self,
        user_id: Uuid,
        service_ids: &[String],
    ) -> DbResult<usize> {
        if service_ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection.clone();
        let removed: usize = conn
            .hdel(Self::user_services_key(user_id), service_ids)
            .await?;

        Ok(removed)
    }

    async fn replace_user_services(
        &self,
        user_id: Uuid,
        add: &[String],
        remove: &[String],
        at: DateTime<Utc>,
    ) -> DbResult<Vec<UserService>> {
        if add.is_empty() && remove.is_empty() {
            return Ok(Vec::new());
        }

        let key = Self::user_services_key(user_id);
        let rows = Self::selection_rows(user_id, add, at);

        let mut pipe = redis::pipe();
        pipe.atomic();
        for row in &rows {
            pipe.hset_nx(&key, &row.service_id, serde_json::to_string(row)?);
        }
        if !remove.is_empty() {
            pipe.hdel(&key, remove).ignore();
        }

        let mut conn = self.connection.clone();
        let inserted: Vec<bool> = pipe.query_async(&mut conn).await?;

        Ok(rows
            .into_iter()
            .zip(inserted)
            .filter_map(|(row, inserted)| inserted.then_some(row))
            .collect())
    }
}
