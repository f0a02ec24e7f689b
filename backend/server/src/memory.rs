//! In-process [`DatabaseClient`] for local development and tests.
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::{
    database::{DatabaseClient, DatabaseError, DbResult},
    models::{
        Category, Service, User, UserService, sort_categories, sort_services, sort_user_services,
    },
};

#[derive(Default)]
struct Tables {
    categories: HashMap<String, Category>,
    services: HashMap<String, Service>,
    users: HashMap<Uuid, User>,
    user_phones: HashMap<String, Uuid>,
    user_services: HashMap<Uuid, BTreeMap<String, UserService>>,
}

impl Tables {
    fn insert_selections(
        &mut self,
        user_id: Uuid,
        service_ids: &[String],
        at: DateTime<Utc>,
    ) -> Vec<UserService> {
        let rows = self.user_services.entry(user_id).or_default();

        let mut inserted = Vec::new();
        for service_id in service_ids {
            if rows.contains_key(service_id) {
                continue;
            }

            let row = UserService {
                user_id,
                service_id: service_id.clone(),
                selected_at: at,
            };
            rows.insert(service_id.clone(), row.clone());
            inserted.push(row);
        }

        inserted
    }

    fn delete_selections(&mut self, user_id: Uuid, service_ids: &[String]) -> usize {
        let Some(rows) = self.user_services.get_mut(&user_id) else {
            return 0;
        };

        service_ids
            .iter()
            .filter(|id| rows.remove(id.as_str()).is_some())
            .count()
    }
}

#[derive(Default)]
pub struct MemoryDatabase {
    tables: RwLock<Tables>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops a service from the catalog, leaving any selections of it behind.
    pub fn remove_service(&self, service_id: &str) -> Option<Service> {
        self.tables.write().services.remove(service_id)
    }
}

#[async_trait]
impl DatabaseClient for MemoryDatabase {
    async fn ping(&self) -> DbResult<()> {
        Ok(())
    }

    async fn find_user_by_phone(&self, phone_number: &str) -> DbResult<Option<User>> {
        let tables = self.tables.read();

        Ok(tables
            .user_phones
            .get(phone_number)
            .and_then(|id| tables.users.get(id))
            .cloned())
    }

    async fn get_user(&self, user_id: Uuid) -> DbResult<Option<User>> {
        Ok(self.tables.read().users.get(&user_id).cloned())
    }

    async fn create_user(&self, phone_number: &str, now: DateTime<Utc>) -> DbResult<User> {
        let mut tables = self.tables.write();

        if let Some(existing) = tables
            .user_phones
            .get(phone_number)
            .and_then(|id| tables.users.get(id))
        {
            return Ok(existing.clone());
        }

        let user = User::new(phone_number.to_string(), now);
        tables.user_phones.insert(phone_number.to_string(), user.id);
        tables.users.insert(user.id, user.clone());

        Ok(user)
    }

    async fn record_login(&self, user_id: Uuid, at: DateTime<Utc>) -> DbResult<User> {
        let mut tables = self.tables.write();
        let user = tables
            .users
            .get_mut(&user_id)
            .ok_or_else(|| DatabaseError::NotFound(format!("user {user_id}")))?;

        user.last_login_at = Some(at);

        Ok(user.clone())
    }

    async fn upsert_category(&self, category: &Category) -> DbResult<()> {
        self.tables
            .write()
            .categories
            .insert(category.id.clone(), category.clone());

        Ok(())
    }

    async fn upsert_service(&self, service: &Service) -> DbResult<()> {
        self.tables
            .write()
            .services
            .insert(service.id.clone(), service.clone());

        Ok(())
    }

    async fn list_categories(&self) -> DbResult<Vec<Category>> {
        let mut categories: Vec<Category> =
            self.tables.read().categories.values().cloned().collect();
        sort_categories(&mut categories);

        Ok(categories)
    }

    async fn get_category(&self, category_id: &str) -> DbResult<Option<Category>> {
        Ok(self.tables.read().categories.get(category_id).cloned())
    }

    async fn list_services(&self, category_id: Option<&str>) -> DbResult<Vec<Service>> {
        let mut services: Vec<Service> = self
            .tables
            .read()
            .services
            .values()
            .filter(|service| category_id.map_or(true, |id| service.category_id == id))
            .cloned()
            .collect();
        sort_services(&mut services);

        Ok(services)
    }

    async fn get_services(&self, service_ids: &[String]) -> DbResult<Vec<Service>> {
        let tables = self.tables.read();

        Ok(service_ids
            .iter()
            .filter_map(|id| tables.services.get(id))
            .cloned()
            .collect())
    }

    async fn list_user_services(&self, user_id: Uuid) -> DbResult<Vec<UserService>> {
        let mut rows: Vec<UserService> = self
            .tables
            .read()
            .user_services
            .get(&user_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        sort_user_services(&mut rows);

        Ok(rows)
    }

    async fn add_user_services(
        &self,
        user_id: Uuid,
        service_ids: &[String],
        at: DateTime<Utc>,
    ) -> DbResult<Vec<UserService>> {
        Ok(self.tables.write().insert_selections(user_id, service_ids, at))
    }

    async fn remove_user_services(&self, user_id: Uuid, service_ids: &[String]) -> DbResult<usize> {
        Ok(self.tables.write().delete_selections(user_id, service_ids))
    }

    async fn replace_user_services(
        &self,
        user_id: Uuid,
        add: &[String],
        remove: &[String],
        at: DateTime<Utc>,
    ) -> DbResult<Vec<UserService>> {
        let mut tables = self.tables.write();

        let inserted = tables.insert_selections(user_id, add, at);
        tables.delete_selections(user_id, remove);

        Ok(inserted)
    }
}
