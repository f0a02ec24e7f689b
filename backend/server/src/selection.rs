use std::{collections::HashSet, sync::Arc};

use chrono::Utc;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::{
    database::DatabaseClient,
    error::AppError,
    models::SelectedService,
    utils::dedupe_ids,
};

pub const MAX_SERVICES_PER_REQUEST: usize = 100;

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SelectionOutcome {
    pub added: Vec<String>,
    pub already_selected: Vec<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CategorySelection {
    pub category_id: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Everything selected in the category afterwards.
    pub service_ids: Vec<String>,
}

pub struct ServiceSelectionService {
    database: Arc<dyn DatabaseClient>,
}

impl ServiceSelectionService {
    pub fn new(database: Arc<dyn DatabaseClient>) -> Self {
        Self { database }
    }

    pub async fn list(&self, user_id: Uuid) -> Result<Vec<SelectedService>, AppError> {
        let rows = self.database.list_user_services(user_id).await?;
        let ids: Vec<String> = rows.iter().map(|row| row.service_id.clone()).collect();
        let services = self.database.get_services(&ids).await?;

        // Selections of services dropped from the catalog are skipped.
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                services
                    .iter()
                    .find(|service| service.id == row.service_id)
                    .map(|service| SelectedService {
                        service: service.clone(),
                        selected_at: row.selected_at,
                    })
            })
            .collect())
    }

    pub async fn select(
        &self,
        user_id: Uuid,
        service_ids: &[String],
    ) -> Result<SelectionOutcome, AppError> {
        let ids = bounded_ids(service_ids, false)?;
        self.resolve(&ids, None).await?;

        let inserted = self
            .database
            .add_user_services(user_id, &ids, Utc::now())
            .await?;
        let inserted_ids: HashSet<&str> =
            inserted.iter().map(|row| row.service_id.as_str()).collect();

        let (added, already_selected): (Vec<String>, Vec<String>) = ids
            .iter()
            .cloned()
            .partition(|id| inserted_ids.contains(id.as_str()));

        info!(
            "User {user_id} selected {} services ({} already selected)",
            added.len(),
            already_selected.len()
        );

        Ok(SelectionOutcome {
            added,
            already_selected,
        })
    }

    /// Idempotent; returns whether a selection was removed.
    pub async fn deselect(&self, user_id: Uuid, service_id: &str) -> Result<bool, AppError> {
        let removed = self
            .database
            .remove_user_services(user_id, &[service_id.trim().to_string()])
            .await?;

        Ok(removed > 0)
    }

    /// Makes `service_ids` the user's exact selection within one category.
    pub async fn set_category_selections(
        &self,
        user_id: Uuid,
        category_id: &str,
        service_ids: &[String],
    ) -> Result<CategorySelection, AppError> {
        let category = self
            .database
            .get_category(category_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Category {category_id}")))?;

        let ids = bounded_ids(service_ids, true)?;
        self.resolve(&ids, Some(category.id.as_str())).await?;

        let in_category: HashSet<String> = self
            .database
            .list_services(Some(category.id.as_str()))
            .await?
            .into_iter()
            .map(|service| service.id)
            .collect();

        let current: Vec<String> = self
            .database
            .list_user_services(user_id)
            .await?
            .into_iter()
            .map(|row| row.service_id)
            .filter(|id| in_category.contains(id))
            .collect();

        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let removed: Vec<String> = current
            .iter()
            .filter(|id| !wanted.contains(id.as_str()))
            .cloned()
            .collect();

        let inserted = self
            .database
            .replace_user_services(user_id, &ids, &removed, Utc::now())
            .await?;

        info!(
            "User {user_id} set {} selections in {} (+{} -{})",
            ids.len(),
            category.id,
            inserted.len(),
            removed.len()
        );

        Ok(CategorySelection {
            category_id: category.id,
            added: inserted.into_iter().map(|row| row.service_id).collect(),
            removed,
            service_ids: ids,
        })
    }

    /// Fails with every id that is unknown or outside `category_id`.
    async fn resolve(&self, ids: &[String], category_id: Option<&str>) -> Result<(), AppError> {
        let services = self.database.get_services(ids).await?;

        let valid: HashSet<&str> = services
            .iter()
            .filter(|service| category_id.map_or(true, |id| service.category_id == id))
            .map(|service| service.id.as_str())
            .collect();

        let unknown: Vec<String> = ids
            .iter()
            .filter(|id| !valid.contains(id.as_str()))
            .cloned()
            .collect();

        if !unknown.is_empty() {
            return Err(AppError::UnknownServices(unknown));
        }

        Ok(())
    }
}

fn bounded_ids(service_ids: &[String], allow_empty: bool) -> Result<Vec<String>, AppError> {
    let ids = dedupe_ids(service_ids);

    if (ids.is_empty() && !allow_empty) || ids.len() > MAX_SERVICES_PER_REQUEST {
        return Err(AppError::MalformedPayload);
    }

    Ok(ids)
}
