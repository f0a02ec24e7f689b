//! # Progress
//!
//! How far a user is toward the savings dashboard. A category counts as
//! completed once the user has marked at least one service in it; the
//! dashboard unlocks when every category is completed.
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use serde::Serialize;
use uuid::Uuid;

use crate::{
    database::DatabaseClient,
    error::AppError,
    models::{Category, Service, UserService},
};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    NotStarted,
    Completed,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CategoryProgress {
    pub category_id: String,
    pub category_name: String,
    pub total_services: usize,
    pub selected_services: usize,
    pub status: CompletionStatus,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSummary {
    pub categories: Vec<CategoryProgress>,
    pub completed_categories: usize,
    pub total_categories: usize,
    /// 0..=100, rounded half up.
    pub completion_percentage: u8,
    pub is_complete: bool,
    pub next_category_id: Option<String>,
    pub estimated_monthly_spend_cents: u64,
}

pub struct ProgressService {
    database: Arc<dyn DatabaseClient>,
}

impl ProgressService {
    pub fn new(database: Arc<dyn DatabaseClient>) -> Self {
        Self { database }
    }

    pub async fn for_user(&self, user_id: Uuid) -> Result<ProgressSummary, AppError> {
        let categories = self.database.list_categories().await?;
        let services = self.database.list_services(None).await?;
        let selections = self.database.list_user_services(user_id).await?;

        Ok(compute(&categories, &services, &selections))
    }
}

/// `categories` are expected in display order.
pub fn compute(
    categories: &[Category],
    services: &[Service],
    selections: &[UserService],
) -> ProgressSummary {
    let selected: HashSet<&str> = selections
        .iter()
        .map(|row| row.service_id.as_str())
        .collect();

    let mut totals: HashMap<&str, (usize, usize)> = HashMap::new();
    let mut estimated_monthly_spend_cents = 0u64;

    for service in services {
        let (total, chosen) = totals.entry(service.category_id.as_str()).or_default();
        *total += 1;

        if selected.contains(service.id.as_str()) {
            *chosen += 1;
            estimated_monthly_spend_cents +=
                u64::from(service.estimated_monthly_cost_cents.unwrap_or(0));
        }
    }

    let categories: Vec<CategoryProgress> = categories
        .iter()
        .map(|category| {
            let (total_services, selected_services) = totals
                .get(category.id.as_str())
                .copied()
                .unwrap_or_default();

            CategoryProgress {
                category_id: category.id.clone(),
                category_name: category.name.clone(),
                total_services,
                selected_services,
                status: if selected_services > 0 {
                    CompletionStatus::Completed
                } else {
                    CompletionStatus::NotStarted
                },
            }
        })
        .collect();

    let total_categories = categories.len();
    let completed_categories = categories
        .iter()
        .filter(|progress| progress.status == CompletionStatus::Completed)
        .count();

    let next_category_id = categories
        .iter()
        .find(|progress| progress.status == CompletionStatus::NotStarted)
        .map(|progress| progress.category_id.clone());

    ProgressSummary {
        completion_percentage: percentage(completed_categories, total_categories),
        is_complete: total_categories > 0 && completed_categories == total_categories,
        categories,
        completed_categories,
        total_categories,
        next_category_id,
        estimated_monthly_spend_cents,
    }
}

fn percentage(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }

    let rounded = (completed.min(total) * 100 + total / 2) / total;

    rounded as u8
}
