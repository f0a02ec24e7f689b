use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    /// E.164, e.g. `+15551234567`.
    pub phone_number: String,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(phone_number: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            phone_number,
            created_at: now,
            last_login_at: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub icon: Option<String>,
    pub display_order: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    pub category_id: String,
    pub name: String,
    #[serde(default)]
    pub logo_url: Option<String>,
    #[serde(default)]
    pub website_url: Option<String>,
    #[serde(default)]
    pub estimated_monthly_cost_cents: Option<u32>,
    pub display_order: u32,
}

/// One row per (user, service) the user pays for.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserService {
    pub user_id: Uuid,
    pub service_id: String,
    pub selected_at: DateTime<Utc>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CategoryWithServices {
    #[serde(flatten)]
    pub category: Category,
    pub services: Vec<Service>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SelectedService {
    pub service: Service,
    pub selected_at: DateTime<Utc>,
}

pub(crate) fn sort_categories(categories: &mut [Category]) {
    categories.sort_by(|a, b| {
        a.display_order
            .cmp(&b.display_order)
            .then_with(|| a.name.cmp(&b.name))
    });
}

pub(crate) fn sort_services(services: &mut [Service]) {
    services.sort_by(|a, b| {
        a.display_order
            .cmp(&b.display_order)
            .then_with(|| a.name.cmp(&b.name))
    });
}

pub(crate) fn sort_user_services(rows: &mut [UserService]) {
    rows.sort_by(|a, b| {
        a.selected_at
            .cmp(&b.selected_at)
            .then_with(|| a.service_id.cmp(&b.service_id))
    });
}
