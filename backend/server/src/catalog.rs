//! # Catalog
//!
//! Categories and services offered to users. The bundled `catalog.json` is
//! compiled in and upserted into storage on every startup, so editing the file
//! and redeploying is how the catalog changes.
use std::collections::HashSet;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::{
    database::{DatabaseClient, DatabaseError},
    models::{Category, Service},
};

const BUNDLED_CATALOG: &str = include_str!("../catalog.json");

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("catalog is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("duplicate {kind} id '{id}'")]
    DuplicateId { kind: &'static str, id: String },

    #[error("service '{service_id}' references unknown category '{category_id}'")]
    UnknownCategory {
        service_id: String,
        category_id: String,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

#[derive(Deserialize, Debug, Clone)]
pub struct Catalog {
    pub categories: Vec<Category>,
    pub services: Vec<Service>,
}

impl Catalog {
    pub fn bundled() -> Result<Self, CatalogError> {
        Self::from_json(BUNDLED_CATALOG)
    }

    pub fn from_json(raw: &str) -> Result<Self, CatalogError> {
        let catalog: Catalog = serde_json::from_str(raw)?;
        catalog.validate()?;

        Ok(catalog)
    }

    fn validate(&self) -> Result<(), CatalogError> {
        let mut category_ids = HashSet::new();
        for category in &self.categories {
            if !category_ids.insert(category.id.as_str()) {
                return Err(CatalogError::DuplicateId {
                    kind: "category",
                    id: category.id.clone(),
                });
            }
        }

        let mut service_ids = HashSet::new();
        for service in &self.services {
            if !service_ids.insert(service.id.as_str()) {
                return Err(CatalogError::DuplicateId {
                    kind: "service",
                    id: service.id.clone(),
                });
            }

            if !category_ids.contains(service.category_id.as_str()) {
                return Err(CatalogError::UnknownCategory {
                    service_id: service.id.clone(),
                    category_id: service.category_id.clone(),
                });
            }
        }

        Ok(())
    }
}

pub async fn seed_catalog(
    database: &dyn DatabaseClient,
    catalog: &Catalog,
) -> Result<(), CatalogError> {
    for category in &catalog.categories {
        database.upsert_category(category).await?;
    }

    for service in &catalog.services {
        database.upsert_service(service).await?;
    }

    info!(
        "Seeded catalog: {} categories, {} services",
        catalog.categories.len(),
        catalog.services.len()
    );

    Ok(())
}
