use std::sync::Arc;

use actix_web::cookie::Key;
use anyhow::{Context, Result};
use tera::Tera;

use crate::config::AppConfig;
use crate::delivery::DeliveryPipeline;
use crate::{flash, handlers};

pub struct AppState {
    pub config: Arc<AppConfig>,
    pub pipeline: Arc<DeliveryPipeline>,
    pub flash_key: Key,
    pub templates: Tera,
}

impl AppState {
    pub fn new(config: AppConfig) -> Result<Self> {
        let pipeline = DeliveryPipeline::from_config(&config);
        Self::with_pipeline(config, pipeline)
    }

    pub fn with_pipeline(config: AppConfig, pipeline: DeliveryPipeline) -> Result<Self> {
        let templates = handlers::templates().context("Failed to load page templates")?;
        Ok(Self {
            flash_key: flash::key_from_secret(config.secret_key.as_deref()),
            pipeline: Arc::new(pipeline),
            config: Arc::new(config),
            templates,
        })
    }
}
