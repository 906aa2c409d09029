use chrono::Utc;
use labportal::config::AppConfig;
use labportal::error::AppError;
use labportal::portal::{
    InMemoryAuditLog, InMemoryPortalRepository, LabPortalService, StaffId, TestCatalog,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::fs::File;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

pub(crate) type MemoryPortal = LabPortalService<InMemoryPortalRepository, InMemoryAuditLog>;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// Load the catalog from CSV when a path is given, otherwise use the built-in menu.
pub(crate) fn load_catalog(path: Option<&Path>) -> Result<TestCatalog, AppError> {
    match path {
        Some(path) => {
            let file = File::open(path)?;
            let catalog = TestCatalog::from_reader(file)?;
            info!(path = %path.display(), tests = catalog.len(), "loaded test catalog");
            Ok(catalog)
        }
        None => Ok(TestCatalog::standard()),
    }
}

/// Build the portal service over in-memory storage and seed the bootstrap admin.
pub(crate) fn build_portal(config: &AppConfig) -> Result<MemoryPortal, AppError> {
    let catalog = load_catalog(config.portal.catalog_csv.as_deref())?;
    let service = LabPortalService::new(
        Arc::new(InMemoryPortalRepository::default()),
        Arc::new(InMemoryAuditLog::default()),
        catalog,
        config.portal.policy(),
    );

    service.seed_admin(
        &StaffId(config.portal.admin_staff_id.clone()),
        "Administrator",
        Utc::now(),
    )?;
    Ok(service)
}
