//! Lab results portal: front-desk registration, payment confirmation, bench entry, scientist
//! review, psychologist assessment, and access-code-gated retrieval for patients.

pub mod access;
pub mod catalog;
pub mod domain;
pub mod memory;
pub mod repository;
pub(crate) mod review;
pub mod router;
pub mod service;

#[cfg(test)]
mod tests;

pub use access::{AccessError, PortalPolicy, ACCESS_CODE_LENGTH, MAX_ACCESS_CODE_TTL_HOURS};
pub use catalog::{AnalyteDefinition, CatalogError, TestCatalog, TestDefinition};
pub use domain::{
    AccessCode, AccessGrant, AccessGrantView, AuditAction, AuditEvent, LabResultRecord,
    MeasuredValue, NewStaffMember, PatientId, PatientOverview, PatientRecord,
    PatientRegistration, PatientResults, PaymentRecord, PaymentReference, PaymentStatus,
    Registration, ReleasedResultView, ResultEntry, ResultFlag, ResultId, ResultStatus,
    ReviewDecision, StaffAction, StaffId, StaffMember, StaffRole,
};
pub use memory::{InMemoryAuditLog, InMemoryPortalRepository};
pub use repository::{AuditError, AuditSink, PortalRepository, RepositoryError};
pub use review::ReviewError;
pub use router::{portal_router, STAFF_HEADER};
pub use service::{LabPortalService, PortalServiceError};
