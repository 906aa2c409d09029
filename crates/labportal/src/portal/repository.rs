use super::domain::{
    AccessCode, AccessGrant, AuditEvent, LabResultRecord, PatientId, PatientRecord,
    PaymentRecord, PaymentReference, Registration, ResultId, ResultStatus, StaffId,
    StaffMember,
};

/// Storage abstraction so the service can run against memory in tests and a database in
/// deployments.
///
/// The `*_with` methods run a check-and-update against the stored record as one step: the
/// closure sees the current record, and the change is kept only when it returns `Ok`.
/// They return `Ok(None)` when no record matches.
pub trait PortalRepository: Send + Sync {
    fn insert_staff(&self, staff: StaffMember) -> Result<StaffMember, RepositoryError>;
    fn update_staff(&self, staff: StaffMember) -> Result<(), RepositoryError>;
    fn fetch_staff(&self, id: &StaffId) -> Result<Option<StaffMember>, RepositoryError>;

    /// Store a patient together with the invoice and ordered results, all or nothing.
    fn insert_registration(
        &self,
        registration: Registration,
    ) -> Result<Registration, RepositoryError>;
    fn fetch_patient(&self, id: &PatientId) -> Result<Option<PatientRecord>, RepositoryError>;

    fn update_result_with<T, E, F>(&self, id: &ResultId, apply: F) -> Result<Option<T>, E>
    where
        F: FnOnce(&mut LabResultRecord) -> Result<T, E>,
        E: From<RepositoryError>;
    fn fetch_result(&self, id: &ResultId) -> Result<Option<LabResultRecord>, RepositoryError>;
    fn results_for_patient(
        &self,
        patient: &PatientId,
    ) -> Result<Vec<LabResultRecord>, RepositoryError>;
    fn results_with_status(
        &self,
        status: ResultStatus,
        limit: usize,
    ) -> Result<Vec<LabResultRecord>, RepositoryError>;

    fn update_payment_with<T, E, F>(
        &self,
        reference: &PaymentReference,
        apply: F,
    ) -> Result<Option<T>, E>
    where
        F: FnOnce(&mut PaymentRecord) -> Result<T, E>,
        E: From<RepositoryError>;
    fn fetch_payment(
        &self,
        reference: &PaymentReference,
    ) -> Result<Option<PaymentRecord>, RepositoryError>;
    fn payments_for_patient(
        &self,
        patient: &PatientId,
    ) -> Result<Vec<PaymentRecord>, RepositoryError>;

    fn insert_grant(&self, grant: AccessGrant) -> Result<AccessGrant, RepositoryError>;
    fn update_grant_with<T, E, F>(&self, code: &AccessCode, apply: F) -> Result<Option<T>, E>
    where
        F: FnOnce(&mut AccessGrant) -> Result<T, E>,
        E: From<RepositoryError>;
    fn fetch_grant(&self, code: &AccessCode) -> Result<Option<AccessGrant>, RepositoryError>;
    fn grants_for_payment(
        &self,
        reference: &PaymentReference,
    ) -> Result<Vec<AccessGrant>, RepositoryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("record already exists")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

/// Destination for audit events (database table, log shipper, ...).
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError>;
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit sink unavailable: {0}")]
    Transport(String),
}
