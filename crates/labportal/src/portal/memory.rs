use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::domain::{
    AccessCode, AccessGrant, AuditEvent, LabResultRecord, PatientId, PatientRecord,
    PaymentRecord, PaymentReference, Registration, ResultId, ResultStatus, StaffId,
    StaffMember,
};
use super::repository::{AuditError, AuditSink, PortalRepository, RepositoryError};

#[derive(Default)]
struct Tables {
    staff: BTreeMap<StaffId, StaffMember>,
    patients: BTreeMap<PatientId, PatientRecord>,
    results: BTreeMap<ResultId, LabResultRecord>,
    payments: BTreeMap<PaymentReference, PaymentRecord>,
    grants: BTreeMap<AccessCode, AccessGrant>,
}

/// Process-local repository used by the demo, the dev server, and tests.
#[derive(Default, Clone)]
pub struct InMemoryPortalRepository {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryPortalRepository {
    fn tables(&self) -> Result<MutexGuard<'_, Tables>, RepositoryError> {
        self.tables
            .lock()
            .map_err(|_| RepositoryError::Unavailable("repository mutex poisoned".to_string()))
    }
}

fn insert_new<K: Ord, V: Clone>(
    table: &mut BTreeMap<K, V>,
    key: K,
    value: V,
) -> Result<V, RepositoryError> {
    if table.contains_key(&key) {
        return Err(RepositoryError::Conflict);
    }
    table.insert(key, value.clone());
    Ok(value)
}

fn replace<K: Ord, V>(table: &mut BTreeMap<K, V>, key: K, value: V) -> Result<(), RepositoryError> {
    match table.get_mut(&key) {
        Some(slot) => {
            *slot = value;
            Ok(())
        }
        None => Err(RepositoryError::NotFound),
    }
}

/// Run `apply` on a copy of the stored value and keep the copy only on success.
fn update_with<K: Ord, V: Clone, T, E>(
    table: &mut BTreeMap<K, V>,
    key: &K,
    apply: impl FnOnce(&mut V) -> Result<T, E>,
) -> Result<Option<T>, E> {
    let Some(slot) = table.get_mut(key) else {
        return Ok(None);
    };
    let mut draft = slot.clone();
    let outcome = apply(&mut draft)?;
    *slot = draft;
    Ok(Some(outcome))
}

/// Sequence ids are zero-padded, so a longer id was issued later.
fn sequence_order(left: &ResultId, right: &ResultId) -> std::cmp::Ordering {
    left.0
        .len()
        .cmp(&right.0.len())
        .then_with(|| left.0.cmp(&right.0))
}

impl PortalRepository for InMemoryPortalRepository {
    fn insert_staff(&self, staff: StaffMember) -> Result<StaffMember, RepositoryError> {
        let mut tables = self.tables()?;
        insert_new(&mut tables.staff, staff.staff_id.clone(), staff)
    }

    fn update_staff(&self, staff: StaffMember) -> Result<(), RepositoryError> {
        let mut tables = self.tables()?;
        replace(&mut tables.staff, staff.staff_id.clone(), staff)
    }

    fn fetch_staff(&self, id: &StaffId) -> Result<Option<StaffMember>, RepositoryError> {
        Ok(self.tables()?.staff.get(id).cloned())
    }

    fn insert_registration(
        &self,
        registration: Registration,
    ) -> Result<Registration, RepositoryError> {
        let mut tables = self.tables()?;
        let mut result_ids = BTreeSet::new();
        let clashes = tables
            .patients
            .contains_key(&registration.patient.patient_id)
            || tables.payments.contains_key(&registration.payment.reference)
            || registration.results.iter().any(|result| {
                !result_ids.insert(&result.result_id)
                    || tables.results.contains_key(&result.result_id)
            });
        if clashes {
            return Err(RepositoryError::Conflict);
        }

        tables.patients.insert(
            registration.patient.patient_id.clone(),
            registration.patient.clone(),
        );
        tables.payments.insert(
            registration.payment.reference.clone(),
            registration.payment.clone(),
        );
        for result in &registration.results {
            tables
                .results
                .insert(result.result_id.clone(), result.clone());
        }
        Ok(registration)
    }

    fn fetch_patient(&self, id: &PatientId) -> Result<Option<PatientRecord>, RepositoryError> {
        Ok(self.tables()?.patients.get(id).cloned())
    }

    fn update_result_with<T, E, F>(&self, id: &ResultId, apply: F) -> Result<Option<T>, E>
    where
        F: FnOnce(&mut LabResultRecord) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        let mut tables = self.tables()?;
        update_with(&mut tables.results, id, apply)
    }

    fn fetch_result(&self, id: &ResultId) -> Result<Option<LabResultRecord>, RepositoryError> {
        Ok(self.tables()?.results.get(id).cloned())
    }

    fn results_for_patient(
        &self,
        patient: &PatientId,
    ) -> Result<Vec<LabResultRecord>, RepositoryError> {
        Ok(self
            .tables()?
            .results
            .values()
            .filter(|result| &result.patient_id == patient)
            .cloned()
            .collect())
    }

    fn results_with_status(
        &self,
        status: ResultStatus,
        limit: usize,
    ) -> Result<Vec<LabResultRecord>, RepositoryError> {
        let tables = self.tables()?;
        let mut matching: Vec<_> = tables
            .results
            .values()
            .filter(|result| result.status == status)
            .collect();
        matching.sort_by(|left, right| sequence_order(&left.result_id, &right.result_id));
        Ok(matching.into_iter().take(limit).cloned().collect())
    }

    fn update_payment_with<T, E, F>(
        &self,
        reference: &PaymentReference,
        apply: F,
    ) -> Result<Option<T>, E>
    where
        F: FnOnce(&mut PaymentRecord) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        let mut tables = self.tables()?;
        update_with(&mut tables.payments, reference, apply)
    }

    fn fetch_payment(
        &self,
        reference: &PaymentReference,
    ) -> Result<Option<PaymentRecord>, RepositoryError> {
        Ok(self.tables()?.payments.get(reference).cloned())
    }

    fn payments_for_patient(
        &self,
        patient: &PatientId,
    ) -> Result<Vec<PaymentRecord>, RepositoryError> {
        Ok(self
            .tables()?
            .payments
            .values()
            .filter(|payment| &payment.patient_id == patient)
            .cloned()
            .collect())
    }

    fn insert_grant(&self, grant: AccessGrant) -> Result<AccessGrant, RepositoryError> {
        let mut tables = self.tables()?;
        insert_new(&mut tables.grants, grant.code.clone(), grant)
    }

    fn update_grant_with<T, E, F>(&self, code: &AccessCode, apply: F) -> Result<Option<T>, E>
    where
        F: FnOnce(&mut AccessGrant) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        let mut tables = self.tables()?;
        update_with(&mut tables.grants, code, apply)
    }

    fn fetch_grant(&self, code: &AccessCode) -> Result<Option<AccessGrant>, RepositoryError> {
        Ok(self.tables()?.grants.get(code).cloned())
    }

    fn grants_for_payment(
        &self,
        reference: &PaymentReference,
    ) -> Result<Vec<AccessGrant>, RepositoryError> {
        Ok(self
            .tables()?
            .grants
            .values()
            .filter(|grant| &grant.payment_reference == reference)
            .cloned()
            .collect())
    }
}

/// Audit sink that keeps events in memory.
#[derive(Default, Clone)]
pub struct InMemoryAuditLog {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl AuditSink for InMemoryAuditLog {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| AuditError::Transport("audit mutex poisoned".to_string()))?;
        events.push(event);
        Ok(())
    }
}

impl InMemoryAuditLog {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}
