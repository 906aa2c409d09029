use std::sync::Arc;

use chrono::Duration;

use super::common::*;
use crate::portal::access::AccessError;
use crate::portal::catalog::{CatalogError, TestCatalog};
use crate::portal::domain::{
    AuditAction, NewStaffMember, PaymentStatus, ResultFlag, ResultStatus, ReviewDecision,
    StaffAction, StaffRole,
};
use crate::portal::memory::InMemoryPortalRepository;
use crate::portal::repository::{PortalRepository, RepositoryError};
use crate::portal::review::ReviewError;
use crate::portal::{LabPortalService, PortalPolicy, PortalServiceError};

#[test]
fn register_patient_raises_invoice_and_opens_results() {
    let (service, repository, audit) = build_service();

    let registration = service
        .register_patient(&staff(DESK), registration(&["fbc", " MP "]), now())
        .expect("registration succeeds");

    assert_eq!(registration.payment.amount_due, 11_000);
    assert_eq!(registration.payment.status, PaymentStatus::Pending);
    assert!(registration.payment.reference.0.starts_with("PAY-"));
    assert_eq!(registration.patient.referring_clinic, None);
    assert_eq!(registration.results.len(), 2);
    assert!(registration
        .results
        .iter()
        .all(|result| result.status == ResultStatus::AwaitingEntry));

    let stored = repository
        .results_for_patient(&registration.patient.patient_id)
        .expect("fetch succeeds");
    assert_eq!(stored.len(), 2);

    let last = audit.events().pop().expect("audit event recorded");
    assert_eq!(last.action, AuditAction::PatientRegistered);
    assert_eq!(last.actor, format!("staff:{DESK}"));
    assert_eq!(last.details.get("tests").map(String::as_str), Some("FBC,MP"));
}

#[test]
fn registration_validates_form_and_test_codes() {
    let (service, _, _) = build_service();

    let mut blank_name = registration(&["FBC"]);
    blank_name.full_name = "  ".to_string();
    assert!(matches!(
        service.register_patient(&staff(DESK), blank_name, now()),
        Err(PortalServiceError::InvalidRequest(_))
    ));

    assert!(matches!(
        service.register_patient(&staff(DESK), registration(&[]), now()),
        Err(PortalServiceError::InvalidRequest(_))
    ));

    assert!(matches!(
        service.register_patient(&staff(DESK), registration(&["FBC", "fbc"]), now()),
        Err(PortalServiceError::InvalidRequest(message)) if message.contains("FBC")
    ));

    assert!(matches!(
        service.register_patient(&staff(DESK), registration(&["XRAY"]), now()),
        Err(PortalServiceError::Catalog(CatalogError::UnknownTest(code))) if code == "XRAY"
    ));
}

#[test]
fn roles_gate_staff_operations() {
    let (service, _, _) = build_service();
    let created = service
        .register_patient(&staff(DESK), registration(&["FBS"]), now())
        .expect("registration succeeds");
    let result_id = created.results[0].result_id.clone();

    match service.enter_result(
        &staff(DESK),
        &result_id,
        vec![entry("Glucose", "5.0")],
        now(),
    ) {
        Err(PortalServiceError::Forbidden { role, action }) => {
            assert_eq!(role, StaffRole::Receptionist);
            assert_eq!(action, StaffAction::EnterResult);
        }
        other => panic!("expected forbidden, got {other:?}"),
    }

    assert!(matches!(
        service.register_patient(&staff(TECH), registration(&["FBS"]), now()),
        Err(PortalServiceError::Forbidden { .. })
    ));
    assert!(matches!(
        service.review_queue(&staff("stranger"), 10),
        Err(PortalServiceError::UnknownStaff(_))
    ));
}

#[test]
fn deactivated_staff_are_refused() {
    let (service, _, audit) = build_service();

    service
        .deactivate_staff(&staff(ADMIN), &staff(TECH), now())
        .expect("deactivation succeeds");
    assert_eq!(
        audit.events().last().map(|event| event.action),
        Some(AuditAction::StaffDeactivated)
    );

    assert!(matches!(
        service.review_queue(&staff(TECH), 10),
        Err(PortalServiceError::InactiveStaff(_))
    ));
    assert!(matches!(
        service.deactivate_staff(&staff(ADMIN), &staff(ADMIN), now()),
        Err(PortalServiceError::InvalidRequest(_))
    ));
    assert!(matches!(
        service.deactivate_staff(&staff(ADMIN), &staff("ghost"), now()),
        Err(PortalServiceError::StaffNotFound(_))
    ));
}

#[test]
fn duplicate_staff_ids_conflict() {
    let (service, _, _) = build_service();
    let outcome = service.register_staff(
        &staff(ADMIN),
        NewStaffMember {
            staff_id: Some(TECH.to_string()),
            name: "Second Technician".to_string(),
            role: StaffRole::Technician,
        },
        now(),
    );
    assert!(matches!(
        outcome,
        Err(PortalServiceError::Repository(RepositoryError::Conflict))
    ));

    let generated = service
        .register_staff(
            &staff(ADMIN),
            NewStaffMember {
                staff_id: None,
                name: "Night Shift".to_string(),
                role: StaffRole::Technician,
            },
            now(),
        )
        .expect("generated id");
    assert!(generated.staff_id.0.starts_with("STF-"));
}

#[test]
fn access_code_requires_full_payment() {
    let (service, _, _) = build_service();
    let registration = service
        .register_patient(&staff(DESK), registration(&["FBC", "MP"]), now())
        .expect("registration succeeds");
    let reference = registration.payment.reference.0.clone();

    match service.issue_access_code(&reference, now()) {
        Err(PortalServiceError::Access(AccessError::PaymentNotConfirmed { outstanding, .. })) => {
            assert_eq!(outstanding, 11_000)
        }
        other => panic!("expected unconfirmed payment, got {other:?}"),
    }

    let partial = service
        .confirm_payment(&staff(DESK), &reference, 10_000, now())
        .expect("partial payment recorded");
    assert_eq!(partial.status, PaymentStatus::Pending);
    assert!(service.issue_access_code(&reference, now()).is_err());

    let settled = service
        .confirm_payment(&staff(DESK), &reference.to_lowercase(), 1_000, now())
        .expect("balance recorded");
    assert_eq!(settled.status, PaymentStatus::Confirmed);

    let grant = service
        .issue_access_code(&format!("  {}  ", reference.to_lowercase()), now())
        .expect("code issued");
    assert_eq!(grant.code.0.len(), 8);
    assert_eq!(grant.expires_at, now() + Duration::hours(72));

    let again = service
        .issue_access_code(&reference, now() + Duration::hours(1))
        .expect("active code returned");
    assert_eq!(again.code, grant.code);
}

#[test]
fn unknown_payment_reference_is_reported() {
    let (service, _, _) = build_service();
    assert!(matches!(
        service.issue_access_code("PAY-NOPE", now()),
        Err(PortalServiceError::Access(AccessError::UnknownPaymentReference(_)))
    ));
}

#[test]
fn retrieval_waits_for_released_results_without_counting() {
    let (service, repository, _) = build_service();
    let (reference, results) = paid_registration(&service, &["FBS", "MP"]);
    let grant = service
        .issue_access_code(&reference.0, now())
        .expect("code issued");

    assert!(matches!(
        service.retrieve_results(&grant.code.0, now()),
        Err(PortalServiceError::Access(AccessError::ResultsNotReady))
    ));
    let stored = repository
        .fetch_grant(&grant.code)
        .expect("fetch succeeds")
        .expect("grant present");
    assert_eq!(stored.access_count, 0);

    approve_glucose(&service, &result_for(&results, "FBS").result_id);

    let view = service
        .retrieve_results(&grant.code.0.to_lowercase(), now())
        .expect("results released");
    assert_eq!(view.full_name, "Adaeze Okafor");
    assert_eq!(view.results.len(), 1);
    assert_eq!(view.results[0].test_code, "FBS");
    assert_eq!(view.results[0].values[0].flag, ResultFlag::High);
    assert_eq!(view.pending_tests, vec!["Malaria Parasite".to_string()]);
    assert_eq!(view.remaining_accesses, 4);
}

#[test]
fn retrieval_stops_at_access_limit() {
    let (service, _, audit) = build_service_with_policy(PortalPolicy::new(72, 2));
    let (reference, results) = paid_registration(&service, &["FBS"]);
    approve_glucose(&service, &results[0].result_id);
    let grant = service
        .issue_access_code(&reference.0, now())
        .expect("code issued");

    service
        .retrieve_results(&grant.code.0, now())
        .expect("first view");
    let second = service
        .retrieve_results(&grant.code.0, now())
        .expect("second view");
    assert_eq!(second.remaining_accesses, 0);

    assert!(matches!(
        service.retrieve_results(&grant.code.0, now()),
        Err(PortalServiceError::Access(AccessError::AccessLimitReached { max_accesses: 2 }))
    ));

    let retrievals = audit
        .events()
        .into_iter()
        .filter(|event| event.action == AuditAction::ResultsRetrieved)
        .count();
    assert_eq!(retrievals, 2);

    let fresh = service
        .issue_access_code(&reference.0, now())
        .expect("exhausted code is replaced");
    assert_ne!(fresh.code, grant.code);
}

#[test]
fn expired_codes_are_refused_and_replaced() {
    let (service, _, _) = build_service();
    let (reference, results) = paid_registration(&service, &["FBS"]);
    approve_glucose(&service, &results[0].result_id);
    let grant = service
        .issue_access_code(&reference.0, now())
        .expect("code issued");

    let later = now() + Duration::hours(72);
    assert!(matches!(
        service.retrieve_results(&grant.code.0, later),
        Err(PortalServiceError::Access(AccessError::AccessCodeExpired { .. }))
    ));

    let renewed = service
        .issue_access_code(&reference.0, later)
        .expect("new code minted");
    assert_ne!(renewed.code, grant.code);
    service
        .retrieve_results(&renewed.code.0, later)
        .expect("renewed code works");
}

#[test]
fn unknown_access_code_is_reported() {
    let (service, _, _) = build_service();
    assert!(matches!(
        service.retrieve_results("ZZZZZZZZ", now()),
        Err(PortalServiceError::Access(AccessError::UnknownAccessCode))
    ));
}

#[test]
fn psychometric_results_wait_for_assessment() {
    let (service, _, _) = build_service();
    let (reference, results) = paid_registration(&service, &["PSY"]);
    let result_id = results[0].result_id.clone();
    let grant = service
        .issue_access_code(&reference.0, now())
        .expect("code issued");

    service
        .enter_result(
            &staff(TECH),
            &result_id,
            vec![entry("PHQ-9", "11"), entry("GAD-7", "4")],
            now(),
        )
        .expect("entry accepted");
    service
        .review_result(
            &staff(SCIENTIST),
            &result_id,
            ReviewDecision::Approve,
            "",
            now(),
        )
        .expect("approved");

    assert!(matches!(
        service.retrieve_results(&grant.code.0, now()),
        Err(PortalServiceError::Access(AccessError::ResultsNotReady))
    ));
    assert!(matches!(
        service.assess_result(&staff(SCIENTIST), &result_id, "notes", now()),
        Err(PortalServiceError::Forbidden { .. })
    ));

    let assessed = service
        .assess_result(
            &staff(PSYCHOLOGIST),
            &result_id,
            "moderate depressive symptoms; refer for counselling",
            now(),
        )
        .expect("assessment recorded");
    assert_eq!(assessed.status, ResultStatus::Assessed);

    let view = service
        .retrieve_results(&grant.code.0, now())
        .expect("released after assessment");
    assert_eq!(
        view.results[0].assessment_notes.as_deref(),
        Some("moderate depressive symptoms; refer for counselling")
    );
}

#[test]
fn review_queue_lists_entered_results() {
    let (service, _, _) = build_service();
    let (_, results) = paid_registration(&service, &["FBS", "MP"]);
    let fbs = result_for(&results, "FBS").result_id.clone();

    assert!(service
        .review_queue(&staff(SCIENTIST), 10)
        .expect("queue loads")
        .is_empty());

    service
        .enter_result(&staff(TECH), &fbs, vec![entry("Glucose", "4.9")], now())
        .expect("entry accepted");
    let queue = service
        .review_queue(&staff(SCIENTIST), 10)
        .expect("queue loads");
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].result_id, fbs);

    service
        .review_result(
            &staff(SCIENTIST),
            &fbs,
            ReviewDecision::Reject,
            "recalibrate analyser",
            now(),
        )
        .expect("rejection recorded");
    assert!(service
        .review_queue(&staff(SCIENTIST), 10)
        .expect("queue loads")
        .is_empty());

    assert!(matches!(
        service.review_result(&staff(SCIENTIST), &fbs, ReviewDecision::Approve, "", now()),
        Err(PortalServiceError::Review(ReviewError::InvalidTransition { .. }))
    ));
}

#[test]
fn patient_overview_collects_payments_and_results() {
    let (service, _, _) = build_service();
    let registration = service
        .register_patient(&staff(DESK), registration(&["LIPID"]), now())
        .expect("registration succeeds");

    let overview = service
        .patient_overview(&staff(TECH), &registration.patient.patient_id)
        .expect("overview loads");
    assert_eq!(overview.payments.len(), 1);
    assert_eq!(overview.results.len(), 1);
    assert_eq!(overview.results[0].test_name, "Lipid Profile");

    assert!(matches!(
        service.patient_overview(
            &staff(TECH),
            &crate::portal::PatientId("PAT-999999".to_string())
        ),
        Err(PortalServiceError::PatientNotFound(_))
    ));
}

#[test]
fn missing_result_is_reported() {
    let (service, _, _) = build_service();
    assert!(matches!(
        service.enter_result(
            &staff(TECH),
            &crate::portal::ResultId("RES-404".to_string()),
            Vec::new(),
            now()
        ),
        Err(PortalServiceError::ResultNotFound(_))
    ));
}

#[test]
fn audit_failures_propagate() {
    let repository = Arc::new(InMemoryPortalRepository::default());
    let service = LabPortalService::new(
        repository,
        Arc::new(FailingAudit),
        TestCatalog::standard(),
        PortalPolicy::default(),
    );
    service
        .seed_admin(&staff(ADMIN), "Lab Administrator", now())
        .expect("seeding does not audit");

    assert!(matches!(
        service.register_patient(&staff(ADMIN), registration(&["MP"]), now()),
        Err(PortalServiceError::Audit(_))
    ));
}

#[test]
fn repository_outages_surface_as_repository_errors() {
    let service = LabPortalService::new(
        Arc::new(UnavailableRepository),
        Arc::new(crate::portal::InMemoryAuditLog::default()),
        TestCatalog::standard(),
        PortalPolicy::default(),
    );

    assert!(matches!(
        service.review_queue(&staff(SCIENTIST), 10),
        Err(PortalServiceError::Repository(RepositoryError::Unavailable(_)))
    ));
    assert!(matches!(
        service.retrieve_results("ABCDEFGH", now()),
        Err(PortalServiceError::Repository(RepositoryError::Unavailable(_)))
    ));
}

#[test]
fn generated_staff_ids_do_not_overwrite_explicit_ones() {
    let (service, repository, _) = build_service();
    service
        .register_staff(
            &staff(ADMIN),
            NewStaffMember {
                staff_id: Some("STF-000001".to_string()),
                name: "Locum Scientist".to_string(),
                role: StaffRole::Scientist,
            },
            now(),
        )
        .expect("explicit id accepted");

    let outcome = service.register_staff(
        &staff(ADMIN),
        NewStaffMember {
            staff_id: None,
            name: "Weekend Technician".to_string(),
            role: StaffRole::Technician,
        },
        now(),
    );
    assert!(matches!(
        outcome,
        Err(PortalServiceError::Repository(RepositoryError::Conflict))
    ));

    let kept = repository
        .fetch_staff(&staff("STF-000001"))
        .expect("fetch succeeds")
        .expect("staff present");
    assert_eq!(kept.role, StaffRole::Scientist);
}

#[test]
fn reissuing_returns_the_active_code() {
    let (service, _, audit) = build_service();
    let (reference, _) = paid_registration(&service, &["MP"]);

    let first = service
        .issue_access_code(&reference.0, now())
        .expect("code issued");
    let second = service
        .issue_access_code(&reference.0, now() + Duration::hours(71))
        .expect("code returned");

    assert_eq!(second.code, first.code);
    assert_eq!(second.expires_at, first.expires_at);
    let issued = audit
        .events()
        .into_iter()
        .filter(|event| event.action == AuditAction::AccessCodeIssued)
        .count();
    assert_eq!(issued, 1);
}

#[test]
fn zero_priced_orders_are_confirmed_at_registration() {
    let csv = "\
Code,Name,Price,Analyte,Unit,Low,High,Requires Assessment
BP,Blood Pressure Check,0,Systolic,mmHg,90,120,
";
    let catalog = TestCatalog::from_reader(csv.as_bytes()).expect("catalog parses");
    let service = LabPortalService::new(
        Arc::new(InMemoryPortalRepository::default()),
        Arc::new(crate::portal::InMemoryAuditLog::default()),
        catalog,
        PortalPolicy::default(),
    );
    seed_staff(&service);

    let created = service
        .register_patient(&staff(DESK), registration(&["bp"]), now())
        .expect("registration succeeds");
    assert_eq!(created.payment.amount_due, 0);
    assert_eq!(created.payment.status, PaymentStatus::Confirmed);
    assert_eq!(created.payment.confirmed_at, Some(now()));

    service
        .issue_access_code(&created.payment.reference.0, now())
        .expect("free orders get a code straight away");
    assert!(matches!(
        service.confirm_payment(&staff(DESK), &created.payment.reference.0, 500, now()),
        Err(PortalServiceError::Access(AccessError::PaymentAlreadyConfirmed(_)))
    ));
}

#[test]
fn failed_registration_leaves_nothing_behind() {
    let (scratch, _, _) = build_service();
    let mut archived = scratch
        .register_patient(&staff(DESK), registration(&["MP", "FBS"]), now())
        .expect("scratch registration succeeds");
    archived.patient.patient_id = crate::portal::PatientId("PAT-ARCHIVED".to_string());
    archived.payment.reference = crate::portal::PaymentReference("PAY-ARCHIVED".to_string());
    // keep only RES-000002 so the clash lands on the last row of the next order
    archived.results.remove(0);

    let (service, repository, audit) = build_service();
    repository
        .insert_registration(archived)
        .expect("archived order stored");
    let events_before = audit.events().len();

    let outcome = service.register_patient(&staff(DESK), registration(&["FBS", "MP"]), now());
    assert!(matches!(
        outcome,
        Err(PortalServiceError::Repository(RepositoryError::Conflict))
    ));

    let orphan = crate::portal::PatientId("PAT-000001".to_string());
    assert!(repository
        .fetch_patient(&orphan)
        .expect("fetch succeeds")
        .is_none());
    assert!(repository
        .payments_for_patient(&orphan)
        .expect("fetch succeeds")
        .is_empty());
    assert!(repository
        .results_for_patient(&orphan)
        .expect("fetch succeeds")
        .is_empty());
    assert_eq!(audit.events().len(), events_before);
}

#[test]
fn oversized_access_code_lifetimes_are_capped() {
    let (service, _, _) =
        build_service_with_policy(PortalPolicy::new(10_000_000_000, 5));
    let (reference, _) = paid_registration(&service, &["MP"]);

    let grant = service
        .issue_access_code(&reference.0, now())
        .expect("code issued without overflow");
    assert_eq!(
        grant.expires_at,
        now() + Duration::hours(crate::portal::MAX_ACCESS_CODE_TTL_HOURS)
    );
}
