use crate::infra::{load_catalog, MemoryPortal};
use chrono::{Duration, Utc};
use clap::Args;
use labportal::error::AppError;
use labportal::portal::{
    InMemoryAuditLog, InMemoryPortalRepository, LabPortalService, NewStaffMember,
    PatientRegistration, PortalPolicy, ResultEntry, ResultFlag, ReviewDecision, StaffId,
    StaffRole, TestCatalog,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Args, Debug, Default)]
pub(crate) struct CatalogArgs {
    /// Optional catalog CSV (Code,Name,Price,Analyte,Unit,Low,High,Requires Assessment)
    #[arg(long)]
    pub(crate) csv: Option<PathBuf>,
}

#[derive(Args, Debug, Default)]
pub(crate) struct DemoArgs {
    /// Hours an access code stays valid (defaults to 72)
    #[arg(long)]
    pub(crate) ttl_hours: Option<i64>,
    /// Number of retrievals allowed per access code (defaults to 5)
    #[arg(long)]
    pub(crate) max_views: Option<u32>,
}

pub(crate) fn run_catalog(args: CatalogArgs) -> Result<(), AppError> {
    let catalog = load_catalog(args.csv.as_deref())?;
    render_catalog(&catalog);
    Ok(())
}

fn render_catalog(catalog: &TestCatalog) {
    println!("Test catalog ({} tests)", catalog.len());
    for test in catalog.tests() {
        let assessment = if test.requires_assessment {
            " | psychologist assessment"
        } else {
            ""
        };
        println!(
            "- {} {}: {}{}",
            test.code,
            test.name,
            format_amount(test.price),
            assessment
        );
        for analyte in &test.analytes {
            let range = analyte
                .reference_range()
                .unwrap_or_else(|| "no reference range".to_string());
            println!("    {} [{}] {}", analyte.name, analyte.unit, range);
        }
    }
}

pub(crate) fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    // zero falls back to the policy defaults
    let policy = PortalPolicy::new(args.ttl_hours.unwrap_or(0), args.max_views.unwrap_or(0));
    let audit = Arc::new(InMemoryAuditLog::default());
    let service = LabPortalService::new(
        Arc::new(InMemoryPortalRepository::default()),
        audit.clone(),
        TestCatalog::standard(),
        policy,
    );

    println!("Lab results portal demo");
    let staff = seed_demo_staff(&service)?;
    let now = Utc::now();

    let registration = service.register_patient(
        &staff.desk,
        PatientRegistration {
            full_name: "Chiamaka Eze".to_string(),
            phone: "+234 809 000 1122".to_string(),
            email: None,
            date_of_birth: None,
            referring_clinic: Some("Yaba Community Clinic".to_string()),
            tests: vec!["FBS".to_string(), "PSY".to_string()],
        },
        now,
    )?;
    println!(
        "- Registered {} as {} | invoice {} for {}",
        registration.patient.full_name,
        registration.patient.patient_id,
        registration.payment.reference,
        format_amount(registration.payment.amount_due)
    );

    let reference = registration.payment.reference.0.clone();
    let deposit = registration.payment.amount_due / 2;
    let partial = service.confirm_payment(&staff.desk, &reference, deposit, now)?;
    println!(
        "- Deposit received, {} outstanding",
        format_amount(partial.outstanding())
    );
    if let Err(err) = service.issue_access_code(&reference, now) {
        println!("  Access code refused: {err}");
    }
    service.confirm_payment(&staff.desk, &reference, partial.outstanding(), now)?;
    let grant = service.issue_access_code(&reference, now)?;
    println!(
        "- Payment confirmed, access code {} valid until {} for {} views",
        grant.code,
        grant.expires_at.format("%Y-%m-%d %H:%M UTC"),
        grant.max_accesses
    );

    for result in &registration.results {
        let entries = match result.test_code.as_str() {
            "FBS" => vec![entry("Glucose", "6.1")],
            "PSY" => vec![entry("PHQ-9", "11"), entry("GAD-7", "7")],
            _ => continue,
        };
        let entered = service.enter_result(&staff.technician, &result.result_id, entries, now)?;
        let flagged = entered
            .values
            .iter()
            .filter(|value| value.flag != ResultFlag::Normal)
            .count();
        println!(
            "- {} entered for {} ({} flagged values)",
            entered.test_name, entered.result_id, flagged
        );
    }

    let queue = service.review_queue(&staff.scientist, 10)?;
    println!("- Review queue holds {} results", queue.len());
    for pending in queue {
        let reviewed = service.review_result(
            &staff.scientist,
            &pending.result_id,
            ReviewDecision::Approve,
            "values verified against controls",
            now,
        )?;
        println!("  {} -> {}", reviewed.test_name, reviewed.status);
    }

    let early = service.retrieve_results(&grant.code.0, now + Duration::minutes(30))?;
    println!(
        "- Patient view: {} released, waiting on {:?}, {} views left",
        early.results.len(),
        early.pending_tests,
        early.remaining_accesses
    );

    if let Some(psychometric) = registration
        .results
        .iter()
        .find(|result| result.test_code == "PSY")
    {
        let assessed = service.assess_result(
            &staff.psychologist,
            &psychometric.result_id,
            "moderate depressive symptoms; referred for counselling",
            now,
        )?;
        println!("- {} -> {}", assessed.test_name, assessed.status);
    }

    let released = service.retrieve_results(&grant.code.0, now + Duration::hours(1))?;
    println!(
        "- Patient view: {} released, {} views left",
        released.results.len(),
        released.remaining_accesses
    );
    for result in &released.results {
        println!("  {}", result.test_name);
        for value in &result.values {
            println!(
                "    {}: {} {} {:?}",
                value.analyte, value.value, value.unit, value.flag
            );
        }
        if let Some(notes) = &result.assessment_notes {
            println!("    Assessment: {notes}");
        }
    }

    println!("\nAudit trail ({} events)", audit.events().len());
    for event in audit.events() {
        println!("- {} {:?} {}", event.actor, event.action, event.subject);
    }

    Ok(())
}

struct DemoStaff {
    desk: StaffId,
    technician: StaffId,
    scientist: StaffId,
    psychologist: StaffId,
}

fn seed_demo_staff(service: &MemoryPortal) -> Result<DemoStaff, AppError> {
    let admin = StaffId("admin".to_string());
    service.seed_admin(&admin, "Administrator", Utc::now())?;

    let register = |name: &str, role: StaffRole| -> Result<StaffId, AppError> {
        let member = service.register_staff(
            &admin,
            NewStaffMember {
                staff_id: None,
                name: name.to_string(),
                role,
            },
            Utc::now(),
        )?;
        println!("- Staff {} ({}) as {}", member.name, member.role, member.staff_id);
        Ok(member.staff_id)
    };

    Ok(DemoStaff {
        desk: register("Front Desk", StaffRole::Receptionist)?,
        technician: register("Bench Technician", StaffRole::Technician)?,
        scientist: register("Reviewing Scientist", StaffRole::Scientist)?,
        psychologist: register("Clinical Psychologist", StaffRole::Psychologist)?,
    })
}

fn entry(analyte: &str, value: &str) -> ResultEntry {
    ResultEntry {
        analyte: analyte.to_string(),
        value: value.to_string(),
    }
}

fn format_amount(minor_units: u32) -> String {
    format!("NGN {}.{:02}", minor_units / 100, minor_units % 100)
}
