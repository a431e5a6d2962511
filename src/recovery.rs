//! Startup recovery
//!
//! Runs once before any dispatcher loop starts. Ordering matters:
//! courses are failed first so the fiche pass can observe that their
//! stuck course is now terminal and unwedge them. A second invocation
//! finds nothing and returns an empty report.

use crate::db::{
    CommisJobStatus, CourseStatus, Database, DbResult, DeployState, DeploymentStatus, FicheStatus,
};

const ORPHAN_ERROR: &str = "Orphaned after server restart";
const DEPLOY_ORPHAN_ERROR: &str = "Control plane restarted during deploy";

/// What one recovery pass changed
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct RecoveryReport {
    pub failed_courses: Vec<i64>,
    pub failed_commis_jobs: Vec<i64>,
    pub failed_runner_jobs: Vec<i64>,
    pub reset_fiches: Vec<i64>,
    pub paused_deployments: Vec<String>,
    pub failed_instances: Vec<i64>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.failed_courses.is_empty()
            && self.failed_commis_jobs.is_empty()
            && self.failed_runner_jobs.is_empty()
            && self.reset_fiches.is_empty()
            && self.paused_deployments.is_empty()
            && self.failed_instances.is_empty()
    }
}

/// Transition every orphaned in-flight row to a terminal or resumable
/// state. WAITING courses are left alone: their continuation settles
/// them. Queued commis jobs are left alone: the dispatcher resumes
/// them naturally.
pub fn recover(db: &Database) -> DbResult<RecoveryReport> {
    let mut report = RecoveryReport::default();

    // 1. Courses caught mid-flight
    for course in db.courses_with_status(&[
        CourseStatus::Running,
        CourseStatus::Queued,
        CourseStatus::Deferred,
    ])? {
        if db.settle_course(course.id, CourseStatus::Failed, None, Some(ORPHAN_ERROR))? {
            report.failed_courses.push(course.id);
        }
    }

    // 2. Commis jobs that were running when the process died
    for job in db.commis_jobs_with_status(CommisJobStatus::Running)? {
        if db.finish_commis_job(job.id, CommisJobStatus::Failed, Some(ORPHAN_ERROR))? {
            report.failed_commis_jobs.push(job.id);
        }
    }

    // 3. Runner jobs, queued and running both
    report.failed_runner_jobs = db.fail_open_runner_jobs(ORPHAN_ERROR)?;

    // 4. Fiches stuck in running whose courses have all settled
    for fiche_id in db.fiches_marked_running()? {
        if !db.fiche_has_open_course(fiche_id)? {
            db.set_fiche_status(
                fiche_id,
                FicheStatus::Idle,
                Some("Reset to idle by startup recovery"),
            )?;
            report.reset_fiches.push(fiche_id);
        }
    }

    // 5. Deployments and instances caught mid-rollout
    for deployment in db.list_deployments()? {
        if matches!(
            deployment.status,
            DeploymentStatus::Pending | DeploymentStatus::InProgress
        ) {
            db.set_deployment_status(&deployment.id, DeploymentStatus::Paused)?;
            report.paused_deployments.push(deployment.id);
        }
    }
    for instance in db.instances_in_deploy_state(DeployState::Deploying)? {
        db.mark_instance_deploy_failed(instance.id, DEPLOY_ORPHAN_ERROR, false)?;
        report.failed_instances.push(instance.id);
    }

    if report.is_empty() {
        tracing::info!("recovery found nothing to do");
    } else {
        tracing::warn!(
            courses = report.failed_courses.len(),
            commis_jobs = report.failed_commis_jobs.len(),
            runner_jobs = report.failed_runner_jobs.len(),
            fiches = report.reset_fiches.len(),
            deployments = report.paused_deployments.len(),
            instances = report.failed_instances.len(),
            "recovered orphaned state"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CommisConfig, CourseTrigger};

    struct Seeded {
        owner_id: i64,
        fiche_id: i64,
        thread_id: i64,
    }

    fn seed(db: &Database) -> Seeded {
        let owner = db.create_user("r@example.com", "t").unwrap();
        let fiche = db.create_fiche(owner.id, "f", "", "", "m", &[]).unwrap();
        let thread = db.create_thread(fiche.id, None).unwrap();
        Seeded {
            owner_id: owner.id,
            fiche_id: fiche.id,
            thread_id: thread.id,
        }
    }

    fn course_with_status(db: &Database, seeded: &Seeded, status: CourseStatus) -> i64 {
        db.create_course(
            seeded.fiche_id,
            seeded.thread_id,
            status,
            CourseTrigger::Api,
            &uuid::Uuid::new_v4().to_string(),
            None,
        )
        .unwrap()
        .id
    }

    #[test]
    fn test_orphan_recovery_full_pass() {
        let db = Database::open_in_memory().unwrap();
        let seeded = seed(&db);

        // Fiche running, course running, its commis job running
        db.set_fiche_status(seeded.fiche_id, FicheStatus::Running, None)
            .unwrap();
        let course_id = course_with_status(&db, &seeded, CourseStatus::Running);
        let job = db
            .create_commis_job(
                seeded.owner_id,
                "task",
                "m",
                Some(course_id),
                Some("call-1"),
                &CommisConfig::default(),
            )
            .unwrap();
        db.claim_queued_jobs(1).unwrap();
        db.create_runner_job(seeded.owner_id, None, "echo hi").unwrap();

        let report = recover(&db).unwrap();
        assert_eq!(report.failed_courses, vec![course_id]);
        assert_eq!(report.failed_commis_jobs, vec![job.id]);
        assert_eq!(report.failed_runner_jobs.len(), 1);
        assert_eq!(report.reset_fiches, vec![seeded.fiche_id]);

        let course = db.get_course(course_id).unwrap();
        assert_eq!(course.status, CourseStatus::Failed);
        assert_eq!(course.error.as_deref(), Some(ORPHAN_ERROR));
        assert_eq!(
            db.get_fiche(seeded.fiche_id).unwrap().status,
            FicheStatus::Idle
        );

        // Second pass is empty
        let again = recover(&db).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_waiting_courses_left_alone() {
        let db = Database::open_in_memory().unwrap();
        let seeded = seed(&db);
        let course_id = course_with_status(&db, &seeded, CourseStatus::Waiting);

        let report = recover(&db).unwrap();
        assert!(report.failed_courses.is_empty());
        assert_eq!(
            db.get_course(course_id).unwrap().status,
            CourseStatus::Waiting
        );
    }

    #[test]
    fn test_queued_jobs_left_for_dispatcher() {
        let db = Database::open_in_memory().unwrap();
        let seeded = seed(&db);
        let job = db
            .create_commis_job(
                seeded.owner_id,
                "task",
                "m",
                None,
                None,
                &CommisConfig::default(),
            )
            .unwrap();

        let report = recover(&db).unwrap();
        assert!(report.failed_commis_jobs.is_empty());
        assert_eq!(
            db.get_commis_job(job.id).unwrap().status,
            CommisJobStatus::Queued
        );
    }

    #[test]
    fn test_fiche_with_open_waiting_course_stays_running() {
        let db = Database::open_in_memory().unwrap();
        let seeded = seed(&db);
        db.set_fiche_status(seeded.fiche_id, FicheStatus::Running, None)
            .unwrap();
        course_with_status(&db, &seeded, CourseStatus::Waiting);

        let report = recover(&db).unwrap();
        assert!(report.reset_fiches.is_empty());
        assert_eq!(
            db.get_fiche(seeded.fiche_id).unwrap().status,
            FicheStatus::Running
        );
    }

    #[test]
    fn test_deploy_orphans_paused_and_failed() {
        let db = Database::open_in_memory().unwrap();
        let instance = db.create_instance("a", "ct-a", 0).unwrap();
        db.create_deployment("d1", "img", 1, 1).unwrap();
        db.set_deployment_status("d1", DeploymentStatus::InProgress)
            .unwrap();
        db.link_instance_to_deployment(instance.id, "d1").unwrap();
        db.begin_instance_deploy(instance.id).unwrap();

        let report = recover(&db).unwrap();
        assert_eq!(report.paused_deployments, vec!["d1".to_string()]);
        assert_eq!(report.failed_instances, vec![instance.id]);

        assert_eq!(
            db.get_deployment("d1").unwrap().status,
            DeploymentStatus::Paused
        );
        let instance = db.get_instance(instance.id).unwrap();
        assert_eq!(instance.deploy_state, DeployState::Failed);
        assert_eq!(instance.deploy_error.as_deref(), Some(DEPLOY_ORPHAN_ERROR));

        assert!(recover(&db).unwrap().is_empty());
    }
}
