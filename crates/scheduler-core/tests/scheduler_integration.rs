//! End-to-end tests against the public `Scheduler` façade: descriptor
//! loading into a live scheduler, non-concurrent job exclusivity, pause/
//! resume, and cooperative interruption.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use scheduler_core::job::{Job, JobDefinition, JobFactory, JobIdentity, RunOutcome};
use scheduler_core::store::JobStore;
use scheduler_core::trigger::{RepeatCount, ScheduleKind, Trigger, TriggerIdentity};
use scheduler_core::{simple_factory, JobFactoryRegistry, Scheduler};

#[test]
fn test_descriptor_install_runs_jobs_on_live_scheduler() {
    struct NoopJob;
    impl Job for NoopJob {
        fn run(&mut self, _ctx: &scheduler_core::context::JobContext) -> scheduler_core::SchedulerResult<RunOutcome> {
            Ok(RunOutcome::Success)
        }
    }

    let counter = Arc::new(AtomicU32::new(0));
    let counter_for_job = counter.clone();

    struct CountingJob(Arc<AtomicU32>);
    impl Job for CountingJob {
        fn run(&mut self, _ctx: &scheduler_core::context::JobContext) -> scheduler_core::SchedulerResult<RunOutcome> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(RunOutcome::Success)
        }
    }

    let mut registry = JobFactoryRegistry::new();
    registry.register("noop", simple_factory(|| NoopJob));
    registry.register(
        "counting",
        Arc::new(move || Box::new(CountingJob(counter_for_job.clone())) as Box<dyn Job>) as JobFactory,
    );

    let doc = r#"
jobs:
  - name: ping
    type: counting
triggers:
  - name: ping-trigger
    job_name: ping
    schedule:
      kind: simple
      repeat_interval_seconds: 3600
      repeat_count: 0
"#;

    let scheduler = Scheduler::builder().with_worker_pool_size(2).build();
    let installed = scheduler.load_descriptor(doc, &registry).unwrap();
    assert_eq!(installed, 2);

    scheduler.start();
    std::thread::sleep(Duration::from_millis(300));
    scheduler.shutdown(true);

    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn test_non_concurrent_job_serializes_across_triggers() {
    let concurrent_peak = Arc::new(AtomicU32::new(0));
    let current = Arc::new(AtomicU32::new(0));

    struct SlowJob {
        current: Arc<AtomicU32>,
        peak: Arc<AtomicU32>,
    }
    impl Job for SlowJob {
        fn run(&mut self, _ctx: &scheduler_core::context::JobContext) -> scheduler_core::SchedulerResult<RunOutcome> {
            let now_running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now_running, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(150));
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(RunOutcome::Success)
        }
    }

    let scheduler = Scheduler::builder().with_worker_pool_size(4).build();
    let factory: JobFactory = {
        let current = current.clone();
        let peak = concurrent_peak.clone();
        Arc::new(move || {
            Box::new(SlowJob {
                current: current.clone(),
                peak: peak.clone(),
            }) as Box<dyn Job>
        })
    };

    let job_id = JobIdentity::named("exclusive-job");
    scheduler
        .add_job(
            JobDefinition::builder(job_id.clone(), factory)
                .disallow_concurrent_execution(true)
                .build(),
        )
        .unwrap();

    let now = Utc::now();
    for name in ["t1", "t2", "t3"] {
        scheduler
            .add_trigger(Trigger::new(
                TriggerIdentity::named(name),
                job_id.clone(),
                now,
                ScheduleKind::simple(chrono::Duration::seconds(3600), RepeatCount::Times(0)),
            ))
            .unwrap();
    }

    scheduler.start();
    std::thread::sleep(Duration::from_millis(800));
    scheduler.shutdown(true);

    assert_eq!(concurrent_peak.load(Ordering::SeqCst), 1);
}

#[test]
fn test_pause_trigger_prevents_fire_until_resumed() {
    let counter = Arc::new(AtomicU32::new(0));
    let counter_for_job = counter.clone();

    struct CountingJob(Arc<AtomicU32>);
    impl Job for CountingJob {
        fn run(&mut self, _ctx: &scheduler_core::context::JobContext) -> scheduler_core::SchedulerResult<RunOutcome> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(RunOutcome::Success)
        }
    }

    let scheduler = Scheduler::builder().with_worker_pool_size(1).build();
    let factory: JobFactory = Arc::new(move || Box::new(CountingJob(counter_for_job.clone())));
    let job_id = JobIdentity::named("paused-job");
    scheduler
        .add_job(JobDefinition::builder(job_id.clone(), factory).build())
        .unwrap();

    let trigger_id = TriggerIdentity::named("paused-trigger");
    scheduler
        .add_trigger(Trigger::new(
            trigger_id.clone(),
            job_id,
            Utc::now(),
            ScheduleKind::simple(chrono::Duration::milliseconds(50), RepeatCount::Indefinite),
        ))
        .unwrap();
    scheduler.pause_trigger(&trigger_id).unwrap();

    scheduler.start();
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    scheduler.resume_trigger(&trigger_id).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    scheduler.shutdown(true);

    assert!(counter.load(Ordering::SeqCst) >= 1);
}

#[test]
fn test_stop_job_interrupts_a_running_fire() {
    struct PollingJob;
    impl Job for PollingJob {
        fn run(&mut self, ctx: &scheduler_core::context::JobContext) -> scheduler_core::SchedulerResult<RunOutcome> {
            for _ in 0..100 {
                if ctx.is_interrupted() {
                    return Ok(RunOutcome::Interrupted);
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Ok(RunOutcome::Success)
        }
    }

    let scheduler = Scheduler::builder().with_worker_pool_size(1).build();
    let factory: JobFactory = simple_factory(|| PollingJob);
    let job_id = JobIdentity::named("stoppable-job");
    scheduler
        .add_job(JobDefinition::builder(job_id.clone(), factory).build())
        .unwrap();

    let trigger_id = TriggerIdentity::named("stoppable-trigger");
    scheduler
        .add_trigger(Trigger::new(
            trigger_id,
            job_id.clone(),
            Utc::now(),
            ScheduleKind::simple(chrono::Duration::seconds(3600), RepeatCount::Times(0)),
        ))
        .unwrap();

    scheduler.start();
    std::thread::sleep(Duration::from_millis(150));
    assert!(scheduler.is_job_running(&job_id));
    assert!(scheduler.stop_job(&job_id));

    std::thread::sleep(Duration::from_millis(200));
    scheduler.shutdown(true);
    assert!(!scheduler.is_job_running(&job_id));
}

#[test]
fn test_stop_job_matching_only_signals_matching_data() {
    struct PollingJob;
    impl Job for PollingJob {
        fn run(&mut self, ctx: &scheduler_core::context::JobContext) -> scheduler_core::SchedulerResult<RunOutcome> {
            for _ in 0..100 {
                if ctx.is_interrupted() {
                    return Ok(RunOutcome::Interrupted);
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Ok(RunOutcome::Success)
        }
    }

    let scheduler = Scheduler::builder().with_worker_pool_size(1).build();
    let factory: JobFactory = simple_factory(|| PollingJob);
    let job_id = JobIdentity::named("tagged-job");
    scheduler
        .add_job(JobDefinition::builder(job_id.clone(), factory).build())
        .unwrap();

    let mut trigger = Trigger::new(
        TriggerIdentity::named("tagged-trigger"),
        job_id.clone(),
        Utc::now(),
        ScheduleKind::simple(chrono::Duration::seconds(3600), RepeatCount::Times(0)),
    );
    trigger.data.insert("region", "us-east");
    scheduler.add_trigger(trigger).unwrap();

    scheduler.start();
    std::thread::sleep(Duration::from_millis(150));

    let wrong_value = "eu-west".into();
    assert!(!scheduler.stop_job_matching(&job_id, "region", &wrong_value));
    assert!(scheduler.is_job_running(&job_id));

    let right_value = "us-east".into();
    assert!(scheduler.stop_job_matching(&job_id, "region", &right_value));

    std::thread::sleep(Duration::from_millis(200));
    scheduler.shutdown(true);
    assert!(!scheduler.is_job_running(&job_id));
}

#[test]
fn test_shutdown_without_wait_interrupts_running_fire() {
    struct PollingJob;
    impl Job for PollingJob {
        fn run(&mut self, ctx: &scheduler_core::context::JobContext) -> scheduler_core::SchedulerResult<RunOutcome> {
            for _ in 0..100 {
                if ctx.is_interrupted() {
                    return Ok(RunOutcome::Interrupted);
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Ok(RunOutcome::Success)
        }
    }

    let scheduler = Scheduler::builder().with_worker_pool_size(1).build();
    let factory: JobFactory = simple_factory(|| PollingJob);
    let job_id = JobIdentity::named("shutdown-signaled-job");
    scheduler
        .add_job(JobDefinition::builder(job_id.clone(), factory).build())
        .unwrap();
    scheduler
        .add_trigger(Trigger::new(
            TriggerIdentity::named("shutdown-signaled-trigger"),
            job_id,
            Utc::now(),
            ScheduleKind::simple(chrono::Duration::seconds(3600), RepeatCount::Times(0)),
        ))
        .unwrap();

    scheduler.start();
    std::thread::sleep(Duration::from_millis(150));
    // wait_for_jobs=false must still signal the in-flight fire to stop,
    // not just stop accepting new work.
    scheduler.shutdown(false);
}

#[test]
fn test_duplicate_descriptor_reload_is_idempotent() {
    struct NoopJob;
    impl Job for NoopJob {
        fn run(&mut self, _ctx: &scheduler_core::context::JobContext) -> scheduler_core::SchedulerResult<RunOutcome> {
            Ok(RunOutcome::Success)
        }
    }

    let mut registry = JobFactoryRegistry::new();
    registry.register("noop", simple_factory(|| NoopJob));

    let doc = r#"
jobs:
  - name: recurring
    type: noop
    durable: true
triggers:
  - name: recurring-trigger
    job_name: recurring
    schedule:
      kind: simple
      repeat_interval_seconds: 3600
      repeat_count: 0
"#;

    let scheduler = Scheduler::builder().build();
    scheduler.load_descriptor(doc, &registry).unwrap();

    // A second load of the same descriptor (as a hot-reload would attempt
    // on an unchanged file) must succeed and leave the store contents
    // unchanged, not fail or duplicate state.
    scheduler.load_descriptor(doc, &registry).unwrap();
    assert_eq!(scheduler.get_all_job_names().len(), 1);
    assert_eq!(scheduler.get_all_trigger_names().len(), 1);
}

#[test]
fn test_validate_via_loader_does_not_require_a_running_scheduler() {
    struct NoopJob;
    impl Job for NoopJob {
        fn run(&mut self, _ctx: &scheduler_core::context::JobContext) -> scheduler_core::SchedulerResult<RunOutcome> {
            Ok(RunOutcome::Success)
        }
    }
    let mut registry = JobFactoryRegistry::new();
    registry.register("noop", simple_factory(|| NoopJob));

    let store = JobStore::new();
    let doc = r#"
jobs:
  - name: standalone
    type: noop
triggers:
  - name: standalone-trigger
    job_name: standalone
    schedule:
      kind: simple
      repeat_interval_seconds: 60
"#;
    let installed = scheduler_core::loader::load_descriptor(doc, &registry, &store).unwrap();
    assert_eq!(installed, 2);
    assert!(store.job_exists(&JobIdentity::named("standalone")));
}
