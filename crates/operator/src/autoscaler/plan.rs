//! The pure planning core of the autoscaler.
//!
//! Every pass recomputes the full schedule from scratch: jobs are sorted by
//! `(priority desc, queuedTime asc)`, workers are dispatched down the list
//! until resources run out, and the remaining idle units are squeezed into
//! the head of the waiting list, preempting equal-or-lower priority jobs if
//! needed. Recomputing per pass keeps the invariants simple under arbitrary
//! event reordering.
//!
//! Jobs are addressed by index into the fetched list so the running/waiting
//! orderings can be carried around without aliasing the job values.

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use tracing::{info, warn};

use crate::config::NODE_RESOURCE_UNIT;
use crate::crd::{TrainingJob, TrainingJobStage};
use crate::error::{Error, Result};

/// Validate the elastic bounds and the single-container invariant.
pub fn check_configuration(job: &TrainingJob) -> Result<()> {
    let name = job.name_any();

    if job.spec.min_size.is_none() {
        return Err(Error::invalid_job(&name, "minSize is not set"));
    }
    if job.spec.max_size.is_none() {
        return Err(Error::invalid_job(&name, "maxSize is not set"));
    }
    if job.min_size() < 1 {
        return Err(Error::invalid_job(&name, "minSize < 1"));
    }
    if job.min_size() > job.max_size() {
        return Err(Error::invalid_job(&name, "minSize > maxSize"));
    }

    let containers = job
        .spec
        .replica_specs
        .template
        .spec
        .as_ref()
        .map(|s| s.containers.len())
        .unwrap_or(0);
    if containers != 1 {
        return Err(Error::single_container_violation(&name, containers));
    }

    Ok(())
}

/// Resource units one worker pod of this job consumes.
///
/// With the `node` unit every pod costs 1. Otherwise the named resource is
/// summed over the (single) container's requests; unset means 1.
pub fn resource_usage_per_pod(job: &TrainingJob, resource_unit: &str) -> i32 {
    if resource_unit == NODE_RESOURCE_UNIT {
        return 1;
    }

    let mut usage: i64 = 0;
    if let Some(pod_spec) = job.spec.replica_specs.template.spec.as_ref() {
        for container in &pod_spec.containers {
            let requested = container
                .resources
                .as_ref()
                .and_then(|r| r.requests.as_ref())
                .and_then(|requests| requests.get(resource_unit));
            if let Some(quantity) = requested {
                usage += quantity.0.parse::<i64>().unwrap_or(0);
            }
        }
    }

    if usage == 0 {
        // The resource is not declared on the job; budget one unit per pod.
        usage = 1;
    }
    usage.min(i64::from(i32::MAX)) as i32
}

/// Move newly created, completed, and cooled-down jobs to the right stage
/// before planning. Returns the problems found along the way; the pass logs
/// them and carries on.
pub fn reset_job_status(jobs: &mut [TrainingJob]) -> Vec<String> {
    let mut problems = Vec::new();

    for job in jobs.iter_mut() {
        let name = job.name_any();

        if let Err(err) = check_configuration(job) {
            problems.push(err.to_string());
            wrong_job(job);
            continue;
        }

        // If the reconciler missed a completion, retire the job here so it
        // stops holding resources.
        let exec = job.status.clone().unwrap_or_default().exec_status;
        if exec.is_succeeded() || exec.is_failed() {
            match job.stage() {
                TrainingJobStage::Running => complete_job(job),
                TrainingJobStage::Completed => {}
                other => {
                    problems.push(format!("{name} completed without running (stage {other})"));
                }
            }
        }

        if matches!(job.stage(), TrainingJobStage::Init | TrainingJobStage::Wrong) {
            let created_only = job
                .status
                .as_ref()
                .map(|s| s.exec_status.is_created_only())
                .unwrap_or(false);
            job.status_mut().submit_time = Some(Time(Utc::now()));
            queue_job(job);
            if !created_only {
                problems.push(format!(
                    "{name} seems not correctly configured during creation; queueing it anyway"
                ));
            }
        }

        if job.stage() == TrainingJobStage::Requeuing {
            match job.status.as_ref().and_then(|s| s.cooldown_time.as_ref()) {
                None => problems.push(format!("{name} is under cooldown without a due time")),
                Some(cooldown) => {
                    if Utc::now() > cooldown.0 {
                        // Cooldown served; re-enter the queue with a fresh
                        // queuedTime, losing the old place in line.
                        queue_job(job);
                    }
                }
            }
        }
    }

    problems
}

/// Indices of all schedulable jobs, ordered by `(priority desc, queuedTime asc)`.
///
/// A job still at Init here means the reset step was skipped for it somehow;
/// that is reported in the log only and intentionally not propagated.
pub fn construct_priority_list(jobs: &[TrainingJob]) -> Vec<usize> {
    let mut order = Vec::new();

    for (idx, job) in jobs.iter().enumerate() {
        match job.stage() {
            TrainingJobStage::Init => {
                warn!(
                    job = %job.name_any(),
                    "job shouldn't be at init stage by this time; check why it was not queued"
                );
            }
            TrainingJobStage::Waiting | TrainingJobStage::Running => order.push(idx),
            _ => {}
        }
    }

    order.sort_by(|&a, &b| {
        let (ja, jb) = (&jobs[a], &jobs[b]);
        jb.priority()
            .cmp(&ja.priority())
            .then_with(|| {
                let ta = ja.queued_time().map(|t| t.0);
                let tb = jb.queued_time().map(|t| t.0);
                ta.cmp(&tb)
            })
    });

    order
}

/// Walk the priority list handing out workers until resources run out.
///
/// Once a job fails to fit, every later job is paused as well: the strict
/// `(priority, queuedTime)` order forbids skipping over a non-fitting job.
/// A job whose `minSize` can never fit in the whole pool is reported, but the
/// fitting logic still runs for it so anything admissible is admitted.
pub fn dispatch_workers(
    jobs: &mut [TrainingJob],
    order: &[usize],
    total_resources: i32,
    resource_unit: &str,
) -> Vec<String> {
    let mut problems = Vec::new();
    let mut remaining = total_resources;
    let mut finished = false;

    for &idx in order {
        let usage = resource_usage_per_pod(&jobs[idx], resource_unit);
        let job = &mut jobs[idx];

        if job.min_size() * usage > total_resources {
            problems.push(format!(
                "job {} needs more {} than the whole pool has ({} > {})",
                job.name_any(),
                resource_unit,
                job.min_size() * usage,
                total_resources,
            ));
        }

        if finished {
            // Even if this job could fit we keep the strict order.
            pause_job(job);
        } else if remaining >= job.max_size() * usage {
            let size = job.max_size();
            resize_job(job, size);
            remaining -= size * usage;
        } else if remaining >= job.min_size() * usage {
            let size = remaining / usage;
            resize_job(job, size);
            remaining -= size * usage;
        } else {
            finished = true;
            pause_job(job);
        }
    }

    problems
}

/// Split the ordered schedulable jobs into running and waiting index lists.
pub fn construct_scheduling_lists(
    jobs: &[TrainingJob],
    order: &[usize],
) -> Result<(Vec<usize>, Vec<usize>)> {
    let mut running = Vec::new();
    let mut waiting = Vec::new();

    for &idx in order {
        match jobs[idx].stage() {
            TrainingJobStage::Running => running.push(idx),
            TrainingJobStage::Waiting => waiting.push(idx),
            other => {
                return Err(Error::invalid_job(
                    jobs[idx].name_any(),
                    format!("stage {other} after dispatch, expected Running or Waiting"),
                ))
            }
        }
    }

    Ok((running, waiting))
}

/// Resource units currently idle given the running set.
pub fn idle_resources(
    jobs: &[TrainingJob],
    running: &[usize],
    total_resources: i32,
    resource_unit: &str,
) -> i32 {
    let used: i32 = running
        .iter()
        .map(|&idx| jobs[idx].current_size() * resource_usage_per_pod(&jobs[idx], resource_unit))
        .sum();
    total_resources - used
}

/// Units reclaimable from running jobs with priority <= `priority` without
/// taking any of them below `minSize`.
fn seizable_resources(
    jobs: &[TrainingJob],
    running: &[usize],
    priority: i32,
    resource_unit: &str,
) -> i32 {
    running
        .iter()
        .filter(|&&idx| jobs[idx].priority() <= priority)
        .map(|&idx| {
            let usage = resource_usage_per_pod(&jobs[idx], resource_unit);
            (jobs[idx].current_size() - jobs[idx].min_size()) * usage
        })
        .sum()
}

/// Try to start the head of the waiting list, preempting from the tail of the
/// running list when idle units alone are not enough. Returns whether the job
/// was started.
fn squeeze_first_job(
    jobs: &mut [TrainingJob],
    running: &mut Vec<usize>,
    waiting: &mut Vec<usize>,
    total_resources: i32,
    resource_unit: &str,
) -> bool {
    let Some(&candidate) = waiting.first() else {
        return false;
    };

    let idle = idle_resources(jobs, running, total_resources, resource_unit);
    let usage = resource_usage_per_pod(&jobs[candidate], resource_unit);
    let min_needed = jobs[candidate].min_size() * usage;

    // Case 1: idle units alone suffice.
    if idle >= min_needed {
        let size = (idle / usage).min(jobs[candidate].max_size());
        start_job(&mut jobs[candidate], size);
        running.push(candidate);
        waiting.remove(0);
        return true;
    }

    let seizable = seizable_resources(jobs, running, jobs[candidate].priority(), resource_unit);

    // Case 2: preempt equal-or-lower priority jobs. The running list is in
    // priority order, so walking from the tail reclaims enough units before
    // any higher-priority job could be touched.
    if idle + seizable >= min_needed {
        let mut seized = 0;
        for &victim in running.iter().rev() {
            if seized + idle >= min_needed {
                break;
            }
            let victim_usage = resource_usage_per_pod(&jobs[victim], resource_unit);
            let spare = jobs[victim].current_size() - jobs[victim].min_size();
            let still_needed = min_needed - seized - idle;

            if spare * victim_usage >= still_needed {
                // This victim alone covers the rest; round up to whole pods.
                let workers_to_stop = (still_needed + victim_usage - 1) / victim_usage;
                seized += workers_to_stop * victim_usage;
                let new_size = jobs[victim].current_size() - workers_to_stop;
                resize_job(&mut jobs[victim], new_size);
                break;
            } else {
                seized += spare * victim_usage;
                let new_size = jobs[victim].min_size();
                resize_job(&mut jobs[victim], new_size);
            }
        }

        let size = ((idle + seized) / usage).min(jobs[candidate].max_size());
        start_job(&mut jobs[candidate], size);
        running.push(candidate);
        waiting.remove(0);
        return true;
    }

    // Case 3: not startable; every later waiter is ordered after this one.
    false
}

/// Squeeze waiting jobs into the idle units until the head no longer fits.
pub fn start_waiting_jobs(
    jobs: &mut [TrainingJob],
    running: &mut Vec<usize>,
    waiting: &mut Vec<usize>,
    total_resources: i32,
    resource_unit: &str,
) {
    let running_before = running.len();

    while idle_resources(jobs, running, total_resources, resource_unit) > 0 {
        if !squeeze_first_job(jobs, running, waiting, total_resources, resource_unit) {
            break;
        }
    }

    info!(
        started = running.len() - running_before,
        idle = idle_resources(jobs, running, total_resources, resource_unit),
        "tried to start jobs from the waiting list"
    );
}

/// Did the pass change the job's intended state?
pub fn job_autoscaled(old: &TrainingJob, new: &TrainingJob) -> bool {
    old.stage() != new.stage() || old.current_size() != new.current_size()
}

/// Nearest future cooldown deadline, as a delay from now.
///
/// Expired cooldown timestamps linger in job status after a requeue; only
/// deadlines still ahead of us warrant scheduling a rerun.
pub fn find_cooldown_rerun(jobs: &[TrainingJob]) -> Option<std::time::Duration> {
    let now = Utc::now();
    jobs.iter()
        .filter_map(|job| job.status.as_ref()?.cooldown_time.as_ref())
        .filter_map(|cooldown| (cooldown.0 - now).to_std().ok())
        .filter(|delay| !delay.is_zero())
        .min()
}

// --- stage transitions ------------------------------------------------------

/// Put the job into the waiting list, resetting its place in the FIFO.
pub fn queue_job(job: &mut TrainingJob) {
    let status = job.status_mut();
    status.stage = TrainingJobStage::Waiting;
    status.current_size = 0;
    status.queued_time = Some(Time(Utc::now()));
}

/// Move a waiting job into the running list with `size` workers.
pub fn start_job(job: &mut TrainingJob, size: i32) {
    let status = job.status_mut();
    status.stage = TrainingJobStage::Running;
    status.current_size = size;
    status.last_exec_time = Some(Time(Utc::now()));
}

/// Retire the job.
pub fn complete_job(job: &mut TrainingJob) {
    let status = job.status_mut();
    status.stage = TrainingJobStage::Completed;
    status.current_size = 0;
    status.completion_time = Some(Time(Utc::now()));
}

/// Pull the job from the running list and lock it out until `cooldown_until`.
pub fn requeue_job(job: &mut TrainingJob, cooldown_until: Time) {
    let status = job.status_mut();
    status.stage = TrainingJobStage::Requeuing;
    status.current_size = 0;
    status.cooldown_time = Some(cooldown_until);
}

/// Change the intended size; starts the job if it was waiting.
pub fn resize_job(job: &mut TrainingJob, size: i32) {
    if job.stage() == TrainingJobStage::Waiting {
        let status = job.status_mut();
        status.stage = TrainingJobStage::Running;
        status.last_exec_time = Some(Time(Utc::now()));
    }
    job.status_mut().current_size = size;
}

/// Park the job in the waiting list without touching its queuedTime.
pub fn pause_job(job: &mut TrainingJob) {
    let status = job.status_mut();
    status.stage = TrainingJobStage::Waiting;
    status.current_size = 0;
}

/// Mark a misconfigured job; it holds no workers until the spec is fixed.
pub fn wrong_job(job: &mut TrainingJob) {
    let status = job.status_mut();
    status.stage = TrainingJobStage::Wrong;
    status.current_size = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        apply_defaults, update_job_conditions, JobConditionType, ReplicaSpec, TrainingJobSpec,
        DEFAULT_CONTAINER_NAME,
    };
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use rstest::rstest;

    const NODE: &str = NODE_RESOURCE_UNIT;
    const GPU: &str = "nvidia.com/gpu";

    fn worker_template(gpus: Option<&str>) -> PodTemplateSpec {
        let resources = gpus.map(|count| ResourceRequirements {
            requests: Some(
                [(GPU.to_string(), Quantity(count.to_string()))]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        });

        PodTemplateSpec {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: DEFAULT_CONTAINER_NAME.to_string(),
                    image: Some("training:latest".to_string()),
                    resources,
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn new_job(name: &str, min: i32, max: i32, priority: i32) -> TrainingJob {
        let mut job = TrainingJob::new(
            name,
            TrainingJobSpec {
                run_policy: Default::default(),
                replica_specs: ReplicaSpec {
                    replicas: None,
                    template: worker_template(None),
                    restart_policy: None,
                },
                min_size: Some(min),
                max_size: Some(max),
                inject_lattice: None,
                framework: None,
                priority: Some(priority),
            },
        );
        job.metadata.namespace = Some("training".to_string());
        apply_defaults(&mut job);
        update_job_conditions(
            &mut job.status_mut().exec_status,
            JobConditionType::Created,
            "TrainingJobCreated",
            "created",
        );
        job
    }

    /// One full planning pass over the job list.
    fn plan(jobs: &mut [TrainingJob], total: i32, unit: &str) {
        reset_job_status(jobs);
        let order = construct_priority_list(jobs);
        dispatch_workers(jobs, &order, total, unit);
        let (mut running, mut waiting) = construct_scheduling_lists(jobs, &order).unwrap();
        start_waiting_jobs(jobs, &mut running, &mut waiting, total, unit);
    }

    fn assert_invariants(jobs: &[TrainingJob], total: i32, unit: &str) {
        let mut used = 0;
        for job in jobs {
            match job.stage() {
                TrainingJobStage::Running => {
                    assert!(job.current_size() >= job.min_size(), "{}", job.name_any());
                    assert!(job.current_size() <= job.max_size(), "{}", job.name_any());
                    used += job.current_size() * resource_usage_per_pod(job, unit);
                }
                _ => assert_eq!(job.current_size(), 0, "{}", job.name_any()),
            }
        }
        assert!(used <= total, "pool oversubscribed: {used} > {total}");

        // No job runs while a strictly earlier one waits.
        for a in jobs {
            for b in jobs {
                let earlier = a.priority() > b.priority()
                    || (a.priority() == b.priority()
                        && a.queued_time().map(|t| t.0) < b.queued_time().map(|t| t.0));
                if earlier
                    && a.stage() == TrainingJobStage::Waiting
                    && b.stage() == TrainingJobStage::Running
                {
                    panic!(
                        "{} runs while earlier {} waits",
                        b.name_any(),
                        a.name_any()
                    );
                }
            }
        }
    }

    #[test]
    fn single_job_gets_max_size() {
        // Pool of 5 nodes, one 2..4 job: it runs at max.
        let mut jobs = vec![new_job("job-a", 2, 4, 0)];
        plan(&mut jobs, 5, NODE);

        assert_eq!(jobs[0].stage(), TrainingJobStage::Running);
        assert_eq!(jobs[0].current_size(), 4);
        assert!(jobs[0].status.as_ref().unwrap().submit_time.is_some());
        assert_invariants(&jobs, 5, NODE);
    }

    #[test]
    fn second_job_squeezes_in_by_shrinking_the_first() {
        let mut jobs = vec![new_job("job-a", 2, 4, 0)];
        plan(&mut jobs, 5, NODE);

        jobs.push(new_job("job-b", 2, 4, 0));
        plan(&mut jobs, 5, NODE);

        assert_eq!(jobs[0].stage(), TrainingJobStage::Running);
        assert_eq!(jobs[1].stage(), TrainingJobStage::Running);
        assert_eq!(jobs[0].current_size(), 3);
        assert_eq!(jobs[1].current_size(), 2);
        assert_invariants(&jobs, 5, NODE);
    }

    #[test]
    fn high_priority_job_preempts_down_to_min_size() {
        let mut jobs = vec![new_job("job-a", 2, 4, 0)];
        plan(&mut jobs, 4, NODE);
        assert_eq!(jobs[0].current_size(), 4);

        jobs.push(new_job("job-b", 2, 2, 10));
        plan(&mut jobs, 4, NODE);

        assert_eq!(jobs[0].stage(), TrainingJobStage::Running);
        assert_eq!(jobs[0].current_size(), 2);
        assert_eq!(jobs[1].stage(), TrainingJobStage::Running);
        assert_eq!(jobs[1].current_size(), 2);
        assert_invariants(&jobs, 4, NODE);
    }

    #[test]
    fn preemption_never_goes_below_min_size() {
        let mut jobs = vec![new_job("job-a", 3, 4, 0)];
        plan(&mut jobs, 5, NODE);
        assert_eq!(jobs[0].current_size(), 4);

        // job-b needs 3; 1 idle plus 1 seizable above job-a's min is not
        // enough, so nothing is taken and job-b waits.
        jobs.push(new_job("job-b", 3, 3, 0));
        plan(&mut jobs, 5, NODE);

        assert_eq!(jobs[0].current_size(), 4);
        assert_eq!(jobs[1].stage(), TrainingJobStage::Waiting);
        assert_invariants(&jobs, 5, NODE);
    }

    #[test]
    fn oversized_job_blocks_later_jobs_too() {
        // job-a can never fit; strict ordering keeps job-c out as well.
        let mut jobs = vec![new_job("job-a", 3, 3, 0)];
        plan(&mut jobs, 2, NODE);
        assert_eq!(jobs[0].stage(), TrainingJobStage::Waiting);

        jobs.push(new_job("job-c", 1, 1, -1));
        plan(&mut jobs, 2, NODE);

        assert_eq!(jobs[0].stage(), TrainingJobStage::Waiting);
        assert_eq!(jobs[1].stage(), TrainingJobStage::Waiting);
        assert_invariants(&jobs, 2, NODE);
    }

    #[test]
    fn oversized_job_is_reported_but_dispatch_continues() {
        let mut jobs = vec![new_job("job-big", 3, 3, 5), new_job("job-small", 1, 1, 0)];
        reset_job_status(&mut jobs);
        let order = construct_priority_list(&jobs);

        let problems = dispatch_workers(&mut jobs, &order, 2, NODE);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("job-big"));
        // The non-fitting head pauses everything behind it.
        assert_eq!(jobs[1].stage(), TrainingJobStage::Waiting);
    }

    #[test]
    fn gpu_unit_counts_per_pod_requests() {
        let mut job = new_job("job-gpu", 1, 4, 0);
        job.spec.replica_specs.template = worker_template(Some("2"));

        assert_eq!(resource_usage_per_pod(&job, GPU), 2);
        assert_eq!(resource_usage_per_pod(&job, NODE), 1);

        // 5 GPUs / 2 per pod: runs with 2 workers.
        let mut jobs = vec![job];
        plan(&mut jobs, 5, GPU);
        assert_eq!(jobs[0].current_size(), 2);
        assert_invariants(&jobs, 5, GPU);
    }

    #[test]
    fn unset_resource_request_defaults_to_one_unit() {
        let job = new_job("job-a", 1, 1, 0);
        assert_eq!(resource_usage_per_pod(&job, GPU), 1);
    }

    #[rstest]
    #[case(None, Some(2), "minSize is not set")]
    #[case(Some(2), None, "maxSize is not set")]
    #[case(Some(0), Some(2), "minSize < 1")]
    #[case(Some(3), Some(2), "minSize > maxSize")]
    fn bad_bounds_are_rejected(
        #[case] min: Option<i32>,
        #[case] max: Option<i32>,
        #[case] reason: &str,
    ) {
        let mut job = new_job("job-a", 1, 1, 0);
        job.spec.min_size = min;
        job.spec.max_size = max;

        let err = check_configuration(&job).unwrap_err();
        assert!(err.to_string().contains(reason), "{err}");
    }

    #[test]
    fn misconfigured_job_is_marked_wrong_and_holds_nothing() {
        let mut jobs = vec![new_job("job-a", 2, 4, 0)];
        jobs[0].spec.min_size = Some(0);

        let problems = reset_job_status(&mut jobs);
        assert_eq!(problems.len(), 1);
        assert_eq!(jobs[0].stage(), TrainingJobStage::Wrong);
        assert_eq!(jobs[0].current_size(), 0);

        // Wrong jobs never make it into the priority list.
        assert!(construct_priority_list(&jobs).is_empty());
    }

    #[test]
    fn completed_job_releases_resources() {
        let mut jobs = vec![new_job("job-a", 2, 4, 0)];
        plan(&mut jobs, 5, NODE);
        assert_eq!(jobs[0].stage(), TrainingJobStage::Running);

        update_job_conditions(
            &mut jobs[0].status_mut().exec_status,
            JobConditionType::Succeeded,
            "JobSucceeded",
            "done",
        );
        plan(&mut jobs, 5, NODE);

        assert_eq!(jobs[0].stage(), TrainingJobStage::Completed);
        assert_eq!(jobs[0].current_size(), 0);
        assert!(jobs[0].status.as_ref().unwrap().completion_time.is_some());
    }

    #[test]
    fn fifo_among_equal_priorities_follows_queued_time() {
        let mut jobs = vec![new_job("job-a", 2, 2, 0)];
        plan(&mut jobs, 2, NODE);
        jobs.push(new_job("job-b", 2, 2, 0));
        plan(&mut jobs, 2, NODE);

        // job-a was queued first and keeps the pool.
        assert_eq!(jobs[0].stage(), TrainingJobStage::Running);
        assert_eq!(jobs[1].stage(), TrainingJobStage::Waiting);
        assert_invariants(&jobs, 2, NODE);
    }

    #[test]
    fn cooldown_requeue_resets_queued_time() {
        let mut jobs = vec![new_job("job-a", 2, 2, 0)];
        plan(&mut jobs, 2, NODE);
        let queued_before = jobs[0].queued_time().unwrap().0;

        // Requeue with an already-expired cooldown; the next pass re-queues.
        requeue_job(&mut jobs[0], Time(Utc::now() - chrono::Duration::seconds(1)));
        assert_eq!(jobs[0].stage(), TrainingJobStage::Requeuing);
        plan(&mut jobs, 2, NODE);

        assert_eq!(jobs[0].stage(), TrainingJobStage::Running);
        let queued_after = jobs[0].queued_time().unwrap().0;
        assert!(queued_after > queued_before);
    }

    #[test]
    fn unexpired_cooldown_keeps_job_out_and_schedules_rerun() {
        let mut jobs = vec![new_job("job-a", 2, 2, 0)];
        plan(&mut jobs, 2, NODE);
        requeue_job(&mut jobs[0], Time(Utc::now() + chrono::Duration::hours(3)));

        plan(&mut jobs, 2, NODE);
        assert_eq!(jobs[0].stage(), TrainingJobStage::Requeuing);
        assert_eq!(jobs[0].current_size(), 0);

        let rerun = find_cooldown_rerun(&jobs).unwrap();
        assert!(rerun <= std::time::Duration::from_secs(3 * 60 * 60));
        assert!(rerun > std::time::Duration::from_secs(3 * 60 * 60 - 60));
    }

    #[test]
    fn shrinking_pool_evicts_strictly_later_jobs_first() {
        let mut jobs = vec![new_job("job-a", 2, 4, 0)];
        plan(&mut jobs, 5, NODE);
        jobs.push(new_job("job-b", 2, 4, 0));
        plan(&mut jobs, 5, NODE);
        assert_eq!(jobs.iter().map(|j| j.current_size()).sum::<i32>(), 5);

        // Pool shrinks to 3: the earlier job keeps min, the later one waits.
        plan(&mut jobs, 3, NODE);
        assert_eq!(jobs[0].stage(), TrainingJobStage::Running);
        assert_eq!(jobs[1].stage(), TrainingJobStage::Waiting);
        assert_invariants(&jobs, 3, NODE);
    }

    #[test]
    fn autoscaled_detects_stage_and_size_changes() {
        let before = new_job("job-a", 1, 2, 0);
        let mut after = before.clone();
        assert!(!job_autoscaled(&before, &after));

        after.status_mut().current_size = 2;
        assert!(job_autoscaled(&before, &after));

        let mut staged = before.clone();
        staged.status_mut().stage = TrainingJobStage::Waiting;
        assert!(job_autoscaled(&before, &staged));
    }

    #[test]
    fn multi_victim_preemption_walks_the_tail() {
        // Two elastic jobs running at max leave one idle unit; an equal
        // priority waiter seizes one worker from each to reach its min.
        let mut jobs = vec![new_job("job-a", 2, 3, 0)];
        plan(&mut jobs, 7, NODE);
        jobs.push(new_job("job-b", 2, 3, 0));
        plan(&mut jobs, 7, NODE);
        assert_eq!(jobs[0].current_size(), 3);
        assert_eq!(jobs[1].current_size(), 3);

        jobs.push(new_job("job-c", 3, 3, 0));
        plan(&mut jobs, 7, NODE);

        assert_eq!(jobs[2].stage(), TrainingJobStage::Running);
        assert_eq!(jobs[2].current_size(), 3);
        assert_eq!(jobs[0].current_size(), 2);
        assert_eq!(jobs[1].current_size(), 2);
        assert_invariants(&jobs, 7, NODE);
    }
}
