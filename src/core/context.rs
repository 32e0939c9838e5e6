use super::Shared;
use super::job::{JobFn, JobId, ExecutionPolicy, INVALID_JOB_ID};
use super::group::{JobGroupId, INVALID_JOB_GROUP_ID};
use super::queue::LocalQueue;

/// What every job body receives.
///
/// Gives access to the scheduler from inside a job, and knows which job and
/// which worker it is running on, so that jobs scheduled from here go to the
/// worker's own queue.
pub struct JobContext<'a> {
    pub(crate) shared: &'a Shared,
    local: Option<&'a LocalQueue>,
    job: JobId,
    worker: Option<u32>,
}

impl<'a> JobContext<'a> {
    pub(crate) fn new(shared: &'a Shared, local: Option<&'a LocalQueue>, job: JobId, worker: Option<u32>) -> Self {
        JobContext { shared, local, job, worker }
    }

    /// The id of the job currently running.
    pub fn job_id(&self) -> JobId { self.job }

    /// The index of the worker thread running this job, or `None` when the job
    /// runs on the main thread or on a thread that is waiting on another job.
    pub fn worker_index(&self) -> Option<u32> { self.worker }

    pub fn is_worker_thread(&self) -> bool { self.worker.is_some() }

    pub fn is_main_thread(&self) -> bool {
        std::thread::current().id() == self.shared.main_thread
    }

    pub fn num_worker_threads(&self) -> u32 { self.shared.num_workers }

    /// Create a child of the current job without scheduling it.
    pub fn create_child<F>(&self, function: F) -> JobId
    where F: FnOnce(&JobContext) + Send + 'static
    {
        self.job().with_parent(self.job).create(function)
    }

    /// Create and schedule a child of the current job.
    ///
    /// The current job is only considered complete once the child is.
    pub fn run_child<F>(&self, function: F) -> JobId
    where F: FnOnce(&JobContext) + Send + 'static
    {
        self.job().with_parent(self.job).run(function)
    }
}

/// Where new work is submitted from.
///
/// This is what lets the same API push to a worker's own queue when called from
/// a job, and to the shared inboxes otherwise.
#[doc(hidden)]
#[derive(Copy, Clone)]
pub struct Submitter<'a> {
    pub(crate) shared: &'a Shared,
    pub(crate) local: Option<&'a LocalQueue>,
    pub(crate) worker: Option<u32>,
    pub(crate) on_main_thread: bool,
}

/// The operations to create, schedule and wait for jobs.
///
/// Implemented by `Scheduler` (from outside of the workers) and `JobContext`
/// (from inside a job).
pub trait JobApi {
    #[doc(hidden)]
    fn submitter(&self) -> Submitter<'_>;

    /// Start building a job with a policy, parent or group.
    fn job(&self) -> JobBuilder<'_> {
        JobBuilder {
            submitter: self.submitter(),
            policy: ExecutionPolicy::Worker,
            parent: INVALID_JOB_ID,
            group: INVALID_JOB_GROUP_ID,
        }
    }

    /// Create a job without scheduling it. It will not run before `run_job` is
    /// called with its id.
    fn create_job<F>(&self, function: F) -> JobId
    where F: FnOnce(&JobContext) + Send + 'static
    {
        self.job().create(function)
    }

    /// Create a job and schedule it right away.
    fn create_and_run_job<F>(&self, function: F) -> JobId
    where F: FnOnce(&JobContext) + Send + 'static
    {
        self.job().run(function)
    }

    /// Create a job that `parent` will wait for, without scheduling it.
    fn create_job_as_child<F>(&self, parent: JobId, function: F) -> JobId
    where F: FnOnce(&JobContext) + Send + 'static
    {
        assert!(parent.is_valid(), "the parent job must be a valid job id");
        self.job().with_parent(parent).create(function)
    }

    /// Schedule a job created with `create_job` or `create_job_as_child`.
    fn run_job(&self, job: JobId) {
        let submitter = self.submitter();
        submitter.shared.run_job(job, submitter.local);
    }

    /// Release a job that was created but never scheduled. It counts as
    /// finished for its parent and group.
    fn destroy_job(&self, job: JobId) {
        self.submitter().shared.destroy_job(job);
    }

    /// Wait until the job and all of its children are complete, executing other
    /// jobs in the mean time.
    fn wait_for_job(&self, job: JobId) {
        let s = self.submitter();
        s.shared.wait_for_job(job, s.local, s.worker, s.on_main_thread);
    }

    /// Returns true if the job and all of its children are complete.
    fn is_job_complete(&self, job: JobId) -> bool {
        self.submitter().shared.is_job_complete(job)
    }

    /// Allocate a group to wait on a batch of jobs at once.
    ///
    /// Every group must eventually be waited on with `wait_for_job_group`,
    /// which gives its slot back to the table.
    fn create_job_group(&self) -> JobGroupId {
        self.submitter().shared.groups.allocate()
    }

    /// Wait until all jobs added to the group are complete and release the
    /// group.
    fn wait_for_job_group(&self, group: JobGroupId) {
        let s = self.submitter();
        s.shared.wait_for_job_group(group, s.local, s.worker, s.on_main_thread);
    }
}

impl<'a> JobApi for JobContext<'a> {
    fn submitter(&self) -> Submitter<'_> {
        Submitter {
            shared: self.shared,
            local: self.local,
            worker: self.worker,
            on_main_thread: self.worker.is_none() && self.is_main_thread(),
        }
    }
}

/// Parameters of a job that is about to be created.
pub struct JobBuilder<'a> {
    submitter: Submitter<'a>,
    policy: ExecutionPolicy,
    parent: JobId,
    group: JobGroupId,
}

impl<'a> JobBuilder<'a> {
    #[inline]
    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Make the job a child of `parent`: the parent will not be complete
    /// before this job is.
    #[inline]
    pub fn with_parent(mut self, parent: JobId) -> Self {
        self.parent = parent;
        self
    }

    /// Count the job in a group created with `JobApi::create_job_group`.
    #[inline]
    pub fn in_group(mut self, group: JobGroupId) -> Self {
        self.group = group;
        self
    }

    /// Create the job without scheduling it.
    pub fn create<F>(self, function: F) -> JobId
    where F: FnOnce(&JobContext) + Send + 'static
    {
        self.build(JobFn::new(function), false)
    }

    /// Create and schedule the job.
    pub fn run<F>(self, function: F) -> JobId
    where F: FnOnce(&JobContext) + Send + 'static
    {
        self.build(JobFn::new(function), true)
    }

    fn build(self, function: JobFn, schedule: bool) -> JobId {
        let s = self.submitter;
        s.shared.create_job(s.local, function, self.policy, self.parent, self.group, schedule)
    }
}
