//! Cooperative scheduling contract.
//!
//! One engine runs one scheduler; there is no kernel-thread parallelism
//! inside it. Work units are explicit state machines stepped round-robin,
//! and preemption happens only when a step returns [`Step::Yield`]. The
//! same contract reaches the garbage collector as a yield hook: returning
//! a negative value requests an orderly stop of the current drain.

/// Outcome of one task step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Give other tasks a turn, then continue.
    Yield,
    /// The task is finished.
    Done,
}

/// A cooperative work unit: stepped until it reports [`Step::Done`].
pub trait Ult {
    fn step(&mut self) -> Step;
}

impl<F: FnMut() -> Step> Ult for F {
    fn step(&mut self) -> Step {
        self()
    }
}

/// Round-robin executor over cooperative tasks.
#[derive(Default)]
pub struct Scheduler<'a> {
    tasks: Vec<Box<dyn Ult + 'a>>,
}

impl<'a> Scheduler<'a> {
    #[must_use]
    pub fn new() -> Self {
        Scheduler { tasks: Vec::new() }
    }

    pub fn spawn(&mut self, task: impl Ult + 'a) {
        self.tasks.push(Box::new(task));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Step every live task once. Returns the number still running.
    pub fn tick(&mut self) -> usize {
        let mut live = Vec::with_capacity(self.tasks.len());
        for mut task in self.tasks.drain(..) {
            if task.step() == Step::Yield {
                live.push(task);
            }
        }
        self.tasks = live;
        self.tasks.len()
    }

    /// Run until every task finishes.
    pub fn run_to_completion(&mut self) {
        while self.tick() > 0 {}
    }
}

/// Credit modes for reclamation slices, matching the collector's budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditMode {
    /// Busy engine: small slices.
    Slack,
    /// Idle engine: larger slices.
    Tight,
}

impl CreditMode {
    #[must_use]
    pub fn credits(self) -> u32 {
        match self {
            CreditMode::Slack => tidepool_store::GC_CREDS_SLACK,
            CreditMode::Tight => tidepool_store::GC_CREDS_TIGHT,
        }
    }
}
