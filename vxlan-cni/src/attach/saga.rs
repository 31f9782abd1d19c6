use log::{debug, warn};

type Action<'a> = Box<dyn FnOnce() -> anyhow::Result<()> + 'a>;

struct Compensation<'a> {
    description: String,
    action: Action<'a>,
}

/// Undo actions for the steps of a multi-step operation that already
/// succeeded. Either `complete` it or `compensate` it, undoing in reverse.
#[derive(Default)]
pub struct Saga<'a> {
    compensations: Vec<Compensation<'a>>,
}

impl<'a> Saga<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F>(&mut self, description: impl Into<String>, action: F)
    where
        F: FnOnce() -> anyhow::Result<()> + 'a,
    {
        self.compensations.push(Compensation {
            description: description.into(),
            action: Box::new(action),
        });
    }

    pub fn len(&self) -> usize {
        self.compensations.len()
    }

    pub fn complete(self) {
        debug!(
            "Completed, dropping {} compensations",
            self.compensations.len()
        );
    }

    /// Runs every compensation, newest first. Failures are logged and don't
    /// stop the remaining ones. Returns the number of failed compensations.
    pub fn compensate(self) -> usize {
        let mut failed = 0;

        for compensation in self.compensations.into_iter().rev() {
            debug!("Compensating: {}", compensation.description);

            if let Err(err) = (compensation.action)() {
                warn!(
                    "Couldn't {}! Leaving it behind: {err:#}",
                    compensation.description
                );
                failed += 1;
            }
        }

        failed
    }
}
