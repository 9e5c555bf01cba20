//! Trailing-edge debouncer.
//!
//! Input can change at any rate; the output only takes the latest input once
//! it has stayed unchanged for the quiet period.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(500);

pub struct Debouncer<T> {
    input: watch::Sender<T>,
    output: watch::Receiver<T>,
    task: JoinHandle<()>,
}

impl<T> Debouncer<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(initial: T, quiet: Duration) -> Self {
        let (input, input_rx) = watch::channel(initial.clone());
        let (output_tx, output) = watch::channel(initial);
        let task = tokio::spawn(run(input_rx, output_tx, quiet));
        Self {
            input,
            output,
            task,
        }
    }

    pub fn push(&self, value: T) {
        self.input.send_replace(value);
    }

    /// Latest raw input.
    pub fn raw(&self) -> T {
        self.input.borrow().clone()
    }

    /// Latest settled value.
    pub fn current(&self) -> T {
        self.output.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.output.clone()
    }
}

impl<T> Drop for Debouncer<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run<T>(mut input: watch::Receiver<T>, output: watch::Sender<T>, quiet: Duration)
where
    T: Clone + PartialEq,
{
    while input.changed().await.is_ok() {
        // Every new input restarts the quiet period.
        loop {
            tokio::select! {
                changed = input.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = sleep(quiet) => break,
            }
        }

        let value = input.borrow_and_update().clone();
        output.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });
    }
}
