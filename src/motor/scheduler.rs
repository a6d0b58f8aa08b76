// Fixed-rate tick loop on a dedicated thread
//
// Sleep-until-deadline scheduling: each tick's deadline advances by one
// period from the previous deadline, not from when the tick finished, so
// the average rate holds even when individual ticks jitter. An overrun is
// logged and the schedule re-anchors at the current time instead of
// bursting to catch up.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

pub struct TickLoop {
    label: String,
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TickLoop {
    /// Spawn a thread that invokes `tick` every `period` until stopped.
    pub fn start<F>(label: &str, period: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let thread_label = label.to_string();
        let handle = thread::Builder::new()
            .name(thread_label.clone())
            .spawn(move || {
                info!("{}: tick loop started ({:?} period)", thread_label, period);
                let mut deadline = Instant::now() + period;
                while flag.load(Ordering::Relaxed) {
                    tick();
                    let now = Instant::now();
                    if now < deadline {
                        thread::sleep(deadline - now);
                        deadline += period;
                    } else {
                        warn!(
                            "{}: tick overran its period by {:?}",
                            thread_label,
                            now - deadline
                        );
                        deadline = now + period;
                    }
                }
                info!("{}: tick loop stopped", thread_label);
            })?;
        Ok(Self {
            label: label.to_string(),
            running,
            handle: Some(handle),
        })
    }

    /// Signal the loop to stop and wait for the thread to exit.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("{}: tick loop thread panicked", self.label);
        }
    }
}

impl Drop for TickLoop {
    fn drop(&mut self) {
        self.stop();
    }
}
