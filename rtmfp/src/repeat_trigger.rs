use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use crate::config::RtmfpConfig;
use crate::error::RtmfpError;

/// Decides when a writer re-sends unacknowledged fragments. The first repetition is due
///  `initial_delay` after the trigger is (re)started, each further cycle waits one
///  `initial_delay` longer than the previous one. Acknowledgment progress resets the trigger;
///  after `max_cycles` repetitions without progress the trigger fails.
pub struct RepeatTrigger {
    running: bool,
    cycle: u32,
    due: Instant,

    config_initial_delay: Duration,
    config_max_cycles: u32,
}

impl RepeatTrigger {
    pub fn new(config: &RtmfpConfig) -> RepeatTrigger {
        RepeatTrigger {
            running: false,
            cycle: 0,
            due: Instant::now(),
            config_initial_delay: config.repeat_initial_delay,
            config_max_cycles: config.max_repeat_cycles,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn start(&mut self, now: Instant) {
        if self.running {
            return;
        }
        self.reset(now);
        self.running = true;
    }

    pub fn reset(&mut self, now: Instant) {
        self.cycle = 0;
        self.due = now + self.config_initial_delay;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Returns `true` if a repetition is due now
    pub fn raise(&mut self, now: Instant) -> anyhow::Result<bool> {
        if !self.running || now < self.due {
            return Ok(false);
        }

        if self.cycle >= self.config_max_cycles {
            self.running = false;
            return Err(RtmfpError::protocol("repeat trigger failed"));
        }

        self.cycle += 1;
        self.due = now + self.config_initial_delay * (self.cycle + 1);
        debug!("repeat trigger cycle {}", self.cycle);
        Ok(true)
    }
}
