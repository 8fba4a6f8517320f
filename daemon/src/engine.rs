/// The ducking engine: hysteresis state machine + volume-fade stepping.
///
/// Every tick reads one snapshot of all audio sessions, decides the target
/// volume for the controlled application, and commits at most one fade step
/// toward it. Two saturating counters suppress flapping when the peak level
/// oscillates around the trigger threshold: ducking needs
/// `consecutive_minimums_to_trigger` loud samples in a row, restoring needs
/// `consecutive_minimums_to_end` quiet ones. The asymmetry lets the duck
/// engage immediately while momentary silence does not end it.
///
/// The run loop is strictly sequential: one decision cycle, one sleep, at a
/// cadence chosen per cycle (fast while fading, slow while idle). The only
/// state shared with other tasks is the set-only bypass flag and the stop
/// channel, both observed at the top of a cycle.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;

use crate::command::CommandRunner;
use crate::config::Config;
use crate::sessions::SessionProvider;
use crate::status::{write_status, DaemonState, DaemonStatus};

/// A transition is in progress whenever the current volume differs from the
/// target by more than this.
pub const VOLUME_EPSILON: f32 = 1e-3;

/// A duck/unduck boundary crossed by this tick's volume write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuckEdge {
    /// The controlled volume just reached `volume_min`.
    Duck,
    /// The controlled volume just left `volume_min`.
    Unduck,
}

/// What one decision cycle did and how long to sleep before the next one.
#[derive(Debug)]
pub struct TickOutcome {
    pub sleep: Duration,
    pub state: DaemonState,
    pub status_text: String,
    /// Edges crossed this tick; their commands (if configured) already ran.
    pub edges: Vec<DuckEdge>,
}

pub struct DuckingEngine<P, R> {
    provider: P,
    runner: R,
    config: Config,
    /// Consecutive loud samples seen while a duck is pending, saturating at
    /// `consecutive_minimums_to_trigger`.
    trigger_count: u32,
    /// Consecutive quiet samples seen while a restore is pending, saturating
    /// at `consecutive_minimums_to_end`.
    end_count: u32,
    /// Set-only toggle shared with the hotkey handler; forces the target to
    /// `volume_restore`.
    bypassed: Arc<AtomicBool>,
}

impl<P: SessionProvider, R: CommandRunner> DuckingEngine<P, R> {
    pub fn new(provider: P, runner: R, config: Config, bypassed: Arc<AtomicBool>) -> Self {
        Self {
            provider,
            runner,
            config,
            trigger_count: 0,
            end_count: 0,
            bypassed,
        }
    }

    fn tick_idle(&self) -> Duration {
        Duration::from_secs_f32(self.config.performance.tick_idle_ms / 1000.0)
    }

    fn tick_transition(&self) -> Duration {
        Duration::from_secs_f32(self.config.performance.tick_transition_ms / 1000.0)
    }

    /// Runs the configured command for `edge`, if any. Blocks the tick until
    /// the command exits; a spawn failure is fatal to the run loop.
    fn run_edge_command(&mut self, edge: DuckEdge) -> Result<()> {
        let command = match edge {
            DuckEdge::Duck => self.config.general.command_on_duck.clone(),
            DuckEdge::Unduck => self.config.general.command_on_unduck.clone(),
        };
        if !command.is_empty() {
            self.runner.run_silent(&command)?;
        }
        Ok(())
    }

    /// One full decision cycle.
    pub fn tick(&mut self) -> Result<TickOutcome> {
        let sessions = self.provider.snapshot()?;

        let max_peak = sessions
            .iter()
            .filter(|s| !self.config.is_excluded(&s.executable))
            .map(|s| s.peak)
            .fold(0.0_f32, f32::max);

        let bypassed = self.bypassed.load(Ordering::Relaxed);
        let volume_min = self.config.general.volume_min;
        let volume_max = self.config.general.volume_max;
        let volume_restore = self.config.general.volume_restore;
        let trigger_threshold = self.config.general.consecutive_minimums_to_trigger;
        let end_threshold = self.config.general.consecutive_minimums_to_end;

        let volume_target = if bypassed {
            volume_restore
        } else if max_peak > self.config.general.volume_minimum_to_trigger {
            volume_min
        } else {
            volume_max
        };

        let controlled = sessions
            .iter()
            .find(|s| self.config.is_controlled(&s.executable))
            .cloned();

        // Absence is non-fatal and leaves the counters untouched: a transient
        // disappearance must not forget accumulated hysteresis. A long absence
        // can therefore produce an instant full-threshold transition on
        // reappearance; accepted.
        let Some(controlled) = controlled else {
            return Ok(TickOutcome {
                sleep: self.tick_idle(),
                state: DaemonState::TargetNotFound,
                status_text: "Controlled executable not found".to_string(),
                edges: Vec::new(),
            });
        };

        let status_text = format!("Found and controlling {}", controlled.executable);
        let volume_current = controlled.volume;
        let should_transition = (volume_current - volume_target).abs() > VOLUME_EPSILON;

        let mut edges = Vec::new();
        let mut sleep = self.tick_idle();
        let mut committed_step = false;

        if should_transition && bypassed {
            // Bypass snaps to the restore volume in a single write, no fade.
            self.provider
                .set_volume(&controlled.executable, volume_restore)?;
            // Leaving a full duck still counts as an unduck edge. Exact
            // equality is deliberate: a committed fade step clamps onto
            // volume_min exactly.
            if volume_current == volume_min {
                self.run_edge_command(DuckEdge::Unduck)?;
                edges.push(DuckEdge::Unduck);
            }
        }

        if should_transition && !bypassed {
            // Count this sample toward whichever transition it supports; the
            // opposite counter is left alone. Only a committed step (below)
            // or reaching the target (else branch) rewrites both.
            if volume_target == volume_min {
                self.trigger_count = (self.trigger_count + 1).min(trigger_threshold);
            } else {
                self.end_count = (self.end_count + 1).min(end_threshold);
            }

            if self.trigger_count == trigger_threshold || self.end_count == end_threshold {
                let direction = if volume_current > volume_target { -1.0 } else { 1.0 };
                let step = (volume_max - volume_min)
                    * (self.config.performance.tick_transition_ms
                        / self.config.general.fade_speed_ms)
                    * direction;
                let new_volume = (volume_current + step).clamp(volume_min, volume_max);

                self.provider
                    .set_volume(&controlled.executable, new_volume)?;
                sleep = self.tick_transition();
                committed_step = true;

                // Re-prime both counters so a multi-tick fade keeps stepping
                // every cycle instead of re-accumulating hysteresis.
                self.trigger_count = trigger_threshold;
                self.end_count = end_threshold;

                if new_volume == volume_min && direction < 0.0 {
                    self.run_edge_command(DuckEdge::Duck)?;
                    edges.push(DuckEdge::Duck);
                }
                if volume_current == volume_min && direction > 0.0 {
                    self.run_edge_command(DuckEdge::Unduck)?;
                    edges.push(DuckEdge::Unduck);
                }
            }
        } else {
            // At the target, or bypassed: hysteresis clears. Note this also
            // runs on every bypassed tick, transition or not.
            self.trigger_count = 0;
            self.end_count = 0;
        }

        let state = if bypassed {
            DaemonState::Bypassed
        } else if committed_step {
            DaemonState::Fading
        } else if !should_transition && volume_target == volume_min {
            DaemonState::Ducked
        } else {
            DaemonState::Idle
        };

        Ok(TickOutcome { sleep, state, status_text, edges })
    }

    /// One best-effort attempt to put the controlled session back at
    /// `volume_restore`, used on the way out of the run loop.
    fn restore_controlled_volume(&mut self) -> Result<()> {
        let sessions = self.provider.snapshot()?;
        let controlled = sessions
            .iter()
            .find(|s| self.config.is_controlled(&s.executable))
            .cloned();
        if let Some(controlled) = controlled {
            let restore = self.config.general.volume_restore;
            self.provider.set_volume(&controlled.executable, restore)?;
            println!("[engine] Restored {} to {restore:.2}", controlled.executable);
        }
        Ok(())
    }

    /// Drives the engine until the stop flag is set or a tick fails.
    ///
    /// Writes `status_path` whenever the observable state changes and picks
    /// up config updates from `config_rx` between cycles. On exit — quit or
    /// error — makes one best-effort volume restore; a restore failure is
    /// logged and does not change the outcome.
    pub async fn run(
        mut self,
        mut config_rx: watch::Receiver<Config>,
        stop_rx: watch::Receiver<bool>,
        status_path: PathBuf,
    ) -> Result<()> {
        let result = self.run_loop(&mut config_rx, &stop_rx, &status_path).await;
        if let Err(e) = self.restore_controlled_volume() {
            eprintln!("[engine] Failed to restore volume on exit: {e:#}");
        }
        result
    }

    async fn run_loop(
        &mut self,
        config_rx: &mut watch::Receiver<Config>,
        stop_rx: &watch::Receiver<bool>,
        status_path: &Path,
    ) -> Result<()> {
        let mut status = DaemonStatus::new();
        loop {
            if *stop_rx.borrow() {
                println!("[engine] Quit requested");
                return Ok(());
            }
            if config_rx.has_changed().unwrap_or(false) {
                self.config = config_rx.borrow_and_update().clone();
                println!("[engine] Config applied");
            }

            let outcome = self.tick()?;

            for edge in &outcome.edges {
                match edge {
                    DuckEdge::Duck => println!("[engine] Ducked"),
                    DuckEdge::Unduck => println!("[engine] Unducked"),
                }
            }

            if outcome.state != status.state || outcome.status_text != status.status_text {
                if outcome.state != status.state {
                    status.last_transition_timestamp = Some(chrono::Local::now().to_rfc3339());
                }
                status.state = outcome.state;
                status.status_text = outcome.status_text;
                write_status(status_path, &status);
            }

            tokio::time::sleep(outcome.sleep).await;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
