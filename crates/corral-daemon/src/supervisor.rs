//! The fleet supervisor.
//!
//! Owns the ordered collection of instances and drives the periodic
//! watchdog pass. UI-facing operations (create, pause, resume, restart,
//! attach, toggles) live here too; they serialize with the tick because
//! both run on the supervisor's thread, while the per-instance
//! reader-writer lock covers the few fields background work touches.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use tracing::{error, info, warn};

use corral_session::{Instance, InstanceContext, InstanceOptions, Status};
use corral_types::error::MAX_TITLE_LEN;
use corral_types::{Config, CorralError};

use crate::store::Store;

/// Fleet-wide cap on concurrently managed instances.
pub const MAX_INSTANCES: usize = 10;

/// Inactivity threshold while continuous mode is active. Much shorter than
/// the normal stall timeout: a continuous session is expected to keep
/// producing output.
const CONTINUOUS_STALL_TIMEOUT_SECS: u64 = 60;

/// Supervises the fleet of agent instances.
pub struct Supervisor {
    config: Config,
    ctx: InstanceContext,
    store: Store,
    instances: Vec<Instance>,
    /// User-visible messages queued for the UI layer to drain.
    notices: VecDeque<String>,
}

impl Supervisor {
    /// Build a supervisor, rehydrating the persisted fleet. An instance
    /// whose pane cannot be restored is dropped from the fleet with a
    /// warning after its start-failure cleanup runs.
    pub fn new(config: Config, ctx: InstanceContext, store: Store) -> Self {
        let mut instances = Vec::new();
        for snap in store.load() {
            let title = snap.title.clone();
            match Instance::from_snapshot(snap, ctx.clone()) {
                Ok(instance) => instances.push(instance),
                Err(e) => {
                    warn!(instance = %title, error = %e, "failed to restore instance from snapshot");
                }
            }
        }

        Self {
            config,
            ctx,
            store,
            instances,
            notices: VecDeque::new(),
        }
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn get(&self, title: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.title() == title)
    }

    fn get_mut(&mut self, title: &str) -> Result<&mut Instance, CorralError> {
        self.instances
            .iter_mut()
            .find(|i| i.title() == title)
            .ok_or_else(|| CorralError::UnknownInstance {
                title: title.to_string(),
            })
    }

    /// Drain queued user-visible notices.
    pub fn drain_notices(&mut self) -> Vec<String> {
        self.notices.drain(..).collect()
    }

    /// Create and start a new instance. `program` falls back to the
    /// configured default.
    pub fn create_instance(
        &mut self,
        title: &str,
        path: &Path,
        program: Option<&str>,
    ) -> Result<(), CorralError> {
        if self.instances.len() >= MAX_INSTANCES {
            return Err(CorralError::InstanceCapReached { cap: MAX_INSTANCES });
        }
        validate_title(title)?;
        if self.instances.iter().any(|i| i.title() == title) {
            return Err(CorralError::TitleTaken {
                title: title.to_string(),
            });
        }

        let mut instance = Instance::new(
            InstanceOptions {
                title: title.to_string(),
                path: path.to_path_buf(),
                program: program.unwrap_or(&self.config.default_program).to_string(),
                auto_yes: self.config.auto_yes,
            },
            self.ctx.clone(),
        )?;
        if self.config.watchdog_enabled {
            instance.initialize_watchdog(true);
        }
        instance.start(true)?;

        info!(instance = title, branch = instance.branch(), "instance created");
        self.instances.push(instance);
        self.persist()
    }

    /// Kill an instance and forget it. Refused while its branch is checked
    /// out outside its own worktree.
    pub fn remove_instance(&mut self, title: &str) -> Result<(), CorralError> {
        let index = self
            .instances
            .iter()
            .position(|i| i.title() == title)
            .ok_or_else(|| CorralError::UnknownInstance {
                title: title.to_string(),
            })?;

        if let Some(worktree) = self.instances[index].worktree() {
            if worktree.is_branch_checked_out()? {
                return Err(CorralError::WorktreeConflict {
                    branch: worktree.branch().to_string(),
                });
            }
        }

        let kill_result = self.instances[index].kill();
        self.instances.remove(index);
        self.persist()?;
        info!(instance = title, "instance removed");
        kill_result
    }

    pub fn pause_instance(&mut self, title: &str) -> Result<(), CorralError> {
        self.get_mut(title)?.pause()?;
        self.persist()
    }

    pub fn resume_instance(&mut self, title: &str) -> Result<(), CorralError> {
        self.get_mut(title)?.resume()?;
        self.persist()
    }

    pub fn restart_instance(&mut self, title: &str) -> Result<(), CorralError> {
        self.get_mut(title)?.restart()?;
        self.persist()
    }

    /// Attach the calling terminal to an instance's pane. Blocks nothing
    /// here: the returned channel fires when the operator detaches.
    pub fn attach_instance(&mut self, title: &str) -> Result<mpsc::Receiver<()>, CorralError> {
        self.get_mut(title)?.attach()
    }

    pub fn send_prompt(&mut self, title: &str, prompt: &str) -> Result<(), CorralError> {
        self.get_mut(title)?.send_prompt(prompt)
    }

    pub fn set_auto_yes(&mut self, title: &str, auto_yes: bool) -> Result<(), CorralError> {
        self.get_mut(title)?.set_auto_yes(auto_yes);
        self.persist()
    }

    /// Toggle the watchdog for an instance; returns the new state.
    pub fn toggle_watchdog(&mut self, title: &str) -> Result<bool, CorralError> {
        let enabled = self.get_mut(title)?.toggle_watchdog();
        self.persist()?;
        Ok(enabled)
    }

    /// Toggle continuous mode; an optional duration (max 24 h) applies when
    /// enabling. Returns the new state.
    pub fn toggle_continuous(
        &mut self,
        title: &str,
        duration: Option<Duration>,
    ) -> Result<bool, CorralError> {
        let instance = self.get_mut(title)?;
        let enabled = if instance.is_continuous_mode() {
            instance.disable_continuous_mode();
            false
        } else {
            if let Some(duration) = duration {
                instance.set_continuous_duration(duration)?;
            }
            instance.toggle_continuous_mode()
        };
        self.persist()?;
        Ok(enabled)
    }

    /// One watchdog pass over the fleet.
    ///
    /// Per started, non-paused instance: sample the pane and update status
    /// (auto-yes taps Enter on a standing prompt), refresh diff stats,
    /// run crash and stall detection, and expire continuous mode.
    pub fn tick(&mut self) {
        let stall_timeout = self.config.stall_timeout_seconds;
        let max_attempts = self.config.max_continue_attempts;
        let candidates = self.config.continue_commands.clone();

        for instance in &mut self.instances {
            if !instance.started() || instance.paused() {
                continue;
            }

            let (changed, prompt) = instance.has_updated();
            if changed {
                instance.set_status(Status::Running);
            } else if prompt && instance.auto_yes() {
                instance.tap_enter();
            } else {
                instance.set_status(Status::Ready);
            }

            if let Err(e) = instance.update_diff_stats() {
                warn!(instance = %instance.title(), error = %e, "could not update diff stats");
            }

            if instance.watchdog_enabled() {
                instance.detect_crash_and_restart();

                if instance.detect_stall(stall_timeout, CONTINUOUS_STALL_TIMEOUT_SECS) {
                    if instance.continue_attempts() < max_attempts {
                        if let Err(e) = instance.inject_continue(&candidates) {
                            warn!(instance = %instance.title(), error = %e, "failed to inject continue, will retry next tick");
                        }
                    } else {
                        warn!(
                            instance = %instance.title(),
                            attempts = instance.continue_attempts(),
                            "stalled but continue attempts exhausted"
                        );
                    }
                }
            }

            if instance.continuous_expired() {
                instance.disable_continuous_mode();
                self.notices.push_back(format!(
                    "continuous mode expired for '{}'",
                    instance.title()
                ));
            }
        }
    }

    /// Drive ticks at the configured poll interval until `shutdown` is set.
    pub fn run_loop(&mut self, shutdown: &AtomicBool) {
        let interval = Duration::from_millis(self.config.daemon_poll_interval.max(100));
        info!(
            interval_ms = interval.as_millis() as u64,
            instances = self.instances.len(),
            "supervisor loop started"
        );

        while !shutdown.load(Ordering::Relaxed) {
            self.tick();
            for notice in self.drain_notices() {
                info!(notice = %notice, "supervisor notice");
            }
            std::thread::sleep(interval);
        }

        if let Err(e) = self.persist() {
            error!(error = %e, "failed to persist fleet on shutdown");
        }
    }

    /// Write the current fleet to the snapshot store.
    pub fn persist(&self) -> Result<(), CorralError> {
        let snapshots: Vec<_> = self.instances.iter().map(|i| i.to_snapshot()).collect();
        self.store.save(&snapshots)
    }
}

/// Titles name tmux sessions and branch suffixes, so they are restricted to
/// characters safe in both.
fn validate_title(title: &str) -> Result<(), CorralError> {
    if title.is_empty() {
        return Err(CorralError::TitleEmpty);
    }
    if title.len() > MAX_TITLE_LEN {
        return Err(CorralError::TitleTooLong { len: title.len() });
    }
    if !title
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(CorralError::TitleInvalid {
            title: title.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_mux::fake::{FakeMux, SentKeys};
    use corral_mux::TerminalMux;
    use std::fs;
    use std::path::PathBuf;
    use std::process::Command;
    use std::sync::Arc;

    fn run_git(cwd: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .expect("spawn git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        repo: PathBuf,
        mux: Arc<FakeMux>,
        config: Config,
        ctx: InstanceContext,
        store_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        run_git(&repo, &["init"]);
        run_git(&repo, &["config", "user.name", "Test User"]);
        run_git(&repo, &["config", "user.email", "test@example.com"]);
        fs::write(repo.join("README.md"), "init\n").unwrap();
        run_git(&repo, &["add", "README.md"]);
        run_git(&repo, &["commit", "-m", "init"]);

        let mux = Arc::new(FakeMux::new());
        let mut config = Config::default();
        config.branch_prefix = "tester/".to_string();
        let ctx = InstanceContext {
            mux: mux.clone(),
            branch_prefix: config.branch_prefix.clone(),
            worktrees_root: tmp.path().join("worktrees"),
            agent_home: tmp.path().join("home"),
        };
        let store_dir = tmp.path().join("config");
        Fixture {
            _tmp: tmp,
            repo,
            mux,
            config,
            ctx,
            store_dir,
        }
    }

    fn supervisor(fx: &Fixture) -> Supervisor {
        Supervisor::new(
            fx.config.clone(),
            fx.ctx.clone(),
            Store::new(&fx.store_dir),
        )
    }

    #[test]
    fn create_validates_titles() {
        let fx = fixture();
        let mut sup = supervisor(&fx);

        let err = sup.create_instance("", &fx.repo, None).unwrap_err();
        assert!(matches!(err, CorralError::TitleEmpty));

        let long = "x".repeat(MAX_TITLE_LEN + 1);
        let err = sup.create_instance(&long, &fx.repo, None).unwrap_err();
        assert!(matches!(err, CorralError::TitleTooLong { .. }));

        let err = sup.create_instance("has space", &fx.repo, None).unwrap_err();
        assert!(matches!(err, CorralError::TitleInvalid { .. }));

        sup.create_instance("ok-title_1", &fx.repo, None).unwrap();
        let err = sup
            .create_instance("ok-title_1", &fx.repo, None)
            .unwrap_err();
        assert!(matches!(err, CorralError::TitleTaken { .. }));
    }

    #[test]
    fn fleet_cap_is_enforced() {
        let fx = fixture();
        let mut sup = supervisor(&fx);
        for i in 0..MAX_INSTANCES {
            sup.create_instance(&format!("agent-{i}"), &fx.repo, None)
                .unwrap();
        }
        let err = sup.create_instance("overflow", &fx.repo, None).unwrap_err();
        assert!(matches!(err, CorralError::InstanceCapReached { .. }));
    }

    #[test]
    fn tick_updates_status_from_pane_activity() {
        let fx = fixture();
        let mut sup = supervisor(&fx);
        sup.create_instance("feat", &fx.repo, None).unwrap();

        fx.mux.set_content("corral_feat", "thinking...");
        sup.tick();
        assert_eq!(sup.get("feat").unwrap().status(), Status::Running);

        // Nothing changed on the next tick.
        sup.tick();
        assert_eq!(sup.get("feat").unwrap().status(), Status::Ready);
    }

    #[test]
    fn tick_taps_enter_on_prompt_when_auto_yes() {
        let fx = fixture();
        let mut sup = supervisor(&fx);
        sup.create_instance("feat", &fx.repo, None).unwrap();
        sup.set_auto_yes("feat", true).unwrap();
        // Keep the watchdog out of the way so the only Enter comes from
        // the auto-yes path.
        sup.toggle_watchdog("feat").unwrap();

        fx.mux.set_content("corral_feat", "Overwrite file? [y/n]");
        sup.tick(); // records the change
        fx.mux.clear_sent("corral_feat");
        sup.tick(); // unchanged + prompt + auto-yes

        assert_eq!(fx.mux.sent_keys("corral_feat"), vec![SentKeys::Enter]);
    }

    #[test]
    fn injection_is_bounded_by_max_continue_attempts() {
        let fx = fixture();
        let mut sup = supervisor(&fx);
        sup.create_instance("feat", &fx.repo, None).unwrap();

        fx.mux.set_content(
            "corral_feat",
            "Do you want to proceed?\n1. Yes\n2. No\n> ",
        );
        fx.mux.clear_sent("corral_feat");

        // Static prompt pane: injections happen per tick but stop at the cap.
        for _ in 0..6 {
            sup.tick();
        }

        let injected = fx
            .mux
            .sent_text("corral_feat")
            .iter()
            .filter(|t| t.as_str() == "1")
            .count();
        assert_eq!(injected as u32, fx.config.max_continue_attempts);
        assert_eq!(sup.get("feat").unwrap().stall_count(), 3);
    }

    #[test]
    fn continuous_mode_expiry_disables_and_queues_notice() {
        let fx = fixture();
        let mut sup = supervisor(&fx);
        sup.create_instance("feat", &fx.repo, None).unwrap();

        let enabled = sup
            .toggle_continuous("feat", Some(Duration::from_secs(1)))
            .unwrap();
        assert!(enabled);

        std::thread::sleep(Duration::from_millis(1200));
        sup.tick();

        assert!(!sup.get("feat").unwrap().is_continuous_mode());
        let notices = sup.drain_notices();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].contains("continuous mode expired for 'feat'"));

        // Expiry is reported once.
        sup.tick();
        assert!(sup.drain_notices().is_empty());
    }

    #[test]
    fn toggle_continuous_rejects_day_plus_durations() {
        let fx = fixture();
        let mut sup = supervisor(&fx);
        sup.create_instance("feat", &fx.repo, None).unwrap();
        let err = sup
            .toggle_continuous("feat", Some(Duration::from_secs(25 * 3600)))
            .unwrap_err();
        assert!(matches!(err, CorralError::DurationTooLong));
        assert!(!sup.get("feat").unwrap().is_continuous_mode());
    }

    #[test]
    fn fleet_survives_supervisor_restart() {
        let fx = fixture();
        {
            let mut sup = supervisor(&fx);
            sup.create_instance("feat", &fx.repo, None).unwrap();
            sup.pause_instance("feat").unwrap();
            sup.create_instance("live", &fx.repo, None).unwrap();
        }

        // A new supervisor over the same store and mux: the paused instance
        // stays cold, the live one rebinds to its existing pane.
        let sup = supervisor(&fx);
        assert_eq!(sup.instances().len(), 2);
        let feat = sup.get("feat").unwrap();
        assert_eq!(feat.status(), Status::Paused);
        assert!(feat.started());
        let live = sup.get("live").unwrap();
        assert_eq!(live.status(), Status::Running);
        assert!(fx.mux.has_session("corral_live"));
        assert!(!fx.mux.has_session("corral_feat"));
    }

    #[test]
    fn remove_refuses_checked_out_branch_then_succeeds() {
        let fx = fixture();
        let mut sup = supervisor(&fx);
        sup.create_instance("feat", &fx.repo, None).unwrap();
        sup.pause_instance("feat").unwrap();

        run_git(&fx.repo, &["checkout", "tester/feat"]);
        let err = sup.remove_instance("feat").unwrap_err();
        assert!(matches!(err, CorralError::WorktreeConflict { .. }));
        assert!(sup.get("feat").is_some());

        run_git(&fx.repo, &["checkout", "-"]);
        sup.remove_instance("feat").unwrap();
        assert!(sup.get("feat").is_none());
        assert!(supervisor(&fx).instances().is_empty(), "removal persisted");
    }

    #[test]
    fn unknown_titles_are_reported() {
        let fx = fixture();
        let mut sup = supervisor(&fx);
        let err = sup.pause_instance("ghost").unwrap_err();
        assert!(matches!(err, CorralError::UnknownInstance { .. }));
        let err = sup.remove_instance("ghost").unwrap_err();
        assert!(matches!(err, CorralError::UnknownInstance { .. }));
    }

    #[test]
    fn send_prompt_reaches_the_pane() {
        let fx = fixture();
        let mut sup = supervisor(&fx);
        sup.create_instance("feat", &fx.repo, None).unwrap();
        fx.mux.clear_sent("corral_feat");

        sup.send_prompt("feat", "fix the flaky test").unwrap();
        let sent = fx.mux.sent_keys("corral_feat");
        assert_eq!(
            sent,
            vec![
                SentKeys::Text("fix the flaky test".into()),
                SentKeys::Enter
            ]
        );
    }

    #[test]
    fn attach_signals_detach() {
        let fx = fixture();
        let mut sup = supervisor(&fx);
        sup.create_instance("feat", &fx.repo, None).unwrap();
        let rx = sup.attach_instance("feat").unwrap();
        rx.recv().unwrap();
    }
}
