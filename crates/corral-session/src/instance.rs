//! One supervised agent instance: state machine, watchdog, continuous mode
//! and crash-resume.

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use corral_git::{DiffStats, Worktree, WorktreeRecord};
use corral_mux::{PaneSession, TerminalMux};
use corral_types::CorralError;

use crate::locator;
use crate::norm;
use crate::patterns;

/// Minimum gap between manual restarts.
const RESTART_COOLDOWN: Duration = Duration::from_secs(10);
/// Window for counting automatic crash-restart attempts.
const AUTO_RESTART_COOLDOWN: Duration = Duration::from_secs(5 * 60);
/// Automatic restarts allowed inside the window before giving up.
const MAX_AUTO_RESTART_ATTEMPTS: u32 = 3;
/// How long a completion/prompt state must hold before continuous mode
/// treats it as a stall.
const CONTINUOUS_STABILITY: Duration = Duration::from_secs(2);
/// Ceiling for a continuous-mode run.
const MAX_CONTINUOUS_DURATION: Duration = Duration::from_secs(24 * 3600);
/// Readiness probe attempts after a restart (1, 2, 4, 8, 16 second waits).
const READINESS_PROBE_RETRIES: u32 = 5;

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Started and waiting for user input (or not yet started).
    Ready,
    /// The agent is actively producing output.
    Running,
    /// Briefly transitioning between states.
    Loading,
    /// Working tree removed, branch preserved, no pane.
    Paused,
}

/// Options for creating a new instance.
#[derive(Debug, Clone)]
pub struct InstanceOptions {
    /// Unique title; also names the tmux session and the branch suffix.
    pub title: String,
    /// Root of the source repository the agent works on.
    pub path: PathBuf,
    /// Program to run, e.g. `"claude"` or `"aider --model ..."`.
    pub program: String,
    /// Auto-press Enter on detected prompts.
    pub auto_yes: bool,
}

/// Collaborators and path roots injected at construction so instances never
/// reach for process-global state directly.
#[derive(Clone)]
pub struct InstanceContext {
    pub mux: Arc<dyn TerminalMux>,
    /// Branch name prefix, e.g. `alice/`.
    pub branch_prefix: String,
    /// Directory that holds per-instance worktree checkouts.
    pub worktrees_root: PathBuf,
    /// Home directory the agent keeps its session history under.
    pub agent_home: PathBuf,
}

impl std::fmt::Debug for InstanceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceContext")
            .field("branch_prefix", &self.branch_prefix)
            .field("worktrees_root", &self.worktrees_root)
            .field("agent_home", &self.agent_home)
            .finish_non_exhaustive()
    }
}

/// Continuous-mode and restart-governance fields.
///
/// Shared behind a reader-writer lock so a UI thread can read the remaining
/// time while the tick thread mutates state. `restart()` drops the write
/// lock across its readiness probe.
#[derive(Debug, Clone, Default)]
struct SharedState {
    continuous_mode: bool,
    continuous_started: Option<DateTime<Utc>>,
    /// Zero means indefinite.
    continuous_duration: Duration,
    restart_attempts: u32,
    last_restart: Option<DateTime<Utc>>,
}

type SavedContinuous = (bool, Option<DateTime<Utc>>, Duration);

/// Wall-clock time since `t`, clamped to zero on clock skew.
fn elapsed_since(t: DateTime<Utc>) -> Duration {
    Utc::now()
        .signed_duration_since(t)
        .to_std()
        .unwrap_or_default()
}

/// A supervised agent instance and its isolation resources.
#[derive(Debug)]
pub struct Instance {
    title: String,
    path: PathBuf,
    branch: String,
    program: String,
    auto_yes: bool,
    status: Status,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started: bool,

    watchdog_enabled: bool,
    last_activity: DateTime<Utc>,
    stall_count: u32,
    /// Injections since the last content change; enforces the configured cap.
    continue_attempts: u32,
    last_content_hash: String,

    shared: Arc<RwLock<SharedState>>,
    diff_stats: Option<DiffStats>,

    pane: Option<PaneSession>,
    worktree: Option<Worktree>,
    ctx: InstanceContext,
}

impl Instance {
    pub fn new(opts: InstanceOptions, ctx: InstanceContext) -> Result<Self, CorralError> {
        let path = if opts.path.is_absolute() {
            opts.path
        } else {
            std::env::current_dir()
                .map_err(|e| CorralError::Config(format!("failed to resolve working directory: {e}")))?
                .join(&opts.path)
        };

        let now = Utc::now();
        Ok(Self {
            title: opts.title,
            path,
            branch: String::new(),
            program: opts.program,
            auto_yes: opts.auto_yes,
            status: Status::Ready,
            created_at: now,
            updated_at: now,
            started: false,
            watchdog_enabled: false,
            last_activity: now,
            stall_count: 0,
            continue_attempts: 0,
            last_content_hash: String::new(),
            shared: Arc::new(RwLock::new(SharedState::default())),
            diff_stats: None,
            pane: None,
            worktree: None,
            ctx,
        })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn paused(&self) -> bool {
        self.status == Status::Paused
    }

    pub fn auto_yes(&self) -> bool {
        self.auto_yes
    }

    pub fn set_auto_yes(&mut self, auto_yes: bool) {
        self.auto_yes = auto_yes;
    }

    pub fn watchdog_enabled(&self) -> bool {
        self.watchdog_enabled
    }

    pub fn stall_count(&self) -> u32 {
        self.stall_count
    }

    pub fn continue_attempts(&self) -> u32 {
        self.continue_attempts
    }

    pub fn diff_stats(&self) -> Option<&DiffStats> {
        self.diff_stats.as_ref()
    }

    pub fn restart_attempts(&self) -> u32 {
        self.read_shared().restart_attempts
    }

    pub fn worktree(&self) -> Option<&Worktree> {
        self.worktree.as_ref()
    }

    /// Whether the tmux pane is alive. Sanity check before attaching.
    pub fn pane_alive(&self) -> bool {
        self.pane.as_ref().map(|p| p.exists()).unwrap_or(false)
    }

    fn read_shared(&self) -> RwLockReadGuard<'_, SharedState> {
        match self.shared.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_shared(&self) -> RwLockWriteGuard<'_, SharedState> {
        match self.shared.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Start the instance. `first_time` creates the worktree and a fresh
    /// pane; otherwise an existing pane is restored (supervisor restart).
    ///
    /// On any sub-step failure both handles are cleaned up best-effort and
    /// the original error is returned, wrapping any cleanup error.
    pub fn start(&mut self, first_time: bool) -> Result<(), CorralError> {
        if self.title.is_empty() {
            return Err(CorralError::TitleEmpty);
        }

        self.status = Status::Loading;
        let mut pane = PaneSession::new(&self.title, &self.program, self.ctx.mux.clone());

        let setup_result = if first_time {
            match Worktree::new(
                &self.path,
                &self.title,
                &self.ctx.branch_prefix,
                &self.ctx.worktrees_root,
            ) {
                Ok(worktree) => {
                    self.branch = worktree.branch().to_string();
                    self.worktree = Some(worktree);
                    self.setup_worktree_and_pane(&mut pane)
                }
                Err(e) => {
                    self.status = Status::Ready;
                    return Err(e);
                }
            }
        } else {
            pane.restore()
        };

        match setup_result {
            Ok(()) => {
                self.pane = Some(pane);
                self.started = true;
                if self.watchdog_enabled {
                    self.initialize_watchdog(true);
                }
                self.status = Status::Running;
                self.updated_at = Utc::now();
                Ok(())
            }
            Err(err) => {
                self.pane = Some(pane);
                let cleanup = self.cleanup_resources();
                self.status = Status::Ready;
                match cleanup {
                    Ok(()) => Err(err),
                    Err(cleanup_err) => Err(err.with_cleanup(cleanup_err)),
                }
            }
        }
    }

    fn setup_worktree_and_pane(&mut self, pane: &mut PaneSession) -> Result<(), CorralError> {
        let worktree = match self.worktree.as_mut() {
            Some(worktree) => worktree,
            None => return Err(CorralError::InstanceNotStarted),
        };
        worktree.setup()?;
        let workdir = worktree.worktree_path().to_path_buf();
        pane.start(&workdir)
    }

    /// Terminate the instance and clean up all resources. Idempotent for a
    /// never-started instance.
    pub fn kill(&mut self) -> Result<(), CorralError> {
        if !self.started {
            return Ok(());
        }
        self.cleanup_resources()
    }

    /// Close the pane and destroy the worktree, always attempting both.
    fn cleanup_resources(&mut self) -> Result<(), CorralError> {
        let mut errs = Vec::new();

        // Pane first; it is running inside the worktree.
        if let Some(pane) = self.pane.as_mut() {
            if let Err(e) = pane.close() {
                errs.push(e);
            }
        }
        self.pane = None;

        if let Some(worktree) = self.worktree.as_ref() {
            if let Err(e) = worktree.cleanup() {
                errs.push(e);
            }
        }

        CorralError::combine(errs)
    }

    /// Commit outstanding work, close the pane and remove the working tree,
    /// preserving the branch.
    pub fn pause(&mut self) -> Result<(), CorralError> {
        if !self.started {
            return Err(CorralError::InstanceNotStarted);
        }
        if self.status == Status::Paused {
            return Err(CorralError::InstanceAlreadyPaused);
        }
        let Some(worktree) = self.worktree.as_ref() else {
            return Err(CorralError::InstanceNotStarted);
        };

        let mut errs = Vec::new();

        match worktree.is_dirty() {
            Err(e) => {
                warn!(instance = %self.title, error = %e, "failed to check if worktree is dirty");
                errs.push(e);
            }
            Ok(true) => {
                let message = format!(
                    "[corral] update from '{}' on {} (paused)",
                    self.title,
                    Utc::now().to_rfc2822()
                );
                if let Err(e) = worktree.push_changes(&message, false) {
                    // Don't remove the tree when the commit failed; the
                    // work would be unrecoverable.
                    errs.push(e);
                    return CorralError::combine(errs);
                }
            }
            Ok(false) => {}
        }

        if let Some(pane) = self.pane.as_mut() {
            if let Err(e) = pane.close() {
                errs.push(e);
                return CorralError::combine(errs);
            }
        }

        if worktree.worktree_path().exists() {
            if let Err(e) = worktree.remove() {
                errs.push(e);
                return CorralError::combine(errs);
            }
            if let Err(e) = worktree.prune() {
                errs.push(e);
                return CorralError::combine(errs);
            }
        }

        CorralError::combine(errs)?;

        self.pane = None;
        self.status = Status::Paused;
        self.updated_at = Utc::now();
        info!(instance = %self.title, branch = %self.branch, "instance paused");
        Ok(())
    }

    /// Recreate the working tree and start a fresh pane.
    pub fn resume(&mut self) -> Result<(), CorralError> {
        if !self.started {
            return Err(CorralError::InstanceNotStarted);
        }
        if self.status != Status::Paused {
            return Err(CorralError::InstanceNotPaused);
        }
        let Some(worktree) = self.worktree.as_mut() else {
            return Err(CorralError::InstanceNotStarted);
        };

        if worktree.is_branch_checked_out()? {
            return Err(CorralError::WorktreeConflict {
                branch: worktree.branch().to_string(),
            });
        }

        worktree.setup()?;

        let mut pane = PaneSession::new(&self.title, &self.program, self.ctx.mux.clone());
        if let Err(err) = pane.start(&worktree.worktree_path().to_path_buf()) {
            return match worktree.cleanup() {
                Ok(()) => Err(err),
                Err(cleanup_err) => Err(err.with_cleanup(cleanup_err)),
            };
        }

        self.pane = Some(pane);
        self.status = Status::Running;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Current pane text for the preview pane; empty while paused.
    pub fn preview(&self) -> Result<String, CorralError> {
        if !self.started || self.status == Status::Paused {
            return Ok(String::new());
        }
        match self.pane.as_ref() {
            Some(pane) => pane.capture_content(),
            None => Ok(String::new()),
        }
    }

    /// Monitor sample: `(changed_since_last_call, looks_like_prompt)`.
    pub fn has_updated(&mut self) -> (bool, bool) {
        if !self.started || self.status == Status::Paused {
            return (false, false);
        }
        match self.pane.as_mut() {
            Some(pane) => pane.has_updated(),
            None => (false, false),
        }
    }

    /// Press Enter if auto-yes is enabled; send failures only warn.
    pub fn tap_enter(&self) {
        if !self.started || !self.auto_yes {
            return;
        }
        if let Some(pane) = self.pane.as_ref() {
            if let Err(e) = pane.tap_enter() {
                warn!(instance = %self.title, error = %e, "error tapping enter");
            }
        }
    }

    /// Attach the calling terminal; the channel fires when the operator
    /// detaches.
    pub fn attach(&self) -> Result<mpsc::Receiver<()>, CorralError> {
        if !self.started {
            return Err(CorralError::InstanceNotStarted);
        }
        match self.pane.as_ref() {
            Some(pane) => pane.attach(),
            None => Err(CorralError::InstanceNotRunning),
        }
    }

    /// Resize the detached pane to match the preview area.
    pub fn set_preview_size(&mut self, width: u16, height: u16) -> Result<(), CorralError> {
        if !self.started || self.status == Status::Paused {
            return Err(CorralError::InstanceNotRunning);
        }
        match self.pane.as_mut() {
            Some(pane) => pane.set_detached_size(width, height),
            None => Err(CorralError::InstanceNotRunning),
        }
    }

    /// Type a prompt into the pane and submit it.
    pub fn send_prompt(&self, text: &str) -> Result<(), CorralError> {
        if !self.started {
            return Err(CorralError::InstanceNotStarted);
        }
        let Some(pane) = self.pane.as_ref() else {
            return Err(CorralError::InstanceNotRunning);
        };
        pane.send_text(text)?;
        // Give the agent's TUI time to ingest the text before Enter, so the
        // submission isn't interpreted as part of the paste.
        std::thread::sleep(Duration::from_millis(100));
        pane.tap_enter()
    }

    /// Refresh the cached diff stats. Paused instances keep their last
    /// stats; a worktree that has no base commit yet reads as empty.
    pub fn update_diff_stats(&mut self) -> Result<(), CorralError> {
        if !self.started {
            self.diff_stats = None;
            return Ok(());
        }
        if self.status == Status::Paused {
            return Ok(());
        }
        let Some(worktree) = self.worktree.as_ref() else {
            return Ok(());
        };

        match worktree.diff() {
            Ok(stats) => {
                self.diff_stats = Some(stats);
                Ok(())
            }
            // Worktree not fully set up yet; not an error.
            Err(CorralError::NotSetup(_)) => {
                self.diff_stats = None;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // --- watchdog -------------------------------------------------------

    /// Reset watchdog bookkeeping for a fresh monitoring run.
    pub fn initialize_watchdog(&mut self, enabled: bool) {
        self.watchdog_enabled = enabled;
        self.last_activity = Utc::now();
        self.stall_count = 0;
        self.continue_attempts = 0;
        self.last_content_hash.clear();
    }

    pub fn toggle_watchdog(&mut self) -> bool {
        if self.watchdog_enabled {
            self.watchdog_enabled = false;
        } else {
            self.initialize_watchdog(true);
        }
        self.watchdog_enabled
    }

    /// Check whether the session looks stalled.
    ///
    /// A prompt pattern only counts once the pane content is also unchanged
    /// since the previous sample; the first sighting of new content records
    /// its hash and refreshes the activity clock instead. Continuous mode
    /// watches completion patterns over the normalized hash with a short
    /// stability window; the plain inactivity timeout applies either way.
    pub fn detect_stall(
        &mut self,
        stall_timeout_secs: u64,
        continuous_timeout_secs: u64,
    ) -> bool {
        if !self.started || self.status == Status::Paused || !self.watchdog_enabled {
            return false;
        }
        let Some(pane) = self.pane.as_ref() else {
            return false;
        };
        let content = match pane.capture_content() {
            Ok(content) => content,
            Err(e) => {
                warn!(instance = %self.title, error = %e, "failed to capture pane content for stall detection");
                return false;
            }
        };

        let has_prompt = patterns::has_prompt_pattern(&content);
        let has_completion = patterns::has_completion_pattern(&content);
        let continuous = self.is_continuous_mode();

        if continuous && (has_completion || has_prompt) {
            let normalized_hash = norm::normalized_digest(&content);
            let idle = elapsed_since(self.last_activity);

            if self.last_content_hash == normalized_hash && idle > CONTINUOUS_STABILITY {
                warn!(
                    instance = %self.title,
                    completion_pattern = has_completion,
                    stall_pattern = has_prompt,
                    idle_secs = idle.as_secs(),
                    "continuous mode stall detected"
                );
                return true;
            }
            if self.last_content_hash != normalized_hash {
                self.last_content_hash = normalized_hash;
                self.last_activity = Utc::now();
                self.continue_attempts = 0;
            }
            return false;
        }

        let current_hash = norm::digest(&content);
        if self.last_content_hash != current_hash {
            self.last_content_hash = current_hash;
            self.last_activity = Utc::now();
            self.continue_attempts = 0;
            return false;
        }

        let timeout_secs = if continuous {
            continuous_timeout_secs
        } else {
            stall_timeout_secs
        };
        let idle = elapsed_since(self.last_activity);
        if has_prompt || idle > Duration::from_secs(timeout_secs) {
            warn!(
                instance = %self.title,
                stall_pattern = has_prompt,
                idle_secs = idle.as_secs(),
                "stall detected"
            );
            return true;
        }
        false
    }

    /// Send continue candidates one at a time until one goes through.
    ///
    /// Candidate choice adapts to the pane content; every successful send
    /// bumps `stall_count` and refreshes activity. A vanished pane reads as
    /// [`CorralError::InstanceNotRunning`].
    pub fn inject_continue(&mut self, candidates: &[String]) -> Result<(), CorralError> {
        if !self.started || self.status == Status::Paused || self.pane.is_none() {
            return Err(CorralError::InstanceNotRunning);
        }

        warn!(
            instance = %self.title,
            attempt = self.stall_count + 1,
            "attempting to unstall instance"
        );

        let continuous_remaining = if self.is_continuous_mode() {
            Some(self.continuous_time_remaining())
        } else {
            None
        };

        let selected = match self.preview() {
            Ok(content) => patterns::select_candidates(&content, continuous_remaining, candidates),
            Err(e) if e.pane_gone() => return Err(CorralError::InstanceNotRunning),
            Err(_) if candidates.is_empty() => patterns::default_candidates(),
            Err(_) => candidates.to_vec(),
        };

        let mut last_err: Option<CorralError> = None;
        for cmd in &selected {
            match self.send_prompt(cmd) {
                Ok(()) => {
                    self.stall_count += 1;
                    self.continue_attempts += 1;
                    self.last_activity = Utc::now();
                    warn!(instance = %self.title, command = %cmd.escape_debug(), "sent continue command");
                    return Ok(());
                }
                Err(e) => {
                    warn!(instance = %self.title, command = %cmd.escape_debug(), error = %e, "failed to send continue command");
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) if e.pane_gone() => Err(CorralError::InstanceNotRunning),
            Some(e) => Err(e),
            None => Err(CorralError::InstanceNotRunning),
        }
    }

    // --- continuous mode ------------------------------------------------

    /// Flip continuous mode; enabling records the start time.
    pub fn toggle_continuous_mode(&mut self) -> bool {
        let mut st = self.write_shared();
        st.continuous_mode = !st.continuous_mode;
        if st.continuous_mode {
            st.continuous_started = Some(Utc::now());
        } else {
            st.continuous_started = None;
        }
        info!(
            instance = %self.title,
            enabled = st.continuous_mode,
            "continuous mode toggled"
        );
        st.continuous_mode
    }

    /// Set the continuous-mode duration (zero = indefinite, max 24 h).
    /// Resets the start time when the mode is already running.
    pub fn set_continuous_duration(&mut self, duration: Duration) -> Result<(), CorralError> {
        if duration > MAX_CONTINUOUS_DURATION {
            return Err(CorralError::DurationTooLong);
        }
        let mut st = self.write_shared();
        st.continuous_duration = duration;
        if st.continuous_mode {
            st.continuous_started = Some(Utc::now());
        }
        Ok(())
    }

    pub fn is_continuous_mode(&self) -> bool {
        self.read_shared().continuous_mode
    }

    pub fn disable_continuous_mode(&mut self) {
        let mut st = self.write_shared();
        if st.continuous_mode {
            st.continuous_mode = false;
            st.continuous_started = None;
            info!(instance = %self.title, "continuous mode disabled");
        }
    }

    /// Positive time left, or zero when indefinite, expired or disabled.
    pub fn continuous_time_remaining(&self) -> Duration {
        let st = self.read_shared();
        if !st.continuous_mode || st.continuous_duration.is_zero() {
            return Duration::ZERO;
        }
        let Some(started) = st.continuous_started else {
            return Duration::ZERO;
        };
        st.continuous_duration.saturating_sub(elapsed_since(started))
    }

    /// Remaining time as `1h 2m 3s`; empty when not applicable.
    pub fn continuous_remaining_formatted(&self) -> String {
        if !self.is_continuous_mode() {
            return String::new();
        }
        let remaining = self.continuous_time_remaining();
        if remaining.is_zero() {
            return String::new();
        }
        patterns::format_remaining(remaining)
    }

    /// Whether a bounded continuous run has passed its deadline.
    pub fn continuous_expired(&self) -> bool {
        let st = self.read_shared();
        if !st.continuous_mode || st.continuous_duration.is_zero() {
            return false;
        }
        match st.continuous_started {
            Some(started) => elapsed_since(started) > st.continuous_duration,
            None => false,
        }
    }

    // --- restart --------------------------------------------------------

    /// Operator-initiated restart: close the pane and relaunch the agent
    /// with `-r <session id>` so the conversation survives.
    pub fn restart(&mut self) -> Result<(), CorralError> {
        if !self.started {
            return Err(CorralError::InstanceNotStarted);
        }
        if self.status == Status::Paused {
            return Err(CorralError::InstanceAlreadyPaused);
        }
        if !self.program.to_lowercase().contains("claude") {
            return Err(CorralError::UnsupportedForProgram {
                program: self.program.clone(),
            });
        }

        let saved = {
            // Only one concurrent restarter wins; the rest see the cooldown.
            let Ok(mut st) = self.shared.try_write() else {
                return Err(CorralError::RestartCoolingDown {
                    remaining_secs: RESTART_COOLDOWN.as_secs(),
                });
            };

            if let Some(last) = st.last_restart {
                let elapsed = elapsed_since(last);
                if elapsed < RESTART_COOLDOWN {
                    let remaining_ms = (RESTART_COOLDOWN - elapsed).as_millis();
                    return Err(CorralError::RestartCoolingDown {
                        remaining_secs: ((remaining_ms + 999) / 1000) as u64,
                    });
                }
            }

            st.last_restart = Some(Utc::now());
            st.restart_attempts += 1;
            (st.continuous_mode, st.continuous_started, st.continuous_duration)
            // Write lock dropped here; the readiness probe must not hold it.
        };

        info!(instance = %self.title, "user initiated restart");
        self.restart_with_resume(saved)
    }

    /// Tick-driven crash detection: a vanished pane triggers the resume
    /// path, bounded to three attempts per five-minute window.
    pub fn detect_crash_and_restart(&mut self) -> bool {
        if !self.started || self.status == Status::Paused {
            return false;
        }
        if !self.program.to_lowercase().contains("claude") {
            return false;
        }

        {
            let mut st = self.write_shared();
            if st.restart_attempts >= MAX_AUTO_RESTART_ATTEMPTS {
                let in_cooldown = st
                    .last_restart
                    .map(|last| elapsed_since(last) < AUTO_RESTART_COOLDOWN)
                    .unwrap_or(false);
                if in_cooldown {
                    return false;
                }
                st.restart_attempts = 0;
            }
        }

        let gone = match self.pane.as_ref().map(|p| p.capture_content()) {
            Some(Err(e)) => e.pane_gone(),
            _ => false,
        };
        if !gone {
            return false;
        }

        let saved = {
            let mut st = self.write_shared();
            warn!(
                instance = %self.title,
                attempt = st.restart_attempts + 1,
                max = MAX_AUTO_RESTART_ATTEMPTS,
                "detected crashed agent session"
            );
            st.restart_attempts += 1;
            st.last_restart = Some(Utc::now());
            (st.continuous_mode, st.continuous_started, st.continuous_duration)
        };

        match self.restart_with_resume(saved) {
            Ok(()) => true,
            Err(e) => {
                error!(instance = %self.title, error = %e, "failed to restart crashed agent session");
                false
            }
        }
    }

    /// The shared resume path: discover the session id, retire the old pane,
    /// relaunch with `-r <id>` in the same worktree, probe for readiness.
    fn restart_with_resume(&mut self, saved: SavedContinuous) -> Result<(), CorralError> {
        let worktree_path = match self.worktree.as_ref() {
            Some(worktree) => worktree.worktree_path().to_path_buf(),
            None => return Err(CorralError::InstanceNotStarted),
        };

        // Session discovery comes first: a failure here must leave the pane
        // untouched.
        let session_id = locator::find_session_id(&worktree_path, &self.ctx.agent_home)?;

        if let Some(pane) = self.pane.as_mut() {
            // Ask the agent to exit cleanly before killing the pane.
            let _ = pane.send_text("exit");
            std::thread::sleep(Duration::from_millis(500));
            if let Err(e) = pane.close() {
                warn!(instance = %self.title, error = %e, "failed to close pane during restart");
            }
        }

        let base = self
            .program
            .split_whitespace()
            .next()
            .unwrap_or(self.program.as_str());
        let resume_program = format!("{base} -r {session_id}");
        info!(instance = %self.title, command = %resume_program, "restarting with resume command");

        let mut pane = PaneSession::new(&self.title, &resume_program, self.ctx.mux.clone());
        pane.start(&worktree_path)?;
        self.pane = Some(pane);

        // Exponential backoff until the agent shows a prompt: 1+2+4+8+16 s.
        let mut ready = false;
        for retry in 0..READINESS_PROBE_RETRIES {
            std::thread::sleep(Duration::from_secs(1u64 << retry));
            let Some(pane) = self.pane.as_ref() else { break };
            if let Ok(content) = pane.capture_content() {
                let lower = content.to_lowercase();
                if lower.contains("claude") || lower.contains('>') || lower.contains("continue") {
                    ready = true;
                    break;
                }
            }
        }
        if ready {
            if let Err(e) = self.send_prompt("continue") {
                warn!(instance = %self.title, error = %e, "failed to send initial continue after restart");
            } else {
                info!(instance = %self.title, "sent initial continue to resumed session");
            }
        } else {
            warn!(instance = %self.title, "agent may not be fully ready after restart, proceeding anyway");
        }

        // Fresh monitoring baseline.
        self.last_activity = Utc::now();
        self.last_content_hash.clear();
        self.continue_attempts = 0;

        let (was_continuous, continuous_started, continuous_duration) = saved;
        if was_continuous {
            let mut st = self.write_shared();
            st.continuous_mode = true;
            st.continuous_started = continuous_started;
            st.continuous_duration = continuous_duration;
            info!(instance = %self.title, "restored continuous mode state after restart");
        }

        self.status = Status::Running;
        Ok(())
    }

    // --- persistence ----------------------------------------------------

    pub fn to_snapshot(&self) -> InstanceSnapshot {
        let st = self.read_shared();
        InstanceSnapshot {
            title: self.title.clone(),
            path: self.path.clone(),
            branch: self.branch.clone(),
            status: self.status,
            program: self.program.clone(),
            auto_yes: self.auto_yes,
            created_at: self.created_at,
            updated_at: Utc::now(),
            watchdog_enabled: self.watchdog_enabled,
            last_activity: self.last_activity,
            stall_count: self.stall_count,
            continuous_mode: st.continuous_mode,
            continuous_started: st.continuous_started,
            continuous_duration_secs: st.continuous_duration.as_secs(),
            restart_attempts: st.restart_attempts,
            last_restart: st.last_restart,
            worktree: self
                .worktree
                .as_ref()
                .map(|w| w.record())
                .unwrap_or_default(),
            diff_stats: self.diff_stats.clone(),
        }
    }

    /// Rebuild an instance from a stored snapshot. Paused instances keep
    /// their handles cold; anything else restores its existing pane.
    pub fn from_snapshot(
        snap: InstanceSnapshot,
        ctx: InstanceContext,
    ) -> Result<Self, CorralError> {
        let shared = SharedState {
            continuous_mode: snap.continuous_mode,
            continuous_started: snap.continuous_started,
            continuous_duration: Duration::from_secs(snap.continuous_duration_secs),
            restart_attempts: snap.restart_attempts,
            last_restart: snap.last_restart,
        };

        let mut instance = Instance {
            title: snap.title,
            path: snap.path,
            branch: snap.branch,
            program: snap.program,
            auto_yes: snap.auto_yes,
            status: snap.status,
            created_at: snap.created_at,
            updated_at: snap.updated_at,
            started: false,
            watchdog_enabled: snap.watchdog_enabled,
            last_activity: snap.last_activity,
            stall_count: snap.stall_count,
            continue_attempts: 0,
            last_content_hash: String::new(),
            shared: Arc::new(RwLock::new(shared)),
            diff_stats: snap.diff_stats,
            pane: None,
            worktree: Some(Worktree::from_record(snap.worktree)),
            ctx,
        };

        if instance.status == Status::Paused {
            instance.started = true;
        } else {
            instance.start(false)?;
        }
        Ok(instance)
    }
}

/// Serializable form of an [`Instance`]; live handles are rebuilt on load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceSnapshot {
    pub title: String,
    pub path: PathBuf,
    #[serde(default)]
    pub branch: String,
    pub status: Status,
    pub program: String,
    #[serde(default)]
    pub auto_yes: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub watchdog_enabled: bool,
    #[serde(default = "Utc::now")]
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub stall_count: u32,
    #[serde(default)]
    pub continuous_mode: bool,
    #[serde(default)]
    pub continuous_started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub continuous_duration_secs: u64,
    #[serde(default)]
    pub restart_attempts: u32,
    #[serde(default)]
    pub last_restart: Option<DateTime<Utc>>,
    #[serde(default)]
    pub worktree: WorktreeRecord,
    #[serde(default)]
    pub diff_stats: Option<DiffStats>,
}
