//! # Turn Scheduler
//!
//! Drives the scripted half of the call. The script is a list of turn
//! windows anchored to the moment the transport opened; on every tick the
//! scheduler looks up the window containing the elapsed time and makes the
//! world agree with it:
//!
//! - **Agent window**: close the gate, start the window's clip if it is not
//!   the one already started, and arm a hard stop at the window's end
//! - **Caller window**: stop any agent audio right away and open the gate
//! - **No window** (gap or past the end): change nothing
//!
//! Scheduling is driven by wall-clock elapsed time, never by playback
//! completion, so a clip that fails to play does not shift later turns.

use crate::api::SessionApi;
use crate::audio::{AgentPlayer, AudioClip};
use crate::error::{AppError, AppResult};
use crate::models::{AgentScript, Role, ScriptSegment, Window};
use crate::transport::Gate;
use futures_util::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Check that windows are well formed, sorted and non-overlapping.
/// Gaps between windows are allowed.
pub fn validate_windows(windows: &[Window]) -> AppResult<()> {
    for (i, window) in windows.iter().enumerate() {
        if !(window.start < window.end) {
            return Err(AppError::Api(format!(
                "Window {} has start {} not before end {}",
                i, window.start, window.end
            )));
        }
        if let Some(next) = windows.get(i + 1) {
            if next.start < window.end {
                return Err(AppError::Api(format!(
                    "Window {} starting at {} overlaps or precedes window {}",
                    i + 1,
                    next.start,
                    i
                )));
            }
        }
    }
    Ok(())
}

/// Index of the unique window with `start <= elapsed < end`.
///
/// Expects windows that passed `validate_windows`.
pub fn find_window(windows: &[Window], elapsed: f64) -> Option<usize> {
    // First window whose end is past `elapsed`; it matches only if it has started
    let idx = windows.partition_point(|w| w.end <= elapsed);
    windows
        .get(idx)
        .filter(|w| w.contains(elapsed))
        .map(|_| idx)
}

/// Agent clips for one session, fetched before the scheduler starts.
#[derive(Debug, Default, Clone)]
pub struct ClipCache {
    clips: HashMap<usize, AudioClip>,
}

impl ClipCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch every clip the agent windows reference. Failed downloads are
    /// logged and left out; their windows will be silent.
    pub async fn preload(api: &dyn SessionApi, windows: &[Window], format: &str) -> Self {
        let indices: BTreeSet<usize> = windows
            .iter()
            .filter(|w| w.role == Role::Agent)
            .filter_map(|w| w.segment_index)
            .collect();

        let fetches = indices.iter().map(|&idx| async move {
            (idx, api.agent_audio(idx, format).await)
        });

        let mut cache = Self::new();
        for (idx, result) in join_all(fetches).await {
            match result {
                Ok(bytes) => cache.insert(AudioClip::new(idx, bytes)),
                Err(e) => warn!("Skipping agent clip {}: {}", idx, e),
            }
        }

        if cache.is_empty() && !indices.is_empty() {
            warn!("No agent clips could be loaded, every agent window will be silent");
        } else {
            info!("Preloaded {}/{} agent clips", cache.len(), indices.len());
        }
        cache
    }

    pub fn insert(&mut self, clip: AudioClip) {
        self.clips.insert(clip.segment_index, clip);
    }

    pub fn get(&self, segment_index: usize) -> Option<&AudioClip> {
        self.clips.get(&segment_index)
    }

    pub fn len(&self) -> usize {
        self.clips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clips.is_empty()
    }
}

/// Observable scheduler state.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnState {
    pub window: Option<Window>,
    pub segment_index: Option<usize>,
    pub agent_speaking: bool,
}

/// The per-session turn state machine.
pub struct TurnScheduler {
    windows: Vec<Window>,
    segments: Vec<ScriptSegment>,
    clips: ClipCache,
    player: Arc<dyn AgentPlayer>,
    gate: Gate,
    current_window: Option<usize>,
    current_segment: Option<usize>,
    agent_speaking: bool,
    hard_stop: Option<JoinHandle<()>>,
}

impl TurnScheduler {
    pub fn new(
        script: AgentScript,
        clips: ClipCache,
        player: Arc<dyn AgentPlayer>,
        gate: Gate,
    ) -> AppResult<Self> {
        validate_windows(&script.windows)?;

        for window in script.windows.iter().filter(|w| w.role == Role::Agent) {
            if window.segment_index.map_or(true, |idx| idx >= script.script.len()) {
                warn!(
                    "Agent window at {}s has no script segment ({:?})",
                    window.start, window.segment_index
                );
            }
        }

        Ok(Self {
            windows: script.windows,
            segments: script.script,
            clips,
            player,
            gate,
            current_window: None,
            current_segment: None,
            agent_speaking: false,
            hard_stop: None,
        })
    }

    pub fn state(&self) -> TurnState {
        TurnState {
            window: self.current_window.map(|idx| self.windows[idx].clone()),
            segment_index: self.current_segment,
            agent_speaking: self.agent_speaking,
        }
    }

    /// Script text of the current agent segment, for display.
    pub fn current_text(&self) -> Option<&str> {
        self.current_segment
            .and_then(|idx| self.segments.get(idx))
            .map(|segment| segment.text.as_str())
    }

    /// Evaluate the script at `elapsed` seconds since session start.
    ///
    /// ## Returns:
    /// The role of the matched window, or `None` when `elapsed` falls in a
    /// gap or past the end (state is then left as it was).
    pub fn tick(&mut self, elapsed: f64) -> Option<Role> {
        let idx = find_window(&self.windows, elapsed)?;
        let window = self.windows[idx].clone();

        if self.current_window != Some(idx) {
            info!(
                "Turn: {:?} [{:.1}s, {:.1}s) at {:.1}s",
                window.role, window.start, window.end, elapsed
            );
            self.current_window = Some(idx);
        }

        match window.role {
            Role::Agent => self.enter_agent(&window, elapsed),
            Role::Caller => self.enter_caller(),
        }
        Some(window.role)
    }

    fn enter_agent(&mut self, window: &Window, elapsed: f64) {
        self.agent_speaking = true;
        self.gate.close();

        if window.segment_index == self.current_segment {
            return;
        }

        self.cancel_hard_stop();
        self.player.stop();
        self.current_segment = window.segment_index;

        let Some(idx) = window.segment_index else {
            return;
        };

        let Some(clip) = self.clips.get(idx) else {
            warn!("No clip for agent segment {}, window is silent", idx);
            return;
        };

        if let Some(text) = self.segments.get(idx).map(|s| s.text.as_str()) {
            info!("Agent: {}", text);
        }

        if let Err(e) = self.player.play(clip) {
            warn!("Agent segment {} failed to play: {}", idx, e);
            return;
        }

        // The window boundary wins over the clip's own length
        let remaining = Duration::from_secs_f64((window.end - elapsed).max(0.0));
        let deadline = Instant::now() + remaining;
        let player = self.player.clone();
        self.hard_stop = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            debug!("Hard stop of agent segment {}", idx);
            player.stop();
        }));
    }

    fn enter_caller(&mut self) {
        if self.player.is_playing() {
            debug!("Caller turn, cutting agent audio");
        }
        self.cancel_hard_stop();
        self.player.stop();
        self.agent_speaking = false;
        self.gate.open();
    }

    fn cancel_hard_stop(&mut self) {
        if let Some(task) = self.hard_stop.take() {
            task.abort();
        }
    }

    /// Stop playback, cancel timers and forget all turn state.
    pub fn teardown(&mut self) {
        self.cancel_hard_stop();
        self.player.stop();
        self.current_window = None;
        self.current_segment = None;
        self.agent_speaking = false;
        debug!("Turn scheduler reset");
    }
}

impl Drop for TurnScheduler {
    fn drop(&mut self) {
        self.cancel_hard_stop();
    }
}

/// A scheduler running on its own interval task.
pub struct SchedulerHandle {
    scheduler: Arc<Mutex<TurnScheduler>>,
    task: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Tick immediately, then every `tick`, measuring from `session_start`.
    ///
    /// The first tick runs before this returns, so the gate already matches
    /// the opening window when capture starts.
    pub fn spawn(mut scheduler: TurnScheduler, session_start: Instant, tick: Duration) -> Self {
        scheduler.tick(session_start.elapsed().as_secs_f64());
        let scheduler = Arc::new(Mutex::new(scheduler));
        let shared = scheduler.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let elapsed = session_start.elapsed().as_secs_f64();
                shared.lock().unwrap().tick(elapsed);
            }
        });

        Self {
            scheduler,
            task: Some(task),
        }
    }

    pub fn state(&self) -> TurnState {
        self.scheduler.lock().unwrap().state()
    }

    pub fn current_text(&self) -> Option<String> {
        self.scheduler.lock().unwrap().current_text().map(str::to_string)
    }

    /// Cancel the tick task and tear the scheduler down. Idempotent.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.scheduler.lock().unwrap().teardown();
            info!("Turn scheduler stopped");
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{demo_script, FakeApi};
    use crate::audio::playback::testing::{PlayerEvent, RecordingPlayer};

    fn window(start: f64, end: f64, role: Role, segment_index: Option<usize>) -> Window {
        Window {
            start,
            end,
            role,
            segment_index,
        }
    }

    fn clips_for(indices: &[usize]) -> ClipCache {
        let mut cache = ClipCache::new();
        for &idx in indices {
            cache.insert(AudioClip::new(idx, vec![0xFF, 0xFB]));
        }
        cache
    }

    fn demo_scheduler(player: Arc<RecordingPlayer>, gate: Gate) -> TurnScheduler {
        TurnScheduler::new(demo_script(), clips_for(&[0, 1]), player, gate).unwrap()
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_find_window_is_unique_and_respects_gaps() {
        let windows = vec![
            window(0.0, 5.0, Role::Agent, Some(0)),
            window(7.0, 10.0, Role::Caller, None),
        ];
        assert_eq!(find_window(&windows, 0.0), Some(0));
        assert_eq!(find_window(&windows, 4.999), Some(0));
        assert_eq!(find_window(&windows, 5.0), None);
        assert_eq!(find_window(&windows, 6.0), None);
        assert_eq!(find_window(&windows, 7.0), Some(1));
        assert_eq!(find_window(&windows, 10.0), None);
        assert_eq!(find_window(&windows, -1.0), None);
        assert_eq!(find_window(&[], 1.0), None);
    }

    #[test]
    fn test_validate_rejects_bad_scripts() {
        assert!(validate_windows(&[window(5.0, 5.0, Role::Agent, Some(0))]).is_err());
        assert!(validate_windows(&[
            window(0.0, 6.0, Role::Agent, Some(0)),
            window(5.0, 10.0, Role::Caller, None),
        ])
        .is_err());
        assert!(validate_windows(&[
            window(0.0, 5.0, Role::Agent, Some(0)),
            window(8.0, 10.0, Role::Caller, None),
        ])
        .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_script_scenario() {
        let player = Arc::new(RecordingPlayer::new());
        let gate = Gate::new(true);
        let mut scheduler = demo_scheduler(player.clone(), gate.clone());

        assert_eq!(scheduler.tick(2.0), Some(Role::Agent));
        assert_eq!(player.current(), Some(0));
        assert!(!gate.is_open());

        assert_eq!(scheduler.tick(10.0), Some(Role::Caller));
        assert!(gate.is_open());
        assert!(!player.is_playing());

        assert_eq!(scheduler.tick(16.0), Some(Role::Agent));
        assert_eq!(player.current(), Some(1));
        assert!(!gate.is_open());

        assert_eq!(scheduler.tick(21.0), None);
        // Past the end nothing changes
        assert!(scheduler.state().agent_speaking);
        assert!(!gate.is_open());
        assert_eq!(scheduler.state().segment_index, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_clip_is_cut_at_window_end() {
        let player = Arc::new(RecordingPlayer::new());
        let mut scheduler = demo_scheduler(player.clone(), Gate::new(true));

        scheduler.tick(0.0);
        assert_eq!(player.current(), Some(0));

        tokio::time::advance(Duration::from_millis(4900)).await;
        settle().await;
        assert!(player.is_playing());

        tokio::time::advance(Duration::from_millis(200)).await;
        settle().await;
        assert!(!player.is_playing());
        assert_eq!(player.events(), vec![PlayerEvent::Play(0), PlayerEvent::Stop]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_turn_stops_agent_immediately() {
        let player = Arc::new(RecordingPlayer::new());
        let gate = Gate::new(true);
        let mut scheduler = demo_scheduler(player.clone(), gate.clone());

        scheduler.tick(1.0);
        assert!(player.is_playing());

        scheduler.tick(5.0);
        assert!(!player.is_playing());
        assert!(gate.is_open());
        assert_eq!(player.events(), vec![PlayerEvent::Play(0), PlayerEvent::Stop]);

        // The cancelled hard stop never fires
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(player.events().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_follows_every_tick() {
        let player = Arc::new(RecordingPlayer::new());
        let gate = Gate::new(true);
        let mut scheduler = demo_scheduler(player, gate.clone());
        let windows = demo_script().windows;

        let mut t = 0.0;
        while t < 20.0 {
            let role = scheduler.tick(t).unwrap();
            let expected = windows[find_window(&windows, t).unwrap()].role;
            assert_eq!(role, expected);
            assert_eq!(gate.is_open(), role == Role::Caller, "gate wrong at t={}", t);
            t += 0.5;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_segment_is_not_restarted() {
        let player = Arc::new(RecordingPlayer::new());
        let mut scheduler = demo_scheduler(player.clone(), Gate::new(true));

        scheduler.tick(0.0);
        scheduler.tick(0.5);
        scheduler.tick(1.0);
        assert_eq!(player.events(), vec![PlayerEvent::Play(0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_clip_still_closes_gate() {
        let player = Arc::new(RecordingPlayer::new());
        let gate = Gate::new(true);
        let mut scheduler =
            TurnScheduler::new(demo_script(), clips_for(&[1]), player.clone(), gate.clone()).unwrap();

        scheduler.tick(2.0);
        assert!(!gate.is_open());
        assert!(player.events().is_empty());
        assert!(scheduler.state().agent_speaking);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_resets_state() {
        let player = Arc::new(RecordingPlayer::new());
        let mut scheduler = demo_scheduler(player.clone(), Gate::new(true));

        scheduler.tick(2.0);
        assert_eq!(scheduler.current_text(), Some("Hello, this is SecureBank."));
        scheduler.teardown();

        assert!(!player.is_playing());
        assert_eq!(
            scheduler.state(),
            TurnState {
                window: None,
                segment_index: None,
                agent_speaking: false
            }
        );

        // A fresh start replays the first segment
        scheduler.tick(2.0);
        assert_eq!(player.current(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_ticks_immediately_and_stops_cleanly() {
        let player = Arc::new(RecordingPlayer::new());
        let gate = Gate::new(true);
        let scheduler = demo_scheduler(player.clone(), gate.clone());

        let mut handle = SchedulerHandle::spawn(scheduler, Instant::now(), Duration::from_millis(500));
        assert_eq!(player.current(), Some(0));
        assert!(!gate.is_open());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(gate.is_open());
        assert!(!handle.state().agent_speaking);

        handle.stop();
        handle.stop();
        assert_eq!(handle.state().window, None);

        let events = player.events().len();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(player.events().len(), events);
    }

    #[tokio::test]
    async fn test_preload_skips_failed_clips() {
        let api = FakeApi::new();
        api.clips.lock().unwrap().insert(0, vec![1, 2, 3]);

        let cache = ClipCache::preload(&api, &demo_script().windows, "mp3").await;
        assert_eq!(cache.len(), 1);
        assert!(cache.get(0).is_some());
        assert!(cache.get(1).is_none());
        assert_eq!(api.count("audio"), 2);
    }

    #[tokio::test]
    async fn test_preload_with_no_clips_available_is_empty() {
        let api = FakeApi::new();
        let cache = ClipCache::preload(&api, &demo_script().windows, "mp3").await;
        assert!(cache.is_empty());
        assert_eq!(api.count("audio"), 2);
    }
}
