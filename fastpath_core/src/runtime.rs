//! Async runtime around the fasting state machine.
//!
//! A single actor task owns the [`FastingState`], applies actions in arrival
//! order and performs the resulting effects:
//!
//! - store operations run FIFO on a dedicated worker thread and report back
//!   as result actions
//! - each active session gets a periodic tick task
//! - the live status publisher is driven inline
//!
//! Front ends talk to it through a [`FastingHandle`].

use crate::fasting::LoadedState;
use crate::goals::{seed_goals_for, validate_goals};
use crate::{
    reduce, Action, Clock, Config, Effect, Error, FastingGoal, FastingState, LiveStatusPublisher,
    RecordStore, Result,
};
use std::collections::HashMap;
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use uuid::Uuid;

/// Runtime settings
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub tick_interval: Duration,
    /// Initial value of the live surface toggle
    pub live_enabled: bool,
    /// Goals written to an empty store on load
    pub seed_goals: Vec<FastingGoal>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RuntimeConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            live_enabled: config.live.enabled,
            seed_goals: seed_goals_for(config),
        }
    }
}

/// Requests to open another screen
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Navigation {
    History,
}

enum Message {
    Action(Action),
    /// Answered once every earlier message has been handled
    Barrier(oneshot::Sender<()>),
    Shutdown,
}

type StoreJob = Box<dyn FnOnce(&dyn RecordStore) -> Action + Send + 'static>;

enum StoreCommand {
    Execute(StoreJob),
    Shutdown,
}

/// Cloneable sender for actions, usable from synchronous callbacks
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Message>,
}

impl Dispatcher {
    pub fn dispatch(&self, action: Action) -> Result<()> {
        self.tx
            .send(Message::Action(action))
            .map_err(|_| Error::Runtime("fasting runtime has shut down".into()))
    }
}

/// Front-end side of a running [`FastingRuntime`]
pub struct FastingHandle {
    dispatcher: Dispatcher,
    state: watch::Receiver<FastingState>,
    navigation: Option<mpsc::UnboundedReceiver<Navigation>>,
    task: Option<JoinHandle<()>>,
}

impl FastingHandle {
    pub fn dispatch(&self, action: Action) -> Result<()> {
        self.dispatcher.dispatch(action)
    }

    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    /// Latest published state
    pub fn state(&self) -> FastingState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FastingState> {
        self.state.clone()
    }

    /// Receiver for navigation requests; can be taken once
    pub fn take_navigation(&mut self) -> Option<mpsc::UnboundedReceiver<Navigation>> {
        self.navigation.take()
    }

    /// Wait until every action sent so far is handled and all store
    /// operations they caused have been answered.
    pub async fn settled(&self) -> Result<FastingState> {
        let (tx, rx) = oneshot::channel();
        self.dispatcher
            .tx
            .send(Message::Barrier(tx))
            .map_err(|_| Error::Runtime("fasting runtime has shut down".into()))?;
        rx.await
            .map_err(|_| Error::Runtime("fasting runtime stopped before settling".into()))?;

        let mut state = self.state.clone();
        let settled = state
            .wait_for(|s| s.is_settled())
            .await
            .map_err(|_| Error::Runtime("fasting runtime has shut down".into()))?;
        Ok(settled.clone())
    }

    /// Stop tickers and the live surface, then wait for the actor to exit
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.dispatcher.tx.send(Message::Shutdown);
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| Error::Runtime(format!("fasting runtime task failed: {}", e)))?;
        }
        Ok(())
    }
}

impl Drop for FastingHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.dispatcher.tx.send(Message::Shutdown);
        }
    }
}

/// The actor that owns the fasting state
pub struct FastingRuntime {
    state: FastingState,
    state_tx: watch::Sender<FastingState>,
    inbox: mpsc::UnboundedSender<Message>,
    store: Arc<dyn RecordStore>,
    store_tx: std_mpsc::Sender<StoreCommand>,
    store_worker: Option<thread::JoinHandle<()>>,
    publisher: Box<dyn LiveStatusPublisher>,
    clock: Arc<dyn Clock>,
    tickers: HashMap<Uuid, JoinHandle<()>>,
    tick_interval: Duration,
    seed_goals: Arc<Vec<FastingGoal>>,
    navigation: mpsc::UnboundedSender<Navigation>,
}

impl FastingRuntime {
    /// Start the actor and its store worker. Must be called from within a
    /// Tokio runtime.
    ///
    /// Nothing is loaded until `Action::LoadInitialState` is dispatched.
    pub fn spawn(
        store: Arc<dyn RecordStore>,
        publisher: Box<dyn LiveStatusPublisher>,
        clock: Arc<dyn Clock>,
        config: RuntimeConfig,
    ) -> Result<FastingHandle> {
        if config.tick_interval.is_zero() {
            return Err(Error::Config("tick interval must be greater than zero".into()));
        }
        let problems = validate_goals(&config.seed_goals);
        if !problems.is_empty() {
            return Err(Error::Config(problems.join("; ")));
        }

        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (nav_tx, nav_rx) = mpsc::unbounded_channel();
        let initial = FastingState::new(config.live_enabled);
        let (state_tx, state_rx) = watch::channel(initial.clone());

        let (store_tx, store_rx) = std_mpsc::channel::<StoreCommand>();
        let worker_store = Arc::clone(&store);
        let results = inbox.clone();
        let store_worker = thread::Builder::new()
            .name("fastpath-store".into())
            .spawn(move || {
                while let Ok(command) = store_rx.recv() {
                    match command {
                        StoreCommand::Execute(job) => {
                            let action = job(worker_store.as_ref());
                            if results.send(Message::Action(action)).is_err() {
                                break;
                            }
                        }
                        StoreCommand::Shutdown => break,
                    }
                }
                tracing::debug!("Store worker shutting down");
            })?;

        let runtime = FastingRuntime {
            state: initial,
            state_tx,
            inbox: inbox.clone(),
            store,
            store_tx,
            store_worker: Some(store_worker),
            publisher,
            clock,
            tickers: HashMap::new(),
            tick_interval: config.tick_interval,
            seed_goals: Arc::new(config.seed_goals),
            navigation: nav_tx,
        };
        let task = tokio::spawn(runtime.run(inbox_rx));

        Ok(FastingHandle {
            dispatcher: Dispatcher { tx: inbox },
            state: state_rx,
            navigation: Some(nav_rx),
            task: Some(task),
        })
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Message>) {
        tracing::debug!("Fasting runtime started");
        while let Some(message) = inbox.recv().await {
            match message {
                Message::Action(action) => self.handle(action),
                Message::Barrier(reply) => {
                    let _ = reply.send(());
                }
                Message::Shutdown => break,
            }
        }
        self.teardown().await;
    }

    fn handle(&mut self, action: Action) {
        let now = self.clock.now();
        let effects = reduce(&mut self.state, action, now);
        self.state_tx.send_replace(self.state.clone());

        for effect in effects {
            self.perform(effect);
        }
    }

    fn perform(&mut self, effect: Effect) {
        match effect {
            Effect::LoadAll => {
                let seed = Arc::clone(&self.seed_goals);
                self.submit(Box::new(move |store: &dyn RecordStore| load_all(store, &seed)));
            }

            Effect::SaveRecord(record) => {
                self.submit(Box::new(move |store: &dyn RecordStore| match store.save(&record) {
                    Ok(()) => Action::FastSaved(record),
                    Err(e) => Action::FastSaveFailed {
                        record,
                        error: e.to_string(),
                    },
                }));
            }

            Effect::UpdateRecord(record) => {
                self.submit(Box::new(move |store: &dyn RecordStore| match store.update(&record) {
                    Ok(()) => Action::FastStopped(record),
                    Err(e) => Action::FastStopFailed {
                        record,
                        error: e.to_string(),
                    },
                }));
            }

            Effect::DeleteRecord(id) => {
                self.submit(Box::new(move |store: &dyn RecordStore| match store.delete(id) {
                    Ok(removed) => Action::RecordDeleted { id, removed },
                    Err(e) => Action::DeleteFailed {
                        id,
                        error: e.to_string(),
                    },
                }));
            }

            Effect::PersistGoal { goal, previous } => {
                self.submit(Box::new(move |store: &dyn RecordStore| {
                    let result = match &goal {
                        Some(g) => store
                            .save_goal(g)
                            .and_then(|_| store.select_goal(Some(&g.name))),
                        None => store.select_goal(None),
                    };
                    match result {
                        Ok(()) => Action::GoalPersisted,
                        Err(e) => Action::GoalPersistFailed {
                            goal,
                            previous,
                            error: e.to_string(),
                        },
                    }
                }));
            }

            Effect::StartTicker(session) => self.start_ticker(session),

            Effect::CancelTicker(session) => {
                if let Some(handle) = self.tickers.remove(&session) {
                    handle.abort();
                    tracing::debug!("Cancelled ticker for fast {}", session);
                }
            }

            Effect::StartLive(session) => {
                let started = self.publisher.start(&session);
                let _ = self.inbox.send(Message::Action(Action::LiveStartResult {
                    session: session.session_id,
                    started,
                }));
            }

            Effect::UpdateLive(status) => self.publisher.update(&status),

            Effect::StopLive => self.publisher.stop(),

            Effect::ShowHistory => {
                if self.navigation.send(Navigation::History).is_err() {
                    tracing::debug!("No navigation listener for history request");
                }
            }
        }
    }

    fn submit(&mut self, job: StoreJob) {
        if let Err(std_mpsc::SendError(command)) = self.store_tx.send(StoreCommand::Execute(job)) {
            // Worker is gone; run on the actor so the result still arrives
            tracing::error!("Store worker unavailable, running store operation inline");
            if let StoreCommand::Execute(job) = command {
                let action = job(self.store.as_ref());
                let _ = self.inbox.send(Message::Action(action));
            }
        }
    }

    fn start_ticker(&mut self, session: Uuid) {
        if let Some(existing) = self.tickers.remove(&session) {
            existing.abort();
        }

        let inbox = self.inbox.clone();
        let period = self.tick_interval;
        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if inbox
                    .send(Message::Action(Action::Tick { session }))
                    .is_err()
                {
                    break;
                }
            }
        });

        tracing::debug!("Started ticker for fast {} every {:?}", session, period);
        self.tickers.insert(session, handle);
    }

    async fn teardown(&mut self) {
        for (_, handle) in self.tickers.drain() {
            handle.abort();
        }
        if self.publisher.is_active() {
            self.publisher.stop();
        }

        let _ = self.store_tx.send(StoreCommand::Shutdown);
        if let Some(worker) = self.store_worker.take() {
            match tokio::task::spawn_blocking(move || worker.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => tracing::error!("Store worker panicked"),
                Err(e) => tracing::error!("Failed to join store worker: {}", e),
            }
        }
        tracing::debug!("Fasting runtime stopped");
    }
}

/// Seed goals if the store has none, then read everything the state needs
fn load_all(store: &dyn RecordStore, seed: &[FastingGoal]) -> Action {
    if let Err(e) = store.seed_goals(seed) {
        tracing::warn!("Failed to seed goals: {}", e);
    }

    match store.snapshot() {
        Ok(snapshot) => Action::InitialStateLoaded(LoadedState {
            active: snapshot.active,
            history: snapshot.records,
            goals: snapshot.goals,
            selected_goal: snapshot.selected_goal,
        }),
        Err(e) => Action::LoadFailed(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::{LiveSession, LiveStatus};
    use crate::{FastingRecord, ManualClock, MemoryStore};
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Mutex;

    #[derive(Clone, Debug, PartialEq)]
    enum LiveEvent {
        Start(LiveSession),
        Update(LiveStatus),
        Stop,
    }

    #[derive(Clone)]
    struct RecordingPublisher {
        events: Arc<Mutex<Vec<LiveEvent>>>,
        available: bool,
        active: bool,
    }

    impl RecordingPublisher {
        fn new(available: bool) -> (Self, Arc<Mutex<Vec<LiveEvent>>>) {
            let events = Arc::new(Mutex::new(Vec::new()));
            let publisher = Self {
                events: Arc::clone(&events),
                available,
                active: false,
            };
            (publisher, events)
        }
    }

    impl LiveStatusPublisher for RecordingPublisher {
        fn start(&mut self, session: &LiveSession) -> bool {
            if !self.available {
                return false;
            }
            self.active = true;
            self.events
                .lock()
                .unwrap()
                .push(LiveEvent::Start(session.clone()));
            true
        }

        fn update(&mut self, status: &LiveStatus) {
            if self.active {
                self.events.lock().unwrap().push(LiveEvent::Update(*status));
            }
        }

        fn stop(&mut self) {
            if self.active {
                self.active = false;
                self.events.lock().unwrap().push(LiveEvent::Stop);
            }
        }

        fn is_active(&self) -> bool {
            self.active
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 4, 20, 0, 0).unwrap()
    }

    fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            tick_interval: Duration::from_millis(10),
            live_enabled: true,
            seed_goals: crate::predefined_goals(),
        }
    }

    struct Harness {
        handle: FastingHandle,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        events: Arc<Mutex<Vec<LiveEvent>>>,
    }

    async fn harness(store: MemoryStore, publisher_available: bool) -> Harness {
        crate::logging::init_test();
        let store = Arc::new(store);
        let clock = Arc::new(ManualClock::new(t0()));
        let (publisher, events) = RecordingPublisher::new(publisher_available);
        let handle = FastingRuntime::spawn(
            store.clone(),
            Box::new(publisher),
            clock.clone(),
            test_config(),
        )
        .unwrap();
        handle.dispatch(Action::LoadInitialState).unwrap();
        handle.settled().await.unwrap();
        Harness {
            handle,
            store,
            clock,
            events,
        }
    }

    async fn wait_until(handle: &FastingHandle, f: impl FnMut(&FastingState) -> bool) {
        let mut rx = handle.subscribe();
        time::timeout(Duration::from_secs(5), rx.wait_for(f))
            .await
            .expect("timed out waiting for state")
            .unwrap();
    }

    #[tokio::test]
    async fn test_load_seeds_goals() {
        let h = harness(MemoryStore::new(), true).await;
        let state = h.handle.state();
        assert!(!state.is_loading);
        assert_eq!(state.available_goals.len(), 4);
        assert_eq!(h.store.goals().unwrap().len(), 4);
        assert!(state.selected_goal.is_none());
        h.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_during_reload_survives() {
        let h = harness(MemoryStore::new(), true).await;

        h.handle.dispatch(Action::LoadInitialState).unwrap();
        h.handle.dispatch(Action::StartFast).unwrap();
        let state = h.handle.settled().await.unwrap();

        let stored = h.store.get_active().unwrap().unwrap();
        assert!(state.is_fasting());
        assert_eq!(state.active_record, Some(stored.clone()));
        assert_eq!(state.ticking_for, Some(stored.id));
        assert_eq!(state.history, vec![stored]);
        h.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_goal_change_during_reload_survives() {
        let h = harness(MemoryStore::new(), true).await;
        let goal = crate::predefined_goals()[2].clone();

        h.handle.dispatch(Action::LoadInitialState).unwrap();
        h.handle.dispatch(Action::SelectGoal(goal.clone())).unwrap();
        let state = h.handle.settled().await.unwrap();

        assert_eq!(state.selected_goal, Some(goal.clone()));
        assert_eq!(h.store.selected_goal().unwrap(), Some(goal));
        h.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_and_stop_persist_record() {
        let h = harness(MemoryStore::new(), true).await;

        h.handle.dispatch(Action::StartFast).unwrap();
        let state = h.handle.settled().await.unwrap();
        assert!(state.is_fasting());
        let active = h.store.get_active().unwrap().unwrap();
        assert_eq!(active.start_time, t0());

        h.clock.advance(chrono::Duration::seconds(3600));
        h.handle.dispatch(Action::StopFast).unwrap();
        let state = h.handle.settled().await.unwrap();

        assert!(!state.is_fasting());
        assert_eq!(state.ticking_for, None);
        let records = h.store.list_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].duration(), Some(chrono::Duration::seconds(3600)));
        assert_eq!(state.history, records);
        h.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_ticks_follow_the_clock() {
        let h = harness(MemoryStore::new(), true).await;
        h.handle.dispatch(Action::StartFast).unwrap();
        h.handle.settled().await.unwrap();

        h.clock.advance(chrono::Duration::seconds(5));
        wait_until(&h.handle, |s| s.current_elapsed_secs == 5).await;
        h.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_save_rolls_back() {
        let store = MemoryStore::new();
        let h = harness(store, true).await;
        h.store.set_fail_writes(true);

        h.handle.dispatch(Action::StartFast).unwrap();
        let state = h.handle.settled().await.unwrap();
        assert!(!state.is_fasting());
        assert!(state.last_error.is_some());
        assert!(h.store.list_all().unwrap().is_empty());
        h.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_resumes_active_fast_on_load() {
        let store = MemoryStore::new();
        let record = FastingRecord::new(t0() - chrono::Duration::hours(1));
        store.save(&record).unwrap();

        let h = harness(store, true).await;
        let state = h.handle.state();
        assert_eq!(state.active_record, Some(record.clone()));
        assert_eq!(state.current_elapsed_secs, 3600);
        assert_eq!(state.ticking_for, Some(record.id));
        h.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_live_surface_follows_fast() {
        let h = harness(MemoryStore::new(), true).await;
        let goal = crate::predefined_goals()[1].clone();
        h.handle.dispatch(Action::SelectGoal(goal.clone())).unwrap();
        h.handle.dispatch(Action::StartFast).unwrap();
        h.handle.settled().await.unwrap();
        assert_eq!(h.store.selected_goal().unwrap(), Some(goal));

        h.clock.advance(chrono::Duration::seconds(60));
        wait_until(&h.handle, |s| s.current_elapsed_secs == 60).await;

        h.handle.dispatch(Action::StopFast).unwrap();
        h.handle.settled().await.unwrap();

        let events = h.events.lock().unwrap().clone();
        assert!(matches!(events.first(), Some(LiveEvent::Start(_))));
        assert!(events.iter().any(|e| matches!(
            e,
            LiveEvent::Update(LiveStatus {
                elapsed_secs: 60,
                remaining_secs: 57_540,
                goal_reached: false
            })
        )));
        assert_eq!(events.last(), Some(&LiveEvent::Stop));
        h.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_live_surface() {
        let h = harness(MemoryStore::new(), false).await;
        let goal = crate::predefined_goals()[0].clone();
        h.handle.dispatch(Action::SelectGoal(goal)).unwrap();
        h.handle.dispatch(Action::StartFast).unwrap();

        wait_until(&h.handle, |s| s.is_fasting() && !s.live_active).await;
        let state = h.handle.settled().await.unwrap();
        assert!(state.last_error.is_none());
        h.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_show_history_navigates() {
        let mut h = harness(MemoryStore::new(), true).await;
        let mut navigation = h.handle.take_navigation().unwrap();
        assert!(h.handle.take_navigation().is_none());

        h.handle.dispatch(Action::ShowHistory).unwrap();
        let request = time::timeout(Duration::from_secs(5), navigation.recv())
            .await
            .unwrap();
        assert_eq!(request, Some(Navigation::History));
        h.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_live_surface() {
        let h = harness(MemoryStore::new(), true).await;
        h.handle
            .dispatch(Action::SelectGoal(crate::predefined_goals()[0].clone()))
            .unwrap();
        h.handle.dispatch(Action::StartFast).unwrap();
        h.handle.settled().await.unwrap();

        let dispatcher = h.handle.dispatcher();
        h.handle.shutdown().await.unwrap();

        assert_eq!(h.events.lock().unwrap().last(), Some(&LiveEvent::Stop));
        assert!(dispatcher.dispatch(Action::StopFast).is_err());
        // The fast itself keeps running in the store
        assert!(h.store.get_active().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_zero_tick_interval_rejected() {
        let config = RuntimeConfig {
            tick_interval: Duration::ZERO,
            ..test_config()
        };
        let result = FastingRuntime::spawn(
            Arc::new(MemoryStore::new()),
            Box::new(crate::NoopPublisher),
            Arc::new(crate::SystemClock),
            config,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_duplicate_seed_goals_rejected() {
        let goal = FastingGoal::new("OMAD", 23 * 3600);
        let config = RuntimeConfig {
            seed_goals: vec![goal.clone(), goal],
            ..test_config()
        };
        let result = FastingRuntime::spawn(
            Arc::new(MemoryStore::new()),
            Box::new(crate::NoopPublisher),
            Arc::new(crate::SystemClock),
            config,
        );
        assert!(matches!(result, Err(Error::Config(msg)) if msg.contains("OMAD")));
    }
}
