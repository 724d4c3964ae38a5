use fastpath_core::{
    export_history_csv, format_hms, Action, Config, Dispatcher, FastingGoal, FastingHandle,
    FastingRuntime, FastingState, JsonStore, LiveSession, LiveStatus, LiveStatusPublisher,
    Navigation, RecordStore, Result, RuntimeConfig, SystemClock,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// How often the tray re-reads the store to pick up changes made by the CLI
const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

const ICON_IDLE: u32 = 0xFF95A5A6;
const ICON_FASTING: u32 = 0xFFF39C12;
const ICON_GOAL_REACHED: u32 = 0xFF2ECC71;

/// Menu-relevant part of the fasting state
#[derive(Clone, Debug, Default, PartialEq)]
struct TrayView {
    fasting: bool,
    goals: Vec<FastingGoal>,
    selected_goal: Option<String>,
    live_enabled: bool,
    last_error: Option<String>,
}

impl From<&FastingState> for TrayView {
    fn from(state: &FastingState) -> Self {
        Self {
            fasting: state.is_fasting(),
            goals: state.available_goals.clone(),
            selected_goal: state.selected_goal.as_ref().map(|g| g.name.clone()),
            live_enabled: state.live_enabled,
            last_error: state.last_error.clone(),
        }
    }
}

/// What the live mirror currently shows
#[derive(Clone, Debug)]
struct LiveMirror {
    session: LiveSession,
    status: LiveStatus,
}

/// Requests from menu callbacks to the main loop
#[derive(Debug)]
enum TrayCommand {
    Dispatch(Action),
    Quit,
}

struct FastpathTray {
    commands: mpsc::UnboundedSender<TrayCommand>,
    watcher_offline: Arc<AtomicBool>,
    view: TrayView,
    live: Option<LiveMirror>,
}

impl FastpathTray {
    fn dispatch(&self, action: Action) {
        if self.commands.send(TrayCommand::Dispatch(action)).is_err() {
            tracing::error!("Tray main loop is gone, dropping action");
        }
    }

    fn icon_colour(&self) -> u32 {
        match &self.live {
            Some(mirror) if mirror.status.goal_reached => ICON_GOAL_REACHED,
            Some(_) => ICON_FASTING,
            None if self.view.fasting => ICON_FASTING,
            None => ICON_IDLE,
        }
    }

    fn live_summary(&self) -> Option<String> {
        let mirror = self.live.as_ref()?;
        let goal = mirror.session.goal_name.as_deref().unwrap_or("Goal");
        if mirror.status.goal_reached {
            Some(format!(
                "{} · {} reached",
                format_hms(mirror.status.elapsed_secs),
                goal
            ))
        } else {
            Some(format!(
                "{} · {} left of {}",
                format_hms(mirror.status.elapsed_secs),
                format_hms(mirror.status.remaining_secs),
                goal
            ))
        }
    }

    fn goal_menu(&self) -> ksni::MenuItem<Self> {
        let mut options = vec![ksni::menu::RadioItem {
            label: "No goal".into(),
            ..Default::default()
        }];
        options.extend(self.view.goals.iter().map(|goal| ksni::menu::RadioItem {
            label: format!("{} ({}h)", goal.name, goal.target_duration_secs / 3600),
            ..Default::default()
        }));

        let selected = self
            .view
            .selected_goal
            .as_ref()
            .and_then(|name| self.view.goals.iter().position(|g| &g.name == name))
            .map(|index| index + 1)
            .unwrap_or(0);

        ksni::MenuItem::SubMenu(ksni::menu::SubMenu {
            label: "Goal".into(),
            submenu: vec![ksni::MenuItem::RadioGroup(ksni::menu::RadioGroup {
                selected,
                select: Box::new(|this: &mut Self, index: usize| {
                    let action = match index {
                        0 => Some(Action::ClearGoal),
                        i => this.view.goals.get(i - 1).cloned().map(Action::SelectGoal),
                    };
                    if let Some(action) = action {
                        this.dispatch(action);
                    }
                }),
                options,
            })],
            ..Default::default()
        })
    }
}

impl ksni::Tray for FastpathTray {
    fn icon_name(&self) -> String {
        // Fallback to a well-known icon so the indicator is always visible
        "appointment-soon".into()
    }

    fn icon_pixmap(&self) -> Vec<ksni::Icon> {
        vec![solid_icon(24, self.icon_colour())]
    }

    fn id(&self) -> String {
        "fastpath-tray".into()
    }

    fn title(&self) -> String {
        match self.live_summary() {
            Some(summary) => format!("FastPath {}", summary),
            None => "FastPath".into(),
        }
    }

    fn status(&self) -> ksni::Status {
        match &self.live {
            Some(mirror) if mirror.status.goal_reached => ksni::Status::NeedsAttention,
            _ => ksni::Status::Active,
        }
    }

    fn tool_tip(&self) -> ksni::ToolTip {
        let description = match (&self.view.last_error, self.live_summary()) {
            (Some(error), _) => error.clone(),
            (None, Some(summary)) => summary,
            (None, None) if self.view.fasting => "Fasting".into(),
            (None, None) => "Not fasting".into(),
        };
        ksni::ToolTip {
            icon_name: self.icon_name(),
            icon_pixmap: self.icon_pixmap(),
            title: "FastPath".into(),
            description,
        }
    }

    fn menu(&self) -> Vec<ksni::MenuItem<Self>> {
        let mut items = Vec::new();

        if let Some(error) = &self.view.last_error {
            items.push(ksni::MenuItem::Standard(ksni::menu::StandardItem {
                label: format!("⚠ {} (dismiss)", error),
                activate: Box::new(|this: &mut Self| this.dispatch(Action::DismissError)),
                ..Default::default()
            }));
            items.push(ksni::MenuItem::Separator);
        }

        let (label, action) = if self.view.fasting {
            ("Stop Fast", Action::StopFast)
        } else {
            ("Start Fast", Action::StartFast)
        };
        items.push(ksni::MenuItem::Standard(ksni::menu::StandardItem {
            label: label.into(),
            activate: Box::new(move |this: &mut Self| this.dispatch(action.clone())),
            ..Default::default()
        }));

        items.push(self.goal_menu());

        items.push(ksni::MenuItem::Checkmark(ksni::menu::CheckmarkItem {
            label: "Show Progress in Panel".into(),
            checked: self.view.live_enabled,
            activate: Box::new(|this: &mut Self| {
                let enabled = !this.view.live_enabled;
                this.dispatch(Action::SetLiveEnabled(enabled));
            }),
            ..Default::default()
        }));

        items.push(ksni::MenuItem::Standard(ksni::menu::StandardItem {
            label: "History".into(),
            activate: Box::new(|this: &mut Self| this.dispatch(Action::ShowHistory)),
            ..Default::default()
        }));

        items.push(ksni::MenuItem::Separator);
        items.push(ksni::MenuItem::Standard(ksni::menu::StandardItem {
            label: "Quit".into(),
            activate: Box::new(|this: &mut Self| {
                let _ = this.commands.send(TrayCommand::Quit);
            }),
            ..Default::default()
        }));

        items
    }

    fn watcher_online(&self) {
        self.watcher_offline.store(false, Ordering::SeqCst);
        tracing::info!("StatusNotifier watcher detected");
    }

    fn watcher_offine(&self) -> bool {
        self.watcher_offline.store(true, Ordering::SeqCst);
        tracing::warn!("StatusNotifier watcher went offline");
        true
    }
}

/// Mirrors the active fast onto the tray icon's title, tooltip and colour
struct TrayPublisher {
    handle: ksni::Handle<FastpathTray>,
    watcher_offline: Arc<AtomicBool>,
    active: bool,
}

impl LiveStatusPublisher for TrayPublisher {
    fn start(&mut self, session: &LiveSession) -> bool {
        if self.watcher_offline.load(Ordering::SeqCst) {
            tracing::info!("No StatusNotifier watcher, live mirror unavailable");
            return false;
        }

        let mirror = LiveMirror {
            session: session.clone(),
            status: LiveStatus::initial(session),
        };
        self.handle.update(move |tray: &mut FastpathTray| tray.live = Some(mirror));
        self.active = true;
        tracing::info!("Mirroring fast {} in the tray", session.session_id);
        true
    }

    fn update(&mut self, status: &LiveStatus) {
        if !self.active {
            return;
        }
        let status = *status;
        self.handle.update(move |tray: &mut FastpathTray| {
            if let Some(mirror) = tray.live.as_mut() {
                mirror.status = status;
            }
        });
    }

    fn stop(&mut self) {
        if self.active {
            self.handle.update(|tray: &mut FastpathTray| tray.live = None);
            self.active = false;
        }
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

fn solid_icon(size: i32, argb: u32) -> ksni::Icon {
    let mut data = Vec::with_capacity((size * size * 4) as usize);
    for _ in 0..(size * size) {
        data.extend_from_slice(&argb.to_be_bytes());
    }
    ksni::Icon {
        width: size,
        height: size,
        data,
    }
}

/// Push menu-relevant state changes into the tray
async fn forward_state(
    mut updates: watch::Receiver<FastingState>,
    tray: ksni::Handle<FastpathTray>,
) {
    let mut shown = TrayView::default();
    loop {
        let view = TrayView::from(&*updates.borrow_and_update());
        if view != shown {
            shown = view.clone();
            tray.update(move |t: &mut FastpathTray| t.view = view);
        }
        if updates.changed().await.is_err() {
            break;
        }
    }
}

/// Export the history next to the store and open it in the default viewer
fn show_history(state: &FastingState, data_dir: &Path) -> Result<()> {
    let csv_path = data_dir.join("history.csv");
    export_history_csv(&state.history, &csv_path)?;
    open::that(&csv_path)?;
    Ok(())
}

async fn handle_navigation(
    mut navigation: mpsc::UnboundedReceiver<Navigation>,
    states: watch::Receiver<FastingState>,
    data_dir: PathBuf,
) {
    while let Some(request) = navigation.recv().await {
        match request {
            Navigation::History => {
                let state = states.borrow().clone();
                if let Err(e) = show_history(&state, &data_dir) {
                    tracing::error!("Failed to show history: {}", e);
                }
            }
        }
    }
}

async fn refresh_periodically(dispatcher: Dispatcher) {
    let mut interval = tokio::time::interval(REFRESH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // First tick completes immediately; the initial load is dispatched separately
    interval.tick().await;
    loop {
        interval.tick().await;
        if dispatcher.dispatch(Action::LoadInitialState).is_err() {
            break;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    let data_dir = config.data.data_dir.clone();
    fastpath_core::logging::init_to_file(&data_dir.join("fastpath_tray.log"), "info");

    let (commands_tx, mut commands_rx) = mpsc::unbounded_channel();
    let watcher_offline = Arc::new(AtomicBool::new(false));

    let service = ksni::TrayService::new(FastpathTray {
        commands: commands_tx,
        watcher_offline: Arc::clone(&watcher_offline),
        view: TrayView::default(),
        live: None,
    });
    let tray = service.handle();
    service.spawn();
    tracing::info!("Tray service started");

    let publisher = TrayPublisher {
        handle: tray.clone(),
        watcher_offline,
        active: false,
    };
    let store: Arc<dyn RecordStore> = Arc::new(JsonStore::open_in(&data_dir));
    let mut handle: FastingHandle = FastingRuntime::spawn(
        store,
        Box::new(publisher),
        Arc::new(SystemClock),
        RuntimeConfig::from_config(&config),
    )?;
    handle.dispatch(Action::LoadInitialState)?;

    tokio::spawn(forward_state(handle.subscribe(), tray.clone()));
    if let Some(navigation) = handle.take_navigation() {
        tokio::spawn(handle_navigation(
            navigation,
            handle.subscribe(),
            data_dir.clone(),
        ));
    }
    tokio::spawn(refresh_periodically(handle.dispatcher()));

    loop {
        tokio::select! {
            command = commands_rx.recv() => match command {
                Some(TrayCommand::Dispatch(action)) => handle.dispatch(action)?,
                Some(TrayCommand::Quit) | None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("Shutting down tray");
    handle.shutdown().await?;
    tray.shutdown();
    Ok(())
}
