//! Per-device connection supervisor and command dispatcher.
//!
//! One [`TvDevice`] owns everything about a single TV: the live session, the
//! cached state snapshot, the deferred-command buffer, the connect critical
//! section and the bounded reconnect loop. Commands never return transport
//! errors; they resolve to a [`CmdStatus`] after the availability and retry
//! contract has run its course.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::buffer::CommandBuffer;
use crate::command::{RetryPolicy, TvCommand};
use crate::config::{ConfigStore, TvConfig};
use crate::endpoints::{self, LIVE_TV_APP_ID};
use crate::error::CmdStatus;
use crate::events::{DeviceEvent, EventEmitter};
use crate::snapshot::{PlaybackState, SourceKind, StateDelta, TvAttributes, TvSnapshot};
use crate::transport::{SessionError, SessionFactory, SessionResult, TvReport, TvSession};
use crate::wol::WakeSender;

/// Interval between reconnect attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(2);
/// Reconnect attempts before the loop gives up silently.
pub const CONNECTION_RETRIES: u32 = 20;

/// Timeout for the authoritative power-state query.
const POWER_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Age after which a stale connect guard is forcibly released.
const CONNECT_GUARD_TIMEOUT: Duration = Duration::from_secs(30);
/// Replay delay for app launches buffered while the TV was waking up.
const APP_LAUNCH_DELAY: Duration = Duration::from_secs(10);
/// Capacity of the push-subscription channels.
const PUSH_CHANNEL_CAPACITY: usize = 16;

/// Coarse power verdict from a direct query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePower {
    Off,
    Standby,
    On,
}

struct ReconnectTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Supervisor and command pipeline for one TV.
pub struct TvDevice {
    id: String,
    name: String,
    config: RwLock<TvConfig>,
    factory: Arc<dyn SessionFactory>,
    emitter: Arc<dyn EventEmitter>,
    wake: Arc<dyn WakeSender>,
    store: Option<Arc<ConfigStore>>,
    session: RwLock<Arc<dyn TvSession>>,
    snapshot: Mutex<TvSnapshot>,
    buffer: Mutex<CommandBuffer>,
    /// Timestamped connect guard: `Some` while a connect is in flight.
    connecting: Mutex<Option<Instant>>,
    available: AtomicBool,
    reconnect_retry: AtomicU32,
    retry_wakeonlan: AtomicBool,
    reconnect_task: Mutex<Option<ReconnectTask>>,
    push_tasks: Mutex<Vec<JoinHandle<()>>>,
    /// `false` while the reconnect loop runs; waiters block on `true`.
    loop_idle: watch::Sender<bool>,
}

impl TvDevice {
    pub fn new(
        config: TvConfig,
        factory: Arc<dyn SessionFactory>,
        emitter: Arc<dyn EventEmitter>,
        wake: Arc<dyn WakeSender>,
        store: Option<Arc<ConfigStore>>,
    ) -> Arc<Self> {
        let session = factory.create(&config);
        let (loop_idle, _) = watch::channel(true);
        Arc::new(Self {
            id: config.id.clone(),
            name: config.name.clone(),
            config: RwLock::new(config),
            factory,
            emitter,
            wake,
            store,
            session: RwLock::new(session),
            snapshot: Mutex::new(TvSnapshot::default()),
            buffer: Mutex::new(CommandBuffer::default()),
            connecting: Mutex::new(None),
            available: AtomicBool::new(false),
            reconnect_retry: AtomicU32::new(0),
            retry_wakeonlan: AtomicBool::new(false),
            reconnect_task: Mutex::new(None),
            push_tasks: Mutex::new(Vec::new()),
            loop_idle,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> PlaybackState {
        self.snapshot.lock().state()
    }

    pub fn attributes(&self) -> TvAttributes {
        self.snapshot.lock().attributes()
    }

    pub fn config(&self) -> TvConfig {
        self.config.read().clone()
    }

    /// Replaces the device configuration. Takes effect on the next connect.
    pub fn update_config(&self, config: TvConfig) {
        *self.config.write() = config;
    }

    fn address(&self) -> String {
        self.config.read().address.clone()
    }

    fn session(&self) -> Arc<dyn TvSession> {
        self.session.read().clone()
    }

    // ------------------------------------------------------------------
    // Connection supervisor
    // ------------------------------------------------------------------

    /// Runs one full connect attempt: fresh session, state pull, push
    /// subscriptions, buffered-command replay. Concurrent calls collapse
    /// into the in-flight attempt via the connect guard. A `Connected`
    /// event is emitted exactly once per attempt, reachable TV or not.
    pub async fn connect(self: &Arc<Self>) {
        let address = self.address();
        let Some(guard) = self.begin_connect() else {
            log::debug!("[{address}] connect already in progress");
            return;
        };
        self.emitter.emit(DeviceEvent::Connecting { device_id: self.id.clone() });

        match self.establish().await {
            Ok(()) => log::debug!("[{address}] connection established"),
            Err(err) => {
                self.available.store(false, Ordering::SeqCst);
                self.log_connectivity(&format!("unable to connect: {err}"));
                self.ensure_reconnect_loop();
            }
        }

        self.emitter.emit(DeviceEvent::Connected { device_id: self.id.clone() });
        drop(guard);
    }

    /// Claims the connect critical section. Returns `None` while another
    /// attempt is in flight, unless its guard is stale enough to have been
    /// leaked by a hung attempt.
    fn begin_connect(&self) -> Option<ConnectGuard<'_>> {
        let mut slot = self.connecting.lock();
        if let Some(started) = *slot {
            if started.elapsed() < CONNECT_GUARD_TIMEOUT {
                return None;
            }
            log::warn!(
                "[{}] connect guard held for {:?}, forcing release",
                self.address(),
                started.elapsed()
            );
        }
        *slot = Some(Instant::now());
        Some(ConnectGuard { device: self })
    }

    async fn establish(self: &Arc<Self>) -> SessionResult<()> {
        let address = self.address();
        log::debug!("[{address}] connecting");

        let session = {
            let config = self.config.read();
            self.factory.create(&config)
        };
        session.connect().await?;
        if !session.is_usable() {
            log::error!("[{address}] connect finished but the session is unusable");
            return Err(SessionError::Unusable);
        }
        *self.session.write() = session.clone();

        self.refresh_state(None).await;
        if self.config.read().mac_address.is_none() {
            self.learn_hardware_address(session.as_ref()).await;
        }
        self.register_push_subscriptions(&session).await?;

        self.available.store(true, Ordering::SeqCst);
        self.replay_buffered_commands().await;
        Ok(())
    }

    /// Folds a state report into the snapshot and emits an update when
    /// anything changed. `push` carries a report delivered by subscription;
    /// `None` pulls the session's cached report. The power flag inside the
    /// report is not trusted; a direct power query decides on/off.
    async fn refresh_state(&self, push: Option<TvReport>) {
        let session = self.session();
        let report = match push {
            Some(report) => report,
            None => session.report(),
        };
        let power_on = self.query_power_on(session.as_ref()).await;
        let delta = self.snapshot.lock().apply_report(&report, power_on);
        self.emit_delta(delta);
    }

    fn emit_delta(&self, delta: StateDelta) {
        if !delta.is_empty() {
            log::debug!("[{}] state delta: {:?}", self.address(), delta);
            self.emitter.emit(DeviceEvent::Update { device_id: self.id.clone(), delta });
        }
    }

    async fn query_power_on(&self, session: &dyn TvSession) -> bool {
        match timeout(POWER_QUERY_TIMEOUT, session.power_state()).await {
            Ok(Ok(report)) => report.state.as_deref() == Some("Active"),
            Ok(Err(err)) => {
                log::debug!("[{}] power query failed: {err}", self.address());
                false
            }
            Err(_) => {
                log::debug!("[{}] power query timed out", self.address());
                false
            }
        }
    }

    /// Asks the TV for its hardware address and persists it, so wake-on-LAN
    /// works from the second connect onwards.
    async fn learn_hardware_address(&self, session: &dyn TvSession) {
        let info = match session.request(endpoints::GET_SOFTWARE_INFO, None).await {
            Ok(info) => info,
            Err(err) => {
                log::debug!("[{}] could not read software info: {err}", self.address());
                return;
            }
        };
        let Some(mac) = info.get("device_id").and_then(|v| v.as_str()) else {
            return;
        };
        log::debug!("[{}] learned hardware address {mac}", self.address());

        let mut config = self.config.read().clone();
        config.mac_address = Some(mac.to_string());
        if let Some(store) = &self.store {
            if let Err(err) = store.update(&config) {
                log::warn!("[{}] could not persist hardware address: {err}", self.address());
                return;
            }
        }
        self.update_config(config);
    }

    async fn register_push_subscriptions(
        self: &Arc<Self>,
        session: &Arc<dyn TvSession>,
    ) -> SessionResult<()> {
        log::debug!("[{}] registering push subscriptions", self.address());
        self.abort_push_tasks();

        let (state_tx, mut state_rx) = mpsc::channel::<TvReport>(PUSH_CHANNEL_CAPACITY);
        session.subscribe_state(state_tx).await?;
        let device = Arc::clone(self);
        let state_task = tokio::spawn(async move {
            while let Some(report) = state_rx.recv().await {
                let powered = report.power_on;
                device.refresh_state(Some(report)).await;
                if !powered {
                    device.snapshot.lock().force_state(PlaybackState::Off);
                }
            }
        });

        let (sound_tx, mut sound_rx) = mpsc::channel::<String>(PUSH_CHANNEL_CAPACITY);
        session.subscribe_sound_output(sound_tx).await?;
        let device = Arc::clone(self);
        let sound_task = tokio::spawn(async move {
            while let Some(output) = sound_rx.recv().await {
                let delta = device.snapshot.lock().set_sound_output(output);
                if let Some(delta) = delta {
                    device.emit_delta(delta);
                }
            }
        });

        self.push_tasks.lock().extend([state_task, sound_task]);
        Ok(())
    }

    fn abort_push_tasks(&self) {
        for task in self.push_tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Replays everything buffered while the TV was unreachable. Expired
    /// entries were already dropped by the buffer; failed replays are
    /// logged and discarded, never re-buffered.
    async fn replay_buffered_commands(self: &Arc<Self>) {
        let commands = self.buffer.lock().drain();
        if commands.is_empty() {
            return;
        }
        log::debug!("[{}] replaying {} buffered command(s)", self.address(), commands.len());
        for command in commands {
            log::debug!("[{}] replaying {command}", self.address());
            if let Err(err) = self.execute(&command).await {
                log::warn!("[{}] buffered {command} failed: {err}", self.address());
            }
        }
    }

    /// Spawns the bounded reconnect loop unless one is already running.
    fn ensure_reconnect_loop(self: &Arc<Self>) {
        let mut slot = self.reconnect_task.lock();
        if let Some(task) = slot.as_ref() {
            if !task.handle.is_finished() {
                return;
            }
        }
        log::warn!("[{}] device is not reachable, starting reconnect loop", self.address());

        self.loop_idle.send_replace(false);
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let device = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = loop_cancel.cancelled() => {
                    log::debug!("[{}] reconnect loop cancelled", device.address());
                }
                _ = device.reconnect_loop() => {}
            }
            device.retry_wakeonlan.store(false, Ordering::SeqCst);
            device.loop_idle.send_replace(true);
            device.reconnect_task.lock().take();
        });
        *slot = Some(ReconnectTask { handle, cancel });
    }

    /// Retries [`connect`](Self::connect) every [`RETRY_INTERVAL`] until the
    /// TV is reachable and on, or [`CONNECTION_RETRIES`] attempts have been
    /// spent. Abandonment resets the counter and emits a single error event.
    async fn reconnect_loop(self: &Arc<Self>) {
        let address = self.address();
        loop {
            self.connect().await;
            if self.available() && self.state().is_on() {
                log::debug!("[{address}] reconnected");
                self.reconnect_retry.store(0, Ordering::SeqCst);
                self.retry_wakeonlan.store(false, Ordering::SeqCst);
                break;
            }

            self.snapshot.lock().force_state(PlaybackState::Off);
            let attempt = self.reconnect_retry.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > CONNECTION_RETRIES {
                log::debug!("[{address}] giving up after {CONNECTION_RETRIES} attempts");
                self.reconnect_retry.store(0, Ordering::SeqCst);
                self.emitter.emit(DeviceEvent::Error {
                    device_id: self.id.clone(),
                    message: "reconnect attempts exhausted".into(),
                });
                break;
            }

            if self.retry_wakeonlan.load(Ordering::SeqCst) {
                self.wake.wake(&self.config());
            }
            log::debug!("[{address}] not connected, retry {attempt} / {CONNECTION_RETRIES}");
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    fn cancel_reconnect_loop(&self) {
        if let Some(task) = self.reconnect_task.lock().take() {
            task.cancel.cancel();
        }
    }

    /// Tears the session down and stops all background activity for this
    /// device. Unlike a lost connection, this emits `Disconnected`.
    pub async fn disconnect(&self) {
        log::debug!("[{}] disconnecting", self.address());
        self.cancel_reconnect_loop();
        self.abort_push_tasks();
        if let Err(err) = self.session().disconnect().await {
            log::error!("[{}] error during disconnect: {err}", self.address());
        }
        self.available.store(false, Ordering::SeqCst);
        self.emitter.emit(DeviceEvent::Disconnected { device_id: self.id.clone() });
    }

    // ------------------------------------------------------------------
    // Command dispatch
    // ------------------------------------------------------------------

    /// Runs a command through the availability contract: execute directly
    /// when available, otherwise start a reconnect and either buffer the
    /// command or wait (bounded) for the loop to go idle before executing
    /// anyway.
    pub async fn dispatch(self: &Arc<Self>, policy: RetryPolicy, command: TvCommand) -> CmdStatus {
        if self.available() {
            match self.execute(&command).await {
                Ok(()) => return CmdStatus::Ok,
                Err(err) => self.log_command_failure(&command, &err),
            }
        } else {
            log::debug!("[{}] unavailable, reconnecting before {command}", self.address());
        }
        self.retry_dispatch(policy, command).await
    }

    async fn retry_dispatch(self: &Arc<Self>, policy: RetryPolicy, command: TvCommand) -> CmdStatus {
        self.ensure_reconnect_loop();

        if policy.bufferize {
            self.buffer.lock().push(command);
            return CmdStatus::Ok;
        }

        let mut idle = self.loop_idle.subscribe();
        let wait = policy
            .timeout
            .saturating_sub(Duration::from_secs(1))
            .max(Duration::from_secs(1));
        if timeout(wait, idle.wait_for(|idle| *idle)).await.is_err() {
            // the loop keeps running in the background; try our luck anyway
            self.log_connectivity(&format!("timed out waiting for reconnect before {command}"));
        }

        match self.execute(&command).await {
            Ok(()) => CmdStatus::Ok,
            Err(err) => {
                self.log_command_failure(&command, &err);
                CmdStatus::BadRequest
            }
        }
    }

    /// Executes one command against the current session.
    async fn execute(&self, command: &TvCommand) -> SessionResult<()> {
        let session = self.session();
        match command {
            TvCommand::PowerOn => {
                session.request(endpoints::POWER_ON, None).await.map(drop)
            }
            TvCommand::PowerOff => {
                session.request(endpoints::POWER_OFF, None).await?;
                self.snapshot.lock().force_state(PlaybackState::Off);
                Ok(())
            }
            TvCommand::SetVolume(volume) => {
                session
                    .request(endpoints::SET_VOLUME, Some(json!({ "volume": volume })))
                    .await?;
                self.emit_delta(StateDelta { volume: Some(*volume), ..StateDelta::default() });
                Ok(())
            }
            TvCommand::VolumeUp => session.request(endpoints::VOLUME_UP, None).await.map(drop),
            TvCommand::VolumeDown => session.request(endpoints::VOLUME_DOWN, None).await.map(drop),
            TvCommand::SetMute(muted) => session
                .request(endpoints::SET_MUTE, Some(json!({ "mute": muted })))
                .await
                .map(drop),
            TvCommand::Play => {
                self.snapshot.lock().set_paused(false);
                session.request(endpoints::MEDIA_PLAY, None).await.map(drop)
            }
            TvCommand::Pause => {
                self.snapshot.lock().set_paused(true);
                session.request(endpoints::MEDIA_PAUSE, None).await.map(drop)
            }
            TvCommand::Stop => session.request(endpoints::MEDIA_STOP, None).await.map(drop),
            TvCommand::Next => {
                let endpoint = if self.live_tv_active() {
                    endpoints::CHANNEL_UP
                } else {
                    endpoints::MEDIA_FAST_FORWARD
                };
                session.request(endpoint, None).await.map(drop)
            }
            TvCommand::Previous => {
                let endpoint = if self.live_tv_active() {
                    endpoints::CHANNEL_DOWN
                } else {
                    endpoints::MEDIA_REWIND
                };
                session.request(endpoint, None).await.map(drop)
            }
            TvCommand::SelectSource { name, delay } => {
                self.execute_select_source(name, *delay, session.as_ref()).await
            }
            TvCommand::SelectSoundOutput { output } => session
                .request(endpoints::CHANGE_SOUND_OUTPUT, Some(json!({ "output": output })))
                .await
                .map(drop),
            TvCommand::Button(name) => session.button(name).await,
            TvCommand::ScreenOn { webos_ver } => {
                self.execute_screen(true, webos_ver, session.as_ref()).await
            }
            TvCommand::ScreenOff { webos_ver } => {
                self.execute_screen(false, webos_ver, session.as_ref()).await
            }
        }
    }

    fn live_tv_active(&self) -> bool {
        self.snapshot.lock().current_app_id() == Some(LIVE_TV_APP_ID)
    }

    async fn execute_select_source(
        &self,
        name: &str,
        delay: Duration,
        session: &dyn TvSession,
    ) -> SessionResult<()> {
        if !delay.is_zero() {
            // the TV needs a moment after waking before it accepts launches
            tokio::time::sleep(delay).await;
        }
        let entry = {
            let snapshot = self.snapshot.lock();
            if !snapshot.state().is_on() || snapshot.sources_empty() {
                return Err(SessionError::NotConnected);
            }
            match snapshot.source(name) {
                Some(entry) => entry.clone(),
                None => {
                    log::warn!("[{}] unknown source {name}", self.address());
                    return Err(SessionError::Request(
                        "select_source".into(),
                        format!("unknown source {name}"),
                    ));
                }
            }
        };
        match entry.kind {
            SourceKind::Application => session
                .request(endpoints::LAUNCH_APP, Some(json!({ "id": entry.id })))
                .await
                .map(drop),
            SourceKind::Input => session
                .request(endpoints::SET_INPUT, Some(json!({ "inputId": entry.id })))
                .await
                .map(drop),
        }
    }

    async fn execute_screen(
        &self,
        on: bool,
        webos_ver: &str,
        session: &dyn TvSession,
    ) -> SessionResult<()> {
        let endpoint = endpoints::screen_endpoint(on, webos_ver).ok_or_else(|| {
            SessionError::Request("screen".into(), format!("unsupported webOS version {webos_ver}"))
        })?;
        session
            .request(endpoint, Some(json!({ "standbyMode": "active" })))
            .await
            .map(drop)
    }

    /// Off, or no power verdict yet. A fresh handle has never seen the TV,
    /// so its connectivity noise is as routine as a sleeping TV's.
    fn presumed_off(&self) -> bool {
        matches!(self.state(), PlaybackState::Off | PlaybackState::Unknown)
    }

    /// Connectivity failures while the TV is presumed off are routine and
    /// logged at debug; anything else is an error.
    fn log_command_failure(&self, command: &TvCommand, err: &SessionError) {
        if self.presumed_off() && err.is_connectivity() {
            log::debug!("[{}] {command} failed: {err}", self.address());
        } else {
            log::error!("[{}] {command} failed: {err}", self.address());
        }
    }

    fn log_connectivity(&self, message: &str) {
        if self.presumed_off() {
            log::debug!("[{}] {message}", self.address());
        } else {
            log::warn!("[{}] {message}", self.address());
        }
    }

    // ------------------------------------------------------------------
    // Public commands
    // ------------------------------------------------------------------

    /// Wakes the TV: magic packets now and on every reconnect retry, a
    /// buffered power-on for replay, a background power check, and a
    /// best-effort direct power-on in case the session is still alive.
    pub async fn power_on(self: &Arc<Self>) -> CmdStatus {
        let config = self.config();
        log::debug!(
            "[{}] power on, waking {:?} / {:?}",
            config.address,
            config.mac_address,
            config.mac_address2
        );
        self.wake.wake(&config);
        self.retry_wakeonlan.store(true, Ordering::SeqCst);
        self.buffer.lock().push(TvCommand::PowerOn);

        let device = Arc::clone(self);
        tokio::spawn(async move {
            device.check_power().await;
        });

        if let Err(err) = self.execute(&TvCommand::PowerOn).await {
            self.log_command_failure(&TvCommand::PowerOn, &err);
        }
        CmdStatus::Ok
    }

    /// Turns the TV off. A TV that is already off, in standby or not
    /// answering gets nothing: a deferred turnOff would only land after the
    /// next wake and switch the TV straight back off.
    pub async fn power_off(self: &Arc<Self>) -> CmdStatus {
        log::debug!("[{}] power off", self.address());
        self.retry_wakeonlan.store(false, Ordering::SeqCst);
        match self.check_power().await {
            DevicePower::On => self.dispatch(RetryPolicy::default(), TvCommand::PowerOff).await,
            state => {
                log::debug!("[{}] TV is already off ({state:?})", self.address());
                CmdStatus::Ok
            }
        }
    }

    pub async fn power_toggle(self: &Arc<Self>) -> CmdStatus {
        match self.check_power().await {
            DevicePower::On => self.power_off().await,
            DevicePower::Standby | DevicePower::Off => self.power_on().await,
        }
    }

    /// Queries the TV's power state directly, starting a reconnect loop
    /// when the TV turns out to be unreachable.
    pub async fn check_power(self: &Arc<Self>) -> DevicePower {
        let session = self.session();
        let power = match timeout(POWER_QUERY_TIMEOUT, session.power_state()).await {
            Ok(Ok(report)) => match report.state.as_deref() {
                Some("Active") => DevicePower::On,
                Some("Active Standby") | Some("Suspend") | Some("Power Off") => DevicePower::Standby,
                None | Some("Unknown") => {
                    // older firmwares never answer; fall back to the cached app
                    if self.snapshot.lock().current_app_id().is_some() {
                        DevicePower::On
                    } else {
                        DevicePower::Off
                    }
                }
                Some(other) => {
                    log::debug!("[{}] unrecognized power state {other}", self.address());
                    DevicePower::On
                }
            },
            Ok(Err(err)) => {
                log::debug!("[{}] power query failed: {err}", self.address());
                DevicePower::Off
            }
            Err(_) => {
                log::debug!("[{}] power query timed out", self.address());
                DevicePower::Off
            }
        };
        log::debug!("[{}] power check: {:?}", self.address(), power);
        if power == DevicePower::Off {
            self.ensure_reconnect_loop();
        }
        power
    }

    /// Sets the absolute volume. Values above 100 are rejected before any
    /// transport contact.
    pub async fn set_volume(self: &Arc<Self>, volume: Option<u8>) -> CmdStatus {
        let Some(volume) = volume.filter(|v| *v <= 100) else {
            return CmdStatus::BadRequest;
        };
        self.dispatch(RetryPolicy::default(), TvCommand::SetVolume(volume)).await
    }

    pub async fn volume_up(self: &Arc<Self>) -> CmdStatus {
        self.dispatch(RetryPolicy::default(), TvCommand::VolumeUp).await
    }

    pub async fn volume_down(self: &Arc<Self>) -> CmdStatus {
        self.dispatch(RetryPolicy::default(), TvCommand::VolumeDown).await
    }

    pub async fn set_mute(self: &Arc<Self>, muted: bool) -> CmdStatus {
        self.dispatch(RetryPolicy::default(), TvCommand::SetMute(muted)).await
    }

    pub async fn play(self: &Arc<Self>) -> CmdStatus {
        self.dispatch(RetryPolicy::default(), TvCommand::Play).await
    }

    pub async fn pause(self: &Arc<Self>) -> CmdStatus {
        self.dispatch(RetryPolicy::default(), TvCommand::Pause).await
    }

    pub async fn play_pause(self: &Arc<Self>) -> CmdStatus {
        if self.snapshot.lock().paused() {
            self.play().await
        } else {
            self.pause().await
        }
    }

    pub async fn stop(self: &Arc<Self>) -> CmdStatus {
        self.dispatch(RetryPolicy::default(), TvCommand::Stop).await
    }

    /// Next channel while watching Live TV, fast-forward otherwise.
    pub async fn next(self: &Arc<Self>) -> CmdStatus {
        self.dispatch(RetryPolicy::default(), TvCommand::Next).await
    }

    /// Previous channel while watching Live TV, rewind otherwise.
    pub async fn previous(self: &Arc<Self>) -> CmdStatus {
        self.dispatch(RetryPolicy::default(), TvCommand::Previous).await
    }

    /// Presses a named remote-control button.
    pub async fn button(self: &Arc<Self>, name: &str) -> CmdStatus {
        self.dispatch(RetryPolicy::default(), TvCommand::Button(name.to_string())).await
    }

    pub async fn turn_screen_on(self: &Arc<Self>, webos_ver: &str) -> CmdStatus {
        if endpoints::screen_endpoint(true, webos_ver).is_none() {
            return CmdStatus::BadRequest;
        }
        self.dispatch(
            RetryPolicy::default(),
            TvCommand::ScreenOn { webos_ver: webos_ver.to_string() },
        )
        .await
    }

    pub async fn turn_screen_off(self: &Arc<Self>, webos_ver: &str) -> CmdStatus {
        if endpoints::screen_endpoint(false, webos_ver).is_none() {
            return CmdStatus::BadRequest;
        }
        self.dispatch(
            RetryPolicy::default(),
            TvCommand::ScreenOff { webos_ver: webos_ver.to_string() },
        )
        .await
    }

    /// Switches to a named source. An unknown name on a reachable TV is
    /// rejected outright; a connectivity failure wakes the TV and buffers
    /// the switch for replay, with an extra delay for app launches.
    pub async fn select_source(self: &Arc<Self>, source: Option<&str>) -> CmdStatus {
        let Some(name) = source.filter(|s| !s.is_empty()) else {
            return CmdStatus::BadRequest;
        };
        let command = TvCommand::SelectSource { name: name.to_string(), delay: Duration::ZERO };
        match self.execute(&command).await {
            Ok(()) => CmdStatus::Ok,
            Err(SessionError::Request(..)) => CmdStatus::BadRequest,
            Err(err) => {
                self.log_command_failure(&command, &err);
                self.power_on().await;
                let delay = {
                    let snapshot = self.snapshot.lock();
                    match snapshot.source(name) {
                        Some(entry) if entry.kind == SourceKind::Application => APP_LAUNCH_DELAY,
                        _ => Duration::ZERO,
                    }
                };
                log::info!("[{}] buffered select_source({name}) until the TV wakes", self.address());
                self.buffer.lock().push(TvCommand::SelectSource { name: name.to_string(), delay });
                self.ensure_reconnect_loop();
                CmdStatus::Ok
            }
        }
    }

    /// Switches to the next physical input, in name order.
    pub async fn select_source_next(self: &Arc<Self>) -> CmdStatus {
        let next = {
            let snapshot = self.snapshot.lock();
            let inputs = snapshot.inputs();
            if inputs.is_empty() {
                log::error!("[{}] input list not loaded yet", self.address());
                return CmdStatus::ServiceUnavailable;
            }
            let position = snapshot
                .active_source()
                .and_then(|active| inputs.iter().position(|i| i.name == active));
            let index = match position {
                Some(i) => (i + 1) % inputs.len(),
                None => 0,
            };
            inputs[index].name.clone()
        };
        self.select_source(Some(&next)).await
    }

    /// Switches the sound output, taking a display name from
    /// [`endpoints::sound_output_names`]. Same wake-and-buffer fallback as
    /// [`select_source`](Self::select_source).
    pub async fn select_sound_output(self: &Arc<Self>, mode: Option<&str>) -> CmdStatus {
        let Some(mode) = mode else {
            return CmdStatus::BadRequest;
        };
        let Some(output) = endpoints::sound_output_id(mode) else {
            log::debug!("[{}] invalid sound output {mode}", self.address());
            return CmdStatus::BadRequest;
        };
        let command = TvCommand::SelectSoundOutput { output: output.to_string() };
        match self.execute(&command).await {
            Ok(()) => CmdStatus::Ok,
            Err(err) => {
                self.log_command_failure(&command, &err);
                self.power_on().await;
                log::info!(
                    "[{}] buffered select_sound_output({mode}) until the TV wakes",
                    self.address()
                );
                self.buffer.lock().push(command);
                self.ensure_reconnect_loop();
                CmdStatus::Ok
            }
        }
    }
}

struct ConnectGuard<'a> {
    device: &'a TvDevice,
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        *self.device.connecting.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{AppInfo, InputInfo, PowerReport};
    use serde_json::Value;

    #[derive(Default)]
    struct MockState {
        connect_calls: AtomicU32,
        fail_connects: AtomicU32,
        concurrent: AtomicU32,
        max_concurrent: AtomicU32,
        connected: AtomicBool,
        power_active: AtomicBool,
        report: Mutex<TvReport>,
        requests: Mutex<Vec<(String, Option<Value>)>>,
        state_tx: Mutex<Option<mpsc::Sender<TvReport>>>,
    }

    struct MockSession {
        state: Arc<MockState>,
    }

    #[async_trait::async_trait]
    impl TvSession for MockSession {
        async fn connect(&self) -> SessionResult<()> {
            self.state.connect_calls.fetch_add(1, Ordering::SeqCst);
            let now = self.state.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.state.max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.state.concurrent.fetch_sub(1, Ordering::SeqCst);

            if self.state.fail_connects.load(Ordering::SeqCst) > 0 {
                self.state.fail_connects.fetch_sub(1, Ordering::SeqCst);
                return Err(SessionError::Connect("mock refused".into()));
            }
            self.state.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> SessionResult<()> {
            self.state.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_usable(&self) -> bool {
            self.state.connected.load(Ordering::SeqCst)
        }

        async fn request(&self, endpoint: &str, payload: Option<Value>) -> SessionResult<Value> {
            if !self.state.connected.load(Ordering::SeqCst) {
                return Err(SessionError::NotConnected);
            }
            self.state.requests.lock().push((endpoint.to_string(), payload));
            if endpoint == endpoints::GET_SOFTWARE_INFO {
                return Ok(json!({ "device_id": "aa:bb:cc:dd:ee:ff" }));
            }
            Ok(json!({}))
        }

        async fn button(&self, name: &str) -> SessionResult<()> {
            self.request("button", Some(json!({ "name": name }))).await.map(drop)
        }

        async fn power_state(&self) -> SessionResult<PowerReport> {
            let state = if self.state.power_active.load(Ordering::SeqCst) {
                "Active"
            } else {
                "Power Off"
            };
            Ok(PowerReport { state: Some(state.to_string()) })
        }

        fn report(&self) -> TvReport {
            self.state.report.lock().clone()
        }

        async fn subscribe_state(&self, tx: mpsc::Sender<TvReport>) -> SessionResult<()> {
            *self.state.state_tx.lock() = Some(tx);
            Ok(())
        }

        async fn subscribe_sound_output(&self, _tx: mpsc::Sender<String>) -> SessionResult<()> {
            Ok(())
        }
    }

    struct MockFactory {
        state: Arc<MockState>,
    }

    impl SessionFactory for MockFactory {
        fn create(&self, _config: &TvConfig) -> Arc<dyn TvSession> {
            Arc::new(MockSession { state: Arc::clone(&self.state) })
        }
    }

    #[derive(Default)]
    struct RecordingEmitter {
        events: Mutex<Vec<DeviceEvent>>,
    }

    impl EventEmitter for RecordingEmitter {
        fn emit(&self, event: DeviceEvent) {
            self.events.lock().push(event);
        }
    }

    impl RecordingEmitter {
        fn count(&self, matcher: impl Fn(&DeviceEvent) -> bool) -> usize {
            self.events.lock().iter().filter(|e| matcher(e)).count()
        }
    }

    #[derive(Default)]
    struct CountingWake {
        calls: AtomicU32,
    }

    impl WakeSender for CountingWake {
        fn wake(&self, _config: &TvConfig) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn sample_report() -> TvReport {
        TvReport {
            power_on: true,
            volume: Some(7),
            muted: false,
            current_app_id: Some("com.webos.app.hdmi1".into()),
            apps: vec![AppInfo {
                id: "netflix".into(),
                title: "Netflix".into(),
                ..AppInfo::default()
            }],
            inputs: vec![
                InputInfo {
                    id: "HDMI1".into(),
                    app_id: "com.webos.app.hdmi1".into(),
                    label: "HDMI 1".into(),
                },
                InputInfo {
                    id: "HDMI2".into(),
                    app_id: "com.webos.app.hdmi2".into(),
                    label: "HDMI 2".into(),
                },
            ],
            channel_name: None,
            sound_output: None,
        }
    }

    fn make_device(
        state: &Arc<MockState>,
    ) -> (Arc<TvDevice>, Arc<RecordingEmitter>, Arc<CountingWake>) {
        let emitter = Arc::new(RecordingEmitter::default());
        let wake = Arc::new(CountingWake::default());
        let config = TvConfig { id: "tv-1".into(), ..TvConfig::new("Test TV", "10.0.0.5") };
        let device = TvDevice::new(
            config,
            Arc::new(MockFactory { state: Arc::clone(state) }),
            emitter.clone(),
            wake.clone(),
            None,
        );
        (device, emitter, wake)
    }

    async fn wait_loop_idle(device: &Arc<TvDevice>) {
        let mut idle = device.loop_idle.subscribe();
        timeout(Duration::from_secs(600), idle.wait_for(|idle| *idle))
            .await
            .expect("reconnect loop never went idle")
            .expect("loop_idle sender dropped");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_connects_collapse_into_one() {
        let state = Arc::new(MockState::default());
        state.power_active.store(true, Ordering::SeqCst);
        *state.report.lock() = sample_report();
        let (device, _, _) = make_device(&state);

        tokio::join!(device.connect(), device.connect());

        assert_eq!(state.connect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.max_concurrent.load(Ordering::SeqCst), 1);
        assert!(device.available());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_connect_guard_is_force_released() {
        let state = Arc::new(MockState::default());
        state.power_active.store(true, Ordering::SeqCst);
        let (device, _, _) = make_device(&state);

        *device.connecting.lock() =
            Some(Instant::now() - CONNECT_GUARD_TIMEOUT - Duration::from_secs(1));
        device.connect().await;
        assert_eq!(state.connect_calls.load(Ordering::SeqCst), 1);

        *device.connecting.lock() = Some(Instant::now());
        device.connect().await;
        assert_eq!(state.connect_calls.load(Ordering::SeqCst), 1, "fresh guard must block");
    }

    #[tokio::test(start_paused = true)]
    async fn buffered_commands_replay_in_order_exactly_once() {
        let state = Arc::new(MockState::default());
        state.power_active.store(true, Ordering::SeqCst);
        *state.report.lock() = sample_report();
        let (device, _, _) = make_device(&state);

        assert_eq!(
            device.dispatch(RetryPolicy::buffered(), TvCommand::PowerOn).await,
            CmdStatus::Ok
        );
        assert_eq!(
            device.dispatch(RetryPolicy::buffered(), TvCommand::SetVolume(10)).await,
            CmdStatus::Ok
        );
        assert_eq!(
            device.dispatch(RetryPolicy::buffered(), TvCommand::SetMute(true)).await,
            CmdStatus::Ok
        );
        assert!(device.buffer.lock().contains(&TvCommand::SetVolume(10)));

        wait_loop_idle(&device).await;

        let requests = state.requests.lock().clone();
        let endpoints_only: Vec<&str> = requests.iter().map(|(e, _)| e.as_str()).collect();
        assert_eq!(
            endpoints_only,
            vec![
                endpoints::GET_SOFTWARE_INFO,
                endpoints::POWER_ON,
                endpoints::SET_VOLUME,
                endpoints::SET_MUTE,
            ]
        );
        assert!(device.buffer.lock().is_empty());
        assert!(device.available());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_loop_gives_up_after_retry_ceiling() {
        let state = Arc::new(MockState::default());
        state.fail_connects.store(u32::MAX, Ordering::SeqCst);
        let (device, emitter, _) = make_device(&state);

        device.connect().await;
        wait_loop_idle(&device).await;

        // one direct attempt plus the loop's bounded retries
        assert_eq!(state.connect_calls.load(Ordering::SeqCst), 2 + CONNECTION_RETRIES);
        assert_eq!(device.reconnect_retry.load(Ordering::SeqCst), 0);
        assert_eq!(emitter.count(|e| matches!(e, DeviceEvent::Error { .. })), 1);

        // abandonment is final: no further attempts without a new trigger
        let calls = state.connect_calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(state.connect_calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn select_source_while_off_wakes_buffers_and_replays() {
        let state = Arc::new(MockState::default());
        state.fail_connects.store(2, Ordering::SeqCst);
        state.power_active.store(true, Ordering::SeqCst);
        *state.report.lock() = sample_report();
        let (device, emitter, wake) = make_device(&state);

        assert_eq!(device.select_source(Some("HDMI1")).await, CmdStatus::Ok);
        assert!(device.buffer.lock().contains(&TvCommand::PowerOn));

        wait_loop_idle(&device).await;

        // one wake from power_on plus one per failed retry
        assert_eq!(wake.calls.load(Ordering::SeqCst), 3);
        let requests = state.requests.lock().clone();
        let switch = requests
            .iter()
            .find(|(e, _)| e == endpoints::SET_INPUT)
            .expect("buffered source switch never replayed");
        assert_eq!(switch.1.as_ref().unwrap()["inputId"], "HDMI1");

        assert!(device.available());
        assert!(device.buffer.lock().is_empty());
        assert!(!device.retry_wakeonlan.load(Ordering::SeqCst));
        let source_updates = emitter.count(|e| {
            matches!(e, DeviceEvent::Update { delta, .. } if delta.source.as_deref() == Some("HDMI1"))
        });
        assert!(source_updates >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_volume_rejected_without_transport_contact() {
        let state = Arc::new(MockState::default());
        let (device, _, _) = make_device(&state);

        assert_eq!(device.set_volume(Some(150)).await, CmdStatus::BadRequest);
        assert_eq!(device.set_volume(None).await, CmdStatus::BadRequest);

        assert_eq!(state.connect_calls.load(Ordering::SeqCst), 0);
        assert!(state.requests.lock().is_empty());
        assert!(device.buffer.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_source_on_reachable_tv_is_rejected() {
        let state = Arc::new(MockState::default());
        state.power_active.store(true, Ordering::SeqCst);
        *state.report.lock() = sample_report();
        let (device, _, wake) = make_device(&state);
        device.connect().await;

        assert_eq!(device.select_source(Some("Betamax")).await, CmdStatus::BadRequest);
        assert_eq!(wake.calls.load(Ordering::SeqCst), 0);
        assert!(device.buffer.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_events_for_connect_and_disconnect() {
        let state = Arc::new(MockState::default());
        state.power_active.store(true, Ordering::SeqCst);
        *state.report.lock() = sample_report();
        let (device, emitter, _) = make_device(&state);

        device.connect().await;
        assert_eq!(emitter.count(|e| matches!(e, DeviceEvent::Connecting { .. })), 1);
        assert_eq!(emitter.count(|e| matches!(e, DeviceEvent::Connected { .. })), 1);

        device.disconnect().await;
        assert_eq!(emitter.count(|e| matches!(e, DeviceEvent::Disconnected { .. })), 1);
        assert!(!device.available());
    }

    #[tokio::test(start_paused = true)]
    async fn hardware_address_learned_on_first_connect() {
        let state = Arc::new(MockState::default());
        state.power_active.store(true, Ordering::SeqCst);
        *state.report.lock() = sample_report();
        let (device, _, _) = make_device(&state);

        device.connect().await;
        assert_eq!(device.config().mac_address.as_deref(), Some("aa:bb:cc:dd:ee:ff"));

        // a second connect must not re-query
        let queries = |s: &MockState| {
            s.requests
                .lock()
                .iter()
                .filter(|(e, _)| e == endpoints::GET_SOFTWARE_INFO)
                .count()
        };
        assert_eq!(queries(&state), 1);
        device.connect().await;
        assert_eq!(queries(&state), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pushed_report_updates_snapshot() {
        let state = Arc::new(MockState::default());
        state.power_active.store(true, Ordering::SeqCst);
        *state.report.lock() = sample_report();
        let (device, emitter, _) = make_device(&state);
        device.connect().await;

        let mut report = sample_report();
        report.volume = Some(42);
        let tx = state.state_tx.lock().clone().expect("state subscription not registered");
        tx.send(report).await.unwrap();

        let mut seen = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if emitter.count(
                |e| matches!(e, DeviceEvent::Update { delta, .. } if delta.volume == Some(42)),
            ) > 0
            {
                seen = true;
                break;
            }
        }
        assert!(seen, "pushed volume change never surfaced");
    }

    #[tokio::test(start_paused = true)]
    async fn select_source_next_cycles_inputs() {
        let state = Arc::new(MockState::default());
        state.power_active.store(true, Ordering::SeqCst);
        *state.report.lock() = sample_report();
        let (device, _, _) = make_device(&state);
        device.connect().await;

        // active source is HDMI1, so the next input is HDMI2
        assert_eq!(device.select_source_next().await, CmdStatus::Ok);
        let requests = state.requests.lock().clone();
        let last_switch = requests
            .iter()
            .rev()
            .find(|(e, _)| e == endpoints::SET_INPUT)
            .unwrap()
            .1
            .clone()
            .unwrap();
        assert_eq!(last_switch["inputId"], "HDMI2");
    }

    #[tokio::test(start_paused = true)]
    async fn select_source_next_without_inputs_is_unavailable() {
        let state = Arc::new(MockState::default());
        let (device, _, _) = make_device(&state);
        assert_eq!(device.select_source_next().await, CmdStatus::ServiceUnavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn screen_commands_reject_unknown_webos_version() {
        let state = Arc::new(MockState::default());
        let (device, _, _) = make_device(&state);
        assert_eq!(device.turn_screen_on("3").await, CmdStatus::BadRequest);
        assert!(state.requests.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sound_output_takes_display_names_only() {
        let state = Arc::new(MockState::default());
        state.power_active.store(true, Ordering::SeqCst);
        *state.report.lock() = sample_report();
        let (device, _, _) = make_device(&state);
        device.connect().await;

        assert_eq!(device.select_sound_output(None).await, CmdStatus::BadRequest);
        assert_eq!(device.select_sound_output(Some("tv_speaker")).await, CmdStatus::BadRequest);
        assert_eq!(
            device.select_sound_output(Some("Internal TV speaker")).await,
            CmdStatus::Ok
        );
        let requests = state.requests.lock().clone();
        let change = requests.iter().find(|(e, _)| e == endpoints::CHANGE_SOUND_OUTPUT).unwrap();
        assert_eq!(change.1.as_ref().unwrap()["output"], "tv_speaker");
    }

    #[tokio::test(start_paused = true)]
    async fn power_off_on_sleeping_tv_is_a_no_op() {
        let state = Arc::new(MockState::default());
        *state.report.lock() = sample_report();
        let (device, _, _) = make_device(&state);

        // TV answers "Power Off": nothing to send, nothing to defer
        assert_eq!(device.power_off().await, CmdStatus::Ok);
        assert!(device.buffer.lock().is_empty());
        assert!(state.requests.lock().is_empty());

        // waking the TV afterwards must not replay a stale turn-off
        state.power_active.store(true, Ordering::SeqCst);
        assert_eq!(device.power_on().await, CmdStatus::Ok);
        device.connect().await;

        let requests = state.requests.lock().clone();
        assert!(requests.iter().all(|(e, _)| e != endpoints::POWER_OFF));
        assert!(requests.iter().any(|(e, _)| e == endpoints::POWER_ON));
    }

    #[tokio::test(start_paused = true)]
    async fn handle_without_power_verdict_is_presumed_off() {
        let state = Arc::new(MockState::default());
        state.power_active.store(true, Ordering::SeqCst);
        *state.report.lock() = sample_report();
        let (device, _, _) = make_device(&state);

        assert_eq!(device.state(), PlaybackState::Unknown);
        assert!(device.presumed_off());

        device.connect().await;
        assert!(!device.presumed_off());

        device.snapshot.lock().force_state(PlaybackState::Off);
        assert!(device.presumed_off());
    }
}
