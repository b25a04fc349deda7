//! Script status relay over a long-lived Electrum connection.
//!
//! `electrum_client::Client` is `!Send`, so the relay owns its client on a
//! dedicated thread and takes requests over an unbounded channel. Every
//! watched script gets its current status on registration and again
//! whenever the server pushes a change.

use std::collections::HashMap;
use std::time::Duration;

use electrum_client::{ElectrumApi, ScriptStatus};
use lwk_wollet::bitcoin::ScriptBuf;
use lwk_wollet::elements::Script;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::chain::{script_hash, StatusCallback};
use crate::error::{Error, Result};

/// Requests accepted by the relay thread.
pub enum WatchRequest {
    Watch {
        script: Script,
        callback: StatusCallback,
    },
    Unwatch {
        script: Script,
    },
    Stop,
}

impl std::fmt::Debug for WatchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchRequest::Watch { script, .. } => write!(f, "Watch({})", script_hash(script)),
            WatchRequest::Unwatch { script } => write!(f, "Unwatch({})", script_hash(script)),
            WatchRequest::Stop => f.write_str("Stop"),
        }
    }
}

/// Connection and tip changes seen by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    Tip { height: u32 },
    Disconnected,
    Resumed,
}

#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub electrum_url: String,
    /// Delay between notification sweeps.
    pub poll_every: Duration,
    /// Ceiling for the reconnect delay, which doubles from one second.
    pub backoff_cap: Duration,
}

impl WatcherSettings {
    pub fn new(electrum_url: &str) -> Self {
        Self {
            electrum_url: electrum_url.to_string(),
            poll_every: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
        }
    }
}

/// Cloneable sender side of a running relay.
#[derive(Clone)]
pub struct WatcherHandle {
    requests: UnboundedSender<WatchRequest>,
}

impl WatcherHandle {
    pub fn watch(&self, script: Script, callback: StatusCallback) -> Result<()> {
        self.send(WatchRequest::Watch { script, callback })
    }

    pub fn unwatch(&self, script: Script) -> Result<()> {
        self.send(WatchRequest::Unwatch { script })
    }

    /// Ask the relay to exit. A relay that already stopped is fine.
    pub fn stop(&self) {
        let _ = self.requests.send(WatchRequest::Stop);
    }

    fn send(&self, request: WatchRequest) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| Error::Transport("script watcher has stopped".into()))
    }
}

/// Start a relay thread for `settings.electrum_url`.
pub fn spawn_watcher(
    settings: WatcherSettings,
) -> std::io::Result<(WatcherHandle, UnboundedReceiver<WatcherEvent>)> {
    let (request_tx, requests) = unbounded_channel();
    let (events, event_rx) = unbounded_channel();
    let relay = Relay {
        settings,
        requests,
        events,
        watched: HashMap::new(),
        tip: None,
    };
    std::thread::Builder::new()
        .name("script-watcher".into())
        .spawn(move || relay.run())?;
    Ok((
        WatcherHandle {
            requests: request_tx,
        },
        event_rx,
    ))
}

struct Watched {
    script_hash: String,
    callback: StatusCallback,
    status: Option<String>,
    /// Subscribed on the current connection.
    live: bool,
}

impl Watched {
    fn new(script: &Script, callback: StatusCallback) -> Self {
        Self {
            script_hash: script_hash(script),
            callback,
            status: None,
            live: false,
        }
    }

    fn report(&mut self, status: Option<String>) {
        self.status = status.clone();
        (self.callback)(self.script_hash.clone(), status);
    }
}

fn status_hex(status: ScriptStatus) -> String {
    hex::encode(*status)
}

enum Flow {
    Continue,
    Stop,
}

fn electrum_script(script: &Script) -> ScriptBuf {
    ScriptBuf::from(script.to_bytes())
}

struct Relay {
    settings: WatcherSettings,
    requests: UnboundedReceiver<WatchRequest>,
    events: UnboundedSender<WatcherEvent>,
    watched: HashMap<Script, Watched>,
    tip: Option<u32>,
}

impl Relay {
    fn run(mut self) {
        let Some(mut client) = self.connect() else {
            return;
        };
        log::info!("script watcher connected to {}", self.settings.electrum_url);

        loop {
            if let Flow::Stop = self.drain(&client) {
                return;
            }

            // A ping also flushes notifications the server queued for us.
            let alive = client
                .raw_call("server.ping", Vec::<electrum_client::Param>::new())
                .is_ok();
            if !alive {
                log::warn!("script watcher lost {}", self.settings.electrum_url);
                self.watched.values_mut().for_each(|w| w.live = false);
                client = match self.connect() {
                    Some(client) => client,
                    None => return,
                };
                let _ = self.events.send(WatcherEvent::Resumed);
                continue;
            }

            self.poll_tip(&client);
            self.poll_scripts(&client);
            std::thread::sleep(self.settings.poll_every);
        }
    }

    /// Connect with doubling delays, then re-establish every subscription.
    /// `None` when a stop request arrives while offline.
    fn connect(&mut self) -> Option<electrum_client::Client> {
        let mut delay = Duration::from_secs(1);
        let client = loop {
            match electrum_client::Client::new(&self.settings.electrum_url) {
                Ok(client) => break client,
                Err(e) => {
                    log::warn!("script watcher cannot connect ({e}), next try in {delay:?}");
                    let _ = self.events.send(WatcherEvent::Disconnected);
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(self.settings.backoff_cap);
                    while let Ok(request) = self.requests.try_recv() {
                        if let Flow::Stop = self.absorb_offline(request) {
                            log::info!("script watcher stopped while offline");
                            return None;
                        }
                    }
                }
            }
        };

        // Liquid headers do not parse as Bitcoin headers, hence the raw call.
        if let Err(e) = client.block_headers_subscribe_raw() {
            log::warn!("script watcher header subscription failed: {e}");
        }
        self.resync(&client);
        Some(client)
    }

    fn absorb_offline(&mut self, request: WatchRequest) -> Flow {
        match request {
            WatchRequest::Watch { script, callback } => {
                let watched = Watched::new(&script, callback);
                self.watched.insert(script, watched);
                Flow::Continue
            }
            WatchRequest::Unwatch { script } => {
                self.watched.remove(&script);
                Flow::Continue
            }
            WatchRequest::Stop => Flow::Stop,
        }
    }

    /// Subscribe everything not live yet. Callers hear about statuses that
    /// moved while the connection was down, and about first statuses.
    fn resync(&mut self, client: &electrum_client::Client) {
        for (script, watched) in self.watched.iter_mut() {
            match client.script_subscribe(&electrum_script(script)) {
                Ok(status) => {
                    let status = status.map(status_hex);
                    let first = !watched.live;
                    watched.live = true;
                    if first || status != watched.status {
                        watched.report(status);
                    }
                }
                Err(e) => log::warn!("resubscribe {} failed: {e}", watched.script_hash),
            }
        }
    }

    fn drain(&mut self, client: &electrum_client::Client) -> Flow {
        loop {
            match self.requests.try_recv() {
                Ok(WatchRequest::Watch { script, callback }) => {
                    self.watch(client, script, callback)
                }
                Ok(WatchRequest::Unwatch { script }) => {
                    let _ = client.script_unsubscribe(&electrum_script(&script));
                    if let Some(gone) = self.watched.remove(&script) {
                        log::debug!("unwatched {}", gone.script_hash);
                    }
                }
                Ok(WatchRequest::Stop) => {
                    log::info!("script watcher stopping");
                    return Flow::Stop;
                }
                Err(TryRecvError::Empty) => return Flow::Continue,
                Err(TryRecvError::Disconnected) => {
                    log::info!("script watcher handles dropped, stopping");
                    return Flow::Stop;
                }
            }
        }
    }

    fn watch(&mut self, client: &electrum_client::Client, script: Script, callback: StatusCallback) {
        // Electrum refuses a second subscription on one connection, so a
        // repeat registration replays the known status to the new callback.
        if let Some(existing) = self.watched.get_mut(&script).filter(|w| w.live) {
            existing.callback = callback;
            let status = existing.status.clone();
            existing.report(status);
            return;
        }

        let mut watched = Watched::new(&script, callback);
        match client.script_subscribe(&electrum_script(&script)) {
            Ok(status) => {
                watched.live = true;
                log::debug!("watching {}", watched.script_hash);
                watched.report(status.map(status_hex));
                self.watched.insert(script, watched);
            }
            Err(e) => log::warn!("watch {} failed: {e}", watched.script_hash),
        }
    }

    fn poll_tip(&mut self, client: &electrum_client::Client) {
        let Ok(Some(header)) = client.block_headers_pop_raw() else {
            return;
        };
        let height = header.height as u32;
        if self.tip.is_some_and(|tip| tip >= height) {
            return;
        }
        self.tip = Some(height);
        log::debug!("tip moved to {height}");
        let _ = self.events.send(WatcherEvent::Tip { height });
    }

    fn poll_scripts(&mut self, client: &electrum_client::Client) {
        for (script, watched) in self.watched.iter_mut() {
            match client.script_pop(&electrum_script(script)) {
                Ok(Some(status)) => {
                    log::debug!("status change on {}", watched.script_hash);
                    watched.report(Some(status_hex(status)));
                }
                Ok(None) => {}
                Err(e) => log::warn!("status poll for {} failed: {e}", watched.script_hash),
            }
        }
    }
}
