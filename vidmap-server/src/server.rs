//! Daemon wiring: viewer listener, admin console, session event pump.
//!
//! The admin console is a line-oriented stand-in for the host command
//! surface:
//!
//! ```text
//! start <file> <gridW> <gridH>   begin streaming to all viewers
//! adjust <gridW> <gridH>         live-resize the running stream
//! stop                           cancel the running stream
//! status                         JSON summary of sessions/viewers
//! quit                           shut down
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use vidmap_core::decode::DecodeBackend;
use vidmap_core::{
    AudioBundle, Clientbound, SessionEvent, SessionKey, SessionManager, SubscriberSet, TileGrid,
    VidmapError, ViewerConnection, ViewerSender,
};

use crate::config::ServerConfig;

/// Broadcast group every connected viewer belongs to.
const BROADCAST_GROUP: &str = "all";

/// The running daemon.
pub struct Server {
    config: ServerConfig,
    manager: SessionManager,
    events: Option<mpsc::Receiver<SessionEvent>>,
    viewers: Arc<Mutex<Vec<ViewerSender>>>,
    bundle: Option<AudioBundle>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let (manager, events) = SessionManager::new(config.session_config());

        let bundle = if config.assets.bundle_url.is_empty() {
            None
        } else {
            match AudioBundle::from_file(&config.assets.bundle_url, &config.assets.bundle_path) {
                Ok(bundle) => {
                    info!(url = %bundle.url, hash = %bundle.hash, "audio bundle ready");
                    Some(bundle)
                }
                Err(e) => {
                    warn!(error = %e, "audio bundle unavailable; announcements disabled");
                    None
                }
            }
        };

        Self {
            config,
            manager,
            events: Some(events),
            viewers: Arc::new(Mutex::new(Vec::new())),
            bundle,
        }
    }

    /// A handle for out-of-band shutdown (Ctrl-C).
    pub fn manager(&self) -> SessionManager {
        self.manager.clone()
    }

    /// Serve until the admin console quits, then tear everything down.
    pub async fn run(mut self) -> Result<(), VidmapError> {
        let listener = TcpListener::bind(&self.config.network.listen_addr).await?;
        info!(addr = %listener.local_addr()?, "listening for viewers");

        let events = self.events.take().ok_or("server run twice")?;
        tokio::spawn(Self::event_pump(
            events,
            self.viewers.clone(),
            self.bundle.clone(),
        ));
        tokio::spawn(Self::accept_loop(listener, self.viewers.clone()));

        self.admin_loop().await;
        self.manager.shutdown_all().await
    }

    // ── Viewer intake ────────────────────────────────────────────

    async fn accept_loop(listener: TcpListener, viewers: Arc<Mutex<Vec<ViewerSender>>>) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!(%addr, "viewer connected");
                    let mut conn = ViewerConnection::new(stream);
                    {
                        let mut viewers = viewers.lock().expect("viewer registry poisoned");
                        viewers.retain(|sink| !sink.is_closed());
                        viewers.push(conn.sender());
                    }
                    // Drain (and ignore) inbound frames; the display
                    // transport is outbound-only for this system.
                    tokio::spawn(async move {
                        while let Some(frame) = conn.recv().await {
                            debug!(wire_id = frame.wire_id, "ignoring inbound frame");
                        }
                        info!(%addr, "viewer disconnected");
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    fn snapshot_subscribers(&self) -> SubscriberSet {
        let mut viewers = self.viewers.lock().expect("viewer registry poisoned");
        viewers.retain(|sink| !sink.is_closed());
        SubscriberSet::broadcast(viewers.clone())
    }

    // ── Session events ───────────────────────────────────────────

    async fn event_pump(
        mut events: mpsc::Receiver<SessionEvent>,
        viewers: Arc<Mutex<Vec<ViewerSender>>>,
        bundle: Option<AudioBundle>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::FirstFrame { id, key } => {
                    info!(session = %id, %key, "first frame delivered");
                    // Cue the companion audio: announce the bundle so
                    // viewers fetch and start it.
                    if let Some(bundle) = &bundle {
                        let announce = Clientbound::AssetAnnounce(bundle.announcement());
                        let viewers = viewers.lock().expect("viewer registry poisoned");
                        for sink in viewers.iter() {
                            let _ = sink.try_send(announce.clone());
                        }
                    }
                }
                SessionEvent::Stopped { id, key, reason } => {
                    info!(session = %id, %key, %reason, "session ended");
                }
            }
        }
    }

    // ── Admin console ────────────────────────────────────────────

    async fn admin_loop(&self) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        println!("vidmap admin console: start <file> <w> <h> | adjust <w> <h> | stop | status | quit");

        while let Ok(Some(line)) = lines.next_line().await {
            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts.as_slice() {
                [] => {}
                ["start", file, w, h] => self.cmd_start(file, w, h).await,
                ["adjust", w, h] => self.cmd_adjust(w, h),
                ["stop"] => self.cmd_stop().await,
                ["status"] => self.cmd_status(),
                ["quit"] | ["exit"] => break,
                other => println!("unknown command: {}", other.join(" ")),
            }
        }
    }

    async fn cmd_start(&self, file: &str, w: &str, h: &str) {
        let Some(grid) = parse_grid(w, h) else {
            return;
        };
        let source = self.config.media.videos_dir.join(file);
        if !source.exists() {
            println!("video file doesn't exist: {}", source.display());
            return;
        }
        let backend = match make_backend(grid) {
            Ok(backend) => backend,
            Err(e) => {
                println!("cannot start: {e}");
                return;
            }
        };

        let subscribers = self.snapshot_subscribers();
        if subscribers.is_empty() {
            println!("note: no viewers connected; streaming anyway");
        }

        let key = SessionKey::Broadcast(BROADCAST_GROUP.into());
        match self
            .manager
            .start(key, backend, grid, &source, subscribers)
            .await
        {
            Ok(id) => println!("session {id} started ({grid})"),
            Err(e) => println!("start failed: {e}"),
        }
    }

    fn cmd_adjust(&self, w: &str, h: &str) {
        let Some(grid) = parse_grid(w, h) else {
            return;
        };
        let key = SessionKey::Broadcast(BROADCAST_GROUP.into());
        if self.manager.request_resize(&key, grid) {
            println!("resize to {grid} requested");
        } else {
            println!("no video is currently playing");
        }
    }

    async fn cmd_stop(&self) {
        let key = SessionKey::Broadcast(BROADCAST_GROUP.into());
        match self.manager.stop(&key).await {
            Ok(true) => println!("stopped"),
            Ok(false) => println!("no video is currently playing"),
            Err(e) => println!("stop failed: {e}"),
        }
    }

    fn cmd_status(&self) {
        let viewers = {
            let mut viewers = self.viewers.lock().expect("viewer registry poisoned");
            viewers.retain(|sink| !sink.is_closed());
            viewers.len()
        };
        let sessions: Vec<String> = self
            .manager
            .active_keys()
            .iter()
            .map(ToString::to_string)
            .collect();
        let status = serde_json::json!({
            "viewers": viewers,
            "sessions": sessions,
        });
        println!("{status}");
    }
}

fn parse_grid(w: &str, h: &str) -> Option<TileGrid> {
    let (Ok(w), Ok(h)) = (w.parse::<u16>(), h.parse::<u16>()) else {
        println!("grid dimensions must be integers");
        return None;
    };
    match TileGrid::new(w, h) {
        Ok(grid) => Some(grid),
        Err(e) => {
            println!("{e}");
            None
        }
    }
}

#[cfg(feature = "libav")]
fn make_backend(grid: TileGrid) -> Result<Box<dyn DecodeBackend>, VidmapError> {
    Ok(vidmap_core::decode::libav::LibavBackend::create(grid)?)
}

#[cfg(not(feature = "libav"))]
fn make_backend(_grid: TileGrid) -> Result<Box<dyn DecodeBackend>, VidmapError> {
    Err(VidmapError::Other(
        "built without the `libav` feature; native decoding unavailable".into(),
    ))
}
