//! Top-level orchestrator: wires together the connection manager, the
//! combined scheduler, the global configuration listener, UDP discovery, and
//! the firmware update server, each on its own thread, sharing one
//! [`ConfigStore`] and one [`ChannelDispatcher`].

use crate::config::RuntimeConfig;
use crate::conn_manager::{ConnectionManager, ConnEvent, ControlMsg};
use crate::store::ConfigStore;
use crate::uart::UartHal;
use crate::{discovery, firmware, globalcfg};
use crossbeam::channel::{bounded, Sender};
use nport_multicore::{ChannelDispatcher, ChannelId, ChannelMode};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const CONTROL_INBOX_SIZE: usize = 32;
const CONN_EVENT_INBOX_SIZE: usize = 16;

/// Owns every shared handle the runtime's worker threads need and spawns
/// them. `run` blocks forever (each worker loops until the process exits).
pub struct Runtime {
    config: RuntimeConfig,
    store: Arc<ConfigStore>,
    dispatcher: Arc<ChannelDispatcher<ConnEvent>>,
    control_tx: Sender<ControlMsg>,
    control_rx: crossbeam::channel::Receiver<ControlMsg>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig, store: ConfigStore) -> Self {
        let channel_ids: Vec<ChannelId> = (0..crate::channel::NUM_PORTS as u8).map(ChannelId).collect();
        let dispatcher = Arc::new(ChannelDispatcher::new(
            ChannelMode::PerChannel(channel_ids),
            CONN_EVENT_INBOX_SIZE,
        ));
        let (control_tx, control_rx) = bounded(CONTROL_INBOX_SIZE);
        Runtime {
            config,
            store: Arc::new(store),
            dispatcher,
            control_tx,
            control_rx,
        }
    }

    /// Handle callers can use to push `ReconfigureChannel`/`ConnectionClosed`
    /// messages at the connection manager (e.g. from a global-config
    /// session that just changed a channel's operating mode).
    pub fn control_handle(&self) -> Sender<ControlMsg> {
        self.control_tx.clone()
    }

    pub fn store(&self) -> Arc<ConfigStore> {
        Arc::clone(&self.store)
    }

    /// Spawns every worker thread and runs the scheduler loop on the calling
    /// thread; never returns under normal operation.
    pub fn run(self, uart: Box<dyn UartHal>) -> std::io::Result<()> {
        let channels = {
            let cfg = self.store.lock().expect("config store poisoned at startup");
            cfg.channels.iter().map(|c| c.channel_index).count()
        };
        log::info!("starting nport runtime with {} channels", channels);

        {
            let store = Arc::clone(&self.store);
            let dispatcher = Arc::clone(&self.dispatcher);
            let control_rx = self.control_rx.clone();
            thread::Builder::new()
                .name("conn-manager".into())
                .spawn(move || conn_manager_loop(store, dispatcher, control_rx))
                .expect("failed to spawn connection manager thread");
        }

        {
            let store = Arc::clone(&self.store);
            thread::Builder::new()
                .name("discovery".into())
                .spawn(move || {
                    if let Err(e) = discovery::run(&store) {
                        log::error!("discovery responder exited: {}", e);
                    }
                })
                .expect("failed to spawn discovery thread");
        }

        {
            let store = Arc::clone(&self.store);
            thread::Builder::new()
                .name("firmware-update".into())
                .spawn(move || firmware_listener_loop(store))
                .expect("failed to spawn firmware update thread");
        }

        {
            let store = Arc::clone(&self.store);
            let port = self.config.globalcfg.port;
            thread::Builder::new()
                .name("globalcfg".into())
                .spawn(move || globalcfg_listener_loop(store, port))
                .expect("failed to spawn global config thread");
        }

        scheduler_loop(
            self.store,
            self.dispatcher,
            self.control_tx,
            uart,
            self.config.tick_period_us,
        )
    }
}

fn conn_manager_loop(
    store: Arc<ConfigStore>,
    dispatcher: Arc<ChannelDispatcher<ConnEvent>>,
    control_rx: crossbeam::channel::Receiver<ControlMsg>,
) {
    let mut manager = match ConnectionManager::new(control_rx, dispatcher) {
        Ok(m) => m,
        Err(e) => {
            log::error!("connection manager failed to initialize: {}", e);
            return;
        }
    };

    {
        let cfg = store.lock().expect("config store poisoned");
        for channel in cfg.channels.iter() {
            if let Err(e) = manager.setup_channel(channel) {
                log::warn!("failed to set up channel {}: {}", channel.channel_index, e);
            }
        }
    }

    loop {
        if let Err(e) = manager.run_once(&store, Duration::from_millis(200)) {
            log::warn!("connection manager poll error: {}", e);
        }
    }
}

fn scheduler_loop(
    store: Arc<ConfigStore>,
    dispatcher: Arc<ChannelDispatcher<ConnEvent>>,
    control_tx: Sender<ControlMsg>,
    uart: Box<dyn UartHal>,
    tick_period_us: u64,
) -> std::io::Result<()> {
    let mut scheduler = crate::scheduler::Scheduler::new(uart, dispatcher, control_tx);
    let period = Duration::from_micros(tick_period_us.max(1));
    loop {
        {
            let mut cfg = store.lock().expect("config store poisoned");
            scheduler.tick(&mut cfg.channels);
        }
        thread::sleep(period);
    }
}

fn globalcfg_listener_loop(store: Arc<ConfigStore>, port: u16) {
    let listener = match TcpListener::bind(("0.0.0.0", port)) {
        Ok(l) => l,
        Err(e) => {
            log::error!("global config listener failed to bind port {}: {}", port, e);
            return;
        }
    };
    for conn in listener.incoming() {
        let Ok(mut stream) = conn else { continue };
        let store = Arc::clone(&store);
        thread::spawn(move || {
            if let Err(e) = globalcfg::handle_session(&mut stream, &store) {
                log::debug!("global config session ended: {}", e);
            }
        });
    }
}

fn firmware_listener_loop(store: Arc<ConfigStore>) {
    let listener = match TcpListener::bind(("0.0.0.0", firmware::UPDATE_PORT)) {
        Ok(l) => l,
        Err(e) => {
            log::error!("firmware update listener failed to bind: {}", e);
            return;
        }
    };
    for conn in listener.incoming() {
        let Ok(mut stream) = conn else { continue };
        let store = Arc::clone(&store);
        thread::spawn(move || {
            if let Err(e) = firmware::handle_connection(&mut stream, &store) {
                log::warn!("firmware update session failed: {}", e);
            }
        });
    }
}
