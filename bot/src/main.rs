use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn, LevelFilter};
use simplelog::{CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode, WriteLogger};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::sleep;

use mumble::codec::CodecRegistry;
use mumble::{Event, MumbleClient, MumbleConfig};

use crate::controller::Controller;
use crate::plugin::{spawn_ticker, NullLoader, PluginEvent, PluginHost};

const CRATE_NAME: &str = env!("CARGO_PKG_NAME");
const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Plugin Tick events per second.
const TICK_FREQUENCY: u32 = 10;

mod config;
mod controller;
mod plugin;

#[tokio::main]
async fn main() {
    let settings = config::parse();

    let level = if settings.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut loggers: Vec<Box<dyn SharedLogger>> =
        vec![TermLogger::new(level, Config::default(), TerminalMode::default())];
    if settings.log {
        match std::fs::File::create("brumble.log") {
            Ok(file) => loggers.push(WriteLogger::new(level, Config::default(), file)),
            Err(e) => eprintln!("failed to create log file: {}", e),
        }
    }
    CombinedLogger::init(loggers).expect("failed to set up logging");

    info!("starting {} {}", CRATE_NAME, CRATE_VERSION);

    // CELT builds are resolved by the embedding deployment; a bare binary
    // still connects and handles everything but audio transmission.
    let registry = Arc::new(CodecRegistry::new());
    if registry.is_empty() {
        warn!("no CELT codec available, audio transmission disabled");
    }

    let mut sigint = Box::pin(tokio::signal::ctrl_c());

    loop {
        let controller = Arc::new(Controller::load(&settings.privileges));
        let host = Arc::new(PluginHost::new(Box::new(NullLoader)));

        let mumble_config = MumbleConfig {
            username: settings.username.clone(),
            password: settings.password.clone(),
            bitrate: settings.bitrate,
            frames_per_packet: settings.frames,
            volume: settings.volume,
        };

        let connected = MumbleClient::connect(
            &settings.host,
            settings.port,
            settings.cert.as_deref(),
            mumble_config,
            registry.clone(),
        )
        .await;

        let (client, mut engine) = match connected {
            Ok(v) => v,
            Err(e) => {
                error!(
                    "failed to establish session to {}:{}: {}",
                    settings.host, settings.port, e
                );
                tokio::select! {
                    _ = &mut sigint => break,
                    _ = sleep(Duration::from_secs(1)) => continue,
                }
            }
        };

        let ticker = spawn_ticker(host.clone(), TICK_FREQUENCY);
        let router = tokio::spawn(route_events(
            client.clone(),
            controller.clone(),
            host.clone(),
        ));

        let mut interrupted = false;
        let restart = tokio::select! {
            restart = &mut engine => restart.unwrap_or(true),
            _ = &mut sigint => {
                interrupted = true;
                client.close();
                engine.await.unwrap_or(false)
            }
        };

        ticker.abort();
        router.abort();
        host.shutdown();

        if let Err(e) = controller.save() {
            error!("failed to save privileges: {}", e);
        }

        if interrupted || !restart {
            break;
        }

        info!("restarting session in 1 s");
        sleep(Duration::from_secs(1)).await;
    }

    info!("exiting");
}

/// Routes client events into the controller and the plugin queues.
async fn route_events(client: MumbleClient, controller: Arc<Controller>, host: Arc<PluginHost>) {
    let mut events = client.subscribe();

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                warn!("dropped {} events", n);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match event {
            Event::Message {
                actor,
                receivers,
                message,
                ..
            } => {
                // only messages addressed to us privately carry commands
                let own = match client.session() {
                    Some(own) => own,
                    None => continue,
                };
                if !receivers.contains(&own) {
                    continue;
                }

                let user = match actor.and_then(|a| client.state().user(a)) {
                    Some(user) => user,
                    None => continue,
                };

                info!("{}: {}", user.name, message);

                if let Some(line) = message.strip_prefix('.') {
                    if line.len() < 2 {
                        continue;
                    }
                    controller.process_command(
                        |text| client.send_text_to_user(user.session, text),
                        &host,
                        &user,
                        line,
                    );
                } else {
                    host.queue_all(PluginEvent::TextMessage {
                        session: user.session,
                        name: user.name.clone(),
                        message,
                    });
                }
            }
            Event::UserJoined { session, name } => {
                host.queue_all(PluginEvent::UserJoinedServer { session, name });
            }
            Event::UserStats { session } => {
                host.queue_all(PluginEvent::UserStats { session });
            }
            Event::Playback { name, origin } => {
                if let Some(origin) = origin {
                    host.queue(&origin, PluginEvent::Playback { name });
                }
            }
        }
    }
}
