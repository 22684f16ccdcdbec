//! Headless demo client.
//!
//! Loads `config.ron` (overridable via CLI flags), connects to the room
//! server, joins a room and spawns a beacon object that circles while this
//! client owns it. Without a reachable server it runs against the offline
//! loopback as a one-player room.
//!
//! Run with `cargo run -p roomlink-cli -- --room lobby --duration-secs 30`.

mod demo;
mod setup;

use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use roomlink_config::{CliArgs, Config, DeviceIdentity};
use roomlink_net::NetClient;
use roomlink_session::Session;
use tracing::{error, info, warn};

use crate::demo::Demo;

const FRAME: Duration = Duration::from_micros(16_667);
const DEFAULT_ROOM: &str = "lobby";

fn main() -> ExitCode {
    let args = CliArgs::parse();

    let config_dir = match args.config.clone().map_or_else(Config::default_dir, Ok) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Failed to resolve config directory: {e}");
            return ExitCode::FAILURE;
        }
    };
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    roomlink_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    let identity = DeviceIdentity::load_or_create(&config_dir).unwrap_or_else(|e| {
        warn!("Device identity unavailable ({e}), using a temporary one");
        DeviceIdentity::generate()
    });

    let transport = match NetClient::new(setup::transport_config(&config)) {
        Ok(transport) => transport,
        Err(e) => {
            error!("Failed to start transport: {e}");
            return ExitCode::FAILURE;
        }
    };
    let mut session = Session::new(transport, setup::session_config(&config, &identity));
    Demo::register(&mut session, setup::sync_settings(&config));
    session.subscribe("event log", |event| info!("{event:?}"));

    let room = args.room.clone().unwrap_or_else(|| DEFAULT_ROOM.to_string());
    let mut demo = Demo::new(room);
    let deadline = args
        .duration_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));

    info!(
        "Connecting to {}:{}",
        config.network.server_address, config.network.server_port
    );
    session.connect();

    let mut next_frame = Instant::now();
    loop {
        let now = Instant::now();
        if deadline.is_some_and(|d| now >= d) {
            break;
        }
        demo.frame(&mut session, now);
        // Events are logged by the subscriber.
        session.drain_events();

        next_frame += FRAME;
        match next_frame.checked_duration_since(Instant::now()) {
            Some(wait) => std::thread::sleep(wait),
            None => next_frame = Instant::now(),
        }
    }

    demo.finish(&mut session);
    session.tick(Instant::now());
    session.disconnect();
    info!("Demo finished");
    ExitCode::SUCCESS
}
