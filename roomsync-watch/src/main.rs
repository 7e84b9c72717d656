//! Join rooms on a relay and log everything that happens in them.
//!
//! ```text
//! roomsync-watch <ws-url | config.json> [room[:state|:function]]...
//! ```
//!
//! Rooms default to state rooms; a trailing segment other than `state` or
//! `function` stays part of the room name. Set `RUST_LOG=debug` for connection detail.

use std::error::Error;
use std::fmt;
use std::path::Path;

use log::{error, info};
use roomsync::{RoomKind, Session, SessionConfig};

const USAGE: &str = "usage: roomsync-watch <ws-url | config.json> [room[:state|:function]]...";

#[derive(Debug, Clone, PartialEq, Eq)]
struct RoomArg {
    name: String,
    kind: RoomKind,
}

#[derive(Debug, PartialEq, Eq)]
struct ArgError(String);

impl fmt::Display for ArgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for ArgError {}

fn parse_room(arg: &str) -> Result<RoomArg, ArgError> {
    let (name, kind) = match arg.rsplit_once(':') {
        Some((name, "state")) => (name, RoomKind::State),
        Some((name, "function")) => (name, RoomKind::Function),
        // Any other suffix is part of the name, as in `ns:doc`
        _ => (arg, RoomKind::State),
    };
    if name.is_empty() {
        return Err(ArgError(format!("empty room name in `{arg}`")));
    }
    Ok(RoomArg {
        name: name.to_string(),
        kind,
    })
}

fn load_config(target: &str) -> Result<SessionConfig, Box<dyn Error>> {
    let config = if target.ends_with(".json") || Path::new(target).is_file() {
        SessionConfig::from_json_file(target)?
    } else {
        SessionConfig::new(target)
    };
    Ok(config.with_debug(true))
}

async fn run(args: Vec<String>) -> Result<(), Box<dyn Error>> {
    let (target, rooms) = args
        .split_first()
        .ok_or_else(|| ArgError(USAGE.to_string()))?;
    let rooms = rooms
        .iter()
        .map(|arg| parse_room(arg))
        .collect::<Result<Vec<_>, _>>()?;

    let session = Session::new(load_config(target)?)?;
    for room in &rooms {
        session.subscribe_to_room(room.name.clone(), room.kind, None)?;
        let name = room.name.clone();
        match room.kind {
            RoomKind::State => {
                session.on_state(&room.name, move |value| info!("[{name}] state = {value}"));
            }
            RoomKind::Function => {
                session.on_call(&room.name, move |args| info!("[{name}] call {args:?}"));
            }
        }
    }

    info!("watching {} room(s) on {}", rooms.len(), session.config().url);
    session.connect();
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    session.close().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run(std::env::args().skip(1).collect()).await {
        error!("{e}");
        std::process::exit(1);
    }
}
