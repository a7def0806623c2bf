use std::env;
use std::process;

use tracing::info;
use tracing_subscriber::EnvFilter;

use jamlink::{Client, ClientConfig};

enum Mode {
    Create,
    Join(String),
}

fn parse_args() -> Option<Mode> {
    let mut args = env::args().skip(1);
    let mut mode = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--create" => mode = Some(Mode::Create),
            "--room" => mode = Some(Mode::Join(args.next()?)),
            _ => return None,
        }
    }
    mode
}

fn usage() -> ! {
    eprintln!("usage: jamlink --create | --room <id>");
    process::exit(2);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("jamlink=info".parse()?))
        .init();

    let Some(mode) = parse_args() else { usage() };
    let config = ClientConfig::from_env();
    let client = Client::with_defaults(config);
    match mode {
        Mode::Create => {
            let room_id = client.create_room().await?;
            let state = client.state();
            println!("room {room_id} created");
            if let Some(url) = state.share_url {
                println!("share this link: {url}");
            }
        }
        Mode::Join(room_id) => {
            client.join_room(&room_id).await?;
            println!("joined room {room_id}");
        }
    }

    let mut snapshots = client.snapshot();
    let mut notes = client.midi_feed();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snap = snapshots.borrow().clone();
                if let Some(error) = &snap.error {
                    eprintln!("error: {error}");
                    if !snap.joined {
                        break;
                    }
                }
                info!(participants = snap.participant_count, "room update");
            }
            note = notes.recv() => {
                if let Ok(event) = note {
                    info!(note = event.note, velocity = event.velocity, kind = %event.kind, "remote note");
                }
            }
        }
    }

    client.leave_room().await;
    Ok(())
}
