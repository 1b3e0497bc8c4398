//! Kommandozeilen-Client
//!
//! Liest Befehle von stdin und gibt Call-Events auf stdout aus.

use anyhow::Context;
use callcore::call_engine::{CallEvent, CallHandle};
use callcore::config::ClientConfig;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

const HELP: &str = "\
Commands:
  call <code>   invite another user code
  cancel        withdraw the ringing invitation
  accept        accept the incoming call
  reject        reject the incoming call
  hangup        end the active call
  mute          toggle microphone
  camera        toggle camera
  state         show the current call state
  code          show your user code
  log           show recent calls
  quit          exit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    callcore::init_logging();

    let config = ClientConfig::from_env().context("invalid configuration")?;
    let (handle, engine) = callcore::start(&config).context("failed to start client")?;

    tokio::spawn(print_events(handle.subscribe()));
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            continue;
        };

        if command == "quit" || command == "exit" {
            break;
        }

        if let Err(e) = run_command(&handle, command, parts.next()).await {
            println!("error: {:#}", e);
        }
    }

    drop(handle);
    engine.await.context("call engine panicked")?;
    Ok(())
}

async fn run_command(handle: &CallHandle, command: &str, arg: Option<&str>) -> anyhow::Result<()> {
    match command {
        "call" => {
            let target = arg.context("usage: call <code>")?;
            handle.place_call(target).await?;
            println!("ringing {}...", target.trim());
        }
        "cancel" => handle.cancel_outgoing().await?,
        "accept" => handle.accept_incoming().await?,
        "reject" => handle.reject_incoming().await?,
        "hangup" => handle.hang_up().await?,
        "mute" => {
            let enabled = handle.toggle_audio().await?;
            println!("microphone {}", if enabled { "on" } else { "off" });
        }
        "camera" => {
            let enabled = handle.toggle_video().await?;
            println!("camera {}", if enabled { "on" } else { "off" });
        }
        "state" => println!("{}", serde_json::to_string(&handle.state().await?)?),
        "code" => match handle.user_code().await? {
            Some(code) => println!("your code: {}", code),
            None => println!("not registered yet"),
        },
        "log" => {
            for entry in handle.recent_calls()? {
                println!(
                    "{}  {:<8}  {}  {:<9}  {}",
                    entry.timestamp.format("%Y-%m-%d %H:%M"),
                    entry.direction.as_str(),
                    entry.peer_code,
                    entry.outcome.as_str(),
                    entry
                        .duration_secs
                        .map(|d| format!("{}:{:02}", d / 60, d % 60))
                        .unwrap_or_default()
                );
            }
        }
        _ => println!("{}", HELP),
    }
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<CallEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };

        match event {
            CallEvent::RelayConnected => println!("* connected to relay"),
            CallEvent::RelayDisconnected => println!("* relay connection lost, reconnecting..."),
            CallEvent::Registered(code) => println!("* your code: {}", code),
            CallEvent::StateChanged(state) => println!("* state: {}", state.name()),
            CallEvent::IncomingCall(invitation) => println!(
                "* incoming call from {} (accept / reject)",
                invitation.caller_code
            ),
            CallEvent::IncomingDismissed => println!("* incoming call is gone"),
            CallEvent::Notice(notice) => println!("* {}", notice),
            CallEvent::PeerMuted { is_audio_enabled } => println!(
                "* peer {}",
                if is_audio_enabled { "unmuted" } else { "muted" }
            ),
            CallEvent::MediaConnected => println!("* media connected"),
            CallEvent::LogUpdated(_) => {}
        }
    }
}
