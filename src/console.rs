//! Terminal front end: renders session status and headings, and turns typed lines into connect,
//! disconnect and device selection requests.

use std::sync::Arc;
use futures::StreamExt;
use log::warn;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::bus::{ChannelSubscriber, Subscriber};
use crate::device::controller::SessionHandle;
use crate::device::types::{ConnectionEvent, DeviceEvent, DeviceId, SessionState, UserAction};
use crate::error::SessionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Connect,
    Disconnect,
    Select(DeviceId),
    Help,
    Quit,
    Unknown(String),
}

/**
 * Parses one input line. An empty line performs whatever action the current state offers, the way
 * a single connect/disconnect button would. A number picks one of `candidates` (1 based).
 */
pub fn parse_command(line: &str, state: SessionState, candidates: &[DeviceId]) -> ConsoleCommand {
    let line = line.trim();

    match line {
        "" => match state.action() {
            UserAction::Connect => ConsoleCommand::Connect,
            UserAction::Disconnect => ConsoleCommand::Disconnect,
        },
        "c" | "connect" => ConsoleCommand::Connect,
        "d" | "disconnect" => ConsoleCommand::Disconnect,
        "h" | "?" | "help" => ConsoleCommand::Help,
        "q" | "quit" => ConsoleCommand::Quit,
        _ => match line.parse::<usize>() {
            Ok(index) if index >= 1 && index <= candidates.len() => ConsoleCommand::Select(candidates[index - 1].clone()),
            _ => ConsoleCommand::Unknown(line.to_string()),
        },
    }
}

pub fn format_status(event: &ConnectionEvent) -> String {
    format!("Status: {} [Enter: {}]", event.status(), event.state.action())
}

pub fn format_candidates(candidates: &[DeviceId]) -> String {
    let mut out = String::from("Several headsets found, type a number to pick one:");
    for (index, candidate) in candidates.iter().enumerate() {
        out.push_str(&format!("\n  {}) {}", index + 1, candidate));
    }
    out
}

fn print_help() {
    println!("Commands: c = connect, d = disconnect, <number> = pick a headset, q = quit, Enter = toggle");
}

fn report_request(result: Result<(), SessionError>) -> Result<(), SessionError> {
    match result {
        Err(SessionError::ControllerStopped) => Err(SessionError::ControllerStopped),
        Err(err) => {
            println!("{}", err);
            Ok(())
        },
        Ok(()) => Ok(()),
    }
}

/// Drives `handle` from stdin until the user quits, stdin closes or `cancel` fires.
pub async fn run_console(handle: SessionHandle, cancel: CancellationToken) -> Result<(), SessionError> {
    let (subscriber, mut events) = ChannelSubscriber::new(false);
    let subscriber: Arc<dyn Subscriber> = subscriber;
    handle.subscribe(&subscriber);

    let mut headings = handle.headings();
    let mut lines = BufReader::new(stdin()).lines();
    let mut state = handle.state().await?;
    let mut candidates: Vec<DeviceId> = Vec::new();

    print_help();
    report_request(handle.connect().await)?;

    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            Some(event) = events.next() => match event {
                DeviceEvent::StateChange(change) => {
                    state = change.state;
                    if state != SessionState::Discovering {
                        candidates.clear();
                    }
                    println!("{}", format_status(&change));
                },
                DeviceEvent::AmbiguousDevices(list) => {
                    println!("{}", format_candidates(&list));
                    candidates = list;
                },
                DeviceEvent::RadioState(radio) => {
                    println!("Bluetooth radio is {}", radio);
                },
                DeviceEvent::Heading(_) => {},
            },
            Some(sample) = headings.changed() => {
                println!("Heading {:.1}", sample.angle_degrees);
            },
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break 'mainloop,
                    Err(err) => {
                        warn!("Failed to read stdin: {:?}", err);
                        break 'mainloop;
                    },
                };

                match parse_command(&line, state, &candidates) {
                    ConsoleCommand::Connect => report_request(handle.connect().await)?,
                    ConsoleCommand::Disconnect => report_request(handle.disconnect().await)?,
                    ConsoleCommand::Select(device) => report_request(handle.select_device(device).await)?,
                    ConsoleCommand::Help => print_help(),
                    ConsoleCommand::Quit => break 'mainloop,
                    ConsoleCommand::Unknown(input) => println!("Unknown command {:?}", input),
                }
            },
        }
    }

    handle.unsubscribe(&subscriber);
    Ok(())
}
