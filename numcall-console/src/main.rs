//! Terminal call station.
//!
//! Reads commands from stdin:
//!
//! ```text
//! DRS 7              add 7 to DRS
//! Check Date 15      add 15 to Check Date
//! del Override 0     delete the first Override entry
//! mute | unmute      toggle local speech
//! interval 2         announce the summary every 2 minutes
//! show               print the lists
//! quit
//! ```

use log::info;
use numcall_sync::{
    CallStation, Category, CommandSpeaker, LogSpeaker, Speaker, StationConfig, StationHandle,
};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, PartialEq)]
enum Input {
    Add(Category, String),
    Delete(Category, usize),
    Mute(bool),
    Interval(u32),
    Show,
    Help,
    Quit,
}

/// Case- and space-insensitive category lookup: `checkdate` is `Check Date`.
fn parse_category(s: &str) -> Option<Category> {
    let wanted: String = s.split_whitespace().collect();
    Category::ALL.into_iter().find(|c| {
        let name: String = c.name().split_whitespace().collect();
        name.eq_ignore_ascii_case(&wanted)
    })
}

/// Split `"<category words> <last>"`.
fn split_last(rest: &str) -> Option<(&str, &str)> {
    let rest = rest.trim();
    let at = rest.rfind(char::is_whitespace)?;
    Some((rest[..at].trim(), rest[at..].trim()))
}

fn parse_input(line: &str) -> Result<Input, String> {
    let line = line.trim();
    let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    match word.to_ascii_lowercase().as_str() {
        "" | "help" | "?" => return Ok(Input::Help),
        "quit" | "exit" => return Ok(Input::Quit),
        "show" | "ls" => return Ok(Input::Show),
        "mute" => return Ok(Input::Mute(true)),
        "unmute" => return Ok(Input::Mute(false)),
        "interval" => {
            return rest
                .trim()
                .parse()
                .map(Input::Interval)
                .map_err(|_| format!("not a number of minutes: {rest:?}"));
        }
        "del" | "delete" => {
            let (category, position) = split_last(rest).ok_or("usage: del <category> <position>")?;
            let category =
                parse_category(category).ok_or_else(|| format!("unknown category {category:?}"))?;
            let position = position
                .parse()
                .map_err(|_| format!("not a position: {position:?}"))?;
            return Ok(Input::Delete(category, position));
        }
        _ => {}
    }

    let (category, value) = split_last(line).ok_or("usage: <category> <number>")?;
    let category = parse_category(category).ok_or_else(|| format!("unknown category {category:?}"))?;
    Ok(Input::Add(category, value.to_string()))
}

async fn show(handle: &StationHandle) {
    match handle.view().await {
        Ok(view) => {
            for category in Category::ALL {
                let values = view.values(category);
                let listed: Vec<String> = values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| format!("[{i}] {v}"))
                    .collect();
                println!("{:>10}: {}", category.name(), listed.join("  "));
            }
            println!(
                "{:?}, {}, every {} min, {} pending",
                view.connection,
                if view.muted { "muted" } else { "speaking" },
                view.repeat_every.as_secs() / 60,
                view.pending
            );
        }
        Err(e) => eprintln!("{e}"),
    }
}

const HELP: &str = "commands: <category> <number> | del <category> <position> | mute | unmute | interval <minutes> | show | quit";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = StationConfig::from_env()?;
    let speaker: Box<dyn Speaker> = match config.tts_command.as_deref().and_then(CommandSpeaker::from_command_line) {
        Some(speaker) => {
            info!("Speaking through {}", speaker.program());
            Box::new(speaker)
        }
        None => Box::new(LogSpeaker),
    };

    let (handle, station) = CallStation::spawn(config, speaker)?;
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let result = match parse_input(&line) {
            Ok(Input::Add(category, value)) => handle.add(category, value).await,
            Ok(Input::Delete(category, position)) => handle.delete(category, position).await,
            Ok(Input::Mute(muted)) => handle.set_muted(muted).await,
            Ok(Input::Interval(minutes)) => handle.set_interval(minutes).await,
            Ok(Input::Show) => {
                show(&handle).await;
                Ok(())
            }
            Ok(Input::Help) => {
                println!("{HELP}");
                Ok(())
            }
            Ok(Input::Quit) => break,
            Err(e) => {
                eprintln!("{e}");
                Ok(())
            }
        };
        if let Err(e) = result {
            eprintln!("{e}");
        }
    }

    handle.shutdown().await;
    station.await?;
    Ok(())
}
