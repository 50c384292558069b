//! `tale-audio`: read a chapter in the terminal with its soundtrack.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Load [`AppConfig`] from disk (returns default on first run).
//! 3. Load the chapter and page list (built-in sample when none is given).
//! 4. Build the output device, fetcher, streaming element and [`AudioGraph`].
//! 5. Mount a [`ReadingSession`] and read commands from stdin until `quit`.
//!
//! ```text
//! tale-audio [chapter.json] [--pages pages.json] [--offline]
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use tale_audio::{
    audio::{CpalDevice, HttpFetcher, MediaElement, OfflineDevice, OutputDevice, SourceFetcher, StreamingElement},
    chapter::{Block, Chapter, PageList},
    config::{AppConfig, AppPaths},
    engine::{AudioGraph, ReadingSession, VoiceOutcome},
};

// ---------------------------------------------------------------------------
// Command line
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Args {
    chapter: Option<PathBuf>,
    pages: Option<PathBuf>,
    offline: bool,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args> {
    let mut parsed = Args::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--pages" => {
                let path = args.next().context("--pages needs a file")?;
                parsed.pages = Some(path.into());
            }
            "--offline" => parsed.offline = true,
            flag if flag.starts_with("--") => bail!("unknown flag `{flag}`"),
            path if parsed.chapter.is_none() => parsed.chapter = Some(path.into()),
            extra => bail!("unexpected argument `{extra}`"),
        }
    }
    Ok(parsed)
}

fn load_content(args: &Args) -> Result<(Chapter, PageList)> {
    let chapter = match &args.chapter {
        Some(path) => Chapter::load(path)
            .with_context(|| format!("cannot load chapter {}", path.display()))?,
        None => {
            log::info!("no chapter given, using the built-in sample");
            Chapter::sample()
        }
    };
    let pages = match &args.pages {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read pages {}", path.display()))?;
            PageList::from_json(&json)?
        }
        None => PageList::single_blocks(&chapter),
    };
    Ok((chapter, pages))
}

// ---------------------------------------------------------------------------
// Reader commands
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum Command {
    Next,
    Prev,
    Goto(usize),
    Tap(String),
    Tone,
    Music(f32),
    Voice(f32),
    Status,
    Quit,
}

fn parse_command(line: &str) -> Result<Command> {
    let mut words = line.split_whitespace();
    let verb = words.next().unwrap_or_default();
    let arg = words.next();
    let level = |arg: Option<&str>| -> Result<f32> {
        let level = arg
            .context("expected a level between 0 and 1")?
            .parse::<f32>()
            .context("level must be a number")?;
        if !level.is_finite() {
            bail!("level must be a number");
        }
        Ok(level)
    };

    Ok(match verb {
        "next" | "n" => Command::Next,
        "prev" | "p" => Command::Prev,
        "goto" | "g" => {
            let page: usize = arg.context("expected a page number")?.parse()?;
            Command::Goto(page.saturating_sub(1))
        }
        "tap" | "t" => Command::Tap(arg.context("expected a block id")?.to_string()),
        "tone" => Command::Tone,
        "music" => Command::Music(level(arg)?),
        "voice" => Command::Voice(level(arg)?),
        "status" | "s" => Command::Status,
        "quit" | "q" | "exit" => Command::Quit,
        other => bail!("unknown command `{other}`"),
    })
}

fn print_page(session: &ReadingSession, pages: &PageList) {
    let Some(page) = pages.get(session.page()) else {
        return;
    };
    println!("--- page {}/{} ---", session.page() + 1, pages.len());
    for block in session.chapter().blocks().iter().filter(|b| page.contains(b.id())) {
        match block {
            Block::Narration { text, .. } => println!("{text}"),
            Block::Dialogue { id, speaker, text, .. } => {
                println!("[{id}] {speaker}: \"{text}\"")
            }
        }
    }
}

fn save_volumes(config: &mut AppConfig, session: &ReadingSession) {
    config.volume = session.volumes();
    if let Err(e) = config.save() {
        log::warn!("could not save volume preferences: {e}");
    }
}

/// Print a voice line's outcome once it ends, without holding up the prompt.
fn report_when_done(label: &'static str, line: JoinHandle<VoiceOutcome>) {
    tokio::spawn(async move {
        match line.await {
            Ok(outcome) => println!("{label}: {outcome:?}"),
            Err(e) => log::warn!("{label} task failed: {e}"),
        }
    });
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("tale-audio starting up");

    // 2. Configuration
    let mut config = AppConfig::load().unwrap_or_else(|e| {
        log::warn!("Failed to load config ({e}); using defaults");
        AppConfig::default()
    });

    // 3. Content
    let args = parse_args(std::env::args().skip(1))?;
    let (chapter, pages) = load_content(&args)?;

    // 4. Audio stack
    let device: Arc<dyn OutputDevice> = if args.offline {
        Arc::new(OfflineDevice::new())
    } else {
        Arc::new(CpalDevice::new(config.audio.require_gesture))
    };
    let mut assets = config.assets.clone();
    assets.root_dir = AppPaths::new().assets_root(&assets.root_dir);
    let fetcher: Arc<dyn SourceFetcher> = Arc::new(HttpFetcher::from_config(&assets));
    let element: Arc<dyn MediaElement> = Arc::new(StreamingElement::new(fetcher.clone()));
    let graph = Arc::new(AudioGraph::new(device, fetcher, &config.audio));

    if !config.audio.require_gesture {
        if let Err(e) = graph.ensure_started().await {
            log::warn!("audio unavailable, reading silently: {e}");
        }
    }
    if args.offline {
        // no hardware callback: advance the mixer clock in real time
        let graph = graph.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_millis(10));
            loop {
                tick.tick().await;
                if graph.is_running() {
                    graph.render_offline(graph.sample_rate() as usize / 100);
                }
            }
        });
    }

    // 5. Session
    let mut session = ReadingSession::new(chapter, pages.clone(), graph, element, &config);
    session.mount();
    print_page(&session, &pages);
    println!("commands: next, prev, goto N, tap ID, tone, music X, voice X, status, quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };

        // any command is a user gesture
        session.user_gesture().await;

        match command {
            Command::Next => {
                session.page_changed(session.page() + 1);
                print_page(&session, &pages);
            }
            Command::Prev => {
                session.page_changed(session.page().saturating_sub(1));
                print_page(&session, &pages);
            }
            Command::Goto(page) => {
                session.page_changed(page);
                print_page(&session, &pages);
            }
            Command::Tap(id) => match session.tap_dialogue(&id).await {
                Some(line) => report_when_done("voice", line),
                None => println!("`{id}` has no voice line"),
            },
            Command::Tone => report_when_done("tone", session.test_tone().await),
            Command::Music(level) => {
                session.set_music_volume(level);
                save_volumes(&mut config, &session);
            }
            Command::Voice(level) => {
                session.set_voice_volume(level);
                save_volumes(&mut config, &session);
            }
            Command::Status => println!("{}", session.status()),
            Command::Quit => break,
        }
    }

    session.close();
    log::info!("tale-audio shut down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn parses_cli_arguments() {
        let parsed = args(&["ch.json", "--pages", "pages.json", "--offline"]).unwrap();
        assert_eq!(parsed.chapter, Some(PathBuf::from("ch.json")));
        assert_eq!(parsed.pages, Some(PathBuf::from("pages.json")));
        assert!(parsed.offline);

        assert!(args(&["--pages"]).is_err());
        assert!(args(&["a.json", "b.json"]).is_err());
        assert!(args(&["--loud"]).is_err());
    }

    #[test]
    fn parses_reader_commands() {
        assert_eq!(parse_command("next").unwrap(), Command::Next);
        assert_eq!(parse_command("goto 3").unwrap(), Command::Goto(2));
        assert_eq!(parse_command("tap d1").unwrap(), Command::Tap("d1".into()));
        assert_eq!(parse_command("music 0.4").unwrap(), Command::Music(0.4));
        assert!(parse_command("voice loud").is_err());
        assert!(parse_command("music nan").is_err());
        assert!(parse_command("voice inf").is_err());
        assert!(parse_command("dance").is_err());
    }

    #[tokio::test]
    async fn voice_report_does_not_wait_for_the_line() {
        let (release, gate) = tokio::sync::oneshot::channel::<()>();
        let line = tokio::spawn(async move {
            let _ = gate.await;
            VoiceOutcome::Interrupted
        });
        // returns while the line is still playing
        report_when_done("voice", line);
        release.send(()).unwrap();
    }
}
