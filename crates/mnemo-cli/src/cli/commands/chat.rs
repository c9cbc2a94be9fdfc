//! Chat command handler: one turn per stdin line.
//!
//! Ctrl+C during a turn cancels that turn. Ctrl+C at the prompt archives
//! any unsynced tool calls and exits with status 130.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use mnemo_core::config::Config;
use mnemo_core::core::agent::create_event_channel;
use mnemo_core::core::interrupt::{self, InterruptedError};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::modes::Runtime;
use crate::modes::exec::ExecRenderer;

const EXIT_COMMANDS: &[&str] = &["exit", "quit", "/exit", "/quit"];

pub async fn run(root: &Path, config: &Config) -> Result<()> {
    let (tx, mut rx) = create_event_channel();
    let mut runtime = Runtime::start(config, root, tx)?;
    let mut renderer = ExecRenderer::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let result = loop {
        show_prompt();
        let read = tokio::select! {
            biased;
            () = interrupt::wait_for_interrupt() => None,
            line = lines.next_line() => Some(line.context("read stdin")),
        };
        let line = match read {
            None => {
                eprintln!();
                tracing::info!("interrupted at the prompt");
                break Err(anyhow::Error::new(InterruptedError));
            }
            Some(Ok(Some(line))) => line,
            Some(Ok(None)) => break Ok(()),
            Some(Err(err)) => break Err(err),
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if EXIT_COMMANDS.contains(&input) {
            break Ok(());
        }

        // Render while the turn runs; the agent awaits display events, so
        // the channel must be drained concurrently.
        let outcome = {
            let turn = runtime.agent.run_turn(input);
            tokio::pin!(turn);
            loop {
                tokio::select! {
                    result = &mut turn => break result,
                    Some(event) = rx.recv() => renderer.handle_event(&event),
                }
            }
        };
        while let Ok(event) = rx.try_recv() {
            renderer.handle_event(&event);
        }
        renderer.finish();

        match outcome {
            Ok(_) => {}
            // Already archived by the agent; keep reading.
            Err(err) if err.is::<InterruptedError>() => interrupt::reset(),
            Err(err) => eprintln!("{err:#}"),
        }
    };

    let interrupted = result
        .as_ref()
        .is_err_and(|err| err.is::<InterruptedError>());
    if interrupted {
        runtime.agent.shutdown_interrupted().await?;
    } else {
        runtime.agent.shutdown().await?;
    }
    while let Ok(event) = rx.try_recv() {
        renderer.handle_event(&event);
    }
    renderer.finish();
    result
}

fn show_prompt() {
    let mut stderr = std::io::stderr();
    let _ = write!(stderr, "> ");
    let _ = stderr.flush();
}
