mod cli;
mod shutdown;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use taskrun_core::settings::load_settings;
use taskrun_engine::{RunnerEvent, StreamKind, load_recipe, start_runner};

use crate::cli::Cli;
use crate::shutdown::{ShutdownController, ShutdownEvent, spawn_ctrl_c_handler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    // Logs go to stderr alongside the observer's STDERR stream.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let settings = load_settings(cli.settings.as_deref())?;
    let recipe = load_recipe(&cli.recipe, &settings)?;
    let recipe_id = recipe.recipe_id.clone();

    let runner = start_runner(settings, recipe);
    let mut events = runner.subscribe_events();
    let mut output = runner.subscribe_output();

    let shutdown = std::sync::Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown.clone(), shutdown_tx);

    println!("taskrun {} recipe={recipe_id}", env!("CARGO_PKG_VERSION"));

    loop {
        tokio::select! {
            ev_opt = shutdown_rx.recv() => {
                match ev_opt {
                    Some(ShutdownEvent::Cancel) => {
                        eprintln!(
                            "Cancel requested — stopping the running task (press CTRL+C again to exit immediately)."
                        );
                        runner.cancel();
                    }
                    Some(ShutdownEvent::Immediate) => {
                        eprintln!("Cancel requested again — exiting immediately.");
                        std::process::exit(130);
                    }
                    None => {}
                }
            }
            line = output.recv() => {
                match line {
                    Ok(out) => match out.stream {
                        StreamKind::Stdout => println!("{}", out.line),
                        StreamKind::Stderr => eprintln!("{}", out.line),
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            evt = events.recv() => {
                let evt = match evt {
                    Ok(v) => v,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                match evt {
                    RunnerEvent::TaskFinished { task_id, state, error } => {
                        match error {
                            Some(error) => eprintln!("task {task_id}: {state:?} ({error})"),
                            None => eprintln!("task {task_id}: {state:?}"),
                        }
                    }
                    RunnerEvent::Warning { message } => eprintln!("{message}"),
                    RunnerEvent::RecipeComplete => break,
                    _ => {}
                }
            }
        }
    }

    // Flush whatever observer output is still buffered.
    while let Ok(out) = output.try_recv() {
        match out.stream {
            StreamKind::Stdout => println!("{}", out.line),
            StreamKind::Stderr => eprintln!("{}", out.line),
        }
    }

    let outcome = runner.wait().await?;
    let failed = outcome.failed();
    if failed > 0 {
        eprintln!(
            "{failed} of {} task(s) did not complete cleanly",
            outcome.tasks.len()
        );
        std::process::exit(1);
    }
    Ok(())
}
