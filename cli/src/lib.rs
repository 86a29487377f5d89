//! CLI front-end for the `pilot` agent: argument parsing, the one-shot
//! `--print` mode and the interactive line-editor loop.

mod commands;
mod interactive;

use std::sync::Arc;

use clap::Parser;
use pilot_core::RuntimeContext;
use pilot_core::TurnArgs;
use pilot_core::agent_home;
use pilot_core::run_turn;
use rustyline::error::ReadlineError;

use commands::Registry;
use interactive::ConsoleInteraction;
use interactive::spawn_event_printer;

#[derive(Debug, Parser)]
#[command(name = "pilot", about = "Interactive coding-assistant agent", version)]
pub struct Cli {
    /// Instruction to run before entering the interactive loop.
    pub query: Option<String>,

    /// Collect a plan first, then execute with the plan as context.
    #[arg(long)]
    pub plan: bool,

    /// Skip optional context assembly for a faster turn.
    #[arg(long)]
    pub fast: bool,

    /// Auto-approve command and file-access prompts.
    #[arg(long, short = 'y')]
    pub yes: bool,

    /// Continue the most recent session instead of starting a new one.
    #[arg(long, short = 'c')]
    pub continue_session: bool,

    /// One-shot mode: run a single instruction, print the reply, exit.
    #[arg(long, short = 'p', value_name = "TEXT")]
    pub print: Option<String>,

    /// Override the active provider's model for this run.
    #[arg(long, value_name = "NAME")]
    pub model: Option<String>,
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let home = agent_home();
    // One-shot mode with --yes must never block on stdin.
    let interaction: Arc<dyn pilot_core::UserInteraction> = if cli.print.is_some() && cli.yes {
        Arc::new(pilot_core::AutoApprove)
    } else {
        Arc::new(ConsoleInteraction {
            assume_yes: cli.yes,
        })
    };
    let ctx = Arc::new(RuntimeContext::new(&home, interaction)?);

    if let Some(model) = &cli.model
        && let Ok(mut config) = ctx.config.write()
    {
        let active = config.active_provider.clone();
        if let Some(provider) = config.providers.get_mut(&active) {
            provider.model = model.clone();
        }
    }

    if !cli.continue_session {
        let name = format!("session-{}", chrono::Utc::now().format("%Y%m%d-%H%M%S"));
        ctx.set_session_name(&name)?;
    }

    let turn_args = TurnArgs {
        plan: cli.plan,
        fast: cli.fast,
    };

    let printer = spawn_event_printer(&ctx.bus);
    let registry = Registry::new(Arc::clone(&ctx));

    // One-shot mode.
    if let Some(text) = &cli.print {
        let outcome = run_turn(&ctx, text, turn_args, Some(&registry)).await?;
        if let Some(outcome) = outcome {
            println!("{}", outcome.reply.response);
        }
        printer.abort();
        ctx.terminals.shutdown().await;
        return Ok(());
    }

    // Interactive loop, optionally seeded with the positional query.
    if let Some(query) = &cli.query {
        handle_turn(&ctx, query, turn_args, &registry).await;
    }

    let mut editor = rustyline::DefaultEditor::new()?;
    loop {
        match editor.readline("pilot> ") {
            Ok(line) => {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);
                if line == "/quit" || line == "/exit" {
                    break;
                }
                handle_turn(&ctx, &line, turn_args, &registry).await;
            }
            Err(ReadlineError::Interrupted) => {
                // Ctrl-C aborts the current prompt, not the process.
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("input error: {err}");
                break;
            }
        }
    }

    printer.abort();
    ctx.terminals.shutdown().await;
    Ok(())
}

async fn handle_turn(ctx: &RuntimeContext, text: &str, args: TurnArgs, registry: &Registry) {
    match run_turn(ctx, text, args, Some(registry)).await {
        Ok(Some(outcome)) => {
            println!("\n{}", outcome.reply.response);
            if outcome.applied_files > 0 || outcome.commands_run > 0 {
                println!(
                    "({} file(s) changed, {} command(s) run)",
                    outcome.applied_files, outcome.commands_run
                );
            }
        }
        Ok(None) => {}
        Err(err) => {
            eprintln!("✗ {err}");
            if let Some(hint) = err.hint() {
                eprintln!("  hint: {hint}");
            }
        }
    }
}
