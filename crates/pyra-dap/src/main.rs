use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use pyra_config::PyraConfig;
use pyra_dap::{
    DebugEvent, DebugSession, ExecutionManager, LaunchRequest, RouterEvent, Topic, VarRef,
};
use pyra_process::{ProcessEvent, RunRequest};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Pyra execution manager: run Python scripts, or debug them through debugpy.
#[derive(Debug, Parser)]
#[command(name = "pyra-dap", version, about)]
struct Cli {
    /// Path to a TOML config file.
    ///
    /// If unset, `PYRA_CONFIG` is used as a fallback. When neither are provided
    /// built-in defaults are used.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a script and stream its output.
    Run(Target),
    /// Run a script under the debugger with an interactive console.
    Debug {
        #[command(flatten)]
        target: Target,

        /// Breakpoint as `file:line`; may be repeated.
        #[arg(long = "break", value_name = "FILE:LINE", value_parser = parse_breakpoint)]
        breakpoints: Vec<(PathBuf, i64)>,

        #[arg(long)]
        stop_on_entry: bool,
    },
}

#[derive(Debug, Args)]
struct Target {
    script: PathBuf,

    /// Working directory; defaults to the current directory.
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Launch through the package runner (`uv run python ...`).
    #[arg(long)]
    uv: bool,
}

impl Target {
    fn request(&self) -> anyhow::Result<RunRequest> {
        let cwd = match &self.cwd {
            Some(cwd) => cwd.clone(),
            None => std::env::current_dir().context("failed to determine current directory")?,
        };
        let script = if self.script.is_absolute() {
            self.script.clone()
        } else {
            cwd.join(&self.script)
        };
        Ok(if self.uv {
            RunRequest::package_runner(script, cwd)
        } else {
            RunRequest::direct(script, cwd)
        })
    }
}

fn parse_breakpoint(value: &str) -> Result<(PathBuf, i64), String> {
    let (file, line) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("expected FILE:LINE, got `{value}`"))?;
    let line = line
        .parse::<i64>()
        .map_err(|err| format!("invalid line in `{value}`: {err}"))?;
    if file.is_empty() || line < 1 {
        return Err(format!("expected FILE:LINE, got `{value}`"));
    }
    Ok((PathBuf::from(file), line))
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref());
    pyra_dap::hardening::init(&config);
    let manager = ExecutionManager::from_config(&config);

    match cli.command {
        Command::Run(target) => run(&manager, target.request()?).await,
        Command::Debug {
            target,
            breakpoints,
            stop_on_entry,
        } => {
            let run = target.request()?;
            let mut request = LaunchRequest::new(run);
            request.stop_on_entry = stop_on_entry;
            for (file, line) in breakpoints {
                let file = if file.is_absolute() {
                    file
                } else {
                    request.run.cwd.join(file)
                };
                request = request.with_breakpoint(file, line);
            }
            debug(&manager, request).await
        }
    }
}

fn load_config(cli_path: Option<&std::path::Path>) -> PyraConfig {
    match PyraConfig::load(cli_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("pyra-dap: failed to load config: {err}; continuing with defaults");
            PyraConfig::default()
        }
    }
}

async fn run(manager: &ExecutionManager, request: RunRequest) -> anyhow::Result<ExitCode> {
    let mut console = manager.subscribe(Topic::Console);
    manager.run(request).await?;

    while let Some(event) = console.recv().await {
        let RouterEvent::Process { event, .. } = event else {
            continue;
        };
        match event {
            ProcessEvent::Stdout(line) => println!("{line}"),
            ProcessEvent::Stderr(line) => eprintln!("{line}"),
            ProcessEvent::Completed(exit) => {
                let code = exit.code.unwrap_or(1);
                return Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)));
            }
        }
    }
    Ok(ExitCode::FAILURE)
}

async fn debug(manager: &ExecutionManager, request: LaunchRequest) -> anyhow::Result<ExitCode> {
    let mut events = manager.subscribe(Topic::All);
    let session = manager
        .launch(request)
        .await
        .context("failed to start debug session")?;
    println!("debugging; commands: c, n, s, o, bt, vars <ref>, q");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if let Some(code) = render(&session, event).await {
                    return Ok(code);
                }
            }
            line = stdin.next_line() => {
                let Some(line) = line? else {
                    manager.stop().await;
                    break;
                };
                if !console_command(manager, &session, line.trim()).await {
                    manager.stop().await;
                    break;
                }
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Print one event. Returns an exit code once the session is over.
async fn render(session: &DebugSession, event: RouterEvent) -> Option<ExitCode> {
    match event {
        RouterEvent::Process { event, .. } => match event {
            ProcessEvent::Stdout(line) => println!("{line}"),
            ProcessEvent::Stderr(line) => eprintln!("{line}"),
            ProcessEvent::Completed(_) => {}
        },
        RouterEvent::Debug { event, .. } => match event {
            DebugEvent::Stopped {
                reason, thread_id, ..
            } => {
                let thread = thread_id.unwrap_or(1);
                let location = match session.stack_trace(thread).await {
                    Ok(frames) => frames
                        .first()
                        .map(|frame| {
                            let file = frame
                                .source
                                .as_deref()
                                .map(|path| path.display().to_string())
                                .unwrap_or_else(|| "<unknown>".to_owned());
                            format!(" at {file}:{}", frame.line)
                        })
                        .unwrap_or_default(),
                    Err(_) => String::new(),
                };
                println!("stopped ({reason}) on thread {thread}{location}");
            }
            DebugEvent::Continued { .. } | DebugEvent::Thread { .. } => {}
            DebugEvent::Output { output, .. } => print!("{output}"),
            DebugEvent::Terminated(cause) => {
                println!("session ended: {cause}");
                return Some(ExitCode::SUCCESS);
            }
        },
    }
    None
}

/// Run one console command. Returns `false` when the user quits.
async fn console_command(manager: &ExecutionManager, session: &DebugSession, line: &str) -> bool {
    let status = session.status();
    let thread = status.active_thread.unwrap_or(1);
    let (command, arg) = line.split_once(' ').unwrap_or((line, ""));

    let result = match command {
        "" => Ok(()),
        "c" => session.continue_(thread).await,
        "n" => session.step_over(thread).await,
        "s" => session.step_into(thread).await,
        "o" => session.step_out(thread).await,
        "bt" => backtrace(session, thread).await,
        "vars" => match arg.trim().parse::<i64>() {
            Ok(raw) => variables(session, VarRef::from_parts(status.generation, raw)).await,
            Err(_) => {
                println!("usage: vars <ref>");
                Ok(())
            }
        },
        "q" => {
            manager.stop().await;
            return false;
        }
        other => {
            println!("unknown command `{other}`");
            Ok(())
        }
    };
    if let Err(err) = result {
        println!("error: {err}");
    }
    true
}

async fn backtrace(session: &DebugSession, thread: i64) -> pyra_dap::DebugResult<()> {
    let frames = session.stack_trace(thread).await?;
    for (depth, frame) in frames.iter().enumerate() {
        let file = frame
            .source
            .as_deref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<unknown>".to_owned());
        println!("#{depth} {} at {file}:{}", frame.name, frame.line);
    }
    if let Some(top) = frames.first() {
        for scope in session.scopes(top.frame).await? {
            match scope.variables {
                Some(reference) => println!("  {} (vars {})", scope.name, reference.raw()),
                None => println!("  {}", scope.name),
            }
        }
    }
    Ok(())
}

async fn variables(session: &DebugSession, reference: VarRef) -> pyra_dap::DebugResult<()> {
    for variable in session.variables(reference).await? {
        let type_name = variable
            .type_name
            .as_deref()
            .map(|name| format!(": {name}"))
            .unwrap_or_default();
        match variable.children {
            Some(children) => println!(
                "{}{type_name} = {} (vars {})",
                variable.name,
                variable.value,
                children.raw()
            ),
            None => println!("{}{type_name} = {}", variable.name, variable.value),
        }
    }
    Ok(())
}
