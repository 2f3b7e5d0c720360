//! remlaunch CLI
//!
//! Entry point for the `remlaunch` command-line tool.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};

use remlaunch::config::LaunchFile;
use remlaunch::launcher::compose;
use remlaunch::{decode, Backend, LaunchError, Launcher, Payload, RunnerKind, Submission};

#[derive(Parser)]
#[command(name = "remlaunch")]
#[command(about = "Ship code and run registered functions on remote backends", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a call for REMLAUNCH_PAYLOAD
    Encode {
        #[command(flatten)]
        call: CallArgs,
    },

    /// Decode a payload and print it as JSON
    Decode {
        /// Encoded payload
        payload: String,
    },

    /// Print the launch script (or job manifest) without running anything
    Plan {
        #[command(flatten)]
        launch: LaunchArgs,
    },

    /// Upload mounts and submit the call to the configured backend
    Submit {
        #[command(flatten)]
        launch: LaunchArgs,

        /// Unpack mounts on the persistent host before submitting
        #[arg(long)]
        setup_host: bool,
    },
}

#[derive(Args)]
struct CallArgs {
    /// Registered function name
    function: String,

    /// Positional arguments; each is parsed as JSON, else taken as a string
    #[arg(allow_negative_numbers = true)]
    args: Vec<String>,

    /// Keyword argument as key=value (value parsed like positional arguments)
    #[arg(long = "kwarg", short = 'k', value_parser = parse_kwarg)]
    kwargs: Vec<(String, Value)>,
}

impl CallArgs {
    fn payload(&self) -> Payload {
        Payload {
            function: self.function.clone(),
            args: self.args.iter().map(|a| parse_value(a)).collect(),
            kwargs: self.kwargs.iter().cloned().collect::<Map<String, Value>>(),
        }
    }
}

#[derive(Args)]
struct LaunchArgs {
    /// Launch file
    #[arg(long, short = 'f', default_value = "remlaunch.toml")]
    file: PathBuf,

    /// Defaults layered under the launch file
    /// (default: ~/.config/remlaunch/defaults.toml)
    #[arg(long)]
    defaults: Option<PathBuf>,

    /// Run this many copies of the call side by side in one unit
    #[arg(long, default_value_t = 1)]
    parallel: usize,

    #[command(flatten)]
    call: CallArgs,
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_kwarg(raw: &str) -> Result<(String, Value), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), parse_value(value))),
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}

fn default_defaults_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| Path::new(&home).join(".config/remlaunch/defaults.toml"))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Encode { call } => {
            println!("{}", call.payload().encode());
            ExitCode::SUCCESS
        }
        Commands::Decode { payload } => run_decode(&payload),
        Commands::Plan { launch } => run_plan(&launch),
        Commands::Submit { launch, setup_host } => run_submit(&launch, setup_host),
    }
}

fn run_decode(encoded: &str) -> ExitCode {
    match decode(encoded) {
        Ok(payload) => {
            let triple = Value::Array(vec![
                Value::String(payload.function),
                Value::Array(payload.args),
                Value::Object(payload.kwargs),
            ]);
            match serde_json::to_string_pretty(&triple) {
                Ok(json) => {
                    println!("{}", json);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(2)
        }
    }
}

fn load(launch: &LaunchArgs) -> Result<LaunchFile, ExitCode> {
    let defaults = launch.defaults.clone().or_else(default_defaults_path);
    LaunchFile::load_with_defaults(defaults.as_deref(), &launch.file).map_err(|e| {
        eprintln!("Error loading {}: {}", launch.file.display(), e);
        ExitCode::from(2)
    })
}

fn built_runner(file: &LaunchFile, launch: &LaunchArgs) -> Result<remlaunch::Runner, LaunchError> {
    let payload = launch.call.payload();
    let mut runner = file.runner()?;
    runner.build(&payload);
    for _ in 1..launch.parallel {
        runner.chain(&payload);
    }
    Ok(runner)
}

fn run_plan(launch: &LaunchArgs) -> ExitCode {
    let file = match load(launch) {
        Ok(file) => file,
        Err(code) => return code,
    };

    let rendered = built_runner(&file, launch).and_then(|runner| {
        if let RunnerKind::KubeJob(_) = runner.kind() {
            let mut job = runner.job().cloned().ok_or_else(|| {
                remlaunch::ConfigurationError::Invalid("kube-job runner has no job".to_string())
            })?;
            if let Backend::Kube(ref kube) = file.launcher {
                if job.metadata.namespace.is_none() {
                    job.metadata.namespace = kube.namespace.clone();
                }
            }
            return Ok(compose::jobs_yaml(&[job])?);
        }
        let config = file.launch_config();
        // A fresh host: always unpack.
        Ok(compose::launch_script(&[runner.clone()], runner.mounts(), true, &config)?)
    });

    match rendered {
        Ok(text) => {
            print!("{}", text);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            exit_code(&e)
        }
    }
}

fn run_submit(launch: &LaunchArgs, setup_host: bool) -> ExitCode {
    let file = match load(launch) {
        Ok(file) => file,
        Err(code) => return code,
    };

    let result = (|| -> Result<Vec<Submission>, LaunchError> {
        let runner = built_runner(&file, launch)?;
        let mut launcher = Launcher::new(file.launch_config())?;
        launcher.add_runner(runner);
        if setup_host {
            launcher.setup_host()?;
        }
        launcher.execute()
    })();

    match result {
        Ok(submissions) => {
            let mut code = ExitCode::SUCCESS;
            for submission in &submissions {
                println!("{}", submission);
                match submission {
                    Submission::Completed(output) if !output.success() => code = ExitCode::FAILURE,
                    Submission::Agent(remlaunch_protocol::ExecReply::Finished(result))
                        if !result.success() =>
                    {
                        code = ExitCode::FAILURE
                    }
                    _ => {}
                }
            }
            code
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            exit_code(&e)
        }
    }
}

/// `2` for configuration problems caught before anything ran, else `1`.
fn exit_code(err: &LaunchError) -> ExitCode {
    match err {
        LaunchError::Configuration(_) => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    }
}
