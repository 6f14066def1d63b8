//! Hutao Instance -- single-instance launcher demo.
//!
//! Usage:
//!   hutao-instance                           # Become primary, or redirect
//!   hutao-instance hutao://achievement/import
//!   hutao-instance --elevated                # Take over a non-elevated primary
//!   hutao-instance --config path.toml ...

use std::sync::Arc;

use clap::Parser;
use hutao_instance::config::InstanceConfig;
use hutao_instance::elevation::is_current_process_elevated;
use hutao_instance::{expand_tilde, InstanceHost, ListenerExit, SingleInstance, Startup};
use hutao_ipc_protocol::HutaoActivationArguments;

#[derive(Parser)]
#[command(name = "hutao-instance", about = "Single-instance activation redirection demo")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.config/hutao/instance.toml")]
    config: String,

    /// Act as an elevated process regardless of the real privileges
    #[arg(long, conflicts_with = "not_elevated")]
    elevated: bool,

    /// Act as a non-elevated process regardless of the real privileges
    #[arg(long)]
    not_elevated: bool,

    /// Activation arguments: a protocol URI, files, or launch arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

/// Where an activation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// This process's own command line.
    Local,
    /// Forwarded by a later launch.
    Redirected,
}

impl Origin {
    fn of(args: &HutaoActivationArguments) -> Self {
        if args.is_redirected {
            Origin::Redirected
        } else {
            Origin::Local
        }
    }
}

/// Logs activations instead of opening windows.
struct ConsoleHost {
    elevated: bool,
}

impl ConsoleHost {
    fn activate(&self, args: &HutaoActivationArguments) {
        tracing::info!(
            origin = ?Origin::of(args),
            kind = ?args.kind,
            launch_arguments = args.launch_arguments.as_deref().unwrap_or(""),
            protocol_uri = args.protocol_uri.as_deref().unwrap_or(""),
            files = args.files.len(),
            "activation"
        );
    }
}

impl InstanceHost for ConsoleHost {
    fn is_current_process_elevated(&self) -> bool {
        self.elevated
    }

    fn on_activation_redirected(&self, args: HutaoActivationArguments) {
        self.activate(&args);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hutao_instance=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = InstanceConfig::load_or_default(&config_path)?;

    let elevated = if cli.elevated {
        true
    } else if cli.not_elevated {
        false
    } else {
        is_current_process_elevated()
    };

    let args =
        HutaoActivationArguments::from_command_line(cli.args, &cfg.activation.protocol_scheme);
    let host = Arc::new(ConsoleHost { elevated });

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        endpoint = %cfg.endpoint(),
        elevated,
        "starting hutao-instance"
    );

    let single = SingleInstance::from_config(&cfg, elevated);
    let server = match single.startup(host.clone(), &args).await? {
        Startup::Exit => return Ok(()),
        Startup::Primary(server) => server,
    };

    // The primary handles its own launch locally
    host.activate(&args);

    let mut handle = server.spawn();
    let finished = tokio::select! {
        exit = handle.join() => Some(exit?),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            None
        }
    };
    let exit = match finished {
        Some(exit) => exit,
        None => {
            tracing::info!("ctrl-c received, shutting down");
            handle.shutdown();
            handle.join().await?
        }
    };

    match exit {
        ListenerExit::ExitRequested => {
            tracing::info!("an elevated instance took over, exiting");
        }
        ListenerExit::Shutdown => tracing::info!("hutao-instance stopped"),
    }
    Ok(())
}
