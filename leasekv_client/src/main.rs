//! LeaseKV cache-library test client executable. Runs one command against
//! the cluster (optionally repeated), and can linger with the revocation
//! endpoint open to observe lease callbacks.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;

use env_logger::Env;

use leasekv::{
    pl_error, ClientConfig, LeaseKvError, LeaseMode, Libstore,
};

use tokio::runtime::Builder;
use tokio::time::{self, Duration};

/// How long the persistent mode lingers for revocation callbacks.
const LINGER_SECS: u64 = 20;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Master node address.
    #[arg(short, long, default_value = "127.0.0.1:9009")]
    master: SocketAddr,

    /// Number of times to execute the command.
    #[arg(short = 'n', long, default_value_t = 1)]
    count: u32,

    /// Run persistently with the revocation endpoint open, requesting
    /// leases and reporting callbacks received.
    #[arg(short = 'l', long)]
    hold_leases: bool,

    /// With --hold-leases, request a lease on every read.
    #[arg(short = 'f', long)]
    force_lease: bool,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,

    /// Client configuration in TOML format.
    #[arg(short, long)]
    config: Option<String>,

    /// Command: p (Put), g (Get), lg (GetList), la (AppendToList),
    /// lr (RemoveFromList).
    command: String,

    /// Command arguments: key, plus a value for p/la/lr.
    args: Vec<String>,
}

impl CliArgs {
    /// Number of arguments each command takes after the key.
    fn expected_args(&self) -> Option<usize> {
        match self.command.as_str() {
            "g" | "lg" => Some(1),
            "p" | "la" | "lr" => Some(2),
            _ => None,
        }
    }

    /// Sanitizes command line arguments.
    fn sanitize(&self) -> Result<(), LeaseKvError> {
        let Some(expected) = self.expected_args() else {
            return Err(LeaseKvError(format!(
                "unrecognized command '{}'",
                self.command
            )));
        };
        if self.args.len() != expected {
            Err(LeaseKvError(format!(
                "command '{}' takes {} argument(s), got {}",
                self.command,
                expected,
                self.args.len()
            )))
        } else if self.threads < 2 {
            Err(LeaseKvError(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }

    /// The lease mode implied by the flags.
    fn lease_mode(&self) -> LeaseMode {
        if !self.hold_leases {
            LeaseMode::Never
        } else if self.force_lease {
            LeaseMode::Always
        } else {
            LeaseMode::Normal
        }
    }
}

/// Runs the requested command once, printing its outcome.
async fn run_command(
    store: &Libstore,
    args: &CliArgs,
) -> Result<(), LeaseKvError> {
    match args.command.as_str() {
        "g" => match store.get(&args.args[0]).await {
            Ok(value) => println!("{}", value),
            Err(e) => println!("ERROR: {}", e),
        },
        "lg" => match store.get_list(&args.args[0]).await {
            Ok(items) => {
                for item in items {
                    println!("{}", item);
                }
            }
            Err(e) => println!("ERROR: {}", e),
        },
        "p" => match store.put(&args.args[0], &args.args[1]).await {
            Ok(()) => println!("OK"),
            Err(e) => println!("ERROR: {}", e),
        },
        "la" => {
            match store.append_to_list(&args.args[0], &args.args[1]).await {
                Ok(()) => println!("OK"),
                Err(e) => println!("ERROR: {}", e),
            }
        }
        "lr" => {
            match store.remove_from_list(&args.args[0], &args.args[1]).await
            {
                Ok(()) => println!("OK"),
                Err(e) => println!("ERROR: {}", e),
            }
        }
        _ => unreachable!("command validated by sanitize()"),
    }
    Ok(())
}

// Client executable main entrance.
fn client_main() -> Result<(), LeaseKvError> {
    let args = CliArgs::parse();
    args.sanitize()?;

    let config = ClientConfig::from_toml(args.config.as_deref())?;
    let callback_bind: Option<SocketAddr> = if args.hold_leases {
        Some("127.0.0.1:0".parse()?)
    } else {
        None
    };

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-client")
        .build()?;

    runtime.block_on(async move {
        let store = Libstore::new_and_setup(
            args.master,
            callback_bind,
            args.lease_mode(),
            config,
        )
        .await?;

        for _ in 0..args.count {
            run_command(&store, &args).await?;
        }

        if args.hold_leases {
            // revocations arriving in this window are reported by the
            // library's logging
            println!(
                "Waiting {} seconds for lease callbacks...",
                LINGER_SECS
            );
            time::sleep(Duration::from_secs(LINGER_SECS)).await;
        }

        Ok::<(), LeaseKvError>(())
    })
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    if let Err(e) = client_main() {
        pl_error!("client"; "client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
