use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::{select, signal};
use tracing::{error, warn, Level};

use faktory_rs::config::{load_password, Args};
use faktory_rs::coordinator::Coordinator;
use faktory_rs::schedulers::{self, SchedulerConfig};
use faktory_rs::server;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.debug {
        tracing_subscriber::fmt().with_max_level(Level::TRACE).init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let password = match load_password(&args.config_dir, args.password_file.as_deref()) {
        Ok(p) => p,
        Err(error) => {
            error!(%error, "failed to read password file");
            return ExitCode::from(1);
        },
    };

    let coordinator = match Coordinator::boot(&args.data_dir, password, args.reserve_for_floor) {
        Ok(c) => c,
        Err(error) => {
            error!(%error, "failed to open store");
            return ExitCode::from(1);
        },
    };

    let listener = match TcpListener::bind((args.listen, args.port)).await {
        Ok(l) => l,
        Err(error) => {
            error!(%error, "failed to listen for connections");
            return ExitCode::from(1);
        },
    };

    {
        let cancel = coordinator.cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            }
            cancel.cancel();
        });
    }

    let scheduler_config = SchedulerConfig {
        dead_max_age: chrono::Duration::days(args.dead_max_age_days),
        dead_max_count: args.dead_max_count,
        ..SchedulerConfig::default()
    };
    let scheduler_handles = schedulers::spawn_all(Arc::clone(&coordinator), scheduler_config);

    let exit_code = match server::accept_loop(Arc::clone(&coordinator), listener).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "encountered runtime error");
            ExitCode::from(2)
        },
    };

    // Schedulers already stop via the coordinator's cancellation token
    // raced with their own sleep; abort() is a backstop for any task
    // currently blocked on a non-cancellable operation.
    for handle in scheduler_handles {
        handle.abort();
    }

    if let Err(error) = coordinator.stop().await {
        error!(%error, "failed to shut down cleanly");
        return ExitCode::from(2);
    }

    exit_code
}
