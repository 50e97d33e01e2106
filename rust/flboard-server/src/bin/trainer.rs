use std::{path::PathBuf, process, sync::Arc};

use structopt::StructOpt;
use tracing_subscriber::*;

use flboard_core::ClientSetup;
use flboard_sdk::{client::Client, Orchestrator, Phase, Scheduler};
use flboard_server::{reporter, settings::Settings, signal};

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "Trainer")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        backend: backend_settings,
        orchestrator: orchestrator_settings,
        training: training_settings,
        log: log_settings,
        ..
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let client = Client::new(reqwest::Client::new(), &backend_settings.url)
        .unwrap_or_else(|err| {
            eprintln!("{}", err);
            process::exit(1);
        })
        .with_timeout(orchestrator_settings.request_timeout());
    let orchestrator = Arc::new(Orchestrator::new(
        client,
        orchestrator_settings.orchestrator(),
    ));

    let setup = ClientSetup::from_data_sizes(&training_settings.client_data_sizes)
        .unwrap_or_else(|err| {
            eprintln!("{}", err);
            process::exit(1);
        });
    if let Some(warning) = setup.warning() {
        warn!("{}", warning);
    }
    if let Err(err) = orchestrator
        .initialize_from_setup(&setup, training_settings.template())
        .await
    {
        eprintln!("{}", err.user_message());
        process::exit(1);
    }

    let mut scheduler = Scheduler::start(orchestrator.clone(), orchestrator_settings.scheduler());
    let reporter = tokio::spawn(reporter::report(orchestrator.subscribe()));

    let interrupted = tokio::select! {
        _ = scheduler.finished() => false,
        _ = signal::shutdown() => true,
    };
    if interrupted {
        scheduler.shutdown().await;
    }
    let phase = orchestrator.phase().await;
    drop(orchestrator);
    reporter::join(reporter).await;

    if phase == Phase::Failed {
        process::exit(1);
    }
}
