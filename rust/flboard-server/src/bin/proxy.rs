use std::{path::PathBuf, process};

use structopt::StructOpt;
use tracing_subscriber::*;

use flboard_server::{
    rest::{self, Proxy},
    settings::Settings,
    signal,
};

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "Proxy")]
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
        api: api_settings,
        backend: backend_settings,
        log: log_settings,
        ..
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let proxy = Proxy::new(reqwest::Client::new(), &backend_settings).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    info!(
        "forwarding {} to {}",
        api_settings.bind_address, backend_settings.url
    );

    tokio::select! {
        _ = rest::serve(api_settings, proxy) => {
            warn!("shutting down: REST server terminated");
        }
        _ = signal::shutdown() => {}
    }
}
