use std::path::PathBuf;
use std::thread;

use clap::Parser;
use dotenv::dotenv;
use tracing::{error, info};
use wirenet::network::{addresses_for_name, Service, SocketKind};
use wirenet::service::{
    echo_connection_callback, run_ping_loop, setup_tracing, ConnectionOptions, PingReport,
};
use wirenet::{global_config, AppConfig, AppError, AppResult, EventLoop, Server, GLOBAL_CONFIG};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// directory for the rolling log files
    #[arg(long, default_value = "./logs")]
    pub log_dir: PathBuf,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    /// Echo every message back to its sender
    Serve,
    /// Measure round-trip latency against a running server
    Ping,
    PrintConfig,
}

fn connection_options(config: &AppConfig) -> ConnectionOptions {
    ConnectionOptions {
        input_buffer_size: config.network.input_buffer_size,
        max_data_length: config.network.max_data_length as usize,
        no_delay: config.network.no_delay,
    }
}

fn serve(config: &AppConfig) -> AppResult<()> {
    let mut event_loop = EventLoop::new()?;
    let addresses = addresses_for_name(
        &config.network.ip,
        &Service::Port(config.network.port),
        SocketKind::Stream,
    )?;
    let _server = Server::bind_to_addresses(
        &mut event_loop,
        &addresses,
        config.network.listen_backlog,
        echo_connection_callback(connection_options(config)),
    )?;
    event_loop.run_forever()
}

fn ping(config: &AppConfig) -> AppResult<()> {
    let addresses = addresses_for_name(
        &config.network.ip,
        &Service::Port(config.network.port),
        SocketKind::Stream,
    )?;
    let client_loops = match config.ping.client_loops {
        0 => num_cpus::get(),
        n => n,
    };
    let options = connection_options(config);
    let connections = config.ping.connections;
    let ttl = config.ping.ttl;
    info!(
        "pinging {} with {} loops x {} connections x {} round trips",
        config.listen_address(),
        client_loops,
        connections,
        ttl
    );

    let workers = (0..client_loops)
        .map(|i| {
            let addresses = addresses.clone();
            thread::Builder::new()
                .name(format!("ping-client-{}", i))
                .spawn(move || run_ping_loop(&addresses, connections, ttl, options))
                .map_err(AppError::from)
        })
        .collect::<AppResult<Vec<_>>>()?;

    let mut total = PingReport::default();
    for worker in workers {
        let report = worker
            .join()
            .map_err(|_| AppError::IllegalState("ping client thread panicked".into()))??;
        total.merge(&report);
    }

    match total.average_latency() {
        Some(average) => println!(
            "{} round trips, average latency {:?}, {} failed connections",
            total.round_trips, average, total.failed_connections
        ),
        None => println!(
            "no round trips completed, {} failed connections",
            total.failed_connections
        ),
    }
    Ok(())
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let _worker_guard = setup_tracing(&commandline.log_dir, commandline.verbose)?;

    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let app_config = AppConfig::set_up_config(config_path)?;
    GLOBAL_CONFIG
        .set(app_config)
        .map_err(|_| AppError::IllegalState("global config already set".into()))?;
    let config = global_config()?;

    let result = match commandline.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config),
        Command::Ping => ping(config),
        Command::PrintConfig => {
            println!("{:#?}", config);
            Ok(())
        }
    };
    if let Err(err) = &result {
        error!("wirenet exited with error: {}", err);
    }
    result
}
