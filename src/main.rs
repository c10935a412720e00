use env_logger::Env;
use log::{LevelFilter, warn};
use std::process::ExitCode;
use tuyaswitch::cli::Cli;
use tuyaswitch::{Driver, Result, SwitchTransport, TuyaDevice};

fn init_logging(debug: bool) {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("warn"));
    if debug {
        builder.filter_level(LevelFilter::Debug);
    }
    builder.init();
}

/// Resolves on Ctrl-C. If the handler cannot be installed it never resolves.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn run(cli: Cli) -> Result<()> {
    let action = cli.action();
    if cli.tail_overrides_power() {
        warn!("--tail ignores --on/--off; the switch state is left unchanged");
    }

    let mut device = TuyaDevice::connect(cli.device_config())?;
    device.set_version(cli.version);
    device.set_persistent(true);

    let mut driver = Driver::new(device, std::io::stdout());
    driver.run(action, interrupted()).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse_normalized();
    init_logging(cli.debug);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e.report());
            ExitCode::FAILURE
        }
    }
}
