//! Agua IOT CLI
//!
//! A command-line interface (CLI) application for pellet and wood stoves
//! connected to the Agua IOT cloud.
//!
//! This tool allows users to:
//! - List the known vendor installations and the devices of an account.
//! - Dump every register of a device with its current value.
//! - Read and write single registers, by value or by option label.
//! - Set the stove clock to the local time.
//! - Run in a continuous daemon mode that polls every device and prints the
//!   main values to the console.
//!
//! The CLI leverages the `aguaiot_lib` crate for the cloud protocol.

use aguaiot_lib::client::Client;
use aguaiot_lib::config::{ClientConfig, Endpoint, ENDPOINTS};
use aguaiot_lib::device::{ClockTime, Device};
use anyhow::{bail, Context, Result};
use chrono::{Datelike, Timelike};
use clap::Parser;
use dialoguer::{Input, Password};
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::panic;
use std::time::Duration;

mod commandline;

/// HTTP stack crates that stay at `warn` unless `RUST_LOG` says otherwise.
const QUIET_MODULES: [&str; 4] = ["reqwest", "hyper", "hyper_util", "rustls"];

/// Log specification for `loglevel`, keeping the HTTP stack quiet below trace.
fn log_spec(loglevel: LevelFilter) -> String {
    let mut spec = loglevel.as_str().to_lowercase();
    if loglevel < LevelFilter::Trace && loglevel > LevelFilter::Warn {
        for module in QUIET_MODULES {
            spec.push_str(&format!(", {module}=warn"));
        }
    }
    spec
}

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(log_spec(loglevel))
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let location = panic_info.location().map_or_else(
            || "<unknown location>".to_string(),
            |loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()),
        );
        let payload = panic_info.payload();
        let cause = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("<unknown cause>");
        error!(
            target: "panic",
            "aguactl thread '{}' panicked at {location}: {cause}",
            std::thread::current().name().unwrap_or("<unnamed>"),
        );
    }));
    log_handle
}

/// Points `config` at `endpoint` and applies the command line overrides.
fn apply_overrides(
    mut config: ClientConfig,
    endpoint: Option<&Endpoint>,
    email: Option<&str>,
    timeout: Option<Duration>,
) -> ClientConfig {
    if let Some(endpoint) = endpoint {
        config.api_url = endpoint.api_url.to_string();
        config.customer_code = endpoint.customer_code.to_string();
        config.login_api_url = endpoint.login_api_url.map(str::to_string);
        config.brand_id = endpoint.brand_id.map(str::to_string);
        config.brand = endpoint.brand.map(str::to_string);
    }
    if let Some(email) = email {
        config.email = email.to_string();
    }
    if let Some(timeout) = timeout {
        config.http_timeout = timeout;
    }
    config
}

/// Builds the client configuration from the config file and the command line,
/// prompting for whatever is still missing.
fn load_config(args: &commandline::CliArgs) -> Result<ClientConfig> {
    let endpoint = args
        .endpoint
        .as_deref()
        .map(|name| {
            Endpoint::find(name)
                .with_context(|| format!("Unknown endpoint '{name}', see `aguactl endpoints`"))
        })
        .transpose()?;

    let config = match (args.config.exists(), endpoint) {
        (true, _) => ClientConfig::load(&args.config)
            .with_context(|| format!("Cannot load config file {}", args.config.display()))?,
        (false, Some(endpoint)) => ClientConfig::from_endpoint(endpoint, "", "", ""),
        (false, None) => bail!(
            "Config file {} not found and no --endpoint given",
            args.config.display()
        ),
    };
    let mut config = apply_overrides(config, endpoint, args.email.as_deref(), args.timeout);

    if config.email.is_empty() {
        config.email = Input::<String>::new()
            .with_prompt("Email")
            .interact_text()
            .context("Failed to read email")?;
    }
    if config.password.is_empty() {
        config.password = Password::new()
            .with_prompt(format!("Password for {}", config.email))
            .interact()
            .context("Failed to read password")?;
    }
    if config.unique_id.is_empty() {
        config.unique_id = uuid::Uuid::new_v4().to_string();
        info!(
            "No unique_id configured, registering as {}",
            config.unique_id
        );
    }
    Ok(config)
}

fn find_device<'a>(client: &'a Client, name: &str) -> Result<&'a Device> {
    client
        .device(name)
        .with_context(|| format!("No device '{name}' on this account"))
}

fn print_device_summary(device: &Device) {
    let show = |value: Option<String>| value.unwrap_or_else(|| "-".to_string());
    println!(
        "{} [{}]: status={} air={} set={} water={} power={} ({})",
        device.name(),
        device.id_device(),
        show(device.status().map(|v| v.to_string())),
        show(device.air_temperature().map(|v| v.to_string())),
        show(device.set_air_temperature().map(|v| v.to_string())),
        show(device.water_temperature().map(|v| v.to_string())),
        show(device.power().map(|v| v.to_string())),
        device.hybrid_mode(),
    );
}

fn print_register(device: &Device, key: &str) {
    match device.get_register(key) {
        Some(reading) => {
            let description = device
                .get_register_value_description(key, None)
                .map(|d| d.to_string())
                .unwrap_or_else(|| "-".to_string());
            let enabled = match device.get_register_enabled(key) {
                Ok(enabled) => enabled.to_string(),
                Err(err) => format!("error ({err})"),
            };
            println!(
                "{key}: {description} (value={}, raw={}, min={}, max={}, enabled={enabled})",
                device
                    .get_register_value_formatted(key)
                    .unwrap_or_else(|| reading.value.to_string()),
                reading.value_raw,
                reading
                    .descriptor
                    .set_min
                    .map_or_else(|| "-".to_string(), |v| v.to_string()),
                reading
                    .descriptor
                    .set_max
                    .map_or_else(|| "-".to_string(), |v| v.to_string()),
            );
        }
        None if device.has_register(key) => println!("{key}: not available"),
        None => println!("{key}: unknown register"),
    }
}

async fn run_daemon(client: &Client, poll_interval: Duration) -> Result<()> {
    info!("Starting daemon mode: interval={poll_interval:?}");
    loop {
        for device in client.devices() {
            print_device_summary(device);
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                client.shutdown();
                return Ok(());
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }
        debug!("Daemon: Updating devices...");
        if let Err(err) = client.update().await {
            // The next tick retries.
            warn!("Update failed: {err}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    // 1. Initialize logging as early as possible
    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "Agua IOT CLI started. Log level: {}",
        args.verbose.log_level_filter()
    );

    // 2. Commands without an account
    if args.command == commandline::CliCommands::Endpoints {
        for endpoint in ENDPOINTS {
            println!("{:<32} {}", endpoint.name, endpoint.api_url);
        }
        return Ok(());
    }

    // 3. Connect
    let config = load_config(&args)?;
    debug!("Using {config:?}");
    let mut client = Client::new(config).context("Cannot create client")?;
    client.connect().await.map_err(|err| {
        if err.is_auth() {
            anyhow::Error::new(err).context("Login refused, check email and password")
        } else {
            anyhow::Error::new(err).context("Cannot connect to the Agua IOT cloud")
        }
    })?;

    // 4. Execute the command
    match &args.command {
        commandline::CliCommands::Endpoints => {}
        commandline::CliCommands::Devices => {
            for device in client.devices() {
                println!(
                    "{} [id={}, id_device={}, product={}, online={}, hybrid={}]",
                    device.name(),
                    device.id(),
                    device.id_device(),
                    device.name_product(),
                    device.is_online(),
                    device.hybrid()
                );
            }
        }
        commandline::CliCommands::Registers { device } => {
            let device = find_device(&client, device)?;
            for key in device.registers() {
                print_register(device, &key);
            }
        }
        commandline::CliCommands::Get { device, key } => {
            let device = find_device(&client, device)?;
            print_register(device, key);
            let options = device.get_register_value_options(key, None);
            if !options.is_empty() {
                let labels: Vec<String> = options
                    .iter()
                    .map(|(value, label)| format!("{value}={label}"))
                    .collect();
                println!("  options: {}", labels.join(", "));
            }
        }
        commandline::CliCommands::Set {
            device,
            key,
            value,
            raw,
        } => {
            info!("Executing: Set {key} to {value}");
            let device = find_device(&client, device)?;
            device
                .set_register_value(key, *value, *raw)
                .await
                .with_context(|| format!("Failed to set {key} to {value}"))?;
            println!("{key} set to {value} successfully.");
        }
        commandline::CliCommands::SetOption {
            device,
            key,
            label,
            language,
        } => {
            info!("Executing: Set {key} to option '{label}'");
            let device = find_device(&client, device)?;
            device
                .set_register_value_description(key, label, None, language.as_deref())
                .await
                .with_context(|| format!("Failed to set {key} to '{label}'"))?;
            println!("{key} set to '{label}' successfully.");
        }
        commandline::CliCommands::On { device } => {
            let device = find_device(&client, device)?;
            info!("Executing: Turn on '{}'", device.name());
            device.turn_on().await.context("Failed to turn on")?;
            println!("'{}' turned on.", device.name());
        }
        commandline::CliCommands::Off { device } => {
            let device = find_device(&client, device)?;
            info!("Executing: Turn off '{}'", device.name());
            device.turn_off().await.context("Failed to turn off")?;
            println!("'{}' turned off.", device.name());
        }
        commandline::CliCommands::SyncClock { device } => {
            let device = find_device(&client, device)?;
            let now = chrono::Local::now();
            info!("Executing: Sync clock of '{}' to {now}", device.name());
            device
                .sync_clock(ClockTime {
                    hour: now.hour(),
                    minute: now.minute(),
                    day: now.day(),
                    month: now.month(),
                    year: now.year(),
                })
                .await
                .context("Failed to set the clock")?;
            println!("Clock of '{}' set to {}.", device.name(), now.format("%Y-%m-%d %H:%M"));
        }
        commandline::CliCommands::Daemon { poll_interval } => {
            run_daemon(&client, *poll_interval).await?;
        }
    }

    client.shutdown();
    Ok(())
}
