use aguaiot_lib::formula::Number;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "aguaiot.yml";

fn parse_number(s: &str) -> Result<Number, String> {
    s.parse::<Number>()
        .map_err(|e| format!("Invalid number format: {e}"))
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// List the vendor installations (apps) this tool knows about.
    Endpoints,

    /// List the devices of the account.
    Devices,

    /// List the registers of a device with their current values.
    Registers {
        /// Device id, `id_device` or name.
        device: String,
    },

    /// Read a single register.
    Get {
        /// Device id, `id_device` or name.
        device: String,
        /// Register key, e.g. "temp_air_get".
        key: String,
    },

    /// Write a single register.
    /// The value is given in display units and converted with the
    /// register's inverse formula before it is sent.
    #[clap(verbatim_doc_comment)]
    Set {
        /// Device id, `id_device` or name.
        device: String,
        /// Register key, e.g. "temp_air_set".
        key: String,
        /// New value, e.g. "21.5".
        #[arg(value_parser = parse_number, allow_negative_numbers = true)]
        value: Number,
        /// Check the register bounds against the converted raw value.
        #[arg(long)]
        raw: bool,
    },

    /// Write an enumerated register by its label, e.g. "P3" for a power level.
    SetOption {
        /// Device id, `id_device` or name.
        device: String,
        /// Register key, e.g. "power_set".
        key: String,
        /// Label as listed by `get`.
        label: String,
        /// Language of the label. Defaults to the configured language.
        #[arg(long)]
        language: Option<String>,
    },

    /// Switch a stove on.
    On {
        /// Device id, `id_device` or name.
        device: String,
    },

    /// Switch a stove off.
    Off {
        /// Device id, `id_device` or name.
        device: String,
    },

    /// Set the stove clock and calendar to the local time of this machine.
    SyncClock {
        /// Device id, `id_device` or name.
        device: String,
    },

    /// Run in daemon mode: read every device at a fixed interval and print
    /// the main values. Failed reads are logged and retried on the next tick.
    #[clap(verbatim_doc_comment)]
    Daemon {
        /// Interval between reads (e.g., "30s", "1m")
        #[arg(value_parser = humantime::parse_duration, short, long, default_value = "60s", verbatim_doc_comment)]
        poll_interval: Duration,
    },
}

const fn about_text() -> &'static str {
    "Agua IOT CLI - Read and control pellet and wood stoves through the Agua IOT cloud."
}

#[derive(Parser, Debug)]
#[command(name="aguactl", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is off.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// YAML file holding the account configuration.
    #[arg(global = true, short, long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Use a known installation by app name instead of `api_url` and
    /// `customer_code` from the configuration file. See `endpoints`.
    #[arg(global = true, long, verbatim_doc_comment)]
    pub endpoint: Option<String>,

    /// Account email, overriding the configuration file.
    #[arg(global = true, long)]
    pub email: Option<String>,

    /// HTTP timeout for a single request.
    /// Examples: "10s", "1m".
    #[arg(global = true, long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Option<Duration>,

    #[command(subcommand)]
    pub command: CliCommands,
}
