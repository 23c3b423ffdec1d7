// dtctl - CLI for the Darktrace API
// Copyright (C) 2024 Mathias Uhl <mathiasuhl@gmx.de>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

mod breaches;
mod catalog;
mod cef;
mod client;
mod config;
mod crypto;
mod details;
mod devices;
mod intel;
mod models;
mod output;
mod report;
mod subnets;
mod system;
mod tags;
#[cfg(test)]
mod testing;
mod timeutils;
mod validate;

use crate::breaches::{BreachList, BreachReport};
use crate::catalog::Catalog;
use crate::cef::Cef;
use crate::client::{ApiClient, ApiQuery, TlsOptions};
use crate::config::{ConfigError, Key, Overrides, Scope, Source};
use crate::details::{DetailsQuery, DetailsTarget};
use crate::models::{InputDiff, ModelFilter};
use crate::output::{Output, OutputFormat, RenderOpts};
use crate::report::ReportFormat;
use crate::timeutils::DateRange;
use anyhow::{Context, Result, anyhow, bail};
use chrono::{Local, NaiveDate};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::info;

const BREACH_COLUMNS: &[&str] = &["pbid", "time", "score", "commentCount", "acknowledged"];
const MODEL_COLUMNS: &[&str] = &["pid", "name", "active", "modified", "autoUpdate"];
const DEVICE_COLUMNS: &[&str] = &["did", "hostname", "ip", "macaddress", "typelabel", "os", "lastSeen"];

#[derive(Parser)]
#[command(
    name = "dtctl",
    version,
    about = "CLI for the Darktrace REST API"
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "URL",
        help = "Host address of the Darktrace API, including scheme (https://)"
    )]
    host: Option<String>,

    #[arg(long, short = 'p', global = true, help = "Public key for the Darktrace API")]
    pub_dtkey: Option<String>,

    #[arg(
        long,
        short = 's',
        global = true,
        help = "Private key for the Darktrace API (not recommended, visible in shell history)"
    )]
    priv_dtkey: Option<String>,

    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "CA certificate (PEM) that issued the API certificate"
    )]
    cacert: Option<PathBuf>,

    #[arg(long, global = true, help = "Skip certificate verification")]
    insecure: bool,

    #[arg(long, global = true, help = "Log requests and other debug output to stderr")]
    debug: bool,

    #[arg(
        long,
        short = 'c',
        global = true,
        value_name = "PATH",
        help = "Use this config file instead of the user and project files"
    )]
    config_file: Option<PathBuf>,

    #[arg(
        long,
        value_enum,
        default_value_t = OutputFormat::Json,
        global = true,
        help = "Output format (propagates to subcommands)"
    )]
    format: OutputFormat,

    #[arg(long, short = 'o', global = true, value_name = "PATH", help = "Full path to the output file")]
    outfile: Option<PathBuf>,

    #[arg(
        long,
        value_name = "COL1,COL2",
        global = true,
        help = "Override table columns (comma-separated)"
    )]
    columns: Option<String>,

    #[arg(
        long,
        value_name = "COLUMN",
        global = true,
        help = "Sort table rows by column (ascending)"
    )]
    sort_by: Option<String>,

    #[arg(
        long,
        value_name = "TEXT",
        global = true,
        help = "Filter rows containing TEXT (case-insensitive)"
    )]
    filter: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Model breaches
    #[command(subcommand)]
    Breaches(BreachesCommand),
    /// Model components
    #[command(subcommand)]
    Components(ListCommand),
    /// Read or write dtctl configuration
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Connection and event details
    #[command(subcommand)]
    Details(DetailsCommand),
    /// Devices seen by Darktrace
    #[command(subcommand)]
    Devices(DevicesCommand),
    /// Filter types available to model components
    #[command(subcommand)]
    Filters(ListCommand),
    /// Intelligence feed (watchlist)
    #[command(subcommand)]
    Intelfeed(IntelfeedCommand),
    /// Metrics available to models
    #[command(subcommand)]
    Metrics(ListCommand),
    /// Models, their updates and reports
    #[command(subcommand)]
    Models(ModelsCommand),
    /// Send custom requests to the API
    #[command(subcommand)]
    Query(QueryCommand),
    /// Subnets seen by Darktrace
    #[command(subcommand)]
    Subnets(SubnetsCommand),
    /// Appliance status and usage
    #[command(subcommand)]
    System(SystemCommand),
    /// Device tags
    #[command(subcommand)]
    Tags(TagsCommand),
    /// Generate shell completion scripts
    Completion {
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Args, Clone, Copy)]
struct DateArgs {
    #[arg(
        long,
        short = 'd',
        default_value_t = 7,
        help = "Number of days in the past for the start date"
    )]
    days: u32,
    #[arg(
        long,
        value_name = "DD-MM-YYYY",
        value_parser = timeutils::parse_input_date,
        help = "Start date (overrides --days)"
    )]
    start_date: Option<NaiveDate>,
    #[arg(
        long,
        value_name = "DD-MM-YYYY",
        value_parser = timeutils::parse_input_date,
        help = "End date (defaults to today)"
    )]
    end_date: Option<NaiveDate>,
}

impl DateArgs {
    fn range(self) -> Result<DateRange> {
        timeutils::determine_date_range(self.days, self.start_date, self.end_date, timeutils::today())
    }
}

#[derive(Subcommand)]
enum ListCommand {
    /// List all entries
    List,
}

#[derive(Subcommand)]
enum BreachesCommand {
    /// List model breaches
    List {
        #[arg(value_enum)]
        which: BreachListArg,
        #[command(flatten)]
        dates: DateArgs,
    },
    /// Generate an XLSX or CSV breach report
    Report {
        #[arg(value_enum)]
        kind: BreachReportArg,
        #[command(flatten)]
        dates: DateArgs,
        #[arg(long, short = 'f', value_enum, default_value_t = ReportFormatArg::Xlsx)]
        output: ReportFormatArg,
        #[arg(
            long,
            short = 't',
            value_name = "PATH",
            help = "Template workbook with a \"RawData\" sheet to append to"
        )]
        template: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print one configured value
    Get {
        #[arg(value_enum)]
        option: KeyArg,
    },
    /// Store a value; keys are prompted for when no value is given
    Set {
        #[arg(value_enum)]
        option: KeyArg,
        #[arg(long, short = 'v')]
        value: Option<String>,
        #[arg(
            long,
            value_enum,
            default_value_t = ScopeArg::User,
            help = "Where to write the config (local project dir or user config dir)"
        )]
        scope: ScopeArg,
    },
    /// Show current configuration (secrets masked)
    Show,
}

#[derive(Args, Clone)]
struct DetailsArgs {
    #[arg(long, default_value = "connection", help = "connection, unusualconnection, newconnection, notice, devicehistory or modelbreach")]
    event_type: String,
    #[arg(long, default_value_t = 100)]
    count: u32,
    #[arg(long, short = 'd', help = "Only events from the past number of days")]
    days: Option<u32>,
}

#[derive(Subcommand)]
enum DetailsCommand {
    /// Events for a device id
    Device {
        did: i64,
        #[command(flatten)]
        args: DetailsArgs,
    },
    /// Events for an external hostname
    Host {
        hostname: String,
        #[command(flatten)]
        args: DetailsArgs,
    },
    /// Events matching a message
    Msg {
        msg: String,
        #[command(flatten)]
        args: DetailsArgs,
    },
    /// Events of a model breach
    Breach {
        pbid: i64,
        #[command(flatten)]
        args: DetailsArgs,
    },
    /// Events of a single connection
    Connection {
        uid: String,
        #[command(flatten)]
        args: DetailsArgs,
    },
}

#[derive(Subcommand)]
enum DevicesCommand {
    /// Devices seen recently
    List {
        #[arg(long, short = 'd', default_value_t = 1, help = "Devices with activity in the past number of days")]
        days: u32,
        #[arg(long, help = "Devices with activity within the number of seconds (overrides --days)")]
        seconds: Option<u64>,
    },
    /// Detailed information for a device
    Info {
        did: i64,
        #[arg(long, short = 'l', help = "Show full device details")]
        full_device_details: bool,
    },
    /// Look up a device by internal IP address
    Ip {
        ip: String,
        #[arg(long, short = 'd', default_value_t = 1)]
        days: u32,
    },
}

#[derive(Subcommand)]
enum IntelfeedCommand {
    /// List watchlist entries
    List {
        #[arg(long)]
        full_details: bool,
    },
    /// Add a domain, hostname or IPv4 address
    Add { entry: String },
    /// Remove a domain, hostname or IPv4 address
    Remove { entry: String },
}

#[derive(Subcommand)]
enum ModelsCommand {
    /// List models
    List {
        #[arg(long, short = 'e', conflicts_with = "tag", help = "Only models with \"*Enhanced*\" tags")]
        enhanced_only: bool,
        #[arg(long, short = 'a', help = "Only active models")]
        active_only: bool,
        #[arg(long, short = 'w', help = "Include model components")]
        with_components: bool,
        #[arg(long, short = 't', help = "Only models with a matching tag (case-insensitive)")]
        tag: Option<String>,
    },
    /// Models matching top-level key=value pairs
    Select {
        #[arg(required = true, value_name = "KEY=VALUE")]
        selectors: Vec<String>,
    },
    /// Case-insensitive name search (* and ? supported)
    Search {
        #[arg(long, short = 'n')]
        name: String,
    },
    /// Models with auto-update configured
    Autoupdatable,
    /// Models with pending updates
    PendingUpdates,
    /// Models that can be updated without losing custom changes
    Updatable,
    /// Changes waiting in pending model updates
    UpdateDiff,
    /// Compare models against a list of names
    InputDiff {
        #[arg(value_enum)]
        arg: InputDiffArg,
        #[arg(long, short = 'i', value_name = "PATH", help = "File with one model name per line")]
        infile: PathBuf,
        #[command(flatten)]
        dates: DateArgs,
        #[arg(long, short = 'e')]
        enhanced_only: bool,
        #[arg(long, short = 'a')]
        active_only: bool,
    },
    /// Excel report of models or breaches per model
    Report {
        #[arg(value_enum)]
        arg: ModelReportArg,
        #[command(flatten)]
        dates: DateArgs,
        #[arg(long, short = 'a')]
        active_only: bool,
    },
}

#[derive(Subcommand)]
enum QueryCommand {
    /// Signed GET of any endpoint, query string included
    Get { endpoint: String },
    /// Signed POST; the body is also sent as query parameters
    Post {
        endpoint: String,
        #[arg(long, short = 'b', value_name = "KEY=VALUE")]
        body: String,
    },
}

#[derive(Subcommand)]
enum SubnetsCommand {
    /// Unique IPv4 subnets
    List,
    /// CIDR-merged IPv4 subnets
    Aggregates,
    /// IPv4 subnets per instance
    Instances,
    /// DHCP tracking quality per instance
    Dhcp,
    /// Unidirectional traffic per instance
    Unidirectional,
    /// Number of devices seen
    Devices,
}

#[derive(Subcommand)]
enum SystemCommand {
    /// Version, time and uptime
    Info,
    /// Detailed status of instances and probes
    Status,
    /// Resource usage of instances and probes
    Usage,
    /// Configured tags
    Tags,
    /// Summary statistics
    SummaryStatistics,
    /// Instance ids, labels and locations
    Instances,
    /// Account audit log
    Auditlog {
        #[arg(long, default_value_t = 0)]
        offset: u32,
        #[arg(long, short = 'l', default_value_t = 30)]
        limit: u32,
    },
    #[command(hide = true)]
    Moo,
}

#[derive(Subcommand)]
enum TagsCommand {
    /// List tags
    List {
        #[arg(long)]
        tag: Option<String>,
    },
    /// Tag or untag a device
    #[command(subcommand)]
    Device(TagDeviceCommand),
    /// Search tags by name, or list devices carrying a tag
    Search {
        #[arg(long, short = 'n', conflicts_with = "devices_tagged_with", required_unless_present = "devices_tagged_with")]
        name: Option<String>,
        #[arg(long)]
        devices_tagged_with: Option<String>,
    },
}

#[derive(Subcommand)]
enum TagDeviceCommand {
    /// Add a tag to a device
    Add {
        #[arg(long)]
        tag: String,
        #[arg(long)]
        did: i64,
    },
    /// Remove a tag from a device
    Delete {
        #[arg(long)]
        tag: String,
        #[arg(long)]
        did: i64,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ScopeArg {
    Local,
    User,
}

impl From<ScopeArg> for Scope {
    fn from(value: ScopeArg) -> Self {
        match value {
            ScopeArg::Local => Scope::Local,
            ScopeArg::User => Scope::User,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KeyArg {
    Host,
    PubDtkey,
    Dtkey,
    SecureDtkey,
    Cacert,
}

impl From<KeyArg> for Key {
    fn from(value: KeyArg) -> Self {
        match value {
            KeyArg::Host => Key::Host,
            KeyArg::PubDtkey => Key::PubDtkey,
            KeyArg::Dtkey => Key::Dtkey,
            KeyArg::SecureDtkey => Key::SecureDtkey,
            KeyArg::Cacert => Key::Cacert,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BreachListArg {
    All,
    Acknowledged,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BreachReportArg {
    Brief,
    Commented,
    Acknowledged,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ReportFormatArg {
    Xlsx,
    Csv,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum InputDiffArg {
    New,
    Deleted,
    Changed,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModelReportArg {
    All,
    BreachSummary,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    let cwd = std::env::current_dir().context("reading current directory")?;
    let source = match &cli.config_file {
        Some(path) => Source::File(path.clone()),
        None => Source::Layered,
    };

    match &cli.command {
        Commands::Config(command) => return handle_config(command, &source, &cwd),
        Commands::Completion { shell } => {
            print_completion(*shell);
            return Ok(());
        }
        Commands::System(SystemCommand::Moo) => {
            println!("{}", system::MOO);
            return Ok(());
        }
        _ => {}
    }

    let overrides = Overrides {
        host: cli.host.clone(),
        pub_dtkey: cli.pub_dtkey.clone(),
        priv_dtkey: cli.priv_dtkey.clone(),
        cacert: cli.cacert.clone(),
        insecure: cli.insecure,
    };
    let effective = config::resolve(&source, &cwd, overrides, prompt_secret)?;
    let client = ApiClient::new(
        &effective.host,
        &effective.public_key,
        &effective.private_key,
        &TlsOptions {
            cacert: effective.cacert.clone(),
            insecure: effective.insecure,
        },
    )?;

    let output = Output {
        format: cli.format,
        outfile: cli.outfile.clone(),
        render: RenderOpts {
            columns_override: cli.columns.as_ref().map(|c| {
                c.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            }),
            sort_by: cli.sort_by.clone(),
            filter: cli.filter.clone(),
        },
    };

    run(cli.command, &client, &output, &effective.host)
}

fn init_tracing(debug: bool) {
    let default_filter = if debug { "dtctl=debug" } else { "dtctl=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn prompt_secret(message: &str) -> Result<String> {
    rpassword::prompt_password(message).context("reading from terminal")
}

fn print_completion(shell: CompletionShell) {
    use clap_complete::{generate, shells};
    let mut cmd = Cli::command();
    let bin = cmd.get_name().to_string();
    match shell {
        CompletionShell::Bash => generate(shells::Bash, &mut cmd, bin, &mut std::io::stdout()),
        CompletionShell::Zsh => generate(shells::Zsh, &mut cmd, bin, &mut std::io::stdout()),
        CompletionShell::Fish => generate(shells::Fish, &mut cmd, bin, &mut std::io::stdout()),
        CompletionShell::PowerShell => {
            generate(shells::PowerShell, &mut cmd, bin, &mut std::io::stdout())
        }
    }
}

fn handle_config(command: &ConfigCommand, source: &Source, cwd: &Path) -> Result<()> {
    match command {
        ConfigCommand::Get { option } => {
            let key = Key::from(*option);
            let merged = config::load(source, cwd)?;
            match merged.get(key) {
                Some(value) => println!("{value}"),
                None => bail!("{} is not configured", key.name()),
            }
        }
        ConfigCommand::Set {
            option,
            value,
            scope,
        } => {
            let key = Key::from(*option);
            let path = config::target_path(source, (*scope).into(), cwd)?;
            let mut existing = config::load_path(&path)?;
            let stored = config_value(key, value.clone())?;
            existing.set(key, stored);
            config::save(&path, &existing)?;
            println!("Saved {} to {}", key.name(), path.display());
        }
        ConfigCommand::Show => {
            let mut masked = config::load(source, cwd)?;
            for key in Key::ALL.into_iter().filter(|key| key.is_secret()) {
                if masked.get(key).is_some() {
                    masked.set(key, "*****".into());
                }
            }
            println!(
                "{}",
                output::to_indented_json(&serde_json::to_value(&masked)?)?
            );
        }
    }
    Ok(())
}

/// The text stored for `key`. Private keys are prompted for when not given,
/// and `secure-dtkey` is encrypted with a prompted password.
fn config_value(key: Key, value: Option<String>) -> Result<String> {
    match key {
        Key::Dtkey => {
            let private_key = match value {
                Some(value) => value,
                None => prompt_secret("Private API key: ")?,
            };
            tracing::warn!("storing the private key in plaintext; prefer secure-dtkey");
            Ok(private_key)
        }
        Key::SecureDtkey => {
            let private_key = match value {
                Some(value) => value,
                None => prompt_secret("Private API key: ")?,
            };
            let password = prompt_secret("Password: ")?;
            if password != prompt_secret("Repeat password: ")? {
                bail!("Passwords do not match");
            }
            Ok(crypto::encrypt(&password, private_key.trim()))
        }
        other => value.ok_or_else(|| ConfigError::MissingValue(other.name()).into()),
    }
}

fn details_query(target: DetailsTarget, args: DetailsArgs) -> Result<DetailsQuery> {
    let range = args
        .days
        .map(|days| timeutils::determine_date_range(days, None, None, timeutils::today()))
        .transpose()?;
    Ok(DetailsQuery {
        target,
        event_type: args.event_type,
        count: args.count,
        range,
    })
}

/// Splits `/path?k=v&...` into the path and its decoded query pairs.
fn split_endpoint(endpoint: &str) -> Result<(String, Vec<(String, String)>)> {
    let endpoint = if endpoint.starts_with('/') {
        endpoint.to_string()
    } else {
        format!("/{endpoint}")
    };
    let parsed = reqwest::Url::parse(&format!("http://dtctl{endpoint}"))
        .with_context(|| format!("invalid endpoint {endpoint}"))?;
    let pairs = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    Ok((parsed.path().to_string(), pairs))
}

fn borrowed(pairs: &[(String, String)]) -> Vec<(&str, String)> {
    pairs.iter().map(|(k, v)| (k.as_str(), v.clone())).collect()
}

fn report_outfile(outfile: Option<&PathBuf>, prefix: &str, arg: &str, extension: &str) -> PathBuf {
    outfile.cloned().unwrap_or_else(|| {
        PathBuf::from(format!(
            "./{prefix}_{arg}_{}.{extension}",
            Local::now().format("%Y-%m-%d_%H.%M.%S")
        ))
    })
}

fn run<A: ApiQuery + ?Sized>(command: Commands, api: &A, output: &Output, host: &str) -> Result<()> {
    match command {
        Commands::Breaches(command) => match command {
            BreachesCommand::List { which, dates } => {
                let which = match which {
                    BreachListArg::All => BreachList::All,
                    BreachListArg::Acknowledged => BreachList::Acknowledged,
                };
                let found = breaches::list_breaches(api, which, &dates.range()?)?;
                output.emit(&Value::Array(found), Some(BREACH_COLUMNS), None)?
            }
            BreachesCommand::Report {
                kind,
                dates,
                output: format,
                template,
            } => {
                let kind = match kind {
                    BreachReportArg::Brief => BreachReport::Brief,
                    BreachReportArg::Commented => BreachReport::Commented,
                    BreachReportArg::Acknowledged => BreachReport::Acknowledged,
                };
                let format = match format {
                    ReportFormatArg::Xlsx => ReportFormat::Xlsx,
                    ReportFormatArg::Csv => ReportFormat::Csv,
                };
                let path = report_outfile(output.outfile.as_ref(), "breaches", kind.name(), format.extension());
                let table = breaches::report(api, kind, &dates.range()?, host)?;
                report::write_report(&table, &path, template.as_deref(), format)?;
                info!(path = %path.display(), rows = table.rows.len(), "report written");
            }
        },
        Commands::Components(ListCommand::List) => {
            output.emit(&catalog::list(api, Catalog::Components)?, Some(&["cid", "chid", "mlid", "active"]), None)?
        }
        Commands::Filters(ListCommand::List) => {
            output.emit(&catalog::list(api, Catalog::FilterTypes)?, None, None)?
        }
        Commands::Metrics(ListCommand::List) => {
            output.emit(&catalog::list(api, Catalog::Metrics)?, Some(&["mlid", "name", "label", "units"]), None)?
        }
        Commands::Details(command) => {
            let query = match command {
                DetailsCommand::Device { did, args } => details_query(DetailsTarget::Device(did), args),
                DetailsCommand::Host { hostname, args } => details_query(DetailsTarget::Host(hostname), args),
                DetailsCommand::Msg { msg, args } => details_query(DetailsTarget::Message(msg), args),
                DetailsCommand::Breach { pbid, args } => details_query(DetailsTarget::Breach(pbid), args),
                DetailsCommand::Connection { uid, args } => {
                    details_query(DetailsTarget::Connection(uid), args)
                }
            }?;
            output.emit(&details::details(api, &query)?, None, None)?
        }
        Commands::Devices(command) => match command {
            DevicesCommand::List { days, seconds } => {
                output.emit(&devices::list_devices(api, days, seconds)?, Some(DEVICE_COLUMNS), None)?
            }
            DevicesCommand::Info {
                did,
                full_device_details,
            } => output.emit(&devices::device_info(api, did, full_device_details)?, None, None)?,
            DevicesCommand::Ip { ip, days } => {
                output.emit(&devices::device_by_ip(api, &ip, days)?, Some(DEVICE_COLUMNS), None)?
            }
        },
        Commands::Intelfeed(command) => {
            let result = match command {
                IntelfeedCommand::List { full_details } => intel::list_entries(api, full_details)?,
                IntelfeedCommand::Add { entry } => intel::add_entry(api, &entry)?,
                IntelfeedCommand::Remove { entry } => intel::remove_entry(api, &entry)?,
            };
            output.emit(&result, None, None)?
        }
        Commands::Models(command) => run_models(command, api, output)?,
        Commands::Query(command) => {
            let result = match command {
                QueryCommand::Get { endpoint } => {
                    let (path, query) = split_endpoint(&endpoint)?;
                    api.get(&path, &borrowed(&query))?
                }
                QueryCommand::Post { endpoint, body } => {
                    let (path, query) = split_endpoint(&endpoint)?;
                    let (key, value) = body
                        .split_once('=')
                        .filter(|(key, value)| !key.is_empty() && !value.contains('='))
                        .ok_or_else(|| anyhow!("Invalid POST body.\nBody must be of format key=value"))?;
                    api.post(&path, &[(key, value.to_string())], &borrowed(&query))?
                }
            };
            output.emit(&result, None, None)?
        }
        Commands::Subnets(command) => match command {
            SubnetsCommand::List => output.emit_serialized(&subnets::list_subnets(api)?, None)?,
            SubnetsCommand::Aggregates => output.emit_serialized(&subnets::aggregates(api)?, None)?,
            SubnetsCommand::Instances => {
                output.emit(&Value::Object(subnets::subnets_per_instance(api)?), None, None)?
            }
            SubnetsCommand::Dhcp => {
                let stats = serde_json::to_value(subnets::dhcp_stats(api)?)?;
                output.emit(&stats, None, Some(&Cef::with_severity(120, "DHCP Quality", 4)))?
            }
            SubnetsCommand::Unidirectional => {
                let mut traffic = serde_json::Map::new();
                for (name, stats) in subnets::unidirectional(api)? {
                    traffic.insert(name, serde_json::to_value(stats)?);
                }
                output.emit(&Value::Object(traffic), None, None)?
            }
            SubnetsCommand::Devices => output.emit_serialized(&subnets::device_counts(api)?, None)?,
        },
        Commands::System(command) => match command {
            SystemCommand::Info => output.emit(&system::info(api)?, None, None)?,
            SystemCommand::Status => output.emit(&system::status(api)?, None, None)?,
            SystemCommand::Usage => match output.format {
                OutputFormat::Log | OutputFormat::Cef | OutputFormat::Table => output.emit(
                    &system::usage_records(api)?,
                    Some(&["system", "type", "label", "cpu", "memused", "bandwidth", "dtqueue"]),
                    Some(&Cef::new(100, "System Usage")),
                )?,
                OutputFormat::Json => output.emit(&system::usage(api)?, None, None)?,
            },
            SystemCommand::Tags => output.emit(&system::tags(api)?, Some(&["tid", "name", "expiry"]), None)?,
            SystemCommand::SummaryStatistics => {
                output.emit(&system::summary_statistics(api)?, None, None)?
            }
            SystemCommand::Instances => output.emit(&system::instances(api)?, None, None)?,
            SystemCommand::Auditlog { offset, limit } => {
                output.emit(&system::auditlog(api, offset, limit)?, None, None)?
            }
            SystemCommand::Moo => println!("{}", system::MOO),
        },
        Commands::Tags(command) => match command {
            TagsCommand::List { tag } => {
                output.emit(&tags::list_tags(api, tag.as_deref())?, Some(&["tid", "name", "expiry"]), None)?
            }
            TagsCommand::Device(TagDeviceCommand::Add { tag, did }) => {
                output.emit(&tags::add_device_tag(api, did, &tag)?, None, None)?
            }
            TagsCommand::Device(TagDeviceCommand::Delete { tag, did }) => {
                output.emit(&tags::delete_device_tag(api, did, &tag)?, None, None)?
            }
            TagsCommand::Search {
                name,
                devices_tagged_with,
            } => match (name, devices_tagged_with) {
                (_, Some(tag)) => {
                    output.emit(&tags::devices_tagged_with(api, &tag)?, Some(DEVICE_COLUMNS), None)?
                }
                (Some(name), None) => {
                    output.emit(&Value::Array(tags::search_tags(api, &name)?), Some(&["tid", "name"]), None)?
                }
                (None, None) => bail!("either --name or --devices-tagged-with is required"),
            },
        },
        Commands::Config(_) | Commands::Completion { .. } => {
            bail!("command does not talk to the API")
        }
    }
    Ok(())
}

fn run_models<A: ApiQuery + ?Sized>(command: ModelsCommand, api: &A, output: &Output) -> Result<()> {
    match command {
        ModelsCommand::List {
            enhanced_only,
            active_only,
            with_components,
            tag,
        } => {
            let filter = ModelFilter {
                enhanced_only,
                active_only,
            };
            let found = models::list_models(api, &filter, with_components, tag.as_deref())?;
            output.emit(&serde_json::to_value(found)?, Some(MODEL_COLUMNS), None)?
        }
        ModelsCommand::Select { selectors } => {
            let parsed = selectors
                .iter()
                .map(|raw| models::parse_selector(raw))
                .collect::<Result<Vec<_>>>()?;
            output.emit(&Value::Array(models::select_models(api, &parsed)?), Some(MODEL_COLUMNS), None)?
        }
        ModelsCommand::Search { name } => {
            let found = models::search_models(api, &name)?;
            output.emit(&serde_json::to_value(found)?, Some(MODEL_COLUMNS), None)?
        }
        ModelsCommand::Autoupdatable => output.emit_serialized(&models::autoupdatable(api)?, None)?,
        ModelsCommand::PendingUpdates => {
            let found = models::pending_updates(api)?;
            output.emit(&serde_json::to_value(found)?, Some(MODEL_COLUMNS), None)?
        }
        ModelsCommand::Updatable => output.emit_serialized(&models::updatable(api)?, None)?,
        ModelsCommand::UpdateDiff => {
            output.emit_serialized(&models::differ::update_diffs(api)?, None)?
        }
        ModelsCommand::InputDiff {
            arg,
            infile,
            dates,
            enhanced_only,
            active_only,
        } => {
            let kind = match arg {
                InputDiffArg::New => InputDiff::New,
                InputDiffArg::Deleted => InputDiff::Deleted,
                InputDiffArg::Changed => InputDiff::Changed,
            };
            let names = models::read_model_names(&infile)?;
            let filter = ModelFilter {
                enhanced_only,
                active_only,
            };
            let result = models::input_diff(api, kind, &filter, &names, &dates.range()?)?;
            output.emit_serialized(&result, None)?
        }
        ModelsCommand::Report {
            arg,
            dates,
            active_only,
        } => {
            let (name, table) = match arg {
                ModelReportArg::All => ("all", models::history_report(api, active_only)?),
                ModelReportArg::BreachSummary => {
                    ("breach-summary", models::breach_summary(api, &dates.range()?)?)
                }
            };
            let path = report_outfile(output.outfile.as_ref(), "models", name, "xlsx");
            report::write_report(&table, &path, None, ReportFormat::Xlsx)?;
            info!(path = %path.display(), rows = table.rows.len(), "report written");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_splits_endpoints_with_queries() {
        let (path, query) = split_endpoint("modelbreaches?starttime=1&endtime=2").unwrap();
        assert_eq!(path, "/modelbreaches");
        assert_eq!(
            query,
            vec![
                ("starttime".to_string(), "1".to_string()),
                ("endtime".to_string(), "2".to_string())
            ]
        );

        let (path, query) = split_endpoint("/status").unwrap();
        assert_eq!(path, "/status");
        assert!(query.is_empty());
    }

    #[test]
    fn test_plain_config_values_need_a_value() {
        assert_eq!(config_value(Key::Host, Some("https://dt".into())).unwrap(), "https://dt");
        let err = config_value(Key::PubDtkey, None).unwrap_err();
        assert!(err.to_string().contains("pub-dtkey"));
    }

    #[test]
    fn test_report_outfile_defaults_to_timestamped_name() {
        let path = report_outfile(None, "breaches", "brief", "csv");
        let name = path.to_string_lossy().to_string();
        assert!(name.starts_with("./breaches_brief_"));
        assert!(name.ends_with(".csv"));
        let given = PathBuf::from("/tmp/out.xlsx");
        assert_eq!(report_outfile(Some(&given), "breaches", "brief", "csv"), given);
    }
}
