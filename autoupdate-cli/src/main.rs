use anyhow::{anyhow, Context, Error, Result};
use autoupdate::{
    Binary, Channel, ConfigValues, ControllerBuilder, LibraryManager, MetadataClient, Querier,
    RestartRequired, StaticConfig, UpdateConfig, UpdateLibrary,
};
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{debug, error};
use std::{
    collections::HashMap,
    path::PathBuf,
    process::ExitCode,
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use strum::VariantNames;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
enum CliError {
    #[error("{0:}")]
    InvalidArgs(String),
}

/// Exit code used when the controller asks for a restart, so wrapper scripts
/// can re-exec instead of reporting a failure. Clap owns exit code 2 for
/// usage errors.
const RESTART_EXIT_CODE: u8 = 3;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cmd = cmd();
    let matches = cmd.get_matches();
    if let Err(e) = init_logger_from_matches(&matches) {
        eprintln!("Error creating logger: {e}");
        return ExitCode::from(126);
    }

    let status = match run_subcommand(&matches).await {
        Ok(code) => code,
        Err(e) => {
            if let Some(restart) = e.downcast_ref::<RestartRequired>() {
                eprintln!("{restart}");
                return ExitCode::from(RESTART_EXIT_CODE);
            }
            print_err(&e);
            if e.downcast_ref::<CliError>().is_some() {
                127
            } else {
                1
            }
        }
    };
    ExitCode::from(status)
}

const MAX_TERM_WIDTH: usize = 100;

fn cmd() -> Command {
    Command::new("autoupdate")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Inspect and drive the endpoint agent's update library")
        .subcommand_required(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Enable verbose output."),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .long("debug")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Enable debugging output."),
        )
        .subcommand(
            Command::new("resolve")
                .about(concat!(
                    "Select the installed version of a binary that this host should execute,",
                    " the same way the agent does at startup.",
                ))
                .arg(binary_arg())
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the selection as JSON."),
                )
                .arg(
                    Arg::new("argv")
                        .num_args(0..)
                        .allow_hyphen_values(true)
                        .trailing_var_arg(true)
                        .help(concat!(
                            "The agent's full command line, flags and all; the relevant",
                            " settings (root_directory, update_channel, pins, config) are",
                            " scraped out of it.",
                        )),
                ),
        )
        .subcommand(
            Command::new("check")
                .about("Run one update check cycle against the TUF repository and mirror.")
                .arg(binary_arg().action(ArgAction::Append))
                .args(controller_args()),
        )
        .subcommand(
            Command::new("run")
                .about(concat!(
                    "Run the update controller loop until interrupted. Exits with a",
                    " distinguished code when a new launcher version is staged.",
                ))
                .args(controller_args()),
        )
        .max_term_width(MAX_TERM_WIDTH)
}

fn binary_arg() -> Arg {
    Arg::new("binary")
        .long("binary")
        .short('b')
        .value_parser(clap::builder::PossibleValuesParser::new(Binary::VARIANTS))
        .default_value("launcher")
        .help("Which managed binary to operate on.")
}

fn controller_args() -> Vec<Arg> {
    vec![
        Arg::new("root-directory")
            .long("root-directory")
            .required(true)
            .help("The agent's root directory; TUF metadata and updates live under it."),
        Arg::new("update-directory")
            .long("update-directory")
            .help("Where installed updates live. Defaults to <root>/updates."),
        Arg::new("channel")
            .long("channel")
            .value_parser(clap::builder::PossibleValuesParser::new(Channel::VARIANTS))
            .default_value("stable")
            .help("The update channel to follow."),
        Arg::new("pinned-launcher-version")
            .long("pinned-launcher-version")
            .help("Pin the launcher to an exact version instead of following the channel."),
        Arg::new("pinned-osqueryd-version")
            .long("pinned-osqueryd-version")
            .help("Pin osqueryd to an exact version instead of following the channel."),
        Arg::new("tuf-url")
            .long("tuf-url")
            .default_value(autoupdate::DEFAULT_TUF_URL)
            .help("Base URL of the TUF repository."),
        Arg::new("mirror-url")
            .long("mirror-url")
            .default_value(autoupdate::DEFAULT_MIRROR_URL)
            .help("Base URL of the release mirror."),
        Arg::new("tuf-root")
            .long("tuf-root")
            .help(concat!(
                "Path to the trusted TUF root.json. Defaults to the root.json already",
                " under <root>/tuf.",
            )),
        Arg::new("interval-secs")
            .long("interval-secs")
            .value_parser(clap::value_parser!(u64))
            .default_value("3600")
            .help("Seconds between update checks when running the loop."),
        Arg::new("initial-delay-secs")
            .long("initial-delay-secs")
            .value_parser(clap::value_parser!(u64))
            .default_value("0")
            .help("Seconds to wait before the first check when running the loop."),
        Arg::new("download-splay-secs")
            .long("download-splay-secs")
            .value_parser(clap::value_parser!(u64))
            .default_value("0")
            .help("Splay window for fresh promotions; zero disables splay."),
    ]
}

fn init_logger_from_matches(matches: &ArgMatches) -> Result<(), log::SetLoggerError> {
    let level = if matches.get_flag("debug") {
        log::LevelFilter::Debug
    } else if matches.get_flag("verbose") {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };

    autoupdate::init_logger(level)
}

async fn run_subcommand(matches: &ArgMatches) -> Result<u8> {
    match matches.subcommand() {
        Some(("resolve", sub)) => resolve(sub).await,
        Some(("check", sub)) => check(sub, false).await,
        Some(("run", sub)) => check(sub, true).await,
        Some((other, _)) => {
            Err(CliError::InvalidArgs(format!("unknown subcommand `{other}`")).into())
        }
        None => Err(CliError::InvalidArgs("a subcommand is required".to_string()).into()),
    }
}

async fn resolve(matches: &ArgMatches) -> Result<u8> {
    let binary = binary_from(matches)?;
    let argv: Vec<String> = matches
        .get_many::<String>("argv")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();

    let selected = autoupdate::check_out_latest(binary, &argv).await?;
    if matches.get_flag("json") {
        println!(
            "{}",
            serde_json::json!({
                "path": selected.path,
                "version": selected.version,
            })
        );
    } else {
        println!("{} {}", selected.path.display(), selected.version);
    }
    Ok(0)
}

async fn check(matches: &ArgMatches, run_loop: bool) -> Result<u8> {
    let root = PathBuf::from(
        matches
            .get_one::<String>("root-directory")
            .expect("root-directory is required"),
    );

    let tuf_url = matches.get_one::<String>("tuf-url").expect("has default").clone();
    let mirror_url = matches.get_one::<String>("mirror-url").expect("has default").clone();

    let root_json = match matches.get_one::<String>("tuf-root") {
        Some(path) => std::fs::read(path).with_context(|| format!("could not read {path}"))?,
        None => std::fs::read(root.join("tuf").join("root.json")).context(
            "no trusted root under <root>/tuf; pass --tuf-root on first use",
        )?,
    };

    let updates_dir = matches
        .get_one::<String>("update-directory")
        .map_or_else(|| root.join("updates"), PathBuf::from);

    let mut values = ConfigValues::new(root.clone());
    values.tuf_server_url = tuf_url.clone();
    values.mirror_server_url = mirror_url.clone();
    values.update_channel = Channel::from_str(matches.get_one::<String>("channel").expect("has default"))
        .map_err(|_| CliError::InvalidArgs("unknown channel".to_string()))?;
    if let Some(pin) = matches.get_one::<String>("pinned-launcher-version") {
        values.pinned_launcher_version = pin.clone();
    }
    if let Some(pin) = matches.get_one::<String>("pinned-osqueryd-version") {
        values.pinned_osqueryd_version = pin.clone();
    }
    values.autoupdate_interval =
        Duration::from_secs(*matches.get_one::<u64>("interval-secs").expect("has default"));
    values.autoupdate_initial_delay = Duration::from_secs(
        *matches.get_one::<u64>("initial-delay-secs").expect("has default"),
    );
    values.autoupdate_download_splay = Duration::from_secs(
        *matches.get_one::<u64>("download-splay-secs").expect("has default"),
    );
    // Stable across runs on one host, which is all splay needs.
    values.installation_id = root.display().to_string();

    let config = Arc::new(StaticConfig::new(values));
    let metadata = Arc::new(MetadataClient::init(&root, &tuf_url, &root_json).await?);
    let librarian = Arc::new(LibraryManager::new(
        UpdateLibrary::new(updates_dir),
        &mirror_url,
        reqwest::Client::new(),
    ));

    let controller = ControllerBuilder::new()
        .launcher_version(env!("CARGO_PKG_VERSION"))
        .config(Arc::clone(&config) as Arc<dyn UpdateConfig>)
        .librarian(librarian)
        .metadata(metadata)
        .querier(Arc::new(CliQuerier))
        .build()?;

    if run_loop {
        controller.run().await?;
        return Ok(0);
    }

    let binaries = binaries_from(matches)?;
    debug!("checking for updates to {binaries:?}");
    controller.check_for_update(&binaries).await?;
    Ok(0)
}

fn binary_from(matches: &ArgMatches) -> Result<Binary> {
    let name = matches.get_one::<String>("binary").expect("has default");
    Binary::from_str(name).map_err(|_| anyhow!(CliError::InvalidArgs(format!("unknown binary `{name}`"))))
}

fn binaries_from(matches: &ArgMatches) -> Result<Vec<Binary>> {
    let mut binaries = vec![];
    for name in matches.get_many::<String>("binary").expect("has default") {
        let binary = Binary::from_str(name)
            .map_err(|_| anyhow!(CliError::InvalidArgs(format!("unknown binary `{name}`"))))?;
        if !binaries.contains(&binary) {
            binaries.push(binary);
        }
    }
    Ok(binaries)
}

/// There is no osqueryd to talk to from a one-shot CLI invocation; checks
/// run as if its version were unknown.
#[derive(Debug)]
struct CliQuerier;

#[async_trait::async_trait]
impl Querier for CliQuerier {
    async fn query(&self, _sql: &str) -> Result<Vec<HashMap<String, String>>> {
        Err(anyhow!("osqueryd queries are not available from the CLI"))
    }
}

fn print_err(e: &Error) {
    error!("{e:#}");
}
