//! The self-update core of the endpoint agent.
//!
//! This library keeps two binaries — the agent itself (`launcher`) and its
//! data-collection sibling (`osqueryd`) — aligned with the versions chosen
//! by the release infrastructure. Release metadata is distributed over TUF,
//! so every byte installed here was verified against a signed, rollback-
//! protected metadata chain before it is allowed to run.
//!
//! The main entry point for the long-running reconciliation loop is the
//! [`ControllerBuilder`]:
//!
//! ```ignore
//! use autoupdate::{Binary, ControllerBuilder, MetadataClient};
//!
//! let controller = ControllerBuilder::new()
//!     .launcher_version(env!("CARGO_PKG_VERSION"))
//!     .config(config)
//!     .librarian(librarian)
//!     .metadata(metadata)
//!     .querier(querier)
//!     .build()?;
//!
//! // Returns Ok(()) on interrupt, or RestartRequired when a new launcher
//! // version is staged and the supervisor should re-exec.
//! controller.run().await?;
//! ```
//!
//! At process startup — long before the controller exists — use
//! [`check_out_latest`] to decide which installed version of a binary to
//! execute.
//!
//! ## Features
//!
//! This crate offers several features to control the TLS dependency used by
//! `reqwest`, mirroring the reqwest feature names: `rustls-tls` (default),
//! `rustls-tls-native-roots`, `native-tls`, and `native-tls-vendored`. The
//! `logging` feature enables [`init_logger`].

mod binary;
mod config;
mod controller;
mod fetcher;
mod installer;
mod library;
mod lookup;
mod metadata;
mod probe;
mod resolver;
mod spanbuffer;

pub use crate::{
    binary::{Binary, Channel, RequestedBinary},
    config::{ConfigValues, FlagKey, StaticConfig, UpdateConfig, DEFAULT_MIRROR_URL, DEFAULT_TUF_URL},
    controller::{
        ControllerBuilder, KvStore, Librarian, MetadataSource, Querier, RestartCallback,
        RestartRequired, UpdateController,
    },
    installer::LibraryManager,
    library::{LibraryVersion, UpdateLibrary},
    lookup::{check_out_latest, SelectedBinary},
    metadata::{read_only_targets, MetadataClient, TargetMeta, TargetsSnapshot},
    probe::{check_executable, check_executable_runs},
    resolver::{resolve_target, ResolvedTarget, TargetNotFound},
    spanbuffer::{BufferedSpanProcessor, SpanData, SpanProcessor},
};

// The version of the `autoupdate` crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(feature = "logging")]
use fern::{
    colors::{Color, ColoredLevelConfig},
    Dispatch,
};

/// This function initializes logging for the application. It's public for the sake of the
/// `autoupdate` binary, but it lives in the library crate so that test code can also enable
/// logging.
///
/// # Errors
///
/// This can return a `log::SetLoggerError` error.
#[cfg(feature = "logging")]
pub fn init_logger(level: log::LevelFilter) -> Result<(), log::SetLoggerError> {
    let line_colors = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::BrightBlack)
        .debug(Color::BrightBlack)
        .trace(Color::BrightBlack);
    let level_colors = line_colors.info(Color::Green).debug(Color::Black);

    Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{color_line}[{target}][{level}{color_line}] {message}\x1B[0m",
                color_line = format_args!(
                    "\x1B[{}m",
                    line_colors.get_color(&record.level()).to_fg_str()
                ),
                target = record.target(),
                level = level_colors.color(record.level()),
                message = message,
            ));
        })
        .level(level)
        // This is very noisy.
        .level_for("hyper", log::LevelFilter::Error)
        .chain(std::io::stderr())
        .apply()
}
