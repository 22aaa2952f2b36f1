pub mod commands;
pub mod output;

use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config::{self, OutputFormat, Settings};
use crate::k8s::types::{AvailabilityMode, UpgradeConstraintPolicy};
use crate::k8s::FIELD_MANAGER;
use crate::transport::TransportKind;

#[derive(Parser)]
#[command(name = "kubectl-operator")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Manage OLM v1 catalogs and extensions on a Kubernetes cluster", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    #[arg(
        long,
        global = true,
        env = "KUBECTL_OPERATOR_TIMEOUT",
        default_value = "5m",
        value_parser = duration,
        help = "How long to wait for an object to converge (e.g. 30s, 5m)"
    )]
    pub timeout: Duration,

    #[arg(
        long,
        global = true,
        env = "KUBECTL_OPERATOR_POLL_INTERVAL",
        default_value = "250ms",
        value_parser = duration,
        help = "Interval between status checks while waiting"
    )]
    pub poll_interval: Duration,

    #[arg(
        long,
        global = true,
        env = "KUBECTL_OPERATOR_CLEANUP_TIMEOUT",
        default_value = "1m",
        value_parser = duration,
        help = "How long cleanup after a failed install may take"
    )]
    pub cleanup_timeout: Duration,

    #[arg(
        long,
        global = true,
        env = "KUBECTL_OPERATOR_TRANSPORT",
        default_value_t = TransportKind::Proxy,
        help = "How catalog content is fetched (proxy, tunnel)"
    )]
    pub transport: TransportKind,

    #[arg(
        long,
        global = true,
        env = "KUBECTL_OPERATOR_FIELD_MANAGER",
        default_value = FIELD_MANAGER,
        help = "Field manager recorded on server-side apply"
    )]
    pub field_manager: String,

    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Table, help = "Output format")]
    pub output: OutputFormat,
}

impl GlobalArgs {
    pub fn settings(&self) -> Settings {
        Settings {
            poll_interval: self.poll_interval,
            timeout: self.timeout,
            cleanup_timeout: self.cleanup_timeout,
            field_manager: self.field_manager.clone(),
            transport: self.transport,
            output: self.output,
        }
    }
}

fn duration(s: &str) -> Result<Duration, String> {
    config::parse_duration(s).map_err(|e| e.to_string())
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(subcommand, about = "Manage catalogs")]
    Catalog(CatalogCommand),
    #[command(subcommand, about = "Manage extensions")]
    Extension(ExtensionCommand),
}

#[derive(Subcommand)]
pub enum CatalogCommand {
    #[command(about = "Add a catalog and wait until it serves content")]
    Add {
        name: String,

        #[arg(help = "Catalog image reference")]
        image: String,

        #[arg(short, long, default_value_t = 0, allow_negative_numbers = true, help = "Priority relative to other catalogs")]
        priority: i32,

        #[arg(long, help = "Minutes between polls of the image for updates")]
        poll_interval_minutes: Option<i32>,

        #[arg(long = "label", help = "Label to set, as key=value (repeatable)")]
        labels: Vec<String>,

        #[arg(long, default_value_t = true, action = clap::ArgAction::Set, help = "Whether the catalog serves content")]
        available: bool,

        #[arg(long, help = "Submit without persisting")]
        dry_run: bool,
    },
    #[command(about = "Change an existing catalog")]
    Update {
        name: String,

        #[arg(long, help = "New catalog image reference")]
        image: Option<String>,

        #[arg(short, long, allow_negative_numbers = true, help = "Priority relative to other catalogs")]
        priority: Option<i32>,

        #[arg(long, help = "Minutes between polls of the image (0 disables polling)")]
        poll_interval_minutes: Option<i32>,

        #[arg(long, help = "Available or Unavailable")]
        availability_mode: Option<AvailabilityMode>,

        #[arg(long = "label", help = "Label to set, as key=value (repeatable)")]
        labels: Vec<String>,

        #[arg(long, help = "Keep current values for flags that are not given")]
        ignore_unset: bool,

        #[arg(long, help = "Submit without persisting")]
        dry_run: bool,
    },
    #[command(about = "List catalogs")]
    List {
        name: Option<String>,

        #[arg(short = 'l', long, help = "Label selector")]
        selector: Option<String>,
    },
    #[command(about = "Remove one catalog, or all of them")]
    Remove {
        name: Option<String>,

        #[arg(long, help = "Remove every catalog")]
        all: bool,
    },
    #[command(about = "Search the packages served by catalogs")]
    Search {
        #[arg(long, help = "Only search this catalog")]
        catalog: Option<String>,

        #[arg(long, help = "Only search catalogs matching this label selector")]
        catalog_selector: Option<String>,

        #[arg(long, help = "Package name")]
        package: Option<String>,

        #[arg(long, help = "List bundle versions instead of packages")]
        list_versions: bool,
    },
    #[command(about = "Print the raw content objects of a catalog")]
    Inspect {
        catalog: String,

        #[arg(long, help = "Package name")]
        package: Option<String>,

        #[arg(long, help = "Content schema, e.g. olm.bundle")]
        schema: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum ExtensionCommand {
    #[command(about = "Install a package and wait until it is installed")]
    Install {
        name: String,

        #[arg(long, help = "Package to install (defaults to the extension name)")]
        package: Option<String>,

        #[arg(short, long, help = "Install namespace (defaults to the extension name)")]
        namespace: Option<String>,

        #[arg(long, help = "Service account (defaults to <name>-installer)")]
        service_account: Option<String>,

        #[arg(long, help = "Version or version range")]
        version: Option<String>,

        #[arg(short, long = "channel", help = "Channel to follow (repeatable)")]
        channels: Vec<String>,

        #[arg(long, help = "Only use catalogs matching this label selector")]
        catalog_selector: Option<String>,

        #[arg(long, default_value_t = UpgradeConstraintPolicy::CatalogProvided, help = "CatalogProvided or SelfCertified")]
        upgrade_constraint_policy: UpgradeConstraintPolicy,

        #[arg(long, help = "Bind cluster-admin to the service account")]
        cluster_admin: bool,

        #[arg(long = "label", help = "Label to set, as key=value (repeatable)")]
        labels: Vec<String>,

        #[arg(long, help = "Submit without persisting")]
        dry_run: bool,
    },
    #[command(about = "Change an installed extension")]
    Update {
        name: String,

        #[arg(long, help = "Version or version range")]
        version: Option<String>,

        #[arg(short, long = "channel", help = "Channel to follow (repeatable)")]
        channels: Vec<String>,

        #[arg(long, help = "Only use catalogs matching this label selector")]
        catalog_selector: Option<String>,

        #[arg(long, help = "CatalogProvided or SelfCertified")]
        upgrade_constraint_policy: Option<UpgradeConstraintPolicy>,

        #[arg(long = "label", help = "Label to set, as key=value (repeatable)")]
        labels: Vec<String>,

        #[arg(long, help = "Keep current values for flags that are not given")]
        ignore_unset: bool,

        #[arg(long, help = "Submit without persisting")]
        dry_run: bool,
    },
    #[command(about = "Uninstall one extension, or all of them")]
    Uninstall {
        name: Option<String>,

        #[arg(long, help = "Uninstall every extension")]
        all: bool,
    },
    #[command(about = "Show extensions")]
    Get {
        name: Option<String>,

        #[arg(short = 'l', long, help = "Label selector")]
        selector: Option<String>,
    },
}
