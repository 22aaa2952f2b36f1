use std::sync::Arc;

use chrono::Utc;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::actions::content::{self, SearchOptions};
use crate::actions::extension::{self, InstallOptions};
use crate::actions::{catalog, parse_labels, BulkDeletion, DeleteScope, UpdateOutcome};
use crate::cli::{output, CatalogCommand, Cli, Commands, ExtensionCommand};
use crate::config::Settings;
use crate::k8s::K8sClient;
use crate::transport::{ContentSource, KubePortForwarder, ProxyTransport, TransportKind, TunnelTransport};
use crate::Result;

pub async fn handle_command(cli: Cli, cancel: CancellationToken) -> Result<()> {
    let settings = cli.global.settings();
    settings.validate()?;
    debug!(?settings, "settings resolved");

    let client = K8sClient::try_default()
        .await?
        .with_field_manager(settings.field_manager.clone());

    match cli.command {
        Commands::Catalog(command) => handle_catalog(command, &client, &settings, &cancel).await,
        Commands::Extension(command) => handle_extension(command, &client, &settings, &cancel).await,
    }
}

fn content_source(client: &K8sClient, kind: TransportKind) -> Box<dyn ContentSource> {
    debug!(transport = %kind, "content transport selected");
    match kind {
        TransportKind::Proxy => Box::new(ProxyTransport::new(client.inner().clone())),
        TransportKind::Tunnel => Box::new(TunnelTransport::new(
            client.clone(),
            Arc::new(KubePortForwarder::new(client.inner().clone())),
        )),
    }
}

async fn handle_catalog(
    command: CatalogCommand,
    client: &K8sClient,
    settings: &Settings,
    cancel: &CancellationToken,
) -> Result<()> {
    match command {
        CatalogCommand::Add {
            name,
            image,
            priority,
            poll_interval_minutes,
            labels,
            available,
            dry_run,
        } => {
            let opts = catalog::AddOptions {
                name,
                image,
                priority,
                poll_interval_minutes,
                labels: parse_labels(&labels)?,
                available,
                dry_run,
            };
            let created = catalog::add(client, &opts, settings, cancel).await?;
            if dry_run {
                print!("{}", output::catalogs(&[created], settings.output, Utc::now())?);
            } else {
                println!("catalog {:?} created", created.name_any());
            }
        }
        CatalogCommand::Update {
            name,
            image,
            priority,
            poll_interval_minutes,
            availability_mode,
            labels,
            ignore_unset,
            dry_run,
        } => {
            let opts = catalog::UpdateOptions {
                name,
                image,
                priority,
                poll_interval_minutes,
                availability: availability_mode,
                labels: parse_labels(&labels)?,
                ignore_unset,
                dry_run,
            };
            let outcome = catalog::update(client, &opts, settings, cancel).await?;
            report_update("catalog", &outcome, |c| {
                output::catalogs(&[c.clone()], settings.output, Utc::now())
            })?;
        }
        CatalogCommand::List { name, selector } => {
            let catalogs = catalog::list(client, name.as_deref(), selector.as_deref()).await?;
            print!("{}", output::catalogs(&catalogs, settings.output, Utc::now())?);
        }
        CatalogCommand::Remove { name, all } => {
            let scope = DeleteScope::new(name, all)?;
            let deletion = catalog::remove(client, &scope, settings, cancel).await?;
            report_deletion("catalog", deletion)?;
        }
        CatalogCommand::Search {
            catalog,
            catalog_selector,
            package,
            list_versions,
        } => {
            let source = content_source(client, settings.transport);
            let opts = SearchOptions {
                catalog,
                catalog_selector,
                package,
                list_versions,
            };
            let results = content::search(client, source.as_ref(), &opts, cancel).await?;
            print!("{}", output::search(&results, settings.output)?);
        }
        CatalogCommand::Inspect {
            catalog,
            package,
            schema,
        } => {
            let source = content_source(client, settings.transport);
            let objects = content::inspect(
                client,
                source.as_ref(),
                &catalog,
                package.as_deref(),
                schema.as_deref(),
                cancel,
            )
            .await?;
            print!("{}", output::content(&objects, settings.output)?);
        }
    }
    Ok(())
}

async fn handle_extension(
    command: ExtensionCommand,
    client: &K8sClient,
    settings: &Settings,
    cancel: &CancellationToken,
) -> Result<()> {
    match command {
        ExtensionCommand::Install {
            name,
            package,
            namespace,
            service_account,
            version,
            channels,
            catalog_selector,
            upgrade_constraint_policy,
            cluster_admin,
            labels,
            dry_run,
        } => {
            let opts = InstallOptions {
                package: package.unwrap_or_else(|| name.clone()),
                namespace: namespace.unwrap_or_else(|| name.clone()),
                service_account: service_account.unwrap_or_else(|| format!("{name}-installer")),
                name,
                version,
                channels,
                catalog_selector,
                upgrade_constraint_policy,
                cluster_admin,
                labels: parse_labels(&labels)?,
                dry_run,
            };
            let installed = extension::install(client, &opts, settings, cancel).await?;
            if dry_run {
                print!("{}", output::extensions(&[installed], settings.output, Utc::now())?);
            } else {
                let version = installed
                    .installed_bundle()
                    .map(|b| b.version.clone())
                    .unwrap_or_default();
                println!("extension {:?} installed {}", installed.name_any(), version);
            }
        }
        ExtensionCommand::Update {
            name,
            version,
            channels,
            catalog_selector,
            upgrade_constraint_policy,
            labels,
            ignore_unset,
            dry_run,
        } => {
            let opts = extension::UpdateOptions {
                name,
                version,
                channels: (!channels.is_empty()).then_some(channels),
                catalog_selector,
                upgrade_constraint_policy,
                labels: parse_labels(&labels)?,
                ignore_unset,
                dry_run,
            };
            let outcome = extension::update(client, &opts, settings, cancel).await?;
            report_update("extension", &outcome, |e| {
                output::extensions(&[e.clone()], settings.output, Utc::now())
            })?;
        }
        ExtensionCommand::Uninstall { name, all } => {
            let scope = DeleteScope::new(name, all)?;
            let deletion = extension::uninstall(client, &scope, settings, cancel).await?;
            report_deletion("extension", deletion)?;
        }
        ExtensionCommand::Get { name, selector } => {
            let extensions = extension::get(client, name.as_deref(), selector.as_deref()).await?;
            print!("{}", output::extensions(&extensions, settings.output, Utc::now())?);
        }
    }
    Ok(())
}

fn report_update<K: ResourceExt>(
    kind: &str,
    outcome: &UpdateOutcome<K>,
    render: impl FnOnce(&K) -> Result<String>,
) -> Result<()> {
    match outcome {
        UpdateOutcome::Updated(obj) => println!("{kind} {:?} updated", obj.name_any()),
        UpdateOutcome::Unchanged(obj) => println!("{kind} {:?} unchanged", obj.name_any()),
        UpdateOutcome::DryRun(obj) => print!("{}", render(obj)?),
    }
    Ok(())
}

/// Reports what was deleted, then returns the error carrying every failure.
fn report_deletion(kind: &str, deletion: BulkDeletion) -> Result<()> {
    if deletion.attempted.is_empty() {
        println!("no {kind}s to delete");
        return Ok(());
    }
    print!("{}", output::deleted(kind, &deletion.deleted));
    info!(
        deleted = deletion.deleted.len(),
        attempted = deletion.attempted.len(),
        "deletion complete"
    );
    deletion.result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use assert_matches::assert_matches;

    #[test]
    fn test_partial_deletion_still_fails() {
        let deletion = BulkDeletion {
            attempted: vec!["a".to_string(), "b".to_string()],
            deleted: vec!["a".to_string()],
            result: Error::join(vec![Error::Validation("b is protected".to_string())]),
        };
        assert_matches!(report_deletion("catalog", deletion), Err(Error::Aggregate(agg)) if agg.len() == 1);
    }

    #[test]
    fn test_nothing_to_delete_is_not_an_error() {
        let deletion = BulkDeletion {
            attempted: Vec::new(),
            deleted: Vec::new(),
            result: Ok(()),
        };
        assert!(report_deletion("extension", deletion).is_ok());
    }
}
