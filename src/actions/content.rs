use kube::ResourceExt;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::catalog_content::CatalogContent;
use crate::k8s::ops::{Get, List};
use crate::k8s::selector;
use crate::k8s::types::ClusterCatalog;
use crate::transport::ContentSource;
use crate::Result;

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub catalog: Option<String>,
    pub catalog_selector: Option<String>,
    pub package: Option<String>,
    pub list_versions: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageMatch {
    pub package: String,
    pub catalog: String,
    pub provider: Option<String>,
    pub default_channel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionMatch {
    pub package: String,
    pub catalog: String,
    pub bundle: String,
    pub version: String,
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchResults {
    Packages(Vec<PackageMatch>),
    Versions(Vec<VersionMatch>),
}

/// Downloads and decodes one catalog's content.
async fn load(source: &dyn ContentSource, catalog: &ClusterCatalog, cancel: &CancellationToken) -> Result<CatalogContent> {
    let mut stream = source.fetch(catalog, cancel).await?;
    let read = stream.read_to_end(cancel).await;
    stream.close().await;
    let bytes = read?;
    debug!(catalog = %catalog.name_any(), bytes = bytes.len(), "content fetched");
    CatalogContent::decode(&bytes)
}

/// Searches the packages of every selected catalog that is serving.
///
/// Catalogs that are not serving are skipped with a warning; a catalog that
/// claims to serve but cannot be fetched fails the search.
#[instrument(skip_all, fields(package = ?opts.package))]
pub async fn search<C>(
    client: &C,
    source: &dyn ContentSource,
    opts: &SearchOptions,
    cancel: &CancellationToken,
) -> Result<SearchResults>
where
    C: Get<ClusterCatalog> + List<ClusterCatalog> + ?Sized,
{
    if let Some(sel) = &opts.catalog_selector {
        selector::parse(sel)?;
    }

    let mut catalogs: Vec<ClusterCatalog> = match &opts.catalog {
        Some(name) => vec![client.get(name, None).await?],
        None => client.list(None, opts.catalog_selector.as_deref()).await?,
    };
    catalogs.sort_by_key(|c| c.name_any());

    let mut packages = Vec::new();
    let mut versions = Vec::new();
    for catalog in &catalogs {
        let name = catalog.name_any();
        if !catalog.is_serving() {
            warn!(catalog = %name, "skipping catalog that is not serving");
            continue;
        }

        let content = load(source, catalog, cancel).await?;
        if opts.list_versions {
            versions.extend(
                content
                    .bundle_versions(opts.package.as_deref())
                    .into_iter()
                    .map(|b| VersionMatch {
                        package: b.package,
                        catalog: name.clone(),
                        bundle: b.bundle,
                        version: b.version,
                        channels: b.channels,
                    }),
            );
        } else {
            packages.extend(
                content
                    .packages()
                    .into_iter()
                    .filter(|p| opts.package.as_deref().map_or(true, |want| p.name == want))
                    .map(|p| PackageMatch {
                        package: p.name,
                        catalog: name.clone(),
                        provider: p.provider,
                        default_channel: p.default_channel,
                    }),
            );
        }
    }

    if opts.list_versions {
        Ok(SearchResults::Versions(versions))
    } else {
        packages.sort_by(|a, b| (&a.package, &a.catalog).cmp(&(&b.package, &b.catalog)));
        Ok(SearchResults::Packages(packages))
    }
}

/// Raw content objects of one catalog, narrowed by package and schema.
#[instrument(skip_all, fields(catalog = %catalog))]
pub async fn inspect<C>(
    client: &C,
    source: &dyn ContentSource,
    catalog: &str,
    package: Option<&str>,
    schema: Option<&str>,
    cancel: &CancellationToken,
) -> Result<Vec<Value>>
where
    C: Get<ClusterCatalog> + ?Sized,
{
    let catalog: ClusterCatalog = client.get(catalog, None).await?;
    let content = load(source, &catalog, cancel).await?;
    Ok(content.filter(package, schema).into_iter().cloned().collect())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::catalog_content::fixtures::CONTENT;
    use crate::error::TransportError;
    use crate::testing::FakeCluster;
    use crate::transport::fixtures::{serving_catalog, unavailable_catalog};
    use crate::transport::{content_url, ContentStream};
    use crate::Error;
    use assert_matches::assert_matches;

    /// Serves the same content for every catalog, honouring the serving check.
    #[derive(Default)]
    struct StaticSource {
        fetched: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ContentSource for StaticSource {
        async fn fetch(&self, catalog: &ClusterCatalog, _cancel: &CancellationToken) -> Result<ContentStream> {
            content_url(catalog)?;
            self.fetched.lock().unwrap().push(catalog.name_any());
            Ok(ContentStream::new(std::io::Cursor::new(CONTENT.as_bytes().to_vec())))
        }
    }

    const BASE: &str = "https://catalogd-service.olmv1-system.svc/catalogs";

    fn cluster() -> FakeCluster {
        let cluster = FakeCluster::new();
        cluster.insert(&serving_catalog("community", &format!("{BASE}/community")));
        cluster.insert(&unavailable_catalog("internal", &format!("{BASE}/internal")));
        cluster.insert(&serving_catalog("operatorhub", &format!("{BASE}/operatorhub")));
        cluster
    }

    #[tokio::test]
    async fn test_search_skips_catalogs_that_are_not_serving() {
        let cluster = cluster();
        let source = StaticSource::default();
        let opts = SearchOptions {
            package: Some("argocd-operator".to_string()),
            ..Default::default()
        };

        let results = search(&cluster, &source, &opts, &CancellationToken::new())
            .await
            .unwrap();

        let SearchResults::Packages(found) = results else {
            panic!("expected packages");
        };
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].catalog, "community");
        assert_eq!(found[1].catalog, "operatorhub");
        assert_eq!(found[0].provider.as_deref(), Some("Argo CD Community"));
        assert_eq!(*source.fetched.lock().unwrap(), vec!["community", "operatorhub"]);
    }

    #[tokio::test]
    async fn test_search_lists_versions() {
        let cluster = cluster();
        let opts = SearchOptions {
            catalog: Some("community".to_string()),
            package: Some("argocd-operator".to_string()),
            list_versions: true,
            ..Default::default()
        };

        let results = search(&cluster, &StaticSource::default(), &opts, &CancellationToken::new())
            .await
            .unwrap();

        let SearchResults::Versions(versions) = results else {
            panic!("expected versions");
        };
        let listed: Vec<&str> = versions.iter().map(|v| v.version.as_str()).collect();
        assert_eq!(listed, vec!["0.5.0", "0.6.0"]);
    }

    #[tokio::test]
    async fn test_inspect_named_catalog_that_is_not_serving_fails() {
        let cluster = cluster();
        let err = inspect(
            &cluster,
            &StaticSource::default(),
            "internal",
            None,
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert_matches!(err, Error::Transport(TransportError::NotServing(_)));
    }

    #[tokio::test]
    async fn test_inspect_filters_by_schema() {
        let cluster = cluster();
        let objects = inspect(
            &cluster,
            &StaticSource::default(),
            "community",
            Some("argocd-operator"),
            Some("olm.bundle"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(objects.len(), 2);
        assert!(objects.iter().all(|o| o["schema"] == "olm.bundle"));
    }
}
