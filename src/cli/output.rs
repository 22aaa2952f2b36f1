//! Rendering of command results as tables, JSON or YAML.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use serde::Serialize;
use serde_json::Value;

use crate::actions::content::SearchResults;
use crate::config::OutputFormat;
use crate::k8s::types::{ClusterCatalog, ClusterExtension, TYPE_INSTALLED, TYPE_PROGRESSING, TYPE_SERVING};
use crate::k8s::Conditioned;
use crate::Result;

const NONE: &str = "<none>";

fn structured<T: Serialize + ?Sized>(value: &T, format: OutputFormat) -> Result<Option<String>> {
    match format {
        OutputFormat::Table => Ok(None),
        OutputFormat::Json => Ok(Some(serde_json::to_string_pretty(value)? + "\n")),
        OutputFormat::Yaml => Ok(Some(serde_yaml::to_string(value)?)),
    }
}

pub fn catalogs(items: &[ClusterCatalog], format: OutputFormat, now: DateTime<Utc>) -> Result<String> {
    if let Some(out) = structured(items, format)? {
        return Ok(out);
    }
    if items.is_empty() {
        return Ok("No catalogs found.\n".to_string());
    }

    let mut out = format!(
        "{:<30} {:<12} {:>8} {:<13} {:<8} {:<6}\n",
        "NAME", "AVAILABILITY", "PRIORITY", "LASTUNPACKED", "SERVING", "AGE"
    );
    for c in items {
        let last_unpacked = c
            .status
            .as_ref()
            .and_then(|s| s.last_unpacked.as_ref())
            .map_or_else(|| NONE.to_string(), |t| age(t, now));
        let _ = writeln!(
            out,
            "{:<30} {:<12} {:>8} {:<13} {:<8} {:<6}",
            truncate(&c.name_any(), 30),
            c.availability().to_string(),
            c.spec.priority,
            last_unpacked,
            condition_status(c, TYPE_SERVING),
            created(c.creation_timestamp().as_ref(), now),
        );
    }
    Ok(out)
}

pub fn extensions(items: &[ClusterExtension], format: OutputFormat, now: DateTime<Utc>) -> Result<String> {
    if let Some(out) = structured(items, format)? {
        return Ok(out);
    }
    if items.is_empty() {
        return Ok("No extensions found.\n".to_string());
    }

    let mut out = format!(
        "{:<25} {:<35} {:<12} {:<8} {:<10} {:<12} {:<6}\n",
        "NAME", "INSTALLED BUNDLE", "VERSION", "SOURCE", "INSTALLED", "PROGRESSING", "AGE"
    );
    for e in items {
        let (bundle, version) = e
            .installed_bundle()
            .map_or((NONE, NONE), |b| (b.name.as_str(), b.version.as_str()));
        let _ = writeln!(
            out,
            "{:<25} {:<35} {:<12} {:<8} {:<10} {:<12} {:<6}",
            truncate(&e.name_any(), 25),
            truncate(bundle, 35),
            truncate(version, 12),
            e.spec.source.source_type,
            condition_status(e, TYPE_INSTALLED),
            condition_status(e, TYPE_PROGRESSING),
            created(e.creation_timestamp().as_ref(), now),
        );
    }
    Ok(out)
}

pub fn search(results: &SearchResults, format: OutputFormat) -> Result<String> {
    match results {
        SearchResults::Packages(rows) => {
            if let Some(out) = structured(rows, format)? {
                return Ok(out);
            }
            if rows.is_empty() {
                return Ok("No packages found.\n".to_string());
            }
            let mut out = format!("{:<40} {:<25} {:<30}\n", "PACKAGE", "CATALOG", "PROVIDER");
            for row in rows {
                let _ = writeln!(
                    out,
                    "{:<40} {:<25} {:<30}",
                    truncate(&row.package, 40),
                    truncate(&row.catalog, 25),
                    row.provider.as_deref().unwrap_or(""),
                );
            }
            Ok(out)
        }
        SearchResults::Versions(rows) => {
            if let Some(out) = structured(rows, format)? {
                return Ok(out);
            }
            if rows.is_empty() {
                return Ok("No bundles found.\n".to_string());
            }
            let mut out = format!(
                "{:<30} {:<15} {:<25} {:<45}\n",
                "PACKAGE", "VERSION", "CHANNELS", "BUNDLE"
            );
            for row in rows {
                let _ = writeln!(
                    out,
                    "{:<30} {:<15} {:<25} {:<45}",
                    truncate(&row.package, 30),
                    truncate(&row.version, 15),
                    truncate(&row.channels.join(","), 25),
                    row.bundle,
                );
            }
            Ok(out)
        }
    }
}

/// Content objects; a table has no columns for them, so it prints one JSON
/// document per line, as the catalog serves them.
pub fn content(objects: &[Value], format: OutputFormat) -> Result<String> {
    if let Some(out) = structured(objects, format)? {
        return Ok(out);
    }
    let mut out = String::new();
    for obj in objects {
        out.push_str(&serde_json::to_string(obj)?);
        out.push('\n');
    }
    Ok(out)
}

/// One line per object that is confirmed gone.
pub fn deleted(kind: &str, names: &[String]) -> String {
    names
        .iter()
        .map(|name| format!("{kind} {name:?} deleted\n"))
        .collect()
}

fn condition_status<K: Conditioned>(obj: &K, type_: &str) -> String {
    obj.condition(type_)
        .map_or_else(|| "Unknown".to_string(), |c| c.status.clone())
}

fn created(timestamp: Option<&Time>, now: DateTime<Utc>) -> String {
    timestamp.map_or_else(|| NONE.to_string(), |t| age(t, now))
}

fn age(since: &Time, now: DateTime<Utc>) -> String {
    let secs = (now - since.0).num_seconds().max(0);
    match secs {
        s if s < 120 => format!("{s}s"),
        s if s < 3600 * 2 => format!("{}m", s / 60),
        s if s < 86400 * 2 => format!("{}h", s / 3600),
        s => format!("{}d", s / 86400),
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{kept}...")
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::actions::content::PackageMatch;
    use crate::testing::{catalog, extension};
    use crate::transport::fixtures::serving_catalog;

    #[test]
    fn test_catalog_table_columns() {
        let now = Utc::now();
        let mut c = serving_catalog("operatorhubio", "https://catalogd-service.olmv1-system.svc/catalogs/operatorhubio");
        c.metadata.creation_timestamp = Some(Time(now - Duration::minutes(5)));

        let out = catalogs(&[c], OutputFormat::Table, now).unwrap();
        let mut lines = out.lines();
        let header: Vec<&str> = lines.next().unwrap().split_whitespace().collect();
        assert_eq!(header, vec!["NAME", "AVAILABILITY", "PRIORITY", "LASTUNPACKED", "SERVING", "AGE"]);
        let row: Vec<&str> = lines.next().unwrap().split_whitespace().collect();
        assert_eq!(row, vec!["operatorhubio", "Available", "0", "<none>", "True", "5m"]);
    }

    #[test]
    fn test_extension_table_without_status() {
        let out = extensions(&[extension("argocd", "argocd-operator")], OutputFormat::Table, Utc::now()).unwrap();
        let row: Vec<&str> = out.lines().nth(1).unwrap().split_whitespace().collect();
        assert_eq!(row, vec!["argocd", "<none>", "<none>", "Catalog", "Unknown", "Unknown", "<none>"]);
    }

    #[test]
    fn test_json_output_is_the_object_list() {
        let out = catalogs(&[catalog("hub")], OutputFormat::Json, Utc::now()).unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed[0]["metadata"]["name"], "hub");
        assert_eq!(parsed[0]["kind"], "ClusterCatalog");
    }

    #[test]
    fn test_search_packages_yaml() {
        let results = SearchResults::Packages(vec![PackageMatch {
            package: "argocd-operator".to_string(),
            catalog: "community".to_string(),
            provider: None,
            default_channel: Some("alpha".to_string()),
        }]);
        let out = search(&results, OutputFormat::Yaml).unwrap();
        assert!(out.contains("package: argocd-operator"));
        assert!(out.contains("defaultChannel: alpha"));
    }

    #[test]
    fn test_content_table_is_one_document_per_line() {
        let objects = vec![
            serde_json::json!({"schema": "olm.package", "name": "a"}),
            serde_json::json!({"schema": "olm.package", "name": "b"}),
        ];
        let out = content(&objects, OutputFormat::Table).unwrap();
        assert_eq!(out.lines().count(), 2);
    }

    #[test]
    fn test_deleted_lists_only_confirmed_names() {
        let out = deleted("catalog", &["a".to_string(), "c".to_string()]);
        assert_eq!(out, "catalog \"a\" deleted\ncatalog \"c\" deleted\n");
        assert_eq!(deleted("catalog", &[]), "");
    }

    #[test]
    fn test_age_units() {
        let now = Utc::now();
        assert_eq!(age(&Time(now - Duration::seconds(42)), now), "42s");
        assert_eq!(age(&Time(now - Duration::hours(3)), now), "3h");
        assert_eq!(age(&Time(now - Duration::days(10)), now), "10d");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-very-long-catalog-name", 10), "a-very-...");
    }
}
