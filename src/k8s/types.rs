//! OLM v1 custom resources and the condition vocabulary used on them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector, Time};
use kube::{CustomResource, Resource};
use serde::{Deserialize, Serialize};

pub const API_GROUP: &str = "olm.operatorframework.io";

pub const TYPE_SERVING: &str = "Serving";
pub const TYPE_INSTALLED: &str = "Installed";
pub const TYPE_PROGRESSING: &str = "Progressing";

pub const STATUS_TRUE: &str = "True";

/// Reason carried by `Progressing` once the controller has nothing left to do.
pub const REASON_SUCCEEDED: &str = "Succeeded";

pub const SOURCE_TYPE_IMAGE: &str = "Image";
pub const SOURCE_TYPE_CATALOG: &str = "Catalog";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "olm.operatorframework.io",
    version = "v1",
    kind = "ClusterCatalog",
    status = "ClusterCatalogStatus",
    derive = "PartialEq",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCatalogSpec {
    pub source: CatalogSource,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_mode: Option<AvailabilityMode>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSource {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageSource>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSource {
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_minutes: Option<i32>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum AvailabilityMode {
    #[default]
    Available,
    Unavailable,
}

impl fmt::Display for AvailabilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AvailabilityMode::Available => write!(f, "Available"),
            AvailabilityMode::Unavailable => write!(f, "Unavailable"),
        }
    }
}

impl FromStr for AvailabilityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Available" => Ok(AvailabilityMode::Available),
            "Unavailable" => Ok(AvailabilityMode::Unavailable),
            other => Err(format!(
                "unknown availability mode {other:?} (expected Available or Unavailable)"
            )),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCatalogStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_source: Option<ResolvedCatalogSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<CatalogUrls>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_unpacked: Option<Time>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedCatalogSource {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ResolvedImageSource>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ResolvedImageSource {
    #[serde(rename = "ref")]
    pub reference: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct CatalogUrls {
    pub base: String,
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "olm.operatorframework.io",
    version = "v1",
    kind = "ClusterExtension",
    status = "ClusterExtensionStatus",
    derive = "PartialEq",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterExtensionSpec {
    pub namespace: String,
    pub service_account: ServiceAccountReference,
    pub source: ExtensionSource,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ServiceAccountReference {
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionSource {
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<CatalogFilter>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogFilter {
    pub package_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_constraint_policy: Option<UpgradeConstraintPolicy>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum UpgradeConstraintPolicy {
    #[default]
    CatalogProvided,
    SelfCertified,
}

impl fmt::Display for UpgradeConstraintPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeConstraintPolicy::CatalogProvided => write!(f, "CatalogProvided"),
            UpgradeConstraintPolicy::SelfCertified => write!(f, "SelfCertified"),
        }
    }
}

impl FromStr for UpgradeConstraintPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CatalogProvided" => Ok(UpgradeConstraintPolicy::CatalogProvided),
            "SelfCertified" => Ok(UpgradeConstraintPolicy::SelfCertified),
            other => Err(format!(
                "unknown upgrade constraint policy {other:?} (expected CatalogProvided or SelfCertified)"
            )),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterExtensionStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<ExtensionInstallStatus>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ExtensionInstallStatus {
    pub bundle: BundleMetadata,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct BundleMetadata {
    pub name: String,
    pub version: String,
}

/// Objects whose readiness is reported through status conditions.
pub trait Conditioned: Resource {
    fn conditions(&self) -> &[Condition];

    fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions().iter().find(|c| c.type_ == type_)
    }

    /// True when `type_` has `status` and was observed for the current generation.
    fn condition_holds(&self, type_: &str, status: &str) -> bool {
        let generation = self.meta().generation;
        self.condition(type_).is_some_and(|c| {
            c.status == status
                && match (c.observed_generation, generation) {
                    (Some(observed), Some(current)) => observed >= current,
                    _ => true,
                }
        })
    }
}

impl Conditioned for ClusterCatalog {
    fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or(&[])
    }
}

impl Conditioned for ClusterExtension {
    fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or(&[])
    }
}

impl ClusterCatalog {
    pub fn is_serving(&self) -> bool {
        self.condition_holds(TYPE_SERVING, STATUS_TRUE)
    }

    pub fn base_url(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.urls.as_ref())
            .map(|u| u.base.as_str())
            .filter(|base| !base.is_empty())
    }

    pub fn availability(&self) -> AvailabilityMode {
        self.spec.availability_mode.unwrap_or_default()
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.metadata.labels.clone().unwrap_or_default()
    }
}

impl ClusterExtension {
    pub fn catalog_filter(&self) -> Option<&CatalogFilter> {
        self.spec.source.catalog.as_ref()
    }

    pub fn installed_bundle(&self) -> Option<&BundleMetadata> {
        self.status
            .as_ref()
            .and_then(|s| s.install.as_ref())
            .map(|i| &i.bundle)
    }
}

#[cfg(test)]
pub(crate) fn condition(type_: &str, status: &str, reason: &str, message: &str) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Time(chrono::Utc::now()),
        observed_generation: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog_with(conditions: Vec<Condition>, generation: Option<i64>) -> ClusterCatalog {
        let mut catalog = ClusterCatalog::new("foo", ClusterCatalogSpec::default());
        catalog.metadata.generation = generation;
        catalog.status = Some(ClusterCatalogStatus {
            conditions,
            ..Default::default()
        });
        catalog
    }

    #[test]
    fn test_condition_holds_ignores_stale_generation() {
        let mut serving = condition(TYPE_SERVING, STATUS_TRUE, "Available", "");
        serving.observed_generation = Some(1);

        assert!(!catalog_with(vec![serving.clone()], Some(2)).is_serving());
        assert!(catalog_with(vec![serving], Some(1)).is_serving());
    }

    #[test]
    fn test_serialized_catalog_uses_api_field_names() {
        let catalog = ClusterCatalog::new(
            "operatorhubio",
            ClusterCatalogSpec {
                source: CatalogSource {
                    source_type: SOURCE_TYPE_IMAGE.to_string(),
                    image: Some(ImageSource {
                        reference: "quay.io/catalogs/hub:latest".to_string(),
                        poll_interval_minutes: Some(10),
                    }),
                },
                priority: 5,
                availability_mode: Some(AvailabilityMode::Available),
            },
        );

        let value = serde_json::to_value(&catalog).unwrap();
        assert_eq!(value["apiVersion"], "olm.operatorframework.io/v1");
        assert_eq!(value["kind"], "ClusterCatalog");
        assert_eq!(value["spec"]["source"]["type"], "Image");
        assert_eq!(value["spec"]["source"]["image"]["ref"], "quay.io/catalogs/hub:latest");
        assert_eq!(value["spec"]["source"]["image"]["pollIntervalMinutes"], 10);
        assert_eq!(value["spec"]["availabilityMode"], "Available");
    }
}
