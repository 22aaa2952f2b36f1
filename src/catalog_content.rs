//! Decoding of a catalog's declarative content stream.
//!
//! The stream is a sequence of concatenated JSON objects, each tagged with a
//! `schema`. Only the envelope fields needed for search and inspection are
//! read: package names, bundle versions, channel membership and provider.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use serde_json::Value;

use crate::Result;

pub const SCHEMA_PACKAGE: &str = "olm.package";
pub const SCHEMA_CHANNEL: &str = "olm.channel";
pub const SCHEMA_BUNDLE: &str = "olm.bundle";

const PROPERTY_PACKAGE: &str = "olm.package";
const PROPERTY_CSV_METADATA: &str = "olm.csv.metadata";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSummary {
    pub name: String,
    pub default_channel: Option<String>,
    pub provider: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleVersion {
    pub package: String,
    pub bundle: String,
    pub version: String,
    pub channels: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    package: Option<String>,
    #[serde(default)]
    default_channel: Option<String>,
    #[serde(default)]
    entries: Vec<ChannelEntry>,
    #[serde(default)]
    properties: Vec<Property>,
}

#[derive(Deserialize)]
struct ChannelEntry {
    name: String,
}

#[derive(Deserialize)]
struct Property {
    #[serde(rename = "type")]
    type_: String,
    #[serde(default)]
    value: Value,
}

/// Every decoded content object, in stream order.
#[derive(Debug, Clone, Default)]
pub struct CatalogContent {
    objects: Vec<Value>,
}

impl CatalogContent {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let objects = serde_json::Deserializer::from_slice(bytes)
            .into_iter::<Value>()
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { objects })
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Raw objects, optionally narrowed to one package and/or one schema.
    pub fn filter(&self, package: Option<&str>, schema: Option<&str>) -> Vec<&Value> {
        self.objects
            .iter()
            .filter(|obj| schema.map_or(true, |s| obj["schema"].as_str() == Some(s)))
            .filter(|obj| package.map_or(true, |p| package_of(obj) == Some(p)))
            .collect()
    }

    pub fn packages(&self) -> Vec<PackageSummary> {
        let mut providers: BTreeMap<String, String> = BTreeMap::new();
        for envelope in self.envelopes(SCHEMA_BUNDLE) {
            let (Some(package), Some(provider)) = (envelope.package.clone(), provider_of(&envelope)) else {
                continue;
            };
            providers.entry(package).or_insert(provider);
        }

        self.envelopes(SCHEMA_PACKAGE)
            .filter_map(|envelope| {
                let name = envelope.name?;
                Some(PackageSummary {
                    provider: providers.get(&name).cloned(),
                    default_channel: envelope.default_channel,
                    name,
                })
            })
            .collect()
    }

    /// Bundles with their versions and the channels that list them.
    pub fn bundle_versions(&self, package: Option<&str>) -> Vec<BundleVersion> {
        let mut membership: BTreeMap<(String, String), BTreeSet<String>> = BTreeMap::new();
        for envelope in self.envelopes(SCHEMA_CHANNEL) {
            let (Some(pkg), Some(channel)) = (envelope.package, envelope.name) else {
                continue;
            };
            for entry in envelope.entries {
                membership
                    .entry((pkg.clone(), entry.name))
                    .or_default()
                    .insert(channel.clone());
            }
        }

        self.envelopes(SCHEMA_BUNDLE)
            .filter(|e| package.map_or(true, |p| e.package.as_deref() == Some(p)))
            .filter_map(|envelope| {
                let bundle = envelope.name.clone()?;
                let pkg = envelope.package.clone()?;
                let version = envelope
                    .properties
                    .iter()
                    .find(|p| p.type_ == PROPERTY_PACKAGE)
                    .and_then(|p| p.value["version"].as_str())
                    .unwrap_or_default()
                    .to_string();
                let channels = membership
                    .get(&(pkg.clone(), bundle.clone()))
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default();
                Some(BundleVersion {
                    package: pkg,
                    bundle,
                    version,
                    channels,
                })
            })
            .collect()
    }

    fn envelopes<'a>(&'a self, schema: &'a str) -> impl Iterator<Item = Envelope> + 'a {
        self.objects
            .iter()
            .filter(move |obj| obj["schema"].as_str() == Some(schema))
            .filter_map(|obj| Envelope::deserialize(obj).ok())
    }
}

/// Packages name themselves; everything else points at its package.
fn package_of(obj: &Value) -> Option<&str> {
    if obj["schema"].as_str() == Some(SCHEMA_PACKAGE) {
        obj["name"].as_str()
    } else {
        obj["package"].as_str()
    }
}

fn provider_of(envelope: &Envelope) -> Option<String> {
    envelope
        .properties
        .iter()
        .find(|p| p.type_ == PROPERTY_CSV_METADATA)
        .and_then(|p| p.value["provider"]["name"].as_str())
        .map(str::to_string)
}
