//! SPDX 2.3 software bill of materials for the built image.
//!
//! Lists every package `apk` reports as installed in the root, each with a
//! `pkg:apk/alpine/<name>@<version>` package URL, all contained in a single
//! package describing the image.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::error::{BuildError, Result};
use crate::process::RootRunner;
use crate::rootfs::provision;

pub const SPDX_VERSION: &str = "SPDX-2.3";
pub const DATA_LICENSE: &str = "CC0-1.0";
const DOCUMENT_ID: &str = "SPDXRef-DOCUMENT";
const ROOTFS_ID: &str = "SPDXRef-rootfs";

/// A package as reported by `apk info -v`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
}

impl InstalledPackage {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    pub fn purl(&self) -> String {
        format!("pkg:apk/alpine/{}@{}", self.name, self.version)
    }
}

/// Split `name-version` at the last hyphen that is followed by a digit.
///
/// Lines without such a hyphen yield version `"unknown"`. The heuristic is
/// known to misparse: a version that does not start with a digit is not
/// recognised, and a bare name ending in `-<digit>` is split inside the name.
pub fn split_package_line(line: &str) -> (&str, &str) {
    let bytes = line.as_bytes();
    for i in (0..bytes.len()).rev() {
        if bytes[i] == b'-' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit) {
            return (&line[..i], &line[i + 1..]);
        }
    }
    (line, "unknown")
}

pub fn parse_package_line(line: &str) -> InstalledPackage {
    let (name, version) = split_package_line(line);
    InstalledPackage::new(name, version)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpdxDocument {
    pub spdx_version: String,
    pub data_license: String,
    #[serde(rename = "SPDXID")]
    pub spdx_id: String,
    pub name: String,
    pub document_namespace: String,
    pub creation_info: CreationInfo,
    pub packages: Vec<SpdxPackage>,
    pub relationships: Vec<Relationship>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreationInfo {
    pub created: String,
    pub creators: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpdxPackage {
    #[serde(rename = "SPDXID")]
    pub spdx_id: String,
    pub name: String,
    pub version_info: String,
    pub download_location: String,
    pub files_analyzed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub external_refs: Vec<ExternalRef>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalRef {
    pub reference_category: String,
    pub reference_type: String,
    pub reference_locator: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Relationship {
    #[serde(rename = "spdxElementId")]
    pub element: String,
    #[serde(rename = "relationshipType")]
    pub relationship_type: String,
    #[serde(rename = "relatedSpdxElement")]
    pub related: String,
}

impl Relationship {
    fn new(element: &str, relationship_type: &str, related: &str) -> Self {
        Self {
            element: element.to_string(),
            relationship_type: relationship_type.to_string(),
            related: related.to_string(),
        }
    }
}

impl SpdxDocument {
    /// Describe an image named `image` containing `packages`.
    pub fn new(image: &str, image_version: &str, packages: &[InstalledPackage], created: DateTime<Utc>) -> Self {
        let mut spdx_packages = vec![SpdxPackage {
            spdx_id: ROOTFS_ID.to_string(),
            name: image.to_string(),
            version_info: image_version.to_string(),
            download_location: "NOASSERTION".to_string(),
            files_analyzed: false,
            external_refs: Vec::new(),
        }];
        let mut relationships = vec![Relationship::new(DOCUMENT_ID, "DESCRIBES", ROOTFS_ID)];

        for (i, pkg) in packages.iter().enumerate() {
            let id = format!("SPDXRef-Package-{}", i);
            spdx_packages.push(SpdxPackage {
                spdx_id: id.clone(),
                name: pkg.name.clone(),
                version_info: pkg.version.clone(),
                download_location: "NOASSERTION".to_string(),
                files_analyzed: false,
                external_refs: vec![ExternalRef {
                    reference_category: "PACKAGE-MANAGER".to_string(),
                    reference_type: "purl".to_string(),
                    reference_locator: pkg.purl(),
                }],
            });
            relationships.push(Relationship::new(ROOTFS_ID, "CONTAINS", &id));
        }

        Self {
            spdx_version: SPDX_VERSION.to_string(),
            data_license: DATA_LICENSE.to_string(),
            spdx_id: DOCUMENT_ID.to_string(),
            name: format!("alpiso-{}", image),
            document_namespace: format!(
                "https://spdx.org/spdxdocs/alpiso-{}-{}",
                image,
                created.timestamp()
            ),
            creation_info: CreationInfo {
                created: created.to_rfc3339_opts(SecondsFormat::Secs, true),
                creators: vec![format!("Tool: alpiso-{}", env!("CARGO_PKG_VERSION"))],
            },
            packages: spdx_packages,
            relationships,
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| BuildError::Config(format!("serializing SBOM: {}", e)))?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// `<dir>/<stem>-sbom.spdx.json` next to the ISO.
pub fn sbom_path(iso: &Path) -> PathBuf {
    let stem = iso
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    iso.with_file_name(format!("{}-sbom.spdx.json", stem))
}

/// Query the root's installed packages and write the SBOM. Returns the
/// number of packages listed.
pub fn generate(
    runner: &dyn RootRunner,
    root: &Path,
    image: &str,
    image_version: &str,
    output: &Path,
) -> Result<usize> {
    println!("  Scanning installed packages...");
    let packages = provision::installed_packages(runner, root)?;
    let doc = SpdxDocument::new(image, image_version, &packages, Utc::now());
    doc.write(output)?;
    println!(
        "  SBOM written to {} ({} packages)",
        output.display(),
        packages.len()
    );
    Ok(packages.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_split_package_line() {
        assert_eq!(
            split_package_line("busybox-1.36.1-r1"),
            ("busybox", "1.36.1-r1")
        );
        assert_eq!(
            split_package_line("no-version-here"),
            ("no-version-here", "unknown")
        );
        assert_eq!(
            split_package_line("alpine-baselayout-data-3.4.3-r2"),
            ("alpine-baselayout-data", "3.4.3-r2")
        );
        assert_eq!(split_package_line(""), ("", "unknown"));
        assert_eq!(split_package_line("trailing-"), ("trailing-", "unknown"));
    }

    #[test]
    fn test_split_known_misparses_are_kept() {
        assert_eq!(split_package_line("foo-git-r0"), ("foo-git-r0", "unknown"));
        assert_eq!(split_package_line("libfoo-2"), ("libfoo", "2"));
    }

    #[test]
    fn test_purl() {
        let pkg = parse_package_line("musl-1.2.4-r2");
        assert_eq!(pkg.purl(), "pkg:apk/alpine/musl@1.2.4-r2");
    }

    #[test]
    fn test_document_shape() {
        let created = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let pkgs = vec![
            InstalledPackage::new("busybox", "1.36.1-r1"),
            InstalledPackage::new("musl", "1.2.4-r2"),
        ];
        let doc = SpdxDocument::new("demo", "1.0", &pkgs, created);
        let json: serde_json::Value = serde_json::to_value(&doc).unwrap();

        assert_eq!(json["spdxVersion"], "SPDX-2.3");
        assert_eq!(json["SPDXID"], "SPDXRef-DOCUMENT");
        assert_eq!(json["creationInfo"]["created"], "2024-01-02T03:04:05Z");
        assert_eq!(
            json["documentNamespace"],
            format!("https://spdx.org/spdxdocs/alpiso-demo-{}", created.timestamp())
        );
        assert_eq!(json["packages"].as_array().unwrap().len(), 3);
        assert_eq!(json["packages"][0].get("externalRefs"), None);
        assert_eq!(
            json["packages"][1]["externalRefs"][0]["referenceLocator"],
            "pkg:apk/alpine/busybox@1.36.1-r1"
        );
        let rels = json["relationships"].as_array().unwrap();
        assert_eq!(rels[0]["relationshipType"], "DESCRIBES");
        assert_eq!(rels[2]["spdxElementId"], "SPDXRef-rootfs");
        assert_eq!(rels[2]["relatedSpdxElement"], "SPDXRef-Package-1");
    }

    #[test]
    fn test_sbom_path() {
        assert_eq!(
            sbom_path(Path::new("out/demo.iso")),
            PathBuf::from("out/demo-sbom.spdx.json")
        );
        assert_eq!(
            sbom_path(Path::new("demo")),
            PathBuf::from("demo-sbom.spdx.json")
        );
    }
}
