// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Boot generator.

Installs the configured packages (the kernel package included) into a
scratch tree, then copies the result files matched by the configured
patterns (`boot/vmlinuz*`, `*.dtb`, ...) into the artifact tree and packs
it as a tar archive.
*/

use {
    crate::{
        builder::ImageBuilder,
        cache::Cache,
        compose::{ArchiveFormat, ComposeOptions, Composer, OutputFormat},
        config::ImageConfig,
        error::{BuildError, Result},
        staging::StagingTree,
    },
    std::{
        path::{Path, PathBuf},
        sync::Arc,
    },
};

/// Assembles boot payload archives.
pub struct BootGenerator {
    builder: ImageBuilder,
}

impl BootGenerator {
    pub fn new(mut config: ImageConfig, cache: Cache) -> Result<Self> {
        if let Some(kernel) = config.kernel.clone() {
            if !config.packages.contains(&kernel) {
                config.packages.push(kernel);
            }
        }

        Ok(Self {
            builder: ImageBuilder::new(config, cache),
        })
    }

    /// Builder access for cancellation and limit control.
    pub fn builder_mut(&mut self) -> &mut ImageBuilder {
        &mut self.builder
    }

    fn artifact_name(&self) -> String {
        match &self.builder.config().name {
            Some(name) => format!("{}.tar", name),
            None => "boot.tar".to_string(),
        }
    }

    /// Create the boot archive, returning the written path.
    pub async fn generate(&self, output_dir: &Path) -> Result<PathBuf> {
        let config = self.builder.config().clone();

        if config.files.is_empty() {
            return Err(BuildError::Config(
                "boot generator needs result file patterns in `files`".to_string(),
            ));
        }

        let build_id = format!("boot-{}", config.name.as_deref().unwrap_or("image"));

        let package_tree = Arc::new(StagingTree::new(
            self.builder.cache().staging_dir(&format!("{}-packages", build_id))?,
            self.builder.cache().clone(),
        )?);

        tracing::info!("installing boot packages");
        let install = self.builder.resolve().await?;
        self.builder
            .populate_staging(&install, &package_tree)
            .await?;

        self.builder.apply_overlays(&package_tree)?;

        // Lift the matched result files into a flat artifact tree.
        let artifact_tree = StagingTree::new(
            self.builder.cache().staging_dir(&format!("{}-artifact", build_id))?,
            self.builder.cache().clone(),
        )?;

        let copied = copy_result_files(&package_tree, &artifact_tree, &config.files)?;
        if copied == 0 {
            return Err(BuildError::Config(format!(
                "no staged files match the configured patterns {:?}",
                config.files
            )));
        }

        let format = OutputFormat {
            archive: ArchiveFormat::Tar,
            compression: config.output_format.compression,
        };

        let options = ComposeOptions {
            reproducible: config.reproducible,
            source_date_epoch: None,
        };

        let data = Composer::new(&artifact_tree).compose(format, &options)?;

        super::write_artifact(output_dir, &self.artifact_name(), &data)
    }
}

/// Copy staged entries matching any pattern into the artifact tree,
/// flattened to their file names (a boot partition has no hierarchy).
fn copy_result_files(
    source: &StagingTree,
    artifact: &StagingTree,
    patterns: &[String],
) -> Result<usize> {
    let patterns = patterns
        .iter()
        .map(|p| {
            glob::Pattern::new(p)
                .map_err(|e| BuildError::Config(format!("bad file pattern {}: {}", p, e)))
        })
        .collect::<Result<Vec<_>>>()?;

    let matching: Vec<_> = source.with_entries(|entries| {
        entries
            .values()
            .filter(|entry| {
                patterns.iter().any(|pattern| {
                    pattern.matches(&entry.path)
                        || entry
                            .path
                            .rsplit('/')
                            .next()
                            .map(|name| pattern.matches(name))
                            .unwrap_or(false)
                })
            })
            .filter(|entry| entry.kind == crate::staging::FileKind::Regular)
            .cloned()
            .collect()
    });

    let mut copied = 0;

    for entry in matching {
        let content = source.payload_of(&entry)?;

        let name = entry
            .path
            .rsplit('/')
            .next()
            .expect("paths are non-empty")
            .to_string();

        let mut flat = entry.clone();
        flat.path = name;

        tracing::debug!(source = %entry.path, "boot file selected");

        artifact.insert_and_materialize(flat, Some(&content))?;
        copied += 1;
    }

    Ok(copied)
}
