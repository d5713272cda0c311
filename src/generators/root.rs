// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Root filesystem generator.

Resolves the configured package set (with the essential set, unless turned
off), unpacks it, applies overlays and packs the whole staged tree as a
tarball.
*/

use {
    crate::{
        builder::ImageBuilder,
        cache::Cache,
        config::ImageConfig,
        error::Result,
    },
    std::path::{Path, PathBuf},
};

/// Assembles root filesystem tarballs.
pub struct RootGenerator {
    builder: ImageBuilder,
}

impl RootGenerator {
    pub fn new(config: ImageConfig, cache: Cache) -> Result<Self> {
        Ok(Self {
            builder: ImageBuilder::new(config, cache),
        })
    }

    /// Builder access for cancellation and limit control.
    pub fn builder_mut(&mut self) -> &mut ImageBuilder {
        &mut self.builder
    }

    fn artifact_name(&self) -> String {
        let stem = self.builder.config().name.as_deref().unwrap_or("root");

        format!("{}{}", stem, self.builder.config().output_format.extension())
    }

    /// Create the root filesystem archive, returning the written path.
    pub async fn generate(&self, output_dir: &Path) -> Result<PathBuf> {
        let build_id = format!(
            "root-{}",
            self.builder.config().name.as_deref().unwrap_or("image")
        );

        let data = self.builder.build(&build_id).await?;

        super::write_artifact(output_dir, &self.artifact_name(), &data)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn artifact_name_follows_format() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path().join("cache")).unwrap();

        let config = ImageConfig::from_yaml("name: base\noutput_format: tar:xz\n")?;
        let generator = RootGenerator::new(config, cache.clone())?;
        assert_eq!(generator.artifact_name(), "base.tar.xz");

        let config = ImageConfig::from_yaml("{}")?;
        let generator = RootGenerator::new(config, cache)?;
        assert_eq!(generator.artifact_name(), "root.tar");

        Ok(())
    }
}
