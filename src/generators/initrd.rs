// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Initrd generator.

Assembles an initial RAM filesystem: a conventional directory skeleton with
merged-usr symlinks, busybox, the configured packages, a subset of kernel
modules lifted out of the kernel package, device nodes, host-file overlays
and a rendered `/init`, packed as a cpio (newc) archive.
*/

use {
    crate::{
        builder::ImageBuilder,
        cache::Cache,
        compose::{ArchiveFormat, ComposeOptions, Composer, OutputFormat},
        config::{DeviceKind, DeviceNode, ImageConfig},
        error::{BuildError, Result},
        staging::{FileEntry, FileKind, Payload, StagingTree, OVERLAY_ORIGIN},
    },
    std::{
        collections::{BTreeSet, HashMap, HashSet},
        path::{Path, PathBuf},
        sync::Arc,
    },
};

/// Directories every initrd carries, mode 0755.
const SKELETON_DIRS: &[&str] = &[
    "proc", "sys", "dev", "sysroot", "var", "tmp", "run", "root", "etc", "usr", "usr/bin",
    "usr/sbin", "usr/lib",
];

/// Merged-usr compatibility symlinks.
const USR_SYMLINKS: &[(&str, &str)] = &[("bin", "usr/bin"), ("sbin", "usr/sbin"), ("lib", "usr/lib")];

/// Fallback busybox package when the configuration names none.
const DEFAULT_BUSYBOX: &str = "busybox-static";

/// Default `/init` template. `{{ root }}` and `{{ modules }}` are
/// substituted.
const INIT_TEMPLATE: &str = r#"#!/bin/sh
mount -t proc proc /proc
mount -t sysfs sys /sys
mount -t devtmpfs dev /dev || true

for mod in {{ modules }}; do
    modprobe "$mod"
done

root="{{ root }}"
if [ -n "$root" ]; then
    mount "$root" /sysroot
    exec switch_root /sysroot /sbin/init
fi

exec /bin/sh
"#;

/// Index over a kernel package's `modules.dep` / `modules.builtin`.
struct ModuleIndex {
    /// Module name to (path, dependency paths), paths relative to the
    /// `lib/modules/<version>` directory.
    modules: HashMap<String, (String, Vec<String>)>,
    builtin: HashSet<String>,
}

/// Module name of a module path: the file stem up to the first dot.
fn module_name(path: &str) -> String {
    let file = path.rsplit('/').next().unwrap_or(path);

    file.split('.').next().unwrap_or(file).to_string()
}

impl ModuleIndex {
    fn parse(dep_content: &str, builtin_content: Option<&str>) -> Self {
        let mut modules = HashMap::new();

        for line in dep_content.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }

            let (path, deps) = match line.split_once(':') {
                Some(parts) => parts,
                None => continue,
            };

            modules.insert(
                module_name(path),
                (
                    path.to_string(),
                    deps.split_whitespace().map(|s| s.to_string()).collect(),
                ),
            );
        }

        let builtin = builtin_content
            .map(|content| {
                content
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(module_name)
                    .collect()
            })
            .unwrap_or_default();

        Self { modules, builtin }
    }

    fn is_builtin(&self, name: &str) -> bool {
        self.builtin.contains(name)
    }

    /// Paths of a module and everything it depends on.
    fn closure(&self, name: &str) -> Option<BTreeSet<String>> {
        let (path, deps) = self.modules.get(name)?;

        let mut paths = BTreeSet::new();
        let mut queue: Vec<String> = vec![path.clone()];
        queue.extend(deps.iter().cloned());

        while let Some(path) = queue.pop() {
            if !paths.insert(path.clone()) {
                continue;
            }

            if let Some((_, deps)) = self.modules.get(&module_name(&path)) {
                queue.extend(deps.iter().cloned());
            }
        }

        Some(paths)
    }

    /// The `modules.dep` line for one module.
    fn dep_line(&self, name: &str) -> Option<String> {
        let (path, deps) = self.modules.get(name)?;

        Some(format!("{}: {}", path, deps.join(" ")))
    }
}

/// Assembles initrd images.
pub struct InitrdGenerator {
    builder: ImageBuilder,
}

impl InitrdGenerator {
    pub fn new(mut config: ImageConfig, cache: Cache) -> Result<Self> {
        let busybox = config.busybox.clone().unwrap_or_else(|| {
            tracing::debug!("no busybox configured; defaulting to {}", DEFAULT_BUSYBOX);
            DEFAULT_BUSYBOX.to_string()
        });

        if !config.packages.contains(&busybox) {
            config.packages.push(busybox);
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
            Some(name) => format!("{}.img", name),
            None => "initrd.img".to_string(),
        }
    }

    /// Create the initrd image, returning the written path.
    pub async fn generate(&self, output_dir: &Path) -> Result<PathBuf> {
        let config = self.builder.config().clone();

        let staging = Arc::new(StagingTree::new(
            self.builder.cache().staging_dir(&format!(
                "initrd-{}",
                config.name.as_deref().unwrap_or("image")
            ))?,
            self.builder.cache().clone(),
        )?);

        seed_skeleton(&staging)?;

        tracing::info!("installing packages into initrd");
        let install = self.builder.resolve().await?;
        self.builder.populate_staging(&install, &staging).await?;

        self.check_busybox(&staging)?;

        let module_names = if config.modules.is_empty() {
            tracing::info!("no modules configured");
            vec![]
        } else {
            self.install_modules(&config, &staging).await?
        };

        add_device_nodes(&staging, &config.devices)?;

        self.builder.apply_overlays(&staging)?;

        self.write_init(&config, &staging, &module_names)?;

        let format = OutputFormat {
            archive: ArchiveFormat::Cpio,
            compression: config.output_format.compression,
        };

        let options = ComposeOptions {
            reproducible: config.reproducible,
            source_date_epoch: None,
        };

        let data = Composer::new(&staging).compose(format, &options)?;

        super::write_artifact(output_dir, &self.artifact_name(), &data)
    }

    /// The initrd is useless without a shell provider.
    fn check_busybox(&self, staging: &StagingTree) -> Result<()> {
        for path in ["bin/busybox", "usr/bin/busybox"] {
            if staging.entry(path).is_some() {
                return Ok(());
            }
        }

        Err(BuildError::Config(
            "busybox binary missing from installed packages".to_string(),
        ))
    }

    /// Stage the kernel package separately and lift the requested modules
    /// (plus dependencies) into the initrd.
    ///
    /// Returns the module names `/init` should load.
    async fn install_modules(
        &self,
        config: &ImageConfig,
        staging: &Arc<StagingTree>,
    ) -> Result<Vec<String>> {
        let kernel = config.kernel.clone().ok_or_else(|| {
            BuildError::Config("modules configured but no kernel package set".to_string())
        })?;

        tracing::info!(kernel = %kernel, "staging kernel package for modules");

        let kernel_builder = self.builder.with_packages(vec![kernel]);
        let kernel_staging = Arc::new(StagingTree::new(
            self.builder.cache().staging_dir(&format!(
                "initrd-{}-kernel",
                config.name.as_deref().unwrap_or("image")
            ))?,
            self.builder.cache().clone(),
        )?);

        let install = kernel_builder.resolve().await?;
        kernel_builder
            .populate_staging(&install, &kernel_staging)
            .await?;

        let version = self.kernel_version(config, &kernel_staging)?;
        tracing::info!(version = %version, "using kernel version");

        let mods_base = format!("lib/modules/{}", version);

        let read_file = |path: &str| -> Result<Option<String>> {
            match kernel_staging.entry(path) {
                Some(entry) => Ok(Some(
                    String::from_utf8_lossy(&kernel_staging.payload_of(&entry)?).to_string(),
                )),
                None => Ok(None),
            }
        };

        let dep_content = read_file(&format!("{}/modules.dep", mods_base))?.ok_or_else(|| {
            BuildError::Config(format!("kernel package carries no {}/modules.dep", mods_base))
        })?;
        let builtin_content = read_file(&format!("{}/modules.builtin", mods_base))?;

        let index = ModuleIndex::parse(&dep_content, builtin_content.as_deref());

        let mut loadable = vec![];
        let mut wanted_paths = BTreeSet::new();
        let mut dep_lines = vec![];

        for name in &config.modules {
            // Filename syntax is accepted but the plain name is canonical.
            let name = module_name(name);

            if index.is_builtin(&name) {
                tracing::info!(module = %name, "module is built into the kernel");
                continue;
            }

            let closure = index.closure(&name).ok_or_else(|| {
                BuildError::Config(format!("module {} not found in kernel package", name))
            })?;

            wanted_paths.extend(closure);

            if let Some(line) = index.dep_line(&name) {
                dep_lines.push(line);
            }

            loadable.push(name);
        }

        for path in &wanted_paths {
            let source = format!("{}/{}", mods_base, path);

            let entry = kernel_staging.entry(&source).ok_or_else(|| {
                BuildError::Config(format!("module file {} missing from kernel package", source))
            })?;

            let content = kernel_staging.payload_of(&entry)?;
            let blob = staging.store_payload(&content)?;

            staging.insert_and_materialize(
                FileEntry {
                    path: source.clone(),
                    kind: FileKind::Regular,
                    mode: 0o644,
                    uid: 0,
                    gid: 0,
                    mtime: entry.mtime,
                    size: content.len() as u64,
                    payload: Payload::Blob(blob),
                    origin: entry.origin.clone(),
                },
                Some(&content),
            )?;
        }

        if !dep_lines.is_empty() {
            let content = format!("{}\n", dep_lines.join("\n"));

            insert_overlay_file(
                staging,
                &format!("{}/modules.dep", mods_base),
                content.as_bytes(),
                0o644,
            )?;
        }

        Ok(loadable)
    }

    fn kernel_version(&self, config: &ImageConfig, kernel_staging: &StagingTree) -> Result<String> {
        if let Some(version) = &config.kernel_version {
            return Ok(version.clone());
        }

        // Newest directory under lib/modules wins, as sorted by name.
        let version = kernel_staging.with_entries(|entries| {
            entries
                .keys()
                .filter_map(|path| path.strip_prefix("lib/modules/"))
                .filter_map(|rest| rest.split('/').next())
                .map(|v| v.to_string())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .last()
        });

        version.ok_or_else(|| {
            BuildError::Config("kernel version not found in kernel package".to_string())
        })
    }

    fn write_init(
        &self,
        config: &ImageConfig,
        staging: &StagingTree,
        modules: &[String],
    ) -> Result<()> {
        let template = match &config.template {
            Some(path) => std::fs::read_to_string(path)?,
            None => INIT_TEMPLATE.to_string(),
        };

        let content = template
            .replace("{{ root }}", config.root_device.as_deref().unwrap_or(""))
            .replace("{{ modules }}", &modules.join(" "));

        insert_overlay_file(staging, "init", content.as_bytes(), 0o755)
    }
}

fn insert_overlay_file(staging: &StagingTree, path: &str, content: &[u8], mode: u32) -> Result<()> {
    let blob = staging.store_payload(content)?;

    staging.insert_and_materialize(
        FileEntry {
            path: path.to_string(),
            kind: FileKind::Regular,
            mode,
            uid: 0,
            gid: 0,
            mtime: 0,
            size: content.len() as u64,
            payload: Payload::Blob(blob),
            origin: OVERLAY_ORIGIN.to_string(),
        },
        Some(content),
    )
}

/// Record the canonical directory skeleton and merged-usr symlinks.
pub fn seed_skeleton(staging: &StagingTree) -> Result<()> {
    for dir in SKELETON_DIRS {
        staging.insert_and_materialize(
            FileEntry {
                path: dir.to_string(),
                kind: FileKind::Directory,
                mode: 0o755,
                uid: 0,
                gid: 0,
                mtime: 0,
                size: 0,
                payload: Payload::None,
                origin: OVERLAY_ORIGIN.to_string(),
            },
            None,
        )?;
    }

    for (link, target) in USR_SYMLINKS {
        staging.insert_and_materialize(
            FileEntry {
                path: link.to_string(),
                kind: FileKind::Symlink,
                mode: 0o777,
                uid: 0,
                gid: 0,
                mtime: 0,
                size: 0,
                payload: Payload::Symlink(target.to_string()),
                origin: OVERLAY_ORIGIN.to_string(),
            },
            None,
        )?;
    }

    Ok(())
}

/// Record configured device nodes under `/dev`.
pub fn add_device_nodes(staging: &StagingTree, devices: &[DeviceNode]) -> Result<()> {
    for device in devices {
        let kind = match device.kind {
            DeviceKind::Char => FileKind::CharDevice,
            DeviceKind::Block => FileKind::BlockDevice,
        };

        staging.insert_and_materialize(
            FileEntry {
                path: format!("dev/{}", device.name),
                kind,
                mode: device.mode_bits()?,
                uid: device.uid.unwrap_or(0),
                gid: device.gid.unwrap_or(0),
                mtime: 0,
                size: 0,
                payload: Payload::Device {
                    major: device.major,
                    minor: device.minor,
                },
                origin: OVERLAY_ORIGIN.to_string(),
            },
            None,
        )?;
    }

    Ok(())
}
