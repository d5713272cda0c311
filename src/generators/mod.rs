// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Image artifact generators.

Thin wiring over the core: each generator turns a declarative configuration
into a sequence of "install these packages, overlay these host files, run
these steps, pack as X" calls.

* [boot::BootGenerator] collects boot payloads (kernel images, device
  trees) out of installed packages into a `boot.tar`.
* [initrd::InitrdGenerator] assembles an initial RAM filesystem with
  busybox, kernel modules, device nodes and an `/init` script, packed as
  cpio.
* [root::RootGenerator] packs a resolved package set into a root
  filesystem tarball.
*/

pub mod boot;
pub mod initrd;
pub mod root;

use {
    crate::error::Result,
    std::path::{Path, PathBuf},
};

/// Write artifact bytes into the output directory.
pub(crate) fn write_artifact(output_dir: &Path, name: &str, data: &[u8]) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir)?;

    let path = output_dir.join(name);
    std::fs::write(&path, data)?;

    tracing::info!(path = %path.display(), bytes = data.len(), "artifact written");

    Ok(path)
}
