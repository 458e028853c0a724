//! LVM logical-volume images.
//!
//! Instance disks are logical volumes under a configured volume group,
//! exposed to the guest as raw block devices. Volume allocation goes through
//! `lvcreate`, which can fail transiently while the volume group is busy, so
//! allocation is retried with backoff; everything else is a single attempt.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::domain::Domain;
use crate::error::{Result, StorageError};
use crate::exec::{Executor, Retry};
use crate::image::types::{DeviceType, DiskFormat, ImageInfo, SourceType};

/// Attempts for one `lvcreate` allocation, including the first.
const LVCREATE_ATTEMPTS: u32 = 3;

/// Device path of a logical volume.
fn lv_path(volume_group: &str, lv_name: &str) -> PathBuf {
    Path::new("/dev").join(volume_group).join(lv_name)
}

/// Logical-volume name for an instance image: `<instance>[-name][-suffix]`.
fn lv_name(instance_id: &str, image_name: Option<&str>, suffix: Option<&str>) -> String {
    let mut name = instance_id.to_string();
    if let Some(image_name) = image_name {
        name.push('-');
        name.push_str(image_name);
    }
    if let Some(suffix) = suffix {
        name.push('-');
        name.push_str(suffix);
    }
    name
}

/// Probe an image's virtual size in bytes via `qemu-img info`.
///
/// Unexpected inspector output is a hard error, never a silent default: a
/// wrong size here would allocate a wrong-sized volume.
pub(crate) fn image_virtual_size(executor: &dyn Executor, path: &Path) -> Result<u64> {
    let path_s = path.to_string_lossy();
    let output = executor.execute(&["qemu-img", "info", path_s.as_ref()], true)?;
    parse_virtual_size(&output.stdout)
}

/// Parse the `virtual size: <human> (<N> bytes)` field of `qemu-img info`.
fn parse_virtual_size(stdout: &str) -> Result<u64> {
    for line in stdout.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim() != "virtual size" {
            continue;
        }
        let bytes = value
            .split_once('(')
            .map(|(_, rest)| rest)
            .and_then(|rest| rest.split_whitespace().next())
            .ok_or_else(|| StorageError::Parse {
                tool: "qemu-img",
                detail: format!("malformed virtual size field: {}", value.trim()),
            })?;
        return bytes.parse().map_err(|_| StorageError::Parse {
            tool: "qemu-img",
            detail: format!("non-numeric virtual size: {bytes}"),
        });
    }
    Err(StorageError::Parse {
        tool: "qemu-img",
        detail: "no virtual size field in info output".into(),
    })
}

/// Factory and metadata provider for LVM images.
pub struct LvmImageDriver {
    volume_group: String,
    executor: Arc<dyn Executor>,
    retry: Retry,
}

impl LvmImageDriver {
    /// Create a driver allocating volumes under the given volume group.
    pub fn new(volume_group: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        Self {
            volume_group: volume_group.into(),
            executor,
            retry: Retry::quadratic(LVCREATE_ATTEMPTS),
        }
    }

    /// Replace the allocation retry policy. Tests use this to avoid real
    /// sleeps.
    pub fn with_retry(mut self, retry: Retry) -> Self {
        self.retry = retry;
        self
    }

    /// Construct an LVM image following the volume naming convention.
    /// Touches no storage.
    pub fn create_image(
        &self,
        instance_id: &str,
        image_name: Option<&str>,
        suffix: Option<&str>,
    ) -> LvmImage {
        LvmImage::new(
            &self.volume_group,
            lv_name(instance_id, image_name, suffix),
            Arc::clone(&self.executor),
        )
        .with_retry(self.retry.clone())
    }

    /// Wrap every block-backed disk of the domain in an [`LvmImage`].
    ///
    /// The volume name is reconstructed from the device path's final
    /// component under this driver's volume group.
    pub fn list_images(&self, domain: &dyn Domain) -> Result<Vec<LvmImage>> {
        let paths: Vec<String> = domain
            .disk_sources()?
            .into_iter()
            .filter_map(|disk| disk.source)
            .collect();
        info!(disks = ?paths, "Disks used by domain");

        Ok(paths
            .iter()
            .map(|path| {
                let name = Path::new(path)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.clone());
                LvmImage::new(&self.volume_group, name, Arc::clone(&self.executor))
                    .with_retry(self.retry.clone())
            })
            .collect())
    }

    /// Attachment metadata for an image of this format.
    pub fn image_info(
        &self,
        instance_id: &str,
        image_name: Option<&str>,
        suffix: Option<&str>,
    ) -> ImageInfo {
        ImageInfo {
            device_type: DeviceType::Block,
            source_type: SourceType::Dev,
            driver_type: DiskFormat::Raw,
            disk: lv_path(&self.volume_group, &lv_name(instance_id, image_name, suffix)),
        }
    }
}

/// One logical-volume image.
pub struct LvmImage {
    volume_group: String,
    lv_name: String,
    path: PathBuf,
    executor: Arc<dyn Executor>,
    retry: Retry,
}

impl LvmImage {
    /// Wrap the logical volume `lv_name` under `volume_group`.
    pub fn new(
        volume_group: impl Into<String>,
        lv_name: impl Into<String>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let volume_group = volume_group.into();
        let lv_name = lv_name.into();
        let path = lv_path(&volume_group, &lv_name);
        Self {
            volume_group,
            lv_name,
            path,
            executor,
            retry: Retry::quadratic(LVCREATE_ATTEMPTS),
        }
    }

    /// Replace the allocation retry policy.
    pub fn with_retry(mut self, retry: Retry) -> Self {
        self.retry = retry;
        self
    }

    /// Device path of the volume; stable for the lifetime of the object.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the volume's device node exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Materialize the image: allocate a volume sized to `base`'s virtual
    /// size, then convert `base` into it as raw content.
    #[instrument(skip(self, base), fields(lv = %self.lv_name, base = %base.display()))]
    pub fn create_from_raw(&self, base: &Path) -> Result<()> {
        let size = image_virtual_size(self.executor.as_ref(), base)?;

        info!(size_bytes = size, "Creating logical volume");
        let size_arg = format!("{size}b");
        self.retry.run(|| {
            self.executor
                .execute(
                    &["lvcreate", "-L", &size_arg, "-n", &self.lv_name, &self.volume_group],
                    true,
                )
                .map(|_| ())
        })?;

        info!("Converting base image into volume");
        let base_s = base.to_string_lossy();
        let path_s = self.path.to_string_lossy();
        self.executor.execute(
            &["qemu-img", "convert", base_s.as_ref(), "-O", "raw", path_s.as_ref()],
            true,
        )?;
        Ok(())
    }

    /// Delete the logical volume.
    ///
    /// The existence check is idempotent: an absent (or unprobeable) volume
    /// is a successful no-op. An open/active mapping is torn down through
    /// device-mapper before the volume is force-removed; removal failures
    /// propagate once the retry attempts are exhausted.
    #[instrument(skip(self), fields(volume = %self.path.display()))]
    pub fn delete(&self) -> Result<()> {
        let path_s = self.path.to_string_lossy();
        info!("Deleting logical volume");

        if !self.volume_present() {
            return Ok(());
        }

        let output = self.executor.execute(
            &["lvdisplay", "--noheading", "-C", "-o", "Attr", path_s.as_ref()],
            true,
        )?;
        let attrs = output.stdout.trim();
        if attrs.contains('o') || attrs.contains('O') {
            debug!(attrs, "Removing active device-mapper mapping");
            self.executor
                .execute(&["dmsetup", "remove", path_s.as_ref()], false)?;
        }

        self.retry.run(|| {
            self.executor
                .execute(&["lvremove", "-f", path_s.as_ref()], true)
                .map(|_| ())
        })?;
        Ok(())
    }

    fn volume_present(&self) -> bool {
        let path_s = self.path.to_string_lossy();
        self.executor
            .execute(&["lvdisplay", path_s.as_ref()], true)
            .is_ok()
    }

    /// Build a (not yet created) copy-on-write snapshot of this volume.
    ///
    /// The snapshot size is sampled from the volume's current virtual size
    /// and stays fixed afterwards.
    pub fn make_snapshot<'d>(
        &self,
        domain: &'d dyn Domain,
        snapshot_name: &str,
        force_live: bool,
    ) -> Result<LvmSnapshot<'d>> {
        let size = image_virtual_size(self.executor.as_ref(), &self.path)?;
        Ok(LvmSnapshot {
            domain,
            name: snapshot_name.to_string(),
            snapshot_path: lv_path(&self.volume_group, snapshot_name),
            size_bytes: size,
            source_path: self.path.clone(),
            force_live,
            executor: Arc::clone(&self.executor),
        })
    }
}

/// Copy-on-write logical-volume snapshot.
pub struct LvmSnapshot<'d> {
    domain: &'d dyn Domain,
    name: String,
    snapshot_path: PathBuf,
    size_bytes: u64,
    source_path: PathBuf,
    force_live: bool,
    executor: Arc<dyn Executor>,
}

impl LvmSnapshot<'_> {
    /// Snapshot name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot size in bytes, fixed at construction time.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Allocate the snapshot volume.
    ///
    /// Refuses to snapshot a running domain unless `force_live` was set;
    /// allocation is a single attempt, no retry.
    #[instrument(skip(self), fields(snapshot = %self.name))]
    pub fn create(&mut self) -> Result<()> {
        if !self.force_live && self.domain.is_active()? {
            return Err(StorageError::Precondition(
                "domain must be suspended before an LVM snapshot".into(),
            ));
        }

        info!(
            source = %self.source_path.display(),
            size_bytes = self.size_bytes,
            "Creating snapshot volume"
        );
        let size_arg = format!("-L{}b", self.size_bytes);
        let source_s = self.source_path.to_string_lossy();
        self.executor.execute(
            &["lvcreate", &size_arg, "-s", "-n", &self.name, source_s.as_ref()],
            true,
        )?;
        Ok(())
    }

    /// Block-copy the snapshot device to `destination`.
    ///
    /// The snapshot is already a raw block device, so no format conversion
    /// is involved.
    pub fn convert_to_raw(&self, destination: &Path) -> Result<()> {
        let if_arg = format!("if={}", self.snapshot_path.display());
        let of_arg = format!("of={}", destination.display());
        info!(
            snapshot = %self.snapshot_path.display(),
            destination = %destination.display(),
            "Copying snapshot volume"
        );
        self.executor
            .execute(&["dd", &if_arg, &of_arg, "bs=1M"], true)?;
        Ok(())
    }

    /// Force-remove the snapshot volume; single attempt, failures propagate.
    pub fn delete(&mut self) -> Result<()> {
        let path_s = self.snapshot_path.to_string_lossy();
        self.executor
            .execute(&["lvremove", "-f", path_s.as_ref()], true)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ExecError;
    use crate::mock::{MockDomain, MockExecutor};
    use std::sync::Mutex;
    use std::time::Duration;

    const QEMU_IMG_INFO: &str = "image: /base/ubuntu.raw\n\
         file format: raw\n\
         virtual size: 100M (104857600 bytes)\n\
         disk size: 96M\n";

    fn fast_retry() -> Retry {
        Retry::quadratic(LVCREATE_ATTEMPTS).with_sleeper(Arc::new(|_| {}))
    }

    fn recording_retry() -> (Arc<Mutex<Vec<Duration>>>, Retry) {
        let slept: Arc<Mutex<Vec<Duration>>> = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&slept);
        let retry = Retry::quadratic(LVCREATE_ATTEMPTS).with_sleeper(Arc::new(move |delay| {
            recorder.lock().unwrap().push(delay);
        }));
        (slept, retry)
    }

    fn driver(executor: &Arc<MockExecutor>) -> LvmImageDriver {
        LvmImageDriver::new("vg0", Arc::clone(executor) as Arc<dyn Executor>).with_retry(fast_retry())
    }

    #[test]
    fn test_lv_name_concatenation() {
        assert_eq!(lv_name("instance-0003", None, None), "instance-0003");
        assert_eq!(
            lv_name("instance-0003", Some("disk"), None),
            "instance-0003-disk"
        );
        assert_eq!(
            lv_name("instance-0003", Some("disk"), Some("local")),
            "instance-0003-disk-local"
        );
    }

    #[test]
    fn test_create_image_matches_image_info() {
        let executor = Arc::new(MockExecutor::new());
        let driver = driver(&executor);
        let image = driver.create_image("instance-0003", Some("disk"), None);
        let info = driver.image_info("instance-0003", Some("disk"), None);
        assert_eq!(image.path(), info.disk.as_path());
        assert_eq!(image.path(), Path::new("/dev/vg0/instance-0003-disk"));
        assert_eq!(info.device_type, DeviceType::Block);
        assert_eq!(info.source_type, SourceType::Dev);
        assert_eq!(info.driver_type, DiskFormat::Raw);
    }

    #[test]
    fn test_parse_virtual_size_exact_bytes() {
        assert_eq!(parse_virtual_size(QEMU_IMG_INFO).unwrap(), 104857600);
    }

    #[test]
    fn test_parse_virtual_size_rejects_malformed_output() {
        let err = parse_virtual_size("virtual size: 100M\n").unwrap_err();
        assert!(matches!(err, StorageError::Parse { .. }));

        let err = parse_virtual_size("file format: raw\n").unwrap_err();
        assert!(matches!(err, StorageError::Parse { .. }));
    }

    #[test]
    fn test_create_from_raw_allocates_then_converts() {
        let executor = Arc::new(MockExecutor::new());
        executor.push_success(QEMU_IMG_INFO);

        let image = driver(&executor).create_image("instance-0003", Some("disk"), None);
        image.create_from_raw(Path::new("/base/ubuntu.raw")).unwrap();

        assert_eq!(
            executor.commands(),
            vec![
                "qemu-img info /base/ubuntu.raw",
                "lvcreate -L 104857600b -n instance-0003-disk vg0",
                "qemu-img convert /base/ubuntu.raw -O raw /dev/vg0/instance-0003-disk",
            ]
        );
        assert!(executor.calls().iter().all(|call| call.run_as_root));
    }

    #[test]
    fn test_allocation_retries_then_succeeds() {
        let executor = Arc::new(MockExecutor::new());
        executor.push_success(QEMU_IMG_INFO);
        executor.push_failure(5, "vg busy");
        executor.push_failure(5, "vg busy");
        // Third lvcreate attempt and the convert succeed.

        let (slept, retry) = recording_retry();
        let image = LvmImage::new(
            "vg0",
            "instance-0003-disk",
            Arc::clone(&executor) as Arc<dyn Executor>,
        )
        .with_retry(retry);

        image.create_from_raw(Path::new("/base/ubuntu.raw")).unwrap();

        // info + three lvcreate attempts + convert
        assert_eq!(executor.call_count(), 5);
        let slept = slept.lock().unwrap();
        assert_eq!(*slept, vec![Duration::from_secs(1), Duration::from_secs(4)]);
    }

    #[test]
    fn test_allocation_surfaces_third_failure() {
        let executor = Arc::new(MockExecutor::new());
        executor.push_success(QEMU_IMG_INFO);
        executor.push_failure(5, "failure 1");
        executor.push_failure(5, "failure 2");
        executor.push_failure(5, "failure 3");

        let image = LvmImage::new(
            "vg0",
            "instance-0003-disk",
            Arc::clone(&executor) as Arc<dyn Executor>,
        )
        .with_retry(fast_retry());

        let err = image
            .create_from_raw(Path::new("/base/ubuntu.raw"))
            .unwrap_err();
        match err {
            StorageError::Exec(ExecError::Failed { stderr, .. }) => {
                assert_eq!(stderr, "failure 3")
            }
            other => panic!("expected Exec failure, got {other:?}"),
        }
        // info + three lvcreate attempts, no convert
        assert_eq!(executor.call_count(), 4);
    }

    #[test]
    fn test_delete_is_noop_when_probe_fails() {
        let executor = Arc::new(MockExecutor::new());
        executor.push_failure(5, "not found");

        let image = driver(&executor).create_image("instance-0003", Some("disk"), None);
        image.delete().unwrap();

        assert_eq!(executor.commands(), vec!["lvdisplay /dev/vg0/instance-0003-disk"]);
    }

    #[test]
    fn test_delete_tears_down_open_mapping() {
        let executor = Arc::new(MockExecutor::new());
        executor.push_success(""); // presence probe
        executor.push_success("  owi-aos---\n"); // attr probe: open
        // dmsetup + lvremove succeed.

        let image = driver(&executor).create_image("instance-0003", Some("disk"), None);
        image.delete().unwrap();

        assert_eq!(
            executor.commands(),
            vec![
                "lvdisplay /dev/vg0/instance-0003-disk",
                "lvdisplay --noheading -C -o Attr /dev/vg0/instance-0003-disk",
                "dmsetup remove /dev/vg0/instance-0003-disk",
                "lvremove -f /dev/vg0/instance-0003-disk",
            ]
        );
    }

    #[test]
    fn test_delete_skips_dmsetup_for_inactive_volume() {
        let executor = Arc::new(MockExecutor::new());
        executor.push_success(""); // presence probe
        executor.push_success("  -wi-a-----\n"); // attr probe: not open

        let image = driver(&executor).create_image("instance-0003", Some("disk"), None);
        image.delete().unwrap();

        let commands = executor.commands();
        assert!(!commands.iter().any(|c| c.starts_with("dmsetup")));
        assert_eq!(commands.last().unwrap(), "lvremove -f /dev/vg0/instance-0003-disk");
    }

    #[test]
    fn test_snapshot_size_sampled_at_construction() {
        let executor = Arc::new(MockExecutor::new());
        executor.push_success(QEMU_IMG_INFO);

        let domain = MockDomain::new();
        let image = driver(&executor).create_image("instance-0003", Some("disk"), None);
        let snapshot = image.make_snapshot(&domain, "backup", false).unwrap();
        assert_eq!(snapshot.size_bytes(), 104857600);
    }

    #[test]
    fn test_snapshot_refuses_active_domain_without_force() {
        let executor = Arc::new(MockExecutor::new());
        executor.push_success(QEMU_IMG_INFO);

        let domain = MockDomain::new().with_active(true);
        let image = driver(&executor).create_image("instance-0003", Some("disk"), None);
        let mut snapshot = image.make_snapshot(&domain, "backup", false).unwrap();

        let probe_calls = executor.call_count();
        let err = snapshot.create().unwrap_err();
        assert!(matches!(err, StorageError::Precondition(_)));
        // The allocation tool was never invoked.
        assert_eq!(executor.call_count(), probe_calls);
    }

    #[test]
    fn test_snapshot_force_live_proceeds_on_active_domain() {
        let executor = Arc::new(MockExecutor::new());
        executor.push_success(QEMU_IMG_INFO);

        let domain = MockDomain::new().with_active(true);
        let image = driver(&executor).create_image("instance-0003", Some("disk"), None);
        let mut snapshot = image.make_snapshot(&domain, "backup", true).unwrap();
        snapshot.create().unwrap();

        assert_eq!(
            executor.commands().last().unwrap(),
            "lvcreate -L104857600b -s -n backup /dev/vg0/instance-0003-disk"
        );
    }

    #[test]
    fn test_snapshot_convert_is_block_copy() {
        let executor = Arc::new(MockExecutor::new());
        executor.push_success(QEMU_IMG_INFO);

        let domain = MockDomain::new();
        let image = driver(&executor).create_image("instance-0003", Some("disk"), None);
        let mut snapshot = image.make_snapshot(&domain, "backup", false).unwrap();
        snapshot.create().unwrap();
        snapshot.convert_to_raw(Path::new("/tmp/backup.img")).unwrap();
        snapshot.delete().unwrap();

        let commands = executor.commands();
        assert_eq!(
            commands[commands.len() - 2],
            "dd if=/dev/vg0/backup of=/tmp/backup.img bs=1M"
        );
        assert_eq!(commands.last().unwrap(), "lvremove -f /dev/vg0/backup");
    }

    #[test]
    fn test_list_images_reconstructs_volume_names() {
        let executor = Arc::new(MockExecutor::new());
        let driver = driver(&executor);
        let domain = MockDomain::new().with_disk_sources(vec![
            crate::domain::DiskSource::empty(),
            crate::domain::DiskSource::backed_by("/dev/vg0/i1"),
        ]);

        let images = driver.list_images(&domain).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].path(), Path::new("/dev/vg0/i1"));
    }
}
