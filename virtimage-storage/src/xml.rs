//! Libvirt domain XML helpers.
//!
//! Parsing is limited to the `<devices>/<disk>/<source>` slice of a domain
//! description; generation is limited to the minimal `<domainsnapshot>`
//! fragment used when creating snapshots.

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::domain::DiskSource;
use crate::error::{Result, StorageError};

/// Build the minimal snapshot request fragment for a named snapshot.
pub fn snapshot_xml(name: &str) -> String {
    format!(
        "<domainsnapshot>\n  <name>{}</name>\n</domainsnapshot>\n",
        escape(name)
    )
}

/// Extract the snapshot name from a `<domainsnapshot>` fragment.
pub fn snapshot_name(xml: &str) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    let mut in_name = false;

    loop {
        match reader.read_event() {
            Err(e) => {
                return Err(StorageError::Parse {
                    tool: "domainsnapshot XML",
                    detail: e.to_string(),
                })
            }
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => {
                if e.name().as_ref() == b"name" {
                    in_name = true;
                }
            }
            Ok(Event::Text(text)) if in_name => {
                let name = text.unescape().map_err(|e| StorageError::Parse {
                    tool: "domainsnapshot XML",
                    detail: e.to_string(),
                })?;
                return Ok(name.into_owned());
            }
            Ok(Event::End(e)) => {
                if e.name().as_ref() == b"name" {
                    in_name = false;
                }
            }
            Ok(_) => {}
        }
    }

    Err(StorageError::Parse {
        tool: "domainsnapshot XML",
        detail: "no <name> element in snapshot fragment".into(),
    })
}

/// Parse the disk devices of a libvirt domain description.
///
/// Returns one entry per `<disk>` element, in document order. The entry's
/// source is the `file` or `dev` attribute of the disk's own `<source>`
/// element; disks without a source (or with a bare `<source/>`) yield `None`.
/// Sources of nested elements such as `<backingStore>` are ignored.
pub fn parse_disk_sources(xml: &str) -> Result<Vec<DiskSource>> {
    let mut reader = Reader::from_str(xml);
    let mut sources = Vec::new();

    let mut in_disk = false;
    let mut depth = 0usize;
    let mut current: Option<String> = None;

    loop {
        match reader.read_event() {
            Err(e) => {
                return Err(StorageError::Parse {
                    tool: "domain XML",
                    detail: e.to_string(),
                })
            }
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) if in_disk => {
                if depth == 0 && e.name().as_ref() == b"source" && current.is_none() {
                    current = source_attr(&e)?;
                }
                depth += 1;
            }
            Ok(Event::Start(e)) => {
                if e.name().as_ref() == b"disk" {
                    in_disk = true;
                    depth = 0;
                    current = None;
                }
            }
            Ok(Event::Empty(e)) if in_disk => {
                if depth == 0 && e.name().as_ref() == b"source" && current.is_none() {
                    current = source_attr(&e)?;
                }
            }
            Ok(Event::End(e)) if in_disk => {
                if depth == 0 {
                    if e.name().as_ref() == b"disk" {
                        sources.push(DiskSource {
                            source: current.take(),
                        });
                        in_disk = false;
                    }
                } else {
                    depth -= 1;
                }
            }
            Ok(_) => {}
        }
    }

    Ok(sources)
}

/// Read the `file` or `dev` attribute of a `<source>` element.
fn source_attr(element: &quick_xml::events::BytesStart<'_>) -> Result<Option<String>> {
    for attr in element.attributes() {
        let attr = attr.map_err(|e| StorageError::Parse {
            tool: "domain XML",
            detail: e.to_string(),
        })?;
        if matches!(attr.key.as_ref(), b"file" | b"dev") {
            return Ok(Some(String::from_utf8_lossy(&attr.value).into_owned()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN_XML: &str = r#"
<domain type='kvm'>
  <name>instance-0001</name>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/var/lib/virtimage/instances/instance-0001/disk'/>
      <backingStore type='file'>
        <source file='/var/lib/virtimage/base/ubuntu.img'/>
      </backingStore>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='block' device='disk'>
      <source dev='/dev/vg0/instance-0001-disk.local'/>
      <target dev='vdb' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <target dev='hdc' bus='ide'/>
    </disk>
  </devices>
</domain>
"#;

    #[test]
    fn test_parse_disk_sources() {
        let sources = parse_disk_sources(DOMAIN_XML).unwrap();
        assert_eq!(sources.len(), 3);
        assert_eq!(
            sources[0],
            DiskSource::backed_by("/var/lib/virtimage/instances/instance-0001/disk")
        );
        assert_eq!(
            sources[1],
            DiskSource::backed_by("/dev/vg0/instance-0001-disk.local")
        );
        assert_eq!(sources[2], DiskSource::empty());
    }

    #[test]
    fn test_parse_ignores_backing_store_source() {
        let sources = parse_disk_sources(DOMAIN_XML).unwrap();
        assert!(sources
            .iter()
            .all(|s| s.source.as_deref() != Some("/var/lib/virtimage/base/ubuntu.img")));
    }

    #[test]
    fn test_snapshot_xml_round_trip() {
        let xml = snapshot_xml("backup-2024-05");
        assert!(xml.contains("<name>backup-2024-05</name>"));
        assert_eq!(snapshot_name(&xml).unwrap(), "backup-2024-05");
    }

    #[test]
    fn test_snapshot_xml_escapes_name() {
        let xml = snapshot_xml("a<b&c");
        assert!(xml.contains("<name>a&lt;b&amp;c</name>"));
        assert_eq!(snapshot_name(&xml).unwrap(), "a<b&c");
    }

    #[test]
    fn test_snapshot_name_missing() {
        assert!(snapshot_name("<domainsnapshot/>").is_err());
    }
}
